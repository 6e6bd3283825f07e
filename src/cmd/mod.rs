//! CLI command implementations.
//!
//! | Module       | Commands handled                     |
//! |--------------|--------------------------------------|
//! | `project`    | `Init`                               |
//! | `run`        | `Run`                                |
//! | `milestones` | `List`, `Status`, `Reset`, `Cleanup` |
//! | `config`     | `Config`                             |

pub mod config;
pub mod milestones;
pub mod project;
pub mod run;

pub use config::cmd_config;
pub use milestones::{cmd_cleanup, cmd_list, cmd_reset, cmd_status};
pub use project::cmd_init;
pub use run::{RunArgs, cmd_run};
