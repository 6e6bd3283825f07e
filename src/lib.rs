pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod executor;
pub mod init;
pub mod logging;
pub mod merge;
pub mod milestone;
pub mod monitor;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod retry;
pub mod review;
pub mod scheduler;
pub mod settings;
pub mod ui;
pub mod util;
pub mod workspace;

#[cfg(test)]
pub(crate) mod test_support;
