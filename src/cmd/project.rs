//! Project initialization — `stageforge init`.

use anyhow::Result;
use std::path::Path;

pub fn cmd_init(project_dir: &Path) -> Result<()> {
    use stageforge::init::init_project;

    let result = init_project(project_dir)?;

    if result.created {
        println!(
            "Initialized stageforge project at {}",
            result.state_dir.display()
        );
        println!();
        println!("Created directory structure:");
        println!("  .stageforge/");
        println!("  ├── stageforge.toml   # Settings");
        println!("  ├── milestones.json   # Sample milestones, edit before running");
        println!("  ├── logs/             # Rolling run logs");
        println!("  └── worktrees/        # One worktree per in-flight milestone");
        println!();
        println!("Next steps:");
        println!("  1. Describe your milestones in .stageforge/milestones.json");
        println!("  2. Run `stageforge list` to check the stage layout");
        println!("  3. Run `stageforge run` to start execution");
    } else {
        println!(
            "Stageforge project already initialized at {}",
            result.state_dir.display()
        );
        if result.wrote_settings {
            println!("Restored missing stageforge.toml");
        }
        if result.wrote_milestones {
            println!("Added sample milestones.json");
        }
        println!("Directory structure verified.");
    }

    Ok(())
}
