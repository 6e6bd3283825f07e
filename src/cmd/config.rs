//! Configuration view and validation commands — `stageforge config`.

use anyhow::Result;
use std::path::Path;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    use stageforge::config::STATE_DIR;
    use stageforge::settings::{CliOverrides, DEFAULT_TEMPLATE, SETTINGS_FILE, Settings};

    let state_dir = project_dir.join(STATE_DIR);
    let config_path = state_dir.join(SETTINGS_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Stageforge Configuration");
            println!("========================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No stageforge.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();

            let settings = Settings::resolve(&state_dir, &CliOverrides::default())?;
            println!("Effective values (with env overrides):");
            println!();
            print!("{}", settings.to_toml()?);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            if !config_path.exists() {
                println!("No stageforge.toml found; defaults are valid.");
                return Ok(());
            }
            let settings = Settings::load(&config_path)?;
            let warnings = settings.validate();
            if warnings.is_empty() {
                println!("{} Configuration is valid", console::style("✓").green());
            } else {
                println!("Configuration warnings:");
                for warning in &warnings {
                    println!("  {} {}", console::style("!").yellow(), warning);
                }
            }
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("Config file already exists: {}", config_path.display());
                return Ok(());
            }
            std::fs::create_dir_all(&state_dir)?;
            std::fs::write(&config_path, DEFAULT_TEMPLATE)?;
            println!("Created {}", config_path.display());
        }
    }

    Ok(())
}
