//! Configuration view and validation commands: `taskforge config`.

use anyhow::Result;
use std::path::Path;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    use taskforge::init::{data_dir, write_default_config};
    use taskforge::settings::{SETTINGS_FILE, Settings, user_settings_path};

    let data_dir = data_dir(project_dir);
    let config_path = data_dir.join(SETTINGS_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("taskforge configuration");
            println!("=======================");
            println!();

            if config_path.exists() {
                println!("Project config: {}", config_path.display());
            } else {
                println!("No config.toml found at {}", config_path.display());
                println!("Run 'taskforge config init' to create one.");
            }
            if let Some(user) = user_settings_path().filter(|p| p.exists()) {
                println!("User config:    {}", user.display());
            }
            println!();

            // Effective values include user file and environment overrides
            let settings = Settings::load_or_default(&data_dir)?;
            println!("Effective settings:");
            println!();
            print!("{}", toml::to_string_pretty(&settings)?);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No config.toml found. Using defaults (valid).");
                return Ok(());
            }

            let settings = Settings::load(&config_path)?;
            let warnings = settings.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if !write_default_config(&config_path)? {
                println!("config.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            println!("Created config.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [agent] command, model, phase timeout");
            println!("  - [gates] default gate, per-phase overrides, auto criteria");
            println!("  - [retry] routes and max_retries");
            println!("  - [git] target_branch, [finalize] sync_strategy");
            println!();
        }
    }

    Ok(())
}
