//! Configuration view and validation commands for `conductor config`.

use anyhow::Result;
use conductor::config::{ConductorToml, Config};

use super::super::ConfigCommands;

pub fn cmd_config(config: &Config, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = &config.config_file;

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Conductor Configuration");
            println!("=======================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No conductor.toml found at {} (using defaults)", config_path.display());
            }
            println!();

            println!("[paths]");
            println!("  project_dir = \"{}\"", config.project_dir.display());
            println!("  state_dir = \"{}\"", config.state_dir.display());
            println!("  tasks_dir = \"{}\"", config.tasks_dir.display());
            println!();

            println!("[lock]");
            println!("  timeout_ms = {}", config.lock.timeout_ms);
            println!("  poll_interval_ms = {}", config.lock.poll_interval_ms);
            println!("  stale_timeout_ms = {}", config.lock.stale_timeout_ms);
            println!();

            println!("[persistence]");
            println!("  legacy_mirrors = {}", config.persistence.legacy_mirrors);
            println!();

            println!("[logging]");
            println!("  level = \"{}\"", config.logging.level);
            println!("  format = \"{:?}\"", config.logging.format);
            if let Some(dir) = &config.logging.dir {
                println!("  dir = \"{}\"", dir.display());
            }
            println!();

            println!("[memory]");
            println!("  enabled = {}", config.memory.enabled);
            if !config.memory.command.is_empty() {
                println!("  command = {:?}", config.memory.command);
            }
            println!("  store_timeout_ms = {}", config.memory.store_timeout_ms);
            if let Some(group) = &config.memory.group_id {
                println!("  group_id = \"{}\"", group);
            }
            println!("  sanitize_secrets = {}", config.memory.sanitize_secrets);
            println!();

            if let Some(delay) = config.save_delay {
                println!("Pre-save delay active: {:?}", delay);
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No conductor.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = ConductorToml::load(config_path)?;
            let warnings = toml.validate();
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
            if config_path.exists() {
                println!("conductor.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            ConductorToml::default().save(config_path)?;
            println!("Created conductor.toml at {}", config_path.display());
        }
    }

    Ok(())
}
