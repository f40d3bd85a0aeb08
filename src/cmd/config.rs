//! Configuration view and validation commands, `provisiond config`.

use anyhow::Result;
use std::path::Path;

use provisiond::config::{ProvisionConfig, ProvisionToml};

use super::super::ConfigCommands;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("provisiond Configuration");
            println!("========================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No config file at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();

            let toml = ProvisionToml::load_or_default(config_path)?;
            print_toml(&toml);

            // Show effective values (including env overrides)
            println!("Effective values (with env overrides):");
            let mut config = ProvisionConfig::load(config_path)?;
            config.apply_env()?;
            println!("  listen = {}", config.bind_addr());
            println!("  program = \"{}\"", config.toml.script.program);
            println!("  working_dir = {}", config.working_dir().display());
            println!("  session_dir = {}", config.artifact_dir().display());
            println!("  timeout_secs = {}", config.toml.conversation.timeout_secs);
            println!();

            if !config_path.exists() {
                println!("Run 'provisiond config init' to create a provisiond.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let mut config = ProvisionConfig::load(config_path)?;
            config.apply_env()?;
            if !config_path.exists() {
                println!("No provisiond.toml found. Checking defaults.");
            }

            let warnings = config.validate();
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
                println!(
                    "provisiond.toml already exists at {}",
                    config_path.display()
                );
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if let Some(parent) = config_path.parent()
                && !parent.as_os_str().is_empty()
                && !parent.exists()
            {
                std::fs::create_dir_all(parent)?;
            }

            let toml = ProvisionToml::default();
            toml.save(config_path)?;

            println!("Created provisiond.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [script] program, args, working_dir, env");
            println!("  - [conversation] timeout_secs");
            println!("  - [artifacts] dir and read retry settings");
            println!("  - [markers] prompt texts printed by the login script");
            println!();
        }
    }

    Ok(())
}

fn print_toml(toml: &ProvisionToml) {
    println!("[server]");
    println!("  host = \"{}\"", toml.server.host);
    println!("  port = {}", toml.server.port);
    println!();

    println!("[script]");
    println!("  program = \"{}\"", toml.script.program);
    println!("  args = {:?}", toml.script.args);
    println!("  working_dir = \"{}\"", toml.script.working_dir.display());
    for (key, value) in &toml.script.env {
        println!("  env.{} = \"{}\"", key, value);
    }
    println!();

    println!("[conversation]");
    println!("  timeout_secs = {}", toml.conversation.timeout_secs);
    println!();

    println!("[artifacts]");
    println!("  dir = \"{}\"", toml.artifacts.dir.display());
    println!("  extension = \"{}\"", toml.artifacts.extension);
    println!("  grace_period_ms = {}", toml.artifacts.grace_period_ms);
    println!("  max_attempts = {}", toml.artifacts.max_attempts);
    println!("  initial_backoff_ms = {}", toml.artifacts.initial_backoff_ms);
    println!("  max_backoff_ms = {}", toml.artifacts.max_backoff_ms);
    println!();

    println!("[markers]");
    println!("  code_request = \"{}\"", toml.markers.code_request);
    println!("  two_factor = \"{}\"", toml.markers.two_factor);
    println!("  success = \"{}\"", toml.markers.success);
    println!("  failure = \"{}\"", toml.markers.failure);
    println!();
}
