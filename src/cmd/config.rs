//! Configuration view and validation: `devloop config`.

use std::path::Path;

use anyhow::Result;
use console::style;
use devloop::config::DevloopConfig;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let (config, paths) = super::load(project_dir)?;

    match command {
        None | Some(ConfigCommands::Show) => {
            if paths.config_file.exists() {
                println!("# {}", paths.config_file.display());
            } else {
                println!("# No devloop.toml at {}, showing defaults", paths.config_file.display());
            }
            println!("# Effective values, environment overrides included");
            println!();
            print!("{}", toml::to_string_pretty(&config)?);
        }
        Some(ConfigCommands::Validate) => match config.validate() {
            Ok(()) => println!("{} Configuration is valid", style("✓").green()),
            Err(e) => {
                println!("{} {}", style("✗").red(), e);
                anyhow::bail!("Invalid configuration");
            }
        },
        Some(ConfigCommands::Init { force }) => {
            if paths.config_file.exists() && !force {
                anyhow::bail!(
                    "{} already exists. Use --force to overwrite.",
                    paths.config_file.display()
                );
            }
            std::fs::create_dir_all(&paths.state_dir)?;
            DevloopConfig::default().save(&paths.config_file)?;
            println!("Created {}", paths.config_file.display());
            println!("Set board.repo (owner/name) and the project ids before running.");
        }
    }
    Ok(())
}
