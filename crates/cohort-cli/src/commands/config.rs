use std::path::Path;

use clap::Subcommand;
use cohort_core::CoreConfig;

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the loaded config with secrets masked
    Show,
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the config file path
    Path,
}

pub fn run(action: ConfigAction, config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        ConfigAction::Show => {
            let mut config = CoreConfig::load(config_path)?;
            if !config.api.access_key.is_empty() {
                config.api.access_key = "********".into();
            }
            println!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigAction::Init { force } => {
            let path = match config_path {
                Some(p) => p.to_path_buf(),
                None => CoreConfig::default_path()?,
            };
            if path.exists() && !force {
                eprintln!("config already exists at {} (use --force)", path.display());
                std::process::exit(1);
            }
            CoreConfig::default().save(&path)?;
            println!("wrote {}", path.display());
        }
        ConfigAction::Path => {
            let path = match config_path {
                Some(p) => p.to_path_buf(),
                None => CoreConfig::default_path()?,
            };
            println!("{}", path.display());
        }
    }
    Ok(())
}
