//! Configuration management commands.
//!
//! The default configuration file lives in `~/.ripple/config.toml`.

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use std::path::{Path, PathBuf};

use ripple_core::config::RippleConfig;

use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,

    /// Write a configuration file with default values
    Init {
        /// Destination (defaults to ~/.ripple/config.toml)
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Print the default configuration file path
    Path,
}

/// Return the path to the default configuration file (`~/.ripple/config.toml`).
fn config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".ripple").join("config.toml"))
}

/// Load the effective configuration: `path` if given, else the default file
/// if it exists, else defaults. `RIPPLE__` environment variables override
/// file values in every case.
pub fn load(path: Option<&Path>) -> Result<RippleConfig> {
    let file = match path {
        Some(path) => Some(path.to_path_buf()),
        None => config_path().ok().filter(|p| p.exists()),
    };

    let settings = match file {
        Some(file) => {
            let name = file.to_str().context("Configuration path is not valid UTF-8")?;
            RippleConfig::from_file(name).with_context(|| format!("Failed to load {}", file.display()))?
        }
        None => RippleConfig::load().context("Failed to load configuration from the environment")?,
    };
    Ok(settings)
}

pub async fn execute(cmd: ConfigCommands, settings: &RippleConfig, format: OutputFormat) -> Result<()> {
    match cmd {
        ConfigCommands::Show => match format {
            OutputFormat::Table => {
                let content = toml::to_string_pretty(settings).context("Failed to serialize config")?;
                output::section("Configuration");
                println!("{}", content);
            }
            _ => output::document(settings, format)?,
        },

        ConfigCommands::Init { path, force } => {
            let path = match path {
                Some(path) => path,
                None => config_path()?,
            };
            if path.exists() && !force {
                bail!("{} already exists, use --force to overwrite", path.display());
            }
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            let content =
                toml::to_string_pretty(&RippleConfig::default()).context("Failed to serialize config")?;
            std::fs::write(&path, content)
                .with_context(|| format!("Failed to write {}", path.display()))?;

            match format {
                OutputFormat::Table => output::status(output::Status::Done, &format!("Wrote {}", path.display())),
                _ => output::document(&serde_json::json!({ "path": path }), format)?,
            }
        }

        ConfigCommands::Path => {
            let path = config_path()?;
            match format {
                OutputFormat::Table => {
                    output::counters(&[("path", path.display().to_string()), ("exists", path.exists().to_string())]);
                }
                _ => output::document(
                    &serde_json::json!({ "path": path, "exists": path.exists() }),
                    format,
                )?,
            }
        }
    }

    Ok(())
}
