//! Config command implementation.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use handoff_core::config::Config;

use super::{ConfigAction, ConfigArgs};

fn resolve_path(config_path: Option<&Path>) -> PathBuf {
    config_path.map_or_else(Config::config_path, Path::to_path_buf)
}

/// Run the config command.
pub fn run(args: ConfigArgs, config_path: Option<&Path>) -> Result<()> {
    let path = resolve_path(config_path);

    match args.action {
        ConfigAction::Show => {
            let config = super::load_config(config_path)?;
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("# {}", path.display());
            print!("{rendered}");
        }
        ConfigAction::Path => {
            println!("{}", path.display());
        }
        ConfigAction::Reset => {
            Config::default()
                .save_to(&path)
                .with_context(|| format!("Cannot write '{}'", path.display()))?;
            println!("  Configuration reset to defaults: {}", path.display());
        }
    }

    Ok(())
}
