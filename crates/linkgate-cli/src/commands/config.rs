//! `linkgate config`: validate or print configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use linkgate_core::{LinkgateConfig, SqliteStoreConfig, StoreConfig};

/// Loads and validates the configuration file.
pub fn validate(config_path: &Path) -> Result<()> {
    let config = LinkgateConfig::from_file(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    config.validate().context("invalid configuration")?;

    println!(
        "configuration ok: {} ({} store(s), policy {})",
        config_path.display(),
        config.stores.len(),
        config.gate.policy.as_str()
    );
    Ok(())
}

/// Prints an example configuration with every default filled in.
pub fn print_default() -> Result<()> {
    print!("{}", example_config().to_toml()?);
    Ok(())
}

fn example_config() -> LinkgateConfig {
    LinkgateConfig {
        stores: vec![StoreConfig {
            name: "orgs".to_string(),
            required: true,
            sqlite: Some(SqliteStoreConfig {
                path: PathBuf::from("app.db"),
                table: "company_members".to_string(),
                column: "user_id".to_string(),
            }),
        }],
        ..LinkgateConfig::default()
    }
}
