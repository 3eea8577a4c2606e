use anyhow::{bail, Context, Result};
use bluetti_lib::DriverConfig;
use std::path::Path;

pub const DEFAULT_CONFIG_FILE: &str = "bluetti.yaml";

/// Loads the driver configuration from `config_file_path`.
///
/// A missing file is fine as long as `address` is given; every other setting
/// then keeps its default.
pub fn load(config_file_path: &str, address: Option<&str>) -> Result<DriverConfig> {
    let mut config = if Path::new(config_file_path).exists() {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open config file {config_file_path:?}"))?;
        serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read config from file: {config_file_path:?}"))?
    } else if let Some(address) = address {
        log::debug!("No config file {config_file_path:?}, using defaults");
        DriverConfig::new(address)
    } else {
        bail!("No config file {config_file_path:?} and no --address given");
    };
    if let Some(address) = address {
        config.address = address.to_string();
    }
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {config_file_path:?}"))?;
    Ok(config)
}
