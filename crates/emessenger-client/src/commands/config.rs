//! Configuration commands.

use std::path::Path;

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};

/// Dump the effective configuration to stdout.
pub fn dump(config: &ClientConfig, source: Option<&Path>) -> ClientResult<()> {
    println!("{}", render(config, source)?);
    Ok(())
}

fn render(config: &ClientConfig, source: Option<&Path>) -> ClientResult<String> {
    let toml_str = toml::to_string_pretty(config)
        .map_err(|e| ClientError::Config(format!("failed to serialize config: {}", e)))?;
    let path = source
        .map(Path::to_path_buf)
        .unwrap_or_else(ClientConfig::default_path);
    Ok(format!("# config.toml ({})\n{}", path.display(), toml_str))
}

/// Validate the configuration.
pub fn validate(config: &ClientConfig) -> ClientResult<()> {
    config.validate()?;
    let settings = config.settings()?;
    println!("Relay: {}", settings.server_url);
    println!("Client ID: #{:03}", settings.client_id);
    println!("Configuration is valid.");
    Ok(())
}

/// Show the configuration file path.
pub fn path(source: Option<&Path>) -> ClientResult<()> {
    let config_path = source
        .map(Path::to_path_buf)
        .unwrap_or_else(ClientConfig::default_path);
    println!("config: {}", config_path.display());
    Ok(())
}
