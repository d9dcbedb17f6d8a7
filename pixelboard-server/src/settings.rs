//! Layered server settings.
//!
//! Defaults from [`ServerConfig`], then an optional `pixelboard.{toml,yaml,json}`
//! file (or the path given on the command line), then `PIXELBOARD_*`
//! environment variables, e.g. `PIXELBOARD_COOLDOWN_SECS=2`.

use config::{Config, Environment, File};
use pixelboard_collab::ServerConfig;
use thiserror::Error;

const DEFAULT_FILE: &str = "pixelboard";
const ENV_PREFIX: &str = "PIXELBOARD";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Load settings. An explicit `path` must exist; the default file may not.
pub fn load(path: Option<&str>) -> Result<ServerConfig, SettingsError> {
    let file = match path {
        Some(path) => File::with_name(path).required(true),
        None => File::with_name(DEFAULT_FILE).required(false),
    };
    let config = Config::builder()
        .add_source(file)
        .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
        .build()?
        .try_deserialize()?;
    validate(config)
}

fn validate(config: ServerConfig) -> Result<ServerConfig, SettingsError> {
    if config.board_width == 0 || config.board_height == 0 {
        return Err(SettingsError::Invalid(format!(
            "board must be at least 1x1, got {}x{}",
            config.board_width, config.board_height
        )));
    }
    if config.subscriber_queue_capacity == 0 {
        return Err(SettingsError::Invalid(
            "subscriber_queue_capacity must be positive".to_string(),
        ));
    }
    Ok(config)
}
