//! Data directory resolution and `config.toml` loading.

use std::path::{Path, PathBuf};
use std::{env, fs};

use rem_core::EngineConfig;

use crate::error::{Result, StoreError};
use crate::store::Store;

/// Overrides the data directory (tests and multi-profile setups).
pub const DATA_DIR_ENV: &str = "REM_DATA_DIR";
pub const CONFIG_FILE: &str = "config.toml";
pub const DB_FILE: &str = "reminiscence.db";

/// `$REM_DATA_DIR`, else `~/.reminiscence`.
pub fn default_base_dir() -> PathBuf {
    match env::var(DATA_DIR_ENV) {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
        _ => dirs_home().join(".reminiscence"),
    }
}

fn dirs_home() -> PathBuf {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Parse an engine config. A missing file yields the defaults; a present
/// but malformed one is an error.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("no config at {}; using defaults", path.display());
            return Ok(EngineConfig::default());
        }
        Err(e) => return Err(StoreError::Io(e)),
    };

    let config: EngineConfig = toml::from_str(&content)
        .map_err(|e| StoreError::Config(format!("{}: {e}", path.display())))?;
    validate(&config).map_err(|msg| StoreError::Config(format!("{}: {msg}", path.display())))?;
    tracing::info!("loaded config from {}", path.display());
    Ok(config)
}

fn validate(config: &EngineConfig) -> std::result::Result<(), String> {
    if !config.fallback.is_valid() {
        return Err(format!("fallback coordinate {} is out of range", config.fallback));
    }
    if !(config.default_radius_meters.is_finite() && config.default_radius_meters > 0.0) {
        return Err("default_radius_meters must be positive".to_string());
    }
    if let Some(min) = config.min_distance_meters
        && !(min.is_finite() && min >= 0.0)
    {
        return Err("min_distance_meters must be non-negative".to_string());
    }
    Ok(())
}

/// Create `base` if needed, then open its database and config.
pub fn open_default(base: &Path) -> Result<(Store, EngineConfig)> {
    fs::create_dir_all(base).map_err(|e| {
        StoreError::InvalidData(format!("failed to create {}: {e}", base.display()))
    })?;
    let store = Store::open(&base.join(DB_FILE))?;
    let config = load_config(&base.join(CONFIG_FILE))?;
    Ok((store, config))
}
