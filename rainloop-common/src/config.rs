//! Configuration file discovery and layered value resolution
//!
//! Resolution priority for every setting:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. Built-in default (fallback)

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

/// Name of the per-user configuration directory
pub const APP_DIR_NAME: &str = "rainloop";

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "RAINLOOP_CONFIG";

/// Locate the configuration file.
///
/// Returns `None` when no candidate exists; a missing file is not an error,
/// the built-in defaults apply.
pub fn resolve_config_path(cli_arg: Option<&Path>, env_var_name: &str) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    // Priority 3: Platform config directory
    default_config_path().filter(|p| p.exists())
}

/// Platform default config file path (`<config_dir>/rainloop/config.toml`)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_DIR_NAME).join("config.toml"))
}

/// Load and deserialize a TOML file.
///
/// `None` yields `T::default()`. An explicit path that cannot be read or
/// parsed is a configuration error.
pub fn load_toml<T>(path: Option<&Path>) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let Some(path) = path else {
        debug!("No config file found, using built-in defaults");
        return Ok(T::default());
    };

    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;

    let value = toml::from_str::<T>(&content)?;
    debug!("Loaded config file {}", path.display());
    Ok(value)
}

/// Pick a value by priority: CLI, environment, file, default.
///
/// An environment value that fails to parse is ignored with a warning.
pub fn resolve_value<T>(cli: Option<T>, env_var_name: &str, file: Option<T>, default: T) -> T
where
    T: FromStr,
{
    if let Some(v) = cli {
        return v;
    }

    if let Ok(raw) = std::env::var(env_var_name) {
        match raw.parse::<T>() {
            Ok(v) => return v,
            Err(_) => warn!("Ignoring unparseable {}={:?}", env_var_name, raw),
        }
    }

    file.unwrap_or(default)
}
