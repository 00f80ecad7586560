//! Runtime configuration and on-disk locations.
//!
//! The coordinator reads `maestro.toml` from its runtime directory. A missing
//! file is not an error: every key has a default, and unknown keys are
//! rejected so typos surface at startup instead of being silently ignored.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{MaestroError, Result};
use crate::pool::MIN_POOL_BYTES;

pub const RUNTIME_DIR_ENV: &str = "MAESTRO_RUNTIME_DIR";
/// World index handed to shell processes so they join the right session.
pub const WORLD_ENV: &str = "MAESTRO_WORLD";
const RUNTIME_DIR_NAME: &str = ".maestro";
const CONFIG_FILE_NAME: &str = "maestro.toml";
const LOG_DIR_NAME: &str = "logs";

/// Directory holding the world lock, socket, config and logs.
pub fn runtime_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(RUNTIME_DIR_ENV).filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    let home = dirs::home_dir().ok_or(MaestroError::HomeDirNotFound)?;
    Ok(home.join(RUNTIME_DIR_NAME))
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(runtime_dir()?.join(CONFIG_FILE_NAME))
}

pub fn log_dir(runtime_dir: &Path) -> PathBuf {
    runtime_dir.join(LOG_DIR_NAME)
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MaestroConfig {
    pub world_index: u32,
    /// Byte budget shared by app records and the OSK text buffer.
    pub pool_size: usize,
    pub registry_capacity: usize,
    pub osk_text_capacity: usize,
    pub status_bar_height: u32,
    /// Upper bound on waiting for a subscriber's reaction; 0 waits forever.
    pub ack_timeout_ms: u64,
    pub reap_interval_secs: u64,
    pub shutdown_grace_secs: u64,
    pub max_connections: usize,
    pub shell: ShellPaths,
}

impl Default for MaestroConfig {
    fn default() -> Self {
        Self {
            world_index: 0,
            pool_size: 256 * 1024,
            registry_capacity: 32,
            osk_text_capacity: 1024,
            status_bar_height: 50,
            ack_timeout_ms: 5_000,
            reap_interval_secs: 5,
            shutdown_grace_secs: 10,
            max_connections: 64,
            shell: ShellPaths::default(),
        }
    }
}

/// Executables launched, in order, as the shell.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShellPaths {
    pub status_bar: PathBuf,
    pub osk: PathBuf,
    pub launcher: PathBuf,
}

impl Default for ShellPaths {
    fn default() -> Self {
        Self {
            status_bar: PathBuf::from("/usr/local/bin/maestro-statusbar"),
            osk: PathBuf::from("/usr/local/bin/maestro-osk"),
            launcher: PathBuf::from("/usr/local/bin/maestro-home"),
        }
    }
}

impl MaestroConfig {
    pub fn ack_timeout(&self) -> Option<Duration> {
        (self.ack_timeout_ms > 0).then(|| Duration::from_millis(self.ack_timeout_ms))
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn validate(&self) -> Result<()> {
        // Status bar, OSK and launcher all need a slot.
        if self.registry_capacity < 3 {
            return Err(MaestroError::ConfigInvalid(format!(
                "registry_capacity must be at least 3, got {}",
                self.registry_capacity
            )));
        }
        if self.pool_size < MIN_POOL_BYTES + self.osk_text_capacity {
            return Err(MaestroError::ConfigInvalid(format!(
                "pool_size {} cannot hold the OSK buffer ({} bytes) plus the {} byte minimum",
                self.pool_size, self.osk_text_capacity, MIN_POOL_BYTES
            )));
        }
        if self.reap_interval_secs == 0 {
            return Err(MaestroError::ConfigInvalid(
                "reap_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(MaestroError::ConfigInvalid(
                "max_connections must be greater than 0".to_string(),
            ));
        }
        for (name, path) in [
            ("status_bar", &self.shell.status_bar),
            ("osk", &self.shell.osk),
            ("launcher", &self.shell.launcher),
        ] {
            if path.as_os_str().is_empty() {
                return Err(MaestroError::ConfigInvalid(format!(
                    "shell.{} must name an executable",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Loads the config at `path` (or the default location), falling back to
/// defaults when the file does not exist.
pub fn load_config(path: Option<PathBuf>) -> Result<MaestroConfig> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(MaestroConfig::default());
    }

    let content = fs_err::read_to_string(&config_path)
        .map_err(|err| MaestroError::io(format!("read {}", config_path.display()), err))?;
    let config = toml::from_str::<MaestroConfig>(&content).map_err(|err| {
        MaestroError::ConfigMalformed {
            path: config_path.clone(),
            details: err.to_string(),
        }
    })?;
    config.validate()?;
    Ok(config)
}
