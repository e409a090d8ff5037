// System
use std::env;

// Local
use crate::error::ConfigError;
use crate::types::{Mode, NamespaceScope, WatchOptions, WatchTarget};

pub const MODE_VAR: &str = "WATCH_MODE";
pub const API_VERSION_VAR: &str = "WATCH_API_VERSION";
pub const KIND_VAR: &str = "WATCH_KIND";
pub const NAMESPACE_VAR: &str = "WATCH_NAMESPACE";
pub const TIMEOUT_VAR: &str = "WATCH_TIMEOUT";

/// The API server rejects watch timeouts of 295 seconds or more.
pub const MAX_TIMEOUT_SECONDS: u32 = 294;

/// Startup configuration for the watcher binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherConfig {
    pub mode: Mode,
    pub target: WatchTarget,
    pub options: WatchOptions,
}

impl WatcherConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the config from any key lookup, treating empty values as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let mode = match get(MODE_VAR) {
            Some(mode) => mode.parse()?,
            None => Mode::default(),
        };
        let api_version = get(API_VERSION_VAR).ok_or(ConfigError::Missing(API_VERSION_VAR))?;
        let kind = get(KIND_VAR).ok_or(ConfigError::Missing(KIND_VAR))?;
        let scope = NamespaceScope::from_optional(get(NAMESPACE_VAR));
        let timeout_seconds = get(TIMEOUT_VAR).map(|raw| parse_timeout(&raw)).transpose()?;

        Ok(Self {
            mode,
            target: WatchTarget::new(api_version.trim(), kind.trim(), scope),
            options: WatchOptions { timeout_seconds },
        })
    }
}

fn parse_timeout(raw: &str) -> Result<u32, ConfigError> {
    match raw.trim().parse::<u32>() {
        Ok(seconds) if seconds > 0 && seconds <= MAX_TIMEOUT_SECONDS => Ok(seconds),
        _ => Err(ConfigError::InvalidTimeout(raw.to_string())),
    }
}
