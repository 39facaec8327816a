use crate::error::ConfigError;
use log::info;
use serde::{Deserialize, Serialize};

/// Prefix of the environment variables read by [`SessionConfig::from_env`].
pub const ENV_PREFIX: &str = "CONNECTOR_TRACKER_";

/// Session configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Check parent/child links before every response and log any disagreement.
    pub check_hierarchy: bool,

    /// Clean the connector map before every response, even if nothing is dirty.
    pub force_cleanup: bool,
}

impl SessionConfig {
    /// Loads the configuration from `CONNECTOR_TRACKER_*` environment variables; unset ones
    /// keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        SessionConfig::from_vars(std::env::vars())
    }

    /// Like [`from_env`](Self::from_env), but reads from the given variables.
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: SessionConfig = envy::prefixed(ENV_PREFIX).from_iter(vars)?;
        info!("session configuration loaded: {:?}", config);
        Ok(config)
    }
}
