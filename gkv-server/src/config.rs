//! Node configuration, loaded from JSON with every field defaulted.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServerResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the data port listens on.
    pub bind: String,
    /// Address the locator listens on.
    pub locator_bind: String,
    /// Address the locator hands to clients; defaults to the bound data address.
    pub advertise: Option<String>,
    /// Regions created at startup.
    pub regions: Vec<String>,
    /// Default log filter; `RUST_LOG` overrides it.
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: "127.0.0.1:40404".to_string(),
            locator_bind: format!("127.0.0.1:{}", gkv_common::DEFAULT_LOCATOR_PORT),
            advertise: None,
            regions: vec!["example-region".to_string()],
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Loopback configuration on OS-assigned ports.
    pub fn ephemeral<I, S>(regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ServerConfig {
            bind: "127.0.0.1:0".to_string(),
            locator_bind: "127.0.0.1:0".to_string(),
            regions: regions.into_iter().map(Into::into).collect(),
            ..ServerConfig::default()
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> ServerResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|err| ServerError::Config(format!("cannot read {}: {}", path.display(), err)))?;
        let config: ServerConfig =
            serde_json::from_str(&raw).map_err(|err| ServerError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ServerResult<()> {
        if let Some(name) = self
            .regions
            .iter()
            .find(|name| name.is_empty() || name.contains(char::is_whitespace))
        {
            return Err(ServerError::Config(format!("invalid region name `{}`", name)));
        }
        Ok(())
    }
}
