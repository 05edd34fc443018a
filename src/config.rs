//! Gateway configuration file.
//!
//! ```json
//! {
//!   "sense-ingress-address": "https://ingress.example.com",
//!   "sense-ingress-api-key": "...",
//!   "temperature-unit": "C"
//! }
//! ```

use crate::event::DEFAULT_TEMPERATURE_UNIT;
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Directory under `$HOME` holding the gateway's files.
pub const CONFIG_DIR: &str = ".sense";
pub const CONFIG_FILE_NAME: &str = "ble-client-conf.json";
pub const TOKEN_FILE_NAME: &str = "ble-client-jwt";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unable to read configuration file `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid configuration file `{path}`: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no {0} specified in configuration")]
    Missing(&'static str),
    #[error("unable to determine home directory (HOME is not set)")]
    NoHome,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(rename = "sense-ingress-address")]
    ingress_address: Option<String>,
    #[serde(rename = "sense-ingress-api-key")]
    api_key: Option<String>,
    #[serde(rename = "temperature-unit")]
    temperature_unit: Option<String>,
}

/// Validated configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct Config {
    pub ingress_address: String,
    pub api_key: String,
    pub temperature_unit: String,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("ingress_address", &self.ingress_address)
            .field("temperature_unit", &self.temperature_unit)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents, path)
    }

    fn parse(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            serde_json::from_str(contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(Self {
            ingress_address: required(raw.ingress_address, "sense-ingress-address")?,
            api_key: required(raw.api_key, "sense-ingress-api-key")?,
            temperature_unit: raw
                .temperature_unit
                .filter(|u| !u.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_TEMPERATURE_UNIT.to_string()),
        })
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String, ConfigError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing(field))
}

/// `$HOME/.sense`, where the config and token files live by default.
pub fn default_dir() -> Result<PathBuf, ConfigError> {
    std::env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .map(|home| PathBuf::from(home).join(CONFIG_DIR))
        .ok_or(ConfigError::NoHome)
}
