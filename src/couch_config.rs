//! Environment keyed server configuration.
//!
//! ```toml
//! [environments.production]
//! domain = "couch.example.com"
//! port = 5984
//! database = "app"
//!
//! [environments.test]
//! database = "app_test"
//! ```

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::couch_error::{CouchError, Result};
use crate::couch_server::ServerSettings;

pub const CONFIG_PATH_VAR: &str = "COUCH_CONFIG";
pub const ENVIRONMENT_VAR: &str = "COUCH_ENV";
pub const DEFAULT_CONFIG_PATH: &str = "config/couch.toml";
pub const DEFAULT_REPOSITORY: &str = "production";

/// One named environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    #[serde(flatten)]
    pub server: ServerSettings,
    pub database: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouchConfig {
    #[serde(default)]
    pub environments: HashMap<String, EnvironmentConfig>,
}

impl CouchConfig {
    /// Reads and parses `path`. A missing or malformed file is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).map_err(|err| {
            CouchError::Config(format!(
                "Expected to find a configuration file at {}: {}",
                path.display(),
                err
            ))
        })?;
        Self::from_toml(&data)
    }

    pub fn load_quietly(path: impl AsRef<Path>) -> Option<Self> {
        match Self::load(path) {
            Ok(config) => Some(config),
            Err(err) => {
                warn!("{}", err);
                None
            }
        }
    }

    /// Loads [`default_path`] when it exists.
    pub fn load_default() -> Option<Self> {
        let path = default_path();
        if path.exists() {
            Self::load_quietly(path)
        } else {
            None
        }
    }

    pub fn from_toml(data: &str) -> Result<Self> {
        Ok(toml::from_str(data)?)
    }

    pub fn environment(&self, name: &str) -> Option<&EnvironmentConfig> {
        self.environments.get(name)
    }

    pub fn server_settings(&self, name: &str) -> Option<ServerSettings> {
        self.environment(name).map(|env| env.server.clone())
    }

    pub fn database_name(&self, name: &str) -> Option<&str> {
        self.environment(name)
            .and_then(|env| env.database.as_deref())
    }
}

/// `$COUCH_CONFIG`, else `config/couch.toml`.
pub fn default_path() -> PathBuf {
    env::var(CONFIG_PATH_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// `$COUCH_ENV`, else `production`.
pub fn default_repository() -> String {
    env::var(ENVIRONMENT_VAR).unwrap_or_else(|_| DEFAULT_REPOSITORY.to_string())
}
