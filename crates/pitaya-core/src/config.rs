//! Node configuration.
//!
//! Configuration is read from an optional YAML file and then overridden by
//! environment variables under a prefix:
//!
//! ```yaml
//! server:
//!   id: "room-1"
//!   kind: "room"
//!   frontend: false
//!   metadata:
//!     region: "eu"
//! log:
//!   level: "debug"   # trace | debug | info | warn | error
//!   format: "json"   # console | json
//! ```
//!
//! | Variable                 | Field             |
//! |--------------------------|-------------------|
//! | `<PREFIX>_SERVER_ID`       | `server.id`       |
//! | `<PREFIX>_SERVER_KIND`     | `server.kind`     |
//! | `<PREFIX>_SERVER_HOSTNAME` | `server.hostname` |
//! | `<PREFIX>_SERVER_FRONTEND` | `server.frontend` |
//! | `<PREFIX>_LOG_LEVEL`       | `log.level`       |
//! | `<PREFIX>_LOG_FORMAT`      | `log.format`      |

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid value '{value}' for {key}")]
    InvalidEnv { key: String, value: String },
}

/// Identity of this server within the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerInfo {
    pub id: String,
    pub kind: String,
    pub hostname: String,
    pub frontend: bool,
    pub metadata: HashMap<String, String>,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: "game".to_string(),
            hostname: String::new(),
            frontend: false,
            metadata: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Console,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "console" => Ok(LogFormat::Console),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is not set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Console,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PitayaConfig {
    pub server: ServerInfo,
    pub log: LogConfig,
}

impl PitayaConfig {
    pub fn from_yaml(yaml: &str, origin: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        Self::from_yaml(&content, &display)
    }

    /// Load from `path` (if given) and apply `<env_prefix>_*` overrides from
    /// the process environment.
    pub fn load(path: Option<&Path>, env_prefix: &str) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(env_prefix, std::env::vars())?;
        Ok(config)
    }

    /// Apply overrides from `vars`; keys outside `prefix` are ignored.
    pub fn apply_env<I>(&mut self, prefix: &str, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let prefix = format!("{}_", prefix.to_ascii_uppercase());
        for (key, value) in vars {
            let Some(field) = key.strip_prefix(&prefix) else {
                continue;
            };
            match field {
                "SERVER_ID" => self.server.id = value,
                "SERVER_KIND" => self.server.kind = value,
                "SERVER_HOSTNAME" => self.server.hostname = value,
                "SERVER_FRONTEND" => {
                    self.server.frontend = parse_bool(&value).ok_or_else(|| {
                        ConfigError::InvalidEnv {
                            key: key.clone(),
                            value: value.clone(),
                        }
                    })?;
                }
                "LOG_LEVEL" => self.log.level = value,
                "LOG_FORMAT" => {
                    self.log.format = value.parse().map_err(|_| ConfigError::InvalidEnv {
                        key: key.clone(),
                        value: value.clone(),
                    })?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}
