//! Server configuration.
//!
//! `ServerConfig` is read from a TOML file at startup. Its `[properties]`
//! table becomes the server-wide [`ServerProperties`] store, read by the
//! connection layer when sockets are accepted.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::fmt::Display;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::xmpp_server::handler::{ConnectionKind, PARSER_BUFFER_SIZE_PROPERTY};
use crate::xmpp_server::framing::DEFAULT_MAX_BUFFER_SIZE;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerSettings,
    pub listeners: ListenerSettings,
    pub logging: LoggingSettings,
    /// Free-form server properties (`xmpp.client.idle`, ...). Keys contain
    /// dots, so they must be quoted in TOML.
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// XMPP domain served by this instance.
    pub domain: String,
    /// IP address every listener binds to.
    pub bind_address: String,
    /// Packets that may wait for a dispatcher before routing reports busy.
    pub router_queue_depth: usize,
    pub router_workers: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerSettings {
    pub client: ListenerConfig,
    pub server: ListenerConfig,
    pub component: ListenerConfig,
    pub multiplexer: ListenerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Directory for rotated log files; platform default when unset.
    pub directory: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            bind_address: "0.0.0.0".to_string(),
            router_queue_depth: 10_000,
            router_workers: 4,
        }
    }
}

impl Default for ListenerSettings {
    fn default() -> Self {
        let listener = |kind: ConnectionKind, enabled| ListenerConfig {
            enabled,
            port: kind.default_port(),
        };
        Self {
            client: listener(ConnectionKind::Client, true),
            server: listener(ConnectionKind::Server, false),
            component: listener(ConnectionKind::Component, false),
            multiplexer: listener(ConnectionKind::Multiplexer, false),
        }
    }
}

impl ListenerSettings {
    pub fn get(&self, kind: ConnectionKind) -> &ListenerConfig {
        match kind {
            ConnectionKind::Client => &self.client,
            ConnectionKind::Server => &self.server,
            ConnectionKind::Component => &self.component,
            ConnectionKind::Multiplexer => &self.multiplexer,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        let mut properties: BTreeMap<String, String> = ConnectionKind::ALL
            .into_iter()
            .map(|kind| (kind.idle_property().to_string(), kind.default_idle_ms().to_string()))
            .collect();
        properties.insert(
            PARSER_BUFFER_SIZE_PROPERTY.to_string(),
            DEFAULT_MAX_BUFFER_SIZE.to_string(),
        );
        Self {
            server: ServerSettings::default(),
            listeners: ListenerSettings::default(),
            logging: LoggingSettings::default(),
            properties,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, writes the default configuration there and
    /// returns it.
    pub async fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        if tokio::fs::try_exists(path).await? {
            let content = tokio::fs::read_to_string(path).await?;
            let config: ServerConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let default_config = ServerConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.domain.trim().is_empty() {
            return Err(ConfigError::Invalid("server.domain cannot be empty".to_string()));
        }

        if self.server.bind_address.parse::<IpAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "Invalid bind address: {}",
                self.server.bind_address
            )));
        }

        if self.server.router_queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "server.router_queue_depth must be at least 1".to_string(),
            ));
        }
        if self.server.router_workers == 0 {
            return Err(ConfigError::Invalid(
                "server.router_workers must be at least 1".to_string(),
            ));
        }

        let mut ports = HashSet::new();
        for kind in ConnectionKind::ALL {
            let listener = self.listeners.get(kind);
            // Port 0 asks the OS for a free port, so it never collides.
            if listener.enabled && listener.port != 0 && !ports.insert(listener.port) {
                return Err(ConfigError::Invalid(format!(
                    "{} listener port {} is already used by another listener",
                    kind, listener.port
                )));
            }
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                self.logging.level
            )));
        }

        Ok(())
    }

    pub fn properties(&self) -> ServerProperties {
        ServerProperties::new(self.properties.clone())
    }
}

/// Server-wide key/value properties with typed, defaulting getters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerProperties {
    values: BTreeMap<String, String>,
}

impl ServerProperties {
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self { values }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.get_parsed(key, default)
    }

    pub fn get_usize(&self, key: &str, default: usize) -> usize {
        self.get_parsed(key, default)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get_string(key).map(str::trim) {
            None => default,
            Some(raw) if raw.eq_ignore_ascii_case("true") => true,
            Some(raw) if raw.eq_ignore_ascii_case("false") => false,
            Some(raw) => {
                warn!(key, value = raw, default, "Unparsable boolean property, using default");
                default
            }
        }
    }

    fn get_parsed<T>(&self, key: &str, default: T) -> T
    where
        T: FromStr + Display + Copy,
    {
        let Some(raw) = self.get_string(key) else {
            return default;
        };
        raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = raw, default = %default, "Unparsable property, using default");
            default
        })
    }
}
