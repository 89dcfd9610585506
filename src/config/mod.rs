//! Broker configuration.
//!
//! A TOML file with `[log]`, `[limits]`, `[mqtt]`, `[auth]` and
//! `[persistence]` sections. [`Config::load`] expands `${VAR}` and
//! `${VAR:-default}` inside the file, then applies `TINYMQ__SECTION__KEY`
//! environment overrides on top.

mod persistence;
mod sections;


use std::fmt;
use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use persistence::PersistenceConfig;
pub use sections::{AuthConfig, LimitsConfig, LogConfig, LogFormat, MqttConfig, UserConfig};

/// Prefix of override variables; nesting uses `__`
const ENV_PREFIX: &str = "TINYMQ";

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    /// The file is not valid TOML for [`Config`]
    Parse(toml::de::Error),
    /// Merging file and environment failed
    Source(config::ConfigError),
    /// Values parsed but are not usable
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "reading config: {}", e),
            Self::Parse(e) => write!(f, "parsing config: {}", e),
            Self::Source(e) => write!(f, "loading config: {}", e),
            Self::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Parse(e) => Some(e),
            Self::Source(e) => Some(e),
            Self::Invalid(_) => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        Self::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        Self::Source(e)
    }
}

/// Expand `${VAR}` and `${VAR:-default}`; unset without default expands to ""
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let pattern = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
        .map_err(|e| ConfigError::Invalid(format!("substitution pattern: {}", e)))?;
    let expanded = pattern.replace_all(content, |caps: &regex::Captures| {
        std::env::var(&caps[1])
            .unwrap_or_else(|_| caps.get(2).map_or("", |m| m.as_str()).to_string())
    });
    Ok(expanded.into_owned())
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub limits: LimitsConfig,
    pub mqtt: MqttConfig,
    pub auth: AuthConfig,
    pub persistence: PersistenceConfig,
}

impl Config {
    /// Load `path` and apply environment overrides, e.g.
    /// `TINYMQ__LIMITS__MAX_CONNECTIONS=500` or `TINYMQ__AUTH__ENABLED=true`.
    ///
    /// A missing file leaves defaults plus overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        match std::fs::read_to_string(path.as_ref()) {
            Ok(content) => {
                let content = substitute_env_vars(&content)?;
                builder = builder.add_source(File::from_str(&content, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML text without substitution or overrides
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.mqtt.max_qos > 2 {
            return invalid("mqtt.max_qos must be 0, 1 or 2");
        }
        if self.limits.outbound_capacity == 0 {
            return invalid("limits.outbound_capacity must be positive");
        }
        if self.limits.retry_interval.is_zero() {
            return invalid("limits.retry_interval must be positive");
        }
        if self.persistence.enabled && self.persistence.max_batch_size == 0 {
            return invalid("persistence.max_batch_size must be positive");
        }
        if self.auth.enabled {
            for user in &self.auth.users {
                user.check().map_err(ConfigError::Invalid)?;
            }
        }
        Ok(())
    }
}
