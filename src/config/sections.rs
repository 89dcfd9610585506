//! Configuration sections.
//!
//! Every section is `#[serde(default)]`, so a file only names what it changes.

use std::time::Duration;

use serde::Deserialize;

/// Log line layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Full,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive: a level (`info`) or targets (`tinymq=debug`)
    pub level: String,
    pub format: LogFormat,
    pub thread_ids: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Compact,
            thread_ids: true,
        }
    }
}

/// Resource limits and protocol timers
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Bound client ids (0 = unlimited)
    pub max_connections: usize,
    /// Unacknowledged QoS 1/2 messages per client (0 = unlimited)
    pub max_inflight: u16,
    /// Messages held for a disconnected client (0 = unlimited)
    pub max_queued_messages: usize,
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
    /// Bound on draining in-flight sends when a connection closes
    #[serde(with = "humantime_serde")]
    pub close_timeout: Duration,
    /// Time a new connection has to send CONNECT
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    pub outbound_capacity: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 100_000,
            max_inflight: 32,
            max_queued_messages: 1000,
            retry_interval: Duration::from_secs(30),
            close_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            outbound_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Highest QoS granted on subscribe
    pub max_qos: u8,
    pub retain_available: bool,
    /// Client id length limit for protocol level 3
    pub max_client_id_len_v31: usize,
    /// Topic depth limit (0 = unlimited)
    pub max_topic_levels: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            max_qos: 2,
            retain_available: true,
            max_client_id_len_v31: 23,
            max_topic_levels: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    /// Accept CONNECTs without a username while enabled
    pub allow_anonymous: bool,
    /// Bound on one credential check
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub users: Vec<UserConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_anonymous: true,
            timeout: Duration::from_secs(5),
            users: Vec::new(),
        }
    }
}

/// One static credential; exactly one of `password` / `password_hash`
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// argon2 PHC string (`$argon2id$v=19$...`)
    #[serde(default)]
    pub password_hash: Option<String>,
}

impl UserConfig {
    pub(crate) fn check(&self) -> Result<(), String> {
        let name = &self.username;
        match (self.password.as_deref(), self.password_hash.as_deref()) {
            (None, None) => Err(format!("user '{}' needs 'password' or 'password_hash'", name)),
            (Some(_), Some(_)) => Err(format!(
                "user '{}' sets both 'password' and 'password_hash'",
                name
            )),
            (Some(""), None) => Err(format!("user '{}' has an empty password", name)),
            (None, Some(hash)) if !hash.starts_with("$argon2") => Err(format!(
                "user '{}': password_hash is not an argon2 PHC string",
                name
            )),
            _ => Ok(()),
        }
    }
}
