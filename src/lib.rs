//! TinyMQ - embeddable MQTT v3.1/v3.1.1 broker core
//!
//! Connection lifecycle, subscriptions, sessions and QoS delivery. Packet
//! encoding and sockets stay outside: a transport hands decoded
//! [`protocol::Packet`]s to [`Broker::serve`] and writes what arrives on
//! its [`Outbound`].

pub mod auth;
pub mod broker;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod logging;
pub mod message;
pub mod persistence;
pub mod protocol;
pub mod session;
pub mod topic;

pub use auth::{AccessGate, Authenticator};
pub use broker::{Broker, BrokerConfig, BrokerEvent, GrantPolicy, ProtocolHandler};
pub use config::Config;
pub use connection::{ChannelOutbound, Connection, Outbound};
pub use message::Message;
pub use persistence::{FjallBackend, PersistenceManager, StorageBackend};
pub use protocol::{ProtocolVersion, QoS};
