//! Serializable data models for persistence.
//!
//! Storage-friendly mirrors of the runtime session and message types,
//! encoded with bincode.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bincode::{Decode, Encode};
use bytes::Bytes;

use super::error::{PersistenceError, Result};
use crate::message::Message;
use crate::protocol::QoS;
use crate::session::{DeliveryState, Session};
use crate::topic::Subscription;

/// Stored application message
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

/// Stored retained message
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredRetainedMessage {
    pub message: StoredMessage,
    /// Unix timestamp in seconds when the message was stored
    pub timestamp_secs: u64,
}

/// Stored subscription
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredSubscription {
    pub filter: String,
    pub qos: u8,
}

/// Stored outgoing QoS 1/2 exchange
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredInflightMessage {
    pub packet_id: u16,
    pub message: StoredMessage,
    /// See [`DeliveryState::as_u8`]
    pub state: u8,
    pub retries: u32,
}

/// Stored incoming QoS 2 message waiting for PUBREL
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredIncomingMessage {
    pub packet_id: u16,
    pub message: StoredMessage,
}

/// Stored session
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredSession {
    pub client_id: String,
    pub subscriptions: Vec<StoredSubscription>,
    pub outgoing: Vec<StoredMessage>,
    pub inflight: Vec<StoredInflightMessage>,
    pub incoming: Vec<StoredIncomingMessage>,
    pub next_packet_id: u16,
    /// Unix timestamp in seconds of the last write
    pub saved_at_secs: u64,
}

pub(crate) fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn qos_from_stored(v: u8) -> Result<QoS> {
    QoS::from_u8(v).ok_or_else(|| PersistenceError::Corruption(format!("invalid QoS byte {}", v)))
}

impl From<&Message> for StoredMessage {
    fn from(m: &Message) -> Self {
        Self {
            topic: m.topic.to_string(),
            payload: m.payload.to_vec(),
            qos: m.qos as u8,
            retain: m.retain,
        }
    }
}

impl TryFrom<StoredMessage> for Message {
    type Error = PersistenceError;

    fn try_from(stored: StoredMessage) -> Result<Self> {
        Ok(Message {
            topic: Arc::from(stored.topic),
            payload: Bytes::from(stored.payload),
            qos: qos_from_stored(stored.qos)?,
            retain: stored.retain,
            dup: false,
        })
    }
}

impl From<&Message> for StoredRetainedMessage {
    fn from(m: &Message) -> Self {
        Self {
            message: StoredMessage::from(m),
            timestamp_secs: now_unix_secs(),
        }
    }
}

impl StoredSession {
    /// Create a StoredSession from a Session reference
    pub fn from_session(session: &Session) -> Self {
        Self {
            client_id: session.client_id.to_string(),
            subscriptions: session
                .subscriptions
                .iter()
                .map(|s| StoredSubscription {
                    filter: s.filter.to_string(),
                    qos: s.qos as u8,
                })
                .collect(),
            outgoing: session.outgoing.iter().map(StoredMessage::from).collect(),
            inflight: session
                .inflight_in_order()
                .iter()
                .map(|e| StoredInflightMessage {
                    packet_id: e.packet_id,
                    message: StoredMessage::from(&e.message),
                    state: e.state.as_u8(),
                    retries: e.retries,
                })
                .collect(),
            incoming: session
                .incoming
                .iter()
                .map(|(packet_id, m)| StoredIncomingMessage {
                    packet_id: *packet_id,
                    message: StoredMessage::from(m),
                })
                .collect(),
            next_packet_id: session.peek_next_packet_id(),
            saved_at_secs: now_unix_secs(),
        }
    }

    /// Rebuild the runtime session
    pub fn into_session(self) -> Result<Session> {
        let client_id: Arc<str> = Arc::from(self.client_id);
        let mut session = Session::new(client_id.clone());

        for sub in self.subscriptions {
            session.subscriptions.push(Subscription::new(
                client_id.clone(),
                sub.filter,
                qos_from_stored(sub.qos)?,
            ));
        }
        for m in self.outgoing {
            session.outgoing.push_back(Message::try_from(m)?);
        }
        for entry in self.inflight {
            let state = DeliveryState::from_u8(entry.state).ok_or_else(|| {
                PersistenceError::Corruption(format!("invalid delivery state {}", entry.state))
            })?;
            session.restore_inflight(
                entry.packet_id,
                Message::try_from(entry.message)?,
                state,
                entry.retries,
            );
        }
        for entry in self.incoming {
            session
                .incoming
                .insert(entry.packet_id, Message::try_from(entry.message)?);
        }
        session.set_next_packet_id(self.next_packet_id);
        Ok(session)
    }
}

/// Data loaded from persistence at startup
#[derive(Debug, Default)]
pub struct LoadedData {
    pub retained: Vec<(String, StoredRetainedMessage)>,
    pub sessions: Vec<(String, StoredSession)>,
}

pub(crate) fn encode<T: Encode>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::encode_to_vec(value, bincode::config::standard())?)
}

pub(crate) fn decode<T: Decode<()>>(bytes: &[u8]) -> Result<T> {
    let (value, _) = bincode::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(value)
}
