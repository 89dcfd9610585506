//! Application message value object
//!
//! A `Message` is what flows through the delivery engine. It is detached
//! from any packet identifier: identifiers are assigned per receiving
//! session when the message is handed to a connection.

use std::sync::Arc;

use bytes::Bytes;

use crate::protocol::{Publish, QoS, Will};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
}

impl Message {
    pub fn new(topic: impl Into<Arc<str>>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
            dup: false,
        }
    }

    pub fn retained(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Copy of this message as delivered at `qos` to one subscriber.
    ///
    /// The duplicate flag is reset: it is recomputed per hop.
    pub fn for_delivery(&self, qos: QoS, retain: bool) -> Self {
        Self {
            topic: self.topic.clone(),
            payload: self.payload.clone(),
            qos,
            retain,
            dup: false,
        }
    }

    /// Build the PUBLISH packet carrying this message
    pub fn to_publish(&self, packet_id: Option<u16>) -> Publish {
        Publish {
            dup: self.dup,
            qos: self.qos,
            retain: self.retain,
            topic: self.topic.clone(),
            packet_id,
            payload: self.payload.clone(),
        }
    }
}

impl From<Publish> for Message {
    fn from(p: Publish) -> Self {
        Self {
            topic: p.topic,
            payload: p.payload,
            qos: p.qos,
            retain: p.retain,
            dup: p.dup,
        }
    }
}

impl From<&Will> for Message {
    fn from(w: &Will) -> Self {
        Self {
            topic: Arc::from(w.topic.as_str()),
            payload: w.payload.clone(),
            qos: w.qos,
            retain: w.retain,
            dup: false,
        }
    }
}
