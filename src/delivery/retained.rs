//! Retained message store

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, error};

use crate::message::Message;
use crate::persistence::{PersistenceManager, PersistenceOp, StoredRetainedMessage};
use crate::topic::topic_matches_filter;

/// Latest retained message per topic
#[derive(Default)]
pub struct RetainedStore {
    messages: DashMap<Arc<str>, Message>,
    persistence: Option<Arc<PersistenceManager>>,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_persistence(mut self, persistence: Arc<PersistenceManager>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Apply a retained publish: an empty payload clears the topic,
    /// anything else replaces it.
    ///
    /// Returns true if a message is now stored for the topic.
    pub fn update(&self, message: &Message) -> bool {
        if message.payload.is_empty() {
            if self.messages.remove(message.topic.as_ref()).is_some() {
                debug!(topic = %message.topic, "Cleared retained message");
                if let Some(ref p) = self.persistence {
                    p.write(PersistenceOp::DeleteRetained {
                        topic: message.topic.to_string(),
                    });
                }
            }
            return false;
        }

        let stored = message.for_delivery(message.qos, true);
        if let Some(ref p) = self.persistence {
            p.write(PersistenceOp::SetRetained {
                topic: stored.topic.to_string(),
                message: StoredRetainedMessage::from(&stored),
            });
        }
        self.messages.insert(stored.topic.clone(), stored);
        true
    }

    pub fn get(&self, topic: &str) -> Option<Message> {
        self.messages.get(topic).map(|m| m.clone())
    }

    /// Retained messages whose topic matches `filter`, ordered by topic
    pub fn matching(&self, filter: &str) -> Vec<Message> {
        let mut found: Vec<Message> = self
            .messages
            .iter()
            .filter(|e| topic_matches_filter(e.key(), filter))
            .map(|e| e.value().clone())
            .collect();
        found.sort_by(|a, b| a.topic.cmp(&b.topic));
        found
    }

    /// Load retained messages read back from storage (startup)
    pub fn restore(&self, stored: Vec<(String, StoredRetainedMessage)>) -> usize {
        let mut restored = 0;
        for (topic, retained) in stored {
            match Message::try_from(retained.message) {
                Ok(message) => {
                    self.messages
                        .insert(Arc::from(topic.as_str()), message.retained(true));
                    restored += 1;
                }
                Err(e) => error!(topic = %topic, "Skipping stored retained message: {}", e),
            }
        }
        restored
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
