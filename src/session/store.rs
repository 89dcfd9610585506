//! Thread-safe session store keyed by client id

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, error, warn};

use super::Session;
use crate::message::Message;
use crate::persistence::{PersistenceManager, PersistenceOp, StoredSession};
use crate::topic::Subscription;

/// Sessions of clients that connected with clean session = false.
///
/// Entries live until they are cleared or overwritten. With a
/// [`PersistenceManager`] attached, every change is written behind to the
/// storage backend.
pub struct SessionStore {
    sessions: DashMap<Arc<str>, Session>,
    /// Per-session cap on queued messages (0 = unlimited)
    max_queued: usize,
    persistence: Option<Arc<PersistenceManager>>,
}

impl SessionStore {
    pub fn new(max_queued: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_queued,
            persistence: None,
        }
    }

    pub fn with_persistence(mut self, persistence: Arc<PersistenceManager>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Look up a stored session without creating one
    pub fn get(&self, client_id: &str) -> Option<Session> {
        self.sessions.get(client_id).map(|s| s.clone())
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.sessions.contains_key(client_id)
    }

    /// Store a session with its subscriptions, replacing any prior entry
    pub fn save(&self, client_id: &str, mut session: Session, subscriptions: Vec<Subscription>) {
        session.client_id = Arc::from(client_id);
        session.subscriptions = subscriptions;
        debug!(
            client_id = %client_id,
            subscriptions = session.subscriptions.len(),
            queued = session.outgoing.len(),
            inflight = session.inflight.len(),
            "Saving session"
        );
        self.persist(&session);
        self.sessions.insert(Arc::from(client_id), session);
    }

    /// Delete all stored state for a client id; returns whether any existed
    pub fn clear(&self, client_id: &str) -> bool {
        let existed = self.sessions.remove(client_id).is_some();
        if existed {
            if let Some(ref p) = self.persistence {
                p.write(PersistenceOp::DeleteSession {
                    client_id: client_id.to_string(),
                });
            }
        }
        existed
    }

    /// Append a message to an offline client's queue.
    ///
    /// Returns false if no session is stored for the client.
    pub fn enqueue(&self, client_id: &str, message: Message) -> bool {
        let Some(mut session) = self.sessions.get_mut(client_id) else {
            return false;
        };
        if !session.queue_message(message, self.max_queued) {
            warn!(
                client_id = %client_id,
                max = self.max_queued,
                "Offline queue full, dropped oldest message"
            );
        }
        self.persist(&session);
        true
    }

    /// Remove and return a stored session's queued messages
    pub fn take_outgoing(&self, client_id: &str) -> VecDeque<Message> {
        match self.sessions.get_mut(client_id) {
            Some(mut session) => {
                let taken = session.take_outgoing();
                if !taken.is_empty() {
                    self.persist(&session);
                }
                taken
            }
            None => VecDeque::new(),
        }
    }

    /// Put messages taken with [`Self::take_outgoing`] back at the head of
    /// the queue; false if no session is stored for the client
    pub fn requeue_front(&self, client_id: &str, mut messages: VecDeque<Message>) -> bool {
        let Some(mut session) = self.sessions.get_mut(client_id) else {
            return false;
        };
        if messages.is_empty() {
            return true;
        }
        messages.append(&mut session.outgoing);
        session.outgoing = messages;
        self.persist(&session);
        true
    }

    /// Load sessions read back from storage (startup).
    ///
    /// Undecodable entries are logged and skipped.
    pub fn restore(&self, stored: Vec<(String, StoredSession)>) -> Vec<Session> {
        let mut restored = Vec::with_capacity(stored.len());
        for (client_id, stored) in stored {
            match stored.into_session() {
                Ok(session) => {
                    self.sessions
                        .insert(Arc::from(client_id.as_str()), session.clone());
                    restored.push(session);
                }
                Err(e) => {
                    error!(client_id = %client_id, "Skipping stored session: {}", e);
                }
            }
        }
        restored
    }

    /// Client ids with a stored session
    pub fn client_ids(&self) -> Vec<Arc<str>> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn persist(&self, session: &Session) {
        if let Some(ref p) = self.persistence {
            p.write(PersistenceOp::SetSession {
                client_id: session.client_id.to_string(),
                session: StoredSession::from_session(session),
            });
        }
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(0)
    }
}
