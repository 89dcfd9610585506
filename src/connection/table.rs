//! Live connection table
//!
//! Two maps: every accepted transport endpoint by id, and the single live
//! connection bound to each client id.

use std::sync::Arc;

use dashmap::DashMap;

use super::Connection;

#[derive(Default)]
pub struct ConnectionTable {
    by_id: DashMap<u64, Arc<Connection>>,
    by_client: DashMap<Arc<str>, Arc<Connection>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an accepted endpoint
    pub fn insert(&self, conn: Arc<Connection>) {
        self.by_id.insert(conn.id(), conn);
    }

    pub fn remove(&self, id: u64) -> Option<Arc<Connection>> {
        self.by_id.remove(&id).map(|(_, conn)| conn)
    }

    /// Make `conn` the live connection for `client_id`.
    ///
    /// Returns the connection previously bound to it, if any.
    pub fn bind_client(&self, client_id: Arc<str>, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        self.by_client.insert(client_id, conn)
    }

    /// Unbind `client_id` only if it is still bound to connection `id`
    pub fn unbind_client_if(&self, client_id: &str, id: u64) -> bool {
        self.by_client
            .remove_if(client_id, |_, conn| conn.id() == id)
            .is_some()
    }

    /// The live connection for a client id
    pub fn live(&self, client_id: &str) -> Option<Arc<Connection>> {
        self.by_client.get(client_id).map(|c| c.clone())
    }

    pub fn is_bound(&self, client_id: &str) -> bool {
        self.by_client.contains_key(client_id)
    }

    /// Number of client ids with a live connection
    pub fn client_count(&self) -> usize {
        self.by_client.len()
    }

    /// Number of accepted endpoints, connected or not
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.by_id.iter().map(|e| e.value().clone()).collect()
    }
}
