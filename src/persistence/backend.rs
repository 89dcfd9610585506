//! Storage backend contract.
//!
//! A backend only stores opaque records in two collections. The typed
//! accessors for sessions and retained messages are provided on top of
//! that, encoding with the bincode models.

use async_trait::async_trait;

use super::error::Result;
use super::models::{decode, encode, LoadedData, StoredRetainedMessage, StoredSession};

/// Record collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    /// Retained messages keyed by topic
    Retained,
    /// Sessions keyed by client id
    Sessions,
}

impl Collection {
    pub fn name(self) -> &'static str {
        match self {
            Collection::Retained => "retained",
            Collection::Sessions => "sessions",
        }
    }
}

/// One encoded write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Put {
        collection: Collection,
        key: String,
        value: Vec<u8>,
    },
    Delete {
        collection: Collection,
        key: String,
    },
}

/// Typed write queued by the session and retained stores
#[derive(Debug, Clone)]
pub enum PersistenceOp {
    SetRetained {
        topic: String,
        message: StoredRetainedMessage,
    },
    DeleteRetained {
        topic: String,
    },
    SetSession {
        client_id: String,
        session: StoredSession,
    },
    DeleteSession {
        client_id: String,
    },
}

impl PersistenceOp {
    /// Encode into a backend record
    pub fn encode(self) -> Result<Record> {
        Ok(match self {
            PersistenceOp::SetRetained { topic, message } => Record::Put {
                collection: Collection::Retained,
                key: topic,
                value: encode(&message)?,
            },
            PersistenceOp::DeleteRetained { topic } => Record::Delete {
                collection: Collection::Retained,
                key: topic,
            },
            PersistenceOp::SetSession { client_id, session } => Record::Put {
                collection: Collection::Sessions,
                key: client_id,
                value: encode(&session)?,
            },
            PersistenceOp::DeleteSession { client_id } => Record::Delete {
                collection: Collection::Sessions,
                key: client_id,
            },
        })
    }
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read one record
    async fn read(&self, collection: Collection, key: &str) -> Result<Option<Vec<u8>>>;

    /// Every record of a collection
    async fn scan(&self, collection: Collection) -> Result<Vec<(String, Vec<u8>)>>;

    /// Apply records atomically; later records win over earlier ones
    async fn apply(&self, records: Vec<Record>) -> Result<()>;

    /// Make applied records durable
    async fn flush(&self) -> Result<()>;

    async fn close(&self) -> Result<()> {
        self.flush().await
    }

    async fn get_retained(&self, topic: &str) -> Result<Option<StoredRetainedMessage>> {
        self.read(Collection::Retained, topic)
            .await?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    async fn set_retained(&self, topic: &str, message: &StoredRetainedMessage) -> Result<()> {
        self.apply(vec![Record::Put {
            collection: Collection::Retained,
            key: topic.to_string(),
            value: encode(message)?,
        }])
        .await
    }

    async fn delete_retained(&self, topic: &str) -> Result<()> {
        self.apply(vec![Record::Delete {
            collection: Collection::Retained,
            key: topic.to_string(),
        }])
        .await
    }

    async fn list_retained(&self) -> Result<Vec<(String, StoredRetainedMessage)>> {
        self.scan(Collection::Retained)
            .await?
            .into_iter()
            .map(|(topic, bytes)| Ok((topic, decode(&bytes)?)))
            .collect()
    }

    async fn get_session(&self, client_id: &str) -> Result<Option<StoredSession>> {
        self.read(Collection::Sessions, client_id)
            .await?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    async fn set_session(&self, client_id: &str, session: &StoredSession) -> Result<()> {
        self.apply(vec![Record::Put {
            collection: Collection::Sessions,
            key: client_id.to_string(),
            value: encode(session)?,
        }])
        .await
    }

    async fn delete_session(&self, client_id: &str) -> Result<()> {
        self.apply(vec![Record::Delete {
            collection: Collection::Sessions,
            key: client_id.to_string(),
        }])
        .await
    }

    async fn list_sessions(&self) -> Result<Vec<(String, StoredSession)>> {
        self.scan(Collection::Sessions)
            .await?
            .into_iter()
            .map(|(client_id, bytes)| Ok((client_id, decode(&bytes)?)))
            .collect()
    }

    /// Encode and apply a batch of typed writes
    async fn batch_write(&self, ops: Vec<PersistenceOp>) -> Result<()> {
        let records = ops
            .into_iter()
            .map(PersistenceOp::encode)
            .collect::<Result<Vec<_>>>()?;
        self.apply(records).await
    }

    /// Everything needed at startup
    async fn load_all(&self) -> Result<LoadedData> {
        Ok(LoadedData {
            retained: self.list_retained().await?,
            sessions: self.list_sessions().await?,
        })
    }
}
