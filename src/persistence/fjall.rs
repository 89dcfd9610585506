//! Fjall storage backend.
//!
//! One LSM keyspace with a partition per [`Collection`].

use std::path::Path;

use async_trait::async_trait;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use super::backend::{Collection, Record, StorageBackend};
use super::error::{PersistenceError, Result};

pub struct FjallBackend {
    keyspace: Keyspace,
    retained: PartitionHandle,
    sessions: PartitionHandle,
}

impl FjallBackend {
    /// Open (or create) the store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let keyspace = Config::new(path).open()?;
        let open = |collection: Collection| {
            keyspace.open_partition(collection.name(), PartitionCreateOptions::default())
        };
        let retained = open(Collection::Retained)?;
        let sessions = open(Collection::Sessions)?;

        Ok(Self {
            keyspace,
            retained,
            sessions,
        })
    }

    fn partition(&self, collection: Collection) -> &PartitionHandle {
        match collection {
            Collection::Retained => &self.retained,
            Collection::Sessions => &self.sessions,
        }
    }
}

#[async_trait]
impl StorageBackend for FjallBackend {
    async fn read(&self, collection: Collection, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.partition(collection).get(key)?.map(|value| value.to_vec()))
    }

    async fn scan(&self, collection: Collection) -> Result<Vec<(String, Vec<u8>)>> {
        let mut records = Vec::new();
        for item in self.partition(collection).iter() {
            let (key, value) = item?;
            let key = String::from_utf8(key.to_vec()).map_err(|e| {
                PersistenceError::Corruption(format!("non UTF-8 key in {}: {}", collection.name(), e))
            })?;
            records.push((key, value.to_vec()));
        }
        Ok(records)
    }

    async fn apply(&self, records: Vec<Record>) -> Result<()> {
        let mut batch = self.keyspace.batch();
        for record in records {
            match record {
                Record::Put {
                    collection,
                    key,
                    value,
                } => batch.insert(self.partition(collection), key, value),
                Record::Delete { collection, key } => batch.remove(self.partition(collection), key),
            }
        }
        batch.commit()?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}
