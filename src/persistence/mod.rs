//! Session and retained-message persistence.
//!
//! The broker core only depends on the [`StorageBackend`] contract:
//! - sessions keyed by client id, overwritten on save, removed on clear
//! - retained messages keyed by topic
//!
//! [`FjallBackend`] is the bundled implementation. Writes go through a
//! [`PersistenceManager`], which batches them on a background task so the
//! publish path never waits on disk.

mod backend;
mod error;
mod fjall;
mod models;

pub use backend::{Collection, PersistenceOp, Record, StorageBackend};
pub use error::{PersistenceError, Result};
pub use fjall::FjallBackend;
pub use models::{
    LoadedData, StoredIncomingMessage, StoredInflightMessage, StoredMessage,
    StoredRetainedMessage, StoredSession, StoredSubscription,
};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::PersistenceConfig;

/// Channel depth between the hot path and the writer task
const WRITE_QUEUE_DEPTH: usize = 10_000;

/// Persistence manager that handles background writes
pub struct PersistenceManager {
    backend: Arc<dyn StorageBackend>,
    tx: mpsc::Sender<PersistenceOp>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    done_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl PersistenceManager {
    /// Create a new persistence manager with the given backend
    ///
    /// This spawns a background task that batches and commits writes, so it
    /// must be called from within a tokio runtime.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        flush_interval: Duration,
        max_batch_size: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();

        tokio::spawn(Self::writer_loop(
            backend.clone(),
            rx,
            shutdown_rx,
            done_tx,
            flush_interval,
            max_batch_size.max(1),
        ));

        Self {
            backend,
            tx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            done_rx: Mutex::new(Some(done_rx)),
        }
    }

    /// Open the configured backend and start the writer.
    ///
    /// Returns `Ok(None)` when persistence is disabled.
    pub fn from_config(config: &PersistenceConfig) -> Result<Option<Arc<Self>>> {
        if !config.enabled {
            return Ok(None);
        }
        info!(path = %config.path.display(), "Opening persistence store");
        let backend = FjallBackend::open(&config.path)?;
        Ok(Some(Arc::new(Self::new(
            Arc::new(backend),
            config.flush_interval,
            config.max_batch_size,
        ))))
    }

    /// Fire-and-forget write operation (non-blocking for hot path)
    ///
    /// If the channel is full, the operation is dropped (backpressure).
    pub fn write(&self, op: PersistenceOp) {
        if let Err(e) = self.tx.try_send(op) {
            warn!("Persistence channel full, dropping operation: {:?}", e);
        }
    }

    /// Load all data at startup
    pub async fn load_all(&self) -> Result<LoadedData> {
        self.backend.load_all().await
    }

    /// Gracefully shutdown the persistence manager
    ///
    /// Drains queued writes, then flushes and closes the backend.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down persistence manager");

        let shutdown_tx = self.shutdown_tx.lock().await.take();
        let Some(shutdown_tx) = shutdown_tx else {
            return Err(PersistenceError::Closed);
        };
        let _ = shutdown_tx.send(());

        if let Some(done_rx) = self.done_rx.lock().await.take() {
            let _ = done_rx.await;
        }

        self.backend.flush().await?;
        self.backend.close().await?;

        info!("Persistence manager shutdown complete");
        Ok(())
    }

    async fn commit(backend: &Arc<dyn StorageBackend>, batch: &mut Vec<PersistenceOp>, why: &str) {
        if batch.is_empty() {
            return;
        }
        let count = batch.len();
        match backend.batch_write(std::mem::take(batch)).await {
            Ok(()) => debug!("Flushed {} operations ({})", count, why),
            Err(e) => error!("Failed to write batch of {} ({}): {}", count, why, e),
        }
    }

    /// Background writer loop that batches and commits writes
    async fn writer_loop(
        backend: Arc<dyn StorageBackend>,
        mut rx: mpsc::Receiver<PersistenceOp>,
        mut shutdown_rx: oneshot::Receiver<()>,
        done_tx: oneshot::Sender<()>,
        flush_interval: Duration,
        max_batch_size: usize,
    ) {
        let mut batch = Vec::with_capacity(max_batch_size);
        let mut interval = tokio::time::interval(flush_interval);

        loop {
            tokio::select! {
                op = rx.recv() => {
                    match op {
                        Some(op) => {
                            batch.push(op);
                            if batch.len() >= max_batch_size {
                                Self::commit(&backend, &mut batch, "max batch").await;
                            }
                        }
                        None => {
                            Self::commit(&backend, &mut batch, "channel closed").await;
                            break;
                        }
                    }
                }

                _ = interval.tick() => {
                    Self::commit(&backend, &mut batch, "interval").await;
                }

                _ = &mut shutdown_rx => {
                    info!("Persistence writer received shutdown signal");
                    // Take whatever is already queued
                    while let Ok(op) = rx.try_recv() {
                        batch.push(op);
                    }
                    Self::commit(&backend, &mut batch, "shutdown").await;
                    break;
                }
            }
        }

        info!("Persistence writer loop exited");
        let _ = done_tx.send(());
    }
}
