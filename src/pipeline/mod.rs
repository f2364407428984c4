//! The background classification pipeline.
//!
//! A single poller task periodically pops a batch of pending items from
//! the durable queue store and fans them out over a bounded channel to a
//! fixed pool of workers, one per configured classifier backend. The
//! channel capacity equals the worker count, which caps in-flight work.
//!
//! Everything here degrades rather than crashes: store outages skip a
//! poll cycle, transient item failures put the item back to pending, and
//! cleanup failures leak observably. The only external surface is
//! [`Pipeline::start`]; shutdown happens by cancelling the supplied
//! token.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::queue::QueueError;
use crate::models::item::ImageQueueItem;
use crate::services::classifier::{Classification, ClassifyError};
use crate::services::storage::BlobError;

pub mod events;
mod poller;
mod worker;

/// What happened to an item handed back to the queue store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverOutcome {
    /// The item is pending again and will be popped by a later cycle.
    Requeued,
    /// The item exhausted its attempts and was parked in the dead state.
    Dead,
}

/// Durable queue store holding pending image jobs.
///
/// `pop_batch` must be atomic: two concurrent calls never return
/// overlapping items. The Postgres implementation gets this from
/// `FOR UPDATE SKIP LOCKED`; in-memory test doubles serialize on a lock.
#[async_trait]
pub trait QueueStore: Send + Sync + 'static {
    /// Atomically select up to `limit` oldest pending items and mark
    /// them in-flight. Returns an empty vec, not an error, when nothing
    /// is pending.
    async fn pop_batch(&self, limit: u32) -> Result<Vec<ImageQueueItem>, QueueError>;

    /// Reinstate a popped row as pending, counting the attempt. Rows
    /// that hit the attempt ceiling go to the dead state instead.
    async fn recover(&self, row_id: i64) -> Result<RecoverOutcome, QueueError>;

    /// Permanently purge a row after successful classification.
    async fn delete(&self, row_id: i64) -> Result<(), QueueError>;

    /// Return in-flight rows whose lease expired back to pending, e.g.
    /// after a crash left them stranded. Returns the number requeued.
    async fn requeue_expired(&self) -> Result<u64, QueueError>;
}

/// Blob store holding raw image bytes, keyed by the item identifier.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    async fn read(&self, item_id: Uuid) -> Result<Vec<u8>, BlobError>;
    async fn delete(&self, item_id: Uuid) -> Result<(), BlobError>;
}

/// One remote classification backend.
///
/// Implementations must bound the call (HTTP timeout); the worker
/// additionally races it against pipeline cancellation.
#[async_trait]
pub trait Classifier: Send + Sync + 'static {
    async fn classify(&self, image: &[u8]) -> Result<Classification, ClassifyError>;
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// How often the poller asks the queue store for a new batch.
    pub poll_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
        }
    }
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<ImageQueueItem>>>;

/// The assembled pipeline: queue store, blob store and one classifier
/// per worker slot.
///
/// Constructed once at startup; [`Pipeline::start`] is idempotent (the
/// second call is a no-op returning `None`).
pub struct Pipeline<Q, B, C> {
    queue: Arc<Q>,
    blobs: Arc<B>,
    backends: Mutex<Option<Vec<C>>>,
    config: PipelineConfig,
}

impl<Q, B, C> Pipeline<Q, B, C>
where
    Q: QueueStore,
    B: BlobStore,
    C: Classifier,
{
    pub fn new(queue: Q, blobs: B, backends: Vec<C>, config: PipelineConfig) -> Self {
        Self {
            queue: Arc::new(queue),
            blobs: Arc::new(blobs),
            backends: Mutex::new(Some(backends)),
            config,
        }
    }

    /// Spawn the poller and one worker per classifier backend.
    ///
    /// Returns `None` if the pipeline was already started. Cancelling
    /// `cancel` stops the poller from popping new batches and makes
    /// every worker finish or abandon its current item; abandoned items
    /// stay in-flight in the store and are reclaimed by the lease sweep
    /// on the next start.
    pub fn start(&self, cancel: CancellationToken) -> Option<PipelineHandle> {
        let backends = self
            .backends
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;

        let worker_count = backends.len();
        let (tx, rx) = mpsc::channel::<ImageQueueItem>(worker_count.max(1));
        let rx: SharedReceiver = Arc::new(tokio::sync::Mutex::new(rx));

        let workers = backends
            .into_iter()
            .enumerate()
            .map(|(slot, backend)| {
                tokio::spawn(worker::run(
                    slot,
                    Arc::clone(&self.queue),
                    Arc::clone(&self.blobs),
                    backend,
                    Arc::clone(&rx),
                    cancel.clone(),
                ))
            })
            .collect();

        let poller = tokio::spawn(poller::run(
            Arc::clone(&self.queue),
            tx,
            worker_count as u32,
            self.config.poll_interval,
            cancel,
        ));

        tracing::info!(worker_count, "classification pipeline started");

        Some(PipelineHandle { poller, workers })
    }
}

/// Join handle over every task the pipeline spawned.
///
/// Awaiting [`PipelineHandle::join`] after cancelling the token asserts
/// that the poller and all workers have actually exited.
pub struct PipelineHandle {
    poller: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Wait for the poller and every worker to exit.
    pub async fn join(self) {
        if let Err(error) = self.poller.await {
            tracing::error!(error = %error, "poller task panicked");
        }
        for (slot, handle) in self.workers.into_iter().enumerate() {
            if let Err(error) = handle.await {
                tracing::error!(error = %error, slot, "worker task panicked");
            }
        }
    }
}
