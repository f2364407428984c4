//! In-memory stand-ins for the pipeline's external collaborators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use uuid::Uuid;

use image_classify_pipeline::db::queue::QueueError;
use image_classify_pipeline::models::item::{ImageQueueItem, ItemStatus};
use image_classify_pipeline::pipeline::{BlobStore, Classifier, QueueStore, RecoverOutcome};
use image_classify_pipeline::services::classifier::{Classification, ClassifyError};
use image_classify_pipeline::services::storage::BlobError;

/// In-memory queue store mirroring the Postgres semantics: exclusive
/// batch-pop, attempt-counted recovery with a dead state, and a lease
/// sweep over expired in-flight rows. The default lease is long enough
/// that only [`MemoryQueue::expire_leases`] makes rows sweepable.
#[derive(Clone)]
pub struct MemoryQueue {
    inner: Arc<MemoryQueueInner>,
}

struct MemoryQueueInner {
    state: Mutex<QueueState>,
    max_attempts: i32,
    lease: Duration,
    fail_pops: AtomicBool,
}

#[derive(Default)]
struct QueueState {
    entries: Vec<QueueEntry>,
    next_row_id: i64,
}

struct QueueEntry {
    item: ImageQueueItem,
    status: ItemStatus,
    leased_until: Option<Instant>,
}

impl MemoryQueue {
    pub fn new(max_attempts: i32) -> Self {
        Self {
            inner: Arc::new(MemoryQueueInner {
                state: Mutex::new(QueueState::default()),
                max_attempts,
                lease: Duration::from_secs(60),
                fail_pops: AtomicBool::new(false),
            }),
        }
    }

    /// Age every in-flight lease out, as if the visibility timeout had
    /// elapsed (e.g. after a crash).
    pub fn expire_leases(&self) {
        let now = Instant::now();
        let mut state = self.inner.state.lock().unwrap();
        for entry in &mut state.entries {
            if entry.status == ItemStatus::InFlight {
                entry.leased_until = Some(now);
            }
        }
    }

    /// Insert `count` pending items with ascending creation times.
    pub fn seed(&self, count: usize) -> Vec<ImageQueueItem> {
        let base = Utc::now();
        let mut state = self.inner.state.lock().unwrap();
        let mut seeded = Vec::with_capacity(count);
        for i in 0..count {
            state.next_row_id += 1;
            let item = ImageQueueItem {
                row_id: state.next_row_id,
                item_id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
                latitude: 59.33,
                longitude: 18.06,
                altitude: 28.0,
                bearing: 90.0,
                attempts: 0,
                created_at: base + TimeDelta::milliseconds(i as i64),
            };
            state.entries.push(QueueEntry {
                item: item.clone(),
                status: ItemStatus::Pending,
                leased_until: None,
            });
            seeded.push(item);
        }
        seeded
    }

    pub fn set_fail_pops(&self, fail: bool) {
        self.inner.fail_pops.store(fail, Ordering::SeqCst);
    }

    pub fn count(&self, status: ItemStatus) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.entries.iter().filter(|e| e.status == status).count()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().unwrap().entries.is_empty()
    }

    pub fn status_of(&self, row_id: i64) -> Option<ItemStatus> {
        let state = self.inner.state.lock().unwrap();
        state
            .entries
            .iter()
            .find(|e| e.item.row_id == row_id)
            .map(|e| e.status)
    }

    pub fn attempts_of(&self, row_id: i64) -> Option<i32> {
        let state = self.inner.state.lock().unwrap();
        state
            .entries
            .iter()
            .find(|e| e.item.row_id == row_id)
            .map(|e| e.item.attempts)
    }
}

#[async_trait]
impl QueueStore for MemoryQueue {
    async fn pop_batch(&self, limit: u32) -> Result<Vec<ImageQueueItem>, QueueError> {
        if self.inner.fail_pops.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("injected outage".to_string()));
        }

        let mut state = self.inner.state.lock().unwrap();
        let mut pending: Vec<usize> = state
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.status == ItemStatus::Pending)
            .map(|(i, _)| i)
            .collect();
        pending.sort_by_key(|&i| state.entries[i].item.created_at);
        pending.truncate(limit as usize);

        let lease = self.inner.lease;
        let mut batch = Vec::with_capacity(pending.len());
        for index in pending {
            let entry = &mut state.entries[index];
            entry.status = ItemStatus::InFlight;
            entry.leased_until = Some(Instant::now() + lease);
            batch.push(entry.item.clone());
        }
        Ok(batch)
    }

    async fn recover(&self, row_id: i64) -> Result<RecoverOutcome, QueueError> {
        let mut state = self.inner.state.lock().unwrap();
        let Some(entry) = state
            .entries
            .iter_mut()
            .find(|e| e.item.row_id == row_id && e.status == ItemStatus::InFlight)
        else {
            return Ok(RecoverOutcome::Requeued);
        };

        entry.item.attempts += 1;
        entry.leased_until = None;
        if entry.item.attempts >= self.inner.max_attempts {
            entry.status = ItemStatus::Dead;
            Ok(RecoverOutcome::Dead)
        } else {
            entry.status = ItemStatus::Pending;
            Ok(RecoverOutcome::Requeued)
        }
    }

    async fn delete(&self, row_id: i64) -> Result<(), QueueError> {
        let mut state = self.inner.state.lock().unwrap();
        state.entries.retain(|e| e.item.row_id != row_id);
        Ok(())
    }

    async fn requeue_expired(&self) -> Result<u64, QueueError> {
        let now = Instant::now();
        let mut state = self.inner.state.lock().unwrap();
        let mut requeued = 0;
        for entry in &mut state.entries {
            if entry.status == ItemStatus::InFlight
                && entry.leased_until.is_some_and(|lease| lease <= now)
            {
                entry.status = ItemStatus::Pending;
                entry.leased_until = None;
                requeued += 1;
            }
        }
        Ok(requeued)
    }
}

/// In-memory blob store with injectable read failures.
#[derive(Clone, Default)]
pub struct MemoryBlobs {
    inner: Arc<MemoryBlobsInner>,
}

#[derive(Default)]
struct MemoryBlobsInner {
    blobs: Mutex<HashMap<Uuid, Vec<u8>>>,
    fail_reads: AtomicBool,
}

impl MemoryBlobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, item_id: Uuid, data: Vec<u8>) {
        self.inner.blobs.lock().unwrap().insert(item_id, data);
    }

    pub fn contains(&self, item_id: Uuid) -> bool {
        self.inner.blobs.lock().unwrap().contains_key(&item_id)
    }

    pub fn len(&self) -> usize {
        self.inner.blobs.lock().unwrap().len()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.inner.fail_reads.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlobStore for MemoryBlobs {
    async fn read(&self, item_id: Uuid) -> Result<Vec<u8>, BlobError> {
        if self.inner.fail_reads.load(Ordering::SeqCst) {
            return Err(BlobError::Unavailable("injected outage".to_string()));
        }
        self.inner
            .blobs
            .lock()
            .unwrap()
            .get(&item_id)
            .cloned()
            .ok_or(BlobError::NotFound(item_id))
    }

    async fn delete(&self, item_id: Uuid) -> Result<(), BlobError> {
        // Deleting an absent blob succeeds, matching S3 semantics.
        self.inner.blobs.lock().unwrap().remove(&item_id);
        Ok(())
    }
}

/// Classifier double that fails a scripted number of leading calls and
/// tracks call counts plus the concurrency high-water mark.
#[derive(Clone)]
pub struct ScriptedClassifier {
    inner: Arc<ScriptedClassifierInner>,
}

struct ScriptedClassifierInner {
    fail_first: AtomicU32,
    calls: AtomicU32,
    current: AtomicUsize,
    high_water: AtomicUsize,
    delay: Duration,
}

impl ScriptedClassifier {
    pub fn new(fail_first: u32, delay: Duration) -> Self {
        Self {
            inner: Arc::new(ScriptedClassifierInner {
                fail_first: AtomicU32::new(fail_first),
                calls: AtomicU32::new(0),
                current: AtomicUsize::new(0),
                high_water: AtomicUsize::new(0),
                delay,
            }),
        }
    }

    pub fn always_ok() -> Self {
        Self::new(0, Duration::from_millis(5))
    }

    pub fn always_failing() -> Self {
        Self::new(u32::MAX, Duration::from_millis(5))
    }

    pub fn calls(&self) -> u32 {
        self.inner.calls.load(Ordering::SeqCst)
    }

    pub fn high_water(&self) -> usize {
        self.inner.high_water.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(&self, _image: &[u8]) -> Result<Classification, ClassifyError> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.inner.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.high_water.fetch_max(current, Ordering::SeqCst);
        tokio::time::sleep(self.inner.delay).await;
        self.inner.current.fetch_sub(1, Ordering::SeqCst);

        let failed = self
            .inner
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            Err(ClassifyError::Backend("scripted failure".to_string()))
        } else {
            Ok(Classification {
                label: "golden retriever".to_string(),
                confidence: 0.93,
            })
        }
    }
}

/// Seed `count` pending items with matching blobs.
pub fn seed_items(queue: &MemoryQueue, blobs: &MemoryBlobs, count: usize) -> Vec<ImageQueueItem> {
    let items = queue.seed(count);
    for (i, item) in items.iter().enumerate() {
        blobs.insert(item.item_id, format!("image-bytes-{i}").into_bytes());
    }
    items
}

/// Poll `cond` every 10ms until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
