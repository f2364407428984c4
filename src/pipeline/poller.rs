use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{events, QueueStore};
use crate::models::item::ImageQueueItem;

/// Poll loop: every `poll_interval`, sweep expired leases, pop up to
/// `batch_limit` pending items and push them into the dispatcher
/// channel.
///
/// A full channel blocks the push (backpressure on the store), but the
/// push always races against cancellation so shutdown is never stuck
/// behind busy workers. Items popped but not yet dispatched when the
/// token fires are recovered, not dropped.
pub(super) async fn run<Q>(
    queue: Arc<Q>,
    tx: mpsc::Sender<ImageQueueItem>,
    batch_limit: u32,
    poll_interval: Duration,
    cancel: CancellationToken,
) where
    Q: QueueStore,
{
    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        // Reclaim items stranded in-flight past their lease before
        // asking for new work, so they rejoin the same cycle's batch
        // ordering.
        match queue.requeue_expired().await {
            Ok(0) => {}
            Ok(requeued) => {
                tracing::info!(requeued, "returned expired in-flight items to pending");
            }
            Err(error) => {
                tracing::warn!(error = %error, "lease sweep failed");
            }
        }

        let batch = match queue.pop_batch(batch_limit).await {
            Ok(batch) => batch,
            Err(error) => {
                // A store outage skips the cycle, never kills the loop.
                events::poll_failed(&error);
                continue;
            }
        };

        if batch.is_empty() {
            continue;
        }
        tracing::debug!(batch_size = batch.len(), "popped batch from queue store");

        let mut items = batch.into_iter();
        while let Some(item) = items.next() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    recover_undispatched(queue.as_ref(), item, items).await;
                    return;
                }
                permit = tx.reserve() => match permit {
                    Ok(permit) => permit.send(item),
                    Err(_) => {
                        // All workers gone; treat like cancellation.
                        recover_undispatched(queue.as_ref(), item, items).await;
                        return;
                    }
                }
            }
        }
    }
}

/// Hand every popped-but-undispatched item of the current batch back to
/// the store so shutdown never loses work.
async fn recover_undispatched<Q>(
    queue: &Q,
    first: ImageQueueItem,
    rest: impl Iterator<Item = ImageQueueItem>,
) where
    Q: QueueStore,
{
    for item in std::iter::once(first).chain(rest) {
        match queue.recover(item.row_id).await {
            Ok(_) => {
                tracing::info!(item_id = %item.item_id, "recovered undispatched item on shutdown");
            }
            Err(error) => {
                tracing::error!(
                    item_id = %item.item_id,
                    error = %error,
                    "failed to recover undispatched item; lease sweep will reclaim it"
                );
            }
        }
    }
}
