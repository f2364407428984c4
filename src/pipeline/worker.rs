use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{events, BlobStore, Classifier, QueueStore, RecoverOutcome, SharedReceiver};
use crate::models::item::ImageQueueItem;

/// Worker loop: receive one item at a time from the shared channel and
/// drive it through read -> classify -> finalize against the one backend
/// this worker is bound to.
pub(super) async fn run<Q, B, C>(
    slot: usize,
    queue: Arc<Q>,
    blobs: Arc<B>,
    backend: C,
    rx: SharedReceiver,
    cancel: CancellationToken,
) where
    Q: QueueStore,
    B: BlobStore,
    C: Classifier,
{
    loop {
        let Some(item) = next_item(&rx, &cancel).await else {
            break;
        };

        metrics::gauge!("pipeline_in_flight").increment(1.0);
        process_item(slot, queue.as_ref(), blobs.as_ref(), &backend, item, &cancel).await;
        metrics::gauge!("pipeline_in_flight").decrement(1.0);
    }

    tracing::debug!(slot, "classification worker exited");
}

/// Receive the next item, racing both the receiver lock and the receive
/// itself against cancellation so an idle worker exits promptly.
async fn next_item(rx: &SharedReceiver, cancel: &CancellationToken) -> Option<ImageQueueItem> {
    let mut guard = tokio::select! {
        _ = cancel.cancelled() => return None,
        guard = rx.lock() => guard,
    };
    tokio::select! {
        _ = cancel.cancelled() => None,
        item = guard.recv() => item,
    }
}

async fn process_item<Q, B, C>(
    slot: usize,
    queue: &Q,
    blobs: &B,
    backend: &C,
    item: ImageQueueItem,
    cancel: &CancellationToken,
) where
    Q: QueueStore,
    B: BlobStore,
    C: Classifier,
{
    let image = match blobs.read(item.item_id).await {
        Ok(bytes) => bytes,
        Err(error) => {
            recover_item(queue, &item, "blob read failed", &error).await;
            return;
        }
    };

    let classification = tokio::select! {
        _ = cancel.cancelled() => {
            recover_item(queue, &item, "cancelled before classification", &"shutdown").await;
            return;
        }
        result = backend.classify(&image) => match result {
            Ok(classification) => classification,
            Err(error) => {
                recover_item(queue, &item, "classification failed", &error).await;
                return;
            }
        }
    };

    // The result itself is only logged for now; publishing it to
    // downstream consumers is a future extension.
    tracing::info!(
        slot,
        item_id = %item.item_id,
        user_id = %item.user_id,
        label = %classification.label,
        confidence = classification.confidence,
        "image classified"
    );

    match queue.delete(item.row_id).await {
        Ok(()) => events::item_completed(&item),
        Err(error) => events::row_orphaned(&item, &error),
    }

    // Blob cleanup happens even when the row delete failed; a leaked
    // blob is acceptable but must stay observable.
    if let Err(error) = blobs.delete(item.item_id).await {
        events::blob_leaked(&item, &error);
    }
}

/// Hand a failed item back to the queue store, keyed strictly on the
/// item's own row identifier.
async fn recover_item<Q>(
    queue: &Q,
    item: &ImageQueueItem,
    stage: &'static str,
    error: &(dyn std::fmt::Display + Sync),
) where
    Q: QueueStore,
{
    match queue.recover(item.row_id).await {
        Ok(RecoverOutcome::Requeued) => events::item_recovered(item, stage, error),
        Ok(RecoverOutcome::Dead) => events::item_dead(item, stage, error),
        Err(recover_error) => {
            tracing::error!(
                item_id = %item.item_id,
                stage,
                error = %error,
                recover_error = %recover_error,
                "failed to recover item; lease sweep will reclaim it"
            );
        }
    }
}
