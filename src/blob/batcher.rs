//! Batcher - Groups completed downloads into byte-budgeted batches

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Batch, DownloadResult};
use crate::error::Result;

/// Drain `completed` into byte-budgeted batches on `out`.
///
/// A batch is closed before the file that would carry it past `threshold`,
/// and as soon as it reaches `threshold` exactly or through a single file
/// larger than the budget. It is never empty. Membership follows arrival
/// order only. A remaining partial batch is
/// published when `completed` closes cleanly; after a downloader error it is
/// dropped and only the error is forwarded. Returns early, publishing
/// nothing further, once `cancel` fires.
pub async fn run_batcher(
    mut completed: mpsc::Receiver<Result<DownloadResult>>,
    out: mpsc::Sender<Result<Batch>>,
    threshold: u64,
    cancel: CancellationToken,
) {
    let mut batch = Batch::default();

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => return,
            item = completed.recv() => item,
        };

        match item {
            Some(Ok(result)) => {
                if !batch.is_empty() && batch.size_bytes.saturating_add(result.size) > threshold {
                    let full = std::mem::take(&mut batch);
                    debug!(files = full.len(), bytes = full.size_bytes, "batch ready");
                    if !publish(&out, Ok(full), &cancel).await {
                        return;
                    }
                }
                batch.push(result);
                if batch.size_bytes >= threshold {
                    let full = std::mem::take(&mut batch);
                    debug!(files = full.len(), bytes = full.size_bytes, "batch ready");
                    if !publish(&out, Ok(full), &cancel).await {
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                debug!(dropped_files = batch.len(), "discarding partial batch after download error");
                publish(&out, Err(e), &cancel).await;
                return;
            }
            None => break,
        }
    }

    if !batch.is_empty() && !cancel.is_cancelled() {
        debug!(files = batch.len(), bytes = batch.size_bytes, "final batch ready");
        publish(&out, Ok(batch), &cancel).await;
    }
}

/// Blocks until the consumer has room; false if cancelled or the consumer is gone
async fn publish(
    out: &mpsc::Sender<Result<Batch>>,
    item: Result<Batch>,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = out.send(item) => sent.is_ok(),
    }
}
