//! Blob Iterator - Consumer-facing source of downloaded batches
//!
//! Lists the pattern (enforcing ceilings before any byte is transferred),
//! then runs the download pool and the batcher in the background. The
//! consumer pulls one batch at a time; the one-slot output queue is what
//! bounds local disk usage.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::batcher::run_batcher;
use super::bucket::Bucket;
use super::downloader::{download_all, DownloadOptions};
use super::lister::list_matching;
use super::{Batch, GlobOptions};
use crate::error::{IngestError, Result};

pub struct BlobIterator {
    bucket: Arc<dyn Bucket>,
    temp_dir: PathBuf,
    keep_files: bool,
    keep_until_close: bool,
    single_object: bool,
    object_count: usize,
    total_size: u64,
    cancel: CancellationToken,
    batches: mpsc::Receiver<Result<Batch>>,
    tasks: Vec<JoinHandle<()>>,
    previous: Option<Batch>,
    /// `Some(Ok)` once exhausted, `Some(Err)` once failed
    terminal: Option<Result<()>>,
    closed: bool,
}

impl BlobIterator {
    /// List `opts.pattern` and start downloading.
    ///
    /// Listing failures (ceilings, no match) are returned here, before any
    /// download starts; the bucket handle is closed in that case.
    pub async fn open(bucket: Arc<dyn Bucket>, opts: GlobOptions) -> Result<Self> {
        let listing = match list_matching(bucket.as_ref(), &opts).await {
            Ok(listing) => listing,
            Err(e) => {
                if let Err(close_err) = bucket.close().await {
                    warn!(error = %close_err, "failed to close bucket after listing error");
                }
                return Err(e);
            }
        };

        let temp_dir = opts
            .temp_dir
            .join(format!("spyne-ingest-{}", Uuid::new_v4()));
        if let Err(e) = tokio::fs::create_dir_all(&temp_dir).await {
            if let Err(close_err) = bucket.close().await {
                warn!(error = %close_err, "failed to close bucket");
            }
            return Err(e.into());
        }

        let object_count = listing.objects.len();
        let total_size = listing.total_size();
        info!(
            objects = object_count,
            total_size,
            single_object = listing.single_object,
            temp_dir = %temp_dir.display(),
            "starting downloads"
        );

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = mpsc::channel(opts.concurrency.max(1));
        let (batch_tx, batch_rx) = mpsc::channel(1);

        let download_opts = DownloadOptions {
            concurrency: opts.concurrency,
            max_retries: opts.max_retries,
            retry_delay: opts.retry_delay,
        };
        // A failed download cancels its siblings through the child token
        // without tearing down the batcher, which still has to forward it.
        let downloader = tokio::spawn(download_all(
            bucket.clone(),
            listing.objects,
            temp_dir.clone(),
            download_opts,
            cancel.child_token(),
            done_tx,
        ));
        let batcher = tokio::spawn(run_batcher(
            done_rx,
            batch_tx,
            opts.batch_size_bytes,
            cancel.clone(),
        ));

        Ok(Self {
            bucket,
            temp_dir,
            keep_files: opts.keep_files,
            keep_until_close: listing.single_object,
            single_object: listing.single_object,
            object_count,
            total_size,
            cancel,
            batches: batch_rx,
            tasks: vec![downloader, batcher],
            previous: None,
            terminal: None,
            closed: false,
        })
    }

    /// Keep every batch's files until `close`, instead of deleting the
    /// previous batch on each `next`. Always on for single-object sources.
    pub fn keep_files_until_close(&mut self, keep: bool) {
        self.keep_until_close = keep || self.single_object;
    }

    pub fn is_single_object(&self) -> bool {
        self.single_object
    }

    pub fn object_count(&self) -> usize {
        self.object_count
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Next batch, `None` at end of data, or the pipeline's error.
    ///
    /// Repeats the terminal outcome once reached.
    pub async fn next(&mut self) -> Result<Option<Batch>> {
        if let Some(terminal) = &self.terminal {
            return terminal.clone().map(|_| None);
        }
        if self.closed {
            return Err(IngestError::Cancelled);
        }

        match self.batches.recv().await {
            Some(Ok(batch)) => {
                self.release_previous().await;
                debug!(files = batch.len(), bytes = batch.size_bytes, "handing out batch");
                self.previous = Some(batch.clone());
                Ok(Some(batch))
            }
            Some(Err(e)) => {
                self.terminal = Some(Err(e.clone()));
                Err(e)
            }
            None if self.cancel.is_cancelled() => {
                self.terminal = Some(Err(IngestError::Cancelled));
                Err(IngestError::Cancelled)
            }
            None => {
                self.terminal = Some(Ok(()));
                Ok(None)
            }
        }
    }

    async fn release_previous(&mut self) {
        let Some(previous) = self.previous.take() else {
            return;
        };
        if self.keep_files || self.keep_until_close {
            return;
        }
        for file in &previous.files {
            match tokio::fs::remove_file(file).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %file.display(), error = %e, "failed to remove consumed file"),
            }
        }
    }

    /// Stop all work and release resources. Safe to call in any state, and
    /// more than once.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.cancel.cancel();

        self.batches.close();
        while self.batches.recv().await.is_some() {}

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }

        let mut result = Ok(());
        if !self.keep_files {
            match tokio::fs::remove_dir_all(&self.temp_dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => result = Err(e.into()),
            }
        }

        if let Err(e) = self.bucket.close().await {
            if result.is_ok() {
                result = Err(e.into());
            }
        }

        debug!(temp_dir = %self.temp_dir.display(), kept = self.keep_files, "blob iterator closed");
        result
    }
}

/// Best-effort cleanup for an iterator that was never closed. Tasks that are
/// still unwinding may recreate a file after the removal; `close` waits for
/// them and is the reliable path.
impl Drop for BlobIterator {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.cancel.cancel();
        if !self.keep_files {
            match std::fs::remove_dir_all(&self.temp_dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(temp_dir = %self.temp_dir.display(), error = %e, "failed to remove temp dir on drop")
                }
            }
        }
    }
}
