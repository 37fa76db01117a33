//! Batch Downloader - Bounded-concurrency fetch of matched objects to local disk

use futures::StreamExt;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::bucket::{Bucket, StorageError};
use super::{DownloadResult, RemoteObject};
use crate::error::{IngestError, Result};

/// Download pool settings
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub concurrency: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

enum FetchError {
    Storage(StorageError),
    Io(std::io::Error),
    Cancelled,
}

/// Slot holding the first failure reported by any task
#[derive(Clone, Default)]
struct FirstError(Arc<Mutex<Option<IngestError>>>);

impl FirstError {
    fn record(&self, err: IngestError) {
        if let Ok(mut slot) = self.0.lock() {
            if slot.is_none() {
                *slot = Some(err);
            }
        }
    }

    fn take(&self) -> Option<IngestError> {
        self.0.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// Map a bucket key to a path inside `root`, refusing keys that would escape it.
///
/// The key's `/`-separated layout is mirrored on disk, so a key that is also
/// a prefix directory of another key (`a` and `a/b`) cannot be downloaded in
/// the same transfer; whichever lands second fails with a `DownloadFailed`
/// naming the collision.
pub fn local_path_for(root: &Path, key: &str) -> Result<PathBuf> {
    let relative = Path::new(key.trim_start_matches('/'));
    let safe = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if !safe || relative.as_os_str().is_empty() {
        return Err(IngestError::DownloadFailed {
            key: key.to_string(),
            reason: "object key is not a relative file path".to_string(),
        });
    }
    Ok(root.join(relative))
}

/// Download every object into `root`, publishing each completion on `done`.
///
/// Runs until all tasks have finished. The first non-cancellation failure
/// cancels `cancel` (stopping siblings and pending objects) and is sent on
/// `done` as the last item; dropping `done` on return closes the queue.
pub async fn download_all(
    bucket: Arc<dyn Bucket>,
    objects: Vec<RemoteObject>,
    root: PathBuf,
    opts: DownloadOptions,
    cancel: CancellationToken,
    done: mpsc::Sender<Result<DownloadResult>>,
) {
    let semaphore = Arc::new(Semaphore::new(opts.concurrency.max(1)));
    let first_error = FirstError::default();
    let mut join_set = JoinSet::new();

    for object in objects {
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        let bucket = bucket.clone();
        let root = root.clone();
        let opts = opts.clone();
        let cancel = cancel.clone();
        let done = done.clone();
        let first_error = first_error.clone();

        join_set.spawn(async move {
            let _permit = permit;
            let key = object.key.clone();
            match download_object(bucket.as_ref(), object, &root, &opts, &cancel).await {
                Ok(result) => {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = done.send(Ok(result)) => {}
                    }
                }
                Err(IngestError::Cancelled) => {
                    debug!(key = %key, "download cancelled");
                }
                Err(e) => {
                    error!(key = %key, error = %e, "download failed, cancelling remaining downloads");
                    first_error.record(e);
                    cancel.cancel();
                }
            }
        });
    }

    while let Some(joined) = join_set.join_next().await {
        if let Err(join_err) = joined {
            first_error.record(IngestError::DownloadFailed {
                key: String::new(),
                reason: format!("download task aborted: {join_err}"),
            });
            cancel.cancel();
        }
    }

    if let Some(err) = first_error.take() {
        let _ = done.send(Err(err)).await;
    }
}

async fn download_object(
    bucket: &dyn Bucket,
    object: RemoteObject,
    root: &Path,
    opts: &DownloadOptions,
    cancel: &CancellationToken,
) -> Result<DownloadResult> {
    let local_path = local_path_for(root, &object.key)?;
    if let Some(parent) = local_path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            return Err(IngestError::DownloadFailed {
                key: object.key,
                reason: format!(
                    "cannot create local directory {} (collides with another object key?): {e}",
                    parent.display()
                ),
            });
        }
    }
    if tokio::fs::metadata(&local_path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
    {
        return Err(IngestError::DownloadFailed {
            key: object.key,
            reason: format!(
                "local path {} collides with another object key's directory",
                local_path.display()
            ),
        });
    }

    let mut attempt: u32 = 0;
    loop {
        match fetch_to_file(bucket, &object.key, &local_path, cancel).await {
            Ok(size) => {
                debug!(key = %object.key, size, "downloaded");
                return Ok(DownloadResult { local_path, size });
            }
            Err(FetchError::Storage(e)) if e.is_transient() && attempt < opts.max_retries => {
                attempt += 1;
                warn!(
                    key = %object.key,
                    attempt,
                    max_retries = opts.max_retries,
                    error = %e,
                    "transient download error, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                    _ = tokio::time::sleep(opts.retry_delay) => {}
                }
            }
            Err(FetchError::Storage(e)) => {
                return Err(IngestError::DownloadFailed {
                    key: object.key,
                    reason: e.to_string(),
                })
            }
            Err(FetchError::Io(e)) => {
                return Err(IngestError::DownloadFailed {
                    key: object.key,
                    reason: e.to_string(),
                })
            }
            Err(FetchError::Cancelled) => return Err(IngestError::Cancelled),
        }
    }
}

async fn fetch_to_file(
    bucket: &dyn Bucket,
    key: &str,
    path: &Path,
    cancel: &CancellationToken,
) -> std::result::Result<u64, FetchError> {
    let mut stream = tokio::select! {
        _ = cancel.cancelled() => return Err(FetchError::Cancelled),
        reader = bucket.new_reader(key) => reader.map_err(FetchError::Storage)?,
    };
    let mut file = tokio::fs::File::create(path).await.map_err(FetchError::Io)?;
    let mut written: u64 = 0;

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            chunk = stream.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => {
                file.write_all(&bytes).await.map_err(FetchError::Io)?;
                written += bytes.len() as u64;
            }
            Some(Err(e)) => return Err(FetchError::Storage(e)),
            None => break,
        }
    }

    file.flush().await.map_err(FetchError::Io)?;
    Ok(written)
}
