//! The bulk orchestrator: fan out many single-object transfers across a
//! bounded worker pool, retrying each object independently and
//! aggregating per-object outcomes into a batch report.
//!
//! Each object's transfer (including all of its retry attempts) runs
//! inside the [`crate::transfer`] engine; this module is only
//! responsible for scheduling objects onto workers, excluding paths the
//! caller asked to skip, and deciding whether one object's failure
//! should abort the whole batch.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Error;
use crate::options::BulkOptions;
use crate::provider::Storage;
use crate::retry::{self, Outcome};
use crate::transfer;

/// One planned transfer: a remote key paired with its local path.
#[derive(Debug, Clone)]
pub struct TransferItem {
    pub key: String,
    pub local_path: PathBuf,
}

/// Direction of a bulk transfer, since the same worker-pool/retry
/// scaffolding drives both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Download,
    Upload,
}

/// Outcome of one item's transfer within a batch.
#[derive(Debug, Clone)]
pub struct ItemResult {
    pub key: String,
    pub bytes_transferred: u64,
    pub skipped: bool,
    pub error: Option<String>,
    pub attempts: u32,
}

/// Aggregated result of a whole batch.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub items: Vec<ItemResult>,
    pub bytes_transferred: u64,
    pub succeeded: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl BatchReport {
    fn record(&mut self, result: ItemResult) {
        self.bytes_transferred += result.bytes_transferred;
        if result.error.is_some() {
            self.failed += 1;
        } else if result.skipped {
            self.skipped += 1;
        } else {
            self.succeeded += 1;
        }
        self.items.push(result);
    }
}

/// Per-batch progress, reported incrementally as items complete. Cheap
/// to clone; cloned into the progress callback on every update.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    pub completed: u64,
    pub total: u64,
    pub bytes_transferred: u64,
    pub failed: u64,
}

/// Run `items` through `storage` in the given `direction`, honoring
/// `options.worker_count` concurrent transfers, `options.retry` backoff
/// per item, and `options.exclude` pattern filtering. `on_progress` is
/// called after every item completes (success, skip, or final failure).
pub async fn run(
    storage: Arc<dyn Storage>,
    items: Vec<TransferItem>,
    direction: Direction,
    options: &BulkOptions,
    cancellation: &CancellationToken,
    on_progress: impl Fn(Progress) + Send + Sync + 'static,
) -> BatchReport {
    let total = items.len() as u64;
    let (excluded, included): (Vec<_>, Vec<_>) = items
        .into_iter()
        .partition(|item| options.exclude.matches(&item.key));

    if !excluded.is_empty() {
        debug!(count = excluded.len(), "items skipped by exclude pattern");
    }

    let semaphore = Arc::new(Semaphore::new(options.worker_count));
    let on_progress = Arc::new(on_progress);
    let progress_state = Arc::new(ProgressState::default());
    let batch_cancellation = cancellation.clone();

    // Every input item must appear in exactly one output result, even
    // excluded ones -- record those up front as skipped rather than
    // dropping them from the report.
    let mut report = BatchReport::default();
    for item in excluded {
        let result = ItemResult {
            key: item.key,
            bytes_transferred: 0,
            skipped: true,
            error: None,
            attempts: 0,
        };
        progress_state.record(&result);
        on_progress(progress_state.snapshot(total));
        report.record(result);
    }

    let mut tasks = JoinSet::new();
    for item in included {
        let storage = storage.clone();
        let semaphore = semaphore.clone();
        let options = options.clone();
        let cancellation = batch_cancellation.clone();
        let on_progress = on_progress.clone();
        let progress_state = progress_state.clone();
        let fail_fast = options.fail_fast;

        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            let result = transfer_one(&storage, &item, direction, &options, &cancellation).await;

            if result.error.is_some() && fail_fast {
                cancellation.cancel();
            }

            progress_state.record(&result);
            on_progress(progress_state.snapshot(total));
            result
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => report.record(result),
            Err(join_err) => report.record(ItemResult {
                key: "<unknown>".to_string(),
                bytes_transferred: 0,
                skipped: false,
                error: Some(join_err.to_string()),
                attempts: 0,
            }),
        }
    }

    report
}

#[derive(Default)]
struct ProgressState {
    completed: AtomicU64,
    bytes: AtomicU64,
    failed: AtomicU64,
}

impl ProgressState {
    fn record(&self, result: &ItemResult) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.bytes.fetch_add(result.bytes_transferred, Ordering::SeqCst);
        if result.error.is_some() {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn snapshot(&self, total: u64) -> Progress {
        Progress {
            completed: self.completed.load(Ordering::SeqCst),
            total,
            bytes_transferred: self.bytes.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

async fn transfer_one(
    storage: &Arc<dyn Storage>,
    item: &TransferItem,
    direction: Direction,
    options: &BulkOptions,
    cancellation: &CancellationToken,
) -> ItemResult {
    let attempts = Arc::new(AtomicU64::new(0));
    let outcome = retry::retry(&options.retry, cancellation, {
        let attempts = attempts.clone();
        move |_attempt| {
            attempts.fetch_add(1, Ordering::SeqCst);
            let storage = storage.clone();
            let item = item.clone();
            let options = options.clone();
            let cancellation = cancellation.clone();
            async move {
                match direction {
                    Direction::Download => {
                        transfer::download(&storage, &item.key, &item.local_path, &options.download, &cancellation)
                            .await
                            .map(|o| (o.bytes_transferred, o.skipped))
                    }
                    Direction::Upload => {
                        transfer::upload(&storage, &item.local_path, &item.key, &options.upload, &cancellation)
                            .await
                            .map(|o| (o.bytes_transferred, false))
                    }
                }
            }
        }
    })
    .await;

    let attempts = attempts.load(Ordering::SeqCst) as u32;
    match outcome {
        Outcome::Completed(Ok((bytes_transferred, skipped))) => ItemResult {
            key: item.key.clone(),
            bytes_transferred,
            skipped,
            error: None,
            attempts,
        },
        Outcome::Completed(Err(err)) => {
            warn!(key = %item.key, error = %err, "bulk transfer failed");
            ItemResult {
                key: item.key.clone(),
                bytes_transferred: 0,
                skipped: false,
                error: Some(err.to_string()),
                attempts,
            }
        }
        Outcome::Cancelled => ItemResult {
            key: item.key.clone(),
            bytes_transferred: 0,
            skipped: false,
            error: Some(Error::new(crate::error::ErrorKind::Other, "bulk_transfer", item.key.clone()).to_string()),
            attempts,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::MemoryStorage;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[tokio::test]
    async fn runs_downloads_across_all_items() {
        let storage = Arc::new(MemoryStorage::new());
        storage.seed("a.txt", b"hello".to_vec());
        storage.seed("b.txt", b"world".to_vec());

        let dir = TempDir::new().unwrap();
        let items = vec![
            TransferItem {
                key: "a.txt".to_string(),
                local_path: dir.path().join("a.txt"),
            },
            TransferItem {
                key: "b.txt".to_string(),
                local_path: dir.path().join("b.txt"),
            },
        ];

        let options = BulkOptions::default();
        let cancellation = CancellationToken::new();
        let report = run(storage, items, Direction::Download, &options, &cancellation, |_| {}).await;

        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(report.bytes_transferred, 10);
    }

    #[tokio::test]
    async fn excluded_items_are_reported_as_skipped_not_dropped() {
        let storage = Arc::new(MemoryStorage::new());
        storage.seed("keep.txt", b"data".to_vec());
        storage.seed("skip.tmp", b"data".to_vec());

        let dir = TempDir::new().unwrap();
        let items = vec![
            TransferItem {
                key: "keep.txt".to_string(),
                local_path: dir.path().join("keep.txt"),
            },
            TransferItem {
                key: "skip.tmp".to_string(),
                local_path: dir.path().join("skip.tmp"),
            },
        ];

        let options = BulkOptions::default().with_exclude(crate::options::ExcludePatterns::new(["*.tmp"]));
        let cancellation = CancellationToken::new();
        let report = run(storage, items, Direction::Download, &options, &cancellation, |_| {}).await;

        assert_eq!(report.items.len(), 2);
        let skipped = report.items.iter().find(|r| r.key == "skip.tmp").unwrap();
        assert!(skipped.skipped);
        assert!(skipped.error.is_none());
        assert_eq!(skipped.bytes_transferred, 0);
        assert_eq!(report.skipped, 1);
        let kept = report.items.iter().find(|r| r.key == "keep.txt").unwrap();
        assert!(!kept.skipped);
    }

    #[tokio::test]
    async fn failed_items_are_reported_not_panicked() {
        let storage = Arc::new(MemoryStorage::new());
        let dir = TempDir::new().unwrap();
        let items = vec![TransferItem {
            key: "missing.txt".to_string(),
            local_path: dir.path().join("missing.txt"),
        }];

        let mut options = BulkOptions::default();
        options.retry.max_attempts = 1;
        let cancellation = CancellationToken::new();
        let report = run(storage, items, Direction::Download, &options, &cancellation, |_| {}).await;

        assert_eq!(report.failed, 1);
        assert!(report.items[0].error.is_some());
    }

    #[tokio::test]
    async fn progress_callback_fires_per_item() {
        let storage = Arc::new(MemoryStorage::new());
        storage.seed("a.txt", b"hello".to_vec());

        let dir = TempDir::new().unwrap();
        let items = vec![TransferItem {
            key: "a.txt".to_string(),
            local_path: dir.path().join("a.txt"),
        }];

        let calls = Arc::new(Mutex::new(Vec::new()));
        let calls_clone = calls.clone();
        let options = BulkOptions::default();
        let cancellation = CancellationToken::new();
        run(storage, items, Direction::Download, &options, &cancellation, move |p| {
            calls_clone.lock().unwrap().push(p.completed);
        })
        .await;

        assert_eq!(*calls.lock().unwrap(), vec![1]);
    }
}
