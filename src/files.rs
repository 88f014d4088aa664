//! File Pool: runs the documents of one batch and hands each file off.
//!
//! ## Lifecycle of one file
//!
//! ```text
//! input/ ──▶ known in history? ── yes ──▶ processed/   (Skipped)
//!               │ no
//!               ▼
//!          aggregate + artifacts (panics caught)
//!               │
//!     ≥1 page ok ──▶ commit to history ──▶ processed/  (Completed)
//!     otherwise  ─────────────────────────▶ error/     (Failed)
//! ```
//!
//! The history commit happens before the move. If the process dies between
//! the two, the next tick finds a known file in `input/` and moves it without
//! processing it again. A failed move is logged and leaves the file where it
//! is; it never fails the batch. The route of a file whose move to `error/`
//! failed is remembered for the life of the pool, so later ticks retry the
//! move instead of transcribing the file again.

use crate::config::IngestConfig;
use crate::document::DocumentAggregator;
use crate::error::{panic_message, IngestError};
use crate::fingerprint::DocumentTask;
use crate::history::{HistoryEntry, HistoryLedger};
use crate::output::{BatchReport, DocumentReport, FileOutcome, Route};
use crate::pool::run_pool;
use futures::FutureExt;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

pub struct FilePool {
    aggregator: Arc<DocumentAggregator>,
    ledger: Arc<HistoryLedger>,
    processed_dir: PathBuf,
    error_dir: PathBuf,
    concurrency: usize,
    /// Fingerprint key → route, for files whose hand-off move failed.
    unmoved: Mutex<HashMap<String, Route>>,
}

impl FilePool {
    pub fn new(
        aggregator: Arc<DocumentAggregator>,
        ledger: Arc<HistoryLedger>,
        config: &IngestConfig,
    ) -> Self {
        Self {
            aggregator,
            ledger,
            processed_dir: config.processed_dir.clone(),
            error_dir: config.error_dir.clone(),
            concurrency: config.file_concurrency,
            unmoved: Mutex::new(HashMap::new()),
        }
    }

    pub fn ledger(&self) -> &Arc<HistoryLedger> {
        &self.ledger
    }

    /// Where `task` belongs without being processed again: `processed` once
    /// history knows it, or the route of an earlier hand-off that failed.
    pub fn pending_route(&self, task: &DocumentTask) -> Option<Route> {
        let key = task.fingerprint.key();
        if self.ledger.is_known(&key) {
            return Some(Route::Processed);
        }
        self.unmoved
            .lock()
            .ok()
            .and_then(|unmoved| unmoved.get(&key).copied())
    }

    /// Process `tasks` with at most `file_concurrency` in flight.
    ///
    /// The report lists one outcome per task, in task order.
    pub async fn run(&self, tasks: &[DocumentTask]) -> BatchReport {
        let results = run_pool(tasks, self.concurrency, |_, task| self.handle(task)).await;

        let mut report = BatchReport::default();
        for (outcome, moved) in results {
            if !moved {
                report.move_failures += 1;
            }
            report.outcomes.push(outcome);
        }
        report
    }

    /// Handle one file. Returns its outcome and whether the hand-off move succeeded.
    async fn handle(&self, task: &DocumentTask) -> (FileOutcome, bool) {
        let file = task.file_name().to_string();
        let key = task.fingerprint.key();

        match self.pending_route(task) {
            Some(Route::Processed) => {
                info!("{}: already processed, skipping", file);
                let moved = self.hand_off(task, Route::Processed).await;
                return (FileOutcome::Skipped { file }, moved);
            }
            Some(Route::Error) => {
                let moved = self.hand_off(task, Route::Error).await;
                let reason = "failed earlier, retrying the move only".to_string();
                return (FileOutcome::Failed { file, reason }, moved);
            }
            None => {}
        }

        let outcome = match AssertUnwindSafe(self.aggregator.process(task))
            .catch_unwind()
            .await
        {
            Ok(Ok(report)) if report.aggregate.is_usable() => {
                match self.commit(&key, &file, &report).await {
                    Ok(()) => FileOutcome::Completed {
                        file,
                        pages: report.aggregate.page_count(),
                        success: report.aggregate.success_count,
                        errors: report.aggregate.error_count,
                    },
                    Err(e) => FileOutcome::Failed {
                        file,
                        reason: format!("history commit failed: {e}"),
                    },
                }
            }
            Ok(Ok(report)) => FileOutcome::Failed {
                file,
                reason: format!(
                    "none of {} pages could be transcribed",
                    report.aggregate.page_count()
                ),
            },
            Ok(Err(e)) => FileOutcome::Failed {
                file,
                reason: e.to_string(),
            },
            Err(panic) => FileOutcome::Failed {
                file,
                reason: format!("processing panicked: {}", panic_message(&*panic)),
            },
        };

        if let FileOutcome::Failed { ref file, ref reason } = outcome {
            error!("{}: {}", file, reason);
        }
        let moved = self.hand_off(task, outcome.route()).await;
        (outcome, moved)
    }

    async fn commit(
        &self,
        key: &str,
        file: &str,
        report: &DocumentReport,
    ) -> Result<(), IngestError> {
        let agg = &report.aggregate;
        let mut entry = HistoryEntry::now(file, agg.page_count(), agg.success_count, agg.error_count);
        entry.elapsed_ms = agg.elapsed.as_millis() as u64;
        entry.output = Some(report.transcript_path.display().to_string());

        let ledger = Arc::clone(&self.ledger);
        let key = key.to_string();
        tokio::task::spawn_blocking(move || ledger.record(&key, entry))
            .await
            .map_err(|e| IngestError::Internal(format!("history commit task failed: {e}")))?
    }

    /// Move `task` to the directory of `route`. Returns whether it moved;
    /// a failed move is remembered for [`FilePool::pending_route`].
    pub async fn hand_off(&self, task: &DocumentTask, route: Route) -> bool {
        let dest_dir = match route {
            Route::Processed => &self.processed_dir,
            Route::Error => &self.error_dir,
        };
        let key = task.fingerprint.key();
        let moved = match move_to_dir(&task.path, dest_dir).await {
            Ok(dest) => {
                info!("{} → {}", task.file_name(), dest.display());
                true
            }
            Err(e) => {
                warn!("{}", e);
                false
            }
        };
        if let Ok(mut unmoved) = self.unmoved.lock() {
            if moved {
                unmoved.remove(&key);
            } else {
                unmoved.insert(key, route);
            }
        }
        moved
    }
}

/// Move `src` into `dest_dir`, keeping its name.
///
/// If the name is taken, a `_<microseconds>` suffix is added before the
/// extension. Falls back to copy + remove across file systems.
pub async fn move_to_dir(src: &Path, dest_dir: &Path) -> Result<PathBuf, IngestError> {
    let fail = |to: &Path, e: std::io::Error| IngestError::MoveFailed {
        from: src.to_path_buf(),
        to: to.to_path_buf(),
        source: e,
    };

    tokio::fs::create_dir_all(dest_dir)
        .await
        .map_err(|e| fail(dest_dir, e))?;

    let name = src.file_name().ok_or_else(|| {
        fail(
            dest_dir,
            std::io::Error::new(ErrorKind::InvalidInput, "source has no file name"),
        )
    })?;
    let mut dest = dest_dir.join(name);
    if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
        dest = dest_dir.join(suffixed_name(src, chrono::Utc::now().timestamp_micros()));
    }

    match tokio::fs::rename(src, &dest).await {
        Ok(()) => Ok(dest),
        Err(e) if e.kind() == ErrorKind::CrossesDevices => {
            tokio::fs::copy(src, &dest)
                .await
                .map_err(|e| fail(&dest, e))?;
            tokio::fs::remove_file(src)
                .await
                .map_err(|e| fail(&dest, e))?;
            Ok(dest)
        }
        Err(e) => Err(fail(&dest, e)),
    }
}

/// `scan.tif` → `scan_<suffix>.tif`.
fn suffixed_name(src: &Path, suffix: i64) -> String {
    let stem = src
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    match src.extension() {
        Some(ext) => format!("{}_{}.{}", stem, suffix, ext.to_string_lossy()),
        None => format!("{}_{}", stem, suffix),
    }
}
