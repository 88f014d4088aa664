//! Batch Scheduler: the top-level control loop.
//!
//! Each tick lists the input directory, finishes the hand-off of files that
//! need no processing (known to history, or an earlier move to `error/` that
//! failed), caps the remaining candidates to
//! `max_batch_size` and hands that window to the [`FilePool`]. Files beyond
//! the cap stay in the input directory and are picked up by a later tick.
//!
//! A tick never overlaps another: [`BatchScheduler::tick`] claims an atomic
//! in-flight flag and returns [`TickOutcome::Skipped`] if it is already set.
//! [`BatchScheduler::run_until`] drives ticks from an interval timer and stops
//! on a shutdown future; the tick in progress is allowed to finish and the
//! history log is flushed before it returns.

use crate::config::IngestConfig;
use crate::error::IngestError;
use crate::files::FilePool;
use crate::fingerprint::DocumentTask;
use crate::output::{BatchReport, TickOutcome};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::{interval, MissedTickBehavior};
use tokio_stream::wrappers::ReadDirStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

pub struct BatchScheduler {
    pool: FilePool,
    config: IngestConfig,
    in_flight: AtomicBool,
}

/// Clears the in-flight flag when the tick ends, however it ends.
struct TickGuard<'a>(&'a AtomicBool);

impl<'a> TickGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TickGuard(flag))
    }
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl BatchScheduler {
    pub fn new(pool: FilePool, config: &IngestConfig) -> Self {
        Self {
            pool,
            config: config.clone(),
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn pool(&self) -> &FilePool {
        &self.pool
    }

    /// Create the four hand-off directories if they are missing.
    pub async fn prepare(&self) -> Result<(), IngestError> {
        let c = &self.config;
        for dir in [&c.input_dir, &c.output_dir, &c.processed_dir, &c.error_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| IngestError::OutputWriteFailed {
                    path: dir.clone(),
                    source: e,
                })?;
        }
        Ok(())
    }

    /// Run one batch. Never fails; problems are logged and reported.
    pub async fn tick(&self) -> TickOutcome {
        let Some(_guard) = TickGuard::acquire(&self.in_flight) else {
            debug!("Previous tick still running, skipping");
            return TickOutcome::Skipped;
        };

        let candidates = match self.list_candidates().await {
            Ok(c) => c,
            Err(e) => {
                error!("Cannot list {}: {}", self.config.input_dir.display(), e);
                return TickOutcome::Idle { caught_up: 0 };
            }
        };
        if candidates.is_empty() {
            return TickOutcome::Idle { caught_up: 0 };
        }

        let tasks = self.discover(candidates).await;

        // ── Catch-up: files an earlier tick did not get to move ──────────
        let mut caught_up = 0;
        let mut catch_up_move_failures = 0;
        let mut pending = Vec::with_capacity(tasks.len());
        for task in tasks {
            match self.pool.pending_route(&task) {
                Some(route) => {
                    if self.pool.hand_off(&task, route).await {
                        info!("{}: caught up, moved without processing", task.file_name());
                        caught_up += 1;
                    } else {
                        catch_up_move_failures += 1;
                    }
                }
                None => pending.push(task),
            }
        }

        if pending.is_empty() {
            if catch_up_move_failures > 0 {
                warn!(
                    "{} file(s) could not be moved and stay in the input directory",
                    catch_up_move_failures
                );
            }
            return TickOutcome::Idle { caught_up };
        }

        // ── Batch window ────────────────────────────────────────────────
        let deferred = pending.len().saturating_sub(self.config.max_batch_size);
        pending.truncate(self.config.max_batch_size);
        info!(
            "Batch: {} file(s) to process, {} deferred to a later tick",
            pending.len(),
            deferred
        );

        let mut report = self.pool.run(&pending).await;
        report.caught_up = caught_up;
        report.deferred = deferred;
        report.move_failures += catch_up_move_failures;
        log_report(&report);
        TickOutcome::Ran(report)
    }

    /// Tick every `watch_interval` until `shutdown` resolves.
    ///
    /// A tick in progress when `shutdown` fires runs to completion; no new
    /// tick starts afterwards. The history log is flushed before returning.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), IngestError>
    where
        F: Future<Output = ()>,
    {
        self.prepare().await?;
        info!(
            "Watching {} every {}ms (batch ≤ {})",
            self.config.input_dir.display(),
            self.config.watch_interval_ms,
            self.config.max_batch_size
        );

        let mut timer = interval(self.config.watch_interval());
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping scheduler");
                    break;
                }
                _ = timer.tick() => {
                    self.tick().await;
                }
            }
        }

        self.pool.ledger().flush()
    }

    /// Regular files in the input directory with an accepted extension, by name.
    async fn list_candidates(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut entries = ReadDirStream::new(tokio::fs::read_dir(&self.config.input_dir).await?);
        let mut files = Vec::new();
        while let Some(entry) = entries.next().await {
            let entry = entry?;
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let path = entry.path();
            let accepted = path
                .extension()
                .is_some_and(|ext| self.config.accepts_extension(&ext.to_string_lossy()));
            if accepted {
                files.push(path);
            }
        }
        files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(files)
    }

    /// Fingerprint candidates off the async runtime. Files that vanish or
    /// cannot be read are skipped for this tick.
    async fn discover(&self, candidates: Vec<PathBuf>) -> Vec<DocumentTask> {
        let sample = self.config.fingerprint_sample_bytes;
        let found = tokio::task::spawn_blocking(move || {
            candidates
                .into_iter()
                .map(|path| DocumentTask::discover(&path, sample))
                .collect::<Vec<_>>()
        })
        .await;

        match found {
            Ok(results) => results
                .into_iter()
                .filter_map(|r| r.map_err(|e| warn!("Skipping candidate: {}", e)).ok())
                .collect(),
            Err(e) => {
                error!("Fingerprinting task failed: {}", e);
                Vec::new()
            }
        }
    }
}

fn log_report(report: &BatchReport) {
    info!(
        "Batch done: {} completed, {} failed, {} skipped, {} caught up, {} deferred",
        report.completed(),
        report.failed(),
        report.skipped(),
        report.caught_up,
        report.deferred
    );
    if report.move_failures > 0 {
        warn!(
            "{} file(s) could not be moved and stay in the input directory",
            report.move_failures
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_is_single_flight_and_released_on_drop() {
        let flag = AtomicBool::new(false);
        let first = TickGuard::acquire(&flag);
        assert!(first.is_some());
        assert!(TickGuard::acquire(&flag).is_none());
        drop(first);
        assert!(TickGuard::acquire(&flag).is_some());
    }
}
