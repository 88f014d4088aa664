//! End-to-end tests of the scheduler → file pool → aggregator → page pool
//! chain, with deterministic doubles for the rasterizer and the model.
//!
//! Scans are plain text files: `pages=N` on the first line, anything else
//! after it. The fake rasterizer hands the transcriber `"<file id>#<page>"`
//! so a test can decide per file and page how the "model" behaves.

use async_trait::async_trait;
use edgequake_ingest::ingest::{aggregator_with, scheduler_with, Collaborators};
use edgequake_ingest::{
    BatchReport, BatchScheduler, DocumentTask, DurableLog, ErrorClass, FieldExtractor, FilePool,
    FileOutcome, HistoryEntry, HistoryLedger, IngestConfig, IngestConfigBuilder, IngestError,
    InferenceError, LogRecord, PageTranscriber, Rasterizer, RetryDecision, RetryPolicy,
    TickOutcome,
};
use rand::Rng;
use serde_json::{Map, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// ── Doubles ──────────────────────────────────────────────────────────────────

struct TextScans;

impl TextScans {
    fn header(path: &Path) -> Result<(String, usize), IngestError> {
        let body = std::fs::read_to_string(path).map_err(|e| IngestError::ReadFailed {
            path: path.to_path_buf(),
            source: e,
        })?;
        let pages = body
            .lines()
            .next()
            .and_then(|l| l.strip_prefix("pages="))
            .and_then(|n| n.trim().parse().ok())
            .ok_or_else(|| IngestError::DecodeFailed {
                path: path.to_path_buf(),
                detail: "missing pages= header".into(),
            })?;
        let id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok((id, pages))
    }
}

impl Rasterizer for TextScans {
    fn page_count(&self, path: &Path) -> Result<usize, IngestError> {
        Ok(Self::header(path)?.1)
    }

    fn rasterize(&self, path: &Path, page_index: usize, _w: u32) -> Result<Vec<u8>, IngestError> {
        let (id, _) = Self::header(path)?;
        Ok(format!("{}#{}", id, page_index + 1).into_bytes())
    }
}

#[derive(Clone, Copy)]
enum Reply {
    Text,
    Fail,
    RateLimited,
    Panic,
}

type Rule = dyn Fn(&str, usize) -> Reply + Send + Sync;

struct FakeModel {
    rule: Box<Rule>,
    max_latency_ms: u64,
    calls: AtomicUsize,
}

impl FakeModel {
    fn new(rule: impl Fn(&str, usize) -> Reply + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            rule: Box::new(rule),
            max_latency_ms: 0,
            calls: AtomicUsize::new(0),
        })
    }

    fn ok() -> Arc<Self> {
        Self::new(|_, _| Reply::Text)
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageTranscriber for FakeModel {
    async fn transcribe(&self, png: &[u8], page_num: usize) -> Result<String, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.max_latency_ms > 0 {
            let ms = rand::thread_rng().gen_range(0..=self.max_latency_ms);
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        let tag = String::from_utf8_lossy(png).into_owned();
        let id = tag.split('#').next().unwrap_or_default();
        match (self.rule)(id, page_num) {
            Reply::Text => Ok(format!("text of {tag}")),
            Reply::Fail => Err(InferenceError::transient("HTTP 503")),
            Reply::RateLimited => Err(InferenceError::rate_limited("HTTP 429")),
            Reply::Panic => panic!("model double exploded on {tag}"),
        }
    }
}

struct FakeExtractor;

#[async_trait]
impl FieldExtractor for FakeExtractor {
    async fn extract_fields(&self, text: &str) -> Result<Map<String, Value>, InferenceError> {
        let mut m = Map::new();
        m.insert("document_type".into(), "letter".into());
        m.insert("chars".into(), text.len().into());
        Ok(m)
    }
}

/// History log whose appends always fail.
struct FullDisk;

impl DurableLog for FullDisk {
    fn replay(&self) -> Result<Vec<LogRecord>, IngestError> {
        Ok(Vec::new())
    }

    fn append(&self, _: &LogRecord) -> Result<(), IngestError> {
        Err(IngestError::HistoryIo {
            path: PathBuf::from("history.jsonl"),
            source: std::io::Error::new(std::io::ErrorKind::Other, "no space left"),
        })
    }

    fn flush(&self) -> Result<(), IngestError> {
        Ok(())
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

struct Harness {
    _dir: TempDir,
    config: IngestConfig,
    model: Arc<FakeModel>,
    scheduler: BatchScheduler,
}

impl Harness {
    fn new(model: Arc<FakeModel>, tweak: impl FnOnce(IngestConfigBuilder) -> IngestConfigBuilder) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let builder = IngestConfig::builder()
            .base_dir(dir.path())
            .extensions(["tif"])
            .max_attempts(2)
            .retry_delay_ms(1)
            .page_timeout_secs(5)
            .page_concurrency(3);
        let config = tweak(builder).build().unwrap();
        let scheduler = Self::scheduler(&config, &model);
        std::fs::create_dir_all(&config.input_dir).unwrap();
        Self {
            _dir: dir,
            config,
            model,
            scheduler,
        }
    }

    fn parts(model: &Arc<FakeModel>) -> Collaborators {
        Collaborators {
            rasterizer: Arc::new(TextScans),
            transcriber: model.clone(),
            extractor: Arc::new(FakeExtractor),
        }
    }

    fn scheduler(config: &IngestConfig, model: &Arc<FakeModel>) -> BatchScheduler {
        scheduler_with(config, Self::parts(model)).unwrap()
    }

    /// Replace the error directory with a plain file so moves into it fail.
    fn break_error_dir(&self) {
        std::fs::create_dir_all(&self.config.error_dir).unwrap();
        std::fs::remove_dir(&self.config.error_dir).unwrap();
        std::fs::write(&self.config.error_dir, b"not a directory").unwrap();
    }

    fn repair_error_dir(&self) {
        std::fs::remove_file(&self.config.error_dir).unwrap();
        std::fs::create_dir(&self.config.error_dir).unwrap();
    }

    /// Simulate a restart: a fresh scheduler over the same directories.
    fn restart(&mut self) {
        self.scheduler = Self::scheduler(&self.config, &self.model);
    }

    fn drop_scan(&self, name: &str, pages: usize) -> PathBuf {
        let path = self.config.input_dir.join(name);
        std::fs::write(&path, format!("pages={pages}\nbody of {name}\n")).unwrap();
        path
    }

    fn names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .map(|rd| {
                rd.map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    fn input(&self) -> Vec<String> {
        Self::names(&self.config.input_dir)
    }

    fn processed(&self) -> Vec<String> {
        Self::names(&self.config.processed_dir)
    }

    fn errors(&self) -> Vec<String> {
        Self::names(&self.config.error_dir)
    }

    fn transcript(&self, stem: &str) -> String {
        std::fs::read_to_string(self.config.output_dir.join(format!("{stem}_ocr.txt"))).unwrap()
    }

    fn record(&self, stem: &str) -> Value {
        let bytes = std::fs::read(self.config.output_dir.join(format!("{stem}_data.json"))).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn history_lines(&self) -> usize {
        std::fs::read_to_string(&self.config.history_path)
            .map(|s| s.lines().filter(|l| !l.trim().is_empty()).count())
            .unwrap_or(0)
    }

    async fn tick(&self) -> TickOutcome {
        self.scheduler.prepare().await.unwrap();
        self.scheduler.tick().await
    }
}

fn ran(outcome: TickOutcome) -> BatchReport {
    match outcome {
        TickOutcome::Ran(report) => report,
        other => panic!("expected a batch to run, got {other:?}"),
    }
}

// ── Ordering ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn transcript_lists_pages_in_order_despite_random_latency() {
    let mut model = FakeModel::new(|_, _| Reply::Text);
    Arc::get_mut(&mut model).unwrap().max_latency_ms = 15;
    let h = Harness::new(model, |b| b.page_concurrency(4));
    h.drop_scan("long.tif", 9);

    let report = ran(h.tick().await);
    assert_eq!(report.completed(), 1);

    let transcript = h.transcript("long");
    let mut last = 0;
    for page in 1..=9 {
        let at = transcript
            .find(&format!("PAGE {page} / 9\n"))
            .unwrap_or_else(|| panic!("page {page} missing"));
        assert!(at > last, "page {page} out of order");
        last = at;
        assert!(transcript.contains(&format!("text of long#{page}")));
    }
}

// ── Idempotence ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn same_file_twice_is_recorded_once_and_not_reprocessed() {
    let h = Harness::new(FakeModel::ok(), |b| b);
    h.drop_scan("memo.tif", 2);
    ran(h.tick().await);
    assert_eq!(h.model.calls(), 2);
    assert_eq!(h.processed(), ["memo.tif"]);

    // The same scan shows up again.
    h.drop_scan("memo.tif", 2);
    let outcome = h.tick().await;
    assert_eq!(outcome, TickOutcome::Idle { caught_up: 1 });
    assert_eq!(h.model.calls(), 2, "aggregator must not run again");
    assert_eq!(h.history_lines(), 1);
    assert!(h.input().is_empty());
    assert_eq!(h.processed().len(), 2, "collision gets a suffixed name");
}

#[tokio::test]
async fn file_pool_skips_known_task_without_processing() {
    let h = Harness::new(FakeModel::ok(), |b| b);
    let path = h.drop_scan("known.tif", 1);
    let task = DocumentTask::discover(&path, h.config.fingerprint_sample_bytes).unwrap();
    h.scheduler
        .pool()
        .ledger()
        .record(&task.fingerprint.key(), HistoryEntry::now("known.tif", 1, 1, 0))
        .unwrap();

    let report = h.scheduler.pool().run(std::slice::from_ref(&task)).await;
    assert_eq!(
        report.outcomes,
        [FileOutcome::Skipped {
            file: "known.tif".into()
        }]
    );
    assert_eq!(h.model.calls(), 0);
    assert_eq!(h.processed(), ["known.tif"]);
}

// ── Partial and total failure ────────────────────────────────────────────────

#[tokio::test]
async fn partial_failure_is_processed_with_complete_transcript() {
    let h = Harness::new(
        FakeModel::new(|_, page| if page == 2 { Reply::Fail } else { Reply::Text }),
        |b| b,
    );
    h.drop_scan("partial.tif", 3);

    let report = ran(h.tick().await);
    assert_eq!(
        report.outcomes,
        [FileOutcome::Completed {
            file: "partial.tif".into(),
            pages: 3,
            success: 2,
            errors: 1
        }]
    );
    assert_eq!(h.processed(), ["partial.tif"]);
    assert!(h.errors().is_empty());

    let transcript = h.transcript("partial");
    assert_eq!(transcript.matches("PAGE ").count(), 3);
    assert!(transcript.contains("[ERROR] page 2: "));
    assert!(transcript.contains("Success: 2 | Errors: 1"));

    let record = h.record("partial");
    assert_eq!(record["success"], 2);
    assert_eq!(record["errors"], 1);
    assert_eq!(record["total_pages"], 3);
    assert_eq!(record["source_file"], "partial.tif");
    assert_eq!(record["document_type"], "letter");
    assert!(record.get("_error").is_none());
    assert_eq!(h.history_lines(), 1);
}

#[tokio::test]
async fn total_failure_goes_to_error_and_is_retried_later() {
    let h = Harness::new(FakeModel::new(|_, _| Reply::Fail), |b| b);
    h.drop_scan("dead.tif", 2);

    let report = ran(h.tick().await);
    assert_eq!(report.failed(), 1);
    assert_eq!(h.errors(), ["dead.tif"]);
    assert!(h.processed().is_empty());
    assert_eq!(h.history_lines(), 0);
    assert!(h.scheduler.pool().ledger().is_empty());
    let calls_after_first = h.model.calls();
    assert_eq!(calls_after_first, 4, "2 pages × 2 attempts");

    // An operator puts the file back: it is not known, so it runs again.
    std::fs::rename(
        h.config.error_dir.join("dead.tif"),
        h.config.input_dir.join("dead.tif"),
    )
    .unwrap();
    let report = ran(h.tick().await);
    assert_eq!(report.failed(), 1);
    assert!(h.model.calls() > calls_after_first);

    let record = h.record("dead");
    assert_eq!(record["success"], 0);
    assert!(record["_error"].is_string());
}

#[tokio::test]
async fn panicking_document_is_isolated() {
    let h = Harness::new(
        FakeModel::new(|id, _| if id == "boom" { Reply::Panic } else { Reply::Text }),
        |b| b.file_concurrency(2),
    );
    h.drop_scan("boom.tif", 1);
    h.drop_scan("fine.tif", 1);

    let report = ran(h.tick().await);
    assert_eq!(report.completed(), 1);
    assert_eq!(report.failed(), 1);
    assert_eq!(h.errors(), ["boom.tif"]);
    assert_eq!(h.processed(), ["fine.tif"]);
    assert!(matches!(report.outcomes[0], FileOutcome::Failed { .. }));
    assert!(h
        .transcript("boom")
        .contains("[ERROR] page 1: processing panicked: model double exploded on boom#1"));
}

#[tokio::test]
async fn panicking_page_spares_its_siblings() {
    let h = Harness::new(
        FakeModel::new(|_, page| if page == 2 { Reply::Panic } else { Reply::Text }),
        |b| b,
    );
    h.drop_scan("mixed.tif", 3);

    let report = ran(h.tick().await);
    assert_eq!(
        report.outcomes,
        [FileOutcome::Completed {
            file: "mixed.tif".into(),
            pages: 3,
            success: 2,
            errors: 1
        }]
    );
    assert_eq!(h.processed(), ["mixed.tif"]);
    assert!(h.errors().is_empty());
    assert_eq!(h.history_lines(), 1);

    let transcript = h.transcript("mixed");
    assert!(transcript.contains("text of mixed#1"));
    assert!(transcript.contains("[ERROR] page 2: processing panicked: model double exploded on mixed#2"));
    assert!(transcript.contains("text of mixed#3"));
}

#[tokio::test]
async fn history_commit_failure_routes_file_to_error() {
    let h = Harness::new(FakeModel::ok(), |b| b);
    h.scheduler.prepare().await.unwrap();
    let ledger = Arc::new(HistoryLedger::open(Box::new(FullDisk)).unwrap());
    let aggregator = Arc::new(aggregator_with(&h.config, Harness::parts(&h.model)));
    let pool = FilePool::new(aggregator, Arc::clone(&ledger), &h.config);

    let path = h.drop_scan("unlogged.tif", 1);
    let task = DocumentTask::discover(&path, h.config.fingerprint_sample_bytes).unwrap();
    let report = pool.run(std::slice::from_ref(&task)).await;

    match &report.outcomes[..] {
        [FileOutcome::Failed { file, reason }] => {
            assert_eq!(file, "unlogged.tif");
            assert!(reason.contains("history commit failed"), "{reason}");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(report.move_failures, 0);
    assert_eq!(h.errors(), ["unlogged.tif"]);
    assert!(h.processed().is_empty());
    assert!(!ledger.is_known(&task.fingerprint.key()));
    assert!(ledger.is_empty());
}

#[tokio::test]
async fn oversized_file_never_reaches_the_model() {
    let h = Harness::new(FakeModel::ok(), |b| b.max_file_size_mb(0));
    h.drop_scan("huge.tif", 1);

    let report = ran(h.tick().await);
    assert_eq!(report.failed(), 1);
    assert_eq!(h.model.calls(), 0);
    assert_eq!(h.errors(), ["huge.tif"]);
}

// ── Batch cap ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn batch_cap_defers_the_rest() {
    let h = Harness::new(FakeModel::ok(), |b| b.max_batch_size(2));
    for i in 1..=5 {
        h.drop_scan(&format!("doc{i}.tif"), 1);
    }

    let report = ran(h.tick().await);
    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(report.deferred, 3);
    assert_eq!(h.processed(), ["doc1.tif", "doc2.tif"]);
    assert_eq!(h.input(), ["doc3.tif", "doc4.tif", "doc5.tif"]);

    let report = ran(h.tick().await);
    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(report.deferred, 1);
    assert_eq!(h.input(), ["doc5.tif"]);
}

#[tokio::test]
async fn extension_match_ignores_case() {
    let h = Harness::new(FakeModel::ok(), |b| b);
    h.drop_scan("LOUD.TIF", 1);

    let report = ran(h.tick().await);
    assert_eq!(report.completed(), 1);
    assert_eq!(h.processed(), ["LOUD.TIF"]);
}

#[tokio::test]
async fn non_matching_files_are_ignored() {
    let h = Harness::new(FakeModel::ok(), |b| b);
    h.drop_scan("notes.txt", 1);
    std::fs::create_dir_all(h.config.input_dir.join("nested.tif")).unwrap();

    assert_eq!(h.tick().await, TickOutcome::Idle { caught_up: 0 });
    assert_eq!(h.input(), ["nested.tif", "notes.txt"]);
}

// ── Failed hand-off ──────────────────────────────────────────────────────────

#[tokio::test]
async fn failed_move_does_not_stop_sibling_files() {
    let h = Harness::new(
        FakeModel::new(|id, _| if id == "dead" { Reply::Fail } else { Reply::Text }),
        |b| b.file_concurrency(2),
    );
    h.scheduler.prepare().await.unwrap();
    h.break_error_dir();
    h.drop_scan("dead.tif", 1);
    h.drop_scan("good.tif", 2);

    let report = ran(h.scheduler.tick().await);
    assert_eq!(report.completed(), 1);
    assert_eq!(report.failed(), 1);
    assert_eq!(report.move_failures, 1);
    assert_eq!(h.processed(), ["good.tif"]);
    assert_eq!(h.input(), ["dead.tif"]);
    assert_eq!(h.history_lines(), 1);
}

#[tokio::test]
async fn failed_move_to_error_is_retried_without_reprocessing() {
    let h = Harness::new(FakeModel::new(|_, _| Reply::Fail), |b| b);
    h.scheduler.prepare().await.unwrap();
    h.break_error_dir();
    h.drop_scan("dead.tif", 1);

    let report = ran(h.scheduler.tick().await);
    assert_eq!(report.failed(), 1);
    assert_eq!(report.move_failures, 1);
    assert_eq!(h.model.calls(), 2, "1 page × 2 attempts");
    assert_eq!(h.input(), ["dead.tif"]);

    // The move still fails, but the document is not transcribed again.
    assert_eq!(h.scheduler.tick().await, TickOutcome::Idle { caught_up: 0 });
    assert_eq!(h.model.calls(), 2);
    assert_eq!(h.input(), ["dead.tif"]);

    h.repair_error_dir();
    assert_eq!(h.scheduler.tick().await, TickOutcome::Idle { caught_up: 1 });
    assert_eq!(h.model.calls(), 2);
    assert!(h.input().is_empty());
    assert_eq!(h.errors(), ["dead.tif"]);
    assert_eq!(h.history_lines(), 0);
}

// ── Single flight ────────────────────────────────────────────────────────────

#[tokio::test]
async fn overlapping_tick_is_a_no_op() {
    let h = Harness::new(FakeModel::ok(), |b| b);
    h.scheduler.prepare().await.unwrap();
    h.drop_scan("one.tif", 1);

    let (first, second) = tokio::join!(h.scheduler.tick(), h.scheduler.tick());
    assert!(matches!(first, TickOutcome::Ran(_)));
    assert_eq!(second, TickOutcome::Skipped);
    assert_eq!(h.model.calls(), 1);
}

#[tokio::test]
async fn run_until_stops_on_shutdown_after_finishing_work() {
    let h = Harness::new(FakeModel::ok(), |b| b.watch_interval_ms(10));
    h.drop_scan("watched.tif", 1);

    let shutdown = tokio::time::sleep(Duration::from_millis(150));
    tokio::time::timeout(Duration::from_secs(5), h.scheduler.run_until(shutdown))
        .await
        .expect("scheduler did not stop")
        .unwrap();
    assert_eq!(h.processed(), ["watched.tif"]);
}

// ── Crash recovery ───────────────────────────────────────────────────────────

#[tokio::test]
async fn restart_after_torn_history_write_keeps_good_entries() {
    let mut h = Harness::new(FakeModel::ok(), |b| b);
    for name in ["a.tif", "b.tif", "c.tif"] {
        h.drop_scan(name, 1);
    }
    ran(h.tick().await);
    assert_eq!(h.history_lines(), 3);

    // Crash mid-append.
    let mut log = std::fs::OpenOptions::new()
        .append(true)
        .open(&h.config.history_path)
        .unwrap();
    log.write_all(br#"{"key":"d.tif::9::ab","data":{"recorded_at":"2024"#)
        .unwrap();
    drop(log);

    h.restart();
    assert_eq!(h.scheduler.pool().ledger().len(), 3);

    // A previously processed scan reappears: caught up, not reprocessed.
    let calls = h.model.calls();
    h.drop_scan("b.tif", 1);
    assert_eq!(h.tick().await, TickOutcome::Idle { caught_up: 1 });
    assert_eq!(h.model.calls(), calls);

    // New work still lands in a readable log.
    h.drop_scan("e.tif", 1);
    ran(h.tick().await);
    h.restart();
    assert_eq!(h.scheduler.pool().ledger().len(), 4);
}

#[test]
fn ledger_replay_skips_corrupt_tail() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.jsonl");
    let mut body = String::new();
    for i in 0..5 {
        let record = serde_json::json!({
            "key": format!("f{i}.tif::10::00"),
            "data": HistoryEntry::now(format!("f{i}.tif"), 1, 1, 0),
        });
        body.push_str(&record.to_string());
        body.push('\n');
    }
    body.push_str("{\"key\":\"f5.tif::10::00\",\"da");
    std::fs::write(&path, body).unwrap();

    let ledger = HistoryLedger::open_file(&path).unwrap();
    assert_eq!(ledger.len(), 5);
    assert!(ledger.is_known("f4.tif::10::00"));
    assert!(!ledger.is_known("f5.tif::10::00"));
}

// ── Backoff ──────────────────────────────────────────────────────────────────

#[test]
fn rate_limit_wait_grows_with_every_attempt() {
    let config = IngestConfig::builder()
        .max_attempts(5)
        .retry_delay_ms(200)
        .build()
        .unwrap();
    for policy in [RetryPolicy::for_pages(&config), RetryPolicy::for_extraction(&config)] {
        let mut previous = Duration::ZERO;
        for k in 1..policy.max_attempts() {
            match policy.decide(k, ErrorClass::RateLimited) {
                RetryDecision::RetryAfter(wait) => {
                    assert!(wait > previous);
                    assert!(wait >= config.retry_delay());
                    previous = wait;
                }
                RetryDecision::GiveUp => panic!("gave up early at attempt {k}"),
            }
        }
        assert_eq!(
            policy.decide(policy.max_attempts(), ErrorClass::RateLimited),
            RetryDecision::GiveUp
        );
    }
}

#[tokio::test]
async fn rate_limited_pages_use_the_full_attempt_budget() {
    let h = Harness::new(
        FakeModel::new(|_, _| Reply::RateLimited),
        |b| b.max_attempts(3),
    );
    h.drop_scan("throttled.tif", 1);
    let report = ran(h.tick().await);
    assert_eq!(report.failed(), 1);
    assert_eq!(h.model.calls(), 3);
    assert!(h.transcript("throttled").contains("after 3 attempts"));
}
