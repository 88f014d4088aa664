//! # edgequake-ingest
//!
//! Watch a folder of scanned multi-page documents, transcribe every page with
//! a Vision Language Model, extract structured fields, and move each file
//! through a crash-recoverable `input → processed | error` lifecycle.
//!
//! ## Why this crate?
//!
//! Scanned correspondence arrives as multi-page TIFFs in a drop folder. Page
//! OCR through a vision model is slow, rate-limited and occasionally refused,
//! so the orchestration around it matters as much as the model: bounded
//! concurrency at file and page level, classified retries, per-page failure
//! isolation, and a durable history so nothing is processed twice after a
//! restart.
//!
//! ## Pipeline Overview
//!
//! ```text
//! Batch Scheduler   tick: list input/, catch up known files, cap the window
//!  └─ File Pool     per file: dedupe, aggregate, commit history, move
//!      └─ Document Aggregator   size check, pages, join, field extraction
//!          └─ Page Pool         pull-based workers over page indices
//!              └─ Page Processor   rasterise → transcribe → classify
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_ingest::{ingest, IngestConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / ...
//!     let config = IngestConfig::builder().base_dir("/srv/scans").build()?;
//!     let scheduler = ingest::scheduler(&config)?;
//!     scheduler
//!         .run_until(async { tokio::signal::ctrl_c().await.unwrap_or(()) })
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `edgequake-ingest` binary (clap + anyhow + tracing-subscriber + indicatif) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod artifacts;
pub mod config;
pub mod document;
pub mod error;
pub mod files;
pub mod fingerprint;
pub mod history;
pub mod ingest;
pub mod output;
pub mod pipeline;
pub mod pool;
pub mod progress;
pub mod prompts;
pub mod retry;
pub mod scheduler;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{IngestConfig, IngestConfigBuilder};
pub use document::DocumentAggregator;
pub use error::{IngestError, PageError};
pub use files::{move_to_dir, FilePool};
pub use fingerprint::{DocumentTask, Fingerprint};
pub use history::{DurableLog, HistoryEntry, HistoryLedger, JsonLinesLog, LogRecord};
pub use ingest::{process_file, run_once, Collaborators};
pub use output::{
    BatchReport, DocumentAggregate, DocumentReport, FileOutcome, PageResult, Route, TickOutcome,
};
pub use pipeline::inference::{FieldExtractor, InferenceError, PageTranscriber};
pub use pipeline::raster::{Rasterizer, TiffRasterizer};
pub use progress::{IngestProgress, NoopProgress, ProgressCallback};
pub use retry::{ErrorClass, RetryDecision, RetryPolicy};
pub use scheduler::BatchScheduler;
