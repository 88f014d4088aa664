//! Error types for the edgequake-ingest library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`IngestError`]: **Per file**: the document cannot be processed at all
//!   (missing file, undecodable scan, file over the size limit, history or
//!   artifact I/O failure). The File Pool turns it into a routing decision:
//!   the file goes to the error directory and is not recorded in history.
//!
//! * [`PageError`]: **Per page**: a single page failed (decode glitch,
//!   inference attempts exhausted, a panic in its processing) but the rest of the document is fine. It
//!   never propagates as an `Err`; it is rendered into the page slot of
//!   [`crate::output::PageResult`] so the transcript stays complete.
//!
//! Nothing in the library propagates an error to the Batch Scheduler; it only
//! ever observes a finished tick.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that abort processing of one file (or invalidate configuration).
#[derive(Debug, Error)]
pub enum IngestError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Input file not found: '{path}'")]
    FileNotFound { path: PathBuf },

    /// Generic I/O failure while reading an input file.
    #[error("Failed to read '{path}': {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file exceeds the configured maximum size; it never reaches the page pool.
    #[error("File too large: '{path}' is {size_mb:.1} MB (limit: {max_mb} MB)")]
    FileTooLarge {
        path: PathBuf,
        size_mb: f64,
        max_mb: u64,
    },

    /// The image container could not be opened or has no pages.
    #[error("Cannot decode '{path}': {detail}")]
    DecodeFailed { path: PathBuf, detail: String },

    /// Requested page index exceeds the document's page count.
    #[error("Page {page} is out of range (document has {total} pages)")]
    PageOutOfRange { page: usize, total: usize },

    // ── LLM errors ────────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── History errors ────────────────────────────────────────────────────
    /// The durable history log could not be read or appended to.
    #[error("History log '{path}' I/O failed: {source}")]
    HistoryIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A history record could not be serialised.
    #[error("Failed to encode history record: {0}")]
    HistoryEncode(#[from] serde_json::Error),

    // ── Output errors ─────────────────────────────────────────────────────
    /// Could not create or write an output artifact.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A hand-off move between directories failed.
    #[error("Failed to move '{from}' to '{to}': {source}")]
    MoveFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error (poisoned lock, panicked task).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single page.
///
/// Its `Display` output is what lands in the transcript's page slot.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum PageError {
    /// Page rasterisation failed; not retried.
    #[error("[ERROR] page {page}: rasterisation failed: {detail}")]
    RenderFailed { page: usize, detail: String },

    /// Inference failed and the attempt budget is spent (or the error was terminal).
    #[error("[ERROR] page {page}: {detail} (after {attempts} attempts)")]
    InferenceFailed {
        page: usize,
        attempts: u32,
        detail: String,
    },

    /// Processing the page panicked.
    #[error("[ERROR] page {page}: processing panicked: {detail}")]
    Panicked { page: usize, detail: String },
}

impl PageError {
    /// 1-based page number the error belongs to.
    pub fn page(&self) -> usize {
        match self {
            PageError::RenderFailed { page, .. }
            | PageError::InferenceFailed { page, .. }
            | PageError::Panicked { page, .. } => *page,
        }
    }
}

/// Readable text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
