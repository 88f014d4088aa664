//! Progress-callback trait for per-page and per-document ingestion events.
//!
//! Inject an [`Arc<dyn IngestProgress>`] via
//! [`crate::config::IngestConfigBuilder::progress_callback`] to observe the
//! pipeline as it works: the `process` subcommand drives a terminal progress
//! bar from it, a service could forward events to a channel.
//!
//! # Example
//!
//! ```rust
//! use edgequake_ingest::{IngestConfig, IngestProgress};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct PageCounter(AtomicUsize);
//!
//! impl IngestProgress for PageCounter {
//!     fn on_page_complete(&self, _file: &str, _page: usize, _total: usize, _chars: usize) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//!
//! let config = IngestConfig::builder()
//!     .progress_callback(Arc::new(PageCounter(AtomicUsize::new(0))))
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the pipeline while documents are processed.
///
/// Pages of one document, and documents of one batch, are processed
/// concurrently, so every method may be called from several tasks at once.
/// All methods default to no-ops.
pub trait IngestProgress: Send + Sync {
    /// Called once the page count of `file` is known.
    fn on_document_start(&self, file: &str, total_pages: usize) {
        let _ = (file, total_pages);
    }

    /// Called before a page is rasterised. `page` is 1-indexed.
    fn on_page_start(&self, file: &str, page: usize, total_pages: usize) {
        let _ = (file, page, total_pages);
    }

    /// Called when a page was transcribed. `chars` is the transcript length.
    fn on_page_complete(&self, file: &str, page: usize, total_pages: usize, chars: usize) {
        let _ = (file, page, total_pages, chars);
    }

    /// Called when a page failed for good (render failure or retries spent).
    fn on_page_error(&self, file: &str, page: usize, total_pages: usize, error: &str) {
        let _ = (file, page, total_pages, error);
    }

    /// Called after every page of `file` has been attempted.
    fn on_document_complete(&self, file: &str, total_pages: usize, success_count: usize) {
        let _ = (file, total_pages, success_count);
    }
}

/// Default when no callback is configured.
pub struct NoopProgress;

impl IngestProgress for NoopProgress {}

/// Type stored in [`crate::config::IngestConfig`].
pub type ProgressCallback = Arc<dyn IngestProgress>;
