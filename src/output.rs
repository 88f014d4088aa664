//! Result types produced by the page, document, file and batch levels.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::time::Duration;

/// Outcome of one page. Failures are data, never `Err`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageResult {
    /// 0-based page index.
    pub page_index: usize,
    pub success: bool,
    /// Transcript, or the `[ERROR] page N: ...` placeholder.
    pub text: String,
    /// Size of the PNG sent to the model; 0 when rasterisation failed.
    pub image_bytes: usize,
}

impl PageResult {
    /// 1-based page number, as shown to humans.
    pub fn page_num(&self) -> usize {
        self.page_index + 1
    }
}

/// Everything known about a document after its pages and fields are in.
#[derive(Debug, Clone)]
pub struct DocumentAggregate {
    /// One result per page, in page order.
    pub pages: Vec<PageResult>,
    /// Successful page texts joined in page order.
    pub text: String,
    /// Extracted fields, or the empty record plus `_error`.
    pub fields: Map<String, Value>,
    pub success_count: usize,
    pub error_count: usize,
    pub elapsed: Duration,
}

impl DocumentAggregate {
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// At least one page succeeded: the document belongs in `processed`.
    pub fn is_usable(&self) -> bool {
        self.success_count > 0
    }
}

/// A processed document together with the artifacts written for it.
#[derive(Debug, Clone)]
pub struct DocumentReport {
    pub aggregate: DocumentAggregate,
    pub transcript_path: PathBuf,
    pub record_path: PathBuf,
}

/// Terminal directory a file was handed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Route {
    Processed,
    Error,
}

/// What happened to one file of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    /// Processed with at least one successful page and recorded in history.
    Completed {
        file: String,
        pages: usize,
        success: usize,
        errors: usize,
    },
    /// Routed to the error directory; not recorded.
    Failed { file: String, reason: String },
    /// Already in history when the worker picked it up.
    Skipped { file: String },
}

impl FileOutcome {
    pub fn file(&self) -> &str {
        match self {
            FileOutcome::Completed { file, .. }
            | FileOutcome::Failed { file, .. }
            | FileOutcome::Skipped { file } => file,
        }
    }

    pub fn route(&self) -> Route {
        match self {
            FileOutcome::Failed { .. } => Route::Error,
            _ => Route::Processed,
        }
    }
}

/// Summary of one scheduler tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub outcomes: Vec<FileOutcome>,
    /// Files moved without processing: known to history, or left behind by a
    /// failed move to `error/` on an earlier tick.
    pub caught_up: usize,
    /// Unknown candidates left for a later tick by the batch cap.
    pub deferred: usize,
    /// Hand-off moves that failed; those files stay in the input directory.
    pub move_failures: usize,
}

impl BatchReport {
    pub fn completed(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Completed { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Failed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Skipped { .. }))
    }

    fn count(&self, pred: impl Fn(&FileOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(o)).count()
    }
}

/// Result of one [`crate::scheduler::BatchScheduler::tick`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// A previous tick was still running; nothing was done.
    Skipped,
    /// No unknown candidates were found.
    Idle { caught_up: usize },
    /// A batch ran to completion.
    Ran(BatchReport),
}
