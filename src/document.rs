//! Document Aggregator: from one input file to its transcript and record.
//!
//! ## Steps
//!
//! 1. Reject files above the size limit before any page work.
//! 2. Count pages and run them through the Page Pool.
//! 3. Join the successful page texts in page order.
//! 4. Extract fields under the extraction retry policy. If that fails for
//!    good, or no page produced text, the record is the extractor's empty
//!    schema plus an `_error` key.
//! 5. [`DocumentAggregator::process`] also writes the artifacts.
//!
//! Page failures never fail the document. Only the size check, an
//! undecodable container, and artifact I/O return `Err`.

use crate::artifacts::write_artifacts;
use crate::config::IngestConfig;
use crate::error::IngestError;
use crate::fingerprint::DocumentTask;
use crate::output::{DocumentAggregate, DocumentReport};
use crate::pipeline::inference::{FieldExtractor, PageTranscriber};
use crate::pipeline::page::PageProcessor;
use crate::pipeline::raster::Rasterizer;
use crate::progress::ProgressCallback;
use crate::retry::RetryPolicy;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Key added to the record when fields could not be extracted.
pub const EXTRACTION_ERROR_KEY: &str = "_error";

pub struct DocumentAggregator {
    pages: PageProcessor,
    extractor: Arc<dyn FieldExtractor>,
    extraction_policy: RetryPolicy,
    max_file_size_mb: u64,
    output_dir: PathBuf,
    model: String,
    progress: Option<ProgressCallback>,
}

impl DocumentAggregator {
    pub fn new(
        rasterizer: Arc<dyn Rasterizer>,
        transcriber: Arc<dyn PageTranscriber>,
        extractor: Arc<dyn FieldExtractor>,
        config: &IngestConfig,
    ) -> Self {
        Self {
            pages: PageProcessor::new(rasterizer, transcriber, config),
            extractor,
            extraction_policy: RetryPolicy::for_extraction(config),
            max_file_size_mb: config.max_file_size_mb,
            output_dir: config.output_dir.clone(),
            model: config.model_name().to_string(),
            progress: config.progress_callback.clone(),
        }
    }

    /// Process `task` and write its artifacts to the configured output directory.
    pub async fn process(&self, task: &DocumentTask) -> Result<DocumentReport, IngestError> {
        self.process_into(task, &self.output_dir).await
    }

    /// Process `task` and write its artifacts to `output_dir`.
    pub async fn process_into(
        &self,
        task: &DocumentTask,
        output_dir: &Path,
    ) -> Result<DocumentReport, IngestError> {
        let aggregate = self.aggregate(task).await?;
        let (transcript_path, record_path) =
            write_artifacts(output_dir, &task.path, &self.model, &aggregate).await?;
        info!(
            "{}: transcript → {}",
            task.file_name(),
            transcript_path.display()
        );
        Ok(DocumentReport {
            aggregate,
            transcript_path,
            record_path,
        })
    }

    /// Run every page and the field extraction, without writing anything.
    pub async fn aggregate(&self, task: &DocumentTask) -> Result<DocumentAggregate, IngestError> {
        let start = Instant::now();
        let file = task.file_name();

        // ── Step 1: size check ──────────────────────────────────────────
        let size_mb = task.size as f64 / (1024.0 * 1024.0);
        if size_mb > self.max_file_size_mb as f64 {
            return Err(IngestError::FileTooLarge {
                path: task.path.clone(),
                size_mb,
                max_mb: self.max_file_size_mb,
            });
        }

        // ── Step 2: page pool ───────────────────────────────────────────
        let total = self.page_count(&task.path).await?;
        info!(
            "{}: {} pages, {:.1} MB, model {}",
            file, total, size_mb, self.model
        );
        if let Some(ref cb) = self.progress {
            cb.on_document_start(file, total);
        }

        let pages = self.pages.process_pages(&task.path, file, total).await;
        let success_count = pages.iter().filter(|p| p.success).count();
        let error_count = pages.len() - success_count;

        if let Some(ref cb) = self.progress {
            cb.on_document_complete(file, total, success_count);
        }

        // ── Step 3: join ────────────────────────────────────────────────
        let text = pages
            .iter()
            .filter(|p| p.success)
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        // ── Step 4: field extraction ────────────────────────────────────
        let fields = if success_count == 0 {
            self.failed_record("no text was extracted from any page")
        } else {
            self.extract(file, &text).await
        };

        let elapsed = start.elapsed();
        info!(
            "{}: {} ok, {} failed in {:.1}s",
            file,
            success_count,
            error_count,
            elapsed.as_secs_f32()
        );

        Ok(DocumentAggregate {
            pages,
            text,
            fields,
            success_count,
            error_count,
            elapsed,
        })
    }

    async fn page_count(&self, path: &Path) -> Result<usize, IngestError> {
        let rasterizer = Arc::clone(self.pages.rasterizer());
        let owned = path.to_path_buf();
        let total = tokio::task::spawn_blocking(move || rasterizer.page_count(&owned))
            .await
            .map_err(|e| IngestError::Internal(format!("page count task failed: {e}")))??;
        if total == 0 {
            return Err(IngestError::DecodeFailed {
                path: path.to_path_buf(),
                detail: "document has no pages".into(),
            });
        }
        Ok(total)
    }

    async fn extract(&self, file: &str, text: &str) -> Map<String, Value> {
        let label = format!("{} fields", file);
        let extractor = &self.extractor;
        match self
            .extraction_policy
            .run(&label, |_attempt| extractor.extract_fields(text))
            .await
        {
            Ok(fields) => fields,
            Err(exhausted) => {
                warn!("{}: field extraction failed: {}", file, exhausted);
                self.failed_record(&exhausted.last_error.message)
            }
        }
    }

    fn failed_record(&self, reason: &str) -> Map<String, Value> {
        let mut record = self.extractor.empty_record();
        record.insert(EXTRACTION_ERROR_KEY.into(), reason.into());
        record
    }
}
