//! Entry points: assemble the pipeline from an [`IngestConfig`].
//!
//! The default assembly uses [`TiffRasterizer`] and the `edgequake-llm`
//! backed collaborators from [`crate::pipeline::llm`]. The `*_with` variants
//! accept any [`Rasterizer`] / [`PageTranscriber`] / [`FieldExtractor`], which
//! is how tests drive the full scheduler without a model.

use crate::config::IngestConfig;
use crate::document::DocumentAggregator;
use crate::error::IngestError;
use crate::files::FilePool;
use crate::fingerprint::DocumentTask;
use crate::history::HistoryLedger;
use crate::output::{DocumentReport, TickOutcome};
use crate::pipeline::inference::{FieldExtractor, PageTranscriber};
use crate::pipeline::llm::{resolve_provider, LlmFieldExtractor, LlmTranscriber};
use crate::pipeline::raster::{Rasterizer, TiffRasterizer};
use crate::scheduler::BatchScheduler;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// The three external collaborators of the pipeline.
#[derive(Clone)]
pub struct Collaborators {
    pub rasterizer: Arc<dyn Rasterizer>,
    pub transcriber: Arc<dyn PageTranscriber>,
    pub extractor: Arc<dyn FieldExtractor>,
}

impl Collaborators {
    /// TIFF rasterizer plus the provider resolved from `config`.
    pub fn from_config(config: &IngestConfig) -> Result<Self, IngestError> {
        let provider = resolve_provider(config)?;
        info!(
            "Using provider={}, model={}",
            config.provider_name.as_deref().unwrap_or("auto"),
            config.model_name()
        );
        Ok(Self {
            rasterizer: Arc::new(TiffRasterizer),
            transcriber: Arc::new(LlmTranscriber::new(Arc::clone(&provider), config)),
            extractor: Arc::new(LlmFieldExtractor::new(provider, config)),
        })
    }
}

/// Build the Document Aggregator from explicit collaborators.
pub fn aggregator_with(config: &IngestConfig, parts: Collaborators) -> DocumentAggregator {
    DocumentAggregator::new(parts.rasterizer, parts.transcriber, parts.extractor, config)
}

/// Build the scheduler from explicit collaborators. Replays the history log.
pub fn scheduler_with(
    config: &IngestConfig,
    parts: Collaborators,
) -> Result<BatchScheduler, IngestError> {
    let ledger = Arc::new(HistoryLedger::open_file(&config.history_path)?);
    let aggregator = Arc::new(aggregator_with(config, parts));
    let pool = FilePool::new(aggregator, ledger, config);
    Ok(BatchScheduler::new(pool, config))
}

/// Build the scheduler with the default collaborators.
pub fn scheduler(config: &IngestConfig) -> Result<BatchScheduler, IngestError> {
    scheduler_with(config, Collaborators::from_config(config)?)
}

/// Run a single tick against the configured directories.
pub async fn run_once(config: &IngestConfig) -> Result<TickOutcome, IngestError> {
    let scheduler = scheduler(config)?;
    scheduler.prepare().await?;
    let outcome = scheduler.tick().await;
    scheduler.pool().ledger().flush()?;
    Ok(outcome)
}

/// Process one file outside the hand-off protocol.
///
/// Artifacts go to `output_dir`; the file is neither moved nor recorded in
/// history.
pub async fn process_file(
    path: impl AsRef<Path>,
    output_dir: impl AsRef<Path>,
    config: &IngestConfig,
) -> Result<DocumentReport, IngestError> {
    let path = path.as_ref();
    let aggregator = aggregator_with(config, Collaborators::from_config(config)?);
    let task = {
        let owned = path.to_path_buf();
        let sample = config.fingerprint_sample_bytes;
        tokio::task::spawn_blocking(move || DocumentTask::discover(&owned, sample))
            .await
            .map_err(|e| IngestError::Internal(format!("discovery task failed: {e}")))??
    };
    aggregator.process_into(&task, output_dir.as_ref()).await
}
