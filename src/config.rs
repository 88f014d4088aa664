//! Configuration for the ingestion orchestrator.
//!
//! All behaviour is controlled through [`IngestConfig`], built via its
//! [`IngestConfigBuilder`]. The library never reads environment variables for
//! these knobs; the binary maps its flags (and their env fallbacks) onto the
//! builder.

use crate::error::IngestError;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the ingestion pipeline.
///
/// # Example
/// ```rust
/// use edgequake_ingest::IngestConfig;
///
/// let config = IngestConfig::builder()
///     .page_concurrency(4)
///     .max_batch_size(5)
///     .input_dir("/srv/scans/input")
///     .build()
///     .unwrap();
/// assert_eq!(config.page_concurrency, 4);
/// ```
#[derive(Clone)]
pub struct IngestConfig {
    /// LLM model identifier. If None, uses `gpt-4o`.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature for transcription and extraction. Default: 0.0.
    pub temperature: f32,

    /// Maximum tokens the LLM may generate per page. Default: 4096.
    pub max_tokens: usize,

    /// Custom OCR system prompt. If None, uses the built-in default.
    pub system_prompt: Option<String>,

    /// Pages of one document transcribed concurrently. Default: 3.
    ///
    /// Total in-flight inference calls are bounded by
    /// `file_concurrency × page_concurrency`; size both against the
    /// provider's rate limits.
    pub page_concurrency: usize,

    /// Documents of one batch processed concurrently. Default: 1.
    pub file_concurrency: usize,

    /// Attempt ceiling per inference call, first try included. Default: 3.
    pub max_attempts: u32,

    /// Base delay between attempts in milliseconds. Default: 5000.
    pub retry_delay_ms: u64,

    /// Rate-limit multiplier for page transcription. Default: 1.
    ///
    /// A 429 on attempt `k` waits `retry_delay_ms × k × multiplier`. Field
    /// extraction uses twice this multiplier.
    pub rate_limit_multiplier: u32,

    /// Rasterised pages wider than this are downscaled. Default: 2048.
    pub max_image_width: u32,

    /// Files above this size are routed to the error directory untouched. Default: 200.
    pub max_file_size_mb: u64,

    /// Deadline for one inference call in seconds. Default: 120.
    pub page_timeout_secs: u64,

    /// Directory scanned for new documents. Default: `./input`.
    pub input_dir: PathBuf,

    /// Directory receiving transcripts and JSON records. Default: `./output`.
    pub output_dir: PathBuf,

    /// Terminal directory for documents with at least one successful page.
    pub processed_dir: PathBuf,

    /// Terminal directory for documents that failed entirely.
    pub error_dir: PathBuf,

    /// Scheduler tick interval in milliseconds. Default: 5000.
    pub watch_interval_ms: u64,

    /// Maximum files handed to the File Pool per tick. Default: 10.
    pub max_batch_size: usize,

    /// Append-only history log. Default: `./.processed_history.jsonl`.
    pub history_path: PathBuf,

    /// Bytes hashed from the head of each file for its fingerprint. Default: 64 KiB.
    pub fingerprint_sample_bytes: usize,

    /// Characters of OCR text sent to field extraction. Default: 8000.
    pub extract_max_chars: usize,

    /// Accepted file extensions, lowercase, without the dot.
    pub extensions: Vec<String>,

    /// Optional progress events for page and document completion.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.0,
            max_tokens: 4096,
            system_prompt: None,
            page_concurrency: 3,
            file_concurrency: 1,
            max_attempts: 3,
            retry_delay_ms: 5000,
            rate_limit_multiplier: 1,
            max_image_width: 2048,
            max_file_size_mb: 200,
            page_timeout_secs: 120,
            input_dir: PathBuf::from("./input"),
            output_dir: PathBuf::from("./output"),
            processed_dir: PathBuf::from("./processed"),
            error_dir: PathBuf::from("./error"),
            watch_interval_ms: 5000,
            max_batch_size: 10,
            history_path: PathBuf::from("./.processed_history.jsonl"),
            fingerprint_sample_bytes: 64 * 1024,
            extract_max_chars: 8000,
            extensions: vec!["tif".to_string(), "tiff".to_string()],
            progress_callback: None,
        }
    }
}

impl fmt::Debug for IngestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestConfig")
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("page_concurrency", &self.page_concurrency)
            .field("file_concurrency", &self.file_concurrency)
            .field("max_attempts", &self.max_attempts)
            .field("retry_delay_ms", &self.retry_delay_ms)
            .field("max_image_width", &self.max_image_width)
            .field("max_file_size_mb", &self.max_file_size_mb)
            .field("input_dir", &self.input_dir)
            .field("output_dir", &self.output_dir)
            .field("processed_dir", &self.processed_dir)
            .field("error_dir", &self.error_dir)
            .field("max_batch_size", &self.max_batch_size)
            .field("history_path", &self.history_path)
            .finish()
    }
}

impl IngestConfig {
    /// Create a new builder for `IngestConfig`.
    pub fn builder() -> IngestConfigBuilder {
        IngestConfigBuilder {
            config: Self::default(),
        }
    }

    /// Model label used in prompts, transcripts and provider resolution.
    pub fn model_name(&self) -> &str {
        self.model.as_deref().unwrap_or("gpt-4o")
    }

    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.page_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }

    /// Whether `ext` (without the dot) names an accepted input format.
    pub fn accepts_extension(&self, ext: &str) -> bool {
        let ext = ext.to_ascii_lowercase();
        self.extensions.iter().any(|e| *e == ext)
    }
}

/// Builder for [`IngestConfig`].
#[derive(Debug)]
pub struct IngestConfigBuilder {
    config: IngestConfig,
}

impl IngestConfigBuilder {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn page_concurrency(mut self, n: usize) -> Self {
        self.config.page_concurrency = n;
        self
    }

    pub fn file_concurrency(mut self, n: usize) -> Self {
        self.config.file_concurrency = n;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n;
        self
    }

    pub fn retry_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry_delay_ms = ms;
        self
    }

    pub fn rate_limit_multiplier(mut self, m: u32) -> Self {
        self.config.rate_limit_multiplier = m.max(1);
        self
    }

    pub fn max_image_width(mut self, px: u32) -> Self {
        self.config.max_image_width = px;
        self
    }

    pub fn max_file_size_mb(mut self, mb: u64) -> Self {
        self.config.max_file_size_mb = mb;
        self
    }

    pub fn page_timeout_secs(mut self, secs: u64) -> Self {
        self.config.page_timeout_secs = secs;
        self
    }

    pub fn input_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.input_dir = dir.into();
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    pub fn processed_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.processed_dir = dir.into();
        self
    }

    pub fn error_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.error_dir = dir.into();
        self
    }

    /// Point all four hand-off directories and the history log below `root`.
    pub fn base_dir(self, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        self.input_dir(root.join("input"))
            .output_dir(root.join("output"))
            .processed_dir(root.join("processed"))
            .error_dir(root.join("error"))
            .history_path(root.join(".processed_history.jsonl"))
    }

    pub fn watch_interval_ms(mut self, ms: u64) -> Self {
        self.config.watch_interval_ms = ms;
        self
    }

    pub fn max_batch_size(mut self, n: usize) -> Self {
        self.config.max_batch_size = n;
        self
    }

    pub fn history_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.history_path = path.into();
        self
    }

    pub fn fingerprint_sample_bytes(mut self, n: usize) -> Self {
        self.config.fingerprint_sample_bytes = n;
        self
    }

    pub fn extract_max_chars(mut self, n: usize) -> Self {
        self.config.extract_max_chars = n;
        self
    }

    pub fn extensions<I, S>(mut self, exts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.config.extensions = exts
            .into_iter()
            .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase())
            .collect();
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<IngestConfig, IngestError> {
        let c = &self.config;
        if c.page_concurrency == 0 || c.file_concurrency == 0 {
            return Err(IngestError::InvalidConfig(
                "Page and file concurrency must be ≥ 1".into(),
            ));
        }
        if c.max_attempts == 0 {
            return Err(IngestError::InvalidConfig(
                "max_attempts must be ≥ 1 (it includes the first try)".into(),
            ));
        }
        if c.page_timeout_secs == 0 {
            return Err(IngestError::InvalidConfig(
                "page_timeout_secs must be ≥ 1".into(),
            ));
        }
        if c.max_batch_size == 0 {
            return Err(IngestError::InvalidConfig(
                "max_batch_size must be ≥ 1".into(),
            ));
        }
        if c.max_image_width < 100 {
            return Err(IngestError::InvalidConfig(format!(
                "max_image_width must be ≥ 100 px, got {}",
                c.max_image_width
            )));
        }
        if c.fingerprint_sample_bytes == 0 {
            return Err(IngestError::InvalidConfig(
                "fingerprint_sample_bytes must be ≥ 1".into(),
            ));
        }
        if c.extensions.is_empty() {
            return Err(IngestError::InvalidConfig(
                "At least one input extension is required".into(),
            ));
        }
        Ok(self.config)
    }
}
