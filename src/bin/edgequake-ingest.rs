//! CLI binary for edgequake-ingest.
//!
//! A thin shim over the library crate that maps CLI flags (and their
//! environment fallbacks) to `IngestConfig` and reports results.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use edgequake_ingest::{
    ingest, BatchReport, FileOutcome, HistoryLedger, IngestConfig, IngestProgress,
    ProgressCallback, TickOutcome,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Progress bar for the `process` subcommand. Pages complete out of order.
struct CliProgress {
    bar: ProgressBar,
    errors: AtomicUsize,
}

impl CliProgress {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        bar.set_style(style);
        bar.set_prefix("Preparing");
        bar.set_message("Opening scan…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            errors: AtomicUsize::new(0),
        })
    }
}

impl IngestProgress for CliProgress {
    fn on_document_start(&self, file: &str, total_pages: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ");
        self.bar.set_length(total_pages as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("OCR");
        self.bar.set_message(file.to_string());
        self.bar.reset_eta();
    }

    fn on_page_complete(&self, _file: &str, page: usize, total: usize, chars: usize) {
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}",
            green("✓"),
            page,
            total,
            dim(&format!("{chars:>5} chars")),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, _file: &str, page: usize, total: usize, error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        let msg: String = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}",
            red("✗"),
            page,
            total,
            red(&msg)
        ));
        self.bar.inc(1);
    }

    fn on_document_complete(&self, _file: &str, total_pages: usize, success_count: usize) {
        self.bar.finish_and_clear();
        let failed = self.errors.load(Ordering::SeqCst);
        if failed == 0 {
            eprintln!(
                "{} {} pages transcribed",
                green("✔"),
                bold(&success_count.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} pages transcribed  ({} failed)",
                red("⚠"),
                bold(&success_count.to_string()),
                total_pages,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Watch ./input every 5 s (default subcommand)
  edgequake-ingest

  # One tick, then exit (cron-friendly)
  edgequake-ingest once --max-batch-size 20

  # OCR a single scan without touching the hand-off folders
  edgequake-ingest process scan.tif --output-dir /tmp/out

  # Show what has been processed
  edgequake-ingest history

DIRECTORIES:
  input/      new scans are dropped here
  output/     <name>_ocr.txt and <name>_data.json per document
  processed/  scans with at least one transcribed page
  error/      scans that could not be processed at all

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  OPENAI_MODEL            Model ID when EDGEQUAKE_MODEL is unset
  RUST_LOG                Tracing filter (overrides --verbose / --quiet)
"#;

/// Watch a folder of scanned documents and OCR them with Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "edgequake-ingest",
    version,
    about = "Watch a folder of scanned documents and OCR them with Vision LLMs",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    opts: Opts,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll the input directory until SIGINT/SIGTERM (default).
    Watch,
    /// Run a single batch and exit.
    Once,
    /// OCR one file; no history, no move.
    Process {
        /// Scan to process.
        file: PathBuf,
        /// Where to write the artifacts. Defaults to the file's directory.
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Disable the progress bar.
        #[arg(long)]
        no_progress: bool,
    },
    /// List documents recorded in the history log.
    History,
}

#[derive(Args, Debug)]
struct Opts {
    /// LLM model ID (falls back to OPENAI_MODEL).
    #[arg(long, global = true, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, global = true, env = "EDGEQUAKE_LLM_PROVIDER")]
    provider: Option<String>,

    /// Pages of one document transcribed concurrently.
    #[arg(long, global = true, env = "CONCURRENCY", default_value_t = 3)]
    concurrency: usize,

    /// Documents processed concurrently.
    #[arg(long, global = true, env = "FILE_CONCURRENCY", default_value_t = 1)]
    file_concurrency: usize,

    /// Attempts per inference call, first try included.
    #[arg(long, global = true, env = "MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Base delay between attempts (ms).
    #[arg(long, global = true, env = "RETRY_DELAY_MS", default_value_t = 5000)]
    retry_delay_ms: u64,

    /// Extra multiplier for rate-limit back-off.
    #[arg(long, global = true, env = "RATE_LIMIT_MULTIPLIER", default_value_t = 1)]
    rate_limit_multiplier: u32,

    /// Maximum page width sent to the model (px).
    #[arg(long, global = true, env = "MAX_IMAGE_WIDTH", default_value_t = 2048)]
    max_image_width: u32,

    /// Files larger than this are routed to error untouched (MB).
    #[arg(long, global = true, env = "MAX_FILE_SIZE_MB", default_value_t = 200)]
    max_file_size_mb: u64,

    /// Deadline per inference call (ms).
    #[arg(long, global = true, env = "TIMEOUT_PER_PAGE_MS", default_value_t = 120_000)]
    timeout_per_page_ms: u64,

    #[arg(long, global = true, env = "INPUT_DIR", default_value = "./input")]
    input_dir: PathBuf,

    #[arg(long, global = true, env = "OUTPUT_DIR", default_value = "./output")]
    output_dir: PathBuf,

    #[arg(long, global = true, env = "PROCESSED_DIR", default_value = "./processed")]
    processed_dir: PathBuf,

    #[arg(long, global = true, env = "ERROR_DIR", default_value = "./error")]
    error_dir: PathBuf,

    /// Scheduler interval (ms).
    #[arg(long, global = true, env = "WATCH_INTERVAL_MS", default_value_t = 5000)]
    watch_interval_ms: u64,

    /// Maximum files per batch.
    #[arg(long, global = true, env = "MAX_BATCH_SIZE", default_value_t = 10)]
    max_batch_size: usize,

    /// Append-only history log.
    #[arg(long, global = true, env = "HISTORY_FILE", default_value = "./.processed_history.jsonl")]
    history_file: PathBuf,

    /// Bytes hashed from the head of each file for its fingerprint.
    #[arg(long, global = true, env = "FINGERPRINT_SAMPLE_BYTES", default_value_t = 65_536)]
    fingerprint_sample_bytes: usize,

    /// Characters of OCR text sent to field extraction.
    #[arg(long, global = true, env = "EXTRACT_MAX_CHARS", default_value_t = 8000)]
    extract_max_chars: usize,

    /// Path to a text file containing a custom OCR system prompt.
    #[arg(long, global = true, env = "OCR_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    quiet: bool,
}

impl Opts {
    fn to_config(&self, progress: Option<ProgressCallback>) -> Result<IngestConfig> {
        let mut builder = IngestConfig::builder()
            .page_concurrency(self.concurrency)
            .file_concurrency(self.file_concurrency)
            .max_attempts(self.max_retries)
            .retry_delay_ms(self.retry_delay_ms)
            .rate_limit_multiplier(self.rate_limit_multiplier)
            .max_image_width(self.max_image_width)
            .max_file_size_mb(self.max_file_size_mb)
            .page_timeout_secs(self.timeout_per_page_ms.div_ceil(1000))
            .input_dir(&self.input_dir)
            .output_dir(&self.output_dir)
            .processed_dir(&self.processed_dir)
            .error_dir(&self.error_dir)
            .watch_interval_ms(self.watch_interval_ms)
            .max_batch_size(self.max_batch_size)
            .history_path(&self.history_file)
            .fingerprint_sample_bytes(self.fingerprint_sample_bytes)
            .extract_max_chars(self.extract_max_chars);

        if let Some(model) = pick_model(self.model.clone(), std::env::var("OPENAI_MODEL").ok()) {
            builder = builder.model(model);
        }
        if let Some(ref provider) = self.provider {
            builder = builder.provider_name(provider);
        }
        if let Some(ref path) = self.system_prompt {
            let prompt = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read system prompt '{}'", path.display()))?;
            builder = builder.system_prompt(prompt);
        }
        if let Some(cb) = progress {
            builder = builder.progress_callback(cb);
        }
        builder.build().context("Invalid configuration")
    }
}

/// `--model` / `EDGEQUAKE_MODEL` first, then `OPENAI_MODEL`. Empty values count as unset.
fn pick_model(flag: Option<String>, openai_model: Option<String>) -> Option<String> {
    flag.filter(|m| !m.is_empty())
        .or_else(|| openai_model.filter(|m| !m.is_empty()))
}

/// Refuse files whose extension the pipeline does not accept.
fn ensure_accepted(file: &Path, config: &IngestConfig) -> Result<()> {
    let ext = file
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default();
    if !config.accepts_extension(&ext) {
        anyhow::bail!(
            "Unsupported file type '{}': expected one of {}",
            file.display(),
            config.extensions.join(", ")
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Watch);

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar of `process` replaces INFO logs.
    let show_progress = matches!(command, Command::Process { no_progress: false, .. })
        && !cli.opts.quiet;
    let filter = if cli.opts.verbose {
        "debug"
    } else if cli.opts.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match command {
        Command::Watch => {
            let config = cli.opts.to_config(None)?;
            let scheduler = ingest::scheduler(&config).context("Failed to start scheduler")?;
            scheduler
                .run_until(shutdown_signal())
                .await
                .context("Scheduler stopped with an error")?;
        }
        Command::Once => {
            let config = cli.opts.to_config(None)?;
            let outcome = ingest::run_once(&config).await.context("Batch failed")?;
            print_tick(&outcome);
        }
        Command::Process {
            file,
            output_dir,
            no_progress: _,
        } => {
            let progress = show_progress.then(|| CliProgress::new() as ProgressCallback);
            let config = cli.opts.to_config(progress)?;
            ensure_accepted(&file, &config)?;
            let out_dir = match output_dir {
                Some(dir) => dir,
                None => file
                    .parent()
                    .map(|p| p.to_path_buf())
                    .unwrap_or_else(|| PathBuf::from(".")),
            };
            let report = ingest::process_file(&file, &out_dir, &config)
                .await
                .with_context(|| format!("Failed to process '{}'", file.display()))?;
            if !cli.opts.quiet {
                eprintln!("{} {}", green("→"), report.transcript_path.display());
                eprintln!("{} {}", green("→"), report.record_path.display());
            }
            if report.aggregate.success_count == 0 {
                anyhow::bail!("No page of '{}' could be transcribed", file.display());
            }
        }
        Command::History => {
            let ledger = HistoryLedger::open_file(&cli.opts.history_file)
                .context("Failed to read history")?;
            for (key, entry) in ledger.entries() {
                println!(
                    "{}  {:<40} {:>3} pages  {} ok / {} failed  {}",
                    entry.recorded_at,
                    entry.file,
                    entry.pages,
                    entry.success,
                    entry.errors,
                    dim(&key)
                );
            }
            if !cli.opts.quiet {
                eprintln!("{} documents recorded", bold(&ledger.len().to_string()));
            }
        }
    }

    Ok(())
}

fn print_tick(outcome: &TickOutcome) {
    match outcome {
        TickOutcome::Skipped => eprintln!("A batch is already running"),
        TickOutcome::Idle { caught_up } => {
            eprintln!("Nothing to process ({} already-processed file(s) moved)", caught_up)
        }
        TickOutcome::Ran(report) => print_report(report),
    }
}

fn print_report(report: &BatchReport) {
    for outcome in &report.outcomes {
        match outcome {
            FileOutcome::Completed {
                file,
                pages,
                success,
                errors,
            } => eprintln!(
                "  {} {}  {}",
                green("✓"),
                file,
                dim(&format!("{success}/{pages} pages, {errors} errors"))
            ),
            FileOutcome::Failed { file, reason } => {
                eprintln!("  {} {}  {}", red("✗"), file, red(reason))
            }
            FileOutcome::Skipped { file } => {
                eprintln!("  {} {}  {}", dim("-"), file, dim("already processed"))
            }
        }
    }
    eprintln!(
        "{} completed, {} failed, {} deferred",
        bold(&report.completed().to_string()),
        report.failed(),
        report.deferred
    );
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
