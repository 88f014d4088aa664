//! Page Processor and Page Pool.
//!
//! ## Per page
//!
//! ```text
//! rasterize (spawn_blocking) ──▶ transcribe (deadline) ──▶ refusal check
//!        │ error                      │ error / refusal
//!        ▼                            ▼
//!   RenderFailed               RetryPolicy decides ──▶ InferenceFailed
//! ```
//!
//! Every path ends in a [`PageResult`]; a page never fails its document.
//! A panic while processing a page is caught and becomes that page's
//! `[ERROR]` slot.
//! Rasterization is not retried: a page that cannot be decoded now will not
//! decode on the next attempt either.
//!
//! ## Per document
//!
//! [`PageProcessor::process_pages`] runs all pages of one document through
//! the shared [`run_pool`] with the page concurrency limit and returns the
//! results in page order.

use crate::config::IngestConfig;
use crate::error::{panic_message, PageError};
use crate::output::PageResult;
use crate::pipeline::inference::{InferenceError, PageTranscriber};
use crate::pipeline::raster::Rasterizer;
use crate::pipeline::refusal::is_refusal;
use crate::pool::run_pool;
use crate::progress::ProgressCallback;
use crate::retry::RetryPolicy;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Turns one page of a document into a [`PageResult`].
pub struct PageProcessor {
    rasterizer: Arc<dyn Rasterizer>,
    transcriber: Arc<dyn PageTranscriber>,
    policy: RetryPolicy,
    page_timeout: Duration,
    max_width: u32,
    concurrency: usize,
    progress: Option<ProgressCallback>,
}

impl PageProcessor {
    pub fn new(
        rasterizer: Arc<dyn Rasterizer>,
        transcriber: Arc<dyn PageTranscriber>,
        config: &IngestConfig,
    ) -> Self {
        Self {
            rasterizer,
            transcriber,
            policy: RetryPolicy::for_pages(config),
            page_timeout: config.page_timeout(),
            max_width: config.max_image_width,
            concurrency: config.page_concurrency,
            progress: config.progress_callback.clone(),
        }
    }

    pub fn rasterizer(&self) -> &Arc<dyn Rasterizer> {
        &self.rasterizer
    }

    /// Page Pool: process pages `0..total` of `path`, at most
    /// `page_concurrency` at a time, results in page order.
    pub async fn process_pages(&self, path: &Path, file: &str, total: usize) -> Vec<PageResult> {
        let indices: Vec<usize> = (0..total).collect();
        run_pool(&indices, self.concurrency, |_, &page_index| {
            self.process_page(path, file, page_index, total)
        })
        .await
    }

    /// Process a single page. Never returns an error and never unwinds.
    pub async fn process_page(
        &self,
        path: &Path,
        file: &str,
        page_index: usize,
        total: usize,
    ) -> PageResult {
        match AssertUnwindSafe(self.run_page(path, file, page_index, total))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => self.failed(
                file,
                total,
                PageError::Panicked {
                    page: page_index + 1,
                    detail: panic_message(&*panic),
                },
                0,
            ),
        }
    }

    async fn run_page(
        &self,
        path: &Path,
        file: &str,
        page_index: usize,
        total: usize,
    ) -> PageResult {
        let page_num = page_index + 1;
        if let Some(ref cb) = self.progress {
            cb.on_page_start(file, page_num, total);
        }

        // ── Step 1: rasterise ────────────────────────────────────────────
        let png = match self.rasterize(path, page_index).await {
            Ok(png) => png,
            Err(detail) => {
                return self.failed(
                    file,
                    total,
                    PageError::RenderFailed {
                        page: page_num,
                        detail,
                    },
                    0,
                )
            }
        };

        // ── Step 2: transcribe under the retry policy ────────────────────
        let label = format!("{} page {}/{}", file, page_num, total);
        let png_ref = &png;
        let outcome = self
            .policy
            .run(&label, |_attempt| async move {
                self.transcribe_once(png_ref, page_num).await
            })
            .await;

        match outcome {
            Ok(text) => {
                debug!("{}: {} chars", label, text.len());
                if let Some(ref cb) = self.progress {
                    cb.on_page_complete(file, page_num, total, text.chars().count());
                }
                PageResult {
                    page_index,
                    success: true,
                    text,
                    image_bytes: png.len(),
                }
            }
            Err(exhausted) => self.failed(
                file,
                total,
                PageError::InferenceFailed {
                    page: page_num,
                    attempts: exhausted.attempts,
                    detail: exhausted.last_error.to_string(),
                },
                png.len(),
            ),
        }
    }

    async fn rasterize(&self, path: &Path, page_index: usize) -> Result<Vec<u8>, String> {
        let rasterizer = Arc::clone(&self.rasterizer);
        let path = path.to_path_buf();
        let max_width = self.max_width;
        tokio::task::spawn_blocking(move || rasterizer.rasterize(&path, page_index, max_width))
            .await
            .map_err(|e| format!("rasteriser task failed: {e}"))?
            .map_err(|e| e.to_string())
    }

    /// One transcription attempt: deadline, then refusal classification.
    async fn transcribe_once(&self, png: &[u8], page_num: usize) -> Result<String, InferenceError> {
        match timeout(self.page_timeout, self.transcriber.transcribe(png, page_num)).await {
            Err(_) => Err(InferenceError::transient(format!(
                "no response within {}s",
                self.page_timeout.as_secs_f32()
            ))),
            Ok(Err(e)) => Err(e),
            Ok(Ok(text)) if is_refusal(&text) => Err(InferenceError::refusal(format!(
                "model declined the page: {:?}",
                text.trim()
            ))),
            Ok(Ok(text)) => Ok(text),
        }
    }

    fn failed(&self, file: &str, total: usize, error: PageError, image_bytes: usize) -> PageResult {
        let text = error.to_string();
        warn!("{}: {}", file, text);
        let page_index = error.page() - 1;
        if let Some(ref cb) = self.progress {
            cb.on_page_error(file, page_index + 1, total, &text);
        }
        PageResult {
            page_index,
            success: false,
            text,
            image_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IngestError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct FakeRaster {
        broken_page: Option<usize>,
    }

    impl FakeRaster {
        fn ok() -> Self {
            Self { broken_page: None }
        }
    }

    impl Rasterizer for FakeRaster {
        fn page_count(&self, _path: &Path) -> Result<usize, IngestError> {
            Ok(3)
        }

        fn rasterize(&self, path: &Path, page_index: usize, _w: u32) -> Result<Vec<u8>, IngestError> {
            if Some(page_index) == self.broken_page {
                return Err(IngestError::DecodeFailed {
                    path: path.to_path_buf(),
                    detail: "corrupt strip".into(),
                });
            }
            Ok(vec![page_index as u8; 16])
        }
    }

    /// Replies from a script, one entry per call, then echoes the page number.
    struct Scripted {
        script: Mutex<Vec<Result<String, InferenceError>>>,
        calls: AtomicU32,
        delay: Duration,
    }

    impl Scripted {
        fn new(script: Vec<Result<String, InferenceError>>) -> Self {
            Self {
                script: Mutex::new(script.into_iter().rev().collect()),
                calls: AtomicU32::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl PageTranscriber for Scripted {
        async fn transcribe(&self, _png: &[u8], page_num: usize) -> Result<String, InferenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.script.lock().unwrap().pop();
            next.unwrap_or_else(|| Ok(format!("text of page {page_num}")))
        }
    }

    fn config() -> IngestConfig {
        IngestConfig::builder()
            .max_attempts(3)
            .retry_delay_ms(1)
            .page_timeout_secs(5)
            .build()
            .unwrap()
    }

    fn processor(raster: FakeRaster, t: Arc<Scripted>, config: &IngestConfig) -> PageProcessor {
        PageProcessor::new(Arc::new(raster), t, config)
    }

    #[tokio::test]
    async fn success_after_transient_error() {
        let t = Arc::new(Scripted::new(vec![Err(InferenceError::transient("503"))]));
        let p = processor(FakeRaster::ok(), t.clone(), &config());
        let r = p.process_page(Path::new("doc.tif"), "doc.tif", 0, 3).await;
        assert!(r.success);
        assert_eq!(r.text, "text of page 1");
        assert_eq!(t.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn refusal_is_retried_then_reported() {
        let sorry = || Ok("I'm sorry, I can't help with that.".to_string());
        let t = Arc::new(Scripted::new(vec![sorry(), sorry(), sorry()]));
        let p = processor(FakeRaster::ok(), t.clone(), &config());
        let r = p.process_page(Path::new("doc.tif"), "doc.tif", 1, 3).await;
        assert!(!r.success);
        assert!(r.text.starts_with("[ERROR] page 2: "), "{}", r.text);
        assert!(r.text.contains("refusal"));
        assert_eq!(t.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn empty_transcript_is_a_blank_page() {
        let t = Arc::new(Scripted::new(vec![Ok(String::new())]));
        let p = processor(FakeRaster::ok(), t.clone(), &config());
        let r = p.process_page(Path::new("doc.tif"), "doc.tif", 0, 1).await;
        assert!(r.success);
        assert!(r.text.is_empty());
        assert_eq!(t.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn terminal_error_is_not_retried() {
        let t = Arc::new(Scripted::new(vec![Err(InferenceError::terminal("401"))]));
        let p = processor(FakeRaster::ok(), t.clone(), &config());
        let r = p.process_page(Path::new("doc.tif"), "doc.tif", 0, 1).await;
        assert!(!r.success);
        assert_eq!(t.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn render_failure_skips_inference() {
        let t = Arc::new(Scripted::new(vec![]));
        let p = processor(FakeRaster { broken_page: Some(0) }, t.clone(), &config());
        let r = p.process_page(Path::new("doc.tif"), "doc.tif", 0, 1).await;
        assert!(!r.success);
        assert!(r.text.contains("rasterisation failed"));
        assert_eq!(r.image_bytes, 0);
        assert_eq!(t.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn deadline_counts_as_transient() {
        let config = IngestConfig::builder()
            .max_attempts(2)
            .retry_delay_ms(1)
            .page_timeout_secs(1)
            .build()
            .unwrap();
        let mut slow = Scripted::new(vec![]);
        slow.delay = Duration::from_millis(1500);
        let t = Arc::new(slow);
        let p = processor(FakeRaster::ok(), t.clone(), &config);
        let r = p.process_page(Path::new("doc.tif"), "doc.tif", 0, 1).await;
        assert!(!r.success);
        assert!(r.text.contains("no response within"), "{}", r.text);
        assert_eq!(t.calls.load(Ordering::SeqCst), 2);
    }

    /// Panics while transcribing one page, answers every other page.
    struct PanicsOn(usize);

    #[async_trait]
    impl PageTranscriber for PanicsOn {
        async fn transcribe(&self, _png: &[u8], page_num: usize) -> Result<String, InferenceError> {
            if page_num == self.0 {
                panic!("decoder state lost on page {page_num}");
            }
            Ok(format!("text of page {page_num}"))
        }
    }

    #[tokio::test]
    async fn panicking_page_becomes_error_slot() {
        let p = PageProcessor::new(Arc::new(FakeRaster::ok()), Arc::new(PanicsOn(2)), &config());
        let pages = p.process_pages(Path::new("doc.tif"), "doc.tif", 3).await;
        assert_eq!(pages.len(), 3);
        assert!(pages[0].success && pages[2].success);
        assert!(!pages[1].success);
        assert_eq!(pages[1].page_index, 1);
        assert_eq!(
            pages[1].text,
            "[ERROR] page 2: processing panicked: decoder state lost on page 2"
        );
    }

    #[tokio::test]
    async fn pool_keeps_page_order_with_one_broken_page() {
        let t = Arc::new(Scripted::new(vec![]));
        let p = processor(FakeRaster { broken_page: Some(1) }, t, &config());
        let pages = p.process_pages(Path::new("doc.tif"), "doc.tif", 3).await;
        let indices: Vec<_> = pages.iter().map(|r| r.page_index).collect();
        assert_eq!(indices, [0, 1, 2]);
        assert!(pages[0].success && !pages[1].success && pages[2].success);
    }
}
