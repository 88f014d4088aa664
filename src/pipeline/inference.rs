//! Inference collaborators: the seams between the pipeline and a model.
//!
//! The Page Processor and Document Aggregator only talk to these traits.
//! [`crate::pipeline::llm`] implements them over `edgequake-llm`; tests plug
//! in deterministic doubles.

use crate::retry::{Classified, ErrorClass};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fmt;

/// A classified failure from a transcription or extraction call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceError {
    pub class: ErrorClass,
    pub message: String,
}

impl InferenceError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::RateLimited, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Transient, message)
    }

    pub fn refusal(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Refusal, message)
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Terminal, message)
    }
}

impl fmt::Display for InferenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.class, self.message)
    }
}

impl std::error::Error for InferenceError {}

impl Classified for InferenceError {
    fn class(&self) -> ErrorClass {
        self.class
    }
}

/// Turns one page image into text.
#[async_trait]
pub trait PageTranscriber: Send + Sync {
    /// Transcribe the PNG-encoded page. `page_num` is 1-based.
    ///
    /// An empty string is a valid answer for a blank page.
    async fn transcribe(&self, png: &[u8], page_num: usize) -> Result<String, InferenceError>;
}

/// Turns a document transcript into structured fields.
#[async_trait]
pub trait FieldExtractor: Send + Sync {
    async fn extract_fields(&self, text: &str) -> Result<Map<String, Value>, InferenceError>;

    /// Record used when extraction fails for good, before `_error` is added.
    fn empty_record(&self) -> Map<String, Value> {
        Map::new()
    }
}
