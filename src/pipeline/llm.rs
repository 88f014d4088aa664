//! Inference over `edgequake-llm`: vision transcription and field extraction.
//!
//! This module is intentionally thin. Prompts live in [`crate::prompts`],
//! retries and deadlines in the Page Processor and Document Aggregator. Here
//! we only build messages, call the provider, and classify transport errors
//! into the [`ErrorClass`] taxonomy.

use crate::config::IngestConfig;
use crate::error::IngestError;
use crate::pipeline::encode::to_image_data;
use crate::pipeline::inference::{FieldExtractor, InferenceError, PageTranscriber};
use crate::prompts::{
    empty_extraction, extraction_prompt, extraction_request, page_prompt,
    truncate_for_extraction, DEFAULT_OCR_PROMPT,
};
use crate::retry::ErrorClass;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Token ceiling for the extraction reply; the JSON record is small.
const EXTRACTION_MAX_TOKENS: usize = 1024;

/// Page transcriber backed by a vision-capable chat model.
pub struct LlmTranscriber {
    provider: Arc<dyn LLMProvider>,
    system_prompt: String,
    options: CompletionOptions,
}

impl LlmTranscriber {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &IngestConfig) -> Self {
        Self {
            provider,
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_OCR_PROMPT.to_string()),
            options: CompletionOptions {
                temperature: Some(config.temperature),
                max_tokens: Some(config.max_tokens),
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl PageTranscriber for LlmTranscriber {
    async fn transcribe(&self, png: &[u8], page_num: usize) -> Result<String, InferenceError> {
        let start = Instant::now();
        let messages = vec![
            ChatMessage::system(self.system_prompt.as_str()),
            ChatMessage::user_with_images(page_prompt(page_num), vec![to_image_data(png)]),
        ];

        let response = self
            .provider
            .chat(&messages, Some(&self.options))
            .await
            .map_err(|e| classify_message(e.to_string()))?;

        debug!(
            "Page {}: {} input tokens, {} output tokens, {:?}",
            page_num,
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );
        Ok(response.content)
    }
}

/// Field extractor backed by a chat model answering in JSON.
pub struct LlmFieldExtractor {
    provider: Arc<dyn LLMProvider>,
    max_chars: usize,
    options: CompletionOptions,
}

impl LlmFieldExtractor {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &IngestConfig) -> Self {
        Self {
            provider,
            max_chars: config.extract_max_chars,
            options: CompletionOptions {
                temperature: Some(0.0),
                max_tokens: Some(EXTRACTION_MAX_TOKENS),
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl FieldExtractor for LlmFieldExtractor {
    async fn extract_fields(&self, text: &str) -> Result<Map<String, Value>, InferenceError> {
        let truncated = truncate_for_extraction(text, self.max_chars);
        debug!(
            "Extracting fields ({} of {} chars)",
            truncated.chars().count(),
            text.chars().count()
        );

        let messages = vec![
            ChatMessage::system(extraction_prompt()),
            ChatMessage::user(extraction_request(&truncated)),
        ];
        let response = self
            .provider
            .chat(&messages, Some(&self.options))
            .await
            .map_err(|e| classify_message(e.to_string()))?;

        parse_json_object(&response.content)
    }

    fn empty_record(&self) -> Map<String, Value> {
        empty_extraction()
    }
}

/// Parse a model reply into a JSON object, tolerating code fences and
/// surrounding prose. A reply without an object is retried as transient.
pub fn parse_json_object(raw: &str) -> Result<Map<String, Value>, InferenceError> {
    let trimmed = raw.trim();
    let body = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => {
            return Err(InferenceError::transient(format!(
                "reply contains no JSON object ({} chars)",
                trimmed.len()
            )))
        }
    };
    serde_json::from_str::<Map<String, Value>>(body)
        .map_err(|e| InferenceError::transient(format!("invalid JSON in reply: {e}")))
}

/// Map a provider error message onto the retry taxonomy.
///
/// Providers surface HTTP status and vendor codes only through their error
/// text, so classification is by substring.
pub fn classify_message(message: String) -> InferenceError {
    let lower = message.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    let class = if has(&["429", "rate limit", "rate_limit", "too many requests", "quota"]) {
        ErrorClass::RateLimited
    } else if has(&["content_filter", "content filter", "safety"]) {
        ErrorClass::Refusal
    } else if has(&[
        "401",
        "403",
        "invalid api key",
        "invalid_api_key",
        "authentication",
        "unauthorized",
        "400 ",
        "invalid_request",
        "model_not_found",
    ]) {
        ErrorClass::Terminal
    } else {
        ErrorClass::Transient
    };
    InferenceError::new(class, message)
}

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, IngestError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        IngestError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the LLM provider, from most-specific to least-specific.
///
/// 1. **Pre-built provider** (`config.provider`), used as-is.
/// 2. **Named provider** (`config.provider_name`) with `config.model`.
/// 3. **Environment** `EDGEQUAKE_LLM_PROVIDER`, with `EDGEQUAKE_MODEL` or
///    the configured model.
/// 4. **OpenAI** when `OPENAI_API_KEY` is set.
/// 5. **Full auto-detection** via [`ProviderFactory::from_env`].
pub fn resolve_provider(config: &IngestConfig) -> Result<Arc<dyn LLMProvider>, IngestError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        return create_provider(name, config.model_name());
    }

    if let Some((prov, model)) = env_provider(
        std::env::var("EDGEQUAKE_LLM_PROVIDER").ok(),
        std::env::var("EDGEQUAKE_MODEL").ok(),
        config.model_name(),
    ) {
        return create_provider(&prov, &model);
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            return create_provider("openai", config.model_name());
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| IngestError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

/// Provider and model named by the environment. A provider alone is enough;
/// the model then falls back to `default_model`.
fn env_provider(
    provider: Option<String>,
    model: Option<String>,
    default_model: &str,
) -> Option<(String, String)> {
    let provider = provider.filter(|p| !p.is_empty())?;
    let model = model
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| default_model.to_string());
    Some((provider, model))
}
