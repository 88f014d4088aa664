//! Refusal detection for transcription responses.
//!
//! Vision models occasionally answer a dense or low-contrast scan with a short
//! apology instead of its text. Such a response is not a transcription and is
//! retried like a transient failure. An empty response is not a refusal: it is
//! what a blank page legitimately produces.

use once_cell::sync::Lazy;
use regex::Regex;

/// Responses at least this long are treated as transcriptions even if they
/// contain an apologetic phrase (an OCRed letter may well say "I'm sorry").
const MAX_REFUSAL_CHARS: usize = 200;

static REFUSAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(i'?m sorry|i am sorry|sorry, but|i can'?t|i cannot|i'?m unable|i am unable|unable to (assist|help|process|read|transcribe|extract)|as an ai|lo siento|no puedo)\b",
    )
    .unwrap()
});

/// Whether `text` is a model refusal rather than page content.
pub fn is_refusal(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.chars().count() >= MAX_REFUSAL_CHARS {
        return false;
    }
    REFUSAL.is_match(trimmed)
}
