//! Prompts for page transcription and field extraction.
//!
//! Every prompt lives here so that tests can inspect them without a model,
//! and so a wording change touches one file. The OCR system prompt can be
//! overridden through [`crate::config::IngestConfig::system_prompt`].

use serde_json::{Map, Value};

/// Default system prompt for transcribing one scanned page.
pub const DEFAULT_OCR_PROMPT: &str = "You are a professional OCR system. Your task is to \
extract ALL text visible in the image, keeping the original layout as faithfully as possible. \
Include headings, paragraphs, tables, numbers and any other visible text. Do not add comments \
or explanations; return only the extracted text exactly as it appears in the document. \
If the page contains no text, return an empty response.";

/// User message sent with each page image.
pub fn page_prompt(page_num: usize) -> String {
    format!(
        "Extract all text from this document image (page {}). Return ONLY the text, \
         without additional comments.",
        page_num
    )
}

/// Kind of value an extraction field holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    List,
}

/// Fields requested from the extractor, with a description for the prompt.
pub const EXTRACTION_FIELDS: &[(&str, FieldKind, &str)] = &[
    (
        "document_type",
        FieldKind::Text,
        "Type of document exactly as it appears in the text.",
    ),
    (
        "document_number",
        FieldKind::Text,
        "Number or code identifying the document.",
    ),
    (
        "city",
        FieldKind::Text,
        "City where the document was issued.",
    ),
    (
        "region",
        FieldKind::Text,
        "Region, state or department the city belongs to. Use geographic knowledge to identify it.",
    ),
    (
        "date",
        FieldKind::Text,
        "Document date normalised to ISO format YYYY-MM-DD, whatever its written form.",
    ),
    (
        "recipient",
        FieldKind::Text,
        "Person or institution the document is addressed to. Empty string when only a generic salutation is present.",
    ),
    (
        "reference",
        FieldKind::Text,
        "Subject or reference line (after 'REF:' or 'REFERENCE:'), in full.",
    ),
    (
        "case_number",
        FieldKind::Text,
        "Case or filing number mentioned in the reference, if any.",
    ),
    (
        "distribution",
        FieldKind::List,
        "Entities listed for information or compliance.",
    ),
    (
        "attachments",
        FieldKind::List,
        "Attached or enclosed documents that are mentioned.",
    ),
];

/// Marker appended when the OCR text is cut before extraction.
pub const TRUNCATION_MARKER: &str = "\n\n[... remaining text omitted ...]";

/// System prompt for field extraction, built from [`EXTRACTION_FIELDS`].
pub fn extraction_prompt() -> String {
    let mut schema = String::from("{\n");
    for (i, (name, _, description)) in EXTRACTION_FIELDS.iter().enumerate() {
        let sep = if i + 1 < EXTRACTION_FIELDS.len() { "," } else { "" };
        schema.push_str(&format!("  \"{}\": \"{}\"{}\n", name, description, sep));
    }
    schema.push('}');

    format!(
        "You are a data extraction system for official correspondence (regulators, \
         financial supervisors, government agencies).\n\n\
         From the OCR text of a document, extract the following fields as JSON:\n\n\
         {}\n\n\
         RULES:\n\
         - Extract values EXACTLY as they appear in the text; never invent data.\n\
         - If a text field is not found, use an empty string \"\".\n\
         - If a list field is not found, use an empty array [].\n\
         - The date must ALWAYS be normalised to YYYY-MM-DD.\n\
         - Return ONLY valid JSON, without explanations, comments or markdown.",
        schema
    )
}

/// User message carrying the (possibly truncated) OCR text.
pub fn extraction_request(text: &str) -> String {
    format!("Extract the fields from the following document text:\n\n{}", text)
}

/// Cut `text` to at most `max_chars` characters, appending [`TRUNCATION_MARKER`].
pub fn truncate_for_extraction(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}{}", &text[..byte_idx], TRUNCATION_MARKER),
        None => text.to_string(),
    }
}

/// The record with every field empty: `""` for text, `[]` for lists.
pub fn empty_extraction() -> Map<String, Value> {
    EXTRACTION_FIELDS
        .iter()
        .map(|(name, kind, _)| {
            let value = match kind {
                FieldKind::Text => Value::String(String::new()),
                FieldKind::List => Value::Array(Vec::new()),
            };
            (name.to_string(), value)
        })
        .collect()
}
