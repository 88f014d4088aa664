//! Output artifacts: the page-by-page transcript and the JSON record.
//!
//! For `scan.tif` the output directory receives `scan_ocr.txt` and
//! `scan_data.json`. Each file is written to a `.tmp` sibling and renamed
//! into place, so a reader never observes a half-written artifact.

use crate::error::IngestError;
use crate::output::DocumentAggregate;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

const HEAVY_RULE: &str =
    "============================================================";
const LIGHT_RULE: &str =
    "------------------------------------------------------------";

/// Transcript and record locations for `source` inside `output_dir`.
pub fn artifact_paths(output_dir: &Path, source: &Path) -> (PathBuf, PathBuf) {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    (
        output_dir.join(format!("{stem}_ocr.txt")),
        output_dir.join(format!("{stem}_data.json")),
    )
}

/// `1m 5s` above a minute, `42s` below.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

/// Local wall-clock timestamp used in both artifacts.
pub fn timestamp_now() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Render the human-readable transcript.
pub fn render_transcript(
    model: &str,
    source_file: &str,
    processed_at: &str,
    aggregate: &DocumentAggregate,
) -> String {
    let total = aggregate.page_count();
    let mut out = String::new();

    out.push_str(HEAVY_RULE);
    out.push('\n');
    out.push_str(&format!("OCR with {} Vision - text extraction\n", model));
    out.push_str(&format!("File: {}\n", source_file));
    out.push_str(&format!("Date: {}\n", processed_at));
    out.push_str(&format!("Total pages: {}\n", total));
    out.push_str(HEAVY_RULE);
    out.push_str("\n\n");

    for page in &aggregate.pages {
        out.push_str(LIGHT_RULE);
        out.push('\n');
        out.push_str(&format!("PAGE {} / {}\n", page.page_num(), total));
        out.push_str(LIGHT_RULE);
        out.push('\n');
        out.push_str(&page.text);
        out.push_str("\n\n");
    }

    out.push_str(HEAVY_RULE);
    out.push('\n');
    out.push_str(&format!(
        "Completed in {}\n",
        format_elapsed(aggregate.elapsed)
    ));
    out.push_str(&format!(
        "Success: {} | Errors: {}\n",
        aggregate.success_count, aggregate.error_count
    ));
    out.push_str(HEAVY_RULE);
    out.push('\n');
    out
}

/// Build the JSON record: document metadata first, then the extracted fields.
pub fn render_record(
    source_file: &str,
    processed_at: &str,
    aggregate: &DocumentAggregate,
) -> Map<String, Value> {
    let mut record = Map::new();
    record.insert("source_file".into(), source_file.into());
    record.insert("processed_at".into(), processed_at.into());
    record.insert("total_pages".into(), aggregate.page_count().into());
    record.insert("success".into(), aggregate.success_count.into());
    record.insert("errors".into(), aggregate.error_count.into());
    for (key, value) in &aggregate.fields {
        record.entry(key.clone()).or_insert_with(|| value.clone());
    }
    record
}

/// Write both artifacts for `source` into `output_dir`.
///
/// Returns `(transcript_path, record_path)`.
pub async fn write_artifacts(
    output_dir: &Path,
    source: &Path,
    model: &str,
    aggregate: &DocumentAggregate,
) -> Result<(PathBuf, PathBuf), IngestError> {
    let source_file = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let processed_at = timestamp_now();
    let (transcript_path, record_path) = artifact_paths(output_dir, source);

    tokio::fs::create_dir_all(output_dir)
        .await
        .map_err(|e| IngestError::OutputWriteFailed {
            path: output_dir.to_path_buf(),
            source: e,
        })?;

    let transcript = render_transcript(model, &source_file, &processed_at, aggregate);
    write_atomic(&transcript_path, transcript.as_bytes()).await?;

    let record = render_record(&source_file, &processed_at, aggregate);
    let json = serde_json::to_vec_pretty(&record).map_err(|e| IngestError::OutputWriteFailed {
        path: record_path.clone(),
        source: e.into(),
    })?;
    write_atomic(&record_path, &json).await?;

    Ok((transcript_path, record_path))
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), IngestError> {
    let err = |e: std::io::Error| IngestError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e,
    };
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    tokio::fs::write(&tmp_path, bytes).await.map_err(err)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::PageResult;

    fn aggregate() -> DocumentAggregate {
        let mut fields = Map::new();
        fields.insert("city".into(), "La Paz".into());
        fields.insert("source_file".into(), "spoofed.tif".into());
        DocumentAggregate {
            pages: vec![
                PageResult {
                    page_index: 0,
                    success: true,
                    text: "first page".into(),
                    image_bytes: 10,
                },
                PageResult {
                    page_index: 1,
                    success: false,
                    text: "[ERROR] page 2: transient error: 503 (after 3 attempts)".into(),
                    image_bytes: 10,
                },
            ],
            text: "first page".into(),
            fields,
            success_count: 1,
            error_count: 1,
            elapsed: Duration::from_secs(65),
        }
    }

    #[test]
    fn elapsed_formats() {
        assert_eq!(format_elapsed(Duration::from_secs(42)), "42s");
        assert_eq!(format_elapsed(Duration::from_secs(65)), "1m 5s");
        assert_eq!(format_elapsed(Duration::from_millis(900)), "0s");
    }

    #[test]
    fn paths_use_stem() {
        let (t, r) = artifact_paths(Path::new("/out"), Path::new("/in/scan.001.TIF"));
        assert_eq!(t, PathBuf::from("/out/scan.001_ocr.txt"));
        assert_eq!(r, PathBuf::from("/out/scan.001_data.json"));
    }

    #[test]
    fn transcript_has_a_slot_per_page() {
        let text = render_transcript("gpt-4o", "scan.tif", "2024-03-01 10:00:00", &aggregate());
        assert!(text.starts_with(HEAVY_RULE));
        assert!(text.contains("File: scan.tif"));
        assert!(text.contains("Total pages: 2"));
        let first = text.find("PAGE 1 / 2").unwrap();
        let second = text.find("PAGE 2 / 2").unwrap();
        assert!(first < second);
        assert!(text.contains("[ERROR] page 2: "));
        assert!(text.contains("Completed in 1m 5s"));
        assert!(text.contains("Success: 1 | Errors: 1"));
    }

    #[test]
    fn record_metadata_wins_over_fields() {
        let record = render_record("scan.tif", "2024-03-01 10:00:00", &aggregate());
        assert_eq!(record["source_file"], "scan.tif");
        assert_eq!(record["total_pages"], 2);
        assert_eq!(record["success"], 1);
        assert_eq!(record["errors"], 1);
        assert_eq!(record["city"], "La Paz");
    }

    #[tokio::test]
    async fn writes_both_files_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("output");
        let (t, r) = write_artifacts(&out, Path::new("/in/scan.tif"), "gpt-4o", &aggregate())
            .await
            .unwrap();
        assert!(std::fs::read_to_string(&t).unwrap().contains("first page"));
        let json: Value = serde_json::from_slice(&std::fs::read(&r).unwrap()).unwrap();
        assert_eq!(json["success"], 1);

        let names: Vec<_> = std::fs::read_dir(&out)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2, "{names:?}");
        assert!(names.iter().all(|n| !n.ends_with(".tmp")));
    }
}
