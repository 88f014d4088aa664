//! Image encoding: `DynamicImage` → PNG bytes → base64 `ImageData`.
//!
//! Pages travel between the rasterizer and the transcriber as PNG bytes so
//! that the [`crate::pipeline::inference::PageTranscriber`] seam stays free
//! of image types. PNG is lossless; JPEG artefacts around glyph edges hurt
//! OCR accuracy far more than the larger payload costs.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode a rasterised page as PNG.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(buf)
}

/// Wrap PNG bytes for a vision request.
///
/// `detail: "high"` lets GPT-4-class models tile the full page; with `low`
/// the page is squeezed into one 512 px tile and small print is lost.
pub fn to_image_data(png: &[u8]) -> ImageData {
    let b64 = STANDARD.encode(png);
    debug!("Encoded page → {} bytes base64", b64.len());
    ImageData::new(b64, "image/png").with_detail("high")
}
