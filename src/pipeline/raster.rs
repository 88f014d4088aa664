//! Rasterization: one page of a multi-page scan → PNG bytes.
//!
//! The [`Rasterizer`] trait is synchronous; decoding is CPU-bound and the
//! Page Processor calls it inside `tokio::task::spawn_blocking`.
//!
//! [`TiffRasterizer`] treats every IFD of a TIFF as one page. A page is
//! downscaled to the configured maximum width (aspect ratio kept, never
//! upscaled) before PNG encoding.

use crate::error::IngestError;
use crate::pipeline::encode::encode_png;
use image::imageops::FilterType;
use image::{DynamicImage, ImageBuffer, Luma, LumaA, Rgb, Rgba};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::ColorType;
use tracing::debug;

/// Source of page images for one document.
pub trait Rasterizer: Send + Sync {
    /// Number of pages in the document at `path`.
    fn page_count(&self, path: &Path) -> Result<usize, IngestError>;

    /// PNG bytes of page `page_index` (0-based), at most `max_width` wide.
    fn rasterize(&self, path: &Path, page_index: usize, max_width: u32)
        -> Result<Vec<u8>, IngestError>;
}

/// Multi-page TIFF rasterizer built on the `tiff` decoder.
#[derive(Debug, Default, Clone, Copy)]
pub struct TiffRasterizer;

impl TiffRasterizer {
    fn open(path: &Path) -> Result<Decoder<BufReader<File>>, IngestError> {
        let file = File::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                IngestError::FileNotFound {
                    path: path.to_path_buf(),
                }
            } else {
                IngestError::ReadFailed {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })?;
        Decoder::new(BufReader::new(file))
            .map(|d| d.with_limits(Limits::unlimited()))
            .map_err(|e| decode_error(path, e))
    }
}

impl Rasterizer for TiffRasterizer {
    fn page_count(&self, path: &Path) -> Result<usize, IngestError> {
        let mut decoder = Self::open(path)?;
        let mut pages = 1;
        while decoder.more_images() {
            decoder.next_image().map_err(|e| decode_error(path, e))?;
            pages += 1;
        }
        Ok(pages)
    }

    fn rasterize(
        &self,
        path: &Path,
        page_index: usize,
        max_width: u32,
    ) -> Result<Vec<u8>, IngestError> {
        let mut decoder = Self::open(path)?;
        for seen in 0..page_index {
            if !decoder.more_images() {
                return Err(IngestError::PageOutOfRange {
                    page: page_index + 1,
                    total: seen + 1,
                });
            }
            decoder.next_image().map_err(|e| decode_error(path, e))?;
        }

        let (width, height) = decoder.dimensions().map_err(|e| decode_error(path, e))?;
        let color = decoder.colortype().map_err(|e| decode_error(path, e))?;
        let pixels = decoder.read_image().map_err(|e| decode_error(path, e))?;

        let img = to_dynamic(width, height, color, pixels).ok_or_else(|| {
            IngestError::DecodeFailed {
                path: path.to_path_buf(),
                detail: format!("page {}: unsupported colour type {:?}", page_index + 1, color),
            }
        })?;
        let img = fit_width(img, max_width);
        debug!(
            "Page {}: rasterised {}x{} → {}x{}",
            page_index + 1,
            width,
            height,
            img.width(),
            img.height()
        );

        encode_png(&img).map_err(|e| IngestError::DecodeFailed {
            path: path.to_path_buf(),
            detail: format!("PNG encoding failed: {e}"),
        })
    }
}

/// Downscale to `max_width`, keeping the aspect ratio. Never upscales.
pub fn fit_width(img: DynamicImage, max_width: u32) -> DynamicImage {
    if img.width() <= max_width {
        return img;
    }
    img.resize(max_width, u32::MAX, FilterType::Lanczos3)
}

fn to_dynamic(
    width: u32,
    height: u32,
    color: ColorType,
    pixels: DecodingResult,
) -> Option<DynamicImage> {
    match (color, pixels) {
        (ColorType::Gray(1), DecodingResult::U8(buf)) => {
            Some(DynamicImage::ImageLuma8(unpack_bilevel(width, height, &buf)?))
        }
        (ColorType::Gray(8), DecodingResult::U8(buf)) => {
            ImageBuffer::<Luma<u8>, _>::from_raw(width, height, buf).map(DynamicImage::ImageLuma8)
        }
        (ColorType::Gray(16), DecodingResult::U16(buf)) => {
            ImageBuffer::<Luma<u16>, _>::from_raw(width, height, buf)
                .map(DynamicImage::ImageLuma16)
        }
        (ColorType::GrayA(8), DecodingResult::U8(buf)) => {
            ImageBuffer::<LumaA<u8>, _>::from_raw(width, height, buf)
                .map(DynamicImage::ImageLumaA8)
        }
        (ColorType::RGB(8), DecodingResult::U8(buf)) => {
            ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, buf).map(DynamicImage::ImageRgb8)
        }
        (ColorType::RGB(16), DecodingResult::U16(buf)) => {
            ImageBuffer::<Rgb<u16>, _>::from_raw(width, height, buf).map(DynamicImage::ImageRgb16)
        }
        (ColorType::RGBA(8), DecodingResult::U8(buf)) => {
            ImageBuffer::<Rgba<u8>, _>::from_raw(width, height, buf).map(DynamicImage::ImageRgba8)
        }
        (ColorType::RGBA(16), DecodingResult::U16(buf)) => {
            ImageBuffer::<Rgba<u16>, _>::from_raw(width, height, buf)
                .map(DynamicImage::ImageRgba16)
        }
        _ => None,
    }
}

/// Expand 1-bit rows (each padded to a byte boundary) to 8-bit grey.
fn unpack_bilevel(width: u32, height: u32, packed: &[u8]) -> Option<ImageBuffer<Luma<u8>, Vec<u8>>> {
    let row_bytes = (width as usize).div_ceil(8);
    if packed.len() < row_bytes * height as usize {
        return None;
    }
    Some(ImageBuffer::from_fn(width, height, |x, y| {
        let byte = packed[y as usize * row_bytes + x as usize / 8];
        let bit = (byte >> (7 - (x % 8))) & 1;
        Luma([if bit == 1 { 255 } else { 0 }])
    }))
}

fn decode_error(path: &Path, e: tiff::TiffError) -> IngestError {
    IngestError::DecodeFailed {
        path: path.to_path_buf(),
        detail: e.to_string(),
    }
}
