//! Page-level pipeline stages and their external collaborators.
//!
//! ## Data Flow
//!
//! ```text
//! raster ──▶ encode ──▶ llm / inference ──▶ refusal ──▶ page
//! (TIFF IFD)  (PNG/b64)  (vision model)      (classify)   (PageResult)
//! ```
//!
//! 1. [`raster`]: decode one page, cap its width, PNG-encode; runs in
//!    `spawn_blocking` because decoding is CPU-bound
//! 2. [`encode`]: PNG bytes to a base64 `ImageData` for the request body
//! 3. [`inference`]: the transcriber / extractor traits and their error type
//! 4. [`llm`]: `edgequake-llm` implementations; the only stage with
//!    network I/O
//! 5. [`refusal`]: tell a model's apology apart from a transcript
//! 6. [`page`]: Page Processor (deadline, retries) and Page Pool

pub mod encode;
pub mod inference;
pub mod llm;
pub mod page;
pub mod raster;
pub mod refusal;
