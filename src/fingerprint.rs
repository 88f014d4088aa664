//! Cheap identity keys for deduplication.
//!
//! A [`Fingerprint`] is `(file name, byte size, SHA-256 of the first N
//! bytes)`. It runs for every candidate on every scheduler tick, so it reads
//! only a bounded prefix instead of the whole scan.
//!
//! Two files with equal name, size and prefix are treated as the same
//! document. Scans that differ only past the sampled prefix collide; that
//! false positive is accepted.

use crate::error::IngestError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub filename: String,
    pub size: u64,
    /// Lowercase hex SHA-256 of the sampled prefix.
    pub prefix_hash: String,
}

impl Fingerprint {
    /// Fingerprint the file at `path`, hashing at most `sample_bytes`.
    pub fn compute(path: &Path, sample_bytes: usize) -> Result<Self, IngestError> {
        let file = File::open(path).map_err(|e| read_error(path, e))?;
        let size = file.metadata().map_err(|e| read_error(path, e))?.len();

        let mut prefix = Vec::with_capacity(sample_bytes.min(size as usize));
        file.take(sample_bytes as u64)
            .read_to_end(&mut prefix)
            .map_err(|e| read_error(path, e))?;

        Ok(Self {
            filename: file_name(path),
            size,
            prefix_hash: format!("{:x}", Sha256::digest(&prefix)),
        })
    }

    /// The string form used as the history key.
    pub fn key(&self) -> String {
        format!("{}::{}::{}", self.filename, self.size, self.prefix_hash)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// One input file, owned by the File Pool worker that picked it up.
#[derive(Debug, Clone)]
pub struct DocumentTask {
    pub path: PathBuf,
    pub size: u64,
    pub fingerprint: Fingerprint,
}

impl DocumentTask {
    /// Stat and fingerprint a candidate file.
    pub fn discover(path: &Path, sample_bytes: usize) -> Result<Self, IngestError> {
        let fingerprint = Fingerprint::compute(path, sample_bytes)?;
        Ok(Self {
            path: path.to_path_buf(),
            size: fingerprint.size,
            fingerprint,
        })
    }

    pub fn file_name(&self) -> &str {
        &self.fingerprint.filename
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn read_error(path: &Path, e: std::io::Error) -> IngestError {
    if e.kind() == ErrorKind::NotFound {
        IngestError::FileNotFound {
            path: path.to_path_buf(),
        }
    } else {
        IngestError::ReadFailed {
            path: path.to_path_buf(),
            source: e,
        }
    }
}
