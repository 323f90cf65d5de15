//! Structural integrity checks for model artifacts.
//!
//! Checks run in order: the file exists, its size reaches the known-good
//! floor, the ONNX container parses, and (when the manifest pins one) the
//! SHA-256 digest matches. No inference session is ever created here.

use crate::artifact::{ModelArtifact, Validity};
use crate::onnx;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Seek, SeekFrom};
use std::path::Path;

const READ_BUFFER: usize = 64 * 1024;

/// Outcome of an integrity check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Integrity {
    Valid { bytes: u64 },
    Corrupt(CorruptReason),
    Missing,
}

impl Integrity {
    pub fn validity(&self) -> Validity {
        match self {
            Integrity::Valid { .. } => Validity::Valid,
            Integrity::Corrupt(_) => Validity::Corrupt,
            Integrity::Missing => Validity::Missing,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Integrity::Valid { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorruptReason {
    NotAFile,
    TooSmall { size: u64, min: u64 },
    Unreadable(String),
    Malformed(String),
    DigestMismatch { expected: String, actual: String },
}

impl fmt::Display for CorruptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorruptReason::NotAFile => write!(f, "path is not a regular file"),
            CorruptReason::TooSmall { size, min } => {
                write!(f, "file is {size} bytes, below the {min}-byte minimum")
            }
            CorruptReason::Unreadable(e) => write!(f, "unreadable: {e}"),
            CorruptReason::Malformed(e) => write!(f, "not a valid ONNX container: {e}"),
            CorruptReason::DigestMismatch { expected, actual } => {
                write!(f, "sha256 mismatch: expected {expected}, got {actual}")
            }
        }
    }
}

/// Stateless checker; safe to share and call from any thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegrityChecker;

impl IntegrityChecker {
    pub fn check(&self, artifact: &ModelArtifact) -> Integrity {
        self.check_file(&artifact.path, artifact.min_bytes, artifact.sha256.as_deref())
    }

    pub fn check_file(&self, path: &Path, min_bytes: u64, sha256: Option<&str>) -> Integrity {
        let result = check_file(path, min_bytes, sha256);
        match &result {
            Integrity::Valid { bytes } => {
                tracing::debug!(path = %path.display(), bytes, "integrity check passed");
            }
            Integrity::Corrupt(reason) => {
                tracing::warn!(path = %path.display(), %reason, "integrity check failed");
            }
            Integrity::Missing => tracing::debug!(path = %path.display(), "artifact missing"),
        }
        result
    }
}

fn check_file(path: &Path, min_bytes: u64, sha256: Option<&str>) -> Integrity {
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Integrity::Missing,
        Err(e) => return Integrity::Corrupt(CorruptReason::Unreadable(e.to_string())),
    };
    if !metadata.is_file() {
        return Integrity::Corrupt(CorruptReason::NotAFile);
    }

    let size = metadata.len();
    if size < min_bytes {
        return Integrity::Corrupt(CorruptReason::TooSmall { size, min: min_bytes });
    }

    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => return Integrity::Corrupt(CorruptReason::Unreadable(e.to_string())),
    };
    let mut reader = BufReader::with_capacity(READ_BUFFER, file);

    if let Err(e) = onnx::inspect(&mut reader, size) {
        return Integrity::Corrupt(CorruptReason::Malformed(e.to_string()));
    }

    if let Some(expected) = sha256 {
        match digest(&mut reader) {
            Ok(actual) if actual.eq_ignore_ascii_case(expected) => {}
            Ok(actual) => {
                return Integrity::Corrupt(CorruptReason::DigestMismatch {
                    expected: expected.to_string(),
                    actual,
                })
            }
            Err(e) => return Integrity::Corrupt(CorruptReason::Unreadable(e.to_string())),
        }
    }

    Integrity::Valid { bytes: size }
}

fn digest(reader: &mut BufReader<File>) -> io::Result<String> {
    reader.seek(SeekFrom::Start(0))?;
    let mut hasher = Sha256::new();
    io::copy(reader, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}
