//! Request-level failure taxonomy.

use crate::imaging::ImageError;
use faceswap_models::StoreError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Which of the two request images a failure refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Source,
    Target,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Source => "source",
            Role::Target => "target",
        })
    }
}

#[derive(Error, Debug)]
pub enum SwapError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("invalid {role} image: {source}")]
    InvalidImage {
        role: Role,
        #[source]
        source: ImageError,
    },
    #[error("model unavailable: {0}")]
    ModelUnavailable(#[from] StoreError),
    #[error(
        "{role} face index {requested} out of range: {count} face(s) detected \
         (indices are 1-based, ordered left to right)"
    )]
    FaceIndexOutOfRange {
        role: Role,
        requested: usize,
        count: usize,
    },
    #[error("request timed out after {0} seconds")]
    Timeout(u64),
    #[error("request cancelled")]
    Cancelled,
    #[error("worker busy: another swap is in progress, retry shortly")]
    Busy,
    #[error("inference failed: {0}")]
    Inference(String),
}

/// Machine-readable failure class carried on every failed result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidRequest,
    InvalidImage,
    ModelUnavailable,
    FaceIndexOutOfRange,
    Timeout,
    Cancelled,
    Busy,
    Inference,
}

impl SwapError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SwapError::InvalidRequest(_) => FailureKind::InvalidRequest,
            SwapError::InvalidImage { .. } => FailureKind::InvalidImage,
            SwapError::ModelUnavailable(_) => FailureKind::ModelUnavailable,
            SwapError::FaceIndexOutOfRange { .. } => FailureKind::FaceIndexOutOfRange,
            SwapError::Timeout(_) => FailureKind::Timeout,
            SwapError::Cancelled => FailureKind::Cancelled,
            SwapError::Busy => FailureKind::Busy,
            SwapError::Inference(_) => FailureKind::Inference,
        }
    }
}
