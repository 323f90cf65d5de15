//! Inference pipeline: fetch → decode → acquire models → locate → validate
//! indices → embed → swap → encode.
//!
//! Runs synchronously on the engine thread. The request context is checked
//! between steps so an abandoned or expired request stops early and drops its
//! buffers; model acquisition already in progress is allowed to finish.

use crate::backend::{BackendError, FaceBackend};
use crate::error::{Role, SwapError};
use crate::imaging::{self, DecodedImage, ImageFetcher};
use crate::memory;
use faceswap_core::FaceDescriptor;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

fn default_index() -> usize {
    1
}

/// One swap request. Face indices are 1-based, ordered left to right.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapRequest {
    pub source_url: String,
    pub target_url: String,
    #[serde(default = "default_index")]
    pub source_index: usize,
    #[serde(default = "default_index")]
    pub target_index: usize,
}

/// Encoded result of a successful swap.
#[derive(Debug)]
pub struct SwapOutput {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Per-request deadline and cancellation flag, shared with the caller.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub id: Uuid,
    deadline: Instant,
    timeout: Duration,
    cancelled: Arc<AtomicBool>,
}

impl RequestContext {
    pub fn new(timeout: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            deadline: Instant::now() + timeout,
            timeout,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fail if the request was abandoned or has run past its deadline.
    pub fn checkpoint(&self, stage: &str) -> Result<(), SwapError> {
        if self.is_cancelled() {
            tracing::info!(request = %self.id, stage, "request cancelled; stopping");
            return Err(SwapError::Cancelled);
        }
        if Instant::now() >= self.deadline {
            tracing::warn!(request = %self.id, stage, "request deadline passed");
            return Err(SwapError::Timeout(self.timeout.as_secs()));
        }
        Ok(())
    }
}

pub struct Pipeline<B, F> {
    backend: B,
    fetcher: F,
    max_dimension: u32,
}

impl<B: FaceBackend, F: ImageFetcher> Pipeline<B, F> {
    pub fn new(backend: B, fetcher: F, max_dimension: u32) -> Self {
        Self {
            backend,
            fetcher,
            max_dimension,
        }
    }

    pub fn process(&mut self, request: &SwapRequest, ctx: &RequestContext) -> Result<SwapOutput, SwapError> {
        let started = Instant::now();
        memory::log_stage("start");
        ctx.checkpoint("start")?;

        let source = self.load_image(&request.source_url, Role::Source)?;
        ctx.checkpoint("source image")?;
        let DecodedImage {
            rgb: target,
            alpha: target_alpha,
        } = self.load_image(&request.target_url, Role::Target)?;
        memory::log_stage("images decoded");
        ctx.checkpoint("target image")?;

        self.backend.prepare()?;
        ctx.checkpoint("models")?;

        let source_faces = self.backend.locate(&source.rgb).map_err(inference)?;
        let target_faces = self.backend.locate(&target).map_err(inference)?;
        tracing::info!(
            request = %ctx.id,
            source_faces = source_faces.len(),
            target_faces = target_faces.len(),
            "faces located"
        );
        memory::log_stage("faces located");

        let mut source_face = select(source_faces, request.source_index, Role::Source)?;
        let target_face = select(target_faces, request.target_index, Role::Target)?;
        ctx.checkpoint("faces")?;

        let embedding = self.backend.embed(&source.rgb, &source_face).map_err(inference)?;
        source_face.embedding = Some(embedding);
        drop(source);
        ctx.checkpoint("embedding")?;

        let swapped = self
            .backend
            .swap(&target, &target_face, &source_face)
            .map_err(inference)?;
        drop(target);
        memory::log_stage("swapped");
        ctx.checkpoint("swap")?;

        let (width, height) = swapped.dimensions();
        let png = imaging::encode_png(&swapped, target_alpha.as_ref())
            .map_err(|e| SwapError::Inference(e.to_string()))?;
        drop(swapped);
        if png.is_empty() {
            return Err(SwapError::Inference("encoder produced no output".into()));
        }
        memory::log_stage("cleanup");

        tracing::info!(
            request = %ctx.id,
            width,
            height,
            bytes = png.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "swap complete"
        );
        Ok(SwapOutput { png, width, height })
    }

    fn load_image(&self, url: &str, role: Role) -> Result<DecodedImage, SwapError> {
        let invalid = |source| SwapError::InvalidImage { role, source };
        let bytes = self.fetcher.fetch(url).map_err(invalid)?;
        let decoded = imaging::decode(&bytes, self.max_dimension).map_err(invalid)?;
        let (w, h) = decoded.dimensions();
        tracing::debug!(%role, width = w, height = h, "image decoded");
        Ok(decoded)
    }
}

/// Pick the face at 1-based `index`; 0 and anything past the count are out of range.
fn select(faces: Vec<FaceDescriptor>, index: usize, role: Role) -> Result<FaceDescriptor, SwapError> {
    let count = faces.len();
    if index == 0 || index > count {
        return Err(SwapError::FaceIndexOutOfRange {
            role,
            requested: index,
            count,
        });
    }
    faces
        .into_iter()
        .nth(index - 1)
        .ok_or(SwapError::FaceIndexOutOfRange {
            role,
            requested: index,
            count,
        })
}

fn inference(e: BackendError) -> SwapError {
    match e {
        BackendError::Unavailable(e) => SwapError::ModelUnavailable(e),
        BackendError::Inference { .. } | BackendError::NotEmbedded { .. } => SwapError::Inference(e.to_string()),
    }
}
