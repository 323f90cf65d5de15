//! Service facade: the request/response contract consumed by the serverless
//! worker loop and the operator CLI.

use crate::engine::EngineHandle;
use crate::error::{FailureKind, SwapError};
use crate::memory;
use crate::pipeline::SwapRequest;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use faceswap_models::{Maintained, ModelReadiness, RecoveryReport, StoreError, Validity};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Structured outcome of one swap. Never carries a partial image.
#[derive(Debug, Clone, Serialize)]
pub struct SwapResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_base64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailureKind>,
}

impl SwapResult {
    pub fn failure(err: &SwapError) -> Self {
        Self {
            success: false,
            image_base64: None,
            width: None,
            height: None,
            message: Some(err.to_string()),
            kind: Some(err.kind()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FixModelReport {
    pub artifacts: Vec<RecoveryReport>,
    pub all_valid: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub models: Vec<ModelReadiness>,
    pub memory_usage_mb: Option<f64>,
    pub version: &'static str,
}

pub struct Service {
    engine: EngineHandle,
    models: Arc<dyn Maintained>,
    request_timeout: Duration,
}

impl Service {
    pub fn new(engine: EngineHandle, models: Arc<dyn Maintained>, request_timeout: Duration) -> Self {
        Self {
            engine,
            models,
            request_timeout,
        }
    }

    pub async fn swap(&self, request: SwapRequest) -> SwapResult {
        tracing::info!(
            source_index = request.source_index,
            target_index = request.target_index,
            "swap requested"
        );
        match self.engine.swap(request, self.request_timeout).await {
            Ok(out) => SwapResult {
                success: true,
                image_base64: Some(STANDARD.encode(&out.png)),
                width: Some(out.width),
                height: Some(out.height),
                message: None,
                kind: None,
            },
            Err(e) => SwapResult::failure(&e),
        }
    }

    /// Handle a serverless event: `{"input": {...}}` or the bare input object.
    pub async fn handle_event(&self, event: &Value) -> SwapResult {
        match parse_event(event) {
            Ok(request) => self.swap(request).await,
            Err(e) => {
                tracing::warn!(error = %e, "rejected event");
                SwapResult::failure(&e)
            }
        }
    }

    /// Answer one line of the worker protocol.
    ///
    /// The event's `action` (top level or under `input`) selects `health`,
    /// `fix_model` or the default `swap`; an `id` is echoed back.
    pub async fn dispatch_line(&self, line: &str) -> Value {
        let event: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                let err = SwapError::InvalidRequest(format!("invalid JSON event: {e}"));
                return json!(SwapResult::failure(&err));
            }
        };
        let action = event
            .get("input")
            .and_then(|i| i.get("action"))
            .or_else(|| event.get("action"))
            .and_then(Value::as_str)
            .unwrap_or("swap");

        let mut output = match action {
            "health" => json!(self.health().await),
            "fix_model" => json!(self.fix_model().await),
            _ => json!(self.handle_event(&event).await),
        };
        if let (Some(id), Some(obj)) = (event.get("id"), output.as_object_mut()) {
            obj.insert("id".into(), id.clone());
        }
        output
    }

    /// Force every artifact through recovery, then drop all cached handles.
    pub async fn fix_model(&self) -> FixModelReport {
        let models = self.models.clone();
        let artifacts = tokio::task::spawn_blocking(move || {
            let reports = models.fix_all();
            models.invalidate_all();
            reports
        })
        .await
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "fix_model task failed");
            Vec::new()
        });
        let all_valid = !artifacts.is_empty() && artifacts.iter().all(|r| r.final_state == Validity::Valid);
        FixModelReport { artifacts, all_valid }
    }

    pub async fn health(&self) -> HealthReport {
        let models = self.models.clone();
        let readiness = tokio::task::spawn_blocking(move || models.readiness())
            .await
            .unwrap_or_default();
        let status = if !readiness.is_empty() && readiness.iter().all(|m| m.ready) {
            "healthy"
        } else if readiness.iter().any(|m| m.loading) {
            "loading"
        } else {
            "unhealthy"
        };
        HealthReport {
            status,
            models: readiness,
            memory_usage_mb: memory::resident_mb().map(|mb| (mb * 10.0).round() / 10.0),
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    /// Acquire every model so the first request does not pay for loading.
    pub async fn warm_up(&self) -> Result<(), StoreError> {
        let models = self.models.clone();
        tokio::task::spawn_blocking(move || models.warm_up())
            .await
            .unwrap_or_else(|e| {
                Err(StoreError::ModelUnavailable {
                    model: "*".into(),
                    reasons: vec![format!("warm-up task failed: {e}")],
                })
            })
    }
}

/// Build a request from event JSON.
pub fn parse_event(event: &Value) -> Result<SwapRequest, SwapError> {
    let input = match event.get("input") {
        Some(v) if v.is_object() => v,
        _ => event,
    };
    if !input.is_object() {
        return Err(SwapError::InvalidRequest("event input must be a JSON object".into()));
    }

    Ok(SwapRequest {
        source_url: required_str(input, "source_url")?,
        target_url: required_str(input, "target_url")?,
        source_index: index(input, "source_index")?,
        target_index: index(input, "target_index")?,
    })
}

fn required_str(input: &Value, name: &str) -> Result<String, SwapError> {
    match input.get(name).and_then(Value::as_str).map(str::trim) {
        Some(s) if !s.is_empty() => Ok(s.to_string()),
        _ => Err(SwapError::InvalidRequest(format!("Missing required parameter: {name}"))),
    }
}

/// Index fields default to 1. Negative values become 0 so they surface as
/// out-of-range with the detected count.
fn index(input: &Value, name: &str) -> Result<usize, SwapError> {
    let invalid = || SwapError::InvalidRequest(format!("Invalid parameter: {name} must be an integer"));
    match input.get(name) {
        None | Some(Value::Null) => Ok(1),
        Some(Value::Number(n)) => match (n.as_u64(), n.as_i64()) {
            (Some(v), _) => Ok(v as usize),
            (None, Some(_)) => Ok(0),
            _ => Err(invalid()),
        },
        Some(Value::String(s)) => match s.trim().parse::<i64>() {
            Ok(v) => Ok(v.max(0) as usize),
            Err(_) => Err(invalid()),
        },
        Some(_) => Err(invalid()),
    }
}
