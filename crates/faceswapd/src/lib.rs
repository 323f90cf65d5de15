//! faceswapd: face swap inference service.
//!
//! Wires the model store, the inference pipeline and the single-flight engine
//! thread into a [`Service`] answering swap, health and maintenance requests.

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod imaging;
pub mod memory;
pub mod models;
pub mod pipeline;
pub mod service;

pub use config::Config;
pub use error::{FailureKind, SwapError};
pub use pipeline::SwapRequest;
pub use service::{FixModelReport, HealthReport, Service, SwapResult};

use backend::OnnxBackend;
use imaging::HttpImageFetcher;
use models::ModelSet;
use pipeline::Pipeline;
use std::sync::Arc;
use std::time::Duration;

/// Build the production service over `models`, spawning the engine thread.
pub fn build_service(config: &Config, models: Arc<ModelSet>) -> Service {
    let fetcher = HttpImageFetcher::new(Duration::from_secs(config.image_timeout_secs), config.max_image_bytes);
    let pipeline = Pipeline::new(OnnxBackend::new(models.clone()), fetcher, config.max_dimension);
    let engine = engine::spawn_engine(pipeline, config.queue_depth);
    Service::new(engine, models, config.request_timeout())
}
