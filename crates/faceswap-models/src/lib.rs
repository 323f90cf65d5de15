//! faceswap-models: on-disk model lifecycle.
//!
//! Manifest, structural integrity checks, artifact sources, the recovery
//! state machine and the single-flight model store.

pub mod artifact;
pub mod fetch;
pub mod integrity;
pub mod manifest;
pub mod onnx;
pub mod recovery;
pub mod store;

#[cfg(test)]
mod testutil;

pub use artifact::{ArtifactId, ModelArtifact, Validity, Variant};
pub use fetch::{ArtifactSource, BundledSource, FetchError, HttpSource, SourceChain};
pub use integrity::{CorruptReason, Integrity, IntegrityChecker};
pub use manifest::{Manifest, ManifestError, ModelSpec};
pub use recovery::{RecoveryController, RecoveryMode, RecoveryReport, RetryPolicy};
pub use store::{LoadedModel, Maintained, ModelHandle, ModelLoader, ModelReadiness, ModelStore, StoreError};
