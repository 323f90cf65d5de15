//! Model store.
//!
//! Resolves a logical model name to a loaded handle. The first `acquire` for a
//! model validates (and if needed recovers) its artifacts, then loads the
//! preferred variant; later calls return the cached handle without touching
//! disk. Each model has one slot lock, so N concurrent first callers run a
//! single validate/recover/load sequence and all receive the same `Arc`.

use crate::artifact::{ArtifactId, ModelArtifact, Validity, Variant};
use crate::manifest::ModelSpec;
use crate::recovery::{RecoveryController, RecoveryError, RecoveryMode, RecoveryReport};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("unknown model: {0}")]
    UnknownModel(String),
    #[error("model {model} unavailable: {}", .reasons.join("; "))]
    ModelUnavailable { model: String, reasons: Vec<String> },
}

/// Turns a validated artifact into a usable in-memory model.
pub trait ModelLoader: Send + Sync {
    type Handle: Send + Sync;
    type Error: fmt::Display;

    fn load(&self, artifact: &ModelArtifact) -> Result<Self::Handle, Self::Error>;
}

/// A loaded model together with the artifact it came from.
#[derive(Debug)]
pub struct LoadedModel<H> {
    pub id: ArtifactId,
    pub path: PathBuf,
    pub model: H,
}

pub type ModelHandle<H> = Arc<LoadedModel<H>>;

/// Per-model readiness, as reported by health checks.
#[derive(Debug, Clone, Serialize)]
pub struct ModelReadiness {
    pub model: String,
    pub ready: bool,
    pub loading: bool,
    pub active_variant: Option<Variant>,
    pub path: Option<PathBuf>,
    pub validity: Validity,
}

/// Operator-facing maintenance over a store, independent of its handle type.
pub trait Maintained: Send + Sync {
    /// Acquire every registered model with its registered preference.
    fn warm_up(&self) -> Result<(), StoreError>;
    /// Force every artifact through a full recovery cycle and drop cached handles.
    fn fix_all(&self) -> Vec<RecoveryReport>;
    fn readiness(&self) -> Vec<ModelReadiness>;
    fn invalidate_all(&self);
}

struct Slot<H> {
    artifacts: Vec<ModelArtifact>,
    active: Option<ModelHandle<H>>,
}

struct Entry<H> {
    preference: Vec<Variant>,
    slot: Mutex<Slot<H>>,
}

impl<H> Entry<H> {
    fn lock(&self) -> MutexGuard<'_, Slot<H>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ModelStore<L: ModelLoader> {
    loader: L,
    recovery: Arc<RecoveryController>,
    entries: BTreeMap<String, Entry<L::Handle>>,
}

impl<L: ModelLoader> ModelStore<L> {
    pub fn new(loader: L, recovery: Arc<RecoveryController>) -> Self {
        Self {
            loader,
            recovery,
            entries: BTreeMap::new(),
        }
    }

    /// Register a model. `preference` orders its variants; variants the
    /// manifest declares but `preference` omits are tried last, in manifest order.
    pub fn with_model(mut self, spec: &ModelSpec, model_dir: &Path, preference: &[Variant]) -> Self {
        let mut order: Vec<Variant> = preference
            .iter()
            .copied()
            .filter(|v| spec.variants().any(|d| d == *v))
            .collect();
        for v in spec.variants() {
            if !order.contains(&v) {
                order.push(v);
            }
        }
        self.entries.insert(
            spec.name.clone(),
            Entry {
                preference: order,
                slot: Mutex::new(Slot {
                    artifacts: spec.artifacts(model_dir),
                    active: None,
                }),
            },
        );
        self
    }

    /// Return a loaded handle for `model`, trying variants in `preference`
    /// order (the registered order when empty).
    pub fn acquire(&self, model: &str, preference: &[Variant]) -> Result<ModelHandle<L::Handle>, StoreError> {
        let entry = self
            .entries
            .get(model)
            .ok_or_else(|| StoreError::UnknownModel(model.to_string()))?;
        let mut slot = entry.lock();

        if let Some(handle) = &slot.active {
            return Ok(handle.clone());
        }

        let order = if preference.is_empty() {
            entry.preference.as_slice()
        } else {
            preference
        };

        let mut reasons = Vec::new();
        for &variant in order {
            let Some(idx) = slot.artifacts.iter().position(|a| a.id.variant == variant) else {
                reasons.push(format!("{variant}: not declared"));
                continue;
            };
            let artifact = &mut slot.artifacts[idx];
            match self.try_variant(artifact) {
                Ok(handle) => {
                    let handle = Arc::new(handle);
                    tracing::info!(artifact = %handle.id, path = %handle.path.display(), "model ready");
                    slot.active = Some(handle.clone());
                    return Ok(handle);
                }
                Err(reason) => {
                    tracing::warn!(model, %variant, %reason, "variant unavailable, trying next");
                    reasons.push(format!("{variant}: {reason}"));
                }
            }
        }

        tracing::error!(model, reasons = %reasons.join("; "), "model unavailable");
        Err(StoreError::ModelUnavailable {
            model: model.to_string(),
            reasons,
        })
    }

    fn try_variant(&self, artifact: &mut ModelArtifact) -> Result<LoadedModel<L::Handle>, String> {
        self.recovery
            .recover(artifact, RecoveryMode::IfInvalid)
            .map_err(|e| describe(&e))?;

        match self.loader.load(artifact) {
            Ok(model) => return Ok(self.loaded(artifact, model)),
            Err(e) => {
                tracing::warn!(artifact = %artifact.id, error = %e, "load failed on a valid-looking file");
                artifact.validity = Validity::Corrupt;
            }
        }

        // Parseable but unloadable: treat as corrupt and run the full cycle once.
        self.recovery
            .recover(artifact, RecoveryMode::Forced)
            .map_err(|e| describe(&e))?;
        match self.loader.load(artifact) {
            Ok(model) => Ok(self.loaded(artifact, model)),
            Err(e) => {
                artifact.validity = Validity::Corrupt;
                Err(format!("load failed after recovery: {e}"))
            }
        }
    }

    fn loaded(&self, artifact: &ModelArtifact, model: L::Handle) -> LoadedModel<L::Handle> {
        LoadedModel {
            id: artifact.id.clone(),
            path: artifact.path.clone(),
            model,
        }
    }

    /// Drop the cached handle so the next `acquire` revalidates from disk.
    pub fn invalidate(&self, model: &str) {
        let Some(entry) = self.entries.get(model) else {
            return;
        };
        let mut slot = entry.lock();
        if let Some(active) = slot.active.take() {
            tracing::warn!(artifact = %active.id, "model handle invalidated");
            if let Some(a) = slot.artifacts.iter_mut().find(|a| a.id == active.id) {
                a.validity = Validity::Unknown;
            }
        }
    }
}

fn describe(e: &RecoveryError) -> String {
    match e {
        RecoveryError::Exhausted { attempts, last, .. } => {
            format!("recovery exhausted after {attempts} attempt(s): {last}")
        }
        RecoveryError::Filesystem { message, .. } => message.clone(),
    }
}

impl<L: ModelLoader> Maintained for ModelStore<L> {
    fn warm_up(&self) -> Result<(), StoreError> {
        for name in self.entries.keys() {
            self.acquire(name, &[])?;
        }
        Ok(())
    }

    fn fix_all(&self) -> Vec<RecoveryReport> {
        let mut reports = Vec::new();
        for (name, entry) in &self.entries {
            let mut slot = entry.lock();
            slot.active = None;
            for artifact in slot.artifacts.iter_mut() {
                let report = match self.recovery.recover(artifact, RecoveryMode::Forced) {
                    Ok(report) => report,
                    Err(RecoveryError::Exhausted { report, .. }) => *report,
                    Err(e @ RecoveryError::Filesystem { .. }) => {
                        let state = self.recovery.checker().check(artifact).validity();
                        artifact.validity = state;
                        RecoveryReport {
                            model: name.clone(),
                            variant: artifact.id.variant.to_string(),
                            path: artifact.path.clone(),
                            prior_state: state,
                            final_state: state,
                            bytes: 0,
                            archived_to: None,
                            attempts: 0,
                            error: Some(e.to_string()),
                        }
                    }
                };
                reports.push(report);
            }
        }
        reports
    }

    fn readiness(&self) -> Vec<ModelReadiness> {
        self.entries
            .iter()
            .map(|(name, entry)| match entry.slot.try_lock() {
                Ok(slot) => readiness_of(name, entry, &slot),
                Err(TryLockError::Poisoned(p)) => readiness_of(name, entry, &p.into_inner()),
                Err(TryLockError::WouldBlock) => ModelReadiness {
                    model: name.clone(),
                    ready: false,
                    loading: true,
                    active_variant: None,
                    path: None,
                    validity: Validity::Unknown,
                },
            })
            .collect()
    }

    fn invalidate_all(&self) {
        for name in self.entries.keys() {
            self.invalidate(name);
        }
    }
}

fn readiness_of<H>(name: &str, entry: &Entry<H>, slot: &Slot<H>) -> ModelReadiness {
    if let Some(active) = &slot.active {
        return ModelReadiness {
            model: name.to_string(),
            ready: true,
            loading: false,
            active_variant: Some(active.id.variant),
            path: Some(active.path.clone()),
            validity: Validity::Valid,
        };
    }
    let preferred = entry
        .preference
        .first()
        .and_then(|v| slot.artifacts.iter().find(|a| a.id.variant == *v));
    ModelReadiness {
        model: name.to_string(),
        ready: false,
        loading: false,
        active_variant: None,
        path: preferred.map(|a| a.path.clone()),
        validity: preferred.map(|a| a.validity).unwrap_or(Validity::Unknown),
    }
}
