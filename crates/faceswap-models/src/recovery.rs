//! Recovery controller.
//!
//! Drives one artifact through detect → archive → clear → refetch →
//! revalidate, with a bounded number of attempts. Recovery is serialized per
//! artifact identity: concurrent callers for the same artifact queue on its
//! lock and, once inside, re-check before doing any work, so a second caller
//! observes the first caller's outcome instead of refetching again.
//!
//! Corrupt copies are archived under a timestamped name. A valid copy displaced
//! by a forced cycle goes to the artifact's single `.backup` slot instead.

use crate::artifact::{ArtifactId, ModelArtifact, Validity};
use crate::fetch::ArtifactSource;
use crate::integrity::{Integrity, IntegrityChecker};
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("recovery of {artifact} exhausted after {attempts} attempt(s): {last}")]
    Exhausted {
        artifact: ArtifactId,
        attempts: u32,
        last: String,
        report: Box<RecoveryReport>,
    },
    #[error("recovery of {artifact} failed: {message}")]
    Filesystem { artifact: ArtifactId, message: String },
}

/// Bounded retry with exponential backoff and jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_backoff: DEFAULT_BASE_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, given that `attempt` (1-based) failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if self.base_backoff.is_zero() {
            return Duration::ZERO;
        }
        let exp = self.base_backoff.saturating_mul(1 << attempt.saturating_sub(1).min(10));
        let jitter_ms = self.base_backoff.as_millis().max(1) as u64 / 2;
        exp + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// Per-artifact recovery states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    DetectedCorrupt,
    Cleared,
    Refetching { attempt: u32 },
    Revalidating { attempt: u32 },
    Recovered,
    Exhausted,
}

impl fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryState::DetectedCorrupt => write!(f, "detected-corrupt"),
            RecoveryState::Cleared => write!(f, "cleared"),
            RecoveryState::Refetching { attempt } => write!(f, "refetching#{attempt}"),
            RecoveryState::Revalidating { attempt } => write!(f, "revalidating#{attempt}"),
            RecoveryState::Recovered => write!(f, "recovered"),
            RecoveryState::Exhausted => write!(f, "exhausted"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMode {
    /// Only recover when the artifact does not check out as valid.
    IfInvalid,
    /// Run the full cycle even for a valid artifact.
    Forced,
}

/// What one `recover` call did.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    pub model: String,
    pub variant: String,
    pub path: PathBuf,
    pub prior_state: Validity,
    pub final_state: Validity,
    pub bytes: u64,
    pub archived_to: Option<PathBuf>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct RecoveryController {
    checker: IntegrityChecker,
    source: Arc<dyn ArtifactSource>,
    policy: RetryPolicy,
    cache_dirs: Vec<PathBuf>,
    locks: Mutex<HashMap<ArtifactId, Arc<Mutex<()>>>>,
}

impl RecoveryController {
    pub fn new(source: Arc<dyn ArtifactSource>, policy: RetryPolicy) -> Self {
        Self {
            checker: IntegrityChecker,
            source,
            policy,
            cache_dirs: Vec::new(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Directories holding derived copies that must not outlive a corrupt artifact.
    pub fn with_cache_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.cache_dirs = dirs;
        self
    }

    pub fn checker(&self) -> IntegrityChecker {
        self.checker
    }

    fn lock_for(&self, id: &ArtifactId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(id.clone()).or_default().clone()
    }

    /// Bring `artifact` to a valid state on disk, updating its `validity`.
    ///
    /// Safe to re-run: each step tolerates the effects of a previous partial run.
    pub fn recover(
        &self,
        artifact: &mut ModelArtifact,
        mode: RecoveryMode,
    ) -> Result<RecoveryReport, RecoveryError> {
        let lock = self.lock_for(&artifact.id);
        let _guard: MutexGuard<'_, ()> = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let prior = self.checker.check(artifact);
        let prior_state = prior.validity();
        let mut report = RecoveryReport {
            model: artifact.id.model.clone(),
            variant: artifact.id.variant.to_string(),
            path: artifact.path.clone(),
            prior_state,
            final_state: prior_state,
            bytes: 0,
            archived_to: None,
            attempts: 0,
            error: None,
        };

        if let (Integrity::Valid { bytes }, RecoveryMode::IfInvalid) = (&prior, mode) {
            artifact.validity = Validity::Valid;
            report.bytes = *bytes;
            return Ok(report);
        }

        match prior_state {
            Validity::Missing => {}
            // A valid copy displaced by a forced cycle replaces the previous backup.
            Validity::Valid => report.archived_to = Some(self.set_aside(artifact, artifact.backup_path())?),
            _ => {
                self.transition(artifact, RecoveryState::DetectedCorrupt);
                let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string();
                report.archived_to = Some(self.set_aside(artifact, artifact.archive_path(&stamp))?);
            }
        }
        artifact.validity = Validity::Missing;

        self.clear(artifact);
        self.transition(artifact, RecoveryState::Cleared);

        let staging = artifact.partial_path();
        let mut last = String::from("no attempt made");
        for attempt in 1..=self.policy.max_attempts {
            report.attempts = attempt;
            self.transition(artifact, RecoveryState::Refetching { attempt });

            match self.source.fetch(artifact, &staging) {
                Ok(_) => {
                    self.transition(artifact, RecoveryState::Revalidating { attempt });
                    let check = self.checker.check_file(
                        &staging,
                        artifact.min_bytes,
                        artifact.sha256.as_deref(),
                    );
                    match check {
                        Integrity::Valid { bytes } => {
                            promote(&staging, &artifact.path).map_err(|e| {
                                RecoveryError::Filesystem {
                                    artifact: artifact.id.clone(),
                                    message: format!("failed to activate download: {e}"),
                                }
                            })?;
                            artifact.validity = Validity::Valid;
                            self.transition(artifact, RecoveryState::Recovered);
                            report.final_state = Validity::Valid;
                            report.bytes = bytes;
                            return Ok(report);
                        }
                        Integrity::Corrupt(reason) => last = format!("refetched file corrupt: {reason}"),
                        Integrity::Missing => last = "refetched file missing".into(),
                    }
                }
                Err(e) => last = e.to_string(),
            }

            tracing::warn!(artifact = %artifact.id, attempt, error = %last, "recovery attempt failed");
            remove_if_present(&staging);
            if attempt < self.policy.max_attempts {
                std::thread::sleep(self.policy.backoff(attempt));
            }
        }

        self.transition(artifact, RecoveryState::Exhausted);

        // A forced cycle must not leave a working model worse off than before.
        if prior.is_valid() {
            if let Some(archived) = report.archived_to.take() {
                if std::fs::rename(&archived, &artifact.path).is_ok() {
                    tracing::warn!(artifact = %artifact.id, "refetch failed; restored previous valid copy");
                    artifact.validity = Validity::Valid;
                    report.final_state = Validity::Valid;
                    report.bytes = std::fs::metadata(&artifact.path).map(|m| m.len()).unwrap_or(0);
                    return Ok(report);
                }
                report.archived_to = Some(archived);
            }
        }

        tracing::error!(
            artifact = %artifact.id,
            attempts = report.attempts,
            error = %last,
            "recovery exhausted"
        );
        report.final_state = Validity::Missing;
        report.error = Some(last.clone());
        Err(RecoveryError::Exhausted {
            artifact: artifact.id.clone(),
            attempts: report.attempts,
            last,
            report: Box::new(report),
        })
    }

    fn transition(&self, artifact: &ModelArtifact, state: RecoveryState) {
        tracing::info!(artifact = %artifact.id, %state, "recovery");
    }

    /// Move the active file to `target`, replacing anything already there.
    fn set_aside(&self, artifact: &ModelArtifact, target: PathBuf) -> Result<PathBuf, RecoveryError> {
        std::fs::rename(&artifact.path, &target).map_err(|e| RecoveryError::Filesystem {
            artifact: artifact.id.clone(),
            message: format!("failed to move {} aside: {e}", artifact.path.display()),
        })?;
        tracing::info!(artifact = %artifact.id, archived_to = %target.display(), "moved previous copy aside");
        Ok(target)
    }

    fn clear(&self, artifact: &ModelArtifact) {
        remove_if_present(&artifact.partial_path());
        let name = artifact.file_name();
        if name.is_empty() {
            return;
        }
        for dir in &self.cache_dirs {
            remove_if_present(&dir.join(name));
        }
    }
}

fn promote(staging: &Path, active: &Path) -> std::io::Result<()> {
    std::fs::rename(staging, active)
}

fn remove_if_present(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove"),
    }
}
