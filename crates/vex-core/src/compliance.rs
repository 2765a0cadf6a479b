//! Authoritative compliance-status store.
//!
//! Distinct from the compliance snapshot inside the system state: this file
//! is the source of truth for the failure score, lifetime counters, lock
//! flag, and task status. The snapshot in [`crate::state::SystemState`] is a
//! refreshable mirror.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::state::{MAX_FAILURE_SCORE, TaskStatus};

/// Points added to the failure score per recorded failure.
pub const FAILURE_INCREMENT: u32 = 10;

/// Compliance store errors.
#[derive(Debug, Error)]
pub enum ComplianceError {
    /// The status file could not be read or written.
    #[error("compliance file I/O: {0}")]
    Io(#[from] std::io::Error),
    /// The status file could not be parsed or serialized.
    #[error("compliance file format: {0}")]
    Format(#[from] serde_json::Error),
}

/// The subject's compliance state and failure score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceStatus {
    /// Monotonic failure score, capped at [`MAX_FAILURE_SCORE`].
    pub failure_score: u32,
    /// Identifier of the active task, if any.
    #[serde(default)]
    pub active_task: String,
    /// Task lifecycle status.
    pub task_status: TaskStatus,
    /// When the status last changed.
    pub last_updated: DateTime<Utc>,
    /// Lifetime failure count.
    #[serde(default)]
    pub total_failures: u32,
    /// Lifetime completion count.
    #[serde(default)]
    pub total_completed: u32,
    /// When true, restrictions are enforced.
    pub locked: bool,
}

impl ComplianceStatus {
    /// The state assumed when no status file exists yet: locked, pending.
    #[must_use]
    pub fn initial() -> Self {
        Self {
            failure_score: 0,
            active_task: String::new(),
            task_status: TaskStatus::Pending,
            last_updated: Utc::now(),
            total_failures: 0,
            total_completed: 0,
            locked: true,
        }
    }
}

/// File-backed compliance store.
#[derive(Debug, Clone)]
pub struct ComplianceStore {
    file: PathBuf,
}

impl ComplianceStore {
    /// A store over the given status file.
    #[must_use]
    pub const fn new(file: PathBuf) -> Self {
        Self { file }
    }

    /// Reads the current status, defaulting to [`ComplianceStatus::initial`]
    /// when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`ComplianceError`] on read or parse failure.
    pub fn load(&self) -> Result<ComplianceStatus, ComplianceError> {
        match std::fs::read(&self.file) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(ComplianceStatus::initial())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Persists the status, stamping `last_updated`.
    ///
    /// # Errors
    ///
    /// Returns [`ComplianceError`] on serialization or write failure.
    pub fn save(&self, status: &mut ComplianceStatus) -> Result<(), ComplianceError> {
        status.last_updated = Utc::now();
        if let Some(parent) = self.file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.file, serde_json::to_vec_pretty(status)?)?;
        Ok(())
    }

    /// Records a task failure: +10 score (capped), failed status, locked.
    ///
    /// # Errors
    ///
    /// Returns [`ComplianceError`] if the store cannot be updated.
    pub fn record_failure(&self, reason: &str) -> Result<ComplianceStatus, ComplianceError> {
        let mut status = self.load()?;
        status.failure_score = (status.failure_score + FAILURE_INCREMENT).min(MAX_FAILURE_SCORE);
        status.total_failures += 1;
        status.task_status = TaskStatus::Failed;
        status.locked = true;
        info!(reason, score = status.failure_score, "penance failure recorded");
        self.save(&mut status)?;
        Ok(status)
    }

    /// Records a task completion: completed status, unlocked.
    ///
    /// # Errors
    ///
    /// Returns [`ComplianceError`] if the store cannot be updated.
    pub fn record_completion(&self) -> Result<ComplianceStatus, ComplianceError> {
        let mut status = self.load()?;
        status.total_completed += 1;
        status.task_status = TaskStatus::Completed;
        status.locked = false;
        info!(
            total_completed = status.total_completed,
            "penance task completed"
        );
        self.save(&mut status)?;
        Ok(status)
    }

    /// Transitions pending → in-progress; a no-op in any other status.
    ///
    /// # Errors
    ///
    /// Returns [`ComplianceError`] if the store cannot be updated.
    pub fn mark_in_progress(&self) -> Result<(), ComplianceError> {
        let mut status = self.load()?;
        if status.task_status == TaskStatus::Pending {
            status.task_status = TaskStatus::InProgress;
            self.save(&mut status)?;
        }
        Ok(())
    }

    /// Zeros the failure score and total-failures counter.
    ///
    /// Only reachable through an authorized handler. Returns the previous
    /// score.
    ///
    /// # Errors
    ///
    /// Returns [`ComplianceError`] if the store cannot be updated.
    pub fn reset_score(&self) -> Result<u32, ComplianceError> {
        let mut status = self.load()?;
        let previous = status.failure_score;
        status.failure_score = 0;
        status.total_failures = 0;
        self.save(&mut status)?;
        info!(previous, "failure score reset");
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ComplianceStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ComplianceStore::new(dir.path().join("compliance-status.json"));
        (dir, store)
    }

    #[test]
    fn missing_file_defaults_to_locked_pending() {
        let (_dir, store) = store();
        let status = store.load().unwrap();
        assert!(status.locked);
        assert_eq!(status.task_status, TaskStatus::Pending);
        assert_eq!(status.failure_score, 0);
    }

    #[test]
    fn failure_adds_ten_and_locks() {
        let (_dir, store) = store();
        let status = store.record_failure("submission_rejected").unwrap();
        assert_eq!(status.failure_score, 10);
        assert_eq!(status.total_failures, 1);
        assert_eq!(status.task_status, TaskStatus::Failed);
        assert!(status.locked);

        let status = store.record_failure("submission_rejected").unwrap();
        assert_eq!(status.failure_score, 20);
        assert_eq!(status.total_failures, 2);
    }

    #[test]
    fn failure_score_caps_at_maximum() {
        let (_dir, store) = store();
        let mut status = store.load().unwrap();
        status.failure_score = MAX_FAILURE_SCORE - 4;
        store.save(&mut status).unwrap();

        let status = store.record_failure("tamper").unwrap();
        assert_eq!(status.failure_score, MAX_FAILURE_SCORE);
    }

    #[test]
    fn completion_unlocks() {
        let (_dir, store) = store();
        store.record_failure("first").unwrap();
        let status = store.record_completion().unwrap();
        assert!(!status.locked);
        assert_eq!(status.task_status, TaskStatus::Completed);
        assert_eq!(status.total_completed, 1);
        // Score persists until an explicit reset.
        assert_eq!(status.failure_score, 10);
    }

    #[test]
    fn mark_in_progress_is_idempotent() {
        let (_dir, store) = store();
        let mut status = store.load().unwrap();
        store.save(&mut status).unwrap();

        store.mark_in_progress().unwrap();
        assert_eq!(store.load().unwrap().task_status, TaskStatus::InProgress);
        store.mark_in_progress().unwrap();
        assert_eq!(store.load().unwrap().task_status, TaskStatus::InProgress);

        store.record_completion().unwrap();
        store.mark_in_progress().unwrap();
        assert_eq!(store.load().unwrap().task_status, TaskStatus::Completed);
    }

    #[test]
    fn reset_zeroes_score_and_failures() {
        let (_dir, store) = store();
        store.record_failure("a").unwrap();
        store.record_failure("b").unwrap();
        let previous = store.reset_score().unwrap();
        assert_eq!(previous, 20);
        let status = store.load().unwrap();
        assert_eq!(status.failure_score, 0);
        assert_eq!(status.total_failures, 0);
        // Lifetime completions are untouched by a score reset.
        assert_eq!(status.total_completed, 0);
    }
}
