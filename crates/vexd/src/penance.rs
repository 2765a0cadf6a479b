//! Penance engine: manifest enforcement and compliance transitions.
//!
//! The engine owns the authoritative compliance store and knows how to
//! press a manifest's override block onto the kernel through the subsystem
//! coordinators. Manifests are re-parsed from disk on every load so edits
//! are never masked by a cache.

use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use vex_core::compliance::{ComplianceError, ComplianceStore};
use vex_core::manifest::{Manifest, ManifestError};
use vex_core::state::ChangedBy;
use vex_core::Paths;

use crate::compute::{ComputeError, CpuGov, OomSetter};
use crate::input::InputMonitor;
use crate::shaper::{NetShaper, ShaperError};

/// Penance engine errors.
#[derive(Debug, Error)]
pub enum PenanceError {
    /// Manifest load/parse failure.
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    /// Compliance store failure.
    #[error(transparent)]
    Compliance(#[from] ComplianceError),
    /// Network enforcement failure.
    #[error("failed to apply network override: {0}")]
    Network(#[from] ShaperError),
    /// Compute enforcement failure.
    #[error("failed to apply compute override: {0}")]
    Compute(#[from] ComputeError),
}

/// Legacy auxiliary throttler state, still written for third-party
/// status-bar consumers.
#[derive(Debug, Serialize, Deserialize)]
struct ThrottlerState {
    active_profile: String,
    packet_loss_pct: f32,
    cpu_limit_pct: u32,
    last_changed: String,
    changed_by: ChangedBy,
}

/// Manifest consumption and compliance bookkeeping.
pub struct PenanceEngine {
    manifest_file: PathBuf,
    throttler_state_file: PathBuf,
    compliance: ComplianceStore,
}

impl PenanceEngine {
    /// An engine over the layout's manifest and compliance files.
    #[must_use]
    pub fn new(paths: &Paths) -> Self {
        Self {
            manifest_file: paths.manifest_file(),
            throttler_state_file: paths.throttler_state_file(),
            compliance: ComplianceStore::new(paths.compliance_file()),
        }
    }

    /// The authoritative compliance store.
    #[must_use]
    pub const fn compliance(&self) -> &ComplianceStore {
        &self.compliance
    }

    /// Loads (re-parsing) the manifest, seeding the unrestricted default
    /// when none is installed.
    ///
    /// # Errors
    ///
    /// Returns [`PenanceError::Manifest`] on parse or seed failure.
    pub fn load_manifest(&self) -> Result<Manifest, PenanceError> {
        Ok(Manifest::load_or_seed(&self.manifest_file)?)
    }

    /// Whether a penalty is currently active. Fails safe: if the
    /// compliance store cannot be read, the penalty is assumed active.
    #[must_use]
    pub fn penalty_active(&self) -> bool {
        self.compliance.load().map_or(true, |cs| cs.locked)
    }

    /// Applies the manifest's override block through the coordinators:
    /// network (profile + loss combined), CPU, OOM, input latency.
    ///
    /// Skipped entirely when the subject is not locked.
    ///
    /// # Errors
    ///
    /// Returns [`PenanceError`] on the first enforcement failure.
    pub fn enforce(
        &self,
        manifest: &Manifest,
        shaper: &NetShaper,
        cpu: &CpuGov,
        oom: &OomSetter,
        input: &InputMonitor,
    ) -> Result<(), PenanceError> {
        let overrides = &manifest.overrides;

        info!(
            profile = %overrides.network.profile,
            loss = f64::from(overrides.network.packet_loss),
            "enforcing manifest network override"
        );
        shaper.apply_profile_with_entropy(overrides.network.profile, overrides.network.packet_loss)?;

        if overrides.compute.cpu_limit > 0 {
            info!(percent = overrides.compute.cpu_limit, "enforcing manifest cpu override");
            cpu.set_limit(overrides.compute.cpu_limit)?;
        }

        self.save_throttler_state(manifest);

        if overrides.compute.oom_score_adj != 0 {
            info!(score = overrides.compute.oom_score_adj, "enforcing manifest oom override");
            oom.apply(overrides.compute.oom_score_adj)?;
        }

        if overrides.compute.input_latency > 0 {
            info!(
                latency_ms = overrides.compute.input_latency,
                "enforcing manifest latency override"
            );
            input.set_latency(overrides.compute.input_latency);
        }

        Ok(())
    }

    /// Selects the task type for the subject's current failure score.
    #[must_use]
    pub fn select_task(&self, manifest: &Manifest) -> String {
        let score = self
            .compliance
            .load()
            .map(|cs| cs.failure_score)
            .unwrap_or_default();
        let selected = manifest.select_task(score);
        info!(score, task = %selected, "escalation matrix selected task");
        selected
    }

    /// Best-effort write of the legacy throttler-state file.
    fn save_throttler_state(&self, manifest: &Manifest) {
        let state = ThrottlerState {
            active_profile: manifest.overrides.network.profile.to_string(),
            packet_loss_pct: manifest.overrides.network.packet_loss,
            cpu_limit_pct: manifest.overrides.compute.cpu_limit,
            last_changed: Utc::now().to_rfc3339(),
            changed_by: ChangedBy::Penance,
        };
        let write = || -> Result<(), std::io::Error> {
            if let Some(parent) = self.throttler_state_file.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(
                &self.throttler_state_file,
                serde_json::to_vec_pretty(&state)?,
            )
        };
        if let Err(e) = write() {
            warn!(error = %e, "could not persist legacy throttler state");
        }
    }
}
