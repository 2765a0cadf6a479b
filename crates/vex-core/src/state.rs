//! The unified persisted system state.
//!
//! [`SystemState`] is the single file that captures every enforceable
//! setting. The daemon loads it on startup, applies each section to the
//! kernel, and persists it after every mutation; the client reads it back
//! through the `status`/`state` commands.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::profile::Profile;

/// Schema version tag written into every persisted state file.
pub const STATE_VERSION: &str = "1.0";

/// Upper bound on the compliance failure score.
pub const MAX_FAILURE_SCORE: u32 = 500;

/// Maximum number of lines a writing task may require.
pub const MAX_WRITING_LINES: u32 = 10_000;

/// Provenance of the last state mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangedBy {
    /// Mutated by an operator command over the socket.
    Cli,
    /// Mutated by penance-manifest enforcement.
    Penance,
    /// Mutated by an authorized wholesale restoration.
    Unlock,
    /// Mutated by the daemon itself (startup sync, cleanup).
    Daemon,
    /// Factory defaults, never yet mutated.
    Default,
    /// Mutated by an anti-tamper escalation.
    Escalation,
}

impl std::fmt::Display for ChangedBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Cli => "cli",
            Self::Penance => "penance",
            Self::Unlock => "unlock",
            Self::Daemon => "daemon",
            Self::Default => "default",
            Self::Escalation => "escalation",
        };
        f.write_str(s)
    }
}

/// Penance task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// No task started yet.
    #[default]
    Pending,
    /// The subject has begun the active task.
    InProgress,
    /// The active task was completed and restrictions lifted.
    Completed,
    /// The active task was failed or abandoned.
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Network-shaping parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkState {
    /// Active shaping profile.
    pub profile: Profile,
    /// Artificial packet loss percentage (0–100).
    pub packet_loss_pct: f32,
}

/// CPU / OOM / input-latency overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeState {
    /// Cgroup CPU quota percentage; 100 means uncapped.
    pub cpu_limit_pct: u32,
    /// The daemon's own `oom_score_adj` (-1000..=1000).
    pub oom_score_adj: i32,
    /// Injected keyboard latency in milliseconds; 0 is pass-through.
    pub input_latency_ms: u64,
}

/// Process-reaper and firewall configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardianState {
    /// True iff the domain blocklist is non-empty.
    pub firewall_enabled: bool,
    /// The forbidden-process reaper is active.
    pub reaper_enabled: bool,
    /// Live blocklist: lowercase FQDNs, insertion-ordered, unique.
    pub blocked_domains: Vec<String>,
}

impl GuardianState {
    /// Inserts a domain (normalized) if absent. Returns whether it was added.
    pub fn add_domain(&mut self, domain: &str) -> bool {
        let domain = normalize_domain(domain);
        if domain.is_empty() || self.blocked_domains.iter().any(|d| *d == domain) {
            return false;
        }
        self.blocked_domains.push(domain);
        self.firewall_enabled = true;
        true
    }

    /// Removes a domain (normalized) if present. Returns whether it was removed.
    pub fn remove_domain(&mut self, domain: &str) -> bool {
        let domain = normalize_domain(domain);
        let before = self.blocked_domains.len();
        self.blocked_domains.retain(|d| *d != domain);
        self.firewall_enabled = !self.blocked_domains.is_empty();
        self.blocked_domains.len() != before
    }
}

/// Normalizes a domain for blocklist membership: trimmed and lowercased.
#[must_use]
pub fn normalize_domain(domain: &str) -> String {
    domain.trim().to_lowercase()
}

/// Snapshot of the compliance tuple.
///
/// The authoritative copy lives in the compliance-status file owned by the
/// penance engine; this block is a refreshable mirror for convenience.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComplianceInfo {
    /// When true, restrictions are enforced.
    pub locked: bool,
    /// Monotonic failure score (0..=500).
    pub failure_score: u32,
    /// Penance task lifecycle status.
    pub task_status: TaskStatus,
}

/// A "write lines" task: the subject must type an exact phrase a set
/// number of times before the task clears. Persists across reboots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WritingTask {
    /// Task armed.
    pub active: bool,
    /// Exact text each submitted line must reproduce.
    pub phrase: String,
    /// Total lines to write (1..=10000 while active).
    pub required: u32,
    /// Lines accepted so far.
    pub completed: u32,
}

/// The single authoritative enforcement record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemState {
    /// Schema version tag.
    pub version: String,
    /// Stamped by the persister on every save.
    pub last_updated: DateTime<Utc>,
    /// Provenance of the last mutation.
    pub changed_by: ChangedBy,
    /// Network-shaping section.
    pub network: NetworkState,
    /// Compute section.
    pub compute: ComputeState,
    /// Guardian section.
    pub guardian: GuardianState,
    /// Compliance snapshot.
    pub compliance: ComplianceInfo,
    /// Writing-task section.
    #[serde(default)]
    pub writing: WritingTask,
}

/// A violated state invariant.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvariantViolation {
    /// `writing.completed` exceeds `writing.required`.
    #[error("writing task: completed {completed} exceeds required {required}")]
    WritingOverflow {
        /// Accepted line count.
        completed: u32,
        /// Required line count.
        required: u32,
    },

    /// Inactive writing task carries residual data.
    #[error("writing task: inactive task must be zeroed")]
    WritingResidue,

    /// Firewall flag disagrees with the blocklist.
    #[error("firewall_enabled must equal blocklist non-emptiness")]
    FirewallFlagMismatch,

    /// CPU limit out of range.
    #[error("cpu_limit_pct {0} outside 0..=100")]
    CpuOutOfRange(u32),

    /// OOM score out of range.
    #[error("oom_score_adj {0} outside -1000..=1000")]
    OomOutOfRange(i32),

    /// Failure score above the cap.
    #[error("failure_score {0} exceeds cap {MAX_FAILURE_SCORE}")]
    ScoreAboveCap(u32),

    /// Blocklist entry not normalized or duplicated.
    #[error("blocked domain {0:?} is not normalized or is duplicated")]
    MalformedBlocklist(String),
}

impl SystemState {
    /// A clean "no restrictions" state.
    #[must_use]
    pub fn factory_default() -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            last_updated: Utc::now(),
            changed_by: ChangedBy::Default,
            network: NetworkState {
                profile: Profile::Standard,
                packet_loss_pct: 0.0,
            },
            compute: ComputeState {
                cpu_limit_pct: 100,
                oom_score_adj: 0,
                input_latency_ms: 0,
            },
            guardian: GuardianState {
                firewall_enabled: false,
                reaper_enabled: true,
                blocked_domains: Vec::new(),
            },
            compliance: ComplianceInfo::default(),
            writing: WritingTask::default(),
        }
    }

    /// Resets every enforceable section to its unrestricted value.
    ///
    /// Used by the authorized `unlock` handler; the caller stamps
    /// `changed_by`.
    pub fn restore_defaults(&mut self) {
        self.network.profile = Profile::Standard;
        self.network.packet_loss_pct = 0.0;
        self.compute.cpu_limit_pct = 100;
        self.compute.oom_score_adj = 0;
        self.compute.input_latency_ms = 0;
        self.guardian.firewall_enabled = false;
        self.guardian.blocked_domains.clear();
        self.compliance.locked = false;
    }

    /// Checks every invariant the data model promises.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.writing.completed > self.writing.required {
            return Err(InvariantViolation::WritingOverflow {
                completed: self.writing.completed,
                required: self.writing.required,
            });
        }
        if !self.writing.active
            && (self.writing.required != 0
                || self.writing.completed != 0
                || !self.writing.phrase.is_empty())
        {
            return Err(InvariantViolation::WritingResidue);
        }
        if self.guardian.firewall_enabled != !self.guardian.blocked_domains.is_empty() {
            return Err(InvariantViolation::FirewallFlagMismatch);
        }
        if self.compute.cpu_limit_pct > 100 {
            return Err(InvariantViolation::CpuOutOfRange(self.compute.cpu_limit_pct));
        }
        if !(-1000..=1000).contains(&self.compute.oom_score_adj) {
            return Err(InvariantViolation::OomOutOfRange(self.compute.oom_score_adj));
        }
        if self.compliance.failure_score > MAX_FAILURE_SCORE {
            return Err(InvariantViolation::ScoreAboveCap(self.compliance.failure_score));
        }
        for (i, d) in self.guardian.blocked_domains.iter().enumerate() {
            if *d != normalize_domain(d)
                || self.guardian.blocked_domains[..i].contains(d)
            {
                return Err(InvariantViolation::MalformedBlocklist(d.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_default_satisfies_invariants() {
        let state = SystemState::factory_default();
        state.check_invariants().unwrap();
        assert_eq!(state.network.profile, Profile::Standard);
        assert_eq!(state.compute.cpu_limit_pct, 100);
        assert!(state.guardian.reaper_enabled);
        assert!(!state.compliance.locked);
    }

    #[test]
    fn add_domain_normalizes_and_deduplicates() {
        let mut g = GuardianState::default();
        assert!(g.add_domain("  Reddit.COM "));
        assert!(!g.add_domain("reddit.com"));
        assert_eq!(g.blocked_domains, vec!["reddit.com"]);
        assert!(g.firewall_enabled);
    }

    #[test]
    fn remove_domain_clears_firewall_flag_when_empty() {
        let mut g = GuardianState::default();
        g.add_domain("twitch.tv");
        assert!(g.remove_domain("TWITCH.TV"));
        assert!(!g.firewall_enabled);
        assert!(!g.remove_domain("twitch.tv"));
    }

    #[test]
    fn empty_domain_is_rejected() {
        let mut g = GuardianState::default();
        assert!(!g.add_domain("   "));
        assert!(g.blocked_domains.is_empty());
    }

    #[test]
    fn residual_writing_task_violates_invariant() {
        let mut state = SystemState::factory_default();
        state.writing.phrase = "I obey".to_string();
        assert_eq!(
            state.check_invariants(),
            Err(InvariantViolation::WritingResidue)
        );
    }

    #[test]
    fn firewall_flag_must_track_blocklist() {
        let mut state = SystemState::factory_default();
        state.guardian.firewall_enabled = true;
        assert_eq!(
            state.check_invariants(),
            Err(InvariantViolation::FirewallFlagMismatch)
        );
    }

    #[test]
    fn restore_defaults_lifts_every_restriction() {
        let mut state = SystemState::factory_default();
        state.network.profile = Profile::BlackHole;
        state.network.packet_loss_pct = 12.0;
        state.compute.cpu_limit_pct = 15;
        state.compute.input_latency_ms = 250;
        state.guardian.add_domain("youtube.com");
        state.compliance.locked = true;

        state.restore_defaults();
        state.check_invariants().unwrap();
        assert_eq!(state.network.profile, Profile::Standard);
        assert_eq!(state.compute.cpu_limit_pct, 100);
        assert!(state.guardian.blocked_domains.is_empty());
        assert!(!state.compliance.locked);
    }

    #[test]
    fn persisted_schema_round_trips() {
        let state = SystemState::factory_default();
        let json = serde_json::to_string_pretty(&state).unwrap();
        let back: SystemState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.version, STATE_VERSION);
        assert_eq!(back.network.profile, Profile::Standard);
        assert_eq!(back.writing, WritingTask::default());
    }

    #[test]
    fn writing_section_defaults_when_absent() {
        // Older state files predate the writing task.
        let json = serde_json::to_string(&SystemState::factory_default()).unwrap();
        let mut value: serde_json::Value = serde_json::from_str(&json).unwrap();
        value.as_object_mut().unwrap().remove("writing");
        let back: SystemState = serde_json::from_value(value).unwrap();
        assert!(!back.writing.active);
    }
}
