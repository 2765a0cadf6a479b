//! The penance manifest: a read-only external input describing the active
//! disciplinary task, the system overrides enforced while locked, and the
//! escalation matrix that maps failure scores to harder task pools.
//!
//! The daemon only consumes manifests; authoring lives out-of-band. The
//! manifest is re-parsed on every load so file edits are never hidden by a
//! stale cache.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::profile::Profile;

/// Manifest loading errors.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The manifest file could not be read.
    #[error("failed to read manifest: {0}")]
    Io(#[from] std::io::Error),
    /// The manifest file could not be parsed.
    #[error("failed to parse manifest: {0}")]
    Parse(#[from] serde_json::Error),
}

/// The signed penance manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Manifest schema version.
    #[serde(rename = "manifest_version", default)]
    pub version: String,
    /// Authoring metadata.
    #[serde(default)]
    pub meta: ManifestMeta,
    /// The currently assigned task.
    #[serde(rename = "active_penance", default)]
    pub active: ActivePenance,
    /// System overrides enforced while the subject is locked.
    #[serde(rename = "system_state_overrides", default)]
    pub overrides: SystemOverrides,
    /// Score-threshold escalation matrix.
    #[serde(rename = "escalation_matrix", default)]
    pub escalation: EscalationMatrix,
}

/// Manifest authoring metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestMeta {
    /// Identifier of the subject this manifest targets.
    #[serde(default)]
    pub target_id: String,
    /// When the manifest was authored.
    #[serde(default)]
    pub last_updated: String,
    /// Free-form authorization note.
    #[serde(default)]
    pub authorization: String,
}

/// The currently assigned penance task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivePenance {
    /// Stable task identifier.
    #[serde(default)]
    pub task_id: String,
    /// Task type name (feeds the escalation matrix pools).
    #[serde(rename = "type", default)]
    pub task_type: String,
    /// Content requirements for typed submissions.
    #[serde(rename = "required_content", default)]
    pub required_content: ContentRequirements,
    /// Typing constraints.
    #[serde(default)]
    pub constraints: TaskConstraints,
}

/// What a typed submission must contain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentRequirements {
    /// Topic shown to the subject.
    #[serde(default)]
    pub topic: String,
    /// Minimum whitespace-separated word count.
    #[serde(default)]
    pub min_word_count: usize,
    /// Every string here must appear as a substring of the submission.
    #[serde(default)]
    pub validation_strings: Vec<String>,
}

/// Typing-rhythm and editing constraints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConstraints {
    /// When false, lines containing backspace/DEL bytes are rejected whole.
    #[serde(default = "default_true")]
    pub allow_backspace: bool,
    /// Minimum keystrokes per minute when rhythm is enforced.
    #[serde(default)]
    pub min_kpm: u32,
    /// Maximum keystrokes per minute when rhythm is enforced.
    #[serde(default)]
    pub max_kpm: u32,
    /// Whether the KPM window is enforced at all.
    #[serde(default)]
    pub enforce_rhythm: bool,
}

const fn default_true() -> bool {
    true
}

impl Default for TaskConstraints {
    fn default() -> Self {
        Self {
            allow_backspace: true,
            min_kpm: 0,
            max_kpm: 0,
            enforce_rhythm: false,
        }
    }
}

/// System overrides enforced while the subject is locked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemOverrides {
    /// Network override.
    #[serde(default)]
    pub network: NetworkOverride,
    /// Compute override.
    #[serde(default)]
    pub compute: ComputeOverride,
}

impl Default for SystemOverrides {
    fn default() -> Self {
        Self {
            network: NetworkOverride::default(),
            compute: ComputeOverride::default(),
        }
    }
}

/// Network section of the override block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkOverride {
    /// Shaping profile to enforce.
    pub profile: Profile,
    /// Packet loss percentage to combine with the profile.
    #[serde(rename = "packet_loss_pct", default)]
    pub packet_loss: f32,
}

impl Default for NetworkOverride {
    fn default() -> Self {
        Self {
            profile: Profile::Standard,
            packet_loss: 0.0,
        }
    }
}

/// Compute section of the override block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComputeOverride {
    /// CPU quota percentage; 0 means "leave unchanged".
    #[serde(rename = "cpu_limit_pct", default)]
    pub cpu_limit: u32,
    /// OOM score adjustment; 0 means "leave unchanged".
    #[serde(rename = "oom_score_adj", default)]
    pub oom_score_adj: i32,
    /// Input latency in milliseconds; 0 means "leave unchanged".
    #[serde(rename = "input_latency_ms", default)]
    pub input_latency: u64,
}

/// Score-threshold escalation matrix.
///
/// Keys are decimal score thresholds; the pool of the highest threshold
/// not exceeding the current failure score supplies the next task type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EscalationMatrix {
    /// Threshold → task pool.
    #[serde(rename = "score_thresholds", default)]
    pub thresholds: std::collections::HashMap<String, EscalationLevel>,
}

/// One escalation tier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EscalationLevel {
    /// Task types eligible at this tier.
    #[serde(default)]
    pub task_pool: Vec<String>,
    /// Input latency applied at this tier.
    #[serde(default)]
    pub latency: u64,
}

impl Manifest {
    /// Loads and re-parses the manifest from disk.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError`] on read or parse failure.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// A "no restrictions" manifest used when none is installed.
    #[must_use]
    pub fn default_unrestricted() -> Self {
        Self {
            version: "1.0".to_string(),
            meta: ManifestMeta {
                target_id: "unassigned".to_string(),
                last_updated: String::new(),
                authorization: "synthesized default".to_string(),
            },
            active: ActivePenance {
                task_id: "none".to_string(),
                task_type: "reflective_essay".to_string(),
                required_content: ContentRequirements::default(),
                constraints: TaskConstraints::default(),
            },
            overrides: SystemOverrides::default(),
            escalation: EscalationMatrix::default(),
        }
    }

    /// Loads the manifest, synthesizing and persisting the default when the
    /// file is absent.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError`] on parse failure or when the default
    /// cannot be written.
    pub fn load_or_seed(path: &Path) -> Result<Self, ManifestError> {
        match Self::load(path) {
            Ok(m) => Ok(m),
            Err(ManifestError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                let manifest = Self::default_unrestricted();
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, serde_json::to_vec_pretty(&manifest)?)?;
                Ok(manifest)
            }
            Err(e) => Err(e),
        }
    }

    /// Selects the task type for the given failure score.
    ///
    /// Picks the pool of the highest threshold `t` with `score >= t`; within
    /// a pool the pick is `now_nanos mod pool_size`. Falls back to the
    /// active task type when no tier applies or the pool is empty.
    #[must_use]
    pub fn select_task(&self, failure_score: u32) -> String {
        let mut best: Option<(u32, &EscalationLevel)> = None;
        for (raw, level) in &self.escalation.thresholds {
            let Ok(threshold) = raw.trim().parse::<u32>() else {
                continue;
            };
            if failure_score >= threshold
                && best.map_or(true, |(t, _)| threshold >= t)
            {
                best = Some((threshold, level));
            }
        }
        if let Some((_, level)) = best {
            if !level.task_pool.is_empty() {
                let nanos = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map_or(0, |d| d.subsec_nanos() as usize);
                return level.task_pool[nanos % level.task_pool.len()].clone();
            }
        }
        self.active.task_type.clone()
    }
}

/// Outcome of validating a typed submission.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// Every check passed.
    pub valid: bool,
    /// One entry per failed check.
    pub errors: Vec<String>,
}

/// Validates a typed submission against the manifest.
///
/// `kpm` is the observed typing rate; `None` (or a zero rate) skips the
/// rhythm check because there is no data to judge.
#[must_use]
pub fn validate_submission(text: &str, manifest: &Manifest, kpm: Option<f64>) -> ValidationResult {
    let req = &manifest.active.required_content;
    let constraints = &manifest.active.constraints;
    let mut result = ValidationResult {
        valid: true,
        errors: Vec::new(),
    };

    let word_count = text.split_whitespace().count();
    if word_count < req.min_word_count {
        result.valid = false;
        result.errors.push(format!(
            "Word count insufficient: {word_count}/{}",
            req.min_word_count
        ));
    }

    for phrase in &req.validation_strings {
        if !text.contains(phrase.as_str()) {
            result.valid = false;
            result
                .errors
                .push(format!("Missing required phrase: {phrase:?}"));
        }
    }

    if constraints.enforce_rhythm && constraints.min_kpm > 0 {
        if let Some(kpm) = kpm.filter(|k| *k > 0.0) {
            if kpm < f64::from(constraints.min_kpm) {
                result.valid = false;
                result.errors.push(format!(
                    "Typing speed too slow: {kpm:.1} KPM (minimum: {} KPM)",
                    constraints.min_kpm
                ));
            }
            if constraints.max_kpm > 0 && kpm > f64::from(constraints.max_kpm) {
                result.valid = false;
                result.errors.push(format!(
                    "Typing speed suspiciously fast: {kpm:.1} KPM (maximum: {} KPM). Paste detected?",
                    constraints.max_kpm
                ));
            }
        }
    }

    result
}

/// Checks one line against the `allow_backspace` constraint.
///
/// When backspace is disallowed, a line containing an ASCII backspace
/// (0x08) or DEL (0x7F) is rejected whole; the subject retypes the line.
#[must_use]
pub fn validate_line(line: &str, constraints: &TaskConstraints) -> bool {
    if constraints.allow_backspace {
        return true;
    }
    !line.bytes().any(|b| b == 0x08 || b == 0x7f)
}
