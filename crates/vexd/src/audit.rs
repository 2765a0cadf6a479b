//! Append-only audit log.
//!
//! Every state-mutating command handler emits at least one record. Records
//! are dual-written: appended to the log file and mirrored into the tracing
//! subscriber (which the daemon points at standard error). On first open the
//! file's append-only attribute is set best-effort so ordinary users cannot
//! truncate it; failure to do so downgrades to plain append mode with a
//! warning.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{info, warn};

use crate::exec::CommandRunner;

/// Serialized writer over the audit log file.
pub struct AuditLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl AuditLog {
    /// Opens (creating if needed) the audit log in append mode.
    ///
    /// Never fails: if the file cannot be opened the log degrades to
    /// tracing-only operation with a warning.
    #[must_use]
    pub fn open(path: &Path, runner: &Arc<dyn CommandRunner>) -> Self {
        let file = match OpenOptions::new().create(true).append(true).open(path) {
            Ok(f) => {
                enforce_append_only(path, runner);
                Some(f)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "audit log unavailable, tracing only");
                None
            }
        };
        Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        }
    }

    /// A tracing-only log for dry runs and tests.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            path: PathBuf::new(),
            file: Mutex::new(None),
        }
    }

    /// Appends one structured record and mirrors it into tracing.
    pub fn record(&self, module: &str, event: &str, details: &str) {
        info!(target: "audit", module, event, details);

        let mut guard = self.file.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(file) = guard.as_mut() {
            let line = format!(
                "{} [{module}] {event}: {details}\n",
                Utc::now().to_rfc3339()
            );
            if let Err(e) = file.write_all(line.as_bytes()) {
                warn!(path = %self.path.display(), error = %e, "audit append failed");
            }
        }
    }
}

/// Best-effort `chattr +a` so the log survives casual tampering.
fn enforce_append_only(path: &Path, runner: &Arc<dyn CommandRunner>) {
    match runner.run("chattr", &["+a", &path.display().to_string()]) {
        Ok(output) if output.status.success() => {}
        Ok(output) => {
            warn!(
                path = %path.display(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "could not set append-only attribute, continuing with plain append"
            );
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "chattr unavailable");
        }
    }
}
