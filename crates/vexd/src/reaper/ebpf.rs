//! eBPF exec-tracepoint backend.
//!
//! The high-performance monitor attaches a program to the
//! `sched:sched_process_exec` tracepoint (kernel >= 4.15) and consumes
//! `{pid, ppid, comm, filename}` records from a perf ring in userspace,
//! issuing SIGKILL for forbidden matches. A record whose filename cannot be
//! extracted (the tracepoint's dynamic-offset encoding varies across
//! kernels) degrades to `comm`-only matching.
//!
//! This build does not bundle a BPF object loader; construction performs
//! the kernel gate and then reports the backend unavailable, which the
//! selection layer answers with a transparent fallback to the `/proc`
//! sweep. The port surface is complete so a loader can slot in without
//! touching callers.

use std::sync::Arc;

use super::{ForbiddenApps, KillOps, ProcessMonitor, ReaperError};

/// Minimum kernel for the exec tracepoint.
const MIN_KERNEL: (u32, u32) = (4, 15);

/// The eBPF-based monitor.
pub struct EbpfMonitor {
    #[allow(dead_code)]
    apps: Arc<ForbiddenApps>,
    #[allow(dead_code)]
    kill: Arc<dyn KillOps>,
}

impl std::fmt::Debug for EbpfMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EbpfMonitor").finish_non_exhaustive()
    }
}

impl EbpfMonitor {
    /// Attempts to construct the eBPF monitor.
    ///
    /// # Errors
    ///
    /// Returns [`ReaperError::EbpfUnavailable`] when the kernel predates
    /// the exec tracepoint or no loader is bundled in this build. Callers
    /// fall back to the `/proc` sweep.
    pub fn new(apps: Arc<ForbiddenApps>, kill: Arc<dyn KillOps>) -> Result<Self, ReaperError> {
        let release = std::fs::read_to_string("/proc/sys/kernel/osrelease").unwrap_or_default();
        if !kernel_supports_exec_tracepoint(&release) {
            return Err(ReaperError::EbpfUnavailable(format!(
                "kernel {} predates the sched_process_exec tracepoint (need >= {}.{})",
                release.trim(),
                MIN_KERNEL.0,
                MIN_KERNEL.1
            )));
        }

        let _ = (&apps, &kill);
        Err(ReaperError::EbpfUnavailable(
            "exec-tracepoint loader not bundled in this build".to_string(),
        ))
    }
}

impl ProcessMonitor for EbpfMonitor {
    fn start(&self) -> Result<(), ReaperError> {
        Err(ReaperError::EbpfUnavailable(
            "exec-tracepoint loader not bundled in this build".to_string(),
        ))
    }

    fn stop(&self) {}

    fn update_forbidden_list(&self) {}

    fn backend_name(&self) -> &'static str {
        "eBPF (high-performance)"
    }
}

/// Whether a kernel release string satisfies the tracepoint requirement.
fn kernel_supports_exec_tracepoint(release: &str) -> bool {
    let mut parts = release.trim().split(['.', '-']);
    let major: u32 = match parts.next().and_then(|p| p.parse().ok()) {
        Some(v) => v,
        None => return false,
    };
    let minor: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (major, minor) >= MIN_KERNEL
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reaper::SigkillOps;

    #[test]
    fn kernel_gate_accepts_modern_releases() {
        assert!(kernel_supports_exec_tracepoint("6.18.5-fc"));
        assert!(kernel_supports_exec_tracepoint("5.10.0"));
        assert!(kernel_supports_exec_tracepoint("4.15.0-generic"));
    }

    #[test]
    fn kernel_gate_rejects_old_or_garbled_releases() {
        assert!(!kernel_supports_exec_tracepoint("4.14.99"));
        assert!(!kernel_supports_exec_tracepoint("3.10.0-el7"));
        assert!(!kernel_supports_exec_tracepoint(""));
        assert!(!kernel_supports_exec_tracepoint("unknown"));
    }

    #[test]
    fn construction_reports_unavailable_for_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let apps = ForbiddenApps::load_or_seed(&dir.path().join("forbidden-apps.json"));
        let err = EbpfMonitor::new(apps, Arc::new(SigkillOps)).unwrap_err();
        assert!(matches!(err, ReaperError::EbpfUnavailable(_)));
    }
}
