//! Forbidden-process monitor.
//!
//! Two interchangeable backends satisfy the monitor port: an eBPF
//! exec-tracepoint consumer and a `/proc` sweep. Selection happens at init
//! from `VEX_MONITOR_MODE`; any eBPF construction failure falls back to the
//! procfs backend transparently, with the fallback logged.

mod ebpf;
mod forbidden;
mod proc_scan;

use std::path::Path;
use std::sync::Arc;

pub use ebpf::EbpfMonitor;
pub use forbidden::{ForbiddenApps, ForbiddenListError};
pub use proc_scan::ProcScanMonitor;

use thiserror::Error;
use tracing::{info, warn};

/// Environment variable selecting the monitor backend.
pub const MONITOR_MODE_ENV: &str = "VEX_MONITOR_MODE";

/// Reaper errors.
#[derive(Debug, Error)]
pub enum ReaperError {
    /// The preferred backend cannot run on this system/build.
    #[error("eBPF monitor unavailable: {0}")]
    EbpfUnavailable(String),

    /// The monitor was started twice.
    #[error("monitor already started")]
    AlreadyStarted,
}

/// Which backend to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MonitorMode {
    /// Require the eBPF backend (still falls back on failure).
    Ebpf,
    /// Use the `/proc` sweep directly.
    Proc,
    /// Try eBPF, fall back to `/proc`.
    #[default]
    Auto,
}

impl MonitorMode {
    /// Parses the `VEX_MONITOR_MODE` value; unknown strings mean auto.
    #[must_use]
    pub fn from_env_value(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "ebpf" => Self::Ebpf,
            "proc" => Self::Proc,
            "auto" => Self::Auto,
            other => {
                if !other.is_empty() {
                    warn!(mode = other, "invalid monitor mode, using auto");
                }
                Self::Auto
            }
        }
    }

    /// Reads the mode from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        std::env::var(MONITOR_MODE_ENV)
            .map(|v| Self::from_env_value(&v))
            .unwrap_or_default()
    }
}

/// Delivers SIGKILL. Stubbed in tests.
pub trait KillOps: Send + Sync {
    /// Sends SIGKILL to the pid.
    ///
    /// # Errors
    ///
    /// Returns the kernel error when the signal cannot be delivered.
    fn kill(&self, pid: i32) -> std::io::Result<()>;
}

/// Real SIGKILL delivery.
#[derive(Debug, Default, Clone, Copy)]
pub struct SigkillOps;

impl KillOps for SigkillOps {
    fn kill(&self, pid: i32) -> std::io::Result<()> {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::SIGKILL)
            .map_err(std::io::Error::from)
    }
}

/// The reaper port: anything providing start/stop/list-refresh.
pub trait ProcessMonitor: Send + Sync {
    /// Starts the background monitor.
    ///
    /// # Errors
    ///
    /// Returns [`ReaperError::AlreadyStarted`] on a second call.
    fn start(&self) -> Result<(), ReaperError>;

    /// Signals the monitor to stop; it quits on its next iteration.
    fn stop(&self);

    /// Notifies the live monitor that the forbidden list changed.
    fn update_forbidden_list(&self);

    /// Human-readable backend name for status output.
    fn backend_name(&self) -> &'static str;
}

/// Constructs the configured backend, falling back from eBPF to the
/// `/proc` sweep on any construction failure.
#[must_use]
pub fn build_monitor(
    mode: MonitorMode,
    apps: Arc<ForbiddenApps>,
    kill: Arc<dyn KillOps>,
    proc_root: &Path,
) -> Arc<dyn ProcessMonitor> {
    match mode {
        MonitorMode::Proc => {
            info!("process monitor: /proc polling (standard)");
            Arc::new(ProcScanMonitor::new(apps, kill, proc_root))
        }
        MonitorMode::Ebpf | MonitorMode::Auto => match EbpfMonitor::new(apps.clone(), kill.clone())
        {
            Ok(monitor) => {
                info!("process monitor: eBPF exec tracepoint (high-performance)");
                Arc::new(monitor)
            }
            Err(e) => {
                warn!(error = %e, "eBPF monitor failed to initialize");
                info!("falling back to /proc polling");
                Arc::new(ProcScanMonitor::new(apps, kill, proc_root))
            }
        },
    }
}
