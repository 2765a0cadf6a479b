//! Anti-tamper monitor.
//!
//! Three independent checks run at startup and every 60 seconds: binary
//! self-hash (when an expected digest is compiled in), debugger detection
//! via `TracerPid`, and service integrity (skipped wholesale when the
//! service unit does not exist, so the daemon can run outside the service
//! manager). Any failure escalates: black-hole network, score doubling
//! with a floor of 50 and a cap of 500, lock, persist.
//!
//! Escalation runs under an exclusive lock with a 30-minute cooldown:
//! a persistent check failure must not inflate the score exponentially.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use vex_core::compliance::ComplianceStore;
use vex_core::profile::Profile;
use vex_core::security;
use vex_core::state::{ChangedBy, SystemState, TaskStatus, MAX_FAILURE_SCORE};

use crate::audit::AuditLog;
use crate::exec::CommandRunner;
use crate::persist::Persister;
use crate::shaper::NetShaper;

/// Interval between periodic check runs.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Cooldown between score-affecting escalations.
pub const ESCALATION_COOLDOWN: Duration = Duration::from_secs(30 * 60);

/// Score applied on the first escalation.
const ESCALATION_FLOOR: u32 = 50;

/// Service unit whose integrity is verified.
const SERVICE_UNIT: &str = "vexd.service";

/// Tamper findings.
#[derive(Debug, Error)]
pub enum TamperError {
    /// One or more checks failed; escalation has already been handled.
    #[error("tamper detected: {0}")]
    Detected(String),
}

/// The anti-tamper coordinator.
pub struct AntiTamper {
    runner: Arc<dyn CommandRunner>,
    shaper: Arc<NetShaper>,
    compliance: ComplianceStore,
    audit: Arc<AuditLog>,
    state: Arc<RwLock<SystemState>>,
    persister: Persister,
    expected_hash: Option<String>,
    proc_status: PathBuf,
    cooldown: Duration,
    dry_run: bool,
    last_escalation: Mutex<Option<Instant>>,
}

impl AntiTamper {
    /// A monitor wired to the given coordinators.
    ///
    /// `expected_hash` is the compiled-in digest; the placeholder sentinel
    /// and `None` both disable the binary check.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        shaper: Arc<NetShaper>,
        compliance: ComplianceStore,
        audit: Arc<AuditLog>,
        state: Arc<RwLock<SystemState>>,
        persister: Persister,
        expected_hash: Option<String>,
        dry_run: bool,
    ) -> Self {
        let expected_hash =
            expected_hash.filter(|h| !h.is_empty() && h != security::HASH_PLACEHOLDER);
        Self {
            runner,
            shaper,
            compliance,
            audit,
            state,
            persister,
            expected_hash,
            proc_status: PathBuf::from("/proc/self/status"),
            cooldown: ESCALATION_COOLDOWN,
            dry_run,
            last_escalation: Mutex::new(None),
        }
    }

    /// Overrides the escalation cooldown (tests).
    #[must_use]
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Overrides the proc status file (tests).
    #[must_use]
    pub fn with_proc_status(mut self, path: PathBuf) -> Self {
        self.proc_status = path;
        self
    }

    /// Runs every check once; escalates internally on any failure.
    ///
    /// # Errors
    ///
    /// Returns [`TamperError::Detected`] with the joined reasons.
    pub async fn run_all_checks(&self) -> Result<(), TamperError> {
        let mut reasons = Vec::new();

        if let Some(reason) = self.check_binary() {
            reasons.push(reason);
        }
        if let Some(reason) = self.check_debugger() {
            reasons.push(reason);
        }
        if let Some(reason) = self.check_service() {
            reasons.push(reason);
        }

        if reasons.is_empty() {
            return Ok(());
        }
        self.escalate(&reasons).await;
        Err(TamperError::Detected(reasons.join("; ")))
    }

    /// Binary self-verification against the compiled-in digest.
    fn check_binary(&self) -> Option<String> {
        let expected = self.expected_hash.as_deref()?;
        match security::verify_binary_integrity(expected) {
            Ok(()) => None,
            Err(e) => Some(format!("binary integrity: {e}")),
        }
    }

    /// `TracerPid` in the process status must be zero.
    fn check_debugger(&self) -> Option<String> {
        let status = match std::fs::read_to_string(&self.proc_status) {
            Ok(s) => s,
            Err(e) => return Some(format!("could not read process status: {e}")),
        };
        for line in status.lines() {
            if let Some(rest) = line.strip_prefix("TracerPid:") {
                let tracer = rest.trim();
                if tracer != "0" {
                    return Some(format!("DEBUGGER DETECTED: TracerPid={tracer}"));
                }
            }
        }
        None
    }

    /// Service integrity: unit must be active, store must be uncorrupted.
    ///
    /// When the unit does not exist at all, every service-integrity check
    /// is skipped; the daemon may legitimately run outside the service
    /// manager.
    fn check_service(&self) -> Option<String> {
        match self.runner.run("systemctl", &["cat", SERVICE_UNIT]) {
            Ok(output) if output.status.success() => {}
            _ => {
                info!("{SERVICE_UNIT} unit not found, skipping service-integrity checks");
                return None;
            }
        }

        if let Ok(output) = self
            .runner
            .run("nix-store", &["--verify", "--check-contents"])
        {
            if !output.status.success() {
                let text = format!(
                    "{}{}",
                    String::from_utf8_lossy(&output.stdout),
                    String::from_utf8_lossy(&output.stderr)
                );
                if text.contains("path") && text.contains("corrupt") {
                    return Some(format!("store corruption detected: {}", text.trim()));
                }
                info!("nix-store verify reported non-critical output");
            }
        }

        match self.runner.run("systemctl", &["is-active", SERVICE_UNIT]) {
            Ok(output) => {
                let status = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !output.status.success() || status != "active" {
                    return Some(format!(
                        "{SERVICE_UNIT} unit exists but is not active (status: {status})"
                    ));
                }
                None
            }
            Err(e) => Some(format!("could not query service status: {e}")),
        }
    }

    /// Escalates on detected tampering, under the cooldown discipline.
    ///
    /// Holds the escalation lock for the whole action so two concurrent
    /// check failures cannot double the score twice.
    pub async fn escalate(&self, reasons: &[String]) {
        let mut last = self.last_escalation.lock().await;

        warn!(?reasons, "anti-tamper escalation triggered");
        self.audit
            .record("ANTITAMPER", "TAMPER_DETECTED", &reasons.join("; "));

        if let Some(at) = *last {
            if at.elapsed() < self.cooldown {
                info!(
                    since_secs = at.elapsed().as_secs(),
                    "escalation cooldown active, skipping score change"
                );
                return;
            }
        }

        if self.dry_run {
            info!("[dry-run] would apply black-hole profile");
        } else if let Err(e) = self.shaper.apply_profile(Profile::BlackHole) {
            error!(error = %e, "failed to apply black-hole profile");
        } else {
            info!("network set to black-hole");
        }

        let mut status = match self.compliance.load() {
            Ok(cs) => cs,
            Err(e) => {
                error!(error = %e, "could not load compliance for escalation");
                return;
            }
        };
        let previous = status.failure_score;
        status.failure_score = if previous == 0 {
            ESCALATION_FLOOR
        } else {
            (previous * 2).min(MAX_FAILURE_SCORE)
        };
        status.locked = true;
        status.task_status = TaskStatus::Failed;
        if let Err(e) = self.compliance.save(&mut status) {
            error!(error = %e, "could not save escalated compliance");
        }

        {
            let mut state = self.state.write().await;
            state.network.profile = Profile::BlackHole;
            state.network.packet_loss_pct = 0.0;
            state.compliance.locked = true;
            state.compliance.failure_score = status.failure_score;
            state.compliance.task_status = TaskStatus::Failed;
            state.changed_by = ChangedBy::Escalation;
            if let Err(e) = self.persister.save(&mut state) {
                warn!(error = %e, "could not persist escalated state");
            }
        }

        self.audit.record(
            "ANTITAMPER",
            "SCORE_DOUBLED",
            &format!("{previous} -> {} (cap {MAX_FAILURE_SCORE})", status.failure_score),
        );
        *last = Some(Instant::now());
    }

    /// Spawns the periodic check loop; stops when the shutdown signal
    /// fires.
    pub fn spawn_periodic(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CHECK_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            info!("anti-tamper monitoring active");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_all_checks().await {
                            warn!(error = %e, "periodic integrity check failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use vex_core::Paths;

    use super::*;
    use crate::exec::testing::MockRunner;

    struct Fixture {
        _dir: tempfile::TempDir,
        mock: Arc<MockRunner>,
        tamper: AntiTamper,
        compliance: ComplianceStore,
        state: Arc<RwLock<SystemState>>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::rooted(dir.path());
        let mock = Arc::new(MockRunner::ok());
        let runner: Arc<dyn CommandRunner> = mock.clone();
        let shaper = Arc::new(NetShaper::with_interface("eth0", mock.clone()));
        let compliance = ComplianceStore::new(paths.compliance_file());
        let state = Arc::new(RwLock::new(SystemState::factory_default()));
        let tamper = AntiTamper::new(
            runner,
            shaper,
            compliance.clone(),
            Arc::new(AuditLog::disabled()),
            state.clone(),
            Persister::new(&paths),
            None,
            false,
        );
        // Status file with no tracer.
        let status_file = dir.path().join("status");
        std::fs::write(&status_file, "Name:\tvexd\nTracerPid:\t0\nUid:\t0\n").unwrap();
        let tamper = tamper.with_proc_status(status_file);
        Fixture {
            _dir: dir,
            mock,
            tamper,
            compliance,
            state,
        }
    }

    #[tokio::test]
    async fn clean_system_passes_all_checks() {
        let f = fixture();
        // systemctl cat fails => service checks skipped entirely.
        f.mock.fail("systemctl", "No files found for vexd.service.");
        f.tamper.run_all_checks().await.unwrap();
        assert_eq!(f.compliance.load().unwrap().failure_score, 0);
    }

    #[tokio::test]
    async fn debugger_detection_escalates_to_floor() {
        let f = fixture();
        f.mock.fail("systemctl", "No files found");
        std::fs::write(
            f.tamper.proc_status.clone(),
            "Name:\tvexd\nTracerPid:\t4242\n",
        )
        .unwrap();

        let err = f.tamper.run_all_checks().await.unwrap_err();
        assert!(err.to_string().contains("TracerPid=4242"));

        let cs = f.compliance.load().unwrap();
        assert_eq!(cs.failure_score, 50);
        assert!(cs.locked);
        assert_eq!(cs.task_status, TaskStatus::Failed);

        // Mirrored into the system state with escalation provenance.
        let state = f.state.read().await;
        assert_eq!(state.network.profile, Profile::BlackHole);
        assert_eq!(state.changed_by, ChangedBy::Escalation);
    }

    #[tokio::test]
    async fn cooldown_suppresses_repeat_doubling() {
        let f = fixture();
        f.mock.fail("systemctl", "No files found");
        std::fs::write(
            f.tamper.proc_status.clone(),
            "Name:\tvexd\nTracerPid:\t4242\n",
        )
        .unwrap();

        // Five consecutive failing checks inside the cooldown window:
        // the score moves exactly once.
        for _ in 0..5 {
            let _ = f.tamper.run_all_checks().await;
        }
        assert_eq!(f.compliance.load().unwrap().failure_score, 50);
    }

    #[tokio::test]
    async fn score_doubles_after_cooldown_expiry() {
        let f = fixture();
        let tamper = f.tamper.with_cooldown(Duration::from_millis(10));
        f.mock.fail("systemctl", "No files found");
        std::fs::write(tamper.proc_status.clone(), "TracerPid:\t7\n").unwrap();

        let _ = tamper.run_all_checks().await;
        assert_eq!(f.compliance.load().unwrap().failure_score, 50);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = tamper.run_all_checks().await;
        assert_eq!(f.compliance.load().unwrap().failure_score, 100);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = tamper.run_all_checks().await;
        assert_eq!(f.compliance.load().unwrap().failure_score, 200);
    }

    #[tokio::test]
    async fn score_caps_at_maximum() {
        let f = fixture();
        let tamper = f.tamper.with_cooldown(Duration::from_millis(0));
        f.mock.fail("systemctl", "No files found");
        std::fs::write(tamper.proc_status.clone(), "TracerPid:\t7\n").unwrap();

        for _ in 0..6 {
            let _ = tamper.run_all_checks().await;
        }
        assert_eq!(f.compliance.load().unwrap().failure_score, MAX_FAILURE_SCORE);
    }

    #[tokio::test]
    async fn missing_unit_skips_service_checks() {
        let f = fixture();
        f.mock.fail("systemctl", "No files found for vexd.service.");
        f.tamper.run_all_checks().await.unwrap();
        // nix-store must not even be consulted when the unit is absent.
        assert!(f.mock.calls_to("nix-store").is_empty());
    }

    #[tokio::test]
    async fn inactive_unit_is_a_finding() {
        let f = fixture();
        // `systemctl cat` succeeds (unit exists) but `is-active` reports
        // inactive. The mock keys on program name, so both subcommands
        // succeed; script the stdout to be "inactive".
        f.mock.respond("systemctl", "inactive");
        let err = f.tamper.run_all_checks().await.unwrap_err();
        assert!(err.to_string().contains("not active"));
    }

    #[tokio::test]
    async fn active_unit_with_clean_store_passes() {
        let f = fixture();
        f.mock.respond("systemctl", "active");
        f.tamper.run_all_checks().await.unwrap();
    }

    #[tokio::test]
    async fn store_corruption_keywords_trip_the_check() {
        let f = fixture();
        f.mock.respond("systemctl", "active");
        f.mock
            .fail("nix-store", "path '/nix/store/abc' was modified! it is corrupt");
        let err = f.tamper.run_all_checks().await.unwrap_err();
        assert!(err.to_string().contains("corruption"));
    }

    #[tokio::test]
    async fn store_warning_without_corruption_is_ignored() {
        let f = fixture();
        f.mock.respond("systemctl", "active");
        f.mock.fail("nix-store", "warning: hash mismatch in metadata");
        f.tamper.run_all_checks().await.unwrap();
    }
}
