//! Command handlers and the dispatch table.
//!
//! Every request runs under exclusive access to the system state; state is
//! mutated only after the corresponding kernel side-effect succeeds, and is
//! persisted before the response leaves the daemon. The one exception to
//! lock discipline is `block-add`/`block-rm`: DNS resolution must not run
//! under the state lock, so the set is mutated first, the lock released for
//! resolve+commit, and the mutation rolled back if the commit fails.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};
use vex_core::profile::Profile;
use vex_core::protocol::{commands, int_arg, str_arg, Request, Response};
use vex_core::state::{ChangedBy, GuardianState, SystemState, WritingTask, MAX_WRITING_LINES};
use vex_core::Paths;

use crate::antitamper::AntiTamper;
use crate::audit::AuditLog;
use crate::compute::{CpuGov, OomSetter};
use crate::firewall::Firewall;
use crate::input::InputMonitor;
use crate::penance::PenanceEngine;
use crate::persist::Persister;
use crate::reaper::{ForbiddenApps, ProcessMonitor};
use crate::shaper::NetShaper;

/// The daemon's coordinators, owned by the router.
pub struct Daemon {
    /// Filesystem layout.
    pub paths: Paths,
    /// The single authoritative state, exclusive-writer.
    pub state: Arc<RwLock<SystemState>>,
    /// Atomic state writer.
    pub persister: Persister,
    /// Append-only audit log.
    pub audit: Arc<AuditLog>,
    /// Traffic shaper.
    pub shaper: Arc<NetShaper>,
    /// Cgroup CPU governor.
    pub cpu: CpuGov,
    /// OOM score writer.
    pub oom: OomSetter,
    /// Domain firewall.
    pub firewall: Arc<Firewall>,
    /// Input surveillance and latency.
    pub input: Arc<InputMonitor>,
    /// Forbidden-process monitor.
    pub reaper: Arc<dyn ProcessMonitor>,
    /// Forbidden-app list store.
    pub apps: Arc<ForbiddenApps>,
    /// Penance engine.
    pub penance: PenanceEngine,
    /// Anti-tamper monitor.
    pub tamper: Arc<AntiTamper>,
    /// Skip all kernel side-effects while keeping state tracking live.
    pub dry_run: bool,
}

impl Daemon {
    /// Routes one request to its handler, persists state, and builds the
    /// response.
    pub async fn dispatch(&self, req: Request) -> Response {
        self.audit_request(&req);

        let mut response = match req.command.as_str() {
            commands::STATUS => self.handle_status().await,
            commands::STATE => self.handle_state().await,
            commands::THROTTLE => self.handle_throttle(&req).await,
            commands::CPU => self.handle_cpu(&req).await,
            commands::LATENCY => self.handle_latency(&req).await,
            commands::OOM => self.handle_oom(&req).await,
            commands::BLOCK_ADD => self.handle_block_add(&req).await,
            commands::BLOCK_REMOVE => self.handle_block_remove(&req).await,
            commands::BLOCK_LIST => self.handle_state().await,
            commands::LINES_SET => self.handle_lines_set(&req).await,
            commands::LINES_CLEAR => self.handle_lines_clear().await,
            commands::LINES_STATUS => self.handle_state().await,
            commands::LINES_SUBMIT => self.handle_lines_submit(&req).await,
            commands::APP_ADD => self.handle_app_add(&req).await,
            commands::APP_REMOVE => self.handle_app_remove(&req).await,
            commands::APP_LIST => self.handle_app_list(),
            commands::PENANCE_INPUT => self.handle_penance_input(&req),
            commands::UNLOCK => self.handle_unlock().await,
            commands::RESET_SCORE => self.handle_reset_score().await,
            commands::CHECK => self.handle_check().await,
            other => Response::failure(format!("unknown command: {other}")),
        };

        // Commit order equals observed mutation order: persist before the
        // response leaves. A persistence failure is reported but does not
        // roll back in-memory state: the daemon keeps enforcing reality
        // and the next mutation re-persists.
        let persist_warning = {
            let mut state = self.state.write().await;
            match self.persister.save(&mut state) {
                Ok(()) => None,
                Err(e) => {
                    warn!(error = %e, command = %req.command, "state persistence failed");
                    Some(format!("warning: state persistence failed: {e}"))
                }
            }
        };
        if let Some(warning) = persist_warning {
            if response.ok {
                response.message = Some(match response.message.take() {
                    Some(msg) => format!("{msg} ({warning})"),
                    None => warning,
                });
            }
        }
        if response.state.is_some() {
            response.state = Some(self.state.read().await.clone());
        }
        response
    }

    fn audit_request(&self, req: &Request) {
        // Submission content never reaches the audit log; argument values
        // for those commands are elided, keys only.
        let details = match req.command.as_str() {
            commands::LINES_SUBMIT | commands::PENANCE_INPUT => {
                let mut keys: Vec<&str> = req.args.keys().map(String::as_str).collect();
                keys.sort_unstable();
                format!("cmd={} args=[{}]", req.command, keys.join(","))
            }
            _ => {
                let mut pairs: Vec<String> = req
                    .args
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect();
                pairs.sort();
                format!("cmd={} args={{{}}}", req.command, pairs.join(", "))
            }
        };
        self.audit.record("IPC", "REQUEST", &details);
    }

    async fn handle_status(&self) -> Response {
        let mut state = self.state.write().await;
        // Refresh the compliance mirror from the authoritative store.
        match self.penance.compliance().load() {
            Ok(cs) => {
                state.compliance.locked = cs.locked;
                state.compliance.failure_score = cs.failure_score;
                state.compliance.task_status = cs.task_status;
            }
            Err(e) => warn!(error = %e, "could not refresh compliance snapshot"),
        }
        Response::success().with_state(state.clone())
    }

    async fn handle_state(&self) -> Response {
        Response::success().with_state(self.state.read().await.clone())
    }

    async fn handle_throttle(&self, req: &Request) -> Response {
        let profile_str = match str_arg(&req.args, "profile") {
            Ok(p) => p,
            Err(e) => return Response::failure(e.to_string()),
        };
        let profile = match Profile::resolve(profile_str) {
            Ok(p) => p,
            Err(e) => return Response::failure(e.to_string()),
        };

        if self.dry_run {
            info!(profile = %profile, "[dry-run] would apply network profile");
        } else if let Err(e) = self.shaper.apply_profile(profile) {
            return Response::failure(format!("failed to apply profile: {e}"));
        }

        {
            let mut state = self.state.write().await;
            state.network.profile = profile;
            state.network.packet_loss_pct = 0.0;
            state.changed_by = ChangedBy::Cli;
        }
        self.audit.record(
            "THROTTLER",
            "PROFILE_CHANGED",
            &format!("profile={profile} (requested={profile_str}), source=cli"),
        );
        Response::message(format!("Network profile set to: {profile}"))
            .with_state(self.snapshot().await)
    }

    async fn handle_cpu(&self, req: &Request) -> Response {
        let percent = match int_arg(&req.args, "percent") {
            Ok(v) => v,
            Err(e) => return Response::failure(e.to_string()),
        };
        // 0 is the reserved "compute disabled" sentinel; handlers refuse it.
        if !(1..=100).contains(&percent) {
            return Response::failure(format!("invalid percentage: {percent}"));
        }
        let percent = percent as u32;

        if self.dry_run {
            info!(percent, "[dry-run] would set cpu limit");
        } else if let Err(e) = self.cpu.set_limit(percent) {
            return Response::failure(format!("failed to set CPU limit: {e}"));
        }

        {
            let mut state = self.state.write().await;
            state.compute.cpu_limit_pct = percent;
            state.changed_by = ChangedBy::Cli;
        }
        self.audit
            .record("THROTTLER", "CPU_CHANGED", &format!("cpu={percent}%, source=cli"));
        Response::message(format!("CPU limit set to {percent}%")).with_state(self.snapshot().await)
    }

    async fn handle_latency(&self, req: &Request) -> Response {
        let ms = match int_arg(&req.args, "ms") {
            Ok(v) => v,
            Err(e) => return Response::failure(e.to_string()),
        };
        if ms < 0 {
            return Response::failure(format!("latency must be >= 0, got {ms}"));
        }
        let ms = ms as u64;

        if self.dry_run {
            info!(ms, "[dry-run] would set input latency");
        } else {
            self.input.set_latency(ms);
        }

        {
            let mut state = self.state.write().await;
            state.compute.input_latency_ms = ms;
            state.changed_by = ChangedBy::Cli;
        }
        self.audit.record(
            "SURVEILLANCE",
            "LATENCY_CHANGED",
            &format!("latency={ms}ms, source=cli"),
        );
        Response::message(format!("Input latency set to {ms}ms")).with_state(self.snapshot().await)
    }

    async fn handle_oom(&self, req: &Request) -> Response {
        let score = match int_arg(&req.args, "score") {
            Ok(v) => v,
            Err(e) => return Response::failure(e.to_string()),
        };
        if !(-1000..=1000).contains(&score) {
            return Response::failure(format!("invalid OOM score: {score}"));
        }
        let score = score as i32;

        if self.dry_run {
            info!(score, "[dry-run] would set oom score");
        } else if let Err(e) = self.oom.apply(score) {
            return Response::failure(format!("failed to set OOM score: {e}"));
        }

        {
            let mut state = self.state.write().await;
            state.compute.oom_score_adj = score;
            state.changed_by = ChangedBy::Cli;
        }
        self.audit
            .record("GUARDIAN", "OOM_CHANGED", &format!("oom_score={score}, source=cli"));
        Response::message(format!("OOM score set to {score}")).with_state(self.snapshot().await)
    }

    async fn handle_block_add(&self, req: &Request) -> Response {
        let domain = match str_arg(&req.args, "domain") {
            Ok(d) => d.to_string(),
            Err(e) => return Response::failure(e.to_string()),
        };

        // Mutate the set under the lock, release for DNS + commit, roll
        // back on commit failure.
        let (rollback, domains) = {
            let mut state = self.state.write().await;
            let rollback = state.guardian.clone();
            if !state.guardian.add_domain(&domain) {
                if state.guardian.blocked_domains.iter().any(|d| {
                    *d == vex_core::state::normalize_domain(&domain)
                }) {
                    return Response::message(format!("Domain '{domain}' is already blocked"))
                        .with_state(state.clone());
                }
                return Response::failure("empty domain");
            }
            (rollback, state.guardian.blocked_domains.clone())
        };

        if self.dry_run {
            info!(domain = %domain, "[dry-run] would rebuild firewall");
        } else if let Err(e) = self.firewall.set_blocklist(domains).await {
            self.restore_guardian(rollback).await;
            return Response::failure(format!("failed to add domain: {e}"));
        }

        {
            let mut state = self.state.write().await;
            state.changed_by = ChangedBy::Cli;
        }
        self.audit.record(
            "GUARDIAN",
            "DOMAIN_BLOCKED",
            &format!("domain={}, source=cli", vex_core::state::normalize_domain(&domain)),
        );
        Response::message(format!("Domain blocked: {domain}")).with_state(self.snapshot().await)
    }

    async fn handle_block_remove(&self, req: &Request) -> Response {
        let domain = match str_arg(&req.args, "domain") {
            Ok(d) => d.to_string(),
            Err(e) => return Response::failure(e.to_string()),
        };

        let (rollback, domains) = {
            let mut state = self.state.write().await;
            let rollback = state.guardian.clone();
            if !state.guardian.remove_domain(&domain) {
                return Response::message(format!("Domain '{domain}' is not in the blocklist"))
                    .with_state(state.clone());
            }
            (rollback, state.guardian.blocked_domains.clone())
        };

        if self.dry_run {
            info!(domain = %domain, "[dry-run] would rebuild firewall");
        } else if let Err(e) = self.firewall.set_blocklist(domains).await {
            self.restore_guardian(rollback).await;
            return Response::failure(format!("failed to remove domain: {e}"));
        }

        {
            let mut state = self.state.write().await;
            state.changed_by = ChangedBy::Cli;
        }
        self.audit.record(
            "GUARDIAN",
            "DOMAIN_UNBLOCKED",
            &format!("domain={}, source=cli", vex_core::state::normalize_domain(&domain)),
        );
        Response::message(format!("Domain unblocked: {domain}")).with_state(self.snapshot().await)
    }

    async fn handle_lines_set(&self, req: &Request) -> Response {
        let phrase = match str_arg(&req.args, "phrase") {
            Ok(p) => p.trim().to_string(),
            Err(e) => return Response::failure(e.to_string()),
        };
        if phrase.is_empty() {
            return Response::failure("missing required argument: phrase");
        }
        let count = match int_arg(&req.args, "count") {
            Ok(c) => c,
            Err(e) => return Response::failure(e.to_string()),
        };
        if count < 1 || count > i64::from(MAX_WRITING_LINES) {
            return Response::failure(format!(
                "count must be between 1 and {MAX_WRITING_LINES}"
            ));
        }

        {
            let mut state = self.state.write().await;
            state.writing = WritingTask {
                active: true,
                phrase: phrase.clone(),
                required: count as u32,
                completed: 0,
            };
            state.changed_by = ChangedBy::Cli;
        }
        self.audit.record(
            "WRITING",
            "TASK_SET",
            &format!("phrase={phrase:?} count={count}"),
        );
        Response::message(format!("Writing task set: {phrase:?} x {count}"))
            .with_state(self.snapshot().await)
    }

    async fn handle_lines_clear(&self) -> Response {
        let was_active = {
            let mut state = self.state.write().await;
            let was_active = state.writing.active;
            state.writing = WritingTask::default();
            state.changed_by = ChangedBy::Cli;
            was_active
        };
        if was_active {
            self.audit
                .record("WRITING", "TASK_CLEARED", "task cancelled by operator");
            Response::message("Writing task cleared.").with_state(self.snapshot().await)
        } else {
            Response::message("No active writing task.").with_state(self.snapshot().await)
        }
    }

    async fn handle_lines_submit(&self, req: &Request) -> Response {
        let Some(line) = req.args.get("line") else {
            return Response::failure("missing required argument: line");
        };

        let mut state = self.state.write().await;
        if !state.writing.active {
            return Response::failure("no active writing task");
        }

        let expected = state.writing.phrase.trim().to_string();
        if line.trim() != expected {
            drop(state);
            self.audit
                .record("WRITING", "LINE_REJECTED", "submitted line does not match phrase");
            return Response::failure(format!("Line does not match. Expected: {expected:?}"));
        }

        state.writing.completed += 1;
        state.changed_by = ChangedBy::Cli;
        let remaining = state.writing.required - state.writing.completed;

        if remaining == 0 {
            let required = state.writing.required;
            state.writing = WritingTask::default();
            drop(state);
            self.audit.record(
                "WRITING",
                "TASK_COMPLETED",
                &format!("required={required} lines accepted"),
            );
            return Response::message("Writing task COMPLETE. Well done.")
                .with_state(self.snapshot().await);
        }

        let required = state.writing.required;
        drop(state);
        self.audit.record("WRITING", "LINE_ACCEPTED", &format!("remaining={remaining}"));
        Response::message(format!("Line accepted. {remaining}/{required} remaining."))
            .with_state(self.snapshot().await)
    }

    async fn handle_app_add(&self, req: &Request) -> Response {
        let app = match str_arg(&req.args, "app") {
            Ok(a) => a.to_string(),
            Err(e) => return Response::failure(e.to_string()),
        };
        match self.apps.add(&app) {
            Ok(true) => {
                self.reaper.update_forbidden_list();
                self.audit
                    .record("GUARDIAN", "APP_FORBIDDEN", &format!("app={app}, source=cli"));
                Response::message(format!("App forbidden: {app}"))
            }
            Ok(false) => Response::message(format!("App '{app}' is already forbidden")),
            Err(e) => Response::failure(format!("failed to add app: {e}")),
        }
    }

    async fn handle_app_remove(&self, req: &Request) -> Response {
        let app = match str_arg(&req.args, "app") {
            Ok(a) => a.to_string(),
            Err(e) => return Response::failure(e.to_string()),
        };
        match self.apps.remove(&app) {
            Ok(true) => {
                self.reaper.update_forbidden_list();
                self.audit
                    .record("GUARDIAN", "APP_ALLOWED", &format!("app={app}, source=cli"));
                Response::message(format!("App allowed again: {app}"))
            }
            Ok(false) => Response::message(format!("App '{app}' is not in the forbidden list")),
            Err(e) => Response::failure(format!("failed to remove app: {e}")),
        }
    }

    fn handle_app_list(&self) -> Response {
        Response::message(self.apps.list().join(","))
    }

    fn handle_penance_input(&self, req: &Request) -> Response {
        // Zero-storage: only the line number is registered, never content.
        let num = req.args.get("num").cloned().unwrap_or_default();
        self.audit
            .record("PENANCE", "LINE_RECEIVED", &format!("line={num}"));
        Response::success()
    }

    async fn handle_unlock(&self) -> Response {
        // The client has already verified the signed payload; socket peers
        // are co-privileged by the filesystem ACL.
        if self.dry_run {
            info!("[dry-run] would restore all restrictions to defaults");
        } else {
            if let Err(e) = self.shaper.apply_profile(Profile::Standard) {
                warn!(error = %e, "unlock: failed to restore network");
            }
            if let Err(e) = self.cpu.set_limit(100) {
                warn!(error = %e, "unlock: failed to restore CPU");
            }
            if let Err(e) = self.oom.apply(0) {
                warn!(error = %e, "unlock: failed to restore OOM");
            }
            self.input.set_latency(0);
            if let Err(e) = self.firewall.set_blocklist(Vec::new()).await {
                warn!(error = %e, "unlock: failed to clear firewall");
            }
        }

        if let Err(e) = self.penance.compliance().record_completion() {
            warn!(error = %e, "unlock: failed to persist completion");
        }

        {
            let mut state = self.state.write().await;
            state.restore_defaults();
            state.compliance.task_status = vex_core::state::TaskStatus::Completed;
            state.changed_by = ChangedBy::Unlock;
        }
        self.audit.record(
            "SYSTEM",
            "RESTRICTIONS_LIFTED",
            "all restrictions removed and persisted",
        );
        Response::message("System state normalized. You may proceed.")
            .with_state(self.snapshot().await)
    }

    async fn handle_reset_score(&self) -> Response {
        let previous = match self.penance.compliance().reset_score() {
            Ok(p) => p,
            Err(e) => return Response::failure(format!("failed to reset score: {e}")),
        };
        {
            let mut state = self.state.write().await;
            state.compliance.failure_score = 0;
            state.changed_by = ChangedBy::Cli;
        }
        self.audit
            .record("PENANCE", "SCORE_RESET", &format!("score {previous} -> 0"));
        Response::message(format!("Failure score reset: {previous} -> 0"))
            .with_state(self.snapshot().await)
    }

    async fn handle_check(&self) -> Response {
        match self.tamper.run_all_checks().await {
            Ok(()) => Response::message("All integrity checks PASSED."),
            Err(e) => Response::failure(format!("INTEGRITY CHECK FAILED: {e}")),
        }
    }

    async fn snapshot(&self) -> SystemState {
        self.state.read().await.clone()
    }

    async fn restore_guardian(&self, rollback: GuardianState) {
        let mut state = self.state.write().await;
        state.guardian = rollback;
    }
}
