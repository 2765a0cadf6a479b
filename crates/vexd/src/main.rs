//! vexd, the enforcement daemon.
//!
//! Owns every subsystem (shaper, guardian, surveillance, penance,
//! anti-tamper), persists unified state to disk, and exposes a Unix-socket
//! command interface for the thin vex-cli control plane.
//!
//! Startup order follows subsystem dependencies: audit log and security
//! first, then persisted state, then the kernel-facing coordinators, then
//! manifest enforcement (which may override network/compute), anti-tamper
//! last, and finally the socket server. On SIGINT/SIGTERM the listener
//! closes, background tasks stop, and kernel residue (qdiscs, nftables)
//! is cleared. Failing a cleanup step logs and proceeds rather than
//! hanging shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use vex_core::security::{self, ManagementKey, SecurityError};
use vex_core::state::ChangedBy;
use vex_core::Paths;
use vexd::antitamper::AntiTamper;
use vexd::audit::AuditLog;
use vexd::compute::{CpuGov, OomSetter};
use vexd::exec::system_runner;
use vexd::firewall::{load_seed_blocklist, Firewall, NftBackend, Resolver};
use vexd::handlers::Daemon;
use vexd::input::InputMonitor;
use vexd::penance::PenanceEngine;
use vexd::persist::Persister;
use vexd::reaper::{build_monitor, ForbiddenApps, MonitorMode, SigkillOps};
use vexd::server::IpcServer;
use vexd::shaper::NetShaper;

/// Expected SHA-256 of this binary, baked in at build time for the
/// anti-tamper self-check. Absent or placeholder values disable the check.
const EXPECTED_BINARY_SHA256: Option<&str> = option_env!("VEXD_EXPECTED_SHA256");

/// vexd - enforcement daemon
#[derive(Parser, Debug)]
#[command(name = "vexd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Skip all kernel side-effects (qdiscs, nftables, cgroups, OOM,
    /// latency, reaping). State tracking, persistence, and the socket
    /// interface stay live.
    #[arg(long)]
    dry_run: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Root all state/config/runtime paths under this directory instead of
    /// the system layout.
    #[arg(long)]
    state_root: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if args.dry_run {
        info!("starting vexd [dry-run mode]");
    } else {
        info!("starting vexd");
    }

    if !args.dry_run && !nix::unistd::Uid::effective().is_root() {
        bail!("vexd must be run as root");
    }

    let paths = args
        .state_root
        .as_deref()
        .map_or_else(Paths::system, Paths::rooted);
    let runner = system_runner();

    let audit = Arc::new(AuditLog::open(&paths.log_file, &runner));

    // Key absence is survivable (restricted commands fail closed in the
    // client); a present-but-malformed key file is a fatal config error.
    match ManagementKey::load(&paths.management_key_file()) {
        Ok(_) => info!("management key present"),
        Err(SecurityError::KeyUnreadable { ref source, .. })
            if source.kind() == std::io::ErrorKind::NotFound =>
        {
            warn!("no management key installed; restricted commands will be denied");
        }
        Err(e) => return Err(e).context("management key file is malformed"),
    }

    // Persisted state + compliance snapshot sync.
    let persister = Persister::new(&paths);
    let mut initial_state = persister.load_or_default();
    let penance = PenanceEngine::new(&paths);
    if let Ok(cs) = penance.compliance().load() {
        initial_state.compliance.locked = cs.locked;
        initial_state.compliance.failure_score = cs.failure_score;
        initial_state.compliance.task_status = cs.task_status;
    }
    let penalty_active = initial_state.compliance.locked;
    if penalty_active {
        info!("compliance state: LOCKED, penalties will be enforced");
    } else {
        info!("compliance state: UNLOCKED, starting from persisted state");
    }

    // Subsystem construction.
    let shaper = if args.dry_run {
        Arc::new(NetShaper::with_interface("lo", runner.clone()))
    } else {
        Arc::new(NetShaper::detect(runner.clone()).context("throttler initialization failed")?)
    };
    let cpu = CpuGov::new();
    let oom = OomSetter::new();
    let firewall = Firewall::new(Arc::new(NftBackend::new(runner.clone())), Resolver::System);
    let apps = ForbiddenApps::load_or_seed(&paths.forbidden_apps_file());
    let reaper = build_monitor(
        MonitorMode::from_env(),
        apps.clone(),
        Arc::new(SigkillOps),
        std::path::Path::new("/proc"),
    );
    let input = InputMonitor::new();
    let state = Arc::new(RwLock::new(initial_state));
    let tamper = Arc::new(AntiTamper::new(
        runner.clone(),
        shaper.clone(),
        penance.compliance().clone(),
        audit.clone(),
        state.clone(),
        persister.clone(),
        EXPECTED_BINARY_SHA256
            .filter(|h| *h != security::HASH_PLACEHOLDER)
            .map(str::to_string),
        args.dry_run,
    ));

    let daemon = Arc::new(Daemon {
        paths: paths.clone(),
        state,
        persister,
        audit: audit.clone(),
        shaper,
        cpu,
        oom,
        firewall,
        input,
        reaper,
        apps,
        penance,
        tamper: tamper.clone(),
        dry_run: args.dry_run,
    });

    if args.dry_run {
        info!("[dry-run] skipping kernel state application");
    } else {
        apply_persisted_state(&daemon, penalty_active).await;
    }

    // Anti-tamper: one synchronous pass, then the periodic loop.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if let Err(e) = tamper.run_all_checks().await {
        warn!(error = %e, "initial integrity check detected issues");
    }
    let tamper_task = tamper.spawn_periodic(shutdown_rx.clone());

    // Persist the resolved state so disk always matches boot reality.
    {
        let mut st = daemon.state.write().await;
        if let Err(e) = daemon.persister.save(&mut st) {
            warn!(error = %e, "failed to persist initial state");
        }
    }

    let server = IpcServer::bind(daemon.clone()).context("failed to start IPC server")?;
    let server_task = tokio::spawn(server.run(shutdown_rx));

    audit.record(
        "DAEMON",
        "STARTED",
        &format!(
            "penalty_active={penalty_active}, dry_run={}, monitor={}",
            args.dry_run,
            daemon.reaper.backend_name()
        ),
    );
    info!("all subsystems initialized, daemon ready");

    // Wait for SIGINT/SIGTERM.
    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
    }

    // Shutdown: close the listener, stop background tasks, clear kernel
    // residue. Residual kernel state beats a hung shutdown, so every step
    // logs-and-continues.
    let _ = shutdown_tx.send(true);
    let _ = server_task.await;
    daemon.reaper.stop();
    daemon.input.stop();
    tamper_task.abort();

    if args.dry_run {
        info!("[dry-run] skipping kernel cleanup");
    } else {
        info!("clearing network qdiscs");
        if let Err(e) = daemon.shaper.apply_profile(vex_core::Profile::Standard) {
            warn!(error = %e, "failed to clear qdiscs");
        }
        info!("clearing guardian firewall");
        daemon.firewall.shutdown().await;
    }

    audit.record("DAEMON", "STOPPED", "shutdown complete");
    info!("daemon shutdown complete");
    Ok(())
}

/// Re-applies the persisted sections to the kernel on boot, then lets the
/// penance manifest override them while the subject is locked.
async fn apply_persisted_state(daemon: &Arc<Daemon>, penalty_active: bool) {
    // The daemon shields itself from the OOM killer while it holds kill
    // authority; persisted overrides may move it afterwards.
    if let Err(e) = daemon.oom.apply(-1000) {
        warn!(error = %e, "failed to engage OOM shield");
    } else {
        info!("OOM shield engaged (-1000)");
    }

    let snapshot = daemon.state.read().await.clone();

    if snapshot.network.packet_loss_pct > 0.0 {
        if let Err(e) = daemon
            .shaper
            .apply_profile_with_entropy(snapshot.network.profile, snapshot.network.packet_loss_pct)
        {
            warn!(error = %e, "failed to apply persisted network state");
        }
    } else if let Err(e) = daemon.shaper.apply_profile(snapshot.network.profile) {
        warn!(error = %e, "failed to apply persisted network profile");
    }

    if (1..=100).contains(&snapshot.compute.cpu_limit_pct) {
        if let Err(e) = daemon.cpu.set_limit(snapshot.compute.cpu_limit_pct) {
            warn!(error = %e, "failed to apply persisted CPU limit");
        }
    }
    if snapshot.compute.oom_score_adj != 0 {
        if let Err(e) = daemon.oom.apply(snapshot.compute.oom_score_adj) {
            warn!(error = %e, "failed to apply persisted OOM score");
        }
    }

    let attached = daemon.input.start();
    info!(keyboards = attached, "surveillance started");
    if snapshot.compute.input_latency_ms > 0 {
        daemon.input.set_latency(snapshot.compute.input_latency_ms);
    }

    if snapshot.guardian.reaper_enabled {
        if let Err(e) = daemon.reaper.start() {
            warn!(error = %e, "failed to start process monitor");
        }
    }

    // Blocklist: persisted domains win; a locked boot with no persisted
    // list seeds from config + defaults.
    let mut domains = snapshot.guardian.blocked_domains.clone();
    if domains.is_empty() && penalty_active {
        domains = load_seed_blocklist(&daemon.paths.blocked_domains_file());
        info!(count = domains.len(), "seeding blocklist for locked boot");
    }
    if domains.is_empty() {
        info!("no active penalty, skipping domain block rules");
    } else {
        match daemon.firewall.set_blocklist(domains.clone()).await {
            Ok(()) => {
                let mut st = daemon.state.write().await;
                st.guardian.blocked_domains = domains;
                st.guardian.firewall_enabled = true;
            }
            Err(e) => warn!(error = %e, "firewall initialization failed"),
        }
    }

    // Manifest enforcement while locked; the enforced overrides become the
    // authoritative state sections.
    if penalty_active {
        match daemon.penance.load_manifest() {
            Ok(manifest) => {
                if let Err(e) = daemon.penance.enforce(
                    &manifest,
                    &daemon.shaper,
                    &daemon.cpu,
                    &daemon.oom,
                    &daemon.input,
                ) {
                    warn!(error = %e, "manifest enforcement failed");
                } else {
                    let mut st = daemon.state.write().await;
                    st.network.profile = manifest.overrides.network.profile;
                    st.network.packet_loss_pct = manifest.overrides.network.packet_loss;
                    if manifest.overrides.compute.cpu_limit > 0 {
                        st.compute.cpu_limit_pct = manifest.overrides.compute.cpu_limit;
                    }
                    if manifest.overrides.compute.oom_score_adj != 0 {
                        st.compute.oom_score_adj = manifest.overrides.compute.oom_score_adj;
                    }
                    if manifest.overrides.compute.input_latency > 0 {
                        st.compute.input_latency_ms = manifest.overrides.compute.input_latency;
                    }
                    st.changed_by = ChangedBy::Penance;
                }
            }
            Err(e) => warn!(error = %e, "could not load penance manifest"),
        }
    }
}
