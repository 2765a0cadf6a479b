//! Domain firewall over a dedicated nftables table.
//!
//! The daemon owns one IPv4 table (`vex-guardian`) with a single
//! output-hook chain at filter priority. Each blocked domain (and its
//! `www.` variant) is resolved to IPv4 addresses; every address gets a
//! drop rule for outbound TCP. The rule set is committed atomically by
//! deleting and recreating the table in one transaction.
//!
//! Matching TLS SNI bytes via payload offsets is fragile (variable record
//! layout); IP-level drop with periodic re-resolution is a CDN-aware
//! approximation, kept current by a 30-minute refresh task.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::exec::{output_text, CommandRunner};

/// Name of the daemon-owned nftables table.
pub const TABLE_NAME: &str = "vex-guardian";

/// Name of the output-hook chain inside the table.
pub const CHAIN_NAME: &str = "filter-output";

/// Interval between DNS re-resolutions of the blocklist.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Domains seeded into the blocklist when no config file exists.
const DEFAULT_BLOCKED_DOMAINS: [&str; 4] = [
    "store.steampowered.com",
    "reddit.com",
    "twitch.tv",
    "youtube.com",
];

/// Firewall errors.
#[derive(Debug, Error)]
pub enum FirewallError {
    /// `nft` could not be spawned.
    #[error("failed to run nft: {0}")]
    Spawn(#[from] std::io::Error),

    /// The atomic rule-set commit failed.
    #[error("failed to apply firewall rules: {0}")]
    CommitFailed(String),
}

/// A domain with its currently resolved IPv4 addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDomain {
    /// The blocklist entry (normalized).
    pub domain: String,
    /// Deduplicated IPv4 addresses for the domain and its `www.` variant.
    pub addrs: Vec<Ipv4Addr>,
}

/// Installs and removes the kernel rule set.
pub trait FirewallBackend: Send + Sync {
    /// Atomically replaces the table contents with rules for `resolved`.
    ///
    /// # Errors
    ///
    /// Returns [`FirewallError`] if the commit fails; the previous rules
    /// remain installed in that case.
    fn apply(&self, resolved: &[ResolvedDomain]) -> Result<(), FirewallError>;

    /// Deletes the table. Idempotent: a missing table is success.
    ///
    /// # Errors
    ///
    /// Returns [`FirewallError`] only on spawn failure.
    fn clear(&self) -> Result<(), FirewallError>;
}

/// Real backend driving `nft -f -`.
pub struct NftBackend {
    runner: Arc<dyn CommandRunner>,
}

impl NftBackend {
    /// Backend over the given command runner.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Renders the atomic replace transaction.
    fn ruleset(resolved: &[ResolvedDomain]) -> String {
        let mut out = String::new();
        // add-then-delete makes the delete valid even on first install;
        // the whole script commits as one transaction.
        out.push_str(&format!("add table ip {TABLE_NAME}\n"));
        out.push_str(&format!("delete table ip {TABLE_NAME}\n"));
        out.push_str(&format!("add table ip {TABLE_NAME}\n"));
        out.push_str(&format!(
            "add chain ip {TABLE_NAME} {CHAIN_NAME} {{ type filter hook output priority filter ; policy accept ; }}\n"
        ));
        for entry in resolved {
            for addr in &entry.addrs {
                out.push_str(&format!(
                    "add rule ip {TABLE_NAME} {CHAIN_NAME} ip protocol tcp ip daddr {addr} drop\n"
                ));
            }
        }
        out
    }
}

impl FirewallBackend for NftBackend {
    fn apply(&self, resolved: &[ResolvedDomain]) -> Result<(), FirewallError> {
        let script = Self::ruleset(resolved);
        let output = self.runner.run_with_input("nft", &["-f", "-"], &script)?;
        if !output.status.success() {
            return Err(FirewallError::CommitFailed(output_text(&output)));
        }
        let rules: usize = resolved.iter().map(|r| r.addrs.len()).sum();
        info!(
            domains = resolved.len(),
            rules, "nftables {TABLE_NAME} table committed"
        );
        Ok(())
    }

    fn clear(&self) -> Result<(), FirewallError> {
        let output = self
            .runner
            .run("nft", &["delete", "table", "ip", TABLE_NAME])?;
        if !output.status.success() {
            // Table absent is the normal idempotent case.
            debug!(stderr = %output_text(&output), "nftables table delete (may be absent)");
        } else {
            info!("nftables {TABLE_NAME} table removed");
        }
        Ok(())
    }
}

/// DNS resolution strategy.
pub enum Resolver {
    /// System resolver via tokio.
    System,
    /// Fixed answers for tests.
    Static(HashMap<String, Vec<Ipv4Addr>>),
}

impl Resolver {
    async fn lookup(&self, host: &str) -> Vec<Ipv4Addr> {
        match self {
            Self::System => match tokio::net::lookup_host((host, 443)).await {
                Ok(addrs) => addrs
                    .filter_map(|a| match a {
                        SocketAddr::V4(v4) => Some(*v4.ip()),
                        SocketAddr::V6(_) => None,
                    })
                    .collect(),
                Err(e) => {
                    warn!(host, error = %e, "dns lookup failed");
                    Vec::new()
                }
            },
            Self::Static(map) => map.get(host).cloned().unwrap_or_default(),
        }
    }

    /// Resolves a domain and its `www.` variant, deduplicated.
    pub async fn resolve_domain(&self, domain: &str) -> Vec<Ipv4Addr> {
        let mut candidates = vec![domain.to_string()];
        if !domain.starts_with("www.") {
            candidates.push(format!("www.{domain}"));
        }

        let mut seen = Vec::new();
        for candidate in candidates {
            for addr in self.lookup(&candidate).await {
                if !seen.contains(&addr) {
                    seen.push(addr);
                }
            }
        }
        seen
    }
}

/// The guardian firewall coordinator.
///
/// Owns the live domain mirror the refresh task reads; the authoritative
/// ordered set lives in the system state and is passed in on every
/// [`Firewall::set_blocklist`].
pub struct Firewall {
    backend: Arc<dyn FirewallBackend>,
    resolver: Resolver,
    active: RwLock<Vec<String>>,
    refresher: Mutex<Option<RefresherHandle>>,
}

struct RefresherHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Firewall {
    /// A firewall over the given backend and resolver.
    #[must_use]
    pub fn new(backend: Arc<dyn FirewallBackend>, resolver: Resolver) -> Arc<Self> {
        Arc::new(Self {
            backend,
            resolver,
            active: RwLock::new(Vec::new()),
            refresher: Mutex::new(None),
        })
    }

    /// The currently installed blocklist mirror.
    #[must_use]
    pub fn active_domains(&self) -> Vec<String> {
        self.active.read().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    /// Replaces the blocklist: resolves every domain, commits the rule set
    /// atomically, and manages the refresh task.
    ///
    /// An empty list deletes the table and stops the refresher.
    ///
    /// # Errors
    ///
    /// Returns [`FirewallError`] if the commit fails; the mirror is left
    /// unchanged so callers can roll their state back.
    pub async fn set_blocklist(self: &Arc<Self>, domains: Vec<String>) -> Result<(), FirewallError> {
        if domains.is_empty() {
            self.backend.clear()?;
            *self.active.write().unwrap_or_else(std::sync::PoisonError::into_inner) = Vec::new();
            self.stop_refresher().await;
            return Ok(());
        }

        let resolved = self.resolve_all(&domains).await;
        self.backend.apply(&resolved)?;
        *self.active.write().unwrap_or_else(std::sync::PoisonError::into_inner) = domains;
        self.ensure_refresher().await;
        Ok(())
    }

    /// Re-resolves the active blocklist and recommits the rules.
    pub async fn refresh(self: &Arc<Self>) {
        let domains = self.active_domains();
        if domains.is_empty() {
            return;
        }
        info!("refreshing blocked-domain IP resolutions");
        let resolved = self.resolve_all(&domains).await;
        if let Err(e) = self.backend.apply(&resolved) {
            warn!(error = %e, "blocklist IP refresh failed");
        }
    }

    /// Stops the refresher and deletes the table. Safe to call repeatedly.
    pub async fn shutdown(self: &Arc<Self>) {
        self.stop_refresher().await;
        if let Err(e) = self.backend.clear() {
            warn!(error = %e, "firewall clear during shutdown failed");
        }
    }

    async fn resolve_all(&self, domains: &[String]) -> Vec<ResolvedDomain> {
        let mut resolved = Vec::with_capacity(domains.len());
        for domain in domains {
            let addrs = self.resolver.resolve_domain(domain).await;
            if addrs.is_empty() {
                warn!(domain = %domain, "could not resolve blocked domain, skipping");
                continue;
            }
            info!(domain = %domain, addrs = addrs.len(), "blocked domain resolved");
            resolved.push(ResolvedDomain {
                domain: domain.clone(),
                addrs,
            });
        }
        resolved
    }

    async fn ensure_refresher(self: &Arc<Self>) {
        let mut guard = self.refresher.lock().await;
        if guard.is_some() {
            return;
        }
        let (stop, mut stopped) = watch::channel(false);
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // the first tick is immediate
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(firewall) = weak.upgrade() else { break };
                        firewall.refresh().await;
                    }
                    _ = stopped.changed() => break,
                }
            }
        });
        *guard = Some(RefresherHandle { stop, task });
        info!("dns refresh task started (30m interval)");
    }

    async fn stop_refresher(&self) {
        let handle = self.refresher.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.stop.send(true);
            let _ = handle.task.await;
            info!("dns refresh task stopped");
        }
    }
}

/// Loads the seed blocklist: built-in defaults merged with the optional
/// `blocked-domains.json` config file, deduplicated in order.
#[must_use]
pub fn load_seed_blocklist(config_file: &Path) -> Vec<String> {
    #[derive(Deserialize)]
    struct SeedFile {
        #[serde(default)]
        blocked_domains: Vec<String>,
    }

    let mut domains: Vec<String> = DEFAULT_BLOCKED_DOMAINS
        .iter()
        .map(|d| (*d).to_string())
        .collect();

    match std::fs::read(config_file) {
        Ok(data) => match serde_json::from_slice::<SeedFile>(&data) {
            Ok(seed) => {
                for domain in seed.blocked_domains {
                    let domain = vex_core::state::normalize_domain(&domain);
                    if !domain.is_empty() && !domains.contains(&domain) {
                        domains.push(domain);
                    }
                }
            }
            Err(e) => warn!(error = %e, "blocked-domains config unparseable, using defaults"),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("no blocked-domains config, using defaults");
        }
        Err(e) => warn!(error = %e, "blocked-domains config unreadable, using defaults"),
    }

    domains
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::exec::testing::MockRunner;

    /// Backend that records applies and can be scripted to fail.
    struct RecordingBackend {
        applies: StdMutex<Vec<Vec<ResolvedDomain>>>,
        clears: StdMutex<usize>,
        fail_apply: StdMutex<bool>,
    }

    impl RecordingBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                applies: StdMutex::new(Vec::new()),
                clears: StdMutex::new(0),
                fail_apply: StdMutex::new(false),
            })
        }
    }

    impl FirewallBackend for RecordingBackend {
        fn apply(&self, resolved: &[ResolvedDomain]) -> Result<(), FirewallError> {
            if *self.fail_apply.lock().unwrap() {
                return Err(FirewallError::CommitFailed("scripted failure".into()));
            }
            self.applies.lock().unwrap().push(resolved.to_vec());
            Ok(())
        }

        fn clear(&self) -> Result<(), FirewallError> {
            *self.clears.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn static_resolver() -> Resolver {
        let mut map = HashMap::new();
        map.insert(
            "reddit.com".to_string(),
            vec![Ipv4Addr::new(151, 101, 1, 140)],
        );
        map.insert(
            "www.reddit.com".to_string(),
            vec![
                Ipv4Addr::new(151, 101, 1, 140),
                Ipv4Addr::new(151, 101, 65, 140),
            ],
        );
        map.insert(
            "twitch.tv".to_string(),
            vec![Ipv4Addr::new(199, 232, 210, 167)],
        );
        Resolver::Static(map)
    }

    #[tokio::test]
    async fn blocklist_rules_cover_resolved_set_with_www_variant() {
        let backend = RecordingBackend::new();
        let firewall = Firewall::new(backend.clone(), static_resolver());

        firewall
            .set_blocklist(vec!["reddit.com".to_string()])
            .await
            .unwrap();

        let applies = backend.applies.lock().unwrap();
        assert_eq!(applies.len(), 1);
        let entry = &applies[0][0];
        assert_eq!(entry.domain, "reddit.com");
        // Union of apex and www answers, deduplicated.
        assert_eq!(entry.addrs.len(), 2);
        drop(applies);
        firewall.shutdown().await;
    }

    #[tokio::test]
    async fn unresolvable_domain_is_skipped_not_fatal() {
        let backend = RecordingBackend::new();
        let firewall = Firewall::new(backend.clone(), static_resolver());

        firewall
            .set_blocklist(vec!["twitch.tv".to_string(), "no-such.example".to_string()])
            .await
            .unwrap();

        let applies = backend.applies.lock().unwrap();
        assert_eq!(applies[0].len(), 1);
        assert_eq!(applies[0][0].domain, "twitch.tv");
        drop(applies);
        firewall.shutdown().await;
    }

    #[tokio::test]
    async fn empty_blocklist_clears_table() {
        let backend = RecordingBackend::new();
        let firewall = Firewall::new(backend.clone(), static_resolver());

        firewall
            .set_blocklist(vec!["reddit.com".to_string()])
            .await
            .unwrap();
        firewall.set_blocklist(Vec::new()).await.unwrap();

        assert_eq!(*backend.clears.lock().unwrap(), 1);
        assert!(firewall.active_domains().is_empty());
        firewall.shutdown().await;
    }

    #[tokio::test]
    async fn failed_commit_leaves_mirror_unchanged() {
        let backend = RecordingBackend::new();
        let firewall = Firewall::new(backend.clone(), static_resolver());
        firewall
            .set_blocklist(vec!["reddit.com".to_string()])
            .await
            .unwrap();

        *backend.fail_apply.lock().unwrap() = true;
        let err = firewall
            .set_blocklist(vec!["reddit.com".to_string(), "twitch.tv".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, FirewallError::CommitFailed(_)));
        assert_eq!(firewall.active_domains(), vec!["reddit.com"]);
        firewall.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let backend = RecordingBackend::new();
        let firewall = Firewall::new(backend.clone(), static_resolver());
        firewall.shutdown().await;
        firewall.shutdown().await;
        assert_eq!(*backend.clears.lock().unwrap(), 2);
    }

    #[test]
    fn nft_ruleset_is_an_atomic_replace() {
        let resolved = vec![ResolvedDomain {
            domain: "reddit.com".to_string(),
            addrs: vec![Ipv4Addr::new(151, 101, 1, 140)],
        }];
        let script = NftBackend::ruleset(&resolved);
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(lines[0], "add table ip vex-guardian");
        assert_eq!(lines[1], "delete table ip vex-guardian");
        assert_eq!(lines[2], "add table ip vex-guardian");
        assert!(lines[3].contains("hook output priority filter"));
        assert_eq!(
            lines[4],
            "add rule ip vex-guardian filter-output ip protocol tcp ip daddr 151.101.1.140 drop"
        );
    }

    #[test]
    fn nft_backend_pipes_script_on_stdin() {
        let mock = Arc::new(MockRunner::ok());
        let backend = NftBackend::new(mock.clone());
        backend
            .apply(&[ResolvedDomain {
                domain: "twitch.tv".to_string(),
                addrs: vec![Ipv4Addr::new(199, 232, 210, 167)],
            }])
            .unwrap();

        let calls = mock.calls_to("nft");
        assert_eq!(calls[0].args, ["-f", "-"]);
        assert!(calls[0].input.as_ref().unwrap().contains("199.232.210.167"));
    }

    #[test]
    fn nft_clear_tolerates_missing_table() {
        let mock = Arc::new(MockRunner::ok());
        mock.fail("nft", "Error: No such file or directory; delete table ip vex-guardian");
        NftBackend::new(mock).clear().unwrap();
    }

    #[test]
    fn seed_blocklist_merges_config_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("blocked-domains.json");
        std::fs::write(
            &file,
            r#"{"blocked_domains": ["news.ycombinator.com", "REDDIT.com"]}"#,
        )
        .unwrap();

        let domains = load_seed_blocklist(&file);
        assert!(domains.contains(&"store.steampowered.com".to_string()));
        assert!(domains.contains(&"news.ycombinator.com".to_string()));
        // Case-normalized duplicate of a default is not added twice.
        assert_eq!(
            domains.iter().filter(|d| *d == "reddit.com").count(),
            1
        );
    }

    #[test]
    fn seed_blocklist_defaults_when_file_absent() {
        let dir = tempfile::tempdir().unwrap();
        let domains = load_seed_blocklist(&dir.path().join("missing.json"));
        assert_eq!(domains.len(), 4);
    }
}
