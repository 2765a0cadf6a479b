//! On-disk layout for the daemon and client.
//!
//! Production uses fixed system paths; every consumer takes a [`Paths`]
//! value so tests can root the whole tree inside a temp directory.

use std::path::{Path, PathBuf};

/// Name of the Unix group whose members may talk to the daemon socket.
pub const OPERATOR_GROUP: &str = "vex";

/// Resolved filesystem layout.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Config directory (`/etc/vexd`).
    pub config_dir: PathBuf,
    /// Persistent state directory (`/var/lib/vexd`).
    pub state_dir: PathBuf,
    /// Runtime directory holding the socket (`/run/vexd`).
    pub runtime_dir: PathBuf,
    /// Append-only audit log file (`/var/log/vexd.log`).
    pub log_file: PathBuf,
}

impl Paths {
    /// The production system layout.
    #[must_use]
    pub fn system() -> Self {
        Self {
            config_dir: PathBuf::from("/etc/vexd"),
            state_dir: PathBuf::from("/var/lib/vexd"),
            runtime_dir: PathBuf::from("/run/vexd"),
            log_file: PathBuf::from("/var/log/vexd.log"),
        }
    }

    /// A layout rooted under an arbitrary directory (tests, packaging).
    #[must_use]
    pub fn rooted(root: &Path) -> Self {
        Self {
            config_dir: root.join("etc"),
            state_dir: root.join("lib"),
            runtime_dir: root.join("run"),
            log_file: root.join("vexd.log"),
        }
    }

    /// Unix socket the daemon listens on.
    #[must_use]
    pub fn socket(&self) -> PathBuf {
        self.runtime_dir.join("vexd.sock")
    }

    /// Authoritative persisted system state.
    #[must_use]
    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join("system-state.json")
    }

    /// Legacy auxiliary throttler state, kept for status-bar consumers.
    #[must_use]
    pub fn throttler_state_file(&self) -> PathBuf {
        self.state_dir.join("throttler-state.json")
    }

    /// Authoritative compliance status store.
    #[must_use]
    pub fn compliance_file(&self) -> PathBuf {
        self.state_dir.join("compliance-status.json")
    }

    /// Signed penance manifest consumed by the daemon.
    #[must_use]
    pub fn manifest_file(&self) -> PathBuf {
        self.config_dir.join("penance-manifest.json")
    }

    /// Forbidden-process list consumed by the reaper.
    #[must_use]
    pub fn forbidden_apps_file(&self) -> PathBuf {
        self.config_dir.join("forbidden-apps.json")
    }

    /// Seed list of blocked domains merged into the live blocklist.
    #[must_use]
    pub fn blocked_domains_file(&self) -> PathBuf {
        self.config_dir.join("blocked-domains.json")
    }

    /// Management public key authorizing restriction-lowering commands.
    #[must_use]
    pub fn management_key_file(&self) -> PathBuf {
        self.config_dir.join("management-key.pub")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rooted_layout_stays_under_root() {
        let paths = Paths::rooted(Path::new("/tmp/vex-test"));
        assert!(paths.socket().starts_with("/tmp/vex-test"));
        assert!(paths.state_file().starts_with("/tmp/vex-test"));
        assert!(paths.management_key_file().starts_with("/tmp/vex-test"));
    }

    #[test]
    fn system_layout_uses_canonical_locations() {
        let paths = Paths::system();
        assert_eq!(paths.socket(), PathBuf::from("/run/vexd/vexd.sock"));
        assert_eq!(
            paths.state_file(),
            PathBuf::from("/var/lib/vexd/system-state.json")
        );
        assert_eq!(paths.log_file, PathBuf::from("/var/log/vexd.log"));
    }
}
