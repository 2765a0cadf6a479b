//! Atomic persistence of the system state.
//!
//! The full state is written to a temp file in the state directory and
//! renamed over the target, after every mutation, before the response goes
//! back to the client. `last_updated` is stamped here so on-disk order
//! equals commit order.

use std::path::PathBuf;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};
use vex_core::state::SystemState;
use vex_core::Paths;

/// Persistence errors.
#[derive(Debug, Error)]
pub enum PersistError {
    /// Directory creation, temp write, or rename failed.
    #[error("failed to persist state: {0}")]
    Io(#[from] std::io::Error),
    /// State serialization failed.
    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Writes the authoritative state file.
#[derive(Debug, Clone)]
pub struct Persister {
    state_file: PathBuf,
}

impl Persister {
    /// A persister over the layout's state file.
    #[must_use]
    pub fn new(paths: &Paths) -> Self {
        Self {
            state_file: paths.state_file(),
        }
    }

    /// Loads the persisted state, seeding factory defaults when the file is
    /// absent or unreadable. A fresh default is written back once so the
    /// file always exists after startup.
    #[must_use]
    pub fn load_or_default(&self) -> SystemState {
        match std::fs::read(&self.state_file) {
            Ok(data) => match serde_json::from_slice::<SystemState>(&data) {
                Ok(state) => return state,
                Err(e) => {
                    warn!(error = %e, "state file unparseable, seeding defaults");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no persisted state found, using defaults");
            }
            Err(e) => {
                warn!(error = %e, "state file unreadable, seeding defaults");
            }
        }
        let mut state = SystemState::factory_default();
        if let Err(e) = self.save(&mut state) {
            warn!(error = %e, "could not seed initial state file");
        }
        state
    }

    /// Persists the state atomically (temp file + rename), stamping
    /// `last_updated`.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError`] on serialization or I/O failure. The
    /// in-memory state is still authoritative afterwards; callers log and
    /// carry on.
    pub fn save(&self, state: &mut SystemState) -> Result<(), PersistError> {
        state.last_updated = Utc::now();

        let dir = self
            .state_file
            .parent()
            .map(std::path::Path::to_path_buf)
            .unwrap_or_default();
        std::fs::create_dir_all(&dir)?;

        let tmp = self.state_file.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
        std::fs::rename(&tmp, &self.state_file)?;

        info!(
            profile = %state.network.profile,
            cpu = state.compute.cpu_limit_pct,
            locked = state.compliance.locked,
            by = %state.changed_by,
            "state persisted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use vex_core::profile::Profile;
    use vex_core::state::ChangedBy;

    use super::*;

    fn persister(root: &Path) -> Persister {
        Persister::new(&Paths::rooted(root))
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let p = persister(dir.path());

        let mut state = SystemState::factory_default();
        state.network.profile = Profile::Choke;
        state.compute.cpu_limit_pct = 25;
        state.guardian.add_domain("reddit.com");
        state.changed_by = ChangedBy::Cli;
        p.save(&mut state).unwrap();

        let loaded = p.load_or_default();
        assert_eq!(loaded.network.profile, Profile::Choke);
        assert_eq!(loaded.compute.cpu_limit_pct, 25);
        assert_eq!(loaded.guardian.blocked_domains, vec!["reddit.com"]);
        loaded.check_invariants().unwrap();
    }

    #[test]
    fn missing_file_seeds_factory_defaults_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let p = persister(dir.path());
        let state = p.load_or_default();
        assert_eq!(state.network.profile, Profile::Standard);
        assert!(Paths::rooted(dir.path()).state_file().exists());
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::rooted(dir.path());
        std::fs::create_dir_all(&paths.state_dir).unwrap();
        std::fs::write(paths.state_file(), b"{not json").unwrap();

        let state = persister(dir.path()).load_or_default();
        assert_eq!(state.compute.cpu_limit_pct, 100);
    }

    #[test]
    fn save_stamps_last_updated() {
        let dir = tempfile::tempdir().unwrap();
        let p = persister(dir.path());
        let mut state = SystemState::factory_default();
        let before = state.last_updated;
        std::thread::sleep(std::time::Duration::from_millis(5));
        p.save(&mut state).unwrap();
        assert!(state.last_updated > before);
    }

    #[test]
    fn no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let p = persister(dir.path());
        p.save(&mut SystemState::factory_default()).unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(Paths::rooted(dir.path()).state_dir)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().is_some_and(|x| x == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
