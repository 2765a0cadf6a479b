//! The forbidden-process list.
//!
//! Backed by `forbidden-apps.json`, auto-created with built-in defaults
//! when absent. Mutations update both the file and the in-memory list the
//! live monitor matches against.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Default forbidden applications.
const DEFAULT_APPS: [&str; 5] = ["steam", "discord", "gamescope", "lutris", "heroic"];

/// Forbidden-list persistence errors.
#[derive(Debug, Error)]
pub enum ForbiddenListError {
    /// The list file could not be written.
    #[error("failed to persist forbidden apps: {0}")]
    Io(#[from] std::io::Error),
    /// The list could not be serialized.
    #[error("failed to serialize forbidden apps: {0}")]
    Serialize(#[from] serde_json::Error),
    /// The app name was empty after normalization.
    #[error("empty app name")]
    EmptyName,
}

#[derive(Serialize, Deserialize)]
struct AppsFile {
    forbidden_apps: Vec<String>,
}

/// Shared, file-backed forbidden-app list.
pub struct ForbiddenApps {
    file: PathBuf,
    apps: RwLock<Vec<String>>,
}

impl ForbiddenApps {
    /// Loads the list, seeding (and writing) the defaults when the file is
    /// missing or unparseable.
    #[must_use]
    pub fn load_or_seed(file: &Path) -> Arc<Self> {
        let apps = match std::fs::read(file) {
            Ok(data) => match serde_json::from_slice::<AppsFile>(&data) {
                Ok(parsed) => parsed.forbidden_apps,
                Err(e) => {
                    warn!(error = %e, "forbidden-apps file unparseable, using defaults");
                    defaults()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("forbidden-apps file absent, creating defaults");
                let apps = defaults();
                if let Err(e) = write_file(file, &apps) {
                    warn!(error = %e, "could not write default forbidden-apps file");
                }
                apps
            }
            Err(e) => {
                warn!(error = %e, "forbidden-apps file unreadable, using defaults");
                defaults()
            }
        };

        Arc::new(Self {
            file: file.to_path_buf(),
            apps: RwLock::new(apps),
        })
    }

    /// Snapshot of the current list.
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        self.apps
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Adds an app (lowercased, trimmed). Returns whether it was new.
    ///
    /// # Errors
    ///
    /// Returns [`ForbiddenListError`] for empty names or persistence
    /// failures; the in-memory list is only updated on success.
    pub fn add(&self, app: &str) -> Result<bool, ForbiddenListError> {
        let app = normalize(app)?;
        let mut guard = self
            .apps
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if guard.iter().any(|a| a.to_lowercase() == app) {
            return Ok(false);
        }
        let mut next = guard.clone();
        next.push(app.clone());
        write_file(&self.file, &next)?;
        *guard = next;
        info!(app = %app, total = guard.len(), "app added to forbidden list");
        Ok(true)
    }

    /// Removes an app. Returns whether it was present.
    ///
    /// # Errors
    ///
    /// Returns [`ForbiddenListError`] for empty names or persistence
    /// failures.
    pub fn remove(&self, app: &str) -> Result<bool, ForbiddenListError> {
        let app = normalize(app)?;
        let mut guard = self
            .apps
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let next: Vec<String> = guard
            .iter()
            .filter(|a| a.to_lowercase() != app)
            .cloned()
            .collect();
        if next.len() == guard.len() {
            return Ok(false);
        }
        write_file(&self.file, &next)?;
        *guard = next;
        info!(app = %app, total = guard.len(), "app removed from forbidden list");
        Ok(true)
    }

    /// Whether a process (by `comm` and command line) matches any entry.
    ///
    /// Matching is substring, case-insensitive, against both fields.
    #[must_use]
    pub fn matches(&self, comm: &str, cmdline: &str) -> bool {
        let comm = comm.to_lowercase();
        let cmdline = cmdline.to_lowercase();
        self.apps
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .any(|app| comm.contains(app.as_str()) || cmdline.contains(app.as_str()))
    }
}

fn defaults() -> Vec<String> {
    DEFAULT_APPS.iter().map(|a| (*a).to_string()).collect()
}

fn normalize(app: &str) -> Result<String, ForbiddenListError> {
    let app = app.trim().to_lowercase();
    if app.is_empty() {
        return Err(ForbiddenListError::EmptyName);
    }
    Ok(app)
}

fn write_file(file: &Path, apps: &[String]) -> Result<(), ForbiddenListError> {
    if let Some(parent) = file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let contents = serde_json::to_vec_pretty(&AppsFile {
        forbidden_apps: apps.to_vec(),
    })?;
    std::fs::write(file, contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, Arc<ForbiddenApps>) {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("forbidden-apps.json");
        let apps = ForbiddenApps::load_or_seed(&file);
        (dir, apps)
    }

    #[test]
    fn seeds_defaults_and_creates_file() {
        let (dir, apps) = store();
        assert_eq!(apps.list().len(), 5);
        assert!(apps.list().contains(&"steam".to_string()));
        assert!(dir.path().join("forbidden-apps.json").exists());
    }

    #[test]
    fn add_normalizes_and_deduplicates() {
        let (_dir, apps) = store();
        assert!(apps.add("  MineCraft ").unwrap());
        assert!(!apps.add("minecraft").unwrap());
        assert!(apps.list().contains(&"minecraft".to_string()));
    }

    #[test]
    fn remove_persists_across_reload() {
        let (dir, apps) = store();
        assert!(apps.remove("discord").unwrap());
        assert!(!apps.remove("discord").unwrap());

        let reloaded = ForbiddenApps::load_or_seed(&dir.path().join("forbidden-apps.json"));
        assert!(!reloaded.list().contains(&"discord".to_string()));
    }

    #[test]
    fn empty_name_is_rejected() {
        let (_dir, apps) = store();
        assert!(matches!(apps.add("  "), Err(ForbiddenListError::EmptyName)));
    }

    #[test]
    fn matching_is_substring_case_insensitive() {
        let (_dir, apps) = store();
        assert!(apps.matches("Steam", ""));
        assert!(apps.matches("steamwebhelper", ""));
        assert!(apps.matches("sh", "/usr/bin/Discord --ptb"));
        assert!(!apps.matches("firefox", "/usr/lib/firefox/firefox"));
    }
}
