//! CPU governance (cgroup v2) and OOM score adjustment.
//!
//! The CPU quota is written to the first resolvable `cpu.max` among the
//! root cgroup (containers only; the root slice has no `cpu.max` on a
//! real host), the user slice, and the system slice. The encoding is
//! `"<quota> <period>"` with a fixed 100 ms period and the sentinel `max`
//! for an uncapped 100%.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

/// Compute subsystem errors.
#[derive(Debug, Error)]
pub enum ComputeError {
    /// Requested percentage outside the accepted range.
    #[error("invalid percentage: {0}")]
    InvalidPercent(u32),

    /// Requested OOM score outside -1000..=1000.
    #[error("invalid OOM score: {0}")]
    InvalidOomScore(i32),

    /// No writable `cpu.max` was found.
    #[error("cgroup v2 cpu.max not found under {0} (is cgroups v2 mounted?)")]
    NoCpuMax(String),

    /// The target file could not be written.
    #[error("failed to write {path}: {source}")]
    WriteFailed {
        /// Target path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Cgroup period in microseconds (100 ms).
const CPU_PERIOD_US: u32 = 100_000;

/// Writes `cpu.max` quotas.
#[derive(Debug, Clone)]
pub struct CpuGov {
    cgroup_root: PathBuf,
}

impl CpuGov {
    /// Governor over the system cgroup v2 mount.
    #[must_use]
    pub fn new() -> Self {
        Self::with_root(Path::new("/sys/fs/cgroup"))
    }

    /// Governor over an alternate root (tests).
    #[must_use]
    pub fn with_root(root: &Path) -> Self {
        Self {
            cgroup_root: root.to_path_buf(),
        }
    }

    /// Candidate `cpu.max` paths in priority order.
    fn candidates(&self) -> [PathBuf; 3] {
        [
            self.cgroup_root.join("cpu.max"),
            self.cgroup_root.join("user.slice/cpu.max"),
            self.cgroup_root.join("system.slice/cpu.max"),
        ]
    }

    fn resolve_cpu_max(&self) -> Result<PathBuf, ComputeError> {
        self.candidates()
            .into_iter()
            .find(|p| p.exists())
            .ok_or_else(|| ComputeError::NoCpuMax(self.cgroup_root.display().to_string()))
    }

    /// Applies a CPU quota percentage.
    ///
    /// 100 writes the `max` sentinel (uncapped); 0 is reserved and
    /// rejected here. Disabling compute entirely requires an explicit
    /// decision above this layer.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError`] on range violations, missing `cpu.max`, or
    /// write failure.
    pub fn set_limit(&self, percent: u32) -> Result<(), ComputeError> {
        if percent == 0 || percent > 100 {
            return Err(ComputeError::InvalidPercent(percent));
        }

        let quota = if percent == 100 {
            "max".to_string()
        } else {
            ((percent * CPU_PERIOD_US) / 100).to_string()
        };
        let value = format!("{quota} {CPU_PERIOD_US}");

        let path = self.resolve_cpu_max()?;
        std::fs::write(&path, value.as_bytes()).map_err(|source| ComputeError::WriteFailed {
            path: path.display().to_string(),
            source,
        })?;

        info!(percent, value = %value, path = %path.display(), "cpu limit set");
        Ok(())
    }
}

impl Default for CpuGov {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes the daemon's own `oom_score_adj`.
///
/// The daemon pins itself at -1000 on startup so it cannot be OOM-killed
/// while it holds the reaper's kill authority; penance overrides may move
/// the score.
#[derive(Debug, Clone)]
pub struct OomSetter {
    score_file: PathBuf,
}

impl OomSetter {
    /// Setter over the daemon's own proc entry.
    #[must_use]
    pub fn new() -> Self {
        Self::with_path(Path::new("/proc/self/oom_score_adj"))
    }

    /// Setter over an alternate file (tests).
    #[must_use]
    pub fn with_path(path: &Path) -> Self {
        Self {
            score_file: path.to_path_buf(),
        }
    }

    /// Writes the score (-1000 invincible ..= 1000 first to die).
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError`] on range violation or write failure.
    pub fn apply(&self, score: i32) -> Result<(), ComputeError> {
        if !(-1000..=1000).contains(&score) {
            return Err(ComputeError::InvalidOomScore(score));
        }
        std::fs::write(&self.score_file, score.to_string().as_bytes()).map_err(|source| {
            ComputeError::WriteFailed {
                path: self.score_file.display().to_string(),
                source,
            }
        })?;
        info!(score, "oom score adjusted");
        Ok(())
    }
}

impl Default for OomSetter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_quota_to_first_candidate() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cpu.max"), "max 100000").unwrap();
        let gov = CpuGov::with_root(dir.path());

        gov.set_limit(15).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("cpu.max")).unwrap(),
            "15000 100000"
        );
    }

    #[test]
    fn hundred_percent_writes_max_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cpu.max"), "").unwrap();
        CpuGov::with_root(dir.path()).set_limit(100).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("cpu.max")).unwrap(),
            "max 100000"
        );
    }

    #[test]
    fn falls_back_to_user_slice() {
        let dir = tempfile::tempdir().unwrap();
        let slice = dir.path().join("user.slice");
        std::fs::create_dir_all(&slice).unwrap();
        std::fs::write(slice.join("cpu.max"), "").unwrap();

        CpuGov::with_root(dir.path()).set_limit(50).unwrap();
        assert_eq!(
            std::fs::read_to_string(slice.join("cpu.max")).unwrap(),
            "50000 100000"
        );
    }

    #[test]
    fn rejects_zero_and_over_hundred() {
        let dir = tempfile::tempdir().unwrap();
        let gov = CpuGov::with_root(dir.path());
        assert!(matches!(
            gov.set_limit(0),
            Err(ComputeError::InvalidPercent(0))
        ));
        assert!(matches!(
            gov.set_limit(101),
            Err(ComputeError::InvalidPercent(101))
        ));
    }

    #[test]
    fn missing_cpu_max_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            CpuGov::with_root(dir.path()).set_limit(50),
            Err(ComputeError::NoCpuMax(_))
        ));
    }

    #[test]
    fn oom_score_bounds_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("oom_score_adj");
        std::fs::write(&file, "0").unwrap();
        let oom = OomSetter::with_path(&file);

        oom.apply(-1000).unwrap();
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "-1000");
        oom.apply(1000).unwrap();

        assert!(matches!(
            oom.apply(-1001),
            Err(ComputeError::InvalidOomScore(-1001))
        ));
        assert!(matches!(
            oom.apply(1001),
            Err(ComputeError::InvalidOomScore(1001))
        ));
    }
}
