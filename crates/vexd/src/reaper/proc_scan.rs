//! `/proc` sweep backend.
//!
//! Every two seconds, enumerate the pid directories, read `comm` and
//! `cmdline`, and SIGKILL anything matching the forbidden list. PID 1 and
//! the daemon's own pid are never touched.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{ForbiddenApps, KillOps, ProcessMonitor, ReaperError};

/// Time between sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(2);

/// The `/proc` polling monitor.
pub struct ProcScanMonitor {
    proc_root: PathBuf,
    apps: Arc<ForbiddenApps>,
    kill: Arc<dyn KillOps>,
    own_pid: i32,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ProcScanMonitor {
    /// A monitor sweeping the given proc root (the real `/proc` in
    /// production, a fixture directory in tests).
    #[must_use]
    pub fn new(apps: Arc<ForbiddenApps>, kill: Arc<dyn KillOps>, proc_root: &Path) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            proc_root: proc_root.to_path_buf(),
            apps,
            kill,
            own_pid: std::process::id() as i32,
            stop,
            task: Mutex::new(None),
        }
    }

    /// One full enumeration pass. Returns the pids killed.
    pub fn sweep_once(&self) -> Vec<i32> {
        sweep(&self.proc_root, &self.apps, self.kill.as_ref(), self.own_pid)
    }
}

/// One enumeration pass over a proc root.
fn sweep(proc_root: &Path, apps: &ForbiddenApps, kill: &dyn KillOps, own_pid: i32) -> Vec<i32> {
    let Ok(entries) = std::fs::read_dir(proc_root) else {
        return Vec::new();
    };

    let mut killed = Vec::new();
    for entry in entries.filter_map(Result::ok) {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<i32>() else {
            continue;
        };
        if pid == 1 || pid == own_pid {
            continue;
        }
        if !is_forbidden(proc_root, pid, apps) {
            continue;
        }
        info!(pid, "terminating forbidden process");
        match kill.kill(pid) {
            Ok(()) => killed.push(pid),
            Err(e) => warn!(pid, error = %e, "failed to kill process"),
        }
    }
    killed
}

fn is_forbidden(proc_root: &Path, pid: i32, apps: &ForbiddenApps) -> bool {
    let dir = proc_root.join(pid.to_string());
    let Ok(comm) = std::fs::read_to_string(dir.join("comm")) else {
        return false;
    };
    let cmdline = std::fs::read(dir.join("cmdline"))
        .map(|bytes| {
            String::from_utf8_lossy(&bytes)
                .replace('\0', " ")
                .to_string()
        })
        .unwrap_or_default();
    apps.matches(comm.trim(), &cmdline)
}

impl ProcessMonitor for ProcScanMonitor {
    fn start(&self) -> Result<(), ReaperError> {
        let mut guard = self
            .task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if guard.is_some() {
            return Err(ReaperError::AlreadyStarted);
        }

        let proc_root = self.proc_root.clone();
        let apps = self.apps.clone();
        let kill = self.kill.clone();
        let own_pid = self.own_pid;
        let mut stopped = self.stop.subscribe();

        let handle = tokio::spawn(async move {
            info!("process reaper started");
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        sweep(&proc_root, &apps, kill.as_ref(), own_pid);
                    }
                    _ = stopped.changed() => {
                        info!("process reaper stopped");
                        break;
                    }
                }
            }
        });

        *guard = Some(handle);
        Ok(())
    }

    fn stop(&self) {
        let _ = self.stop.send(true);
        if let Some(handle) = self
            .task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            drop(handle);
        }
    }

    fn update_forbidden_list(&self) {
        // The sweep reads through the shared list on every pass; nothing to
        // push.
    }

    fn backend_name(&self) -> &'static str {
        "/proc polling (standard)"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    struct RecordingKill {
        pids: StdMutex<Vec<i32>>,
    }

    impl KillOps for RecordingKill {
        fn kill(&self, pid: i32) -> std::io::Result<()> {
            self.pids.lock().unwrap().push(pid);
            Ok(())
        }
    }

    fn fake_proc_entry(root: &Path, pid: i32, comm: &str, cmdline: &str) {
        let dir = root.join(pid.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("comm"), format!("{comm}\n")).unwrap();
        std::fs::write(dir.join("cmdline"), cmdline.replace(' ', "\0")).unwrap();
    }

    fn monitor(root: &Path) -> (ProcScanMonitor, Arc<RecordingKill>) {
        let apps = ForbiddenApps::load_or_seed(&root.join("forbidden-apps.json"));
        let kill = Arc::new(RecordingKill {
            pids: StdMutex::new(Vec::new()),
        });
        let proc_root = root.join("proc");
        std::fs::create_dir_all(&proc_root).unwrap();
        (
            ProcScanMonitor::new(apps, kill.clone(), &proc_root),
            kill,
        )
    }

    #[test]
    fn sweep_kills_matching_processes_only() {
        let dir = tempfile::tempdir().unwrap();
        let (mon, kill) = monitor(dir.path());
        let proc_root = dir.path().join("proc");

        fake_proc_entry(&proc_root, 1000, "steam", "/usr/bin/steam -silent");
        fake_proc_entry(&proc_root, 1001, "bash", "/bin/bash");
        fake_proc_entry(&proc_root, 1002, "code", "/usr/share/discord/Discord");

        let killed = mon.sweep_once();
        assert_eq!(killed.len(), 2);
        let pids = kill.pids.lock().unwrap();
        assert!(pids.contains(&1000));
        assert!(pids.contains(&1002));
        assert!(!pids.contains(&1001));
    }

    #[test]
    fn sweep_skips_pid_one_and_self() {
        let dir = tempfile::tempdir().unwrap();
        let (mon, kill) = monitor(dir.path());
        let proc_root = dir.path().join("proc");

        fake_proc_entry(&proc_root, 1, "steam", "steam");
        fake_proc_entry(&proc_root, std::process::id() as i32, "steam", "steam");

        mon.sweep_once();
        assert!(kill.pids.lock().unwrap().is_empty());
    }

    #[test]
    fn sweep_ignores_non_pid_entries_and_vanished_processes() {
        let dir = tempfile::tempdir().unwrap();
        let (mon, kill) = monitor(dir.path());
        let proc_root = dir.path().join("proc");

        std::fs::create_dir_all(proc_root.join("sys")).unwrap();
        // pid dir without comm: process exited mid-sweep
        std::fs::create_dir_all(proc_root.join("4242")).unwrap();

        mon.sweep_once();
        assert!(kill.pids.lock().unwrap().is_empty());
    }

    #[test]
    fn matching_covers_cmdline_when_comm_is_generic() {
        let dir = tempfile::tempdir().unwrap();
        let (mon, kill) = monitor(dir.path());
        let proc_root = dir.path().join("proc");

        fake_proc_entry(&proc_root, 2000, "sh", "/opt/Lutris/bin/lutris --game 7");
        mon.sweep_once();
        assert_eq!(*kill.pids.lock().unwrap(), vec![2000]);
    }

    #[tokio::test]
    async fn start_twice_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (mon, _kill) = monitor(dir.path());
        mon.start().unwrap();
        assert!(matches!(mon.start(), Err(ReaperError::AlreadyStarted)));
        mon.stop();
    }
}
