//! External-command seam.
//!
//! The shaper, firewall, audit log, and anti-tamper subsystems reach the
//! kernel through system binaries (`tc`, `nft`, `chattr`, `systemctl`,
//! `nix-store`). All of them go through [`CommandRunner`] so tests can stub
//! the boundary.

use std::process::{Command, Output, Stdio};
use std::sync::Arc;

/// Runs external commands. Implementations must be cheap to clone behind an
/// [`Arc`] and safe to call from any task.
pub trait CommandRunner: Send + Sync {
    /// Runs a program to completion, capturing output.
    ///
    /// # Errors
    ///
    /// Returns the spawn/wait error; a non-zero exit status is reported
    /// through the [`Output`], not as an `Err`.
    fn run(&self, program: &str, args: &[&str]) -> std::io::Result<Output>;

    /// Runs a program feeding `input` to its stdin.
    ///
    /// # Errors
    ///
    /// Returns the spawn/wait error; a non-zero exit status is reported
    /// through the [`Output`], not as an `Err`.
    fn run_with_input(&self, program: &str, args: &[&str], input: &str)
        -> std::io::Result<Output>;
}

/// The real system runner.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> std::io::Result<Output> {
        Command::new(program).args(args).output()
    }

    fn run_with_input(
        &self,
        program: &str,
        args: &[&str],
        input: &str,
    ) -> std::io::Result<Output> {
        use std::io::Write;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(stdin) = child.stdin.take() {
            let mut stdin = stdin;
            stdin.write_all(input.as_bytes())?;
        }
        child.wait_with_output()
    }
}

/// Shared handle to the default system runner.
#[must_use]
pub fn system_runner() -> Arc<dyn CommandRunner> {
    Arc::new(SystemRunner)
}

/// Renders an [`Output`]'s stderr (falling back to stdout) for error text.
#[must_use]
pub fn output_text(output: &Output) -> String {
    let err = String::from_utf8_lossy(&output.stderr);
    let err = err.trim();
    if err.is_empty() {
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    } else {
        err.to_string()
    }
}

pub mod testing {
    //! Recording/scripted runner for tests (unit and integration).

    use std::sync::Mutex;

    use super::*;

    /// One recorded invocation.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Invocation {
        /// Program name.
        pub program: String,
        /// Arguments.
        pub args: Vec<String>,
        /// Stdin contents, if any.
        pub input: Option<String>,
    }

    /// A scripted response keyed by program name.
    pub struct MockRunner {
        /// Recorded invocations in order.
        pub calls: Mutex<Vec<Invocation>>,
        /// Programs that should fail with the given stderr text.
        pub failures: Mutex<Vec<(String, String)>>,
        /// Canned stdout per program name.
        pub stdout: Mutex<Vec<(String, String)>>,
    }

    impl MockRunner {
        /// A runner where every command succeeds with empty output.
        #[must_use]
        pub fn ok() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                failures: Mutex::new(Vec::new()),
                stdout: Mutex::new(Vec::new()),
            }
        }

        /// Scripts `program` to exit non-zero with `stderr`.
        pub fn fail(&self, program: &str, stderr: &str) {
            self.failures
                .lock()
                .unwrap()
                .push((program.to_string(), stderr.to_string()));
        }

        /// Scripts `program` to succeed with `stdout`.
        pub fn respond(&self, program: &str, out: &str) {
            self.stdout
                .lock()
                .unwrap()
                .push((program.to_string(), out.to_string()));
        }

        /// All invocations of `program`, in order.
        #[must_use]
        pub fn calls_to(&self, program: &str) -> Vec<Invocation> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.program == program)
                .cloned()
                .collect()
        }

        fn respond_for(&self, program: &str) -> Output {
            use std::os::unix::process::ExitStatusExt;
            use std::process::ExitStatus;

            let failure = self
                .failures
                .lock()
                .unwrap()
                .iter()
                .find(|(p, _)| p == program)
                .map(|(_, e)| e.clone());
            if let Some(stderr) = failure {
                return Output {
                    status: ExitStatus::from_raw(1 << 8),
                    stdout: Vec::new(),
                    stderr: stderr.into_bytes(),
                };
            }
            let stdout = self
                .stdout
                .lock()
                .unwrap()
                .iter()
                .find(|(p, _)| p == program)
                .map(|(_, o)| o.clone())
                .unwrap_or_default();
            Output {
                status: ExitStatus::from_raw(0),
                stdout: stdout.into_bytes(),
                stderr: Vec::new(),
            }
        }
    }

    impl CommandRunner for MockRunner {
        fn run(&self, program: &str, args: &[&str]) -> std::io::Result<Output> {
            self.calls.lock().unwrap().push(Invocation {
                program: program.to_string(),
                args: args.iter().map(|s| (*s).to_string()).collect(),
                input: None,
            });
            Ok(self.respond_for(program))
        }

        fn run_with_input(
            &self,
            program: &str,
            args: &[&str],
            input: &str,
        ) -> std::io::Result<Output> {
            self.calls.lock().unwrap().push(Invocation {
                program: program.to_string(),
                args: args.iter().map(|s| (*s).to_string()).collect(),
                input: Some(input.to_string()),
            });
            Ok(self.respond_for(program))
        }
    }
}
