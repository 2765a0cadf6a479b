//! Request/response protocol over the daemon's Unix socket.
//!
//! Both directions carry newline-delimited JSON: the client writes one
//! [`Request`] line, the daemon answers with one [`Response`] line and
//! closes the connection. Any connection that fails to produce a decodable
//! request within the server deadline is answered `ok:false` and closed.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::SystemState;

/// Command names understood by the daemon.
pub mod commands {
    /// Read state with a refreshed compliance snapshot.
    pub const STATUS: &str = "status";
    /// Raw state dump.
    pub const STATE: &str = "state";
    /// Apply a shaping profile.
    pub const THROTTLE: &str = "throttle";
    /// Apply a CPU quota.
    pub const CPU: &str = "cpu";
    /// Rearm the input-latency interceptor.
    pub const LATENCY: &str = "latency";
    /// Write the daemon's OOM score.
    pub const OOM: &str = "oom";
    /// Add a domain to the firewall blocklist.
    pub const BLOCK_ADD: &str = "block-add";
    /// Remove a domain from the firewall blocklist.
    pub const BLOCK_REMOVE: &str = "block-rm";
    /// List blocked domains.
    pub const BLOCK_LIST: &str = "block-list";
    /// Assign a writing-lines task.
    pub const LINES_SET: &str = "lines-set";
    /// Cancel the writing-lines task.
    pub const LINES_CLEAR: &str = "lines-clear";
    /// Report writing-lines progress.
    pub const LINES_STATUS: &str = "lines-status";
    /// Submit one line of the writing task.
    pub const LINES_SUBMIT: &str = "lines-submit";
    /// Add an app to the forbidden-process list.
    pub const APP_ADD: &str = "app-add";
    /// Remove an app from the forbidden-process list.
    pub const APP_REMOVE: &str = "app-rm";
    /// List forbidden apps.
    pub const APP_LIST: &str = "app-list";
    /// Register one accepted line of an interactive penance session.
    pub const PENANCE_INPUT: &str = "penance-input";
    /// Wholesale restoration of the unrestricted state (authorized).
    pub const UNLOCK: &str = "unlock";
    /// Zero the failure score (authorized).
    pub const RESET_SCORE: &str = "reset-score";
    /// Run anti-tamper checks synchronously.
    pub const CHECK: &str = "check";
}

/// A command sent from the client to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Command name (see [`commands`]).
    pub command: String,
    /// String-keyed arguments.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub args: HashMap<String, String>,
}

impl Request {
    /// A request with no arguments.
    #[must_use]
    pub fn bare(command: &str) -> Self {
        Self {
            command: command.to_string(),
            args: HashMap::new(),
        }
    }

    /// A request with one argument.
    #[must_use]
    pub fn with_arg(command: &str, key: &str, value: &str) -> Self {
        let mut args = HashMap::new();
        args.insert(key.to_string(), value.to_string());
        Self {
            command: command.to_string(),
            args,
        }
    }

    /// Adds an argument, builder-style.
    #[must_use]
    pub fn arg(mut self, key: &str, value: &str) -> Self {
        self.args.insert(key.to_string(), value.to_string());
        self
    }
}

/// The daemon's answer to a [`Request`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Whether the command succeeded.
    pub ok: bool,
    /// Human-readable success message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Error description when `ok` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// State snapshot, included for state-bearing commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<SystemState>,
}

impl Response {
    /// A bare success.
    #[must_use]
    pub const fn success() -> Self {
        Self {
            ok: true,
            message: None,
            error: None,
            state: None,
        }
    }

    /// A success carrying a message.
    #[must_use]
    pub fn message(msg: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: Some(msg.into()),
            error: None,
            state: None,
        }
    }

    /// A failure carrying an error string.
    #[must_use]
    pub fn failure(err: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: None,
            error: Some(err.into()),
            state: None,
        }
    }

    /// Attaches a state snapshot.
    #[must_use]
    pub fn with_state(mut self, state: SystemState) -> Self {
        self.state = Some(state);
        self
    }
}

/// Argument extraction errors, reported verbatim to the caller.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArgError {
    /// The named argument was absent.
    #[error("missing required argument: {0}")]
    Missing(String),
    /// The named argument failed integer parsing.
    #[error("invalid integer for {key}: {value:?}")]
    NotAnInteger {
        /// Argument name.
        key: String,
        /// Offending value.
        value: String,
    },
}

/// Extracts a required string argument.
///
/// # Errors
///
/// Returns [`ArgError::Missing`] if absent or empty.
pub fn str_arg<'a>(args: &'a HashMap<String, String>, key: &str) -> Result<&'a str, ArgError> {
    match args.get(key).map(String::as_str) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ArgError::Missing(key.to_string())),
    }
}

/// Extracts a required integer argument.
///
/// # Errors
///
/// Returns [`ArgError`] if absent or unparseable.
pub fn int_arg(args: &HashMap<String, String>, key: &str) -> Result<i64, ArgError> {
    let raw = args
        .get(key)
        .ok_or_else(|| ArgError::Missing(key.to_string()))?;
    raw.parse().map_err(|_| ArgError::NotAnInteger {
        key: key.to_string(),
        value: raw.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_as_single_line_json() {
        let req = Request::with_arg(commands::THROTTLE, "profile", "choke");
        let line = serde_json::to_string(&req).unwrap();
        assert!(!line.contains('\n'));
        let back: Request = serde_json::from_str(&line).unwrap();
        assert_eq!(back.command, "throttle");
        assert_eq!(back.args["profile"], "choke");
    }

    #[test]
    fn bare_request_omits_args() {
        let line = serde_json::to_string(&Request::bare(commands::STATUS)).unwrap();
        assert_eq!(line, r#"{"command":"status"}"#);
    }

    #[test]
    fn response_omits_empty_fields() {
        let line = serde_json::to_string(&Response::message("done")).unwrap();
        assert_eq!(line, r#"{"ok":true,"message":"done"}"#);
        let line = serde_json::to_string(&Response::failure("nope")).unwrap();
        assert_eq!(line, r#"{"ok":false,"error":"nope"}"#);
    }

    #[test]
    fn int_arg_reports_missing_and_malformed() {
        let mut args = HashMap::new();
        assert_eq!(
            int_arg(&args, "percent"),
            Err(ArgError::Missing("percent".to_string()))
        );
        args.insert("percent".to_string(), "lots".to_string());
        assert!(matches!(
            int_arg(&args, "percent"),
            Err(ArgError::NotAnInteger { .. })
        ));
        args.insert("percent".to_string(), "42".to_string());
        assert_eq!(int_arg(&args, "percent").unwrap(), 42);
    }
}
