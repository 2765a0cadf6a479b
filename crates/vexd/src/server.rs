//! Unix-socket command server.
//!
//! One request per connection: read a JSON line, dispatch, write a JSON
//! line, close. The whole exchange runs under a 10-second deadline; a
//! connection that cannot produce a decodable request in time is answered
//! `ok:false` and closed. Reachability is a filesystem decision: the
//! socket is owned by root, group `vex`, mode 0660, and is re-created
//! under a cleared umask so those bits survive.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::stat::{umask, Mode};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use vex_core::paths::OPERATOR_GROUP;
use vex_core::protocol::{Request, Response};

use crate::handlers::Daemon;

/// Deadline for one full request/response exchange.
pub const CONNECTION_DEADLINE: Duration = Duration::from_secs(10);

/// Upper bound on a request line.
const MAX_REQUEST_BYTES: u64 = 1024 * 1024;

/// Server lifecycle errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Socket directory or file preparation failed.
    #[error("failed to prepare socket path {path}: {source}")]
    Prepare {
        /// The socket path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Binding the listener failed.
    #[error("failed to bind {path}: {source}")]
    Bind {
        /// The socket path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// The bound IPC server.
pub struct IpcServer {
    listener: UnixListener,
    socket_path: PathBuf,
    daemon: Arc<Daemon>,
}

impl IpcServer {
    /// Removes any stale socket, binds under a cleared umask, and applies
    /// the 0660 + operator-group policy.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError`] when the runtime directory cannot be
    /// prepared or the bind fails.
    pub fn bind(daemon: Arc<Daemon>) -> Result<Self, ServerError> {
        let socket_path = daemon.paths.socket();

        let runtime_dir = daemon.paths.runtime_dir.clone();
        std::fs::create_dir_all(&runtime_dir).map_err(|source| ServerError::Prepare {
            path: socket_path.clone(),
            source,
        })?;
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&runtime_dir, std::fs::Permissions::from_mode(0o755));
        }

        if socket_path.exists() {
            std::fs::remove_file(&socket_path).map_err(|source| ServerError::Prepare {
                path: socket_path.clone(),
                source,
            })?;
        }

        // The default umask strips the group-write bit operator-group
        // members need to connect(); clear it across the bind only.
        let old_mask = umask(Mode::empty());
        let bind_result = UnixListener::bind(&socket_path);
        umask(old_mask);
        let listener = bind_result.map_err(|source| ServerError::Bind {
            path: socket_path.clone(),
            source,
        })?;

        apply_socket_ownership(&socket_path);
        info!(socket = %socket_path.display(), "ipc server listening");

        Ok(Self {
            listener,
            socket_path,
            daemon,
        })
    }

    /// The bound socket path.
    #[must_use]
    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    /// Accepts connections until the shutdown signal fires, then removes
    /// the socket file.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let daemon = self.daemon.clone();
                            tokio::spawn(async move {
                                handle_connection(stream, daemon).await;
                            });
                        }
                        Err(e) => error!(error = %e, "failed to accept connection"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("ipc server shutting down");
                    break;
                }
            }
        }

        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}

/// Handles one connection: one request, one response, under the deadline.
async fn handle_connection(mut stream: UnixStream, daemon: Arc<Daemon>) {
    let exchange = tokio::time::timeout(CONNECTION_DEADLINE, async {
        let (reader, mut writer) = stream.split();
        let mut lines = BufReader::new(reader.take(MAX_REQUEST_BYTES)).lines();

        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("connection closed before a request arrived");
                return;
            }
            Err(e) => {
                debug!(error = %e, "failed to read request");
                let _ = write_response(&mut writer, &Response::failure("malformed request")).await;
                return;
            }
        };

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => daemon.dispatch(request).await,
            Err(e) => {
                debug!(error = %e, "request did not decode");
                Response::failure("malformed request")
            }
        };

        if let Err(e) = write_response(&mut writer, &response).await {
            warn!(error = %e, "failed to send response");
        }
    })
    .await;

    if exchange.is_err() {
        // Deadline exceeded: answer ok:false best-effort and drop.
        let deadline_response = Response::failure("request deadline exceeded");
        let _ = tokio::time::timeout(Duration::from_secs(1), async {
            let _ = write_response(&mut stream, &deadline_response).await;
        })
        .await;
        debug!("connection aborted at deadline");
    }
}

async fn write_response<W>(writer: &mut W, response: &Response) -> std::io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let mut line = serde_json::to_vec(response).unwrap_or_else(|_| b"{\"ok\":false}".to_vec());
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

/// Best-effort chgrp to the operator group so non-root members can
/// connect; without it only root can drive the daemon.
fn apply_socket_ownership(socket_path: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Err(e) = std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o660)) {
        warn!(error = %e, "could not chmod socket to 0660");
    }

    match nix::unistd::Group::from_name(OPERATOR_GROUP) {
        Ok(Some(group)) => {
            if let Err(e) = nix::unistd::chown(socket_path, None, Some(group.gid)) {
                warn!(error = %e, "could not set socket group to '{OPERATOR_GROUP}'");
            } else {
                info!("socket group set to '{OPERATOR_GROUP}'");
            }
        }
        Ok(None) => {
            warn!("group '{OPERATOR_GROUP}' not found; non-root operators will need sudo");
        }
        Err(e) => {
            warn!(error = %e, "could not look up group '{OPERATOR_GROUP}'");
        }
    }
}
