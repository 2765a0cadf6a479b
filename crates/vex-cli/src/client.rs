//! Socket client for the daemon.
//!
//! Stateless request/response: connect, write one JSON line, read one JSON
//! line, close. The whole exchange shares a 10-second deadline with the
//! server side.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use vex_core::protocol::{Request, Response};
use vex_core::Paths;

/// Deadline for one request/response exchange.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Client-side errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The daemon socket does not exist or refused the connection.
    #[error("could not connect to vexd at {socket} (is the service running?)")]
    DaemonNotRunning {
        /// Socket path attempted.
        socket: String,
    },

    /// I/O failure mid-exchange.
    #[error("daemon communication failed: {0}")]
    Io(#[from] std::io::Error),

    /// The response line did not decode.
    #[error("daemon sent an unparseable response: {0}")]
    BadResponse(#[from] serde_json::Error),

    /// The daemon closed the connection without answering.
    #[error("daemon closed the connection without a response")]
    NoResponse,
}

/// Connects to the daemon socket per request.
pub struct Client {
    socket: PathBuf,
}

impl Client {
    /// A client over the layout's socket path.
    #[must_use]
    pub fn new(paths: &Paths) -> Self {
        Self {
            socket: paths.socket(),
        }
    }

    /// Sends one request and reads the response.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] on connection, transport, or decode
    /// failure. A daemon-level `ok:false` is NOT an error here; callers
    /// inspect the response.
    pub fn send(&self, request: &Request) -> Result<Response, ClientError> {
        let stream = UnixStream::connect(&self.socket).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
                ClientError::DaemonNotRunning {
                    socket: self.socket.display().to_string(),
                }
            }
            _ => ClientError::Io(e),
        })?;
        stream.set_read_timeout(Some(EXCHANGE_TIMEOUT))?;
        stream.set_write_timeout(Some(EXCHANGE_TIMEOUT))?;

        let mut writer = &stream;
        let mut line = serde_json::to_vec(request)?;
        line.push(b'\n');
        writer.write_all(&line)?;
        writer.flush()?;

        let mut reader = BufReader::new(&stream);
        let mut response_line = String::new();
        let read = reader.read_line(&mut response_line)?;
        if read == 0 {
            return Err(ClientError::NoResponse);
        }
        Ok(serde_json::from_str(&response_line)?)
    }
}
