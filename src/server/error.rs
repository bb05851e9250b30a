//! Terminal outcomes of a serve call.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// How a serve call ended when it was asked to stop.
///
/// These are not failures: they tell the caller *why* the server is no
/// longer serving so it can log or branch on the shutdown reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Listener closed and every in-flight connection drained.
    Graceful,
    /// Listener closed and in-flight connections were abandoned.
    Killed,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Graceful => f.write_str("server stopped gracefully"),
            StopReason::Killed => f.write_str("server stopped: process killed"),
        }
    }
}

/// Errors that end a serve call.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to load TLS key pair (cert: {}, key: {}): {reason}", cert.display(), key.display())]
    Certificate {
        cert: PathBuf,
        key: PathBuf,
        reason: String,
    },

    #[error("server engine failed: {0}")]
    Engine(#[source] io::Error),

    #[error("received {signal}: live binary reload is not supported")]
    ReloadUnsupported { signal: &'static str },
}

impl ServeError {
    /// Whether this error came from opening the listener (bind or TLS material),
    /// i.e. before any connection was ever served.
    pub fn is_startup(&self) -> bool {
        matches!(self, ServeError::Listen { .. } | ServeError::Certificate { .. })
    }
}
