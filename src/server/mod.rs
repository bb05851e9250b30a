//! Graceful HTTP server.
//!
//! The listener, the per-connection tracker, the signal watcher and the
//! coordinating serve loop. Request handling itself is delegated to a
//! [`Handler`](crate::handler::Handler) and the HTTP wire format to hyper.

mod conn;
mod error;
mod graceful;
mod listener;
mod signal;
mod tracker;

pub use conn::{EngineSettings, REQUEST_ID_HEADER};
pub use error::{ServeError, StopReason};
pub use graceful::{listen_and_serve, listen_and_serve_tls, GracefulServer};
pub use listener::{alpn_protocols, AcceptError, CloseHandle, Listener, DEFAULT_BACKLOG};
pub use signal::{watch_signals, OsSignals, Signal, Stop};
pub use tracker::{ConnGuard, ConnTracker};
