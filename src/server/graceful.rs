//! Graceful server: serve loop plus shutdown coordination.
//!
//! A serve call moves through `Serving` into exactly one terminal state:
//!
//! - the accept loop fails with a real error → [`ServeError::Engine`]
//! - a graceful signal arrives → keep-alive is disabled, in-flight
//!   connections drain, [`StopReason::Graceful`]
//! - a forced signal arrives → [`StopReason::Killed`] without draining
//! - the reserved reload signal arrives → [`ServeError::ReloadUnsupported`]
//!
//! The listener is always closed by the signal watcher before the stop is
//! published, so the accept loop's [`AcceptError::Closed`] is expected and
//! never reported.

use crate::config::ServerConfig;
use crate::handler::Handler;
use crate::metrics::{MetricsCollector, ShutdownReason};
use crate::server::conn::{serve_connection, Engine, EngineSettings};
use crate::server::error::{ServeError, StopReason};
use crate::server::listener::{AcceptError, Listener, DEFAULT_BACKLOG};
use crate::server::signal::{watch_signals, OsSignals, Signal, Stop};
use crate::server::tracker::ConnTracker;
use crate::util::ShutdownHandle;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinError;
use tracing::{debug, error, info, instrument, warn};

/// First delay after a transient accept error.
const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);
/// Upper bound on the accept retry delay.
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Serve `handler` on `addr` until a stop signal arrives.
pub async fn listen_and_serve(
    addr: SocketAddr,
    handler: impl Handler,
) -> Result<StopReason, ServeError> {
    GracefulServer::new(addr, handler).listen_and_serve().await
}

/// Serve `handler` over TLS on `addr` until a stop signal arrives.
///
/// HTTP/2 is negotiated alongside HTTP/1.1.
pub async fn listen_and_serve_tls(
    addr: SocketAddr,
    handler: impl Handler,
    cert: impl AsRef<Path>,
    key: impl AsRef<Path>,
) -> Result<StopReason, ServeError> {
    GracefulServer::new(addr, handler)
        .with_settings(EngineSettings {
            http2: true,
            ..EngineSettings::default()
        })
        .listen_and_serve_tls(cert, key)
        .await
}

/// HTTP server that stops accepting on a termination signal and drains
/// in-flight connections before returning.
///
/// Each instance owns its own tracker and stop channels; several can run in
/// one process. A server serves once: every entry point consumes it.
pub struct GracefulServer {
    addr: SocketAddr,
    handler: Arc<dyn Handler>,
    settings: EngineSettings,
    backlog: i32,
    handle_signals: bool,
    drain_timeout: Option<Duration>,
    tracker: ConnTracker,
    shutdown: ShutdownHandle,
    injected: watch::Receiver<Option<Signal>>,
    metrics: Option<MetricsCollector>,
}

impl GracefulServer {
    /// Create a server for `handler` on `addr` with default engine settings.
    pub fn new(addr: SocketAddr, handler: impl Handler) -> Self {
        let shutdown = ShutdownHandle::new();
        let injected = shutdown.subscribe();

        Self {
            addr,
            handler: Arc::new(handler),
            settings: EngineSettings::default(),
            backlog: DEFAULT_BACKLOG,
            handle_signals: true,
            drain_timeout: None,
            tracker: ConnTracker::new(),
            shutdown,
            injected,
            metrics: None,
        }
    }

    /// Create a server from the `server` section of the configuration.
    pub fn from_config(config: &ServerConfig, handler: impl Handler) -> Self {
        Self::new(config.listen, handler)
            .with_settings(EngineSettings {
                read_timeout: config.read_timeout,
                write_timeout: config.write_timeout,
                keep_alive: config.keep_alive,
                http2: config.http2,
            })
            .with_backlog(config.backlog)
            .with_signals(config.handle_signals)
            .with_drain_timeout(config.drain_timeout)
    }

    /// Replace the engine settings.
    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the listen backlog.
    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Whether OS signals are watched. When disabled, only a
    /// [`ShutdownHandle`] can stop the server.
    pub fn with_signals(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    /// Bound the graceful drain. When it elapses the stop escalates to
    /// [`StopReason::Killed`]. `None` waits for every connection.
    pub fn with_drain_timeout(mut self, limit: Option<Duration>) -> Self {
        self.drain_timeout = limit;
        self
    }

    /// Record connection, request and shutdown metrics.
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Handle that injects stop signals into this server.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// This server's in-flight connection tracker.
    pub fn tracker(&self) -> ConnTracker {
        self.tracker.clone()
    }

    /// Bind the configured address and serve plain HTTP.
    pub async fn listen_and_serve(self) -> Result<StopReason, ServeError> {
        let listener = Listener::bind_with_backlog(self.addr, self.backlog).await?;
        self.serve(listener).await
    }

    /// Load the key pair, bind the configured address and serve HTTPS.
    ///
    /// Certificate problems are reported before anything is bound or spawned.
    pub async fn listen_and_serve_tls(
        self,
        cert: impl AsRef<Path>,
        key: impl AsRef<Path>,
    ) -> Result<StopReason, ServeError> {
        let listener = Listener::bind_tls_with_backlog(
            self.addr,
            cert.as_ref(),
            key.as_ref(),
            self.settings.http2,
            self.backlog,
        )
        .await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(self, listener: Listener) -> Result<StopReason, ServeError> {
        let GracefulServer {
            handler,
            settings,
            handle_signals,
            drain_timeout,
            tracker,
            shutdown: _shutdown,
            injected,
            metrics,
            ..
        } = self;

        let local_addr = listener.local_addr();
        let close = listener.close_handle();

        let os_signals = if handle_signals {
            match OsSignals::install() {
                Ok(signals) => Some(signals),
                Err(e) => {
                    error!(error = %e, "failed to install signal handlers");
                    None
                }
            }
        } else {
            None
        };

        let (stop_tx, mut stop_rx) = oneshot::channel();
        let watcher = tokio::spawn(watch_signals(close.clone(), os_signals, injected, stop_tx));

        let (drain_tx, drain_rx) = watch::channel(false);
        let engine = Arc::new(Engine {
            handler,
            settings,
            tls: listener.tls_acceptor(),
            draining: drain_rx,
            metrics: metrics.clone(),
        });

        info!(listen = %local_addr, tls = listener.is_tls(), "server listening");

        let mut serve_task = tokio::spawn(accept_loop(listener, engine, tracker.clone()));
        let mut serve_done = false;
        let mut watching = true;

        let stop = loop {
            tokio::select! {
                result = &mut serve_task, if !serve_done => {
                    serve_done = true;
                    match flatten(result) {
                        Ok(never) => match never {},
                        Err(e) if e.is_benign_close() => {
                            debug!("listener closed, waiting for stop signal");
                        }
                        Err(e) => {
                            error!(error = %e, "accept loop failed");
                            watcher.abort();
                            close.close();
                            if let Some(metrics) = &metrics {
                                metrics.record_shutdown(ShutdownReason::Error);
                            }
                            return Err(ServeError::Engine(into_io(e)));
                        }
                    }
                }

                stop = &mut stop_rx, if watching => match stop {
                    Ok(stop) => break stop,
                    Err(_) => {
                        warn!("signal watcher exited without a stop, serving until the listener fails");
                        watching = false;
                    }
                },

                else => {
                    return Err(ServeError::Engine(io::Error::other(
                        "listener closed without a stop signal",
                    )));
                }
            }
        };

        // The watcher closed the listener; let the accept loop drop the socket
        // so the port refuses new connections before we report anything.
        if !serve_done {
            match flatten(serve_task.await) {
                Ok(never) => match never {},
                Err(e) if e.is_benign_close() => {}
                Err(e) => debug!(error = %e, "accept loop failed during shutdown"),
            }
        }

        let record = |reason| {
            if let Some(metrics) = &metrics {
                metrics.record_shutdown(reason);
            }
        };

        match stop {
            Stop::Graceful(signal) => {
                info!(signal = %signal, active = tracker.active(), "draining connections");
                drain_tx.send_replace(true);

                let started = Instant::now();
                let drained = match drain_timeout {
                    Some(limit) => tokio::time::timeout(limit, tracker.wait()).await.is_ok(),
                    None => {
                        tracker.wait().await;
                        true
                    }
                };

                if drained {
                    let elapsed = started.elapsed();
                    if let Some(metrics) = &metrics {
                        metrics.record_drain(elapsed);
                    }
                    record(ShutdownReason::Graceful);
                    info!(drain_ms = elapsed.as_millis(), "all connections drained");
                    Ok(StopReason::Graceful)
                } else {
                    record(ShutdownReason::DrainTimeout);
                    warn!(
                        abandoned = tracker.active(),
                        "drain timed out, abandoning remaining connections"
                    );
                    Ok(StopReason::Killed)
                }
            }
            Stop::Forced(signal) => {
                record(ShutdownReason::Killed);
                warn!(signal = %signal, abandoned = tracker.active(), "stopped without draining");
                Ok(StopReason::Killed)
            }
            Stop::Unsupported(signal) => {
                record(ShutdownReason::Unsupported);
                Err(ServeError::ReloadUnsupported {
                    signal: signal.name(),
                })
            }
        }
    }
}

/// Accept connections until the listener is closed or fails for real.
#[instrument(skip_all, fields(listen = %listener.local_addr()))]
async fn accept_loop(
    listener: Listener,
    engine: Arc<Engine>,
    tracker: ConnTracker,
) -> Result<Infallible, AcceptError> {
    let close = listener.close_handle();
    let mut backoff: Option<Duration> = None;

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                backoff = None;
                // Count the connection before spawning so a drain that starts
                // after this loop exits sees it.
                let guard = tracker.track();
                tokio::spawn(serve_connection(Arc::clone(&engine), stream, peer, guard));
            }
            Err(e) if e.is_transient() => {
                let delay = backoff.map_or(MIN_ACCEPT_BACKOFF, |d| (d * 2).min(MAX_ACCEPT_BACKOFF));
                backoff = Some(delay);
                warn!(error = %e, retry_in_ms = delay.as_millis(), "accept failed, retrying");

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = close.closed() => return Err(AcceptError::Closed),
                }
            }
            Err(e) => return Err(e),
        }
    }
}

fn flatten(
    result: Result<Result<Infallible, AcceptError>, JoinError>,
) -> Result<Infallible, AcceptError> {
    result.unwrap_or_else(|e| Err(AcceptError::Io(io::Error::other(e))))
}

fn into_io(e: AcceptError) -> io::Error {
    match e {
        AcceptError::Io(e) => e,
        AcceptError::Closed => io::Error::other(AcceptError::Closed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{text, BoxError};
    use hyper::body::Incoming;
    use hyper::{Request, StatusCode};

    async fn ok(_req: Request<Incoming>) -> Result<hyper::Response<crate::handler::Body>, BoxError> {
        Ok(text(StatusCode::OK, "ok"))
    }

    #[test]
    fn test_from_config() {
        let config = ServerConfig {
            drain_timeout: Some(Duration::from_secs(3)),
            handle_signals: false,
            backlog: 64,
            ..ServerConfig::default()
        };
        let server = GracefulServer::from_config(&config, ok);
        assert_eq!(server.addr, config.listen);
        assert_eq!(server.drain_timeout, Some(Duration::from_secs(3)));
        assert_eq!(server.backlog, 64);
        assert!(!server.handle_signals);
        assert_eq!(server.settings.read_timeout, config.read_timeout);
    }

    #[tokio::test]
    async fn test_graceful_stop_when_idle() {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let server = GracefulServer::new(listener.local_addr(), ok).with_signals(false);
        let handle = server.shutdown_handle();

        let serving = tokio::spawn(server.serve(listener));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.graceful());

        let result = tokio::time::timeout(Duration::from_secs(2), serving)
            .await
            .expect("idle server should stop promptly")
            .unwrap();
        assert_eq!(result.unwrap(), StopReason::Graceful);
    }

    #[tokio::test]
    async fn test_forced_stop_when_idle() {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let server = GracefulServer::new(listener.local_addr(), ok).with_signals(false);
        let handle = server.shutdown_handle();

        let serving = tokio::spawn(server.serve(listener));
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.force();

        assert_eq!(serving.await.unwrap().unwrap(), StopReason::Killed);
    }

    #[tokio::test]
    async fn test_reload_signal_is_fatal() {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let server = GracefulServer::new(listener.local_addr(), ok).with_signals(false);
        let handle = server.shutdown_handle();

        let serving = tokio::spawn(server.serve(listener));
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.send(Signal::Reload);

        let err = serving.await.unwrap().unwrap_err();
        assert!(matches!(err, ServeError::ReloadUnsupported { signal: "SIGUSR2" }));
    }

    #[tokio::test]
    async fn test_later_signal_does_not_override_first() {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let server = GracefulServer::new(listener.local_addr(), ok).with_signals(false);
        let handle = server.shutdown_handle();

        assert!(handle.graceful());
        assert!(!handle.force());

        let result = tokio::time::timeout(Duration::from_secs(2), server.serve(listener))
            .await
            .expect("latched signal should stop the server");
        assert_eq!(result.unwrap(), StopReason::Graceful);
    }

    #[tokio::test]
    async fn test_signal_before_serve_is_not_lost() {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let server = GracefulServer::new(listener.local_addr(), ok).with_signals(false);
        server.shutdown_handle().graceful();

        let result = tokio::time::timeout(Duration::from_secs(2), server.serve(listener))
            .await
            .expect("queued signal should stop the server");
        assert_eq!(result.unwrap(), StopReason::Graceful);
    }
}
