//! Per-connection driver.
//!
//! Runs one accepted connection through hyper until it closes, is hijacked by
//! an upgrade, or finishes its in-flight request after draining begins.

use crate::handler::{text, Body, BoxError, Handler};
use crate::metrics::{MetricsCollector, Transport};
use crate::server::tracker::ConnGuard;
use crate::util::{ConnId, RequestId};
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

/// Header carrying the request id on every response.
pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Settings passed through to the HTTP engine for every connection.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Bound on reading request headers and on the TLS handshake.
    pub read_timeout: Duration,
    /// Bound on the handler producing a response.
    pub write_timeout: Duration,
    /// Whether idle connections are kept open between requests.
    pub keep_alive: bool,
    /// Whether HTTP/2 is served next to HTTP/1.1.
    pub http2: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(10),
            keep_alive: true,
            http2: false,
        }
    }
}

/// State shared by every connection of one serve call.
pub(crate) struct Engine {
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) settings: EngineSettings,
    pub(crate) tls: Option<TlsAcceptor>,
    pub(crate) draining: watch::Receiver<bool>,
    pub(crate) metrics: Option<MetricsCollector>,
}

impl Engine {
    fn transport(&self) -> Transport {
        if self.tls.is_some() {
            Transport::Tls
        } else {
            Transport::Plain
        }
    }

    fn builder(&self) -> auto::Builder<TokioExecutor> {
        let mut builder = auto::Builder::new(TokioExecutor::new());
        builder
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(self.settings.read_timeout)
            .keep_alive(self.settings.keep_alive);

        if self.settings.http2 {
            builder.http2().timer(TokioTimer::new());
            builder
        } else {
            builder.http1_only()
        }
    }

    async fn handle(&self, req: Request<Incoming>) -> Response<Body> {
        let timer = self.metrics.as_ref().map(MetricsCollector::start_request_timer);
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let request_id = req
            .headers()
            .get(&REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(RequestId::from_string)
            .unwrap_or_else(RequestId::new);

        let mut response = match timeout(self.settings.write_timeout, self.handler.call(req)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(request_id = %request_id, method = %method, path = %path, error = %e, "handler failed");
                text(StatusCode::INTERNAL_SERVER_ERROR, format!("{e}\n"))
            }
            Err(_) => {
                warn!(
                    request_id = %request_id,
                    method = %method,
                    path = %path,
                    timeout_ms = self.settings.write_timeout.as_millis(),
                    "handler exceeded write timeout"
                );
                text(StatusCode::SERVICE_UNAVAILABLE, "response timed out\n")
            }
        };

        if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }

        if let Some(timer) = timer {
            timer.record(method.as_str(), response.status().as_u16());
        }

        response
    }
}

/// Serve one accepted connection to completion.
///
/// `guard` keeps the connection counted as in flight and is released when
/// this returns.
pub(crate) async fn serve_connection(
    engine: Arc<Engine>,
    stream: TcpStream,
    peer: SocketAddr,
    guard: ConnGuard,
) {
    let conn_id = ConnId::next();
    let transport = engine.transport();
    let start = Instant::now();

    if let Err(e) = stream.set_nodelay(true) {
        warn!(error = %e, "failed to set TCP_NODELAY on client connection");
    }

    if let Some(metrics) = &engine.metrics {
        metrics.connection_opened(transport);
    }

    let result = match engine.tls.clone() {
        Some(acceptor) => match timeout(engine.settings.read_timeout, acceptor.accept(stream)).await {
            Ok(Ok(tls_stream)) => drive(Arc::clone(&engine), TokioIo::new(tls_stream)).await,
            Ok(Err(e)) => Err(Box::new(e) as BoxError),
            Err(_) => Err("TLS handshake timed out".into()),
        },
        None => drive(Arc::clone(&engine), TokioIo::new(stream)).await,
    };

    if let Some(metrics) = &engine.metrics {
        metrics.connection_closed(transport);
    }

    let duration = start.elapsed();
    match result {
        Ok(()) => debug!(
            conn = %conn_id,
            client = %peer,
            duration_ms = duration.as_millis(),
            "connection completed"
        ),
        Err(e) => debug!(
            conn = %conn_id,
            client = %peer,
            duration_ms = duration.as_millis(),
            error = %e,
            "connection ended with error"
        ),
    }

    drop(guard);
}

async fn drive<I>(engine: Arc<Engine>, io: I) -> Result<(), BoxError>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let builder = engine.builder();
    let mut draining = engine.draining.clone();

    let service = {
        let engine = Arc::clone(&engine);
        service_fn(move |req| {
            let engine = Arc::clone(&engine);
            async move { Ok::<_, Infallible>(engine.handle(req).await) }
        })
    };

    let conn = builder.serve_connection_with_upgrades(io, service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => result,
        true = wait_draining(&mut draining) => {
            // Stop keep-alive: finish the in-flight request, then close.
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    }
}

/// `true` once draining starts; `false` if the coordinator went away without draining.
async fn wait_draining(draining: &mut watch::Receiver<bool>) -> bool {
    draining.wait_for(|draining| *draining).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = EngineSettings::default();
        assert_eq!(settings.read_timeout, Duration::from_secs(5));
        assert_eq!(settings.write_timeout, Duration::from_secs(10));
        assert!(settings.keep_alive);
        assert!(!settings.http2);
    }

    #[tokio::test]
    async fn test_wait_draining() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { wait_draining(&mut rx).await });
        tx.send(true).unwrap();
        assert!(waiter.await.unwrap());

        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        assert!(!wait_draining(&mut rx).await);
    }
}
