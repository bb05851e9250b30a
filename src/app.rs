//! Demo application served by the `graceful-http` binary.
//!
//! Endpoints:
//! - `GET /` - endpoint listing
//! - `GET /health` - liveness probe
//! - `GET /sleep?ms=N` - responds after N milliseconds, for watching a drain
//! - `GET /error` - handler failure, answered with 500
//! - `GET <metrics path>` - Prometheus metrics, when enabled

use crate::handler::{text, Body, BoxError, Handler};
use crate::metrics::MetricsCollector;
use bytes::Bytes;
use futures::future::BoxFuture;
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode, Uri};
use std::time::Duration;
use tracing::{debug, error};

/// Longest delay `/sleep` will honour.
pub const MAX_SLEEP: Duration = Duration::from_secs(60);

/// The demo request handler.
#[derive(Clone)]
pub struct App {
    metrics: Option<(MetricsCollector, String)>,
}

impl App {
    /// Create the app without a metrics endpoint.
    pub fn new() -> Self {
        Self { metrics: None }
    }

    /// Serve `collector` on `path`.
    pub fn with_metrics(mut self, collector: MetricsCollector, path: impl Into<String>) -> Self {
        self.metrics = Some((collector, path.into()));
        self
    }

    /// Produce the response for `method` and `uri`.
    pub async fn respond(&self, method: &Method, uri: &Uri) -> Result<Response<Body>, BoxError> {
        let path = uri.path();
        debug!(path = %path, method = %method, "request");

        if method != Method::GET {
            return Ok(text(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed\n"));
        }

        if let Some((collector, metrics_path)) = &self.metrics {
            if path == metrics_path {
                return Ok(encode_metrics(collector));
            }
        }

        match path {
            "/" => Ok(text(StatusCode::OK, self.index())),
            "/health" | "/healthz" => Ok(text(StatusCode::OK, "OK\n")),
            "/sleep" => match sleep_duration(uri) {
                Some(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(text(
                        StatusCode::OK,
                        format!("slept {} ms\n", delay.as_millis()),
                    ))
                }
                None => Ok(text(
                    StatusCode::BAD_REQUEST,
                    "expected ?ms=<milliseconds>\n",
                )),
            },
            "/error" => Err("intentional failure".into()),
            _ => Ok(text(StatusCode::NOT_FOUND, "Not found\n")),
        }
    }

    fn index(&self) -> String {
        let mut body = String::from(
            "graceful-http\n\nEndpoints:\n  /health - Health check\n  /sleep?ms=N - Delayed response\n",
        );
        if let Some((_, path)) = &self.metrics {
            body.push_str(&format!("  {} - Prometheus metrics\n", path));
        }
        body
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

impl Handler for App {
    fn call(&self, req: Request<Incoming>) -> BoxFuture<'static, Result<Response<Body>, BoxError>> {
        let app = self.clone();
        Box::pin(async move { app.respond(req.method(), req.uri()).await })
    }
}

fn encode_metrics(collector: &MetricsCollector) -> Response<Body> {
    match collector.encode() {
        Ok(buffer) => {
            let mut response = text(StatusCode::OK, Bytes::from(buffer));
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            );
            response
        }
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            text(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics\n")
        }
    }
}

/// Parse `ms=N` from the query string, capped at [`MAX_SLEEP`].
fn sleep_duration(uri: &Uri) -> Option<Duration> {
    let ms = uri
        .query()?
        .split('&')
        .find_map(|pair| pair.strip_prefix("ms="))?
        .parse::<u64>()
        .ok()?;
    Some(Duration::from_millis(ms).min(MAX_SLEEP))
}
