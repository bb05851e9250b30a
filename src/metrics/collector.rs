//! Metrics collector using prometheus-client.
//!
//! Provides metrics for connections, requests, and shutdowns.

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Labels for request metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub method: String,
    pub status: String,
}

/// Labels for connection metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ConnectionLabels {
    pub transport: Transport,
}

/// Whether a connection is encrypted.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Transport {
    Plain,
    Tls,
}

/// Labels for shutdown metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ShutdownLabels {
    pub reason: ShutdownReason,
}

/// Why a serve call ended.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum ShutdownReason {
    Graceful,
    Killed,
    DrainTimeout,
    Unsupported,
    Error,
}

/// Collects and stores all metrics.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsCollectorInner>,
}

struct MetricsCollectorInner {
    /// Total requests counter.
    requests_total: Family<RequestLabels, Counter>,
    /// Request duration histogram (in seconds).
    request_duration_seconds: Histogram,
    /// Active connections gauge.
    active_connections: Family<ConnectionLabels, Gauge>,
    /// Total connections counter.
    connections_total: Family<ConnectionLabels, Counter>,
    /// Terminal outcomes of serve calls.
    shutdowns_total: Family<ShutdownLabels, Counter>,
    /// Time spent draining connections after a graceful stop.
    drain_duration_seconds: Histogram,
    /// The prometheus registry.
    registry: Registry,
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        // Buckets: 1ms, 2.5ms, 6.25ms, ... ~15s
        let request_duration_seconds = Histogram::new(exponential_buckets(0.001, 2.5, 13));
        // Buckets: 10ms .. ~40s
        let drain_duration_seconds = Histogram::new(exponential_buckets(0.01, 2.0, 13));
        let requests_total = Family::<RequestLabels, Counter>::default();
        let active_connections = Family::<ConnectionLabels, Gauge>::default();
        let connections_total = Family::<ConnectionLabels, Counter>::default();
        let shutdowns_total = Family::<ShutdownLabels, Counter>::default();

        registry.register(
            "graceful_http_requests",
            "Total number of requests processed",
            requests_total.clone(),
        );
        registry.register(
            "graceful_http_request_duration_seconds",
            "Request duration in seconds",
            request_duration_seconds.clone(),
        );
        registry.register(
            "graceful_http_active_connections",
            "Number of open connections",
            active_connections.clone(),
        );
        registry.register(
            "graceful_http_connections",
            "Total number of accepted connections",
            connections_total.clone(),
        );
        registry.register(
            "graceful_http_shutdowns",
            "Serve calls ended, by reason",
            shutdowns_total.clone(),
        );
        registry.register(
            "graceful_http_drain_duration_seconds",
            "Time spent draining connections during graceful shutdown",
            drain_duration_seconds.clone(),
        );

        Self {
            inner: Arc::new(MetricsCollectorInner {
                requests_total,
                request_duration_seconds,
                active_connections,
                connections_total,
                shutdowns_total,
                drain_duration_seconds,
                registry,
            }),
        }
    }

    /// Encode all metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.inner.registry)?;
        Ok(buffer)
    }

    /// Record a completed request.
    pub fn record_request(&self, method: &str, status: u16, duration: Duration) {
        let labels = RequestLabels {
            method: method.to_string(),
            status: status.to_string(),
        };
        self.inner.requests_total.get_or_create(&labels).inc();
        self.inner
            .request_duration_seconds
            .observe(duration.as_secs_f64());
    }

    /// Increment active connections.
    pub fn connection_opened(&self, transport: Transport) {
        let labels = ConnectionLabels { transport };
        self.inner.active_connections.get_or_create(&labels).inc();
        self.inner.connections_total.get_or_create(&labels).inc();
    }

    /// Decrement active connections.
    pub fn connection_closed(&self, transport: Transport) {
        let labels = ConnectionLabels { transport };
        self.inner.active_connections.get_or_create(&labels).dec();
    }

    /// Record how a serve call ended.
    pub fn record_shutdown(&self, reason: ShutdownReason) {
        let labels = ShutdownLabels { reason };
        self.inner.shutdowns_total.get_or_create(&labels).inc();
    }

    /// Record the duration of a completed drain.
    pub fn record_drain(&self, duration: Duration) {
        self.inner
            .drain_duration_seconds
            .observe(duration.as_secs_f64());
    }

    /// Start timing a request.
    pub fn start_request_timer(&self) -> RequestTimer {
        RequestTimer {
            collector: self.clone(),
            start: Instant::now(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Timer started when a request arrives.
pub struct RequestTimer {
    collector: MetricsCollector,
    start: Instant,
}

impl RequestTimer {
    /// Get the elapsed duration.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Record the request and consume the timer.
    pub fn record(self, method: &str, status: u16) {
        let duration = self.start.elapsed();
        self.collector.record_request(method, status, duration);
    }
}
