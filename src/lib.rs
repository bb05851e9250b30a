//! graceful-http - an HTTP server that shuts down gracefully
//!
//! This crate provides a single-listener HTTP server with:
//! - Plain or TLS listeners (HTTP/1.1, optional HTTP/2)
//! - In-flight connection tracking
//! - Signal-driven shutdown: drain on SIGINT/SIGTERM/SIGQUIT, stop at once on kill
//! - Optional bounded drain
//! - Prometheus metrics

pub mod app;
pub mod config;
pub mod handler;
pub mod metrics;
pub mod server;
pub mod util;

pub use config::Config;
pub use handler::Handler;
pub use server::{listen_and_serve, listen_and_serve_tls, GracefulServer, ServeError, StopReason};
