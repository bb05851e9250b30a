//! Listener lifecycle: bind, optional TLS, and an out-of-band close.
//!
//! A tokio `TcpListener` cannot be closed from another task while an accept is
//! pending, so every `Listener` carries a [`CloseHandle`]. Closing the handle
//! makes any pending or future `accept` return [`AcceptError::Closed`], after
//! which the accept loop drops the socket and the port stops accepting.

use crate::server::error::ServeError;
use socket2::{Domain, Protocol, Socket, Type};
use std::fs::File;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

/// Default pending-connection queue length.
pub const DEFAULT_BACKLOG: i32 = 1024;

/// Error returned by [`Listener::accept`].
#[derive(Debug, Error)]
pub enum AcceptError {
    /// The listener's [`CloseHandle`] was closed. Expected during shutdown.
    #[error("listener closed")]
    Closed,

    #[error("accept failed: {0}")]
    Io(#[from] io::Error),
}

impl AcceptError {
    /// Whether this is the close produced by shutting the listener down on purpose.
    pub fn is_benign_close(&self) -> bool {
        matches!(self, AcceptError::Closed)
    }

    /// Whether the accept loop should back off and try again.
    ///
    /// Covers peers that gave up mid-handshake and running out of file
    /// descriptors (EMFILE/ENFILE).
    pub fn is_transient(&self) -> bool {
        match self {
            AcceptError::Closed => false,
            AcceptError::Io(e) => {
                matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::Interrupted
                        | io::ErrorKind::WouldBlock
                ) || matches!(e.raw_os_error(), Some(23) | Some(24))
            }
        }
    }
}

/// Shared close state of one listener.
#[derive(Debug, Clone, Default)]
pub struct CloseHandle {
    state: Arc<CloseState>,
}

#[derive(Debug, Default)]
struct CloseState {
    closed: AtomicBool,
    notify: Notify,
}

impl CloseHandle {
    /// Close the listener.
    ///
    /// Returns `false` if it was already closed; closing twice is harmless.
    pub fn close(&self) -> bool {
        let first = !self.state.closed.swap(true, Ordering::AcqRel);
        if first {
            self.state.notify.notify_waiters();
        }
        first
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Resolves once the listener is closed.
    pub async fn closed(&self) {
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closed() {
                return;
            }

            notified.await;
        }
    }
}

/// A bound TCP listener, optionally terminating TLS.
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    close: CloseHandle,
}

impl Listener {
    /// Bind a plain listener on `addr`.
    pub async fn bind(addr: SocketAddr) -> Result<Self, ServeError> {
        Self::bind_with_backlog(addr, DEFAULT_BACKLOG).await
    }

    /// Bind a plain listener with an explicit backlog.
    pub async fn bind_with_backlog(addr: SocketAddr, backlog: i32) -> Result<Self, ServeError> {
        let inner = bind_socket(addr, backlog).map_err(|source| ServeError::Listen { addr, source })?;
        let local_addr = inner
            .local_addr()
            .map_err(|source| ServeError::Listen { addr, source })?;

        info!(listen = %local_addr, tls = false, "listener bound");

        Ok(Self {
            inner,
            local_addr,
            tls: None,
            close: CloseHandle::default(),
        })
    }

    /// Bind a TLS listener on `addr`.
    ///
    /// The key pair is loaded before the socket is bound, so bad TLS material
    /// never leaves a port open.
    pub async fn bind_tls(
        addr: SocketAddr,
        cert: &Path,
        key: &Path,
        http2: bool,
    ) -> Result<Self, ServeError> {
        Self::bind_tls_with_backlog(addr, cert, key, http2, DEFAULT_BACKLOG).await
    }

    /// Bind a TLS listener with an explicit backlog.
    pub async fn bind_tls_with_backlog(
        addr: SocketAddr,
        cert: &Path,
        key: &Path,
        http2: bool,
        backlog: i32,
    ) -> Result<Self, ServeError> {
        let acceptor = load_tls_acceptor(cert, key, alpn_protocols(http2)).map_err(|reason| {
            ServeError::Certificate {
                cert: cert.to_path_buf(),
                key: key.to_path_buf(),
                reason,
            }
        })?;

        let mut listener = Self::bind_with_backlog(addr, backlog).await?;
        info!(listen = %listener.local_addr, http2, "TLS enabled on listener");
        listener.tls = Some(acceptor);
        Ok(listener)
    }

    /// Address the listener is actually bound to (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether accepted connections must complete a TLS handshake.
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// TLS acceptor for handshaking accepted streams, if any.
    pub fn tls_acceptor(&self) -> Option<TlsAcceptor> {
        self.tls.clone()
    }

    /// Handle that closes this listener from another task.
    pub fn close_handle(&self) -> CloseHandle {
        self.close.clone()
    }

    /// Accept the next connection, or fail with [`AcceptError::Closed`]
    /// once the close handle has been closed.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), AcceptError> {
        if self.close.is_closed() {
            return Err(AcceptError::Closed);
        }

        tokio::select! {
            biased;

            _ = self.close.closed() => {
                debug!(listen = %self.local_addr, "accept interrupted by listener close");
                Err(AcceptError::Closed)
            }

            result = self.inner.accept() => result.map_err(AcceptError::Io),
        }
    }
}

/// ALPN protocols advertised by TLS listeners.
pub fn alpn_protocols(http2: bool) -> Vec<Vec<u8>> {
    if http2 {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    } else {
        vec![b"http/1.1".to_vec()]
    }
}

fn bind_socket(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    TcpListener::from_std(socket.into())
}

/// Build a TLS acceptor from PEM files. Errors are returned as a reason string.
fn load_tls_acceptor(
    cert: &Path,
    key: &Path,
    alpn: Vec<Vec<u8>>,
) -> Result<TlsAcceptor, String> {
    let certs = load_certs(cert)?;
    let key = load_private_key(key)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| e.to_string())?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| format!("invalid key pair: {e}"))?;
    config.alpn_protocols = alpn;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, String> {
    let file = File::open(path).map_err(|e| format!("reading certificate: {e}"))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("parsing certificate: {e}"))?;

    if certs.is_empty() {
        return Err("no certificates found in PEM".to_string());
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, String> {
    let file = File::open(path).map_err(|e| format!("reading private key: {e}"))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| format!("parsing private key: {e}"))?
        .ok_or_else(|| "no private key found in PEM".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests")
            .join("fixtures")
            .join(name)
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert_ne!(listener.local_addr().port(), 0);
        assert!(!listener.is_tls());
    }

    #[tokio::test]
    async fn test_bind_address_in_use() {
        let first = Listener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let second = Listener::bind(first.local_addr()).await;
        assert!(matches!(second, Err(ServeError::Listen { .. })));
    }

    #[tokio::test]
    async fn test_accept_connection() {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr();

        let client = tokio::spawn(async move { TcpStream::connect(addr).await });
        let (_stream, peer) = listener.accept().await.unwrap();
        assert_eq!(peer.ip(), addr.ip());
        client.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_close_interrupts_pending_accept() {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let close = listener.close_handle();

        let pending = tokio::spawn(async move { listener.accept().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(close.close());

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("accept should return after close")
            .unwrap();
        let err = result.unwrap_err();
        assert!(err.is_benign_close());
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let close = listener.close_handle();
        assert!(close.close());
        assert!(!close.close());
        assert!(close.is_closed());
        assert!(listener.accept().await.unwrap_err().is_benign_close());
    }

    #[test]
    fn test_transient_errors() {
        let aborted = AcceptError::Io(io::Error::from(io::ErrorKind::ConnectionAborted));
        assert!(aborted.is_transient());
        assert!(!aborted.is_benign_close());

        let emfile = AcceptError::Io(io::Error::from_raw_os_error(24));
        assert!(emfile.is_transient());

        let other = AcceptError::Io(io::Error::other("bad"));
        assert!(!other.is_transient());
    }

    #[test]
    fn test_alpn_protocols() {
        assert_eq!(alpn_protocols(false), vec![b"http/1.1".to_vec()]);
        assert_eq!(alpn_protocols(true), vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }

    #[tokio::test]
    async fn test_bind_tls_with_fixture() {
        let listener = Listener::bind_tls(
            "127.0.0.1:0".parse().unwrap(),
            &fixture("cert.pem"),
            &fixture("key.pem"),
            true,
        )
        .await
        .unwrap();
        assert!(listener.is_tls());
        assert!(listener.tls_acceptor().is_some());
    }

    #[tokio::test]
    async fn test_bind_tls_missing_certificate() {
        let result = Listener::bind_tls(
            "127.0.0.1:0".parse().unwrap(),
            Path::new("/nonexistent/cert.pem"),
            &fixture("key.pem"),
            false,
        )
        .await;
        assert!(matches!(result, Err(ServeError::Certificate { .. })));
    }

    #[tokio::test]
    async fn test_bind_tls_garbage_key() {
        let mut key = NamedTempFile::new().unwrap();
        key.write_all(b"not a key").unwrap();

        let result = Listener::bind_tls(
            "127.0.0.1:0".parse().unwrap(),
            &fixture("cert.pem"),
            key.path(),
            false,
        )
        .await;
        match result {
            Err(ServeError::Certificate { reason, .. }) => {
                assert!(reason.contains("no private key"), "unexpected reason: {reason}");
            }
            other => panic!("expected certificate error, got {:?}", other.err()),
        }
    }
}
