//! Signal watcher.
//!
//! Waits once for a process termination signal (from the OS or injected
//! through a [`ShutdownHandle`](crate::util::ShutdownHandle)), closes the
//! listener, then publishes the matching [`Stop`] to the coordinator.

use crate::server::listener::CloseHandle;
use std::fmt;
use std::io;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// Process signals the watcher reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGINT / Ctrl+C.
    Interrupt,
    /// SIGQUIT.
    Quit,
    /// SIGTERM.
    Terminate,
    /// SIGKILL. The OS never delivers it to the process on Unix, so this is
    /// only observed when injected.
    Kill,
    /// SIGUSR2, reserved for live binary reload.
    Reload,
}

impl Signal {
    /// Conventional signal name.
    pub fn name(&self) -> &'static str {
        match self {
            Signal::Interrupt => "SIGINT",
            Signal::Quit => "SIGQUIT",
            Signal::Terminate => "SIGTERM",
            Signal::Kill => "SIGKILL",
            Signal::Reload => "SIGUSR2",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What the coordinator must do after the listener was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    /// Drain in-flight connections, then stop.
    Graceful(Signal),
    /// Stop immediately without draining.
    Forced(Signal),
    /// A reserved signal arrived whose behaviour is not implemented.
    Unsupported(Signal),
}

impl From<Signal> for Stop {
    fn from(signal: Signal) -> Self {
        match signal {
            Signal::Interrupt | Signal::Quit | Signal::Terminate => Stop::Graceful(signal),
            Signal::Kill => Stop::Forced(signal),
            Signal::Reload => Stop::Unsupported(signal),
        }
    }
}

/// OS signal streams, installed before serving starts so nothing is missed
/// between startup and the watcher's first poll.
pub struct OsSignals {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    quit: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
    #[cfg(unix)]
    reload: tokio::signal::unix::Signal,
}

impl OsSignals {
    /// Install handlers for SIGINT, SIGQUIT, SIGTERM and SIGUSR2.
    #[cfg(unix)]
    pub fn install() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            quit: signal(SignalKind::quit())?,
            terminate: signal(SignalKind::terminate())?,
            reload: signal(SignalKind::user_defined2())?,
        })
    }

    /// Only Ctrl+C is observable off Unix.
    #[cfg(not(unix))]
    pub fn install() -> io::Result<Self> {
        Ok(Self {})
    }

    /// Wait for the next signal.
    #[cfg(unix)]
    pub async fn recv(&mut self) -> Signal {
        tokio::select! {
            _ = self.interrupt.recv() => Signal::Interrupt,
            _ = self.quit.recv() => Signal::Quit,
            _ = self.terminate.recv() => Signal::Terminate,
            _ = self.reload.recv() => Signal::Reload,
        }
    }

    #[cfg(not(unix))]
    pub async fn recv(&mut self) -> Signal {
        match tokio::signal::ctrl_c().await {
            Ok(()) => Signal::Interrupt,
            Err(e) => {
                error!(error = %e, "failed to listen for Ctrl+C");
                std::future::pending().await
            }
        }
    }
}

/// Wait for exactly one signal, close the listener, and publish the stop.
///
/// Returns the signal that was acted on, or `None` if every signal source
/// went away first.
pub async fn watch_signals(
    close: CloseHandle,
    mut os: Option<OsSignals>,
    mut injected: watch::Receiver<Option<Signal>>,
    stop: oneshot::Sender<Stop>,
) -> Option<Signal> {
    let os_signal = async {
        match os.as_mut() {
            Some(signals) => signals.recv().await,
            None => std::future::pending().await,
        }
    };

    let signal = tokio::select! {
        signal = os_signal => signal,
        signal = recv_injected(&mut injected) => signal?,
    };

    let action = Stop::from(signal);
    match action {
        Stop::Graceful(_) => info!(signal = signal.name(), "received signal, stopping gracefully"),
        Stop::Forced(_) => warn!(signal = signal.name(), "received signal, stopping immediately"),
        Stop::Unsupported(_) => {
            error!(signal = signal.name(), "live binary reload is not implemented, stopping")
        }
    }

    // The listener must be closed before the stop is published so no new
    // connection can be accepted after the decision.
    if !close.close() {
        debug!("listener was already closed");
    }

    if stop.send(action).is_err() {
        debug!("coordinator gone before stop was published");
    }

    Some(signal)
}

/// First injected signal, or `None` once the sending side is gone.
async fn recv_injected(injected: &mut watch::Receiver<Option<Signal>>) -> Option<Signal> {
    match injected.wait_for(Option::is_some).await {
        Ok(latched) => *latched,
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::ShutdownHandle;
    use std::time::Duration;

    #[test]
    fn test_signal_actions() {
        assert_eq!(Stop::from(Signal::Interrupt), Stop::Graceful(Signal::Interrupt));
        assert_eq!(Stop::from(Signal::Quit), Stop::Graceful(Signal::Quit));
        assert_eq!(Stop::from(Signal::Terminate), Stop::Graceful(Signal::Terminate));
        assert_eq!(Stop::from(Signal::Kill), Stop::Forced(Signal::Kill));
        assert_eq!(Stop::from(Signal::Reload), Stop::Unsupported(Signal::Reload));
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(Signal::Interrupt.to_string(), "SIGINT");
        assert_eq!(Signal::Reload.name(), "SIGUSR2");
    }

    #[tokio::test]
    async fn test_injected_signal_closes_then_publishes() {
        let close = CloseHandle::default();
        let handle = ShutdownHandle::new();
        let rx = handle.subscribe();
        let (stop_tx, stop_rx) = oneshot::channel();

        let watcher = tokio::spawn(watch_signals(close.clone(), None, rx, stop_tx));
        assert!(handle.send(Signal::Terminate));

        let stop = stop_rx.await.unwrap();
        assert_eq!(stop, Stop::Graceful(Signal::Terminate));
        assert!(close.is_closed());
        assert_eq!(watcher.await.unwrap(), Some(Signal::Terminate));
    }

    #[tokio::test]
    async fn test_watcher_acts_on_first_signal() {
        let close = CloseHandle::default();
        let handle = ShutdownHandle::new();
        let rx = handle.subscribe();
        let (stop_tx, stop_rx) = oneshot::channel();

        // Both arrive before the watcher is polled.
        handle.send(Signal::Interrupt);
        handle.send(Signal::Kill);

        let acted = watch_signals(close, None, rx, stop_tx).await;
        assert_eq!(acted, Some(Signal::Interrupt));
        assert_eq!(stop_rx.await.unwrap(), Stop::Graceful(Signal::Interrupt));
    }

    #[tokio::test]
    async fn test_reload_is_unsupported() {
        let close = CloseHandle::default();
        let handle = ShutdownHandle::new();
        let rx = handle.subscribe();
        let (stop_tx, stop_rx) = oneshot::channel();

        handle.send(Signal::Reload);
        watch_signals(close.clone(), None, rx, stop_tx).await;

        assert_eq!(stop_rx.await.unwrap(), Stop::Unsupported(Signal::Reload));
        assert!(close.is_closed());
    }

    #[tokio::test]
    async fn test_no_sources_left() {
        let close = CloseHandle::default();
        let handle = ShutdownHandle::new();
        let rx = handle.subscribe();
        let (stop_tx, _stop_rx) = oneshot::channel();
        drop(handle);

        let acted = tokio::time::timeout(
            Duration::from_secs(1),
            watch_signals(close.clone(), None, rx, stop_tx),
        )
        .await
        .unwrap();
        assert_eq!(acted, None);
        assert!(!close.is_closed());
    }
}
