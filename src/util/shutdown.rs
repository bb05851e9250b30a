//! Programmatic shutdown triggers.

use crate::server::Signal;
use tokio::sync::watch;

/// Delivers signals to a running server's signal watcher as if the OS had
/// sent them.
///
/// This is the only way to reach the forced stop on Unix, where SIGKILL
/// cannot be intercepted. The first signal is latched; later ones are
/// ignored, so a graceful request can't be overtaken by a kill sent right
/// after it.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    sender: watch::Sender<Option<Signal>>,
}

impl ShutdownHandle {
    /// Create a new handle with no subscribers.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self { sender }
    }

    /// Subscribe to the latched signal. A subscriber created after a signal
    /// was sent still observes it.
    pub fn subscribe(&self) -> watch::Receiver<Option<Signal>> {
        self.sender.subscribe()
    }

    /// Deliver `signal`.
    ///
    /// Returns `false` if no watcher is listening or a signal was already
    /// delivered.
    pub fn send(&self, signal: Signal) -> bool {
        if self.sender.is_closed() {
            return false;
        }

        self.sender.send_if_modified(|latched| {
            if latched.is_none() {
                *latched = Some(signal);
                true
            } else {
                false
            }
        })
    }

    /// The signal delivered so far, if any.
    pub fn latched(&self) -> Option<Signal> {
        *self.sender.borrow()
    }

    /// Request a graceful stop (as SIGTERM).
    pub fn graceful(&self) -> bool {
        self.send(Signal::Terminate)
    }

    /// Request a forced stop (as SIGKILL).
    pub fn force(&self) -> bool {
        self.send(Signal::Kill)
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_without_subscriber() {
        let handle = ShutdownHandle::new();
        assert!(!handle.graceful());
        assert_eq!(handle.latched(), None);
    }

    #[tokio::test]
    async fn test_subscriber_receives() {
        let handle = ShutdownHandle::new();
        let mut rx = handle.subscribe();

        assert!(handle.clone().force());
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Some(Signal::Kill));
    }

    #[test]
    fn test_first_signal_wins() {
        let handle = ShutdownHandle::new();
        let rx = handle.subscribe();

        assert!(handle.graceful());
        assert!(!handle.force());
        assert!(!handle.send(Signal::Reload));

        assert_eq!(handle.latched(), Some(Signal::Terminate));
        assert_eq!(*rx.borrow(), Some(Signal::Terminate));
    }
}
