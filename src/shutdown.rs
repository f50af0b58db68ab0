//! Process-wide shutdown signal.
//!
//! The acceptor stops taking connections and dial retry loops give up when the
//! signal fires. Relay sessions that are already running do not observe it.

use tokio::sync::watch;

/// Owner side of the shutdown signal.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Fires the signal. Later calls have no effect.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Returns a receiver for the signal.
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver side of the shutdown signal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    /// Returns true once the signal has fired.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Waits until the signal fires.
    ///
    /// If the owning [`Shutdown`] is dropped without firing, this waits forever.
    pub async fn recv(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|fired| *fired).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_recv_completes_after_trigger() {
        let shutdown = Shutdown::new();
        let signal = shutdown.signal();
        assert!(!signal.is_triggered());

        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move { signal.recv().await }
        });

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("recv did not complete")
            .unwrap();
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn test_signal_created_after_trigger_is_already_fired() {
        let shutdown = Shutdown::new();
        shutdown.trigger();

        let signal = shutdown.signal();
        assert!(signal.is_triggered());
        tokio::time::timeout(Duration::from_millis(100), signal.recv())
            .await
            .expect("recv should return immediately");
    }

    #[tokio::test]
    async fn test_never_does_not_fire() {
        let signal = ShutdownSignal::never();
        assert!(!signal.is_triggered());
        let result = tokio::time::timeout(Duration::from_millis(50), signal.recv()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_dropped_owner_does_not_fire() {
        let shutdown = Shutdown::new();
        let signal = shutdown.signal();
        drop(shutdown);

        let result = tokio::time::timeout(Duration::from_millis(50), signal.recv()).await;
        assert!(result.is_err());
    }
}
