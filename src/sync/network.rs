//! Connectivity observation
//!
//! The platform (or a [`ConnectivityProbe`]) reports reachability through
//! [`NetworkObserver::set_connected`]; subscribers receive only actual
//! transitions. Delivery is latest-value: a subscriber that falls behind
//! sees the current state, not every intermediate flap.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::retry::CancelToken;

/// Something that can tell whether the remote is reachable right now
#[async_trait::async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn check(&self) -> bool;
}

/// Reachability probe that opens a TCP connection to `addr`
pub struct TcpProbe {
    addr: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }
}

#[async_trait::async_trait]
impl ConnectivityProbe for TcpProbe {
    async fn check(&self) -> bool {
        matches!(
            tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect(&self.addr)).await,
            Ok(Ok(_))
        )
    }
}

pub struct NetworkObserver {
    tx: watch::Sender<bool>,
}

impl NetworkObserver {
    pub fn new(initially_connected: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_connected);
        Self { tx }
    }

    pub fn is_connected_now(&self) -> bool {
        *self.tx.borrow()
    }

    /// Report the current reachability; returns true on a transition
    pub fn set_connected(&self, connected: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == connected {
                false
            } else {
                *current = connected;
                true
            }
        });
        if changed {
            tracing::info!(
                "Connectivity changed: {}",
                if connected { "online" } else { "offline" }
            );
        }
        changed
    }

    /// Stream of `connectivityChanged` events
    pub fn subscribe(&self) -> ConnectivityEvents {
        ConnectivityEvents {
            rx: self.tx.subscribe(),
        }
    }

    /// Poll `probe` every `interval` until `cancel` fires
    pub fn spawn_probe(
        self: &Arc<Self>,
        probe: Arc<dyn ConnectivityProbe>,
        interval: Duration,
        cancel: CancelToken,
    ) -> JoinHandle<()> {
        let observer = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let connected = probe.check().await;
                        observer.set_connected(connected);
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            tracing::debug!("Connectivity probe stopped");
        })
    }
}

/// Receiver side of the connectivity event stream
pub struct ConnectivityEvents {
    rx: watch::Receiver<bool>,
}

impl ConnectivityEvents {
    /// Wait for the next transition; `None` once the observer is gone
    pub async fn changed(&mut self) -> Option<bool> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }

    /// Treat the current state as seen, discarding a pending transition
    pub fn mark_seen(&mut self) {
        self.rx.borrow_and_update();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlagProbe(AtomicBool);

    #[async_trait::async_trait]
    impl ConnectivityProbe for FlagProbe {
        async fn check(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_only_transitions_count() {
        let observer = NetworkObserver::new(false);
        assert!(!observer.is_connected_now());
        assert!(!observer.set_connected(false));
        assert!(observer.set_connected(true));
        assert!(observer.is_connected_now());
        assert!(!observer.set_connected(true));
    }

    #[tokio::test]
    async fn test_subscriber_sees_transition() {
        let observer = NetworkObserver::new(false);
        let mut events = observer.subscribe();

        observer.set_connected(true);
        assert_eq!(events.changed().await, Some(true));

        observer.set_connected(false);
        assert_eq!(events.changed().await, Some(false));
    }

    #[tokio::test]
    async fn test_mark_seen_discards_pending_transition() {
        let observer = NetworkObserver::new(true);
        let mut events = observer.subscribe();

        observer.set_connected(false);
        observer.set_connected(true);
        events.mark_seen();

        let next = tokio::time::timeout(Duration::from_millis(50), events.changed()).await;
        assert!(next.is_err());

        observer.set_connected(false);
        assert_eq!(events.changed().await, Some(false));
    }

    #[tokio::test]
    async fn test_probe_feeds_observer() {
        let observer = Arc::new(NetworkObserver::new(false));
        let probe = Arc::new(FlagProbe(AtomicBool::new(true)));
        let cancel = CancelToken::new();
        let mut events = observer.subscribe();

        let handle = observer.spawn_probe(probe.clone(), Duration::from_millis(5), cancel.clone());
        let value = tokio::time::timeout(Duration::from_secs(1), events.changed())
            .await
            .unwrap();
        assert_eq!(value, Some(true));

        probe.0.store(false, Ordering::SeqCst);
        let value = tokio::time::timeout(Duration::from_secs(1), events.changed())
            .await
            .unwrap();
        assert_eq!(value, Some(false));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_probe() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let probe = TcpProbe::new(addr.clone(), Duration::from_millis(500));
        assert!(probe.check().await);

        drop(listener);
        let probe = TcpProbe::new(addr, Duration::from_millis(500));
        assert!(!probe.check().await);
    }
}
