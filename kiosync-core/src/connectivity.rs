//! Connectivity monitoring
//!
//! [`ConnectivityMonitor`] is the single source of truth for "should we
//! attempt network work right now". Platform notifications arrive through a
//! [`ConnectivityPort`] (or direct calls to [`ConnectivityMonitor::apply`]);
//! listeners are only woken when the state materially changes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Network class reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportType {
    None,
    Unknown,
    Wifi,
    Cellular,
    Ethernet,
    Other,
}

impl TransportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportType::None => "none",
            TransportType::Unknown => "unknown",
            TransportType::Wifi => "wifi",
            TransportType::Cellular => "cellular",
            TransportType::Ethernet => "ethernet",
            TransportType::Other => "other",
        }
    }
}

/// Snapshot of device connectivity. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkState {
    pub is_connected: bool,
    pub is_internet_reachable: bool,
    pub transport_type: TransportType,
}

impl NetworkState {
    pub fn disconnected() -> Self {
        Self {
            is_connected: false,
            is_internet_reachable: false,
            transport_type: TransportType::None,
        }
    }

    pub fn online(transport_type: TransportType) -> Self {
        Self {
            is_connected: true,
            is_internet_reachable: true,
            transport_type,
        }
    }

    pub fn is_online(&self) -> bool {
        self.is_connected && self.is_internet_reachable
    }
}

impl Default for NetworkState {
    fn default() -> Self {
        Self::disconnected()
    }
}

type Listener = Arc<dyn Fn(&NetworkState) + Send + Sync>;

struct MonitorInner {
    state: Mutex<NetworkState>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener_id: AtomicU64,
    wifi_only: bool,
}

/// Tracks the last known network state and fans transitions out to
/// listeners. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<MonitorInner>,
}

impl ConnectivityMonitor {
    /// Create a monitor. State starts disconnected until the first
    /// notification arrives.
    pub fn new(wifi_only: bool) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                state: Mutex::new(NetworkState::disconnected()),
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
                wifi_only,
            }),
        }
    }

    /// Last known state
    pub fn get_current_state(&self) -> NetworkState {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Connected and internet reachable
    pub fn is_online(&self) -> bool {
        self.get_current_state().is_online()
    }

    /// Online, and on an allowed network class. With `wifi_only` set,
    /// cellular connections are not eligible.
    pub fn is_sync_eligible(&self) -> bool {
        let state = self.get_current_state();
        state.is_online() && !(self.inner.wifi_only && state.transport_type == TransportType::Cellular)
    }

    /// Record a platform notification. Listeners run only if connectivity,
    /// reachability or transport changed. Returns whether it changed.
    pub fn apply(&self, next: NetworkState) -> bool {
        let previous = {
            let mut state = self
                .inner
                .state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if *state == next {
                return false;
            }
            std::mem::replace(&mut *state, next)
        };

        tracing::info!(
            was_online = previous.is_online(),
            online = next.is_online(),
            transport = next.transport_type.as_str(),
            "Network state changed"
        );

        // Call listeners without holding the lock so they may register or
        // unsubscribe others.
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(&next);
        }
        true
    }

    /// Register a callback for state transitions.
    pub fn add_listener<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&NetworkState) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, Arc::new(listener)));
        ListenerHandle {
            id,
            monitor: Arc::downgrade(&self.inner),
        }
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Pump notifications from `port` into this monitor until the port closes.
    pub fn attach<P: ConnectivityPort>(&self, mut port: P) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            while let Some(state) = port.next_state().await {
                monitor.apply(state);
            }
            tracing::debug!("Connectivity port closed");
        })
    }
}

/// Returned by [`ConnectivityMonitor::add_listener`].
pub struct ListenerHandle {
    id: u64,
    monitor: Weak<MonitorInner>,
}

impl ListenerHandle {
    /// Remove the listener. No-op if the monitor is gone.
    pub fn unsubscribe(self) {
        if let Some(inner) = self.monitor.upgrade() {
            inner
                .listeners
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .retain(|(id, _)| *id != self.id);
        }
    }
}

/// Source of platform network notifications
#[async_trait]
pub trait ConnectivityPort: Send + 'static {
    /// Wait for the next notification; `None` once the source is closed.
    async fn next_state(&mut self) -> Option<NetworkState>;
}

/// Platform bridges can push states through a channel.
#[async_trait]
impl ConnectivityPort for mpsc::Receiver<NetworkState> {
    async fn next_state(&mut self) -> Option<NetworkState> {
        self.recv().await
    }
}

/// Reachability probe: opens a TCP connection to a known host on an
/// interval. Cannot see the link type, so reports `Unknown` transport.
pub struct TcpProbe {
    host: String,
    interval: Duration,
    timeout: Duration,
    probed_once: bool,
}

impl TcpProbe {
    pub fn new(host: impl Into<String>, interval: Duration, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            interval,
            timeout,
            probed_once: false,
        }
    }

    pub fn from_config(config: &crate::config::ConnectivityConfig) -> Self {
        Self::new(
            config.probe_host.clone(),
            Duration::from_secs(config.probe_interval_secs),
            Duration::from_millis(config.probe_timeout_ms),
        )
    }

    /// Probe once
    pub async fn probe(&self) -> NetworkState {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.host)).await {
            Ok(Ok(_)) => NetworkState::online(TransportType::Unknown),
            Ok(Err(e)) => {
                tracing::debug!(host = %self.host, error = %e, "Connectivity probe failed");
                NetworkState::disconnected()
            }
            Err(_) => {
                tracing::debug!(host = %self.host, "Connectivity probe timed out");
                NetworkState::disconnected()
            }
        }
    }
}

#[async_trait]
impl ConnectivityPort for TcpProbe {
    async fn next_state(&mut self) -> Option<NetworkState> {
        if self.probed_once {
            tokio::time::sleep(self.interval).await;
        }
        self.probed_once = true;
        Some(self.probe().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_defaults_to_disconnected() {
        let monitor = ConnectivityMonitor::new(false);
        assert_eq!(monitor.get_current_state(), NetworkState::disconnected());
        assert!(!monitor.is_online());
        assert!(!monitor.is_sync_eligible());
    }

    #[test]
    fn test_online_requires_reachability() {
        let monitor = ConnectivityMonitor::new(false);
        monitor.apply(NetworkState {
            is_connected: true,
            is_internet_reachable: false,
            transport_type: TransportType::Wifi,
        });
        assert!(!monitor.is_online());

        monitor.apply(NetworkState::online(TransportType::Wifi));
        assert!(monitor.is_online());
        assert!(monitor.is_sync_eligible());
    }

    #[test]
    fn test_listeners_only_fire_on_change() {
        let monitor = ConnectivityMonitor::new(false);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let _handle = monitor.add_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(monitor.apply(NetworkState::online(TransportType::Wifi)));
        assert!(!monitor.apply(NetworkState::online(TransportType::Wifi)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Transport change alone is a material change
        assert!(monitor.apply(NetworkState::online(TransportType::Cellular)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe() {
        let monitor = ConnectivityMonitor::new(false);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handle = monitor.add_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(monitor.listener_count(), 1);

        handle.unsubscribe();
        assert_eq!(monitor.listener_count(), 0);
        monitor.apply(NetworkState::online(TransportType::Ethernet));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_wifi_only_excludes_cellular() {
        let monitor = ConnectivityMonitor::new(true);
        monitor.apply(NetworkState::online(TransportType::Cellular));
        assert!(monitor.is_online());
        assert!(!monitor.is_sync_eligible());

        monitor.apply(NetworkState::online(TransportType::Wifi));
        assert!(monitor.is_sync_eligible());
    }

    #[tokio::test]
    async fn test_attach_pumps_port() {
        let monitor = ConnectivityMonitor::new(false);
        let (tx, rx) = mpsc::channel(4);
        let task = monitor.attach(rx);

        tx.send(NetworkState::online(TransportType::Wifi)).await.unwrap();
        drop(tx);
        task.await.unwrap();

        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn test_probe_unreachable_host() {
        // Port 1 on localhost is not expected to accept connections
        let probe = TcpProbe::new(
            "127.0.0.1:1",
            Duration::from_secs(1),
            Duration::from_millis(500),
        );
        assert!(!probe.probe().await.is_online());
    }
}
