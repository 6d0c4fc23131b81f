//! Network-path reachability.
//!
//! A background monitor periodically asks a [`PathProbe`] whether the host
//! currently has a usable route, and publishes the answer through a
//! [`watch`] channel so any number of consumers can react without polling.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::watch;

/// Whether a usable network path exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathStatus {
    /// No check has completed yet.
    Unknown,
    /// A route to the reference address exists.
    Satisfied,
    /// The OS reports no route.
    Unsatisfied,
}

/// The kind of interface carrying the current path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterfaceKind {
    /// No interface (path unsatisfied or unknown).
    None,
    /// Loopback only.
    Loopback,
    /// Wired ethernet.
    Wired,
    /// Wi-Fi.
    Wifi,
    /// Cellular modem.
    Cellular,
    /// Some other routable interface.
    Other,
}

/// Snapshot of current connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reachability {
    /// Path status.
    pub status: PathStatus,
    /// Interface carrying the path.
    pub interface: InterfaceKind,
}

impl Reachability {
    /// The state before any probe has run.
    pub const UNKNOWN: Self = Self {
        status: PathStatus::Unknown,
        interface: InterfaceKind::None,
    };

    /// A path known to be down.
    pub const UNSATISFIED: Self = Self {
        status: PathStatus::Unsatisfied,
        interface: InterfaceKind::None,
    };

    /// Whether handshakes should be attempted. Unknown counts as reachable.
    pub fn is_reachable(&self) -> bool {
        self.status != PathStatus::Unsatisfied
    }
}

/// Observable reachability backed by a [`watch`] channel.
pub struct ReachabilityWatch {
    tx: watch::Sender<Reachability>,
}

impl Default for ReachabilityWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ReachabilityWatch {
    /// Create a new watch initialized to [`Reachability::UNKNOWN`].
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Reachability::UNKNOWN);
        Self { tx }
    }

    /// Publish a new value. Subscribers are only woken on actual changes.
    pub fn set(&self, value: Reachability) {
        self.tx.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        });
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<Reachability> {
        self.tx.subscribe()
    }

    /// Return the current value without blocking.
    pub fn current(&self) -> Reachability {
        *self.tx.borrow()
    }
}

/// Source of reachability answers for the path monitor.
pub trait PathProbe: Send + Sync + 'static {
    /// Check the current path.
    fn check(&self) -> impl Future<Output = Reachability> + Send;
}

/// Probe that asks the OS for a route to a reference address.
///
/// Connecting a UDP socket sends no packets; it only resolves a route and a
/// local address, which is enough to tell "no network" from "some network".
#[derive(Debug, Clone)]
pub struct UdpRouteProbe {
    target: SocketAddr,
}

impl UdpRouteProbe {
    /// Probe routes towards `target`.
    pub fn new(target: SocketAddr) -> Self {
        Self { target }
    }
}

impl PathProbe for UdpRouteProbe {
    fn check(&self) -> impl Future<Output = Reachability> + Send {
        let target = self.target;
        async move {
            let bind: SocketAddr = if target.is_ipv6() {
                (IpAddr::from([0u16; 8]), 0).into()
            } else {
                (IpAddr::from([0u8; 4]), 0).into()
            };
            let socket = match UdpSocket::bind(bind).await {
                Ok(s) => s,
                Err(_) => return Reachability::UNSATISFIED,
            };
            if socket.connect(target).await.is_err() {
                return Reachability::UNSATISFIED;
            }
            match socket.local_addr() {
                Ok(local) if local.ip().is_loopback() => Reachability {
                    status: PathStatus::Satisfied,
                    interface: InterfaceKind::Loopback,
                },
                Ok(_) => Reachability {
                    status: PathStatus::Satisfied,
                    interface: InterfaceKind::Other,
                },
                Err(_) => Reachability::UNSATISFIED,
            }
        }
    }
}

/// Run `probe` every `interval`, publishing results into `watch` until
/// `shutdown_rx` flips to `true`.
pub(crate) async fn monitor_loop<P: PathProbe>(
    probe: P,
    interval: Duration,
    watch: Arc<ReachabilityWatch>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let next = probe.check().await;
                let previous = watch.current();
                if previous != next {
                    tracing::info!(
                        "Network path changed: {:?}/{:?} -> {:?}/{:?}",
                        previous.status, previous.interface, next.status, next.interface
                    );
                }
                watch.set(next);
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Probe returning a scripted sequence, repeating the last value.
    struct ScriptedProbe {
        script: Mutex<Vec<Reachability>>,
    }

    impl PathProbe for ScriptedProbe {
        fn check(&self) -> impl Future<Output = Reachability> + Send {
            let mut script = self.script.lock().unwrap();
            let value = if script.len() > 1 {
                script.remove(0)
            } else {
                script[0]
            };
            async move { value }
        }
    }

    const WIRED: Reachability = Reachability {
        status: PathStatus::Satisfied,
        interface: InterfaceKind::Wired,
    };

    #[test]
    fn test_watch_starts_unknown() {
        let watch = ReachabilityWatch::new();
        assert_eq!(watch.current(), Reachability::UNKNOWN);
        assert!(watch.current().is_reachable());
    }

    #[test]
    fn test_unsatisfied_is_not_reachable() {
        assert!(!Reachability::UNSATISFIED.is_reachable());
    }

    #[tokio::test]
    async fn test_subscriber_sees_changes_only() {
        let watch = ReachabilityWatch::new();
        let mut rx = watch.subscribe();

        watch.set(WIRED);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), WIRED);

        watch.set(WIRED);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_publishes_path_changes() {
        let watch = Arc::new(ReachabilityWatch::new());
        let mut rx = watch.subscribe();
        let probe = ScriptedProbe {
            script: Mutex::new(vec![WIRED, Reachability::UNSATISFIED]),
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(monitor_loop(
            probe,
            Duration::from_secs(5),
            Arc::clone(&watch),
            shutdown_rx,
        ));

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), WIRED);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), Reachability::UNSATISFIED);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_udp_probe_loopback_target() {
        let probe = UdpRouteProbe::new("127.0.0.1:9".parse().unwrap());
        let result = probe.check().await;
        assert_eq!(result.status, PathStatus::Satisfied);
        assert_eq!(result.interface, InterfaceKind::Loopback);
    }
}
