//! Transport port
//!
//! The engine does not implement networking. The embedding application
//! supplies a [`Transport`] for outbound frames and feeds inbound frames
//! and peer state changes into the engine as [`TransportEvent`]s. The
//! engine only ever holds peer identities, never connection lifecycles.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

/// Stable, comparable identity of a connected device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Connection state reported by the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connected,
    Disconnected,
}

/// Inbound notifications from the transport layer.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A frame arrived. The engine's first action is always codec decode.
    Packet { from: PeerId, bytes: Vec<u8> },
    /// A peer connected or went away.
    PeerState { peer: PeerId, state: PeerState },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("send failed: {0}")]
    Send(String),
}

/// Outbound side of the transport. Best-effort; no delivery guarantee is
/// assumed by the engine.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, bytes: &[u8], to: &[PeerId]) -> Result<(), TransportError>;
}

/// In-process transport wiring engines together directly, with an optional
/// fixed one-way delay per frame. Used by the test suite and by demos; not
/// a real network.
pub mod memory {
    use super::*;

    struct HubInner {
        endpoints: HashMap<PeerId, mpsc::UnboundedSender<TransportEvent>>,
        delay: Duration,
    }

    /// Routes frames between attached endpoints.
    #[derive(Clone)]
    pub struct MemoryHub {
        inner: Arc<Mutex<HubInner>>,
    }

    impl MemoryHub {
        pub fn new(delay: Duration) -> Self {
            Self {
                inner: Arc::new(Mutex::new(HubInner {
                    endpoints: HashMap::new(),
                    delay,
                })),
            }
        }

        /// Attach an endpoint. Returns its outbound transport and the event
        /// stream to feed into an engine. Existing endpoints are told the
        /// newcomer connected, and vice versa.
        pub fn attach(
            &self,
            peer: PeerId,
        ) -> (MemoryTransport, mpsc::UnboundedReceiver<TransportEvent>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let mut inner = self.inner.lock();

            for (other, sender) in &inner.endpoints {
                let _ = sender.send(TransportEvent::PeerState {
                    peer: peer.clone(),
                    state: PeerState::Connected,
                });
                let _ = tx.send(TransportEvent::PeerState {
                    peer: other.clone(),
                    state: PeerState::Connected,
                });
            }
            inner.endpoints.insert(peer.clone(), tx);

            (
                MemoryTransport {
                    local: peer,
                    inner: self.inner.clone(),
                },
                rx,
            )
        }

        /// Detach an endpoint and notify everyone else.
        pub fn disconnect(&self, peer: &PeerId) {
            let mut inner = self.inner.lock();
            inner.endpoints.remove(peer);
            for sender in inner.endpoints.values() {
                let _ = sender.send(TransportEvent::PeerState {
                    peer: peer.clone(),
                    state: PeerState::Disconnected,
                });
            }
        }
    }

    /// Outbound half handed to one engine.
    pub struct MemoryTransport {
        local: PeerId,
        inner: Arc<Mutex<HubInner>>,
    }

    impl Transport for MemoryTransport {
        fn send(&self, bytes: &[u8], to: &[PeerId]) -> Result<(), TransportError> {
            let (targets, delay) = {
                let inner = self.inner.lock();
                let targets: Vec<_> = to
                    .iter()
                    .filter_map(|p| inner.endpoints.get(p).map(|tx| tx.clone()))
                    .collect();
                (targets, inner.delay)
            };

            let from = self.local.clone();
            let frame = bytes.to_vec();
            for tx in targets {
                let event = TransportEvent::Packet {
                    from: from.clone(),
                    bytes: frame.clone(),
                };
                if delay.is_zero() {
                    let _ = tx.send(event);
                } else {
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(event);
                    });
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryHub;
    use super::*;

    #[tokio::test]
    async fn test_hub_routes_frames() {
        let hub = MemoryHub::new(Duration::ZERO);
        let (a_tx, _a_rx) = hub.attach(PeerId::from("a"));
        let (_b_tx, mut b_rx) = hub.attach(PeerId::from("b"));

        // b learned about a at attach time.
        match b_rx.recv().await.expect("event") {
            TransportEvent::PeerState { peer, state } => {
                assert_eq!(peer, PeerId::from("a"));
                assert_eq!(state, PeerState::Connected);
            }
            other => panic!("unexpected event {:?}", other),
        }

        a_tx.send(b"hello", &[PeerId::from("b")]).unwrap();
        match b_rx.recv().await.expect("event") {
            TransportEvent::Packet { from, bytes } => {
                assert_eq!(from, PeerId::from("a"));
                assert_eq!(bytes, b"hello");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hub_reports_disconnect() {
        let hub = MemoryHub::new(Duration::ZERO);
        let (_a_tx, mut a_rx) = hub.attach(PeerId::from("a"));
        let (_b_tx, _b_rx) = hub.attach(PeerId::from("b"));

        // Drain the connect notification.
        let _ = a_rx.recv().await;

        hub.disconnect(&PeerId::from("b"));
        match a_rx.recv().await.expect("event") {
            TransportEvent::PeerState { peer, state } => {
                assert_eq!(peer, PeerId::from("b"));
                assert_eq!(state, PeerState::Disconnected);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_is_best_effort() {
        let hub = MemoryHub::new(Duration::ZERO);
        let (a_tx, _a_rx) = hub.attach(PeerId::from("a"));
        assert!(a_tx.send(b"x", &[PeerId::from("ghost")]).is_ok());
    }
}
