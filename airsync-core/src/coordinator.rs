//! Calibration fan-out
//!
//! Callers register interest in a set of peers and are notified either per
//! peer or once the whole set has calibrated. The coordinator also records
//! which peers are already calibrated so a waiter registered late fires
//! immediately, and it guarantees no waiter hangs: failed or disconnected
//! peers propagate, and every waiter carries an overall timeout.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::calibration::CalibrationError;
use crate::transport::PeerId;

/// Default overall timeout applied to a waiter.
pub const DEFAULT_WAITER_TIMEOUT: Duration = Duration::from_secs(10);

/// Notifications delivered to a waiter callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaiterEvent {
    /// One peer of the requested set finished (each mode).
    Calibrated(PeerId),
    /// Every requested peer finished (all mode, fired exactly once).
    AllCalibrated(Vec<PeerId>),
    /// A requested peer can no longer complete.
    Failed {
        peer: PeerId,
        error: CalibrationError,
    },
    /// The waiter's overall deadline elapsed with peers still pending.
    TimedOut { pending: Vec<PeerId> },
}

pub type WaiterCallback = Box<dyn FnMut(WaiterEvent) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaiterMode {
    All,
    Each,
}

struct Waiter {
    mode: WaiterMode,
    requested: Vec<PeerId>,
    pending: HashSet<PeerId>,
    // Callbacks run outside the table lock; the per-waiter mutex keeps a
    // single callback from being entered concurrently.
    callback: Arc<Mutex<WaiterCallback>>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    waiters: HashMap<u64, Waiter>,
    calibrated: HashSet<PeerId>,
    failed: HashMap<PeerId, CalibrationError>,
}

/// Shared waiter table. Cheap to clone; all clones observe the same state.
#[derive(Clone, Default)]
pub struct Coordinator {
    inner: Arc<Mutex<Inner>>,
}

type Firing = (Arc<Mutex<WaiterCallback>>, WaiterEvent);

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invoke `callback` exactly once when every peer in `peers` has
    /// calibrated. Fires immediately if they all already have. Returns a
    /// waiter id usable for diagnostics.
    pub fn on_all_calibrated(
        &self,
        peers: &[PeerId],
        timeout: Duration,
        callback: impl FnMut(WaiterEvent) + Send + 'static,
    ) -> u64 {
        self.register(WaiterMode::All, peers, timeout, Box::new(callback))
    }

    /// Invoke `callback` once per peer in `peers` as each one calibrates.
    /// Peers already calibrated fire immediately.
    pub fn on_each_calibrated(
        &self,
        peers: &[PeerId],
        timeout: Duration,
        callback: impl FnMut(WaiterEvent) + Send + 'static,
    ) -> u64 {
        self.register(WaiterMode::Each, peers, timeout, Box::new(callback))
    }

    fn register(
        &self,
        mode: WaiterMode,
        peers: &[PeerId],
        timeout: Duration,
        callback: WaiterCallback,
    ) -> u64 {
        let callback = Arc::new(Mutex::new(callback));
        let mut firings: Vec<Firing> = Vec::new();

        let (id, live) = {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;

            let mut pending: HashSet<PeerId> = peers.iter().cloned().collect();
            let mut dead = false;

            // Settle against what already happened so a late registration
            // never misses a notification.
            for peer in peers {
                if inner.calibrated.contains(peer) {
                    pending.remove(peer);
                    if mode == WaiterMode::Each {
                        firings.push((callback.clone(), WaiterEvent::Calibrated(peer.clone())));
                    }
                } else if let Some(error) = inner.failed.get(peer) {
                    pending.remove(peer);
                    firings.push((
                        callback.clone(),
                        WaiterEvent::Failed {
                            peer: peer.clone(),
                            error: error.clone(),
                        },
                    ));
                    if mode == WaiterMode::All {
                        dead = true;
                    }
                }
            }

            if mode == WaiterMode::All && !dead && pending.is_empty() {
                firings.push((
                    callback.clone(),
                    WaiterEvent::AllCalibrated(peers.to_vec()),
                ));
            }

            let live = !dead && !pending.is_empty();
            if live {
                inner.waiters.insert(
                    id,
                    Waiter {
                        mode,
                        requested: peers.to_vec(),
                        pending,
                        callback,
                    },
                );
            }
            (id, live)
        };

        run_firings(firings);

        if live {
            let coordinator = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                coordinator.expire(id);
            });
        }
        id
    }

    /// Record that `peer` finished calibrating and notify every waiter
    /// whose set contains it.
    pub fn peer_calibrated(&self, peer: &PeerId) {
        let firings = {
            let mut inner = self.inner.lock();
            inner.calibrated.insert(peer.clone());
            inner.failed.remove(peer);

            let mut firings: Vec<Firing> = Vec::new();
            let mut done = Vec::new();
            for (id, waiter) in inner.waiters.iter_mut() {
                if !waiter.pending.remove(peer) {
                    continue;
                }
                match waiter.mode {
                    WaiterMode::Each => {
                        firings.push((
                            waiter.callback.clone(),
                            WaiterEvent::Calibrated(peer.clone()),
                        ));
                        if waiter.pending.is_empty() {
                            done.push(*id);
                        }
                    }
                    WaiterMode::All => {
                        if waiter.pending.is_empty() {
                            firings.push((
                                waiter.callback.clone(),
                                WaiterEvent::AllCalibrated(waiter.requested.clone()),
                            ));
                            done.push(*id);
                        }
                    }
                }
            }
            for id in done {
                inner.waiters.remove(&id);
            }
            firings
        };

        tracing::debug!(%peer, "peer calibrated");
        run_firings(firings);
    }

    /// Record that `peer` cannot complete and fail affected waiters
    /// immediately rather than letting them ride out their timeout.
    pub fn peer_failed(&self, peer: &PeerId, error: CalibrationError) {
        let firings = {
            let mut inner = self.inner.lock();
            inner.failed.insert(peer.clone(), error.clone());
            inner.calibrated.remove(peer);

            let mut firings: Vec<Firing> = Vec::new();
            let mut done = Vec::new();
            for (id, waiter) in inner.waiters.iter_mut() {
                if !waiter.pending.remove(peer) {
                    continue;
                }
                firings.push((
                    waiter.callback.clone(),
                    WaiterEvent::Failed {
                        peer: peer.clone(),
                        error: error.clone(),
                    },
                ));
                match waiter.mode {
                    // An all waiter can never be satisfied once a member fails.
                    WaiterMode::All => done.push(*id),
                    WaiterMode::Each => {
                        if waiter.pending.is_empty() {
                            done.push(*id);
                        }
                    }
                }
            }
            for id in done {
                inner.waiters.remove(&id);
            }
            firings
        };

        tracing::warn!(%peer, %error, "peer calibration failed");
        run_firings(firings);
    }

    /// Disconnection purges the peer entirely.
    pub fn peer_disconnected(&self, peer: &PeerId) {
        self.peer_failed(peer, CalibrationError::Disconnected);
        let mut inner = self.inner.lock();
        inner.calibrated.remove(peer);
        inner.failed.remove(peer);
    }

    /// Forget prior calibration results for `peer` (recalibration start).
    pub fn reset_peer(&self, peer: &PeerId) {
        let mut inner = self.inner.lock();
        inner.calibrated.remove(peer);
        inner.failed.remove(peer);
    }

    /// Peers currently known calibrated.
    pub fn calibrated_peers(&self) -> Vec<PeerId> {
        let inner = self.inner.lock();
        inner.calibrated.iter().cloned().collect()
    }

    pub fn is_calibrated(&self, peer: &PeerId) -> bool {
        self.inner.lock().calibrated.contains(peer)
    }

    fn expire(&self, id: u64) {
        let firing = {
            let mut inner = self.inner.lock();
            inner.waiters.remove(&id).map(|waiter| {
                let mut pending: Vec<PeerId> = waiter.pending.into_iter().collect();
                pending.sort();
                (waiter.callback, WaiterEvent::TimedOut { pending })
            })
        };
        if let Some((callback, event)) = firing {
            tracing::warn!(waiter = id, "calibration waiter timed out");
            run_firings(vec![(callback, event)]);
        }
    }
}

fn run_firings(firings: Vec<Firing>) {
    for (callback, event) in firings {
        let mut callback = callback.lock();
        (*callback)(event);
    }
}
