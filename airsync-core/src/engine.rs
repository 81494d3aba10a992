//! Synchronized playback engine
//!
//! One engine instance per process. It owns the synchronized clock, the
//! per-peer calibration table, the scheduler and the fan-out coordinator,
//! consumes transport events, and fans playback commands out to peers so
//! every device executes them at the same synchronized instant.
//!
//! The engine runs as a background task; [`SyncEngine::start`] returns a
//! cloneable [`SyncHandle`] for commands and an event stream the embedding
//! application listens on. Play/pause events are emitted *at* their target
//! instant, so the listener just acts on them immediately.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::calibration::{
    CalibrationConfig, CalibrationError, CalibrationPhase, CalibrationSample, PeerCalibration,
};
use crate::clock::{SyncClock, SyncInstant};
use crate::coordinator::{Coordinator, WaiterEvent, DEFAULT_WAITER_TIMEOUT};
use crate::packet::{Packet, SongMetadata};
use crate::scheduler::Scheduler;
use crate::transport::{PeerId, PeerState, Transport, TransportEvent};

/// How far in the future dispatched commands execute. Large enough to
/// cover typical transport latency to every peer.
pub const DEFAULT_LEAD_TIME: Duration = Duration::from_millis(300);

static TRACING_INIT: Once = Once::new();

/// Install the global tracing subscriber once. Safe to call repeatedly.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_target(false)
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("airsync_core=debug".parse().expect("valid directive")),
            )
            .with_writer(std::io::stderr)
            .init();
    });
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine task closed")]
    Closed,
}

/// Notifications delivered to the embedding application.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Start playback at `position_secs`. Emitted at the instant `at`.
    Play { position_secs: f64, at: SyncInstant },
    /// Pause playback. Emitted at the instant `at`.
    Pause { at: SyncInstant },
    /// Song metadata arrived ahead of the audio.
    MetadataReceived { from: PeerId, meta: SongMetadata },
    /// Raw song bytes arrived.
    SongReceived { from: PeerId, bytes: Vec<u8> },
    /// Our own calibration against the host finished.
    SelfCalibrated { offset_ns: i64, latency_ns: i64 },
    /// A peer reported its calibration against us finished.
    PeerCalibrated(PeerId),
    /// Calibration for a peer (or our own session) failed.
    CalibrationFailed {
        peer: PeerId,
        error: CalibrationError,
    },
    /// The transport reported a peer gone.
    PeerDisconnected(PeerId),
}

/// Snapshot of one peer's calibration record.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer: PeerId,
    pub phase: CalibrationPhase,
    pub offset_ns: i64,
    pub latency_ns: i64,
}

enum Command {
    RequestCalibration { peers: Vec<PeerId> },
    CalibrateWith { host: PeerId },
    Play { at: SyncInstant, position_secs: f64 },
    Pause { at: SyncInstant },
    SendMetadata { meta: SongMetadata, peers: Vec<PeerId> },
    SendSong { bytes: Vec<u8>, peers: Vec<PeerId> },
    Shutdown,
}

type Records = Arc<RwLock<HashMap<PeerId, PeerCalibration>>>;

/// Synchronized playback engine. Build one, then [`start`](Self::start) it.
pub struct SyncEngine {
    transport: Arc<dyn Transport>,
    clock: Arc<SyncClock>,
    config: CalibrationConfig,
    lead_time: Duration,
}

impl SyncEngine {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            clock: Arc::new(SyncClock::new()),
            config: CalibrationConfig::default(),
            lead_time: DEFAULT_LEAD_TIME,
        }
    }

    pub fn with_config(mut self, config: CalibrationConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the engine's clock. Tests use this to inject a known skew.
    pub fn with_clock(mut self, clock: Arc<SyncClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_lead_time(mut self, lead_time: Duration) -> Self {
        self.lead_time = lead_time;
        self
    }

    /// Spawn the engine task. `transport_rx` is the inbound event stream
    /// from the transport layer.
    pub fn start(
        self,
        transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> (SyncHandle, mpsc::UnboundedReceiver<EngineEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let records: Records = Arc::new(RwLock::new(HashMap::new()));
        let coordinator = Coordinator::new();
        let scheduler = Arc::new(Scheduler::new(self.clock.clone()));
        let is_calibrating = Arc::new(AtomicBool::new(false));

        let handle = SyncHandle {
            command_tx,
            clock: self.clock.clone(),
            scheduler: scheduler.clone(),
            coordinator: coordinator.clone(),
            records: records.clone(),
            is_calibrating: is_calibrating.clone(),
            lead_time: self.lead_time,
        };

        let task = EngineTask {
            transport: self.transport,
            clock: self.clock,
            config: self.config,
            scheduler,
            coordinator,
            records,
            is_calibrating,
            event_tx,
            session: None,
        };

        tokio::spawn(task.run(transport_rx, command_rx));

        (handle, event_rx)
    }
}

/// Cloneable handle to a running engine.
#[derive(Clone)]
pub struct SyncHandle {
    command_tx: mpsc::UnboundedSender<Command>,
    clock: Arc<SyncClock>,
    scheduler: Arc<Scheduler>,
    coordinator: Coordinator,
    records: Records,
    is_calibrating: Arc<AtomicBool>,
    lead_time: Duration,
}

impl SyncHandle {
    /// Current synchronized time.
    pub fn now(&self) -> SyncInstant {
        self.clock.now()
    }

    /// Calibrated offset to the host timeline, nanoseconds.
    pub fn offset_ns(&self) -> i64 {
        self.clock.offset_ns()
    }

    /// Whether a calibration session against a host is in flight.
    pub fn is_calibrating(&self) -> bool {
        self.is_calibrating.load(Ordering::Acquire)
    }

    /// Run `action` at the synchronized instant `at`.
    pub fn run_at<F>(&self, at: SyncInstant, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler.run_at(at, action);
    }

    /// Ask each named peer to calibrate against us. Their completions are
    /// reported through the coordinator and as engine events.
    pub fn request_calibration(&self, peers: &[PeerId]) -> Result<(), EngineError> {
        self.send(Command::RequestCalibration {
            peers: peers.to_vec(),
        })
    }

    /// Begin calibrating our clock against `host`.
    pub fn calibrate_with(&self, host: PeerId) -> Result<(), EngineError> {
        self.send(Command::CalibrateWith { host })
    }

    /// Dispatch a synchronized play: every calibrated peer and this device
    /// start playback of `position_secs` at the returned instant.
    pub fn synchronised_play(&self, position_secs: f64) -> Result<SyncInstant, EngineError> {
        let at = self.clock.now().plus(self.lead_time);
        self.send(Command::Play { at, position_secs })?;
        Ok(at)
    }

    /// Dispatch a synchronized pause, returning the chosen instant.
    pub fn synchronise_pause(&self) -> Result<SyncInstant, EngineError> {
        let at = self.clock.now().plus(self.lead_time);
        self.send(Command::Pause { at })?;
        Ok(at)
    }

    /// Send song metadata to the given peers ahead of the audio bytes.
    pub fn send_song_metadata(
        &self,
        meta: SongMetadata,
        peers: &[PeerId],
    ) -> Result<(), EngineError> {
        self.send(Command::SendMetadata {
            meta,
            peers: peers.to_vec(),
        })
    }

    /// Send raw song bytes to the given peers.
    pub fn send_song(&self, bytes: Vec<u8>, peers: &[PeerId]) -> Result<(), EngineError> {
        self.send(Command::SendSong {
            bytes,
            peers: peers.to_vec(),
        })
    }

    /// Invoke `callback` once every peer in `peers` has calibrated, with
    /// the default waiter timeout. See [`Coordinator::on_all_calibrated`].
    pub fn on_all_calibrated(
        &self,
        peers: &[PeerId],
        callback: impl FnMut(WaiterEvent) + Send + 'static,
    ) -> u64 {
        self.coordinator
            .on_all_calibrated(peers, DEFAULT_WAITER_TIMEOUT, callback)
    }

    /// Invoke `callback` per peer in `peers` as each calibrates, with the
    /// default waiter timeout. See [`Coordinator::on_each_calibrated`].
    pub fn on_each_calibrated(
        &self,
        peers: &[PeerId],
        callback: impl FnMut(WaiterEvent) + Send + 'static,
    ) -> u64 {
        self.coordinator
            .on_each_calibrated(peers, DEFAULT_WAITER_TIMEOUT, callback)
    }

    /// The coordinator, for registrations with custom timeouts.
    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Snapshot of every peer's calibration record.
    pub fn peer_records(&self) -> Vec<PeerRecord> {
        self.records
            .read()
            .iter()
            .map(|(peer, cal)| PeerRecord {
                peer: peer.clone(),
                phase: cal.phase(),
                offset_ns: cal.offset_ns(),
                latency_ns: cal.latency_ns(),
            })
            .collect()
    }

    /// Stop the engine task and drop all pending timers.
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(Command::Shutdown);
    }

    fn send(&self, command: Command) -> Result<(), EngineError> {
        self.command_tx.send(command).map_err(|_| EngineError::Closed)
    }
}

/// Reply channel into the in-flight self-calibration session.
struct Session {
    host: PeerId,
    reply_tx: mpsc::UnboundedSender<(i64, i64)>,
}

struct EngineTask {
    transport: Arc<dyn Transport>,
    clock: Arc<SyncClock>,
    config: CalibrationConfig,
    scheduler: Arc<Scheduler>,
    coordinator: Coordinator,
    records: Records,
    is_calibrating: Arc<AtomicBool>,
    event_tx: mpsc::UnboundedSender<EngineEvent>,
    session: Option<Session>,
}

impl EngineTask {
    async fn run(
        mut self,
        mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
        mut command_rx: mpsc::UnboundedReceiver<Command>,
    ) {
        info!("engine started");
        loop {
            tokio::select! {
                Some(event) = transport_rx.recv() => {
                    self.handle_transport_event(event);
                }
                Some(command) = command_rx.recv() => {
                    if !self.handle_command(command) {
                        break;
                    }
                }
                else => break,
            }
        }
        self.scheduler.shutdown();
        info!("engine stopped");
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Packet { from, bytes } => {
                let packet = match Packet::decode(&bytes) {
                    Ok(packet) => packet,
                    Err(error) => {
                        // Malformed input never tears down the connection.
                        warn!(%from, %error, "dropping undecodable packet");
                        return;
                    }
                };
                self.handle_packet(from, packet);
            }
            TransportEvent::PeerState { peer, state } => match state {
                PeerState::Connected => {
                    debug!(%peer, "peer connected");
                }
                PeerState::Disconnected => self.handle_disconnect(peer),
            },
        }
    }

    fn handle_packet(&mut self, from: PeerId, packet: Packet) {
        match packet {
            Packet::SyncStart => self.start_session(from),
            Packet::SyncRequest { t0 } => {
                // Stateless: always answer with our current synchronized
                // time, whatever else is in flight.
                let t1 = self.clock.now().as_nanos();
                let reply = Packet::SyncReply { t0, t1 }.encode();
                if self.transport.send(&reply, &[from.clone()]).is_err() {
                    debug!(%from, "sync reply send failed");
                }
            }
            Packet::SyncReply { t0, t1 } => {
                let stale = match &self.session {
                    Some(session) if session.host == from => {
                        session.reply_tx.send((t0, t1)).is_err()
                    }
                    _ => true,
                };
                if stale {
                    debug!(%from, "discarding sync reply with no live session");
                }
            }
            Packet::SyncDone {
                offset_ns,
                latency_ns,
            } => {
                info!(%from, offset_ns, latency_ns, "peer reported calibration complete");
                self.records
                    .write()
                    .entry(from.clone())
                    .or_default()
                    .complete_reported(offset_ns, latency_ns);
                self.coordinator.peer_calibrated(&from);
                let _ = self.event_tx.send(EngineEvent::PeerCalibrated(from));
            }
            Packet::Play { at, position_secs } => {
                let at = SyncInstant::from_nanos(at);
                debug!(%from, %at, position_secs, "play command received");
                let event_tx = self.event_tx.clone();
                self.scheduler.run_at(at, move || {
                    let _ = event_tx.send(EngineEvent::Play { position_secs, at });
                });
            }
            Packet::Pause { at } => {
                let at = SyncInstant::from_nanos(at);
                debug!(%from, %at, "pause command received");
                let event_tx = self.event_tx.clone();
                self.scheduler.run_at(at, move || {
                    let _ = event_tx.send(EngineEvent::Pause { at });
                });
            }
            Packet::Metadata(meta) => {
                let _ = self
                    .event_tx
                    .send(EngineEvent::MetadataReceived { from, meta });
            }
            Packet::Song(bytes) => {
                let _ = self.event_tx.send(EngineEvent::SongReceived { from, bytes });
            }
            Packet::Unknown { kind, action, .. } => {
                warn!(%from, kind, action, "ignoring unknown packet");
            }
        }
    }

    fn handle_disconnect(&mut self, peer: PeerId) {
        info!(%peer, "peer disconnected");
        self.records.write().remove(&peer);
        self.coordinator.peer_disconnected(&peer);

        // A vanished host ends our in-flight session; closing the reply
        // channel makes the session task bail out quietly.
        if self
            .session
            .as_ref()
            .map(|s| s.host == peer)
            .unwrap_or(false)
        {
            self.session = None;
            self.is_calibrating.store(false, Ordering::Release);
            let _ = self.event_tx.send(EngineEvent::CalibrationFailed {
                peer: peer.clone(),
                error: CalibrationError::Disconnected,
            });
        }

        let _ = self.event_tx.send(EngineEvent::PeerDisconnected(peer));
    }

    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::RequestCalibration { peers } => {
                for peer in &peers {
                    self.records
                        .write()
                        .insert(peer.clone(), PeerCalibration::new());
                    self.coordinator.reset_peer(peer);
                }
                info!(count = peers.len(), "asking peers to calibrate");
                let start = Packet::SyncStart.encode();
                if self.transport.send(&start, &peers).is_err() {
                    warn!("sync start send failed");
                }
            }
            Command::CalibrateWith { host } => self.start_session(host),
            Command::Play { at, position_secs } => {
                self.dispatch(Packet::Play {
                    at: at.as_nanos(),
                    position_secs,
                });
                let event_tx = self.event_tx.clone();
                self.scheduler.run_at(at, move || {
                    let _ = event_tx.send(EngineEvent::Play { position_secs, at });
                });
            }
            Command::Pause { at } => {
                self.dispatch(Packet::Pause { at: at.as_nanos() });
                let event_tx = self.event_tx.clone();
                self.scheduler.run_at(at, move || {
                    let _ = event_tx.send(EngineEvent::Pause { at });
                });
            }
            Command::SendMetadata { meta, peers } => {
                if self
                    .transport
                    .send(&Packet::Metadata(meta).encode(), &peers)
                    .is_err()
                {
                    warn!("metadata send failed");
                }
            }
            Command::SendSong { bytes, peers } => {
                debug!(bytes = bytes.len(), peers = peers.len(), "sending song");
                if self
                    .transport
                    .send(&Packet::Song(bytes).encode(), &peers)
                    .is_err()
                {
                    warn!("song send failed");
                }
            }
            Command::Shutdown => return false,
        }
        true
    }

    /// Fan a playback command out to every calibrated peer. Peers that
    /// never finished calibrating are excluded.
    fn dispatch(&self, packet: Packet) {
        let records = self.records.read();
        let mut targets = Vec::new();
        for (peer, cal) in records.iter() {
            if cal.is_calibrated() {
                targets.push(peer.clone());
            } else {
                warn!(%peer, "excluding uncalibrated peer from command");
            }
        }
        drop(records);

        if targets.is_empty() {
            debug!("no calibrated peers; command runs locally only");
            return;
        }
        if self.transport.send(&packet.encode(), &targets).is_err() {
            warn!("command send failed");
        }
    }

    /// Spawn a calibration session against `host`, replacing any session
    /// already in flight.
    fn start_session(&mut self, host: PeerId) {
        info!(%host, "starting calibration session");
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        self.session = Some(Session {
            host: host.clone(),
            reply_tx,
        });
        self.is_calibrating.store(true, Ordering::Release);

        tokio::spawn(run_session(
            host,
            self.transport.clone(),
            self.clock.clone(),
            self.config.clone(),
            self.is_calibrating.clone(),
            self.event_tx.clone(),
            reply_rx,
        ));
    }
}

/// Serial calibration rounds against `host`: round N+1 does not start
/// until round N's reply arrived or timed out.
async fn run_session(
    host: PeerId,
    transport: Arc<dyn Transport>,
    clock: Arc<SyncClock>,
    config: CalibrationConfig,
    is_calibrating: Arc<AtomicBool>,
    event_tx: mpsc::UnboundedSender<EngineEvent>,
    mut reply_rx: mpsc::UnboundedReceiver<(i64, i64)>,
) {
    let mut cal = PeerCalibration::new();
    let targets = [host.clone()];

    for _round in 0..config.rounds {
        let mut attempts = 0u32;
        let sample = loop {
            let t0 = clock.local_now_ns();
            let request = Packet::SyncRequest { t0 }.encode();
            if transport.send(&request, &targets).is_err() {
                debug!(%host, "sync request send failed");
            }

            match tokio::time::timeout(config.reply_timeout, wait_for_reply(&mut reply_rx, t0))
                .await
            {
                Ok(Some(t1)) => {
                    let t2 = clock.local_now_ns();
                    break Some(CalibrationSample::compute(t0, t1, t2));
                }
                // Channel closed: superseded or host disconnected. The
                // engine loop reports disconnects; end quietly here.
                Ok(None) => {
                    debug!(%host, "calibration session canceled");
                    return;
                }
                Err(_) => {
                    attempts += 1;
                    if attempts > config.retry_cap {
                        break None;
                    }
                    debug!(%host, attempts, "sync round timed out, retrying");
                }
            }
        };

        match sample {
            Some(sample) => cal.add_sample(sample),
            None => {
                warn!(%host, "calibration failed: retry cap exceeded");
                is_calibrating.store(false, Ordering::Release);
                let _ = event_tx.send(EngineEvent::CalibrationFailed {
                    peer: host,
                    error: CalibrationError::RetriesExceeded,
                });
                return;
            }
        }
    }

    let (offset_ns, latency_ns) = cal.finish();
    clock.set_offset_ns(offset_ns);
    is_calibrating.store(false, Ordering::Release);
    info!(%host, offset_ns, latency_ns, "calibration complete");

    let done = Packet::SyncDone {
        offset_ns,
        latency_ns,
    }
    .encode();
    if transport.send(&done, &targets).is_err() {
        warn!(%host, "sync done send failed");
    }
    let _ = event_tx.send(EngineEvent::SelfCalibrated {
        offset_ns,
        latency_ns,
    });
}

/// Wait for the reply echoing `t0`, discarding replies that belong to
/// timed-out attempts. Returns `None` when the session is canceled.
async fn wait_for_reply(rx: &mut mpsc::UnboundedReceiver<(i64, i64)>, t0: i64) -> Option<i64> {
    while let Some((echo, t1)) = rx.recv().await {
        if echo == t0 {
            return Some(t1);
        }
        debug!("discarding stale sync reply");
    }
    None
}
