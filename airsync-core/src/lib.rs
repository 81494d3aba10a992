//! Airsync - Core Library
//!
//! Drives synchronized playback commands across a set of peer devices:
//! calibrates each peer's clock against the host with NTP-style round
//! trips, exposes a synchronized timeline, and schedules play/pause at
//! exact instants so every device executes them together. Networking is
//! an external collaborator behind the transport port.

pub mod calibration;
pub mod clock;
pub mod coordinator;
pub mod engine;
pub mod packet;
pub mod scheduler;
pub mod transport;

// Re-exports for convenience
pub use calibration::{CalibrationConfig, CalibrationError, CalibrationPhase};
pub use clock::{SyncClock, SyncInstant};
pub use coordinator::{Coordinator, WaiterEvent};
pub use engine::{init_tracing, EngineError, EngineEvent, SyncEngine, SyncHandle};
pub use packet::{DecodeError, Packet, SongMetadata};
pub use transport::{PeerId, PeerState, Transport, TransportError, TransportEvent};
