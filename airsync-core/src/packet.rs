//! Wire packets exchanged between host and peers
//!
//! Every message is a small envelope: a kind byte, an action byte and a
//! payload whose layout is fixed by `(kind, action)`. Timestamps travel as
//! big-endian signed 64-bit nanosecond values; the structured metadata
//! record is serialized with serde_json. Unknown kind or action bytes
//! decode into a distinguished variant so a newer sender never breaks an
//! older receiver.

use serde::{Deserialize, Serialize};
use thiserror::Error;

const KIND_CONTROL: u8 = 0;
const KIND_FILE: u8 = 1;
const KIND_METADATA: u8 = 2;

const ACTION_SYNC_START: u8 = 0;
const ACTION_SYNC_REQUEST: u8 = 1;
const ACTION_SYNC_REPLY: u8 = 2;
const ACTION_SYNC_DONE: u8 = 3;
const ACTION_PLAY: u8 = 4;
const ACTION_PAUSE: u8 = 5;

/// Action byte written for packets whose kind carries no action.
const ACTION_NONE: u8 = 0;

/// Codec failures. A decode error is logged by the caller and the packet
/// dropped; it never tears down the connection.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("packet too short: {0} bytes")]
    Truncated(usize),
    #[error("bad {what} payload: expected {expected} bytes, got {got}")]
    Payload {
        what: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("malformed metadata record: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Song identity sent ahead of the audio bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SongMetadata {
    pub title: String,
    pub artist: String,
    pub album: String,
    /// Duration in milliseconds
    pub duration_ms: u64,
}

/// A decoded wire packet.
///
/// Immutable once built; created by the dispatcher or the calibration
/// engine at send time and by [`Packet::decode`] at receive time.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Host asks the receiving peer to begin calibrating against it.
    SyncStart,
    /// One calibration round: sender's local clock at send time.
    SyncRequest { t0: i64 },
    /// Reply to a sync request: echoed `t0` plus the responder's clock at
    /// receipt.
    SyncReply { t0: i64, t1: i64 },
    /// Peer reports calibration finished, with its final estimates.
    SyncDone { offset_ns: i64, latency_ns: i64 },
    /// Execute play at the synchronized instant `at`.
    Play { at: i64, position_secs: f64 },
    /// Execute pause at the synchronized instant `at`.
    Pause { at: i64 },
    /// Structured song metadata.
    Metadata(SongMetadata),
    /// Raw song bytes.
    Song(Vec<u8>),
    /// Kind or action byte we do not recognise. Payload preserved so
    /// callers can log and ignore.
    Unknown {
        kind: u8,
        action: u8,
        payload: Vec<u8>,
    },
}

impl Packet {
    /// Serialize to the wire representation.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Packet::SyncStart => header(KIND_CONTROL, ACTION_SYNC_START),
            Packet::SyncRequest { t0 } => {
                let mut buf = header(KIND_CONTROL, ACTION_SYNC_REQUEST);
                buf.extend_from_slice(&t0.to_be_bytes());
                buf
            }
            Packet::SyncReply { t0, t1 } => {
                let mut buf = header(KIND_CONTROL, ACTION_SYNC_REPLY);
                buf.extend_from_slice(&t0.to_be_bytes());
                buf.extend_from_slice(&t1.to_be_bytes());
                buf
            }
            Packet::SyncDone {
                offset_ns,
                latency_ns,
            } => {
                let mut buf = header(KIND_CONTROL, ACTION_SYNC_DONE);
                buf.extend_from_slice(&offset_ns.to_be_bytes());
                buf.extend_from_slice(&latency_ns.to_be_bytes());
                buf
            }
            Packet::Play { at, position_secs } => {
                let mut buf = header(KIND_CONTROL, ACTION_PLAY);
                buf.extend_from_slice(&at.to_be_bytes());
                buf.extend_from_slice(&position_secs.to_bits().to_be_bytes());
                buf
            }
            Packet::Pause { at } => {
                let mut buf = header(KIND_CONTROL, ACTION_PAUSE);
                buf.extend_from_slice(&at.to_be_bytes());
                buf
            }
            Packet::Metadata(meta) => {
                let mut buf = header(KIND_METADATA, ACTION_NONE);
                let json = serde_json::to_vec(meta).unwrap_or_default();
                buf.extend_from_slice(&json);
                buf
            }
            Packet::Song(bytes) => {
                let mut buf = header(KIND_FILE, ACTION_NONE);
                buf.extend_from_slice(bytes);
                buf
            }
            Packet::Unknown {
                kind,
                action,
                payload,
            } => {
                let mut buf = header(*kind, *action);
                buf.extend_from_slice(payload);
                buf
            }
        }
    }

    /// Parse a wire packet. Pure; no side effects.
    pub fn decode(bytes: &[u8]) -> Result<Packet, DecodeError> {
        if bytes.len() < 2 {
            return Err(DecodeError::Truncated(bytes.len()));
        }
        let (kind, action) = (bytes[0], bytes[1]);
        let payload = &bytes[2..];

        match kind {
            KIND_CONTROL => match action {
                ACTION_SYNC_START => Ok(Packet::SyncStart),
                ACTION_SYNC_REQUEST => {
                    let t0 = read_i64(payload, 0, "sync-request")?;
                    Ok(Packet::SyncRequest { t0 })
                }
                ACTION_SYNC_REPLY => {
                    let t0 = read_i64(payload, 0, "sync-reply")?;
                    let t1 = read_i64(payload, 8, "sync-reply")?;
                    Ok(Packet::SyncReply { t0, t1 })
                }
                ACTION_SYNC_DONE => {
                    let offset_ns = read_i64(payload, 0, "sync-done")?;
                    let latency_ns = read_i64(payload, 8, "sync-done")?;
                    Ok(Packet::SyncDone {
                        offset_ns,
                        latency_ns,
                    })
                }
                ACTION_PLAY => {
                    let at = read_i64(payload, 0, "play")?;
                    let bits = read_i64(payload, 8, "play")? as u64;
                    Ok(Packet::Play {
                        at,
                        position_secs: f64::from_bits(bits),
                    })
                }
                ACTION_PAUSE => {
                    let at = read_i64(payload, 0, "pause")?;
                    Ok(Packet::Pause { at })
                }
                other => Ok(Packet::Unknown {
                    kind,
                    action: other,
                    payload: payload.to_vec(),
                }),
            },
            KIND_METADATA => {
                let meta: SongMetadata = serde_json::from_slice(payload)?;
                Ok(Packet::Metadata(meta))
            }
            KIND_FILE => Ok(Packet::Song(payload.to_vec())),
            other => Ok(Packet::Unknown {
                kind: other,
                action,
                payload: payload.to_vec(),
            }),
        }
    }
}

fn header(kind: u8, action: u8) -> Vec<u8> {
    vec![kind, action]
}

fn read_i64(payload: &[u8], offset: usize, what: &'static str) -> Result<i64, DecodeError> {
    let end = offset + 8;
    if payload.len() < end {
        return Err(DecodeError::Payload {
            what,
            expected: end,
            got: payload.len(),
        });
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&payload[offset..end]);
    Ok(i64::from_be_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(packet: Packet) {
        let decoded = Packet::decode(&packet.encode()).expect("decode");
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_control_roundtrips() {
        roundtrip(Packet::SyncStart);
        roundtrip(Packet::SyncRequest { t0: 123_456_789 });
        roundtrip(Packet::SyncRequest { t0: -42 });
        roundtrip(Packet::SyncReply {
            t0: 1_000,
            t1: 2_000,
        });
        roundtrip(Packet::SyncDone {
            offset_ns: -50_000_000,
            latency_ns: 20_000_000,
        });
        roundtrip(Packet::Play {
            at: 1_200_000_000,
            position_secs: 30.0,
        });
        roundtrip(Packet::Pause { at: i64::MAX });
    }

    #[test]
    fn test_metadata_roundtrip() {
        roundtrip(Packet::Metadata(SongMetadata {
            title: "Violet Hill".into(),
            artist: "Coldplay".into(),
            album: "Viva la Vida".into(),
            duration_ms: 222_000,
        }));
    }

    #[test]
    fn test_song_roundtrip() {
        roundtrip(Packet::Song(vec![0xde, 0xad, 0xbe, 0xef]));
        roundtrip(Packet::Song(Vec::new()));
    }

    #[test]
    fn test_unknown_action_is_not_an_error() {
        let bytes = [KIND_CONTROL, 0x7f, 1, 2, 3];
        match Packet::decode(&bytes).expect("decode") {
            Packet::Unknown {
                kind,
                action,
                payload,
            } => {
                assert_eq!(kind, KIND_CONTROL);
                assert_eq!(action, 0x7f);
                assert_eq!(payload, vec![1, 2, 3]);
            }
            other => panic!("expected Unknown, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_kind_reencodes_identically() {
        let bytes = vec![0x42, 0x07, 9, 8, 7];
        let decoded = Packet::decode(&bytes).expect("decode");
        assert_eq!(decoded.encode(), bytes);
    }

    #[test]
    fn test_truncated_inputs() {
        assert!(matches!(
            Packet::decode(&[]),
            Err(DecodeError::Truncated(0))
        ));
        assert!(matches!(
            Packet::decode(&[KIND_CONTROL]),
            Err(DecodeError::Truncated(1))
        ));
        // sync-request with a short timestamp
        let bytes = [KIND_CONTROL, ACTION_SYNC_REQUEST, 0, 0, 0];
        assert!(matches!(
            Packet::decode(&bytes),
            Err(DecodeError::Payload { .. })
        ));
    }

    #[test]
    fn test_garbage_metadata_is_decode_error() {
        let bytes = [KIND_METADATA, ACTION_NONE, 0xff, 0x00];
        assert!(matches!(
            Packet::decode(&bytes),
            Err(DecodeError::Metadata(_))
        ));
    }
}
