//! Relay wire protocol.
//!
//! Five semantic messages: INPUT and HASH go up, TICK and SNAPSHOT come
//! down, TIME-SYNC round-trips. The envelope is rkyv with a leading
//! version byte; the snapshot payload inside [`RelayMessage::Snapshot`]
//! uses the explicit layout from `store::snapshot`.

use rkyv::{rancor, Archive, Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::input::InputData;

pub const PROTOCOL_VERSION: u8 = 1;

/// One sequenced input as the relay rebroadcasts it.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct InputRecord {
    pub seq: u64,
    pub client: String,
    pub data: InputData,
}

/// Participant -> relay.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum ParticipantMessage {
    /// An opaque input; the relay assigns the sequence number and the
    /// frame it lands on.
    Input { client: String, data: InputData },
    /// Compact per-tick digest uplink.
    Hash { frame: u32, hash: u32 },
    /// Clock probe; the relay echoes it with its own time.
    TimeSyncRequest { sent_local_ms: i64 },
    /// Out-of-band ask for a full snapshot, routed to the authority.
    SnapshotRequest { client: String },
    /// Authority's reply, routed to one participant.
    SnapshotResponse {
        to: String,
        bytes: Vec<u8>,
        hash: u32,
        post_tick: bool,
    },
}

/// Relay -> participant.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum RelayMessage {
    /// Connection bootstrap.
    Welcome {
        client_id: String,
        is_first: bool,
        server_start_ms: i64,
        server_time_ms: i64,
        tick_interval_ms: u32,
    },
    /// One relay tick: every input assigned to `frame`, in sequence
    /// order, plus the majority digest for `majority_frame`.
    Tick {
        seq: u64,
        frame: u32,
        inputs: Vec<InputRecord>,
        majority_frame: u32,
        majority_hash: Option<u32>,
        server_time_ms: i64,
    },
    /// A participant asked for a snapshot; delivered to the authority.
    SnapshotRequested { from: String },
    /// Full snapshot payload (see `store::snapshot` for the layout).
    Snapshot {
        bytes: Vec<u8>,
        hash: u32,
        post_tick: bool,
    },
    TimeSyncReply {
        sent_local_ms: i64,
        server_time_ms: i64,
    },
}

fn frame_body(body: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(body.len() + 1);
    framed.push(PROTOCOL_VERSION);
    framed.extend_from_slice(body);
    framed
}

/// Strips and checks the version byte, re-aligning the body for rkyv.
fn check_version(bytes: &[u8]) -> Result<rkyv::util::AlignedVec, ProtocolError> {
    let (&version, body) = bytes.split_first().ok_or(ProtocolError::Truncated {
        needed: 1,
        available: 0,
    })?;
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            found: version,
        });
    }
    let mut aligned = rkyv::util::AlignedVec::new();
    aligned.extend_from_slice(body);
    Ok(aligned)
}

impl ParticipantMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let body = rkyv::to_bytes::<rancor::Error>(self)
            .map_err(|e| ProtocolError::Codec(e.to_string()))?;
        Ok(frame_body(&body))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let body = check_version(bytes)?;
        rkyv::from_bytes::<Self, rancor::Error>(&body)
            .map_err(|e| ProtocolError::Codec(e.to_string()))
    }
}

impl RelayMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let body = rkyv::to_bytes::<rancor::Error>(self)
            .map_err(|e| ProtocolError::Codec(e.to_string()))?;
        Ok(frame_body(&body))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let body = check_version(bytes)?;
        rkyv::from_bytes::<Self, rancor::Error>(&body)
            .map_err(|e| ProtocolError::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{ActionMap, ActionValue, LifecycleKind};

    #[test]
    fn participant_roundtrip() {
        let mut map = ActionMap::new();
        map.set(0, ActionValue::Vector2(65536, -65536));
        let msg = ParticipantMessage::Input {
            client: "p1".to_string(),
            data: InputData::Actions(map),
        };
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(ParticipantMessage::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn relay_roundtrip() {
        let msg = RelayMessage::Tick {
            seq: 9,
            frame: 42,
            inputs: vec![InputRecord {
                seq: 8,
                client: "p2".to_string(),
                data: InputData::Lifecycle(LifecycleKind::Join),
            }],
            majority_frame: 41,
            majority_hash: Some(0xDEAD_BEEF),
            server_time_ms: 123_456,
        };
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(RelayMessage::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn version_mismatch_detected() {
        let msg = ParticipantMessage::Hash { frame: 1, hash: 2 };
        let mut bytes = msg.to_bytes().unwrap();
        bytes[0] = 9;
        assert!(matches!(
            ParticipantMessage::from_bytes(&bytes),
            Err(ProtocolError::VersionMismatch { found: 9, .. })
        ));
    }
}
