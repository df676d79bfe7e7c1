//! Transport seam and the in-process relay.
//!
//! The relay contract is deliberately dumb: assign each input a
//! monotonically increasing sequence number, batch inputs into ticks,
//! broadcast them to every participant in order, fold reported hashes into
//! a majority, reflect time probes, and route snapshot traffic between a
//! participant and the authority. [`LocalRelay`] implements the contract
//! in-process for tests and demos; a production transport implements
//! [`Transport`] against a real socket out of tree.
//!
//! Everything here is single-threaded; the simulation loop pumps the relay
//! explicitly, so there is no shared mutable state across threads.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use crate::error::{EngineError, TransportError};

use super::protocol::{InputRecord, ParticipantMessage, RelayMessage};

pub trait Transport {
    fn send(&mut self, msg: ParticipantMessage) -> Result<(), EngineError>;
    fn poll(&mut self) -> Result<Vec<RelayMessage>, EngineError>;
    fn close(&mut self);
    fn is_open(&self) -> bool;
}

#[derive(Debug, Default)]
struct Endpoint {
    inbox: VecDeque<Vec<u8>>,
    open: bool,
}

#[derive(Debug)]
struct RelayCore {
    participants: BTreeMap<String, Endpoint>,
    /// Inputs waiting for their delivery frame, in sequence order.
    pending: Vec<(u32, InputRecord)>,
    next_seq: u64,
    tick_seq: u64,
    frame: u32,
    /// frame -> client -> reported hash.
    reported: BTreeMap<u32, BTreeMap<String, u32>>,
    time_requests: Vec<(String, i64)>,
    start_ms: i64,
    tick_interval_ms: u32,
    latency_ticks: u32,
}

impl RelayCore {
    fn open_count(&self) -> usize {
        self.participants.values().filter(|e| e.open).count()
    }

    fn deliver(&mut self, to: &str, msg: &RelayMessage) {
        let bytes = msg.to_bytes().expect("relay message encodes");
        if let Some(endpoint) = self.participants.get_mut(to) {
            if endpoint.open {
                endpoint.inbox.push_back(bytes);
            }
        }
    }

    fn broadcast(&mut self, msg: &RelayMessage) {
        let bytes = msg.to_bytes().expect("relay message encodes");
        for endpoint in self.participants.values_mut() {
            if endpoint.open {
                endpoint.inbox.push_back(bytes.clone());
            }
        }
    }

    /// The relay's view of the authority: the lexicographically lowest
    /// open participant — the same rule participants apply to themselves.
    fn authority_for(&self, requester: &str) -> Option<String> {
        self.participants
            .iter()
            .filter(|(id, e)| e.open && id.as_str() != requester)
            .map(|(id, _)| id.clone())
            .next()
    }

    fn handle(&mut self, from: &str, msg: ParticipantMessage) {
        match msg {
            ParticipantMessage::Input { client, data } => {
                let seq = self.next_seq;
                self.next_seq += 1;
                let ready = self.frame + 1 + self.latency_ticks;
                self.pending.push((ready, InputRecord { seq, client, data }));
            }
            ParticipantMessage::Hash { frame, hash } => {
                self.reported
                    .entry(frame)
                    .or_default()
                    .insert(from.to_string(), hash);
            }
            ParticipantMessage::TimeSyncRequest { sent_local_ms } => {
                self.time_requests.push((from.to_string(), sent_local_ms));
            }
            ParticipantMessage::SnapshotRequest { client } => {
                if let Some(authority) = self.authority_for(&client) {
                    self.deliver(&authority, &RelayMessage::SnapshotRequested { from: client });
                }
            }
            ParticipantMessage::SnapshotResponse {
                to,
                bytes,
                hash,
                post_tick,
            } => {
                self.deliver(
                    &to,
                    &RelayMessage::Snapshot {
                        bytes,
                        hash,
                        post_tick,
                    },
                );
            }
        }
    }

    /// The newest fully reported frame and the mode of its hashes. Ties
    /// break toward the hash reported by the lowest-sorted client, so
    /// every relay run resolves them the same way.
    fn majority(&self) -> Option<(u32, u32)> {
        let expect = self.open_count();
        if expect == 0 {
            return None;
        }
        let (&frame, reports) = self
            .reported
            .iter()
            .rev()
            .find(|(_, reports)| reports.len() >= expect)?;

        let mut counts: BTreeMap<u32, usize> = BTreeMap::new();
        for &hash in reports.values() {
            *counts.entry(hash).or_default() += 1;
        }
        let best_count = counts.values().copied().max()?;
        let winner = reports
            .values()
            .copied()
            .find(|h| counts[h] == best_count)?;
        Some((frame, winner))
    }

    fn advance(&mut self, now_ms: i64) {
        self.frame += 1;

        let due: Vec<InputRecord> = {
            let frame = self.frame;
            let mut due = Vec::new();
            self.pending.retain_mut(|(ready, record)| {
                if *ready <= frame {
                    due.push(std::mem::replace(
                        record,
                        InputRecord {
                            seq: 0,
                            client: String::new(),
                            data: crate::input::InputData::empty(),
                        },
                    ));
                    false
                } else {
                    true
                }
            });
            due.sort_by_key(|r| r.seq);
            due
        };

        let (majority_frame, majority_hash) = match self.majority() {
            Some((frame, hash)) => (frame, Some(hash)),
            None => (0, None),
        };

        let tick = RelayMessage::Tick {
            seq: self.tick_seq,
            frame: self.frame,
            inputs: due,
            majority_frame,
            majority_hash,
            server_time_ms: now_ms,
        };
        self.tick_seq += 1;
        self.broadcast(&tick);

        for (client, sent_local_ms) in std::mem::take(&mut self.time_requests) {
            self.deliver(
                &client,
                &RelayMessage::TimeSyncReply {
                    sent_local_ms,
                    server_time_ms: now_ms,
                },
            );
        }

        let horizon = self.frame.saturating_sub(512);
        self.reported.retain(|&f, _| f >= horizon);
    }
}

/// In-process relay hub. Create one, `connect` each participant, then call
/// [`LocalRelay::advance`] once per server tick.
#[derive(Clone)]
pub struct LocalRelay {
    core: Rc<RefCell<RelayCore>>,
}

impl LocalRelay {
    pub fn new(start_ms: i64, tick_interval_ms: u32) -> Self {
        Self {
            core: Rc::new(RefCell::new(RelayCore {
                participants: BTreeMap::new(),
                pending: Vec::new(),
                next_seq: 0,
                tick_seq: 0,
                frame: 0,
                reported: BTreeMap::new(),
                time_requests: Vec::new(),
                start_ms,
                tick_interval_ms,
                latency_ticks: 0,
            })),
        }
    }

    /// Delays input delivery by a fixed number of relay ticks, for
    /// exercising prediction and rollback under latency.
    pub fn set_latency_ticks(&self, ticks: u32) {
        self.core.borrow_mut().latency_ticks = ticks;
    }

    pub fn frame(&self) -> u32 {
        self.core.borrow().frame
    }

    /// Registers a participant and hands back its transport endpoint. The
    /// first participant is told it is creating the room.
    pub fn connect(&self, client_id: &str) -> LocalTransport {
        let mut core = self.core.borrow_mut();
        let is_first = core.open_count() == 0;
        core.participants.insert(
            client_id.to_string(),
            Endpoint {
                inbox: VecDeque::new(),
                open: true,
            },
        );
        let welcome = RelayMessage::Welcome {
            client_id: client_id.to_string(),
            is_first,
            server_start_ms: core.start_ms,
            server_time_ms: core.start_ms + core.frame as i64 * core.tick_interval_ms as i64,
            tick_interval_ms: core.tick_interval_ms,
        };
        core.deliver(client_id, &welcome);
        drop(core);

        LocalTransport {
            core: Rc::clone(&self.core),
            client: client_id.to_string(),
        }
    }

    /// One relay tick: drains due inputs into a TICK envelope, reports the
    /// current majority hash and answers pending time probes.
    pub fn advance(&self, now_ms: i64) {
        self.core.borrow_mut().advance(now_ms);
    }
}

pub struct LocalTransport {
    core: Rc<RefCell<RelayCore>>,
    client: String,
}

impl LocalTransport {
    pub fn client_id(&self) -> &str {
        &self.client
    }
}

impl Transport for LocalTransport {
    fn send(&mut self, msg: ParticipantMessage) -> Result<(), EngineError> {
        let mut core = self.core.borrow_mut();
        let open = core
            .participants
            .get(&self.client)
            .map(|e| e.open)
            .unwrap_or(false);
        if !open {
            return Err(TransportError::Closed.into());
        }
        // Round-trip the wire codec even in-process so framing stays
        // honest.
        let bytes = msg.to_bytes()?;
        let decoded = ParticipantMessage::from_bytes(&bytes)?;
        core.handle(&self.client, decoded);
        Ok(())
    }

    fn poll(&mut self) -> Result<Vec<RelayMessage>, EngineError> {
        let mut core = self.core.borrow_mut();
        let endpoint = core
            .participants
            .get_mut(&self.client)
            .ok_or(TransportError::Closed)?;
        if !endpoint.open {
            return Err(TransportError::Closed.into());
        }
        let mut out = Vec::with_capacity(endpoint.inbox.len());
        while let Some(bytes) = endpoint.inbox.pop_front() {
            out.push(RelayMessage::from_bytes(&bytes)?);
        }
        Ok(out)
    }

    fn close(&mut self) {
        let mut core = self.core.borrow_mut();
        if let Some(endpoint) = core.participants.get_mut(&self.client) {
            endpoint.open = false;
            endpoint.inbox.clear();
        }
    }

    fn is_open(&self) -> bool {
        self.core
            .borrow()
            .participants
            .get(&self.client)
            .map(|e| e.open)
            .unwrap_or(false)
    }
}
