//! Per-frame, per-client input history.
//!
//! A ring buffer indexed by `frame % capacity`. Each slot holds one frame's
//! inputs keyed by client id, each entry marked CONFIRMED (validated against
//! the relay's ordered stream) or PREDICTED (filled locally). A CONFIRMED
//! entry is never downgraded or overwritten.

use std::collections::{BTreeMap, BTreeSet};

use super::action::{ActionMap, PredictionStrategy};
use crate::store::world::{ClientId, Frame};

pub const MIN_CAPACITY: usize = 64;
pub const DEFAULT_CAPACITY: usize = 128;

#[derive(Debug, Clone, PartialEq)]
pub struct InputEntry {
    pub data: ActionMap,
    pub confirmed: bool,
}

#[derive(Debug, Clone, Default)]
struct FrameSlot {
    occupied: bool,
    frame: Frame,
    entries: BTreeMap<ClientId, InputEntry>,
    frame_confirmed: bool,
}

impl FrameSlot {
    fn clear(&mut self) {
        self.occupied = false;
        self.frame = 0;
        self.entries.clear();
        self.frame_confirmed = false;
    }
}

#[derive(Debug)]
pub struct InputHistory {
    slots: Vec<FrameSlot>,
    capacity: usize,
    oldest_frame: Frame,
    local_client: Option<ClientId>,
    clients: BTreeSet<ClientId>,
    last_known: BTreeMap<ClientId, ActionMap>,
    strategy: PredictionStrategy,
}

impl InputHistory {
    /// Capacity is rounded up to a power of two, at least [`MIN_CAPACITY`].
    pub fn new(capacity: usize, strategy: PredictionStrategy) -> Self {
        let capacity = capacity.max(MIN_CAPACITY).next_power_of_two();
        Self {
            slots: vec![FrameSlot::default(); capacity],
            capacity,
            oldest_frame: 0,
            local_client: None,
            clients: BTreeSet::new(),
            last_known: BTreeMap::new(),
            strategy,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn strategy(&self) -> PredictionStrategy {
        self.strategy
    }

    pub fn oldest_frame(&self) -> Frame {
        self.oldest_frame
    }

    // ------------------------------------------------------------------
    // Active clients
    // ------------------------------------------------------------------

    pub fn set_local_client(&mut self, client: &str) {
        self.local_client = Some(client.to_string());
        self.clients.insert(client.to_string());
    }

    pub fn local_client(&self) -> Option<&str> {
        self.local_client.as_deref()
    }

    pub fn add_client(&mut self, client: &str) {
        self.clients.insert(client.to_string());
    }

    pub fn remove_client(&mut self, client: &str) {
        self.clients.remove(client);
        self.last_known.remove(client);
    }

    pub fn is_active(&self, client: &str) -> bool {
        self.clients.contains(client)
    }

    /// Active clients, lexicographically sorted.
    pub fn active_clients(&self) -> &BTreeSet<ClientId> {
        &self.clients
    }

    /// Replaces the whole active set (snapshot adoption on a late join).
    pub fn set_active_clients(&mut self, clients: BTreeSet<ClientId>) {
        self.clients = clients;
        if let Some(local) = &self.local_client {
            self.clients.insert(local.clone());
        }
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Acquires the slot for `frame`, evicting a resident older frame.
    /// Returns None for frames below `oldest_frame` so evicted history can
    /// never regress it.
    fn slot_mut(&mut self, frame: Frame) -> Option<&mut FrameSlot> {
        if frame < self.oldest_frame {
            return None;
        }
        let idx = frame as usize & (self.capacity - 1);
        let slot = &mut self.slots[idx];
        if !slot.occupied || slot.frame != frame {
            slot.clear();
            slot.occupied = true;
            slot.frame = frame;
        }
        Some(slot)
    }

    fn slot(&self, frame: Frame) -> Option<&FrameSlot> {
        let idx = frame as usize & (self.capacity - 1);
        let slot = &self.slots[idx];
        (slot.occupied && slot.frame == frame).then_some(slot)
    }

    /// Writes a CONFIRMED input and refreshes the client's last-known
    /// record.
    pub fn store_local(&mut self, frame: Frame, client: &str, data: ActionMap) {
        let Some(slot) = self.slot_mut(frame) else {
            return;
        };
        slot.entries.insert(
            client.to_string(),
            InputEntry {
                data: data.clone(),
                confirmed: true,
            },
        );
        self.last_known.insert(client.to_string(), data);
    }

    /// Writes a PREDICTED input, unless a CONFIRMED one already occupies
    /// the slot.
    pub fn store_predicted(&mut self, frame: Frame, client: &str, data: ActionMap) {
        let Some(slot) = self.slot_mut(frame) else {
            return;
        };
        if let Some(existing) = slot.entries.get(client) {
            if existing.confirmed {
                return;
            }
        }
        slot.entries.insert(
            client.to_string(),
            InputEntry {
                data,
                confirmed: false,
            },
        );
    }

    /// Confirms a slot against the relay's data. Returns true only when a
    /// PREDICTED entry was present and its data differed — a misprediction
    /// the caller must roll back for. A previously CONFIRMED entry is left
    /// untouched.
    pub fn confirm(&mut self, frame: Frame, client: &str, data: ActionMap) -> bool {
        let Some(slot) = self.slot_mut(frame) else {
            return false;
        };
        let mispredicted = match slot.entries.get(client) {
            None => {
                slot.entries.insert(
                    client.to_string(),
                    InputEntry {
                        data: data.clone(),
                        confirmed: true,
                    },
                );
                false
            }
            Some(existing) if existing.confirmed => return false,
            Some(existing) => {
                let differed = !existing.data.shallow_eq(&data);
                slot.entries.insert(
                    client.to_string(),
                    InputEntry {
                        data: data.clone(),
                        confirmed: true,
                    },
                );
                differed
            }
        };
        self.last_known.insert(client.to_string(), data);
        mispredicted
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    fn predict_for(&self, client: &str) -> ActionMap {
        match self.strategy {
            PredictionStrategy::Idle => ActionMap::new(),
            PredictionStrategy::RepeatLast => {
                self.last_known.get(client).cloned().unwrap_or_default()
            }
        }
    }

    /// Inputs for every active client at `frame`: stored entries as-is,
    /// missing clients filled by the prediction strategy. Ascending
    /// client-id order.
    pub fn frame_inputs(&self, frame: Frame) -> BTreeMap<ClientId, ActionMap> {
        let slot = self.slot(frame);
        self.clients
            .iter()
            .map(|client| {
                let data = slot
                    .and_then(|s| s.entries.get(client))
                    .map(|e| e.data.clone())
                    .unwrap_or_else(|| self.predict_for(client));
                (client.clone(), data)
            })
            .collect()
    }

    /// The single-client branch of [`frame_inputs`].
    pub fn predicted_input(&self, frame: Frame, client: &str) -> ActionMap {
        self.slot(frame)
            .and_then(|s| s.entries.get(client))
            .map(|e| e.data.clone())
            .unwrap_or_else(|| self.predict_for(client))
    }

    pub fn entry(&self, frame: Frame, client: &str) -> Option<&InputEntry> {
        self.slot(frame)?.entries.get(client)
    }

    // ------------------------------------------------------------------
    // Confirmation tracking
    // ------------------------------------------------------------------

    pub fn mark_frame_confirmed(&mut self, frame: Frame) {
        if let Some(slot) = self.slot_mut(frame) {
            slot.frame_confirmed = true;
        }
    }

    /// A frame is confirmed iff its explicit flag is set or every present
    /// entry is CONFIRMED.
    pub fn is_frame_confirmed(&self, frame: Frame) -> bool {
        match self.slot(frame) {
            None => false,
            Some(slot) => {
                slot.frame_confirmed || slot.entries.values().all(|e| e.confirmed)
            }
        }
    }

    /// The lowest resident frame holding any non-confirmed entry.
    pub fn oldest_unconfirmed(&self) -> Option<Frame> {
        self.slots
            .iter()
            .filter(|s| {
                s.occupied
                    && !s.frame_confirmed
                    && s.entries.values().any(|e| !e.confirmed)
            })
            .map(|s| s.frame)
            .min()
    }

    /// The last K resident input records, ascending frame order — desync
    /// diagnostics.
    pub fn recent_inputs(&self, k: usize) -> Vec<(Frame, ClientId, ActionMap)> {
        let mut frames: Vec<&FrameSlot> = self.slots.iter().filter(|s| s.occupied).collect();
        frames.sort_by_key(|s| s.frame);
        frames
            .iter()
            .rev()
            .take(k)
            .rev()
            .flat_map(|s| {
                s.entries
                    .iter()
                    .map(|(c, e)| (s.frame, c.clone(), e.data.clone()))
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Drops all slots strictly older than `frame`; `oldest_frame` advances
    /// monotonically and later writes below it are rejected.
    pub fn clear_old(&mut self, frame: Frame) {
        for slot in &mut self.slots {
            if slot.occupied && slot.frame < frame {
                slot.clear();
            }
        }
        self.oldest_frame = self.oldest_frame.max(frame);
    }

    /// Clears all state; the local client (if set) stays in the active set.
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.clear();
        }
        self.oldest_frame = 0;
        self.clients.clear();
        self.last_known.clear();
        if let Some(local) = self.local_client.clone() {
            self.clients.insert(local);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::action::ActionValue;

    fn input(v: i32) -> ActionMap {
        let mut m = ActionMap::new();
        m.set(0, ActionValue::Scalar(v));
        m
    }

    fn history() -> InputHistory {
        let mut h = InputHistory::new(DEFAULT_CAPACITY, PredictionStrategy::RepeatLast);
        h.set_local_client("p1");
        h.add_client("p2");
        h
    }

    #[test]
    fn capacity_rounds_to_power_of_two() {
        assert_eq!(InputHistory::new(100, PredictionStrategy::Idle).capacity(), 128);
        assert_eq!(InputHistory::new(0, PredictionStrategy::Idle).capacity(), 64);
    }

    #[test]
    fn confirm_on_matching_prediction_returns_false() {
        let mut h = history();
        h.store_predicted(5, "p2", input(1));
        assert!(!h.confirm(5, "p2", input(1)));
        assert!(h.entry(5, "p2").unwrap().confirmed);
    }

    #[test]
    fn confirm_on_differing_prediction_returns_true() {
        let mut h = history();
        h.store_predicted(5, "p2", input(1));
        assert!(h.confirm(5, "p2", input(2)));
        assert_eq!(h.entry(5, "p2").unwrap().data, input(2));
    }

    #[test]
    fn confirmed_never_becomes_unconfirmed() {
        let mut h = history();
        h.store_local(5, "p1", input(1));
        // Neither a predicted write nor a re-confirm may touch it.
        h.store_predicted(5, "p1", input(9));
        assert!(h.entry(5, "p1").unwrap().confirmed);
        assert_eq!(h.entry(5, "p1").unwrap().data, input(1));
        assert!(!h.confirm(5, "p1", input(9)));
        assert_eq!(h.entry(5, "p1").unwrap().data, input(1));
    }

    #[test]
    fn repeat_last_prediction() {
        let mut h = history();
        h.store_local(1, "p2", input(7));
        let inputs = h.frame_inputs(2);
        assert_eq!(inputs["p2"], input(7));
    }

    #[test]
    fn idle_prediction() {
        let mut h = InputHistory::new(64, PredictionStrategy::Idle);
        h.set_local_client("p1");
        h.store_local(1, "p1", input(7));
        assert!(h.frame_inputs(2)["p1"].is_empty());
    }

    #[test]
    fn unknown_client_predicts_empty() {
        let h = history();
        assert!(h.predicted_input(3, "p2").is_empty());
    }

    #[test]
    fn frame_confirmation() {
        let mut h = history();
        h.store_local(4, "p1", input(1));
        h.store_predicted(4, "p2", input(2));
        assert!(!h.is_frame_confirmed(4));
        h.confirm(4, "p2", input(2));
        assert!(h.is_frame_confirmed(4));

        h.store_predicted(6, "p2", input(1));
        h.mark_frame_confirmed(6);
        assert!(h.is_frame_confirmed(6));
    }

    #[test]
    fn oldest_unconfirmed_scans_ascending() {
        let mut h = history();
        h.store_local(3, "p1", input(1));
        h.store_predicted(5, "p2", input(1));
        h.store_predicted(4, "p2", input(1));
        assert_eq!(h.oldest_unconfirmed(), Some(4));
        h.confirm(4, "p2", input(1));
        assert_eq!(h.oldest_unconfirmed(), Some(5));
        h.confirm(5, "p2", input(1));
        assert_eq!(h.oldest_unconfirmed(), None);
    }

    #[test]
    fn ring_eviction_at_capacity() {
        let mut h = InputHistory::new(64, PredictionStrategy::Idle);
        h.set_local_client("p1");
        h.store_local(1, "p1", input(1));
        assert!(h.entry(1, "p1").is_some());
        // Frame 1 + 64 lands on the same slot and evicts it.
        h.store_local(65, "p1", input(2));
        assert!(h.entry(1, "p1").is_none());
        assert_eq!(h.entry(65, "p1").unwrap().data, input(2));
    }

    #[test]
    fn clear_old_never_regresses() {
        let mut h = history();
        h.store_local(10, "p1", input(1));
        h.clear_old(10);
        assert!(h.entry(10, "p1").is_some());
        h.clear_old(12);
        assert!(h.entry(10, "p1").is_none());
        assert_eq!(h.oldest_frame(), 12);

        // A write below oldest_frame is rejected and does not regress it.
        h.store_predicted(11, "p1", input(3));
        assert_eq!(h.oldest_frame(), 12);
        assert!(h.entry(11, "p1").is_none());

        h.clear_old(5);
        assert_eq!(h.oldest_frame(), 12);
    }

    #[test]
    fn reset_keeps_local_client() {
        let mut h = history();
        h.store_local(3, "p1", input(1));
        h.reset();
        assert!(h.entry(3, "p1").is_none());
        assert!(h.is_active("p1"));
        assert!(!h.is_active("p2"));
    }
}
