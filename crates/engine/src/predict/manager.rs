//! Client-side prediction: speculative ticks, misprediction detection,
//! rollback and forward resimulation.

use std::collections::BTreeMap;

use log::{debug, warn};

use crate::error::{EngineError, ProgrammerError, ResourceError};
use crate::input::{ActionMap, InputData, InputHistory, LifecycleKind, PredictionStrategy};
use crate::store::world::{ClientId, Frame};
use crate::store::Store;

use super::snapshots::SnapshotRing;

/// A join or leave observed in the ordered input stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub client: ClientId,
    pub kind: LifecycleKind,
}

/// Rollback bookkeeping, exposed through the session's diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollbackStats {
    pub rollback_count: u64,
    pub max_rollback_depth: u32,
    pub frames_resimulated: u64,
}

/// The small capability set the manager needs from its host. Lifecycle
/// effects (spawn/despawn) run through these hooks inside the tick, so they
/// participate in rollback via snapshots like any other mutation.
pub trait PredictionHooks {
    /// A lifecycle input reached its simulation frame (first simulation or
    /// resimulation replay).
    fn apply_lifecycle(&mut self, store: &mut Store, frame: Frame, event: &LifecycleEvent);

    /// A rollback is unwinding past this event, newest first. Store state
    /// comes back via the snapshot; this exists for host bookkeeping.
    fn undo_lifecycle(&mut self, store: &mut Store, frame: Frame, event: &LifecycleEvent);

    /// A lifecycle input arrived for a frame we have not simulated yet;
    /// the host updates its active-client view immediately.
    fn announce_lifecycle(&mut self, event: &LifecycleEvent);

    /// A frame was re-run during rollback; observers rebuild their
    /// per-frame state (SYNC re-records hashes here).
    fn on_frame_resimulated(&mut self, store: &mut Store, frame: Frame);
}

pub struct PredictionManager {
    history: InputHistory,
    snapshots: SnapshotRing,
    local_frame: Frame,
    confirmed_frame: Frame,
    enabled: bool,
    input_delay: u32,
    max_prediction: u32,
    /// Lifecycle events keyed by the frame they take effect at.
    lifecycle: BTreeMap<Frame, Vec<LifecycleEvent>>,
    stats: RollbackStats,
}

impl PredictionManager {
    pub fn new(
        history_capacity: usize,
        snapshot_capacity: usize,
        strategy: PredictionStrategy,
        input_delay: u32,
        max_prediction: u32,
    ) -> Self {
        Self {
            history: InputHistory::new(history_capacity, strategy),
            snapshots: SnapshotRing::new(snapshot_capacity),
            local_frame: 0,
            confirmed_frame: 0,
            enabled: false,
            input_delay,
            max_prediction,
            lifecycle: BTreeMap::new(),
            stats: RollbackStats::default(),
        }
    }

    pub fn history(&self) -> &InputHistory {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut InputHistory {
        &mut self.history
    }

    pub fn local_frame(&self) -> Frame {
        self.local_frame
    }

    pub fn confirmed_frame(&self) -> Frame {
        self.confirmed_frame
    }

    pub fn prediction_depth(&self) -> u32 {
        self.local_frame.saturating_sub(self.confirmed_frame)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn stats(&self) -> RollbackStats {
        self.stats
    }

    /// The ring snapshot tagged with `frame`, if still resident.
    pub fn snapshot_at(&self, frame: Frame) -> Option<&crate::store::WorldSnapshot> {
        self.snapshots.get(frame)
    }

    /// Queues the local input as CONFIRMED for the next simulated frame
    /// plus the configured input delay. The delay shifts inputs forward so
    /// remote participants receive them in time to simulate them at the
    /// same frame with few mispredictions. Returns the target frame.
    pub fn queue_local_input(&mut self, client: &str, data: ActionMap) -> Frame {
        let frame = self.local_frame + 1 + self.input_delay;
        self.history.store_local(frame, client, data);
        frame
    }

    /// One speculative tick: snapshot, advance the frame counter, fill
    /// inputs (missing clients via the prediction strategy, written back as
    /// PREDICTED), run the store. No-op while disabled or while the
    /// prediction window is exhausted.
    pub fn advance_frame(
        &mut self,
        store: &mut Store,
        hooks: &mut dyn PredictionHooks,
    ) -> Result<bool, EngineError> {
        if !self.enabled || self.prediction_depth() >= self.max_prediction {
            return Ok(false);
        }

        self.snapshots.push(store.snapshot(true));
        self.local_frame += 1;

        self.run_frame(store, hooks, self.local_frame, false)?;
        Ok(true)
    }

    /// Applies lifecycle events, collects inputs and ticks the store for
    /// one frame. On a failed tick the pre-tick snapshot is restored and
    /// the frame counter rewound, so the error leaves the store unchanged.
    fn run_frame(
        &mut self,
        store: &mut Store,
        hooks: &mut dyn PredictionHooks,
        frame: Frame,
        resimulating: bool,
    ) -> Result<(), EngineError> {
        if let Some(events) = self.lifecycle.get(&frame) {
            let events = events.clone();
            for event in &events {
                match event.kind {
                    LifecycleKind::Join => self.history.add_client(&event.client),
                    LifecycleKind::Leave => self.history.remove_client(&event.client),
                }
                hooks.apply_lifecycle(store, frame, event);
            }
        }

        let inputs = self.history.frame_inputs(frame);
        if !resimulating {
            for (client, data) in &inputs {
                self.history.store_predicted(frame, client, data.clone());
            }
        }

        if let Err(err) = store.tick(frame, inputs) {
            if let Some(snapshot) = self.snapshots.get(frame - 1) {
                store.load_snapshot(snapshot)?;
            }
            if !resimulating {
                self.local_frame -= 1;
            }
            return Err(err);
        }
        Ok(())
    }

    /// Ingests one relayed tick. Lifecycle events for frames we have not
    /// reached are announced out of band and recorded; events and inputs
    /// for frames already simulated are confirmed against the history, and
    /// any misprediction triggers a rollback to the confirmed frame.
    /// Returns true when a rollback was executed.
    pub fn receive_server_tick(
        &mut self,
        store: &mut Store,
        hooks: &mut dyn PredictionHooks,
        frame: Frame,
        inputs: &[(ClientId, InputData)],
    ) -> Result<bool, EngineError> {
        if !self.enabled {
            return Ok(false);
        }

        let mut game_inputs: Vec<(&ClientId, &ActionMap)> = Vec::new();
        let mut lifecycle: Vec<LifecycleEvent> = Vec::new();
        for (client, data) in inputs {
            match data {
                InputData::Lifecycle(kind) => lifecycle.push(LifecycleEvent {
                    client: client.clone(),
                    kind: *kind,
                }),
                InputData::Actions(map) => game_inputs.push((client, map)),
            }
        }

        if frame > self.local_frame {
            // Not simulated yet: no rollback. Lifecycle updates the active
            // set immediately; inputs are banked as confirmed for when the
            // local loop catches up.
            for event in &lifecycle {
                match event.kind {
                    LifecycleKind::Join => self.history.add_client(&event.client),
                    LifecycleKind::Leave => self.history.remove_client(&event.client),
                }
                hooks.announce_lifecycle(event);
                self.record_lifecycle(frame, event.clone());
            }
            for (client, map) in game_inputs {
                self.history.store_local(frame, client, map.clone());
            }
            self.history.mark_frame_confirmed(frame);
            self.confirmed_frame = self.confirmed_frame.max(frame);
            return Ok(false);
        }

        let mut needs_rollback = false;

        for (client, map) in &game_inputs {
            if !self.history.is_active(client) {
                return Err(ProgrammerError::UnknownClient {
                    client: (*client).clone(),
                }
                .into());
            }
            if self.history.confirm(frame, client, (*map).clone()) {
                needs_rollback = true;
            }
        }

        for event in &lifecycle {
            // A lifecycle event at an already-simulated frame was missed by
            // prediction by definition.
            needs_rollback = true;
            match event.kind {
                LifecycleKind::Join => self.history.add_client(&event.client),
                LifecycleKind::Leave => self.history.remove_client(&event.client),
            }
            hooks.announce_lifecycle(event);
            self.record_lifecycle(frame, event.clone());
        }

        self.history.mark_frame_confirmed(frame);
        self.confirmed_frame = self.confirmed_frame.max(frame);

        if needs_rollback {
            self.execute_rollback(store, hooks, frame)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn record_lifecycle(&mut self, frame: Frame, event: LifecycleEvent) {
        let events = self.lifecycle.entry(frame).or_default();
        if !events.contains(&event) {
            events.push(event);
        }
    }

    /// Rolls back to the state before `to_frame` was ticked and
    /// resimulates `to_frame..=local_frame` with the now-confirmed inputs.
    /// Snapshots are tagged with the frame whose tick produced them, so the
    /// restore point is the snapshot tagged `to_frame - 1`. Fails with
    /// [`ResourceError::RollbackTooDeep`] when that predates the snapshot
    /// ring; the caller must then request a full resync.
    pub fn execute_rollback(
        &mut self,
        store: &mut Store,
        hooks: &mut dyn PredictionHooks,
        to_frame: Frame,
    ) -> Result<(), EngineError> {
        let restore_frame = to_frame.saturating_sub(1);
        if self.snapshots.get(restore_frame).is_none() {
            warn!(
                "rollback to frame {to_frame} predates snapshot ring (oldest {:?})",
                self.snapshots.oldest_frame()
            );
            return Err(ResourceError::RollbackTooDeep {
                target: to_frame,
                oldest: self.snapshots.oldest_frame(),
            }
            .into());
        }

        let depth = self.local_frame - to_frame;
        debug!("rollback from frame {} to {to_frame}", self.local_frame);

        // Unwind lifecycle effects newest-first before the restore.
        for frame in (to_frame..=self.local_frame).rev() {
            if let Some(events) = self.lifecycle.get(&frame) {
                let events = events.clone();
                for event in events.iter().rev() {
                    match event.kind {
                        LifecycleKind::Join => self.history.remove_client(&event.client),
                        LifecycleKind::Leave => self.history.add_client(&event.client),
                    }
                    hooks.undo_lifecycle(store, frame, event);
                }
            }
        }

        let snapshot = self
            .snapshots
            .get(restore_frame)
            .expect("checked above")
            .clone();
        store.load_snapshot(&snapshot)?;

        for frame in to_frame..=self.local_frame {
            self.run_frame(store, hooks, frame, true)?;
            // Replace the stale speculative snapshot so a later rollback
            // into this range restores resimulated state.
            self.snapshots.push(store.snapshot(true));
            hooks.on_frame_resimulated(store, frame);
        }

        self.stats.rollback_count += 1;
        self.stats.max_rollback_depth = self.stats.max_rollback_depth.max(depth);
        self.stats.frames_resimulated += depth as u64;
        Ok(())
    }

    /// Resets the frame counters onto a freshly loaded authority snapshot.
    pub fn initialize(&mut self, frame: Frame) {
        self.local_frame = frame;
        self.confirmed_frame = frame;
        self.snapshots.clear();
        self.lifecycle.retain(|&f, _| f > frame);
        self.history.clear_old(frame);
    }

    /// Frees history and lifecycle records no rollback can reach anymore.
    pub fn trim(&mut self) {
        if let Some(oldest) = self.snapshots.oldest_frame() {
            let keep_from = oldest.min(self.confirmed_frame);
            self.history.clear_old(keep_from);
            self.lifecycle.retain(|&f, _| f >= keep_from);
        }
    }
}

impl std::fmt::Debug for PredictionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredictionManager")
            .field("local_frame", &self.local_frame)
            .field("confirmed_frame", &self.confirmed_frame)
            .field("enabled", &self.enabled)
            .field("stats", &self.stats)
            .finish()
    }
}
