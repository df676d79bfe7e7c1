//! Top-level session orchestration.
//!
//! Wires input history, the store, prediction and state sync together,
//! drives the tick loop, and speaks the relay protocol through a
//! [`Transport`]. The host calls [`Session::update`] with its wall clock;
//! everything else is event driven.

use std::collections::BTreeSet;

use log::{debug, error, info, warn};

use crate::error::{EngineError, ProgrammerError, ProtocolError, ResourceError, TransportError};
use crate::input::{
    ActionId, ActionMap, ActionRegistry, ActionValue, InputData, LifecycleKind,
};
use crate::net::{InputRecord, ParticipantMessage, RelayMessage, Transport};
use crate::predict::{
    LifecycleEvent, PredictionHooks, PredictionManager, RollbackStats, TimeSync,
};
use crate::store::world::{ClientId, Frame};
use crate::store::{
    snapshot, ComponentDef, EntityTypeDef, FieldDef, FieldValue, Phase, Store, SystemFn,
};
use crate::sync::{diff_snapshots, DesyncReport, StateSync, SyncState, SyncStats, SyncVerdict};

use super::callbacks::SessionCallbacks;
use super::config::SessionConfig;

const RECENT_INPUTS_IN_REPORT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Offline,
    Local,
    Connecting,
    Connected,
    Stopped,
}

impl SessionState {
    fn name(self) -> &'static str {
        match self {
            SessionState::Offline => "offline",
            SessionState::Local => "local",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Stopped => "stopped",
        }
    }
}

/// Why a session ended; maps onto the host process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Clean,
    UnrecoverableDesync,
    ProtocolMismatch,
    TransportClosed,
}

impl ExitReason {
    pub fn exit_code(self) -> i32 {
        match self {
            ExitReason::Clean => 0,
            ExitReason::UnrecoverableDesync => 1,
            ExitReason::ProtocolMismatch => 2,
            ExitReason::TransportClosed => 3,
        }
    }
}

/// A relayed tick buffered while a late joiner waits for its snapshot.
#[derive(Debug, Clone)]
struct BufferedTick {
    frame: Frame,
    inputs: Vec<(ClientId, InputData)>,
    majority_frame: Frame,
    majority_hash: Option<u32>,
}

/// An external collaborator (renderer, physics integration, input capture)
/// that wires itself into a session at setup time: registering components,
/// systems and actions through the same public surface as game code.
pub trait Plugin<T: Transport> {
    fn install(&mut self, session: &mut Session<T>) -> Result<(), EngineError>;
}

/// Hooks bridging the prediction manager to user callbacks and SYNC.
struct SessionHooks<'a> {
    callbacks: &'a mut SessionCallbacks,
    sync: &'a mut StateSync,
}

impl PredictionHooks for SessionHooks<'_> {
    fn apply_lifecycle(&mut self, store: &mut Store, _frame: Frame, event: &LifecycleEvent) {
        match event.kind {
            LifecycleKind::Join => {
                if let Some(cb) = &mut self.callbacks.on_connect {
                    cb(store, &event.client);
                }
            }
            LifecycleKind::Leave => {
                if let Some(cb) = &mut self.callbacks.on_disconnect {
                    cb(store, &event.client);
                }
            }
        }
    }

    fn undo_lifecycle(&mut self, _store: &mut Store, frame: Frame, event: &LifecycleEvent) {
        // Store effects come back with the snapshot restore; the active
        // set is unwound by the prediction manager.
        debug!("unwinding {:?} of {} at frame {frame}", event.kind, event.client);
    }

    fn announce_lifecycle(&mut self, event: &LifecycleEvent) {
        info!("client {} will {:?}", event.client, event.kind);
    }

    fn on_frame_resimulated(&mut self, store: &mut Store, frame: Frame) {
        self.sync.record_local_hash(frame, store.state_hash());
    }
}

pub struct Session<T: Transport> {
    config: SessionConfig,
    state: SessionState,
    store: Store,
    predict: PredictionManager,
    sync: StateSync,
    time_sync: TimeSync,
    callbacks: SessionCallbacks,
    actions: ActionRegistry,
    transport: Option<T>,
    local_client: ClientId,
    room_creator: bool,
    current_input: ActionMap,
    server_start_ms: i64,
    last_update_ms: Option<i64>,
    accumulator_ms: i64,
    last_relay_frame: Frame,
    buffered_ticks: Vec<BufferedTick>,
    /// (client, earliest frame the snapshot must cover).
    pending_snapshots: Vec<(ClientId, Frame)>,
    awaiting_snapshot_deadline: Option<i64>,
    /// A diagnostic snapshot has been requested for the current drift and
    /// has not arrived yet.
    drift_probe_outstanding: bool,
    transport_failures: u32,
    room_created: bool,
    /// Highest frame whose digest went to the relay. Only confirmed frames
    /// are reported, so every uplinked digest is final.
    last_hash_uplink: Frame,
    exit: Option<ExitReason>,
}

impl<T: Transport> Session<T> {
    pub fn new(config: SessionConfig) -> Self {
        let store = Store::new(config.max_entities, config.seed);
        let predict = PredictionManager::new(
            config.input_history_capacity,
            config.snapshot_ring_capacity,
            config.prediction_strategy,
            config.input_delay_frames,
            config.max_prediction_frames,
        );
        let sync = StateSync::new(config.hash_window);
        Self {
            config,
            state: SessionState::Offline,
            store,
            predict,
            sync,
            time_sync: TimeSync::new(),
            callbacks: SessionCallbacks::default(),
            actions: ActionRegistry::new(),
            transport: None,
            local_client: "local-1".to_string(),
            room_creator: false,
            current_input: ActionMap::new(),
            server_start_ms: 0,
            last_update_ms: None,
            accumulator_ms: 0,
            last_relay_frame: 0,
            buffered_ticks: Vec::new(),
            pending_snapshots: Vec::new(),
            awaiting_snapshot_deadline: None,
            drift_probe_outstanding: false,
            transport_failures: 0,
            room_created: false,
            last_hash_uplink: 0,
            exit: None,
        }
    }

    // ------------------------------------------------------------------
    // Registration (before start)
    // ------------------------------------------------------------------

    pub fn define_component(
        &mut self,
        name: &str,
        fields: Vec<FieldDef>,
    ) -> Result<(), EngineError> {
        self.require_offline("define_component")?;
        self.store.register_component(ComponentDef::new(name, fields))?;
        Ok(())
    }

    pub fn define_entity(&mut self, name: &str) -> EntityTypeBuilder<'_, T> {
        EntityTypeBuilder {
            session: self,
            name: name.to_string(),
            components: Vec::new(),
            overrides: Vec::new(),
            sync_none: false,
        }
    }

    pub fn define_action(&mut self, name: &str) -> ActionId {
        self.actions.register(name)
    }

    pub fn action_id(&self, name: &str) -> Option<ActionId> {
        self.actions.id(name)
    }

    pub fn add_system(&mut self, phase: Phase, name: &str, system: SystemFn) {
        self.store.add_system(phase, name, system);
    }

    /// Attaches an external collaborator; must run before `start`.
    pub fn add_plugin(&mut self, plugin: &mut dyn Plugin<T>) -> Result<&mut Self, EngineError> {
        self.require_offline("add_plugin")?;
        plugin.install(self)?;
        Ok(self)
    }

    /// Stores callbacks without executing anything.
    pub fn init(&mut self, callbacks: SessionCallbacks) -> &mut Self {
        self.callbacks = callbacks;
        self
    }

    fn require_offline(&self, operation: &str) -> Result<(), EngineError> {
        if self.state != SessionState::Offline {
            return Err(ProgrammerError::InvalidSessionState {
                operation: operation.to_string(),
                state: self.state.name().to_string(),
            }
            .into());
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Enters LOCAL mode: the tick loop runs against the local clock, the
    /// local client's inputs are confirmed immediately and prediction is
    /// off.
    pub fn start(&mut self) -> Result<(), EngineError> {
        self.require_offline("start")?;
        self.state = SessionState::Local;
        self.predict
            .history_mut()
            .set_local_client(&self.local_client.clone());
        if let Some(cb) = &mut self.callbacks.on_room_create {
            cb(&mut self.store);
        }
        self.room_created = true;
        if let Some(cb) = &mut self.callbacks.on_connect {
            cb(&mut self.store, &self.local_client.clone());
        }
        info!("session started locally as {}", self.local_client);
        Ok(())
    }

    /// Hands the session a connected transport and waits for the relay's
    /// welcome. The local state is kept for the room creator and replaced
    /// by the authority snapshot for a late joiner.
    pub fn connect(&mut self, transport: T) -> Result<(), EngineError> {
        match self.state {
            SessionState::Local | SessionState::Offline => {}
            _ => {
                return Err(ProgrammerError::InvalidSessionState {
                    operation: "connect".to_string(),
                    state: self.state.name().to_string(),
                }
                .into())
            }
        }
        self.transport = Some(transport);
        self.state = SessionState::Connecting;
        Ok(())
    }

    /// Halts at the frame boundary: announces the leave, drains the inbox
    /// without applying, closes the transport.
    pub fn stop(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            let _ = transport.send(ParticipantMessage::Input {
                client: self.local_client.clone(),
                data: InputData::Lifecycle(LifecycleKind::Leave),
            });
            let _ = transport.poll();
            transport.close();
        }
        self.state = SessionState::Stopped;
        self.exit.get_or_insert(ExitReason::Clean);
        info!("session stopped: {:?}", self.exit);
    }

    // ------------------------------------------------------------------
    // Per-frame input
    // ------------------------------------------------------------------

    /// Collects one local action value; everything queued since the last
    /// tick goes out with the next frame.
    pub fn queue_input(&mut self, action: ActionId, value: ActionValue) {
        self.current_input.set(action, value);
    }

    /// Runs the render phase. Driven by the host's display loop on its own
    /// cadence; render systems may read freely but must not mutate
    /// simulation-relevant state.
    pub fn render(&mut self) -> Result<(), EngineError> {
        self.store.run_render()
    }

    // ------------------------------------------------------------------
    // Probes
    // ------------------------------------------------------------------

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.exit
    }

    pub fn client_id(&self) -> &str {
        &self.local_client
    }

    pub fn frame(&self) -> Frame {
        self.store.frame()
    }

    /// Simulated time in milliseconds: frame × tick interval.
    pub fn time_ms(&self) -> i64 {
        self.store.frame() as i64 * self.config.tick_interval_ms()
    }

    pub fn state_hash(&self) -> u32 {
        self.store.state_hash()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    pub fn sync_stats(&self) -> SyncStats {
        self.sync.stats()
    }

    pub fn sync_percent(&self) -> f64 {
        self.sync.sync_percent()
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync.state()
    }

    pub fn rollback_stats(&self) -> RollbackStats {
        self.predict.stats()
    }

    pub fn prediction_depth(&self) -> u32 {
        self.predict.prediction_depth()
    }

    pub fn last_desync_report(&self) -> Option<&DesyncReport> {
        self.sync.last_report()
    }

    pub fn active_clients(&self) -> &BTreeSet<ClientId> {
        self.predict.history().active_clients()
    }

    /// Whether this participant is the deterministic authority: the
    /// lexicographically lowest active client id.
    pub fn is_authority(&self) -> bool {
        match self.state {
            SessionState::Local => true,
            _ => {
                StateSync::authority(self.predict.history().active_clients())
                    .is_some_and(|id| *id == self.local_client)
            }
        }
    }

    // ------------------------------------------------------------------
    // Main pump
    // ------------------------------------------------------------------

    /// Advances the session against the host wall clock. Call once per
    /// host loop iteration.
    pub fn update(&mut self, now_ms: i64) -> Result<(), EngineError> {
        match self.state {
            SessionState::Offline | SessionState::Stopped => Ok(()),
            SessionState::Local => self.local_update(now_ms),
            SessionState::Connecting | SessionState::Connected => self.online_update(now_ms),
        }
    }

    fn local_update(&mut self, now_ms: i64) -> Result<(), EngineError> {
        let interval = self.config.tick_interval_ms();
        let last = self.last_update_ms.replace(now_ms);
        let Some(last) = last else {
            return Ok(());
        };
        self.accumulator_ms += (now_ms - last).max(0).min(interval * 8);

        let mut ticks = 0;
        while self.accumulator_ms >= interval && ticks < self.config.catchup_max_ticks {
            self.accumulator_ms -= interval;
            self.local_tick()?;
            ticks += 1;
        }
        Ok(())
    }

    fn local_tick(&mut self) -> Result<(), EngineError> {
        let frame = self.store.frame() + 1;
        let input = std::mem::take(&mut self.current_input);
        let local = self.local_client.clone();
        self.predict.history_mut().store_local(frame, &local, input);
        let inputs = self.predict.history().frame_inputs(frame);

        // A failed tick aborts the frame: with prediction (and its
        // snapshot ring) off in local mode, the pre-tick state is held
        // here and restored before the error surfaces.
        let pre_tick = self.store.snapshot(true);
        if let Err(err) = self.store.tick(frame, inputs) {
            self.store.load_snapshot(&pre_tick)?;
            return Err(err);
        }
        if let Some(cb) = &mut self.callbacks.on_tick {
            cb(&mut self.store, frame);
        }
        Ok(())
    }

    fn online_update(&mut self, now_ms: i64) -> Result<(), EngineError> {
        self.last_update_ms = Some(now_ms);

        let messages = match self.transport_poll() {
            Ok(messages) => messages,
            Err(err) => {
                self.handle_transport_error(err);
                return Ok(());
            }
        };
        for msg in messages {
            self.handle_message(msg, now_ms)?;
            if self.state == SessionState::Stopped {
                return Ok(());
            }
        }

        if self.state == SessionState::Connecting {
            self.poll_snapshot_deadline(now_ms);
            return Ok(());
        }

        // Resync babysitting.
        if self.sync.resync_timed_out(now_ms) {
            warn!("resync timed out, re-requesting snapshot");
            self.request_resync(now_ms);
        }

        self.serve_pending_snapshots();
        self.run_online_ticks(now_ms)?;
        self.uplink_confirmed_hashes();
        self.predict.trim();
        Ok(())
    }

    /// Sends `{frame, hash}` for every newly confirmed frame. Rollbacks
    /// always target frames above the confirmed tail, so these digests
    /// never need correcting after the fact.
    fn uplink_confirmed_hashes(&mut self) {
        let upto = self
            .predict
            .confirmed_frame()
            .min(self.predict.local_frame());
        while self.last_hash_uplink < upto {
            let frame = self.last_hash_uplink + 1;
            self.last_hash_uplink = frame;
            let Some(hash) = self.sync.local_hash(frame) else {
                continue;
            };
            if let Err(err) = self.transport_send(ParticipantMessage::Hash { frame, hash }) {
                self.handle_transport_error(err);
                return;
            }
        }
    }

    fn run_online_ticks(&mut self, now_ms: i64) -> Result<(), EngineError> {
        let base = if self.time_sync.is_synced() {
            self.time_sync
                .target_frame(now_ms, self.server_start_ms, self.config.tick_interval_ms())
        } else {
            self.last_relay_frame
        };
        // The relay stamps an input with the frame after its arrival, so a
        // participant runs `input_delay` frames behind the relay clock;
        // that way its own input lands exactly on the frame it confirmed
        // locally.
        let target = base
            .saturating_sub(self.config.input_delay_frames)
            .min(self.predict.confirmed_frame() + self.config.max_prediction_frames);

        let mut ticks = 0;
        while self.predict.local_frame() < target && ticks < self.config.catchup_max_ticks {
            if !self.online_tick()? {
                break;
            }
            ticks += 1;
        }
        Ok(())
    }

    fn online_tick(&mut self) -> Result<bool, EngineError> {
        let input = std::mem::take(&mut self.current_input);

        if let Err(err) = self.transport_send(ParticipantMessage::Input {
            client: self.local_client.clone(),
            data: InputData::Actions(input.clone()),
        }) {
            self.handle_transport_error(err);
            return Ok(false);
        }
        self.predict.queue_local_input(&self.local_client.clone(), input);

        let mut hooks = SessionHooks {
            callbacks: &mut self.callbacks,
            sync: &mut self.sync,
        };
        let advanced = self.predict.advance_frame(&mut self.store, &mut hooks)?;
        if !advanced {
            return Ok(false);
        }

        let frame = self.predict.local_frame();
        let hash = self.store.state_hash();
        self.sync.record_local_hash(frame, hash);
        if let Some(cb) = &mut self.callbacks.on_tick {
            cb(&mut self.store, frame);
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Message handling
    // ------------------------------------------------------------------

    fn handle_message(&mut self, msg: RelayMessage, now_ms: i64) -> Result<(), EngineError> {
        match msg {
            RelayMessage::Welcome {
                client_id,
                is_first,
                server_start_ms,
                tick_interval_ms: _,
                ..
            } => {
                info!("welcomed as {client_id} (room creator: {is_first})");
                self.local_client = client_id.clone();
                self.room_creator = is_first;
                self.server_start_ms = server_start_ms;
                self.predict.history_mut().reset();
                self.predict.history_mut().set_local_client(&client_id);

                if is_first && !self.room_created {
                    if let Some(cb) = &mut self.callbacks.on_room_create {
                        cb(&mut self.store);
                    }
                    self.room_created = true;
                }

                let join = ParticipantMessage::Input {
                    client: client_id,
                    data: InputData::Lifecycle(LifecycleKind::Join),
                };
                if let Err(err) = self.transport_send(join) {
                    self.handle_transport_error(err);
                    return Ok(());
                }
                let probe = ParticipantMessage::TimeSyncRequest {
                    sent_local_ms: now_ms,
                };
                if let Err(err) = self.transport_send(probe) {
                    self.handle_transport_error(err);
                }
                Ok(())
            }
            RelayMessage::Tick {
                frame,
                inputs,
                majority_frame,
                majority_hash,
                ..
            } => {
                self.time_sync
                    .observe_tick_arrival(now_ms, self.config.tick_interval_ms());
                self.last_relay_frame = frame;
                let inputs: Vec<(ClientId, InputData)> = inputs
                    .into_iter()
                    .map(|InputRecord { client, data, .. }| (client, data))
                    .collect();

                if self.state == SessionState::Connecting {
                    if self.room_creator {
                        // First tick completes the creator's connection.
                        self.state = SessionState::Connected;
                        self.predict.initialize(self.store.frame());
                        self.predict.set_enabled(true);
                        info!("room creator connected at frame {}", self.store.frame());
                    } else {
                        self.buffered_ticks.push(BufferedTick {
                            frame,
                            inputs,
                            majority_frame,
                            majority_hash,
                        });
                        return Ok(());
                    }
                }

                self.process_tick(frame, inputs, majority_frame, majority_hash, now_ms)
            }
            RelayMessage::SnapshotRequested { from } => {
                info!("{from} requested a resync snapshot");
                // Any confirmed state serves for recovery; the requester
                // replays relayed ticks past the snapshot frame itself.
                self.pending_snapshots.push((from, 0));
                Ok(())
            }
            RelayMessage::Snapshot {
                bytes,
                hash,
                post_tick,
            } => self.apply_snapshot(&bytes, hash, post_tick, now_ms),
            RelayMessage::TimeSyncReply {
                sent_local_ms,
                server_time_ms,
            } => {
                self.time_sync
                    .add_sample(sent_local_ms, server_time_ms, now_ms);
                if self.time_sync.needs_more_samples() {
                    let probe = ParticipantMessage::TimeSyncRequest {
                        sent_local_ms: now_ms,
                    };
                    if let Err(err) = self.transport_send(probe) {
                        self.handle_transport_error(err);
                    }
                }
                Ok(())
            }
        }
    }

    fn process_tick(
        &mut self,
        frame: Frame,
        inputs: Vec<(ClientId, InputData)>,
        majority_frame: Frame,
        majority_hash: Option<u32>,
        now_ms: i64,
    ) -> Result<(), EngineError> {
        // Authority duty: a join in the ordered stream means someone needs
        // a snapshot covering that frame.
        for (client, data) in &inputs {
            if matches!(data, InputData::Lifecycle(LifecycleKind::Join))
                && *client != self.local_client
            {
                self.pending_snapshots.push((client.clone(), frame));
            }
        }

        let mut hooks = SessionHooks {
            callbacks: &mut self.callbacks,
            sync: &mut self.sync,
        };
        match self
            .predict
            .receive_server_tick(&mut self.store, &mut hooks, frame, &inputs)
        {
            Ok(_rolled_back) => {}
            Err(EngineError::Resource(ResourceError::RollbackTooDeep { target, .. })) => {
                // Too far gone for rollback: fall back to a full resync.
                error!("rollback to frame {target} unrecoverable, requesting resync");
                self.request_resync(now_ms);
            }
            Err(err) => return Err(err),
        }

        if let Some(majority) = majority_hash {
            let verdict =
                self.sync
                    .on_majority_hash(majority_frame, majority, self.predict.confirmed_frame());
            match verdict {
                SyncVerdict::InSync => {
                    self.drift_probe_outstanding = false;
                }
                SyncVerdict::Drifted => {
                    // Fetch the authority's state once per drift so the
                    // divergence magnitude can escalate without waiting for
                    // the mismatch run.
                    if !self.drift_probe_outstanding {
                        let msg = ParticipantMessage::SnapshotRequest {
                            client: self.local_client.clone(),
                        };
                        if let Err(err) = self.transport_send(msg) {
                            self.handle_transport_error(err);
                        } else {
                            self.drift_probe_outstanding = true;
                        }
                    }
                }
                SyncVerdict::NeedsResync => {
                    self.drift_probe_outstanding = false;
                    self.sync.attach_diagnostics(
                        None,
                        self.predict.history().recent_inputs(RECENT_INPUTS_IN_REPORT),
                    );
                    self.request_resync(now_ms);
                }
            }
        }
        Ok(())
    }

    fn request_resync(&mut self, now_ms: i64) {
        let msg = ParticipantMessage::SnapshotRequest {
            client: self.local_client.clone(),
        };
        if let Err(err) = self.transport_send(msg) {
            self.handle_transport_error(err);
            return;
        }
        self.sync.begin_resync(now_ms, self.config.resync_timeout_ms);
    }

    /// Whether this participant is the one that must answer `requester`'s
    /// snapshot need: the lowest-sorted active client other than the
    /// requester itself (a participant still loading cannot serve).
    fn serves_for(&self, requester: &str) -> bool {
        self.predict
            .history()
            .active_clients()
            .iter()
            .find(|c| c.as_str() != requester)
            .is_some_and(|id| *id == self.local_client)
    }

    /// Serves queued snapshot requests once the covering frame is both
    /// simulated and confirmed. Only the responsible authority responds.
    fn serve_pending_snapshots(&mut self) {
        if self.pending_snapshots.is_empty() {
            return;
        }
        // The newest frame that is simulated AND fully confirmed; nothing
        // speculative may leave this participant.
        let serve_frame = self
            .predict
            .confirmed_frame()
            .min(self.predict.local_frame());
        let pending = std::mem::take(&mut self.pending_snapshots);
        for (client, at_frame) in pending {
            if !self.serves_for(&client) {
                continue;
            }
            if serve_frame < at_frame {
                self.pending_snapshots.push((client, at_frame));
                continue;
            }
            let Some(snap) = self.confirmed_snapshot(serve_frame) else {
                self.pending_snapshots.push((client, at_frame));
                continue;
            };
            let bytes = snapshot::encode(&snap, self.store.component_defs());
            let hash =
                snapshot::hash_snapshot(&snap, self.store.component_defs(), self.store.type_defs());
            info!(
                "serving snapshot at frame {} ({} entities) to {client}",
                snap.frame,
                snap.entity_count()
            );
            let msg = ParticipantMessage::SnapshotResponse {
                to: client,
                bytes,
                hash,
                post_tick: true,
            };
            if let Err(err) = self.transport_send(msg) {
                self.handle_transport_error(err);
                return;
            }
        }
    }

    /// The canonical state at the confirmed frame: the prediction ring's
    /// snapshot, or the live store when nothing speculative is in flight.
    fn confirmed_snapshot(&mut self, confirmed: Frame) -> Option<crate::store::WorldSnapshot> {
        if let Some(snap) = self.predict.snapshot_at(confirmed) {
            return Some(snap.clone());
        }
        if self.predict.local_frame() == confirmed {
            return Some(self.store.snapshot(true));
        }
        None
    }

    fn apply_snapshot(
        &mut self,
        bytes: &[u8],
        expected_hash: u32,
        post_tick: bool,
        now_ms: i64,
    ) -> Result<(), EngineError> {
        let snap = match snapshot::decode(bytes, self.store.component_defs()) {
            Ok(snap) => snap,
            Err(ProtocolError::VersionMismatch { expected, found }) => {
                error!("snapshot version mismatch: expected {expected}, got {found}");
                self.exit = Some(ExitReason::ProtocolMismatch);
                self.stop();
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        self.drift_probe_outstanding = false;

        // While merely drifting, this snapshot is a probe: measure the
        // divergence before deciding to adopt it. A large enough field-level
        // mismatch escalates straight to desync and the probe doubles as
        // the recovery snapshot; a small one is discarded and the
        // consecutive-mismatch counter stays in charge.
        if self.sync.state() == SyncState::Drift {
            let local = self.store.snapshot(true);
            let diff = diff_snapshots(
                &local,
                &snap,
                self.store.component_defs(),
                self.store.type_defs(),
            );
            if !self.sync.escalate_on_magnitude(snap.frame, &diff) {
                return Ok(());
            }
            self.sync.attach_diagnostics(
                None,
                self.predict.history().recent_inputs(RECENT_INPUTS_IN_REPORT),
            );
            self.sync
                .begin_resync(now_ms, self.config.resync_timeout_ms);
        } else if self.state == SessionState::Connected
            && self.sync.state() == SyncState::Active
            && self.sync.last_report().is_none()
        {
            // A probe that outlived its drift; the mismatch resolved on
            // its own and there is nothing to recover from.
            return Ok(());
        } else if self.sync.last_report().is_some() {
            // Diagnostics before the local state is replaced.
            let local = self.store.snapshot(true);
            let diff = diff_snapshots(
                &local,
                &snap,
                self.store.component_defs(),
                self.store.type_defs(),
            );
            self.sync.attach_diagnostics(
                Some(diff),
                self.predict.history().recent_inputs(RECENT_INPUTS_IN_REPORT),
            );
        }

        self.store.load_snapshot(&snap)?;
        let found = self.store.state_hash();
        if found != expected_hash {
            error!(
                "snapshot hash mismatch after load: expected {expected_hash:#010x}, got {found:#010x}"
            );
            // The authority is the source of truth; ask again.
            self.request_resync(now_ms);
            return Ok(());
        }

        let resume = if post_tick {
            snap.frame
        } else {
            snap.frame.saturating_sub(1)
        };
        self.predict.initialize(resume);
        self.predict.set_enabled(true);

        // Re-derive the active set from client-bearing entities; the
        // loaded world is now the single source of truth.
        let clients = self.store.entity_clients();
        self.predict.history_mut().set_active_clients(clients);

        self.sync.on_snapshot_applied(resume);
        self.sync.record_local_hash(self.store.frame(), found);
        self.last_hash_uplink = self.last_hash_uplink.max(resume);
        self.awaiting_snapshot_deadline = None;

        info!(
            "snapshot applied at frame {} ({} entities), resuming at {}",
            snap.frame,
            snap.entity_count(),
            resume + 1
        );

        if self.state == SessionState::Connecting {
            self.state = SessionState::Connected;
        }

        // Replay relayed ticks the snapshot does not already cover.
        let buffered = std::mem::take(&mut self.buffered_ticks);
        for tick in buffered {
            if tick.frame > resume {
                self.process_tick(
                    tick.frame,
                    tick.inputs,
                    tick.majority_frame,
                    tick.majority_hash,
                    now_ms,
                )?;
            }
        }
        Ok(())
    }

    /// Re-requests the initial snapshot when the authority has not served
    /// one in time.
    fn poll_snapshot_deadline(&mut self, now_ms: i64) {
        if self.room_creator || self.transport.is_none() {
            return;
        }
        match self.awaiting_snapshot_deadline {
            None => {
                self.awaiting_snapshot_deadline = Some(now_ms + self.config.resync_timeout_ms);
            }
            Some(deadline) if now_ms >= deadline => {
                warn!("no snapshot from authority yet, requesting explicitly");
                let msg = ParticipantMessage::SnapshotRequest {
                    client: self.local_client.clone(),
                };
                if let Err(err) = self.transport_send(msg) {
                    self.handle_transport_error(err);
                }
                self.awaiting_snapshot_deadline = Some(now_ms + self.config.resync_timeout_ms);
            }
            Some(_) => {}
        }
    }

    // ------------------------------------------------------------------
    // Transport plumbing
    // ------------------------------------------------------------------

    fn transport_send(&mut self, msg: ParticipantMessage) -> Result<(), EngineError> {
        match &mut self.transport {
            Some(transport) => transport.send(msg),
            None => Err(TransportError::Closed.into()),
        }
    }

    fn transport_poll(&mut self) -> Result<Vec<RelayMessage>, EngineError> {
        match &mut self.transport {
            Some(transport) => transport.poll(),
            None => Err(TransportError::Closed.into()),
        }
    }

    /// Transient failures retry up to the configured cap; protocol
    /// mismatches stop the session with the matching exit code.
    fn handle_transport_error(&mut self, err: EngineError) {
        match err {
            EngineError::Protocol(ProtocolError::VersionMismatch { expected, found }) => {
                error!("protocol version mismatch: expected {expected}, got {found}");
                self.exit = Some(ExitReason::ProtocolMismatch);
                self.stop();
            }
            err => {
                self.transport_failures += 1;
                warn!(
                    "transport failure {}/{}: {err}",
                    self.transport_failures, self.config.transport_retry_limit
                );
                if self.transport_failures > self.config.transport_retry_limit {
                    self.exit = Some(ExitReason::TransportClosed);
                    self.stop();
                }
            }
        }
    }
}

/// Builder for entity-type registration:
/// `session.define_entity("cell").with("transform").register()`.
pub struct EntityTypeBuilder<'a, T: Transport> {
    session: &'a mut Session<T>,
    name: String,
    components: Vec<String>,
    overrides: Vec<(String, String, FieldValue)>,
    sync_none: bool,
}

impl<T: Transport> EntityTypeBuilder<'_, T> {
    pub fn with(mut self, component: &str) -> Self {
        self.components.push(component.to_string());
        self
    }

    /// Adds a component with per-type default overrides.
    pub fn with_defaults(mut self, component: &str, defaults: &[(&str, FieldValue)]) -> Self {
        self.components.push(component.to_string());
        for (field, value) in defaults {
            self.overrides
                .push((component.to_string(), field.to_string(), *value));
        }
        self
    }

    /// Marks the type client-local: excluded from snapshots and the state
    /// hash.
    pub fn sync_none(mut self) -> Self {
        self.sync_none = true;
        self
    }

    pub fn register(self) -> Result<(), EngineError> {
        self.session.require_offline("define_entity")?;
        let store = &mut self.session.store;
        let mut components = Vec::with_capacity(self.components.len());
        for name in &self.components {
            components.push(store.component_idx(name)?);
        }
        let mut overrides = Vec::with_capacity(self.overrides.len());
        for (comp_name, field_name, value) in &self.overrides {
            let ci = store.component_idx(comp_name)?;
            let fi = store.component_defs()[ci as usize]
                .field_index(field_name)
                .ok_or_else(|| ProgrammerError::UnknownField {
                    component: comp_name.clone(),
                    field: field_name.clone(),
                })?;
            overrides.push((ci, fi, *value));
        }
        store.register_entity_type(EntityTypeDef {
            name: self.name,
            components,
            overrides,
            sync_none: self.sync_none,
        })?;
        Ok(())
    }
}
