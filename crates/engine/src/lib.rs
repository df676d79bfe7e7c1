//! Deterministic lockstep simulation core.
//!
//! Independent participants agree on shared world state while exchanging
//! only player inputs and small verification digests. The pieces:
//!
//! - [`math`] — Q16.16 fixed point, table trigonometry and a seeded PRNG,
//!   so simulation is bit-identical across hosts.
//! - [`store`] — the entity store: columnar components, deterministic id
//!   allocation, queries, snapshots and the 32-bit state hash.
//! - [`input`] — action schemas and the confirmed/predicted input history.
//! - [`predict`] — speculative ticks, rollback and resimulation, clock
//!   skew estimation.
//! - [`sync`] — per-tick hash consensus, desync detection and
//!   snapshot-based recovery.
//! - [`net`] — the relay protocol and an in-process relay for tests and
//!   demos.
//! - [`session`] — the participant-facing orchestrator.

pub mod error;
pub mod hash;
pub mod input;
pub mod math;
pub mod net;
pub mod predict;
pub mod session;
pub mod store;
pub mod sync;

pub use error::{
    DeterminismError, EngineError, ProgrammerError, ProtocolError, ResourceError, TransportError,
};
pub use input::{
    ActionId, ActionMap, ActionValue, InputData, InputHistory, LifecycleKind, PredictionStrategy,
};
pub use math::{fixed, DeterministicRng, Fixed};
pub use net::{LocalRelay, LocalTransport, ParticipantMessage, RelayMessage, Transport};
pub use predict::{PredictionManager, RollbackStats, TimeSync};
pub use session::{ExitReason, Plugin, Session, SessionCallbacks, SessionConfig, SessionState};
pub use store::{
    ComponentDef, EntityId, EntityTypeDef, FieldDef, FieldRef, FieldValue, Phase, ScalarType,
    Store, WorldSnapshot,
};
pub use sync::{DesyncReport, SnapshotDiff, SyncState, SyncStats};
