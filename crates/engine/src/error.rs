use thiserror::Error;

/// Top-level error for the engine. Every module error converts into one of
/// the five kinds below; the kind decides the propagation policy.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("determinism violation: {0}")]
    Determinism(#[from] DeterminismError),
    #[error("resource exhausted: {0}")]
    Resource(#[from] ResourceError),
    #[error("programmer error: {0}")]
    Programmer(#[from] ProgrammerError),
    #[error("transport: {0}")]
    Transient(#[from] TransportError),
}

/// Bad framing or an incompatible wire version.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("protocol version mismatch: expected {expected}, got {found}")]
    VersionMismatch { expected: u8, found: u8 },
    #[error("truncated payload: needed {needed} bytes, had {available}")]
    Truncated { needed: usize, available: usize },
    #[error("envelope codec failure: {0}")]
    Codec(String),
    #[error("snapshot references unknown type index {type_idx}")]
    UnknownTypeIndex { type_idx: u16 },
}

/// Divergence the engine can detect locally. Never recovered in place; the
/// authority snapshot is the source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeterminismError {
    #[error("state hash after snapshot load was {found:#010x}, authority reported {expected:#010x}")]
    HashMismatchAfterLoad { expected: u32, found: u32 },
    #[error("tick aborted at frame {frame}, store rolled back")]
    TickAborted { frame: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("entity id space exhausted ({max} live indices)")]
    EntityIdSpaceFull { max: u32 },
    #[error("entity capacity exhausted ({max} slots)")]
    EntityCapacityFull { max: usize },
    #[error("rollback to frame {target} is older than oldest stored snapshot {oldest:?}")]
    RollbackTooDeep { target: u32, oldest: Option<u32> },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProgrammerError {
    #[error("component `{name}` is not registered")]
    UnknownComponent { name: String },
    #[error("entity type `{name}` is not registered")]
    UnknownEntityType { name: String },
    #[error("component `{name}` registered twice")]
    DuplicateComponent { name: String },
    #[error("entity type `{name}` registered twice")]
    DuplicateEntityType { name: String },
    #[error("no field `{field}` on component `{component}`")]
    UnknownField { component: String, field: String },
    #[error("field `{field}` on `{component}` holds {expected:?}, got {found:?}")]
    FieldTypeMismatch {
        component: String,
        field: String,
        expected: crate::store::ScalarType,
        found: crate::store::ScalarType,
    },
    #[error("entity {id:#010x} is stale or destroyed")]
    StaleEntity { id: u32 },
    #[error("entity {id:#010x} has no component `{component}`")]
    MissingComponent { id: u32, component: String },
    #[error("game input for client `{client}` which never joined")]
    UnknownClient { client: String },
    #[error("`{operation}` is not valid while the session is {state}")]
    InvalidSessionState { operation: String, state: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport closed by peer")]
    Closed,
    #[error("send failed: {0}")]
    Send(String),
}
