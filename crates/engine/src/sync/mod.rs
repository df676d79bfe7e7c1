pub mod diff;
pub mod engine;

pub use diff::{diff_snapshots, EntityDiff, FieldDiff, SnapshotDiff};
pub use engine::{
    DesyncReport, StateSync, SyncState, SyncStats, SyncVerdict, DESYNC_MAGNITUDE_THRESHOLD,
    DESYNC_MISMATCH_RUN,
};
