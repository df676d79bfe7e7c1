pub mod manager;
pub mod snapshots;
pub mod time_sync;

pub use manager::{LifecycleEvent, PredictionHooks, PredictionManager, RollbackStats};
pub use snapshots::SnapshotRing;
pub use time_sync::TimeSync;
