//! Session configuration.

use serde::{Deserialize, Serialize};

use crate::input::PredictionStrategy;
use crate::store::DEFAULT_MAX_ENTITIES;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Simulation ticks per second.
    pub tick_rate: u32,
    /// How far the local loop may run ahead of confirmation.
    pub max_prediction_frames: u32,
    /// Local inputs are scheduled this many frames ahead so remote
    /// participants receive them in time.
    pub input_delay_frames: u32,
    pub prediction_strategy: PredictionStrategy,
    /// Rolling window for the sync pass-percentage.
    pub hash_window: usize,
    pub snapshot_ring_capacity: usize,
    /// Rounded up to a power of two, minimum 64.
    pub input_history_capacity: usize,
    /// Component column capacity; allocated once at registration.
    pub max_entities: usize,
    /// Upper bound on catchup ticks executed in one scheduler quantum.
    pub catchup_max_ticks: u32,
    /// How long to wait for an authority snapshot before re-requesting.
    pub resync_timeout_ms: i64,
    /// Transient transport failures tolerated before giving up.
    pub transport_retry_limit: u32,
    /// Seed for the deterministic RNG; part of the snapshot thereafter.
    pub seed: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_rate: 20,
            max_prediction_frames: 15,
            input_delay_frames: 2,
            prediction_strategy: PredictionStrategy::RepeatLast,
            hash_window: 120,
            snapshot_ring_capacity: 32,
            input_history_capacity: 128,
            max_entities: DEFAULT_MAX_ENTITIES,
            catchup_max_ticks: 4,
            resync_timeout_ms: 2000,
            transport_retry_limit: 8,
            seed: 1,
        }
    }
}

impl SessionConfig {
    pub fn tick_interval_ms(&self) -> i64 {
        (1000 / self.tick_rate.max(1)) as i64
    }
}
