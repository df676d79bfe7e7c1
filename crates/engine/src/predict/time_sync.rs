//! Clock-skew estimation against the relay.
//!
//! Each probe carries (sent_local, server_time, received_local). Assuming a
//! symmetric round trip, one-way latency is half the round trip and the
//! skew is `server_time - received_local + latency`. Early samples are
//! noisy, so after enough arrive the reported skew is the mean of the
//! lowest-latency samples with the slowest quartile discarded.
//!
//! All clock arithmetic is integer milliseconds; the tick-rate multiplier
//! feeds loop pacing only and never touches simulation state.

use crate::store::world::Frame;

const MAX_SAMPLES: usize = 32;
const FILTER_MIN_SAMPLES: usize = 5;
const WARMUP_SAMPLES: usize = 8;
const RATE_MIN: f64 = 0.95;
const RATE_MAX: f64 = 1.05;

#[derive(Debug, Clone, Copy)]
struct SkewSample {
    latency_ms: i64,
    delta_ms: i64,
}

#[derive(Debug, Default)]
pub struct TimeSync {
    samples: Vec<SkewSample>,
    synced: bool,
    delta_ms: i64,
    last_tick_arrival_ms: Option<i64>,
    rate_multiplier: f64,
}

impl TimeSync {
    pub fn new() -> Self {
        Self {
            samples: Vec::with_capacity(MAX_SAMPLES),
            synced: false,
            delta_ms: 0,
            last_tick_arrival_ms: None,
            rate_multiplier: 1.0,
        }
    }

    /// Folds in one probe response. The first sample is adopted verbatim
    /// and marks the estimator synced.
    pub fn add_sample(&mut self, sent_local_ms: i64, server_time_ms: i64, received_local_ms: i64) {
        let latency_ms = (received_local_ms - sent_local_ms) / 2;
        let delta_ms = server_time_ms - received_local_ms + latency_ms;

        if self.samples.len() == MAX_SAMPLES {
            self.samples.remove(0);
        }
        self.samples.push(SkewSample {
            latency_ms,
            delta_ms,
        });

        if !self.synced {
            self.synced = true;
            self.delta_ms = delta_ms;
            return;
        }

        if self.samples.len() >= FILTER_MIN_SAMPLES {
            let mut by_latency = self.samples.clone();
            by_latency.sort_by_key(|s| s.latency_ms);
            let keep = by_latency.len() - by_latency.len() / 4;
            let sum: i64 = by_latency[..keep].iter().map(|s| s.delta_ms).sum();
            self.delta_ms = sum / keep as i64;
        } else {
            self.delta_ms = delta_ms;
        }
    }

    /// True until the warmup batch of probes has arrived.
    pub fn needs_more_samples(&self) -> bool {
        self.samples.len() < WARMUP_SAMPLES
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Estimated server clock minus local clock, in milliseconds.
    pub fn delta_ms(&self) -> i64 {
        self.delta_ms
    }

    /// The server clock mapped onto a local reading.
    pub fn server_now_ms(&self, local_now_ms: i64) -> i64 {
        local_now_ms + self.delta_ms
    }

    /// Observes a tick envelope arrival and nudges the tick-rate
    /// multiplier toward the relay's cadence, hard-clamped to ±5 %.
    pub fn observe_tick_arrival(&mut self, arrival_local_ms: i64, nominal_interval_ms: i64) {
        if let Some(last) = self.last_tick_arrival_ms {
            let observed = arrival_local_ms - last;
            if observed > 0 && nominal_interval_ms > 0 {
                self.rate_multiplier =
                    (nominal_interval_ms as f64 / observed as f64).clamp(RATE_MIN, RATE_MAX);
            }
        }
        self.last_tick_arrival_ms = Some(arrival_local_ms);
    }

    /// Multiplier in [0.95, 1.05] the host loop applies to its tick rate.
    pub fn rate_multiplier(&self) -> f64 {
        self.rate_multiplier
    }

    /// The frame the relay's clock says we should be simulating.
    pub fn target_frame(
        &self,
        local_now_ms: i64,
        server_start_ms: i64,
        tick_interval_ms: i64,
    ) -> Frame {
        if tick_interval_ms <= 0 {
            return 0;
        }
        let elapsed = self.server_now_ms(local_now_ms) - server_start_ms;
        if elapsed <= 0 {
            return 0;
        }
        (elapsed / tick_interval_ms) as Frame
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}
