//! Hash-based state consensus.
//!
//! Every tick the local store digest is recorded and uplinked; the relay
//! folds all participants' digests and reports the majority back. A single
//! mismatch is drift; a run of mismatches over confirmed frames (or a
//! large enough snapshot divergence) is a desync, recovered by loading a
//! full snapshot from the authority.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use log::{info, warn};

use crate::input::ActionMap;
use crate::store::world::{ClientId, Frame};

use super::diff::SnapshotDiff;

/// Consecutive confirmed-tail mismatches that escalate DRIFT to DESYNC.
pub const DESYNC_MISMATCH_RUN: u32 = 3;
/// Snapshot-diff magnitude that escalates immediately.
pub const DESYNC_MAGNITUDE_THRESHOLD: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Initial,
    Active,
    Drift,
    Desync,
    Resyncing,
}

/// What the caller must do after folding in a majority hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncVerdict {
    InSync,
    Drifted,
    NeedsResync,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SyncStats {
    pub checks: u64,
    pub mismatches: u64,
    pub drift_count: u64,
    pub resync_count: u64,
    /// Rolling pass percentage over the configured window.
    pub window_pass_pct: f64,
}

/// Produced on entering DESYNC; retained for inspection after recovery.
#[derive(Debug, Clone, PartialEq)]
pub struct DesyncReport {
    pub frame: Frame,
    pub local_hash: u32,
    pub majority_hash: u32,
    pub diff: Option<SnapshotDiff>,
    pub recent_inputs: Vec<(Frame, ClientId, ActionMap)>,
}

#[derive(Debug)]
pub struct StateSync {
    state: SyncState,
    window: VecDeque<bool>,
    window_cap: usize,
    mismatch_run: u32,
    local_hashes: BTreeMap<Frame, u32>,
    stats: SyncStats,
    last_report: Option<DesyncReport>,
    resync_deadline_ms: Option<i64>,
}

impl StateSync {
    pub fn new(window_cap: usize) -> Self {
        Self {
            state: SyncState::Initial,
            window: VecDeque::with_capacity(window_cap.max(1)),
            window_cap: window_cap.max(1),
            mismatch_run: 0,
            local_hashes: BTreeMap::new(),
            stats: SyncStats::default(),
            last_report: None,
            resync_deadline_ms: None,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    pub fn last_report(&self) -> Option<&DesyncReport> {
        self.last_report.as_ref()
    }

    /// Rolling pass percentage, 100.0 while no checks have landed.
    pub fn sync_percent(&self) -> f64 {
        if self.window.is_empty() {
            return 100.0;
        }
        let passes = self.window.iter().filter(|&&ok| ok).count();
        passes as f64 * 100.0 / self.window.len() as f64
    }

    /// Records the local digest for a frame, replacing any stale value.
    /// Also invoked from the rollback observer so resimulated frames
    /// re-report their corrected hashes.
    pub fn record_local_hash(&mut self, frame: Frame, hash: u32) {
        self.local_hashes.insert(frame, hash);
        // Bound the history to roughly two windows.
        while self.local_hashes.len() > self.window_cap * 2 {
            let oldest = *self.local_hashes.keys().next().expect("non-empty");
            self.local_hashes.remove(&oldest);
        }
    }

    pub fn local_hash(&self, frame: Frame) -> Option<u32> {
        self.local_hashes.get(&frame).copied()
    }

    /// Folds in the relayed majority digest for `frame`. `confirmed_frame`
    /// bounds the frames that may escalate to DESYNC: speculative frames
    /// mismatch routinely and only count as drift.
    pub fn on_majority_hash(
        &mut self,
        frame: Frame,
        majority: u32,
        confirmed_frame: Frame,
    ) -> SyncVerdict {
        let Some(local) = self.local_hash(frame) else {
            return SyncVerdict::InSync;
        };
        let matched = local == majority;

        self.stats.checks += 1;
        if self.window.len() == self.window_cap {
            self.window.pop_front();
        }
        self.window.push_back(matched);
        self.stats.window_pass_pct = self.sync_percent();

        if matched {
            self.mismatch_run = 0;
            match self.state {
                SyncState::Initial | SyncState::Drift => {
                    self.state = SyncState::Active;
                }
                SyncState::Resyncing => {
                    info!("resync complete at frame {frame}");
                    self.state = SyncState::Active;
                    self.resync_deadline_ms = None;
                }
                _ => {}
            }
            return SyncVerdict::InSync;
        }

        self.stats.mismatches += 1;
        if frame <= confirmed_frame {
            self.mismatch_run += 1;
        }

        match self.state {
            SyncState::Initial => SyncVerdict::InSync,
            SyncState::Active => {
                warn!(
                    "state hash drift at frame {frame}: local {local:#010x}, majority {majority:#010x}"
                );
                self.stats.drift_count += 1;
                self.state = SyncState::Drift;
                SyncVerdict::Drifted
            }
            SyncState::Drift => {
                if self.mismatch_run >= DESYNC_MISMATCH_RUN {
                    self.declare_desync(frame, local, majority);
                    SyncVerdict::NeedsResync
                } else {
                    SyncVerdict::Drifted
                }
            }
            SyncState::Desync => SyncVerdict::NeedsResync,
            SyncState::Resyncing => SyncVerdict::InSync,
        }
    }

    /// Escalates immediately when the snapshot diff shows a divergence too
    /// large to ride out.
    pub fn escalate_on_magnitude(&mut self, frame: Frame, diff: &SnapshotDiff) -> bool {
        if self.state == SyncState::Drift && diff.magnitude() > DESYNC_MAGNITUDE_THRESHOLD {
            let local = self.local_hash(frame).unwrap_or(0);
            self.declare_desync(frame, local, 0);
            if let Some(report) = &mut self.last_report {
                report.diff = Some(diff.clone());
            }
            true
        } else {
            false
        }
    }

    fn declare_desync(&mut self, frame: Frame, local: u32, majority: u32) {
        warn!("desync declared at frame {frame}");
        self.state = SyncState::Desync;
        self.last_report = Some(DesyncReport {
            frame,
            local_hash: local,
            majority_hash: majority,
            diff: None,
            recent_inputs: Vec::new(),
        });
    }

    /// Attaches diagnostics to the pending report.
    pub fn attach_diagnostics(
        &mut self,
        diff: Option<SnapshotDiff>,
        recent_inputs: Vec<(Frame, ClientId, ActionMap)>,
    ) {
        if let Some(report) = &mut self.last_report {
            if diff.is_some() {
                report.diff = diff;
            }
            report.recent_inputs = recent_inputs;
        }
    }

    /// Marks the out-of-band snapshot request as sent.
    pub fn begin_resync(&mut self, now_ms: i64, timeout_ms: i64) {
        self.state = SyncState::Resyncing;
        self.stats.resync_count += 1;
        self.mismatch_run = 0;
        self.resync_deadline_ms = Some(now_ms + timeout_ms);
    }

    /// True when the awaited snapshot did not arrive in time; the caller
    /// re-requests.
    pub fn resync_timed_out(&mut self, now_ms: i64) -> bool {
        match (self.state, self.resync_deadline_ms) {
            (SyncState::Resyncing, Some(deadline)) if now_ms >= deadline => {
                self.resync_deadline_ms = None;
                true
            }
            _ => false,
        }
    }

    /// The authority snapshot was applied; hash history before the resumed
    /// frame is stale.
    pub fn on_snapshot_applied(&mut self, frame: Frame) {
        self.local_hashes.retain(|&f, _| f >= frame);
        self.mismatch_run = 0;
    }

    /// Deterministic authority selection: the lexicographically lowest
    /// client id still active. Every participant derives the same answer.
    pub fn authority(active: &BTreeSet<ClientId>) -> Option<&ClientId> {
        active.iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_sync(window: usize) -> StateSync {
        let mut s = StateSync::new(window);
        s.record_local_hash(1, 0xAA);
        assert_eq!(s.on_majority_hash(1, 0xAA, 1), SyncVerdict::InSync);
        assert_eq!(s.state(), SyncState::Active);
        s
    }

    #[test]
    fn initial_to_active_on_first_match() {
        let mut s = StateSync::new(16);
        assert_eq!(s.state(), SyncState::Initial);
        s.record_local_hash(1, 7);
        s.on_majority_hash(1, 7, 1);
        assert_eq!(s.state(), SyncState::Active);
    }

    #[test]
    fn unknown_frame_ignored() {
        let mut s = StateSync::new(16);
        assert_eq!(s.on_majority_hash(99, 1, 99), SyncVerdict::InSync);
        assert_eq!(s.stats().checks, 0);
    }

    #[test]
    fn single_mismatch_is_drift() {
        let mut s = active_sync(16);
        s.record_local_hash(2, 0xAB);
        assert_eq!(s.on_majority_hash(2, 0xFF, 2), SyncVerdict::Drifted);
        assert_eq!(s.state(), SyncState::Drift);
        assert_eq!(s.stats().drift_count, 1);
    }

    #[test]
    fn drift_recovers_on_match() {
        let mut s = active_sync(16);
        s.record_local_hash(2, 0xAB);
        s.on_majority_hash(2, 0xFF, 2);
        s.record_local_hash(3, 0xCC);
        assert_eq!(s.on_majority_hash(3, 0xCC, 3), SyncVerdict::InSync);
        assert_eq!(s.state(), SyncState::Active);
    }

    #[test]
    fn confirmed_mismatch_run_escalates() {
        let mut s = active_sync(16);
        for frame in 2..=4 {
            s.record_local_hash(frame, 0xAB);
            let verdict = s.on_majority_hash(frame, 0xFF, frame);
            if frame == 4 {
                assert_eq!(verdict, SyncVerdict::NeedsResync);
            }
        }
        assert_eq!(s.state(), SyncState::Desync);
        assert!(s.last_report().is_some());
        assert_eq!(s.last_report().unwrap().frame, 4);
    }

    #[test]
    fn speculative_mismatches_do_not_escalate() {
        let mut s = active_sync(16);
        // Frames beyond the confirmed tail: drift only, however many.
        for frame in 2..=8 {
            s.record_local_hash(frame, 0xAB);
            let verdict = s.on_majority_hash(frame, 0xFF, 1);
            assert_ne!(verdict, SyncVerdict::NeedsResync);
        }
        assert_eq!(s.state(), SyncState::Drift);
    }

    #[test]
    fn resync_completes_on_next_match() {
        let mut s = active_sync(16);
        for frame in 2..=4 {
            s.record_local_hash(frame, 0xAB);
            s.on_majority_hash(frame, 0xFF, frame);
        }
        s.begin_resync(1000, 500);
        assert_eq!(s.state(), SyncState::Resyncing);
        assert!(!s.resync_timed_out(1200));
        assert!(s.resync_timed_out(1600));

        s.begin_resync(2000, 500);
        s.on_snapshot_applied(10);
        s.record_local_hash(11, 0x42);
        assert_eq!(s.on_majority_hash(11, 0x42, 11), SyncVerdict::InSync);
        assert_eq!(s.state(), SyncState::Active);
        assert_eq!(s.stats().resync_count, 2);
    }

    #[test]
    fn rolling_window_tracks_pass_pct() {
        let mut s = StateSync::new(4);
        for frame in 1..=4 {
            s.record_local_hash(frame, 1);
            s.on_majority_hash(frame, if frame <= 2 { 1 } else { 9 }, frame);
        }
        assert_eq!(s.sync_percent(), 50.0);
        assert_eq!(s.stats().window_pass_pct, 50.0);
    }

    #[test]
    fn large_magnitude_escalates_from_drift() {
        use crate::sync::diff::SnapshotDiff;

        let mut s = active_sync(16);
        s.record_local_hash(2, 0xAB);
        s.on_majority_hash(2, 0xFF, 2);
        assert_eq!(s.state(), SyncState::Drift);

        let diff = SnapshotDiff {
            local_frame: 2,
            authority_frame: 2,
            entities: vec![],
            fields_compared: 10,
            fields_diverged: 5,
        };
        assert!(s.escalate_on_magnitude(2, &diff));
        assert_eq!(s.state(), SyncState::Desync);
        assert_eq!(
            s.last_report().unwrap().diff.as_ref().unwrap().fields_diverged,
            5
        );
    }

    #[test]
    fn small_magnitude_stays_drift() {
        let mut s = active_sync(16);
        s.record_local_hash(2, 0xAB);
        s.on_majority_hash(2, 0xFF, 2);

        let diff = crate::sync::diff::SnapshotDiff {
            local_frame: 2,
            authority_frame: 2,
            entities: vec![],
            fields_compared: 100,
            fields_diverged: 1,
        };
        assert!(!s.escalate_on_magnitude(2, &diff));
        assert_eq!(s.state(), SyncState::Drift);
    }

    #[test]
    fn authority_is_lowest_client_id() {
        let mut active = BTreeSet::new();
        active.insert("carol".to_string());
        active.insert("alice".to_string());
        active.insert("bob".to_string());
        assert_eq!(StateSync::authority(&active).unwrap(), "alice");
    }
}
