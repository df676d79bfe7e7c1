//! Ring of per-frame world snapshots, allocated once at construction.

use crate::store::world::Frame;
use crate::store::WorldSnapshot;

#[derive(Debug)]
pub struct SnapshotRing {
    slots: Vec<Option<WorldSnapshot>>,
    capacity: usize,
}

impl SnapshotRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&mut self, snapshot: WorldSnapshot) {
        let index = snapshot.frame as usize % self.capacity;
        self.slots[index] = Some(snapshot);
    }

    pub fn get(&self, frame: Frame) -> Option<&WorldSnapshot> {
        let index = frame as usize % self.capacity;
        self.slots[index].as_ref().filter(|s| s.frame == frame)
    }

    pub fn oldest_frame(&self) -> Option<Frame> {
        self.slots
            .iter()
            .filter_map(|s| s.as_ref())
            .map(|s| s.frame)
            .min()
    }

    pub fn latest_frame(&self) -> Option<Frame> {
        self.slots
            .iter()
            .filter_map(|s| s.as_ref())
            .map(|s| s.frame)
            .max()
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::AllocatorState;

    fn snap(frame: Frame) -> WorldSnapshot {
        WorldSnapshot {
            frame,
            seq: frame,
            post_tick: true,
            entities: vec![],
            columns: vec![],
            strings: vec![],
            rng: (1, 2),
            allocator: AllocatorState::default(),
        }
    }

    #[test]
    fn constant_time_lookup() {
        let mut ring = SnapshotRing::new(32);
        for frame in 0..100 {
            ring.push(snap(frame));
        }
        assert_eq!(ring.get(90).unwrap().frame, 90);
        assert!(ring.get(50).is_none());
        assert_eq!(ring.oldest_frame(), Some(68));
        assert_eq!(ring.latest_frame(), Some(99));
    }

    #[test]
    fn clear_empties() {
        let mut ring = SnapshotRing::new(8);
        ring.push(snap(3));
        assert_eq!(ring.len(), 1);
        ring.clear();
        assert!(ring.is_empty());
    }
}
