//! Action schemas and per-frame input payloads.
//!
//! Games declare their actions once at registration; an input frame is then
//! a packed record indexed by compact action id rather than a free-form
//! string map. Lifecycle transitions (`join`/`leave`) travel through the
//! same ordered input stream as game actions.

use rkyv::{Archive, Deserialize, Serialize};

use crate::math::fixed::Fixed;

pub type ActionId = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub enum LifecycleKind {
    Join,
    Leave,
}

/// One action's value: scalar and vector values are fixed-point so inputs
/// themselves are deterministic data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub enum ActionValue {
    Scalar(Fixed),
    Vector2(Fixed, Fixed),
    Button(bool),
}

/// A packed action-id -> value record, kept sorted by id. Comparison is
/// shallow: same id set, per-id equality.
#[derive(Debug, Clone, PartialEq, Eq, Default, Archive, Serialize, Deserialize)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub struct ActionMap {
    entries: Vec<(ActionId, ActionValue)>,
}

impl ActionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, id: ActionId, value: ActionValue) {
        match self.entries.binary_search_by_key(&id, |(k, _)| *k) {
            Ok(pos) => self.entries[pos].1 = value,
            Err(pos) => self.entries.insert(pos, (id, value)),
        }
    }

    pub fn get(&self, id: ActionId) -> Option<ActionValue> {
        self.entries
            .binary_search_by_key(&id, |(k, _)| *k)
            .ok()
            .map(|pos| self.entries[pos].1)
    }

    pub fn scalar(&self, id: ActionId) -> Option<Fixed> {
        match self.get(id) {
            Some(ActionValue::Scalar(v)) => Some(v),
            _ => None,
        }
    }

    pub fn vector2(&self, id: ActionId) -> Option<(Fixed, Fixed)> {
        match self.get(id) {
            Some(ActionValue::Vector2(x, y)) => Some((x, y)),
            _ => None,
        }
    }

    pub fn button(&self, id: ActionId) -> bool {
        matches!(self.get(id), Some(ActionValue::Button(true)))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(ActionId, ActionValue)> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Same key set and per-key equality. Values are plain scalars, so this
    /// is exact rather than structural.
    pub fn shallow_eq(&self, other: &ActionMap) -> bool {
        self == other
    }
}

/// The payload of one (frame, client) input slot.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum InputData {
    Actions(ActionMap),
    Lifecycle(LifecycleKind),
}

impl InputData {
    pub fn empty() -> Self {
        InputData::Actions(ActionMap::new())
    }

    pub fn is_lifecycle(&self) -> bool {
        matches!(self, InputData::Lifecycle(_))
    }
}

/// How INPUT-HIST fills a missing input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum PredictionStrategy {
    /// Missing inputs predict as empty.
    Idle,
    /// Missing inputs repeat the client's last known input.
    #[default]
    RepeatLast,
}

/// Assigns compact ids to declared action names. Every participant must
/// register the same actions in the same order.
#[derive(Debug, Clone, Default)]
pub struct ActionRegistry {
    names: Vec<String>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str) -> ActionId {
        if let Some(id) = self.id(name) {
            return id;
        }
        let id = self.names.len() as ActionId;
        self.names.push(name.to_string());
        id
    }

    pub fn id(&self, name: &str) -> Option<ActionId> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| i as ActionId)
    }

    pub fn name(&self, id: ActionId) -> Option<&str> {
        self.names.get(id as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::fixed;

    #[test]
    fn map_stays_sorted() {
        let mut map = ActionMap::new();
        map.set(3, ActionValue::Button(true));
        map.set(1, ActionValue::Scalar(fixed::ONE));
        map.set(2, ActionValue::Vector2(1, 2));
        let ids: Vec<ActionId> = map.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn set_replaces() {
        let mut map = ActionMap::new();
        map.set(1, ActionValue::Scalar(5));
        map.set(1, ActionValue::Scalar(9));
        assert_eq!(map.len(), 1);
        assert_eq!(map.scalar(1), Some(9));
    }

    #[test]
    fn shallow_equality() {
        let mut a = ActionMap::new();
        a.set(1, ActionValue::Scalar(5));
        let mut b = ActionMap::new();
        b.set(1, ActionValue::Scalar(5));
        assert!(a.shallow_eq(&b));

        b.set(2, ActionValue::Button(false));
        assert!(!a.shallow_eq(&b));
    }

    #[test]
    fn registry_assigns_stable_ids() {
        let mut reg = ActionRegistry::new();
        let mv = reg.register("move");
        let fire = reg.register("fire");
        assert_eq!(mv, 0);
        assert_eq!(fire, 1);
        assert_eq!(reg.register("move"), mv);
        assert_eq!(reg.name(fire), Some("fire"));
    }
}
