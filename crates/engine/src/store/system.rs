//! System registration and phase ordering.

use crate::error::EngineError;

use super::world::Store;

/// The six execution phases. `tick` runs the first five in order; `Render`
/// is driven by the render loop and must not mutate simulation-relevant
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Input,
    Update,
    PrePhysics,
    Physics,
    PostPhysics,
    Render,
}

pub const SIMULATION_PHASES: [Phase; 5] = [
    Phase::Input,
    Phase::Update,
    Phase::PrePhysics,
    Phase::Physics,
    Phase::PostPhysics,
];

const PHASE_COUNT: usize = 6;

/// A system. Returning an error aborts the frame; the caller restores the
/// pre-tick snapshot.
pub type SystemFn = Box<dyn FnMut(&mut Store) -> Result<(), EngineError>>;

/// Systems grouped by phase; within a phase they run in registration order.
#[derive(Default)]
pub struct Schedule {
    slots: [Vec<(String, SystemFn)>; PHASE_COUNT],
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, phase: Phase, name: &str, system: SystemFn) {
        self.slots[phase as usize].push((name.to_string(), system));
    }

    pub fn run_phase(&mut self, phase: Phase, store: &mut Store) -> Result<(), EngineError> {
        for (_, system) in &mut self.slots[phase as usize] {
            system(store)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.slots.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut dbg = f.debug_struct("Schedule");
        for (i, slot) in self.slots.iter().enumerate() {
            let names: Vec<&str> = slot.iter().map(|(n, _)| n.as_str()).collect();
            dbg.field(&format!("phase_{i}"), &names);
        }
        dbg.finish()
    }
}
