//! The entity store.
//!
//! Owns the id allocator, the per-component columns, entity metadata, the
//! interned string tables, the seeded RNG, the per-tick input table and the
//! system schedule. Everything that participates in the state hash lives
//! here; two stores built from the same schema, snapshot and confirmed
//! inputs are bit-identical at every frame.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{EngineError, ProgrammerError, ProtocolError, ResourceError};
use crate::hash::StateHasher;
use crate::input::{ActionMap, ActionValue};
use crate::math::fixed::Fixed;
use crate::math::DeterministicRng;

use super::column::Column;
use super::component::{ComponentDef, EntityTypeDef, FieldValue};
use super::entity::{EntityId, IdAllocator};
use super::interner::{StringInterner, CLIENT_ID_DOMAIN};
use super::snapshot::{EntityRecord, WorldSnapshot};
use super::system::{Phase, Schedule, SystemFn, SIMULATION_PHASES};

pub type Frame = u32;
pub type ClientId = String;

pub const DEFAULT_MAX_ENTITIES: usize = 4096;

/// A pre-resolved (component, field) pair for hot-path access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldRef {
    component: u16,
    field: u16,
}

#[derive(Debug, Clone, Copy, Default)]
struct EntitySlot {
    alive: bool,
    type_idx: u16,
    /// Interned client id, or -1.
    client: i32,
}

pub struct Store {
    max_entities: usize,
    allocator: IdAllocator,
    components: Vec<ComponentDef>,
    component_index: HashMap<String, u16>,
    types: Vec<EntityTypeDef>,
    type_index: HashMap<String, u16>,
    /// `columns[component][field]`, each with `max_entities` slots.
    columns: Vec<Vec<Column>>,
    slots: Vec<EntitySlot>,
    interner: StringInterner,
    rng: DeterministicRng,
    frame: Frame,
    seq: u32,
    inputs: BTreeMap<ClientId, ActionMap>,
    schedule: Schedule,
    render_guard: bool,
}

impl Store {
    pub fn new(max_entities: usize, seed: u32) -> Self {
        Self {
            max_entities,
            allocator: IdAllocator::new(),
            components: Vec::new(),
            component_index: HashMap::new(),
            types: Vec::new(),
            type_index: HashMap::new(),
            columns: Vec::new(),
            slots: vec![EntitySlot::default(); max_entities],
            interner: StringInterner::new(),
            rng: DeterministicRng::new(seed),
            frame: 0,
            seq: 0,
            inputs: BTreeMap::new(),
            schedule: Schedule::new(),
            render_guard: cfg!(debug_assertions),
        }
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Registers a component; columns are allocated once, here.
    pub fn register_component(&mut self, def: ComponentDef) -> Result<u16, ProgrammerError> {
        if self.component_index.contains_key(&def.name) {
            return Err(ProgrammerError::DuplicateComponent { name: def.name });
        }
        let idx = self.components.len() as u16;
        let columns = def
            .fields
            .iter()
            .map(|f| Column::new(f.ty, self.max_entities))
            .collect();
        self.component_index.insert(def.name.clone(), idx);
        self.components.push(def);
        self.columns.push(columns);
        Ok(idx)
    }

    pub fn register_entity_type(&mut self, def: EntityTypeDef) -> Result<u16, ProgrammerError> {
        if self.type_index.contains_key(&def.name) {
            return Err(ProgrammerError::DuplicateEntityType { name: def.name });
        }
        for &comp in &def.components {
            if comp as usize >= self.components.len() {
                return Err(ProgrammerError::UnknownComponent {
                    name: format!("#{comp}"),
                });
            }
        }
        let idx = self.types.len() as u16;
        self.type_index.insert(def.name.clone(), idx);
        self.types.push(def);
        Ok(idx)
    }

    pub fn add_system(&mut self, phase: Phase, name: &str, system: SystemFn) {
        self.schedule.add(phase, name, system);
    }

    pub fn component_defs(&self) -> &[ComponentDef] {
        &self.components
    }

    pub fn type_defs(&self) -> &[EntityTypeDef] {
        &self.types
    }

    pub fn component_idx(&self, name: &str) -> Result<u16, ProgrammerError> {
        self.component_index
            .get(name)
            .copied()
            .ok_or_else(|| ProgrammerError::UnknownComponent {
                name: name.to_string(),
            })
    }

    pub fn type_idx(&self, name: &str) -> Result<u16, ProgrammerError> {
        self.type_index
            .get(name)
            .copied()
            .ok_or_else(|| ProgrammerError::UnknownEntityType {
                name: name.to_string(),
            })
    }

    // ------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------

    pub fn create_entity(
        &mut self,
        type_name: &str,
        client: Option<&str>,
    ) -> Result<EntityId, EngineError> {
        let type_idx = self.type_idx(type_name)?;
        let id = self.allocator.allocate().map_err(EngineError::from)?;
        if id.index() as usize >= self.max_entities {
            self.allocator.free(id);
            return Err(ResourceError::EntityCapacityFull {
                max: self.max_entities,
            }
            .into());
        }

        let client_interned = match client {
            Some(c) => self.interner.intern(CLIENT_ID_DOMAIN, c) as i32,
            None => -1,
        };
        let slot = id.index() as usize;
        self.slots[slot] = EntitySlot {
            alive: true,
            type_idx,
            client: client_interned,
        };

        // Declared defaults, then per-type overrides.
        let tdef = self.types[type_idx as usize].clone();
        for &ci in &tdef.components {
            let comp = &self.components[ci as usize];
            for (fi, field) in comp.fields.iter().enumerate() {
                self.columns[ci as usize][fi].set(slot, field.default);
            }
        }
        for &(ci, fi, value) in &tdef.overrides {
            self.columns[ci as usize][fi as usize].set(slot, value);
        }

        Ok(id)
    }

    pub fn destroy_entity(&mut self, id: EntityId) -> Result<(), ProgrammerError> {
        self.check_alive(id)?;
        self.slots[id.index() as usize].alive = false;
        self.allocator.free(id);
        Ok(())
    }

    /// Whether the handle still refers to a live entity. Stale handles from
    /// before a destroy resolve to false.
    pub fn is_alive(&self, id: EntityId) -> bool {
        self.allocator.is_current(id) && self.slots[id.index() as usize].alive
    }

    fn check_alive(&self, id: EntityId) -> Result<(), ProgrammerError> {
        if !self.is_alive(id) {
            return Err(ProgrammerError::StaleEntity { id: id.raw() });
        }
        Ok(())
    }

    pub fn entity_type_name(&self, id: EntityId) -> Option<&str> {
        if !self.is_alive(id) {
            return None;
        }
        let slot = &self.slots[id.index() as usize];
        Some(self.types[slot.type_idx as usize].name.as_str())
    }

    pub fn entity_client(&self, id: EntityId) -> Option<&str> {
        if !self.is_alive(id) {
            return None;
        }
        let slot = &self.slots[id.index() as usize];
        if slot.client < 0 {
            return None;
        }
        self.interner.resolve(CLIENT_ID_DOMAIN, slot.client as u32)
    }

    pub fn entity_count(&self) -> usize {
        self.slots.iter().filter(|s| s.alive).count()
    }

    // ------------------------------------------------------------------
    // Queries — always ascending entity-id order
    // ------------------------------------------------------------------

    fn collect_sorted<F: Fn(&EntitySlot) -> bool>(&self, keep: F) -> Vec<EntityId> {
        let mut out: Vec<EntityId> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.alive && keep(s))
            .map(|(i, _)| {
                let gen = self.allocator.generation(i as u32).unwrap_or(0);
                EntityId::new(i as u32, gen)
            })
            .collect();
        out.sort_unstable();
        out
    }

    /// All live entities, ascending id order. The returned list is stable
    /// under mutation during iteration: entities created afterwards are not
    /// in it, destroyed ones remain but report `is_alive() == false`.
    pub fn entities(&self) -> Vec<EntityId> {
        self.collect_sorted(|_| true)
    }

    pub fn query_type(&self, type_name: &str) -> Result<Vec<EntityId>, ProgrammerError> {
        let type_idx = self.type_idx(type_name)?;
        Ok(self.collect_sorted(|s| s.type_idx == type_idx))
    }

    pub fn query_component(&self, component: &str) -> Result<Vec<EntityId>, ProgrammerError> {
        let comp = self.component_idx(component)?;
        Ok(self.collect_sorted(|s| self.types[s.type_idx as usize].has_component(comp)))
    }

    /// Clients attached to live entities, lexicographically sorted. This is
    /// how a late joiner re-derives the active-client set after a snapshot
    /// load.
    pub fn entity_clients(&self) -> BTreeSet<ClientId> {
        self.slots
            .iter()
            .filter(|s| s.alive && s.client >= 0)
            .filter_map(|s| {
                self.interner
                    .resolve(CLIENT_ID_DOMAIN, s.client as u32)
                    .map(str::to_string)
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Field access
    // ------------------------------------------------------------------

    pub fn field_ref(&self, component: &str, field: &str) -> Result<FieldRef, ProgrammerError> {
        let ci = self.component_idx(component)?;
        let fi = self.components[ci as usize]
            .field_index(field)
            .ok_or_else(|| ProgrammerError::UnknownField {
                component: component.to_string(),
                field: field.to_string(),
            })?;
        Ok(FieldRef {
            component: ci,
            field: fi,
        })
    }

    fn check_membership(&self, id: EntityId, component: u16) -> Result<(), ProgrammerError> {
        let slot = &self.slots[id.index() as usize];
        if !self.types[slot.type_idx as usize].has_component(component) {
            return Err(ProgrammerError::MissingComponent {
                id: id.raw(),
                component: self.components[component as usize].name.clone(),
            });
        }
        Ok(())
    }

    pub fn get(&self, id: EntityId, field: FieldRef) -> Result<FieldValue, ProgrammerError> {
        self.check_alive(id)?;
        self.check_membership(id, field.component)?;
        Ok(self.columns[field.component as usize][field.field as usize].get(id.index() as usize))
    }

    pub fn set(
        &mut self,
        id: EntityId,
        field: FieldRef,
        value: FieldValue,
    ) -> Result<(), ProgrammerError> {
        self.check_alive(id)?;
        self.check_membership(id, field.component)?;
        let comp = &self.components[field.component as usize];
        let fdef = &comp.fields[field.field as usize];
        if fdef.ty != value.scalar_type() {
            return Err(ProgrammerError::FieldTypeMismatch {
                component: comp.name.clone(),
                field: fdef.name.clone(),
                expected: fdef.ty,
                found: value.scalar_type(),
            });
        }
        self.columns[field.component as usize][field.field as usize]
            .set(id.index() as usize, value);
        Ok(())
    }

    pub fn get_field(
        &self,
        id: EntityId,
        component: &str,
        field: &str,
    ) -> Result<FieldValue, ProgrammerError> {
        let r = self.field_ref(component, field)?;
        self.get(id, r)
    }

    pub fn set_field(
        &mut self,
        id: EntityId,
        component: &str,
        field: &str,
        value: FieldValue,
    ) -> Result<(), ProgrammerError> {
        let r = self.field_ref(component, field)?;
        self.set(id, r, value)
    }

    /// Simulation-path accessor for fixed-point fields.
    pub fn get_fixed(&self, id: EntityId, field: FieldRef) -> Result<Fixed, ProgrammerError> {
        match self.get(id, field)? {
            FieldValue::I32(v) => Ok(v),
            other => {
                let comp = &self.components[field.component as usize];
                Err(ProgrammerError::FieldTypeMismatch {
                    component: comp.name.clone(),
                    field: comp.fields[field.field as usize].name.clone(),
                    expected: super::component::ScalarType::I32,
                    found: other.scalar_type(),
                })
            }
        }
    }

    pub fn set_fixed(
        &mut self,
        id: EntityId,
        field: FieldRef,
        value: Fixed,
    ) -> Result<(), ProgrammerError> {
        self.set(id, field, FieldValue::I32(value))
    }

    // ------------------------------------------------------------------
    // Interning, RNG, inputs
    // ------------------------------------------------------------------

    pub fn intern(&mut self, domain: &str, s: &str) -> u32 {
        self.interner.intern(domain, s)
    }

    pub fn resolve_interned(&self, domain: &str, id: u32) -> Option<&str> {
        self.interner.resolve(domain, id)
    }

    /// The deterministic random stream. Only call from systems or lifecycle
    /// callbacks — code that runs identically on every participant.
    pub fn rng_mut(&mut self) -> &mut DeterministicRng {
        &mut self.rng
    }

    /// Convenience for the common case: a fraction in [0, 1) as Q16.16.
    pub fn random_fixed(&mut self) -> Fixed {
        self.rng.next_fixed()
    }

    pub fn input(&self, client: &str) -> Option<&ActionMap> {
        self.inputs.get(client)
    }

    pub fn input_action(&self, client: &str, action: crate::input::ActionId) -> Option<ActionValue> {
        self.inputs.get(client)?.get(action)
    }

    /// This tick's inputs, ascending client-id order.
    pub fn inputs(&self) -> &BTreeMap<ClientId, ActionMap> {
        &self.inputs
    }

    pub fn frame(&self) -> Frame {
        self.frame
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    // ------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------

    /// Advances one frame: installs the frame's inputs and runs the five
    /// simulation phases. On error the frame is considered aborted; the
    /// caller restores its pre-tick snapshot.
    pub fn tick(
        &mut self,
        frame: Frame,
        inputs: BTreeMap<ClientId, ActionMap>,
    ) -> Result<(), EngineError> {
        self.frame = frame;
        self.inputs = inputs;

        let mut schedule = std::mem::take(&mut self.schedule);
        let mut result = Ok(());
        for phase in SIMULATION_PHASES {
            result = schedule.run_phase(phase, self);
            if result.is_err() {
                break;
            }
        }
        self.schedule = schedule;
        result
    }

    /// Runs the render phase only. Render systems must not mutate state
    /// that feeds the hash or later simulation; with the guard enabled a
    /// violation is detected and logged, never repaired.
    pub fn run_render(&mut self) -> Result<(), EngineError> {
        let before = if self.render_guard {
            Some(self.state_hash())
        } else {
            None
        };

        let mut schedule = std::mem::take(&mut self.schedule);
        let result = schedule.run_phase(Phase::Render, self);
        self.schedule = schedule;

        if let Some(before) = before {
            let after = self.state_hash();
            if after != before {
                log::warn!(
                    "render phase mutated simulation state at frame {}: {before:#010x} -> {after:#010x}",
                    self.frame
                );
            }
        }
        result
    }

    /// Toggles the render-phase determinism guard. Defaults to on in debug
    /// builds; costs two extra digests per render pass.
    pub fn set_render_guard(&mut self, enabled: bool) {
        self.render_guard = enabled;
    }

    // ------------------------------------------------------------------
    // Hashing and snapshots
    // ------------------------------------------------------------------

    fn synced_entities(&self) -> Vec<EntityId> {
        self.collect_sorted(|s| !self.types[s.type_idx as usize].sync_none)
    }

    /// The 32-bit state digest: frame, entity count, then per entity in
    /// ascending id order its id and every field of every component of its
    /// type, components in registration order, fields in declared order.
    /// Entities of `sync_none` types are excluded.
    pub fn state_hash(&self) -> u32 {
        let entities = self.synced_entities();
        let mut hasher = StateHasher::new();
        hasher.write_u32(self.frame);
        hasher.write_u32(entities.len() as u32);
        for id in entities {
            hasher.write_u32(id.raw());
            let slot = id.index() as usize;
            let tdef = &self.types[self.slots[slot].type_idx as usize];
            for ci in 0..self.components.len() {
                if !tdef.has_component(ci as u16) {
                    continue;
                }
                for fi in 0..self.components[ci].fields.len() {
                    hasher.write_u32(self.columns[ci][fi].bits(slot));
                }
            }
        }
        hasher.finish()
    }

    /// Emits the sparse snapshot (entities of `sync_none` types excluded).
    pub fn snapshot(&mut self, post_tick: bool) -> WorldSnapshot {
        self.seq += 1;
        let entities = self.synced_entities();
        let records: Vec<EntityRecord> = entities
            .iter()
            .map(|&id| {
                let slot = &self.slots[id.index() as usize];
                EntityRecord {
                    id: id.raw(),
                    type_idx: slot.type_idx,
                    client: slot.client,
                }
            })
            .collect();

        let columns: Vec<Vec<Vec<u32>>> = self
            .columns
            .iter()
            .map(|fields| {
                fields
                    .iter()
                    .map(|col| {
                        entities
                            .iter()
                            .map(|&id| col.bits(id.index() as usize))
                            .collect()
                    })
                    .collect()
            })
            .collect();

        WorldSnapshot {
            frame: self.frame,
            seq: self.seq,
            post_tick,
            entities: records,
            columns,
            strings: self.interner.export(),
            rng: self.rng.save_state(),
            allocator: self.allocator.state(),
        }
    }

    /// Clears all current state and reinstalls the snapshot: allocator
    /// verbatim, entities at their exact ids, every field, string tables,
    /// RNG. Afterwards the live set is exactly the snapshot's and the next
    /// allocation returns the id the source would have returned.
    pub fn load_snapshot(&mut self, snap: &WorldSnapshot) -> Result<(), EngineError> {
        for rec in &snap.entities {
            if rec.type_idx as usize >= self.types.len() {
                return Err(ProtocolError::UnknownTypeIndex {
                    type_idx: rec.type_idx,
                }
                .into());
            }
            let index = EntityId::from_raw(rec.id).index() as usize;
            if index >= self.max_entities {
                return Err(ResourceError::EntityCapacityFull {
                    max: self.max_entities,
                }
                .into());
            }
        }
        for (ci, comp) in self.components.iter().enumerate() {
            for fi in 0..comp.fields.len() {
                let col = snap
                    .columns
                    .get(ci)
                    .and_then(|fields| fields.get(fi))
                    .ok_or_else(|| ProtocolError::Codec("missing column in snapshot".into()))?;
                if col.len() != snap.entities.len() {
                    return Err(ProtocolError::Codec(format!(
                        "column {}/{} holds {} values for {} entities",
                        comp.name,
                        comp.fields[fi].name,
                        col.len(),
                        snap.entities.len()
                    ))
                    .into());
                }
            }
        }

        for slot in &mut self.slots {
            *slot = EntitySlot::default();
        }
        self.allocator.restore(&snap.allocator);
        self.interner.restore(&snap.strings);
        self.rng.load_state(snap.rng.0, snap.rng.1);
        self.frame = snap.frame;
        self.seq = snap.seq;
        self.inputs.clear();

        for rec in &snap.entities {
            let index = EntityId::from_raw(rec.id).index() as usize;
            self.slots[index] = EntitySlot {
                alive: true,
                type_idx: rec.type_idx,
                client: rec.client,
            };
        }
        for (ci, fields) in snap.columns.iter().enumerate() {
            for (fi, data) in fields.iter().enumerate() {
                for (k, rec) in snap.entities.iter().enumerate() {
                    let index = EntityId::from_raw(rec.id).index() as usize;
                    self.columns[ci][fi].set_bits(index, data[k]);
                }
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("frame", &self.frame)
            .field("entities", &self.entity_count())
            .field("components", &self.components.len())
            .field("types", &self.types.len())
            .finish()
    }
}
