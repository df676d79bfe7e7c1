//! Field-level snapshot comparison.
//!
//! Diagnostic only: computed when a desync is declared, comparing the local
//! snapshot against the authority's, and never shipped over the wire.

use std::collections::BTreeMap;

use crate::store::snapshot::WorldSnapshot;
use crate::store::{ComponentDef, EntityTypeDef, FieldValue};

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDiff {
    pub component: String,
    pub field: String,
    pub local: FieldValue,
    pub authority: FieldValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityDiff {
    pub id: u32,
    /// The entity exists only on the authority side.
    pub missing_local: bool,
    /// The entity exists only on the local side.
    pub missing_authority: bool,
    pub fields: Vec<FieldDiff>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SnapshotDiff {
    pub local_frame: u32,
    pub authority_frame: u32,
    pub entities: Vec<EntityDiff>,
    pub fields_compared: usize,
    pub fields_diverged: usize,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Fraction of compared fields that diverged, in [0, 1]. Diagnostic
    /// only.
    pub fn magnitude(&self) -> f64 {
        if self.fields_compared == 0 {
            if self.entities.is_empty() {
                0.0
            } else {
                1.0
            }
        } else {
            self.fields_diverged as f64 / self.fields_compared as f64
        }
    }
}

/// Compares two snapshots taken against the same schema, reporting every
/// diverging (entity, component, field) and entities absent on one side.
pub fn diff_snapshots(
    local: &WorldSnapshot,
    authority: &WorldSnapshot,
    components: &[ComponentDef],
    types: &[EntityTypeDef],
) -> SnapshotDiff {
    let local_pos: BTreeMap<u32, usize> = local
        .entities
        .iter()
        .enumerate()
        .map(|(k, r)| (r.id, k))
        .collect();
    let authority_pos: BTreeMap<u32, usize> = authority
        .entities
        .iter()
        .enumerate()
        .map(|(k, r)| (r.id, k))
        .collect();

    let mut all_ids: Vec<u32> = local_pos.keys().chain(authority_pos.keys()).copied().collect();
    all_ids.sort_unstable();
    all_ids.dedup();

    let mut diff = SnapshotDiff {
        local_frame: local.frame,
        authority_frame: authority.frame,
        ..SnapshotDiff::default()
    };

    for id in all_ids {
        match (local_pos.get(&id), authority_pos.get(&id)) {
            (None, Some(_)) => diff.entities.push(EntityDiff {
                id,
                missing_local: true,
                missing_authority: false,
                fields: vec![],
            }),
            (Some(_), None) => diff.entities.push(EntityDiff {
                id,
                missing_local: false,
                missing_authority: true,
                fields: vec![],
            }),
            (Some(&lk), Some(&ak)) => {
                let type_idx = local.entities[lk].type_idx;
                let Some(tdef) = types.get(type_idx as usize) else {
                    continue;
                };
                let mut fields = Vec::new();
                for (ci, comp) in components.iter().enumerate() {
                    if !tdef.has_component(ci as u16) {
                        continue;
                    }
                    for (fi, fdef) in comp.fields.iter().enumerate() {
                        let lb = local.columns[ci][fi][lk];
                        let ab = authority.columns[ci][fi][ak];
                        diff.fields_compared += 1;
                        if lb != ab {
                            diff.fields_diverged += 1;
                            fields.push(FieldDiff {
                                component: comp.name.clone(),
                                field: fdef.name.clone(),
                                local: FieldValue::from_bits(fdef.ty, lb),
                                authority: FieldValue::from_bits(fdef.ty, ab),
                            });
                        }
                    }
                }
                if !fields.is_empty() {
                    diff.entities.push(EntityDiff {
                        id,
                        missing_local: false,
                        missing_authority: false,
                        fields,
                    });
                }
            }
            (None, None) => unreachable!(),
        }
    }

    diff
}
