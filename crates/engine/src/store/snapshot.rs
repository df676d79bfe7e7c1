//! Snapshot model and its wire codec.
//!
//! The in-memory [`WorldSnapshot`] is what the prediction ring stores and
//! restores. The byte layout is versioned and fully explicit: header,
//! entity metadata sorted by id, per-component field arrays (one value per
//! snapshot entity, field by field in declared order), string tables, RNG
//! words, allocator state. Little-endian throughout.

use super::component::{ComponentDef, ScalarType};
use super::entity::AllocatorState;
use super::interner::StringTable;
use crate::error::ProtocolError;

pub const SNAPSHOT_VERSION: u8 = 1;

/// Entity metadata record; `client` is the interned client id or -1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityRecord {
    pub id: u32,
    pub type_idx: u16,
    pub client: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorldSnapshot {
    pub frame: u32,
    pub seq: u32,
    /// Whether the snapshot was taken after the tick at `frame` completed;
    /// the receiver resumes at `frame + 1` if set, at `frame` otherwise.
    pub post_tick: bool,
    /// Ascending id order.
    pub entities: Vec<EntityRecord>,
    /// `columns[component][field][k]`: raw bits of entity `k` (in
    /// `entities` order), for every registered component and field.
    pub columns: Vec<Vec<Vec<u32>>>,
    pub strings: Vec<StringTable>,
    pub rng: (u32, u32),
    pub allocator: AllocatorState,
}

impl WorldSnapshot {
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }
}

fn scalar_width(ty: ScalarType) -> usize {
    match ty {
        ScalarType::I8 | ScalarType::U8 => 1,
        ScalarType::I16 | ScalarType::U16 => 2,
        ScalarType::I32 | ScalarType::U32 | ScalarType::F32 => 4,
    }
}

/// Serializes a snapshot against the component schema it was taken with.
pub fn encode(snap: &WorldSnapshot, components: &[ComponentDef]) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + snap.entities.len() * 16);

    out.push(SNAPSHOT_VERSION);
    out.extend_from_slice(&snap.frame.to_le_bytes());
    out.extend_from_slice(&snap.seq.to_le_bytes());
    out.push(snap.post_tick as u8);
    out.extend_from_slice(&(snap.entities.len() as u32).to_le_bytes());

    for rec in &snap.entities {
        out.extend_from_slice(&rec.id.to_le_bytes());
        out.extend_from_slice(&rec.type_idx.to_le_bytes());
        out.extend_from_slice(&rec.client.to_le_bytes());
    }

    for (ci, comp) in components.iter().enumerate() {
        for (fi, field) in comp.fields.iter().enumerate() {
            let data = &snap.columns[ci][fi];
            debug_assert_eq!(data.len(), snap.entities.len());
            match scalar_width(field.ty) {
                1 => {
                    for &bits in data {
                        out.push(bits as u8);
                    }
                }
                2 => {
                    for &bits in data {
                        out.extend_from_slice(&(bits as u16).to_le_bytes());
                    }
                }
                _ => {
                    for &bits in data {
                        out.extend_from_slice(&bits.to_le_bytes());
                    }
                }
            }
        }
    }

    out.extend_from_slice(&(snap.strings.len() as u16).to_le_bytes());
    for table in &snap.strings {
        write_str(&mut out, &table.domain);
        out.extend_from_slice(&(table.entries.len() as u16).to_le_bytes());
        for (id, s) in table.entries.iter().enumerate() {
            write_str(&mut out, s);
            out.extend_from_slice(&(id as u32).to_le_bytes());
        }
    }

    out.extend_from_slice(&snap.rng.0.to_le_bytes());
    out.extend_from_slice(&snap.rng.1.to_le_bytes());

    out.extend_from_slice(&snap.allocator.next_index.to_le_bytes());
    out.extend_from_slice(&(snap.allocator.free.len() as u32).to_le_bytes());
    for &idx in &snap.allocator.free {
        out.extend_from_slice(&idx.to_le_bytes());
    }
    out.extend_from_slice(&(snap.allocator.generations.len() as u16).to_le_bytes());
    for &gen in &snap.allocator.generations {
        out.extend_from_slice(&gen.to_le_bytes());
    }

    out
}

/// Deserializes a snapshot; the schema must match the sender's.
pub fn decode(bytes: &[u8], components: &[ComponentDef]) -> Result<WorldSnapshot, ProtocolError> {
    let mut r = Reader::new(bytes);

    let version = r.read_u8()?;
    if version != SNAPSHOT_VERSION {
        return Err(ProtocolError::VersionMismatch {
            expected: SNAPSHOT_VERSION,
            found: version,
        });
    }

    let frame = r.read_u32()?;
    let seq = r.read_u32()?;
    let post_tick = r.read_u8()? != 0;
    let entity_count = r.read_u32()? as usize;

    let mut entities = Vec::with_capacity(entity_count);
    for _ in 0..entity_count {
        entities.push(EntityRecord {
            id: r.read_u32()?,
            type_idx: r.read_u16()?,
            client: r.read_i32()?,
        });
    }

    let mut columns = Vec::with_capacity(components.len());
    for comp in components {
        let mut fields = Vec::with_capacity(comp.fields.len());
        for field in &comp.fields {
            let mut data = Vec::with_capacity(entity_count);
            match scalar_width(field.ty) {
                1 => {
                    for _ in 0..entity_count {
                        data.push(r.read_u8()? as u32);
                    }
                }
                2 => {
                    for _ in 0..entity_count {
                        data.push(r.read_u16()? as u32);
                    }
                }
                _ => {
                    for _ in 0..entity_count {
                        data.push(r.read_u32()?);
                    }
                }
            }
            fields.push(data);
        }
        columns.push(fields);
    }

    let table_count = r.read_u16()? as usize;
    let mut strings = Vec::with_capacity(table_count);
    for _ in 0..table_count {
        let domain = r.read_str()?;
        let n = r.read_u16()? as usize;
        let mut entries = Vec::with_capacity(n);
        for _ in 0..n {
            let s = r.read_str()?;
            let _id = r.read_u32()?;
            entries.push(s);
        }
        strings.push(StringTable { domain, entries });
    }

    let rng = (r.read_u32()?, r.read_u32()?);

    let next_index = r.read_u32()?;
    let free_count = r.read_u32()? as usize;
    let mut free = Vec::with_capacity(free_count);
    for _ in 0..free_count {
        free.push(r.read_u32()?);
    }
    let gen_count = r.read_u16()? as usize;
    let mut generations = Vec::with_capacity(gen_count);
    for _ in 0..gen_count {
        generations.push(r.read_u16()?);
    }

    Ok(WorldSnapshot {
        frame,
        seq,
        post_tick,
        entities,
        columns,
        strings,
        rng,
        allocator: AllocatorState {
            next_index,
            free,
            generations,
        },
    })
}

/// Digest of a snapshot's state, identical to `Store::state_hash` after
/// loading it. Lets the authority hash a ring snapshot without disturbing
/// its live store.
pub fn hash_snapshot(
    snap: &WorldSnapshot,
    components: &[ComponentDef],
    types: &[crate::store::component::EntityTypeDef],
) -> u32 {
    let mut hasher = crate::hash::StateHasher::new();
    hasher.write_u32(snap.frame);
    hasher.write_u32(snap.entities.len() as u32);
    for (k, rec) in snap.entities.iter().enumerate() {
        hasher.write_u32(rec.id);
        let Some(tdef) = types.get(rec.type_idx as usize) else {
            continue;
        };
        for (ci, comp) in components.iter().enumerate() {
            if !tdef.has_component(ci as u16) {
                continue;
            }
            for fi in 0..comp.fields.len() {
                hasher.write_u32(snap.columns[ci][fi][k]);
            }
        }
    }
    hasher.finish()
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u16).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.pos + n > self.bytes.len() {
            return Err(ProtocolError::Truncated {
                needed: self.pos + n,
                available: self.bytes.len(),
            });
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(self.read_u32()? as i32)
    }

    fn read_str(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| ProtocolError::Codec(format!("invalid utf-8 in string table: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::component::{FieldDef, FieldValue};

    fn schema() -> Vec<ComponentDef> {
        vec![
            ComponentDef::new(
                "transform",
                vec![
                    FieldDef::new("x", FieldValue::fixed(0)),
                    FieldDef::new("y", FieldValue::fixed(0)),
                ],
            ),
            ComponentDef::new("tag", vec![FieldDef::new("kind", FieldValue::U8(0))]),
        ]
    }

    fn sample() -> WorldSnapshot {
        WorldSnapshot {
            frame: 7,
            seq: 3,
            post_tick: true,
            entities: vec![
                EntityRecord {
                    id: 0,
                    type_idx: 0,
                    client: 0,
                },
                EntityRecord {
                    id: 1,
                    type_idx: 0,
                    client: -1,
                },
            ],
            columns: vec![
                vec![vec![65536, 131072], vec![0, 0xFFFF_0000]],
                vec![vec![5, 200]],
            ],
            strings: vec![StringTable {
                domain: "clientId".to_string(),
                entries: vec!["p1".to_string()],
            }],
            rng: (0xAABB_CCDD, 0x1122_3344),
            allocator: AllocatorState {
                next_index: 2,
                free: vec![],
                generations: vec![0, 0],
            },
        }
    }

    #[test]
    fn roundtrip() {
        let schema = schema();
        let snap = sample();
        let bytes = encode(&snap, &schema);
        let decoded = decode(&bytes, &schema).unwrap();
        assert_eq!(decoded, snap);
    }

    #[test]
    fn version_mismatch_rejected() {
        let schema = schema();
        let mut bytes = encode(&sample(), &schema);
        bytes[0] = 99;
        assert!(matches!(
            decode(&bytes, &schema),
            Err(ProtocolError::VersionMismatch { found: 99, .. })
        ));
    }

    #[test]
    fn truncation_rejected() {
        let schema = schema();
        let bytes = encode(&sample(), &schema);
        for cut in [1, bytes.len() / 2, bytes.len() - 1] {
            assert!(decode(&bytes[..cut], &schema).is_err());
        }
    }
}
