//! Component and entity-type schemas.
//!
//! A component is a named record of scalar fields with declared defaults; an
//! entity type is a named composition of components. Registration order is
//! stable and participates in both the serialization layout and the state
//! hash, so every participant must register the same schemas in the same
//! order.

use serde::{Deserialize, Serialize};

use crate::math::fixed::Fixed;

/// The closed set of storable scalar types. Fixed-point values are stored
/// as `I32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarType {
    I8,
    I16,
    I32,
    U8,
    U16,
    U32,
    F32,
}

/// A single stored value. `F32` exists for client-local (render-side) types;
/// simulation fields use the integer scalars.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    I8(i8),
    I16(i16),
    I32(i32),
    U8(u8),
    U16(u16),
    U32(u32),
    F32(f32),
}

impl FieldValue {
    /// A fixed-point field value (stored as i32).
    pub fn fixed(v: Fixed) -> Self {
        FieldValue::I32(v)
    }

    pub fn scalar_type(&self) -> ScalarType {
        match self {
            FieldValue::I8(_) => ScalarType::I8,
            FieldValue::I16(_) => ScalarType::I16,
            FieldValue::I32(_) => ScalarType::I32,
            FieldValue::U8(_) => ScalarType::U8,
            FieldValue::U16(_) => ScalarType::U16,
            FieldValue::U32(_) => ScalarType::U32,
            FieldValue::F32(_) => ScalarType::F32,
        }
    }

    /// The raw stored bits, zero-extended to 32. This is what the state hash
    /// and the snapshot codec see.
    pub fn to_bits(&self) -> u32 {
        match *self {
            FieldValue::I8(v) => v as u8 as u32,
            FieldValue::I16(v) => v as u16 as u32,
            FieldValue::I32(v) => v as u32,
            FieldValue::U8(v) => v as u32,
            FieldValue::U16(v) => v as u32,
            FieldValue::U32(v) => v,
            FieldValue::F32(v) => v.to_bits(),
        }
    }

    pub fn from_bits(ty: ScalarType, bits: u32) -> Self {
        match ty {
            ScalarType::I8 => FieldValue::I8(bits as u8 as i8),
            ScalarType::I16 => FieldValue::I16(bits as u16 as i16),
            ScalarType::I32 => FieldValue::I32(bits as i32),
            ScalarType::U8 => FieldValue::U8(bits as u8),
            ScalarType::U16 => FieldValue::U16(bits as u16),
            ScalarType::U32 => FieldValue::U32(bits),
            ScalarType::F32 => FieldValue::F32(f32::from_bits(bits)),
        }
    }
}

/// One declared field: name, scalar type, default.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub ty: ScalarType,
    pub default: FieldValue,
}

impl FieldDef {
    pub fn new(name: &str, default: FieldValue) -> Self {
        Self {
            name: name.to_string(),
            ty: default.scalar_type(),
            default,
        }
    }
}

/// A named record of fields. The field order is the declared order and is
/// part of the wire layout.
#[derive(Debug, Clone)]
pub struct ComponentDef {
    pub name: String,
    pub fields: Vec<FieldDef>,
}

impl ComponentDef {
    pub fn new(name: &str, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.to_string(),
            fields,
        }
    }

    pub fn field_index(&self, name: &str) -> Option<u16> {
        self.fields.iter().position(|f| f.name == name).map(|i| i as u16)
    }
}

/// A named composition of components, with optional per-type default
/// overrides. `sync_none` marks the type client-local: excluded from
/// snapshots and from the state hash.
#[derive(Debug, Clone)]
pub struct EntityTypeDef {
    pub name: String,
    /// Component indices (into the registration-ordered component list).
    pub components: Vec<u16>,
    /// (component idx, field idx, value) overriding the component default.
    pub overrides: Vec<(u16, u16, FieldValue)>,
    pub sync_none: bool,
}

impl EntityTypeDef {
    pub fn has_component(&self, component: u16) -> bool {
        self.components.contains(&component)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_roundtrip_all_scalars() {
        let values = [
            FieldValue::I8(-3),
            FieldValue::I16(-300),
            FieldValue::I32(-70000),
            FieldValue::U8(200),
            FieldValue::U16(60000),
            FieldValue::U32(4_000_000_000),
            FieldValue::F32(1.5),
        ];
        for v in values {
            let bits = v.to_bits();
            assert_eq!(FieldValue::from_bits(v.scalar_type(), bits), v);
        }
    }

    #[test]
    fn negative_narrow_values_zero_extend() {
        // -1i8 must not collide with -1i32 in the digest.
        assert_eq!(FieldValue::I8(-1).to_bits(), 0xFF);
        assert_eq!(FieldValue::I16(-1).to_bits(), 0xFFFF);
        assert_eq!(FieldValue::I32(-1).to_bits(), 0xFFFF_FFFF);
    }

    #[test]
    fn field_lookup() {
        let def = ComponentDef::new(
            "transform",
            vec![
                FieldDef::new("x", FieldValue::fixed(0)),
                FieldDef::new("y", FieldValue::fixed(0)),
            ],
        );
        assert_eq!(def.field_index("y"), Some(1));
        assert_eq!(def.field_index("z"), None);
    }
}
