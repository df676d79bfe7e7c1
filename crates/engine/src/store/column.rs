//! Columnar field storage.
//!
//! One column per declared field, allocated once at registration with a slot
//! for every possible entity index. Slots of components an entity lacks are
//! simply never touched for that entity.

use super::component::{FieldValue, ScalarType};

#[derive(Debug, Clone)]
pub enum Column {
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    F32(Vec<f32>),
}

impl Column {
    pub fn new(ty: ScalarType, capacity: usize) -> Self {
        match ty {
            ScalarType::I8 => Column::I8(vec![0; capacity]),
            ScalarType::I16 => Column::I16(vec![0; capacity]),
            ScalarType::I32 => Column::I32(vec![0; capacity]),
            ScalarType::U8 => Column::U8(vec![0; capacity]),
            ScalarType::U16 => Column::U16(vec![0; capacity]),
            ScalarType::U32 => Column::U32(vec![0; capacity]),
            ScalarType::F32 => Column::F32(vec![0.0; capacity]),
        }
    }

    pub fn scalar_type(&self) -> ScalarType {
        match self {
            Column::I8(_) => ScalarType::I8,
            Column::I16(_) => ScalarType::I16,
            Column::I32(_) => ScalarType::I32,
            Column::U8(_) => ScalarType::U8,
            Column::U16(_) => ScalarType::U16,
            Column::U32(_) => ScalarType::U32,
            Column::F32(_) => ScalarType::F32,
        }
    }

    pub fn get(&self, slot: usize) -> FieldValue {
        match self {
            Column::I8(v) => FieldValue::I8(v[slot]),
            Column::I16(v) => FieldValue::I16(v[slot]),
            Column::I32(v) => FieldValue::I32(v[slot]),
            Column::U8(v) => FieldValue::U8(v[slot]),
            Column::U16(v) => FieldValue::U16(v[slot]),
            Column::U32(v) => FieldValue::U32(v[slot]),
            Column::F32(v) => FieldValue::F32(v[slot]),
        }
    }

    /// Writes a value whose scalar type already matches the column's; the
    /// caller validates against the schema.
    pub fn set(&mut self, slot: usize, value: FieldValue) {
        debug_assert_eq!(self.scalar_type(), value.scalar_type());
        self.set_bits(slot, value.to_bits());
    }

    /// The raw 32-bit pattern at a slot, as hashed and serialized.
    #[inline]
    pub fn bits(&self, slot: usize) -> u32 {
        match self {
            Column::I8(v) => v[slot] as u8 as u32,
            Column::I16(v) => v[slot] as u16 as u32,
            Column::I32(v) => v[slot] as u32,
            Column::U8(v) => v[slot] as u32,
            Column::U16(v) => v[slot] as u32,
            Column::U32(v) => v[slot],
            Column::F32(v) => v[slot].to_bits(),
        }
    }

    #[inline]
    pub fn set_bits(&mut self, slot: usize, bits: u32) {
        match self {
            Column::I8(v) => v[slot] = bits as u8 as i8,
            Column::I16(v) => v[slot] = bits as u16 as i16,
            Column::I32(v) => v[slot] = bits as i32,
            Column::U8(v) => v[slot] = bits as u8,
            Column::U16(v) => v[slot] = bits as u16,
            Column::U32(v) => v[slot] = bits,
            Column::F32(v) => v[slot] = f32::from_bits(bits),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_initialized() {
        let col = Column::new(ScalarType::I32, 8);
        assert_eq!(col.get(7), FieldValue::I32(0));
    }

    #[test]
    fn set_get_bits_roundtrip() {
        let mut col = Column::new(ScalarType::I16, 4);
        col.set(2, FieldValue::I16(-42));
        assert_eq!(col.get(2), FieldValue::I16(-42));
        assert_eq!(col.bits(2), 0xFFD6);

        let mut other = Column::new(ScalarType::I16, 4);
        other.set_bits(0, col.bits(2));
        assert_eq!(other.get(0), FieldValue::I16(-42));
    }
}
