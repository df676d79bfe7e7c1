pub mod column;
pub mod component;
pub mod entity;
pub mod interner;
pub mod snapshot;
pub mod system;
pub mod world;

pub use component::{ComponentDef, EntityTypeDef, FieldDef, FieldValue, ScalarType};
pub use entity::{AllocatorState, EntityId, IdAllocator};
pub use interner::{StringInterner, StringTable, CLIENT_ID_DOMAIN};
pub use snapshot::{EntityRecord, WorldSnapshot, SNAPSHOT_VERSION};
pub use system::{Phase, Schedule, SystemFn};
pub use world::{ClientId, FieldRef, Frame, Store, DEFAULT_MAX_ENTITIES};
