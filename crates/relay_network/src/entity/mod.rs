//! Entity state relayed across the mesh.
//!
//! An entity is identified by a UUID and described by independently updatable
//! components. Peers exchange [`EntitySnapshot`]s, full or delta, and every node
//! merges them into its [`EntityTable`].

pub mod component;
pub mod components;
pub mod snapshot;
pub mod table;

pub use component::{Component, ComponentData, ComponentKind};
pub use components::{
    Equipment, EquipmentSlot, Identity, Pose, StatusEffect, StatusEffects, Vitals, Zone,
    ZonePlacement,
};
pub use snapshot::EntitySnapshot;
pub use table::{EntityTable, Upsert};
