//! Component trait and the ordered component registry.

use std::any::Any;
use std::fmt;

use bytes::BytesMut;

use crate::codec::WireReader;
use crate::entity::components::{Equipment, Identity, Pose, StatusEffects, Vitals, Zone};
use crate::error::ProtocolError;

/// Number of feature-mask bits reserved for snapshot flags (bit 0).
pub const RESERVED_FLAG_BITS: u8 = 1;

/// Maximum number of component slots an 8-bit feature mask can address.
pub const MAX_COMPONENTS: usize = 8 - RESERVED_FLAG_BITS as usize;

/// Kinds of component, in slot order. The order is part of the wire format:
/// new kinds are only ever appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ComponentKind {
    Identity = 0,
    Vitals = 1,
    Pose = 2,
    Zone = 3,
    StatusEffects = 4,
    Equipment = 5,
}

impl ComponentKind {
    /// Every kind known to this build, in slot order.
    pub const REGISTRY: [ComponentKind; 6] = [
        Self::Identity,
        Self::Vitals,
        Self::Pose,
        Self::Zone,
        Self::StatusEffects,
        Self::Equipment,
    ];

    /// Zero-based slot index.
    pub fn slot(self) -> usize {
        self as usize
    }

    /// Feature-mask bit for this kind.
    pub fn bit(self) -> u8 {
        1 << (self as u8 + RESERVED_FLAG_BITS)
    }

    pub fn from_slot(slot: usize) -> Option<Self> {
        Self::REGISTRY.get(slot).copied()
    }

    /// Decode one component of this kind.
    pub fn decode_boxed(self, reader: &mut WireReader<'_>) -> Result<Box<dyn Component>, ProtocolError> {
        Ok(match self {
            Self::Identity => Box::new(Identity::read(reader)?),
            Self::Vitals => Box::new(Vitals::read(reader)?),
            Self::Pose => Box::new(Pose::read(reader)?),
            Self::Zone => Box::new(Zone::read(reader)?),
            Self::StatusEffects => Box::new(StatusEffects::read(reader)?),
            Self::Equipment => Box::new(Equipment::read(reader)?),
        })
    }
}

const _: () = assert!(ComponentKind::REGISTRY.len() <= MAX_COMPONENTS);

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Identity => "identity",
            Self::Vitals => "vitals",
            Self::Pose => "pose",
            Self::Zone => "zone",
            Self::StatusEffects => "status_effects",
            Self::Equipment => "equipment",
        };
        f.write_str(name)
    }
}

/// An independently updatable piece of entity state, stored behind a trait
/// object in its snapshot slot.
pub trait Component: fmt::Debug + Send + Sync + 'static {
    fn kind(&self) -> ComponentKind;

    fn encode(&self, buf: &mut BytesMut);

    /// Whether this value differs meaningfully from `previous`. Components of
    /// another kind always count as changed.
    fn has_changed(&self, previous: &dyn Component) -> bool;

    /// Deep copy.
    fn clone_box(&self) -> Box<dyn Component>;

    fn as_any(&self) -> &dyn Any;
}

impl Clone for Box<dyn Component> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Concrete component types. Every implementor is a [`Component`].
pub trait ComponentData: Clone + fmt::Debug + Send + Sync + 'static {
    const KIND: ComponentKind;

    fn write(&self, buf: &mut BytesMut);

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError>;

    fn changed_from(&self, previous: &Self) -> bool;
}

impl<T: ComponentData> Component for T {
    fn kind(&self) -> ComponentKind {
        T::KIND
    }

    fn encode(&self, buf: &mut BytesMut) {
        self.write(buf);
    }

    fn has_changed(&self, previous: &dyn Component) -> bool {
        previous
            .as_any()
            .downcast_ref::<T>()
            .is_none_or(|previous| self.changed_from(previous))
    }

    fn clone_box(&self) -> Box<dyn Component> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
