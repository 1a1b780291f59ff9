//! Entity snapshots: a UUID plus up to seven component slots.
//!
//! Wire format: `uuid:u128 | featureMask:u8 | component[]` with components in
//! ascending bit order. Bit 0 of the mask is the new-introduction flag.

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::codec::{put_uuid, WireReader};
use crate::entity::component::{
    Component, ComponentData, ComponentKind, MAX_COMPONENTS, RESERVED_FLAG_BITS,
};
use crate::entity::components::Identity;
use crate::error::ProtocolError;
use crate::message::{Message, MessageType};

/// Feature-mask bit marking an entity announcing itself for the first time.
pub const NEW_INTRODUCTION_FLAG: u8 = 1 << 0;

/// State of one entity. Merging is per slot: a populated slot in the incoming
/// snapshot replaces ours with a deep copy.
#[derive(Debug, Clone)]
pub struct EntitySnapshot {
    id: Uuid,
    new_introduction: bool,
    slots: [Option<Box<dyn Component>>; MAX_COMPONENTS],
}

impl EntitySnapshot {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            new_introduction: false,
            slots: Default::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_new_introduction(&self) -> bool {
        self.new_introduction
    }

    pub fn set_new_introduction(&mut self, value: bool) -> &mut Self {
        self.new_introduction = value;
        self
    }

    pub fn with_new_introduction(mut self, value: bool) -> Self {
        self.new_introduction = value;
        self
    }

    /// Store `component` in its slot, replacing any previous value.
    pub fn set<T: ComponentData>(&mut self, component: T) -> &mut Self {
        self.slots[T::KIND.slot()] = Some(Box::new(component));
        self
    }

    pub fn with<T: ComponentData>(mut self, component: T) -> Self {
        self.set(component);
        self
    }

    pub fn insert_boxed(&mut self, component: Box<dyn Component>) {
        let slot = component.kind().slot();
        self.slots[slot] = Some(component);
    }

    pub fn get<T: ComponentData>(&self) -> Option<&T> {
        self.slots[T::KIND.slot()]
            .as_deref()
            .and_then(|c| c.as_any().downcast_ref::<T>())
    }

    pub fn component(&self, kind: ComponentKind) -> Option<&dyn Component> {
        self.slots[kind.slot()].as_deref()
    }

    pub fn remove(&mut self, kind: ComponentKind) -> Option<Box<dyn Component>> {
        self.slots[kind.slot()].take()
    }

    pub fn has(&self, kind: ComponentKind) -> bool {
        self.slots[kind.slot()].is_some()
    }

    /// Kinds currently populated, in slot order.
    pub fn kinds(&self) -> impl Iterator<Item = ComponentKind> + '_ {
        ComponentKind::REGISTRY
            .into_iter()
            .filter(|kind| self.has(*kind))
    }

    pub fn has_components(&self) -> bool {
        self.slots.iter().any(Option::is_some)
    }

    /// The mask is derived from the populated slots, so a bit is set exactly
    /// when its slot holds a component.
    pub fn feature_mask(&self) -> u8 {
        let flag = if self.new_introduction {
            NEW_INTRODUCTION_FLAG
        } else {
            0
        };
        self.kinds().fold(flag, |mask, kind| mask | kind.bit())
    }

    /// Display name from the identity component, or the UUID.
    pub fn display_name(&self) -> String {
        self.get::<Identity>()
            .map_or_else(|| self.id.to_string(), |identity| identity.name.clone())
    }

    /// Copy every component present in `other` into this snapshot. The
    /// new-introduction flag is left alone.
    pub fn merge(&mut self, other: &EntitySnapshot) {
        for (ours, theirs) in self.slots.iter_mut().zip(&other.slots) {
            if let Some(component) = theirs {
                *ours = Some(component.clone_box());
            }
        }
    }

    /// Components that are new or changed relative to `reference`, or `None`
    /// when nothing changed.
    pub fn delta_against(&self, reference: &EntitySnapshot) -> Option<EntitySnapshot> {
        let mut delta = EntitySnapshot::new(self.id);
        for (slot, component) in self.slots.iter().enumerate() {
            let Some(component) = component else { continue };
            let changed = reference.slots[slot]
                .as_deref()
                .is_none_or(|previous| component.has_changed(previous));
            if changed {
                delta.slots[slot] = Some(component.clone_box());
            }
        }
        delta.has_components().then_some(delta)
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        put_uuid(buf, self.id);
        buf.put_u8(self.feature_mask());
        for component in self.slots.iter().flatten() {
            component.encode(buf);
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode a snapshot. Mask bits for component kinds this build does not
    /// know are cleared; their data, which always follows the known kinds, is
    /// ignored.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = WireReader::new(data);
        let mut snapshot = EntitySnapshot::new(reader.get_uuid()?);
        let mask = reader.get_u8()?;
        snapshot.new_introduction = mask & NEW_INTRODUCTION_FLAG != 0;

        for bit in RESERVED_FLAG_BITS..8 {
            if mask & (1 << bit) == 0 {
                continue;
            }
            let Some(kind) = ComponentKind::from_slot(usize::from(bit - RESERVED_FLAG_BITS)) else {
                tracing::debug!(
                    "Snapshot {} carries unknown component bits {:#010b}, ignoring them",
                    snapshot.id,
                    mask >> bit << bit
                );
                break;
            };
            snapshot.insert_boxed(kind.decode_boxed(&mut reader)?);
        }
        Ok(snapshot)
    }

    pub fn to_message(&self) -> Message {
        Message::new(MessageType::EntityUpdate, self.to_bytes())
    }

    pub fn from_message(message: &Message) -> Result<Self, ProtocolError> {
        if message.kind() != MessageType::EntityUpdate {
            return Err(ProtocolError::Malformed(format!(
                "expected entity_update payload, got {}",
                message.kind()
            )));
        }
        Self::decode(message.payload())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::components::{
        Equipment, EquipmentSlot, Pose, StatusEffect, StatusEffects, Vitals, Zone,
    };

    fn pose(x: f32) -> Pose {
        Pose {
            x,
            y: 70.0,
            z: 0.0,
            yaw: 0.0,
            pitch: 0.0,
            posture: 0,
        }
    }

    fn vitals(health: f32) -> Vitals {
        Vitals {
            health,
            experience: 0.0,
            hunger: 20,
            armor: 0,
        }
    }

    #[test]
    fn test_feature_mask_tracks_slots() {
        let id = Uuid::new_v4();
        let mut snapshot = EntitySnapshot::new(id);
        assert_eq!(snapshot.feature_mask(), 0);

        snapshot.set(Identity::new("alex", 0)).set(pose(1.0));
        assert_eq!(
            snapshot.feature_mask(),
            ComponentKind::Identity.bit() | ComponentKind::Pose.bit()
        );

        snapshot.set_new_introduction(true);
        assert_eq!(snapshot.feature_mask() & NEW_INTRODUCTION_FLAG, NEW_INTRODUCTION_FLAG);

        snapshot.remove(ComponentKind::Pose);
        assert_eq!(
            snapshot.feature_mask(),
            NEW_INTRODUCTION_FLAG | ComponentKind::Identity.bit()
        );
    }

    #[test]
    fn test_merge_copies_only_present_slots() {
        let id = Uuid::new_v4();
        let mut a = EntitySnapshot::new(id)
            .with(Identity::new("alex", 0x00FF00))
            .with(vitals(20.0));
        let b = EntitySnapshot::new(id).with(vitals(12.0)).with(pose(4.0));

        a.merge(&b);

        assert_eq!(a.get::<Identity>().unwrap().name, "alex");
        assert_eq!(a.get::<Vitals>(), b.get::<Vitals>());
        assert_eq!(a.get::<Pose>(), b.get::<Pose>());
        assert!(!std::ptr::eq(
            a.get::<Vitals>().unwrap(),
            b.get::<Vitals>().unwrap()
        ));

        // Idempotent.
        let before = a.to_bytes();
        a.merge(&b);
        assert_eq!(a.to_bytes(), before);
    }

    #[test]
    fn test_merge_keeps_flag() {
        let id = Uuid::new_v4();
        let mut a = EntitySnapshot::new(id);
        let b = EntitySnapshot::new(id)
            .with_new_introduction(true)
            .with(pose(1.0));
        a.merge(&b);
        assert!(!a.is_new_introduction());
        assert!(a.has(ComponentKind::Pose));
    }

    #[test]
    fn test_delta_against_reference() {
        let id = Uuid::new_v4();
        let published = EntitySnapshot::new(id)
            .with(Identity::new("alex", 0))
            .with(pose(0.0))
            .with(vitals(20.0));

        let unchanged = published.clone().with(pose(0.01));
        assert!(unchanged.delta_against(&published).is_none());

        let current = published
            .clone()
            .with(pose(3.0))
            .with(Zone::inside("nether", 1, false));
        let delta = current.delta_against(&published).unwrap();
        let kinds: Vec<_> = delta.kinds().collect();
        assert_eq!(kinds, vec![ComponentKind::Pose, ComponentKind::Zone]);
        assert!(!delta.is_new_introduction());
    }

    #[test]
    fn test_encode_decode_full_snapshot() {
        let id = Uuid::new_v4();
        let snapshot = EntitySnapshot::new(id)
            .with_new_introduction(true)
            .with(Identity::new("sam", 0xABCDEF))
            .with(vitals(7.5))
            .with(pose(-12.0))
            .with(Zone::inside("end", 3, true))
            .with(StatusEffects::captured_at(
                42,
                false,
                [StatusEffect {
                    effect_id: 9,
                    amplifier: 2,
                    duration_ticks: -1,
                }],
            ));

        let bytes = snapshot.to_bytes();
        assert_eq!(&bytes[..16], &id.as_u128().to_be_bytes());
        assert_eq!(bytes[16], 0b0011_1111);

        let decoded = EntitySnapshot::decode(&bytes).unwrap();
        assert_eq!(decoded.id(), id);
        assert!(decoded.is_new_introduction());
        assert_eq!(decoded.feature_mask(), snapshot.feature_mask());
        assert_eq!(decoded.get::<Identity>(), snapshot.get::<Identity>());
        assert_eq!(decoded.get::<Zone>(), snapshot.get::<Zone>());
        assert_eq!(decoded.get::<StatusEffects>(), snapshot.get::<StatusEffects>());
        assert_eq!(decoded.display_name(), "sam");
    }

    #[test]
    fn test_decode_ignores_unknown_component_bits() {
        let id = Uuid::new_v4();
        let known = EntitySnapshot::new(id).with(pose(2.0));
        let mut buf = BytesMut::new();
        put_uuid(&mut buf, id);
        // Pose plus a kind from a newer build.
        buf.put_u8(ComponentKind::Pose.bit() | 1 << 7);
        known.get::<Pose>().unwrap().write(&mut buf);
        buf.put_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);

        let decoded = EntitySnapshot::decode(&buf).unwrap();
        assert_eq!(decoded.feature_mask(), ComponentKind::Pose.bit());
        assert_eq!(decoded.get::<Pose>(), known.get::<Pose>());
    }

    #[test]
    fn test_decode_truncated_component() {
        let id = Uuid::new_v4();
        let bytes = EntitySnapshot::new(id).with(vitals(1.0)).to_bytes();
        assert!(matches!(
            EntitySnapshot::decode(&bytes[..bytes.len() - 2]),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_display_name_falls_back_to_id() {
        let id = Uuid::new_v4();
        assert_eq!(EntitySnapshot::new(id).display_name(), id.to_string());
    }

    #[test]
    fn test_message_conversion() {
        let snapshot = EntitySnapshot::new(Uuid::new_v4()).with(pose(1.0));
        let msg = snapshot.to_message();
        assert_eq!(msg.kind(), MessageType::EntityUpdate);
        let back = EntitySnapshot::from_message(&msg).unwrap();
        assert_eq!(back.id(), snapshot.id());
        assert!(EntitySnapshot::from_message(&Message::new(MessageType::Generic, Bytes::new())).is_err());
    }

    #[test]
    fn test_equipment_merge_delta_and_encode() {
        let id = Uuid::new_v4();
        let published = EntitySnapshot::new(id)
            .with(Identity::new("alex", 0))
            .with(Equipment::default().with_item(EquipmentSlot::MainHand, "pickaxe"));

        let regeared = published
            .clone()
            .with(Equipment::default().with_item(EquipmentSlot::Chest, "elytra"));
        let delta = regeared.delta_against(&published).unwrap();
        assert_eq!(delta.feature_mask(), ComponentKind::Equipment.bit());

        let decoded = EntitySnapshot::decode(&delta.to_bytes()).unwrap();
        let mut stored = published.clone();
        stored.merge(&decoded);
        let gear = stored.get::<Equipment>().unwrap();
        assert_eq!(gear.get(EquipmentSlot::Chest), Some("elytra"));
        assert_eq!(gear.get(EquipmentSlot::MainHand), None);
        assert_eq!(stored.get::<Identity>().unwrap().name, "alex");
    }
}
