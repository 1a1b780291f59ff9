//! The concrete component catalogue.

use std::cmp::Ordering;

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::codec::{put_bool, put_string, WireReader};
use crate::entity::component::{ComponentData, ComponentKind};
use crate::error::ProtocolError;

/// Minimum distance an entity has to move before its pose counts as changed.
pub const MIN_MOVE_DISTANCE: f32 = 0.1;

/// Rotation (degrees, either axis) beyond which a pose counts as changed.
pub const MAX_ROTATION_DELTA: f32 = 5.0;

/// Tolerance on an effect's end time before it counts as changed.
pub const EFFECT_END_TOLERANCE_MS: i64 = 500;

/// Effects carried per snapshot (count is a single byte).
pub const MAX_EFFECTS: usize = u8::MAX as usize;

const MS_PER_TICK: i64 = 50;

fn float_differs(a: f32, b: f32) -> bool {
    a.total_cmp(&b) != Ordering::Equal
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Display name and name colour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    /// ARGB with the alpha channel forced opaque.
    pub color: u32,
}

impl Identity {
    pub fn new(name: impl Into<String>, rgb: u32) -> Self {
        Self {
            name: name.into(),
            color: opaque(rgb),
        }
    }
}

fn opaque(color: u32) -> u32 {
    0xFF00_0000 | (color & 0x00FF_FFFF)
}

impl ComponentData for Identity {
    const KIND: ComponentKind = ComponentKind::Identity;

    fn write(&self, buf: &mut BytesMut) {
        put_string(buf, &self.name);
        buf.put_u32(self.color);
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        let name = reader.get_string()?;
        let color = opaque(reader.get_u32()?);
        Ok(Self { name, color })
    }

    fn changed_from(&self, previous: &Self) -> bool {
        self != previous
    }
}

// ---------------------------------------------------------------------------
// Vitals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vitals {
    pub health: f32,
    pub experience: f32,
    pub hunger: i32,
    pub armor: i32,
}

impl ComponentData for Vitals {
    const KIND: ComponentKind = ComponentKind::Vitals;

    fn write(&self, buf: &mut BytesMut) {
        buf.put_f32(self.health);
        buf.put_f32(self.experience);
        buf.put_i32(self.hunger);
        buf.put_i32(self.armor);
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            health: reader.get_f32()?,
            experience: reader.get_f32()?,
            hunger: reader.get_i32()?,
            armor: reader.get_i32()?,
        })
    }

    fn changed_from(&self, previous: &Self) -> bool {
        float_differs(self.health, previous.health)
            || float_differs(self.experience, previous.experience)
            || self.hunger != previous.hunger
            || self.armor != previous.armor
    }
}

// ---------------------------------------------------------------------------
// Pose
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub yaw: f32,
    pub pitch: f32,
    /// Application-defined posture index (standing, crouching, ...).
    pub posture: u8,
}

impl Pose {
    pub fn distance_squared(&self, other: &Pose) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        dx * dx + dy * dy + dz * dz
    }
}

impl ComponentData for Pose {
    const KIND: ComponentKind = ComponentKind::Pose;

    fn write(&self, buf: &mut BytesMut) {
        buf.put_f32(self.x);
        buf.put_f32(self.y);
        buf.put_f32(self.z);
        buf.put_f32(self.yaw);
        buf.put_f32(self.pitch);
        buf.put_u8(self.posture);
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            x: reader.get_f32()?,
            y: reader.get_f32()?,
            z: reader.get_f32()?,
            yaw: reader.get_f32()?,
            pitch: reader.get_f32()?,
            posture: reader.get_u8()?,
        })
    }

    fn changed_from(&self, previous: &Self) -> bool {
        self.distance_squared(previous) >= MIN_MOVE_DISTANCE * MIN_MOVE_DISTANCE
            || (self.yaw - previous.yaw).abs() > MAX_ROTATION_DELTA
            || (self.pitch - previous.pitch).abs() > MAX_ROTATION_DELTA
            || self.posture != previous.posture
    }
}

// ---------------------------------------------------------------------------
// Zone
// ---------------------------------------------------------------------------

const ZONE_FLAG_IN_ZONE: u8 = 1 << 0;
const ZONE_FLAG_HARDCORE: u8 = 1 << 1;

/// Where the entity is. `zone` is `None` while outside any zone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub hardcore: bool,
    pub zone: Option<ZonePlacement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZonePlacement {
    pub zone_id: String,
    pub difficulty: u8,
}

impl Zone {
    pub fn inside(zone_id: impl Into<String>, difficulty: u8, hardcore: bool) -> Self {
        Self {
            hardcore,
            zone: Some(ZonePlacement {
                zone_id: zone_id.into(),
                difficulty,
            }),
        }
    }

    pub fn is_in_zone(&self) -> bool {
        self.zone.is_some()
    }
}

impl ComponentData for Zone {
    const KIND: ComponentKind = ComponentKind::Zone;

    fn write(&self, buf: &mut BytesMut) {
        let mut flags = 0u8;
        if self.zone.is_some() {
            flags |= ZONE_FLAG_IN_ZONE;
        }
        if self.hardcore {
            flags |= ZONE_FLAG_HARDCORE;
        }
        buf.put_u8(flags);
        if let Some(placement) = &self.zone {
            put_string(buf, &placement.zone_id);
            buf.put_u8(placement.difficulty);
        }
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        let flags = reader.get_u8()?;
        let zone = if flags & ZONE_FLAG_IN_ZONE != 0 {
            Some(ZonePlacement {
                zone_id: reader.get_string()?,
                difficulty: reader.get_u8()?,
            })
        } else {
            None
        };
        Ok(Self {
            hardcore: flags & ZONE_FLAG_HARDCORE != 0,
            zone,
        })
    }

    fn changed_from(&self, previous: &Self) -> bool {
        self != previous
    }
}

// ---------------------------------------------------------------------------
// StatusEffects
// ---------------------------------------------------------------------------

/// One active effect. A duration of `-1` never expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEffect {
    pub effect_id: u32,
    pub amplifier: u8,
    pub duration_ticks: i32,
}

impl StatusEffect {
    pub fn is_infinite(&self) -> bool {
        self.duration_ticks == -1
    }
}

/// Active effects captured at `timestamp_ms`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEffects {
    pub timestamp_ms: i64,
    pub frozen: bool,
    effects: Vec<StatusEffect>,
}

impl StatusEffects {
    /// Capture `effects` now. Anything beyond [`MAX_EFFECTS`] is dropped.
    pub fn new(frozen: bool, effects: impl IntoIterator<Item = StatusEffect>) -> Self {
        Self::captured_at(chrono::Utc::now().timestamp_millis(), frozen, effects)
    }

    pub fn captured_at(
        timestamp_ms: i64,
        frozen: bool,
        effects: impl IntoIterator<Item = StatusEffect>,
    ) -> Self {
        Self {
            timestamp_ms,
            frozen,
            effects: effects.into_iter().take(MAX_EFFECTS).collect(),
        }
    }

    pub fn effects(&self) -> &[StatusEffect] {
        &self.effects
    }

    /// Milliseconds `effect` has left at `now_ms`.
    pub fn remaining_ms(&self, effect: &StatusEffect, now_ms: i64) -> i64 {
        if effect.is_infinite() {
            return i64::MAX;
        }
        let end = self
            .timestamp_ms
            .saturating_add(i64::from(effect.duration_ticks) * MS_PER_TICK);
        end.saturating_sub(now_ms).max(0)
    }

    /// Effects that have not run out at `now_ms`.
    pub fn active_at(&self, now_ms: i64) -> Vec<StatusEffect> {
        self.effects
            .iter()
            .filter(|e| self.remaining_ms(e, now_ms) > 0)
            .copied()
            .collect()
    }

    fn changed_at(&self, previous: &Self, now_ms: i64) -> bool {
        if self.frozen != previous.frozen || self.effects.len() != previous.effects.len() {
            return true;
        }
        self.effects.iter().zip(&previous.effects).any(|(ours, theirs)| {
            ours.effect_id != theirs.effect_id
                || ours.amplifier != theirs.amplifier
                || self
                    .remaining_ms(ours, now_ms)
                    .abs_diff(previous.remaining_ms(theirs, now_ms))
                    > EFFECT_END_TOLERANCE_MS as u64
        })
    }
}

impl ComponentData for StatusEffects {
    const KIND: ComponentKind = ComponentKind::StatusEffects;

    fn write(&self, buf: &mut BytesMut) {
        buf.put_i64(self.timestamp_ms);
        put_bool(buf, self.frozen);
        let count = self.effects.len().min(MAX_EFFECTS);
        buf.put_u8(count as u8);
        for effect in &self.effects[..count] {
            buf.put_u32(effect.effect_id);
            buf.put_u8(effect.amplifier);
            buf.put_i32(effect.duration_ticks);
        }
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        let timestamp_ms = reader.get_i64()?;
        let frozen = reader.get_bool()?;
        let count = reader.get_u8()? as usize;
        let mut effects = Vec::with_capacity(count);
        for _ in 0..count {
            effects.push(StatusEffect {
                effect_id: reader.get_u32()?,
                amplifier: reader.get_u8()?,
                duration_ticks: reader.get_i32()?,
            });
        }
        Ok(Self {
            timestamp_ms,
            frozen,
            effects,
        })
    }

    fn changed_from(&self, previous: &Self) -> bool {
        self.changed_at(previous, chrono::Utc::now().timestamp_millis())
    }
}

// ---------------------------------------------------------------------------
// Equipment
// ---------------------------------------------------------------------------

/// Worn and held item slots, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EquipmentSlot {
    MainHand,
    OffHand,
    Feet,
    Legs,
    Chest,
    Head,
}

impl EquipmentSlot {
    pub const ALL: [EquipmentSlot; 6] = [
        Self::MainHand,
        Self::OffHand,
        Self::Feet,
        Self::Legs,
        Self::Chest,
        Self::Head,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Item identifier per equipment slot; `None` is an empty slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Equipment {
    items: [Option<String>; EquipmentSlot::ALL.len()],
}

impl Equipment {
    pub fn with_item(mut self, slot: EquipmentSlot, item: impl Into<String>) -> Self {
        self.set(slot, Some(item.into()));
        self
    }

    pub fn set(&mut self, slot: EquipmentSlot, item: Option<String>) {
        self.items[slot.index()] = item.filter(|item| !item.is_empty());
    }

    pub fn get(&self, slot: EquipmentSlot) -> Option<&str> {
        self.items[slot.index()].as_deref()
    }

    /// Occupied slots in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (EquipmentSlot, &str)> + '_ {
        EquipmentSlot::ALL
            .iter()
            .filter_map(|slot| self.get(*slot).map(|item| (*slot, item)))
    }
}

impl ComponentData for Equipment {
    const KIND: ComponentKind = ComponentKind::Equipment;

    /// One length-prefixed string per slot; empty marks an empty slot.
    fn write(&self, buf: &mut BytesMut) {
        for item in &self.items {
            put_string(buf, item.as_deref().unwrap_or_default());
        }
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        let mut equipment = Self::default();
        for slot in EquipmentSlot::ALL {
            equipment.set(slot, Some(reader.get_string()?));
        }
        Ok(equipment)
    }

    fn changed_from(&self, previous: &Self) -> bool {
        self != previous
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn reencode<T: ComponentData>(value: &T) -> T {
        let mut buf = BytesMut::new();
        value.write(&mut buf);
        let mut reader = WireReader::new(&buf);
        let decoded = T::read(&mut reader).unwrap();
        assert_eq!(reader.remaining(), 0);
        decoded
    }

    #[test]
    fn test_identity_color_forced_opaque() {
        let identity = Identity::new("alex", 0x0012_3456);
        assert_eq!(identity.color, 0xFF12_3456);

        let mut buf = BytesMut::new();
        put_string(&mut buf, "alex");
        buf.put_u32(0x0000_00FF);
        let decoded = Identity::read(&mut WireReader::new(&buf)).unwrap();
        assert_eq!(decoded.color, 0xFF00_00FF);
    }

    #[test]
    fn test_pose_change_thresholds() {
        let base = Pose {
            x: 10.0,
            y: 64.0,
            z: -3.0,
            yaw: 90.0,
            pitch: 0.0,
            posture: 0,
        };

        let nudged = Pose { x: 10.05, ..base };
        assert!(!nudged.changed_from(&base));

        let moved = Pose { x: 10.2, ..base };
        assert!(moved.changed_from(&base));

        let small_turn = Pose { yaw: 94.0, ..base };
        assert!(!small_turn.changed_from(&base));

        let turned = Pose { pitch: -6.0, ..base };
        assert!(turned.changed_from(&base));

        let crouched = Pose { posture: 5, ..base };
        assert!(crouched.changed_from(&base));
    }

    #[test]
    fn test_vitals_change() {
        let a = Vitals {
            health: 20.0,
            experience: 3.5,
            hunger: 18,
            armor: 4,
        };
        assert!(!a.changed_from(&a));
        assert!(Vitals { health: 19.5, ..a }.changed_from(&a));
        assert!(Vitals { armor: 0, ..a }.changed_from(&a));
        assert_eq!(reencode(&a), a);
    }

    #[test]
    fn test_zone_flags_and_payload() {
        let outside = Zone {
            hardcore: true,
            zone: None,
        };
        let mut buf = BytesMut::new();
        outside.write(&mut buf);
        assert_eq!(buf.as_ref(), &[ZONE_FLAG_HARDCORE]);
        assert_eq!(reencode(&outside), outside);

        let inside = Zone::inside("overworld", 2, false);
        assert!(inside.is_in_zone());
        assert_eq!(reencode(&inside), inside);
        assert!(inside.changed_from(&outside));
    }

    fn effect(effect_id: u32, duration_ticks: i32) -> StatusEffect {
        StatusEffect {
            effect_id,
            amplifier: 1,
            duration_ticks,
        }
    }

    #[test]
    fn test_status_effects_end_time_tolerance() {
        let now = 1_000_000;
        let a = StatusEffects::captured_at(now, false, [effect(1, 200)]);

        // Captured 5 ticks later with 5 fewer ticks left: same end time.
        let same_end = StatusEffects::captured_at(now + 250, false, [effect(1, 195)]);
        assert!(!same_end.changed_at(&a, now + 300));

        let extended = StatusEffects::captured_at(now, false, [effect(1, 240)]);
        assert!(extended.changed_at(&a, now));

        let frozen = StatusEffects::captured_at(now, true, [effect(1, 200)]);
        assert!(frozen.changed_at(&a, now));

        let other = StatusEffects::captured_at(now, false, [effect(2, 200)]);
        assert!(other.changed_at(&a, now));
    }

    #[test]
    fn test_status_effects_expired_and_infinite() {
        let now = 5_000;
        let a = StatusEffects::captured_at(0, false, [effect(1, 20)]);
        let b = StatusEffects::captured_at(0, false, [effect(1, 60)]);
        // Both ran out long ago.
        assert!(!b.changed_at(&a, now));
        assert!(a.active_at(now).is_empty());

        let infinite = StatusEffects::captured_at(0, false, [effect(1, -1)]);
        assert_eq!(infinite.remaining_ms(&infinite.effects()[0], now), i64::MAX);
        assert!(infinite.changed_at(&a, now));
        assert!(!infinite.changed_at(&infinite.clone(), now));
    }

    #[test]
    fn test_status_effects_capped() {
        let many = StatusEffects::captured_at(0, false, (0..300).map(|i| effect(i, 10)));
        assert_eq!(many.effects().len(), MAX_EFFECTS);
        let decoded = reencode(&many);
        assert_eq!(decoded.effects().len(), MAX_EFFECTS);
    }

    #[test]
    fn test_equipment_slots_and_wire_form() {
        let gear = Equipment::default()
            .with_item(EquipmentSlot::MainHand, "diamond_sword")
            .with_item(EquipmentSlot::Head, "iron_helmet");
        assert_eq!(gear.get(EquipmentSlot::Head), Some("iron_helmet"));
        assert_eq!(gear.get(EquipmentSlot::Feet), None);
        let occupied: Vec<EquipmentSlot> = gear.iter().map(|(slot, _)| slot).collect();
        assert_eq!(occupied, vec![EquipmentSlot::MainHand, EquipmentSlot::Head]);

        assert_eq!(reencode(&gear), gear);

        let mut swapped = gear.clone();
        assert!(!swapped.changed_from(&gear));
        swapped.set(EquipmentSlot::MainHand, Some("bow".into()));
        assert!(swapped.changed_from(&gear));
        swapped.set(EquipmentSlot::MainHand, Some(String::new()));
        assert_eq!(swapped.get(EquipmentSlot::MainHand), None);
    }
}
