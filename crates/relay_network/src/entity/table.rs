//! Shared table of every entity known to this node.

use std::collections::HashMap;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::entity::snapshot::EntitySnapshot;

/// Result of [`EntityTable::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// The entity was not known before.
    Inserted,
    /// The incoming components were merged into an existing entry.
    Merged,
}

/// Internally synchronised entity map. Stored snapshots never carry the
/// new-introduction flag; it only has meaning in transit.
#[derive(Debug, Default)]
pub struct EntityTable {
    entities: RwLock<HashMap<Uuid, EntitySnapshot>>,
}

impl EntityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `snapshot`, or merge its components into the existing entry.
    pub fn upsert(&self, snapshot: &EntitySnapshot) -> Upsert {
        let mut entities = self.entities.write();
        match entities.get_mut(&snapshot.id()) {
            Some(existing) => {
                existing.merge(snapshot);
                Upsert::Merged
            }
            None => {
                let stored = snapshot.clone().with_new_introduction(false);
                entities.insert(snapshot.id(), stored);
                Upsert::Inserted
            }
        }
    }

    pub fn remove(&self, id: &Uuid) -> Option<EntitySnapshot> {
        self.entities.write().remove(id)
    }

    pub fn get(&self, id: &Uuid) -> Option<EntitySnapshot> {
        self.entities.read().get(id).cloned()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.entities.read().contains_key(id)
    }

    /// Deep copies of every stored snapshot.
    pub fn snapshots(&self) -> Vec<EntitySnapshot> {
        self.entities.read().values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.entities.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }

    pub fn clear(&self) {
        self.entities.write().clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::components::{Identity, Vitals};

    #[test]
    fn test_upsert_inserts_then_merges() {
        let table = EntityTable::new();
        let id = Uuid::new_v4();

        let intro = EntitySnapshot::new(id)
            .with_new_introduction(true)
            .with(Identity::new("robin", 0));
        assert_eq!(table.upsert(&intro), Upsert::Inserted);
        assert!(!table.get(&id).unwrap().is_new_introduction());

        let update = EntitySnapshot::new(id).with(Vitals {
            health: 3.0,
            ..Vitals::default()
        });
        assert_eq!(table.upsert(&update), Upsert::Merged);

        let stored = table.get(&id).unwrap();
        assert_eq!(stored.get::<Identity>().unwrap().name, "robin");
        assert_eq!(stored.get::<Vitals>().unwrap().health, 3.0);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_remove_and_clear() {
        let table = EntityTable::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        table.upsert(&EntitySnapshot::new(a));
        table.upsert(&EntitySnapshot::new(b));
        assert_eq!(table.ids().len(), 2);

        assert!(table.remove(&a).is_some());
        assert!(table.remove(&a).is_none());
        assert!(!table.contains(&a));
        assert!(table.contains(&b));

        table.clear();
        assert!(table.is_empty());
    }

    #[test]
    fn test_get_returns_independent_copy() {
        let table = EntityTable::new();
        let id = Uuid::new_v4();
        table.upsert(&EntitySnapshot::new(id).with(Identity::new("a", 0)));

        let mut copy = table.get(&id).unwrap();
        copy.set(Identity::new("b", 0));
        assert_eq!(table.get(&id).unwrap().get::<Identity>().unwrap().name, "a");
    }
}
