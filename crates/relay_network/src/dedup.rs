//! Bounded cache of recently seen dedup identifiers.

use std::collections::{HashSet, VecDeque};

use uuid::Uuid;

/// Default number of identifiers remembered.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Fixed-capacity set with oldest-first eviction.
#[derive(Debug)]
pub struct RecentIds {
    capacity: usize,
    order: VecDeque<Uuid>,
    members: HashSet<Uuid>,
}

impl RecentIds {
    /// A capacity of 0 is raised to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
        }
    }

    /// Record `id`. Returns `true` if it was not already present.
    pub fn insert(&mut self, id: Uuid) -> bool {
        if !self.members.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        true
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.members.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for RecentIds {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_is_not_novel() {
        let mut cache = RecentIds::new(4);
        let id = Uuid::new_v4();
        assert!(cache.insert(id));
        assert!(!cache.insert(id));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_oldest_evicted_after_capacity() {
        let capacity = 8;
        let mut cache = RecentIds::new(capacity);
        let ids: Vec<Uuid> = (0..=capacity).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            assert!(cache.insert(*id));
        }

        assert_eq!(cache.len(), capacity);
        assert!(!cache.contains(&ids[0]));
        assert!(cache.contains(&ids[1]));
        assert!(cache.contains(&ids[capacity]));

        // The evicted id is novel again.
        assert!(cache.insert(ids[0]));
        assert!(!cache.contains(&ids[1]));
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let mut cache = RecentIds::new(0);
        assert_eq!(cache.capacity(), 1);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        cache.insert(a);
        cache.insert(b);
        assert!(!cache.contains(&a));
        assert!(cache.contains(&b));
    }
}
