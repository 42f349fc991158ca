//! ID Mapping Store (C8): the old→new GUID map built up during import,
//! keyed by entity. Reads are wait-free, writes are lock-free — no lock is
//! ever held across a suspending backend call.

use dashmap::DashMap;
use uuid::Uuid;

/// Concurrent `entity -> (old GUID -> new GUID)` map. Created empty at
/// import start, mutated by every tier's write wave, read by the M:N wave
/// and the deferred-field pass.
#[derive(Debug, Default)]
pub struct IdMap {
    entities: DashMap<String, DashMap<Uuid, Uuid>>,
}

impl IdMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `old -> new` for `entity`. Idempotent: writing the same
    /// mapping twice is a no-op; writing a different mapping for an
    /// already-mapped id overwrites (last writer wins).
    pub fn insert(&self, entity: &str, old: Uuid, new: Uuid) {
        self.entities
            .entry(entity.to_string())
            .or_default()
            .insert(old, new);
    }

    pub fn get(&self, entity: &str, old: Uuid) -> Option<Uuid> {
        self.entities.get(entity)?.get(&old).map(|v| *v)
    }

    pub fn contains(&self, entity: &str, old: Uuid) -> bool {
        self.entities
            .get(entity)
            .map(|m| m.contains_key(&old))
            .unwrap_or(false)
    }

    /// Number of mapped records for `entity`, used by round-trip cardinality
    /// checks in tests.
    pub fn len_for(&self, entity: &str) -> usize {
        self.entities.get(entity).map(|m| m.len()).unwrap_or(0)
    }

    pub fn entities(&self) -> Vec<String> {
        self.entities.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_are_scoped_by_entity() {
        let map = IdMap::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        map.insert("account", a, b);
        assert_eq!(map.get("account", a), Some(b));
        assert_eq!(map.get("contact", a), None);
    }

    #[test]
    fn insert_is_idempotent_for_equal_mappings() {
        let map = IdMap::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        map.insert("account", a, b);
        map.insert("account", a, b);
        assert_eq!(map.len_for("account"), 1);
    }

    #[test]
    fn contains_reflects_writes() {
        let map = IdMap::new();
        let a = Uuid::new_v4();
        assert!(!map.contains("account", a));
        map.insert("account", a, Uuid::new_v4());
        assert!(map.contains("account", a));
    }
}
