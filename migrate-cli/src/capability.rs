//! Bulk Capability Cache (C9): per-session `entity -> {createBulk,
//! updateBulk}` tri-state, populated by probe-once.
//! A `dashmap` entry gives atomic per-key upgrade without a snapshot-and-swap
//! of the whole map, which is what "share without locking across an await
//! point" means for a structure that every entity's write wave touches
//! concurrently.

use dashmap::DashMap;

/// Tri-state capability: unknown until probed, then pinned for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tri {
    Unknown,
    Supported,
    NotSupported,
}

impl Tri {
    /// Whether a bulk attempt should still be made: either known-supported
    /// or not yet probed.
    pub fn should_attempt_bulk(self) -> bool {
        !matches!(self, Tri::NotSupported)
    }
}

#[derive(Debug, Clone, Copy)]
struct CapabilityEntry {
    create_bulk: Tri,
    update_bulk: Tri,
}

impl Default for CapabilityEntry {
    fn default() -> Self {
        Self {
            create_bulk: Tri::Unknown,
            update_bulk: Tri::Unknown,
        }
    }
}

/// Which bulk operation class a probe result applies to. Capability is
/// tracked one entry per entity, shared across every deferred sub-pass
/// that entity goes through in the session, rather than per operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkOp {
    Create,
    Update,
}

#[derive(Debug, Default)]
pub struct BulkCapabilityCache {
    entries: DashMap<String, CapabilityEntry>,
}

impl BulkCapabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, entity: &str, op: BulkOp) -> Tri {
        let entry = self.entries.get(entity);
        match (entry, op) {
            (Some(e), BulkOp::Create) => e.create_bulk,
            (Some(e), BulkOp::Update) => e.update_bulk,
            (None, _) => Tri::Unknown,
        }
    }

    pub fn set(&self, entity: &str, op: BulkOp, value: Tri) {
        let mut entry = self.entries.entry(entity.to_string()).or_default();
        match op {
            BulkOp::Create => entry.create_bulk = value,
            BulkOp::Update => entry.update_bulk = value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_by_default() {
        let cache = BulkCapabilityCache::new();
        assert_eq!(cache.get("account", BulkOp::Create), Tri::Unknown);
        assert!(Tri::Unknown.should_attempt_bulk());
    }

    #[test]
    fn create_and_update_are_tracked_independently() {
        let cache = BulkCapabilityCache::new();
        cache.set("team", BulkOp::Create, Tri::NotSupported);
        assert_eq!(cache.get("team", BulkOp::Create), Tri::NotSupported);
        assert_eq!(cache.get("team", BulkOp::Update), Tri::Unknown);
        assert!(!Tri::NotSupported.should_attempt_bulk());
    }
}
