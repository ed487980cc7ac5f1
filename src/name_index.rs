//! Name index (§4.2): maps a logical BAT name to a slot id through a
//! hash-bucketed chain threaded through each slot's own `next` field, so the
//! index itself carries no per-entry heap allocation beyond the buckets.

use fnv::FnvHasher;
use parking_lot::RwLock;
use std::hash::{Hash, Hasher};

use crate::paths::is_reserved_temp_name;
use crate::slot::SlotTable;
use crate::types::SlotId;

/// Bucket count; kept a power of two so the hash-to-bucket map is a mask.
const NUM_BUCKETS: usize = 1 << 14;

fn bucket_of(name: &str) -> usize {
    let mut hasher = FnvHasher::default();
    name.hash(&mut hasher);
    (hasher.finish() as usize) & (NUM_BUCKETS - 1)
}

/// The name index. Guarded by one `RwLock` per bucket array entry rather
/// than a single lock over the whole table, so lookups for unrelated names
/// never contend.
pub struct NameIndex {
    buckets: Box<[RwLock<Option<SlotId>>]>,
}

impl NameIndex {
    pub fn new() -> Self {
        Self {
            buckets: (0..NUM_BUCKETS).map(|_| RwLock::new(None)).collect(),
        }
    }

    /// Looks up `name`, walking the chain through `table`. `tmp_<octal>`
    /// names are never indexed (§6) and so never found here even if a slot
    /// happens to carry that string as its name.
    pub fn lookup(&self, table: &SlotTable, name: &str) -> Option<SlotId> {
        if is_reserved_temp_name(name) {
            return None;
        }
        let mut cur = *self.buckets[bucket_of(name)].read();
        while let Some(id) = cur {
            let slot = table.lock(id);
            if slot.name == name {
                return Some(id);
            }
            cur = slot.next;
        }
        None
    }

    /// Inserts `id` under `name` at the head of its bucket's chain. Splices
    /// `id` in itself: takes `id`'s slot lock to point `slot.next` at the
    /// prior head before publishing `id` as the new one, so two names that
    /// happen to hash into the same bucket both stay reachable. No-op for
    /// reserved temporary names.
    pub fn insert(&self, table: &SlotTable, name: &str, id: SlotId) {
        if is_reserved_temp_name(name) {
            return;
        }
        let mut head = self.buckets[bucket_of(name)].write();
        table.lock(id).next = *head;
        *head = Some(id);
    }

    /// Removes `id` from `name`'s chain, splicing around it. Callers must
    /// hold no slot locks that would deadlock against the chain walk.
    pub fn remove(&self, table: &SlotTable, name: &str, id: SlotId) {
        if is_reserved_temp_name(name) {
            return;
        }
        let mut head = self.buckets[bucket_of(name)].write();
        match *head {
            Some(h) if h == id => {
                *head = table.lock(id).next;
                return;
            }
            Some(mut cur) => loop {
                let next = table.lock(cur).next;
                match next {
                    Some(n) if n == id => {
                        let after = table.lock(id).next;
                        table.lock(cur).next = after;
                        return;
                    }
                    Some(n) => cur = n,
                    None => return,
                }
            },
            None => {}
        }
    }

    /// Renames `id` from `old` to `new`, rejecting `new` if it already names
    /// a different slot. Returns `false` on the collision without mutating
    /// anything.
    pub fn rename(&self, table: &SlotTable, old: &str, new: &str, id: SlotId) -> bool {
        if let Some(existing) = self.lookup(table, new) {
            if existing != id {
                return false;
            }
        }
        self.remove(table, old, id);
        {
            let mut slot = table.lock(id);
            slot.name = new.to_string();
        }
        self.insert(table, new, id);
        true
    }
}

impl Default for NameIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(table: &SlotTable, index: &NameIndex, name: &str) -> SlotId {
        let id = table.alloc(0).unwrap();
        {
            let mut slot = table.lock(id);
            slot.name = name.to_string();
        }
        index.insert(table, name, id);
        id
    }

    #[test]
    fn lookup_finds_inserted_name() {
        let table = SlotTable::new();
        let index = NameIndex::new();
        let id = seed(&table, &index, "orders");
        assert_eq!(index.lookup(&table, "orders"), Some(id));
        assert_eq!(index.lookup(&table, "missing"), None);
    }

    #[test]
    fn temp_names_are_never_indexed() {
        let table = SlotTable::new();
        let index = NameIndex::new();
        let id = seed(&table, &index, "tmp_17");
        assert_eq!(index.lookup(&table, "tmp_17"), None);
        let _ = id;
    }

    #[test]
    fn chain_survives_removal_of_middle_entry() {
        let table = SlotTable::new();
        let index = NameIndex::new();
        // Force a collision by reusing the same name's bucket via distinct
        // names that the test doesn't control hashing of directly; instead
        // verify head and non-head removal through rename semantics.
        let a = seed(&table, &index, "alpha");
        let b = seed(&table, &index, "beta");
        index.remove(&table, "alpha", a);
        assert_eq!(index.lookup(&table, "alpha"), None);
        assert_eq!(index.lookup(&table, "beta"), Some(b));
    }

    #[test]
    fn chain_finds_both_entries_after_a_real_bucket_collision() {
        let table = SlotTable::new();
        let index = NameIndex::new();
        let first = "alpha";
        let first_bucket = bucket_of(first);
        let second = (0..100_000u32)
            .map(|i| format!("collide{i}"))
            .find(|name| bucket_of(name) == first_bucket)
            .expect("found a second name sharing alpha's bucket");

        let a = seed(&table, &index, first);
        let b = seed(&table, &index, &second);

        assert_eq!(index.lookup(&table, first), Some(a));
        assert_eq!(index.lookup(&table, &second), Some(b));
    }

    #[test]
    fn rename_rejects_collision_with_other_slot() {
        let table = SlotTable::new();
        let index = NameIndex::new();
        let a = seed(&table, &index, "alpha");
        let _b = seed(&table, &index, "beta");
        assert!(!index.rename(&table, "alpha", "beta", a));
        assert_eq!(index.lookup(&table, "alpha"), Some(a));
    }

    #[test]
    fn rename_moves_entry_to_new_name() {
        let table = SlotTable::new();
        let index = NameIndex::new();
        let a = seed(&table, &index, "alpha");
        assert!(index.rename(&table, "alpha", "gamma", a));
        assert_eq!(index.lookup(&table, "alpha"), None);
        assert_eq!(index.lookup(&table, "gamma"), Some(a));
    }
}
