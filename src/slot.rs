//! The slot table (§4.2): a two-level fixed-base array so that a reader
//! holding nothing but an id can reach a live slot's lock without ever
//! taking a lock that could also be moving the backing storage.
//!
//! The top level is a fixed-size array of `OnceLock`s, sized to the hard
//! capacity up front; growing the table only ever *fills in* a previously
//! unset top-level entry, it never reallocates or relocates one that is
//! already set. That is what lets an unlocked reader dereference `id` while
//! another thread is growing the table for an unrelated id.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;
use std::thread::ThreadId;

use parking_lot::Mutex;

use crate::descriptor::BatDescriptor;
use crate::errors::{BbpError, Result};
use crate::status::Status;
use crate::types::{SlotId, BLOCK_COUNT, BLOCK_SIZE, MAX_SLOTS, NIL_ID, STEAL_THRESHOLD};

/// Number of independently-locked free-list shards (§4.2); kept small and
/// fixed rather than sized to the running thread count, since the BBP has no
/// visibility into the caller's thread pool.
const NUM_SHARDS: usize = 16;

/// Everything kept per slot besides the lock itself.
pub struct Slot {
    pub status: Status,
    /// Physical pins: short-lived, taken around a heap access.
    pub refs: u32,
    /// Logical references: long-lived persistence holds.
    pub lrefs: u32,
    /// Number of live views aliasing this slot's heaps.
    pub sharecnt: u32,
    /// Next slot in this name-index bucket's chain.
    pub next: Option<SlotId>,
    pub name: String,
    /// Persistent default-name buffer (`tmp_<octal slot>`, §3); kept
    /// alongside `name` so a BAT renamed back to its default doesn't need
    /// to recompute it and so callers can always recover the reserved
    /// fallback name regardless of the current logical one.
    pub bak_name: String,
    pub physical_stem: String,
    pub desc: Option<BatDescriptor>,
    /// Creator thread id (§3); cleared by the first `retain` once the BAT
    /// gains a logical reference.
    pub pid: Option<ThreadId>,
}

impl Slot {
    fn vacant() -> Self {
        Self {
            status: Status::empty(),
            refs: 0,
            lrefs: 0,
            sharecnt: 0,
            next: None,
            name: String::new(),
            bak_name: String::new(),
            physical_stem: String::new(),
            desc: None,
            pid: None,
        }
    }
}

type Block = Box<[Mutex<Slot>]>;

fn new_block() -> Block {
    let mut v = Vec::with_capacity(BLOCK_SIZE);
    v.resize_with(BLOCK_SIZE, || Mutex::new(Slot::vacant()));
    v.into_boxed_slice()
}

/// The slot table proper.
pub struct SlotTable {
    blocks: Box<[OnceLock<Block>]>,
    /// One past the highest id ever handed out by `alloc`.
    high_water: AtomicU32,
    free_lists: Vec<Mutex<Vec<SlotId>>>,
}

impl SlotTable {
    pub fn new() -> Self {
        let blocks = (0..BLOCK_COUNT).map(|_| OnceLock::new()).collect();
        let free_lists = (0..NUM_SHARDS).map(|_| Mutex::new(Vec::new())).collect();
        Self {
            blocks,
            // id 0 is reserved (§4.2): the high-water mark starts at 1.
            high_water: AtomicU32::new(1),
            free_lists,
        }
    }

    fn block_for(&self, id: SlotId) -> &Block {
        let block_idx = id as usize / BLOCK_SIZE;
        self.blocks[block_idx].get_or_init(new_block)
    }

    /// Locks and returns the slot for `id`. Panics on `id == 0` or an id
    /// beyond anything ever allocated; both are programmer errors, never
    /// data-dependent.
    pub fn lock(&self, id: SlotId) -> parking_lot::MutexGuard<'_, Slot> {
        assert_ne!(id, NIL_ID, "id 0 is reserved");
        let offset = id as usize % BLOCK_SIZE;
        self.block_for(id)[offset].lock()
    }

    fn shard_for(hint: SlotId) -> usize {
        hint as usize % NUM_SHARDS
    }

    /// Allocates a fresh slot id, preferring the shard keyed by `shard_hint`
    /// (callers pass something like a thread id so concurrent inserters
    /// rarely contend on the same free list).
    pub fn alloc(&self, shard_hint: usize) -> Result<SlotId> {
        let home = shard_hint % NUM_SHARDS;
        if let Some(id) = self.free_lists[home].lock().pop() {
            return Ok(id);
        }
        // Steal from whichever shard has the most slack, so no shard is
        // starved while another hoards more than it needs.
        let mut best: Option<(usize, usize)> = None;
        for (i, fl) in self.free_lists.iter().enumerate() {
            if i == home {
                continue;
            }
            let len = fl.lock().len();
            if len >= STEAL_THRESHOLD && best.map(|(_, l)| len > l).unwrap_or(true) {
                best = Some((i, len));
            }
        }
        if let Some((victim, _)) = best {
            if let Some(id) = self.free_lists[victim].lock().pop() {
                return Ok(id);
            }
        }
        let id = self.high_water.fetch_add(1, Ordering::Relaxed);
        if id >= *MAX_SLOTS {
            self.high_water.fetch_sub(1, Ordering::Relaxed);
            return Err(BbpError::Exhausted(*MAX_SLOTS as usize));
        }
        // Touch the block so later `lock()` calls never race block creation
        // against the id becoming visible to other threads.
        self.block_for(id);
        Ok(id)
    }

    /// Returns `id` to its home shard's free list after the slot has been
    /// reset to vacant by the caller.
    pub fn free(&self, id: SlotId, shard_hint: usize) {
        self.free_lists[Self::shard_for(shard_hint as SlotId)]
            .lock()
            .push(id);
        let _ = id;
    }

    /// One past the highest id ever allocated; mirrors the catalog's
    /// `BBPsize` field (§4.6).
    pub fn size(&self) -> SlotId {
        self.high_water.load(Ordering::Relaxed)
    }

    /// Ensures the table can address ids up to `min_size` without further
    /// allocation, used when replaying a catalog on startup.
    pub fn reserve_up_to(&self, min_size: SlotId) {
        let mut cur = self.high_water.load(Ordering::Relaxed);
        while cur < min_size {
            match self.high_water.compare_exchange_weak(
                cur,
                min_size,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
        let last_block = (min_size.saturating_sub(1)) as usize / BLOCK_SIZE;
        for i in 0..=last_block.min(BLOCK_COUNT - 1) {
            self.blocks[i].get_or_init(new_block);
        }
    }
}

impl Default for SlotTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_never_hands_out_reserved_nil_id() {
        let table = SlotTable::new();
        let id = table.alloc(0).unwrap();
        assert_ne!(id, NIL_ID);
    }

    #[test]
    fn freed_slot_is_reused() {
        let table = SlotTable::new();
        let id = table.alloc(0).unwrap();
        table.free(id, 0);
        let id2 = table.alloc(0).unwrap();
        assert_eq!(id, id2);
    }

    #[test]
    fn lock_returns_vacant_slot_for_fresh_id() {
        let table = SlotTable::new();
        let id = table.alloc(0).unwrap();
        let slot = table.lock(id);
        assert_eq!(slot.status, Status::empty());
        assert_eq!(slot.refs, 0);
    }

    #[test]
    fn alloc_steals_from_a_shard_sitting_at_exactly_the_threshold() {
        let table = SlotTable::new();
        let mut donated = Vec::new();
        for _ in 0..STEAL_THRESHOLD {
            donated.push(table.alloc(1).unwrap());
        }
        for &id in &donated {
            table.free(id, 1);
        }
        let stolen = table.alloc(0).unwrap();
        assert!(
            donated.contains(&stolen),
            "a shard with exactly {STEAL_THRESHOLD} free entries must be stolen from"
        );
    }

    #[test]
    fn reserve_up_to_touches_required_blocks() {
        let table = SlotTable::new();
        table.reserve_up_to(BLOCK_SIZE as u32 + 5);
        assert!(table.size() >= BLOCK_SIZE as u32 + 5);
        let _ = table.lock(BLOCK_SIZE as u32 + 4);
    }
}
