//! Shared type aliases and tunables.

use std::time::Duration;

use once_cell::sync::Lazy;

/// Identifies a slot in the BBP; id 0 is reserved and never allocated.
pub type SlotId = u32;

/// The reserved nil slot id.
pub(crate) const NIL_ID: SlotId = 0;

/// Power-of-two block size of the slot table's second level (`L` in §4.2).
pub(crate) const BLOCK_SIZE: usize = 1 << 14;

/// Number of second-level blocks the table can grow to (`H` in §4.2). The
/// hard maximum capacity is `BLOCK_SIZE * BLOCK_COUNT`.
pub(crate) const BLOCK_COUNT: usize = 1 << 10;

/// Number of entries a shard's free list must hold before another shard is
/// allowed to steal its head (§4.2).
pub(crate) const STEAL_THRESHOLD: usize = 20;

/// Radix used for the physical-stem directory tree (§3, §6): two octal
/// digits per directory level, 64 entries per directory.
pub(crate) const STEM_RADIX: u32 = 64;

/// Current `BBP.dir` format version written by this build.
pub(crate) const DIR_VERSION: u32 = 3;

/// Oldest format version this build still knows how to read (§4.6).
pub(crate) const DIR_VERSION_MINMAX_POS: u32 = 2;

/// Older still: string-offset heaps had a single `.tail` name (§4.6).
pub(crate) const DIR_VERSION_TAILN: u32 = 1;

pub(crate) const SIZEOF_SIZE_T: u32 = std::mem::size_of::<usize>() as u32;
pub(crate) const SIZEOF_OID: u32 = std::mem::size_of::<u64>() as u32;
pub(crate) const SIZEOF_MAX_INT: u32 = std::mem::size_of::<i64>() as u32;

/// Default trimmer cadence bounds (§4.9).
pub(crate) const TRIM_INTERVAL_BUSY: Duration = Duration::from_millis(100);
pub(crate) const TRIM_INTERVAL_MODERATE: Duration = Duration::from_secs(1);
pub(crate) const TRIM_INTERVAL_IDLE: Duration = Duration::from_secs(10);

/// Spin-wait granularity used while a slot's status has a bit set from a
/// wait-mask (§5).
pub(crate) const SPIN_SLEEP: Duration = Duration::from_millis(1);

/// Hard maximum slot id, `BLOCK_SIZE * BLOCK_COUNT` (§4.2). Computed once
/// and shared rather than redone per-`alloc` call.
pub(crate) static MAX_SLOTS: Lazy<u32> = Lazy::new(|| BLOCK_SIZE as u32 * BLOCK_COUNT as u32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_slots_matches_block_dimensions() {
        assert_eq!(*MAX_SLOTS, BLOCK_SIZE as u32 * BLOCK_COUNT as u32);
    }
}
