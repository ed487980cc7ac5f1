//! Per-slot status bitset and the wait-masks spinners block on.

use bitflags::bitflags;
use std::fmt::{self, Display, Formatter};

bitflags! {
    /// Status flags tracked per slot. Mutations that only clear bits may be
    /// applied with an atomic AND outside the slot lock; anything that sets
    /// a bit is applied under the slot's swap lock so wait-mask spinners
    /// observe a proper set-before-wait relation.
    #[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
    pub struct Status: u32 {
        /// Has on-disk presence (appears, or will appear, in `BBP.dir`).
        const EXISTING   = 1 << 0;
        /// Descriptor and heaps are resident in memory.
        const LOADED     = 1 << 1;
        /// A load is in progress.
        const LOADING    = 1 << 2;
        /// An unload is in progress.
        const UNLOADING  = 1 << 3;
        /// A save (heap persist) is in progress.
        const SAVING     = 1 << 4;
        /// Inside the commit critical window between staging and rename.
        const SYNCING    = 1 << 5;
        /// Descriptor resident, heap not (memory-mapped back out).
        const SWAPPED    = 1 << 6;
        /// Marked deleted; still occupies a slot until fully cleared.
        const DELETED    = 1 << 7;
        /// A delete is in progress.
        const DELETING   = 1 << 8;
        /// Freshly inserted, not yet cached.
        const NEW        = 1 << 9;
        /// Transient scratch BAT.
        const TMP        = 1 << 10;
        /// Durability-significant: survives across commits.
        const PERSISTENT = 1 << 11;
        /// Touched recently; skipped by a non-aggressive trim pass.
        const HOT        = 1 << 12;
        /// Has been given a user-chosen logical name at least once.
        const RENAMED    = 1 << 13;

        /// A slot in any of these states cannot be fixed or swapped.
        const UNSTABLE = Self::LOADING.bits() | Self::UNLOADING.bits() | Self::DELETING.bits();
        /// The full wait-mask spinners block on.
        const WAITING  = Self::UNSTABLE.bits() | Self::SAVING.bits() | Self::SYNCING.bits();
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.bits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unstable_is_subset_of_waiting() {
        assert!(Status::WAITING.contains(Status::UNSTABLE));
        assert!(Status::WAITING.contains(Status::SAVING));
        assert!(Status::WAITING.contains(Status::SYNCING));
        assert!(!Status::WAITING.contains(Status::HOT));
    }

    #[test]
    fn set_then_clear_roundtrips() {
        let mut s = Status::empty();
        s.insert(Status::HOT | Status::PERSISTENT);
        assert!(s.contains(Status::HOT));
        s.remove(Status::HOT);
        assert!(!s.contains(Status::HOT));
        assert!(s.contains(Status::PERSISTENT));
    }
}
