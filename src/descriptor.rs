//! In-memory BAT descriptor (§4.6): the fields a catalog entry round-trips
//! plus the heap handles attached once a BAT is loaded.

use bitflags::bitflags;

use crate::farm::FarmId;
use crate::heap::{HeapHandle, StorageMode};
use crate::types::SlotId;

bitflags! {
    /// The `properties` bitmask of a `BBP.dir` entry (§4.6). Any bit outside
    /// this set read from disk is a fatal "incompatible database" error.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Properties: u32 {
        const SORTED    = 0x01;
        const REVSORTED = 0x80;
        const KEY       = 0x100;
        const DENSE     = 0x200;
        const NONIL     = 0x400;
        const NIL       = 0x800;
    }
}

impl Properties {
    pub(crate) const ALL_KNOWN: u32 = Self::SORTED.bits()
        | Self::REVSORTED.bits()
        | Self::KEY.bits()
        | Self::DENSE.bits()
        | Self::NONIL.bits()
        | Self::NIL.bits();
}

bitflags! {
    /// The `var-flags` field of a `BBP.dir` entry (§4.6).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VarFlags: u32 {
        /// Tail is variable-width, backed by a vheap.
        const VARWIDTH    = 1 << 0;
        /// The vheap also carries a hash side-structure.
        const HASH_IN_VHEAP = 1 << 1;
    }
}

/// Sub-record for one heap (tail or vheap) in a catalog entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapRecord {
    pub free: u64,
    pub size: u64,
    pub storage: StorageMode2,
}

/// A disk-codec-friendly mirror of [`StorageMode`] (§4.6 writes `0`/`1`/`2`
/// for memory-mapped/private/direct-mmap; the BBP core itself only
/// distinguishes mapped vs. private).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode2 {
    MemoryMapped,
    Private,
    DirectMapped,
}

impl Default for StorageMode2 {
    fn default() -> Self {
        StorageMode2::MemoryMapped
    }
}

impl From<StorageMode> for StorageMode2 {
    fn from(m: StorageMode) -> Self {
        match m {
            StorageMode::MemoryMapped => StorageMode2::MemoryMapped,
            StorageMode::Private => StorageMode2::Private,
        }
    }
}

/// The parent links a view descriptor carries; `None` means "owns its own
/// heap" rather than a self-referential sentinel pointing back at the
/// child's own id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ViewParents {
    pub tail_parent: Option<SlotId>,
    pub vheap_parent: Option<SlotId>,
}

impl ViewParents {
    pub fn is_view(&self) -> bool {
        self.tail_parent.is_some() || self.vheap_parent.is_some()
    }
}

/// What `quick_descriptor` hands back: cloned field data with no heap
/// handles, so taking this snapshot never forces anything to load.
#[derive(Debug, Clone)]
pub struct BatSummary {
    pub count: u64,
    pub capacity: u64,
    pub atom_type: String,
    pub width: u16,
    pub var_flags: VarFlags,
    pub properties: Properties,
    pub parents: ViewParents,
    pub farm_id: FarmId,
}

/// The in-memory descriptor attached to a loaded slot (§2, §4.6).
pub struct BatDescriptor {
    pub count: u64,
    pub capacity: u64,
    pub hseqbase: u64,
    pub atom_type: String,
    pub width: u16,
    pub var_flags: VarFlags,
    pub properties: Properties,
    pub nokey0: u64,
    pub nokey1: u64,
    pub nosorted: u64,
    pub norevsorted: u64,
    pub seqbase: u64,
    pub minpos: Option<u64>,
    pub maxpos: Option<u64>,
    pub options: Option<String>,
    pub parents: ViewParents,
    pub farm_id: FarmId,
    tail: Option<Box<dyn HeapHandle>>,
    vheap: Option<Box<dyn HeapHandle>>,
}

impl BatDescriptor {
    pub fn new(atom_type: impl Into<String>, width: u16, farm_id: FarmId) -> Self {
        Self {
            count: 0,
            capacity: 0,
            hseqbase: 0,
            atom_type: atom_type.into(),
            width,
            var_flags: VarFlags::empty(),
            properties: Properties::empty(),
            nokey0: 0,
            nokey1: 0,
            nosorted: 0,
            norevsorted: 0,
            seqbase: 0,
            minpos: None,
            maxpos: None,
            options: None,
            parents: ViewParents::default(),
            farm_id,
            tail: None,
            vheap: None,
        }
    }

    pub fn is_view(&self) -> bool {
        self.parents.is_view()
    }

    /// A cloneable snapshot of everything but the attached heap handles,
    /// for callers that just need metadata and shouldn't force a load
    /// (§1's `quick_descriptor`, as opposed to `descriptor`'s live guard).
    pub fn summary(&self) -> BatSummary {
        BatSummary {
            count: self.count,
            capacity: self.capacity,
            atom_type: self.atom_type.clone(),
            width: self.width,
            var_flags: self.var_flags,
            properties: self.properties,
            parents: self.parents,
            farm_id: self.farm_id,
        }
    }

    pub fn attach_tail(&mut self, heap: Box<dyn HeapHandle>) {
        self.tail = Some(heap);
    }

    pub fn attach_vheap(&mut self, heap: Box<dyn HeapHandle>) {
        self.vheap = Some(heap);
    }

    pub fn tail(&self) -> Option<&dyn HeapHandle> {
        self.tail.as_deref()
    }

    pub fn tail_mut(&mut self) -> Option<&mut (dyn HeapHandle + 'static)> {
        self.tail.as_deref_mut()
    }

    pub fn vheap(&self) -> Option<&dyn HeapHandle> {
        self.vheap.as_deref()
    }

    pub fn vheap_mut(&mut self) -> Option<&mut (dyn HeapHandle + 'static)> {
        self.vheap.as_deref_mut()
    }

    pub fn detach_heaps(&mut self) {
        self.tail = None;
        self.vheap = None;
    }

    /// True when any owned (non-view) heap has unsaved changes; views never
    /// report dirty since they own no storage (§2 invariant 3).
    pub fn dirty(&self) -> bool {
        if self.is_view() {
            return false;
        }
        self.tail.as_ref().is_some_and(|h| h.dirty())
            || self.vheap.as_ref().is_some_and(|h| h.dirty())
    }

    /// True if every owned heap is currently memory-mapped, the condition
    /// `aggressive` trimming relaxes the dirty check against (§4.5).
    pub fn all_heaps_mapped(&self) -> bool {
        let tail_ok = self
            .tail
            .as_ref()
            .is_none_or(|h| h.storage() == StorageMode::MemoryMapped);
        let vheap_ok = self
            .vheap
            .as_ref()
            .is_none_or(|h| h.storage() == StorageMode::MemoryMapped);
        tail_ok && vheap_ok
    }

    pub fn validate_properties(&self) -> Result<(), String> {
        if self.properties.bits() & !Properties::ALL_KNOWN != 0 {
            return Err(format!(
                "unknown property bits 0x{:x}",
                self.properties.bits() & !Properties::ALL_KNOWN
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_descriptor_is_not_a_view() {
        let desc = BatDescriptor::new("int", 4, 0);
        assert!(!desc.is_view());
        assert!(!desc.dirty());
    }

    #[test]
    fn view_reports_not_dirty_even_with_heap_attached() {
        let mut desc = BatDescriptor::new("int", 4, 0);
        desc.parents.tail_parent = Some(7);
        assert!(desc.is_view());
        assert!(!desc.dirty());
    }

    #[test]
    fn unknown_property_bits_rejected() {
        let mut desc = BatDescriptor::new("int", 4, 0);
        desc.properties = Properties::from_bits_retain(0x1000);
        assert!(desc.validate_properties().is_err());
    }
}
