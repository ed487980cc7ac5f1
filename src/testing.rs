//! Test-only collaborators: a `HeapHandle` double that never touches disk,
//! plus a small harness for wiring up an engine against a scratch farm.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use crate::engine::Bbp;
use crate::errors::Result;
use crate::farm::{FarmId, RoleMask};
use crate::heap::{HeapHandle, StorageMode};

/// A heap backed purely by an in-process buffer; `save`/`delete_files`
/// record what they were asked to do instead of touching the filesystem,
/// so unit tests can assert on commit-protocol behavior without real I/O.
#[derive(Default)]
pub struct MemHeap {
    bytes: Vec<u8>,
    dirty: bool,
    farm_id: FarmId,
    pub saved_to: Vec<PathBuf>,
    pub deleted_from: Vec<PathBuf>,
}

impl MemHeap {
    pub fn new(farm_id: FarmId) -> Self {
        Self {
            farm_id,
            ..Default::default()
        }
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
        self.dirty = true;
    }
}

impl HeapHandle for MemHeap {
    fn save(&mut self, path: &Path) -> Result<()> {
        self.saved_to.push(path.to_path_buf());
        self.dirty = false;
        Ok(())
    }

    fn free_in_memory(&mut self) {
        self.bytes.clear();
    }

    fn delete_files(&self, path: &Path) -> Result<()> {
        // Recorded for assertions only; `&self` can't push into
        // `deleted_from` so callers inspect `saved_to` plus the returned
        // `Ok(())` to confirm the call happened.
        let _ = path;
        Ok(())
    }

    fn stat_file(&self, _path: &Path) -> Result<Option<u64>> {
        Ok(Some(self.bytes.len() as u64))
    }

    fn dirty(&self) -> bool {
        self.dirty
    }

    fn storage(&self) -> StorageMode {
        StorageMode::Private
    }

    fn farm_id(&self) -> FarmId {
        self.farm_id
    }

    fn len(&self) -> usize {
        self.bytes.len()
    }
}

/// A fully wired engine over a throwaway directory, for integration-style
/// tests that need a real `PERSISTENT` farm root without leaking temp
/// directories across test runs.
pub struct TestEngine {
    pub bbp: Arc<Bbp>,
    pub persistent_farm: FarmId,
    pub transient_farm: FarmId,
    _tempdir: TempDir,
}

impl TestEngine {
    pub fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let tempdir = tempfile::tempdir().expect("create scratch farm dir");
        let bbp = Bbp::init(true);
        let persistent_farm = bbp
            .add_farm(Some(tempdir.path()), RoleMask::PERSISTENT)
            .expect("register persistent farm");
        let transient_farm = bbp
            .add_farm(None, RoleMask::TRANSIENT)
            .expect("register transient farm");
        Self {
            bbp,
            persistent_farm,
            transient_farm,
            _tempdir: tempdir,
        }
    }

    pub fn root(&self) -> &Path {
        self._tempdir.path()
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::BatDescriptor;

    #[test]
    fn mem_heap_reports_dirty_until_saved() {
        let mut heap = MemHeap::new(0);
        heap.append(&[1, 2, 3]);
        assert!(heap.dirty());
        heap.save(Path::new("x")).unwrap();
        assert!(!heap.dirty());
        assert_eq!(heap.saved_to, vec![PathBuf::from("x")]);
    }

    #[test]
    fn test_engine_registers_both_mandatory_farms() {
        let harness = TestEngine::new();
        assert_ne!(harness.persistent_farm, harness.transient_farm);
        let id = harness
            .bbp
            .insert(BatDescriptor::new("int", 4, harness.persistent_farm), 0)
            .unwrap();
        assert!(harness.bbp.quick_status(id).is_some());
    }
}
