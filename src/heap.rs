//! The heap collaborator seam (§1, §6): the BBP core never lays out column
//! bytes itself, it only asks a `HeapHandle` to save, free in memory, delete,
//! or stat the file(s) that back one heap of one BAT.

use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use bytemuck::{Pod, Zeroable};
use bytes::Bytes;
use memmap2::{MmapMut, MmapOptions};

use crate::errors::Result;
use crate::farm::FarmId;

/// Fixed-size prologue written ahead of every heap file's payload bytes so
/// a later `open_mapped` (or an external tool) can tell a BBP-owned heap
/// file apart from garbage without parsing the catalog.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct HeapPrologue {
    magic: u32,
    version: u32,
    payload_len: u64,
}

const HEAP_MAGIC: u32 = 0x4242_5001;
const HEAP_PROLOGUE_VERSION: u32 = 1;
const PROLOGUE_LEN: usize = std::mem::size_of::<HeapPrologue>();

/// How a heap's bytes are currently backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// Backed by a file, mapped read-write; unloading can just drop the map.
    MemoryMapped,
    /// Anonymous, process-private memory with no file backing; unloading
    /// must persist before the bytes can be dropped.
    Private,
}

/// Everything the BBP core needs to know about, or do to, one heap file
/// without understanding its contents.
pub trait HeapHandle: Send + Sync {
    /// Persists the heap to `path`, its `.new` pre-image convention is the
    /// caller's responsibility (§5 stage/save phases).
    fn save(&mut self, path: &Path) -> Result<()>;

    /// Drops in-memory bytes, keeping only what's already durable on disk.
    fn free_in_memory(&mut self);

    /// Removes every file this heap owns under `path`'s stem.
    fn delete_files(&self, path: &Path) -> Result<()>;

    /// Current on-disk size in bytes of the file at `path`, if it exists.
    fn stat_file(&self, path: &Path) -> Result<Option<u64>>;

    fn dirty(&self) -> bool;
    fn storage(&self) -> StorageMode;
    fn farm_id(&self) -> FarmId;

    /// Logical byte length currently in use (the `free` field of §4.6).
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A `HeapHandle` backed by an actual file and a writable mmap, used by
/// persistent farms. Anonymous/private heaps grow a plain `Vec<u8>` instead
/// and are flushed to a file only when `save` is called.
pub struct MmapHeap {
    farm_id: FarmId,
    storage: StorageMode,
    dirty: bool,
    len: usize,
    mapped: Option<MmapMut>,
    scratch: Vec<u8>,
    page_round: usize,
}

impl MmapHeap {
    pub fn new_private(farm_id: FarmId) -> Self {
        Self {
            farm_id,
            storage: StorageMode::Private,
            dirty: false,
            len: 0,
            mapped: None,
            scratch: Vec::new(),
            page_round: page_size::get(),
        }
    }

    /// Opens (or creates) a memory-mapped heap at `path`, growing the file
    /// to at least `min_size` rounded up to a page boundary.
    pub fn open_mapped(farm_id: FarmId, path: &Path, min_size: usize) -> Result<Self> {
        let page_round = page_size::get();
        let rounded = min_size.next_multiple_of(page_round).max(page_round);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.set_len(rounded as u64)?;
        let mapped = unsafe { MmapOptions::new().len(rounded).map_mut(&file)? };
        Ok(Self {
            farm_id,
            storage: StorageMode::MemoryMapped,
            dirty: false,
            len: min_size,
            mapped: Some(mapped),
            scratch: Vec::new(),
            page_round,
        })
    }

    /// Appends `bytes` to the heap, growing backing storage as needed, and
    /// marks the heap dirty. Used by tests and by higher layers building up
    /// fixed-width tail content.
    pub fn append(&mut self, bytes: &[u8]) {
        self.dirty = true;
        match &mut self.mapped {
            Some(map) => {
                let end = self.len + bytes.len();
                if end > map.len() {
                    // Growth beyond the current mapping requires a fresh
                    // file-backed map; callers needing that should reopen
                    // through `open_mapped` with a larger `min_size`.
                    self.scratch.extend_from_slice(&map[..self.len]);
                    self.scratch.extend_from_slice(bytes);
                    self.mapped = None;
                } else {
                    map[self.len..end].copy_from_slice(bytes);
                }
            }
            None => self.scratch.extend_from_slice(bytes),
        }
        self.len += bytes.len();
    }

    /// Zero-copy view of the resident bytes, if the heap is currently
    /// memory-mapped and not mid-fallback to scratch storage.
    pub fn as_bytes(&self) -> Bytes {
        match &self.mapped {
            Some(map) => Bytes::copy_from_slice(&map[..self.len]),
            None => Bytes::copy_from_slice(&self.scratch[..self.len.min(self.scratch.len())]),
        }
    }

    /// Reads the prologue and payload back out of a file previously
    /// written by `save`, restoring `len`/`dirty` state. Returns `Ok(None)`
    /// if `path` doesn't carry a recognizable BBP heap prologue.
    pub fn reopen_saved(farm_id: FarmId, path: &Path) -> Result<Option<Self>> {
        let bytes = fs::read(path)?;
        if bytes.len() < PROLOGUE_LEN {
            return Ok(None);
        }
        let prologue: HeapPrologue = bytemuck::pod_read_unaligned(&bytes[..PROLOGUE_LEN]);
        if prologue.magic != HEAP_MAGIC {
            return Ok(None);
        }
        let payload_end = PROLOGUE_LEN + prologue.payload_len as usize;
        let payload = bytes
            .get(PROLOGUE_LEN..payload_end)
            .ok_or_else(|| {
                crate::errors::BbpError::CatalogMalformed(format!(
                    "heap file {} shorter than its recorded payload length",
                    path.display()
                ))
            })?
            .to_vec();
        Ok(Some(Self {
            farm_id,
            storage: StorageMode::Private,
            dirty: false,
            len: payload.len(),
            mapped: None,
            scratch: payload,
            page_round: page_size::get(),
        }))
    }
}

impl HeapHandle for MmapHeap {
    fn save(&mut self, path: &Path) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = self.as_bytes();
        let prologue = HeapPrologue {
            magic: HEAP_MAGIC,
            version: HEAP_PROLOGUE_VERSION,
            payload_len: bytes.len() as u64,
        };
        let rounded = (PROLOGUE_LEN + bytes.len())
            .max(1)
            .next_multiple_of(self.page_round);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(bytemuck::bytes_of(&prologue))?;
        file.write_all(&bytes)?;
        file.set_len(rounded as u64)?;
        file.sync_all()?;
        self.dirty = false;
        Ok(())
    }

    fn free_in_memory(&mut self) {
        self.mapped = None;
        self.scratch = Vec::new();
    }

    fn delete_files(&self, path: &Path) -> Result<()> {
        for candidate in heap_file_candidates(path) {
            if candidate.exists() {
                fs::remove_file(candidate)?;
            }
        }
        Ok(())
    }

    fn stat_file(&self, path: &Path) -> Result<Option<u64>> {
        match fs::metadata(path) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn dirty(&self) -> bool {
        self.dirty
    }

    fn storage(&self) -> StorageMode {
        self.storage
    }

    fn farm_id(&self) -> FarmId {
        self.farm_id
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// The stem plus its `.new`/`.new.kill` pre-image siblings (§6), used to
/// remove every trace of a heap when a BAT is dropped.
fn heap_file_candidates(path: &Path) -> Vec<PathBuf> {
    let mut out = vec![path.to_path_buf()];
    let mut new = path.as_os_str().to_owned();
    new.push(".new");
    out.push(PathBuf::from(new.clone()));
    let mut kill = new;
    kill.push(".kill");
    out.push(PathBuf::from(kill));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn private_heap_round_trips_through_save() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("00.tail");
        let mut heap = MmapHeap::new_private(0);
        heap.append(&[1, 2, 3, 4]);
        assert!(heap.dirty());
        heap.save(&path).unwrap();
        assert!(!heap.dirty());
        assert_eq!(heap.stat_file(&path).unwrap().unwrap() % page_size::get() as u64, 0);
    }

    #[test]
    fn delete_files_removes_pending_and_kill_markers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("00.tail");
        fs::write(&path, b"data").unwrap();
        fs::write(format!("{}.new", path.display()), b"").unwrap();
        let heap = MmapHeap::new_private(0);
        heap.delete_files(&path).unwrap();
        assert!(!path.exists());
        assert!(!Path::new(&format!("{}.new", path.display())).exists());
    }

    #[test]
    fn mapped_heap_grows_to_page_multiple() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("01.tail");
        let heap = MmapHeap::open_mapped(0, &path, 10).unwrap();
        let size = heap.stat_file(&path).unwrap().unwrap();
        assert_eq!(size % page_size::get() as u64, 0);
        assert!(size >= 10);
    }

    #[test]
    fn prologue_layout_is_stable() {
        assert_eq!(memoffset::offset_of!(HeapPrologue, magic), 0);
        assert_eq!(memoffset::offset_of!(HeapPrologue, payload_len), 8);
    }

    #[test]
    fn saved_heap_reopens_with_original_payload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("02.tail");
        let mut heap = MmapHeap::new_private(0);
        heap.append(&[9, 8, 7]);
        heap.save(&path).unwrap();

        let reopened = MmapHeap::reopen_saved(0, &path).unwrap().unwrap();
        assert_eq!(reopened.len(), 3);
        assert_eq!(&reopened.as_bytes()[..], &[9, 8, 7]);
    }
}
