//! The public BBP engine (§4.4, §1 "Public API shape"): ties the slot
//! table, name index, farm registry and commit machinery together behind
//! the operations callers actually use.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use log::{debug, warn};
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard, RwLock};

use crate::backup;
use crate::descriptor::{BatDescriptor, BatSummary, VarFlags};
use crate::dir::{Catalog, DirEntry};
use crate::errors::{BbpError, Result};
use crate::farm::{FarmId, FarmRegistry, HeapKind, Role, RoleMask};
use crate::name_index::NameIndex;
use crate::paths;
use crate::recovery;
use crate::slot::SlotTable;
use crate::status::Status;
use crate::trimmer::{Trimmable, Trimmer};
use crate::types::{SlotId, SPIN_SLEEP};

/// Process-wide BAT Buffer Pool.
///
/// Holds no lock of its own beyond what `SlotTable`/`NameIndex` already
/// provide per-entry; `lock`/`unlock` below take the coarse `tm` mutex that
/// stands in for the "global BBP lock" (§4.4) whenever a caller genuinely
/// needs exclusivity across the whole table, e.g. around `sync`.
pub struct Bbp {
    farms: RwLock<FarmRegistry>,
    table: Arc<SlotTable>,
    names: NameIndex,
    /// Stands in for the commit-duration TM lock (§4.4): held for the
    /// whole of `sync`, and briefly by `lock`/`unlock` callers.
    tm: Mutex<()>,
    logno: AtomicU64,
    transid: AtomicU64,
    trimmer: Mutex<Option<Trimmer>>,
}

impl Bbp {
    /// `init(first_time)` (§1): builds an empty engine. Farms must be
    /// registered with `add_farm` before `sync`/recovery can do anything
    /// useful against disk.
    pub fn init(_first_time: bool) -> Arc<Self> {
        Arc::new(Self {
            farms: RwLock::new(FarmRegistry::new()),
            table: Arc::new(SlotTable::new()),
            names: NameIndex::new(),
            tm: Mutex::new(()),
            logno: AtomicU64::new(0),
            transid: AtomicU64::new(0),
            trimmer: Mutex::new(None),
        })
    }

    /// Starts the background trimmer thread (§4.9). Idempotent: a second
    /// call is a no-op while one is already running.
    pub fn start_trimmer(self: &Arc<Self>) {
        let mut slot = self.trimmer.lock();
        if slot.is_some() {
            return;
        }
        let target: Arc<dyn Trimmable> = self.clone();
        *slot = Some(Trimmer::spawn(target));
    }

    /// `exit()` (§1): stops the trimmer and releases in-memory state. Heap
    /// files already committed remain on disk.
    pub fn exit(&self) {
        if let Some(mut trimmer) = self.trimmer.lock().take() {
            trimmer.stop();
        }
    }

    pub fn add_farm(&self, dir: Option<&Path>, roles: RoleMask) -> Result<FarmId> {
        self.farms.write().add_farm(dir, roles)
    }

    pub fn select_farm(&self, role: Role, heap_kind: HeapKind) -> Result<FarmId> {
        self.farms.read().select_farm(role, heap_kind)
    }

    /// Runs recovery against every registered farm with an on-disk root
    /// (§4.8); called once on startup before the engine is handed to
    /// callers, and again at the top of every `sync`.
    pub fn recover_all(&self) -> Result<()> {
        let farms = self.farms.read();
        for farm in farms_with_roots(&farms) {
            let table = Arc::clone(&self.table);
            recovery::recover(farm, &move |id| slot_is_live(&table, id))?;
        }
        Ok(())
    }

    /// `insert(desc) -> id` (§1, §3 lifecycle): allocates a fresh slot for
    /// a brand-new BAT, gives it the default `tmp_<octal>` name, and pins
    /// it once (`refs=1`) so nothing unloads it before the caller gets a
    /// chance to `retain`/`cacheit` it.
    pub fn insert(&self, desc: BatDescriptor, shard_hint: usize) -> Result<SlotId> {
        let id = self.table.alloc(shard_hint)?;
        let name = paths::default_name(id);
        let stem = paths::physical_stem(id);
        let mut status = Status::NEW | Status::EXISTING | Status::DELETING | Status::HOT;
        let persistent = self
            .farms
            .read()
            .farm(desc.farm_id)
            .is_some_and(|f| f.roles().contains(RoleMask::PERSISTENT));
        if persistent {
            status.insert(Status::PERSISTENT);
        }
        let mut slot = self.table.lock(id);
        slot.name = name.clone();
        slot.bak_name = name;
        slot.physical_stem = stem;
        slot.status = status;
        slot.refs = 1;
        slot.lrefs = 0;
        slot.pid = Some(thread::current().id());
        slot.desc = Some(desc);
        Ok(id)
    }

    /// `cacheit(id)` (§1, §3 lifecycle): publishes a slot `insert` left in
    /// its provisional `DELETING` state as a normal, fixable, loaded BAT.
    /// Mirrors spec.md's "cacheit sets LOADED, clears
    /// LOADING|DELETING|SWAPPED" — callers must run this once a freshly
    /// inserted BAT is fully built, before `fix`/`share` can pin it, since
    /// `fix` spins while `DELETING` is set.
    pub fn cacheit(&self, id: SlotId) {
        let mut slot = self.table.lock(id);
        slot.status.remove(Status::LOADING | Status::DELETING | Status::SWAPPED);
        slot.status.insert(Status::LOADED);
    }

    /// `cache(desc)` (§1): attaches a descriptor to an id that was already
    /// reserved (e.g. by catalog replay during startup) without going
    /// through the fresh-slot path.
    pub fn cache(&self, id: SlotId, name: String, desc: BatDescriptor) {
        self.table.reserve_up_to(id + 1);
        let stem = paths::physical_stem(id);
        let mut slot = self.table.lock(id);
        slot.name = name.clone();
        slot.physical_stem = stem;
        slot.status.insert(Status::EXISTING | Status::LOADED);
        slot.desc = Some(desc);
        drop(slot);
        self.names.insert(&self.table, &name, id);
    }

    /// `rename(id, new_name) -> status` (§1, §8 scenario 5): rejects the
    /// reserved `tmp_<octal>` shape and name collisions with a different id.
    pub fn rename(&self, id: SlotId, new_name: &str) -> Result<Status> {
        if paths::is_reserved_temp_name(new_name) {
            return Err(BbpError::IllegalTemporaryName(new_name.to_string()));
        }
        let old_name = self.table.lock(id).name.clone();
        if !self.names.rename(&self.table, &old_name, new_name, id) {
            return Err(BbpError::NameInUse(new_name.to_string()));
        }
        let mut slot = self.table.lock(id);
        slot.status.insert(Status::RENAMED);
        Ok(slot.status)
    }

    pub fn index(&self, name: &str) -> Option<SlotId> {
        self.names.lookup(&self.table, name)
    }

    /// Status/name lookup with no load, for callers that only need to
    /// check liveness or flags.
    pub fn quick_status(&self, id: SlotId) -> Option<Status> {
        if !slot_is_live(&self.table, id) {
            return None;
        }
        Some(self.table.lock(id).status)
    }

    /// `quick_descriptor(id) -> desc` (§1/§6): a cloned snapshot of the
    /// descriptor's metadata, taken without pinning or loading anything.
    /// Unlike `descriptor`, this never blocks on `UNLOADING`/`LOADING` and
    /// never touches `refs`.
    pub fn quick_descriptor(&self, id: SlotId) -> Option<BatSummary> {
        if !slot_is_live(&self.table, id) {
            return None;
        }
        self.table.lock(id).desc.as_ref().map(BatDescriptor::summary)
    }

    /// `descriptor(id) -> desc` (§1/§6): pins `id` (as `fix` would) and
    /// hands back its descriptor. The pin is the caller's to release with
    /// `unfix` once done, same as any other `fix`.
    pub fn descriptor(&self, id: SlotId) -> Result<MappedMutexGuard<'_, BatDescriptor>> {
        self.fix(id)?;
        let guard = self.table.lock(id);
        match MutexGuard::try_map(guard, |slot| slot.desc.as_mut()) {
            Ok(mapped) => Ok(mapped),
            Err(_) => {
                self.unfix(id)?;
                Err(BbpError::Precondition(format!(
                    "bat {id} has no descriptor to read"
                )))
            }
        }
    }

    /// `fix(id) -> refs'` (§4.4): pins a BAT, transitively pinning any
    /// parents first so a view's parent is never loaded while the child's
    /// own swap lock is held.
    pub fn fix(&self, id: SlotId) -> Result<u32> {
        let (tail_parent, vheap_parent) = {
            let slot = self.table.lock(id);
            match &slot.desc {
                Some(desc) => (desc.parents.tail_parent, desc.parents.vheap_parent),
                None => (None, None),
            }
        };
        for parent in [tail_parent, vheap_parent].into_iter().flatten() {
            if self.fix(parent).is_err() {
                return Err(BbpError::Precondition(format!(
                    "failed to pin parent {parent} of {id}"
                )));
            }
        }
        loop {
            let mut slot = self.table.lock(id);
            if slot.status.intersects(Status::UNSTABLE) {
                drop(slot);
                thread::sleep(SPIN_SLEEP);
                continue;
            }
            slot.status.insert(Status::HOT);
            slot.refs += 1;
            return Ok(slot.refs);
        }
    }

    /// `retain(id) -> lrefs'` (§4.4, §3 lifecycle): a long-lived logical
    /// hold. The first retain also clears `pid`, since the BAT now has a
    /// logical reference keeping it alive beyond its creating thread.
    pub fn retain(&self, id: SlotId) -> u32 {
        let mut slot = self.table.lock(id);
        slot.lrefs += 1;
        if slot.lrefs == 1 {
            slot.pid = None;
        }
        slot.lrefs
    }

    /// `share(parent)` (§4.5): a view creation pins and retains its parent
    /// and bumps its share count by one.
    pub fn share(&self, parent: SlotId) -> Result<()> {
        self.fix(parent)?;
        let mut slot = self.table.lock(parent);
        slot.lrefs += 1;
        slot.sharecnt += 1;
        Ok(())
    }

    /// `unshare(parent)` (§4.5): inverse of `share`.
    pub fn unshare(&self, parent: SlotId) {
        let mut slot = self.table.lock(parent);
        slot.sharecnt = slot.sharecnt.saturating_sub(1);
        slot.lrefs = slot.lrefs.saturating_sub(1);
    }

    /// `unfix(id)` (§4.4): decrements `refs`, evaluating the unload
    /// predicate once it reaches zero.
    pub fn unfix(&self, id: SlotId) -> Result<()> {
        let should_unload = {
            let mut slot = self.table.lock(id);
            if slot.refs == 0 {
                return Err(BbpError::Precondition(format!(
                    "unfix on {id} with refs already 0"
                )));
            }
            slot.refs -= 1;
            if slot.refs == 0 && unload_predicate(&slot, false) {
                slot.status.insert(Status::UNLOADING);
                true
            } else {
                false
            }
        };
        let parents = if should_unload {
            self.unload(id)?
        } else {
            Vec::new()
        };
        for parent in parents {
            self.unfix(parent)?;
        }
        Ok(())
    }

    /// `release(id)` (§4.4): decrements `lrefs`; on the last logical
    /// release of an otherwise-unpinned slot, clears it back to free.
    pub fn release(&self, id: SlotId) -> Result<()> {
        let should_clear = {
            let mut slot = self.table.lock(id);
            if slot.lrefs == 0 {
                return Err(BbpError::Precondition(format!(
                    "release on {id} with lrefs already 0"
                )));
            }
            slot.lrefs -= 1;
            slot.lrefs == 0 && slot.refs == 0
        };
        if should_clear {
            self.destroy_slot(id);
        }
        Ok(())
    }

    /// `keepref(id)` (§4.4): `retain; unfix` without running the unload
    /// predicate, so the BAT is guaranteed to still be loaded on return.
    pub fn keepref(&self, id: SlotId) -> Result<()> {
        let mut slot = self.table.lock(id);
        slot.lrefs += 1;
        if slot.refs == 0 {
            return Err(BbpError::Precondition(format!(
                "keepref on {id} with no physical pin held"
            )));
        }
        slot.refs -= 1;
        Ok(())
    }

    /// `cold(id)` (§4.9): clears `HOT` so the next trim pass considers the
    /// slot for unload if it is otherwise idle.
    pub fn cold(&self, id: SlotId) {
        self.table.lock(id).status.remove(Status::HOT);
    }

    fn unload(&self, id: SlotId) -> Result<Vec<SlotId>> {
        let (farm_id, parents, persistent) = {
            let mut slot = self.table.lock(id);
            let persistent = slot.status.contains(Status::PERSISTENT);
            let desc = slot.desc.as_mut();
            let farm_id = desc.as_ref().map(|d| d.farm_id).unwrap_or(0);
            let parents = desc.as_ref().map(|d| d.parents).unwrap_or_default();
            if let Some(desc) = desc {
                if desc.dirty() && persistent {
                    warn!("unloading dirty persistent bat {id} without a pending sync");
                }
                desc.detach_heaps();
            }
            (farm_id, parents, persistent)
        };
        let _ = (farm_id, persistent);
        let mut slot = self.table.lock(id);
        slot.status.remove(Status::UNLOADING);
        slot.status.insert(Status::SWAPPED);
        Ok([parents.tail_parent, parents.vheap_parent]
            .into_iter()
            .flatten()
            .collect())
    }

    /// `save(id)` (§1): persists a single BAT's dirty heaps outside of a
    /// full `sync`, writing straight to its live path rather than through
    /// the backup tree (no commit durability is implied).
    pub fn save(&self, root: &Path, id: SlotId) -> Result<()> {
        let mut slot = self.table.lock(id);
        let stem_path = root.join("bat").join(&slot.physical_stem);
        let Some(desc) = slot.desc.as_mut() else {
            return Ok(());
        };
        let tail_extension = tail_extension_for(desc);
        if let Some(tail) = desc.tail_mut() {
            tail.save(&stem_path.with_extension(tail_extension))?;
        }
        if let Some(vheap) = desc.vheap_mut() {
            vheap.save(&stem_path.with_extension(paths::VHEAP_EXTENSION))?;
        }
        Ok(())
    }

    /// `reclaim(id)` (§1): forcibly discards a BAT regardless of pins,
    /// used for aborting a half-built BAT that was never shared or
    /// retained. Callers must guarantee no other thread still holds `id`.
    pub fn reclaim(&self, id: SlotId) {
        self.destroy_slot(id);
    }

    /// Clears `id` back to free. If its descriptor is a view, first calls
    /// `unshare` on each distinct parent exactly once (§4.5: "destroying a
    /// view must call unshare on each parent exactly once"), undoing the
    /// `lrefs`/`sharecnt` bump `share` put on the parent at view creation.
    fn destroy_slot(&self, id: SlotId) {
        let parents = self
            .table
            .lock(id)
            .desc
            .as_ref()
            .map(|d| d.parents)
            .unwrap_or_default();
        self.clear_slot(id);
        let mut unshared = Vec::new();
        for parent in [parents.tail_parent, parents.vheap_parent]
            .into_iter()
            .flatten()
        {
            if !unshared.contains(&parent) {
                self.unshare(parent);
                unshared.push(parent);
            }
        }
    }

    fn clear_slot(&self, id: SlotId) {
        let (name, shard_hint) = {
            let mut slot = self.table.lock(id);
            slot.desc = None;
            slot.status = Status::empty();
            slot.pid = None;
            slot.bak_name.clear();
            (std::mem::take(&mut slot.name), id as usize)
        };
        self.names.remove(&self.table, &name, id);
        self.table.free(id, shard_hint);
    }

    pub fn size(&self) -> SlotId {
        self.table.size()
    }

    pub fn get_logno(&self) -> u64 {
        self.logno.load(Ordering::Relaxed)
    }

    pub fn get_transid(&self) -> u64 {
        self.transid.load(Ordering::Relaxed)
    }

    /// Stands in for `BBPlock()`/`BBPunlock()` (§4.4): callers that need
    /// exclusivity across the whole table (beyond per-slot locking) hold
    /// this for the duration.
    pub fn lock(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.tm.lock()
    }

    /// `sync(ids, sizes, logno, transid)` (§4.7): `ids = None` is a full
    /// commit, `Some(set)` a subcommit over exactly those ids.
    pub fn sync(
        &self,
        root: &Path,
        ids: Option<&[SlotId]>,
        logno: u64,
        transid: u64,
    ) -> Result<()> {
        let _tm = self.tm.lock();
        if !self.farms.read().is_well_formed() {
            return Err(BbpError::InvalidFarm(
                "sync requires both a PERSISTENT and a TRANSIENT farm registered".into(),
            ));
        }
        let table = Arc::clone(&self.table);
        recovery::recover(root, &move |id| slot_is_live(&table, id))?;

        let is_subcommit = ids.is_some();
        backup::prepare(root, is_subcommit)?;
        let backup_dir = if is_subcommit {
            paths::subcommit_dir(root)
        } else {
            paths::backup_dir(root)
        };

        let commit_set: Vec<SlotId> = match ids {
            Some(set) => set.to_vec(),
            None => (1..self.table.size())
                .filter(|&id| {
                    slot_is_live(&self.table, id)
                        && self.table.lock(id).status.contains(Status::PERSISTENT)
                })
                .collect(),
        };

        let mut fresh_entries = Vec::new();
        for &id in &commit_set {
            self.table.lock(id).status.insert(Status::SYNCING);
        }
        for &id in &commit_set {
            loop {
                let unloading = self.table.lock(id).status.contains(Status::UNLOADING);
                if !unloading {
                    break;
                }
                thread::sleep(SPIN_SLEEP);
            }
            if let Some(entry) = self.stage_and_save(root, &backup_dir, id)? {
                fresh_entries.push(entry);
            }
        }

        let catalog_path = paths::catalog_path(root);
        if is_subcommit {
            let pre_image_path = paths::catalog_path(&backup_dir);
            let pre_image = if pre_image_path.exists() {
                Catalog::read_from(&pre_image_path)?
            } else {
                Catalog::empty()
            };
            let mut merged = Catalog::merge_subcommit(&pre_image, fresh_entries);
            merged.header.bbp_size = self.table.size();
            merged.header.logno = logno;
            merged.header.transid = transid;
            merged.write_to(&paths::catalog_path(&backup_dir))?;
        } else {
            let mut catalog = Catalog::empty();
            catalog.header.bbp_size = self.table.size();
            catalog.header.logno = logno;
            catalog.header.transid = transid;
            for entry in fresh_entries {
                catalog.entries.insert(entry.id, entry);
            }
            catalog.write_to(&paths::catalog_path(&backup_dir))?;
        }
        let _ = catalog_path;

        backup::swap(root)?;
        backup::cleanup(root)?;

        self.logno.store(logno, Ordering::Relaxed);
        self.transid.store(transid, Ordering::Relaxed);
        for &id in &commit_set {
            self.table.lock(id).status.remove(Status::SYNCING);
        }
        Ok(())
    }

    fn stage_and_save(
        &self,
        root: &Path,
        backup_dir: &Path,
        id: SlotId,
    ) -> Result<Option<DirEntry>> {
        let mut slot = self.table.lock(id);
        let name = slot.name.clone();
        let physical_stem = slot.physical_stem.clone();
        let status = slot.status;
        let Some(desc) = slot.desc.as_mut() else {
            return Ok(None);
        };
        if !desc.dirty() {
            return Ok(None);
        }
        let stem_path = root.join("bat").join(&physical_stem);
        let tail_extension = tail_extension_for(desc);
        if let Some(tail) = desc.tail_mut() {
            let tail_path = stem_path.with_extension(tail_extension);
            backup::stage_heap_file(backup_dir, &tail_path, tail.storage(), id)?;
            tail.save(&tail_path)?;
        }
        if let Some(vheap) = desc.vheap_mut() {
            let vheap_path = stem_path.with_extension(paths::VHEAP_EXTENSION);
            backup::stage_heap_file(backup_dir, &vheap_path, vheap.storage(), id)?;
            vheap.save(&vheap_path)?;
        }
        debug!("saved bat {id}");
        Some(build_dir_entry(id, &name, &physical_stem, status, desc)).transpose()
    }
}

impl Trimmable for Bbp {
    fn clear_hot(&self) {
        for id in 1..self.table.size() {
            if !slot_is_live(&self.table, id) {
                continue;
            }
            let mut slot = self.table.lock(id);
            if slot.refs == 0 && slot.lrefs > 0 {
                slot.status.remove(Status::HOT);
            }
        }
    }

    fn trim(&self, aggressive: bool) -> usize {
        let mut unloaded = 0;
        for id in 1..self.table.size() {
            if !slot_is_live(&self.table, id) {
                continue;
            }
            let should = {
                let slot = self.table.lock(id);
                if slot.status.contains(Status::HOT) && !aggressive {
                    false
                } else {
                    unload_predicate(&slot, aggressive)
                }
            };
            if should {
                self.table.lock(id).status.insert(Status::UNLOADING);
                if self.unload(id).is_ok() {
                    unloaded += 1;
                }
            }
        }
        unloaded
    }

    fn memory_pressure(&self) -> f64 {
        // No VM introspection collaborator in scope (§1 Non-goals); report
        // a constant moderate pressure so the cadence still varies with the
        // spec's thresholds under test.
        0.3
    }
}

/// Picks the on-disk tail extension for `desc` (§4.7/§6): only
/// variable-width string tails use the width-tagged `.tail1/.tail2/.tail4`
/// names, everything else is plain `.tail`.
fn tail_extension_for(desc: &BatDescriptor) -> &'static str {
    if desc.var_flags.contains(VarFlags::VARWIDTH) {
        paths::tail_extension(Some(desc.width as u8))
    } else {
        paths::tail_extension(None)
    }
}

fn unload_predicate(slot: &crate::slot::Slot, aggressive: bool) -> bool {
    let Some(desc) = &slot.desc else { return false };
    if slot.refs != 0 || slot.sharecnt != 0 || desc.is_view() {
        return false;
    }
    if slot.status.intersects(Status::UNLOADING | Status::SYNCING | Status::SAVING) {
        return false;
    }
    let dirty_ok = !desc.dirty() || (aggressive && desc.all_heaps_mapped());
    if !dirty_ok {
        return false;
    }
    slot.lrefs == 0 || slot.status.contains(Status::PERSISTENT)
}

fn slot_is_live(table: &SlotTable, id: SlotId) -> bool {
    if id == 0 || id >= table.size() {
        return false;
    }
    table.lock(id).status.contains(Status::EXISTING)
}

fn farms_with_roots(farms: &FarmRegistry) -> Vec<&Path> {
    let mut out = Vec::new();
    let mut i = 0;
    while let Some(farm) = farms.farm(i) {
        if let Some(root) = farm.root() {
            out.push(root);
        }
        i += 1;
    }
    out
}

fn build_dir_entry(
    id: SlotId,
    name: &str,
    stem: &str,
    status: Status,
    desc: &BatDescriptor,
) -> Result<DirEntry> {
    desc.validate_properties().map_err(BbpError::CatalogMalformed)?;
    let tail_free = desc.tail().map(|h| h.len() as u64).unwrap_or(0);
    let tail_size = tail_free;
    let tail_storage = desc
        .tail()
        .map(|h| h.storage().into())
        .unwrap_or(crate::descriptor::StorageMode2::Private);
    let vheap = desc.vheap().map(|h| (h.len() as u64, h.len() as u64, h.storage().into()));
    // The catalog reader keys vheap-record presence off VARWIDTH (§4.6), so
    // an entry actually carrying a vheap must have the bit set regardless
    // of what the descriptor's own flags say.
    let mut var_flags = desc.var_flags;
    if vheap.is_some() {
        var_flags.insert(VarFlags::VARWIDTH);
    }
    Ok(DirEntry {
        id,
        status_bits: status.bits(),
        name: name.to_string(),
        physical_stem: stem.to_string(),
        restrict_flag: 0,
        count: desc.count,
        capacity: desc.capacity,
        hseqbase: desc.hseqbase,
        atom_type: desc.atom_type.clone(),
        width: desc.width,
        var_flags,
        properties: desc.properties,
        nokey0: desc.nokey0,
        nokey1: desc.nokey1,
        nosorted: desc.nosorted,
        norevsorted: desc.norevsorted,
        seqbase: desc.seqbase,
        tail_free,
        tail_size,
        tail_storage,
        minpos: desc.minpos,
        maxpos: desc.maxpos,
        vheap,
        options: desc.options.clone(),
    })
}
