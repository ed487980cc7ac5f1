//! Commit protocol (§4.7): stage dirty heaps into a backup tree, write a
//! fresh catalog, then an atomic rename that is the commit's linearization
//! point.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::errors::{BbpError, Result};
use crate::heap::StorageMode;
use crate::paths::{self, KILL_SUFFIX, PENDING_SUFFIX};
use crate::types::SlotId;

/// One heap file move decided during the stage phase, kept so `save` and a
/// future rollback both know what happened without re-deriving it.
#[derive(Debug)]
pub(crate) struct StagedHeap {
    pub id: SlotId,
    pub live_path: PathBuf,
    pub backup_path: PathBuf,
    pub wrote_kill_marker: bool,
}

/// Ensures `dir` exists and is empty of anything but the catalog file one
/// commit leaves behind for the next prepare to find.
pub(crate) fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    Ok(())
}

/// Phase 1 (Prepare). Moves any pending subcommit pre-image out of the way
/// and, for a subcommit, stashes the current `BAKDIR/BBP.dir` into `SUBDIR`.
pub(crate) fn prepare(root: &Path, is_subcommit: bool) -> Result<()> {
    let bak = paths::backup_dir(root);
    ensure_dir(&bak)?;
    if is_subcommit {
        let sub = paths::subcommit_dir(root);
        ensure_dir(&sub)?;
        let bak_dir = paths::catalog_path(&bak);
        if bak_dir.exists() {
            fs::rename(&bak_dir, paths::catalog_path(&sub))?;
        }
    }
    Ok(())
}

/// Phase 2 (Stage) for a single heap file. Chooses whichever of the `.new`
/// pre-image or the live file actually exists; if storage is private and
/// neither exists, records that a kill marker must be written so recovery
/// knows to discard a future `.new` on rollback.
pub(crate) fn stage_heap_file(
    backup_dir: &Path,
    live_path: &Path,
    storage: StorageMode,
    id: SlotId,
) -> Result<Option<StagedHeap>> {
    let pending = PathBuf::from(format!("{}{PENDING_SUFFIX}", live_path.display()));
    let basename = live_path
        .file_name()
        .ok_or_else(|| BbpError::CommitAborted("heap path has no filename".into()))?;
    let backup_path = backup_dir.join(basename);

    if pending.exists() {
        fs::create_dir_all(backup_dir)?;
        fs::rename(&pending, &backup_path)?;
        debug!("staged pre-image {} -> {}", pending.display(), backup_path.display());
        return Ok(Some(StagedHeap {
            id,
            live_path: live_path.to_path_buf(),
            backup_path,
            wrote_kill_marker: false,
        }));
    }
    if live_path.exists() {
        fs::create_dir_all(backup_dir)?;
        fs::rename(live_path, &backup_path)?;
        debug!("staged live file {} -> {}", live_path.display(), backup_path.display());
        return Ok(Some(StagedHeap {
            id,
            live_path: live_path.to_path_buf(),
            backup_path,
            wrote_kill_marker: false,
        }));
    }
    if storage == StorageMode::Private {
        fs::create_dir_all(backup_dir)?;
        let kill_path = PathBuf::from(format!("{}{KILL_SUFFIX}", backup_path.display()));
        fs::File::create(&kill_path)?;
        return Ok(Some(StagedHeap {
            id,
            live_path: live_path.to_path_buf(),
            backup_path: kill_path,
            wrote_kill_marker: true,
        }));
    }
    Ok(None)
}

/// Phase 4 (Swap). Renames `BAKDIR` to `DELDIR`; this rename is the
/// commit's linearization point. Retries once if a stale `DELDIR` from an
/// interrupted previous cleanup is still present.
pub(crate) fn swap(root: &Path) -> Result<()> {
    let bak = paths::backup_dir(root);
    let del = paths::delete_me_dir(root);
    match fs::rename(&bak, &del) {
        Ok(()) => Ok(()),
        Err(e) if del.exists() => {
            warn!("stale {} found, removing before retrying swap", del.display());
            fs::remove_dir_all(&del)?;
            fs::rename(&bak, &del).map_err(|e2| {
                BbpError::CommitAborted(format!("swap retry failed: {e2} (original: {e})"))
            })
        }
        Err(e) => Err(BbpError::CommitAborted(format!("swap failed: {e}"))),
    }
}

/// Phase 5 (Cleanup). Removes `DELDIR` and recreates an empty `BAKDIR` so
/// the next commit's prepare phase finds a clean slate.
pub(crate) fn cleanup(root: &Path) -> Result<()> {
    let del = paths::delete_me_dir(root);
    if del.exists() {
        fs::remove_dir_all(&del)?;
    }
    ensure_dir(&paths::backup_dir(root))?;
    info!("commit cleanup complete for {}", root.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn stage_prefers_pending_over_live() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        let live = root.join("bat/00.tail");
        fs::create_dir_all(live.parent().unwrap()).unwrap();
        fs::write(&live, b"old").unwrap();
        fs::write(format!("{}.new", live.display()), b"new").unwrap();

        let bak = paths::backup_dir(root);
        let staged = stage_heap_file(&bak, &live, StorageMode::MemoryMapped, 1)
            .unwrap()
            .unwrap();
        assert_eq!(fs::read(&staged.backup_path).unwrap(), b"new");
        assert!(live.exists(), "live file untouched when a pending pre-image wins");
    }

    #[test]
    fn stage_writes_kill_marker_for_private_heap_with_no_files() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        let live = root.join("bat/00.tail");
        let bak = paths::backup_dir(root);
        let staged = stage_heap_file(&bak, &live, StorageMode::Private, 1)
            .unwrap()
            .unwrap();
        assert!(staged.wrote_kill_marker);
        assert!(staged.backup_path.to_string_lossy().ends_with(".new.kill"));
    }

    #[test]
    fn swap_retries_past_stale_deldir() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        ensure_dir(&paths::backup_dir(root)).unwrap();
        fs::create_dir_all(paths::delete_me_dir(root)).unwrap();
        fs::write(paths::delete_me_dir(root).join("stale"), b"x").unwrap();
        swap(root).unwrap();
        assert!(paths::delete_me_dir(root).exists());
        assert!(!paths::backup_dir(root).exists());
    }
}
