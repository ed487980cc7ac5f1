//! Crash recovery (§4.8): runs on startup and before every commit's prepare
//! phase. Idempotent — a crash mid-recovery just leaves work for the next
//! run to pick back up.

use std::fs;
use std::path::Path;

use log::{info, warn};

use crate::errors::Result;
use crate::paths::{self, KILL_SUFFIX};
use crate::types::SlotId;

const INDEX_EXTENSIONS: &[&str] = &[
    "tail", "tail1", "tail2", "tail4", "theap", "thashl", "thashb", "torderidx", "timprints",
];

/// What a disk scan decided about one unexpected file, surfaced to the
/// caller for logging/testing rather than acted on silently.
#[derive(Debug, PartialEq, Eq)]
pub enum ScanAction {
    Deleted(String),
    StoppedAt(String),
}

/// Runs the full recovery sequence against `root`. `known_ids` identifies
/// slots the in-memory catalog currently considers live, used to route
/// orphaned backup files to quarantine instead of guessing.
pub fn recover(root: &Path, known_ids: &dyn Fn(SlotId) -> bool) -> Result<()> {
    promote_subcommit(root)?;
    restore_catalog_if_crashed(root)?;
    walk_backup_tree(root, known_ids)?;
    let bak = paths::backup_dir(root);
    if bak.exists() {
        fs::remove_dir_all(&bak)?;
    }
    let swept = disk_scan(root, known_ids)?;
    for action in &swept {
        if let ScanAction::Deleted(name) = action {
            warn!("disk scan removed orphaned file {name}");
        }
    }
    Ok(())
}

/// Step 1: if `SUBDIR` exists, its contents belong in `BAKDIR` as if the
/// subcommit had staged directly there.
fn promote_subcommit(root: &Path) -> Result<()> {
    let sub = paths::subcommit_dir(root);
    if !sub.exists() {
        return Ok(());
    }
    let bak = paths::backup_dir(root);
    fs::create_dir_all(&bak)?;
    for entry in fs::read_dir(&sub)? {
        let entry = entry?;
        let dest = bak.join(entry.file_name());
        fs::rename(entry.path(), dest)?;
    }
    fs::remove_dir_all(&sub)?;
    info!("promoted subcommit staging into backup tree");
    Ok(())
}

/// Step 2: `BAKDIR/BBP.dir` surviving means a crash happened after staging
/// but before (or during) the swap; that catalog is the one that should be
/// live, so the stale live copy is renamed aside rather than deleted.
fn restore_catalog_if_crashed(root: &Path) -> Result<()> {
    let bak_catalog = paths::catalog_path(&paths::backup_dir(root));
    if !bak_catalog.exists() {
        return Ok(());
    }
    let live_catalog = paths::catalog_path(root);
    if live_catalog.exists() {
        let bak_aside = live_catalog.with_file_name("BBP.bak");
        fs::rename(&live_catalog, &bak_aside)?;
    }
    if let Some(parent) = live_catalog.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(&bak_catalog, &live_catalog)?;
    warn!("restored catalog from backup tree after an interrupted commit");
    Ok(())
}

/// Step 3: walk every file directly under `BAKDIR`, applying kill markers,
/// routing ordinary files back to their live location or into quarantine.
fn walk_backup_tree(root: &Path, known_ids: &dyn Fn(SlotId) -> bool) -> Result<()> {
    let bak = paths::backup_dir(root);
    if !bak.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(&bak)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "BBP.dir" {
            continue;
        }
        if let Some(stem) = name.strip_suffix(KILL_SUFFIX) {
            let live_new = paths::bat_dir(root).join(format!("{stem}.new"));
            if live_new.exists() {
                fs::remove_file(&live_new)?;
            }
            fs::remove_file(&path)?;
            continue;
        }
        match target_id_for(&name) {
            Some(id) if known_ids(id) => {
                let stem_path = paths::bat_dir(root).join(paths::physical_stem(id));
                let extension = name.split_once('.').map(|(_, ext)| ext).unwrap_or("");
                let dest_file = stem_path.with_extension(extension);
                if let Some(parent) = dest_file.parent() {
                    fs::create_dir_all(parent)?;
                }
                if dest_file.exists() {
                    fs::remove_file(&dest_file)?;
                }
                fs::rename(&path, &dest_file)?;
            }
            _ => {
                let left = paths::leftovers_dir(root);
                fs::create_dir_all(&left)?;
                fs::rename(&path, left.join(&name))?;
                warn!("quarantined orphan backup file {name} into LEFTOVERS");
            }
        }
    }
    Ok(())
}

/// Parses the leading octal stem out of a backup filename, e.g. `17.tail4`
/// -> `Some(15)`. Returns `None` for names that don't begin with digits.
fn target_id_for(name: &str) -> Option<SlotId> {
    let digits: String = name.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    u32::from_str_radix(&digits, 8).ok()
}

/// Step 5: deletes files under `BATDIR` that don't belong to any known
/// persistent BAT. Stops at the first unexpected name in a directory
/// (§4.8 "safety"), returning what it did for logging/testing.
pub fn disk_scan(
    root: &Path,
    known_ids: &dyn Fn(SlotId) -> bool,
) -> Result<Vec<ScanAction>> {
    let bat_dir = paths::bat_dir(root);
    let mut actions = Vec::new();
    if !bat_dir.exists() {
        return Ok(actions);
    }
    scan_dir(&bat_dir, known_ids, &mut actions)?;
    Ok(actions)
}

fn scan_dir(
    dir: &Path,
    known_ids: &dyn Fn(SlotId) -> bool,
    actions: &mut Vec<ScanAction>,
) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            scan_dir(&path, known_ids, actions)?;
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "BBP.dir" || name == "BBP.bak" {
            continue;
        }
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if !INDEX_EXTENSIONS.contains(&extension) {
            // An unrecognized filename is unexpected, not an orphan we
            // know how to judge; stop here rather than guess (§4.8 step 5
            // "safety").
            actions.push(ScanAction::StoppedAt(name));
            return Ok(());
        }
        if target_id_for(&name).map(known_ids).unwrap_or(false) {
            continue;
        }
        fs::remove_file(&path)?;
        actions.push(ScanAction::Deleted(name));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn subcommit_contents_are_promoted_into_backup() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        let sub = paths::subcommit_dir(root);
        fs::create_dir_all(&sub).unwrap();
        fs::write(sub.join("BBP.dir"), b"x").unwrap();
        promote_subcommit(root).unwrap();
        assert!(!sub.exists());
        assert!(paths::backup_dir(root).join("BBP.dir").exists());
    }

    #[test]
    fn kill_marker_deletes_pending_new_file() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(paths::bat_dir(root)).unwrap();
        fs::write(paths::bat_dir(root).join("01.tail.new"), b"x").unwrap();
        fs::create_dir_all(paths::backup_dir(root)).unwrap();
        fs::write(paths::backup_dir(root).join("01.tail.new.kill"), b"").unwrap();
        walk_backup_tree(root, &|_| true).unwrap();
        assert!(!paths::bat_dir(root).join("01.tail.new").exists());
    }

    #[test]
    fn orphan_file_is_quarantined() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(paths::backup_dir(root)).unwrap();
        fs::write(paths::backup_dir(root).join("99.tail"), b"x").unwrap();
        walk_backup_tree(root, &|_| false).unwrap();
        assert!(paths::leftovers_dir(root).join("99.tail").exists());
    }

    #[test]
    fn disk_scan_stops_at_an_unrecognized_extension_without_deleting_it() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        let bat = paths::bat_dir(root);
        fs::create_dir_all(&bat).unwrap();
        fs::write(bat.join("99.tail"), b"orphan").unwrap();
        fs::write(bat.join("weird.stuff"), b"???").unwrap();

        let actions = disk_scan(root, &|_| false).unwrap();

        assert!(actions.contains(&ScanAction::StoppedAt("weird.stuff".to_string())));
        assert!(bat.join("weird.stuff").exists());
    }

    #[test]
    fn disk_scan_removes_files_for_unknown_bats_and_keeps_known_ones() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        let bat = paths::bat_dir(root);
        fs::create_dir_all(&bat).unwrap();
        fs::write(bat.join("01.tail"), b"known").unwrap();
        fs::write(bat.join("99.tail"), b"orphan").unwrap();

        let actions = disk_scan(root, &|id| id == 1).unwrap();

        assert!(bat.join("01.tail").exists());
        assert!(!bat.join("99.tail").exists());
        assert_eq!(actions, vec![ScanAction::Deleted("99.tail".to_string())]);
    }
}
