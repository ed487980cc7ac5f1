//! Farm registry (§4.1): maps storage roles to on-disk roots.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use fs4::fs_std::FileExt;

use crate::errors::{BbpError, Result};

bitflags! {
    /// The roles a farm may serve. A role mask with more than one bit means
    /// the farm backs every one of those roles.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RoleMask: u8 {
        /// Durable heaps that must survive a commit.
        const PERSISTENT       = 1 << 0;
        /// Scratch heaps that never reach disk.
        const TRANSIENT        = 1 << 1;
        /// Persistent hash/order-index side structures.
        const PERSISTENT_INDEX = 1 << 2;
    }
}

/// A single role a heap is requested for, as passed to `select_farm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Persistent,
    Transient,
    PersistentIndex,
}

impl Role {
    fn mask(self) -> RoleMask {
        match self {
            Role::Persistent => RoleMask::PERSISTENT,
            Role::Transient => RoleMask::TRANSIENT,
            Role::PersistentIndex => RoleMask::PERSISTENT_INDEX,
        }
    }
}

/// Which heap of a BAT a `select_farm` request concerns; kept only to match
/// the public API shape in §6, the core does not interpret it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapKind {
    Tail,
    Vheap,
    Index,
}

pub type FarmId = u8;

/// A farm: an on-disk root directory (or none, for in-memory-only
/// operation) plus the set of roles it serves.
pub struct Farm {
    id: FarmId,
    root: Option<PathBuf>,
    roles: RoleMask,
    /// Held for the process lifetime once a farm with a directory is
    /// registered, so two engines can't share a root concurrently.
    lock_file: Option<File>,
}

impl fmt::Debug for Farm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Farm")
            .field("id", &self.id)
            .field("root", &self.root)
            .field("roles", &self.roles)
            .finish()
    }
}

impl Farm {
    pub fn id(&self) -> FarmId {
        self.id
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn roles(&self) -> RoleMask {
        self.roles
    }

    /// A farm with no directory signals in-memory-only operation: heaps
    /// live only in memory and the commit protocol is bypassed for them.
    pub fn in_memory(&self) -> bool {
        self.root.is_none()
    }
}

/// Registry of the small fixed set of farms an engine knows about.
#[derive(Default)]
pub struct FarmRegistry {
    farms: Vec<Farm>,
}

impl FarmRegistry {
    pub fn new() -> Self {
        Self { farms: Vec::new() }
    }

    /// Registers a farm rooted at `dir` serving `roles`. Pass `dir = None`
    /// for an in-memory-only farm. Takes an advisory exclusive lock on a
    /// `.bbplock` file under the root so a second engine cannot attach to
    /// the same directory concurrently.
    pub fn add_farm(&mut self, dir: Option<&Path>, roles: RoleMask) -> Result<FarmId> {
        for farm in &self.farms {
            if farm.roles.intersects(roles) {
                return Err(BbpError::InvalidFarm(format!(
                    "role mask {roles:?} already served by farm {}",
                    farm.id
                )));
            }
        }
        let id = self.farms.len() as FarmId;
        let (root, lock_file) = match dir {
            None => (None, None),
            Some(dir) => {
                fs::create_dir_all(dir)?;
                let lock_path = dir.join(".bbplock");
                let lock_file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .open(&lock_path)?;
                lock_file.try_lock_exclusive().map_err(|_| {
                    BbpError::InvalidFarm(format!(
                        "farm root {} is already locked by another engine",
                        dir.display()
                    ))
                })?;
                (Some(dir.to_path_buf()), Some(lock_file))
            }
        };
        self.farms.push(Farm {
            id,
            root,
            roles,
            lock_file,
        });
        Ok(id)
    }

    pub fn farm(&self, id: FarmId) -> Option<&Farm> {
        self.farms.get(id as usize)
    }

    pub fn is_well_formed(&self) -> bool {
        let mut seen = RoleMask::empty();
        for farm in &self.farms {
            seen |= farm.roles;
        }
        seen.contains(RoleMask::PERSISTENT) && seen.contains(RoleMask::TRANSIENT)
    }

    /// Maps a `(role, heap kind)` request to a farm id (§4.1): persistent
    /// index heaps fall back to the transient farm when no farm explicitly
    /// serves `PERSISTENT_INDEX`.
    pub fn select_farm(&self, role: Role, heap_kind: HeapKind) -> Result<FarmId> {
        let mut want = role.mask();
        if heap_kind == HeapKind::Index && want == RoleMask::PERSISTENT {
            want = RoleMask::PERSISTENT_INDEX;
        }
        if let Some(farm) = self.farms.iter().find(|f| f.roles.contains(want)) {
            return Ok(farm.id);
        }
        if want == RoleMask::PERSISTENT_INDEX {
            // Indexes are allowed to degrade to the transient farm when the
            // build disables persistent indexes.
            if let Some(farm) = self
                .farms
                .iter()
                .find(|f| f.roles.contains(RoleMask::TRANSIENT))
            {
                return Ok(farm.id);
            }
        }
        Err(BbpError::InvalidFarm(format!(
            "no farm serves role {role:?} / {heap_kind:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn well_formed_requires_both_roles() {
        let mut reg = FarmRegistry::new();
        assert!(!reg.is_well_formed());
        let dir = tempdir().unwrap();
        reg.add_farm(Some(dir.path()), RoleMask::PERSISTENT).unwrap();
        assert!(!reg.is_well_formed());
        reg.add_farm(None, RoleMask::TRANSIENT).unwrap();
        assert!(reg.is_well_formed());
    }

    #[test]
    fn index_falls_back_to_transient() {
        let mut reg = FarmRegistry::new();
        reg.add_farm(None, RoleMask::PERSISTENT).unwrap();
        reg.add_farm(None, RoleMask::TRANSIENT).unwrap();
        let id = reg
            .select_farm(Role::Persistent, HeapKind::Index)
            .unwrap();
        assert_eq!(id, 1);
    }

    #[test]
    fn overlapping_roles_rejected() {
        let mut reg = FarmRegistry::new();
        reg.add_farm(None, RoleMask::PERSISTENT).unwrap();
        assert!(reg.add_farm(None, RoleMask::PERSISTENT).is_err());
    }
}
