use std::path::Path;
use std::sync::Arc;
use std::thread;

use bbpcore::descriptor::BatDescriptor;
use bbpcore::dir::Catalog;
use bbpcore::engine::Bbp;
use bbpcore::errors::BbpError;
use bbpcore::farm::{HeapKind, Role, RoleMask};
use bbpcore::heap::MmapHeap;
use bbpcore::status::Status;
use bbpcore::trimmer::Trimmable;

fn two_farm_engine(root: &Path) -> Arc<Bbp> {
    let bbp = Bbp::init(true);
    bbp.add_farm(Some(root), RoleMask::PERSISTENT).unwrap();
    bbp.add_farm(None, RoleMask::TRANSIENT).unwrap();
    bbp
}

#[test]
fn transient_bat_trimmed_after_unfix_leaves_no_files() {
    let dir = tempfile::tempdir().unwrap();
    let bbp = two_farm_engine(dir.path());
    let farm = bbp.select_farm(Role::Transient, HeapKind::Tail).unwrap();
    let id = bbp.insert(BatDescriptor::new("int", 4, farm), 0).unwrap();
    bbp.cacheit(id);
    bbp.unfix(id).unwrap();

    bbp.trim(false);
    assert!(!dir.path().join("bat").exists());
}

#[test]
fn persistent_bat_commit_stages_and_writes_heap_files() {
    let dir = tempfile::tempdir().unwrap();
    let bbp = two_farm_engine(dir.path());
    let mut desc = BatDescriptor::new("str", 4, 0);
    let mut tail = MmapHeap::new_private(0);
    tail.append(b"hello");
    desc.attach_tail(Box::new(tail));
    let id = bbp.insert(desc, 0).unwrap();
    bbp.retain(id);

    bbp.sync(dir.path(), None, 1, 1).unwrap();

    let catalog_path = dir.path().join("bat").join("BBP.dir");
    assert!(catalog_path.exists());
    let catalog = Catalog::read_from(&catalog_path).unwrap();
    assert_eq!(catalog.entries.len(), 1);
    let entry = catalog.entries.values().next().unwrap();
    assert_eq!(entry.tail_free, 5);
}

#[test]
fn view_holds_parent_share_count_until_released() {
    let dir = tempfile::tempdir().unwrap();
    let bbp = two_farm_engine(dir.path());
    let parent = bbp.insert(BatDescriptor::new("int", 4, 0), 0).unwrap();
    bbp.cacheit(parent);

    bbp.share(parent).unwrap();
    assert!(bbp.quick_status(parent).unwrap().contains(Status::HOT));

    let mut view = BatDescriptor::new("int", 4, 0);
    view.parents.tail_parent = Some(parent);
    let view_id = bbp.insert(view, 0).unwrap();
    bbp.retain(view_id);
    bbp.unfix(view_id).unwrap();
    assert!(bbp.quick_status(view_id).is_some());

    // Releasing the view's last reference must clear its slot and, per
    // §4.5, automatically unshare its parent (exact sharecnt/lrefs bookkeeping
    // is checked white-box in engine::tests since it isn't public API).
    bbp.release(view_id).unwrap();
    assert!(bbp.quick_status(view_id).is_none());
    assert!(bbp.quick_status(parent).is_some(), "the parent itself stays live");
}

#[test]
fn two_threads_create_ten_thousand_bats_without_id_collision() {
    let dir = tempfile::tempdir().unwrap();
    let bbp = two_farm_engine(dir.path());
    let mut handles = Vec::new();
    for t in 0..2 {
        let bbp = bbp.clone();
        handles.push(thread::spawn(move || {
            let mut ids = Vec::with_capacity(10_000);
            for _ in 0..10_000 {
                ids.push(bbp.insert(BatDescriptor::new("int", 4, 0), t).unwrap());
            }
            ids
        }));
    }
    let mut all_ids = Vec::new();
    for h in handles {
        all_ids.extend(h.join().unwrap());
    }
    all_ids.sort_unstable();
    let before = all_ids.len();
    all_ids.dedup();
    assert_eq!(before, all_ids.len(), "no two bats share an id");
    assert_eq!(bbp.size(), 20_001);
}

#[test]
fn rename_conflicts_are_rejected_with_distinct_errors() {
    let dir = tempfile::tempdir().unwrap();
    let bbp = two_farm_engine(dir.path());
    let a = bbp.insert(BatDescriptor::new("int", 4, 0), 0).unwrap();
    let b = bbp.insert(BatDescriptor::new("int", 4, 0), 0).unwrap();
    bbp.rename(a, "orders").unwrap();
    bbp.rename(b, "lineitem").unwrap();

    let err = bbp.rename(b, "orders").unwrap_err();
    assert!(matches!(err, BbpError::NameInUse(_)));

    let err = bbp.rename(a, "tmp_777").unwrap_err();
    assert!(matches!(err, BbpError::IllegalTemporaryName(_)));
}

#[test]
fn rename_then_rename_back_restores_name_index() {
    let dir = tempfile::tempdir().unwrap();
    let bbp = two_farm_engine(dir.path());
    let id = bbp.insert(BatDescriptor::new("int", 4, 0), 0).unwrap();
    let original = "column_a";
    bbp.rename(id, original).unwrap();
    bbp.rename(id, "column_b").unwrap();
    bbp.rename(id, original).unwrap();
    assert_eq!(bbp.index(original), Some(id));
    assert_eq!(bbp.index("column_b"), None);
}

#[test]
fn recovery_restores_catalog_and_clears_kill_marker() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    std::fs::create_dir_all(root.join("bat")).unwrap();
    std::fs::write(root.join("bat").join("01.tail.new"), b"pending").unwrap();

    let bak = root.join("bat").join("BACKUP");
    std::fs::create_dir_all(&bak).unwrap();
    let mut catalog = Catalog::empty();
    catalog.header.bbp_size = 2;
    catalog.write_to(&bak.join("BBP.dir")).unwrap();
    std::fs::write(bak.join("01.tail.new.kill"), b"").unwrap();

    let bbp = two_farm_engine(root);
    bbp.recover_all().unwrap();

    assert!(root.join("bat").join("BBP.dir").exists());
    assert!(!root.join("bat").join("01.tail.new").exists());
    assert!(!bak.exists());
}
