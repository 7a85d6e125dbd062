mod common;

use std::fs;

use common::{add_item, content_names, rating_config, stage_image, sync};
use hoard::core::fields::FieldValue;
use hoard::core::hash::Fingerprint;
use hoard::services::{
    FailureReason, FixedPolicy, LocalMirror, Resolution, SyncEngine, SyncOptions, SyncPhase,
};
use hoard::Store;
use tempfile::TempDir;

#[test]
fn test_new_staged_file_becomes_next_item() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("photos");
    let mut store = Store::create(&root, rating_config(None, false)).unwrap();

    let (staged, fingerprint) = stage_image(&store, "holiday.png", 5);
    let far = Fingerprint::new(!fingerprint.bits());
    for _ in 0..5 {
        add_item(&mut store, far);
    }

    let report = sync(&mut store);

    assert_eq!(report.staged, 1);
    assert_eq!(report.deleted, 0);
    assert_eq!(report.restaged, 0);
    assert!(report.failed.is_empty());
    assert!(!staged.exists());

    let item = store.get(6).unwrap();
    assert_eq!(item.file_name(), "00000006.png");
    assert_eq!(item.fingerprint, fingerprint);
    assert_eq!(item.field("rating"), Some(FieldValue::Int(0)));
    assert!(store.layout().contents().join("00000006.png").is_file());
    assert!(store.scan().unwrap().is_consistent());
}

#[test]
fn test_second_sync_is_a_no_op() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("photos");
    let mut store = Store::create(&root, rating_config(None, false)).unwrap();
    add_item(&mut store, Fingerprint::new(0));
    add_item(&mut store, Fingerprint::new(u64::MAX));
    stage_image(&store, "new.png", 9);

    sync(&mut store);
    let items = store.list().unwrap();
    let names = content_names(&store);

    let report = sync(&mut store);
    assert_eq!(report.deleted, 0);
    assert_eq!(report.restaged, 0);
    assert_eq!(report.staged, 0);
    assert_eq!(report.tweaks_restored, 0);
    assert_eq!(store.list().unwrap(), items);
    assert_eq!(content_names(&store), names);
}

#[test]
fn test_externally_deleted_file_removes_row() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("photos");
    let mut store = Store::create(&root, rating_config(None, false)).unwrap();
    let kept = add_item(&mut store, Fingerprint::new(0));
    let gone = add_item(&mut store, Fingerprint::new(u64::MAX));
    fs::remove_file(store.item_path(&gone)).unwrap();

    let report = sync(&mut store);

    assert_eq!(report.deleted, 1);
    let ids: Vec<_> = store.list().unwrap().iter().map(|item| item.id).collect();
    assert_eq!(ids, vec![kept.id]);
}

#[test]
fn test_orphan_from_interrupted_admission_is_restaged() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("photos");
    let mut store = Store::create(&root, rating_config(None, false)).unwrap();

    // A file moved into place whose row never committed.
    let (staged, fingerprint) = stage_image(&store, "crash.png", 7);
    add_item(&mut store, Fingerprint::new(!fingerprint.bits()));
    let orphan = store.layout().contents().join("00000002.png");
    fs::rename(&staged, &orphan).unwrap();
    assert!(!store.scan().unwrap().is_consistent());

    let report = sync(&mut store);

    assert_eq!(report.restaged, 1);
    assert_eq!(report.staged, 1);
    assert!(store.staged_files().unwrap().is_empty());
    let admitted = store
        .list()
        .unwrap()
        .into_iter()
        .find(|item| item.fingerprint == fingerprint)
        .unwrap();
    assert!(store.item_path(&admitted).is_file());
    assert!(store.scan().unwrap().is_consistent());
}

#[test]
fn test_collision_is_reported_and_left_staged() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("photos");
    let mut store = Store::create(&root, rating_config(None, false)).unwrap();
    stage_image(&store, "first.png", 4);
    sync(&mut store);

    let (duplicate, _) = stage_image(&store, "again.png", 4);
    let report = sync(&mut store);

    assert_eq!(report.staged, 0);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].reason, FailureReason::Collision);
    assert!(duplicate.exists());
}

#[test]
fn test_replace_through_sync() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("photos");
    let mut store = Store::create(&root, rating_config(None, false)).unwrap();
    stage_image(&store, "first.png", 4);
    sync(&mut store);
    stage_image(&store, "better.png", 4);

    let report = SyncEngine::new(LocalMirror)
        .sync(
            &mut store,
            SyncOptions::default(),
            &mut FixedPolicy(Resolution::Replace),
            &mut (),
            &mut (),
        )
        .unwrap();

    assert_eq!(report.staged, 1);
    assert_eq!(report.replaced, 1);
    assert_eq!(content_names(&store), vec!["00000002.png"]);
}

#[test]
fn test_no_stage_leaves_staging_alone() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("photos");
    let mut store = Store::create(&root, rating_config(None, false)).unwrap();
    let (staged, _) = stage_image(&store, "later.png", 6);

    let options = SyncOptions {
        stage: false,
        ..Default::default()
    };
    let report = SyncEngine::new(LocalMirror)
        .sync(
            &mut store,
            options,
            &mut FixedPolicy(Resolution::Skip),
            &mut (),
            &mut (),
        )
        .unwrap();

    assert!(!report.completed.contains(&SyncPhase::Staging));
    assert!(staged.exists());
    assert!(store.list().unwrap().is_empty());
}

#[test]
fn test_partial_transfer_leftover_is_removed() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("photos");
    let mut store = Store::create(&root, rating_config(None, false)).unwrap();
    add_item(&mut store, Fingerprint::new(0));
    let leftover = store.layout().contents().join(".hoard-partial-4242");
    fs::write(&leftover, "half an image").unwrap();

    let report = sync(&mut store);
    assert_eq!(report.restaged, 0);
    assert!(!leftover.exists());
    assert_eq!(fs::read_dir(store.layout().staging()).unwrap().count(), 0);

    // A second pass finds nothing left to do.
    let report = sync(&mut store);
    assert_eq!(report.restaged, 0);
    assert!(store.scan().unwrap().is_consistent());
}
