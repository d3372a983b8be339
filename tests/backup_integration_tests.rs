//! Integration tests for BackupStore
//!
//! These tests verify:
//! - Snapshot and restore reproduce a directory tree exactly
//! - Progress reporting milestones
//! - Retention and listing across several snapshots

use modstage::backup::{BackupSettings, BackupStore, MANIFEST_NAME};
use std::{cell::RefCell, fs, io::Read, path::Path};
use tempfile::TempDir;

fn populate(root: &Path) {
    fs::create_dir_all(root.join("Packages").join("Nested")).unwrap();
    fs::create_dir_all(root.join("EmptyFolder")).unwrap();
    fs::create_dir_all(root.join(".cache")).unwrap();
    fs::write(root.join("resource.cfg"), "Priority 500\n").unwrap();
    fs::write(root.join("Packages").join("a.package"), vec![7u8; 200_000]).unwrap();
    fs::write(root.join("Packages").join("Nested").join("b.ts4script"), b"PK\x03\x04").unwrap();
    fs::write(root.join(".cache").join("index.bin"), b"skip me").unwrap();
    fs::write(root.join("desktop.ini"), b"[.ShellClassInfo]").unwrap();
}

#[test]
fn test_round_trip_restores_tree() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("Mods");
    let store_dir = dir.path().join("store");
    let target = dir.path().join("restored");
    populate(&source);

    let store = BackupStore::new(BackupSettings {
        game_version: Some("1.109.185".to_string()),
        ..BackupSettings::default()
    });
    let seen = RefCell::new(Vec::new());
    let progress = |percent: f32| seen.borrow_mut().push(percent);
    let snapshot = store.create_backup(&source, &store_dir, Some(&progress)).unwrap();

    let seen = seen.into_inner();
    assert_eq!(seen.last().copied(), Some(100.0));
    assert!(seen.contains(&95.0));
    assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]));
    assert!(store.verify_backup(&snapshot).is_valid());

    let mut archive = zip::ZipArchive::new(fs::File::open(&snapshot).unwrap()).unwrap();
    let mut raw = String::new();
    archive
        .by_name(MANIFEST_NAME)
        .unwrap()
        .read_to_string(&mut raw)
        .unwrap();
    let manifest: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(manifest["game_version"], "1.109.185");
    assert_eq!(manifest["total_files"], 3);

    let restored = store.restore_backup(&snapshot, &target, true, None).unwrap();
    assert_eq!(restored, 3);
    assert_eq!(
        fs::read(target.join("Packages").join("a.package")).unwrap(),
        vec![7u8; 200_000]
    );
    assert!(target.join("Packages").join("Nested").join("b.ts4script").is_file());
    assert!(target.join("EmptyFolder").is_dir());
    assert!(!target.join(".cache").exists());
    assert!(!target.join("desktop.ini").exists());
}

#[test]
fn test_retention_keeps_newest_snapshots() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("Mods");
    let store_dir = dir.path().join("store");
    populate(&source);

    let store = BackupStore::new(BackupSettings {
        retention_count: 2,
        ..BackupSettings::default()
    });
    let mut created = Vec::new();
    for _ in 0..4 {
        created.push(store.create_backup(&source, &store_dir, None).unwrap());
    }

    let listed: Vec<_> = store
        .list_backups(&store_dir)
        .into_iter()
        .map(|info| info.path)
        .collect();
    assert_eq!(listed, vec![created[3].clone(), created[2].clone()]);
    assert!(store.store_size(&store_dir) > 0);
}

#[test]
fn test_restore_refuses_missing_snapshot() {
    let dir = TempDir::new().unwrap();
    let err = BackupStore::default()
        .restore_backup(&dir.path().join("backup_missing.zip"), dir.path(), true, None)
        .unwrap_err();
    assert_eq!(err.kind(), modstage::ErrorKind::Backup);
}
