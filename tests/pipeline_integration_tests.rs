//! Integration tests for the staging pipeline
//!
//! These tests verify:
//! - Scanning an incoming folder into categories
//! - Conflict detection across the scanned containers
//! - Materialising the numbered staging tree and reading back its load order

use modstage::{
    conflict::ConflictAnalyzer,
    container::{encode_container, ResourceId},
    load_order::OrderOrganizer,
    scanner::{Category, Scanner},
};
use std::{fs, io::Write, path::Path};
use tempfile::TempDir;

fn write_package(path: &Path, ids: &[ResourceId]) {
    fs::write(path, encode_container(ids)).unwrap();
}

fn write_script_archive(path: &Path) {
    let mut writer = zip::ZipWriter::new(fs::File::create(path).unwrap());
    writer
        .start_file("core/__init__.py", zip::write::SimpleFileOptions::default())
        .unwrap();
    writer.write_all(b"VERSION = 3\n").unwrap();
    writer.finish().unwrap();
}

fn populate_incoming(root: &Path) {
    fs::create_dir_all(root.join("downloads")).unwrap();
    write_script_archive(&root.join("mccc_core.ts4script"));
    write_package(&root.join("basic_library.package"), &[ResourceId::new(7, 0, 1)]);
    write_package(&root.join("gameplay.package"), &[ResourceId::new(1, 0, 42)]);
    write_package(
        &root.join("downloads").join("xml_tuning.package"),
        &[ResourceId::new(1, 0, 42), ResourceId::new(2, 0, 9)],
    );
    write_package(&root.join("downloads").join("hair_cas.package"), &[ResourceId::new(3, 0, 5)]);
    fs::write(root.join("renamed.package"), b"MZ\x90\x00 executable").unwrap();
    fs::write(root.join("notes.txt"), "not a mod").unwrap();
}

#[test]
fn test_scan_stage_and_export_order() {
    let dir = TempDir::new().unwrap();
    let incoming = dir.path().join("incoming");
    let staging = dir.path().join("staging");
    populate_incoming(&incoming);

    let scan = Scanner::default().scan_directory(&incoming).unwrap();
    let invalid: Vec<String> = scan[&Category::Invalid].iter().map(|f| f.file_name()).collect();
    assert_eq!(invalid, vec!["renamed.package"]);

    let organizer = OrderOrganizer::new();
    let grouped = organizer.group_by_slot(&scan);
    let tree = organizer.generate_structure(&grouped, &staging).unwrap();
    assert_eq!(tree.placements.len(), 5);
    assert!(staging.join("mccc_core.ts4script").is_file());
    assert!(staging.join("999_Overrides").is_dir());

    let (valid, issues) = organizer.validate_structure(&staging);
    assert!(valid, "unexpected issues: {issues:?}");
    assert_eq!(
        organizer.export_order(&staging),
        vec![
            "mccc_core.ts4script",
            "010_Libraries/basic_library.package",
            "020_MainMods/gameplay.package",
            "030_Tuning/xml_tuning.package",
            "040_CC/hair_cas.package",
        ]
    );

    let listing = dir.path().join("order.txt");
    assert_eq!(organizer.write_order_file(&staging, &listing).unwrap(), 5);
    let text = fs::read_to_string(&listing).unwrap();
    assert!(text.starts_with("001. mccc_core.ts4script"));
}

#[test]
fn test_conflicts_between_staged_containers() {
    let dir = TempDir::new().unwrap();
    let incoming = dir.path().join("incoming");
    populate_incoming(&incoming);

    let mods = vec![
        incoming.join("gameplay.package"),
        incoming.join("downloads").join("xml_tuning.package"),
        incoming.join("downloads").join("hair_cas.package"),
        incoming.join("mccc_core.ts4script"),
    ];
    let analyzer = ConflictAnalyzer::new();
    let map = analyzer.build_conflict_map(&mods);
    let conflicts = map.get_conflicts();

    let key = ResourceId::new(1, 0, 42).hex();
    assert_eq!(conflicts.len(), 1);
    let owners: Vec<&str> = conflicts[&key].iter().map(String::as_str).collect();
    assert_eq!(owners, vec!["gameplay.package", "xml_tuning.package"]);
    assert_eq!(map.skipped().len(), 1);

    let overlapping = analyzer
        .check_incremental(&incoming.join("gameplay.package"), &mods[1..])
        .unwrap();
    assert_eq!(overlapping.conflicting, vec!["xml_tuning.package"]);
    assert!(overlapping.skipped.is_empty());
    let err = analyzer
        .require_no_conflicts(&incoming.join("gameplay.package"), &mods[1..])
        .unwrap_err();
    assert_eq!(err.kind(), modstage::ErrorKind::Conflict);
}

#[test]
fn test_moving_a_container_to_overrides_changes_order() {
    let dir = TempDir::new().unwrap();
    let incoming = dir.path().join("incoming");
    let staging = dir.path().join("staging");
    populate_incoming(&incoming);

    let organizer = OrderOrganizer::new();
    let scan = Scanner::default().scan_directory(&incoming).unwrap();
    organizer
        .generate_structure(&organizer.group_by_slot(&scan), &staging)
        .unwrap();

    let moved = organizer
        .move_file("gameplay.package", "020_MainMods", "999_Overrides", &staging)
        .unwrap();
    assert_eq!(moved, staging.join("999_Overrides").join("gameplay.package"));
    assert_eq!(
        organizer.export_order(&staging).last().map(String::as_str),
        Some("999_Overrides/gameplay.package")
    );
}
