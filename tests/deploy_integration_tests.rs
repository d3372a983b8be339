//! Integration tests for DeployEngine
//!
//! These tests verify:
//! - Publish fallback and the reported strategy
//! - Per-file verification of the published tree
//! - Automatic rollback on close failure, bad publish, misuse and panics
//! - Rollback after a failed step even when the body discards the error
//! - A previously published link is restored as a link
//! - Transaction misuse is rejected

use modstage::{
    backup::{BackupSettings, BackupStore},
    container::{encode_container, ResourceId},
    deploy::{
        DeployEngine, DeployProgress, DeploySettings, EngineState, PublishStrategy,
        RESOURCE_CFG, RESOURCE_CFG_NAME,
    },
    game::{CloseMode, LinkPlatform, ProcessControl},
    ErrorKind,
};
use std::{
    cell::RefCell,
    collections::BTreeMap,
    fs, io,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    time::Duration,
};
use tempfile::TempDir;
use walkdir::WalkDir;

struct FailingLinks;

impl LinkPlatform for FailingLinks {
    fn directory_link(&self, _target: &Path, _link: &Path) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::PermissionDenied, "junctions disabled"))
    }

    fn symbolic_link(&self, _target: &Path, _link: &Path) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::PermissionDenied, "symlinks disabled"))
    }
}

/// Reports success but publishes an empty directory.
struct BogusLinks;

impl LinkPlatform for BogusLinks {
    fn directory_link(&self, _target: &Path, link: &Path) -> io::Result<()> {
        fs::create_dir_all(link)
    }

    fn symbolic_link(&self, _target: &Path, link: &Path) -> io::Result<()> {
        fs::create_dir_all(link)
    }
}

struct StubbornProcess;

impl ProcessControl for StubbornProcess {
    fn application(&self) -> &str {
        "TS4_x64.exe"
    }

    fn is_running(&self) -> bool {
        true
    }

    fn request_close(&self, _mode: CloseMode) -> io::Result<()> {
        Ok(())
    }
}

struct PanickingProcess;

impl ProcessControl for PanickingProcess {
    fn application(&self) -> &str {
        "TS4_x64.exe"
    }

    fn is_running(&self) -> bool {
        panic!("process table unavailable");
    }

    fn request_close(&self, _mode: CloseMode) -> io::Result<()> {
        Ok(())
    }
}

struct Fixture {
    _dir: TempDir,
    staging: PathBuf,
    live: PathBuf,
    store: PathBuf,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let staging = dir.path().join("staging");
    let live = dir.path().join("Mods");
    let store = dir.path().join("ModManagerBackups");

    fs::create_dir_all(staging.join("020_MainMods")).unwrap();
    fs::create_dir_all(staging.join("040_CC").join("hair")).unwrap();
    fs::write(
        staging.join("020_MainMods").join("gameplay.package"),
        encode_container(&[ResourceId::new(1, 0, 42)]),
    )
    .unwrap();
    fs::write(
        staging.join("040_CC").join("hair").join("long_hair.package"),
        encode_container(&[ResourceId::new(3, 0, 5)]),
    )
    .unwrap();
    fs::write(staging.join("mccc_core.ts4script"), b"PK\x03\x04 script archive").unwrap();
    fs::write(staging.join("readme.txt"), "not deployed content").unwrap();

    fs::create_dir_all(live.join("Legacy").join("Empty")).unwrap();
    fs::write(live.join("old_mod.package"), encode_container(&[ResourceId::new(9, 9, 9)])).unwrap();
    fs::write(live.join("Legacy").join("notes.cfg"), "Priority 500\n").unwrap();

    Fixture {
        _dir: dir,
        staging,
        live,
        store,
    }
}

fn engine() -> DeployEngine {
    let settings = DeploySettings {
        close_timeout: Duration::from_millis(40),
        force_grace: Duration::from_millis(20),
        poll_interval: Duration::from_millis(5),
        ..DeploySettings::default()
    };
    DeployEngine::new(settings, BackupStore::new(BackupSettings::default()))
}

/// Every entry under `root` with file contents; directories map to `None`.
fn tree(root: &Path) -> BTreeMap<PathBuf, Option<Vec<u8>>> {
    WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .map(|entry| entry.unwrap())
        .map(|entry| {
            let rel = entry.path().strip_prefix(root).unwrap().to_path_buf();
            let contents = entry
                .file_type()
                .is_file()
                .then(|| fs::read(entry.path()).unwrap());
            (rel, contents)
        })
        .collect()
}

#[test]
fn test_copy_fallback_publishes_and_verifies() {
    let fx = fixture();
    let mut engine = engine().with_link_platform(Box::new(FailingLinks));
    let steps = RefCell::new(Vec::new());
    let progress = |update: DeployProgress| steps.borrow_mut().push(update.percent);

    let report = engine
        .transaction(|scope| scope.deploy(&fx.staging, &fx.live, Some(&progress), true))
        .unwrap();

    assert_eq!(report.strategy, PublishStrategy::Copy);
    assert_eq!(report.strategy.label(), "copy");
    assert_eq!(report.verified_files, 3);
    assert_eq!(report.published, fx.live.join("ActiveMods"));
    assert!(report.backup.starts_with(&fx.store));
    assert_eq!(engine.state(), EngineState::Committed);
    assert!(engine.current_transaction().is_none());
    assert_eq!(*steps.borrow(), vec![0, 10, 20, 30, 40, 50, 60, 80, 90, 100]);

    let published = fx.live.join("ActiveMods");
    assert!(!fs::symlink_metadata(&published).unwrap().file_type().is_symlink());
    assert!(published.join("040_CC").join("hair").join("long_hair.package").is_file());
    assert_eq!(
        fs::read_to_string(fx.live.join(RESOURCE_CFG_NAME)).unwrap(),
        RESOURCE_CFG
    );
    assert!(fx.live.join("old_mod.package").is_file());

    let backups = BackupStore::default().list_backups(&fx.store);
    assert_eq!(backups.len(), 1);
    assert!(backups[0].is_valid);
    assert_eq!(backups[0].file_count, 2);
}

#[cfg(unix)]
#[test]
fn test_native_links_fall_back_to_symlink() {
    let fx = fixture();
    let mut engine = engine();
    let report = engine
        .transaction(|scope| scope.deploy(&fx.staging, &fx.live, None, false))
        .unwrap();

    assert_eq!(report.strategy, PublishStrategy::Symlink);
    let published = fx.live.join("ActiveMods");
    assert!(fs::symlink_metadata(&published).unwrap().file_type().is_symlink());
    assert!(published.join("mccc_core.ts4script").is_file());
}

#[test]
fn test_single_byte_alteration_is_reported() {
    let fx = fixture();
    let mut engine = engine().with_link_platform(Box::new(FailingLinks));
    let report = engine
        .transaction(|scope| scope.deploy(&fx.staging, &fx.live, None, false))
        .unwrap();

    let altered = report.published.join("020_MainMods").join("gameplay.package");
    let mut bytes = fs::read(&altered).unwrap();
    bytes[60] ^= 0x01;
    fs::write(&altered, bytes).unwrap();

    let verification = engine
        .verify_deployment(&fx.staging, &report.published)
        .unwrap();
    assert_eq!(verification.checked, 3);
    assert_eq!(
        verification.mismatched(),
        vec![Path::new("020_MainMods/gameplay.package")]
    );
    assert!(verification.missing().is_empty());
}

#[test]
fn test_unclosable_game_rolls_back_live_directory() {
    let fx = fixture();
    let before = tree(&fx.live);
    let mut engine = engine()
        .with_link_platform(Box::new(FailingLinks))
        .with_process_control(Box::new(StubbornProcess));

    let err = engine
        .transaction(|scope| scope.deploy(&fx.staging, &fx.live, None, true))
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ProcessControl);
    assert_eq!(engine.state(), EngineState::RolledBack);
    assert_eq!(tree(&fx.live), before);
    assert_eq!(BackupStore::default().list_backups(&fx.store).len(), 1);
}

#[test]
fn test_bad_publish_fails_verification_and_rolls_back() {
    let fx = fixture();
    let before = tree(&fx.live);
    let mut engine = engine().with_link_platform(Box::new(BogusLinks));

    let err = engine
        .transaction(|scope| scope.deploy(&fx.staging, &fx.live, None, false))
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Integrity);
    assert!(err.to_string().contains("missing"));
    assert_eq!(tree(&fx.live), before);
}

#[test]
fn test_discarded_deploy_error_still_rolls_back() {
    let fx = fixture();
    let before = tree(&fx.live);
    let mut engine = engine().with_link_platform(Box::new(BogusLinks));

    let err = engine
        .transaction(|scope| {
            let _ = scope.deploy(&fx.staging, &fx.live, None, false);
            Ok(())
        })
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Transaction);
    assert!(err.to_string().contains("rolled back"));
    assert_eq!(engine.state(), EngineState::RolledBack);
    assert!(engine.current_transaction().is_none());
    assert_eq!(tree(&fx.live), before);
}

#[cfg(unix)]
#[test]
fn test_previous_published_link_survives_rollback() {
    let fx = fixture();
    let previous = fx.staging.parent().unwrap().join("previous_staging");
    fs::create_dir_all(&previous).unwrap();
    fs::write(previous.join("earlier.package"), b"DBPF earlier").unwrap();
    let published = fx.live.join("ActiveMods");
    std::os::unix::fs::symlink(&previous, &published).unwrap();
    let before = tree(&fx.live);

    let assert_link_intact = |engine: &DeployEngine| {
        assert_eq!(engine.state(), EngineState::RolledBack);
        assert!(fs::symlink_metadata(&published).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&published).unwrap(), previous);
        assert_eq!(tree(&fx.live), before);
        assert_eq!(fs::read(previous.join("earlier.package")).unwrap(), b"DBPF earlier");
    };

    let mut unclosable = engine()
        .with_link_platform(Box::new(FailingLinks))
        .with_process_control(Box::new(StubbornProcess));
    let err = unclosable
        .transaction(|scope| scope.deploy(&fx.staging, &fx.live, None, true))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProcessControl);
    assert_link_intact(&unclosable);

    let mut bogus = engine().with_link_platform(Box::new(BogusLinks));
    let err = bogus
        .transaction(|scope| scope.deploy(&fx.staging, &fx.live, None, false))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Integrity);
    assert_link_intact(&bogus);
}

#[test]
fn test_panic_inside_transaction_rolls_back() {
    let fx = fixture();
    let before = tree(&fx.live);
    let mut engine = engine()
        .with_link_platform(Box::new(FailingLinks))
        .with_process_control(Box::new(PanickingProcess));

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        engine.transaction(|scope| scope.deploy(&fx.staging, &fx.live, None, true))
    }));

    assert!(outcome.is_err());
    assert_eq!(engine.state(), EngineState::RolledBack);
    assert_eq!(tree(&fx.live), before);
}

#[test]
fn test_deploy_outside_transaction_is_rejected() {
    let fx = fixture();
    let mut engine = engine();
    let err = engine.deploy(&fx.staging, &fx.live, None, false).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Transaction);
    assert!(!fx.store.exists());
    assert!(!fx.live.join(RESOURCE_CFG_NAME).exists());
}

#[test]
fn test_second_deploy_in_one_transaction_is_rejected() {
    let fx = fixture();
    let before = tree(&fx.live);
    let mut engine = engine().with_link_platform(Box::new(FailingLinks));

    let err = engine
        .transaction(|scope| {
            scope.deploy(&fx.staging, &fx.live, None, false)?;
            scope.deploy(&fx.staging, &fx.live, None, false)
        })
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Transaction);
    assert_eq!(engine.state(), EngineState::RolledBack);
    assert_eq!(tree(&fx.live), before);
}

#[test]
fn test_staging_without_installable_files_is_rejected() {
    let fx = fixture();
    let empty = fx.staging.parent().unwrap().join("empty_staging");
    fs::create_dir_all(&empty).unwrap();
    fs::write(empty.join("readme.txt"), "nothing to install").unwrap();

    let mut engine = engine();
    let err = engine
        .transaction(|scope| scope.deploy(&empty, &fx.live, None, false))
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Path);
    assert!(!fx.store.exists());

    let missing = fx.staging.parent().unwrap().join("missing");
    let err = engine
        .transaction(|scope| scope.deploy(&fx.staging, &missing, None, false))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Path);
}
