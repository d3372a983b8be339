use crate::{
    checksum::{checksum_file, checksum_reader, Checksum},
    error::{ModError, Result},
    fsutil::{is_hidden_or_system, remove_path},
    game::{LinkPlatform, NativeLinks},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt, fs,
    io::{self, Read, Write},
    path::{Path, PathBuf},
    thread,
    time::Duration,
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime, PrimitiveDateTime};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;
use zip::{write::SimpleFileOptions, CompressionMethod, ZipArchive, ZipWriter};

pub const MANIFEST_NAME: &str = "manifest.json";
pub const DEFAULT_STORE_DIR_NAME: &str = "ModManagerBackups";
const FILE_PREFIX: &str = "backup_";
const FILE_SUFFIX: &str = ".zip";
const MIB: f64 = 1024.0 * 1024.0;
const GIB: u64 = 1024 * 1024 * 1024;

/// Synchronous percentage callback.
pub type ProgressFn<'a> = &'a dyn Fn(f32);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub checksum: Checksum,
}

/// A symbolic link or junction captured as a link, never as its target's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkEntry {
    pub path: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub timestamp: String,
    #[serde(default)]
    pub game_version: Option<String>,
    pub total_files: usize,
    #[serde(default)]
    pub total_size_mb: f64,
    pub files: Vec<ManifestEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<LinkEntry>,
}

/// Result of [`BackupStore::verify_backup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupCheck {
    Valid,
    NotFound,
    CorruptArchive(String),
    MissingManifest,
    MalformedManifest(String),
    MissingEntry(String),
    ChecksumMismatch(String),
    LinkMismatch(String),
}

impl BackupCheck {
    pub fn is_valid(&self) -> bool {
        matches!(self, BackupCheck::Valid)
    }

    pub fn reason(&self) -> String {
        match self {
            BackupCheck::Valid => String::new(),
            BackupCheck::NotFound => "backup not found".to_string(),
            BackupCheck::CorruptArchive(detail) => format!("archive is corrupted: {detail}"),
            BackupCheck::MissingManifest => format!("missing {MANIFEST_NAME}"),
            BackupCheck::MalformedManifest(detail) => format!("manifest has invalid structure: {detail}"),
            BackupCheck::MissingEntry(path) => format!("missing file in backup: {path}"),
            BackupCheck::ChecksumMismatch(path) => format!("checksum mismatch for {path}"),
            BackupCheck::LinkMismatch(path) => format!("link target mismatch for {path}"),
        }
    }
}

impl fmt::Display for BackupCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            f.write_str("valid")
        } else {
            f.write_str(&self.reason())
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackupInfo {
    pub path: PathBuf,
    pub created: OffsetDateTime,
    pub size_bytes: u64,
    pub file_count: usize,
    pub is_valid: bool,
}

impl BackupInfo {
    pub fn size_mb(&self) -> f64 {
        round2(self.size_bytes as f64 / MIB)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackupSettings {
    pub retention_count: usize,
    pub size_warning_bytes: u64,
    pub game_version: Option<String>,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            retention_count: 10,
            size_warning_bytes: 5 * GIB,
            game_version: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackupStore {
    settings: BackupSettings,
}

impl BackupStore {
    pub fn new(settings: BackupSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &BackupSettings {
        &self.settings
    }

    /// Snapshots `source` into a new archive under `store_dir`.
    ///
    /// The archive is written to `*.zip.tmp`, verified, and only then renamed
    /// into place.
    pub fn create_backup(
        &self,
        source: &Path,
        store_dir: &Path,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<PathBuf> {
        if !source.is_dir() {
            return Err(ModError::backup(source, "create", "source directory does not exist"));
        }
        fs::create_dir_all(store_dir)
            .map_err(|err| ModError::io(store_dir, "create backup directory", err))?;

        let (created, snapshot) = next_snapshot_path(store_dir)?;
        let temp = temp_path(&snapshot);
        info!("Creating backup: {}", snapshot.display());

        let manifest = match self.write_archive(source, &temp, created, progress) {
            Ok(manifest) => manifest,
            Err(err) => {
                let _ = fs::remove_file(&temp);
                return Err(err);
            }
        };

        if let Some(report) = progress {
            report(95.0);
        }
        let check = self.verify_backup(&temp);
        if !check.is_valid() {
            let _ = fs::remove_file(&temp);
            return Err(ModError::backup(
                &snapshot,
                "verify",
                format!("backup integrity check failed: {}", check.reason()),
            ));
        }
        if let Err(err) = fs::rename(&temp, &snapshot) {
            let _ = fs::remove_file(&temp);
            return Err(ModError::io(&snapshot, "finalize backup", err));
        }
        if let Some(report) = progress {
            report(100.0);
        }
        info!(
            "Backup created: {} ({} MB, {} files)",
            snapshot.display(),
            manifest.total_size_mb,
            manifest.total_files
        );

        self.delete_old_backups(store_dir, self.settings.retention_count);
        self.check_store_size(store_dir);
        Ok(snapshot)
    }

    fn write_archive(
        &self,
        source: &Path,
        temp: &Path,
        created: OffsetDateTime,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<BackupManifest> {
        let entries = collect_entries(source)?;
        let file = fs::File::create(temp).map_err(|err| ModError::io(temp, "create backup", err))?;
        let mut writer = ZipWriter::new(file);
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(6))
            .large_file(true);

        let mut files = Vec::new();
        let mut links = Vec::new();
        let mut total_size = 0u64;
        let total = entries.len();
        for (index, entry) in entries.iter().enumerate() {
            let name = entry.name.as_str();
            match &entry.kind {
                EntryKind::Dir => writer
                    .add_directory(format!("{name}/"), options)
                    .map_err(|err| ModError::backup(temp, "write", err.to_string()))?,
                EntryKind::Link(target) => {
                    writer
                        .add_symlink(name, target.as_str(), options)
                        .map_err(|err| ModError::backup(temp, "write", err.to_string()))?;
                    links.push(LinkEntry {
                        path: name.to_string(),
                        target: target.clone(),
                    });
                }
                EntryKind::File => {
                    let path = &entry.path;
                    let checksum = checksum_file(path)?;
                    let mut input = fs::File::open(path)
                        .map_err(|err| ModError::io(path, "open for backup", err))?;
                    writer
                        .start_file(name, options)
                        .map_err(|err| ModError::backup(temp, "write", err.to_string()))?;
                    let copied = io::copy(&mut input, &mut writer)
                        .map_err(|err| ModError::io(path, "archive file", err))?;
                    total_size += copied;
                    files.push(ManifestEntry {
                        path: name.to_string(),
                        checksum,
                    });
                }
            }
            if let Some(report) = progress {
                report(((index + 1) as f32 / total as f32) * 90.0);
            }
        }

        let timestamp = created
            .format(&Rfc3339)
            .map_err(|err| ModError::backup(temp, "write", err.to_string()))?;
        let manifest = BackupManifest {
            timestamp,
            game_version: self.settings.game_version.clone(),
            total_files: files.len(),
            total_size_mb: round2(total_size as f64 / MIB),
            files,
            links,
        };
        let raw = serde_json::to_vec_pretty(&manifest)
            .map_err(|err| ModError::backup(temp, "write", err.to_string()))?;
        writer
            .start_file(MANIFEST_NAME, options)
            .map_err(|err| ModError::backup(temp, "write", err.to_string()))?;
        writer
            .write_all(&raw)
            .map_err(|err| ModError::io(temp, "write manifest", err))?;
        let file = writer
            .finish()
            .map_err(|err| ModError::backup(temp, "write", err.to_string()))?;
        file.sync_all()
            .map_err(|err| ModError::io(temp, "sync backup", err))?;
        Ok(manifest)
    }

    /// Extracts every entry except the manifest into `target`, recreating
    /// captured links as links. Returns the number of files written.
    pub fn restore_backup(
        &self,
        snapshot: &Path,
        target: &Path,
        verify_checksums: bool,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<usize> {
        if !snapshot.is_file() {
            return Err(ModError::backup(snapshot, "restore", "backup file not found"));
        }
        info!("Restoring backup: {}", snapshot.display());

        let mut archive = open_archive(snapshot)
            .map_err(|err| ModError::backup(snapshot, "restore", format!("backup file is corrupted: {err}")))?;
        let manifest = read_manifest(&mut archive)
            .map_err(|check| ModError::backup(snapshot, "restore", check.reason()))?;
        let expected: HashMap<&str, Checksum> = manifest
            .files
            .iter()
            .map(|entry| (entry.path.as_str(), entry.checksum))
            .collect();

        fs::create_dir_all(target).map_err(|err| ModError::io(target, "create restore target", err))?;

        let total = archive.len().saturating_sub(1).max(1);
        let mut restored = 0usize;
        let mut relinked = 0usize;
        let mut verified = 0usize;
        for index in 0..archive.len() {
            let mut entry = archive
                .by_index(index)
                .map_err(|err| ModError::backup(snapshot, "restore", err.to_string()))?;
            let name = entry.name().to_string();
            if name == MANIFEST_NAME {
                continue;
            }
            let Some(relative) = entry.enclosed_name() else {
                return Err(ModError::backup(
                    snapshot,
                    "restore",
                    format!("unsafe entry name: {name}"),
                ));
            };
            let out_path = target.join(relative);
            if is_link_mode(entry.unix_mode()) {
                let mut link_target = String::new();
                entry
                    .read_to_string(&mut link_target)
                    .map_err(|err| ModError::backup(snapshot, "restore", format!("{name}: {err}")))?;
                restore_link(Path::new(&link_target), &out_path)?;
                relinked += 1;
                continue;
            }
            if entry.is_dir() {
                fs::create_dir_all(&out_path)
                    .map_err(|err| ModError::io(&out_path, "restore directory", err))?;
                continue;
            }
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)
                    .map_err(|err| ModError::io(parent, "restore directory", err))?;
            }
            let mut output = fs::File::create(&out_path)
                .map_err(|err| ModError::io(&out_path, "restore file", err))?;
            io::copy(&mut entry, &mut output)
                .map_err(|err| ModError::io(&out_path, "restore file", err))?;
            drop(output);
            restored += 1;

            if verify_checksums {
                if let Some(expected) = expected.get(name.as_str()) {
                    let actual = checksum_file(&out_path)?;
                    if actual != *expected {
                        return Err(ModError::Integrity {
                            path: out_path,
                            expected: expected.to_string(),
                            actual: actual.to_string(),
                        });
                    }
                    verified += 1;
                }
            }
            if let Some(report) = progress {
                report((restored as f32 / total as f32 * 100.0).min(100.0));
            }
        }

        if verify_checksums && verified != expected.len() {
            return Err(ModError::backup(
                snapshot,
                "restore",
                format!("{} manifest entries are missing from the archive", expected.len() - verified),
            ));
        }
        if relinked != manifest.links.len() {
            return Err(ModError::backup(
                snapshot,
                "restore",
                format!(
                    "manifest lists {} links but the archive holds {relinked}",
                    manifest.links.len()
                ),
            ));
        }
        info!("Restored {restored} files and {relinked} links to {}", target.display());
        Ok(restored)
    }

    /// Structural and content check of a snapshot without extracting it.
    pub fn verify_backup(&self, snapshot: &Path) -> BackupCheck {
        if !snapshot.is_file() {
            return BackupCheck::NotFound;
        }
        let mut archive = match open_archive(snapshot) {
            Ok(archive) => archive,
            Err(err) => return BackupCheck::CorruptArchive(err),
        };
        for index in 0..archive.len() {
            let mut entry = match archive.by_index(index) {
                Ok(entry) => entry,
                Err(err) => return BackupCheck::CorruptArchive(err.to_string()),
            };
            let name = entry.name().to_string();
            if let Err(err) = io::copy(&mut entry, &mut io::sink()) {
                return BackupCheck::CorruptArchive(format!("{name}: {err}"));
            }
        }

        let manifest = match read_manifest(&mut archive) {
            Ok(manifest) => manifest,
            Err(check) => return check,
        };
        for listed in &manifest.files {
            let mut entry = match archive.by_name(&listed.path) {
                Ok(entry) => entry,
                Err(zip::result::ZipError::FileNotFound) => {
                    return BackupCheck::MissingEntry(listed.path.clone())
                }
                Err(err) => return BackupCheck::CorruptArchive(err.to_string()),
            };
            let actual = match checksum_reader(&mut entry) {
                Ok(actual) => actual,
                Err(err) => return BackupCheck::CorruptArchive(format!("{}: {err}", listed.path)),
            };
            if actual != listed.checksum {
                return BackupCheck::ChecksumMismatch(listed.path.clone());
            }
        }
        for link in &manifest.links {
            let mut entry = match archive.by_name(&link.path) {
                Ok(entry) => entry,
                Err(zip::result::ZipError::FileNotFound) => {
                    return BackupCheck::MissingEntry(link.path.clone())
                }
                Err(err) => return BackupCheck::CorruptArchive(err.to_string()),
            };
            let mut stored = String::new();
            let readable = entry.read_to_string(&mut stored).is_ok();
            if !readable || !is_link_mode(entry.unix_mode()) || stored != link.target {
                return BackupCheck::LinkMismatch(link.path.clone());
            }
        }
        debug!("Backup verified: {}", snapshot.display());
        BackupCheck::Valid
    }

    /// Snapshots in `store_dir`, newest first, each fully verified.
    pub fn list_backups(&self, store_dir: &Path) -> Vec<BackupInfo> {
        snapshot_files(store_dir)
            .into_iter()
            .map(|snapshot| {
                let file_count = open_archive(&snapshot.path)
                    .ok()
                    .and_then(|mut archive| read_manifest(&mut archive).ok())
                    .map(|manifest| manifest.total_files)
                    .unwrap_or(0);
                let is_valid = self.verify_backup(&snapshot.path).is_valid();
                BackupInfo {
                    path: snapshot.path,
                    created: snapshot.created,
                    size_bytes: snapshot.size_bytes,
                    file_count,
                    is_valid,
                }
            })
            .collect()
    }

    /// Deletes snapshots beyond the newest `keep`. Returns how many were removed.
    /// Age comes from the file name; archives are not opened.
    pub fn delete_old_backups(&self, store_dir: &Path, keep: usize) -> usize {
        let mut deleted = 0;
        for snapshot in snapshot_files(store_dir).iter().skip(keep) {
            match fs::remove_file(&snapshot.path) {
                Ok(()) => {
                    info!("Deleted old backup: {}", snapshot.path.display());
                    deleted += 1;
                }
                Err(err) => error!("Failed to delete backup {}: {err}", snapshot.path.display()),
            }
        }
        if deleted > 0 {
            info!("Deleted {deleted} old backup(s)");
        }
        deleted
    }

    /// Total bytes held by snapshots in `store_dir`.
    pub fn store_size(&self, store_dir: &Path) -> u64 {
        snapshot_files(store_dir)
            .iter()
            .map(|snapshot| snapshot.size_bytes)
            .sum()
    }

    fn check_store_size(&self, store_dir: &Path) -> bool {
        let total = self.store_size(store_dir);
        if total > self.settings.size_warning_bytes {
            warn!(
                "Total backup size ({:.2} GB) exceeds recommended limit ({:.2} GB)",
                total as f64 / GIB as f64,
                self.settings.size_warning_bytes as f64 / GIB as f64
            );
            return true;
        }
        false
    }
}

struct SnapshotFile {
    path: PathBuf,
    created: OffsetDateTime,
    size_bytes: u64,
}

/// Snapshot archives in `store_dir` by name and metadata only, newest first.
fn snapshot_files(store_dir: &Path) -> Vec<SnapshotFile> {
    let Ok(entries) = fs::read_dir(store_dir) else {
        return Vec::new();
    };
    let mut snapshots = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(created) = parse_snapshot_name(&entry.file_name().to_string_lossy()) else {
            continue;
        };
        match entry.metadata() {
            Ok(meta) if meta.is_file() => snapshots.push(SnapshotFile {
                path,
                created,
                size_bytes: meta.len(),
            }),
            Ok(_) => {}
            Err(err) => warn!("Failed to read backup {}: {err}", path.display()),
        }
    }
    snapshots.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| b.path.cmp(&a.path)));
    snapshots
}

enum EntryKind {
    File,
    Dir,
    Link(String),
}

struct LiveEntry {
    path: PathBuf,
    name: String,
    kind: EntryKind,
}

/// Everything under `source` except hidden and system artifacts. Links are
/// recorded with their target and never followed. Any walk failure is fatal.
fn collect_entries(source: &Path) -> Result<Vec<LiveEntry>> {
    let mut entries = Vec::new();
    let walker = WalkDir::new(source)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0 || !is_hidden_or_system(&entry.file_name().to_string_lossy())
        });
    for entry in walker {
        let entry = entry.map_err(|err| {
            let path = err.path().unwrap_or(source).to_path_buf();
            ModError::backup(path, "walk", err.to_string())
        })?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|err| ModError::backup(entry.path(), "walk", err.to_string()))?;
        let name = relative
            .components()
            .map(|part| part.as_os_str().to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join("/");
        let kind = if entry.path_is_symlink() {
            let target = fs::read_link(entry.path())
                .map_err(|err| ModError::io(entry.path(), "read link", err))?;
            let Some(target) = target.to_str() else {
                return Err(ModError::backup(
                    entry.path(),
                    "walk",
                    format!("link target is not valid UTF-8: {}", target.display()),
                ));
            };
            EntryKind::Link(target.to_string())
        } else if entry.file_type().is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        };
        entries.push(LiveEntry {
            path: entry.path().to_path_buf(),
            name,
            kind,
        });
    }
    Ok(entries)
}

fn is_link_mode(mode: Option<u32>) -> bool {
    const S_IFMT: u32 = 0o170000;
    const S_IFLNK: u32 = 0o120000;
    mode.is_some_and(|mode| mode & S_IFMT == S_IFLNK)
}

fn restore_link(link_target: &Path, out_path: &Path) -> Result<()> {
    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent).map_err(|err| ModError::io(parent, "restore directory", err))?;
    }
    remove_path(out_path).map_err(|err| ModError::io(out_path, "replace link", err))?;
    let links = NativeLinks;
    links
        .symbolic_link(link_target, out_path)
        .or_else(|_| links.directory_link(link_target, out_path))
        .map_err(|err| ModError::io(out_path, "restore link", err))
}

fn open_archive(path: &Path) -> std::result::Result<ZipArchive<fs::File>, String> {
    let file = fs::File::open(path).map_err(|err| err.to_string())?;
    ZipArchive::new(file).map_err(|err| err.to_string())
}

fn read_manifest(archive: &mut ZipArchive<fs::File>) -> std::result::Result<BackupManifest, BackupCheck> {
    let raw = {
        let mut entry = match archive.by_name(MANIFEST_NAME) {
            Ok(entry) => entry,
            Err(zip::result::ZipError::FileNotFound) => return Err(BackupCheck::MissingManifest),
            Err(err) => return Err(BackupCheck::CorruptArchive(err.to_string())),
        };
        let mut raw = Vec::new();
        io::copy(&mut entry, &mut raw).map_err(|err| BackupCheck::CorruptArchive(err.to_string()))?;
        raw
    };
    let manifest: BackupManifest = serde_json::from_slice(&raw)
        .map_err(|err| BackupCheck::MalformedManifest(err.to_string()))?;
    if manifest.total_files != manifest.files.len() {
        return Err(BackupCheck::MalformedManifest(format!(
            "total_files is {} but {} files are listed",
            manifest.total_files,
            manifest.files.len()
        )));
    }
    Ok(manifest)
}

fn snapshot_name(created: OffsetDateTime) -> Result<String> {
    let format = time::macros::format_description!(
        "[year]-[month]-[day]_[hour][minute][second]_[subsecond digits:6]"
    );
    let stamp = created
        .format(&format)
        .map_err(|err| ModError::backup(PathBuf::new(), "name", err.to_string()))?;
    Ok(format!("{FILE_PREFIX}{stamp}{FILE_SUFFIX}"))
}

fn next_snapshot_path(store_dir: &Path) -> Result<(OffsetDateTime, PathBuf)> {
    loop {
        let created = OffsetDateTime::now_utc();
        let path = store_dir.join(snapshot_name(created)?);
        if !path.exists() && !temp_path(&path).exists() {
            return Ok((created, path));
        }
        thread::sleep(Duration::from_millis(1));
    }
}

fn temp_path(snapshot: &Path) -> PathBuf {
    let mut name = snapshot.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn parse_snapshot_name(name: &str) -> Option<OffsetDateTime> {
    let stamp = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
    let format = time::macros::format_description!(
        "[year]-[month]-[day]_[hour][minute][second]_[subsecond digits:6]"
    );
    PrimitiveDateTime::parse(stamp, &format)
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
