use crate::{
    checksum::{checksum_file, Checksum},
    error::{ModError, Result, ThreatKind},
    screening::{self, Rejection, Verdict},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::mpsc::{self, RecvTimeoutError},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

const MIB: u64 = 1024 * 1024;
const CC_SIZE_THRESHOLD: u64 = 10 * MIB;

const SCRIPT_KEYWORDS: &[&str] = &["script", "tuning", "injector"];
const CORE_KEYWORDS: &[&str] = &[
    "mccc",
    "ui_cheats",
    "mc_command",
    "xml_injector",
    "better_exceptions",
    "tmex",
    "pose_player",
];
const LIBRARY_KEYWORDS: &[&str] = &["lib", "util"];
const CAS_KEYWORDS: &[&str] = &["cas", "create"];
const BUILD_BUY_KEYWORDS: &[&str] = &["build", "buy", "furniture", "decor"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Container,
    ScriptArchive,
    Script,
    Config,
    Project,
}

impl FileKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "package" => Some(FileKind::Container),
            "ts4script" => Some(FileKind::ScriptArchive),
            "py" => Some(FileKind::Script),
            "cfg" => Some(FileKind::Config),
            "bpi" => Some(FileKind::Project),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            FileKind::Container => "container",
            FileKind::ScriptArchive => "script-archive",
            FileKind::Script => "script",
            FileKind::Config => "config",
            FileKind::Project => "project",
        }
    }

    /// Scripts are always published at the staging root.
    pub fn is_script(self) -> bool {
        matches!(self, FileKind::Script | FileKind::ScriptArchive)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    CoreScripts,
    Libraries,
    CustomContent,
    MainMods,
    Invalid,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::CoreScripts,
        Category::Libraries,
        Category::CustomContent,
        Category::MainMods,
        Category::Invalid,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Category::CoreScripts => "Core Scripts",
            Category::Libraries => "Libraries",
            Category::CustomContent => "CC",
            Category::MainMods => "Main Mods",
            Category::Invalid => "Invalid",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScannerSettings {
    pub max_file_size_bytes: u64,
    pub file_timeout: Duration,
    pub directory_timeout: Duration,
    pub entropy_threshold: f64,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            max_file_size_bytes: 500 * MIB,
            file_timeout: Duration::from_secs(30),
            directory_timeout: Duration::from_secs(30),
            entropy_threshold: 7.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub size: u64,
    pub checksum: Option<Checksum>,
    pub kind: FileKind,
    pub category: Category,
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub entropy: f64,
}

impl ScannedFile {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    fn invalid(path: &Path, kind: FileKind, message: String) -> Self {
        let size = fs::metadata(path).map(|meta| meta.len()).unwrap_or(0);
        Self {
            path: path.to_path_buf(),
            size,
            checksum: None,
            kind,
            category: Category::Invalid,
            is_valid: false,
            errors: vec![message],
            entropy: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    Scanned(ScannedFile),
    Rejected(Rejection),
}

pub type ScanResult = BTreeMap<Category, Vec<ScannedFile>>;

/// Stateless apart from its settings; clones are cheap and independent scans may
/// run concurrently.
#[derive(Debug, Clone, Default)]
pub struct Scanner {
    settings: ScannerSettings,
}

impl Scanner {
    pub fn new(settings: ScannerSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ScannerSettings {
        &self.settings
    }

    pub fn scan_directory(&self, root: &Path) -> Result<ScanResult> {
        if !root.exists() {
            return Err(ModError::NotFound {
                path: root.to_path_buf(),
            });
        }
        if !root.is_dir() {
            return Err(ModError::NotADirectory {
                path: root.to_path_buf(),
            });
        }

        info!("Scanning folder: {}", root.display());
        let mut results: ScanResult = Category::ALL
            .iter()
            .map(|category| (*category, Vec::new()))
            .collect();
        let started = Instant::now();
        let directory_budget = self.settings.directory_timeout;
        let mut valid = 0usize;
        let mut invalid = 0usize;

        for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("Skipping unreadable entry under {}: {err}", root.display());
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let Some(kind) = FileKind::from_path(path) else {
                continue;
            };

            let elapsed = started.elapsed();
            if elapsed >= directory_budget {
                return Err(ModError::Timeout {
                    path: root.to_path_buf(),
                    seconds: directory_budget.as_secs(),
                });
            }
            let remaining = directory_budget - elapsed;
            let budget = self.settings.file_timeout.min(remaining);

            let file = match self.inspect_with_timeout(path, budget) {
                Ok(ScanOutcome::Scanned(file)) => file,
                Ok(ScanOutcome::Rejected(rejection)) => {
                    if rejection.threat == ThreatKind::ScanTimeout
                        && budget < self.settings.file_timeout
                    {
                        return Err(ModError::Timeout {
                            path: root.to_path_buf(),
                            seconds: directory_budget.as_secs(),
                        });
                    }
                    warn!(
                        target: "security",
                        "Rejected {}: {} ({})",
                        path.display(),
                        rejection.reason,
                        rejection.threat.label()
                    );
                    ScannedFile::invalid(
                        path,
                        kind,
                        format!("{}: {}", rejection.threat.label(), rejection.reason),
                    )
                }
                Err(err) => {
                    error!("Error scanning {}: {err}", path.display());
                    ScannedFile::invalid(path, kind, err.to_string())
                }
            };

            if file.is_valid {
                valid += 1;
                results.entry(file.category).or_default().push(file);
            } else {
                invalid += 1;
                warn!(
                    "Invalid mod: {} - {}",
                    file.file_name(),
                    file.errors.join(", ")
                );
                results.entry(Category::Invalid).or_default().push(file);
            }
        }

        info!("Scan complete: {valid} valid, {invalid} invalid/skipped");
        Ok(results)
    }

    /// Runs [`Scanner::inspect`] on a dedicated worker and stops waiting after `budget`.
    ///
    /// A worker that overruns is abandoned rather than killed; it keeps running
    /// until its blocking call returns.
    pub fn inspect_with_timeout(&self, path: &Path, budget: Duration) -> Result<ScanOutcome> {
        let (sender, receiver) = mpsc::channel();
        let scanner = self.clone();
        let owned = path.to_path_buf();
        thread::Builder::new()
            .name("scan-worker".to_string())
            .spawn(move || {
                let _ = sender.send(scanner.inspect(&owned));
            })
            .map_err(|err| ModError::io(path, "spawn scan worker", err))?;

        match receiver.recv_timeout(budget) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                error!(target: "security", "Scan timeout for {}", path.display());
                Ok(ScanOutcome::Rejected(Rejection::timeout(
                    path,
                    budget.as_secs(),
                )))
            }
            Err(RecvTimeoutError::Disconnected) => Err(ModError::io(
                path,
                "scan worker",
                io::Error::other("scan worker terminated unexpectedly"),
            )),
        }
    }

    /// Size check, checksum, signature, entropy, then categorisation.
    pub fn inspect(&self, path: &Path) -> Result<ScanOutcome> {
        let kind = FileKind::from_path(path).ok_or_else(|| ModError::InvalidPath {
            path: path.to_path_buf(),
            message: "unsupported file type".to_string(),
        })?;
        let size = fs::metadata(path)
            .map_err(|err| ModError::io(path, "stat", err))?
            .len();

        let mut errors = Vec::new();
        if size > self.settings.max_file_size_bytes {
            errors.push(format!(
                "File too large: {:.1}MB (max: {:.0}MB)",
                size as f64 / MIB as f64,
                self.settings.max_file_size_bytes as f64 / MIB as f64
            ));
        }

        let checksum = checksum_file(path)?;

        if let Verdict::Rejected(rejection) = screening::verify_signature(path, kind)? {
            return Ok(ScanOutcome::Rejected(rejection));
        }
        let (entropy, verdict) = screening::screen_entropy(path, self.settings.entropy_threshold)?;
        if let Verdict::Rejected(rejection) = verdict {
            return Ok(ScanOutcome::Rejected(rejection));
        }

        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let is_valid = errors.is_empty();
        let category = if is_valid {
            categorize(&name, size, kind)
        } else {
            Category::Invalid
        };
        debug!(
            "Scanned {name}: kind={} category={} entropy={entropy:.2}",
            kind.label(),
            category.label()
        );

        Ok(ScanOutcome::Scanned(ScannedFile {
            path: path.to_path_buf(),
            size,
            checksum: Some(checksum),
            kind,
            category,
            is_valid,
            errors,
            entropy,
        }))
    }

    /// Like [`Scanner::inspect`] but a rejection is a hard security error.
    pub fn scan_file(&self, path: &Path) -> Result<ScannedFile> {
        match self.inspect_with_timeout(path, self.settings.file_timeout)? {
            ScanOutcome::Scanned(file) => Ok(file),
            ScanOutcome::Rejected(rejection) => Err(rejection.into_error()),
        }
    }

    pub fn validate_file(&self, path: &Path) -> (bool, Vec<String>) {
        match self.scan_file(path) {
            Ok(file) => (file.is_valid, file.errors),
            Err(err) => (false, vec![err.to_string()]),
        }
    }
}

fn contains_any(haystack: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|keyword| haystack.contains(keyword))
}

/// Deterministic category from the file name, kind and size.
pub fn categorize(file_name: &str, size: u64, kind: FileKind) -> Category {
    let name = file_name.to_ascii_lowercase();
    match kind {
        FileKind::Script | FileKind::ScriptArchive => {
            if contains_any(&name, SCRIPT_KEYWORDS) || contains_any(&name, CORE_KEYWORDS) {
                Category::CoreScripts
            } else if contains_any(&name, LIBRARY_KEYWORDS) {
                Category::Libraries
            } else {
                Category::CoreScripts
            }
        }
        FileKind::Container => {
            if size > CC_SIZE_THRESHOLD
                || contains_any(&name, CAS_KEYWORDS)
                || contains_any(&name, BUILD_BUY_KEYWORDS)
            {
                Category::CustomContent
            } else if contains_any(&name, CORE_KEYWORDS) {
                Category::CoreScripts
            } else {
                Category::MainMods
            }
        }
        FileKind::Config => Category::Libraries,
        FileKind::Project => Category::MainMods,
    }
}
