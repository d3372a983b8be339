use crate::{
    backup::{BackupStore, DEFAULT_STORE_DIR_NAME},
    checksum::{checksum_file, Checksum},
    error::{ModError, Result},
    fsutil::{copy_with_mtime, is_hidden_or_system, is_installable, remove_path},
    game::{CloseMode, LinkPlatform, NativeLinks, ProcessControl, UnmanagedProcess},
    load_order::OrderOrganizer,
};
use std::{
    fs, io,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

pub const RESOURCE_CFG_NAME: &str = "resource.cfg";

/// Load directives read by the game. Written byte for byte.
pub const RESOURCE_CFG: &str = "Priority 1000
PackedFile Mods/ActiveMods/*.package
DirectoryFiles Mods/ActiveMods/*.package
DirectoryFiles Mods/ActiveMods/*/*.package
DirectoryFiles Mods/ActiveMods/*/*/*.package
DirectoryFiles Mods/ActiveMods/*/*/*/*.package
DirectoryFiles Mods/ActiveMods/*/*/*/*/*.package
";

const REQUIRED_DIRECTIVES: [&str; 2] = ["Priority", "DirectoryFiles"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PublishStrategy {
    DirectoryLink,
    Symlink,
    Copy,
}

impl PublishStrategy {
    /// Cheapest first.
    pub const ORDER: [PublishStrategy; 3] = [
        PublishStrategy::DirectoryLink,
        PublishStrategy::Symlink,
        PublishStrategy::Copy,
    ];

    pub fn label(self) -> &'static str {
        match self {
            PublishStrategy::DirectoryLink => "directory-link",
            PublishStrategy::Symlink => "symlink",
            PublishStrategy::Copy => "copy",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeploySettings {
    pub close_timeout: Duration,
    pub force_grace: Duration,
    pub poll_interval: Duration,
    pub published_dir_name: String,
    pub backup_store_dir: Option<PathBuf>,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            close_timeout: Duration::from_secs(10),
            force_grace: Duration::from_secs(2),
            poll_interval: Duration::from_millis(250),
            published_dir_name: "ActiveMods".to_string(),
            backup_store_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeployProgress {
    pub percent: u8,
    pub step: &'static str,
}

pub type DeployProgressFn<'a> = &'a dyn Fn(DeployProgress);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    InTransaction,
    Committed,
    RolledBack,
}

/// Mutable record of the open transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentTransaction {
    pub backup: Option<PathBuf>,
    pub published: Option<PathBuf>,
    pub strategy: Option<PublishStrategy>,
    /// Set when a deployment step fails. The transaction rolls back on close
    /// whatever the body returns.
    pub failure: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployReport {
    pub strategy: PublishStrategy,
    pub verified_files: usize,
    pub backup: PathBuf,
    pub published: PathBuf,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationFailure {
    /// Relative to the staging root.
    pub path: PathBuf,
    pub expected: Checksum,
    /// `None` when the file is missing from the published tree.
    pub actual: Option<Checksum>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationReport {
    pub checked: usize,
    pub failures: Vec<VerificationFailure>,
}

impl VerificationReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn missing(&self) -> Vec<&Path> {
        self.failures
            .iter()
            .filter(|failure| failure.actual.is_none())
            .map(|failure| failure.path.as_path())
            .collect()
    }

    pub fn mismatched(&self) -> Vec<&Path> {
        self.failures
            .iter()
            .filter(|failure| failure.actual.is_some())
            .map(|failure| failure.path.as_path())
            .collect()
    }
}

/// Publishes a staging tree into the live directory with backup, verification
/// and automatic rollback.
///
/// One transaction at a time per engine. Deployments racing on the same live
/// directory from different engines must be serialised by the caller.
pub struct DeployEngine {
    settings: DeploySettings,
    backups: BackupStore,
    process: Box<dyn ProcessControl>,
    links: Box<dyn LinkPlatform>,
    state: EngineState,
    current: Option<DeploymentTransaction>,
}

impl DeployEngine {
    pub fn new(settings: DeploySettings, backups: BackupStore) -> Self {
        Self {
            settings,
            backups,
            process: Box::new(UnmanagedProcess::default()),
            links: Box::new(NativeLinks),
            state: EngineState::Idle,
            current: None,
        }
    }

    pub fn with_process_control(mut self, process: Box<dyn ProcessControl>) -> Self {
        self.process = process;
        self
    }

    pub fn with_link_platform(mut self, links: Box<dyn LinkPlatform>) -> Self {
        self.links = links;
        self
    }

    pub fn settings(&self) -> &DeploySettings {
        &self.settings
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn current_transaction(&self) -> Option<&DeploymentTransaction> {
        self.current.as_ref()
    }

    /// Runs `body` inside a transaction. An error from the body or from any
    /// deploy step rolls back whatever was deployed, as does a panic unwinding
    /// through the body.
    pub fn transaction<T>(
        &mut self,
        body: impl FnOnce(&mut TransactionScope<'_>) -> Result<T>,
    ) -> Result<T> {
        self.begin()?;
        let mut scope = TransactionScope {
            engine: self,
            closed: false,
        };
        let outcome = body(&mut scope);
        scope.close(outcome)
    }

    fn begin(&mut self) -> Result<()> {
        if self.state == EngineState::InTransaction {
            return Err(ModError::Transaction {
                message: "a transaction is already open on this engine".to_string(),
            });
        }
        self.state = EngineState::InTransaction;
        self.current = Some(DeploymentTransaction::default());
        info!(target: "deploy", "=== BEGIN DEPLOYMENT TRANSACTION ===");
        Ok(())
    }

    fn commit(&mut self) {
        self.current = None;
        self.state = EngineState::Committed;
        info!(target: "deploy", "=== END DEPLOYMENT TRANSACTION (committed) ===");
    }

    fn abort(&mut self, cause: &str) {
        error!(target: "deploy", "Transaction failed: {cause}");
        if let Some(record) = self.current.take() {
            if let (Some(backup), Some(published)) = (record.backup, record.published) {
                warn!(target: "deploy", "Initiating automatic rollback");
                if let Err(err) = self.rollback(&backup, &published) {
                    error!(target: "deploy", "Rollback failed: {err}");
                }
            }
        }
        self.state = EngineState::RolledBack;
        info!(target: "deploy", "=== END DEPLOYMENT TRANSACTION (rolled back) ===");
    }

    /// Runs the deployment steps in order. Must be called inside
    /// [`DeployEngine::transaction`].
    pub fn deploy(
        &mut self,
        staged_root: &Path,
        live_root: &Path,
        progress: Option<DeployProgressFn<'_>>,
        close_running_app: bool,
    ) -> Result<DeployReport> {
        match &self.current {
            Some(record) if self.state == EngineState::InTransaction => {
                if record.backup.is_some() {
                    return Err(ModError::Transaction {
                        message: "deploy already ran in this transaction".to_string(),
                    });
                }
            }
            _ => {
                return Err(ModError::Transaction {
                    message: "deploy must be called within a transaction".to_string(),
                })
            }
        }

        let result = self.run_steps(staged_root, live_root, progress, close_running_app);
        if let Err(err) = &result {
            if let Some(record) = self.current.as_mut() {
                record.failure = Some(err.to_string());
            }
        }
        result
    }

    fn run_steps(
        &mut self,
        staged_root: &Path,
        live_root: &Path,
        progress: Option<DeployProgressFn<'_>>,
        close_running_app: bool,
    ) -> Result<DeployReport> {
        report(progress, 0, "Validating paths");
        let staged_root = absolute(staged_root)?;
        let live_root = absolute(live_root)?;
        let installable = self.validate_paths(&staged_root, &live_root)?;
        debug!(target: "deploy", "Validated {installable} installable files");

        report(progress, 10, "Creating backup");
        let store_dir = self.store_dir(&live_root)?;
        let backup = self.backups.create_backup(&live_root, &store_dir, None)?;
        let published = live_root.join(&self.settings.published_dir_name);
        if let Some(record) = self.current.as_mut() {
            record.backup = Some(backup.clone());
            record.published = Some(published.clone());
        }
        info!(target: "deploy", "Backup created: {}", backup.display());

        report(progress, 20, "Validating source files");
        let (_, warnings) = OrderOrganizer::new().validate_structure(&staged_root);
        for warning in &warnings {
            warn!(target: "deploy", "Staging layout: {warning}");
        }

        report(progress, 30, "Generating resource.cfg");
        write_resource_cfg(&live_root)?;

        report(progress, 40, "Closing game");
        if close_running_app {
            self.close_running_app()?;
        }

        report(progress, 50, "Cleaning old deployment");
        remove_path(&published).map_err(|err| {
            ModError::deploy(
                "remove previous deployment",
                format!("{}: {err}", published.display()),
            )
        })?;

        report(progress, 60, "Deploying mods");
        let strategy = self.publish(&staged_root, &published)?;
        if let Some(record) = self.current.as_mut() {
            record.strategy = Some(strategy);
        }

        report(progress, 80, "Verifying deployment");
        let verification = self.verify_deployment(&staged_root, &published)?;
        if let Some(failure) = verification.failures.first() {
            return Err(ModError::Integrity {
                path: published.join(&failure.path),
                expected: failure.expected.to_string(),
                actual: failure
                    .actual
                    .map(|actual| actual.to_string())
                    .unwrap_or_else(|| "missing".to_string()),
            });
        }

        report(progress, 90, "Finalizing");
        check_live_accessible(&live_root)?;

        report(progress, 100, "Complete");
        info!(
            target: "deploy",
            "Deployment successful using method: {}",
            strategy.label()
        );
        Ok(DeployReport {
            strategy,
            verified_files: verification.checked,
            backup,
            published,
            warnings,
        })
    }

    fn validate_paths(&self, staged_root: &Path, live_root: &Path) -> Result<usize> {
        for path in [staged_root, live_root] {
            if !path.exists() {
                return Err(ModError::NotFound {
                    path: path.to_path_buf(),
                });
            }
            if !path.is_dir() {
                return Err(ModError::NotADirectory {
                    path: path.to_path_buf(),
                });
            }
        }
        if staged_root.starts_with(live_root) || live_root.starts_with(staged_root) {
            return Err(ModError::InvalidPath {
                path: staged_root.to_path_buf(),
                message: format!(
                    "staging directory and live directory {} must not contain each other",
                    live_root.display()
                ),
            });
        }
        let installable = WalkDir::new(staged_root)
            .into_iter()
            .flatten()
            .filter(|entry| entry.file_type().is_file() && is_installable(entry.path()))
            .count();
        if installable == 0 {
            return Err(ModError::InvalidPath {
                path: staged_root.to_path_buf(),
                message: "no installable mod files found".to_string(),
            });
        }
        Ok(installable)
    }

    fn store_dir(&self, live_root: &Path) -> Result<PathBuf> {
        let store_dir = match &self.settings.backup_store_dir {
            Some(dir) => absolute(dir)?,
            None => live_root
                .parent()
                .unwrap_or(live_root)
                .join(DEFAULT_STORE_DIR_NAME),
        };
        if store_dir.starts_with(live_root) {
            return Err(ModError::InvalidPath {
                path: store_dir,
                message: "backup store must be outside the live directory".to_string(),
            });
        }
        Ok(store_dir)
    }

    /// Graceful request, bounded wait, then a forced request with a short grace.
    fn close_running_app(&self) -> Result<()> {
        let process = self.process.as_ref();
        let application = process.application().to_string();
        if !process.is_running() {
            debug!(target: "deploy", "{application} not running, skipping close");
            return Ok(());
        }

        info!(target: "deploy", "Closing {application}");
        if let Err(err) = process.request_close(CloseMode::Graceful) {
            warn!(target: "deploy", "Graceful close request failed: {err}");
        }
        if self.wait_for_exit(self.settings.close_timeout) {
            return Ok(());
        }

        warn!(
            target: "deploy",
            "{application} still running after {}s, forcing close",
            self.settings.close_timeout.as_secs()
        );
        process
            .request_close(CloseMode::Forced)
            .map_err(|err| ModError::ProcessControl {
                application: application.clone(),
                message: format!("forced close request failed: {err}"),
            })?;
        if self.wait_for_exit(self.settings.force_grace) {
            return Ok(());
        }
        Err(ModError::ProcessControl {
            application,
            message: "still running after forced close".to_string(),
        })
    }

    fn wait_for_exit(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.process.is_running() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(self.settings.poll_interval.min(deadline - now));
        }
    }

    fn publish(&self, staged_root: &Path, published: &Path) -> Result<PublishStrategy> {
        let mut failures = Vec::new();
        for strategy in PublishStrategy::ORDER {
            info!(target: "deploy", "Attempting deployment method: {}", strategy.label());
            let attempt = match strategy {
                PublishStrategy::DirectoryLink => self.links.directory_link(staged_root, published),
                PublishStrategy::Symlink => self.links.symbolic_link(staged_root, published),
                PublishStrategy::Copy => copy_tree(staged_root, published),
            };
            match attempt {
                Ok(()) => {
                    info!(
                        target: "deploy",
                        "Published {} -> {} ({})",
                        staged_root.display(),
                        published.display(),
                        strategy.label()
                    );
                    return Ok(strategy);
                }
                Err(err) => {
                    warn!(target: "deploy", "Method {} failed: {err}", strategy.label());
                    failures.push(format!("{}: {err}", strategy.label()));
                    if let Err(err) = remove_path(published) {
                        warn!(target: "deploy", "Could not clear partial {}: {err}", strategy.label());
                    }
                }
            }
        }
        Err(ModError::deploy(
            "publish",
            format!("all deployment methods failed ({})", failures.join("; ")),
        ))
    }

    /// Compares every installable file under `staged_root` with its published
    /// counterpart and reports each missing or altered file.
    pub fn verify_deployment(&self, staged_root: &Path, published: &Path) -> Result<VerificationReport> {
        info!(target: "deploy", "Verifying deployment integrity");
        let mut verification = VerificationReport::default();
        for entry in WalkDir::new(staged_root).sort_by_file_name() {
            let entry = entry.map_err(|err| {
                let path = err.path().unwrap_or(staged_root).to_path_buf();
                ModError::io(path, "walk staging tree", io::Error::other(err.to_string()))
            })?;
            if !entry.file_type().is_file() || !is_installable(entry.path()) {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(staged_root) else {
                continue;
            };
            let expected = checksum_file(entry.path())?;
            let target = published.join(relative);
            verification.checked += 1;
            let actual = if target.is_file() {
                Some(checksum_file(&target)?)
            } else {
                error!(target: "deploy", "Missing file in deployment: {}", relative.display());
                None
            };
            if actual == Some(expected) {
                continue;
            }
            if actual.is_some() {
                error!(target: "deploy", "Checksum mismatch for {}", relative.display());
            }
            verification.failures.push(VerificationFailure {
                path: relative.to_path_buf(),
                expected,
                actual,
            });
        }
        if verification.is_ok() {
            info!(target: "deploy", "Verified {} files successfully", verification.checked);
        }
        Ok(verification)
    }

    /// Removes the published tree and restores the live directory (the parent
    /// of `published`) from `backup`.
    pub fn rollback(&self, backup: &Path, published: &Path) -> Result<()> {
        warn!(target: "deploy", "Rolling back deployment from {}", backup.display());
        let live_root = published
            .parent()
            .ok_or_else(|| ModError::deploy("rollback", "published path has no parent"))?;
        remove_path(published).map_err(|err| {
            ModError::deploy("rollback", format!("could not remove {}: {err}", published.display()))
        })?;
        clear_directory(live_root)?;
        self.backups
            .restore_backup(backup, live_root, true, None)
            .map_err(|err| {
                ModError::deploy(
                    "rollback",
                    format!("{err}; restore manually from {}", backup.display()),
                )
            })?;
        info!(target: "deploy", "Rollback complete");
        Ok(())
    }
}

/// Scoped access to an open transaction. Dropping it without closing, which
/// only happens while unwinding, rolls back.
pub struct TransactionScope<'a> {
    engine: &'a mut DeployEngine,
    closed: bool,
}

impl TransactionScope<'_> {
    pub fn deploy(
        &mut self,
        staged_root: &Path,
        live_root: &Path,
        progress: Option<DeployProgressFn<'_>>,
        close_running_app: bool,
    ) -> Result<DeployReport> {
        self.engine
            .deploy(staged_root, live_root, progress, close_running_app)
    }

    pub fn verify_deployment(&self, staged_root: &Path, published: &Path) -> Result<VerificationReport> {
        self.engine.verify_deployment(staged_root, published)
    }

    pub fn record(&self) -> Option<&DeploymentTransaction> {
        self.engine.current_transaction()
    }

    pub fn engine(&mut self) -> &mut DeployEngine {
        &mut *self.engine
    }

    fn close<T>(mut self, outcome: Result<T>) -> Result<T> {
        self.closed = true;
        let failure = self
            .engine
            .current
            .as_ref()
            .and_then(|record| record.failure.clone());
        match (outcome, failure) {
            (Ok(value), None) => {
                self.engine.commit();
                Ok(value)
            }
            (Ok(_), Some(cause)) => {
                self.engine.abort(&cause);
                Err(ModError::Transaction {
                    message: format!("deployment failed and was rolled back: {cause}"),
                })
            }
            (Err(err), _) => {
                self.engine.abort(&err.to_string());
                Err(err)
            }
        }
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if !self.closed {
            self.engine.abort("transaction scope unwound before completion");
        }
    }
}

pub fn resource_cfg_is_valid(content: &str) -> bool {
    REQUIRED_DIRECTIVES
        .iter()
        .all(|directive| content.contains(directive))
}

/// Writes the load directive file into `live_root` and reads it back.
pub fn write_resource_cfg(live_root: &Path) -> Result<PathBuf> {
    let path = live_root.join(RESOURCE_CFG_NAME);
    fs::create_dir_all(live_root).map_err(|err| ModError::io(live_root, "create live directory", err))?;
    fs::write(&path, RESOURCE_CFG).map_err(|err| ModError::io(&path, "write resource.cfg", err))?;
    let written = fs::read_to_string(&path).map_err(|err| ModError::io(&path, "read resource.cfg", err))?;
    if !resource_cfg_is_valid(&written) {
        return Err(ModError::deploy(
            "generate resource.cfg",
            "written file is missing required directives",
        ));
    }
    info!(target: "deploy", "Generated resource.cfg: {}", path.display());
    Ok(path)
}

fn check_live_accessible(live_root: &Path) -> Result<()> {
    fs::read_dir(live_root).map_err(|err| {
        ModError::deploy("finalize", format!("live directory is not readable: {err}"))
    })?;
    if !live_root.join(RESOURCE_CFG_NAME).is_file() {
        return Err(ModError::deploy(
            "finalize",
            "resource.cfg not found after deployment",
        ));
    }
    debug!(target: "deploy", "Live directory accessibility validated");
    Ok(())
}

fn copy_tree(source: &Path, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in WalkDir::new(source).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|err| io::Error::other(err.to_string()))?;
        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            copy_with_mtime(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Removes every non-hidden entry directly under `root`.
fn clear_directory(root: &Path) -> Result<()> {
    let entries = fs::read_dir(root).map_err(|err| ModError::io(root, "read live directory", err))?;
    for entry in entries {
        let entry = entry.map_err(|err| ModError::io(root, "read live directory", err))?;
        if is_hidden_or_system(&entry.file_name().to_string_lossy()) {
            continue;
        }
        let path = entry.path();
        remove_path(&path).map_err(|err| ModError::io(&path, "clear live directory", err))?;
    }
    Ok(())
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .map_err(|err| ModError::io(path, "resolve path", err))
}

fn report(progress: Option<DeployProgressFn<'_>>, percent: u8, step: &'static str) {
    if let Some(callback) = progress {
        callback(DeployProgress { percent, step });
    }
    debug!(target: "deploy", "Progress: {step} ({percent}%)");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupSettings;
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    };
    use tempfile::TempDir;

    struct ScriptedProcess {
        running: AtomicBool,
        exits_on: Option<CloseMode>,
        requests: Arc<Mutex<Vec<CloseMode>>>,
    }

    impl ScriptedProcess {
        fn new(running: bool, exits_on: Option<CloseMode>) -> (Self, Arc<Mutex<Vec<CloseMode>>>) {
            let requests = Arc::new(Mutex::new(Vec::new()));
            let process = Self {
                running: AtomicBool::new(running),
                exits_on,
                requests: Arc::clone(&requests),
            };
            (process, requests)
        }
    }

    impl ProcessControl for ScriptedProcess {
        fn application(&self) -> &str {
            "TS4_x64.exe"
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn request_close(&self, mode: CloseMode) -> io::Result<()> {
            self.requests.lock().unwrap().push(mode);
            if self.exits_on == Some(mode) {
                self.running.store(false, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    fn fast_settings() -> DeploySettings {
        DeploySettings {
            close_timeout: Duration::from_millis(60),
            force_grace: Duration::from_millis(30),
            poll_interval: Duration::from_millis(5),
            ..DeploySettings::default()
        }
    }

    fn engine_with(process: ScriptedProcess) -> DeployEngine {
        DeployEngine::new(fast_settings(), BackupStore::new(BackupSettings::default()))
            .with_process_control(Box::new(process))
    }

    #[test]
    fn resource_cfg_is_written_verbatim() {
        let dir = TempDir::new().unwrap();
        let path = write_resource_cfg(dir.path()).unwrap();
        assert_eq!(fs::read(&path).unwrap(), RESOURCE_CFG.as_bytes());
        assert_eq!(RESOURCE_CFG.lines().count(), 7);
        assert!(RESOURCE_CFG.ends_with("*/*/*/*/*.package\n"));
        assert!(resource_cfg_is_valid(RESOURCE_CFG));
        assert!(!resource_cfg_is_valid("Priority 500\nPackedFile *.package\n"));
    }

    #[test]
    fn close_is_skipped_when_not_running() {
        let (process, requests) = ScriptedProcess::new(false, None);
        engine_with(process).close_running_app().unwrap();
        assert!(requests.lock().unwrap().is_empty());
    }

    #[test]
    fn graceful_close_does_not_escalate() {
        let (process, requests) = ScriptedProcess::new(true, Some(CloseMode::Graceful));
        engine_with(process).close_running_app().unwrap();
        assert_eq!(*requests.lock().unwrap(), vec![CloseMode::Graceful]);
    }

    #[test]
    fn close_escalates_to_forced() {
        let (process, requests) = ScriptedProcess::new(true, Some(CloseMode::Forced));
        engine_with(process).close_running_app().unwrap();
        assert_eq!(
            *requests.lock().unwrap(),
            vec![CloseMode::Graceful, CloseMode::Forced]
        );
    }

    #[test]
    fn close_fails_when_process_survives() {
        let (process, requests) = ScriptedProcess::new(true, None);
        let engine = engine_with(process);
        let started = Instant::now();
        let err = engine.close_running_app().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ProcessControl);
        assert!(started.elapsed() >= Duration::from_millis(90));
        assert_eq!(requests.lock().unwrap().len(), 2);
    }

    #[test]
    fn deploy_outside_transaction_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut engine = DeployEngine::new(fast_settings(), BackupStore::default());
        let err = engine
            .deploy(dir.path(), dir.path(), None, false)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Transaction);
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn nested_transaction_is_rejected() {
        let mut engine = DeployEngine::new(fast_settings(), BackupStore::default());
        let err = engine
            .transaction(|scope| scope.engine().transaction(|_| Ok(())))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Transaction);
        assert_eq!(engine.state(), EngineState::RolledBack);
        engine.transaction(|_| Ok(())).unwrap();
        assert_eq!(engine.state(), EngineState::Committed);
        assert!(engine.current_transaction().is_none());
    }

    #[test]
    fn copy_tree_mirrors_nested_layout() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("staging");
        fs::create_dir_all(source.join("040_CC").join("hair")).unwrap();
        fs::create_dir_all(source.join("030_Tuning")).unwrap();
        fs::write(source.join("040_CC").join("hair").join("a.package"), b"DBPF a").unwrap();
        fs::write(source.join("core.ts4script"), b"PK").unwrap();
        let dest = dir.path().join("published");

        copy_tree(&source, &dest).unwrap();
        assert_eq!(fs::read(dest.join("040_CC").join("hair").join("a.package")).unwrap(), b"DBPF a");
        assert!(dest.join("030_Tuning").is_dir());
        assert!(dest.join("core.ts4script").is_file());
    }

    #[test]
    fn verification_lists_each_failure() {
        let dir = TempDir::new().unwrap();
        let staged = dir.path().join("staging");
        fs::create_dir_all(staged.join("020_MainMods")).unwrap();
        fs::write(staged.join("020_MainMods").join("a.package"), b"DBPF a").unwrap();
        fs::write(staged.join("020_MainMods").join("b.package"), b"DBPF b").unwrap();
        fs::write(staged.join("c.py"), b"x = 1\n").unwrap();
        fs::write(staged.join("notes.txt"), b"ignored").unwrap();
        let published = dir.path().join("published");
        copy_tree(&staged, &published).unwrap();

        let engine = DeployEngine::new(fast_settings(), BackupStore::default());
        let clean = engine.verify_deployment(&staged, &published).unwrap();
        assert!(clean.is_ok());
        assert_eq!(clean.checked, 3);

        fs::write(published.join("020_MainMods").join("b.package"), b"DBPF B").unwrap();
        fs::remove_file(published.join("c.py")).unwrap();
        fs::write(published.join("notes.txt"), b"changed").unwrap();
        let broken = engine.verify_deployment(&staged, &published).unwrap();
        assert!(!broken.is_ok());
        assert_eq!(broken.mismatched(), vec![Path::new("020_MainMods/b.package")]);
        assert_eq!(broken.missing(), vec![Path::new("c.py")]);
    }

    #[test]
    fn strategy_labels() {
        let labels: Vec<&str> = PublishStrategy::ORDER.iter().map(|s| s.label()).collect();
        assert_eq!(labels, vec!["directory-link", "symlink", "copy"]);
    }
}
