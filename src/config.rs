use crate::{backup::BackupSettings, deploy::DeploySettings, scanner::ScannerSettings};
use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub scanner: ScannerConfig,
    pub backup: BackupConfig,
    pub deploy: DeployConfig,
    pub paths: PathsConfig,
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            scanner: ScannerConfig::default(),
            backup: BackupConfig::default(),
            deploy: DeployConfig::default(),
            paths: PathsConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub max_file_size_mb: u64,
    pub file_timeout_secs: u64,
    pub directory_timeout_secs: u64,
    pub entropy_threshold: f64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            max_file_size_mb: 500,
            file_timeout_secs: 30,
            directory_timeout_secs: 30,
            entropy_threshold: 7.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub retention_count: usize,
    pub size_warning_gb: u64,
    pub store_dir: Option<PathBuf>,
    pub game_version: Option<String>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            retention_count: 10,
            size_warning_gb: 5,
            store_dir: None,
            game_version: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    pub close_game: bool,
    pub close_timeout_secs: u64,
    pub force_grace_secs: u64,
    pub published_dir_name: String,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            close_game: true,
            close_timeout_secs: 10,
            force_grace_secs: 2,
            published_dir_name: "ActiveMods".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub live_dir: Option<PathBuf>,
    pub staging_dir: Option<PathBuf>,
    pub incoming_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn load_or_create() -> Result<Self> {
        let path = config_path()?;
        if path.exists() {
            return Self::load_from(&path);
        }
        let config = AppConfig::default();
        config.save_to(&path)?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("create config dir")?;
        }
        let raw = serde_json::to_string_pretty(self).context("serialize config")?;
        fs::write(path, raw).with_context(|| format!("write config {}", path.display()))?;
        Ok(())
    }

    pub fn scanner_settings(&self) -> ScannerSettings {
        ScannerSettings {
            max_file_size_bytes: self.scanner.max_file_size_mb.saturating_mul(MIB),
            file_timeout: Duration::from_secs(self.scanner.file_timeout_secs),
            directory_timeout: Duration::from_secs(self.scanner.directory_timeout_secs),
            entropy_threshold: self.scanner.entropy_threshold,
        }
    }

    pub fn backup_settings(&self) -> BackupSettings {
        BackupSettings {
            retention_count: self.backup.retention_count,
            size_warning_bytes: self.backup.size_warning_gb.saturating_mul(GIB),
            game_version: self.backup.game_version.clone(),
        }
    }

    pub fn deploy_settings(&self) -> DeploySettings {
        DeploySettings {
            close_timeout: Duration::from_secs(self.deploy.close_timeout_secs),
            force_grace: Duration::from_secs(self.deploy.force_grace_secs),
            published_dir_name: self.deploy.published_dir_name.clone(),
            backup_store_dir: self.backup.store_dir.clone(),
            ..DeploySettings::default()
        }
    }
}

pub fn base_data_dir() -> Result<PathBuf> {
    let base = BaseDirs::new().context("resolve home dir")?;
    Ok(base.data_local_dir().join("modstage"))
}

pub fn config_path() -> Result<PathBuf> {
    Ok(base_data_dir()?.join("config.json"))
}
