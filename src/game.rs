//! Seams to the outside world that the deploy engine consumes but does not own:
//! the running game process, platform link primitives and live directory
//! discovery.

use std::{
    io,
    path::{Path, PathBuf},
};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseMode {
    Graceful,
    Forced,
}

impl CloseMode {
    pub fn label(self) -> &'static str {
        match self {
            CloseMode::Graceful => "graceful",
            CloseMode::Forced => "forced",
        }
    }
}

pub trait ProcessControl: Send + Sync {
    fn application(&self) -> &str;

    fn is_running(&self) -> bool;

    /// Asks the application to exit. Returning `Ok` does not mean it has exited.
    fn request_close(&self, mode: CloseMode) -> io::Result<()>;
}

/// Used when no process helper is configured: the game is assumed closed.
#[derive(Debug, Clone, Default)]
pub struct UnmanagedProcess {
    application: String,
}

impl UnmanagedProcess {
    pub fn new(application: impl Into<String>) -> Self {
        Self {
            application: application.into(),
        }
    }
}

impl ProcessControl for UnmanagedProcess {
    fn application(&self) -> &str {
        if self.application.is_empty() {
            "game"
        } else {
            &self.application
        }
    }

    fn is_running(&self) -> bool {
        debug!("Process control not configured; assuming {} is closed", self.application());
        false
    }

    fn request_close(&self, _mode: CloseMode) -> io::Result<()> {
        Ok(())
    }
}

/// Filesystem aliasing primitives. Both may fail for platform or privilege
/// reasons; callers treat failure as a cue to fall back.
pub trait LinkPlatform: Send + Sync {
    fn directory_link(&self, target: &Path, link: &Path) -> io::Result<()>;

    fn symbolic_link(&self, target: &Path, link: &Path) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NativeLinks;

impl LinkPlatform for NativeLinks {
    #[cfg(windows)]
    fn directory_link(&self, target: &Path, link: &Path) -> io::Result<()> {
        use std::process::{Command, Stdio};
        let status = Command::new("cmd")
            .arg("/C")
            .arg("mklink")
            .arg("/J")
            .arg(link)
            .arg(target)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!("mklink /J exited with {status}")))
        }
    }

    #[cfg(not(windows))]
    fn directory_link(&self, _target: &Path, _link: &Path) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "directory junctions are only available on Windows",
        ))
    }

    #[cfg(unix)]
    fn symbolic_link(&self, target: &Path, link: &Path) -> io::Result<()> {
        std::os::unix::fs::symlink(target, link)
    }

    #[cfg(windows)]
    fn symbolic_link(&self, target: &Path, link: &Path) -> io::Result<()> {
        std::os::windows::fs::symlink_dir(target, link)
    }

    #[cfg(not(any(unix, windows)))]
    fn symbolic_link(&self, _target: &Path, _link: &Path) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "symlink unavailable on this platform",
        ))
    }
}

pub trait PathLocator {
    /// The live content directory, if one can be found.
    fn live_dir(&self) -> Option<PathBuf>;
}

/// Locator backed by an explicitly configured path.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredLocator {
    live_dir: Option<PathBuf>,
}

impl ConfiguredLocator {
    pub fn new(live_dir: Option<PathBuf>) -> Self {
        Self { live_dir }
    }
}

impl PathLocator for ConfiguredLocator {
    fn live_dir(&self) -> Option<PathBuf> {
        self.live_dir.clone().filter(|path| path.is_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn configured_locator_requires_existing_directory() {
        let dir = TempDir::new().unwrap();
        assert_eq!(
            ConfiguredLocator::new(Some(dir.path().to_path_buf())).live_dir(),
            Some(dir.path().to_path_buf())
        );
        assert_eq!(
            ConfiguredLocator::new(Some(dir.path().join("missing"))).live_dir(),
            None
        );
        assert_eq!(ConfiguredLocator::default().live_dir(), None);
    }

    #[test]
    fn unmanaged_process_is_never_running() {
        let process = UnmanagedProcess::new("TS4_x64.exe");
        assert!(!process.is_running());
        assert!(process.request_close(CloseMode::Forced).is_ok());
        assert_eq!(process.application(), "TS4_x64.exe");
        assert_eq!(UnmanagedProcess::default().application(), "game");
    }

    #[cfg(unix)]
    #[test]
    fn native_symlink_points_at_target() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("staging");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("a.package"), b"DBPF").unwrap();
        let link = dir.path().join("ActiveMods");

        assert!(NativeLinks.directory_link(&target, &link).is_err());
        NativeLinks.symbolic_link(&target, &link).unwrap();
        assert!(link.join("a.package").is_file());
    }
}
