use serde::{Deserialize, Serialize};
use std::{io, path::PathBuf};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ModError>;

/// Machine-readable classification carried by every [`ModError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Path,
    Deploy,
    Backup,
    Security,
    Integrity,
    Conflict,
    Structure,
    ProcessControl,
    Format,
    Timeout,
    Transaction,
    Io,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Path => "path",
            ErrorKind::Deploy => "deploy",
            ErrorKind::Backup => "backup",
            ErrorKind::Security => "security",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Structure => "structure",
            ErrorKind::ProcessControl => "process_control",
            ErrorKind::Format => "format",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Transaction => "transaction",
            ErrorKind::Io => "io",
        }
    }
}

/// What a security rejection was triggered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatKind {
    BadSignature,
    MalformedArchive,
    MissingScript,
    InvalidScript,
    HighEntropy,
    Unreadable,
    ScanTimeout,
}

impl ThreatKind {
    pub fn label(self) -> &'static str {
        match self {
            ThreatKind::BadSignature => "invalid signature",
            ThreatKind::MalformedArchive => "malformed archive",
            ThreatKind::MissingScript => "script archive without scripts",
            ThreatKind::InvalidScript => "invalid script source",
            ThreatKind::HighEntropy => "suspicious entropy",
            ThreatKind::Unreadable => "unreadable file",
            ThreatKind::ScanTimeout => "scan timeout",
        }
    }
}

#[derive(Debug, Error)]
pub enum ModError {
    #[error("path not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("not a directory: {}", path.display())]
    NotADirectory { path: PathBuf },

    #[error("invalid path {}: {message}", path.display())]
    InvalidPath { path: PathBuf, message: String },

    #[error("{operation} failed on {}", path.display())]
    Io {
        path: PathBuf,
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("deployment failed during '{operation}': {message}")]
    Deploy {
        operation: &'static str,
        message: String,
    },

    #[error("backup {operation} failed for {}: {message}", path.display())]
    Backup {
        path: PathBuf,
        operation: &'static str,
        message: String,
    },

    #[error("security rejection for {} ({}): {reason}", path.display(), threat.label())]
    Security {
        path: PathBuf,
        threat: ThreatKind,
        reason: String,
        hint: &'static str,
    },

    #[error("checksum mismatch for {}: expected {expected}, got {actual}", path.display())]
    Integrity {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("{} conflicts with {}", candidate, mods.join(", "))]
    Conflict { candidate: String, mods: Vec<String> },

    #[error("cannot rule out conflicts for {}: unreadable {}", candidate, unreadable.join(", "))]
    UnverifiedConflicts { candidate: String, unreadable: Vec<String> },

    #[error("load order violation: {message}")]
    Structure { message: String },

    #[error("could not close {application}: {message}")]
    ProcessControl { application: String, message: String },

    #[error("invalid container {}: {reason}", path.display())]
    Format { path: PathBuf, reason: String },

    #[error("scan of {} exceeded {seconds}s budget", path.display())]
    Timeout { path: PathBuf, seconds: u64 },

    #[error("transaction misuse: {message}")]
    Transaction { message: String },
}

impl ModError {
    pub fn io(path: impl Into<PathBuf>, operation: &'static str, source: io::Error) -> Self {
        ModError::Io {
            path: path.into(),
            operation,
            source,
        }
    }

    pub fn backup(path: impl Into<PathBuf>, operation: &'static str, message: impl Into<String>) -> Self {
        ModError::Backup {
            path: path.into(),
            operation,
            message: message.into(),
        }
    }

    pub fn deploy(operation: &'static str, message: impl Into<String>) -> Self {
        ModError::Deploy {
            operation,
            message: message.into(),
        }
    }

    pub fn structure(message: impl Into<String>) -> Self {
        ModError::Structure {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ModError::NotFound { .. }
            | ModError::NotADirectory { .. }
            | ModError::InvalidPath { .. } => ErrorKind::Path,
            ModError::Io { .. } => ErrorKind::Io,
            ModError::Deploy { .. } => ErrorKind::Deploy,
            ModError::Backup { .. } => ErrorKind::Backup,
            ModError::Security { .. } => ErrorKind::Security,
            ModError::Integrity { .. } => ErrorKind::Integrity,
            ModError::Conflict { .. } | ModError::UnverifiedConflicts { .. } => ErrorKind::Conflict,
            ModError::Structure { .. } => ErrorKind::Structure,
            ModError::ProcessControl { .. } => ErrorKind::ProcessControl,
            ModError::Format { .. } => ErrorKind::Format,
            ModError::Timeout { .. } => ErrorKind::Timeout,
            ModError::Transaction { .. } => ErrorKind::Transaction,
        }
    }

    pub fn recovery_hint(&self) -> &'static str {
        match self {
            ModError::NotFound { .. } => "Check that the folder exists and the configured path is correct",
            ModError::NotADirectory { .. } => "Point the command at a folder, not a file",
            ModError::InvalidPath { .. } => "Configure a valid path in the settings",
            ModError::Io { .. } => "Check file permissions and available disk space",
            ModError::Deploy { .. } => "Restore from backup and check folder permissions",
            ModError::Backup { .. } => "Ensure sufficient disk space and write permissions",
            ModError::Security { hint, .. } => hint,
            ModError::Integrity { .. } => {
                "Delete the corrupted file and re-download it from a trusted source"
            }
            ModError::Conflict { .. } => {
                "Remove one of the conflicting mods or move the preferred one to the override slot"
            }
            ModError::UnverifiedConflicts { .. } => {
                "Repair or remove the unreadable mods, then check again"
            }
            ModError::Structure { .. } => "Review the load order layout and try again",
            ModError::ProcessControl { .. } => "Close the game manually and try again",
            ModError::Format { .. } => "The file may be corrupted or renamed; verify its source",
            ModError::Timeout { .. } => "Split the folder into smaller batches or raise the scan timeout",
            ModError::Transaction { .. } => "Run deployments inside a single transaction scope",
        }
    }

    /// Display form used by the command-line front end.
    pub fn report(&self) -> String {
        format!(
            "[{}] {}\nSuggestion: {}",
            self.kind().code(),
            self,
            self.recovery_hint()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_hints_are_attached() {
        let err = ModError::Security {
            path: PathBuf::from("bad.package"),
            threat: ThreatKind::HighEntropy,
            reason: "entropy 7.90 > 7.50".to_string(),
            hint: "File may be packed or malicious. Manual review required.",
        };
        assert_eq!(err.kind(), ErrorKind::Security);
        assert_eq!(
            err.recovery_hint(),
            "File may be packed or malicious. Manual review required."
        );
        let report = err.report();
        assert!(report.starts_with("[security] "));
        assert!(report.contains("Suggestion: File may be packed"));
    }

    #[test]
    fn io_errors_keep_their_source() {
        let err = ModError::io(
            "x.bin",
            "read",
            io::Error::new(io::ErrorKind::PermissionDenied, "nope"),
        );
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn error_kind_serializes_as_code() {
        let raw = serde_json::to_string(&ErrorKind::ProcessControl).unwrap();
        assert_eq!(raw, "\"process_control\"");
        assert_eq!(ErrorKind::ProcessControl.code(), "process_control");
    }
}
