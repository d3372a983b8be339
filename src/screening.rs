use crate::{
    error::{ModError, Result, ThreatKind},
    pysyntax,
    scanner::FileKind,
};
use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
};

pub const CONTAINER_MAGIC: &[u8; 4] = b"DBPF";
pub const ARCHIVE_MAGIC: &[u8; 4] = b"PK\x03\x04";

/// Bytes read from the start of a file for entropy analysis.
pub const ENTROPY_WINDOW: usize = 8192;

#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub path: PathBuf,
    pub threat: ThreatKind,
    pub reason: String,
    pub hint: &'static str,
}

impl Rejection {
    fn new(path: &Path, threat: ThreatKind, reason: impl Into<String>, hint: &'static str) -> Self {
        Self {
            path: path.to_path_buf(),
            threat,
            reason: reason.into(),
            hint,
        }
    }

    pub fn timeout(path: &Path, seconds: u64) -> Self {
        Self::new(
            path,
            ThreatKind::ScanTimeout,
            format!("exceeded {seconds}s scan timeout"),
            "File may be crafted to stall validation. Remove it or review it manually.",
        )
    }

    pub fn into_error(self) -> ModError {
        ModError::Security {
            path: self.path,
            threat: self.threat,
            reason: self.reason,
            hint: self.hint,
        }
    }
}

/// Outcome of one screening check. Rejections are ordinary results here;
/// only I/O failures travel as errors.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accepted,
    Rejected(Rejection),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted)
    }
}

pub fn shannon_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut frequency = [0usize; 256];
    for byte in data {
        frequency[*byte as usize] += 1;
    }
    let len = data.len() as f64;
    frequency
        .iter()
        .filter(|count| **count > 0)
        .map(|count| {
            let p = *count as f64 / len;
            -p * p.log2()
        })
        .sum()
}

pub fn leading_entropy(path: &Path) -> Result<f64> {
    let file = fs::File::open(path).map_err(|err| ModError::io(path, "open for entropy", err))?;
    let mut window = Vec::with_capacity(ENTROPY_WINDOW);
    file.take(ENTROPY_WINDOW as u64)
        .read_to_end(&mut window)
        .map_err(|err| ModError::io(path, "read for entropy", err))?;
    Ok(shannon_entropy(&window))
}

pub fn screen_entropy(path: &Path, threshold: f64) -> Result<(f64, Verdict)> {
    let entropy = leading_entropy(path)?;
    if entropy > threshold {
        let rejection = Rejection::new(
            path,
            ThreatKind::HighEntropy,
            format!("entropy {entropy:.2} > {threshold:.2} suggests encryption or packing"),
            "File may be packed or malicious. Manual review required.",
        );
        return Ok((entropy, Verdict::Rejected(rejection)));
    }
    Ok((entropy, Verdict::Accepted))
}

pub fn verify_signature(path: &Path, kind: FileKind) -> Result<Verdict> {
    match kind {
        FileKind::Container => check_magic(path, CONTAINER_MAGIC),
        FileKind::ScriptArchive => {
            let verdict = check_magic(path, ARCHIVE_MAGIC)?;
            if !verdict.is_accepted() {
                return Ok(verdict);
            }
            check_script_archive(path)
        }
        FileKind::Script => check_script(path),
        FileKind::Config | FileKind::Project => Ok(Verdict::Accepted),
    }
}

fn check_magic(path: &Path, expected: &[u8; 4]) -> Result<Verdict> {
    let file = fs::File::open(path).map_err(|err| ModError::io(path, "open for signature", err))?;
    let mut header = Vec::with_capacity(4);
    file.take(4)
        .read_to_end(&mut header)
        .map_err(|err| ModError::io(path, "read signature", err))?;
    if header.as_slice() == expected {
        return Ok(Verdict::Accepted);
    }
    Ok(Verdict::Rejected(Rejection::new(
        path,
        ThreatKind::BadSignature,
        format!("expected {}, got {}", hex(expected), hex(&header)),
        "File may be corrupted or renamed. Verify source.",
    )))
}

fn check_script_archive(path: &Path) -> Result<Verdict> {
    let file = fs::File::open(path).map_err(|err| ModError::io(path, "open archive", err))?;
    let archive = match zip::ZipArchive::new(file) {
        Ok(archive) => archive,
        Err(err) => {
            return Ok(Verdict::Rejected(Rejection::new(
                path,
                ThreatKind::MalformedArchive,
                format!("archive structure is corrupted: {err}"),
                "Re-download the mod from a trusted source",
            )))
        }
    };
    let has_script = archive.file_names().any(|name| {
        let lower = name.to_ascii_lowercase();
        lower.ends_with(".py") || lower.ends_with(".pyc")
    });
    if has_script {
        return Ok(Verdict::Accepted);
    }
    Ok(Verdict::Rejected(Rejection::new(
        path,
        ThreatKind::MissingScript,
        "no script entries found in archive",
        "Script mods require script files inside the archive",
    )))
}

fn check_script(path: &Path) -> Result<Verdict> {
    let bytes = fs::read(path).map_err(|err| ModError::io(path, "read script", err))?;
    let source = match String::from_utf8(bytes) {
        Ok(source) => source,
        Err(_) => {
            return Ok(Verdict::Rejected(Rejection::new(
                path,
                ThreatKind::InvalidScript,
                "file is not valid UTF-8 text",
                "Convert file to UTF-8 encoding",
            )))
        }
    };
    match pysyntax::check_source(&source, &path.to_string_lossy()) {
        Ok(()) => Ok(Verdict::Accepted),
        Err(issue) => Ok(Verdict::Rejected(Rejection::new(
            path,
            ThreatKind::InvalidScript,
            format!("syntax error at {issue}"),
            "Fix syntax errors or remove file",
        ))),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}
