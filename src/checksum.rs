use crate::error::{ModError, Result};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    fs::File,
    io::Read,
    path::Path,
    str::FromStr,
};
use xxhash_rust::xxh64::{xxh64, Xxh64};

const BLOCK_LEN: usize = 64 * 1024;

/// xxHash64 content digest. Integrity only, never authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Checksum(u64);

impl Checksum {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for Checksum {
    type Err = std::num::ParseIntError;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        u64::from_str_radix(value.trim(), 16).map(Checksum)
    }
}

impl From<Checksum> for String {
    fn from(value: Checksum) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for Checksum {
    type Error = std::num::ParseIntError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

pub fn checksum_bytes(bytes: &[u8]) -> Checksum {
    Checksum(xxh64(bytes, 0))
}

pub fn checksum_reader<R: Read>(reader: &mut R) -> std::io::Result<Checksum> {
    let mut hasher = Xxh64::new(0);
    let mut buffer = vec![0u8; BLOCK_LEN];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(Checksum(hasher.digest()))
}

pub fn checksum_file(path: &Path) -> Result<Checksum> {
    let mut file = File::open(path).map_err(|err| ModError::io(path, "open for checksum", err))?;
    checksum_reader(&mut file).map_err(|err| ModError::io(path, "read for checksum", err))
}
