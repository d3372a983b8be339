use crate::{
    error::{ModError, Result},
    screening::CONTAINER_MAGIC,
};
use serde::Serialize;
use std::{
    collections::HashSet,
    fmt,
    fs,
    io::{Read, Seek, SeekFrom},
    path::Path,
};

const VERSION_OFFSET: u64 = 4;
const INDEX_OFFSET_AT: u64 = 36;
const MIN_HEADER_LEN: u64 = 44;
/// Header size written by [`encode_container`]; the index follows directly.
const ENCODED_HEADER_LEN: usize = 96;
const ENTRY_LEN: u64 = 24;
const ENCODED_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ResourceId {
    pub type_id: u32,
    pub group_id: u32,
    pub instance_id: u64,
}

impl ResourceId {
    pub fn new(type_id: u32, group_id: u32, instance_id: u64) -> Self {
        Self {
            type_id,
            group_id,
            instance_id,
        }
    }

    pub fn hex(&self) -> String {
        format!(
            "{:08X}_{:08X}_{:016X}",
            self.type_id, self.group_id, self.instance_id
        )
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    pub version: u32,
    pub index_offset: u32,
    pub entry_count: u32,
}

pub fn read_header(path: &Path) -> Result<ContainerHeader> {
    let mut file = fs::File::open(path).map_err(|err| ModError::io(path, "open container", err))?;
    let len = file
        .metadata()
        .map_err(|err| ModError::io(path, "stat container", err))?
        .len();
    read_header_from(&mut file, len, path)
}

fn read_header_from(file: &mut fs::File, len: u64, path: &Path) -> Result<ContainerHeader> {
    if len < MIN_HEADER_LEN {
        return Err(format_error(
            path,
            format!("header truncated: {len} bytes, need {MIN_HEADER_LEN}"),
        ));
    }
    let mut magic = [0u8; 4];
    read_exact(file, &mut magic, path)?;
    if &magic != CONTAINER_MAGIC {
        return Err(format_error(path, "invalid magic signature"));
    }
    seek(file, VERSION_OFFSET, path)?;
    let version = read_u32(file, path)?;
    seek(file, INDEX_OFFSET_AT, path)?;
    let index_offset = read_u32(file, path)?;
    let entry_count = read_u32(file, path)?;

    let index_end = u64::from(index_offset) + u64::from(entry_count) * ENTRY_LEN;
    if index_end > len {
        return Err(format_error(
            path,
            format!(
                "resource index ({entry_count} entries at offset {index_offset}) runs past end of file ({len} bytes)"
            ),
        ));
    }
    Ok(ContainerHeader {
        version,
        index_offset,
        entry_count,
    })
}

/// Reads the resource index. Any header or bounds violation is a format error,
/// never an empty set.
pub fn parse_container(path: &Path) -> Result<HashSet<ResourceId>> {
    let mut file = fs::File::open(path).map_err(|err| ModError::io(path, "open container", err))?;
    let len = file
        .metadata()
        .map_err(|err| ModError::io(path, "stat container", err))?
        .len();
    let header = read_header_from(&mut file, len, path)?;

    seek(&mut file, u64::from(header.index_offset), path)?;
    let mut resources = HashSet::with_capacity(header.entry_count as usize);
    for _ in 0..header.entry_count {
        let type_id = read_u32(&mut file, path)?;
        let group_id = read_u32(&mut file, path)?;
        let instance_id = read_u64(&mut file, path)?;
        let mut position = [0u8; 8];
        read_exact(&mut file, &mut position, path)?;
        resources.insert(ResourceId::new(type_id, group_id, instance_id));
    }
    Ok(resources)
}

/// Smallest container that [`parse_container`] accepts, holding `resources` in order.
pub fn encode_container(resources: &[ResourceId]) -> Vec<u8> {
    let mut out = vec![0u8; ENCODED_HEADER_LEN];
    out[..4].copy_from_slice(CONTAINER_MAGIC);
    out[4..8].copy_from_slice(&ENCODED_VERSION.to_le_bytes());
    out[36..40].copy_from_slice(&(ENCODED_HEADER_LEN as u32).to_le_bytes());
    out[40..44].copy_from_slice(&(resources.len() as u32).to_le_bytes());
    for resource in resources {
        out.extend_from_slice(&resource.type_id.to_le_bytes());
        out.extend_from_slice(&resource.group_id.to_le_bytes());
        out.extend_from_slice(&resource.instance_id.to_le_bytes());
        out.extend_from_slice(&[0u8; 8]);
    }
    out
}

fn format_error(path: &Path, reason: impl Into<String>) -> ModError {
    ModError::Format {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn seek(file: &mut fs::File, offset: u64, path: &Path) -> Result<()> {
    file.seek(SeekFrom::Start(offset))
        .map(|_| ())
        .map_err(|err| ModError::io(path, "seek container", err))
}

fn read_exact(file: &mut fs::File, buffer: &mut [u8], path: &Path) -> Result<()> {
    file.read_exact(buffer).map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            format_error(path, "unexpected end of file")
        } else {
            ModError::io(path, "read container", err)
        }
    })
}

fn read_u32(file: &mut fs::File, path: &Path) -> Result<u32> {
    let mut bytes = [0u8; 4];
    read_exact(file, &mut bytes, path)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64(file: &mut fs::File, path: &Path) -> Result<u64> {
    let mut bytes = [0u8; 8];
    read_exact(file, &mut bytes, path)?;
    Ok(u64::from_le_bytes(bytes))
}
