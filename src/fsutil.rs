use filetime::{set_file_mtime, FileTime};
use std::{
    fs, io,
    path::Path,
    time::UNIX_EPOCH,
};

/// Extensions the game loads from the published tree.
pub const INSTALLABLE_EXTENSIONS: &[&str] = &["package", "ts4script", "py"];

const SYSTEM_ARTIFACTS: &[&str] = &["desktop.ini", "thumbs.db"];

pub fn extension_lower(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

pub fn is_installable(path: &Path) -> bool {
    extension_lower(path).is_some_and(|ext| INSTALLABLE_EXTENSIONS.contains(&ext.as_str()))
}

/// Dot-files and shell metadata files that never belong in a snapshot.
pub fn is_hidden_or_system(name: &str) -> bool {
    name.starts_with('.') || SYSTEM_ARTIFACTS.contains(&name.to_ascii_lowercase().as_str())
}

pub fn copy_with_mtime(source: &Path, dest: &Path) -> io::Result<u64> {
    let copied = fs::copy(source, dest)?;
    preserve_mtime(source, dest);
    Ok(copied)
}

fn preserve_mtime(source: &Path, dest: &Path) {
    let Ok(meta) = fs::metadata(source) else {
        return;
    };
    let Ok(modified) = meta.modified() else {
        return;
    };
    let Ok(duration) = modified.duration_since(UNIX_EPOCH) else {
        return;
    };
    let mtime = FileTime::from_unix_time(duration.as_secs() as i64, duration.subsec_nanos());
    let _ = set_file_mtime(dest, mtime);
}

/// Removes a link, file or directory tree at `path`. Links are removed without
/// touching their target.
pub fn remove_path(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    if meta.file_type().is_symlink() || is_junction(path) {
        return remove_link(path);
    }
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

#[cfg(windows)]
fn remove_link(path: &Path) -> io::Result<()> {
    fs::remove_dir(path).or_else(|_| fs::remove_file(path))
}

#[cfg(not(windows))]
fn remove_link(path: &Path) -> io::Result<()> {
    fs::remove_file(path)
}

#[cfg(windows)]
fn is_junction(path: &Path) -> bool {
    use std::os::windows::fs::MetadataExt;
    const FILE_ATTRIBUTE_REPARSE_POINT: u32 = 0x400;
    fs::symlink_metadata(path)
        .map(|meta| meta.file_attributes() & FILE_ATTRIBUTE_REPARSE_POINT != 0)
        .unwrap_or(false)
}

#[cfg(not(windows))]
fn is_junction(_path: &Path) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn installable_and_hidden_rules() {
        assert!(is_installable(Path::new("a/B.PACKAGE")));
        assert!(is_installable(Path::new("x.ts4script")));
        assert!(is_installable(Path::new("x.py")));
        assert!(!is_installable(Path::new("resource.cfg")));
        assert!(is_hidden_or_system(".DS_Store"));
        assert!(is_hidden_or_system("Thumbs.db"));
        assert!(!is_hidden_or_system("mod.package"));
    }

    #[test]
    fn remove_path_handles_every_shape() {
        let dir = TempDir::new().unwrap();
        let tree = dir.path().join("tree");
        fs::create_dir_all(tree.join("nested")).unwrap();
        fs::write(tree.join("nested").join("a.package"), b"x").unwrap();
        let file = dir.path().join("file.bin");
        fs::write(&file, b"x").unwrap();

        remove_path(&tree).unwrap();
        remove_path(&file).unwrap();
        remove_path(&dir.path().join("missing")).unwrap();
        assert!(!tree.exists());
        assert!(!file.exists());
    }

    #[cfg(unix)]
    #[test]
    fn removing_a_link_keeps_its_target() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("target");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("keep.package"), b"x").unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        remove_path(&link).unwrap();
        assert!(fs::symlink_metadata(&link).is_err());
        assert!(target.join("keep.package").exists());
    }
}
