use crate::error::{DeployError, Result};
use std::fs::Metadata;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
// Filesystem enumeration for the archive encoder

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// One filesystem object under the deployment root
#[derive(Debug, Clone)]
pub struct TreeEntry {
    pub path: PathBuf,
    /// Root-relative, '/'-separated; never empty
    pub relative: String,
    pub kind: EntryKind,
    pub size: u64,
    pub mode: u32,
    pub mtime: u64,
}

/// Check that `path` exists and is a readable directory
pub fn validate_source_dir(path: &Path) -> Result<()> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            DeployError::io(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "does not exist"),
            )
        } else {
            DeployError::io(path, e)
        }
    })?;
    if !metadata.is_dir() {
        return Err(DeployError::io(
            path,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "is not a directory"),
        ));
    }
    std::fs::read_dir(path).map_err(|e| DeployError::io(path, e))?;
    Ok(())
}

/// Walk `root` parent-first with siblings in file-name order.
///
/// The root itself is not returned. Symlinks and special files are skipped.
/// Any unreadable entry aborts the walk.
pub fn enumerate_tree(root: &Path) -> Result<Vec<TreeEntry>> {
    use walkdir::WalkDir;

    let mut entries = Vec::new();

    for entry in WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            let source = e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "filesystem loop"));
            DeployError::io(path, source)
        })?;

        let file_type = entry.file_type();
        let kind = if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            continue;
        };

        let metadata = entry
            .metadata()
            .map_err(|e| DeployError::io(entry.path(), e.into()))?;
        let relative = relative_slash_path(root, entry.path())?;

        entries.push(TreeEntry {
            path: entry.path().to_path_buf(),
            relative,
            kind,
            size: if kind == EntryKind::File { metadata.len() } else { 0 },
            mode: permission_bits(&metadata),
            mtime: modified_secs(&metadata),
        });
    }

    Ok(entries)
}

/// Root-relative path with forward slashes regardless of platform
pub fn relative_slash_path(root: &Path, path: &Path) -> Result<String> {
    let rel = path.strip_prefix(root).map_err(|_| {
        DeployError::io(
            path,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "path is outside the source root"),
        )
    })?;
    let mut parts = Vec::new();
    for component in rel.components() {
        if let Component::Normal(s) = component {
            let s = s.to_str().ok_or_else(|| {
                DeployError::io(
                    path,
                    std::io::Error::new(std::io::ErrorKind::InvalidData, "file name is not valid UTF-8"),
                )
            })?;
            parts.push(s);
        }
    }
    Ok(parts.join("/"))
}

#[cfg(unix)]
pub fn permission_bits(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
pub fn permission_bits(metadata: &Metadata) -> u32 {
    let base = if metadata.is_dir() { 0o755 } else { 0o644 };
    if metadata.permissions().readonly() {
        base & !0o222
    } else {
        base
    }
}

fn modified_secs(metadata: &Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
