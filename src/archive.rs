//! Archive codec: a directory tree as one gzip-compressed tar stream.
//!
//! The first entry is always the root marker, a directory entry named
//! `ROOT<n>` where `n` is the number of real entries that follow. Real entry
//! names are root-relative and '/'-separated. Files carry their bytes inline
//! right after their header; directories carry nothing.

use crate::error::{DeployError, Result};
use crate::fs_enum::{enumerate_tree, validate_source_dir, EntryKind};
use crate::progress::Progress;
use crate::protocol_core::{ensure_dir_exists, ensure_parent_exists, safe_relative_path};
use filetime::{set_file_mtime, FileTime};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use tar::{Archive, Builder, EntryType, Header};

pub const ROOT_MARKER_PREFIX: &str = "ROOT";

/// An encoded tree ready to send
#[derive(Debug, Clone)]
pub struct EncodedArchive {
    pub bytes: Vec<u8>,
    pub item_count: u64,
}

pub fn root_marker_name(item_count: u64) -> String {
    format!("{}{}", ROOT_MARKER_PREFIX, item_count)
}

/// Recover the declared item count from a root marker name
pub fn parse_root_marker(name: &str) -> Result<u64> {
    let name = name.trim_end_matches('/');
    let digits = name
        .strip_prefix(ROOT_MARKER_PREFIX)
        .ok_or_else(|| DeployError::format("missing root marker"))?;
    digits
        .parse::<u64>()
        .map_err(|_| DeployError::format(format!("garbled root marker: {:?}", name)))
}

/// Encode the tree under `root` into memory
pub fn encode(root: &Path, progress: &mut dyn Progress) -> Result<EncodedArchive> {
    encode_cancellable(root, progress, &|| false)
}

/// Like `encode`, but stops with `Interrupted` once `cancelled` returns true.
/// The check runs between entries and between reads of a file's contents.
pub fn encode_cancellable(
    root: &Path,
    progress: &mut dyn Progress,
    cancelled: &dyn Fn() -> bool,
) -> Result<EncodedArchive> {
    let mut bytes = Vec::with_capacity(1024 * 1024);
    let item_count = encode_into(root, &mut bytes, progress, cancelled)?;
    Ok(EncodedArchive { bytes, item_count })
}

/// Encode the tree under `root` into `writer`, returning the item count.
///
/// On error the writer holds a partial stream that must be discarded.
pub fn encode_into<W: Write>(
    root: &Path,
    writer: W,
    progress: &mut dyn Progress,
    cancelled: &dyn Fn() -> bool,
) -> Result<u64> {
    validate_source_dir(root)?;
    // The marker must carry the final count, so walk everything up front
    let entries = enumerate_tree(root)?;
    let total = entries.len() as u64;

    let gz = GzEncoder::new(writer, Compression::default());
    let mut builder = Builder::new(gz);

    let mut marker = Header::new_gnu();
    marker.set_entry_type(EntryType::Directory);
    marker.set_size(0);
    marker.set_mode(0o755);
    builder
        .append_data(&mut marker, root_marker_name(total), io::empty())
        .map_err(|e| DeployError::io(root, e))?;

    for (count, entry) in entries.iter().enumerate() {
        if cancelled() {
            return Err(DeployError::Interrupted);
        }
        progress.advance(count as u64, total, &format!("compressing: {}", parent_of(&entry.relative)));

        let mut header = Header::new_gnu();
        header.set_mode(entry.mode);
        header.set_mtime(entry.mtime);
        match entry.kind {
            EntryKind::Directory => {
                header.set_entry_type(EntryType::Directory);
                header.set_size(0);
                builder
                    .append_data(&mut header, &entry.relative, io::empty())
                    .map_err(|e| DeployError::io(&entry.path, e))?;
            }
            EntryKind::File => {
                let file = File::open(&entry.path).map_err(|e| DeployError::io(&entry.path, e))?;
                // Size from the open handle so header and payload agree
                let size = file
                    .metadata()
                    .map_err(|e| DeployError::io(&entry.path, e))?
                    .len();
                header.set_entry_type(EntryType::Regular);
                header.set_size(size);
                let contents = CancellableRead {
                    inner: file.take(size),
                    cancelled,
                };
                builder
                    .append_data(&mut header, &entry.relative, contents)
                    .map_err(|e| {
                        if cancelled() {
                            DeployError::Interrupted
                        } else {
                            DeployError::io(&entry.path, e)
                        }
                    })?;
            }
        }
    }

    let gz = builder.into_inner().map_err(|e| DeployError::io(root, e))?;
    gz.finish().map_err(|e| DeployError::io(root, e))?;

    progress.finish(total, total, "compression complete");
    Ok(total)
}

/// Unpack an archive stream into `dest`, returning the number of entries extracted
pub fn decode<R: Read>(reader: R, dest: &Path, progress: &mut dyn Progress) -> Result<u64> {
    let mut archive = Archive::new(GzDecoder::new(reader));
    let mut entries = archive.entries().map_err(corrupt)?;

    let total = match entries.next() {
        Some(Ok(first)) => {
            let name = entry_name(&first)?;
            parse_root_marker(&name)?
        }
        Some(Err(e)) => return Err(corrupt(e)),
        None => return Err(DeployError::format("missing root marker")),
    };

    ensure_dir_exists(dest)?;

    let mut count = 0u64;
    for entry in entries {
        let mut entry = entry.map_err(corrupt)?;
        let name = entry_name(&entry)?;
        let rel = safe_relative_path(&name)?;
        let target = dest.join(&rel);
        count += 1;
        progress.advance(
            count,
            total,
            &target.parent().unwrap_or(dest).display().to_string(),
        );

        match entry.header().entry_type() {
            EntryType::Directory => ensure_dir_exists(&target)?,
            EntryType::Regular | EntryType::Continuous => {
                ensure_parent_exists(&target)?;
                let mode = entry.header().mode().ok();
                let mtime = entry.header().mtime().ok();
                {
                    let mut file = File::create(&target).map_err(|e| DeployError::io(&target, e))?;
                    io::copy(&mut entry, &mut file).map_err(|e| {
                        if e.kind() == io::ErrorKind::UnexpectedEof || e.kind() == io::ErrorKind::InvalidData {
                            corrupt(e)
                        } else {
                            DeployError::io(&target, e)
                        }
                    })?;
                    // closed here, before the next entry
                }
                apply_metadata(&target, mode, mtime)?;
            }
            // Links and special files are never produced by `encode`
            _ => {}
        }
    }

    if count < total {
        return Err(DeployError::format(format!(
            "archive truncated: root marker declares {} entries, found {}",
            total, count
        )));
    }

    progress.finish(count, total, "decompression complete");
    Ok(count)
}

struct CancellableRead<'a, R> {
    inner: R,
    cancelled: &'a dyn Fn() -> bool,
}

impl<R: Read> Read for CancellableRead<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if (self.cancelled)() {
            return Err(io::Error::new(io::ErrorKind::Other, "encode cancelled"));
        }
        self.inner.read(buf)
    }
}

fn entry_name<R: Read>(entry: &tar::Entry<'_, R>) -> Result<String> {
    let bytes = entry.path_bytes();
    std::str::from_utf8(&bytes)
        .map(|s| s.trim_end_matches('/').to_string())
        .map_err(|_| DeployError::format("entry name is not valid UTF-8"))
}

fn corrupt(e: io::Error) -> DeployError {
    DeployError::format(format!("corrupt archive: {}", e))
}

fn parent_of(relative: &str) -> &str {
    match relative.rfind('/') {
        Some(idx) => &relative[..idx],
        None => ".",
    }
}

fn apply_metadata(target: &Path, mode: Option<u32>, mtime: Option<u64>) -> Result<()> {
    #[cfg(unix)]
    if let Some(mode) = mode.filter(|m| *m != 0) {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(target, std::fs::Permissions::from_mode(mode & 0o7777))
            .map_err(|e| DeployError::io(target, e))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    if let Some(mtime) = mtime.filter(|t| *t > 0) {
        set_file_mtime(target, FileTime::from_unix_time(mtime as i64, 0))
            .map_err(|e| DeployError::io(target, e))?;
    }
    Ok(())
}
