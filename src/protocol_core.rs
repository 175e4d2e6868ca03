//! Shared framing and path logic for the transport and the archive codec

use crate::error::{DeployError, Result};
use std::path::{Component, Path, PathBuf};

/// Frame header length in bytes
pub const FRAME_HEADER_LEN: usize = 11;

/// Turn an archive entry name into a relative path that cannot leave the
/// extraction root. Rejects:
/// 1. absolute paths, parent directory components, root/prefix components
/// 2. NUL bytes
/// 3. on Windows, ':' in a component (ADS)
pub fn safe_relative_path(name: &str) -> Result<PathBuf> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    if name.contains('\0') {
        return Err(DeployError::format(format!(
            "entry name contains NUL byte: {:?}",
            name
        )));
    }

    let mut safe = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            CurDir => {}
            Normal(s) => {
                #[cfg(windows)]
                if s.to_string_lossy().contains(':') {
                    return Err(DeployError::format(format!(
                        "entry name component contains colon: {:?}",
                        name
                    )));
                }
                safe.push(s);
            }
            ParentDir | RootDir | Prefix(_) => {
                return Err(DeployError::format(format!(
                    "entry name escapes destination: {:?}",
                    name
                )));
            }
        }
    }
    Ok(safe)
}

/// Validate frame payload size against protocol::MAX_FRAME_SIZE
pub fn validate_frame_size(size: usize) -> Result<()> {
    if size > crate::protocol::MAX_FRAME_SIZE {
        return Err(DeployError::protocol(format!(
            "frame payload too large: {} bytes (max: {})",
            size,
            crate::protocol::MAX_FRAME_SIZE
        )));
    }
    Ok(())
}

/// Build frame header (11 bytes)
/// Format: MAGIC (4) | VERSION (2) | KIND (1) | LENGTH (4)
pub fn build_frame_header(kind: u8, payload_len: u32) -> [u8; FRAME_HEADER_LEN] {
    use crate::protocol::{MAGIC, VERSION};

    let mut header = [0u8; FRAME_HEADER_LEN];
    header[0..4].copy_from_slice(MAGIC);
    header[4..6].copy_from_slice(&VERSION.to_le_bytes());
    header[6] = kind;
    header[7..11].copy_from_slice(&payload_len.to_le_bytes());
    header
}

/// Parse frame header
/// Returns: (kind, payload_length)
pub fn parse_frame_header(header: &[u8; FRAME_HEADER_LEN]) -> Result<(u8, u32)> {
    use crate::protocol::{MAGIC, VERSION};

    if &header[0..4] != MAGIC {
        return Err(DeployError::protocol("invalid magic in frame header"));
    }

    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != VERSION {
        return Err(DeployError::protocol(format!(
            "protocol version mismatch: got {}, expected {}",
            version, VERSION
        )));
    }

    let kind = header[6];
    let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]);
    validate_frame_size(payload_len as usize)?;

    Ok((kind, payload_len))
}

/// Create directory with parent creation. Idempotent.
pub fn ensure_dir_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path).map_err(|e| DeployError::io(path, e))?;
    } else if !path.is_dir() {
        return Err(DeployError::io(
            path,
            std::io::Error::new(std::io::ErrorKind::AlreadyExists, "exists and is not a directory"),
        ));
    }
    Ok(())
}

/// Create parent directory if needed
pub fn ensure_parent_exists(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir_exists(parent)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_safe_relative_path_accepts_plain_names() {
        assert_eq!(
            safe_relative_path("b/c.txt").unwrap(),
            Path::new("b").join("c.txt")
        );
        assert_eq!(
            safe_relative_path("./b/./c.txt").unwrap(),
            Path::new("b").join("c.txt")
        );
        assert_eq!(
            safe_relative_path("b//c.txt").unwrap(),
            Path::new("b").join("c.txt")
        );
    }

    #[test]
    fn test_safe_relative_path_rejects_absolute() {
        assert!(safe_relative_path("/etc/passwd").is_err());
    }

    #[test]
    fn test_safe_relative_path_rejects_traversal() {
        assert!(matches!(
            safe_relative_path("../etc/passwd"),
            Err(DeployError::Format(_))
        ));
        assert!(safe_relative_path("b/../../etc/passwd").is_err());
        assert!(safe_relative_path("file\0.txt").is_err());
    }

    #[cfg(windows)]
    #[test]
    fn test_safe_relative_path_windows_ads() {
        assert!(safe_relative_path("file.txt:stream").is_err());
    }

    #[test]
    fn test_frame_header_round_trip() {
        let header = build_frame_header(crate::protocol::frame::BINARY, 4096);
        let (kind, len) = parse_frame_header(&header).unwrap();
        assert_eq!(kind, crate::protocol::frame::BINARY);
        assert_eq!(len, 4096);
    }

    #[test]
    fn test_parse_frame_header_invalid_magic() {
        let mut header = build_frame_header(crate::protocol::frame::TEXT, 100);
        header[0..4].copy_from_slice(b"WRNG");
        assert!(matches!(
            parse_frame_header(&header),
            Err(DeployError::Protocol(_))
        ));
    }

    #[test]
    fn test_parse_frame_header_wrong_version() {
        let mut header = build_frame_header(crate::protocol::frame::TEXT, 100);
        header[4..6].copy_from_slice(&999u16.to_le_bytes());
        assert!(parse_frame_header(&header).is_err());
    }

    #[test]
    fn test_parse_frame_header_oversized() {
        let header = build_frame_header(
            crate::protocol::frame::BINARY,
            (crate::protocol::MAX_FRAME_SIZE + 1) as u32,
        );
        assert!(parse_frame_header(&header).is_err());
    }

    #[test]
    fn test_validate_frame_size_edge_cases() {
        assert!(validate_frame_size(0).is_ok());
        assert!(validate_frame_size(crate::protocol::MAX_FRAME_SIZE).is_ok());
        assert!(validate_frame_size(crate::protocol::MAX_FRAME_SIZE + 1).is_err());
        assert!(validate_frame_size(usize::MAX).is_err());
    }

    #[test]
    fn test_ensure_dir_exists() {
        let temp_dir = TempDir::new().unwrap();
        let new_dir = temp_dir.path().join("new").join("nested").join("dir");

        assert!(!new_dir.exists());
        ensure_dir_exists(&new_dir).unwrap();
        assert!(new_dir.is_dir());

        // Should be idempotent
        ensure_dir_exists(&new_dir).unwrap();
        assert!(new_dir.is_dir());

        let file = temp_dir.path().join("plain");
        std::fs::write(&file, b"x").unwrap();
        assert!(matches!(ensure_dir_exists(&file), Err(DeployError::Io { .. })));
    }

    #[test]
    fn test_ensure_parent_exists() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("new").join("nested").join("file.txt");

        ensure_parent_exists(&file_path).unwrap();
        assert!(file_path.parent().unwrap().is_dir());
    }
}
