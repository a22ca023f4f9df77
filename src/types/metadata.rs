use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;

use crate::error::{Error, IoResultExt, Result};

/// node types the canonical format can represent
///
/// anything else (fifos, sockets, devices) fails closed: the walker refuses
/// to digest trees containing them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Regular,
    Dir,
    Symlink,
}

impl NodeType {
    /// single-byte tag used in the canonical record
    pub fn tag(self) -> u8 {
        match self {
            NodeType::Regular => b'f',
            NodeType::Dir => b'd',
            NodeType::Symlink => b'l',
        }
    }
}

/// canonical per-node attributes
///
/// paths are relative, forward-slash separated, with no leading slash; the
/// walk root is the empty string. mode carries only the low 12 bits
/// (setuid/setgid/sticky + permissions).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub path: String,
    pub node_type: NodeType,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime_ns: i64,
    /// literal symlink target; empty for non-symlinks
    pub link_target: String,
}

impl Metadata {
    /// read canonical metadata from an on-disk node (does not follow symlinks)
    ///
    /// `rel_path` is the canonical path to record; `disk_path` is where the
    /// node actually lives.
    pub fn from_lstat(disk_path: &Path, rel_path: &str) -> Result<Self> {
        let meta = fs::symlink_metadata(disk_path).with_path(disk_path)?;
        let ft = meta.file_type();

        let node_type = if ft.is_file() {
            NodeType::Regular
        } else if ft.is_dir() {
            NodeType::Dir
        } else if ft.is_symlink() {
            NodeType::Symlink
        } else {
            return Err(Error::UnsupportedNode {
                path: disk_path.to_path_buf(),
                node_type: unsupported_name(&ft),
            });
        };

        let link_target = if node_type == NodeType::Symlink {
            let target = fs::read_link(disk_path).with_path(disk_path)?;
            target.to_string_lossy().into_owned()
        } else {
            String::new()
        };

        Ok(Self {
            path: rel_path.to_string(),
            node_type,
            mode: meta.mode() & 0o7777,
            uid: meta.uid(),
            gid: meta.gid(),
            mtime_ns: meta
                .mtime()
                .saturating_mul(1_000_000_000)
                .saturating_add(meta.mtime_nsec()),
            link_target,
        })
    }
}

fn unsupported_name(ft: &fs::FileType) -> &'static str {
    if ft.is_fifo() {
        "fifo"
    } else if ft.is_socket() {
        "socket"
    } else if ft.is_block_device() {
        "block device"
    } else if ft.is_char_device() {
        "char device"
    } else {
        "unknown"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::{symlink, PermissionsExt};
    use tempfile::tempdir;

    #[test]
    fn test_regular_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.txt");
        fs::write(&path, "content").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let meta = Metadata::from_lstat(&path, "file.txt").unwrap();
        assert_eq!(meta.node_type, NodeType::Regular);
        assert_eq!(meta.path, "file.txt");
        assert_eq!(meta.mode, 0o644);
        assert!(meta.link_target.is_empty());
    }

    #[test]
    fn test_directory() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();

        let meta = Metadata::from_lstat(&sub, "sub").unwrap();
        assert_eq!(meta.node_type, NodeType::Dir);
    }

    #[test]
    fn test_symlink_records_literal_target() {
        let dir = tempdir().unwrap();
        let link = dir.path().join("link");
        symlink("/tmp/nonexistant/have-mercy", &link).unwrap();

        let meta = Metadata::from_lstat(&link, "link").unwrap();
        assert_eq!(meta.node_type, NodeType::Symlink);
        assert_eq!(meta.link_target, "/tmp/nonexistant/have-mercy");
    }

    #[test]
    fn test_fifo_fails_closed() {
        let dir = tempdir().unwrap();
        let fifo = dir.path().join("pipe");
        nix::unistd::mkfifo(&fifo, nix::sys::stat::Mode::from_bits_truncate(0o644)).unwrap();

        let err = Metadata::from_lstat(&fifo, "pipe").unwrap_err();
        match err {
            Error::UnsupportedNode { node_type, .. } => assert_eq!(node_type, "fifo"),
            other => panic!("expected UnsupportedNode, got {other:?}"),
        }
    }

    #[test]
    fn test_mode_keeps_only_low_bits() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, "x").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o1777)).unwrap();

        let meta = Metadata::from_lstat(&path, "f").unwrap();
        assert_eq!(meta.mode, 0o1777);
    }

    #[test]
    fn test_type_tags_distinct() {
        assert_ne!(NodeType::Regular.tag(), NodeType::Dir.tag());
        assert_ne!(NodeType::Dir.tag(), NodeType::Symlink.tag());
    }
}
