//! metadata patching helpers the standard library does not cover:
//! nanosecond utimes, symlink-respecting variants, and lchown.

use std::ffi::CString;
use std::path::Path;

use nix::libc;

use crate::error::{Error, Result};

fn c_path(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_encoded_bytes()).map_err(|_| Error::Io {
        path: path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "path contains nul"),
    })
}

fn split_ns(mtime_ns: i64) -> libc::timespec {
    libc::timespec {
        tv_sec: mtime_ns.div_euclid(1_000_000_000),
        tv_nsec: mtime_ns.rem_euclid(1_000_000_000),
    }
}

fn utimensat(path: &Path, mtime_ns: i64, flags: libc::c_int) -> Result<()> {
    let c = c_path(path)?;
    // atime is not part of the canonical record; pin it to mtime
    let times = [split_ns(mtime_ns), split_ns(mtime_ns)];
    let ret = unsafe { libc::utimensat(libc::AT_FDCWD, c.as_ptr(), times.as_ptr(), flags) };
    if ret != 0 {
        return Err(Error::Io {
            path: path.to_path_buf(),
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// set mtime (nanoseconds), following symlinks
pub fn utimens(path: &Path, mtime_ns: i64) -> Result<()> {
    utimensat(path, mtime_ns, 0)
}

/// set mtime (nanoseconds) on the node itself, never following symlinks
pub fn lutimens(path: &Path, mtime_ns: i64) -> Result<()> {
    utimensat(path, mtime_ns, libc::AT_SYMLINK_NOFOLLOW)
}

/// chown the node itself, never following symlinks
pub fn lchown(path: &Path, uid: u32, gid: u32) -> Result<()> {
    let c = c_path(path)?;
    let ret = unsafe { libc::lchown(c.as_ptr(), uid, gid) };
    if ret != 0 {
        return Err(Error::Io {
            path: path.to_path_buf(),
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// chown the node only when the recorded owner differs from the current user
///
/// unprivileged processes cannot chown at all; materializing a tree you
/// already own must not require root.
pub fn lchown_if_needed(path: &Path, uid: u32, gid: u32) -> Result<()> {
    let current_uid = nix::unistd::getuid().as_raw();
    let current_gid = nix::unistd::getgid().as_raw();
    if uid == current_uid && gid == current_gid {
        return Ok(());
    }
    lchown(path, uid, gid)
}
