use std::fs::{self, File, OpenOptions, Permissions};
use std::io::{Read, Write};
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::Path;

use crate::cancel::CancelToken;
use crate::error::{Error, IoResultExt, Result};
use crate::filter::FilterSet;
use crate::fshash::bucket::MemoryBucket;
use crate::fspatch;
use crate::hash::{CommitId, PayloadHasher};
use crate::types::{Metadata, NodeType};

const COPY_BUF_SIZE: usize = 64 * 1024;

/// walk a tree and compute its canonical digest
pub fn scan_tree(src: &Path, filters: &FilterSet, cancel: &CancelToken) -> Result<CommitId> {
    let mut bucket = MemoryBucket::new();
    fill_bucket(src, None, &mut bucket, filters, cancel)?;
    Ok(bucket.tree_digest())
}

/// walk a tree, copying it into `dest`, and compute the canonical digest
/// of what was read in the same pass
pub fn fill_tree(
    src: &Path,
    dest: &Path,
    filters: &FilterSet,
    cancel: &CancelToken,
) -> Result<CommitId> {
    let mut bucket = MemoryBucket::new();
    fill_bucket(src, Some(dest), &mut bucket, filters, cancel)?;
    Ok(bucket.tree_digest())
}

/// the canonical walk: depth-first, lexicographic on raw entry-name bytes
///
/// every node is recorded into `bucket` in walk order; when `dest` is given,
/// the tree is reproduced there byte-for-byte with filtered metadata.
/// directory mtimes in the destination are restored in a post-order pass,
/// after writing children has stopped perturbing them.
pub fn fill_bucket(
    src: &Path,
    dest: Option<&Path>,
    bucket: &mut MemoryBucket,
    filters: &FilterSet,
    cancel: &CancelToken,
) -> Result<()> {
    cancel.check()?;

    let mut root_meta = Metadata::from_lstat(src, "")?;
    if root_meta.node_type != NodeType::Dir {
        return Err(Error::Config(format!(
            "walk subject {} is not a directory",
            src.display()
        )));
    }
    filters.apply(&mut root_meta);
    bucket.record(root_meta.clone(), None)?;

    if let Some(dest) = dest {
        if !dest.exists() {
            fs::create_dir_all(dest).with_path(dest)?;
        }
    }

    walk_dir(src, dest, "", bucket, filters, cancel)?;

    // root metadata last: its mtime would otherwise be clobbered by the
    // children created above
    if let Some(dest) = dest {
        apply_dir_metadata(dest, &root_meta)?;
    }
    Ok(())
}

fn walk_dir(
    src_dir: &Path,
    dest_dir: Option<&Path>,
    prefix: &str,
    bucket: &mut MemoryBucket,
    filters: &FilterSet,
    cancel: &CancelToken,
) -> Result<()> {
    let mut entries: Vec<_> = fs::read_dir(src_dir)
        .with_path(src_dir)?
        .collect::<std::io::Result<Vec<_>>>()
        .with_path(src_dir)?;
    entries.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

    for entry in entries {
        cancel.check()?;

        let src_path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        let rel_path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{}/{}", prefix, name)
        };
        let dest_path = dest_dir.map(|d| d.join(&name));

        let mut meta = Metadata::from_lstat(&src_path, &rel_path)?;
        filters.apply(&mut meta);

        match meta.node_type {
            NodeType::Dir => {
                bucket.record(meta.clone(), None)?;
                if let Some(dest_path) = &dest_path {
                    fs::create_dir(dest_path).with_path(dest_path)?;
                }
                walk_dir(
                    &src_path,
                    dest_path.as_deref(),
                    &rel_path,
                    bucket,
                    filters,
                    cancel,
                )?;
                if let Some(dest_path) = &dest_path {
                    apply_dir_metadata(dest_path, &meta)?;
                }
            }

            NodeType::Symlink => {
                if let Some(dest_path) = &dest_path {
                    symlink(&meta.link_target, dest_path).with_path(dest_path)?;
                    fspatch::lchown_if_needed(dest_path, meta.uid, meta.gid)?;
                    fspatch::lutimens(dest_path, meta.mtime_ns)?;
                }
                bucket.record(meta, None)?;
            }

            NodeType::Regular => {
                let payload_hash = copy_regular(&src_path, dest_path.as_deref(), &meta)?;
                bucket.record(meta, Some(payload_hash))?;
            }
        }
    }
    Ok(())
}

/// stream one regular file through the payload hasher, optionally teeing
/// bytes into a freshly created destination file
fn copy_regular(
    src_path: &Path,
    dest_path: Option<&Path>,
    meta: &Metadata,
) -> Result<[u8; crate::hash::DIGEST_LEN]> {
    let mut src = File::open(src_path).with_path(src_path)?;
    let mut hasher = PayloadHasher::new();

    let mut dest = match dest_path {
        Some(dest_path) => Some(
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(dest_path)
                .with_path(dest_path)?,
        ),
        None => None,
    };

    let mut buf = [0u8; COPY_BUF_SIZE];
    loop {
        let n = src.read(&mut buf).with_path(src_path)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        if let Some(dest) = dest.as_mut() {
            dest.write_all(&buf[..n])
                .with_path(dest_path.unwrap_or(src_path))?;
        }
    }
    drop(dest);

    if let Some(dest_path) = dest_path {
        // ownership first, then mode (chown may clear setuid bits), time last
        fspatch::lchown_if_needed(dest_path, meta.uid, meta.gid)?;
        fs::set_permissions(dest_path, Permissions::from_mode(meta.mode)).with_path(dest_path)?;
        fspatch::utimens(dest_path, meta.mtime_ns)?;
    }
    Ok(hasher.finalize())
}

fn apply_dir_metadata(dest_path: &Path, meta: &Metadata) -> Result<()> {
    fspatch::lchown_if_needed(dest_path, meta.uid, meta.gid)?;
    fs::set_permissions(dest_path, Permissions::from_mode(meta.mode)).with_path(dest_path)?;
    fspatch::utimens(dest_path, meta.mtime_ns)
}
