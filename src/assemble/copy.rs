use std::fs::{self, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::assemble::placer::{Emplacement, Placer};
use crate::cancel::CancelToken;
use crate::error::{Error, IoResultExt, Result};
use crate::filter::FilterSet;
use crate::fshash::fill_tree;

/// copy placer: a plain recursive byte copy of the source tree
///
/// always available and always slowest. read-only placement is enforced by
/// stripping write bits after the copy, since there is no mount to remount.
pub struct CopyPlacer;

impl Placer for CopyPlacer {
    fn name(&self) -> &'static str {
        "copy"
    }

    fn place(
        &self,
        source: &Path,
        target: &Path,
        writable: bool,
        bare_mount: bool,
    ) -> Result<Emplacement> {
        if bare_mount {
            return Err(Error::Config(
                "bare mounts need bind capability; a copy cannot pass changes through".to_string(),
            ));
        }

        fill_tree(source, target, &FilterSet::new(), &CancelToken::new())?;

        if !writable {
            strip_write_bits(target)?;
        }

        Ok(Emplacement::copied(target.to_path_buf()))
    }
}

fn strip_write_bits(root: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(root).contents_first(true) {
        let entry = entry.map_err(|e| Error::Io {
            path: root.to_path_buf(),
            source: e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "walk error")),
        })?;
        if entry.file_type().is_symlink() {
            continue;
        }
        let meta = entry.metadata().map_err(|e| Error::Io {
            path: entry.path().to_path_buf(),
            source: e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "stat error")),
        })?;
        let mode = meta.permissions().mode() & 0o7777;
        fs::set_permissions(entry.path(), Permissions::from_mode(mode & !0o222))
            .with_path(entry.path())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_copy_place_reproduces_tree() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source");
        fs::create_dir_all(source.join("sub")).unwrap();
        fs::write(source.join("sub/f"), "data").unwrap();

        let target = dir.path().join("target");
        let mut emplacement = CopyPlacer
            .place(&source, &target, true, false)
            .unwrap();

        assert_eq!(fs::read_to_string(target.join("sub/f")).unwrap(), "data");
        emplacement.teardown().unwrap();
        assert!(!target.exists());
        // the source is untouched
        assert_eq!(fs::read_to_string(source.join("sub/f")).unwrap(), "data");
    }

    #[test]
    fn test_read_only_copy_strips_write_bits() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source");
        fs::create_dir(&source).unwrap();
        fs::write(source.join("f"), "data").unwrap();

        let target = dir.path().join("target");
        let mut emplacement = CopyPlacer
            .place(&source, &target, false, false)
            .unwrap();

        let mode = fs::metadata(target.join("f")).unwrap().permissions().mode();
        assert_eq!(mode & 0o222, 0);
        assert!(fs::write(target.join("f"), "clobber").is_err());

        // teardown succeeds despite the read-only tree
        emplacement.teardown().unwrap();
        assert!(!target.exists());
    }

    #[test]
    fn test_bare_mount_rejected() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source");
        fs::create_dir(&source).unwrap();
        let err = CopyPlacer
            .place(&source, &dir.path().join("target"), true, true)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
