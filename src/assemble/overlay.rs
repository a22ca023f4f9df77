use std::fs;
use std::path::{Path, PathBuf};

use nix::mount::{mount, MsFlags};

use crate::assemble::placer::{Emplacement, Placer};
use crate::error::{Error, IoResultExt, Result};

/// overlayfs placer: a writable scratch layer over a read-only lower tree
///
/// used for writable, non-bare placements where mounts are available; the
/// source is the lower layer and stays untouched, all mutations land in a
/// per-placement upper directory that teardown removes.
pub struct OverlayPlacer {
    scratch_root: PathBuf,
}

impl OverlayPlacer {
    pub fn new(scratch_root: &Path) -> Result<Self> {
        fs::create_dir_all(scratch_root).with_path(scratch_root)?;
        Ok(Self {
            scratch_root: scratch_root.to_path_buf(),
        })
    }
}

impl Placer for OverlayPlacer {
    fn name(&self) -> &'static str {
        "overlay"
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
                "bare mounts cannot go through an overlay".to_string(),
            ));
        }
        if !writable {
            return Err(Error::Config(
                "overlay placement is only for writable parts; use a read-only bind instead"
                    .to_string(),
            ));
        }

        fs::create_dir_all(target).with_path(target)?;
        let scratch = tempfile::TempDir::new_in(&self.scratch_root)
            .with_path(&self.scratch_root)?
            .into_path();
        let upper = scratch.join("upper");
        let work = scratch.join("work");
        fs::create_dir(&upper).with_path(&upper)?;
        fs::create_dir(&work).with_path(&work)?;

        let data = format!(
            "lowerdir={},upperdir={},workdir={}",
            source.display(),
            upper.display(),
            work.display()
        );
        mount(
            Some("overlay"),
            target,
            Some("overlay"),
            MsFlags::empty(),
            Some(data.as_str()),
        )
        .with_path(target)?;

        Ok(Emplacement::mounted_with_scratch(
            target.to_path_buf(),
            scratch,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_overlay_rejects_bare_mount() {
        let dir = tempdir().unwrap();
        let placer = OverlayPlacer::new(&dir.path().join("scratch")).unwrap();
        let source = dir.path().join("source");
        fs::create_dir(&source).unwrap();

        let err = placer
            .place(&source, &dir.path().join("target"), true, true)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_overlay_rejects_non_writable() {
        let dir = tempdir().unwrap();
        let placer = OverlayPlacer::new(&dir.path().join("scratch")).unwrap();
        let source = dir.path().join("source");
        fs::create_dir(&source).unwrap();

        let err = placer
            .place(&source, &dir.path().join("target"), false, false)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
