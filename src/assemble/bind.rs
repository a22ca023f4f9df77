use std::fs;
use std::path::Path;

use nix::mount::{mount, MsFlags};

use crate::assemble::placer::{Emplacement, Placer};
use crate::error::{IoResultExt, Result};

/// bind-mount placer: fastest, requires mount privilege
///
/// the only placer that can satisfy `bare_mount`; read-only placements get
/// the bind remounted with MS_RDONLY.
pub struct BindPlacer;

impl Placer for BindPlacer {
    fn name(&self) -> &'static str {
        "bind"
    }

    fn place(
        &self,
        source: &Path,
        target: &Path,
        writable: bool,
        _bare_mount: bool,
    ) -> Result<Emplacement> {
        fs::create_dir_all(target).with_path(target)?;

        mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .with_path(target)?;

        if !writable {
            // a bind mount ignores MS_RDONLY at creation; it takes a remount
            mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .with_path(target)?;
        }

        Ok(Emplacement::mounted(target.to_path_buf()))
    }
}
