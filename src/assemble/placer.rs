use std::path::{Path, PathBuf};

use nix::mount::{umount2, MntFlags};

use crate::error::{IoResultExt, Result};
use crate::transmat::remove_tree_force;

/// a strategy for making a source tree appear at a target path
///
/// every placer must leave the target behaving as if it contained the
/// source tree. after teardown no mount or scratch directory may remain,
/// and the source must be observably unchanged (unless the caller asked
/// for a bare writable mount).
pub trait Placer: Send + Sync {
    fn name(&self) -> &'static str;

    fn place(
        &self,
        source: &Path,
        target: &Path,
        writable: bool,
        bare_mount: bool,
    ) -> Result<Emplacement>;
}

/// one active placement and how to reverse it
///
/// teardown is idempotent: the action is consumed on first use.
#[derive(Debug)]
pub struct Emplacement {
    target: PathBuf,
    action: Option<TeardownAction>,
}

#[derive(Debug)]
enum TeardownAction {
    /// detach a mount at the target
    Unmount,
    /// detach a mount and remove the per-placement scratch area
    UnmountAndScrub { scratch: PathBuf },
    /// remove the copied tree at the target
    RemoveTree,
}

impl Emplacement {
    pub(crate) fn mounted(target: PathBuf) -> Self {
        Self {
            target,
            action: Some(TeardownAction::Unmount),
        }
    }

    pub(crate) fn mounted_with_scratch(target: PathBuf, scratch: PathBuf) -> Self {
        Self {
            target,
            action: Some(TeardownAction::UnmountAndScrub { scratch }),
        }
    }

    pub(crate) fn copied(target: PathBuf) -> Self {
        Self {
            target,
            action: Some(TeardownAction::RemoveTree),
        }
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// reverse this placement; repeated calls are silent no-ops
    pub fn teardown(&mut self) -> Result<()> {
        match self.action.take() {
            None => Ok(()),
            Some(TeardownAction::Unmount) => {
                umount2(&self.target, MntFlags::MNT_DETACH).with_path(&self.target)
            }
            Some(TeardownAction::UnmountAndScrub { scratch }) => {
                umount2(&self.target, MntFlags::MNT_DETACH).with_path(&self.target)?;
                remove_tree_force(&scratch)
            }
            Some(TeardownAction::RemoveTree) => remove_tree_force(&self.target),
        }
    }
}
