//! transmats: transport + materialization drivers, one per kind of data
//! source. a driver can materialize a tree identified by a CommitId and
//! scan an existing tree to compute one.

pub mod dir;
pub mod git;
pub mod tar;
pub mod workspace;

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::filter::{Filter, FilterSet};
use crate::hash::CommitId;
use crate::warehouse::SiloUri;

pub use dir::DirTransmat;
pub use git::GitTransmat;
pub use tar::TarTransmat;
pub use workspace::Workspace;

/// short tag selecting a transmat driver ("dir", "tar", "git")
///
/// kind labels are dispatch keys; they must be devoid of slashes and other
/// special characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransmatKind(String);

impl TransmatKind {
    pub fn new(label: &str) -> Result<Self> {
        if label.is_empty()
            || !label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '+' || c == '_')
        {
            return Err(Error::Config(format!(
                "invalid transmat kind label {:?}",
                label
            )));
        }
        Ok(Self(label.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransmatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// options for one materialize or scan call, built fluently
#[derive(Clone, Default)]
pub struct MaterializeOptions {
    pub accept_hash_mismatch: bool,
    pub filters: FilterSet,
    pub cancel: CancelToken,
    pub progress: Option<Sender<f32>>,
}

impl MaterializeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept_hash_mismatch(mut self, accept: bool) -> Self {
        self.accept_hash_mismatch = accept;
        self
    }

    pub fn filter(mut self, filter: Filter) -> Result<Self> {
        self.filters = self.filters.put(filter)?;
        Ok(self)
    }

    pub fn filters(mut self, filters: FilterSet) -> Self {
        self.filters = filters;
        self
    }

    pub fn cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn progress(mut self, reporter: Sender<f32>) -> Self {
        self.progress = Some(reporter);
        self
    }

    pub(crate) fn report_progress(&self, fraction: f32) {
        if let Some(reporter) = &self.progress {
            let _ = reporter.send(fraction);
        }
    }
}

/// a live, locally-visible materialized tree with a declared CommitId
///
/// created by exactly one materialize call; torn down by exactly one
/// teardown (extra calls are silent no-ops). the caller owns it
/// exclusively and must not mutate the tree underneath it.
#[derive(Debug)]
pub struct Arena {
    path: PathBuf,
    hash: CommitId,
    cleanup: Option<ArenaCleanup>,
}

#[derive(Debug)]
enum ArenaCleanup {
    /// remove the materialized tree from the workspace
    RemoveTree,
}

impl Arena {
    pub(crate) fn owned(path: PathBuf, hash: CommitId) -> Self {
        Self {
            path,
            hash,
            cleanup: Some(ArenaCleanup::RemoveTree),
        }
    }

    /// an arena whose storage belongs to a driver-managed cache; teardown
    /// is a no-op
    pub(crate) fn cached(path: PathBuf, hash: CommitId) -> Self {
        Self {
            path,
            hash,
            cleanup: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// the digest this arena actually satisfies
    pub fn hash(&self) -> &CommitId {
        &self.hash
    }

    /// release storage held by this arena; idempotent
    pub fn teardown(&mut self) -> Result<()> {
        match self.cleanup.take() {
            Some(ArenaCleanup::RemoveTree) => {
                if self.path.exists() {
                    remove_tree_force(&self.path)?;
                }
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// remove a tree that may contain read-only directories
pub(crate) fn remove_tree_force(path: &Path) -> Result<()> {
    use crate::error::IoResultExt;
    use std::os::unix::fs::PermissionsExt;

    for entry in walkdir::WalkDir::new(path) {
        let entry = entry.map_err(|e| Error::Io {
            path: path.to_path_buf(),
            source: e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "walk error")),
        })?;
        if entry.file_type().is_dir() {
            let perms = fs::Permissions::from_mode(0o700);
            fs::set_permissions(entry.path(), perms).with_path(entry.path())?;
        }
    }
    fs::remove_dir_all(path).with_path(path)
}

/// a transmat driver
///
/// drivers are safe for concurrent use with distinct commit ids; the kind
/// parameter travels with every call so a dispatching wrapper can route it.
pub trait Transmat: Send + Sync {
    /// the kind this driver serves
    fn kind(&self) -> &TransmatKind;

    /// cause the data identified by `commit` to exist on a local filesystem,
    /// verified against its canonical digest unless the options say otherwise
    fn materialize(
        &self,
        kind: &TransmatKind,
        commit: &CommitId,
        silos: &[SiloUri],
        options: &MaterializeOptions,
    ) -> Result<Arena>;

    /// compute the canonical digest of a local tree, publishing the bytes to
    /// the first writable silo when one is given
    fn scan(
        &self,
        kind: &TransmatKind,
        subject: &Path,
        silos: &[SiloUri],
        options: &MaterializeOptions,
    ) -> Result<CommitId>;
}

/// routes calls to the driver registered for each kind
///
/// drivers are first-class values owned by this instance; there is no
/// process-global registry.
#[derive(Default)]
pub struct TransmatDispatch {
    drivers: HashMap<TransmatKind, Box<dyn Transmat>>,
}

impl TransmatDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// register a driver under its own kind
    pub fn register(mut self, driver: Box<dyn Transmat>) -> Result<Self> {
        let kind = driver.kind().clone();
        if self.drivers.insert(kind.clone(), driver).is_some() {
            return Err(Error::Config(format!(
                "transmat kind {:?} registered twice",
                kind.as_str()
            )));
        }
        Ok(self)
    }

    fn driver(&self, kind: &TransmatKind) -> Result<&dyn Transmat> {
        self.drivers
            .get(kind)
            .map(|b| b.as_ref())
            .ok_or_else(|| Error::Config(format!("no transmat registered for kind {:?}", kind.as_str())))
    }

    pub fn materialize(
        &self,
        kind: &TransmatKind,
        commit: &CommitId,
        silos: &[SiloUri],
        options: &MaterializeOptions,
    ) -> Result<Arena> {
        self.driver(kind)?.materialize(kind, commit, silos, options)
    }

    pub fn scan(
        &self,
        kind: &TransmatKind,
        subject: &Path,
        silos: &[SiloUri],
        options: &MaterializeOptions,
    ) -> Result<CommitId> {
        self.driver(kind)?.scan(kind, subject, silos, options)
    }
}

/// guard drivers use to reject calls routed with the wrong kind label
pub(crate) fn must_be_kind(expected: &TransmatKind, got: &TransmatKind) -> Result<()> {
    if expected == got {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "this transmat handles kind {:?}, not {:?}",
            expected.as_str(),
            got.as_str()
        )))
    }
}
