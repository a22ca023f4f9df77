use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, IoResultExt, Result};
use crate::hash::CommitId;

const MARKER_FILE: &str = "workspace.toml";
const FORMAT_VERSION: u32 = 1;

/// on-disk marker identifying a workspace and its layout version
#[derive(Debug, Serialize, Deserialize)]
struct Marker {
    format: u32,
}

/// per-transmat working directory
///
/// layout:
/// ```text
/// workPath/
///   workspace.toml           layout version marker
///   committed/<commitID>/    final materialized arenas
///   staging/<unique>/        in-progress materializations
/// ```
///
/// a workspace is owned by one driver instance; a second instance needs its
/// own root. staging directories are tempdirs, so failed materializations
/// clean up after themselves; the atomic rename into `committed/` is the
/// only publication step.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// open (creating if necessary) a workspace at `root`
    ///
    /// recognizes the ruins of a prior run: existing committed trees are
    /// kept, stale marker versions are rejected.
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root.join("committed")).with_path(root)?;
        fs::create_dir_all(root.join("staging")).with_path(root)?;

        let marker_path = root.join(MARKER_FILE);
        if marker_path.exists() {
            let content = fs::read_to_string(&marker_path).with_path(&marker_path)?;
            let marker: Marker = toml::from_str(&content)
                .map_err(|e| Error::Config(format!("bad workspace marker: {}", e)))?;
            if marker.format != FORMAT_VERSION {
                return Err(Error::Config(format!(
                    "workspace at {} has format {}, this build expects {}",
                    root.display(),
                    marker.format,
                    FORMAT_VERSION
                )));
            }
        } else {
            let marker = Marker {
                format: FORMAT_VERSION,
            };
            let content = toml::to_string_pretty(&marker)
                .map_err(|e| Error::Internal(format!("marker serialization: {}", e)))?;
            fs::write(&marker_path, content).with_path(&marker_path)?;
        }

        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staging_root(&self) -> PathBuf {
        self.root.join("staging")
    }

    /// final resting place for a materialized arena
    pub fn committed_path(&self, commit: &CommitId) -> PathBuf {
        self.root.join("committed").join(commit.as_str())
    }

    /// a fresh staging directory; removed automatically if dropped before
    /// its contents are promoted
    pub fn staging_dir(&self) -> Result<tempfile::TempDir> {
        tempfile::TempDir::new_in(self.staging_root()).with_path(self.staging_root())
    }

    /// atomically publish a staged tree as the arena for `commit`
    ///
    /// the rename is the commit point. losing a race to a concurrent
    /// materialization of the same commit is fine: the tree already in
    /// place is equivalent, so it wins and the staged copy is dropped.
    pub fn promote(&self, staged_tree: &Path, commit: &CommitId) -> Result<PathBuf> {
        let final_path = self.committed_path(commit);
        if final_path.exists() {
            return Ok(final_path);
        }
        match fs::rename(staged_tree, &final_path) {
            Ok(()) => Ok(final_path),
            Err(_) if final_path.exists() => Ok(final_path),
            Err(source) => Err(Error::Io {
                path: final_path,
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_layout() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("work");
        let ws = Workspace::open(&root).unwrap();

        assert!(root.join("committed").is_dir());
        assert!(root.join("staging").is_dir());
        assert!(root.join(MARKER_FILE).is_file());
        assert_eq!(ws.root(), root);
    }

    #[test]
    fn test_reopen_accepts_own_marker() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("work");
        Workspace::open(&root).unwrap();
        Workspace::open(&root).unwrap();
    }

    #[test]
    fn test_open_rejects_future_format() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("work");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join(MARKER_FILE), "format = 999\n").unwrap();

        let err = Workspace::open(&root).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_promote_moves_tree_atomically() {
        let dir = tempdir().unwrap();
        let ws = Workspace::open(&dir.path().join("work")).unwrap();

        let staging = ws.staging_dir().unwrap();
        let tree = staging.path().join("tree");
        fs::create_dir(&tree).unwrap();
        fs::write(tree.join("f"), "x").unwrap();

        let commit = CommitId::new("abc123");
        let final_path = ws.promote(&tree, &commit).unwrap();
        assert_eq!(final_path, ws.committed_path(&commit));
        assert_eq!(fs::read_to_string(final_path.join("f")).unwrap(), "x");
    }

    #[test]
    fn test_promote_race_loser_defers_to_existing() {
        let dir = tempdir().unwrap();
        let ws = Workspace::open(&dir.path().join("work")).unwrap();
        let commit = CommitId::new("abc123");

        // first materialization wins
        let staging_a = ws.staging_dir().unwrap();
        let tree_a = staging_a.path().join("tree");
        fs::create_dir(&tree_a).unwrap();
        fs::write(tree_a.join("f"), "first").unwrap();
        ws.promote(&tree_a, &commit).unwrap();

        // second arrives with an equivalent tree; the existing one stays
        let staging_b = ws.staging_dir().unwrap();
        let tree_b = staging_b.path().join("tree");
        fs::create_dir(&tree_b).unwrap();
        fs::write(tree_b.join("f"), "first").unwrap();
        let final_path = ws.promote(&tree_b, &commit).unwrap();

        assert_eq!(fs::read_to_string(final_path.join("f")).unwrap(), "first");
    }

    #[test]
    fn test_dropped_staging_cleans_up() {
        let dir = tempdir().unwrap();
        let ws = Workspace::open(&dir.path().join("work")).unwrap();
        {
            let staging = ws.staging_dir().unwrap();
            fs::write(staging.path().join("partial"), "x").unwrap();
        }
        let leftovers: Vec<_> = fs::read_dir(ws.staging_root()).unwrap().collect();
        assert!(leftovers.is_empty());
    }
}
