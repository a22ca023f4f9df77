use std::fs;
use std::path::Path;

use tracing::{debug, info};

use crate::error::{Error, Result, SiloAttempt};
use crate::fshash::{fill_tree, scan_tree};
use crate::hash::CommitId;
use crate::transmat::{
    must_be_kind, Arena, MaterializeOptions, Transmat, TransmatKind, Workspace,
};
use crate::warehouse::{self, Scheme, SiloUri};

pub const KIND: &str = "dir";

/// transmat for plain directory trees on locally reachable filesystems
///
/// silos address whole trees: `file://PATH` is the tree itself,
/// `file+ca://ROOT` shards trees by commit id.
pub struct DirTransmat {
    kind: TransmatKind,
    workspace: Workspace,
}

impl DirTransmat {
    pub fn new(work_path: &Path) -> Result<Self> {
        Ok(Self {
            kind: TransmatKind::new(KIND)?,
            workspace: Workspace::open(work_path)?,
        })
    }

    fn silo_tree_path(uri: &SiloUri, commit: &CommitId) -> Result<std::path::PathBuf> {
        match uri.scheme() {
            Scheme::File | Scheme::FileCa => warehouse::tree_path(uri, commit),
            other => Err(Error::Config(format!(
                "dir transmat does not speak scheme {:?}",
                other.as_str()
            ))),
        }
    }
}

impl Transmat for DirTransmat {
    fn kind(&self) -> &TransmatKind {
        &self.kind
    }

    fn materialize(
        &self,
        kind: &TransmatKind,
        commit: &CommitId,
        silos: &[SiloUri],
        options: &MaterializeOptions,
    ) -> Result<Arena> {
        must_be_kind(&self.kind, kind)?;

        let mut tried = Vec::new();
        for uri in silos {
            options.cancel.check()?;

            // probe phase: failures here recover to the next silo
            let source = match Self::silo_tree_path(uri, commit) {
                Ok(path) => path,
                Err(e) => {
                    tried.push(SiloAttempt {
                        uri: uri.as_str().to_string(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            if !source.is_dir() {
                debug!(silo = %uri, "silo unavailable, skipping");
                tried.push(SiloAttempt {
                    uri: uri.as_str().to_string(),
                    reason: format!("{} is not a directory", source.display()),
                });
                continue;
            }

            info!(silo = %uri, "dir: fetching tree");
            options.report_progress(0.0);

            // fetch phase: errors from here on are not retried elsewhere
            let staging = self.workspace.staging_dir()?;
            let dest = staging.path().join("tree");
            let observed = fill_tree(&source, &dest, &options.filters, &options.cancel)?;

            if observed != *commit && !options.accept_hash_mismatch {
                // staging tempdir cleans itself on drop
                return Err(Error::HashMismatch {
                    expected: commit.clone(),
                    observed,
                });
            }

            let final_path = self.workspace.promote(&dest, &observed)?;
            options.report_progress(1.0);
            info!(silo = %uri, hash = %observed, "dir: materialize complete");
            return Ok(Arena::owned(final_path, observed));
        }

        Err(Error::WarehouseUnavailable {
            during: "fetch",
            tried,
        })
    }

    fn scan(
        &self,
        kind: &TransmatKind,
        subject: &Path,
        silos: &[SiloUri],
        options: &MaterializeOptions,
    ) -> Result<CommitId> {
        must_be_kind(&self.kind, kind)?;

        let commit = scan_tree(subject, &options.filters, &options.cancel)?;

        // publish to the first writable silo, if any responds
        for uri in silos {
            options.cancel.check()?;
            let dest = match Self::silo_tree_path(uri, &commit) {
                Ok(path) => path,
                Err(_) => continue,
            };
            let writable_root = match uri.scheme() {
                Scheme::FileCa => Path::new(uri.location()).to_path_buf(),
                _ => warehouse::parent_or_cwd(&dest),
            };
            if !writable_root.is_dir() {
                debug!(silo = %uri, "silo not writable, skipping");
                continue;
            }
            if dest.exists() {
                // content-addressed hit; the bytes are already there
                debug!(silo = %uri, hash = %commit, "dir: publish skipped, already present");
                break;
            }
            if uri.scheme() == Scheme::FileCa {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|source| Error::Io {
                            path: parent.to_path_buf(),
                            source,
                        })?;
                }
            }
            fill_tree(subject, &dest, &options.filters, &options.cancel)?;
            info!(silo = %uri, hash = %commit, "dir: tree published");
            break;
        }

        Ok(commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Filter;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn kind() -> TransmatKind {
        TransmatKind::new(KIND).unwrap()
    }

    fn build_tree(root: &Path) {
        fs::create_dir(root.join("a")).unwrap();
        fs::create_dir(root.join("b")).unwrap();
        fs::write(root.join("b/c"), "zyx").unwrap();
        fs::set_permissions(root.join("b/c"), fs::Permissions::from_mode(0o664)).unwrap();
        crate::fspatch::utimens(&root.join("b/c"), 7_000_000_000).unwrap();
        crate::fspatch::utimens(&root.join("a"), 3_000_000_000).unwrap();
        crate::fspatch::utimens(&root.join("b"), 5_000_000_000).unwrap();
        crate::fspatch::utimens(root, 2_000_000_000).unwrap();
    }

    fn file_uri(path: &Path) -> SiloUri {
        SiloUri::parse(&format!("file://{}", path.display())).unwrap()
    }

    #[test]
    fn test_round_trip_through_file_silo() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source");
        fs::create_dir(&source).unwrap();
        build_tree(&source);

        let transmat = DirTransmat::new(&dir.path().join("work")).unwrap();
        let opts = MaterializeOptions::new();

        let commit = transmat.scan(&kind(), &source, &[], &opts).unwrap();
        let mut arena = transmat
            .materialize(&kind(), &commit, &[file_uri(&source)], &opts)
            .unwrap();

        assert_eq!(arena.hash(), &commit);
        assert_eq!(
            fs::read_to_string(arena.path().join("b/c")).unwrap(),
            "zyx"
        );

        // the arena re-scans to the same id
        let rescanned = transmat.scan(&kind(), arena.path(), &[], &opts).unwrap();
        assert_eq!(rescanned, commit);

        let path = arena.path().to_path_buf();
        arena.teardown().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_scan_is_consistent_across_calls() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source");
        fs::create_dir(&source).unwrap();
        build_tree(&source);

        let transmat = DirTransmat::new(&dir.path().join("work")).unwrap();
        let opts = MaterializeOptions::new();
        let a = transmat.scan(&kind(), &source, &[], &opts).unwrap();
        let b = transmat.scan(&kind(), &source, &[], &opts).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_scan_distinct_trees_distinct_hashes() {
        let dir = tempdir().unwrap();
        let one = dir.path().join("one");
        let two = dir.path().join("two");
        fs::create_dir(&one).unwrap();
        fs::create_dir(&two).unwrap();
        fs::write(one.join("f"), "alpha").unwrap();
        fs::write(two.join("f"), "beta").unwrap();

        let transmat = DirTransmat::new(&dir.path().join("work")).unwrap();
        let opts = MaterializeOptions::new();
        assert_ne!(
            transmat.scan(&kind(), &one, &[], &opts).unwrap(),
            transmat.scan(&kind(), &two, &[], &opts).unwrap()
        );
    }

    #[test]
    fn test_hash_mismatch_leaves_no_residue() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source");
        fs::create_dir(&source).unwrap();
        build_tree(&source);

        let work = dir.path().join("work");
        let transmat = DirTransmat::new(&work).unwrap();
        let opts = MaterializeOptions::new();
        let bogus = CommitId::new("abcd");

        let err = transmat
            .materialize(&kind(), &bogus, &[file_uri(&source)], &opts)
            .unwrap_err();
        assert!(matches!(err, Error::HashMismatch { .. }));

        // nothing staged, nothing committed
        let staged: Vec<_> = fs::read_dir(work.join("staging")).unwrap().collect();
        assert!(staged.is_empty());
        assert!(!work.join("committed").join("abcd").exists());
    }

    #[test]
    fn test_accept_hash_mismatch_reports_observed() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source");
        fs::create_dir(&source).unwrap();
        build_tree(&source);

        let transmat = DirTransmat::new(&dir.path().join("work")).unwrap();
        let opts = MaterializeOptions::new().accept_hash_mismatch(true);
        let bogus = CommitId::new("abcd");

        let mut arena = transmat
            .materialize(&kind(), &bogus, &[file_uri(&source)], &opts)
            .unwrap();
        assert_ne!(arena.hash(), &bogus);
        arena.teardown().unwrap();
    }

    #[test]
    fn test_content_drift_detected() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source");
        fs::create_dir(&source).unwrap();
        build_tree(&source);

        let transmat = DirTransmat::new(&dir.path().join("work")).unwrap();
        let opts = MaterializeOptions::new();
        let commit = transmat.scan(&kind(), &source, &[], &opts).unwrap();

        fs::write(source.join("b/c"), "222").unwrap();
        crate::fspatch::utimens(&source.join("b/c"), 7_000_000_000).unwrap();
        crate::fspatch::utimens(&source.join("b"), 5_000_000_000).unwrap();
        crate::fspatch::utimens(&source, 2_000_000_000).unwrap();

        let err = transmat
            .materialize(&kind(), &commit, &[file_uri(&source)], &opts)
            .unwrap_err();
        match err {
            Error::HashMismatch { expected, observed } => {
                assert_eq!(expected, commit);
                assert_ne!(observed, commit);
            }
            other => panic!("expected HashMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_silo_fallback_skips_dead_first() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source");
        fs::create_dir(&source).unwrap();
        build_tree(&source);

        let transmat = DirTransmat::new(&dir.path().join("work")).unwrap();
        let opts = MaterializeOptions::new();
        let commit = transmat.scan(&kind(), &source, &[], &opts).unwrap();

        let dead = SiloUri::parse("file:///nonexistent/anywhere").unwrap();
        let mut arena = transmat
            .materialize(&kind(), &commit, &[dead, file_uri(&source)], &opts)
            .unwrap();
        assert_eq!(arena.hash(), &commit);
        arena.teardown().unwrap();
    }

    #[test]
    fn test_no_silo_responds() {
        let dir = tempdir().unwrap();
        let transmat = DirTransmat::new(&dir.path().join("work")).unwrap();
        let opts = MaterializeOptions::new();

        let dead_a = SiloUri::parse("file:///nonexistent/a").unwrap();
        let dead_b = SiloUri::parse("file:///nonexistent/b").unwrap();
        let err = transmat
            .materialize(&kind(), &CommitId::new("x"), &[dead_a, dead_b], &opts)
            .unwrap_err();

        match err {
            Error::WarehouseUnavailable { during, tried } => {
                assert_eq!(during, "fetch");
                assert_eq!(tried.len(), 2);
                assert!(tried[0].uri.contains("/a"));
                assert!(tried[1].uri.contains("/b"));
            }
            other => panic!("expected WarehouseUnavailable, got {other:?}"),
        }
    }

    #[test]
    fn test_scan_publishes_to_ca_store() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source");
        fs::create_dir(&source).unwrap();
        build_tree(&source);

        let store = dir.path().join("bounce");
        fs::create_dir(&store).unwrap();
        let ca_uri = SiloUri::parse(&format!("file+ca://{}", store.display())).unwrap();

        let transmat = DirTransmat::new(&dir.path().join("work")).unwrap();
        let opts = MaterializeOptions::new();
        let commit = transmat
            .scan(&kind(), &source, &[ca_uri.clone()], &opts)
            .unwrap();

        let (prefix, full) = commit.to_path_components();
        let published = store.join(prefix).join(full);
        assert!(published.is_dir());
        assert_eq!(fs::read_to_string(published.join("b/c")).unwrap(), "zyx");

        // and the published copy materializes back
        let mut arena = transmat
            .materialize(&kind(), &commit, &[ca_uri], &opts)
            .unwrap();
        assert_eq!(arena.hash(), &commit);
        arena.teardown().unwrap();
    }

    #[test]
    fn test_scan_with_filters_changes_hash() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source");
        fs::create_dir(&source).unwrap();
        fs::write(source.join("f"), "x").unwrap();

        let transmat = DirTransmat::new(&dir.path().join("work")).unwrap();
        let plain = transmat
            .scan(&kind(), &source, &[], &MaterializeOptions::new())
            .unwrap();
        let filtered = transmat
            .scan(
                &kind(),
                &source,
                &[],
                &MaterializeOptions::new()
                    .filter(Filter::Mtime(0))
                    .unwrap(),
            )
            .unwrap();
        assert_ne!(plain, filtered);
    }

    #[test]
    fn test_concurrent_materialize_of_distinct_commits() {
        use std::sync::Arc;

        let dir = tempdir().unwrap();
        let mut sources = Vec::new();
        for i in 0..4 {
            let source = dir.path().join(format!("source-{}", i));
            fs::create_dir(&source).unwrap();
            fs::write(source.join("f"), format!("payload {}", i)).unwrap();
            sources.push(source);
        }

        let transmat = Arc::new(DirTransmat::new(&dir.path().join("work")).unwrap());
        let opts = MaterializeOptions::new();
        let commits: Vec<CommitId> = sources
            .iter()
            .map(|s| transmat.scan(&kind(), s, &[], &opts).unwrap())
            .collect();

        let handles: Vec<_> = sources
            .iter()
            .zip(&commits)
            .map(|(source, commit)| {
                let transmat = Arc::clone(&transmat);
                let silo = file_uri(source);
                let commit = commit.clone();
                std::thread::spawn(move || {
                    transmat
                        .materialize(&kind(), &commit, &[silo], &MaterializeOptions::new())
                        .unwrap()
                })
            })
            .collect();

        for (handle, commit) in handles.into_iter().zip(&commits) {
            let mut arena = handle.join().unwrap();
            assert_eq!(arena.hash(), commit);
            arena.teardown().unwrap();
        }
    }

    #[test]
    fn test_wrong_kind_rejected() {
        let dir = tempdir().unwrap();
        let transmat = DirTransmat::new(&dir.path().join("work")).unwrap();
        let wrong = TransmatKind::new("tar").unwrap();
        let err = transmat
            .scan(&wrong, dir.path(), &[], &MaterializeOptions::new())
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
