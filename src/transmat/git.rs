use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use nix::fcntl::{Flock, FlockArg};
use sha2::{Digest, Sha384};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::{Error, IoResultExt, Result, SiloAttempt};
use crate::fspatch;
use crate::hash::CommitId;
use crate::transmat::{must_be_kind, Arena, MaterializeOptions, Transmat, TransmatKind};
use crate::types::{Metadata, NodeType};
use crate::warehouse::{Scheme, SiloUri};

pub const KIND: &str = "git";

/// git conveys no ownership; materialized trees are normalized to this
const GIT_UID: u32 = 1000;
const GIT_GID: u32 = 1000;

const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// transmat for git commits and trees, identified by hex object id
///
/// this driver keeps its own caches: bare object stores per origin under
/// `gits/`, finalized checkouts under `full/`, and submodule checkouts
/// under `nosub/`. arenas returned from it are cache references, so their
/// teardown is a no-op and repeated materializations of the same commit
/// short-circuit on the finalized checkout.
pub struct GitTransmat {
    kind: TransmatKind,
    full_root: PathBuf,
    nosub_root: PathBuf,
    gits_root: PathBuf,
}

impl GitTransmat {
    pub fn new(work_path: &Path) -> Result<Self> {
        // git subprocesses run with their own cwd; every cache path must
        // stay valid from anywhere
        fs::create_dir_all(work_path).with_path(work_path)?;
        let work_path = fs::canonicalize(work_path).with_path(work_path)?;

        let full_root = work_path.join("full");
        let nosub_root = work_path.join("nosub");
        let gits_root = work_path.join("gits");
        for dir in [&full_root, &nosub_root, &gits_root] {
            fs::create_dir_all(dir).with_path(dir)?;
        }
        Ok(Self {
            kind: TransmatKind::new(KIND)?,
            full_root,
            nosub_root,
            gits_root,
        })
    }

    /// bare cache repo for one origin url
    fn git_dir(&self, url: &str) -> PathBuf {
        let digest = hex::encode(Sha384::digest(url.as_bytes()));
        self.gits_root.join(&digest[..32])
    }

    fn full_final(&self, commit: &CommitId) -> PathBuf {
        self.full_root.join(commit.as_str())
    }

    fn nosub_final(&self, commit: &str) -> PathBuf {
        self.nosub_root.join(commit)
    }

    /// fetch `commit` into the bare cache for `url` unless already present;
    /// access to one cache repo is serialized by a file lock
    fn ensure_objects(&self, url: &str, commit: &str, cancel: &CancelToken) -> Result<PathBuf> {
        let git_dir = self.git_dir(url);
        let lock_path = git_dir.with_extension("lock");
        let lock_file = File::create(&lock_path).with_path(&lock_path)?;
        let _lock = Flock::lock(lock_file, FlockArg::LockExclusive)
            .map_err(|(_, e)| Error::Internal(format!("git cache lock: {}", e)))?;

        if !git_dir.join("HEAD").exists() {
            let git_dir_str = git_dir.to_string_lossy();
            git_local(
                None,
                &["init", "--quiet", "--bare", git_dir_str.as_ref()],
                cancel,
            )?;
        }
        if has_object(&git_dir, commit, cancel) {
            return Ok(git_dir);
        }

        let started = Instant::now();
        git_remote(
            Some(&git_dir),
            &[
                "fetch",
                "--quiet",
                "--prune",
                url,
                "+refs/heads/*:refs/heads/*",
                "+refs/tags/*:refs/tags/*",
            ],
            None,
            cancel,
        )
        .map_err(|e| Error::WarehouseUnavailable {
            during: "fetch",
            tried: vec![SiloAttempt {
                uri: url.to_string(),
                reason: e.to_string(),
            }],
        })?;
        info!(
            url,
            elapsed = started.elapsed().as_secs_f64(),
            "git: fetch complete"
        );

        if !has_object(&git_dir, commit, cancel) {
            return Err(Error::WarehouseUnavailable {
                during: "fetch",
                tried: vec![SiloAttempt {
                    uri: url.to_string(),
                    reason: format!("remote does not contain object {}", commit),
                }],
            });
        }
        Ok(git_dir)
    }

    /// checkout a commit from a bare cache into `work_tree`
    fn checkout(&self, git_dir: &Path, commit: &str, work_tree: &Path, cancel: &CancelToken) -> Result<()> {
        fs::create_dir_all(work_tree).with_path(work_tree)?;
        let index = work_tree
            .parent()
            .unwrap_or(work_tree)
            .join("git-index");

        let mut cmd = Command::new("git");
        cmd.env("GIT_DIR", git_dir)
            .env("GIT_WORK_TREE", work_tree)
            .env("GIT_INDEX_FILE", &index)
            .current_dir(work_tree)
            .args(["checkout", "--quiet", "-f", commit, "--", "."]);
        run_cancellable(cmd, None, cancel)
            .map_err(|e| Error::DataCorruption(format!("git checkout of {}: {}", commit, e)))?;
        let _ = fs::remove_file(&index);
        Ok(())
    }

    /// materialize every submodule recorded at `commit` and copy it into
    /// place inside the outer work tree
    fn place_submodules(
        &self,
        git_dir: &Path,
        commit: &str,
        work_tree: &Path,
        cancel: &CancelToken,
    ) -> Result<()> {
        let submodules = list_gitlinks(git_dir, commit, cancel)?;
        if submodules.is_empty() {
            return Ok(());
        }
        info!(count = submodules.len(), "git: submodules found");
        let urls = gitmodules_urls(git_dir, commit, cancel)?;

        for (sub_path, sub_commit) in &submodules {
            cancel.check()?;
            let final_path = self.nosub_final(sub_commit);
            if !final_path.exists() {
                let url = match urls.get(sub_path) {
                    Some(url) => url,
                    None => {
                        warn!(path = %sub_path, "git: gitlink with no .gitmodules entry, skipping");
                        continue;
                    }
                };
                let sub_git_dir = self.ensure_objects(url, sub_commit, cancel)?;
                let staging = tempfile::TempDir::new_in(&self.nosub_root)
                    .with_path(&self.nosub_root)?;
                let tree = staging.path().join("tree");
                self.checkout(&sub_git_dir, sub_commit, &tree, cancel)?;
                move_or_shrug(&tree, &final_path)?;
                debug!(commit = %sub_commit, "git: submodule checkout cached");
            }
            copy_tree(&final_path, &work_tree.join(sub_path), cancel)?;
        }
        info!("git: full work tree assembled");
        Ok(())
    }
}

impl Transmat for GitTransmat {
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

        let hash = commit.as_str();
        if hash.len() < 4 || hash.len() > 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::Config(format!(
                "git commit id {:?} is not a hex object id",
                hash
            )));
        }

        // short-circuit on the finalized checkout from a prior run
        let final_path = self.full_final(commit);
        if final_path.exists() {
            debug!(hash, "git: checkout cache hit");
            return Ok(Arena::cached(final_path, commit.clone()));
        }

        if silos.is_empty() {
            return Err(Error::WarehouseUnavailable {
                during: "fetch",
                tried: vec![],
            });
        }

        // take the first silo that answers a lightweight ping
        let mut tried = Vec::new();
        let mut chosen = None;
        for uri in silos {
            options.cancel.check()?;
            let url = match git_url(uri) {
                Ok(url) => url,
                Err(e) => {
                    tried.push(SiloAttempt {
                        uri: uri.as_str().to_string(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            match git_remote(None, &["ls-remote", "--heads", &url], Some(PROBE_TIMEOUT), &options.cancel) {
                Ok(()) => {
                    info!(remote = %uri, "git: connected to remote warehouse");
                    chosen = Some(url);
                    break;
                }
                Err(e) => {
                    info!(remote = %uri, reason = %e, "warehouse unavailable, skipping");
                    tried.push(SiloAttempt {
                        uri: uri.as_str().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        let url = chosen.ok_or(Error::WarehouseUnavailable {
            during: "fetch",
            tried,
        })?;

        options.report_progress(0.0);
        let git_dir = self.ensure_objects(&url, hash, &options.cancel)?;

        // checkout into a temp path next to the final one; the rename below
        // is the commit point
        let staging = tempfile::TempDir::new_in(&self.full_root).with_path(&self.full_root)?;
        let work_tree = staging.path().join("tree");
        let started = Instant::now();
        self.checkout(&git_dir, hash, &work_tree, &options.cancel)?;
        info!(
            elapsed = started.elapsed().as_secs_f64(),
            "git: checkout main repo complete"
        );

        self.place_submodules(&git_dir, hash, &work_tree, &options.cancel)?;

        // git does not convey ownership; pin the whole tree to a fixed id
        normalize_ownership(&work_tree, &options.cancel)?;

        let final_path = self.full_final(commit);
        move_or_shrug(&work_tree, &final_path)?;
        options.report_progress(1.0);
        info!(hash, "git: repo materialize complete");
        Ok(Arena::cached(final_path, commit.clone()))
    }

    fn scan(
        &self,
        _kind: &TransmatKind,
        _subject: &Path,
        _silos: &[SiloUri],
        _options: &MaterializeOptions,
    ) -> Result<CommitId> {
        // a tree digest could be computed, but a git *commit* embeds parent
        // pointers this model has no way to synthesize
        Err(Error::Config(
            "saving with the git transmat is not supported".to_string(),
        ))
    }
}

/// map a silo uri onto a url the git binary understands
fn git_url(uri: &SiloUri) -> Result<String> {
    match uri.scheme() {
        Scheme::GitSsh => Ok(format!("ssh://{}", uri.location())),
        Scheme::GitHttps => Ok(format!("https://{}", uri.location())),
        // plain paths are valid git remotes; handy for local mirrors
        Scheme::File => Ok(uri.location().to_string()),
        other => Err(Error::Config(format!(
            "git transmat does not speak scheme {:?}",
            other.as_str()
        ))),
    }
}

/// run a fast, repo-local git command, capturing stdout
fn git_local(git_dir: Option<&Path>, args: &[&str], cancel: &CancelToken) -> Result<String> {
    cancel.check()?;
    let mut cmd = Command::new("git");
    if let Some(dir) = git_dir {
        cmd.env("GIT_DIR", dir);
    }
    cmd.args(args);
    let output = cmd
        .output()
        .map_err(|source| Error::Io {
            path: PathBuf::from("git"),
            source,
        })?;
    if !output.status.success() {
        return Err(Error::Internal(format!(
            "git {:?} failed: {}",
            args.first().unwrap_or(&""),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// run a git command that talks to a remote, with cooperative cancellation
/// and an optional deadline
fn git_remote(
    git_dir: Option<&Path>,
    args: &[&str],
    timeout: Option<Duration>,
    cancel: &CancelToken,
) -> Result<()> {
    let mut cmd = Command::new("git");
    if let Some(dir) = git_dir {
        cmd.env("GIT_DIR", dir);
    }
    cmd.args(args);
    run_cancellable(cmd, timeout, cancel)
}

/// spawn, then poll for exit while honoring cancellation and the deadline
fn run_cancellable(mut cmd: Command, timeout: Option<Duration>, cancel: &CancelToken) -> Result<()> {
    cancel.check()?;
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn().map_err(|source| Error::Io {
        path: PathBuf::from("git"),
        source,
    })?;

    let started = Instant::now();
    let status = loop {
        match child.try_wait().map_err(|source| Error::Io {
            path: PathBuf::from("git"),
            source,
        })? {
            Some(status) => break status,
            None => {
                if cancel.is_cancelled() {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(Error::Cancelled);
                }
                if let Some(limit) = timeout {
                    if started.elapsed() > limit {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(Error::Internal(format!(
                            "git timed out after {:.0?}",
                            limit
                        )));
                    }
                }
                std::thread::sleep(Duration::from_millis(25));
            }
        }
    };

    if status.success() {
        return Ok(());
    }
    let mut stderr = String::new();
    if let Some(mut pipe) = child.stderr.take() {
        use std::io::Read;
        let _ = pipe.read_to_string(&mut stderr);
    }
    Err(Error::Internal(format!(
        "git exited with {}: {}",
        status,
        stderr.trim()
    )))
}

fn has_object(git_dir: &Path, object: &str, cancel: &CancelToken) -> bool {
    git_local(Some(git_dir), &["cat-file", "-e", object], cancel).is_ok()
}

/// enumerate gitlink entries (mode 160000) of a commit: (path, commit)
fn list_gitlinks(git_dir: &Path, commit: &str, cancel: &CancelToken) -> Result<Vec<(String, String)>> {
    let listing = git_local(Some(git_dir), &["ls-tree", "-r", "-z", commit], cancel)?;
    let mut gitlinks = Vec::new();
    for record in listing.split('\0') {
        if record.is_empty() {
            continue;
        }
        let (attrs, path) = match record.split_once('\t') {
            Some(parts) => parts,
            None => continue,
        };
        let mut fields = attrs.split(' ');
        let mode = fields.next().unwrap_or("");
        let _obj_type = fields.next();
        let hash = fields.next().unwrap_or("");
        if mode == "160000" {
            gitlinks.push((path.to_string(), hash.to_string()));
        }
    }
    Ok(gitlinks)
}

/// read the .gitmodules of a commit and map submodule path -> url
fn gitmodules_urls(git_dir: &Path, commit: &str, cancel: &CancelToken) -> Result<HashMap<String, String>> {
    let content = match git_local(
        Some(git_dir),
        &["show", &format!("{}:.gitmodules", commit)],
        cancel,
    ) {
        Ok(content) => content,
        // no .gitmodules at all; gitlinks will be skipped with a warning
        Err(_) => return Ok(HashMap::new()),
    };
    Ok(parse_gitmodules(&content))
}

fn parse_gitmodules(content: &str) -> HashMap<String, String> {
    let mut urls = HashMap::new();
    let mut path: Option<String> = None;
    let mut url: Option<String> = None;
    let mut flush = |path: &mut Option<String>, url: &mut Option<String>, urls: &mut HashMap<String, String>| {
        if let (Some(p), Some(u)) = (path.take(), url.take()) {
            urls.insert(p, u);
        }
    };
    for line in content.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            flush(&mut path, &mut url, &mut urls);
        } else if let Some((key, value)) = line.split_once('=') {
            match key.trim() {
                "path" => path = Some(value.trim().to_string()),
                "url" => url = Some(value.trim().to_string()),
                _ => {}
            }
        }
    }
    flush(&mut path, &mut url, &mut urls);
    urls
}

/// rename into the final cache slot; losing the race to an equivalent tree
/// already in place is fine
fn move_or_shrug(from: &Path, to: &Path) -> Result<()> {
    if to.exists() {
        return Ok(());
    }
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) if to.exists() => Ok(()),
        Err(source) => Err(Error::Io {
            path: to.to_path_buf(),
            source,
        }),
    }
}

/// chown everything to the fixed git identity; without privilege this is
/// skipped with a warning (the ids then stay as-checked-out)
fn normalize_ownership(tree: &Path, cancel: &CancelToken) -> Result<()> {
    match fspatch::lchown(tree, GIT_UID, GIT_GID) {
        Err(Error::Io { source, .. })
            if source.raw_os_error() == Some(nix::libc::EPERM) =>
        {
            warn!("git: no privilege to normalize ownership, leaving as-is");
            return Ok(());
        }
        Err(e) => return Err(e),
        Ok(()) => {}
    }
    for entry in walkdir::WalkDir::new(tree).min_depth(1) {
        cancel.check()?;
        let entry = entry.map_err(|e| Error::Io {
            path: tree.to_path_buf(),
            source: e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "walk error")),
        })?;
        fspatch::lchown(entry.path(), GIT_UID, GIT_GID)?;
    }
    Ok(())
}

/// plain recursive copy preserving mode, mtime, and symlink targets;
/// used to graft cached submodule checkouts into the outer work tree
fn copy_tree(src: &Path, dest: &Path, cancel: &CancelToken) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::create_dir_all(dest).with_path(dest)?;
    let mut entries: Vec<_> = fs::read_dir(src)
        .with_path(src)?
        .collect::<std::io::Result<Vec<_>>>()
        .with_path(src)?;
    entries.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

    for entry in entries {
        cancel.check()?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        let meta = Metadata::from_lstat(&from, "")?;
        match meta.node_type {
            NodeType::Dir => {
                copy_tree(&from, &to, cancel)?;
                fs::set_permissions(&to, fs::Permissions::from_mode(meta.mode)).with_path(&to)?;
                fspatch::utimens(&to, meta.mtime_ns)?;
            }
            NodeType::Regular => {
                fs::copy(&from, &to).with_path(&to)?;
                fspatch::utimens(&to, meta.mtime_ns)?;
            }
            NodeType::Symlink => {
                std::os::unix::fs::symlink(&meta.link_target, &to).with_path(&to)?;
                fspatch::lutimens(&to, meta.mtime_ns)?;
            }
        }
    }
    Ok(())
}
