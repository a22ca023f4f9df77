//! local-filesystem warehouses: `file://PATH` addresses a single object,
//! `file+ca://ROOT` a content-addressable layout at `ROOT/<h[:2]>/<h>`.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, IoResultExt, Result};
use crate::hash::CommitId;
use crate::warehouse::{Scheme, SiloUri, Warehouse};

/// object path inside a content-addressable root
pub fn ca_object_path(root: &Path, commit: &CommitId) -> PathBuf {
    let (prefix, full) = commit.to_path_components();
    root.join(prefix).join(full)
}

/// containing directory, treating a bare relative name as living in cwd
pub fn parent_or_cwd(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// resolve the on-disk location a file-scheme silo assigns to a commit
///
/// used both for streamed blobs (tar) and for whole trees (dir).
pub fn tree_path(uri: &SiloUri, commit: &CommitId) -> Result<PathBuf> {
    match uri.scheme() {
        Scheme::File => Ok(PathBuf::from(uri.location())),
        Scheme::FileCa => Ok(ca_object_path(Path::new(uri.location()), commit)),
        other => Err(Error::Config(format!(
            "scheme {:?} does not address the local filesystem",
            other.as_str()
        ))),
    }
}

/// a blob warehouse on the local filesystem
pub struct FileWarehouse {
    uri: SiloUri,
}

impl FileWarehouse {
    pub fn new(uri: SiloUri) -> Self {
        Self { uri }
    }

    fn blob_path(&self, commit: &CommitId) -> PathBuf {
        match self.uri.scheme() {
            Scheme::FileCa => ca_object_path(Path::new(self.uri.location()), commit),
            _ => PathBuf::from(self.uri.location()),
        }
    }

    /// the directory that must exist for writes to land
    fn write_root(&self) -> PathBuf {
        match self.uri.scheme() {
            Scheme::FileCa => PathBuf::from(self.uri.location()),
            _ => parent_or_cwd(Path::new(self.uri.location())),
        }
    }
}

impl Warehouse for FileWarehouse {
    fn uri(&self) -> &SiloUri {
        &self.uri
    }

    fn ping(&self) -> Result<()> {
        let root = self.write_root();
        if root.is_dir() {
            Ok(())
        } else {
            Err(Error::Io {
                path: root,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such directory"),
            })
        }
    }

    fn get_stream(&self, commit: &CommitId) -> Result<Box<dyn Read + Send>> {
        let path = self.blob_path(commit);
        let file = File::open(&path).with_path(&path)?;
        Ok(Box::new(file))
    }

    fn put_stream(&self, commit: &CommitId) -> Result<PutStream> {
        let final_path = self.blob_path(commit);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).with_path(parent)?;
        }
        PutStream::create(final_path)
    }
}

/// write handle that stages into a sibling temp file and publishes by
/// atomic rename on commit; dropping without committing removes the staging
/// file, so a mid-stream failure leaves nothing behind
pub struct PutStream {
    tmp_path: PathBuf,
    final_path: PathBuf,
    file: Option<File>,
}

impl PutStream {
    fn create(final_path: PathBuf) -> Result<Self> {
        let file_name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "blob".to_string());
        let tmp_path = final_path.with_file_name(format!(".{}.partial", file_name));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
            .with_path(&tmp_path)?;
        Ok(Self {
            tmp_path,
            final_path,
            file: Some(file),
        })
    }

    /// flush and atomically publish under the final name
    pub fn commit(mut self) -> Result<()> {
        let file = self
            .file
            .take()
            .ok_or_else(|| Error::Internal("put stream committed twice".to_string()))?;
        file.sync_all().with_path(&self.tmp_path)?;
        drop(file);
        fs::rename(&self.tmp_path, &self.final_path).with_path(&self.final_path)?;
        Ok(())
    }
}

impl Write for PutStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.file.as_mut() {
            Some(file) => file.write(buf),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "put stream already committed",
            )),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for PutStream {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn commit(s: &str) -> CommitId {
        CommitId::new(s)
    }

    #[test]
    fn test_tree_path_file_scheme_is_literal() {
        let uri = SiloUri::parse("file:///var/data/tree").unwrap();
        let path = tree_path(&uri, &commit("abcdef")).unwrap();
        assert_eq!(path, PathBuf::from("/var/data/tree"));
    }

    #[test]
    fn test_tree_path_ca_scheme_shards_by_prefix() {
        let uri = SiloUri::parse("file+ca:///var/store").unwrap();
        let path = tree_path(&uri, &commit("abcdef")).unwrap();
        assert_eq!(path, PathBuf::from("/var/store/ab/abcdef"));
    }

    #[test]
    fn test_ping_requires_directory() {
        let dir = tempdir().unwrap();
        let good = SiloUri::parse(&format!("file+ca://{}", dir.path().display())).unwrap();
        assert!(FileWarehouse::new(good).ping().is_ok());

        let bad = SiloUri::parse("file+ca:///nonexistent/store").unwrap();
        assert!(FileWarehouse::new(bad).ping().is_err());
    }

    #[test]
    fn test_put_then_get_round_trip() {
        let dir = tempdir().unwrap();
        let uri = SiloUri::parse(&format!("file+ca://{}", dir.path().display())).unwrap();
        let wh = FileWarehouse::new(uri);
        let id = commit("abcdef");

        let mut put = wh.put_stream(&id).unwrap();
        put.write_all(b"payload bytes").unwrap();
        put.commit().unwrap();

        let mut buf = Vec::new();
        wh.get_stream(&id).unwrap().read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"payload bytes");
        assert!(dir.path().join("ab/abcdef").is_file());
    }

    #[test]
    fn test_dropped_put_leaves_nothing() {
        let dir = tempdir().unwrap();
        let uri = SiloUri::parse(&format!("file+ca://{}", dir.path().display())).unwrap();
        let wh = FileWarehouse::new(uri);
        let id = commit("abcdef");

        {
            let mut put = wh.put_stream(&id).unwrap();
            put.write_all(b"half a payl").unwrap();
            // dropped uncommitted
        }

        assert!(!dir.path().join("ab/abcdef").exists());
        let leftovers: Vec<_> = fs::read_dir(dir.path().join("ab")).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_get_missing_object_is_probe_failure() {
        let dir = tempdir().unwrap();
        let uri = SiloUri::parse(&format!("file+ca://{}", dir.path().display())).unwrap();
        let wh = FileWarehouse::new(uri);
        assert!(wh.get_stream(&commit("abcdef")).is_err());
    }
}
