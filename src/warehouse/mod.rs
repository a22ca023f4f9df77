//! warehouses: addressable locations bytes for a CommitId can be fetched
//! from or stored to. dispatch is by URI scheme; silos are tried in listed
//! order, first reachable wins.

pub mod file;

use std::io::Read;

use crate::error::{Error, Result};
use crate::hash::CommitId;

pub use file::{ca_object_path, parent_or_cwd, tree_path, FileWarehouse, PutStream};

/// URI schemes the core recognizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// single blob or tree at a local path
    File,
    /// content-addressable local store: object at `ROOT/<h[:2]>/<h>`
    FileCa,
    /// read-only blob retrieval; driver lives outside the core
    Http,
    Https,
    /// read/write CA store on S3; driver lives outside the core
    S3,
    /// git remotes; consumed by the git transmat directly
    GitSsh,
    GitHttps,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::File => "file",
            Scheme::FileCa => "file+ca",
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::S3 => "s3",
            Scheme::GitSsh => "git+ssh",
            Scheme::GitHttps => "git+https",
        }
    }
}

/// a parsed silo URI: scheme plus location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiloUri {
    raw: String,
    scheme: Scheme,
    location: String,
}

impl SiloUri {
    pub fn parse(raw: &str) -> Result<Self> {
        let (scheme_str, location) = raw
            .split_once("://")
            .ok_or_else(|| Error::Config(format!("silo uri {:?} has no scheme", raw)))?;
        let scheme = match scheme_str {
            "file" => Scheme::File,
            "file+ca" => Scheme::FileCa,
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            "s3" => Scheme::S3,
            "git+ssh" => Scheme::GitSsh,
            "git+https" => Scheme::GitHttps,
            other => {
                return Err(Error::Config(format!(
                    "unrecognized silo uri scheme {:?}",
                    other
                )))
            }
        };
        Ok(Self {
            raw: raw.to_string(),
            scheme,
            location: location.to_string(),
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// everything after `scheme://`
    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl std::fmt::Display for SiloUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// one concrete backend behind a silo URI
///
/// `ping` must return within bounded time. a failure before a stream is
/// opened may be recovered by trying the next silo; a mid-stream failure
/// must not be (the destination may hold partial data).
pub trait Warehouse: Send + Sync {
    fn uri(&self) -> &SiloUri;

    /// cheap reachability check
    fn ping(&self) -> Result<()>;

    /// open a read stream for the object claimed by `commit`
    fn get_stream(&self, commit: &CommitId) -> Result<Box<dyn Read + Send>>;

    /// open a write stream for `commit`; data becomes visible only when the
    /// returned handle is committed
    fn put_stream(&self, commit: &CommitId) -> Result<PutStream>;
}

/// select the warehouse implementation for a URI scheme
///
/// http(s) and s3 are recognized schemes whose drivers live outside the
/// core; asking the core dispatch for one is a configuration error.
pub fn open_warehouse(uri: &SiloUri) -> Result<Box<dyn Warehouse>> {
    match uri.scheme() {
        Scheme::File | Scheme::FileCa => Ok(Box::new(FileWarehouse::new(uri.clone()))),
        Scheme::Http | Scheme::Https | Scheme::S3 => Err(Error::Config(format!(
            "no warehouse driver linked for scheme {:?}",
            uri.scheme().as_str()
        ))),
        Scheme::GitSsh | Scheme::GitHttps => Err(Error::Config(format!(
            "scheme {:?} is only usable with the git transmat",
            uri.scheme().as_str()
        ))),
    }
}
