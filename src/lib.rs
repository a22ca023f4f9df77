//! repeatr core - reproducible computation plumbing
//!
//! given a formula that names input filesystems (each identified by a
//! content hash and a set of retrieval URIs), this crate materializes the
//! requested trees on a host, assembles them into a single rootfs view,
//! and can scan any tree back into a hash-addressed snapshot that
//! republishes verbatim.
//!
//! # Core concepts
//!
//! - **Transmat**: a transport + materialization driver for one kind of
//!   data source (`dir`, `tar`, `git`)
//! - **CommitId**: base64url-encoded SHA-512/384 of a tree's canonical
//!   serialization; equality implies tree equality modulo filters
//! - **Arena**: a live materialized tree with a declared CommitId and a
//!   teardown
//! - **Assembler / Placer**: composes several arenas into one rootfs at
//!   declared mount points (bind mount, overlay, or plain copy) with
//!   guaranteed LIFO teardown
//! - **Warehouse / SiloUri**: where bytes for a CommitId live; silos are
//!   tried in order, first reachable wins
//!
//! # Example usage
//!
//! ```no_run
//! use std::path::Path;
//! use repeatr::{DirTransmat, MaterializeOptions, SiloUri, Transmat, TransmatKind};
//!
//! let transmat = DirTransmat::new(Path::new("/var/repeatr/dir")).unwrap();
//! let kind = TransmatKind::new("dir").unwrap();
//! let silo = SiloUri::parse("file+ca:///var/warehouse").unwrap();
//!
//! // hash a tree and publish it
//! let options = MaterializeOptions::new();
//! let commit = transmat
//!     .scan(&kind, Path::new("/srv/tree"), &[silo.clone()], &options)
//!     .unwrap();
//!
//! // later, reproduce it bit-for-bit somewhere else
//! let mut arena = transmat
//!     .materialize(&kind, &commit, &[silo], &options)
//!     .unwrap();
//! println!("materialized at {}", arena.path().display());
//! arena.teardown().unwrap();
//! ```

pub mod assemble;
mod cancel;
mod error;
mod filter;
pub mod fshash;
pub mod fspatch;
mod hash;
pub mod transmat;
pub mod types;
pub mod warehouse;

pub use assemble::{Assembler, Assembly, AssemblyPart, BindPlacer, CopyPlacer, OverlayPlacer, Placer};
pub use cancel::CancelToken;
pub use error::{Error, IoResultExt, Result, SiloAttempt};
pub use filter::{Filter, FilterSet};
pub use hash::{CommitId, PayloadHasher, TreeDigest, DIGEST_LEN};
pub use transmat::{
    Arena, DirTransmat, GitTransmat, MaterializeOptions, TarTransmat, Transmat, TransmatDispatch,
    TransmatKind, Workspace,
};
pub use types::{Action, Formula, FormulaInput, FormulaOutput, Metadata, MountGroup, NodeType};
pub use warehouse::{open_warehouse, FileWarehouse, Scheme, SiloUri, Warehouse};
