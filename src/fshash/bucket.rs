use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::hash::{CommitId, TreeDigest, DIGEST_LEN};
use crate::types::{Metadata, NodeType};

/// one canonical record: node metadata plus the payload hash for regular files
#[derive(Debug, Clone)]
pub struct Record {
    pub meta: Metadata,
    /// SHA-512/384 of file contents; None for non-regular nodes
    pub payload_hash: Option<[u8; DIGEST_LEN]>,
}

impl Record {
    /// serialize to the canonical byte form fed to the tree digest
    ///
    /// fixed-width fields are little-endian; variable-width fields carry a
    /// u32 length prefix. non-regular nodes hash an all-zero payload.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let meta = &self.meta;
        let mut buf = Vec::with_capacity(
            1 + 4 + meta.path.len() + 4 + 4 + 4 + 8 + 4 + meta.link_target.len() + DIGEST_LEN,
        );
        buf.push(meta.node_type.tag());
        buf.extend_from_slice(&(meta.path.len() as u32).to_le_bytes());
        buf.extend_from_slice(meta.path.as_bytes());
        buf.extend_from_slice(&(meta.mode & 0o7777).to_le_bytes());
        buf.extend_from_slice(&meta.uid.to_le_bytes());
        buf.extend_from_slice(&meta.gid.to_le_bytes());
        buf.extend_from_slice(&meta.mtime_ns.to_le_bytes());
        buf.extend_from_slice(&(meta.link_target.len() as u32).to_le_bytes());
        buf.extend_from_slice(meta.link_target.as_bytes());
        match &self.payload_hash {
            Some(hash) => buf.extend_from_slice(hash),
            None => buf.extend_from_slice(&[0u8; DIGEST_LEN]),
        }
        buf
    }
}

/// in-memory accumulator of canonical records for one walk
///
/// records arrive in walk order and are kept that way; the bucket only lives
/// long enough to produce a tree digest. duplicate paths indicate a walker
/// bug and are rejected.
#[derive(Debug, Default)]
pub struct MemoryBucket {
    records: Vec<Record>,
    seen: HashSet<String>,
}

impl MemoryBucket {
    pub fn new() -> Self {
        Self::default()
    }

    /// append one node in walk order
    pub fn record(&mut self, meta: Metadata, payload_hash: Option<[u8; DIGEST_LEN]>) -> Result<()> {
        if meta.node_type == NodeType::Regular && payload_hash.is_none() {
            return Err(Error::Internal(format!(
                "regular file {:?} recorded without payload hash",
                meta.path
            )));
        }
        if !self.seen.insert(meta.path.clone()) {
            return Err(Error::Internal(format!(
                "path {:?} recorded twice in one walk",
                meta.path
            )));
        }
        self.records.push(Record { meta, payload_hash });
        Ok(())
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// digest all records in walk order into a CommitId
    pub fn tree_digest(&self) -> CommitId {
        let mut digest = TreeDigest::new();
        for record in &self.records {
            digest.record(&record.canonical_bytes());
        }
        digest.finalize()
    }
}
