use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha384};

/// byte length of a SHA-512/384 digest
pub const DIGEST_LEN: usize = 48;

/// an opaque, printable hash identifying the canonical content of a tree
///
/// for the dir and tar transmats this is the base64url rendering of the
/// canonical tree digest; for git it is a hex object id. equality implies
/// tree equality modulo the active filter set.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommitId(String);

impl CommitId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// render a raw tree digest as a commit id
    pub fn from_digest(digest: &[u8; DIGEST_LEN]) -> Self {
        Self(URL_SAFE_NO_PAD.encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// split into path components for content-addressable stores
    /// returns (first 2 chars, full id)
    pub fn to_path_components(&self) -> (&str, &str) {
        let split = self.0.char_indices().nth(2).map(|(i, _)| i).unwrap_or(0);
        (&self.0[..split], &self.0)
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommitId({})", self.0)
    }
}

impl From<&str> for CommitId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Serialize for CommitId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for CommitId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(Self(String::deserialize(deserializer)?))
    }
}

/// streaming hasher for the canonical tree serialization
///
/// fed one length-prefixed record per node in walk order; the finalized
/// digest is the tree's CommitId.
pub struct TreeDigest {
    hasher: Sha384,
}

impl TreeDigest {
    pub fn new() -> Self {
        Self {
            hasher: Sha384::new(),
        }
    }

    /// feed one canonical record, length-prefixed
    pub fn record(&mut self, record: &[u8]) {
        self.hasher.update((record.len() as u64).to_le_bytes());
        self.hasher.update(record);
    }

    pub fn finalize(self) -> CommitId {
        let digest: [u8; DIGEST_LEN] = self.hasher.finalize().into();
        CommitId::from_digest(&digest)
    }
}

impl Default for TreeDigest {
    fn default() -> Self {
        Self::new()
    }
}

/// streaming hasher for regular-file payloads
pub struct PayloadHasher {
    hasher: Sha384,
}

impl PayloadHasher {
    pub fn new() -> Self {
        Self {
            hasher: Sha384::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(self) -> [u8; DIGEST_LEN] {
        self.hasher.finalize().into()
    }
}

impl Default for PayloadHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_id_from_digest_is_base64url() {
        let id = CommitId::from_digest(&[0u8; DIGEST_LEN]);
        // 48 bytes encode to exactly 64 chars, no padding
        assert_eq!(id.as_str().len(), 64);
        assert!(!id.as_str().contains('='));
        assert!(!id.as_str().contains('/'));
        assert!(!id.as_str().contains('+'));
    }

    #[test]
    fn test_commit_id_path_components() {
        let id = CommitId::new("abcdef");
        let (prefix, full) = id.to_path_components();
        assert_eq!(prefix, "ab");
        assert_eq!(full, "abcdef");
    }

    #[test]
    fn test_tree_digest_determinism() {
        let mut a = TreeDigest::new();
        a.record(b"one");
        a.record(b"two");
        let mut b = TreeDigest::new();
        b.record(b"one");
        b.record(b"two");
        assert_eq!(a.finalize(), b.finalize());
    }

    #[test]
    fn test_tree_digest_length_prefix_disambiguates() {
        // "ab" + "c" must not collide with "a" + "bc"
        let mut a = TreeDigest::new();
        a.record(b"ab");
        a.record(b"c");
        let mut b = TreeDigest::new();
        b.record(b"a");
        b.record(b"bc");
        assert_ne!(a.finalize(), b.finalize());
    }

    #[test]
    fn test_payload_hasher_streaming_matches_oneshot() {
        let mut streaming = PayloadHasher::new();
        streaming.update(b"hello");
        streaming.update(b"world");

        let mut oneshot = PayloadHasher::new();
        oneshot.update(b"helloworld");

        assert_eq!(streaming.finalize(), oneshot.finalize());
    }

    #[test]
    fn test_commit_id_serde_json() {
        let id = CommitId::new("nIf-ikfYp83OWWc_y2D");
        let json = serde_json::to_string(&id).unwrap();
        assert!(json.contains("nIf-ik"));
        let parsed: CommitId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }
}
