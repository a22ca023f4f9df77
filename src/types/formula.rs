use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha384};

use crate::error::{Error, Result};
use crate::filter::{Filter, FilterSet};
use crate::hash::{CommitId, DIGEST_LEN};

/// the declarative input for one reproducible run: inputs to materialize,
/// an action to hand to an executor, outputs to scan afterwards
///
/// fields (here and in the nested records) are declared in ascending name
/// order so the canonical CBOR encoding writes map keys ascending; that
/// canonicalization is what makes hashing a formula meaningful.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Formula {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<FormulaInput>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<FormulaOutput>,
}

impl Formula {
    /// canonical CBOR encoding: ascending map keys, sorted mount groups,
    /// sorted environments
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| Error::Internal(format!("formula encoding: {}", e)))?;
        Ok(buf)
    }

    /// digest of the canonical encoding, rendered like a tree commit id
    pub fn commit_id(&self) -> Result<CommitId> {
        let digest: [u8; DIGEST_LEN] = Sha384::digest(self.canonical_bytes()?).into();
        Ok(CommitId::from_digest(&digest))
    }
}

/// one input: where to fetch a tree, what it must hash to, where it lands
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormulaInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<FilterConfig>,
    pub hash: CommitId,
    /// transmat kind label
    pub kind: String,
    /// mount point inside the job filesystem
    pub location: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub silos: Vec<String>,
}

/// one output: what to scan after the run and where to publish it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormulaOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<FilterConfig>,
    pub kind: String,
    pub location: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub silos: Vec<String>,
}

/// what to run; carried to the executor, never interpreted here
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cwd: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(default, skip_serializing_if = "MountGroup::is_empty")]
    pub mounts: MountGroup,
}

/// a host mount handed through to the executor
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source_path: String,
    pub target_path: String,
}

/// a set of mounts whose canonical form is an array sorted by target path
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MountGroup(pub Vec<Mount>);

impl MountGroup {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for MountGroup {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut sorted = self.0.clone();
        sorted.sort_by(|a, b| a.target_path.cmp(&b.target_path));
        sorted.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MountGroup {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(Self(Vec::<Mount>::deserialize(deserializer)?))
    }
}

/// declarative filter configuration as it appears in formulae
///
/// an absent field keeps the scanned value; a present one replaces it with
/// the constant.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime_ns: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
}

impl FilterConfig {
    pub fn to_filter_set(&self) -> Result<FilterSet> {
        let mut set = FilterSet::new();
        if let Some(uid) = self.uid {
            set = set.put(Filter::Uid(uid))?;
        }
        if let Some(gid) = self.gid {
            set = set.put(Filter::Gid(gid))?;
        }
        if let Some(mtime_ns) = self.mtime_ns {
            set = set.put(Filter::Mtime(mtime_ns))?;
        }
        Ok(set)
    }
}
