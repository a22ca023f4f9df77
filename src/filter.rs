use crate::error::{Error, Result};
use crate::types::Metadata;

/// a pure transform over one canonical metadata field
///
/// filters replace their target field with a constant, both before digesting
/// and before metadata write-back, so scanning and materializing agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    Uid(u32),
    Gid(u32),
    /// mtime in nanoseconds since the epoch
    Mtime(i64),
}

impl Filter {
    fn kind_name(&self) -> &'static str {
        match self {
            Filter::Uid(_) => "uid",
            Filter::Gid(_) => "gid",
            Filter::Mtime(_) => "mtime",
        }
    }
}

/// a composed set of filters, at most one per kind
///
/// composition is commutative because each filter touches a distinct field;
/// a second filter of the same kind is a configuration error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSet {
    uid: Option<u32>,
    gid: Option<u32>,
    mtime_ns: Option<i64>,
}

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// add a filter, rejecting duplicates of the same kind
    pub fn put(mut self, filter: Filter) -> Result<Self> {
        let slot_taken = match filter {
            Filter::Uid(u) => self.uid.replace(u).is_some(),
            Filter::Gid(g) => self.gid.replace(g).is_some(),
            Filter::Mtime(t) => self.mtime_ns.replace(t).is_some(),
        };
        if slot_taken {
            return Err(Error::Config(format!(
                "duplicate {} filter in filter set",
                filter.kind_name()
            )));
        }
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.uid.is_none() && self.gid.is_none() && self.mtime_ns.is_none()
    }

    /// rewrite a metadata record in place
    pub fn apply(&self, meta: &mut Metadata) {
        if let Some(uid) = self.uid {
            meta.uid = uid;
        }
        if let Some(gid) = self.gid {
            meta.gid = gid;
        }
        if let Some(mtime_ns) = self.mtime_ns {
            meta.mtime_ns = mtime_ns;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeType;

    fn sample_meta() -> Metadata {
        Metadata {
            path: "a/b".to_string(),
            node_type: NodeType::Regular,
            mode: 0o644,
            uid: 500,
            gid: 500,
            mtime_ns: 1_000_000_007,
            link_target: String::new(),
        }
    }

    #[test]
    fn test_empty_set_is_identity() {
        let mut meta = sample_meta();
        let before = meta.clone();
        FilterSet::new().apply(&mut meta);
        assert_eq!(meta, before);
    }

    #[test]
    fn test_filters_replace_fields() {
        let set = FilterSet::new()
            .put(Filter::Uid(10000))
            .unwrap()
            .put(Filter::Gid(10000))
            .unwrap()
            .put(Filter::Mtime(0))
            .unwrap();

        let mut meta = sample_meta();
        set.apply(&mut meta);
        assert_eq!(meta.uid, 10000);
        assert_eq!(meta.gid, 10000);
        assert_eq!(meta.mtime_ns, 0);
        // untouched fields survive
        assert_eq!(meta.mode, 0o644);
        assert_eq!(meta.path, "a/b");
    }

    #[test]
    fn test_duplicate_kind_rejected() {
        let result = FilterSet::new()
            .put(Filter::Uid(1))
            .unwrap()
            .put(Filter::Uid(2));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_composition_is_commutative() {
        let a = FilterSet::new()
            .put(Filter::Uid(7))
            .unwrap()
            .put(Filter::Mtime(42))
            .unwrap();
        let b = FilterSet::new()
            .put(Filter::Mtime(42))
            .unwrap()
            .put(Filter::Uid(7))
            .unwrap();

        let mut meta_a = sample_meta();
        let mut meta_b = sample_meta();
        a.apply(&mut meta_a);
        b.apply(&mut meta_b);
        assert_eq!(meta_a, meta_b);
    }
}
