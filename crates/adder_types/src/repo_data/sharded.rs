//! Repodata "shards": per-package-name subsets of the index, stored under a
//! content-addressed filename, plus the manifest that maps package names to
//! shard hashes.

use std::collections::{BTreeMap, BTreeSet};

use crate::repo_data::Buckets;

/// An individual shard holding every record for a single package name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Shard {
    /// The `.tbz` records, keyed by filename.
    pub packages: Buckets,

    /// The `.cnd` records, keyed by filename.
    pub cnd_packages: Buckets,
}

impl Shard {
    /// True when the shard carries no records.
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty() && self.cnd_packages.is_empty()
    }
}

/// The shard manifest for one subdirectory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShardedRepodata {
    pub info: ShardedSubdirInfo,

    /// Filenames struck by patch instructions, across all shards.
    pub removed: BTreeSet<String>,

    /// The version of the document format.
    pub version: u64,

    /// SHA-256 of each shard's serialized body, keyed by package name. The
    /// shard body lives in a sibling file named by the hex of the hash.
    pub shards: BTreeMap<String, [u8; 32]>,
}

/// The `info` block of a shard manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardedSubdirInfo {
    /// The subdirectory name.
    pub subdir: String,

    /// Base url of the subdirectory's packages, when published.
    pub base_url: Option<String>,

    /// Base url of the shard files, relative to the manifest by default.
    pub shards_base_url: String,
}
