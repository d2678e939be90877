//! The `repodata` document family: the per-package record and the per-subdir
//! index document assembled from the cache.

pub mod patches;
pub mod sharded;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::{serde_as, skip_serializing_none, OneOrMany};

/// A free-form package record as it flows through the aggregation pipeline.
///
/// `serde_json`'s map type keeps keys sorted, which gives every emitted
/// document the deterministic key order the published files promise.
pub type RecordMap = Map<String, Value>;

/// A filename-keyed bucket of records for one archive dialect.
pub type Buckets = BTreeMap<String, RecordMap>;

/// An index of the package binaries available in one subdirectory of a
/// channel.
///
/// Field declaration order matches the sorted key order of the serialized
/// document; keep it alphabetical by serialized name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepoData {
    /// Information about the subdirectory the document describes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<ChannelInfo>,

    /// The legacy `.tbz` packages, keyed by filename.
    #[serde(rename = "pkgs", default)]
    pub packages: Buckets,

    /// The `.cnd` packages, keyed by filename.
    #[serde(rename = "pkgs_c", default)]
    pub cnd_packages: Buckets,

    /// Filenames struck from the index by patch instructions. The files may
    /// still be physically present.
    #[serde(default)]
    pub removed: BTreeSet<String>,

    /// The version of the document format: 2 when a `base_url` is carried,
    /// 1 otherwise.
    #[serde(rename = "repodata_version")]
    pub version: u64,
}

impl RepoData {
    /// Parse a `repodata.json` document from a file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Iterate `(filename, record)` over both dialect buckets.
    pub fn iter_records(&self) -> impl Iterator<Item = (&String, &RecordMap)> {
        self.packages.iter().chain(self.cnd_packages.iter())
    }
}

/// The `info` block of a [`RepoData`] document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Base url for the packages of this subdirectory, when the channel is
    /// published under a stable address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// The subdirectory name.
    pub subdir: String,
}

/// The canonical per-package metadata extracted from a package's interior
/// `info/index` member, with whole-archive digests merged in.
///
/// Known fields are typed; everything else rides along in `extra` for
/// forward compatibility. The constructor drops the fields that must never
/// reach an emitted record.
#[serde_as]
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PackageRecord {
    /// The build string of the package.
    pub build: String,

    /// The build number, also included in the build string.
    pub build_number: u64,

    /// Constraints on packages that are not dependencies but must obey a
    /// version requirement when installed alongside this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constrains: Vec<String>,

    /// Specs of the packages this package depends on.
    #[serde(default)]
    pub depends: Vec<String>,

    /// Unrecognized record fields, preserved verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,

    /// Deprecated feature set marker.
    pub features: Option<String>,

    pub license: Option<String>,

    pub license_family: Option<String>,

    /// MD5 of the exact archive bytes the record was extracted from.
    pub md5: String,

    /// The lowercase package name.
    pub name: String,

    /// Architecture-independence marker; a string kind in current packages,
    /// a bare boolean in very old ones.
    pub noarch: Option<Value>,

    /// SHA-256 of the exact archive bytes the record was extracted from.
    pub sha256: String,

    /// Size in bytes of the archive.
    pub size: u64,

    /// The subdirectory the package belongs to.
    pub subdir: Option<String>,

    /// Creation time; seconds or milliseconds since the epoch, preserved
    /// as found.
    pub timestamp: Option<u64>,

    /// Tracked feature names, used to downweight packages.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[serde_as(as = "OneOrMany<_>")]
    pub track_features: Vec<String>,

    /// The package version string.
    pub version: String,
}

impl PackageRecord {
    /// Record fields that are dropped during normalization and must never
    /// appear in an emitted document.
    pub const FILTERED_FIELDS: [&'static str; 10] = [
        "arch",
        "has_prefix",
        "mtime",
        "platform",
        "ucs",
        "requires_features",
        "binstar",
        "target-triplet",
        "machine",
        "operatingsystem",
    ];

    /// Build a normalized record from a parsed `info/index` map and the
    /// digests of the archive it was read from.
    pub fn from_index_map(
        mut index: Map<String, Value>,
        size: u64,
        md5: String,
        sha256: String,
    ) -> Result<PackageRecord, serde_json::Error> {
        for field in Self::FILTERED_FIELDS {
            index.remove(field);
        }
        index.insert("md5".to_string(), Value::String(md5));
        index.insert("sha256".to_string(), Value::String(sha256));
        index.insert("size".to_string(), Value::from(size));
        serde_json::from_value(Value::Object(index))
    }

    /// The record as a sorted free-form map, the shape it is cached and
    /// emitted in.
    pub fn into_map(self) -> Result<RecordMap, serde_json::Error> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => unreachable!("a struct serializes to a map"),
        }
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    fn index_map() -> Map<String, Value> {
        let Value::Object(map) = json!({
            "name": "pkg-a",
            "version": "1.0",
            "build": "py27h5e241af_0",
            "build_number": 0,
            "depends": ["python >=2.7,<2.8.0a0"],
            "license": "BSD",
            "subdir": "osx-64",
            "timestamp": 1508520039632u64,
            "arch": "x86_64",
            "platform": "darwin",
            "has_prefix": true,
            "app_entry": "pkg-a --launch",
        }) else {
            unreachable!()
        };
        map
    }

    #[test]
    fn constructor_filters_and_merges_digests() {
        let record = PackageRecord::from_index_map(
            index_map(),
            8733,
            "37861df8111170f5eed4bff27868df59".to_string(),
            "459f3e9b2178fa33bdc4e6267326405329d1c1ab982273d9a1c0a5084a1ddc30".to_string(),
        )
        .unwrap();

        assert_eq!(record.name, "pkg-a");
        assert_eq!(record.size, 8733);
        assert_eq!(record.depends, vec!["python >=2.7,<2.8.0a0"]);
        // unknown fields survive, filtered fields do not
        assert_eq!(record.extra["app_entry"], json!("pkg-a --launch"));

        let map = record.into_map().unwrap();
        for field in PackageRecord::FILTERED_FIELDS {
            assert!(!map.contains_key(field), "{field} leaked into the record");
        }
    }

    #[test]
    fn record_map_serializes_with_sorted_keys() {
        let record = PackageRecord::from_index_map(
            index_map(),
            8733,
            "00".to_string(),
            "11".to_string(),
        )
        .unwrap();
        let map = record.into_map().unwrap();
        let keys: Vec<&String> = map.keys().collect();
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        // extra fields interleave with the declared ones in sorted order
        assert_eq!(keys, sorted);
        assert!(keys.contains(&&"app_entry".to_string()));
    }

    #[test]
    fn repodata_document_round_trips_byte_identical() {
        let mut repodata = RepoData {
            info: Some(ChannelInfo {
                base_url: None,
                subdir: "linux-64".to_string(),
            }),
            packages: Buckets::new(),
            cnd_packages: Buckets::new(),
            removed: BTreeSet::new(),
            version: 1,
        };
        let record = PackageRecord::from_index_map(index_map(), 1, "aa".into(), "bb".into())
            .unwrap()
            .into_map()
            .unwrap();
        repodata
            .packages
            .insert("pkg-a-1.0-py27h5e241af_0.tbz".to_string(), record);

        let first = serde_json::to_string_pretty(&repodata).unwrap();
        let reparsed: Value = serde_json::from_str(&first).unwrap();
        let second = serde_json::to_string_pretty(&reparsed).unwrap();
        assert_eq!(first, second);
    }
}
