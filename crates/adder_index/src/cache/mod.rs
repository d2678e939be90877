//! The metadata cache: a keyed store mapping package filename to extracted
//! metadata blobs and stat fingerprints.
//!
//! Two stat stages coexist per scope: `observed` (what the filesystem
//! currently shows) and `indexed` (what the cache last processed). A package
//! is re-extracted when the two disagree on `(mtime, size)` or when no
//! `indexed` row exists.
//!
//! The extraction pipeline itself lives here as provided methods on the
//! store trait so alternative storage engines inherit it unchanged.

pub mod convert;
pub mod sqlite;

use std::collections::BTreeMap;
use std::io::{self, Read, Seek, SeekFrom};

use adder_digest::{compute_digests, DigestAlgorithm};
use adder_package_streaming::{stream_info, ReadSeek};
use adder_types::{Buckets, PackageRecord, RecordMap, Shard};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::fs::{FileInfo, MinimalFS};

pub use sqlite::SqliteCache;

/// Interior members pulled from every package archive. `info/post_install`
/// is computed from `info/paths`, never read.
pub const INDEX_PATH: &str = "info/index";
pub const ABOUT_PATH: &str = "info/about";
pub const PATHS_PATH: &str = "info/paths";
pub const RUN_EXPORTS_PATH: &str = "info/run_exports";
pub const ICON_PATH: &str = "info/icon";
/// Recipe locations, first found wins.
pub const RECIPE_PATHS: [&str; 3] = ["info/recipe/meta.y", "info/recipe/meta.y.r", "info/meta.y"];

/// The non-record metadata blobs extracted from one package.
///
/// JSON members are stored as canonical (minified, sorted-key) text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackageMembers {
    pub about: Option<String>,
    pub recipe: Option<String>,
    pub run_exports: Option<String>,
    pub post_install: String,
    pub icon: Option<Vec<u8>>,
}

/// An error raised by the cache store itself.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("malformed cached json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cache schema version {0} is newer than this build supports")]
    SchemaTooNew(i64),
}

/// An error raised while extracting one package. Every variant is recovered
/// by the coordinator: the package is logged and left unindexed.
#[derive(Debug, Error)]
pub enum PackageExtractError {
    #[error(transparent)]
    Archive(#[from] adder_package_streaming::ExtractError),

    #[error("package has no {INDEX_PATH} member")]
    MissingIndexMember,

    #[error("malformed json member: {0}")]
    MalformedJson(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Store(#[from] CacheError),
}

/// The store contract. One handle serves one `(channel, subdir)` scope;
/// handles are cheap, opened lazily, and never shared across workers.
pub trait IndexCache: Send {
    fn subdir(&self) -> &str;

    /// Base url (or local root) the subdir's packages are read from.
    fn channel_url(&self) -> &str;

    fn fs(&self) -> &dyn MinimalFS;

    /// The stat stage compared against `indexed` when planning work.
    fn upstream_stage(&self) -> &str;

    /// Key prefix for this scope. Empty in the default one-database-per-
    /// subdir store; `{channel}/{subdir}/` in shared multi-tenant stores.
    /// Must be safe for prefix scans.
    fn database_prefix(&self) -> String {
        String::new()
    }

    fn database_path(&self, filename: &str) -> String {
        format!("{}{}", self.database_prefix(), filename)
    }

    /// Strip the scope prefix off a stored key.
    fn plain_path<'a>(&self, path: &'a str) -> &'a str {
        path.rsplit('/').next().unwrap_or(path)
    }

    /// One-shot import of a legacy on-disk cache layout, if present.
    fn convert(&mut self) -> Result<(), CacheError>;

    /// Replace the `observed` rows for this scope with `entries`.
    fn store_fs_state(&mut self, entries: &[FileInfo]) -> Result<(), CacheError>;

    /// Packages whose upstream stat differs from the `indexed` stage.
    fn changed_packages(&mut self) -> Result<Vec<FileInfo>, CacheError>;

    /// Every package in the upstream stage, for deep integrity passes.
    fn observed_packages(&mut self) -> Result<Vec<FileInfo>, CacheError>;

    /// Persist one extracted package: the record, its metadata members and
    /// an `indexed` stat row, all-or-nothing.
    fn store(
        &mut self,
        info: &FileInfo,
        members: &PackageMembers,
        record: &RecordMap,
    ) -> Result<(), CacheError>;

    /// The merged per-package view used by the channel summary.
    fn load_all_from_cache(&mut self, filename: &str) -> Result<RecordMap, CacheError>;

    /// All indexed records visible in the upstream stage, bucketed by
    /// archive dialect and keyed by filename.
    fn indexed_packages(&mut self) -> Result<(Buckets, Buckets), CacheError>;

    /// Indexed records grouped into per-package-name shards, ordered by
    /// `(name, filename)`.
    fn indexed_shards(&mut self) -> Result<Vec<(String, Shard)>, CacheError>;

    /// `(filename, run_exports)` pairs for the optional exports document.
    fn run_exports(&mut self) -> Result<Vec<(String, Value)>, CacheError>;

    /// Open a package of this subdir through the filesystem adapter.
    fn open_package(&self, filename: &str) -> io::Result<Box<dyn ReadSeek>> {
        let url = self
            .fs()
            .join(&[self.channel_url(), self.subdir(), filename]);
        self.fs().open(&url)
    }

    /// Extract one package into the cache.
    ///
    /// Opens the archive once: interior members and whole-file digests come
    /// from the same open source. The member iterator is dropped as soon as
    /// everything wanted has been seen.
    fn extract_to_cache(&mut self, info: &FileInfo) -> Result<RecordMap, PackageExtractError> {
        let mut source = self.open_package(&info.path)?;

        let mut wanted: Vec<&str> = vec![
            INDEX_PATH,
            ABOUT_PATH,
            PATHS_PATH,
            RUN_EXPORTS_PATH,
            ICON_PATH,
        ];
        wanted.extend(RECIPE_PATHS);

        let mut members = PackageMembers::default();
        let mut index_map: Option<Map<String, Value>> = None;
        let mut paths_body: Option<Vec<u8>> = None;

        {
            let mut stream = stream_info(&info.path, &mut source)?;
            for entry in stream.entries()? {
                let mut entry = entry?;
                let path = entry.path()?.to_string_lossy().into_owned();
                let Some(at) = wanted.iter().position(|w| *w == path) else {
                    continue;
                };
                wanted.swap_remove(at);

                let mut body = Vec::new();
                entry.read_to_end(&mut body)?;

                match path.as_str() {
                    INDEX_PATH => {
                        let map: Map<String, Value> = serde_json::from_slice(&body)?;
                        // no icon reference means we will never see one
                        if !map.contains_key("icon") {
                            wanted.retain(|w| *w != ICON_PATH);
                        }
                        index_map = Some(map);
                    }
                    ABOUT_PATH => members.about = Some(canonical_json(&body)?),
                    PATHS_PATH => paths_body = Some(body),
                    RUN_EXPORTS_PATH => members.run_exports = Some(canonical_json(&body)?),
                    ICON_PATH => members.icon = Some(body),
                    recipe if RECIPE_PATHS.contains(&recipe) => {
                        members.recipe = Some(decode_recipe(&body));
                        wanted.retain(|w| !RECIPE_PATHS.contains(w));
                    }
                    _ => {}
                }

                if wanted.is_empty() {
                    tracing::debug!("{} early close", info.path);
                    break;
                }
            }
        }

        if !(wanted.is_empty() || wanted == [RUN_EXPORTS_PATH]) {
            // very common for some metadata to be missing
            tracing::debug!("{} missing {:?}", info.path, wanted);
        }

        let index_map = index_map.ok_or(PackageExtractError::MissingIndexMember)?;
        members.post_install = post_install_details(paths_body.as_deref())?;

        source.seek(SeekFrom::Start(0))?;
        let digests = compute_digests(
            &mut source,
            &[DigestAlgorithm::Md5, DigestAlgorithm::Sha256],
        )?;
        drop(source);

        let record = PackageRecord::from_index_map(
            index_map,
            info.size,
            digests[&DigestAlgorithm::Md5].clone(),
            digests[&DigestAlgorithm::Sha256].clone(),
        )?
        .into_map()?;

        self.store(info, &members, &record)?;
        Ok(record)
    }
}

/// Parse a JSON member and re-serialize it in canonical form (minified,
/// sorted keys).
fn canonical_json(body: &[u8]) -> Result<String, serde_json::Error> {
    let value: Value = serde_json::from_slice(body)?;
    serde_json::to_string(&value)
}

/// Decode a YAML recipe into canonical JSON text, best effort.
///
/// Anything that does not decode to a plain map caches as `{}`. Tagged
/// values (arbitrary object constructors and the like) are refused
/// outright; they must never reach cached metadata.
pub fn decode_recipe(body: &[u8]) -> String {
    match serde_yaml::from_slice::<serde_yaml::Value>(body) {
        Ok(yaml) if !has_tags(&yaml) => match serde_json::to_value(yaml) {
            Ok(value @ Value::Object(_)) => {
                serde_json::to_string(&value).unwrap_or_else(|_| "{}".to_string())
            }
            _ => "{}".to_string(),
        },
        _ => "{}".to_string(),
    }
}

fn has_tags(value: &serde_yaml::Value) -> bool {
    match value {
        serde_yaml::Value::Tagged(_) => true,
        serde_yaml::Value::Sequence(items) => items.iter().any(has_tags),
        serde_yaml::Value::Mapping(entries) => entries
            .iter()
            .any(|(key, value)| has_tags(key) || has_tags(value)),
        _ => false,
    }
}

/// Compute the post-install report from the body of `info/paths`.
///
/// The report is a fixed-shape boolean map; with no `info/paths` member
/// every field is false. Link scripts are classified with a regex
/// equivalent of the historical `*/.*-{kind}.*` glob, where `*` crosses
/// directory separators.
pub fn post_install_details(paths_body: Option<&[u8]>) -> Result<String, serde_json::Error> {
    let mut report: BTreeMap<&str, bool> = BTreeMap::from([
        ("binary_prefix", false),
        ("text_prefix", false),
        ("activate.d", false),
        ("deactivate.d", false),
        ("pre_link", false),
        ("post_link", false),
        ("pre_unlink", false),
    ]);

    if let Some(body) = paths_body {
        let doc: Value = serde_json::from_slice(body)?;
        let entries = doc
            .get("paths")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for entry in &entries {
            let path = entry.get("_path").and_then(Value::as_str).unwrap_or("");

            if entry
                .get("prefix_placeholder")
                .and_then(Value::as_str)
                .is_some_and(|placeholder| !placeholder.is_empty())
            {
                match entry.get("file_mode").and_then(Value::as_str) {
                    Some("binary") => {
                        report.insert("binary_prefix", true);
                    }
                    Some("text") => {
                        report.insert("text_prefix", true);
                    }
                    _ => {}
                }
            }

            for key in ["activate.d", "deactivate.d"] {
                if !report[key] && path.starts_with(&format!("etc/conda/{key}")) {
                    report.insert(key, true);
                }
            }

            for (key, matcher) in [
                ("pre_link", &PRE_LINK_RE),
                ("post_link", &POST_LINK_RE),
                ("pre_unlink", &PRE_UNLINK_RE),
            ] {
                if !report[key] && matcher.is_match(path) {
                    report.insert(key, true);
                }
            }
        }
    }

    serde_json::to_string(&report)
}

static PRE_LINK_RE: lazy_regex::Lazy<lazy_regex::Regex> =
    lazy_regex::lazy_regex!(r"^.*/\..*-pre-link\..*$");
static POST_LINK_RE: lazy_regex::Lazy<lazy_regex::Regex> =
    lazy_regex::lazy_regex!(r"^.*/\..*-post-link\..*$");
static PRE_UNLINK_RE: lazy_regex::Lazy<lazy_regex::Regex> =
    lazy_regex::lazy_regex!(r"^.*/\..*-pre-unlink\..*$");

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn post_install_defaults_to_all_false() {
        let report: Value =
            serde_json::from_str(&post_install_details(None).unwrap()).unwrap();
        for (_, value) in report.as_object().unwrap() {
            assert_eq!(value, &json!(false));
        }
    }

    #[test]
    fn post_install_classifies_paths() {
        let paths = json!({
            "paths": [
                {"_path": "bin/app", "prefix_placeholder": "/opt/prefix", "file_mode": "binary"},
                {"_path": "etc/app.cfg", "prefix_placeholder": "/opt/prefix", "file_mode": "text"},
                {"_path": "etc/conda/activate.d/app.sh"},
                {"_path": "lib/app/.app-post-link.sh"},
                {"_path": "bin/.app-pre-unlink.bat"},
            ]
        });
        let report: Value = serde_json::from_str(
            &post_install_details(Some(serde_json::to_vec(&paths).unwrap().as_slice())).unwrap(),
        )
        .unwrap();
        assert_eq!(
            report,
            json!({
                "activate.d": true,
                "binary_prefix": true,
                "deactivate.d": false,
                "post_link": true,
                "pre_link": false,
                "pre_unlink": true,
                "text_prefix": true,
            })
        );
    }

    #[test]
    fn link_script_glob_crosses_directories() {
        assert!(POST_LINK_RE.is_match("deep/nested/dir/.pkg-post-link.sh"));
        assert!(!POST_LINK_RE.is_match(".pkg-post-link.sh")); // needs a directory
        assert!(!POST_LINK_RE.is_match("bin/pkg-post-link.sh")); // needs the dot
    }

    #[test]
    fn recipe_decoding_is_best_effort() {
        assert_eq!(
            decode_recipe(b"package:\n  name: a\n"),
            r#"{"package":{"name":"a"}}"#
        );
        assert_eq!(decode_recipe(b"- just\n- a list\n"), "{}");
        assert_eq!(decode_recipe(b"{unbalanced"), "{}");
        // constructor tags must not round-trip into cached metadata
        assert_eq!(decode_recipe(b"!!python/object:os.system []\n"), "{}");
    }
}
