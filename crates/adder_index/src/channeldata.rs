//! The cross-subdir channel summary (`channeldata.json`).

use std::cmp::Ordering;
use std::collections::BTreeMap;

use adder_types::{version, ArchiveType, RecordMap, RepoData};
use serde_json::{json, Map, Value};

use crate::aggregate::REPODATA_JSON;
use crate::utils::{make_seconds, maybe_write};
use crate::{ChannelIndex, ChannelIndexError};

/// Descriptive fields taken from the record with the greatest version.
const SCALAR_FIELDS: [&str; 16] = [
    "description",
    "dev_url",
    "doc_url",
    "doc_source_url",
    "home",
    "license",
    "source_url",
    "source_git_url",
    "summary",
    "icon_url",
    "icon_hash",
    "tags",
    "identifiers",
    "keywords",
    "recipe_origin",
    "version",
];

/// Post-install flags OR-ed across all contributing subdirs.
const BOOLEAN_FLAGS: [&str; 7] = [
    "binary_prefix",
    "text_prefix",
    "activate.d",
    "deactivate.d",
    "pre_link",
    "post_link",
    "pre_unlink",
];

impl ChannelIndex {
    /// Re-read the emitted `repodata.json` of every subdir and rewrite
    /// `channeldata.json` (and the root listing, and the optional feed).
    /// Packages are not re-scanned; per-package detail comes from the cache.
    pub fn update_channeldata(&self) -> Result<(), ChannelIndexError> {
        let subdirs = self.subdirs()?;
        let mut packages: BTreeMap<String, RecordMap> = BTreeMap::new();

        for subdir in &subdirs {
            let repodata_path = self.output_root().join(subdir).join(REPODATA_JSON);
            if !repodata_path.is_file() {
                tracing::debug!("{subdir}: no emitted repodata, skipping in summary");
                continue;
            }
            let repodata = RepoData::from_path(&repodata_path)?;
            let mut cache = self.open_cache(subdir)?;

            for filename in newest_per_name(&repodata) {
                let merged = cache.load_all_from_cache(&filename)?;
                if merged.is_empty() {
                    continue;
                }
                let Some(name) = merged.get("name").and_then(Value::as_str) else {
                    continue;
                };
                let entry = packages.entry(name.to_string()).or_default();
                update_entry(entry, &merged, subdir);
            }
        }

        for entry in packages.values_mut() {
            // commits belong only to the syndication feed
            entry.remove("commits");
            entry.retain(|_, value| !value.is_null());
        }

        let channeldata = json!({
            "channeldata_version": 1,
            "packages": packages,
            "subdirs": &subdirs,
        });
        let bytes = self.serialize_document(&channeldata)?;
        maybe_write(&self.output_root().join("channeldata.json"), &bytes)?;

        if self.config().write_rss {
            let feed = crate::rss::build_rss(&self.channel_name(), &channeldata);
            maybe_write(&self.output_root().join("rss.xml"), feed.as_bytes())?;
        }

        self.write_channel_root_html(&subdirs)?;
        Ok(())
    }
}

/// Choose one representative filename per package name: the union of both
/// dialect buckets with `.cnd` winning over its same-stem `.tbz` twin, then
/// the newest by `(version, timestamp, filename)`.
fn newest_per_name(repodata: &RepoData) -> Vec<String> {
    let mut groups: BTreeMap<&str, Vec<(&String, &RecordMap)>> = BTreeMap::new();

    let superseded = |filename: &str| {
        matches!(ArchiveType::split_str(filename), Some((stem, ArchiveType::Tbz))
            if repodata.cnd_packages.contains_key(&format!("{stem}.cnd")))
    };

    for (filename, record) in repodata.iter_records() {
        if superseded(filename) {
            continue;
        }
        let Some(name) = record.get("name").and_then(Value::as_str) else {
            continue;
        };
        groups.entry(name).or_default().push((filename, record));
    }

    groups
        .into_values()
        .filter_map(|group| {
            group
                .into_iter()
                .max_by(|(a_name, a), (b_name, b)| {
                    let a_version = a.get("version").and_then(Value::as_str).unwrap_or("0");
                    let b_version = b.get("version").and_then(Value::as_str).unwrap_or("0");
                    version::compare(a_version, b_version)
                        .then_with(|| record_timestamp(a).cmp(&record_timestamp(b)))
                        .then_with(|| a_name.cmp(b_name))
                })
                .map(|(filename, _)| filename.clone())
        })
        .collect()
}

fn record_timestamp(record: &Map<String, Value>) -> u64 {
    record
        .get("timestamp")
        .and_then(Value::as_u64)
        .map(make_seconds)
        .unwrap_or(0)
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(text)) => !text.is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(map)) => !map.is_empty(),
        Some(Value::Number(number)) => number.as_f64() != Some(0.0),
    }
}

/// Merge one package's enriched view into its channel entry.
fn update_entry(entry: &mut RecordMap, merged: &RecordMap, subdir: &str) {
    let incoming_version = merged.get("version").and_then(Value::as_str).unwrap_or("0");
    let newer_version = match entry.get("version").and_then(Value::as_str) {
        Some(stored) => version::compare(incoming_version, stored) == Ordering::Greater,
        None => true,
    };

    for field in SCALAR_FIELDS {
        let incoming = merged.get(field);
        if truthy(incoming) && (newer_version || !truthy(entry.get(field))) {
            entry.insert(field.to_string(), incoming.cloned().unwrap_or(Value::Null));
        }
    }

    for flag in BOOLEAN_FLAGS {
        let combined = truthy(entry.get(flag)) || truthy(merged.get(flag));
        entry.insert(flag.to_string(), Value::Bool(combined));
    }

    // sorted union of contributing subdirs
    let mut subdirs: Vec<String> = entry
        .get("subdirs")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if !subdirs.iter().any(|existing| existing == subdir) {
        subdirs.push(subdir.to_string());
        subdirs.sort_unstable();
    }
    entry.insert("subdirs".to_string(), json!(subdirs));

    // per-version run_exports, only recorded when non-empty
    if truthy(merged.get("run_exports")) {
        let run_exports = entry
            .entry("run_exports")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(run_exports) = run_exports {
            run_exports.insert(
                incoming_version.to_string(),
                merged.get("run_exports").cloned().unwrap_or(Value::Null),
            );
        }
    }

    if let Some(timestamp) = merged.get("timestamp").and_then(Value::as_u64) {
        let normalized = make_seconds(timestamp);
        let stored = entry.get("timestamp").and_then(Value::as_u64).unwrap_or(0);
        entry.insert("timestamp".to_string(), json!(normalized.max(stored)));
    }
}
