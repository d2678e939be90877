//! Derivation of `current_repodata.json`: a dependency-closed pruning of the
//! patched index keeping only the newest (plus pinned) versions.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use adder_types::{version, ArchiveType, MatchSpec, RepoData, VersionSpec};
use serde_json::Value;

/// One record's pruning-relevant fields, borrowed from the document.
struct Candidate<'a> {
    filename: &'a str,
    name: &'a str,
    version: &'a str,
    build: &'a str,
    depends: Vec<&'a str>,
    has_features: bool,
}

fn truthy_str(value: Option<&Value>) -> bool {
    match value {
        Some(Value::String(text)) => !text.is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Bool(flag)) => *flag,
        _ => false,
    }
}

/// `=version` prefix semantics: the whole version group of a name.
fn same_version_group(version_prefix: &str, candidate: &str) -> bool {
    candidate == version_prefix || candidate.starts_with(&format!("{version_prefix}."))
}

/// Build the pruned index.
///
/// 1. The newest version group of every package is kept, plus the newest
///    group matching each pin selector.
/// 2. Dependencies are closed over: any kept record whose dep spec no kept
///    record satisfies pulls in the newest satisfying version group from
///    the full index. This runs to a fixpoint so every record that makes it
///    into the subset has every dep satisfiable inside the subset.
/// 3. Every package whose kept records carry `features`/`track_features`
///    also keeps its newest feature-free record no newer than the latest
///    kept version, preserving a clean fallback.
pub fn build_current_repodata(
    repodata: &RepoData,
    pins: &BTreeMap<String, Vec<String>>,
) -> RepoData {
    let candidates: Vec<Candidate<'_>> = repodata
        .iter_records()
        .filter_map(|(filename, record)| {
            Some(Candidate {
                filename,
                name: record.get("name")?.as_str()?,
                version: record.get("version")?.as_str()?,
                build: record.get("build").and_then(Value::as_str).unwrap_or(""),
                depends: record
                    .get("depends")
                    .and_then(Value::as_array)
                    .map(|depends| depends.iter().filter_map(Value::as_str).collect())
                    .unwrap_or_default(),
                has_features: truthy_str(record.get("features"))
                    || truthy_str(record.get("track_features")),
            })
        })
        .collect();

    // version-descending groups per name, filenames as tiebreak
    let mut groups: BTreeMap<&str, Vec<&Candidate<'_>>> = BTreeMap::new();
    for candidate in &candidates {
        groups.entry(candidate.name).or_default().push(candidate);
    }
    for group in groups.values_mut() {
        group.sort_by(|a, b| match version::compare(b.version, a.version) {
            Ordering::Equal => a.filename.cmp(b.filename),
            ordering => ordering,
        });
    }

    let mut kept: BTreeSet<&str> = BTreeSet::new();

    // newest version group per name, plus pinned groups
    for (name, group) in &groups {
        let newest = group[0].version;
        for candidate in group.iter() {
            if same_version_group(newest, candidate.version) {
                kept.insert(candidate.filename);
            }
        }
        for selector in pins.get(*name).into_iter().flatten() {
            let Ok(spec) = format!("={selector}").parse::<VersionSpec>() else {
                tracing::warn!("unusable pin {selector} for {name}");
                continue;
            };
            if let Some(pinned) = group.iter().find(|candidate| spec.matches(candidate.version)) {
                let pinned_version = pinned.version;
                for candidate in group.iter() {
                    if same_version_group(pinned_version, candidate.version) {
                        kept.insert(candidate.filename);
                    }
                }
            }
        }
    }

    close_over_dependencies(&candidates, &groups, &mut kept);

    // clean fallback for feature-tainted packages
    let mut fallbacks: Vec<&str> = Vec::new();
    for group in groups.values() {
        let kept_of_group: Vec<&&Candidate<'_>> = group
            .iter()
            .filter(|candidate| kept.contains(candidate.filename))
            .collect();
        if kept_of_group.is_empty() || !kept_of_group.iter().any(|c| c.has_features) {
            continue;
        }
        let latest_kept = kept_of_group[0].version;
        if let Some(fallback) = group.iter().find(|candidate| {
            !candidate.has_features
                && version::compare(candidate.version, latest_kept) != Ordering::Greater
        }) {
            fallbacks.push(fallback.filename);
        }
    }
    kept.extend(fallbacks);

    // the fallbacks bring their own dependencies
    close_over_dependencies(&candidates, &groups, &mut kept);

    let mut current = RepoData {
        info: repodata.info.clone(),
        packages: Default::default(),
        cnd_packages: Default::default(),
        removed: repodata.removed.clone(),
        version: repodata.version,
    };
    for (filename, record) in &repodata.packages {
        if kept.contains(filename.as_str()) {
            current.packages.insert(filename.clone(), record.clone());
        }
    }
    for (filename, record) in &repodata.cnd_packages {
        if !kept.contains(filename.as_str()) {
            continue;
        }
        let mut record = record.clone();
        // carry the md5 of the legacy twin so clients migrating between
        // container formats do not re-download
        if let Some(twin) = ArchiveType::counterpart(filename) {
            if let Some(md5) = repodata.packages.get(&twin).and_then(|twin| twin.get("md5")) {
                record.insert("legacy_bz2_md5".to_string(), md5.clone());
            }
        }
        current.cnd_packages.insert(filename.clone(), record);
    }
    current
}

/// Iterate dependency backfill until no new version group is added.
fn close_over_dependencies<'a, 'b>(
    candidates: &'b [Candidate<'a>],
    groups: &BTreeMap<&'a str, Vec<&'b Candidate<'a>>>,
    kept: &mut BTreeSet<&'a str>,
) {
    let by_filename: BTreeMap<&str, &Candidate<'_>> = candidates
        .iter()
        .map(|candidate| (candidate.filename, candidate))
        .collect();

    let mut seen_specs: BTreeSet<&str> = BTreeSet::new();
    loop {
        let mut additions: Vec<&str> = Vec::new();
        for filename in kept.iter() {
            let Some(candidate) = by_filename.get(filename) else {
                continue;
            };
            for dep in &candidate.depends {
                if seen_specs.contains(dep) {
                    continue;
                }
                let Ok(spec) = dep.parse::<MatchSpec>() else {
                    seen_specs.insert(dep);
                    continue;
                };
                let satisfied = kept.iter().any(|kept_filename| {
                    by_filename.get(kept_filename).is_some_and(|kept_candidate| {
                        spec.matches(
                            kept_candidate.name,
                            kept_candidate.version,
                            kept_candidate.build,
                        )
                    })
                });
                if satisfied {
                    seen_specs.insert(dep);
                    continue;
                }
                // backfill the newest satisfying version group
                if let Some(group) = groups.get(spec.name.as_str()) {
                    if let Some(found) = group
                        .iter()
                        .find(|c| spec.matches(c.name, c.version, c.build))
                    {
                        let found_version = found.version;
                        for member in group.iter() {
                            if same_version_group(found_version, member.version) {
                                additions.push(member.filename);
                            }
                        }
                    }
                }
                seen_specs.insert(dep);
            }
        }
        let before = kept.len();
        kept.extend(additions);
        if kept.len() == before {
            break;
        }
    }
}
