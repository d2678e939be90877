//! Patch instructions: an overlay document applied to a subdirectory's index
//! before emission, carrying per-package metadata overrides, revocations and
//! removals.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::package::ArchiveType;
use crate::repo_data::{Buckets, RecordMap, RepoData};
use crate::Shard;

/// Dependency appended to every revoked record so no solver will pick it.
pub const REVOKED_SENTINEL: &str = "package_has_been_revoked";

/// Patch instruction document versions newer than this are rejected.
pub const MAX_PATCH_INSTRUCTIONS_VERSION: u64 = 1;

/// Patch instructions for a single subdirectory.
///
/// The `packages` section is keyed by legacy filenames; each entry is also
/// applied to the same-stem `.cnd` record. The `packages.conda` section
/// addresses `.cnd` records directly and is applied afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PatchInstructions {
    /// Overrides keyed by `.tbz` filename.
    #[serde(default)]
    pub packages: BTreeMap<String, RecordMap>,

    /// Overrides keyed by `.cnd` filename.
    #[serde(default, rename = "packages.conda")]
    pub cnd_packages: BTreeMap<String, RecordMap>,

    /// The version of the instruction format.
    #[serde(default)]
    pub patch_instructions_version: u64,

    /// Filenames to strike from the index entirely.
    #[serde(default)]
    pub remove: Vec<String>,

    /// Filenames to mark revoked but keep listed.
    #[serde(default)]
    pub revoke: Vec<String>,
}

impl PatchInstructions {
    /// True when the instructions change nothing.
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
            && self.cnd_packages.is_empty()
            && self.remove.is_empty()
            && self.revoke.is_empty()
    }
}

/// Overlay `patch` onto `base`.
///
/// With `add_missing` false, keys absent from `base` are ignored. A null
/// value deletes the key. Nested maps are merged recursively (missing nested
/// keys are added); everything else is overwritten.
pub fn overlay(base: &mut Map<String, Value>, patch: &Map<String, Value>, add_missing: bool) {
    for (key, value) in patch {
        if !add_missing && !base.contains_key(key) {
            continue;
        }
        match (base.get_mut(key), value) {
            (_, Value::Null) => {
                base.remove(key);
            }
            (Some(Value::Object(nested_base)), Value::Object(nested_patch)) => {
                overlay(nested_base, nested_patch, true);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

fn revoke_record(record: &mut RecordMap) {
    record.insert("revoked".to_string(), Value::Bool(true));
    let depends = record
        .entry("depends")
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Value::Array(depends) = depends {
        depends.push(Value::String(REVOKED_SENTINEL.to_string()));
    }
}

/// Apply patch instructions to a pair of dialect buckets.
///
/// `removed` accumulates exactly the filenames named by the `remove` list,
/// whether or not they were present. Unlike record overrides and
/// revocations, removals get no extension-substituted counterpart.
pub fn apply_instructions(
    packages: &mut Buckets,
    cnd_packages: &mut Buckets,
    removed: &mut BTreeSet<String>,
    instructions: &PatchInstructions,
) {
    for (filename, fix) in &instructions.packages {
        if let Some(record) = packages.get_mut(filename) {
            overlay(record, fix, false);
        }
        // the same override also addresses the newer container of the package
        if let Some((stem, ArchiveType::Tbz)) = ArchiveType::split_str(filename) {
            if let Some(record) = cnd_packages.get_mut(&format!("{stem}.cnd")) {
                overlay(record, fix, false);
            }
        }
    }

    for (filename, fix) in &instructions.cnd_packages {
        if let Some(record) = cnd_packages.get_mut(filename) {
            overlay(record, fix, false);
        }
    }

    for filename in &instructions.revoke {
        match ArchiveType::split_str(filename) {
            Some((stem, ArchiveType::Tbz)) => {
                if let Some(record) = packages.get_mut(filename) {
                    revoke_record(record);
                }
                if let Some(record) = cnd_packages.get_mut(&format!("{stem}.cnd")) {
                    revoke_record(record);
                }
            }
            Some((_, ArchiveType::Cnd)) => {
                if let Some(record) = cnd_packages.get_mut(filename) {
                    revoke_record(record);
                }
            }
            None => tracing::warn!("cannot revoke {filename}: not a package filename"),
        }
    }

    for filename in &instructions.remove {
        // the literal key only; a no-op on the bucket of the other dialect
        packages.remove(filename);
        cnd_packages.remove(filename);
        removed.insert(filename.clone());
    }
}

impl RepoData {
    /// Apply patch instructions to this document.
    pub fn apply_instructions(&mut self, instructions: &PatchInstructions) {
        apply_instructions(
            &mut self.packages,
            &mut self.cnd_packages,
            &mut self.removed,
            instructions,
        );
    }
}

impl Shard {
    /// Apply patch instructions to a single shard, returning the filenames
    /// struck from it.
    pub fn apply_instructions(&mut self, instructions: &PatchInstructions) -> BTreeSet<String> {
        let mut removed = BTreeSet::new();
        apply_instructions(
            &mut self.packages,
            &mut self.cnd_packages,
            &mut removed,
            instructions,
        );
        removed
    }
}
