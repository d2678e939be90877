//! Content-addressed sharded repodata: one binary document per package name
//! plus a manifest mapping names to shard hashes.

use std::path::Path;

use adder_digest::{compute_bytes_digest, Sha256};
use adder_types::{
    ArchiveType, PatchInstructions, RecordMap, Shard, ShardedRepodata, ShardedSubdirInfo,
    MAX_PATCH_INSTRUCTIONS_VERSION,
};
use serde_json::Value;

use crate::aggregate::ZSTD_COMPRESS_LEVEL;
use crate::cache::IndexCache;
use crate::patch::{load_instructions_archive, run_patch_generator, GEN_PATCH_NAME};
use crate::utils::maybe_write;
use crate::{ChannelIndex, ChannelIndexError};

pub(crate) const SHARDS_JSON: &str = "repodata_shards.msgpack.zst";
pub(crate) const SHARDS_FROM_PACKAGES_JSON: &str = "repodata_shards_from_packages.msgpack.zst";

impl ChannelIndex {
    /// Write the pre-patch shard set, apply patch instructions per shard,
    /// and write the post-patch shard set. Shard writes are idempotent:
    /// an existing content-addressed file is never rewritten, and stale
    /// shard files are left for an external collector.
    pub(crate) fn index_subdir_shards(
        &self,
        subdir: &str,
        cache: &mut dyn IndexCache,
        patch_generator: Option<&Path>,
    ) -> Result<(), ChannelIndexError> {
        let output_dir = self.output_root().join(subdir);
        let shards = cache.indexed_shards()?;

        let mut manifest = self.empty_manifest(subdir);
        for (name, shard) in &shards {
            let hash = self.write_shard(&output_dir, shard)?;
            manifest.shards.insert(name.clone(), hash);
        }
        self.write_manifest(&output_dir.join(SHARDS_FROM_PACKAGES_JSON), &manifest)?;

        let instructions = self.load_shard_patch_instructions(subdir, &shards, patch_generator)?;
        if instructions.patch_instructions_version > MAX_PATCH_INSTRUCTIONS_VERSION {
            return Err(ChannelIndexError::IncompatiblePatchVersion(
                instructions.patch_instructions_version,
            ));
        }

        let mut patched_manifest = self.empty_manifest(subdir);
        for (name, shard) in shards {
            let mut shard = shard;
            let removed = shard.apply_instructions(&instructions);
            patched_manifest.removed.extend(removed);
            if shard.is_empty() {
                continue;
            }
            let hash = self.write_shard(&output_dir, &shard)?;
            patched_manifest.shards.insert(name, hash);
        }
        self.write_manifest(&output_dir.join(SHARDS_JSON), &patched_manifest)?;
        Ok(())
    }

    fn empty_manifest(&self, subdir: &str) -> ShardedRepodata {
        let base_url = self
            .config()
            .base_url
            .as_ref()
            .map(|base| format!("{}/{subdir}/", base.trim_end_matches('/')));
        ShardedRepodata {
            version: if base_url.is_some() { 2 } else { 1 },
            info: ShardedSubdirInfo {
                subdir: subdir.to_string(),
                base_url,
                shards_base_url: String::new(),
            },
            removed: Default::default(),
            shards: Default::default(),
        }
    }

    /// Serialize, hash and store one shard; returns the body hash. The file
    /// name is the hex of the hash, so writing is naturally idempotent.
    fn write_shard(&self, output_dir: &Path, shard: &Shard) -> Result<[u8; 32], ChannelIndexError> {
        let body = encode_shard(shard);
        let hash: [u8; 32] = compute_bytes_digest::<Sha256>(&body).into();
        let path = output_dir.join(format!("{}.msgpack.zst", hex::encode(hash)));
        if !path.exists() {
            let compressed = zstd::stream::encode_all(body.as_slice(), ZSTD_COMPRESS_LEVEL)?;
            crate::utils::atomic_write(&path, &compressed)?;
        }
        Ok(hash)
    }

    fn write_manifest(
        &self,
        path: &Path,
        manifest: &ShardedRepodata,
    ) -> Result<(), ChannelIndexError> {
        let body = encode_manifest(manifest);
        let compressed = zstd::stream::encode_all(body.as_slice(), ZSTD_COMPRESS_LEVEL)?;
        maybe_write(path, &compressed)?;
        Ok(())
    }

    /// Patch instructions for the shard pipeline. Archive and file sources
    /// behave exactly as in the monolithic pipeline; a generator executable
    /// is invoked once per shard and the per-shard instruction documents are
    /// merged.
    fn load_shard_patch_instructions(
        &self,
        subdir: &str,
        shards: &[(String, Shard)],
        patch_generator: Option<&Path>,
    ) -> Result<PatchInstructions, ChannelIndexError> {
        let generator: Option<&Path> = match patch_generator {
            Some(path) => {
                let name = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if ArchiveType::try_from(&name).is_some() {
                    return load_instructions_archive(path, subdir);
                }
                Some(path)
            }
            None => None,
        };

        let default_generator = self.config().channel_root.join(GEN_PATCH_NAME);
        let generator = generator.or_else(|| {
            default_generator
                .is_file()
                .then(|| default_generator.as_path())
        });

        let Some(generator) = generator else {
            return Ok(self.read_patch_instructions(subdir)?.unwrap_or_default());
        };

        let mut merged = PatchInstructions::default();
        for (name, shard) in shards {
            let document = serde_json::json!({
                "pkgs": shard.packages,
                "pkgs_c": shard.cnd_packages,
            });
            let instructions =
                run_patch_generator(generator, subdir, &serde_json::to_vec(&document)?)?;
            tracing::debug!("{subdir}: generated instructions for shard {name}");
            merged.packages.extend(instructions.packages);
            merged.cnd_packages.extend(instructions.cnd_packages);
            merged.remove.extend(instructions.remove);
            merged.revoke.extend(instructions.revoke);
            merged.patch_instructions_version = merged
                .patch_instructions_version
                .max(instructions.patch_instructions_version);
        }
        merged.remove.sort_unstable();
        merged.remove.dedup();
        merged.revoke.sort_unstable();
        merged.revoke.dedup();
        self.write_patch_instructions(subdir, &merged)?;
        Ok(merged)
    }
}

/// Shard body: `{pkgs, pkgs_c}` in a compact binary map encoding with the
/// whole-file digests packed from hex to raw bytes.
pub(crate) fn encode_shard(shard: &Shard) -> Vec<u8> {
    let buckets = [
        ("pkgs", &shard.packages),
        ("pkgs_c", &shard.cnd_packages),
    ];
    let value = rmpv::Value::Map(
        buckets
            .into_iter()
            .map(|(key, bucket)| {
                (
                    rmpv::Value::from(key),
                    rmpv::Value::Map(
                        bucket
                            .iter()
                            .map(|(filename, record)| {
                                (rmpv::Value::from(filename.as_str()), pack_record(record))
                            })
                            .collect(),
                    ),
                )
            })
            .collect(),
    );
    let mut body = Vec::new();
    rmpv::encode::write_value(&mut body, &value).expect("vec write cannot fail");
    body
}

/// Manifest body, keys in sorted order.
pub(crate) fn encode_manifest(manifest: &ShardedRepodata) -> Vec<u8> {
    let mut info = Vec::new();
    if let Some(base_url) = &manifest.info.base_url {
        info.push((
            rmpv::Value::from("base_url"),
            rmpv::Value::from(base_url.as_str()),
        ));
    }
    info.push((
        rmpv::Value::from("shards_base_url"),
        rmpv::Value::from(manifest.info.shards_base_url.as_str()),
    ));
    info.push((
        rmpv::Value::from("subdir"),
        rmpv::Value::from(manifest.info.subdir.as_str()),
    ));

    let value = rmpv::Value::Map(vec![
        (rmpv::Value::from("info"), rmpv::Value::Map(info)),
        (
            rmpv::Value::from("removed"),
            rmpv::Value::Array(
                manifest
                    .removed
                    .iter()
                    .map(|name| rmpv::Value::from(name.as_str()))
                    .collect(),
            ),
        ),
        (
            rmpv::Value::from("repodata_version"),
            rmpv::Value::from(manifest.version),
        ),
        (
            rmpv::Value::from("shards"),
            rmpv::Value::Map(
                manifest
                    .shards
                    .iter()
                    .map(|(name, hash)| {
                        (
                            rmpv::Value::from(name.as_str()),
                            rmpv::Value::Binary(hash.to_vec()),
                        )
                    })
                    .collect(),
            ),
        ),
    ]);
    let mut body = Vec::new();
    rmpv::encode::write_value(&mut body, &value).expect("vec write cannot fail");
    body
}

/// Convert one record to msgpack, packing hex digests into raw bytes.
fn pack_record(record: &RecordMap) -> rmpv::Value {
    rmpv::Value::Map(
        record
            .iter()
            .map(|(key, value)| {
                let packed = match (key.as_str(), value) {
                    ("md5" | "sha256", Value::String(hexdigest)) => hex::decode(hexdigest)
                        .map(rmpv::Value::Binary)
                        .unwrap_or_else(|_| json_to_rmpv(value)),
                    _ => json_to_rmpv(value),
                };
                (rmpv::Value::from(key.as_str()), packed)
            })
            .collect(),
    )
}

fn json_to_rmpv(value: &Value) -> rmpv::Value {
    match value {
        Value::Null => rmpv::Value::Nil,
        Value::Bool(flag) => rmpv::Value::from(*flag),
        Value::Number(number) => {
            if let Some(unsigned) = number.as_u64() {
                rmpv::Value::from(unsigned)
            } else if let Some(signed) = number.as_i64() {
                rmpv::Value::from(signed)
            } else {
                rmpv::Value::from(number.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(text) => rmpv::Value::from(text.as_str()),
        Value::Array(items) => rmpv::Value::Array(items.iter().map(json_to_rmpv).collect()),
        Value::Object(map) => rmpv::Value::Map(
            map.iter()
                .map(|(key, value)| (rmpv::Value::from(key.as_str()), json_to_rmpv(value)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    fn shard() -> Shard {
        let mut shard = Shard::default();
        let Value::Object(record) = json!({
            "name": "a",
            "version": "1.0",
            "build": "0",
            "build_number": 0,
            "depends": [],
            "md5": "37861df8111170f5eed4bff27868df59",
            "sha256": "459f3e9b2178fa33bdc4e6267326405329d1c1ab982273d9a1c0a5084a1ddc30",
            "size": 8733,
        }) else {
            unreachable!()
        };
        shard.packages.insert("a-1.0-0.tbz".to_string(), record);
        shard
    }

    #[test]
    fn shard_encoding_is_deterministic_and_packs_digests() {
        let first = encode_shard(&shard());
        let second = encode_shard(&shard());
        assert_eq!(first, second);

        let value = rmpv::decode::read_value(&mut first.as_slice()).unwrap();
        let rmpv::Value::Map(buckets) = value else {
            panic!("shard body must be a map");
        };
        assert_eq!(buckets[0].0, rmpv::Value::from("pkgs"));
        assert_eq!(buckets[1].0, rmpv::Value::from("pkgs_c"));
        let rmpv::Value::Map(packages) = &buckets[0].1 else {
            panic!("pkgs must be a map");
        };
        let rmpv::Value::Map(record) = &packages[0].1 else {
            panic!("record must be a map");
        };
        let md5 = record
            .iter()
            .find(|(key, _)| key == &rmpv::Value::from("md5"))
            .map(|(_, value)| value.clone())
            .unwrap();
        assert_eq!(
            md5,
            rmpv::Value::Binary(hex::decode("37861df8111170f5eed4bff27868df59").unwrap())
        );
    }

    #[test]
    fn manifest_round_trips_through_msgpack() {
        let mut manifest = ShardedRepodata {
            version: 1,
            ..Default::default()
        };
        manifest.info.subdir = "linux-64".to_string();
        manifest.shards.insert("a".to_string(), [7u8; 32]);
        let body = encode_manifest(&manifest);
        let value = rmpv::decode::read_value(&mut body.as_slice()).unwrap();
        let rmpv::Value::Map(entries) = value else {
            panic!("manifest must be a map");
        };
        let keys: Vec<String> = entries
            .iter()
            .map(|(key, _)| key.as_str().unwrap().to_string())
            .collect();
        assert_eq!(keys, ["info", "removed", "repodata_version", "shards"]);
    }
}
