//! Assembly and emission of the per-subdir index documents.

use std::path::{Path, PathBuf};

use adder_types::{Buckets, ChannelInfo, RepoData, MAX_PATCH_INSTRUCTIONS_VERSION};
use serde::Serialize;
use serde_json::{json, Value};

use crate::cache::IndexCache;
use crate::utils::{maybe_write, remove_if_exists};
use crate::{ChannelIndex, ChannelIndexError};

pub(crate) const REPODATA_JSON: &str = "repodata.json";
pub(crate) const REPODATA_FROM_PACKAGES_JSON: &str = "repodata_from_packages.json";
pub(crate) const CURRENT_REPODATA_JSON: &str = "current_repodata.json";
pub(crate) const RUN_EXPORTS_JSON: &str = "run_exports.json";
pub(crate) const PATCH_INSTRUCTIONS_JSON: &str = "patch_instructions.json";

/// zstd level for the `.zst` siblings; a noticeable ratio jump over the
/// default without hurting decompression speed.
pub(crate) const ZSTD_COMPRESS_LEVEL: i32 = 16;

impl ChannelIndex {
    /// Emit every document for one prepared subdir. All extraction for the
    /// subdir has completed by the time this runs; everything here reads
    /// from the cache only.
    pub(crate) fn index_prepared_subdir(
        &self,
        subdir: &str,
        cache: &mut dyn IndexCache,
        patch_generator: Option<&Path>,
    ) -> Result<(), ChannelIndexError> {
        tracing::info!("{subdir}: gathering repodata");
        let (packages, cnd_packages) = cache.indexed_packages()?;
        let repodata_from_packages = self.build_repodata(subdir, packages, cnd_packages);

        if self.config().write_monolithic {
            tracing::info!("{subdir}: writing pre-patch repodata");
            self.write_repodata(subdir, &repodata_from_packages, REPODATA_FROM_PACKAGES_JSON)?;
        }

        tracing::info!("{subdir}: applying patch instructions");
        let (instructions, from_file) =
            self.load_patch_instructions(subdir, &repodata_from_packages, patch_generator)?;
        if instructions.patch_instructions_version > MAX_PATCH_INSTRUCTIONS_VERSION {
            return Err(ChannelIndexError::IncompatiblePatchVersion(
                instructions.patch_instructions_version,
            ));
        }
        if !from_file {
            self.write_patch_instructions(subdir, &instructions)?;
        }

        let mut repodata = repodata_from_packages.clone();
        repodata.apply_instructions(&instructions);

        if self.config().write_monolithic {
            tracing::info!("{subdir}: writing patched repodata");
            self.write_repodata(subdir, &repodata, REPODATA_JSON)?;
        }

        if self.config().write_current_repodata {
            tracing::info!("{subdir}: building current_repodata subset");
            let pins = self
                .config()
                .current_index_versions
                .clone()
                .unwrap_or_default();
            let current = crate::current_repodata::build_current_repodata(&repodata, &pins);
            self.write_repodata(subdir, &current, CURRENT_REPODATA_JSON)?;
        } else {
            for suffix in ["", ".bz2", ".zst"] {
                remove_if_exists(
                    &self
                        .output_root()
                        .join(subdir)
                        .join(format!("{CURRENT_REPODATA_JSON}{suffix}")),
                )?;
            }
        }

        if self.config().write_run_exports {
            tracing::info!("{subdir}: writing run_exports");
            let run_exports = build_run_exports_data(subdir, cache)?;
            let bytes = self.serialize_document(&run_exports)?;
            self.write_document(subdir, RUN_EXPORTS_JSON, &bytes)?;
        }

        if self.config().write_shards {
            tracing::info!("{subdir}: writing shards");
            self.index_subdir_shards(subdir, cache, patch_generator)?;
        }

        self.write_subdir_html(subdir, &repodata)?;

        tracing::debug!("{subdir}: finished");
        Ok(())
    }

    /// Assemble the monolithic document from cache rows.
    pub(crate) fn build_repodata(
        &self,
        subdir: &str,
        packages: Buckets,
        cnd_packages: Buckets,
    ) -> RepoData {
        let base_url = self
            .config()
            .base_url
            .as_ref()
            .map(|base| format!("{}/{subdir}/", base.trim_end_matches('/')));
        let version = if base_url.is_some() { 2 } else { 1 };
        RepoData {
            info: Some(ChannelInfo {
                base_url,
                subdir: subdir.to_string(),
            }),
            packages,
            cnd_packages,
            removed: Default::default(),
            version,
        }
    }

    pub(crate) fn serialize_document<T: Serialize>(
        &self,
        document: &T,
    ) -> Result<Vec<u8>, serde_json::Error> {
        if self.config().compact_json {
            serde_json::to_vec(document)
        } else {
            serde_json::to_vec_pretty(document)
        }
    }

    pub(crate) fn write_repodata(
        &self,
        subdir: &str,
        repodata: &RepoData,
        filename: &str,
    ) -> Result<bool, ChannelIndexError> {
        let bytes = self.serialize_document(repodata)?;
        self.write_document(subdir, filename, &bytes)
    }

    /// Write a document and maintain its compressed siblings.
    ///
    /// The `.json` file is only rewritten when its bytes changed, keeping
    /// its mtime stable across idempotent runs; unchanged documents also
    /// skip the compressed variants. Disabled variants are deleted.
    pub(crate) fn write_document(
        &self,
        subdir: &str,
        filename: &str,
        bytes: &[u8],
    ) -> Result<bool, ChannelIndexError> {
        let path = self.output_root().join(subdir).join(filename);
        let written = maybe_write(&path, bytes)?;

        let bz2_path = sibling(&path, ".bz2");
        if self.config().write_bz2 {
            if written || !bz2_path.is_file() {
                maybe_write(&bz2_path, &bz2_compress(bytes)?)?;
            }
        } else {
            remove_if_exists(&bz2_path)?;
        }

        let zst_path = sibling(&path, ".zst");
        if self.config().write_zst {
            if written || !zst_path.is_file() {
                maybe_write(&zst_path, &zstd::stream::encode_all(bytes, ZSTD_COMPRESS_LEVEL)?)?;
            }
        } else {
            remove_if_exists(&zst_path)?;
        }

        Ok(written)
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(suffix);
    path.with_file_name(name)
}

fn bz2_compress(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    use std::io::Write;
    let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::best());
    encoder.write_all(bytes)?;
    encoder.finish()
}

/// The optional exports document: every cached `run_exports` blob, bucketed
/// by archive dialect.
pub(crate) fn build_run_exports_data(
    subdir: &str,
    cache: &mut dyn IndexCache,
) -> Result<Value, ChannelIndexError> {
    let mut packages = serde_json::Map::new();
    let mut cnd_packages = serde_json::Map::new();
    for (filename, run_exports) in cache.run_exports()? {
        match adder_types::ArchiveType::try_from(&filename) {
            Some(adder_types::ArchiveType::Tbz) => {
                packages.insert(filename, run_exports);
            }
            Some(adder_types::ArchiveType::Cnd) => {
                cnd_packages.insert(filename, run_exports);
            }
            None => {}
        }
    }
    Ok(json!({
        "info": {"subdir": subdir},
        "pkgs": packages,
        "pkgs_c": cnd_packages,
        "repodata_version": 1,
    }))
}
