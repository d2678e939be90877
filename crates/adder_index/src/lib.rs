//! Builds repository index documents for a channel of packaged artifacts.
//!
//! A channel is a directory of architecture subdirectories full of package
//! archives. For each subdir the indexer stats the files on disk, extracts a
//! small fixed set of interior members from every new or changed package into
//! a local cache database, and assembles the published documents: the full
//! `repodata.json` (pre- and post-patch), a dependency-closed
//! `current_repodata.json`, content-addressed shards with a manifest, a
//! cross-subdir `channeldata.json`, an optional syndication feed, and HTML
//! listings.
//!
//! ```no_run
//! use adder_index::{update_index, ChannelIndexConfig};
//!
//! let config = ChannelIndexConfig::new("/srv/channels/main");
//! update_index(config, None)?;
//! # Ok::<(), adder_index::ChannelIndexError>(())
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::prelude::*;
use thiserror::Error;

mod aggregate;
pub mod cache;
mod channeldata;
mod current_repodata;
pub mod fs;
pub mod lock;
mod html;
mod patch;
mod rss;
mod shards;
pub mod utils;

pub use cache::{CacheError, IndexCache, PackageExtractError, SqliteCache};
pub use current_repodata::build_current_repodata;
pub use fs::{FileInfo, LocalFS, MinimalFS};
pub use utils::DEFAULT_SUBDIRS;

use adder_types::is_package_file;
use lock::{LockError, LOCK_TIMEOUT};

/// An error that aborts the current channel run. Per-package extraction
/// failures are not here: they are logged and the package is skipped.
#[derive(Debug, Error)]
pub enum ChannelIndexError {
    /// The channel root itself names an architecture subdir.
    #[error(
        "{0} looks like an architecture subdir; point the indexer at the \
         channel root and select subdirs with the `subdirs` option instead"
    )]
    BadSubdirArgument(String),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("incompatible patch instructions version {0}")]
    IncompatiblePatchVersion(u64),

    #[error("patch archive carries no instructions for {0}")]
    MissingPatchInstructions(String),

    #[error("patch generator {path} failed: {reason}")]
    PatchGenerator { path: PathBuf, reason: String },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed document: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Archive(#[from] adder_package_streaming::ExtractError),

    #[error("could not build the worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Everything that shapes one indexing run. The fields mirror the public
/// configuration surface; unset options fall back to the documented
/// defaults.
#[derive(Debug, Clone)]
pub struct ChannelIndexConfig {
    /// Directory containing the architecture subdirs.
    pub channel_root: PathBuf,

    /// Display name; defaults to the basename of `channel_root`.
    pub channel_name: Option<String>,

    /// Where output documents land; defaults to `channel_root`.
    pub output_root: Option<PathBuf>,

    /// Subdirs to index; defaults to scanning `channel_root` for known
    /// subdir names, always including `noarch`.
    pub subdirs: Option<Vec<String>>,

    /// Extraction worker count; defaults to the CPU count (capped at 48 on
    /// the Windows family).
    pub threads: Option<usize>,

    /// Re-extract every observed package instead of trusting the
    /// `(mtime, size)` fingerprint.
    pub deep_integrity_check: bool,

    pub write_bz2: bool,
    pub write_zst: bool,
    pub write_run_exports: bool,
    pub write_monolithic: bool,
    pub write_shards: bool,
    pub write_current_repodata: bool,
    pub write_rss: bool,

    /// Emit minified documents instead of pretty-printed ones.
    pub compact_json: bool,

    /// Stable public address of the channel; carried into the emitted
    /// documents and bumps `repodata_version` to 2.
    pub base_url: Option<String>,

    /// Refresh the `observed` stage from the filesystem before planning.
    /// Disable when an external process maintains the upstream stage.
    pub save_fs_state: bool,

    /// Stat stage compared against `indexed` when planning work.
    pub upstream_stage: String,

    /// Extra versions to pin into `current_repodata.json`, keyed by package
    /// name.
    pub current_index_versions: Option<BTreeMap<String, Vec<String>>>,
}

impl ChannelIndexConfig {
    /// A configuration with the documented defaults.
    pub fn new(channel_root: impl Into<PathBuf>) -> ChannelIndexConfig {
        ChannelIndexConfig {
            channel_root: channel_root.into(),
            channel_name: None,
            output_root: None,
            subdirs: None,
            threads: None,
            deep_integrity_check: false,
            write_bz2: true,
            write_zst: false,
            write_run_exports: false,
            write_monolithic: true,
            write_shards: false,
            write_current_repodata: true,
            write_rss: false,
            compact_json: true,
            base_url: None,
            save_fs_state: true,
            upstream_stage: "observed".to_string(),
            current_index_versions: None,
        }
    }
}

/// Constructor for per-worker cache handles; storage engines plug in here.
pub type CacheFactory = Arc<
    dyn Fn(&Path, &str, Arc<dyn MinimalFS>, &str, &str) -> Result<Box<dyn IndexCache>, CacheError>
        + Send
        + Sync,
>;

/// Per-channel orchestration: discovers subdirs, takes the channel lock and
/// drives list -> diff -> extract -> aggregate -> patch -> emit.
pub struct ChannelIndex {
    config: ChannelIndexConfig,
    fs: Arc<dyn MinimalFS>,
    channel_url: String,
    cache_factory: CacheFactory,
}

impl std::fmt::Debug for ChannelIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelIndex")
            .field("config", &self.config)
            .field("channel_url", &self.channel_url)
            .finish_non_exhaustive()
    }
}

impl ChannelIndex {
    /// Build a coordinator over the local filesystem with the default
    /// sqlite cache store.
    pub fn new(config: ChannelIndexConfig) -> Result<ChannelIndex, ChannelIndexError> {
        let basename = config
            .channel_root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        if DEFAULT_SUBDIRS.contains(&basename.as_str()) {
            return Err(ChannelIndexError::BadSubdirArgument(basename));
        }

        let channel_url = config.channel_root.to_string_lossy().into_owned();
        Ok(ChannelIndex {
            config,
            fs: Arc::new(LocalFS),
            channel_url,
            cache_factory: Arc::new(|root, subdir, fs, url, stage| {
                Ok(Box::new(SqliteCache::with_fs(root, subdir, fs, url, stage)?))
            }),
        })
    }

    /// Substitute a filesystem adapter and the base url it resolves package
    /// paths under. Both always travel together.
    pub fn with_filesystem(
        mut self,
        fs: Arc<dyn MinimalFS>,
        channel_url: impl Into<String>,
    ) -> ChannelIndex {
        self.fs = fs;
        self.channel_url = channel_url.into();
        self
    }

    /// Substitute the cache storage engine.
    pub fn with_cache_factory(mut self, cache_factory: CacheFactory) -> ChannelIndex {
        self.cache_factory = cache_factory;
        self
    }

    pub fn config(&self) -> &ChannelIndexConfig {
        &self.config
    }

    pub fn channel_name(&self) -> String {
        self.config.channel_name.clone().unwrap_or_else(|| {
            self.config
                .channel_root
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
    }

    pub fn output_root(&self) -> &Path {
        self.config
            .output_root
            .as_deref()
            .unwrap_or(&self.config.channel_root)
    }

    fn threads(&self) -> usize {
        let threads = self.config.threads.unwrap_or_else(num_cpus::get).max(1);
        if cfg!(windows) {
            threads.min(48)
        } else {
            threads
        }
    }

    /// The subdirs this run covers: the caller's list, or a scan of the
    /// channel root against the known-subdir set, always including
    /// `noarch`.
    pub fn subdirs(&self) -> Result<Vec<String>, ChannelIndexError> {
        let mut subdirs: Vec<String> = match &self.config.subdirs {
            Some(subdirs) => subdirs.clone(),
            None => self
                .fs
                .listdir(&self.channel_url)
                .map(|entries| {
                    entries
                        .into_iter()
                        .map(|entry| entry.name)
                        .filter(|name| DEFAULT_SUBDIRS.contains(&name.as_str()))
                        .collect()
                })
                .unwrap_or_default(),
        };
        if !subdirs.iter().any(|subdir| subdir == "noarch") {
            subdirs.push("noarch".to_string());
        }
        subdirs.sort_unstable();
        subdirs.dedup();
        Ok(subdirs)
    }

    fn open_cache(&self, subdir: &str) -> Result<Box<dyn IndexCache>, CacheError> {
        (self.cache_factory)(
            &self.config.channel_root,
            subdir,
            Arc::clone(&self.fs),
            &self.channel_url,
            &self.config.upstream_stage,
        )
    }

    /// Index every subdir of the channel.
    ///
    /// `patch_generator` may point at a patch archive or a generator
    /// executable; see the patching documentation on
    /// [`ChannelIndexConfig`].
    pub fn index(&self, patch_generator: Option<&Path>) -> Result<(), ChannelIndexError> {
        let subdirs = self.subdirs()?;

        let mut lock_roots = vec![self.config.channel_root.as_path()];
        if self.output_root() != self.config.channel_root.as_path() {
            fs_err::create_dir_all(self.output_root())?;
            lock_roots.push(self.output_root());
        }
        let _locks = lock::acquire_channel_locks(&lock_roots, LOCK_TIMEOUT)?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads())
            .build()?;

        for subdir in &subdirs {
            fs_err::create_dir_all(self.config.channel_root.join(subdir))?;
            fs_err::create_dir_all(self.output_root().join(subdir))?;

            let mut cache = self.open_cache(subdir)?;
            cache.convert()?;

            if self.config.save_fs_state {
                self.save_fs_state(cache.as_mut(), subdir)?;
            }

            let changed = if self.config.deep_integrity_check {
                cache.observed_packages()?
            } else {
                cache.changed_packages()?
            };
            tracing::info!("{subdir}: {} packages to extract", changed.len());

            let extracted: usize = pool.install(|| {
                changed
                    .par_iter()
                    .map_init(
                        || None::<Box<dyn IndexCache>>,
                        |worker_cache, info| {
                            let cache = match worker_cache {
                                Some(cache) => cache,
                                None => match self.open_cache(subdir) {
                                    Ok(cache) => worker_cache.insert(cache),
                                    Err(e) => {
                                        tracing::error!("{subdir}: cannot open cache: {e}");
                                        return 0;
                                    }
                                },
                            };
                            match cache.extract_to_cache(info) {
                                Ok(_) => 1,
                                Err(e) => {
                                    // leave the package unindexed; it stays
                                    // changed for the next run
                                    tracing::error!("error extracting {}: {e}", info.path);
                                    0
                                }
                            }
                        },
                    )
                    .sum()
            });
            if extracted < changed.len() {
                tracing::warn!(
                    "{subdir}: {} of {} packages failed to extract",
                    changed.len() - extracted,
                    changed.len()
                );
            }

            self.index_prepared_subdir(subdir, cache.as_mut(), patch_generator)?;
        }
        Ok(())
    }

    fn save_fs_state(
        &self,
        cache: &mut dyn IndexCache,
        subdir: &str,
    ) -> Result<(), ChannelIndexError> {
        tracing::debug!("{subdir}: listdir");
        let subdir_url = self.fs.join(&[self.channel_url.as_str(), subdir]);
        let mut entries = Vec::new();
        for entry in self.fs.listdir(&subdir_url)? {
            if !is_package_file(&entry.name) {
                continue;
            }
            let (size, mtime) = match (entry.size, entry.mtime) {
                (Some(size), Some(mtime)) => (size, mtime),
                _ => {
                    let stat = self
                        .fs
                        .stat(&self.fs.join(&[subdir_url.as_str(), &entry.name]))?;
                    (stat.size, stat.mtime)
                }
            };
            entries.push(FileInfo {
                path: self.fs.basename(&entry.name),
                mtime: mtime as i64,
                size,
            });
        }
        tracing::debug!("{subdir}: save fs state ({} packages)", entries.len());
        cache.store_fs_state(&entries)?;
        Ok(())
    }
}

/// Index all subdirs under the configured channel root and rewrite the
/// channel summary, the common whole-channel entry point.
pub fn update_index(
    config: ChannelIndexConfig,
    patch_generator: Option<&Path>,
) -> Result<(), ChannelIndexError> {
    let index = ChannelIndex::new(config)?;
    index.index(patch_generator)?;
    index.update_channeldata()?;
    Ok(())
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn channel_root_must_not_be_a_subdir() {
        let dir = tempfile::tempdir().unwrap();
        let subdir_path = dir.path().join("linux-64");
        fs_err::create_dir_all(&subdir_path).unwrap();
        let result = ChannelIndex::new(ChannelIndexConfig::new(&subdir_path));
        assert_matches!(result, Err(ChannelIndexError::BadSubdirArgument(name)) if name == "linux-64");
    }

    #[test]
    fn subdir_discovery_filters_unknown_names_and_adds_noarch() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["linux-64", "osx-64", "not-a-subdir"] {
            fs_err::create_dir_all(dir.path().join(name)).unwrap();
        }
        let index = ChannelIndex::new(ChannelIndexConfig::new(dir.path())).unwrap();
        assert_eq!(index.subdirs().unwrap(), ["linux-64", "noarch", "osx-64"]);
    }

    #[test]
    fn explicit_subdirs_are_used_verbatim_plus_noarch() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ChannelIndexConfig::new(dir.path());
        config.subdirs = Some(vec!["osx-64".to_string()]);
        let index = ChannelIndex::new(config).unwrap();
        assert_eq!(index.subdirs().unwrap(), ["noarch", "osx-64"]);
    }

    #[test]
    fn channel_name_defaults_to_basename() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("my-channel");
        fs_err::create_dir_all(&root).unwrap();
        let index = ChannelIndex::new(ChannelIndexConfig::new(&root)).unwrap();
        assert_eq!(index.channel_name(), "my-channel");

        let mut config = ChannelIndexConfig::new(&root);
        config.channel_name = Some("public".to_string());
        let index = ChannelIndex::new(config).unwrap();
        assert_eq!(index.channel_name(), "public");
    }
}
