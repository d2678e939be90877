//! Data types shared by the adder channel-indexing crates: package archive
//! identity, the per-package record, the `repodata` document family, patch
//! instructions, shard documents, and the version/match-spec machinery used
//! to prune the "current" subset.

pub mod match_spec;
pub mod package;
pub mod repo_data;
pub mod version;

pub use match_spec::{MatchSpec, ParseMatchSpecError, VersionSpec};
pub use package::{is_package_file, ArchiveType, PACKAGE_EXTENSIONS};
pub use repo_data::patches::{
    apply_instructions, overlay, PatchInstructions, MAX_PATCH_INSTRUCTIONS_VERSION,
    REVOKED_SENTINEL,
};
pub use repo_data::sharded::{Shard, ShardedRepodata, ShardedSubdirInfo};
pub use repo_data::{Buckets, ChannelInfo, PackageRecord, RecordMap, RepoData};
