//! One-shot import of the legacy many-small-files cache layout into sqlite.
//!
//! The old cache kept one file per package per kind under
//! `.cache/{kind}/{basename}.json` (raw bytes for icons) plus a single
//! `.cache/stat.json`. A first-time open of a directory holding that layout
//! walks it and bulk-loads the tables in chunks, one transaction per chunk.

use std::path::Path;

use itertools::Itertools;
use rusqlite::{params, Connection};
use serde_json::Value;
use walkdir::WalkDir;

use super::CacheError;

/// Tables that hold one JSON blob per package.
pub const METADATA_TABLES: [&str; 5] =
    ["about", "index_json", "post_install", "recipe", "run_exports"];

/// packages x cache kinds = cache files per transaction
const CHUNK_SIZE: usize = 4096;

static PATH_INFO: lazy_regex::Lazy<lazy_regex::Regex> = lazy_regex::lazy_regex!(
    r"(?x)
    (?:^|/)
    (?:
        (?P<statjson>stat\.json)$
        |
        (?P<kind>index|about|recipe|run_exports|post_install|icon)
        /
        (?P<basename>[^/]+?)
        (?P<ext>\.\w+)$
    )"
);

/// True when `cache_dir` holds something the importer understands.
pub fn has_legacy_cache(cache_dir: &Path) -> bool {
    if cache_dir.join("stat.json").is_file() {
        return true;
    }
    ["index", "about", "recipe", "run_exports", "post_install", "icon"]
        .iter()
        .any(|kind| cache_dir.join(kind).is_dir())
}

struct LegacyEntry {
    kind: LegacyKind,
    bytes: Vec<u8>,
}

enum LegacyKind {
    Stat,
    Json { table: &'static str, path: String },
    Icon { path: String },
}

fn classify(cache_dir: &Path, full_path: &Path) -> Option<LegacyKind> {
    let relative = full_path.strip_prefix(cache_dir).ok()?;
    let posix = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    let captures = PATH_INFO.captures(&posix)?;

    if captures.name("statjson").is_some() {
        return Some(LegacyKind::Stat);
    }
    let kind = captures.name("kind")?.as_str();
    let basename = captures.name("basename")?.as_str().to_string();
    Some(match kind {
        "icon" => LegacyKind::Icon { path: basename },
        "index" => LegacyKind::Json {
            table: "index_json",
            path: basename,
        },
        "about" => LegacyKind::Json {
            table: "about",
            path: basename,
        },
        "recipe" => LegacyKind::Json {
            table: "recipe",
            path: basename,
        },
        "run_exports" => LegacyKind::Json {
            table: "run_exports",
            path: basename,
        },
        "post_install" => LegacyKind::Json {
            table: "post_install",
            path: basename,
        },
        _ => return None,
    })
}

/// Import the legacy cache at `cache_dir` into the database.
pub fn convert_cache(conn: &mut Connection, cache_dir: &Path) -> Result<(), CacheError> {
    let entries = WalkDir::new(cache_dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let kind = classify(cache_dir, entry.path())?;
            match fs_err::read(entry.path()) {
                Ok(bytes) => Some(LegacyEntry { kind, bytes }),
                Err(e) => {
                    tracing::warn!("could not read {}: {e}", entry.path().display());
                    None
                }
            }
        });

    // chunking stays lazy so huge legacy caches never sit in memory at once
    for (batch, chunk) in entries.chunks(CHUNK_SIZE).into_iter().enumerate() {
        tracing::info!("legacy import batch {batch}");
        load_chunk(conn, chunk)?;
    }
    Ok(())
}

fn load_chunk(
    conn: &mut Connection,
    chunk: impl Iterator<Item = LegacyEntry>,
) -> Result<(), CacheError> {
    let tx = conn.transaction()?;
    for entry in chunk {
        match entry.kind {
            LegacyKind::Stat => {
                let stats: Value = match serde_json::from_slice(&entry.bytes) {
                    Ok(value) => value,
                    Err(e) => {
                        tracing::warn!("unreadable legacy stat.json: {e}");
                        continue;
                    }
                };
                tx.execute("DELETE FROM stat WHERE stage = 'indexed'", [])?;
                let Some(stats) = stats.as_object() else {
                    continue;
                };
                for (path, stat) in stats {
                    tx.execute(
                        "INSERT OR REPLACE INTO stat (stage, path, mtime, size)
                         VALUES ('indexed', ?1, ?2, ?3)",
                        params![
                            path,
                            stat.get("mtime").and_then(Value::as_i64),
                            stat.get("size").and_then(Value::as_u64),
                        ],
                    )?;
                }
            }
            LegacyKind::Json { table, path } => {
                // malformed blobs are skipped, not fatal
                let value: Value = match serde_json::from_slice(&entry.bytes) {
                    Ok(value) => value,
                    Err(e) => {
                        tracing::warn!("not json in legacy {table}/{path}: {e}");
                        continue;
                    }
                };
                tx.execute(
                    &format!("INSERT OR IGNORE INTO {table} (path, {table}) VALUES (?1, ?2)"),
                    params![path, serde_json::to_string(&value)?],
                )?;
            }
            LegacyKind::Icon { path } => {
                tx.execute(
                    "INSERT OR IGNORE INTO icon (path, icon_blob) VALUES (?1, ?2)",
                    params![path, entry.bytes],
                )?;
            }
        }
    }
    tx.commit()?;
    Ok(())
}
