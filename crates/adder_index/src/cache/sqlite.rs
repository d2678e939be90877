//! The reference cache store: one sqlite database per subdirectory, living
//! at `{subdir}/.cache/cache.db`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use adder_types::{ArchiveType, Buckets, RecordMap, Shard};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use super::{convert, CacheError, IndexCache, PackageMembers};
use crate::fs::{FileInfo, LocalFS, MinimalFS};

/// Highest schema version this build understands.
const SCHEMA_VERSION: i64 = 1;

const OBSERVED_STAGE: &str = "observed";
const INDEXED_STAGE: &str = "indexed";

/// Cache store backed by an embedded sqlite database.
///
/// The connection is opened lazily on first use so a handle can be created
/// cheaply on one thread and used on another; an open handle must not be
/// shared.
pub struct SqliteCache {
    channel_root: PathBuf,
    subdir: String,
    cache_dir: PathBuf,
    db_filename: PathBuf,
    cache_is_brand_new: bool,
    upstream_stage: String,
    fs: Arc<dyn MinimalFS>,
    channel_url: String,
    db: Option<Connection>,
}

impl SqliteCache {
    /// Open a cache for `{channel_root}/{subdir}` on the local filesystem.
    pub fn new(channel_root: &Path, subdir: &str) -> Result<SqliteCache, CacheError> {
        Self::with_fs(
            channel_root,
            subdir,
            Arc::new(LocalFS),
            channel_root.to_string_lossy().as_ref(),
            OBSERVED_STAGE,
        )
    }

    /// Open a cache that reads packages through the given filesystem
    /// adapter rooted at `channel_url`.
    pub fn with_fs(
        channel_root: &Path,
        subdir: &str,
        fs: Arc<dyn MinimalFS>,
        channel_url: &str,
        upstream_stage: &str,
    ) -> Result<SqliteCache, CacheError> {
        let cache_dir = channel_root.join(subdir).join(".cache");
        let db_filename = cache_dir.join("cache.db");
        let cache_is_brand_new = !db_filename.exists();
        fs_err::create_dir_all(&cache_dir)?;
        tracing::debug!(
            "cache for {}/{subdir}: db={} brand_new={cache_is_brand_new}",
            channel_root.display(),
            db_filename.display(),
        );
        Ok(SqliteCache {
            channel_root: channel_root.to_path_buf(),
            subdir: subdir.to_string(),
            cache_dir,
            db_filename,
            cache_is_brand_new,
            upstream_stage: upstream_stage.to_string(),
            fs,
            channel_url: channel_url.to_string(),
            db: None,
        })
    }

    fn db(&mut self) -> Result<&mut Connection, CacheError> {
        if self.db.is_none() {
            let conn = Connection::open(&self.db_filename)?;
            let _mode: String =
                conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
            create_schema(&conn)?;
            migrate(&conn)?;
            self.db = Some(conn);
        }
        Ok(self.db.as_mut().expect("connection was just opened"))
    }

    fn path_like(&self) -> String {
        format!("{}%", self.database_prefix())
    }
}

fn create_schema(conn: &Connection) -> Result<(), CacheError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS about (path TEXT PRIMARY KEY, about BLOB);
         CREATE TABLE IF NOT EXISTS index_json (path TEXT PRIMARY KEY, index_json BLOB);
         CREATE TABLE IF NOT EXISTS recipe (path TEXT PRIMARY KEY, recipe BLOB);
         CREATE TABLE IF NOT EXISTS run_exports (path TEXT PRIMARY KEY, run_exports BLOB);
         CREATE TABLE IF NOT EXISTS post_install (path TEXT PRIMARY KEY, post_install BLOB);
         CREATE TABLE IF NOT EXISTS icon (path TEXT PRIMARY KEY, icon_blob BLOB);
         CREATE TABLE IF NOT EXISTS stat (
             stage TEXT NOT NULL DEFAULT 'indexed',
             path TEXT NOT NULL,
             mtime NUMBER,
             size INTEGER,
             sha256 TEXT,
             md5 TEXT,
             last_modified TEXT,
             etag TEXT
         );
         CREATE UNIQUE INDEX IF NOT EXISTS idx_stat ON stat (path, stage);
         CREATE INDEX IF NOT EXISTS idx_stat_stage ON stat (stage, path);",
    )?;
    Ok(())
}

/// Bring an older database forward, inside a single transaction.
fn migrate(conn: &Connection) -> Result<(), CacheError> {
    let user_version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if user_version > SCHEMA_VERSION {
        return Err(CacheError::SchemaTooNew(user_version));
    }
    if user_version == SCHEMA_VERSION {
        return Ok(());
    }

    conn.execute_batch("BEGIN")?;
    let result = (|| -> Result<(), CacheError> {
        // version 0 databases may hold {channel}/{subdir}/{fn} keys; store
        // bare filenames instead
        for table in convert::METADATA_TABLES.iter().chain(["stat"].iter()) {
            let mut select = conn.prepare(&format!(
                "SELECT rowid, path FROM {table} WHERE INSTR(path, '/')"
            ))?;
            let rows: Vec<(i64, String)> = select
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<_, _>>()?;
            for (rowid, path) in rows {
                let bare = path.rsplit('/').next().unwrap_or(&path);
                conn.execute(
                    &format!("UPDATE OR IGNORE {table} SET path = ?1 WHERE rowid = ?2"),
                    params![bare, rowid],
                )?;
            }
        }
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(())
    })();
    match result {
        Ok(()) => conn.execute_batch("COMMIT")?,
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e);
        }
    }
    Ok(())
}

fn upsert_member(
    tx: &rusqlite::Transaction<'_>,
    table: &str,
    path: &str,
    data: Option<&str>,
) -> Result<(), CacheError> {
    match data {
        Some(data) => tx.execute(
            &format!("INSERT OR REPLACE INTO {table} (path, {table}) VALUES (?1, ?2)"),
            params![path, data],
        )?,
        None => tx.execute(&format!("DELETE FROM {table} WHERE path = ?1"), params![path])?,
    };
    Ok(())
}

impl IndexCache for SqliteCache {
    fn subdir(&self) -> &str {
        &self.subdir
    }

    fn channel_url(&self) -> &str {
        &self.channel_url
    }

    fn fs(&self) -> &dyn MinimalFS {
        self.fs.as_ref()
    }

    fn upstream_stage(&self) -> &str {
        &self.upstream_stage
    }

    fn convert(&mut self) -> Result<(), CacheError> {
        if !self.cache_is_brand_new {
            return Ok(());
        }
        let cache_dir = self.cache_dir.clone();
        if convert::has_legacy_cache(&cache_dir) {
            tracing::info!("{}: importing legacy cache", self.subdir);
            let conn = self.db()?;
            convert::convert_cache(conn, &cache_dir)?;
        }
        self.cache_is_brand_new = false;
        Ok(())
    }

    fn store_fs_state(&mut self, entries: &[FileInfo]) -> Result<(), CacheError> {
        let path_like = self.path_like();
        let rows: Vec<(String, i64, u64)> = entries
            .iter()
            .map(|entry| (self.database_path(&entry.path), entry.mtime, entry.size))
            .collect();
        let tx = self.db()?.transaction()?;
        // always the observed stage, never a custom upstream stage
        tx.execute(
            "DELETE FROM stat WHERE stage = ?1 AND path LIKE ?2",
            params![OBSERVED_STAGE, path_like],
        )?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO stat (stage, path, mtime, size) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (path, mtime, size) in &rows {
                insert.execute(params![OBSERVED_STAGE, path, mtime, size])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn changed_packages(&mut self) -> Result<Vec<FileInfo>, CacheError> {
        let path_like = self.path_like();
        let upstream_stage = self.upstream_stage.clone();
        let rows = {
            let conn = self.db()?;
            let mut query = conn.prepare(
                "WITH
             upstream AS
                 (SELECT path, mtime, size FROM stat WHERE stage = ?1),
             cached AS
                 (SELECT path, mtime, size FROM stat WHERE stage = ?2)
             SELECT upstream.path, upstream.mtime, upstream.size
             FROM upstream LEFT JOIN cached USING (path)
             WHERE upstream.path LIKE ?3
               AND (cached.path IS NULL
                    OR upstream.mtime != cached.mtime
                    OR upstream.size != cached.size)
             ORDER BY upstream.path",
            )?;
            let result = query
                .query_map(params![upstream_stage, INDEXED_STAGE, path_like], |row| {
                    Ok((row.get::<_, String>(0)?, row.get(1)?, row.get(2)?))
                })?
                .collect::<Result<Vec<(String, i64, u64)>, _>>()?;
            result
        };
        Ok(rows
            .into_iter()
            .map(|(path, mtime, size)| FileInfo {
                path: self.plain_path(&path).to_string(),
                mtime,
                size,
            })
            .collect())
    }

    fn observed_packages(&mut self) -> Result<Vec<FileInfo>, CacheError> {
        let path_like = self.path_like();
        let upstream_stage = self.upstream_stage.clone();
        let rows = {
            let conn = self.db()?;
            let mut query = conn.prepare(
                "SELECT path, mtime, size FROM stat
             WHERE stage = ?1 AND path LIKE ?2 ORDER BY path",
            )?;
            let result = query
                .query_map(params![upstream_stage, path_like], |row| {
                    Ok((row.get::<_, String>(0)?, row.get(1)?, row.get(2)?))
                })?
                .collect::<Result<Vec<(String, i64, u64)>, _>>()?;
            result
        };
        Ok(rows
            .into_iter()
            .map(|(path, mtime, size)| FileInfo {
                path: self.plain_path(&path).to_string(),
                mtime,
                size,
            })
            .collect())
    }

    fn store(
        &mut self,
        info: &FileInfo,
        members: &PackageMembers,
        record: &RecordMap,
    ) -> Result<(), CacheError> {
        let path = self.database_path(&info.path);
        let record_text = serde_json::to_string(record)?;
        let md5 = record.get("md5").and_then(Value::as_str).unwrap_or_default();
        let sha256 = record
            .get("sha256")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let tx = self.db()?.transaction()?;
        upsert_member(&tx, "about", &path, members.about.as_deref())?;
        upsert_member(&tx, "recipe", &path, members.recipe.as_deref())?;
        upsert_member(&tx, "run_exports", &path, members.run_exports.as_deref())?;
        upsert_member(&tx, "post_install", &path, Some(&members.post_install))?;
        match &members.icon {
            Some(icon) => tx.execute(
                "INSERT OR REPLACE INTO icon (path, icon_blob) VALUES (?1, ?2)",
                params![path, icon],
            )?,
            None => tx.execute("DELETE FROM icon WHERE path = ?1", params![path])?,
        };
        tx.execute(
            "INSERT OR REPLACE INTO index_json (path, index_json) VALUES (?1, ?2)",
            params![path, record_text],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO stat (stage, path, mtime, size, sha256, md5)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![INDEXED_STAGE, path, info.mtime, info.size, sha256, md5],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn load_all_from_cache(&mut self, filename: &str) -> Result<RecordMap, CacheError> {
        let path = self.database_path(filename);
        let package_url = self
            .fs
            .join(&[self.channel_url.as_str(), self.subdir.as_str(), filename]);

        let mtime: Option<i64> = {
            let conn = self.db()?;
            conn.query_row(
                "SELECT mtime FROM stat WHERE stage = ?1 AND path = ?2",
                params![INDEXED_STAGE, path],
                |row| row.get(0),
            )
            .optional()?
        };
        let mtime = match mtime {
            Some(mtime) => mtime,
            None => {
                tracing::warn!("{filename} has no indexed stat row");
                match self.fs.stat(&package_url) {
                    Ok(stat) => stat.mtime as i64,
                    Err(_) => {
                        tracing::warn!("{filename} not found while loading merged view");
                        return Ok(RecordMap::new());
                    }
                }
            }
        };

        // each join must be USING (path) or rows would cross join
        let conn = self.db()?;
        let row: Option<(String, Option<String>, Option<String>, Option<String>, Option<String>)> =
            conn.query_row(
                "SELECT index_json.index_json, about.about, post_install.post_install,
                        recipe.recipe, run_exports.run_exports
                 FROM index_json
                     LEFT JOIN about USING (path)
                     LEFT JOIN post_install USING (path)
                     LEFT JOIN recipe USING (path)
                     LEFT JOIN run_exports USING (path)
                 WHERE index_json.path = ?1",
                params![path],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()?;

        let mut data = RecordMap::new();
        let run_exports = match row {
            Some((index_json, about, post_install, recipe, run_exports)) => {
                // later sources clobber earlier ones
                for blob in [recipe, about, post_install, Some(index_json)]
                    .into_iter()
                    .flatten()
                {
                    if let Ok(Value::Object(map)) = serde_json::from_str(&blob) {
                        for (key, value) in map {
                            data.insert(key, value);
                        }
                    }
                }
                run_exports
                    .and_then(|text| serde_json::from_str(&text).ok())
                    .unwrap_or_else(|| Value::Object(RecordMap::new()))
            }
            None => Value::Object(RecordMap::new()),
        };

        data.insert("mtime".to_string(), Value::from(mtime));

        if let Some(Value::Object(source)) = data.get("source").cloned() {
            for (key, value) in source {
                data.insert(format!("source_{key}"), value);
            }
        }
        clear_newline_chars(&mut data, "description");
        clear_newline_chars(&mut data, "summary");

        data.insert("run_exports".to_string(), run_exports);
        Ok(data)
    }

    fn indexed_packages(&mut self) -> Result<(Buckets, Buckets), CacheError> {
        let mut packages = Buckets::new();
        let mut cnd_packages = Buckets::new();
        for (filename, record) in self.indexed_rows()? {
            match ArchiveType::try_from(&filename) {
                Some(ArchiveType::Tbz) => {
                    packages.insert(filename, record);
                }
                Some(ArchiveType::Cnd) => {
                    cnd_packages.insert(filename, record);
                }
                None => tracing::warn!("{filename} does not look like a package"),
            }
        }
        Ok((packages, cnd_packages))
    }

    fn indexed_shards(&mut self) -> Result<Vec<(String, Shard)>, CacheError> {
        let mut shards: std::collections::BTreeMap<String, Shard> = Default::default();
        for (filename, record) in self.indexed_rows()? {
            let Some(name) = record.get("name").and_then(Value::as_str) else {
                tracing::warn!("{filename} record has no name");
                continue;
            };
            let shard = shards.entry(name.to_string()).or_default();
            match ArchiveType::try_from(&filename) {
                Some(ArchiveType::Tbz) => {
                    shard.packages.insert(filename, record);
                }
                Some(ArchiveType::Cnd) => {
                    shard.cnd_packages.insert(filename, record);
                }
                None => tracing::warn!("{filename} does not look like a package"),
            }
        }
        Ok(shards.into_iter().collect())
    }

    fn run_exports(&mut self) -> Result<Vec<(String, Value)>, CacheError> {
        let path_like = self.path_like();
        let upstream_stage = self.upstream_stage.clone();
        let rows = {
            let conn = self.db()?;
            let mut query = conn.prepare(
                "SELECT stat.path, run_exports.run_exports
             FROM stat JOIN run_exports USING (path)
             WHERE stat.stage = ?1 AND stat.path LIKE ?2
             ORDER BY stat.path",
            )?;
            let result = query
                .query_map(params![upstream_stage, path_like], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<(String, String)>, _>>()?;
            result
        };
        let mut result = Vec::with_capacity(rows.len());
        for (path, text) in rows {
            result.push((
                self.plain_path(&path).to_string(),
                serde_json::from_str(&text)?,
            ));
        }
        Ok(result)
    }
}

impl SqliteCache {
    /// `(filename, record)` rows joined to the upstream stat stage, ordered
    /// by filename. Stale indexed rows for files no longer upstream are
    /// simply not returned.
    fn indexed_rows(&mut self) -> Result<Vec<(String, RecordMap)>, CacheError> {
        let path_like = self.path_like();
        let upstream_stage = self.upstream_stage.clone();
        let rows = {
            let conn = self.db()?;
            let mut query = conn.prepare(
                "SELECT stat.path, index_json.index_json
             FROM stat JOIN index_json USING (path)
             WHERE stat.stage = ?1 AND stat.path LIKE ?2
             ORDER BY stat.path",
            )?;
            let result = query
                .query_map(params![upstream_stage, path_like], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<(String, String)>, _>>()?;
            result
        };
        let mut result = Vec::with_capacity(rows.len());
        for (path, text) in rows {
            result.push((
                self.plain_path(&path).to_string(),
                serde_json::from_str(&text)?,
            ));
        }
        Ok(result)
    }

    /// Close the database connection; the handle reopens lazily when used
    /// again.
    pub fn close(&mut self) {
        self.db = None;
    }

    /// The channel root this cache was opened under.
    pub fn channel_root(&self) -> &Path {
        &self.channel_root
    }
}

fn clear_newline_chars(record: &mut RecordMap, field: &str) {
    let Some(value) = record.get(field) else {
        return;
    };
    let flattened = match value {
        Value::String(text) => Some(text.trim().replace('\n', " ")),
        // sometimes the field arrives as a list of lines
        Value::Array(parts) => Some(
            parts
                .iter()
                .filter_map(Value::as_str)
                .collect::<String>()
                .trim()
                .replace('\n', " "),
        ),
        _ => None,
    };
    if let Some(text) = flattened {
        record.insert(field.to_string(), Value::String(text));
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    fn record(name: &str, version: &str) -> RecordMap {
        let Value::Object(map) = json!({
            "name": name,
            "version": version,
            "build": "0",
            "build_number": 0,
            "depends": [],
            "md5": "aa",
            "sha256": "bb",
            "size": 10,
        }) else {
            unreachable!()
        };
        map
    }

    fn cache_in(dir: &Path) -> SqliteCache {
        fs_err::create_dir_all(dir.join("linux-64")).unwrap();
        SqliteCache::new(dir, "linux-64").unwrap()
    }

    #[test]
    fn change_detection_uses_mtime_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = cache_in(dir.path());

        let a = FileInfo {
            path: "a-1.0-0.tbz".to_string(),
            mtime: 100,
            size: 10,
        };
        let b = FileInfo {
            path: "b-1.0-0.tbz".to_string(),
            mtime: 100,
            size: 20,
        };
        cache.store_fs_state(&[a.clone(), b.clone()]).unwrap();

        // nothing indexed yet: everything is changed
        assert_eq!(cache.changed_packages().unwrap(), vec![a.clone(), b.clone()]);

        cache
            .store(&a, &PackageMembers::default(), &record("a", "1.0"))
            .unwrap();
        assert_eq!(cache.changed_packages().unwrap(), vec![b.clone()]);

        // touching the mtime re-queues the package
        let touched = FileInfo { mtime: 101, ..a };
        cache.store_fs_state(&[touched.clone(), b.clone()]).unwrap();
        assert_eq!(cache.changed_packages().unwrap(), vec![touched, b]);
    }

    #[test]
    fn deleted_files_disappear_from_indexed_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = cache_in(dir.path());

        let a = FileInfo {
            path: "a-1.0-0.tbz".to_string(),
            mtime: 100,
            size: 10,
        };
        cache.store_fs_state(&[a.clone()]).unwrap();
        cache
            .store(&a, &PackageMembers::default(), &record("a", "1.0"))
            .unwrap();
        let (packages, _) = cache.indexed_packages().unwrap();
        assert!(packages.contains_key("a-1.0-0.tbz"));

        // the file vanished from disk; its stale indexed row is ignored
        cache.store_fs_state(&[]).unwrap();
        let (packages, _) = cache.indexed_packages().unwrap();
        assert!(packages.is_empty());
    }

    #[test]
    fn merged_view_applies_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = cache_in(dir.path());

        let a = FileInfo {
            path: "a-1.0-0.tbz".to_string(),
            mtime: 100,
            size: 10,
        };
        cache.store_fs_state(&[a.clone()]).unwrap();
        let members = PackageMembers {
            about: Some(
                json!({"home": "https://example.invalid", "summary": "from about\nsecond line"})
                    .to_string(),
            ),
            recipe: Some(json!({"home": "overridden by about", "license": "MIT"}).to_string()),
            run_exports: None,
            post_install: json!({"binary_prefix": true}).to_string(),
            icon: None,
        };
        cache.store(&a, &members, &record("a", "1.0")).unwrap();

        let merged = cache.load_all_from_cache("a-1.0-0.tbz").unwrap();
        assert_eq!(merged["home"], json!("https://example.invalid"));
        assert_eq!(merged["license"], json!("MIT"));
        assert_eq!(merged["summary"], json!("from about second line"));
        assert_eq!(merged["binary_prefix"], json!(true));
        assert_eq!(merged["name"], json!("a"));
        assert_eq!(merged["run_exports"], json!({}));
        assert_eq!(merged["mtime"], json!(100));
    }

    #[test]
    fn missing_package_yields_empty_view() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = cache_in(dir.path());
        let merged = cache.load_all_from_cache("ghost-1.0-0.tbz").unwrap();
        assert!(merged.is_empty());
    }

    #[test]
    fn shards_group_by_name_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = cache_in(dir.path());

        let files = [
            ("zlib-1.0-0.tbz", "zlib", "1.0"),
            ("apr-2.0-0.cnd", "apr", "2.0"),
            ("apr-1.0-0.tbz", "apr", "1.0"),
        ];
        let infos: Vec<FileInfo> = files
            .iter()
            .map(|(path, _, _)| FileInfo {
                path: path.to_string(),
                mtime: 1,
                size: 1,
            })
            .collect();
        cache.store_fs_state(&infos).unwrap();
        for (info, (_, name, version)) in infos.iter().zip(files.iter()) {
            cache
                .store(info, &PackageMembers::default(), &record(name, version))
                .unwrap();
        }

        let shards = cache.indexed_shards().unwrap();
        let names: Vec<&str> = shards.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, ["apr", "zlib"]);
        let apr = &shards[0].1;
        assert!(apr.packages.contains_key("apr-1.0-0.tbz"));
        assert!(apr.cnd_packages.contains_key("apr-2.0-0.cnd"));
    }
}
