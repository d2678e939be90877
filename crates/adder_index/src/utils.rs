//! Small helpers shared across the indexing pipeline.

use std::io::{self, Write};
use std::path::Path;

use adder_digest::{compute_bytes_digest, compute_file_digest, Blake2b256};

/// The closed set of recognized architecture subdirectory names.
pub const DEFAULT_SUBDIRS: [&str; 14] = [
    "linux-32",
    "linux-64",
    "linux-aarch64",
    "linux-armv6l",
    "linux-armv7l",
    "linux-ppc64",
    "linux-ppc64le",
    "linux-s390x",
    "noarch",
    "osx-64",
    "osx-arm64",
    "win-32",
    "win-64",
    "win-arm64",
];

/// Timestamps beyond the year 9999 are taken to be milliseconds.
const MILLISECONDS_THRESHOLD: u64 = 253_402_300_799;

/// Normalize a record timestamp to whole seconds.
pub fn make_seconds(timestamp: u64) -> u64 {
    if timestamp > MILLISECONDS_THRESHOLD {
        timestamp / 1000
    } else {
        timestamp
    }
}

/// Write `content` to `path` atomically: temp file with a random suffix in
/// the same directory, fsync, rename into place.
pub fn atomic_write(path: &Path, content: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(content)?;
    // fsync where the platform supports it
    let _ = temp.as_file().sync_all();
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Write `content` to `path` unless the file already holds exactly those
/// bytes. Returns whether a write happened; an untouched file keeps its
/// mtime.
pub fn maybe_write(path: &Path, content: &[u8]) -> io::Result<bool> {
    if path.is_file()
        && fs_err::metadata(path)?.len() == content.len() as u64
        && compute_file_digest::<Blake2b256>(path)? == compute_bytes_digest::<Blake2b256>(content)
    {
        tracing::debug!("{} is unchanged", path.display());
        return Ok(false);
    }
    atomic_write(path, content)?;
    Ok(true)
}

/// Remove a file, treating "not found" as success.
pub fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs_err::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// RFC 822 date used by the syndication feed.
pub fn rfc822(seconds: i64) -> String {
    chrono::DateTime::from_timestamp(seconds, 0)
        .unwrap_or_default()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

/// Timestamp format used in the HTML listings.
pub fn listing_time(seconds: i64) -> String {
    chrono::DateTime::from_timestamp(seconds, 0)
        .unwrap_or_default()
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}
