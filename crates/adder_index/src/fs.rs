//! Minimal filesystem abstraction.
//!
//! The indexer only needs `open`, `stat`, `listdir`, `join` and `basename`,
//! so remote object stores can substitute for the local disk by implementing
//! this trait. Abstract paths use `/` as the separator; times are POSIX
//! seconds and may be fractional.

use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use adder_package_streaming::ReadSeek;

/// Size and modification time of a file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FsStat {
    pub size: u64,
    pub mtime: f64,
}

/// A directory listing entry. `size`/`mtime` are carried when the listing
/// already knows them, sparing a `stat` per file.
#[derive(Debug, Clone, PartialEq)]
pub struct ListEntry {
    pub name: String,
    pub size: Option<u64>,
    pub mtime: Option<f64>,
}

/// A package filename plus the stat fingerprint used for change detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Bare filename within its subdir.
    pub path: String,
    /// Modification time in whole POSIX seconds.
    pub mtime: i64,
    pub size: u64,
}

/// Filesystem operations the indexer relies on.
pub trait MinimalFS: Send + Sync {
    /// Open a file as a seekable byte source.
    fn open(&self, path: &str) -> io::Result<Box<dyn ReadSeek>>;

    fn stat(&self, path: &str) -> io::Result<FsStat>;

    fn listdir(&self, path: &str) -> io::Result<Vec<ListEntry>>;

    fn join(&self, parts: &[&str]) -> String;

    fn basename(&self, path: &str) -> String {
        path.rsplit('/').next().unwrap_or(path).to_string()
    }
}

/// The local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFS;

impl MinimalFS for LocalFS {
    fn open(&self, path: &str) -> io::Result<Box<dyn ReadSeek>> {
        Ok(Box::new(fs_err::File::open(path)?))
    }

    fn stat(&self, path: &str) -> io::Result<FsStat> {
        let metadata = fs_err::metadata(path)?;
        Ok(FsStat {
            size: metadata.len(),
            mtime: system_time_to_posix(metadata.modified()?),
        })
    }

    fn listdir(&self, path: &str) -> io::Result<Vec<ListEntry>> {
        let mut entries = Vec::new();
        for entry in fs_err::read_dir(path)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            entries.push(ListEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: Some(metadata.len()),
                mtime: metadata.modified().ok().map(system_time_to_posix),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn join(&self, parts: &[&str]) -> String {
        let mut path = PathBuf::new();
        for part in parts {
            path.push(part);
        }
        path.to_string_lossy().into_owned()
    }

    fn basename(&self, path: &str) -> String {
        Path::new(path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string())
    }
}

fn system_time_to_posix(time: std::time::SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    #[test]
    fn local_fs_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFS;
        let file_path = fs.join(&[&dir.path().to_string_lossy(), "pkg-1.0-0.tbz"]);
        fs_err::File::create(&file_path)
            .unwrap()
            .write_all(b"archive bytes")
            .unwrap();

        let stat = fs.stat(&file_path).unwrap();
        assert_eq!(stat.size, 13);
        assert!(stat.mtime > 0.0);

        let listing = fs.listdir(&dir.path().to_string_lossy()).unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "pkg-1.0-0.tbz");
        assert_eq!(listing[0].size, Some(13));

        assert_eq!(fs.basename(&file_path), "pkg-1.0-0.tbz");

        let mut reader = fs.open(&file_path).unwrap();
        let mut contents = Vec::new();
        std::io::Read::read_to_end(&mut reader, &mut contents).unwrap();
        assert_eq!(contents, b"archive bytes");
    }
}
