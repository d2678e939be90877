//! Streaming readers for the two package container formats.
//!
//! Both dialects are exposed through [`stream_info`], which yields the
//! archive's interior members in archive order as tar entries. Consumers
//! iterate the entries, read the member bodies they want, and simply drop the
//! archive to terminate early; the underlying file is released immediately.

use std::io::{Read, Seek};

use adder_types::ArchiveType;
use thiserror::Error;

pub mod read;
pub mod seek;

/// An error that can occur while streaming a package archive.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("an io error occurred")]
    Io(#[from] std::io::Error),

    #[error("corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("unsupported package extension: {0}")]
    UnsupportedArchiveType(String),
}

/// A seekable byte source, the shape package archives are opened as.
pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

/// Streaming access to the metadata members of a package archive.
///
/// Wraps the underlying tar stream and yields only members under `info/`;
/// payload members of a dialect-T archive are skipped, not surfaced.
pub struct InfoStream<'a> {
    archive: tar::Archive<Box<dyn Read + 'a>>,
}

impl std::fmt::Debug for InfoStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfoStream").finish_non_exhaustive()
    }
}

impl<'a> InfoStream<'a> {
    /// Iterate `(header, reader)` pairs for the `info/` members in archive
    /// order. Dropping the iterator before exhaustion releases the
    /// underlying source.
    pub fn entries<'m>(
        &'m mut self,
    ) -> std::io::Result<
        impl Iterator<Item = std::io::Result<tar::Entry<'m, Box<dyn Read + 'a>>>> + 'm,
    > {
        Ok(self.archive.entries()?.filter(|entry| match entry {
            Ok(entry) => entry
                .path()
                .map(|path| is_info_member(&path.to_string_lossy()))
                .unwrap_or(true),
            // read errors must reach the caller
            Err(_) => true,
        }))
    }
}

/// Open the interior of a package archive for streaming, selecting the
/// container dialect from the filename extension.
///
/// Dialect T (`.tbz`) archives are read front to back; dialect C (`.cnd`)
/// archives have their interior metadata archive located by name and decoded
/// independently. Either way the returned stream yields only members under
/// `info/`, in archive order.
pub fn stream_info<'a, R: Read + Seek + 'a>(
    filename: &str,
    reader: R,
) -> Result<InfoStream<'a>, ExtractError> {
    let archive = match ArchiveType::try_from(filename) {
        Some(ArchiveType::Tbz) => read::stream_tbz(reader),
        Some(ArchiveType::Cnd) => seek::stream_cnd_info(reader)?,
        None => return Err(ExtractError::UnsupportedArchiveType(filename.to_string())),
    };
    Ok(InfoStream { archive })
}

/// True for member paths that belong to the metadata directory.
pub fn is_info_member(path: &str) -> bool {
    path.starts_with("info/")
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;
    use std::io::{Cursor, Write};

    use assert_matches::assert_matches;

    use super::*;

    /// Build a dialect-T archive with the given members.
    fn build_tbz(members: &[(&str, &[u8])]) -> Vec<u8> {
        let encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (path, body) in members {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *body).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    /// Build a dialect-C archive: an outer stored zip holding a zstd
    /// compressed tar of the info members next to an opaque payload member.
    fn build_cnd(name: &str, members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut info_tar = tar::Builder::new(Vec::new());
        for (path, body) in members {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            info_tar.append_data(&mut header, path, *body).unwrap();
        }
        let info_bytes = zstd::stream::encode_all(
            Cursor::new(info_tar.into_inner().unwrap()),
            0,
        )
        .unwrap();

        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        zip.start_file(format!("pkg-{name}.tar.zst"), options.clone())
            .unwrap();
        zip.write_all(b"payload").unwrap();
        zip.start_file(format!("info-{name}.tar.zst"), options)
            .unwrap();
        zip.write_all(&info_bytes).unwrap();
        zip.finish().unwrap().into_inner()
    }

    fn collect_members(mut stream: InfoStream<'_>) -> BTreeMap<String, Vec<u8>> {
        let mut members = BTreeMap::new();
        for entry in stream.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().to_string();
            let mut body = Vec::new();
            entry.read_to_end(&mut body).unwrap();
            members.insert(path, body);
        }
        members
    }

    #[test]
    fn tbz_stream_yields_only_info_members() {
        let bytes = build_tbz(&[
            ("info/index", br#"{"name": "a"}"#),
            ("lib/liba.so", b"\x7fELF"),
        ]);
        let stream = stream_info("a-1.0-0.tbz", Cursor::new(bytes)).unwrap();
        let members = collect_members(stream);
        assert_eq!(members["info/index"], br#"{"name": "a"}"#.to_vec());
        // payload members never surface
        assert!(!members.contains_key("lib/liba.so"));
        assert_eq!(members.len(), 1);
    }

    #[test]
    fn locates_cnd_info_archive_by_name() {
        let bytes = build_cnd("a-1.0-0", &[("info/index", br#"{"name": "a"}"#)]);
        let stream = stream_info("a-1.0-0.cnd", Cursor::new(bytes)).unwrap();
        let members = collect_members(stream);
        assert_eq!(members["info/index"], br#"{"name": "a"}"#.to_vec());
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let result = stream_info("a-1.0-0.tar.gz", Cursor::new(Vec::new()));
        assert_matches!(result, Err(ExtractError::UnsupportedArchiveType(_)));
    }

    #[test]
    fn corrupt_outer_framing_is_reported() {
        let result = stream_info("a-1.0-0.cnd", Cursor::new(b"not a zip".to_vec()));
        assert_matches!(result, Err(ExtractError::CorruptArchive(_)));
    }

    #[test]
    fn early_termination_releases_the_source() {
        let bytes = build_tbz(&[
            ("info/index", br#"{"name": "a"}"#),
            ("info/about", b"{}"),
            ("lib/liba.so", b"\x7fELF"),
        ]);
        let mut stream = stream_info("a-1.0-0.tbz", Cursor::new(bytes)).unwrap();
        let mut entries = stream.entries().unwrap();
        let first = entries.next().unwrap().unwrap();
        assert_eq!(
            first.path().unwrap().to_string_lossy().as_ref(),
            "info/index"
        );
        // dropping the iterator mid-archive must not panic or leak
        drop(entries);
    }
}
