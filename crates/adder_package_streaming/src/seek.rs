//! Random-access helpers for dialect-C packages.

use std::io::{Cursor, Read, Seek};

use crate::ExtractError;

/// Locate the interior `info-*.tar.zst` member of a `.cnd` package and return
/// a tar archive decoding it.
///
/// The outer container is an uncompressed archive-of-archives; the metadata
/// archive is found by entry name and decoded independently of the (much
/// larger) payload archive. The member is buffered so the returned archive
/// does not borrow the outer reader.
pub fn stream_cnd_info<'a, R: Read + Seek + 'a>(
    reader: R,
) -> Result<tar::Archive<Box<dyn Read + 'a>>, ExtractError> {
    let mut outer = zip::ZipArchive::new(reader)
        .map_err(|e| ExtractError::CorruptArchive(format!("bad outer archive: {e}")))?;

    let info_name = outer
        .file_names()
        .find(|name| name.starts_with("info-") && name.ends_with(".tar.zst"))
        .map(String::from)
        .ok_or_else(|| ExtractError::CorruptArchive("no info archive member".to_string()))?;
    tracing::debug!("decoding interior archive {info_name}");

    let mut compressed = Vec::new();
    outer
        .by_name(&info_name)
        .map_err(|e| ExtractError::CorruptArchive(format!("unreadable {info_name}: {e}")))?
        .read_to_end(&mut compressed)?;

    let decoder = zstd::stream::read::Decoder::new(Cursor::new(compressed))
        .map_err(|e| ExtractError::CorruptArchive(format!("bad inner framing: {e}")))?;
    Ok(tar::Archive::new(Box::new(decoder)))
}
