//! Functions that enable streaming dialect-T packages from a reader.

use std::io::Read;

/// Stream a `.tbz` package: a bzip2 compressed tar, read front to back.
pub fn stream_tbz<'a, R: Read + 'a>(reader: R) -> tar::Archive<Box<dyn Read + 'a>> {
    tar::Archive::new(Box::new(bzip2::read::BzDecoder::new(reader)))
}
