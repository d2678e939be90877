//! Identification of package archives by filename.

/// The recognized package filename extensions, legacy format first.
pub const PACKAGE_EXTENSIONS: [&str; 2] = [".tbz", ".cnd"];

/// A tagged type for the two supported package container formats.
///
/// Filenames are otherwise treated as opaque strings; the extension alone
/// selects the archive dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveType {
    /// The legacy single-file compressed tar container (`.tbz`).
    Tbz,
    /// The newer archive-of-archives container (`.cnd`).
    Cnd,
}

impl ArchiveType {
    /// The file extension of this archive type, including the leading dot.
    pub fn extension(self) -> &'static str {
        match self {
            ArchiveType::Tbz => ".tbz",
            ArchiveType::Cnd => ".cnd",
        }
    }

    /// Determine the archive type from a filename, or `None` when the name
    /// does not carry a recognized extension.
    pub fn try_from(path: impl AsRef<str>) -> Option<ArchiveType> {
        Self::split_str(path.as_ref()).map(|(_, archive_type)| archive_type)
    }

    /// Split a filename into its stem and archive type.
    pub fn split_str(path: &str) -> Option<(&str, ArchiveType)> {
        if let Some(stem) = path.strip_suffix(".tbz") {
            Some((stem, ArchiveType::Tbz))
        } else {
            path.strip_suffix(".cnd")
                .map(|stem| (stem, ArchiveType::Cnd))
        }
    }

    /// Return the filename of the same package in the other container format.
    pub fn counterpart(path: &str) -> Option<String> {
        Self::split_str(path).map(|(stem, archive_type)| match archive_type {
            ArchiveType::Tbz => format!("{stem}.cnd"),
            ArchiveType::Cnd => format!("{stem}.tbz"),
        })
    }
}

/// Return true for filenames carrying one of the recognized extensions.
pub fn is_package_file(name: &str) -> bool {
    ArchiveType::try_from(name).is_some()
}
