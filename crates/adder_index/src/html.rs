//! Deterministic HTML directory listings.

use std::fmt::Write as _;
use std::path::Path;

use adder_digest::{compute_file_digest, Md5, Sha256};
use adder_types::RepoData;
use serde_json::Value;

use crate::utils::{listing_time, maybe_write};
use crate::{ChannelIndex, ChannelIndexError};

/// Emitted files listed next to the packages, with fresh stat and digests.
const COMPANION_FILES: [&str; 7] = [
    "repodata.json",
    "repodata.json.bz2",
    "repodata.json.zst",
    "repodata_from_packages.json",
    "repodata_from_packages.json.bz2",
    "repodata_from_packages.json.zst",
    "patch_instructions.json",
];

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn page_open(title: &str) -> String {
    format!(
        "<html>\n<head>\n<title>{title}</title>\n</head>\n<body>\n<h1>{title}</h1>\n\
         <table>\n<tr><th>Filename</th><th>Size</th><th>Last Modified</th>\
         <th>SHA256</th><th>MD5</th></tr>\n",
        title = escape(title)
    )
}

const PAGE_CLOSE: &str = "</table>\n</body>\n</html>\n";

fn row(
    page: &mut String,
    name: &str,
    size: Option<u64>,
    mtime: Option<i64>,
    sha256: &str,
    md5: &str,
) {
    let _ = writeln!(
        page,
        "<tr><td><a href=\"{name}\">{name}</a></td><td>{size}</td><td>{mtime}</td>\
         <td>{sha256}</td><td>{md5}</td></tr>",
        name = escape(name),
        size = size.map(|s| s.to_string()).unwrap_or_default(),
        mtime = mtime.map(listing_time).unwrap_or_default(),
    );
}

impl ChannelIndex {
    /// Write the per-subdir listing: companion documents first, then every
    /// package of both dialects sorted by filename.
    pub(crate) fn write_subdir_html(
        &self,
        subdir: &str,
        repodata: &RepoData,
    ) -> Result<(), ChannelIndexError> {
        let output_dir = self.output_root().join(subdir);
        let mut page = page_open(&format!("{}/{subdir}", self.channel_name()));

        for companion in COMPANION_FILES {
            let path = output_dir.join(companion);
            if !path.is_file() {
                continue;
            }
            let (size, mtime, sha256, md5) = file_details(&path)?;
            row(
                &mut page,
                companion,
                Some(size),
                Some(mtime),
                &sha256,
                &md5,
            );
        }

        for (filename, record) in repodata.iter_records() {
            let field = |name: &str| {
                record
                    .get(name)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            row(
                &mut page,
                filename,
                record.get("size").and_then(Value::as_u64),
                None,
                &field("sha256"),
                &field("md5"),
            );
        }

        page.push_str(PAGE_CLOSE);
        maybe_write(&output_dir.join("index.html"), page.as_bytes())?;
        Ok(())
    }

    /// Write the channel-root listing of subdirs and channel-wide files.
    pub(crate) fn write_channel_root_html(
        &self,
        subdirs: &[String],
    ) -> Result<(), ChannelIndexError> {
        let mut page = format!(
            "<html>\n<head>\n<title>{title}</title>\n</head>\n<body>\n<h1>{title}</h1>\n<ul>\n",
            title = escape(&self.channel_name())
        );
        for subdir in subdirs {
            let _ = writeln!(
                page,
                "<li><a href=\"{subdir}/index.html\">{subdir}</a></li>",
                subdir = escape(subdir)
            );
        }
        for file in ["channeldata.json", "rss.xml"] {
            if self.output_root().join(file).is_file() {
                let _ = writeln!(page, "<li><a href=\"{file}\">{file}</a></li>");
            }
        }
        page.push_str("</ul>\n</body>\n</html>\n");
        maybe_write(&self.output_root().join("index.html"), page.as_bytes())?;
        Ok(())
    }
}

fn file_details(path: &Path) -> Result<(u64, i64, String, String), std::io::Error> {
    let metadata = fs_err::metadata(path)?;
    let mtime = metadata
        .modified()?
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0);
    let sha256 = hex::encode(compute_file_digest::<Sha256>(path)?);
    let md5 = hex::encode(compute_file_digest::<Md5>(path)?);
    Ok((metadata.len(), mtime, sha256, md5))
}
