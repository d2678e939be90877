//! Discovery and application of patch instructions.
//!
//! Instructions come from, in order of preference: a patch archive whose
//! interior carries `info/{subdir}/patch_instructions.json`; a generator
//! executable driven over a pipe (the pre-patch document on stdin, the
//! instruction document on stdout, the subdir as the only argument); or the
//! subdir's own `patch_instructions.json`. Generated instructions are
//! round-tripped back to that file.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use adder_package_streaming::stream_info;
use adder_types::{ArchiveType, PatchInstructions, RepoData};

use crate::aggregate::PATCH_INSTRUCTIONS_JSON;
use crate::utils::maybe_write;
use crate::{ChannelIndex, ChannelIndexError};

/// Default generator filename looked up at the channel root.
pub(crate) const GEN_PATCH_NAME: &str = "gen_patch";

impl ChannelIndex {
    /// Resolve the instructions for a subdir. The boolean is true when they
    /// were read from the subdir's own `patch_instructions.json` (and must
    /// not be written back).
    pub(crate) fn load_patch_instructions(
        &self,
        subdir: &str,
        repodata: &RepoData,
        patch_generator: Option<&Path>,
    ) -> Result<(PatchInstructions, bool), ChannelIndexError> {
        if let Some(generator) = patch_generator {
            let name = generator
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            if ArchiveType::try_from(&name).is_some() {
                return Ok((load_instructions_archive(generator, subdir)?, false));
            }
            let document = serde_json::to_vec(repodata)?;
            return Ok((run_patch_generator(generator, subdir, &document)?, false));
        }

        let default_generator = self.config().channel_root.join(GEN_PATCH_NAME);
        if default_generator.is_file() {
            let document = serde_json::to_vec(repodata)?;
            return Ok((
                run_patch_generator(&default_generator, subdir, &document)?,
                false,
            ));
        }

        match self.read_patch_instructions(subdir)? {
            Some(instructions) => Ok((instructions, true)),
            None => Ok((PatchInstructions::default(), false)),
        }
    }

    pub(crate) fn read_patch_instructions(
        &self,
        subdir: &str,
    ) -> Result<Option<PatchInstructions>, ChannelIndexError> {
        let path = self.patch_instructions_path(subdir);
        if !path.is_file() {
            return Ok(None);
        }
        let contents = fs_err::read(&path)?;
        Ok(Some(serde_json::from_slice(&contents)?))
    }

    pub(crate) fn write_patch_instructions(
        &self,
        subdir: &str,
        instructions: &PatchInstructions,
    ) -> Result<(), ChannelIndexError> {
        let bytes = serde_json::to_vec_pretty(instructions)?;
        maybe_write(&self.patch_instructions_path(subdir), &bytes)?;
        Ok(())
    }

    fn patch_instructions_path(&self, subdir: &str) -> PathBuf {
        self.output_root().join(subdir).join(PATCH_INSTRUCTIONS_JSON)
    }
}

/// Read `info/{subdir}/patch_instructions.json` out of a patch archive.
pub(crate) fn load_instructions_archive(
    archive_path: &Path,
    subdir: &str,
) -> Result<PatchInstructions, ChannelIndexError> {
    let filename = archive_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let wanted = format!("info/{subdir}/{PATCH_INSTRUCTIONS_JSON}");

    let file = fs_err::File::open(archive_path)?;
    let mut stream = stream_info(&filename, file)?;
    for entry in stream.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_string_lossy() == wanted {
            let mut body = Vec::new();
            entry.read_to_end(&mut body)?;
            return Ok(serde_json::from_slice(&body)?);
        }
    }
    Err(ChannelIndexError::MissingPatchInstructions(format!(
        "{}: {wanted}",
        archive_path.display()
    )))
}

/// Drive a patch generator executable over a pipe.
pub(crate) fn run_patch_generator(
    generator: &Path,
    subdir: &str,
    document: &[u8],
) -> Result<PatchInstructions, ChannelIndexError> {
    let failure = |reason: String| ChannelIndexError::PatchGenerator {
        path: generator.to_path_buf(),
        reason,
    };

    let mut child = Command::new(generator)
        .arg(subdir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| failure(format!("could not spawn: {e}")))?;

    // feed stdin from a helper thread so a chatty generator cannot deadlock
    // the pipe pair
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| failure("stdin unavailable".to_string()))?;
    let document = document.to_vec();
    let feeder = std::thread::spawn(move || {
        let _ = stdin.write_all(&document);
    });

    let output = child
        .wait_with_output()
        .map_err(|e| failure(format!("did not run: {e}")))?;
    let _ = feeder.join();

    if !output.status.success() {
        return Err(failure(format!(
            "exit status {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    serde_json::from_slice(&output.stdout)
        .map_err(|e| failure(format!("generator produced malformed instructions: {e}")))
}

#[cfg(test)]
mod test {
    use adder_types::PatchInstructions;

    use super::*;

    #[cfg(unix)]
    fn write_script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(GEN_PATCH_NAME);
        fs_err::write(&path, body).unwrap();
        let mut permissions = fs_err::metadata(&path).unwrap().permissions();
        permissions.set_mode(0o755);
        fs_err::set_permissions(&path, permissions).unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn generator_subprocess_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "#!/bin/sh\ncat > /dev/null\nprintf '{\"revoke\": [\"a-1.0-0.tbz\"], \"patch_instructions_version\": 1}'\n",
        );
        let instructions = run_patch_generator(&script, "linux-64", b"{}").unwrap();
        assert_eq!(instructions.revoke, vec!["a-1.0-0.tbz"]);
        assert_eq!(instructions.patch_instructions_version, 1);
    }

    #[cfg(unix)]
    #[test]
    fn failing_generator_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "#!/bin/sh\necho boom >&2\nexit 3\n");
        let err = run_patch_generator(&script, "linux-64", b"{}").unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn malformed_generator_output_is_an_error() {
        // also covers the parse half of the pipe protocol without a shell
        let parsed: Result<PatchInstructions, _> = serde_json::from_slice(b"not json");
        assert!(parsed.is_err());
    }
}
