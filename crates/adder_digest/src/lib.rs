//! A simple crate used by the adder crates to compute digests of byte streams.
//!
//! All functions read their input in a single linear pass with a large buffer.
//! Whole-archive checksums are computed on already-opened, seekable sources so
//! a package never has to be opened twice.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

use digest::{Digest, Output};
use thiserror::Error;

/// The MD5 hash function.
pub type Md5 = md5::Md5;

/// The SHA-256 hash function.
pub type Sha256 = sha2::Sha256;

/// Blake2b with a 256-bit output, used for cheap file equality checks.
pub type Blake2b256 = blake2::Blake2b<digest::consts::U32>;

const READ_BUFFER_SIZE: usize = 1 << 16;

/// Raised when an algorithm name does not refer to a supported hash function.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[error("unknown digest algorithm: {0}")]
pub struct UnknownAlgorithm(pub String);

/// The hash functions that [`compute_digests`] can run.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum DigestAlgorithm {
    Md5,
    Sha256,
    Blake2b256,
}

impl DigestAlgorithm {
    /// The canonical lowercase name of the algorithm.
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "md5",
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Blake2b256 => "blake2b256",
        }
    }
}

impl Display for DigestAlgorithm {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = UnknownAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "md5" => Ok(DigestAlgorithm::Md5),
            "sha256" => Ok(DigestAlgorithm::Sha256),
            "blake2b256" => Ok(DigestAlgorithm::Blake2b256),
            _ => Err(UnknownAlgorithm(s.to_string())),
        }
    }
}

enum Hasher {
    Md5(Md5),
    Sha256(Sha256),
    Blake2b256(Blake2b256),
}

impl Hasher {
    fn new(algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Md5 => Hasher::Md5(Md5::new()),
            DigestAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            DigestAlgorithm::Blake2b256 => Hasher::Blake2b256(Blake2b256::new()),
        }
    }

    fn update(&mut self, bytes: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(bytes),
            Hasher::Sha256(h) => h.update(bytes),
            Hasher::Blake2b256(h) => h.update(bytes),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Hasher::Md5(h) => hex::encode(h.finalize()),
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Blake2b256(h) => hex::encode(h.finalize()),
        }
    }
}

/// Compute several digests of `reader` in a single pass.
///
/// Every requested algorithm owns its own hasher state; the input is read
/// once. Returns a map from algorithm to lowercase hex digest.
pub fn compute_digests(
    mut reader: impl Read,
    algorithms: &[DigestAlgorithm],
) -> io::Result<BTreeMap<DigestAlgorithm, String>> {
    let mut hashers: Vec<(DigestAlgorithm, Hasher)> = algorithms
        .iter()
        .map(|&algorithm| (algorithm, Hasher::new(algorithm)))
        .collect();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        for (_, hasher) in &mut hashers {
            hasher.update(&buffer[..n]);
        }
    }
    Ok(hashers
        .into_iter()
        .map(|(algorithm, hasher)| (algorithm, hasher.finalize_hex()))
        .collect())
}

/// Parse algorithm names and compute the corresponding digests in one pass.
pub fn compute_named_digests(
    reader: impl Read,
    names: &[&str],
) -> Result<BTreeMap<DigestAlgorithm, String>, DigestError> {
    let algorithms = names
        .iter()
        .map(|name| name.parse())
        .collect::<Result<Vec<_>, _>>()?;
    Ok(compute_digests(reader, &algorithms)?)
}

/// An error that can occur when computing named digests.
#[derive(Debug, Error)]
pub enum DigestError {
    #[error(transparent)]
    UnknownAlgorithm(#[from] UnknownAlgorithm),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Compute the digest of an in-memory byte slice.
pub fn compute_bytes_digest<D: Digest>(bytes: impl AsRef<[u8]>) -> Output<D> {
    let mut hasher = D::new();
    hasher.update(bytes.as_ref());
    hasher.finalize()
}

/// Compute the digest of the file at `path`.
pub fn compute_file_digest<D: Digest>(path: impl AsRef<Path>) -> io::Result<Output<D>> {
    let mut file = fs_err::File::open(path.as_ref())?;
    compute_reader_digest::<D>(&mut file)
}

/// Compute the digest of everything remaining in `reader`.
pub fn compute_reader_digest<D: Digest>(reader: &mut impl Read) -> io::Result<Output<D>> {
    let mut hasher = D::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize())
}

/// Return true if the two files have identical contents.
///
/// Sizes are compared first; equal-sized files are compared by Blake2b digest.
pub fn file_contents_match(a: impl AsRef<Path>, b: impl AsRef<Path>) -> io::Result<bool> {
    let (a, b) = (a.as_ref(), b.as_ref());
    if fs_err::metadata(a)?.len() != fs_err::metadata(b)?.len() {
        return Ok(false);
    }
    Ok(compute_file_digest::<Blake2b256>(a)? == compute_file_digest::<Blake2b256>(b)?)
}

#[cfg(test)]
mod test {
    use std::io::Cursor;
    use std::io::Write;

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("md5", DigestAlgorithm::Md5)]
    #[case("sha256", DigestAlgorithm::Sha256)]
    #[case("blake2b256", DigestAlgorithm::Blake2b256)]
    fn parse_algorithm(#[case] name: &str, #[case] expected: DigestAlgorithm) {
        assert_eq!(name.parse::<DigestAlgorithm>().unwrap(), expected);
        assert_eq!(expected.to_string(), name);
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        let err = "crc32".parse::<DigestAlgorithm>().unwrap_err();
        assert_eq!(err, UnknownAlgorithm("crc32".to_string()));
    }

    #[test]
    fn digests_in_one_pass() {
        let digests = compute_digests(
            Cursor::new(b"some data for testing"),
            &[DigestAlgorithm::Md5, DigestAlgorithm::Sha256],
        )
        .unwrap();
        assert_eq!(
            digests[&DigestAlgorithm::Md5],
            "83b2be1667392c681f926237b4bddb65"
        );
        assert_eq!(
            digests[&DigestAlgorithm::Sha256],
            "8461f99b1c7dd5ccbdc954cd757c3cc8faf556df849355549b6ac7c55272ce61"
        );
    }

    #[test]
    fn bytes_digest_matches_reader_digest() {
        let bytes = vec![7u8; 1 << 18];
        let from_bytes = compute_bytes_digest::<Sha256>(&bytes);
        let from_reader = compute_reader_digest::<Sha256>(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(from_bytes, from_reader);
    }

    #[test]
    fn contents_match_ignores_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let c = dir.path().join("c");
        for path in [&a, &b] {
            let mut file = fs_err::File::create(path).unwrap();
            file.write_all(b"identical contents").unwrap();
        }
        fs_err::File::create(&c)
            .unwrap()
            .write_all(b"different contents!")
            .unwrap();

        assert!(file_contents_match(&a, &b).unwrap());
        assert!(!file_contents_match(&a, &c).unwrap());
    }
}
