//! Content digests.
//!
//! Layers are addressed by their diffID and images by the digest of their
//! config bytes. Both use the `algorithm:hex` form.

use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::{DeltaError, Result};

/// Algorithm produced by the engine.
pub const SHA256: &str = "sha256";

/// A content digest in `algorithm:hex` form (e.g. `sha256:e3b0c4...`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: String,
    encoded: String,
}

impl Digest {
    /// Parse a digest string.
    ///
    /// The algorithm must be lowercase alphanumeric; the encoded part may use
    /// lowercase alphanumerics and dashes so descriptive test ids such as
    /// `faked:base-layer` are accepted. `sha256` digests must be 64 hex chars.
    pub fn parse(s: &str) -> Result<Self> {
        let (algorithm, encoded) = s
            .split_once(':')
            .ok_or_else(|| DeltaError::InvalidDigest(format!("missing ':' in '{}'", s)))?;

        if algorithm.is_empty()
            || !algorithm
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        {
            return Err(DeltaError::InvalidDigest(format!(
                "bad algorithm in '{}'",
                s
            )));
        }

        if encoded.is_empty()
            || !encoded
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(DeltaError::InvalidDigest(format!(
                "bad encoded part in '{}'",
                s
            )));
        }

        if algorithm == SHA256
            && (encoded.len() != 64 || !encoded.chars().all(|c| c.is_ascii_hexdigit()))
        {
            return Err(DeltaError::InvalidDigest(format!(
                "sha256 digest must be 64 hex characters: '{}'",
                s
            )));
        }

        Ok(Self {
            algorithm: algorithm.to_string(),
            encoded: encoded.to_string(),
        })
    }

    /// SHA-256 digest of a byte slice.
    pub fn sha256(data: &[u8]) -> Self {
        Self::from_sha256_bytes(Sha256::digest(data).into())
    }

    /// Build a digest from raw SHA-256 output.
    pub fn from_sha256_bytes(bytes: [u8; 32]) -> Self {
        Self {
            algorithm: SHA256.to_string(),
            encoded: hex::encode(bytes),
        }
    }

    /// SHA-256 digest of everything readable from `reader`, plus the byte count.
    pub fn sha256_reader<R: Read>(mut reader: R) -> io::Result<(Self, u64)> {
        let mut hasher = DigestWriter::new(io::sink());
        io::copy(&mut reader, &mut hasher)?;
        Ok(hasher.finish())
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    /// Short form for logs (first 12 characters of the encoded part).
    pub fn short(&self) -> &str {
        let end = self.encoded.len().min(12);
        &self.encoded[..end]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.encoded)
    }
}

impl FromStr for Digest {
    type Err = DeltaError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = DeltaError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.to_string()
    }
}

/// Writer adapter that hashes everything passing through it.
pub struct DigestWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> DigestWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Finish hashing and return the digest with the byte count.
    pub fn finish(self) -> (Digest, u64) {
        (
            Digest::from_sha256_bytes(self.hasher.finalize().into()),
            self.written,
        )
    }

    /// Finish hashing and hand back the wrapped writer as well.
    pub fn into_parts(self) -> (W, Digest, u64) {
        let digest = Digest::from_sha256_bytes(self.hasher.finalize().into());
        (self.inner, digest, self.written)
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str =
        "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_sha256_of_empty_input() {
        assert_eq!(Digest::sha256(b"").to_string(), EMPTY_SHA256);
    }

    #[test]
    fn test_parse_roundtrip() {
        let d = Digest::parse(EMPTY_SHA256).unwrap();
        assert_eq!(d.algorithm(), "sha256");
        assert_eq!(d.short(), "e3b0c44298fc");
        assert_eq!(d.to_string(), EMPTY_SHA256);
    }

    #[test]
    fn test_parse_faked_digest() {
        let d: Digest = "faked:my-fake-id-5".parse().unwrap();
        assert_eq!(d.algorithm(), "faked");
        assert_eq!(d.encoded(), "my-fake-id-5");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Digest::parse("nocolon").is_err());
        assert!(Digest::parse(":abc").is_err());
        assert!(Digest::parse("SHA256:abc").is_err());
        assert!(Digest::parse("sha256:abc").is_err());
        assert!(Digest::parse("faked:Upper").is_err());
    }

    #[test]
    fn test_reader_digest_matches_slice_digest() {
        let data = vec![7u8; 100_000];
        let (d, n) = Digest::sha256_reader(&data[..]).unwrap();
        assert_eq!(n, 100_000);
        assert_eq!(d, Digest::sha256(&data));
    }

    #[test]
    fn test_digest_writer_passes_bytes_through() {
        let mut w = DigestWriter::new(Vec::new());
        w.write_all(b"hello ").unwrap();
        w.write_all(b"world").unwrap();
        let (inner, d, n) = w.into_parts();
        assert_eq!(inner, b"hello world");
        assert_eq!(n, 11);
        assert_eq!(d, Digest::sha256(b"hello world"));
    }

    #[test]
    fn test_serde_as_string() {
        let d = Digest::sha256(b"x");
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"{}\"", d));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
        assert!(serde_json::from_str::<Digest>("\"bogus\"").is_err());
    }
}
