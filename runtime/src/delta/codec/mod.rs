//! Binary patch codec for layer content.
//!
//! A patch turns one layer's raw bytes into another's. Encoding builds a
//! block signature of the source (weak rolling checksum plus truncated
//! SHA-256 per block), then streams the target through a rolling window and
//! emits `COPY offset len` for blocks found in the source and `LITERAL` runs
//! for everything else.
//!
//! ```text
//! body = sha256(ops_z) ‖ ops_z          ops_z = zlib(ops)
//! ops  = { 0x01 COPY  varint(offset) varint(len)
//!        | 0x02 LITERAL varint(len) bytes }* 0x00 END
//! ```
//!
//! Decoding is deterministic and refuses to report success unless the
//! reconstructed bytes hash to the header's target digest.

mod decoder;
mod encoder;
mod rolling;
mod signature;
mod varint;

use std::io::{Read, Seek, Write};

use a3s_delta_core::config::CodecConfig;
use a3s_delta_core::error::{DeltaError, Result};
use a3s_delta_core::Digest;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tokio_util::sync::CancellationToken;

pub use rolling::RollingChecksum;
pub use signature::{block_len_for, Signature};

/// Patch format version written by this build.
pub const CODEC_VERSION: u16 = 1;

const OP_END: u8 = 0x00;
const OP_COPY: u8 = 0x01;
const OP_LITERAL: u8 = 0x02;

const SEAL_LEN: usize = 32;

/// Preallocation cap when decoding into memory.
const MAX_PREALLOC: u64 = 256 * 1024 * 1024;

/// Fixed-size part of a patch, readable before the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchHeader {
    pub codec_version: u16,
    pub source_digest: Digest,
    pub target_digest: Digest,
    pub target_size: u64,
}

/// A patch valid only against the layer whose digest is `header.source_digest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    pub header: PatchHeader,
    pub body: Vec<u8>,
}

/// What the encoder found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchStats {
    pub copy_bytes: u64,
    pub literal_bytes: u64,
    pub ops: u64,
}

impl std::ops::AddAssign for PatchStats {
    fn add_assign(&mut self, other: Self) {
        self.copy_bytes += other.copy_bytes;
        self.literal_bytes += other.literal_bytes;
        self.ops += other.ops;
    }
}

fn seal_body(compressed: Vec<u8>) -> Vec<u8> {
    let mut body = Vec::with_capacity(SEAL_LEN + compressed.len());
    body.extend_from_slice(&Sha256::digest(&compressed));
    body.extend_from_slice(&compressed);
    body
}

fn open_body(body: &[u8]) -> Result<&[u8]> {
    if body.len() < SEAL_LEN {
        return Err(DeltaError::CorruptPatch(format!(
            "body of {} bytes is shorter than its seal",
            body.len()
        )));
    }
    let (seal, compressed) = body.split_at(SEAL_LEN);
    if Sha256::digest(compressed).as_slice() != seal {
        return Err(DeltaError::CorruptPatch("body seal does not match".to_string()));
    }
    Ok(compressed)
}

/// Patch encoder/decoder configured from [`CodecConfig`].
#[derive(Debug, Clone, Default)]
pub struct PatchCodec {
    config: CodecConfig,
}

impl PatchCodec {
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Encode a patch from streamed source and target content.
    ///
    /// `source_len` picks the block length when none is configured.
    pub fn encode<S: Read, T: Read>(
        &self,
        source: S,
        source_len: u64,
        target: T,
        cancel: &CancellationToken,
    ) -> Result<(Patch, PatchStats)> {
        let block_len = self
            .config
            .block_len
            .unwrap_or_else(|| block_len_for(source_len));
        encoder::encode(
            source,
            source_len,
            target,
            block_len,
            self.config.compression_level,
            cancel,
        )
    }

    /// Encode from in-memory buffers.
    pub fn encode_bytes(&self, source: &[u8], target: &[u8]) -> Result<Patch> {
        let (patch, _) = self.encode(
            source,
            source.len() as u64,
            target,
            &CancellationToken::new(),
        )?;
        Ok(patch)
    }

    /// Decode a patch into `out`, returning the number of bytes written.
    pub fn decode<S: Read + Seek, W: Write>(
        &self,
        patch: &Patch,
        source: S,
        out: W,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        decoder::decode(patch, source, out, cancel)
    }

    /// Decode into a buffer preallocated from the header's target size.
    pub fn decode_to_vec<S: Read + Seek>(
        &self,
        patch: &Patch,
        source: S,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(patch.header.target_size.min(MAX_PREALLOC) as usize);
        decoder::decode(patch, source, &mut out, cancel)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn noise(seed: u32, len: usize) -> Vec<u8> {
        let mut x = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
        (0..len)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                x as u8
            })
            .collect()
    }

    fn roundtrip(codec: &PatchCodec, source: &[u8], target: &[u8]) -> Patch {
        let patch = codec.encode_bytes(source, target).unwrap();
        let out = codec
            .decode_to_vec(&patch, Cursor::new(source), &CancellationToken::new())
            .unwrap();
        assert_eq!(out, target);
        patch
    }

    #[test]
    fn test_identical_content_is_one_copy_run() {
        let codec = PatchCodec::default();
        let data = noise(1, 700 * 300);
        let (patch, stats) = codec
            .encode(&data[..], data.len() as u64, &data[..], &CancellationToken::new())
            .unwrap();
        assert_eq!(stats.ops, 1);
        assert_eq!(stats.copy_bytes, data.len() as u64);
        assert!(patch.body.len() < 200);
        let out = codec
            .decode_to_vec(&patch, Cursor::new(&data), &CancellationToken::new())
            .unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_small_edit_in_the_middle() {
        let codec = PatchCodec::default();
        let source = noise(2, 300_000);
        let mut target = source.clone();
        target[150_000..150_100].copy_from_slice(&noise(3, 100));
        let patch = roundtrip(&codec, &source, &target);
        assert!(patch.body.len() < 5_000, "body was {} bytes", patch.body.len());
    }

    #[test]
    fn test_insertion_shifts_alignment() {
        let codec = PatchCodec::default();
        let source = noise(4, 300_000);
        let mut target = source[..100_003].to_vec();
        target.extend_from_slice(b"inserted bytes that shift every later block");
        target.extend_from_slice(&source[100_003..]);
        let patch = roundtrip(&codec, &source, &target);
        assert!(patch.body.len() < 5_000, "body was {} bytes", patch.body.len());
    }

    #[test]
    fn test_disjoint_content_is_all_literal() {
        let codec = PatchCodec::default();
        let source = noise(5, 50_000);
        let target = noise(6, 50_000);
        let (patch, stats) = codec
            .encode(&source[..], 50_000, &target[..], &CancellationToken::new())
            .unwrap();
        assert_eq!(stats.copy_bytes, 0);
        assert_eq!(stats.literal_bytes, 50_000);
        let out = codec
            .decode_to_vec(&patch, Cursor::new(&source), &CancellationToken::new())
            .unwrap();
        assert_eq!(out, target);
    }

    #[test]
    fn test_empty_source_and_empty_target() {
        let codec = PatchCodec::default();
        roundtrip(&codec, b"", b"brand new content");
        roundtrip(&codec, b"old content going away", b"");
        roundtrip(&codec, b"", b"");
    }

    #[test]
    fn test_header_records_digests_and_size() {
        let codec = PatchCodec::default();
        let patch = codec.encode_bytes(b"source", b"target!").unwrap();
        assert_eq!(patch.header.codec_version, CODEC_VERSION);
        assert_eq!(patch.header.source_digest, Digest::sha256(b"source"));
        assert_eq!(patch.header.target_digest, Digest::sha256(b"target!"));
        assert_eq!(patch.header.target_size, 7);
    }

    #[test]
    fn test_fixed_block_len_from_config() {
        let codec = PatchCodec::new(CodecConfig {
            block_len: Some(128),
            compression_level: 1,
        });
        let source = noise(7, 10_000);
        let mut target = source.clone();
        target[5_000] ^= 0xff;
        roundtrip(&codec, &source, &target);
    }

    #[test]
    fn test_wrong_source_is_rejected() {
        let codec = PatchCodec::default();
        let source = noise(8, 20_000);
        let patch = codec.encode_bytes(&source, &noise(9, 20_000)).unwrap();
        let mut other = source.clone();
        other[0] ^= 1;
        let err = codec
            .decode_to_vec(&patch, Cursor::new(other), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, DeltaError::SourceMismatch { .. }));
    }

    #[test]
    fn test_unknown_codec_version() {
        let codec = PatchCodec::default();
        let mut patch = codec.encode_bytes(b"a", b"b").unwrap();
        patch.header.codec_version = CODEC_VERSION + 1;
        let err = codec
            .decode_to_vec(&patch, Cursor::new(b"a"), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(
            err,
            DeltaError::CodecVersionMismatch { found: 2, supported: 1 }
        ));
    }

    #[test]
    fn test_every_mutated_body_byte_is_detected() {
        let codec = PatchCodec::default();
        let source = noise(10, 8_000);
        let mut target = source.clone();
        target[4_000..4_050].copy_from_slice(&noise(11, 50));
        let patch = codec.encode_bytes(&source, &target).unwrap();

        for i in 0..patch.body.len() {
            let mut bad = patch.clone();
            bad.body[i] ^= 0x5a;
            let err = codec
                .decode_to_vec(&bad, Cursor::new(&source), &CancellationToken::new())
                .unwrap_err();
            assert!(
                matches!(err, DeltaError::CorruptPatch(_)),
                "byte {} gave {:?}",
                i,
                err
            );
        }
    }

    #[test]
    fn test_wrong_target_digest_is_corrupt() {
        let codec = PatchCodec::default();
        let mut patch = codec.encode_bytes(b"abc", b"abd").unwrap();
        patch.header.target_digest = Digest::sha256(b"something else");
        let err = codec
            .decode_to_vec(&patch, Cursor::new(b"abc"), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, DeltaError::CorruptPatch(_)));
    }

    #[test]
    fn test_truncated_body_is_corrupt() {
        let codec = PatchCodec::default();
        let mut patch = codec.encode_bytes(b"abc", b"abd").unwrap();
        patch.body.truncate(10);
        let err = codec
            .decode_to_vec(&patch, Cursor::new(b"abc"), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, DeltaError::CorruptPatch(_)));
    }

    #[test]
    fn test_decode_is_deterministic() {
        let codec = PatchCodec::default();
        let source = noise(12, 30_000);
        let mut target = noise(13, 5_000);
        target.extend_from_slice(&source[1_000..20_000]);
        let patch = codec.encode_bytes(&source, &target).unwrap();
        let cancel = CancellationToken::new();
        let a = codec.decode_to_vec(&patch, Cursor::new(&source), &cancel).unwrap();
        let b = codec.decode_to_vec(&patch, Cursor::new(&source), &cancel).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_decode_observes_cancellation() {
        let codec = PatchCodec::default();
        let patch = codec.encode_bytes(b"abc", b"abcd").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = codec
            .decode_to_vec(&patch, Cursor::new(b"abc"), &cancel)
            .unwrap_err();
        assert!(matches!(err, DeltaError::Cancelled));
    }
}
