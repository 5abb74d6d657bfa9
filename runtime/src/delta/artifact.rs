//! Delta artifact framing.
//!
//! An artifact is a single forward-only stream:
//!
//! ```text
//! "A3SDELTA" u16:version
//! 0x4D u32:len manifest-json
//! 0x43 u32:len config-bytes
//! { 0x50 u16:codec str:source str:target u64:size u64:len body
//! | 0x46 str:digest u64:len bytes }*          one per blob entry, in order
//! 0x54 u32:entries [32]sha256(all preceding bytes)
//! ```
//!
//! Integers are big-endian; `str` is a u16 length followed by UTF-8. A stream
//! without a valid trailer is rejected, so a build that fails part-way never
//! produces something an applier would accept.

use std::io;

use a3s_delta_core::error::{DeltaError, Result};
use a3s_delta_core::{Digest, ImageId, Platform};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::codec::{Patch, PatchHeader};

pub const MAGIC: &[u8; 8] = b"A3SDELTA";
pub const FORMAT_VERSION: u16 = 1;

const FRAME_MANIFEST: u8 = 0x4D;
const FRAME_CONFIG: u8 = 0x43;
const FRAME_PATCH: u8 = 0x50;
const FRAME_FULL: u8 = 0x46;
const FRAME_TRAILER: u8 = 0x54;

const MAX_MANIFEST_LEN: u32 = 16 * 1024 * 1024;
const MAX_CONFIG_LEN: u32 = 16 * 1024 * 1024;
const CHUNK_LEN: usize = 64 * 1024;

/// One target layer as described in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ManifestEntry {
    /// Already present on the receiver; no blob follows.
    ReusedRef { digest: Digest },
    /// Reconstructed from `source` with the next PATCH frame.
    PatchBlob {
        digest: Digest,
        source: Digest,
        size: u64,
    },
    /// Carried whole in the next FULL frame.
    FullBlob { digest: Digest, size: u64 },
}

impl ManifestEntry {
    /// The target layer's diffID.
    pub fn digest(&self) -> &Digest {
        match self {
            ManifestEntry::ReusedRef { digest }
            | ManifestEntry::PatchBlob { digest, .. }
            | ManifestEntry::FullBlob { digest, .. } => digest,
        }
    }

    pub fn has_blob(&self) -> bool {
        !matches!(self, ManifestEntry::ReusedRef { .. })
    }
}

/// What the receiver needs to rebuild the target image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaManifest {
    pub base: ImageId,
    pub target: ImageId,
    pub platform: Platform,
    pub entries: Vec<ManifestEntry>,
}

impl DeltaManifest {
    pub fn diff_ids(&self) -> impl Iterator<Item = &Digest> {
        self.entries.iter().map(ManifestEntry::digest)
    }

    pub fn blob_count(&self) -> usize {
        self.entries.iter().filter(|e| e.has_blob()).count()
    }
}

/// A blob frame read back from an artifact.
#[derive(Debug)]
pub enum BlobFrame {
    Patch(Patch),
    Full { digest: Digest, data: Vec<u8> },
}

/// Size and digest of a completed artifact stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSummary {
    pub bytes: u64,
    pub digest: Digest,
}

fn truncated(e: io::Error, what: &str) -> DeltaError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        DeltaError::CorruptArtifact(format!("stream truncated in {}", what))
    } else {
        DeltaError::IoError(e)
    }
}

fn encode_str(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| DeltaError::SerializationError(format!("string too long: {} bytes", s.len())))?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Streams an artifact into an async sink while hashing it.
pub struct ArtifactWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
    entries: u32,
    full_remaining: u64,
}

impl<W: AsyncWrite + Unpin> ArtifactWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
            entries: 0,
            full_remaining: 0,
        }
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    async fn put(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes).await?;
        self.hasher.update(bytes);
        self.written += bytes.len() as u64;
        Ok(())
    }

    /// Magic, version, manifest and config frames.
    pub async fn write_header(&mut self, manifest: &DeltaManifest, config: &[u8]) -> Result<()> {
        let json = serde_json::to_vec(manifest)?;
        let manifest_len = u32::try_from(json.len())
            .ok()
            .filter(|len| *len <= MAX_MANIFEST_LEN)
            .ok_or_else(|| DeltaError::SerializationError("manifest too large".to_string()))?;
        let config_len = u32::try_from(config.len())
            .ok()
            .filter(|len| *len <= MAX_CONFIG_LEN)
            .ok_or_else(|| DeltaError::SerializationError("image config too large".to_string()))?;

        let mut head = Vec::with_capacity(MAGIC.len() + 2 + 5 + json.len() + 5);
        head.extend_from_slice(MAGIC);
        head.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
        head.push(FRAME_MANIFEST);
        head.extend_from_slice(&manifest_len.to_be_bytes());
        head.extend_from_slice(&json);
        head.push(FRAME_CONFIG);
        head.extend_from_slice(&config_len.to_be_bytes());
        self.put(&head).await?;
        self.put(config).await?;
        self.entries = manifest.entries.len() as u32;
        Ok(())
    }

    pub async fn write_patch(&mut self, patch: &Patch) -> Result<()> {
        let header = &patch.header;
        let mut frame = vec![FRAME_PATCH];
        frame.extend_from_slice(&header.codec_version.to_be_bytes());
        encode_str(&mut frame, &header.source_digest.to_string())?;
        encode_str(&mut frame, &header.target_digest.to_string())?;
        frame.extend_from_slice(&header.target_size.to_be_bytes());
        frame.extend_from_slice(&(patch.body.len() as u64).to_be_bytes());
        self.put(&frame).await?;
        self.put(&patch.body).await
    }

    /// Start a FULL frame; exactly `len` bytes must follow via [`write_chunk`](Self::write_chunk).
    pub async fn begin_full(&mut self, digest: &Digest, len: u64) -> Result<()> {
        let mut frame = vec![FRAME_FULL];
        encode_str(&mut frame, &digest.to_string())?;
        frame.extend_from_slice(&len.to_be_bytes());
        self.put(&frame).await?;
        self.full_remaining = len;
        Ok(())
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        if chunk.len() as u64 > self.full_remaining {
            return Err(DeltaError::StoreError(
                "layer content is longer than its recorded size".to_string(),
            ));
        }
        self.full_remaining -= chunk.len() as u64;
        self.put(chunk).await
    }

    /// Close a FULL frame, checking the declared length was honoured.
    pub fn end_full(&mut self) -> Result<()> {
        if self.full_remaining != 0 {
            return Err(DeltaError::StoreError(format!(
                "layer content is {} bytes shorter than its recorded size",
                self.full_remaining
            )));
        }
        Ok(())
    }

    /// Write the trailer and flush, returning the sink.
    pub async fn finish(mut self) -> Result<(W, ArtifactSummary)> {
        let seal = self.hasher.clone().finalize();
        let mut trailer = vec![FRAME_TRAILER];
        trailer.extend_from_slice(&self.entries.to_be_bytes());
        trailer.extend_from_slice(&seal);
        self.put(&trailer).await?;
        self.inner.flush().await?;

        let summary = ArtifactSummary {
            bytes: self.written,
            digest: Digest::from_sha256_bytes(self.hasher.finalize().into()),
        };
        Ok((self.inner, summary))
    }
}

/// Hashing reader shared by the frame parsers.
struct FrameReader<R> {
    inner: R,
    hasher: Sha256,
    read: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    async fn fill(&mut self, buf: &mut [u8], what: &str) -> Result<()> {
        self.inner
            .read_exact(buf)
            .await
            .map_err(|e| truncated(e, what))?;
        self.hasher.update(&*buf);
        self.read += buf.len() as u64;
        Ok(())
    }

    async fn array<const N: usize>(&mut self, what: &str) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.fill(&mut buf, what).await?;
        Ok(buf)
    }

    async fn u16(&mut self, what: &str) -> Result<u16> {
        Ok(u16::from_be_bytes(self.array(what).await?))
    }

    async fn u32(&mut self, what: &str) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array(what).await?))
    }

    async fn u64(&mut self, what: &str) -> Result<u64> {
        Ok(u64::from_be_bytes(self.array(what).await?))
    }

    /// Read `len` bytes without trusting `len` for preallocation.
    async fn bytes(&mut self, len: u64, what: &str) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len.min(CHUNK_LEN as u64) as usize);
        let mut chunk = vec![0u8; CHUNK_LEN];
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(CHUNK_LEN as u64) as usize;
            self.fill(&mut chunk[..n], what).await?;
            out.extend_from_slice(&chunk[..n]);
            remaining -= n as u64;
        }
        Ok(out)
    }

    async fn digest(&mut self, what: &str) -> Result<Digest> {
        let len = self.u16(what).await?;
        let raw = self.bytes(len as u64, what).await?;
        let s = String::from_utf8(raw)
            .map_err(|_| DeltaError::CorruptArtifact(format!("{} is not UTF-8", what)))?;
        Digest::parse(&s).map_err(|e| DeltaError::CorruptArtifact(format!("{}: {}", what, e)))
    }

    async fn expect_frame(&mut self, kind: u8, what: &str) -> Result<()> {
        let [found] = self.array::<1>(what).await?;
        if found != kind {
            return Err(DeltaError::CorruptArtifact(format!(
                "expected {} frame, found tag 0x{:02x}",
                what, found
            )));
        }
        Ok(())
    }

    /// Length-prefixed section bounded by `limit`.
    async fn section(&mut self, kind: u8, what: &str, limit: u32) -> Result<Vec<u8>> {
        self.expect_frame(kind, what).await?;
        let len = self.u32(what).await?;
        if len > limit {
            return Err(DeltaError::CorruptArtifact(format!(
                "{} length {} exceeds limit",
                what, len
            )));
        }
        self.bytes(len as u64, what).await
    }
}

/// Reads an artifact front to back, verifying the trailer at the end.
pub struct ArtifactReader<R> {
    frames: FrameReader<R>,
    manifest: DeltaManifest,
    config: Vec<u8>,
}

impl<R: AsyncRead + Unpin> ArtifactReader<R> {
    /// Read and validate everything up to the first blob frame.
    pub async fn open(inner: R) -> Result<Self> {
        let mut frames = FrameReader {
            inner,
            hasher: Sha256::new(),
            read: 0,
        };

        let magic = frames.array::<8>("magic").await?;
        if &magic != MAGIC {
            return Err(DeltaError::CorruptArtifact("not a delta artifact".to_string()));
        }
        let version = frames.u16("format version").await?;
        if version != FORMAT_VERSION {
            return Err(DeltaError::CorruptArtifact(format!(
                "unsupported artifact format version {} (supported: {})",
                version, FORMAT_VERSION
            )));
        }

        let json = frames
            .section(FRAME_MANIFEST, "manifest", MAX_MANIFEST_LEN)
            .await?;
        let manifest = serde_json::from_slice(&json)
            .map_err(|e| DeltaError::CorruptArtifact(format!("invalid manifest: {}", e)))?;
        let config = frames
            .section(FRAME_CONFIG, "config", MAX_CONFIG_LEN)
            .await?;

        Ok(Self {
            frames,
            manifest,
            config,
        })
    }

    pub fn manifest(&self) -> &DeltaManifest {
        &self.manifest
    }

    pub fn config(&self) -> &[u8] {
        &self.config
    }

    /// Read the next blob frame.
    pub async fn next_blob(&mut self) -> Result<BlobFrame> {
        let frames = &mut self.frames;
        let [kind] = frames.array::<1>("blob frame").await?;
        match kind {
            FRAME_PATCH => {
                let codec_version = frames.u16("patch header").await?;
                let source_digest = frames.digest("patch source digest").await?;
                let target_digest = frames.digest("patch target digest").await?;
                let target_size = frames.u64("patch header").await?;
                let body_len = frames.u64("patch header").await?;
                let body = frames.bytes(body_len, "patch body").await?;
                Ok(BlobFrame::Patch(Patch {
                    header: PatchHeader {
                        codec_version,
                        source_digest,
                        target_digest,
                        target_size,
                    },
                    body,
                }))
            }
            FRAME_FULL => {
                let digest = frames.digest("full blob digest").await?;
                let len = frames.u64("full blob length").await?;
                let data = frames.bytes(len, "full blob").await?;
                Ok(BlobFrame::Full { digest, data })
            }
            FRAME_TRAILER => Err(DeltaError::CorruptArtifact(
                "trailer reached before all blobs were read".to_string(),
            )),
            other => Err(DeltaError::CorruptArtifact(format!(
                "unknown frame tag 0x{:02x}",
                other
            ))),
        }
    }

    /// Read and verify the trailer; the stream must end right after it.
    pub async fn finish(self) -> Result<ArtifactSummary> {
        let mut frames = self.frames;
        let seal = frames.hasher.clone().finalize();
        frames.expect_frame(FRAME_TRAILER, "trailer").await?;
        let entries = frames.u32("trailer").await?;
        let recorded: [u8; 32] = frames.array("trailer").await?;

        if entries as usize != self.manifest.entries.len() {
            return Err(DeltaError::CorruptArtifact(format!(
                "trailer counts {} entries, manifest has {}",
                entries,
                self.manifest.entries.len()
            )));
        }
        if recorded.as_slice() != seal.as_slice() {
            return Err(DeltaError::CorruptArtifact(
                "artifact checksum does not match".to_string(),
            ));
        }

        let mut probe = [0u8; 1];
        if frames.inner.read(&mut probe).await? != 0 {
            return Err(DeltaError::CorruptArtifact(
                "unexpected data after trailer".to_string(),
            ));
        }

        Ok(ArtifactSummary {
            bytes: frames.read,
            digest: Digest::from_sha256_bytes(frames.hasher.finalize().into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::codec::PatchCodec;

    fn manifest(entries: Vec<ManifestEntry>) -> DeltaManifest {
        DeltaManifest {
            base: Digest::sha256(b"base"),
            target: Digest::sha256(b"target"),
            platform: Platform::new("linux", "amd64"),
            entries,
        }
    }

    async fn sample() -> (Vec<u8>, ArtifactSummary, Patch) {
        let source = b"the quick brown fox jumps over the lazy dog".repeat(40);
        let mut target = source.clone();
        target.extend_from_slice(b"and then some");
        let patch = PatchCodec::default().encode_bytes(&source, &target).unwrap();
        let full = b"full layer".to_vec();

        let m = manifest(vec![
            ManifestEntry::ReusedRef {
                digest: Digest::sha256(b"shared"),
            },
            ManifestEntry::PatchBlob {
                digest: patch.header.target_digest.clone(),
                source: patch.header.source_digest.clone(),
                size: target.len() as u64,
            },
            ManifestEntry::FullBlob {
                digest: Digest::sha256(&full),
                size: full.len() as u64,
            },
        ]);

        let mut writer = ArtifactWriter::new(Vec::new());
        writer.write_header(&m, b"{\"config\":1}").await.unwrap();
        writer.write_patch(&patch).await.unwrap();
        writer
            .begin_full(&Digest::sha256(&full), full.len() as u64)
            .await
            .unwrap();
        writer.write_chunk(&full[..4]).await.unwrap();
        writer.write_chunk(&full[4..]).await.unwrap();
        writer.end_full().unwrap();
        let (bytes, summary) = writer.finish().await.unwrap();
        (bytes, summary, patch)
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (bytes, summary, patch) = sample().await;
        assert_eq!(summary.bytes, bytes.len() as u64);
        assert_eq!(summary.digest, Digest::sha256(&bytes));

        let mut reader = ArtifactReader::open(bytes.as_slice()).await.unwrap();
        assert_eq!(reader.manifest().entries.len(), 3);
        assert_eq!(reader.manifest().blob_count(), 2);
        assert_eq!(reader.config(), b"{\"config\":1}");

        match reader.next_blob().await.unwrap() {
            BlobFrame::Patch(p) => assert_eq!(p, patch),
            other => panic!("expected patch, got {:?}", other),
        }
        match reader.next_blob().await.unwrap() {
            BlobFrame::Full { data, .. } => assert_eq!(data, b"full layer"),
            other => panic!("expected full blob, got {:?}", other),
        }
        let read_summary = reader.finish().await.unwrap();
        assert_eq!(read_summary, summary);
    }

    #[test]
    fn test_manifest_json_kinds() {
        let json = serde_json::to_value(ManifestEntry::PatchBlob {
            digest: Digest::parse("faked:new").unwrap(),
            source: Digest::parse("faked:old").unwrap(),
            size: 3,
        })
        .unwrap();
        assert_eq!(json["kind"], "patch-blob");
        assert_eq!(json["source"], "faked:old");
    }

    #[tokio::test]
    async fn test_rejects_bad_magic() {
        let err = ArtifactReader::open(&b"NOTDELTA\x00\x01"[..]).await.err().unwrap();
        assert!(matches!(err, DeltaError::CorruptArtifact(_)));
    }

    #[tokio::test]
    async fn test_every_truncation_is_rejected() {
        let (bytes, _, _) = sample().await;
        for cut in [0, 5, 12, 40, bytes.len() / 2, bytes.len() - 33, bytes.len() - 1] {
            let slice = &bytes[..cut];
            let result = async {
                let mut reader = ArtifactReader::open(slice).await?;
                reader.next_blob().await?;
                reader.next_blob().await?;
                reader.finish().await
            }
            .await;
            assert!(
                matches!(result, Err(DeltaError::CorruptArtifact(_))),
                "cut at {} gave {:?}",
                cut,
                result
            );
        }
    }

    #[tokio::test]
    async fn test_tampered_byte_fails_trailer() {
        let (mut bytes, _, _) = sample().await;
        let config_at = bytes
            .windows(b"config".len())
            .position(|w| w == b"config")
            .unwrap();
        bytes[config_at] ^= 0x20;

        let mut reader = ArtifactReader::open(bytes.as_slice()).await.unwrap();
        reader.next_blob().await.unwrap();
        reader.next_blob().await.unwrap();
        let err = reader.finish().await.unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[tokio::test]
    async fn test_trailing_garbage() {
        let (mut bytes, _, _) = sample().await;
        bytes.push(0);
        let mut reader = ArtifactReader::open(bytes.as_slice()).await.unwrap();
        reader.next_blob().await.unwrap();
        reader.next_blob().await.unwrap();
        assert!(reader.finish().await.is_err());
    }

    #[tokio::test]
    async fn test_full_frame_length_is_enforced() {
        let mut writer = ArtifactWriter::new(Vec::new());
        writer.write_header(&manifest(vec![]), b"{}").await.unwrap();
        writer.begin_full(&Digest::sha256(b"abc"), 3).await.unwrap();
        assert!(writer.write_chunk(b"abcd").await.is_err());
        writer.write_chunk(b"ab").await.unwrap();
        assert!(writer.end_full().is_err());
    }
}
