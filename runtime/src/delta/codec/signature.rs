//! Block signature of a source layer.
//!
//! The source is read once, front to back, and reduced to one weak and one
//! strong checksum per block. Only the signature stays in memory while the
//! target is scanned.

use std::collections::HashMap;
use std::io::{self, Read};

use a3s_delta_core::config::MAX_BLOCK_LEN;
use a3s_delta_core::error::{DeltaError, Result};
use a3s_delta_core::Digest;
use sha2::{Digest as _, Sha256};
use tokio_util::sync::CancellationToken;

use super::rolling::RollingChecksum;

/// Block length used for small sources.
pub const DEFAULT_BLOCK_LEN: u32 = 700;

/// Bytes of SHA-256 kept per block.
pub const STRONG_LEN: usize = 16;

/// Pick a block length for a source of `source_len` bytes.
///
/// Fixed 700 bytes up to 700² bytes, then the square root rounded down to a
/// multiple of 8, capped at [`MAX_BLOCK_LEN`].
pub fn block_len_for(source_len: u64) -> u32 {
    let default = u64::from(DEFAULT_BLOCK_LEN);
    if source_len <= default * default {
        return DEFAULT_BLOCK_LEN;
    }
    let root = (source_len as f64).sqrt() as u64;
    let rounded = (root & !7).clamp(default, u64::from(MAX_BLOCK_LEN));
    rounded as u32
}

pub(crate) fn strong_sum(block: &[u8]) -> [u8; STRONG_LEN] {
    let full = Sha256::digest(block);
    let mut out = [0u8; STRONG_LEN];
    out.copy_from_slice(&full[..STRONG_LEN]);
    out
}

#[derive(Debug, Clone, Copy)]
struct BlockSum {
    strong: [u8; STRONG_LEN],
}

/// Signature of a source stream plus the digest of the whole stream.
#[derive(Debug)]
pub struct Signature {
    block_len: usize,
    blocks: Vec<BlockSum>,
    index: HashMap<u32, Vec<u32>>,
    source_digest: Digest,
    source_len: u64,
}

impl Signature {
    /// Read `source` to the end and build its signature.
    ///
    /// Only full blocks are indexed; a trailing partial block is hashed into
    /// the source digest but can never be matched.
    pub fn generate<R: Read>(
        mut source: R,
        block_len: u32,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let block_len = block_len as usize;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; block_len];
        let mut blocks = Vec::new();
        let mut index: HashMap<u32, Vec<u32>> = HashMap::new();
        let mut source_len = 0u64;

        loop {
            if cancel.is_cancelled() {
                return Err(DeltaError::Cancelled);
            }

            let filled = read_full(&mut source, &mut buf)?;
            if filled == 0 {
                break;
            }
            let chunk = &buf[..filled];
            hasher.update(chunk);
            source_len += filled as u64;

            if filled < block_len {
                break;
            }

            let weak = RollingChecksum::of(chunk);
            let block_index = u32::try_from(blocks.len()).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "source has too many blocks")
            })?;
            blocks.push(BlockSum {
                strong: strong_sum(chunk),
            });
            index.entry(weak).or_default().push(block_index);
        }

        Ok(Self {
            block_len,
            blocks,
            index,
            source_digest: Digest::from_sha256_bytes(hasher.finalize().into()),
            source_len,
        })
    }

    pub fn block_len(&self) -> usize {
        self.block_len
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn source_digest(&self) -> &Digest {
        &self.source_digest
    }

    pub fn source_len(&self) -> u64 {
        self.source_len
    }

    /// Whether any block shares this weak checksum.
    #[inline]
    pub fn has_weak(&self, weak: u32) -> bool {
        self.index.contains_key(&weak)
    }

    /// Find a source block equal to `window`, returning its byte offset.
    ///
    /// `window` must be exactly one block long. The strong sum is only
    /// computed when the weak checksum hits.
    pub fn find(&self, weak: u32, window: &[u8]) -> Option<u64> {
        let candidates = self.index.get(&weak)?;
        let strong = strong_sum(window);
        candidates
            .iter()
            .find(|&&i| self.blocks[i as usize].strong == strong)
            .map(|&i| u64::from(i) * self.block_len as u64)
    }
}

/// Fill `buf` as far as the reader allows, returning the byte count.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
