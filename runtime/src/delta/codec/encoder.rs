//! Patch encoding: scan the target against the source signature.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

use a3s_delta_core::error::{DeltaError, Result};
use a3s_delta_core::Digest;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use sha2::{Digest as _, Sha256};
use tokio_util::sync::CancellationToken;

use super::rolling::RollingChecksum;
use super::signature::Signature;
use super::{seal_body, varint, Patch, PatchHeader, PatchStats, CODEC_VERSION};
use super::{OP_COPY, OP_END, OP_LITERAL};

/// Target read buffer.
const READ_BUFFER_LEN: usize = 128 * 1024;

/// Literal runs longer than this are split into several ops.
const LITERAL_CHUNK: usize = 64 * 1024;

/// How often (in target bytes) the scan checks for cancellation.
const CANCEL_CHECK_INTERVAL: u64 = 1 << 20;

/// Buffers ops in target order, merging copies of contiguous source ranges.
struct OpWriter<W: Write> {
    out: W,
    pending_copy: Option<(u64, u64)>,
    literals: Vec<u8>,
    stats: PatchStats,
}

impl<W: Write> OpWriter<W> {
    fn new(out: W) -> Self {
        Self {
            out,
            pending_copy: None,
            literals: Vec::with_capacity(LITERAL_CHUNK),
            stats: PatchStats::default(),
        }
    }

    fn copy(&mut self, offset: u64, len: u64) -> io::Result<()> {
        self.flush_literals()?;
        self.stats.copy_bytes += len;
        match &mut self.pending_copy {
            Some((start, run)) if *start + *run == offset => {
                *run += len;
                Ok(())
            }
            _ => {
                self.flush_copy()?;
                self.pending_copy = Some((offset, len));
                Ok(())
            }
        }
    }

    fn literal(&mut self, byte: u8) -> io::Result<()> {
        self.flush_copy()?;
        self.literals.push(byte);
        if self.literals.len() >= LITERAL_CHUNK {
            self.flush_literals()?;
        }
        Ok(())
    }

    fn literal_slice(&mut self, mut bytes: &[u8]) -> io::Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.flush_copy()?;
        while !bytes.is_empty() {
            let room = LITERAL_CHUNK - self.literals.len();
            let take = room.min(bytes.len());
            self.literals.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
            if self.literals.len() >= LITERAL_CHUNK {
                self.flush_literals()?;
            }
        }
        Ok(())
    }

    fn flush_copy(&mut self) -> io::Result<()> {
        if let Some((offset, len)) = self.pending_copy.take() {
            self.out.write_all(&[OP_COPY])?;
            varint::write_u64(&mut self.out, offset)?;
            varint::write_u64(&mut self.out, len)?;
            self.stats.ops += 1;
        }
        Ok(())
    }

    fn flush_literals(&mut self) -> io::Result<()> {
        if self.literals.is_empty() {
            return Ok(());
        }
        self.out.write_all(&[OP_LITERAL])?;
        varint::write_u64(&mut self.out, self.literals.len() as u64)?;
        self.out.write_all(&self.literals)?;
        self.stats.literal_bytes += self.literals.len() as u64;
        self.stats.ops += 1;
        self.literals.clear();
        Ok(())
    }

    fn finish(mut self) -> io::Result<(W, PatchStats)> {
        self.flush_literals()?;
        self.flush_copy()?;
        self.out.write_all(&[OP_END])?;
        Ok((self.out, self.stats))
    }
}

/// Encode a patch turning `source` into `target`.
///
/// `source_len` only steers the block length when `block_len` is `None`; the
/// source digest always covers every byte actually read.
pub fn encode<S: Read, T: Read>(
    source: S,
    source_len: u64,
    target: T,
    block_len: u32,
    compression_level: u32,
    cancel: &CancellationToken,
) -> Result<(Patch, PatchStats)> {
    let signature = Signature::generate(source, block_len, cancel)?;
    if signature.source_len() != source_len {
        tracing::debug!(
            expected = source_len,
            actual = signature.source_len(),
            "Source length differs from the size hint"
        );
    }

    let sink = ZlibEncoder::new(Vec::new(), Compression::new(compression_level));
    let mut ops = OpWriter::new(sink);
    let (target_digest, target_size) = scan(&signature, target, &mut ops, cancel)?;
    let (sink, stats) = ops.finish()?;
    let compressed = sink.finish()?;

    let patch = Patch {
        header: PatchHeader {
            codec_version: CODEC_VERSION,
            source_digest: signature.source_digest().clone(),
            target_digest,
            target_size,
        },
        body: seal_body(compressed),
    };

    tracing::debug!(
        source = %patch.header.source_digest,
        target = %patch.header.target_digest,
        block_len = signature.block_len(),
        blocks = signature.block_count(),
        copy_bytes = stats.copy_bytes,
        literal_bytes = stats.literal_bytes,
        body_bytes = patch.body.len(),
        "Encoded layer patch"
    );

    Ok((patch, stats))
}

/// Stream the target through a rolling window, emitting copy and literal ops.
fn scan<T: Read, W: Write>(
    signature: &Signature,
    mut target: T,
    ops: &mut OpWriter<W>,
    cancel: &CancellationToken,
) -> Result<(Digest, u64)> {
    let block_len = signature.block_len();
    let can_match = signature.block_count() > 0;
    let mut window: VecDeque<u8> = VecDeque::with_capacity(block_len);
    let mut rolling = RollingChecksum::new();
    let mut outgoing: Option<u8> = None;
    let mut hasher = Sha256::new();
    let mut total = 0u64;
    let mut next_cancel_check = 0u64;
    let mut buffer = vec![0u8; READ_BUFFER_LEN];

    loop {
        if total >= next_cancel_check {
            if cancel.is_cancelled() {
                return Err(DeltaError::Cancelled);
            }
            next_cancel_check = total + CANCEL_CHECK_INTERVAL;
        }

        let n = match target.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        let chunk = &buffer[..n];
        hasher.update(chunk);
        total += n as u64;

        if !can_match {
            ops.literal_slice(chunk)?;
            continue;
        }

        for &byte in chunk {
            window.push_back(byte);
            match outgoing.take() {
                Some(out) => rolling.roll(out, byte),
                None => rolling.update(&[byte]),
            }

            if window.len() < block_len {
                continue;
            }

            let weak = rolling.digest();
            if signature.has_weak(weak) {
                if let Some(offset) = signature.find(weak, window.make_contiguous()) {
                    ops.copy(offset, block_len as u64)?;
                    window.clear();
                    rolling.reset();
                    continue;
                }
            }

            if let Some(front) = window.pop_front() {
                ops.literal(front)?;
                outgoing = Some(front);
            }
        }
    }

    let (head, tail) = window.as_slices();
    ops.literal_slice(head)?;
    ops.literal_slice(tail)?;

    Ok((Digest::from_sha256_bytes(hasher.finalize().into()), total))
}
