//! Patch decoding: replay the op stream against the source layer.

use std::io::{self, Read, Seek, SeekFrom, Write};

use a3s_delta_core::error::{DeltaError, Result};
use a3s_delta_core::{Digest, DigestWriter};
use flate2::read::ZlibDecoder;
use tokio_util::sync::CancellationToken;

use super::{open_body, varint, Patch, CODEC_VERSION};
use super::{OP_COPY, OP_END, OP_LITERAL};

const COPY_BUFFER_LEN: usize = 64 * 1024;

fn corrupt(what: impl std::fmt::Display) -> DeltaError {
    DeltaError::CorruptPatch(what.to_string())
}

/// Copy exactly `len` bytes from `reader` to `writer`.
///
/// Read failures (including a short read) go through `on_read`; write
/// failures surface as I/O errors.
fn pump<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    mut len: u64,
    buf: &mut [u8],
    on_read: impl Fn(io::Error) -> DeltaError,
) -> Result<()> {
    while len > 0 {
        let want = (buf.len() as u64).min(len) as usize;
        let n = match reader.read(&mut buf[..want]) {
            Ok(0) => {
                return Err(on_read(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended early",
                )))
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(on_read(e)),
        };
        writer.write_all(&buf[..n])?;
        len -= n as u64;
    }
    Ok(())
}

/// Reconstruct the target into `out`, returning the number of bytes written.
///
/// Checks run in this order: codec version, source digest, body seal, then
/// the reconstructed digest and size against the header.
pub fn decode<S: Read + Seek, W: Write>(
    patch: &Patch,
    mut source: S,
    out: W,
    cancel: &CancellationToken,
) -> Result<u64> {
    let header = &patch.header;
    if header.codec_version != CODEC_VERSION {
        return Err(DeltaError::CodecVersionMismatch {
            found: header.codec_version,
            supported: CODEC_VERSION,
        });
    }

    source.seek(SeekFrom::Start(0))?;
    let (actual, source_len) = Digest::sha256_reader(&mut source)?;
    if actual != header.source_digest {
        return Err(DeltaError::SourceMismatch {
            expected: header.source_digest.to_string(),
            actual: actual.to_string(),
        });
    }

    let compressed = open_body(&patch.body)?;
    let mut ops = ZlibDecoder::new(compressed);
    let mut out = DigestWriter::new(out);
    let mut buf = vec![0u8; COPY_BUFFER_LEN];

    loop {
        if cancel.is_cancelled() {
            return Err(DeltaError::Cancelled);
        }

        let mut op = [0u8; 1];
        ops.read_exact(&mut op).map_err(corrupt)?;
        match op[0] {
            OP_END => break,
            OP_COPY => {
                let offset = varint::read_u64(&mut ops).map_err(corrupt)?;
                let len = varint::read_u64(&mut ops).map_err(corrupt)?;
                check_room(out.written(), len, header.target_size)?;
                let end = offset.checked_add(len).ok_or_else(|| corrupt("copy range overflows"))?;
                if end > source_len {
                    return Err(corrupt(format!(
                        "copy {}..{} past end of source ({} bytes)",
                        offset, end, source_len
                    )));
                }
                source.seek(SeekFrom::Start(offset))?;
                pump(&mut source, &mut out, len, &mut buf, DeltaError::IoError)?;
            }
            OP_LITERAL => {
                let len = varint::read_u64(&mut ops).map_err(corrupt)?;
                check_room(out.written(), len, header.target_size)?;
                pump(&mut ops, &mut out, len, &mut buf, corrupt)?;
            }
            other => return Err(corrupt(format!("unknown op 0x{:02x}", other))),
        }
    }

    let mut rest = [0u8; 1];
    match ops.read(&mut rest) {
        Ok(0) => {}
        Ok(_) => return Err(corrupt("trailing data after end op")),
        Err(e) => return Err(corrupt(e)),
    }

    out.flush()?;
    let (_, digest, written) = out.into_parts();
    if written != header.target_size {
        return Err(corrupt(format!(
            "reconstructed {} bytes, header says {}",
            written, header.target_size
        )));
    }
    if digest != header.target_digest {
        return Err(corrupt(format!(
            "reconstructed digest {} does not match {}",
            digest, header.target_digest
        )));
    }

    Ok(written)
}

fn check_room(written: u64, len: u64, target_size: u64) -> Result<()> {
    match written.checked_add(len) {
        Some(total) if total <= target_size => Ok(()),
        _ => Err(corrupt(format!(
            "op of {} bytes overruns target size {}",
            len, target_size
        ))),
    }
}
