//! LEB128 unsigned integers used by the patch op stream.

use std::io::{self, Read, Write};

/// Longest encoding of a `u64`.
pub const MAX_LEN: usize = 10;

pub fn write_u64<W: Write>(w: &mut W, mut value: u64) -> io::Result<()> {
    let mut buf = [0u8; MAX_LEN];
    let mut n = 0;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf[n] = byte;
            n += 1;
            break;
        }
        buf[n] = byte | 0x80;
        n += 1;
    }
    w.write_all(&buf[..n])
}

pub fn read_u64<R: Read>(r: &mut R) -> io::Result<u64> {
    let mut value = 0u64;
    for i in 0..MAX_LEN {
        let mut byte = [0u8; 1];
        r.read_exact(&mut byte)?;
        let bits = u64::from(byte[0] & 0x7f);
        if i == MAX_LEN - 1 && bits > 1 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "varint overflows u64"));
        }
        value |= bits << (7 * i);
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(io::Error::new(io::ErrorKind::InvalidData, "varint too long"))
}
