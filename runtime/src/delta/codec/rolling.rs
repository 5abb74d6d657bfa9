//! rsync-style weak rolling checksum.

/// Weak checksum over a sliding window.
///
/// `s1` accumulates the byte sum and `s2` the prefix sums; the digest keeps
/// the low 16 bits of each. Rolling by one byte is O(1).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RollingChecksum {
    s1: u32,
    s2: u32,
    len: usize,
}

impl RollingChecksum {
    pub const fn new() -> Self {
        Self {
            s1: 0,
            s2: 0,
            len: 0,
        }
    }

    pub fn reset(&mut self) {
        self.s1 = 0;
        self.s2 = 0;
        self.len = 0;
    }

    /// Number of bytes in the window.
    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append bytes to the window.
    #[inline]
    pub fn update(&mut self, chunk: &[u8]) {
        let mut s1 = self.s1;
        let mut s2 = self.s2;
        for &byte in chunk {
            s1 = s1.wrapping_add(u32::from(byte));
            s2 = s2.wrapping_add(s1);
        }
        self.s1 = s1;
        self.s2 = s2;
        self.len += chunk.len();
    }

    /// Slide the window one byte: drop `outgoing` from the front, append `incoming`.
    ///
    /// The window length is unchanged, so it must be non-empty.
    #[inline]
    pub fn roll(&mut self, outgoing: u8, incoming: u8) {
        debug_assert!(self.len > 0, "rolling an empty window");
        let out = u32::from(outgoing);
        self.s1 = self.s1.wrapping_sub(out).wrapping_add(u32::from(incoming));
        self.s2 = self
            .s2
            .wrapping_sub((self.len as u32).wrapping_mul(out))
            .wrapping_add(self.s1);
    }

    /// Packed 32-bit digest: `s2` in the high half, `s1` in the low half.
    #[inline]
    pub const fn digest(&self) -> u32 {
        ((self.s2 & 0xffff) << 16) | (self.s1 & 0xffff)
    }

    /// One-shot digest of a block.
    pub fn of(block: &[u8]) -> u32 {
        let mut sum = Self::new();
        sum.update(block);
        sum.digest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_digest_is_zero() {
        assert_eq!(RollingChecksum::new().digest(), 0);
        assert!(RollingChecksum::new().is_empty());
    }

    #[test]
    fn test_roll_matches_fresh_computation() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i * 31 % 251) as u8).collect();
        let window = 64;

        let mut rolling = RollingChecksum::new();
        rolling.update(&data[..window]);

        for start in 1..(data.len() - window) {
            rolling.roll(data[start - 1], data[start + window - 1]);
            assert_eq!(
                rolling.digest(),
                RollingChecksum::of(&data[start..start + window]),
                "mismatch at offset {}",
                start
            );
        }
    }

    #[test]
    fn test_roll_with_high_bytes_wraps_consistently() {
        let data = vec![0xffu8; 1024];
        let mut rolling = RollingChecksum::new();
        rolling.update(&data[..700]);
        for i in 700..1024 {
            rolling.roll(data[i - 700], data[i]);
        }
        assert_eq!(rolling.digest(), RollingChecksum::of(&data[324..1024]));
        assert_eq!(rolling.len(), 700);
    }

    #[test]
    fn test_reset() {
        let mut rolling = RollingChecksum::new();
        rolling.update(b"abc");
        rolling.reset();
        assert_eq!(rolling, RollingChecksum::new());
    }
}
