/// Rolling weak checksum over a fixed-size window.
///
/// Two 16-bit sums, both modulo 2^16:
/// - A: sum of all bytes in the window
/// - B: sum of (n - i) * byte[i], i.e. each byte weighted by its distance
///   from the end of the window
///
/// The digest is `A + 2^16 * B`. Because the modulus divides 2^32, all
/// arithmetic can use wrapping `u32` operations and mask at the end.
///
/// Sliding the window by one byte is O(1): only the byte leaving and the
/// byte entering are needed, never the window contents.
#[derive(Debug, Clone)]
pub struct RollingHash {
    a: u32,
    b: u32,
    window: u32,
}

const MODULUS_MASK: u32 = (1 << 16) - 1;

impl RollingHash {
    /// Initialize from a full window of data
    pub fn new(window: &[u8]) -> Self {
        let mut hash = Self {
            a: 0,
            b: 0,
            window: 0,
        };
        hash.reset(window);
        hash
    }

    /// Digest of a block, without keeping rolling state
    pub fn hash(data: &[u8]) -> u32 {
        Self::new(data).digest()
    }

    /// Recompute from scratch over a new window (non-rolling)
    pub fn reset(&mut self, window: &[u8]) {
        let n = window.len() as u32;
        let mut a: u32 = 0;
        let mut b: u32 = 0;
        for (i, &byte) in window.iter().enumerate() {
            a = a.wrapping_add(byte as u32);
            b = b.wrapping_add((n - i as u32).wrapping_mul(byte as u32));
        }
        self.a = a & MODULUS_MASK;
        self.b = b & MODULUS_MASK;
        self.window = n;
    }

    /// Slide the window one byte: `old_byte` leaves, `new_byte` enters.
    ///
    /// - A' = A - old + new
    /// - B' = B - n * old + A'
    pub fn roll(&mut self, old_byte: u8, new_byte: u8) {
        let old = old_byte as u32;
        let new = new_byte as u32;

        self.a = self.a.wrapping_sub(old).wrapping_add(new) & MODULUS_MASK;
        self.b = self
            .b
            .wrapping_sub(self.window.wrapping_mul(old))
            .wrapping_add(self.a)
            & MODULUS_MASK;
    }

    pub fn digest(&self) -> u32 {
        (self.b << 16) | self.a
    }
}
