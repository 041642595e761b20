//! Arithmetic in the prime field of order `p = 2^128 - 159`.
//!
//! Elements serialize to exactly [`BLOCK_SIZE`] little-endian bytes, so every 16-byte block
//! of a message, key or mask can be read as one field element.

use std::{
    fmt,
    iter::Sum,
    ops::{Add, AddAssign, Mul, MulAssign, Neg, Sub, SubAssign},
};

use rand::{CryptoRng, Rng};
use serde::{Deserialize, Serialize};

/// The size of a serialized field element in bytes.
pub const BLOCK_SIZE: usize = 16;

/// `2^128 - P`.
const C: u128 = 159;

/// The field modulus, the largest prime below `2^128`.
pub const P: u128 = u128::MAX - C + 1;

const LO_MASK: u128 = u64::MAX as u128;

/// An element of the prime field of order [`P`], always kept in canonical form.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fp(u128);

impl Fp {
    /// The additive identity.
    pub const ZERO: Fp = Fp(0);
    /// The multiplicative identity.
    pub const ONE: Fp = Fp(1);

    /// Reduces an arbitrary `u128` into the field.
    pub const fn new(value: u128) -> Self {
        if value >= P { Fp(value - P) } else { Fp(value) }
    }

    /// Samples a uniformly random element.
    pub fn random(rng: &mut impl CryptoRng) -> Self {
        loop {
            let candidate: u128 = rng.random();
            if candidate < P {
                return Fp(candidate);
            }
        }
    }

    /// Reads a block, reducing it mod `p` if the encoding is not canonical.
    pub fn from_bytes(bytes: &[u8; BLOCK_SIZE]) -> Self {
        Fp::new(u128::from_le_bytes(*bytes))
    }

    /// Reads a block, returning `None` if it does not encode a value below `p`.
    pub fn from_canonical_bytes(bytes: &[u8; BLOCK_SIZE]) -> Option<Self> {
        let value = u128::from_le_bytes(*bytes);
        (value < P).then_some(Fp(value))
    }

    /// Reads the element stored in the block at `index` of a block-aligned buffer.
    ///
    /// Panics if the block is out of bounds.
    #[inline]
    pub fn read(buf: &[u8], index: usize) -> Self {
        let mut block = [0; BLOCK_SIZE];
        block.copy_from_slice(&buf[index * BLOCK_SIZE..(index + 1) * BLOCK_SIZE]);
        Fp::from_bytes(&block)
    }

    /// Writes the element into the block at `index` of a block-aligned buffer.
    ///
    /// Panics if the block is out of bounds.
    #[inline]
    pub fn write(self, buf: &mut [u8], index: usize) {
        buf[index * BLOCK_SIZE..(index + 1) * BLOCK_SIZE].copy_from_slice(&self.to_bytes());
    }

    /// The canonical 16-byte little-endian encoding.
    pub fn to_bytes(self) -> [u8; BLOCK_SIZE] {
        self.0.to_le_bytes()
    }

    /// Returns `true` for the additive identity.
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// The canonical integer representative.
    pub fn value(self) -> u128 {
        self.0
    }
}

impl fmt::Debug for Fp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fp({:#034x})", self.0)
    }
}

impl From<u64> for Fp {
    fn from(value: u64) -> Self {
        Fp(value as u128)
    }
}

/// Full 128 x 128 -> 256 bit multiplication, returned as `(hi, lo)`.
#[inline]
fn mul_wide(a: u128, b: u128) -> (u128, u128) {
    let (a1, a0) = (a >> 64, a & LO_MASK);
    let (b1, b0) = (b >> 64, b & LO_MASK);
    let p00 = a0 * b0;
    let p01 = a0 * b1;
    let p10 = a1 * b0;
    let p11 = a1 * b1;
    let mid = (p00 >> 64) + (p01 & LO_MASK) + (p10 & LO_MASK);
    let lo = (p00 & LO_MASK) | (mid << 64);
    let hi = p11 + (p01 >> 64) + (p10 >> 64) + (mid >> 64);
    (hi, lo)
}

/// Reduces `hi * 2^128 + lo` mod `p`, using `2^128 = C (mod p)`.
#[inline]
fn reduce_wide(mut hi: u128, mut lo: u128) -> u128 {
    while hi != 0 {
        let (h, l) = mul_wide(hi, C);
        let (l, carry) = l.overflowing_add(lo);
        hi = h + carry as u128;
        lo = l;
    }
    if lo >= P { lo - P } else { lo }
}

impl Add for Fp {
    type Output = Fp;

    #[inline]
    fn add(self, rhs: Fp) -> Fp {
        let (sum, overflow) = self.0.overflowing_add(rhs.0);
        if overflow {
            Fp(sum + C)
        } else {
            Fp::new(sum)
        }
    }
}

impl Sub for Fp {
    type Output = Fp;

    #[inline]
    fn sub(self, rhs: Fp) -> Fp {
        if self.0 >= rhs.0 {
            Fp(self.0 - rhs.0)
        } else {
            // self - rhs + 2^128 - C
            Fp(self.0.wrapping_sub(rhs.0).wrapping_sub(C))
        }
    }
}

impl Mul for Fp {
    type Output = Fp;

    #[inline]
    fn mul(self, rhs: Fp) -> Fp {
        let (hi, lo) = mul_wide(self.0, rhs.0);
        Fp(reduce_wide(hi, lo))
    }
}

impl Neg for Fp {
    type Output = Fp;

    #[inline]
    fn neg(self) -> Fp {
        Fp::ZERO - self
    }
}

impl AddAssign for Fp {
    #[inline]
    fn add_assign(&mut self, rhs: Fp) {
        *self = *self + rhs;
    }
}

impl SubAssign for Fp {
    #[inline]
    fn sub_assign(&mut self, rhs: Fp) {
        *self = *self - rhs;
    }
}

impl MulAssign for Fp {
    #[inline]
    fn mul_assign(&mut self, rhs: Fp) {
        *self = *self * rhs;
    }
}

impl Sum for Fp {
    fn sum<I: Iterator<Item = Fp>>(iter: I) -> Fp {
        iter.fold(Fp::ZERO, |acc, x| acc + x)
    }
}
