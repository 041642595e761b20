//! Additive N-of-N secret sharing of block-aligned byte buffers.

use rand::CryptoRng;

use crate::{
    field::{BLOCK_SIZE, Fp},
    parallel::for_each_chunk_mut,
};

/// Errors raised when buffers cannot be shared, merged or combined.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The buffer length is not a multiple of the block size.
    #[error("buffer of {0} bytes is not a multiple of the block size")]
    NotBlockAligned(usize),
    /// Two buffers that must be combined have different lengths.
    #[error("buffer lengths differ: expected {expected} bytes, found {actual}")]
    LengthMismatch {
        /// The length of the first buffer.
        expected: usize,
        /// The length of the offending buffer.
        actual: usize,
    },
    /// At least one share is required.
    #[error("no shares were provided")]
    NoShares,
}

/// Whether a block-wise operation adds or subtracts its operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// `a += b`
    Add,
    /// `a -= b`
    Sub,
}

impl Op {
    #[inline]
    fn apply(self, a: Fp, b: Fp) -> Fp {
        match self {
            Op::Add => a + b,
            Op::Sub => a - b,
        }
    }
}

fn check_aligned(len: usize) -> Result<(), Error> {
    if len % BLOCK_SIZE == 0 {
        Ok(())
    } else {
        Err(Error::NotBlockAligned(len))
    }
}

fn check_len(expected: usize, actual: usize) -> Result<(), Error> {
    if expected == actual {
        Ok(())
    } else {
        Err(Error::LengthMismatch { expected, actual })
    }
}

/// Splits `msg` into `num_shares` additive shares.
///
/// All shares but the last are uniformly random; the last one closes the sum.
pub fn share(num_shares: usize, msg: &[u8], rng: &mut impl CryptoRng) -> Result<Vec<Vec<u8>>, Error> {
    check_aligned(msg.len())?;
    if num_shares == 0 {
        return Err(Error::NoShares);
    }
    let blocks = msg.len() / BLOCK_SIZE;
    let mut shares = Vec::with_capacity(num_shares);
    for _ in 1..num_shares {
        let mut random_share = vec![0; msg.len()];
        for b in 0..blocks {
            Fp::random(rng).write(&mut random_share, b);
        }
        shares.push(random_share);
    }
    let mut closing = msg.to_vec();
    for random_share in shares.iter() {
        add_or_sub(&mut closing, random_share, Op::Sub)?;
    }
    shares.push(closing);
    Ok(shares)
}

/// Sums equal-length shares block-wise, reconstructing the shared value.
pub fn merge<S: AsRef<[u8]>>(shares: &[S]) -> Result<Vec<u8>, Error> {
    let Some((first, rest)) = shares.split_first() else {
        return Err(Error::NoShares);
    };
    let mut merged = first.as_ref().to_vec();
    check_aligned(merged.len())?;
    for s in rest {
        add_or_sub(&mut merged, s.as_ref(), Op::Add)?;
    }
    Ok(merged)
}

/// Adds or subtracts `b` into `a`, block by block and in place.
pub fn add_or_sub(a: &mut [u8], b: &[u8], op: Op) -> Result<(), Error> {
    check_aligned(a.len())?;
    check_len(a.len(), b.len())?;
    for_each_chunk_mut(a, BLOCK_SIZE, |first, chunk| {
        let b = &b[first * BLOCK_SIZE..first * BLOCK_SIZE + chunk.len()];
        for i in 0..chunk.len() / BLOCK_SIZE {
            op.apply(Fp::read(chunk, i), Fp::read(b, i)).write(chunk, i);
        }
    });
    Ok(())
}

/// Computes `a = (a op_b b) op_c c` in a single pass over the blocks.
pub fn double_add_or_sub(a: &mut [u8], b: &[u8], c: &[u8], op_b: Op, op_c: Op) -> Result<(), Error> {
    check_aligned(a.len())?;
    check_len(a.len(), b.len())?;
    check_len(a.len(), c.len())?;
    for_each_chunk_mut(a, BLOCK_SIZE, |first, chunk| {
        let range = first * BLOCK_SIZE..first * BLOCK_SIZE + chunk.len();
        let (b, c) = (&b[range.clone()], &c[range]);
        for i in 0..chunk.len() / BLOCK_SIZE {
            let x = op_b.apply(Fp::read(chunk, i), Fp::read(b, i));
            op_c.apply(x, Fp::read(c, i)).write(chunk, i);
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rand::{RngCore, SeedableRng};
    use rand_chacha::ChaCha20Rng;

    use super::*;

    fn random_canonical(blocks: usize, rng: &mut ChaCha20Rng) -> Vec<u8> {
        let mut buf = vec![0; blocks * BLOCK_SIZE];
        for b in 0..blocks {
            Fp::random(rng).write(&mut buf, b);
        }
        buf
    }

    proptest! {
        #[test]
        fn merge_reverses_share(n in 2usize..6, blocks in 0usize..40, seed in any::<u64>()) {
            let mut rng = ChaCha20Rng::seed_from_u64(seed);
            let msg = random_canonical(blocks, &mut rng);
            let shares = share(n, &msg, &mut rng).unwrap();
            prop_assert_eq!(shares.len(), n);
            prop_assert_eq!(merge(&shares).unwrap(), msg);
        }

        #[test]
        fn sharing_is_linear(n in 2usize..5, blocks in 1usize..20, seed in any::<u64>()) {
            let mut rng = ChaCha20Rng::seed_from_u64(seed);
            let v1 = random_canonical(blocks, &mut rng);
            let v2 = random_canonical(blocks, &mut rng);
            let s1 = share(n, &v1, &mut rng).unwrap();
            let s2 = share(n, &v2, &mut rng).unwrap();
            let summed: Vec<Vec<u8>> = s1
                .iter()
                .zip(&s2)
                .map(|(a, b)| {
                    let mut a = a.clone();
                    add_or_sub(&mut a, b, Op::Add).unwrap();
                    a
                })
                .collect();
            let mut expected = merge(&s1).unwrap();
            add_or_sub(&mut expected, &merge(&s2).unwrap(), Op::Add).unwrap();
            prop_assert_eq!(merge(&summed).unwrap(), expected);
        }
    }

    #[test]
    fn single_share_is_the_message() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let msg = random_canonical(3, &mut rng);
        assert_eq!(share(1, &msg, &mut rng).unwrap(), vec![msg]);
    }

    #[test]
    fn rejects_malformed_buffers() {
        let mut rng = ChaCha20Rng::seed_from_u64(2);
        assert_eq!(share(2, &[0; 15], &mut rng), Err(Error::NotBlockAligned(15)));
        assert_eq!(share(0, &[0; 16], &mut rng), Err(Error::NoShares));
        assert_eq!(merge::<Vec<u8>>(&[]), Err(Error::NoShares));
        assert_eq!(
            merge(&[vec![0; 16], vec![0; 32]]),
            Err(Error::LengthMismatch {
                expected: 16,
                actual: 32
            })
        );
        assert_eq!(merge(&[vec![0; 17]]), Err(Error::NotBlockAligned(17)));
    }

    #[test]
    fn double_add_or_sub_matches_two_passes() {
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let mut bytes = vec![0; 48 * BLOCK_SIZE];
        rng.fill_bytes(&mut bytes);
        let b = random_canonical(48, &mut rng);
        let c = random_canonical(48, &mut rng);

        let mut fused = bytes.clone();
        double_add_or_sub(&mut fused, &b, &c, Op::Sub, Op::Add).unwrap();
        let mut stepwise = bytes;
        add_or_sub(&mut stepwise, &b, Op::Sub).unwrap();
        add_or_sub(&mut stepwise, &c, Op::Add).unwrap();
        assert_eq!(fused, stepwise);
    }
}
