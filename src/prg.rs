//! Seed expansion based on AES in counter mode, and the permutations and per-batch seeds
//! derived from it.
//!
//! The keystream for a seed `s` is `AES_s(0) || AES_s(1) || ...`, with the counter encoded as a
//! little-endian `u128`. Long outputs are generated in parallel chunks, each starting at the
//! counter of its own offset, so the result never depends on how the work was split.

use aes::{
    Aes128,
    cipher::{BlockCipherEncrypt, KeyInit},
};
use rand::CryptoRng;
use rayon::prelude::*;

use crate::field::BLOCK_SIZE;

/// A 16-byte PRG seed, used as an AES-128 key.
pub type Seed = [u8; 16];

/// Outputs shorter than this are generated on the calling thread.
const PARALLEL_THRESHOLD: usize = 2000;

/// Number of bytes generated per parallel chunk (a multiple of the block size).
const CHUNK_LEN: usize = 64 * 1024;

/// Number of counter blocks encrypted per call into the cipher.
const PAR_BLOCKS: usize = 8;

/// Expands `seed` into `len` pseudorandom bytes.
pub fn aes_prg(len: usize, seed: &Seed) -> Vec<u8> {
    let mut out = vec![0; len];
    if len < PARALLEL_THRESHOLD {
        fill_keystream(seed, 0, &mut out);
    } else {
        out.par_chunks_mut(CHUNK_LEN)
            .enumerate()
            .for_each(|(i, chunk)| fill_keystream(seed, (i * CHUNK_LEN / BLOCK_SIZE) as u128, chunk));
    }
    out
}

/// XORs the keystream of `seed` into `buf`.
pub fn apply_keystream(seed: &Seed, buf: &mut [u8]) {
    let keystream = aes_prg(buf.len(), seed);
    buf.iter_mut().zip(keystream).for_each(|(b, k)| *b ^= k);
}

fn fill_keystream(seed: &Seed, first_counter: u128, out: &mut [u8]) {
    let aes = Aes128::new(&(*seed).into());
    let mut counter = first_counter;
    for chunk in out.chunks_mut(PAR_BLOCKS * BLOCK_SIZE) {
        let num_blocks = chunk.len().div_ceil(BLOCK_SIZE);
        let mut blocks = [aes::Block::default(); PAR_BLOCKS];
        for block in blocks[..num_blocks].iter_mut() {
            // aes::Block is a type alias to Array, which can't be used as a constructor
            *block = aes::cipher::Array(counter.to_le_bytes());
            counter += 1;
        }
        aes.encrypt_blocks(&mut blocks[..num_blocks]);
        for (dst, block) in chunk.chunks_mut(BLOCK_SIZE).zip(blocks.iter()) {
            dst.copy_from_slice(&block[..dst.len()]);
        }
    }
}

/// A permutation of `0..n`, applied to a database row by row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permutation(Vec<usize>);

/// Generates a permutation of `0..n` deterministically from `seed`.
///
/// Uses the inside-out Fisher-Yates shuffle, drawing one little-endian `u32` per position.
pub fn gen_perm(n: usize, seed: &Seed) -> Permutation {
    let rand = aes_prg(4 * n, seed);
    let mut perm = vec![0; n];
    for i in 1..n {
        let r = u32::from_le_bytes([rand[4 * i], rand[4 * i + 1], rand[4 * i + 2], rand[4 * i + 3]]);
        let j = r as usize % (i + 1);
        perm[i] = perm[j];
        perm[j] = i;
    }
    Permutation(perm)
}

impl Permutation {
    /// The number of permuted positions.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the permutation is over an empty set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The position that is moved into slot `i`.
    pub fn get(&self, i: usize) -> usize {
        self.0[i]
    }

    /// Returns a copy of `flat` in which row `i` is the input row `self[i]`.
    ///
    /// Panics if `flat` does not hold exactly `self.len()` rows of `row_len` bytes.
    pub fn permute_db(&self, flat: &[u8], row_len: usize) -> Vec<u8> {
        assert_eq!(flat.len(), self.0.len() * row_len, "database does not match permutation");
        let mut permuted = vec![0; flat.len()];
        if row_len == 0 {
            return permuted;
        }
        permuted
            .par_chunks_mut(row_len)
            .zip(self.0.par_iter())
            .for_each(|(row, &src)| row.copy_from_slice(&flat[src * row_len..(src + 1) * row_len]));
        permuted
    }
}

/// The 128 bytes of randomness a server draws for one batch.
///
/// Each 16-byte sub-range seeds one kind of preprocessing material. The server keeps the seed
/// and sends a copy to the dealer, so both sides can expand the same values.
#[derive(Clone, PartialEq, Eq)]
pub struct BatchSeed([u8; BatchSeed::LEN]);

/// The two blind MAC rounds of a batch, each consuming its own Beaver triples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Round {
    /// Verification of the shares as received from the clients.
    BeforeShuffle,
    /// Verification of the shares produced by the shuffle.
    AfterShuffle,
}

impl std::fmt::Display for Round {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Round::BeforeShuffle => f.write_str("round 1"),
            Round::AfterShuffle => f.write_str("round 2"),
        }
    }
}

impl BatchSeed {
    /// The serialized length of a batch seed.
    pub const LEN: usize = 128;

    /// Draws a fresh batch seed.
    pub fn random(rng: &mut impl CryptoRng) -> Self {
        let mut bytes = [0; Self::LEN];
        rng.fill_bytes(&mut bytes);
        BatchSeed(bytes)
    }

    /// Reads a batch seed received over the network.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(BatchSeed)
    }

    /// The raw seed bytes.
    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }

    fn sub_seed(&self, offset: usize) -> Seed {
        let mut seed = [0; 16];
        seed.copy_from_slice(&self.0[offset..offset + 16]);
        seed
    }

    /// Seeds the mask added before sending a share to the first shuffler.
    pub fn initial_mask(&self) -> Seed {
        self.sub_seed(0)
    }

    /// Seeds the share a non-last shuffler keeps after the shuffle.
    pub fn final_mask(&self) -> Seed {
        self.sub_seed(16)
    }

    /// Seeds the mask added after applying the server's permutation.
    pub fn post_perm_mask(&self) -> Seed {
        self.sub_seed(32)
    }

    /// Seeds the server's private permutation.
    pub fn permutation(&self) -> Seed {
        self.sub_seed(80)
    }

    /// Seeds the server's share of the Beaver factor `a` for `round`.
    pub fn beaver_a(&self, round: Round) -> Seed {
        match round {
            Round::BeforeShuffle => self.sub_seed(48),
            Round::AfterShuffle => self.sub_seed(96),
        }
    }

    /// Seeds the server's share of the Beaver factor `b` for `round`.
    pub fn beaver_b(&self, round: Round) -> Seed {
        match round {
            Round::BeforeShuffle => self.sub_seed(64),
            Round::AfterShuffle => self.sub_seed(112),
        }
    }
}

impl std::fmt::Debug for BatchSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BatchSeed(..)")
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    #[test]
    fn prg_is_deterministic_and_seed_dependent() {
        let a = aes_prg(100, &[1; 16]);
        assert_eq!(a, aes_prg(100, &[1; 16]));
        assert_ne!(a, aes_prg(100, &[2; 16]));
        assert_eq!(aes_prg(0, &[1; 16]), Vec::<u8>::new());
    }

    #[test]
    fn parallel_chunks_match_sequential_generation() {
        let seed = [42; 16];
        let long = aes_prg(3 * CHUNK_LEN + 100, &seed);
        let mut sequential = vec![0; long.len()];
        fill_keystream(&seed, 0, &mut sequential);
        assert_eq!(long, sequential);
        // shorter outputs are prefixes of longer ones, across the threshold
        assert_eq!(aes_prg(1999, &seed), long[..1999]);
        assert_eq!(aes_prg(CHUNK_LEN + 17, &seed), long[..CHUNK_LEN + 17]);
    }

    #[test]
    fn keystream_is_an_involution() {
        let mut buf = b"attack at dawn, bring snacks".to_vec();
        apply_keystream(&[9; 16], &mut buf);
        assert_ne!(buf, b"attack at dawn, bring snacks");
        apply_keystream(&[9; 16], &mut buf);
        assert_eq!(buf, b"attack at dawn, bring snacks");
    }

    proptest! {
        #[test]
        fn gen_perm_is_a_deterministic_bijection(n in 0usize..300, seed in any::<[u8; 16]>()) {
            let perm = gen_perm(n, &seed);
            prop_assert_eq!(&perm, &gen_perm(n, &seed));
            let mut seen = vec![false; n];
            for i in 0..n {
                prop_assert!(!seen[perm.get(i)]);
                seen[perm.get(i)] = true;
            }
        }
    }

    #[test]
    fn permute_db_moves_whole_rows() {
        let perm = Permutation(vec![2, 0, 1]);
        let flat = [1, 1, 2, 2, 3, 3];
        assert_eq!(perm.permute_db(&flat, 2), vec![3, 3, 1, 1, 2, 2]);
        assert_eq!(Permutation(vec![0, 1, 2]).permute_db(&flat, 2), flat);
    }

    #[test]
    fn seed_slices_are_disjoint() {
        let mut rng = ChaCha20Rng::seed_from_u64(0);
        let seed = BatchSeed::random(&mut rng);
        let mut all = vec![
            seed.initial_mask(),
            seed.final_mask(),
            seed.post_perm_mask(),
            seed.permutation(),
        ];
        for round in [Round::BeforeShuffle, Round::AfterShuffle] {
            all.push(seed.beaver_a(round));
            all.push(seed.beaver_b(round));
        }
        let mut flat: Vec<u8> = all.concat();
        flat.sort_unstable();
        let mut expected = seed.as_bytes().to_vec();
        expected.sort_unstable();
        assert_eq!(flat, expected);
        assert_eq!(BatchSeed::from_slice(seed.as_bytes()), Some(seed));
        assert_eq!(BatchSeed::from_slice(&[0; 127]), None);
    }
}
