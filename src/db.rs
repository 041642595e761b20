//! A party's share of the message database.
//!
//! Each row is laid out as `[mac key share | tag | payload]`, all in 16-byte blocks. A batch is
//! handled either as one flat buffer with a fixed row stride or as separate rows, and
//! [`pack`]/[`unpack`] convert between the two.

use crate::{
    field::BLOCK_SIZE,
    params::{MacMode, Params},
    prg::{Seed, aes_prg},
};

/// Concatenates rows of equal length into one flat buffer.
pub fn pack<R: AsRef<[u8]>>(rows: &[R]) -> Vec<u8> {
    rows.iter().flat_map(|r| r.as_ref().iter().copied()).collect()
}

/// Splits a flat buffer into rows of `row_len` bytes.
pub fn unpack(flat: &[u8], row_len: usize) -> Vec<Vec<u8>> {
    if row_len == 0 {
        return vec![];
    }
    flat.chunks(row_len).map(<[u8]>::to_vec).collect()
}

/// Expands a client's key-share seed into this party's share of the MAC key.
pub fn expand_key_share(params: &Params, seed: &Seed) -> Vec<u8> {
    match params.mode() {
        MacMode::Full => aes_prg(params.key_blocks() * BLOCK_SIZE, seed),
        MacMode::Messaging => seed.to_vec(),
    }
}

/// Writes one received client share (`seed || tag || payload`) into `row`.
///
/// Panics if `row` or `share` have the wrong length for `params`.
pub(crate) fn fill_row(params: &Params, row: &mut [u8], share: &[u8]) {
    let mut seed = [0; 16];
    seed.copy_from_slice(&share[..BLOCK_SIZE]);
    let key_len = params.key_blocks() * BLOCK_SIZE;
    row[..key_len].copy_from_slice(&expand_key_share(params, &seed));
    row[key_len..].copy_from_slice(&share[BLOCK_SIZE..]);
}

/// Read-only views of the regions of a single row.
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    params: &'a Params,
    bytes: &'a [u8],
}

impl<'a> Row<'a> {
    /// Views the `i`-th row of a flat database share.
    pub fn of(params: &'a Params, flat: &'a [u8], i: usize) -> Self {
        let row_len = params.row_len();
        Row {
            params,
            bytes: &flat[i * row_len..(i + 1) * row_len],
        }
    }

    /// The MAC key (share).
    pub fn key(&self) -> &'a [u8] {
        &self.bytes[..self.params.tag_block() * BLOCK_SIZE]
    }

    /// The MAC tag (share).
    pub fn tag(&self) -> &'a [u8] {
        let start = self.params.tag_block() * BLOCK_SIZE;
        &self.bytes[start..start + BLOCK_SIZE]
    }

    /// The payload (share): stream key followed by ciphertext.
    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[self.params.payload_block() * BLOCK_SIZE..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Error;

    #[test]
    fn pack_and_unpack() {
        let rows = vec![vec![1u8; 32], vec![2u8; 32], vec![3u8; 32]];
        let flat = pack(&rows);
        assert_eq!(flat.len(), 96);
        assert_eq!(unpack(&flat, 32), rows);
    }

    #[test]
    fn fill_row_expands_the_key() -> Result<(), Error> {
        let params = Params::new(2, 1, 1)?;
        let mut share = vec![7u8; BLOCK_SIZE];
        share.extend(vec![1u8; BLOCK_SIZE]);
        share.extend(vec![2u8; 2 * BLOCK_SIZE]);
        let mut flat = vec![0; params.db_len()];
        fill_row(&params, &mut flat, &share);
        let row = Row::of(&params, &flat, 0);
        assert_eq!(row.key(), aes_prg(2 * BLOCK_SIZE, &[7; 16]));
        assert_eq!(row.tag(), [1; BLOCK_SIZE]);
        assert_eq!(row.payload(), [2; 2 * BLOCK_SIZE]);
        Ok(())
    }

    #[test]
    fn messaging_mode_uses_the_seed_as_key() -> Result<(), Error> {
        let params = Params::new(2, 3, 1)?.with_mode(MacMode::Messaging);
        assert_eq!(expand_key_share(&params, &[5; 16]), vec![5; 16]);
        Ok(())
    }
}
