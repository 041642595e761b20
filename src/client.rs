//! Client-side message preparation and the final per-row MAC check and decryption.
//!
//! A client encrypts its plaintext under a fresh stream key, MACs the resulting payload under a
//! key that is itself additively shared among the servers (each server only ever sees the seed
//! of its key share), and secret-shares `tag || payload` among all servers. Every share except
//! the leader's is sealed for its recipient, since the leader relays them.

use rand::CryptoRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::{
    db::{Row, expand_key_share, unpack},
    field::{BLOCK_SIZE, Fp},
    params::{MacMode, Params},
    prg::{Seed, apply_keystream},
    seal::{self, PublicKey},
    sharing::{self, merge, share},
};

/// Errors raised while preparing a submission.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The plaintext does not fit into a message.
    #[error("plaintext of {actual} bytes exceeds the maximum of {max} bytes")]
    PlaintextTooLong {
        /// The maximum plaintext length.
        max: usize,
        /// The length of the plaintext.
        actual: usize,
    },
    /// One sealing key per server is required.
    #[error("expected {expected} server keys, found {actual}")]
    WrongKeyCount {
        /// The number of servers.
        expected: usize,
        /// The number of keys provided.
        actual: usize,
    },
    /// The message could not be shared.
    #[error(transparent)]
    Sharing(#[from] sharing::Error),
    /// A share could not be sealed.
    #[error(transparent)]
    Seal(#[from] seal::Error),
}

/// Computes the MAC `sum_j key_j * payload_j` over the blocks covered by `mode`.
///
/// Panics if `key` or `payload` are shorter than the MACed blocks.
pub fn compute_mac(payload: &[u8], key: &[u8], mode: MacMode) -> Fp {
    let blocks = match mode {
        MacMode::Full => payload.len() / BLOCK_SIZE,
        MacMode::Messaging => 1,
    };
    (0..blocks)
        .map(|j| Fp::read(key, j) * Fp::read(payload, j))
        .sum()
}

/// Checks a MAC in the clear, comparing tags in constant time.
pub fn check_mac(payload: &[u8], tag: &[u8], key: &[u8], mode: MacMode) -> bool {
    compute_mac(payload, key, mode)
        .to_bytes()
        .ct_eq(tag)
        .into()
}

/// MACs `payload` under a fresh key and returns the tag with one key-share seed per server.
///
/// The key is the sum of all servers' key shares, each expanded from its seed.
pub fn mac_with_key_shares(
    params: &Params,
    payload: &[u8],
    rng: &mut impl CryptoRng,
) -> Result<([u8; BLOCK_SIZE], Vec<Seed>), Error> {
    let seeds: Vec<Seed> = (0..params.num_servers())
        .map(|_| {
            let mut seed = [0; 16];
            rng.fill_bytes(&mut seed);
            seed
        })
        .collect();
    let key_shares: Vec<Vec<u8>> = seeds
        .iter()
        .map(|seed| expand_key_share(params, seed))
        .collect();
    let key = merge(&key_shares)?;
    Ok((compute_mac(payload, &key, params.mode()).to_bytes(), seeds))
}

/// Encrypts a plaintext into a payload: a fresh stream key followed by the ciphertext.
///
/// The plaintext is zero-padded to the message length. The stream key is redrawn until every
/// payload block is a canonical field element, so the payload survives secret sharing exactly.
pub fn encrypt_payload(
    params: &Params,
    plaintext: &[u8],
    rng: &mut impl CryptoRng,
) -> Result<Vec<u8>, Error> {
    let max = params.msg_blocks() * BLOCK_SIZE;
    if plaintext.len() > max {
        return Err(Error::PlaintextTooLong {
            max,
            actual: plaintext.len(),
        });
    }
    let mut padded = plaintext.to_vec();
    padded.resize(max, 0);
    loop {
        let key = Fp::random(rng).to_bytes();
        let mut ciphertext = padded.clone();
        apply_keystream(&key, &mut ciphertext);
        let canonical = ciphertext.chunks(BLOCK_SIZE).all(|block| {
            let mut b = [0; BLOCK_SIZE];
            b.copy_from_slice(block);
            Fp::from_canonical_bytes(&b).is_some()
        });
        if canonical {
            let mut payload = key.to_vec();
            payload.extend(ciphertext);
            return Ok(payload);
        }
    }
}

/// Decrypts a payload produced by [`encrypt_payload`], returning the padded plaintext.
///
/// Panics if the payload is shorter than one block.
pub fn decrypt_payload(payload: &[u8]) -> Vec<u8> {
    let mut key = [0; 16];
    key.copy_from_slice(&payload[..BLOCK_SIZE]);
    let mut plaintext = payload[BLOCK_SIZE..].to_vec();
    apply_keystream(&key, &mut plaintext);
    plaintext
}

/// What a client sends to the leader for one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    /// The leader's share in the clear: `seed_0 || tag_0 || payload_0`.
    pub leader_share: Vec<u8>,
    /// The shares of servers `1..num_servers`, each sealed for its recipient.
    pub sealed_shares: Vec<Vec<u8>>,
}

impl Submission {
    /// Prepares a plaintext for submission to the servers holding `server_keys`.
    ///
    /// `server_keys[0]` belongs to the leader and is not used, as its share is not sealed.
    pub fn new(
        params: &Params,
        plaintext: &[u8],
        server_keys: &[PublicKey],
        rng: &mut impl CryptoRng,
    ) -> Result<Self, Error> {
        if server_keys.len() != params.num_servers() {
            return Err(Error::WrongKeyCount {
                expected: params.num_servers(),
                actual: server_keys.len(),
            });
        }
        let payload = encrypt_payload(params, plaintext, rng)?;
        let (tag, seeds) = mac_with_key_shares(params, &payload, rng)?;
        let mut body = tag.to_vec();
        body.extend(payload);
        let body_shares = share(params.num_servers(), &body, rng)?;

        let mut shares = seeds.into_iter().zip(body_shares).map(|(seed, body)| {
            let mut s = seed.to_vec();
            s.extend(body);
            s
        });
        let leader_share = shares.next().unwrap_or_default();
        let sealed_shares = shares
            .zip(&server_keys[1..])
            .map(|(s, key)| key.seal(&s, rng))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Submission {
            leader_share,
            sealed_shares,
        })
    }
}

/// Checks every row of a merged database and decrypts the valid ones.
///
/// A row whose MAC does not verify is returned as `None`; the other rows are unaffected.
pub fn open_rows(params: &Params, merged: &[u8]) -> Vec<Option<Vec<u8>>> {
    unpack(merged, params.row_len())
        .par_iter()
        .map(|row| {
            let row = Row::of(params, row, 0);
            check_mac(row.payload(), row.tag(), row.key(), params.mode())
                .then(|| decrypt_payload(row.payload()))
        })
        .collect()
}
