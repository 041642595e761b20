//! Anonymous public-key encryption of client shares.
//!
//! A sealed box is `ephemeral_public_key || ciphertext`. The sender derives a one-time
//! ChaCha20Poly1305 key from an X25519 exchange between a fresh ephemeral key and the
//! recipient's key, so the recipient learns nothing about who sealed the box.

use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit},
};
use curve25519_dalek::montgomery::MontgomeryPoint;
use rand::CryptoRng;
use serde::{Deserialize, Serialize};

/// Bytes a sealed box adds to its plaintext.
pub const SEAL_OVERHEAD: usize = 32 + 16;

const KDF_CONTEXT: &str = "polyshuffle 2024 sealed client share";

/// Errors raised while sealing or opening a box.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The box is shorter than the sealing overhead.
    #[error("sealed box is too short")]
    Truncated,
    /// The key exchange produced the all-zero shared secret.
    #[error("low-order ephemeral key")]
    LowOrderKey,
    /// The box could not be encrypted.
    #[error("encryption failed")]
    EncryptionFailed,
    /// The box was not sealed for this key or has been tampered with.
    #[error("decryption failed")]
    DecryptionFailed,
}

/// The public half of a server's sealing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey([u8; 32]);

/// A server's sealing key pair.
#[derive(Clone)]
pub struct SecretKey {
    secret: [u8; 32],
    public: PublicKey,
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKey")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

impl SecretKey {
    /// Generates a fresh key pair.
    pub fn generate(rng: &mut impl CryptoRng) -> Self {
        let mut secret = [0; 32];
        rng.fill_bytes(&mut secret);
        Self::from_bytes(secret)
    }

    /// Creates a key pair from 32 secret bytes (clamped as in X25519).
    pub fn from_bytes(secret: [u8; 32]) -> Self {
        let public = PublicKey(MontgomeryPoint::mul_base_clamped(secret).to_bytes());
        SecretKey { secret, public }
    }

    /// The public half of the key pair.
    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Opens a box sealed for this key.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, Error> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(Error::Truncated);
        }
        let (ephemeral, ciphertext) = sealed.split_at(32);
        let mut ephemeral_bytes = [0; 32];
        ephemeral_bytes.copy_from_slice(ephemeral);
        let shared = MontgomeryPoint(ephemeral_bytes).mul_clamped(self.secret);
        let cipher = box_cipher(&shared, &ephemeral_bytes, &self.public)?;
        cipher
            .decrypt(&Nonce::default(), ciphertext)
            .map_err(|_| Error::DecryptionFailed)
    }
}

impl PublicKey {
    /// Seals `msg` so that only the owner of this key can open it.
    pub fn seal(&self, msg: &[u8], rng: &mut impl CryptoRng) -> Result<Vec<u8>, Error> {
        let ephemeral = SecretKey::generate(rng);
        let shared = MontgomeryPoint(self.0).mul_clamped(ephemeral.secret);
        let cipher = box_cipher(&shared, &ephemeral.public.0, self)?;
        let ciphertext = cipher
            .encrypt(&Nonce::default(), msg)
            .map_err(|_| Error::EncryptionFailed)?;
        let mut sealed = Vec::with_capacity(SEAL_OVERHEAD + msg.len());
        sealed.extend(ephemeral.public.0);
        sealed.extend(ciphertext);
        Ok(sealed)
    }
}

/// Derives the one-time box key from the shared secret and both public keys.
fn box_cipher(
    shared: &MontgomeryPoint,
    ephemeral: &[u8; 32],
    recipient: &PublicKey,
) -> Result<ChaCha20Poly1305, Error> {
    if shared.to_bytes() == [0; 32] {
        return Err(Error::LowOrderKey);
    }
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT);
    hasher.update(shared.as_bytes());
    hasher.update(ephemeral);
    hasher.update(&recipient.0);
    let key = hasher.finalize();
    Ok(ChaCha20Poly1305::new(Key::from_slice(key.as_bytes())))
}
