//! Ed25519 signatures over round messages.
//!
//! When a deployment enables signing, every server signs its blind MAC differences and its hash
//! commitment, so that the accept/abort decision of a round can be attributed to the messages
//! that were actually sent.

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::CryptoRng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    channel::{Channel, broadcast},
    protocol::{Context, Error as ProtocolError},
    utils::RngCompat,
};

/// Errors raised while loading keys.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The public key bytes do not encode a curve point.
    #[error("invalid verifying key for party {0}")]
    InvalidKey(usize),
}

/// A server's signing key together with the verifying keys of all servers.
#[derive(Debug, Clone)]
pub struct Attestor {
    party: usize,
    key: SigningKey,
    peers: Vec<VerifyingKey>,
}

/// Generates one signing key per server.
pub fn generate_keys(num_servers: usize, rng: &mut impl CryptoRng) -> Vec<SigningKey> {
    (0..num_servers)
        .map(|_| SigningKey::generate(&mut RngCompat(&mut *rng)))
        .collect()
}

impl Attestor {
    /// Creates the attestor for `party`, given the public keys of all servers.
    pub fn new(party: usize, key: SigningKey, peers: &[[u8; 32]]) -> Result<Self, Error> {
        let peers = peers
            .iter()
            .enumerate()
            .map(|(p, bytes)| VerifyingKey::from_bytes(bytes).map_err(|_| Error::InvalidKey(p)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Attestor { party, key, peers })
    }

    /// Signs `data` for the given protocol phase.
    pub fn sign(&self, phase: &str, data: &[u8]) -> Vec<u8> {
        let msg = signed_message(self.party, phase, data);
        self.key.sign(&msg).to_bytes().to_vec()
    }

    /// Checks that `party` signed `data` for the given protocol phase.
    pub fn verify(&self, party: usize, phase: &str, data: &[u8], signature: &[u8]) -> bool {
        let Some(key) = self.peers.get(party) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify(&signed_message(party, phase, data), &signature)
            .is_ok()
    }
}

/// A broadcast message with its (possibly empty) signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Signed {
    data: Vec<u8>,
    signature: Vec<u8>,
}

/// Broadcasts `data` among the servers, signed if the context has an [`Attestor`].
///
/// Returns the data of all servers ordered by party, after checking every signature.
pub(crate) async fn broadcast_signed(
    ctx: &Context<'_, impl Channel>,
    phase: &str,
    data: Vec<u8>,
) -> Result<Vec<Vec<u8>>, ProtocolError> {
    let signature = ctx
        .attestor
        .map(|a| a.sign(phase, &data))
        .unwrap_or_default();
    let msg = Signed { data, signature };
    let all = broadcast(ctx.channel, ctx.party, ctx.params.num_servers(), phase, &msg).await?;
    if let Some(attestor) = ctx.attestor {
        for (party, msg) in all.iter().enumerate() {
            if party != ctx.party && !attestor.verify(party, phase, &msg.data, &msg.signature) {
                warn!(party, "Invalid signature on {phase}");
                return Err(ProtocolError::InvalidSignature {
                    party,
                    phase: phase.to_string(),
                });
            }
        }
    }
    Ok(all.into_iter().map(|m| m.data).collect())
}

/// Binds a signature to its signer and phase, so it can't be replayed elsewhere.
fn signed_message(party: usize, phase: &str, data: &[u8]) -> Vec<u8> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(party as u64).to_le_bytes());
    hasher.update(&(phase.len() as u64).to_le_bytes());
    hasher.update(phase.as_bytes());
    hasher.update(data);
    hasher.finalize().as_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;
    use crate::{channel::SimpleChannel, params::Params, protocol::Deployment};

    fn attestors(n: usize) -> Vec<Attestor> {
        let mut rng = ChaCha20Rng::seed_from_u64(5);
        let keys = generate_keys(n, &mut rng);
        let public: Vec<[u8; 32]> = keys.iter().map(|k| k.verifying_key().to_bytes()).collect();
        keys.into_iter()
            .enumerate()
            .map(|(p, k)| Attestor::new(p, k, &public).unwrap())
            .collect()
    }

    #[test]
    fn signatures_are_bound_to_party_and_phase() {
        let a = attestors(3);
        let sig = a[1].sign("diffs", b"data");
        assert!(a[0].verify(1, "diffs", b"data", &sig));
        assert!(a[2].verify(1, "diffs", b"data", &sig));
        assert!(!a[0].verify(2, "diffs", b"data", &sig));
        assert!(!a[0].verify(1, "commitment", b"data", &sig));
        assert!(!a[0].verify(1, "diffs", b"date", &sig));
        assert!(!a[0].verify(1, "diffs", b"data", &sig[..10]));
        assert!(!a[0].verify(7, "diffs", b"data", &sig));
    }

    #[tokio::test]
    async fn foreign_signing_keys_abort_the_broadcast() -> Result<(), ProtocolError> {
        let mut rng = ChaCha20Rng::seed_from_u64(6);
        let params = Params::new(2, 1, 1)?;
        let ours = Deployment::generate(params, true, &mut rng)?;
        let theirs = Deployment::generate(params, true, &mut rng)?;
        let channels = SimpleChannel::channels(2);
        let ctx0 = ours.context(&channels[0], 0)?;
        let ctx1 = theirs.context(&channels[1], 1)?;
        let (r0, r1) = tokio::join!(
            broadcast_signed(&ctx0, "commitment", vec![0; 32]),
            broadcast_signed(&ctx1, "commitment", vec![1; 32]),
        );
        assert!(matches!(r0, Err(ProtocolError::InvalidSignature { party: 1, .. })), "{r0:?}");
        assert!(matches!(r1, Err(ProtocolError::InvalidSignature { party: 0, .. })), "{r1:?}");

        let ctx1 = ours.context(&channels[1], 1)?;
        let (r0, r1) = tokio::join!(
            broadcast_signed(&ctx0, "commitment", vec![0; 32]),
            broadcast_signed(&ctx1, "commitment", vec![1; 32]),
        );
        assert_eq!(r0?, r1?);
        Ok(())
    }
}
