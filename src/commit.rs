//! Commit-reveal of the shuffled shares.
//!
//! Before revealing its share of the shuffled database, every server broadcasts a hash of it.
//! Shares are only merged after every revealed share matched its commitment, so a server can't
//! choose its share after seeing the others.

use subtle::ConstantTimeEq;
use tracing::{Level, debug, instrument, warn};

use crate::{
    auth::broadcast_signed,
    channel::{Channel, broadcast},
    parallel::map_ranges,
    protocol::{Context, Error},
    sharing::merge,
};

/// The hash of a database share.
pub type Commitment = [u8; 32];

/// Hashes a database share of `row_len`-byte rows.
///
/// Row chunks are hashed in parallel, and the chunk hashes are hashed again in chunk order,
/// together with the total length and any bytes after the last whole row.
pub fn hash_db(db: &[u8], row_len: usize) -> Commitment {
    let rows = if row_len == 0 { 0 } else { db.len() / row_len };
    let chunk_hashes = map_ranges(rows, |range| {
        blake3::hash(&db[range.start * row_len..range.end * row_len])
    });
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(db.len() as u64).to_le_bytes());
    for h in &chunk_hashes {
        hasher.update(h.as_bytes());
    }
    hasher.update(&db[rows * row_len..]);
    *hasher.finalize().as_bytes()
}

/// Checks every revealed share against its commitment, returning the first party that cheated.
pub fn check_hashes<S: AsRef<[u8]>>(
    commitments: &[Commitment],
    shares: &[S],
    row_len: usize,
) -> Result<(), usize> {
    for (party, (commitment, share)) in commitments.iter().zip(shares).enumerate() {
        let matches: bool = hash_db(share.as_ref(), row_len).ct_eq(commitment).into();
        if !matches {
            return Err(party);
        }
    }
    if commitments.len() != shares.len() {
        return Err(commitments.len().min(shares.len()));
    }
    Ok(())
}

/// Commits to this server's share, reveals it and returns the merged database.
#[instrument(level=Level::DEBUG, skip_all, fields(party = ctx.party), err)]
pub async fn commit_and_reveal(ctx: &Context<'_, impl Channel>, db: &[u8]) -> Result<Vec<u8>, Error> {
    let params = &ctx.params;
    let commitment = hash_db(db, params.row_len());
    let commitments = broadcast_signed(ctx, "commitment", commitment.to_vec())
        .await?
        .into_iter()
        .enumerate()
        .map(|(party, c)| Commitment::try_from(c).map_err(|_| Error::CommitmentMismatch { party }))
        .collect::<Result<Vec<_>, _>>()?;
    debug!("Received all commitments");

    let shares = broadcast(ctx.channel, ctx.party, params.num_servers(), "reveal", &db.to_vec()).await?;
    let checked = match shares.iter().position(|s| s.len() != params.db_len()) {
        Some(party) => Err(party),
        None => check_hashes(&commitments, &shares, params.row_len()),
    };
    if let Err(party) = checked {
        warn!(party, "Revealed share does not match its commitment");
        return Err(Error::CommitmentMismatch { party });
    }
    Ok(merge(&shares)?)
}
