//! Blind verification of the client MACs on secret-shared rows.
//!
//! For every row the servers jointly check `sum_j key_j * payload_j - tag == 0` without opening
//! the key, the payload or the tag. The products are computed with Beaver triples in one
//! broadcast (the masked factors), the resulting differences are opened in a second one. A batch
//! in which any difference is non-zero is rejected as a whole.

use rayon::prelude::*;
use tracing::{Level, debug, instrument, warn};

use crate::{
    auth::broadcast_signed,
    channel::{Channel, broadcast_vec},
    field::{BLOCK_SIZE, Fp},
    params::Params,
    parallel::{for_each_chunk_mut, map_ranges},
    preprocessing::TripleShares,
    prg::Round,
    protocol::{Context, Error, Role},
    sharing::{self, merge},
};

/// Masks this server's shares of the MAC keys and payloads with the triple factors.
///
/// The result holds `key - a` for every triple followed by `payload - b` for every triple, where
/// triple `i * key_blocks + j` multiplies key block `j` and payload block `j` of row `i`.
pub fn masked_shares(params: &Params, db: &[u8], triples: &TripleShares) -> Vec<u8> {
    let kb = params.key_blocks();
    let bpr = params.blocks_per_row();
    let payload_block = params.payload_block();
    let len = params.num_beavers() * BLOCK_SIZE;
    let mut masked = vec![0; 2 * len];
    let (keys, msgs) = masked.split_at_mut(len);
    rayon::join(
        || {
            for_each_chunk_mut(keys, BLOCK_SIZE, |first, chunk| {
                for k in 0..chunk.len() / BLOCK_SIZE {
                    let t = first + k;
                    let key = Fp::read(db, (t / kb) * bpr + t % kb);
                    (key - Fp::read(&triples.a, t)).write(chunk, k);
                }
            })
        },
        || {
            for_each_chunk_mut(msgs, BLOCK_SIZE, |first, chunk| {
                for k in 0..chunk.len() / BLOCK_SIZE {
                    let t = first + k;
                    let msg = Fp::read(db, (t / kb) * bpr + payload_block + t % kb);
                    (msg - Fp::read(&triples.b, t)).write(chunk, k);
                }
            })
        },
    );
    masked
}

/// Computes this server's share of `sum_j key_j * payload_j - tag` for every row.
///
/// `opened` is the sum of all servers' [`masked_shares`]. Each product share is
/// `c + masked_key * payload + masked_payload * key`, and exactly one server (the leader)
/// also subtracts `masked_key * masked_payload`.
pub fn beaver_product(
    params: &Params,
    is_leader: bool,
    db: &[u8],
    triples: &TripleShares,
    opened: &[u8],
) -> Vec<Fp> {
    let kb = params.key_blocks();
    let bpr = params.blocks_per_row();
    let tag_block = params.tag_block();
    let payload_block = params.payload_block();
    let (opened_keys, opened_msgs) = opened.split_at(params.num_beavers() * BLOCK_SIZE);
    (0..params.batch_size())
        .into_par_iter()
        .map(|i| {
            let row = i * bpr;
            let mut diff = -Fp::read(db, row + tag_block);
            for j in 0..kb {
                let t = i * kb + j;
                let mk = Fp::read(opened_keys, t);
                let mm = Fp::read(opened_msgs, t);
                diff += Fp::read(&triples.c, t)
                    + mk * Fp::read(db, row + payload_block + j)
                    + mm * Fp::read(db, row + j);
                if is_leader {
                    diff -= mk * mm;
                }
            }
            diff
        })
        .collect()
}

/// Sums the differences per worker chunk, so that fewer values need to be opened.
pub fn aggregate(diffs: &[Fp]) -> Vec<Fp> {
    map_ranges(diffs.len(), |range| diffs[range].iter().copied().sum())
}

/// Merges all servers' shares of the differences and checks that every value is zero.
pub fn check_shares_are_zero<S: AsRef<[u8]>>(shares: &[S]) -> Result<bool, sharing::Error> {
    let merged = merge(shares)?;
    Ok((0..merged.len() / BLOCK_SIZE).all(|i| Fp::read(&merged, i).is_zero()))
}

fn encode(values: &[Fp]) -> Vec<u8> {
    let mut bytes = vec![0; values.len() * BLOCK_SIZE];
    for (i, v) in values.iter().enumerate() {
        v.write(&mut bytes, i);
    }
    bytes
}

/// Runs one blind MAC round on this server's database share.
///
/// Fails with [`Error::BlindMacFailed`] if the MAC of any row does not verify.
#[instrument(level=Level::DEBUG, skip_all, fields(party = ctx.party, %round), err)]
pub async fn verify_round(
    ctx: &Context<'_, impl Channel>,
    round: Round,
    db: &[u8],
    triples: &TripleShares,
) -> Result<(), Error> {
    let params = &ctx.params;
    let masked = masked_shares(params, db, triples);
    let all_masked = broadcast_vec(
        ctx.channel,
        ctx.party,
        params.num_servers(),
        &format!("masked shares ({round})"),
        &masked,
    )
    .await?;
    let opened = merge(&all_masked)?;
    debug!("Opened masked factors");

    let is_leader = ctx.role() == Role::Leader;
    let mut diffs = beaver_product(params, is_leader, db, triples, &opened);
    if params.aggregate() {
        diffs = aggregate(&diffs);
    }
    let all_diffs = broadcast_signed(ctx, &format!("mac differences ({round})"), encode(&diffs)).await?;
    if check_shares_are_zero(&all_diffs)? {
        debug!("All MACs verified");
        Ok(())
    } else {
        warn!("Blind MAC verification failed in {round}");
        Err(Error::BlindMacFailed { round })
    }
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha20Rng;

    use super::*;
    use crate::{
        client::compute_mac,
        dealer::gen_beavers,
        db::Row,
        params::MacMode,
        preprocessing::Preprocessed,
        prg::BatchSeed,
        sharing::share,
    };

    /// Builds a database with valid MACs (or a corrupted tag in `bad_row`) and shares it.
    fn shared_db(params: &Params, bad_row: Option<usize>, rng: &mut ChaCha20Rng) -> Vec<Vec<u8>> {
        let mut db = vec![0; params.db_len()];
        let row_len = params.row_len();
        for i in 0..params.batch_size() {
            for b in 0..params.blocks_per_row() {
                Fp::random(rng).write(&mut db[i * row_len..(i + 1) * row_len], b);
            }
            let row = Row::of(params, &db, i);
            let mut tag = compute_mac(row.payload(), row.key(), params.mode());
            if bad_row == Some(i) {
                tag += Fp::from(rng.random::<u64>() | 1);
            }
            tag.write(&mut db[i * row_len..(i + 1) * row_len], params.tag_block());
        }
        share(params.num_servers(), &db, rng).unwrap()
    }

    /// Runs a round locally, without channels, and returns whether all MACs verified.
    fn run_locally(params: &Params, shares: &[Vec<u8>], rng: &mut ChaCha20Rng) -> bool {
        let n = params.num_servers();
        let seeds: Vec<BatchSeed> = (0..n).map(|_| BatchSeed::random(rng)).collect();
        let c = gen_beavers(params.num_beavers(), Round::BeforeShuffle, &seeds, rng).unwrap();
        let triples: Vec<TripleShares> = seeds
            .iter()
            .enumerate()
            .map(|(p, s)| {
                let mut t = Preprocessed::expand(params, p, s).triples(Round::BeforeShuffle).clone();
                t.c = c[p].clone();
                t
            })
            .collect();
        let masked: Vec<Vec<u8>> = (0..n).map(|p| masked_shares(params, &shares[p], &triples[p])).collect();
        let opened = merge(&masked).unwrap();
        let diffs: Vec<Vec<u8>> = (0..n)
            .map(|p| {
                let d = beaver_product(params, p == 0, &shares[p], &triples[p], &opened);
                encode(&if params.aggregate() { aggregate(&d) } else { d })
            })
            .collect();
        check_shares_are_zero(&diffs).unwrap()
    }

    #[test]
    fn valid_macs_pass() {
        let mut rng = ChaCha20Rng::seed_from_u64(41);
        for (n, mode, aggregate) in [
            (2, MacMode::Full, false),
            (3, MacMode::Messaging, false),
            (4, MacMode::Full, true),
        ] {
            let params = Params::new(n, 3, 32).unwrap().with_mode(mode).with_aggregate(aggregate);
            let shares = shared_db(&params, None, &mut rng);
            assert!(run_locally(&params, &shares, &mut rng));
        }
    }

    #[test]
    fn any_bad_tag_fails_the_batch() {
        let mut rng = ChaCha20Rng::seed_from_u64(42);
        for trial in 0..50 {
            let params = Params::new(2 + trial % 3, 2, 12).unwrap().with_aggregate(trial % 2 == 0);
            let bad = rng.random_range(0..params.batch_size());
            let shares = shared_db(&params, Some(bad), &mut rng);
            assert!(!run_locally(&params, &shares, &mut rng), "trial {trial}");
        }
    }

    #[test]
    fn differences_detect_a_modified_payload_share() {
        let mut rng = ChaCha20Rng::seed_from_u64(43);
        let params = Params::new(3, 1, 4).unwrap();
        let mut shares = shared_db(&params, None, &mut rng);
        let offset = 2 * params.row_len() + params.payload_block() * BLOCK_SIZE;
        let block = Fp::read(&shares[1][offset..], 0) + Fp::ONE;
        block.write(&mut shares[1][offset..], 0);
        assert!(!run_locally(&params, &shares, &mut rng));
    }
}
