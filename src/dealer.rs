//! The dealer as a trusted party, providing the correlated randomness of a batch.
//!
//! Every server sends its [`BatchSeed`] to the dealer. From the seeds the dealer knows each
//! server's shares of the Beaver factors `a` and `b`, and all masks and permutations of the
//! shuffle. It returns shares of the products `c = a * b` for both blind MAC rounds and, to the
//! last server of the shuffle, the share translation `Delta` that turns the masked shuffle
//! output into a sharing of the shuffled database.
//!
//! The dealer can therefore undo the shuffle and must not collude with any server.

use futures::future::try_join_all;
use rand::CryptoRng;
use rayon::prelude::*;
use tracing::{Level, debug, instrument};

use crate::{
    channel::{Channel, recv_from, send_to},
    field::{BLOCK_SIZE, Fp},
    params::Params,
    parallel::for_each_chunk_mut,
    prg::{BatchSeed, Round, aes_prg, gen_perm},
    protocol::Error,
    sharing::{self, Op, add_or_sub, double_add_or_sub, merge, share},
};

/// Computes fresh shares of `c = a * b` for the Beaver triples of `round`.
///
/// The factors are the sums of the servers' expanded seeds, so the dealer only needs to send
/// `c`. Returns one share of `c` per server.
pub fn gen_beavers(
    num_beavers: usize,
    round: Round,
    seeds: &[BatchSeed],
    rng: &mut impl CryptoRng,
) -> Result<Vec<Vec<u8>>, sharing::Error> {
    let len = num_beavers * BLOCK_SIZE;
    let a_shares: Vec<Vec<u8>> = seeds
        .par_iter()
        .map(|s| aes_prg(len, &s.beaver_a(round)))
        .collect();
    let b_shares: Vec<Vec<u8>> = seeds
        .par_iter()
        .map(|s| aes_prg(len, &s.beaver_b(round)))
        .collect();
    let a = merge(&a_shares)?;
    let b = merge(&b_shares)?;
    let mut c = vec![0; len];
    for_each_chunk_mut(&mut c, BLOCK_SIZE, |first, chunk| {
        for i in 0..chunk.len() / BLOCK_SIZE {
            (Fp::read(&a, first + i) * Fp::read(&b, first + i)).write(chunk, i);
        }
    });
    share(seeds.len(), &c, rng)
}

/// Computes the share translation `Delta` the last server adds after its permutation.
///
/// Replays the shuffle on the masks alone: the initial masks of servers `1..N` are summed,
/// permuted by every server's permutation, and masked after every permutation but the last.
/// `Delta` cancels the result together with the final masks the other servers keep.
pub fn gen_share_translation(
    batch_size: usize,
    row_len: usize,
    seeds: &[BatchSeed],
) -> Result<Vec<u8>, sharing::Error> {
    let db_len = batch_size * row_len;
    let Some((last, rest)) = seeds.split_last() else {
        return Err(sharing::Error::NoShares);
    };
    let mut acc = vec![0; db_len];
    for seed in seeds.iter().skip(1) {
        add_or_sub(&mut acc, &aes_prg(db_len, &seed.initial_mask()), Op::Add)?;
    }
    for seed in rest {
        acc = gen_perm(batch_size, &seed.permutation()).permute_db(&acc, row_len);
        add_or_sub(&mut acc, &aes_prg(db_len, &seed.post_perm_mask()), Op::Add)?;
    }
    acc = gen_perm(batch_size, &last.permutation()).permute_db(&acc, row_len);

    let mut final_sum = vec![0; db_len];
    for seed in rest {
        add_or_sub(&mut final_sum, &aes_prg(db_len, &seed.final_mask()), Op::Add)?;
    }
    let mut delta = vec![0; db_len];
    double_add_or_sub(&mut delta, &acc, &final_sum, Op::Sub, Op::Sub)?;
    Ok(delta)
}

/// Runs the dealer for one batch, communicating with all servers.
#[instrument(level=Level::DEBUG, skip_all, err)]
pub async fn run_dealer(
    channel: &impl Channel,
    params: &Params,
    rng: &mut (impl CryptoRng + Send),
) -> Result<(), Error> {
    let servers = params.num_servers();
    debug!("Dealer for {servers} servers");
    let seeds: Vec<Vec<u8>> =
        try_join_all((0..servers).map(async |p| recv_from(channel, p, "batch seed").await)).await?;
    let seeds = seeds
        .iter()
        .enumerate()
        .map(|(p, s)| BatchSeed::from_slice(s).ok_or(Error::InvalidSeed(p)))
        .collect::<Result<Vec<_>, _>>()?;

    let c1 = gen_beavers(params.num_beavers(), Round::BeforeShuffle, &seeds, rng)?;
    try_join_all(
        c1.iter()
            .enumerate()
            .map(async |(p, c)| send_to(channel, p, "beaver c (round 1)", c).await),
    )
    .await?;
    debug!("Dealer sent triples for round 1");

    let delta = gen_share_translation(params.batch_size(), params.row_len(), &seeds)?;
    send_to(channel, params.last_server(), "share translation", &delta).await?;
    debug!("Dealer sent the share translation");

    let c2 = gen_beavers(params.num_beavers(), Round::AfterShuffle, &seeds, rng)?;
    try_join_all(
        c2.iter()
            .enumerate()
            .map(async |(p, c)| send_to(channel, p, "beaver c (round 2)", c).await),
    )
    .await?;
    debug!("Dealer sent triples for round 2");
    Ok(())
}
