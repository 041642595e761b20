//! Oblivious shuffle of the shared database.
//!
//! The servers re-share the database to the leader under their initial masks, then pass it along
//! the chain `0, 1, ..., N - 1`. Every server permutes the rows with its private permutation and
//! masks the result before forwarding it. The non-last servers keep their final masks as output
//! shares, and the last server turns what it received into the matching share by adding the
//! dealer's share translation. The output is a fresh sharing of the database, permuted by the
//! composition of all permutations, so no coalition short of all servers learns the order.

use futures::future::try_join_all;
use tracing::{Level, debug, instrument};

use crate::{
    channel::{Channel, recv_vec_from, send_to},
    preprocessing::Preprocessed,
    protocol::{Context, Error},
    sharing::{Op, add_or_sub},
};

/// Shuffles this server's database share and returns its share of the shuffled database.
#[instrument(level=Level::DEBUG, skip_all, fields(party = ctx.party), err)]
pub async fn shuffle(
    ctx: &Context<'_, impl Channel>,
    pre: &Preprocessed,
    mut db: Vec<u8>,
) -> Result<Vec<u8>, Error> {
    let params = &ctx.params;
    let party = ctx.party;
    let db_len = params.db_len();

    let mut current = if party == 0 {
        let received = try_join_all(
            (1..params.num_servers())
                .map(async |p| recv_vec_from::<u8>(ctx.channel, p, "shuffle input", db_len).await),
        )
        .await?;
        for share in received {
            add_or_sub(&mut db, &share, Op::Add)?;
        }
        db
    } else {
        add_or_sub(&mut db, &pre.initial_mask, Op::Add)?;
        send_to(ctx.channel, 0, "shuffle input", &db).await?;
        recv_vec_from(ctx.channel, party - 1, "shuffle chain", db_len).await?
    };

    current = pre.permutation.permute_db(&current, params.row_len());
    if party == params.last_server() {
        let delta = recv_vec_from(ctx.channel, params.dealer(), "share translation", db_len).await?;
        add_or_sub(&mut current, &delta, Op::Add)?;
        debug!("Applied the share translation");
        Ok(current)
    } else {
        add_or_sub(&mut current, &pre.post_perm_mask, Op::Add)?;
        send_to(ctx.channel, party + 1, "shuffle chain", &current).await?;
        debug!("Forwarded the permuted database");
        Ok(pre.final_mask.clone())
    }
}
