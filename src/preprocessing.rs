//! A server's preprocessing material for one batch, expanded from its [`BatchSeed`].
//!
//! Everything except the Beaver products `c` (and the share translation, which the last server
//! receives during the shuffle) is derived locally, so the dealer only has to send what depends
//! on the seeds of more than one server.

use tracing::{Level, debug, instrument};

use crate::{
    channel::{Channel, recv_vec_from},
    field::BLOCK_SIZE,
    params::Params,
    prg::{BatchSeed, Permutation, Round, aes_prg, gen_perm},
    protocol::{Context, Error},
};

/// A server's shares of the Beaver triples of one blind MAC round.
///
/// `a` masks the MAC key blocks and `b` the MACed payload blocks; `c` is empty until it has been
/// received from the dealer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TripleShares {
    /// Shares of the first factors.
    pub a: Vec<u8>,
    /// Shares of the second factors.
    pub b: Vec<u8>,
    /// Shares of the products.
    pub c: Vec<u8>,
}

/// The masks, permutation and triples a server uses in one batch.
#[derive(Debug, Clone)]
pub struct Preprocessed {
    pub(crate) initial_mask: Vec<u8>,
    pub(crate) final_mask: Vec<u8>,
    pub(crate) post_perm_mask: Vec<u8>,
    pub(crate) permutation: Permutation,
    before_shuffle: TripleShares,
    after_shuffle: TripleShares,
}

impl Preprocessed {
    /// Expands the material of `party` from its batch seed.
    ///
    /// The leader never masks its input, and the last server keeps no final mask and adds no
    /// mask after its permutation, so those masks are left empty.
    pub fn expand(params: &Params, party: usize, seed: &BatchSeed) -> Self {
        let db_len = params.db_len();
        let mask = |active: bool, seed| if active { aes_prg(db_len, &seed) } else { vec![] };
        let is_last = party == params.last_server();
        let triples = |round| {
            let len = params.num_beavers() * BLOCK_SIZE;
            TripleShares {
                a: aes_prg(len, &seed.beaver_a(round)),
                b: aes_prg(len, &seed.beaver_b(round)),
                c: vec![],
            }
        };
        Preprocessed {
            initial_mask: mask(party != 0, seed.initial_mask()),
            final_mask: mask(!is_last, seed.final_mask()),
            post_perm_mask: mask(!is_last, seed.post_perm_mask()),
            permutation: gen_perm(params.batch_size(), &seed.permutation()),
            before_shuffle: triples(Round::BeforeShuffle),
            after_shuffle: triples(Round::AfterShuffle),
        }
    }

    /// The triple shares of `round`.
    pub fn triples(&self, round: Round) -> &TripleShares {
        match round {
            Round::BeforeShuffle => &self.before_shuffle,
            Round::AfterShuffle => &self.after_shuffle,
        }
    }

    /// Receives this server's shares of the Beaver products of `round` from the dealer.
    #[instrument(level=Level::DEBUG, skip_all, fields(%round), err)]
    pub async fn receive_triples(
        &mut self,
        ctx: &Context<'_, impl Channel>,
        round: Round,
    ) -> Result<(), Error> {
        let params = &ctx.params;
        let phase = match round {
            Round::BeforeShuffle => "beaver c (round 1)",
            Round::AfterShuffle => "beaver c (round 2)",
        };
        let c = recv_vec_from(
            ctx.channel,
            params.dealer(),
            phase,
            params.num_beavers() * BLOCK_SIZE,
        )
        .await?;
        debug!(len = c.len(), "Received Beaver products");
        match round {
            Round::BeforeShuffle => self.before_shuffle.c = c,
            Round::AfterShuffle => self.after_shuffle.c = c,
        }
        Ok(())
    }
}
