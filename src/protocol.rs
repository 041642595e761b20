//! The mix-net protocol for one batch, as run by the leader, the helpers and the dealer.
//!
//! A batch proceeds in the following steps:
//!
//! 1. Every server draws a [`BatchSeed`] and sends it to the dealer.
//! 2. The leader assigns the client submissions to random slots and forwards the sealed shares
//!    to the helpers, which open them.
//! 3. The servers verify all client MACs with a blind MAC round.
//! 4. The servers obliviously shuffle the database.
//! 5. The servers verify the MACs of the shuffled database with a second blind MAC round.
//! 6. The servers commit to and reveal their shares, and every server opens the messages.

use std::fmt;

use ed25519_dalek::SigningKey;
use rand::{CryptoRng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rayon::prelude::*;
use tokio::task::JoinSet;
use tracing::{Level, debug, instrument, warn};

use crate::{
    auth::{self, Attestor},
    blind_mac::verify_round,
    channel::{self, Channel, SimpleChannel, recv_vec_from, send_to},
    client::{self, Submission, open_rows},
    commit::commit_and_reveal,
    db::{fill_row, pack},
    dealer::run_dealer,
    params::{self, Params},
    preprocessing::Preprocessed,
    prg::{BatchSeed, Round, gen_perm},
    seal::{self, PublicKey, SecretKey},
    sharing,
    shuffle::shuffle,
};

/// Errors occurring during the execution of a batch.
#[derive(Debug)]
pub enum Error {
    /// A message could not be sent or received.
    Channel(channel::Error),
    /// Shares of mismatching lengths were combined.
    Sharing(sharing::Error),
    /// The parameters are invalid.
    Params(params::Error),
    /// A submission could not be prepared.
    Client(client::Error),
    /// A deployment key could not be loaded.
    Auth(auth::Error),
    /// A sealed client share could not be opened.
    Seal {
        /// The slot of the share.
        slot: usize,
        /// The reason for the failure.
        source: seal::Error,
    },
    /// The leader did not receive one submission per slot.
    WrongBatchSize {
        /// The configured batch size.
        expected: usize,
        /// The number of submissions.
        actual: usize,
    },
    /// A slot is out of range or was assigned twice.
    InvalidSlot(u32),
    /// A client share has the wrong length or number of sealed parts.
    MalformedShare(usize),
    /// A server sent a seed of the wrong length to the dealer.
    InvalidSeed(usize),
    /// The MAC of at least one row did not verify.
    BlindMacFailed {
        /// The round in which verification failed.
        round: Round,
    },
    /// A revealed share does not match the commitment of its server.
    CommitmentMismatch {
        /// The server that revealed the share.
        party: usize,
    },
    /// A broadcast message carries an invalid signature.
    InvalidSignature {
        /// The server that sent the message.
        party: usize,
        /// The phase of the message.
        phase: String,
    },
    /// The servers opened different messages.
    Disagreement,
    /// A server phase was invoked for the dealer.
    NotAServer,
    /// A simulated party did not run to completion.
    TaskFailed(String),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Channel(e) => write!(f, "Channel error: {e}"),
            Error::Sharing(e) => write!(f, "Sharing error: {e}"),
            Error::Params(e) => write!(f, "Invalid parameters: {e}"),
            Error::Client(e) => write!(f, "Client error: {e}"),
            Error::Auth(e) => write!(f, "Key error: {e}"),
            Error::Seal { slot, source } => write!(f, "Could not open the share in slot {slot}: {source}"),
            Error::WrongBatchSize { expected, actual } => {
                write!(f, "Expected {expected} submissions, but got {actual}")
            }
            Error::InvalidSlot(slot) => write!(f, "Invalid or duplicate slot {slot}"),
            Error::MalformedShare(slot) => write!(f, "Malformed client share in slot {slot}"),
            Error::InvalidSeed(party) => write!(f, "Party {party} sent an invalid batch seed"),
            Error::BlindMacFailed { round } => write!(f, "Blind MAC verification failed in {round}"),
            Error::CommitmentMismatch { party } => {
                write!(f, "The share of party {party} does not match its commitment")
            }
            Error::InvalidSignature { party, phase } => {
                write!(f, "Invalid signature of party {party} on {phase}")
            }
            Error::Disagreement => f.write_str("The servers opened different messages"),
            Error::NotAServer => f.write_str("The dealer does not hold database shares"),
            Error::TaskFailed(e) => write!(f, "A party did not finish: {e}"),
        }
    }
}

impl From<channel::Error> for Error {
    fn from(e: channel::Error) -> Self {
        Self::Channel(e)
    }
}

impl From<sharing::Error> for Error {
    fn from(e: sharing::Error) -> Self {
        Self::Sharing(e)
    }
}

impl From<params::Error> for Error {
    fn from(e: params::Error) -> Self {
        Self::Params(e)
    }
}

impl From<client::Error> for Error {
    fn from(e: client::Error) -> Self {
        Self::Client(e)
    }
}

impl From<auth::Error> for Error {
    fn from(e: auth::Error) -> Self {
        Self::Auth(e)
    }
}

/// The role played by a particular party in the protocol execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Server 0, which collects the client submissions and starts the shuffle.
    Leader,
    /// One of the servers `1..num_servers`.
    Helper(usize),
    /// The trusted party that provides the preprocessing material.
    Dealer,
}

impl Role {
    /// Selects the role of a party index, where `-1` and `num_servers` denote the dealer.
    pub fn of(index: i64, params: &Params) -> Result<Self, params::Error> {
        let num_servers = params.num_servers();
        match index {
            -1 => Ok(Role::Dealer),
            0 => Ok(Role::Leader),
            i if i > 0 && (i as usize) < num_servers => Ok(Role::Helper(i as usize)),
            i if i > 0 && i as usize == num_servers => Ok(Role::Dealer),
            party => Err(params::Error::PartyDoesNotExist { party, num_servers }),
        }
    }

    /// The channel index of the party.
    pub fn party(&self, params: &Params) -> usize {
        match self {
            Role::Leader => 0,
            Role::Helper(i) => *i,
            Role::Dealer => params.dealer(),
        }
    }

    /// Builds this server's database share from the client submissions.
    ///
    /// The leader distributes `submissions`, helpers receive their shares from the leader.
    pub async fn receive(
        &self,
        ctx: &Context<'_, impl Channel>,
        submissions: &[Submission],
        rng: &mut (impl CryptoRng + Send),
    ) -> Result<Vec<u8>, Error> {
        match self {
            Role::Leader => distribute(ctx, submissions, rng).await,
            Role::Helper(_) => collect(ctx).await,
            Role::Dealer => Err(Error::NotAServer),
        }
    }

    /// Runs a blind MAC round on `db`.
    pub async fn verify_round(
        &self,
        ctx: &Context<'_, impl Channel>,
        pre: &Preprocessed,
        round: Round,
        db: &[u8],
    ) -> Result<(), Error> {
        match self {
            Role::Dealer => Err(Error::NotAServer),
            _ => verify_round(ctx, round, db, pre.triples(round)).await,
        }
    }

    /// Takes this server's turn in the shuffle, returning its share of the shuffled database.
    pub async fn shuffle_step(
        &self,
        ctx: &Context<'_, impl Channel>,
        pre: &Preprocessed,
        db: Vec<u8>,
    ) -> Result<Vec<u8>, Error> {
        match self {
            Role::Dealer => Err(Error::NotAServer),
            _ => shuffle(ctx, pre, db).await,
        }
    }

    /// Commits to and reveals the shuffled share, then opens every row.
    pub async fn reveal(&self, ctx: &Context<'_, impl Channel>, db: &[u8]) -> Result<BatchOutput, Error> {
        if *self == Role::Dealer {
            return Err(Error::NotAServer);
        }
        let merged = commit_and_reveal(ctx, db).await?;
        Ok(BatchOutput {
            messages: open_rows(&ctx.params, &merged),
        })
    }
}

/// Everything a server needs to take part in a batch.
pub struct Context<'a, C: Channel> {
    pub(crate) channel: &'a C,
    pub(crate) params: Params,
    pub(crate) party: usize,
    pub(crate) sealing_key: &'a SecretKey,
    pub(crate) attestor: Option<&'a Attestor>,
}

impl<'a, C: Channel> Context<'a, C> {
    /// Creates the context of server `party`.
    ///
    /// Messages are signed and checked if an `attestor` is given, which all servers must agree on.
    pub fn new(
        channel: &'a C,
        params: Params,
        party: usize,
        sealing_key: &'a SecretKey,
        attestor: Option<&'a Attestor>,
    ) -> Result<Self, Error> {
        if party >= params.num_servers() {
            return Err(Error::Params(params::Error::PartyDoesNotExist {
                party: party as i64,
                num_servers: params.num_servers(),
            }));
        }
        Ok(Context {
            channel,
            params,
            party,
            sealing_key,
            attestor,
        })
    }

    /// The role of this server.
    pub fn role(&self) -> Role {
        if self.party == 0 {
            Role::Leader
        } else {
            Role::Helper(self.party)
        }
    }
}

/// The keys of all servers of a deployment.
#[derive(Debug, Clone)]
pub struct Deployment {
    params: Params,
    sealing_keys: Vec<SecretKey>,
    attestors: Option<Vec<Attestor>>,
}

impl Deployment {
    /// Generates fresh sealing keys, and signing keys if `signing` is set.
    pub fn generate(params: Params, signing: bool, rng: &mut impl CryptoRng) -> Result<Self, Error> {
        let n = params.num_servers();
        let sealing_keys = (0..n).map(|_| SecretKey::generate(rng)).collect();
        let attestors = if signing {
            Some(Self::attestors(auth::generate_keys(n, rng))?)
        } else {
            None
        };
        Ok(Deployment {
            params,
            sealing_keys,
            attestors,
        })
    }

    /// Creates a deployment from existing keys, one per server.
    pub fn from_keys(
        params: Params,
        sealing_keys: Vec<SecretKey>,
        signing_keys: Option<Vec<SigningKey>>,
    ) -> Result<Self, Error> {
        if sealing_keys.len() != params.num_servers() {
            return Err(Error::Client(client::Error::WrongKeyCount {
                expected: params.num_servers(),
                actual: sealing_keys.len(),
            }));
        }
        let attestors = signing_keys.map(Self::attestors).transpose()?;
        Ok(Deployment {
            params,
            sealing_keys,
            attestors,
        })
    }

    fn attestors(keys: Vec<SigningKey>) -> Result<Vec<Attestor>, Error> {
        let public: Vec<[u8; 32]> = keys.iter().map(|k| k.verifying_key().to_bytes()).collect();
        keys.into_iter()
            .enumerate()
            .map(|(p, key)| Ok(Attestor::new(p, key, &public)?))
            .collect()
    }

    /// The parameters of the deployment.
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// The public sealing keys clients encrypt their shares for.
    pub fn server_keys(&self) -> Vec<PublicKey> {
        self.sealing_keys.iter().map(SecretKey::public_key).collect()
    }

    /// The context of server `party`, communicating over `channel`.
    pub fn context<'a, C: Channel>(&'a self, channel: &'a C, party: usize) -> Result<Context<'a, C>, Error> {
        let sealing_key = self.sealing_keys.get(party).ok_or(params::Error::PartyDoesNotExist {
            party: party as i64,
            num_servers: self.params.num_servers(),
        })?;
        let attestor = self.attestors.as_ref().and_then(|a| a.get(party));
        Context::new(channel, self.params, party, sealing_key, attestor)
    }
}

/// The result of a batch: the opened messages in shuffled order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutput {
    /// The zero-padded plaintext of every slot, or `None` if its MAC did not verify.
    pub messages: Vec<Option<Vec<u8>>>,
}

/// Assigns the submissions to random slots, keeps the leader's shares and forwards the rest.
#[instrument(level=Level::DEBUG, skip_all, err)]
async fn distribute(
    ctx: &Context<'_, impl Channel>,
    submissions: &[Submission],
    rng: &mut (impl CryptoRng + Send),
) -> Result<Vec<u8>, Error> {
    let params = &ctx.params;
    let batch = params.batch_size();
    if submissions.len() != batch {
        return Err(Error::WrongBatchSize {
            expected: batch,
            actual: submissions.len(),
        });
    }
    let mut slot_seed = [0; 16];
    rng.fill_bytes(&mut slot_seed);
    let slots = gen_perm(batch, &slot_seed);

    let row_len = params.row_len();
    let mut db = vec![0; params.db_len()];
    let mut forwarded: Vec<Vec<(u32, Vec<u8>)>> = vec![Vec::with_capacity(batch); params.num_servers() - 1];
    for (k, submission) in submissions.iter().enumerate() {
        let slot = slots.get(k);
        if submission.leader_share.len() != params.share_len()
            || submission.sealed_shares.len() != params.num_servers() - 1
        {
            return Err(Error::MalformedShare(slot));
        }
        fill_row(params, &mut db[slot * row_len..(slot + 1) * row_len], &submission.leader_share);
        for (helper, sealed) in forwarded.iter_mut().zip(&submission.sealed_shares) {
            helper.push((slot as u32, sealed.clone()));
        }
    }
    for (h, mut shares) in forwarded.into_iter().enumerate() {
        shares.sort_unstable_by_key(|(slot, _)| *slot);
        send_to(ctx.channel, h + 1, "client shares", &shares).await?;
    }
    debug!("Forwarded {batch} sealed shares to every helper");
    Ok(db)
}

/// Receives this helper's sealed shares from the leader and opens them into its database share.
#[instrument(level=Level::DEBUG, skip_all, err)]
async fn collect(ctx: &Context<'_, impl Channel>) -> Result<Vec<u8>, Error> {
    let params = &ctx.params;
    let batch = params.batch_size();
    let shares: Vec<(u32, Vec<u8>)> = recv_vec_from(ctx.channel, 0, "client shares", batch).await?;
    let mut by_slot: Vec<Option<&[u8]>> = vec![None; batch];
    for (slot, sealed) in &shares {
        match by_slot.get_mut(*slot as usize) {
            Some(entry) if entry.is_none() => *entry = Some(sealed.as_slice()),
            _ => {
                warn!(slot, "Leader sent an invalid slot");
                return Err(Error::InvalidSlot(*slot));
            }
        }
    }
    let sealing_key = ctx.sealing_key;
    let rows = by_slot
        .par_iter()
        .enumerate()
        .map(|(slot, sealed)| {
            let sealed = sealed.ok_or(Error::MalformedShare(slot))?;
            let share = sealing_key
                .open(sealed)
                .map_err(|source| Error::Seal { slot, source })?;
            if share.len() != params.share_len() {
                return Err(Error::MalformedShare(slot));
            }
            let mut row = vec![0; params.row_len()];
            fill_row(params, &mut row, &share);
            Ok(row)
        })
        .collect::<Result<Vec<_>, _>>()?;
    debug!("Opened {batch} client shares");
    Ok(pack(&rows))
}

/// Runs one batch as the server of `ctx`, returning the opened messages.
///
/// Only the leader uses `submissions`; helpers receive their shares from the leader.
#[instrument(level=Level::DEBUG, skip_all, fields(party = ctx.party), err)]
pub async fn run_batch(
    ctx: &Context<'_, impl Channel>,
    submissions: &[Submission],
    rng: &mut (impl CryptoRng + Send),
) -> Result<BatchOutput, Error> {
    let params = &ctx.params;
    let seed = BatchSeed::random(rng);
    send_to(ctx.channel, params.dealer(), "batch seed", &seed.as_bytes().to_vec()).await?;
    let mut pre = Preprocessed::expand(params, ctx.party, &seed);

    let role = ctx.role();
    let db = role.receive(ctx, submissions, rng).await?;

    pre.receive_triples(ctx, Round::BeforeShuffle).await?;
    role.verify_round(ctx, &pre, Round::BeforeShuffle, &db).await?;

    let shuffled = role.shuffle_step(ctx, &pre, db).await?;

    pre.receive_triples(ctx, Round::AfterShuffle).await?;
    role.verify_round(ctx, &pre, Round::AfterShuffle, &shuffled).await?;

    let output = role.reveal(ctx, &shuffled).await?;
    debug!(
        valid = output.messages.iter().filter(|m| m.is_some()).count(),
        "Batch finished"
    );
    Ok(output)
}

/// Simulates a batch with all servers and the dealer in memory.
///
/// Returns the output every server agreed on. If some parties fail, the first error that is not
/// a consequence of another party leaving the protocol is returned.
pub async fn simulate_batch(
    deployment: &Deployment,
    submissions: Vec<Submission>,
    rng: &mut impl CryptoRng,
) -> Result<BatchOutput, Error> {
    let params = *deployment.params();
    let n = params.num_servers();
    let mut tasks: JoinSet<(usize, Result<Option<BatchOutput>, Error>)> = JoinSet::new();
    let mut submissions = Some(submissions);
    for (party, channel) in SimpleChannel::channels(n + 1).into_iter().enumerate() {
        let mut party_rng = ChaCha20Rng::from_rng(&mut *rng);
        if party == n {
            tasks.spawn(async move {
                let res = run_dealer(&channel, &params, &mut party_rng).await;
                (party, res.map(|()| None))
            });
        } else {
            let deployment = deployment.clone();
            let submissions = if party == 0 {
                submissions.take().unwrap_or_default()
            } else {
                vec![]
            };
            tasks.spawn(async move {
                let res = async {
                    let ctx = deployment.context(&channel, party)?;
                    run_batch(&ctx, &submissions, &mut party_rng).await
                }
                .await;
                (party, res.map(Some))
            });
        }
    }

    let mut results: Vec<Option<Result<Option<BatchOutput>, Error>>> = (0..=n).map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((party, res)) => results[party] = Some(res),
            Err(e) => return Err(Error::TaskFailed(e.to_string())),
        }
    }

    let mut outputs = vec![];
    let mut errors = vec![];
    for res in results.into_iter().flatten() {
        match res {
            Ok(Some(output)) => outputs.push(output),
            Ok(None) => {}
            Err(e) => errors.push(e),
        }
    }
    if !errors.is_empty() {
        let first = errors
            .iter()
            .position(|e| !matches!(e, Error::Channel(_)))
            .unwrap_or(0);
        return Err(errors.swap_remove(first));
    }
    let Some((first, rest)) = outputs.split_first() else {
        return Err(Error::TaskFailed("no server finished".to_string()));
    };
    if rest.iter().any(|o| o != first) {
        return Err(Error::Disagreement);
    }
    Ok(first.clone())
}
