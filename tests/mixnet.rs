use futures::future::join_all;
use polyshuffle::{
    channel::{AsyncRecvError, AsyncSendError, Channel, SimpleChannel},
    client::Submission,
    dealer::run_dealer,
    params::{MacMode, Params},
    prg::Round,
    protocol::{BatchOutput, Deployment, Error, run_batch, simulate_batch},
    seal::SecretKey,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn plaintexts(params: &Params, rng: &mut ChaCha20Rng) -> Vec<Vec<u8>> {
    let len = params.msg_blocks() * 16;
    (0..params.batch_size())
        .map(|i| {
            let mut msg = format!("message {i} ").into_bytes();
            while msg.len() < len {
                msg.push(rng.random());
            }
            msg.truncate(len);
            msg
        })
        .collect()
}

fn submissions(
    deployment: &Deployment,
    plaintexts: &[Vec<u8>],
    rng: &mut ChaCha20Rng,
) -> Vec<Submission> {
    let keys = deployment.server_keys();
    plaintexts
        .iter()
        .map(|p| Submission::new(deployment.params(), p, &keys, rng).unwrap())
        .collect()
}

/// Checks that the output holds exactly the given plaintexts, in any order.
fn assert_is_permutation(output: &BatchOutput, plaintexts: &[Vec<u8>]) {
    let mut opened: Vec<Vec<u8>> = output
        .messages
        .iter()
        .map(|m| m.clone().expect("every MAC verifies"))
        .collect();
    let mut expected = plaintexts.to_vec();
    opened.sort();
    expected.sort();
    assert_eq!(opened, expected);
}

async fn run(params: Params, signing: bool, seed: u64) -> Result<(), Error> {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let deployment = Deployment::generate(params, signing, &mut rng)?;
    let plaintexts = plaintexts(&params, &mut rng);
    let submissions = submissions(&deployment, &plaintexts, &mut rng);
    let output = simulate_batch(&deployment, submissions, &mut rng).await?;
    assert_is_permutation(&output, &plaintexts);
    Ok(())
}

#[tokio::test]
async fn two_servers_deliver_all_messages() -> Result<(), Error> {
    init_tracing();
    run(Params::new(2, 1, 5)?, false, 1).await
}

#[tokio::test]
async fn more_servers_deliver_all_messages() -> Result<(), Error> {
    run(Params::new(3, 2, 8)?, false, 2).await?;
    run(Params::new(4, 3, 7)?, false, 3).await
}

#[tokio::test]
async fn messaging_mode_delivers_all_messages() -> Result<(), Error> {
    run(Params::new(3, 4, 6)?.with_mode(MacMode::Messaging), false, 4).await
}

#[tokio::test]
async fn aggregated_differences_deliver_all_messages() -> Result<(), Error> {
    run(Params::new(3, 1, 32)?.with_aggregate(true), false, 5).await
}

#[tokio::test]
async fn signed_rounds_deliver_all_messages() -> Result<(), Error> {
    run(Params::new(3, 1, 4)?, true, 6).await
}

#[tokio::test]
async fn output_order_does_not_follow_submission_order() -> Result<(), Error> {
    let params = Params::new(2, 1, 64)?;
    let mut rng = ChaCha20Rng::seed_from_u64(7);
    let deployment = Deployment::generate(params, false, &mut rng)?;
    let plaintexts = plaintexts(&params, &mut rng);
    let submissions = submissions(&deployment, &plaintexts, &mut rng);
    let output = simulate_batch(&deployment, submissions, &mut rng).await?;
    assert_is_permutation(&output, &plaintexts);
    let in_place = output
        .messages
        .iter()
        .zip(&plaintexts)
        .filter(|(m, p)| m.as_ref() == Some(*p))
        .count();
    assert!(in_place < 16, "{in_place} of 64 messages kept their position");
    Ok(())
}

#[tokio::test]
async fn tampered_tag_aborts_the_batch() -> Result<(), Error> {
    let params = Params::new(3, 1, 4)?;
    let mut rng = ChaCha20Rng::seed_from_u64(8);
    let deployment = Deployment::generate(params, false, &mut rng)?;
    let plaintexts = plaintexts(&params, &mut rng);
    let mut submissions = submissions(&deployment, &plaintexts, &mut rng);
    // the leader's share is in the clear: seed, then tag
    submissions[2].leader_share[16] ^= 1;
    let result = simulate_batch(&deployment, submissions, &mut rng).await;
    assert!(
        matches!(
            result,
            Err(Error::BlindMacFailed {
                round: Round::BeforeShuffle
            })
        ),
        "{result:?}"
    );
    Ok(())
}

#[tokio::test]
async fn tampered_ciphertext_aborts_the_batch() -> Result<(), Error> {
    let params = Params::new(2, 2, 3)?;
    let mut rng = ChaCha20Rng::seed_from_u64(9);
    let deployment = Deployment::generate(params, false, &mut rng)?;
    let plaintexts = plaintexts(&params, &mut rng);
    let mut submissions = submissions(&deployment, &plaintexts, &mut rng);
    let last = submissions[0].leader_share.len() - 1;
    submissions[0].leader_share[last] ^= 1;
    let result = simulate_batch(&deployment, submissions, &mut rng).await;
    assert!(matches!(result, Err(Error::BlindMacFailed { .. })), "{result:?}");
    Ok(())
}

#[tokio::test]
async fn shares_sealed_for_other_keys_are_rejected() -> Result<(), Error> {
    let params = Params::new(2, 1, 2)?;
    let mut rng = ChaCha20Rng::seed_from_u64(10);
    let deployment = Deployment::generate(params, false, &mut rng)?;
    let plaintexts = plaintexts(&params, &mut rng);
    let mut submissions = submissions(&deployment, &plaintexts, &mut rng);
    let stranger = SecretKey::generate(&mut rng).public_key();
    let wrong_keys = vec![stranger, stranger];
    submissions[1] = Submission::new(&params, &plaintexts[1], &wrong_keys, &mut rng)?;
    let result = simulate_batch(&deployment, submissions, &mut rng).await;
    assert!(matches!(result, Err(Error::Seal { .. })), "{result:?}");
    Ok(())
}

#[tokio::test]
async fn wrong_batch_size_is_rejected() -> Result<(), Error> {
    let params = Params::new(2, 1, 3)?;
    let mut rng = ChaCha20Rng::seed_from_u64(11);
    let deployment = Deployment::generate(params, false, &mut rng)?;
    let plaintexts = plaintexts(&params, &mut rng);
    let mut submissions = submissions(&deployment, &plaintexts, &mut rng);
    submissions.pop();
    let result = simulate_batch(&deployment, submissions, &mut rng).await;
    assert!(
        matches!(
            result,
            Err(Error::WrongBatchSize {
                expected: 3,
                actual: 2
            })
        ),
        "{result:?}"
    );
    Ok(())
}

/// A [`SimpleChannel`] that flips a bit in the last byte of every message sent in `phase`.
struct FlippingChannel {
    inner: SimpleChannel,
    phase: Option<&'static str>,
}

impl Channel for FlippingChannel {
    type SendError = AsyncSendError;
    type RecvError = AsyncRecvError;

    async fn send_bytes_to(&self, p: usize, mut msg: Vec<u8>, phase: &str) -> Result<(), AsyncSendError> {
        if self.phase.is_some_and(|p| p == phase) {
            if let Some(last) = msg.last_mut() {
                *last ^= 1;
            }
        }
        self.inner.send_bytes_to(p, msg, phase).await
    }

    async fn recv_bytes_from(&self, p: usize, phase: &str) -> Result<Vec<u8>, AsyncRecvError> {
        self.inner.recv_bytes_from(p, phase).await
    }
}

/// Runs a batch in which the messages that server `cheater` sends in `phase` are modified.
///
/// Returns the result of every server.
async fn run_with_flipped_bit(
    params: Params,
    cheater: usize,
    phase: &'static str,
    seed: u64,
) -> Vec<Result<BatchOutput, Error>> {
    let n = params.num_servers();
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let deployment = Deployment::generate(params, false, &mut rng).unwrap();
    let plaintexts = plaintexts(&params, &mut rng);
    let submissions = submissions(&deployment, &plaintexts, &mut rng);
    let channels: Vec<FlippingChannel> = SimpleChannel::channels(n + 1)
        .into_iter()
        .enumerate()
        .map(|(p, inner)| FlippingChannel {
            inner,
            phase: (p == cheater).then_some(phase),
        })
        .collect();
    let mut rngs: Vec<ChaCha20Rng> = (0..=n).map(|p| ChaCha20Rng::seed_from_u64(seed + 1 + p as u64)).collect();
    let (dealer_rng, server_rngs) = rngs.split_last_mut().unwrap();

    let servers = server_rngs.iter_mut().enumerate().map(|(p, rng)| {
        let channel = &channels[p];
        let deployment = &deployment;
        let submissions: &[Submission] = if p == 0 { &submissions } else { &[] };
        async move {
            let ctx = deployment.context(channel, p)?;
            run_batch(&ctx, submissions, rng).await
        }
    });
    let (dealt, results) = tokio::join!(
        run_dealer(&channels[n], &params, dealer_rng),
        join_all(servers)
    );
    dealt.unwrap();
    results
}

#[tokio::test]
async fn corrupted_shuffle_fails_the_second_mac_round() -> Result<(), Error> {
    let results = run_with_flipped_bit(Params::new(3, 1, 4)?, 1, "shuffle chain", 12).await;
    for result in results {
        assert!(
            matches!(
                result,
                Err(Error::BlindMacFailed {
                    round: Round::AfterShuffle
                })
            ),
            "{result:?}"
        );
    }
    Ok(())
}

#[tokio::test]
async fn altered_reveal_names_the_cheating_server() -> Result<(), Error> {
    let results = run_with_flipped_bit(Params::new(3, 1, 4)?, 1, "reveal", 13).await;
    for (party, result) in results.iter().enumerate() {
        if party == 1 {
            continue;
        }
        assert!(
            matches!(result, Err(Error::CommitmentMismatch { party: 1 })),
            "party {party}: {result:?}"
        );
    }
    Ok(())
}
