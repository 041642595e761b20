//! A TCP-based polyshuffle server, dealer and benchmark harness.
use std::{path::PathBuf, time::Instant};

use anyhow::Context;
use clap::Parser;
use polyshuffle::{
    client::Submission,
    dealer::run_dealer,
    params::MacMode,
    protocol::{Role, run_batch},
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan};

use crate::{config::ParamFile, tcp::TcpChannel};

mod config;
mod tcp;

/// Runs one party of a polyshuffle mix-net over TCP.
///
/// Party 0 is the leader and submits random messages on behalf of simulated clients. Parties
/// `1..N` are helpers, and the dealer is party `-1` (or `N`). All parties must use the same
/// parameter file and flags. The keys of all servers are derived from their indices, so this
/// is a benchmark harness and not a secure deployment.
///
/// Logging can be controlled with an EnvFilter via the `POLYSHUFFLE_LOG` environment
/// variable.
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// The index of this party.
    #[arg(long, allow_hyphen_values = true)]
    party: i64,
    /// The parameter file with the server addresses and parameter sets.
    #[arg(long, default_value = "params.txt")]
    params: PathBuf,
    /// The parameter set to use, counting from 1.
    #[arg(long, default_value_t = 1)]
    choice: usize,
    /// Authenticate only the first message block, with a single key block per row.
    #[arg(long)]
    messaging: bool,
    /// Open the MAC differences summed per chunk instead of per row.
    #[arg(long)]
    aggregate: bool,
    /// Sign the commitments and MAC differences.
    #[arg(long)]
    sign: bool,
    /// Number of batches to run over the same connections.
    #[arg(long, default_value_t = 1)]
    batches: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing().context("tracing initialization")?;

    let cli = Cli::parse();
    let file = ParamFile::load(&cli.params)?;
    let mode = if cli.messaging {
        MacMode::Messaging
    } else {
        MacMode::Full
    };
    let params = file.choose(cli.choice)?.to_params(mode, cli.aggregate)?;
    let role = Role::of(cli.party, &params)?;
    info!(
        ?role,
        servers = params.num_servers(),
        msg_blocks = params.msg_blocks(),
        batch_size = params.batch_size(),
        ?mode,
        aggregate = cli.aggregate,
        sign = cli.sign,
        "Starting"
    );

    let party = role.party(&params);
    let channel = TcpChannel::connect(party, &file.addrs, params.num_servers() + 1)
        .await
        .context("connecting to the other parties")?;
    let mut rng = ChaCha20Rng::from_os_rng();

    if role == Role::Dealer {
        for batch in 0..cli.batches {
            let start = Instant::now();
            run_dealer(&channel, &params, &mut rng).await?;
            info!(batch, elapsed = ?start.elapsed(), "Dealt batch");
        }
        return Ok(());
    }

    let deployment = config::demo_deployment(params, cli.sign)?;
    let ctx = deployment.context(&channel, party)?;
    let keys = deployment.server_keys();
    for batch in 0..cli.batches {
        let submissions = if role == Role::Leader {
            let start = Instant::now();
            let submissions = (0..params.batch_size())
                .map(|_| {
                    let mut msg = vec![0; params.msg_blocks() * 16];
                    rng.fill(&mut msg[..]);
                    Submission::new(&params, &msg, &keys, &mut rng)
                })
                .collect::<Result<Vec<_>, _>>()?;
            info!(elapsed = ?start.elapsed(), "Simulated client submissions");
            submissions
        } else {
            vec![]
        };

        let start = Instant::now();
        let output = run_batch(&ctx, &submissions, &mut rng).await?;
        let valid = output.messages.iter().filter(|m| m.is_some()).count();
        info!(batch, valid, elapsed = ?start.elapsed(), "Finished batch");
    }
    Ok(())
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_env_var("POLYSHUFFLE_LOG")
        .with_default_directive("polyshuffle_server=info".parse()?)
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    Ok(())
}
