//! Parameter files shared by all parties of a deployment.
//!
//! A parameter file lists one `host:port` address per server, followed by any number of
//! parameter sets. Each set is four lines: `PARAMS`, the number of servers, the number of
//! message blocks and the batch size. Blank lines are ignored.

use std::path::Path;

use anyhow::{Context, anyhow, bail};
use ed25519_dalek::SigningKey;
use polyshuffle::{
    params::{MacMode, Params},
    protocol::Deployment,
    seal::SecretKey,
};

/// One parameter set of a parameter file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamSet {
    pub num_servers: usize,
    pub msg_blocks: usize,
    pub batch_size: usize,
}

/// The server addresses and parameter sets of a parameter file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamFile {
    pub addrs: Vec<String>,
    pub sets: Vec<ParamSet>,
}

impl ParamFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("could not read parameter file {}", path.display()))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let mut lines = text
            .lines()
            .enumerate()
            .map(|(i, l)| (i + 1, l.trim()))
            .filter(|(_, l)| !l.is_empty())
            .peekable();

        let mut addrs = vec![];
        while let Some((n, line)) = lines.next_if(|(_, l)| *l != "PARAMS") {
            let port = line
                .rsplit_once(':')
                .map(|(_, port)| port)
                .ok_or_else(|| anyhow!("line {n}: server address {line:?} has no port"))?;
            port.parse::<u16>()
                .with_context(|| format!("line {n}: invalid port in {line:?}"))?;
            addrs.push(line.to_string());
        }

        let mut sets = vec![];
        while let Some((n, line)) = lines.next() {
            if line != "PARAMS" {
                bail!("line {n}: expected PARAMS, found {line:?}");
            }
            let mut number = |what: &str| -> anyhow::Result<usize> {
                let (n, line) = lines
                    .next()
                    .ok_or_else(|| anyhow!("parameter set is missing the {what}"))?;
                line.parse()
                    .with_context(|| format!("line {n}: invalid {what} {line:?}"))
            };
            sets.push(ParamSet {
                num_servers: number("number of servers")?,
                msg_blocks: number("number of message blocks")?,
                batch_size: number("batch size")?,
            });
        }
        Ok(ParamFile { addrs, sets })
    }

    /// Selects the parameter set `choice`, counting from 1.
    pub fn choose(&self, choice: usize) -> anyhow::Result<ParamSet> {
        if choice == 0 {
            bail!("parameter choices start at 1");
        }
        let set = *self.sets.get(choice - 1).ok_or_else(|| {
            anyhow!(
                "parameter choice {choice} does not exist, the file has {} sets",
                self.sets.len()
            )
        })?;
        if set.num_servers != self.addrs.len() {
            bail!(
                "parameter set {choice} uses {} servers, but the file lists {} addresses",
                set.num_servers,
                self.addrs.len()
            );
        }
        Ok(set)
    }
}

impl ParamSet {
    pub fn to_params(self, mode: MacMode, aggregate: bool) -> anyhow::Result<Params> {
        Ok(Params::new(self.num_servers, self.msg_blocks, self.batch_size)?
            .with_mode(mode)
            .with_aggregate(aggregate))
    }
}

/// Derives the keys of all servers from their indices.
///
/// Every party can compute every key, so this is only fit for benchmarks.
pub fn demo_deployment(params: Params, signing: bool) -> anyhow::Result<Deployment> {
    let n = params.num_servers();
    let derive = |context: &str, party: usize| blake3::derive_key(context, &(party as u64).to_le_bytes());
    let sealing_keys = (0..n)
        .map(|p| SecretKey::from_bytes(derive("polyshuffle demo sealing key", p)))
        .collect();
    let signing_keys = signing.then(|| {
        (0..n)
            .map(|p| SigningKey::from_bytes(&derive("polyshuffle demo signing key", p)))
            .collect()
    });
    Ok(Deployment::from_keys(params, sealing_keys, signing_keys)?)
}
