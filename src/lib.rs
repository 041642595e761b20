//! An anonymous messaging mix-net built from secure multi-party computation.
//!
//! Clients secret-share their messages among `N` servers. The servers verify a MAC on every
//! message without seeing it, shuffle the database obliviously, verify the MACs again and only
//! then reveal the shuffled messages. As long as one server is honest, nobody can link a
//! revealed message to the client that sent it, and a server that tampers with the shares is
//! caught before anything is revealed. A trusted dealer provides the correlated randomness.
//!
//! ## Main Components
//!
//! * [`client`]: Preparing a [`client::Submission`] and opening the final rows.
//! * [`protocol`]: The [`protocol::run_batch`] function which runs one batch for a single
//!   server, and [`protocol::simulate_batch`] which runs all parties in memory.
//! * [`dealer`]: The [`dealer::run_dealer`] function of the trusted dealer.
//! * [`channel`]: Communication abstractions for exchanging data between parties.
//!
//! The building blocks are the prime field [`field::Fp`], additive [`sharing`], the AES-based
//! [`prg`], the [`blind_mac`] check, the [`shuffle`] and the [`commit`]-reveal step.
//!
//! ## Example
//!
//! ```
//! use polyshuffle::{
//!     client::Submission,
//!     params::Params,
//!     protocol::{Deployment, simulate_batch},
//! };
//! use rand::SeedableRng;
//! use rand_chacha::ChaCha20Rng;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut rng = ChaCha20Rng::from_os_rng();
//! let params = Params::new(3, 1, 2)?;
//! let deployment = Deployment::generate(params, false, &mut rng)?;
//! let keys = deployment.server_keys();
//! let submissions = vec![
//!     Submission::new(&params, b"hello", &keys, &mut rng)?,
//!     Submission::new(&params, b"world", &keys, &mut rng)?,
//! ];
//! let output = simulate_batch(&deployment, submissions, &mut rng).await?;
//! assert_eq!(output.messages.len(), 2);
//! # Ok(())
//! # }
//! ```
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod auth;
pub mod blind_mac;
pub mod channel;
pub mod client;
pub mod commit;
pub mod db;
pub mod dealer;
pub mod field;
pub mod parallel;
pub mod params;
pub mod preprocessing;
pub mod prg;
pub mod protocol;
pub mod seal;
pub mod sharing;
pub mod shuffle;

mod utils;
