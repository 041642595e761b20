//! Batch parameters shared by all parties, and the database layout derived from them.

use serde::{Deserialize, Serialize};

use crate::field::BLOCK_SIZE;

/// Errors caused by invalid batch parameters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The protocol needs at least two shuffling servers.
    #[error("at least 2 servers are required, but {0} were specified")]
    TooFewServers(usize),
    /// Every message needs at least one block.
    #[error("messages must be at least one block long")]
    EmptyMessages,
    /// Every batch needs at least one message.
    #[error("batches must contain at least one message")]
    EmptyBatch,
    /// The party index is neither a server nor the dealer.
    #[error("party {party} does not exist for {num_servers} servers")]
    PartyDoesNotExist {
        /// The offending party index.
        party: i64,
        /// The number of shuffling servers.
        num_servers: usize,
    },
}

/// Which part of a message is covered by its MAC.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MacMode {
    /// Every payload block is MACed under a key expanded from the client's seeds.
    #[default]
    Full,
    /// Only the first payload block (the stream key) is MACed, the seeds are the key.
    Messaging,
}

/// The parameters of a batch, which must be identical for all parties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    num_servers: usize,
    msg_blocks: usize,
    batch_size: usize,
    mode: MacMode,
    aggregate: bool,
}

impl Params {
    /// Validates and creates the parameters of a batch.
    ///
    /// `msg_blocks` is the plaintext length in blocks.
    pub fn new(num_servers: usize, msg_blocks: usize, batch_size: usize) -> Result<Self, Error> {
        if num_servers < 2 {
            return Err(Error::TooFewServers(num_servers));
        }
        if msg_blocks == 0 {
            return Err(Error::EmptyMessages);
        }
        if batch_size == 0 {
            return Err(Error::EmptyBatch);
        }
        Ok(Params {
            num_servers,
            msg_blocks,
            batch_size,
            mode: MacMode::Full,
            aggregate: false,
        })
    }

    /// Switches the MAC mode.
    pub fn with_mode(mut self, mode: MacMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sums the blind MAC differences per worker chunk instead of per row.
    pub fn with_aggregate(mut self, aggregate: bool) -> Self {
        self.aggregate = aggregate;
        self
    }

    /// The number of shuffling servers.
    pub fn num_servers(&self) -> usize {
        self.num_servers
    }

    /// The plaintext length in blocks.
    pub fn msg_blocks(&self) -> usize {
        self.msg_blocks
    }

    /// The number of messages per batch.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// The MAC mode.
    pub fn mode(&self) -> MacMode {
        self.mode
    }

    /// Whether blind MAC differences are aggregated per worker chunk.
    pub fn aggregate(&self) -> bool {
        self.aggregate
    }

    /// The index of the server that applies the last permutation.
    pub fn last_server(&self) -> usize {
        self.num_servers - 1
    }

    /// The channel index of the dealer.
    pub fn dealer(&self) -> usize {
        self.num_servers
    }

    /// Blocks of the payload: the stream key followed by the ciphertext.
    pub fn payload_blocks(&self) -> usize {
        self.msg_blocks + 1
    }

    /// Blocks covered by the MAC, which is also the length of the MAC key.
    pub fn key_blocks(&self) -> usize {
        match self.mode {
            MacMode::Full => self.payload_blocks(),
            MacMode::Messaging => 1,
        }
    }

    /// Blocks per database row: key share, tag and payload.
    pub fn blocks_per_row(&self) -> usize {
        self.key_blocks() + 1 + self.payload_blocks()
    }

    /// Bytes per database row.
    pub fn row_len(&self) -> usize {
        self.blocks_per_row() * BLOCK_SIZE
    }

    /// Bytes of a party's flattened database share.
    pub fn db_len(&self) -> usize {
        self.batch_size * self.row_len()
    }

    /// Beaver triples consumed per blind MAC round.
    pub fn num_beavers(&self) -> usize {
        self.batch_size * self.key_blocks()
    }

    /// Bytes of the body a client shares: the tag followed by the payload.
    pub fn body_len(&self) -> usize {
        (1 + self.payload_blocks()) * BLOCK_SIZE
    }

    /// Bytes a server receives from a client: key-share seed followed by the body share.
    pub fn share_len(&self) -> usize {
        BLOCK_SIZE + self.body_len()
    }

    /// Block index of the tag within a row.
    pub fn tag_block(&self) -> usize {
        self.key_blocks()
    }

    /// Block index of the first payload block within a row.
    pub fn payload_block(&self) -> usize {
        self.key_blocks() + 1
    }
}
