//! A communication channel used to send/receive messages to/from another party.
//!
//! Messages are serialized with bincode and wrapped in a small frame: a format version byte
//! followed by the big-endian length of the payload. Receivers check both before decoding, and
//! also check the number of elements whenever the protocol expects a vector of fixed length.

use std::{fmt, future::Future, time::Duration};

use futures::future::{try_join, try_join_all};
use serde::{Serialize, de::DeserializeOwned};
use tokio::{
    sync::{
        Mutex,
        mpsc::{Receiver, Sender, channel, error::SendError},
    },
    time::timeout,
};
use tracing::trace;

/// The version of the framing format.
pub const FRAME_VERSION: u8 = 1;

const HEADER_LEN: usize = 5;

/// Errors related to sending / receiving / (de-)serializing messages.
#[derive(Debug)]
pub struct Error {
    /// The protocol phase during which the error occurred.
    pub phase: String,
    /// The specific error that was raised.
    pub reason: ErrorKind,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} during {}", self.reason, self.phase)
    }
}

impl std::error::Error for Error {}

/// The specific error that occurred when trying to send / receive a message.
#[derive(Debug)]
pub enum ErrorKind {
    /// The (serialized) message could not be received over the channel.
    RecvError(String),
    /// The (serialized) message could not be sent over the channel.
    SendError(String),
    /// The message could not be serialized (before sending it out).
    SerdeError(String),
    /// The frame header is missing or does not match the payload.
    InvalidFrame,
    /// The frame was written with an unknown format version.
    UnsupportedVersion(u8),
    /// The message is a Vec, but not of the expected length.
    InvalidLength {
        /// The number of elements the protocol expects.
        expected: usize,
        /// The number of elements that were received.
        actual: usize,
    },
}

/// A communication channel used to send/receive messages to/from another party.
///
/// Servers are parties `0..num_servers`, the dealer is party `num_servers`.
pub trait Channel {
    /// The error that can occur sending messages over the channel.
    type SendError: fmt::Debug;
    /// The error that can occur receiving messages over the channel.
    type RecvError: fmt::Debug;

    /// Sends a message to the party with the given index.
    fn send_bytes_to(
        &self,
        party: usize,
        msg: Vec<u8>,
        phase: &str,
    ) -> impl Future<Output = Result<(), Self::SendError>> + Send;

    /// Awaits a message from the party with the given index.
    fn recv_bytes_from(
        &self,
        party: usize,
        phase: &str,
    ) -> impl Future<Output = Result<Vec<u8>, Self::RecvError>> + Send;
}

/// Serializes a message and prepends the frame header.
pub(crate) fn frame(msg: &impl Serialize) -> Result<Vec<u8>, bincode::Error> {
    let payload = bincode::serialize(msg)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| Box::new(bincode::ErrorKind::SizeLimit))?;
    let mut framed = Vec::with_capacity(HEADER_LEN + payload.len());
    framed.push(FRAME_VERSION);
    framed.extend(len.to_be_bytes());
    framed.extend(payload);
    Ok(framed)
}

/// Checks the frame header and returns the payload.
pub(crate) fn unframe(bytes: &[u8]) -> Result<&[u8], ErrorKind> {
    let Some((header, payload)) = bytes.split_first_chunk::<HEADER_LEN>() else {
        return Err(ErrorKind::InvalidFrame);
    };
    if header[0] != FRAME_VERSION {
        return Err(ErrorKind::UnsupportedVersion(header[0]));
    }
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len != payload.len() {
        return Err(ErrorKind::InvalidFrame);
    }
    Ok(payload)
}

/// Serializes and sends a message to the other party.
pub(crate) async fn send_to(
    channel: &impl Channel,
    party: usize,
    phase: &str,
    msg: &impl Serialize,
) -> Result<(), Error> {
    let msg = frame(msg).map_err(|e| Error {
        phase: format!("sending {phase}"),
        reason: ErrorKind::SerdeError(format!("{e:?}")),
    })?;
    channel
        .send_bytes_to(party, msg, phase)
        .await
        .map_err(|e| Error {
            phase: phase.to_string(),
            reason: ErrorKind::SendError(format!("{e:?}")),
        })
}

/// Receives and deserializes a message from the other party.
pub(crate) async fn recv_from<T: DeserializeOwned>(
    channel: &impl Channel,
    party: usize,
    phase: &str,
) -> Result<T, Error> {
    let msg = channel
        .recv_bytes_from(party, phase)
        .await
        .map_err(|e| Error {
            phase: phase.to_string(),
            reason: ErrorKind::RecvError(format!("{e:?}")),
        })?;
    let payload = unframe(&msg).map_err(|reason| Error {
        phase: format!("receiving {phase}"),
        reason,
    })?;
    bincode::deserialize(payload).map_err(|e| Error {
        phase: format!("receiving {phase}"),
        reason: ErrorKind::SerdeError(format!("{e:?}")),
    })
}

/// Receives and deserializes a Vec from the other party (while checking the length).
pub(crate) async fn recv_vec_from<T: DeserializeOwned>(
    channel: &impl Channel,
    party: usize,
    phase: &str,
    len: usize,
) -> Result<Vec<T>, Error> {
    let v: Vec<T> = recv_from(channel, party, phase).await?;
    if v.len() == len {
        Ok(v)
    } else {
        Err(Error {
            phase: phase.to_string(),
            reason: ErrorKind::InvalidLength {
                expected: len,
                actual: v.len(),
            },
        })
    }
}

/// Sends `msg` to all other servers and returns the messages of all servers, ordered by party.
///
/// The entry at `own` is a copy of `msg`.
pub(crate) async fn broadcast<T>(
    channel: &impl Channel,
    own: usize,
    num_servers: usize,
    phase: &str,
    msg: &T,
) -> Result<Vec<T>, Error>
where
    T: Serialize + DeserializeOwned + Clone + Sync,
{
    let others = || (0..num_servers).filter(move |&p| p != own);
    let (_, received) = try_join(
        try_join_all(others().map(async |p| send_to(channel, p, phase, msg).await)),
        try_join_all(others().map(async |p| recv_from::<T>(channel, p, phase).await)),
    )
    .await?;
    Ok(insert_own(own, msg, received))
}

/// Like [`broadcast`], but rejects any received Vec that does not have `msg.len()` elements.
pub(crate) async fn broadcast_vec<T>(
    channel: &impl Channel,
    own: usize,
    num_servers: usize,
    phase: &str,
    msg: &Vec<T>,
) -> Result<Vec<Vec<T>>, Error>
where
    T: Serialize + DeserializeOwned + Clone + Sync,
{
    let len = msg.len();
    let others = || (0..num_servers).filter(move |&p| p != own);
    let (_, received) = try_join(
        try_join_all(others().map(async |p| send_to(channel, p, phase, msg).await)),
        try_join_all(others().map(async |p| recv_vec_from::<T>(channel, p, phase, len).await)),
    )
    .await?;
    Ok(insert_own(own, msg, received))
}

fn insert_own<T: Clone>(own: usize, msg: &T, received: Vec<T>) -> Vec<T> {
    let mut all = Vec::with_capacity(received.len() + 1);
    let mut received = received.into_iter();
    all.extend(received.by_ref().take(own));
    all.push(msg.clone());
    all.extend(received);
    all
}

/// A simple in-memory channel using [`Sender`] and [`Receiver`].
#[derive(Debug)]
pub struct SimpleChannel {
    s: Vec<Option<Sender<Vec<u8>>>>,
    r: Vec<Option<Mutex<Receiver<Vec<u8>>>>>,
}

impl SimpleChannel {
    /// Creates channels for N parties to communicate with each other.
    pub fn channels(parties: usize) -> Vec<Self> {
        let buffer_capacity = 1024;
        let mut channels: Vec<SimpleChannel> = (0..parties)
            .map(|_| SimpleChannel {
                s: (0..parties).map(|_| None).collect(),
                r: (0..parties).map(|_| None).collect(),
            })
            .collect();
        for a in 0..parties {
            for b in 0..parties {
                if a == b {
                    continue;
                }
                let (send_a_to_b, recv_a_to_b) = channel(buffer_capacity);
                channels[a].s[b] = Some(send_a_to_b);
                channels[b].r[a] = Some(Mutex::new(recv_a_to_b));
            }
        }
        channels
    }
}

#[derive(Debug)]
/// The error raised by `recv` calls of a [`SimpleChannel`].
pub enum AsyncRecvError {
    /// There is no connection to the requested party.
    NoSuchParty(usize),
    /// The channel has been closed.
    Closed,
    /// No message was received before the timeout.
    TimeoutElapsed,
    /// A chunk of a message was malformed.
    MalformedChunk,
}

#[derive(Debug)]
/// The error raised by `send` calls of a [`SimpleChannel`].
pub enum AsyncSendError {
    /// There is no connection to the requested party.
    NoSuchParty(usize),
    /// The receiving side has been dropped.
    Closed(SendError<Vec<u8>>),
}

impl Channel for SimpleChannel {
    type SendError = AsyncSendError;
    type RecvError = AsyncRecvError;

    async fn send_bytes_to(&self, p: usize, msg: Vec<u8>, phase: &str) -> Result<(), AsyncSendError> {
        let sender = self
            .s
            .get(p)
            .and_then(Option::as_ref)
            .ok_or(AsyncSendError::NoSuchParty(p))?;
        let mb = msg.len() as f64 / 1024.0 / 1024.0;
        trace!("Sending {phase} to party {p} ({mb:.2}MB)...");
        let chunk_size = 100 * 1024 * 1024;
        let mut chunks: Vec<_> = msg.chunks(chunk_size).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }
        let length = chunks.len();
        for (i, chunk) in chunks.into_iter().enumerate() {
            let mut msg = Vec::with_capacity(2 * 4 + chunk.len());
            msg.extend((i as u32).to_be_bytes());
            msg.extend((length as u32).to_be_bytes());
            msg.extend(chunk);
            sender.send(msg).await.map_err(AsyncSendError::Closed)?;
        }
        Ok(())
    }

    async fn recv_bytes_from(&self, p: usize, _phase: &str) -> Result<Vec<u8>, AsyncRecvError> {
        let mut r = self
            .r
            .get(p)
            .and_then(Option::as_ref)
            .ok_or(AsyncRecvError::NoSuchParty(p))?
            .lock()
            .await;
        let mut msg: Vec<u8> = vec![];
        loop {
            let chunk = match timeout(Duration::from_secs(10 * 60), r.recv()).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => return Err(AsyncRecvError::Closed),
                Err(_) => return Err(AsyncRecvError::TimeoutElapsed),
            };
            let Some((header, body)) = chunk.split_first_chunk::<8>() else {
                return Err(AsyncRecvError::MalformedChunk);
            };
            let i = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
            let length = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
            msg.extend(body);
            if i + 1 >= length {
                break Ok(msg);
            }
        }
    }
}
