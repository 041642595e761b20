//! A [`Channel`] over plain TCP connections between all parties.
//!
//! Every party connects to the servers with a lower index and accepts connections from the
//! parties with a higher index. The dealer has the highest index, so it only connects and never
//! listens. A new connection starts with the index of the connecting party, and every message
//! is sent as its big-endian `u64` length followed by its bytes.

use std::{io, time::Duration};

use polyshuffle::channel::Channel;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Mutex,
    time::sleep,
};
use tracing::{debug, trace};

const CONNECTION_ATTEMPTS: usize = 60;
const CONNECTION_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_MSG_LEN: u64 = 1 << 34;

/// Connections from one party to all others.
#[derive(Debug)]
pub struct TcpChannel {
    writers: Vec<Option<Mutex<OwnedWriteHalf>>>,
    readers: Vec<Option<Mutex<OwnedReadHalf>>>,
}

fn no_such_party(p: usize) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no connection to party {p}"))
}

impl TcpChannel {
    /// Connects party `own` to all `parties`, where `addrs` lists the server addresses.
    pub async fn connect(own: usize, addrs: &[String], parties: usize) -> io::Result<Self> {
        let listener = match addrs.get(own) {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };
        let lower = addrs.len().min(own);
        let (outgoing, incoming) = tokio::try_join!(
            dial_lower(own, &addrs[..lower]),
            accept_higher(own, listener, parties)
        )?;

        let mut channel = TcpChannel {
            writers: (0..parties).map(|_| None).collect(),
            readers: (0..parties).map(|_| None).collect(),
        };
        for (p, stream) in outgoing.into_iter().enumerate().chain(incoming) {
            stream.set_nodelay(true)?;
            let (r, w) = stream.into_split();
            channel.readers[p] = Some(Mutex::new(r));
            channel.writers[p] = Some(Mutex::new(w));
        }
        debug!(party = own, "Connected to all {} other parties", parties - 1);
        Ok(channel)
    }
}

async fn dial_lower(own: usize, addrs: &[String]) -> io::Result<Vec<TcpStream>> {
    let mut streams = Vec::with_capacity(addrs.len());
    for addr in addrs {
        let mut attempt = 0;
        let mut stream = loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(e) if attempt + 1 >= CONNECTION_ATTEMPTS => return Err(e),
                Err(_) => {
                    attempt += 1;
                    sleep(CONNECTION_RETRY_DELAY).await;
                }
            }
        };
        stream.write_u32(own as u32).await?;
        streams.push(stream);
    }
    Ok(streams)
}

async fn accept_higher(
    own: usize,
    listener: Option<TcpListener>,
    parties: usize,
) -> io::Result<Vec<(usize, TcpStream)>> {
    let Some(listener) = listener else {
        return Ok(vec![]);
    };
    let mut streams: Vec<(usize, TcpStream)> = Vec::with_capacity(parties - own - 1);
    while streams.len() < parties - own - 1 {
        let (mut stream, _) = listener.accept().await?;
        let p = stream.read_u32().await? as usize;
        if p <= own || p >= parties || streams.iter().any(|(q, _)| *q == p) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected connection from party {p}"),
            ));
        }
        streams.push((p, stream));
    }
    Ok(streams)
}

impl Channel for TcpChannel {
    type SendError = io::Error;
    type RecvError = io::Error;

    async fn send_bytes_to(&self, p: usize, msg: Vec<u8>, phase: &str) -> io::Result<()> {
        let mut w = self
            .writers
            .get(p)
            .and_then(Option::as_ref)
            .ok_or_else(|| no_such_party(p))?
            .lock()
            .await;
        trace!("Sending {phase} to party {p} ({} bytes)", msg.len());
        w.write_u64(msg.len() as u64).await?;
        w.write_all(&msg).await?;
        w.flush().await
    }

    async fn recv_bytes_from(&self, p: usize, phase: &str) -> io::Result<Vec<u8>> {
        let mut r = self
            .readers
            .get(p)
            .and_then(Option::as_ref)
            .ok_or_else(|| no_such_party(p))?
            .lock()
            .await;
        let len = r.read_u64().await?;
        if len > MAX_MSG_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{phase} from party {p} is too long ({len} bytes)"),
            ));
        }
        let mut msg = vec![0; len as usize];
        r.read_exact(&mut msg).await?;
        Ok(msg)
    }
}
