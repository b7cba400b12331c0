//! Splice engine
//!
//! Drives one half-connection from admission to teardown: a reader task
//! copies socket bytes into the half's inbox, pairing delivers the partner's
//! inbox, and a writer task copies partner bytes back out. The partner's
//! route blob, when present, is written before any spliced byte.
//!
//! Backpressure is the transport's own: the inbox is a capacity-1 handoff,
//! writes are awaited chunk by chunk, and a slow peer therefore stalls the
//! opposite socket read through TCP flow control.

use crate::broker::{Admission, Broker, BrokerError, PeerLink};
use crate::half::Role;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

/// Scratch buffer size for socket reads. Every chunk is copied out of the
/// scratch so the buffer can be reused on the next read.
pub const CHUNK_SIZE: usize = 1024;

#[derive(Debug, Error)]
pub enum SpliceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("partner went away before pairing completed")]
    Abandoned,

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Admission parameters for one half-connection.
#[derive(Debug, Clone)]
pub struct ConnSpec {
    pub role: Role,
    pub group_id: u8,
    pub match_token: Option<Bytes>,
    pub route: Option<Bytes>,
    /// Bytes already consumed from the socket past the handshake; delivered
    /// to the partner ahead of anything the reader produces.
    pub initial_data: Option<Bytes>,
}

impl ConnSpec {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            group_id: 0,
            match_token: None,
            route: None,
            initial_data: None,
        }
    }

    pub fn with_group(mut self, group_id: u8) -> Self {
        self.group_id = group_id;
        self
    }

    pub fn with_match_token(mut self, token: Bytes) -> Self {
        self.match_token = Some(token);
        self
    }

    pub fn with_route(mut self, route: Bytes) -> Self {
        self.route = Some(route);
        self
    }

    pub fn with_initial_data(mut self, data: Bytes) -> Self {
        if !data.is_empty() {
            self.initial_data = Some(data);
        }
        self
    }
}

/// Run a registered half-connection to completion.
///
/// Admits the half, waits for (or immediately receives) its partner,
/// bridges bytes in both directions and removes the half from the broker on
/// every exit path. Returns when either side closes, the half is abandoned,
/// or the broker shuts down.
pub async fn splice<S>(
    broker: &Arc<Broker>,
    id: u64,
    stream: S,
    spec: ConnSpec,
) -> Result<(), SpliceError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let result = run(broker, id, stream, spec).await;
    broker.remove(id);
    result
}

async fn run<S>(
    broker: &Arc<Broker>,
    id: u64,
    stream: S,
    spec: ConnSpec,
) -> Result<(), SpliceError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let (inbox_tx, inbox_rx) = mpsc::channel::<Bytes>(1);

    let mut reader = tokio::spawn(read_loop(read_half, inbox_tx, spec.initial_data, id));
    let mut shutdown = broker.subscribe_shutdown();

    let link = PeerLink {
        id,
        route: spec.route,
        inbox: inbox_rx,
    };
    let admission = match broker.admit(id, spec.role, spec.group_id, spec.match_token, link) {
        Ok(admission) => admission,
        Err(e) => {
            reader.abort();
            return Err(e.into());
        }
    };

    let peer = match admission {
        Admission::Paired(peer) => peer,
        Admission::Wait(waiter) => {
            tokio::select! {
                _ = shutdown.changed() => {
                    reader.abort();
                    return Ok(());
                }
                _ = &mut reader => {
                    // Socket dropped while parked; removal signals our own
                    // waiter, nothing else to do.
                    return Ok(());
                }
                outcome = waiter => match outcome {
                    Ok(Some(peer)) => peer,
                    _ => {
                        reader.abort();
                        return Err(SpliceError::Abandoned);
                    }
                }
            }
        }
    };

    // The partner's route travels before any spliced byte; pairing moved it
    // out of the partner's spec, so it cannot be written twice.
    if let Some(route) = peer.route {
        let send = async {
            write_half.write_all(&route).await?;
            write_half.flush().await
        };
        if let Err(e) = send.await {
            reader.abort();
            return Err(e.into());
        }
        debug!("route forwarded: {} -> {}", peer.id, id);
    }

    let mut writer = tokio::spawn(write_loop(write_half, peer.inbox, id));

    tokio::select! {
        _ = shutdown.changed() => {}
        _ = &mut reader => {}
        _ = &mut writer => {}
    }

    reader.abort();
    writer.abort();
    Ok(())
}

async fn read_loop<R>(mut reader: R, tx: mpsc::Sender<Bytes>, initial: Option<Bytes>, id: u64)
where
    R: AsyncRead + Unpin,
{
    if let Some(data) = initial {
        if tx.send(data).await.is_err() {
            return;
        }
    }

    let mut scratch = [0u8; CHUNK_SIZE];
    loop {
        match reader.read(&mut scratch).await {
            Ok(0) => return,
            Ok(n) => {
                if tx.send(Bytes::copy_from_slice(&scratch[..n])).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!("read ended on {}: {}", id, e);
                return;
            }
        }
    }
}

async fn write_loop<W>(mut writer: W, mut inbox: mpsc::Receiver<Bytes>, id: u64)
where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = inbox.recv().await {
        let send = async {
            writer.write_all(&chunk).await?;
            writer.flush().await
        };
        if let Err(e) = send.await {
            debug!("write ended on {}: {}", id, e);
            return;
        }
    }
    // Inbox closed: the partner's reader finished and everything it
    // produced has been flushed.
}
