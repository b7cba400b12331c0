//! Relay server implementation
//!
//! Accept loop and per-connection workers. A worker writes the raw 32-byte
//! challenge, waits up to one second for the framed answer, verifies the
//! signature and admits the half to the broker; everything after that is
//! opaque spliced bytes.

use backhaul_auth::{generate_nonce, AuthError, ChallengeVerifier};
use backhaul_broker::{splice, Broker, BrokerError, ConnSpec, Role, SpliceError};
use backhaul_proto::{ChallengeAnswer, FrameError, FramedReader, HandshakeError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// How long the supervisor waits for live connections on shutdown.
pub const DRAIN_DEADLINE: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum RelayServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("failed to bind to {address}: {reason}")]
    BindError { address: String, reason: String },
}

#[derive(Debug, Error)]
enum ConnError {
    #[error("TLS accept failed: {0}")]
    Tls(std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("challenge timed out")]
    HandshakeTimeout,

    #[error("peer closed during handshake")]
    PeerClosed,

    #[error("malformed handshake frame: {0}")]
    Frame(#[from] FrameError),

    #[error("invalid initial message: {0}")]
    BadHandshake(#[from] HandshakeError),

    #[error("invalid role tag {0}")]
    BadRoleTag(u8),

    #[error(transparent)]
    Unauthenticated(#[from] AuthError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Splice(#[from] SpliceError),

    #[error("server closing")]
    Closing,
}

impl ConnError {
    /// Auth and framing violations are logged at warn; ordinary connection
    /// churn stays at debug.
    fn is_violation(&self) -> bool {
        matches!(
            self,
            ConnError::HandshakeTimeout
                | ConnError::Frame(_)
                | ConnError::BadHandshake(_)
                | ConnError::BadRoleTag(_)
                | ConnError::Unauthenticated(_)
        )
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    pub handshake_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:4433".parse().unwrap(),
            handshake_timeout: Duration::from_secs(1),
        }
    }
}

pub struct RelayServer {
    config: RelayConfig,
    broker: Arc<Broker>,
    acceptor: TlsAcceptor,
    verifier: ChallengeVerifier,
}

impl RelayServer {
    pub fn new(config: RelayConfig, acceptor: TlsAcceptor, verifier: ChallengeVerifier) -> Self {
        Self {
            config,
            broker: Arc::new(Broker::new()),
            acceptor,
            verifier,
        }
    }

    pub fn broker(&self) -> Arc<Broker> {
        self.broker.clone()
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), RelayServerError> {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| RelayServerError::BindError {
                address: self.config.bind_addr.to_string(),
                reason: e.to_string(),
            })?;
        self.serve(listener).await
    }

    /// Serve an already-bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayServerError> {
        info!("relay listening on {}", listener.local_addr()?);

        let mut shutdown = self.broker.subscribe_shutdown();
        if *shutdown.borrow_and_update() {
            return Ok(());
        }
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("relay listener closing");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer_addr)) => {
                            let acceptor = self.acceptor.clone();
                            let broker = self.broker.clone();
                            let verifier = self.verifier.clone();
                            let handshake_timeout = self.config.handshake_timeout;

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(
                                    broker,
                                    acceptor,
                                    verifier,
                                    handshake_timeout,
                                    socket,
                                    peer_addr,
                                )
                                .await
                                {
                                    if e.is_violation() {
                                        warn!("rejected connection from {}: {}", peer_addr, e);
                                    } else {
                                        debug!("connection from {} ended: {}", peer_addr, e);
                                    }
                                }
                            });
                        }
                        Err(e) => error!("failed to accept connection: {}", e),
                    }
                }
            }
        }
    }

    /// Stop accepting, abandon pending halves and wait for the drain.
    /// Returns whether everything wound down within the deadline.
    pub async fn shutdown(&self) -> bool {
        self.broker.close();
        timeout(DRAIN_DEADLINE, self.broker.drain()).await.is_ok()
    }
}

async fn handle_connection(
    broker: Arc<Broker>,
    acceptor: TlsAcceptor,
    verifier: ChallengeVerifier,
    handshake_timeout: Duration,
    socket: TcpStream,
    peer_addr: SocketAddr,
) -> Result<(), ConnError> {
    let stream = acceptor.accept(socket).await.map_err(ConnError::Tls)?;

    let id = broker.register(Role::Unknown, 0)?;
    debug!("client connected: {} {}", id, peer_addr);

    let result = challenge_and_splice(&broker, id, stream, &verifier, handshake_timeout).await;
    broker.remove(id);
    result
}

async fn challenge_and_splice(
    broker: &Arc<Broker>,
    id: u64,
    mut stream: TlsStream<TcpStream>,
    verifier: &ChallengeVerifier,
    handshake_timeout: Duration,
) -> Result<(), ConnError> {
    // Fresh nonce per connection, written raw with no length prefix.
    let nonce = generate_nonce();
    stream.write_all(&nonce).await?;
    stream.flush().await?;

    let mut framed = FramedReader::new(stream);
    let mut shutdown = broker.subscribe_shutdown();

    let frame = tokio::select! {
        _ = shutdown.changed() => return Err(ConnError::Closing),
        answer = timeout(handshake_timeout, framed.next_frame()) => match answer {
            Err(_) => return Err(ConnError::HandshakeTimeout),
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(None)) => return Err(ConnError::PeerClosed),
            Ok(Ok(Some(frame))) => frame,
        }
    };

    let answer = ChallengeAnswer::decode(&frame)?;
    let role = Role::from_tag(answer.role_tag).ok_or(ConnError::BadRoleTag(answer.role_tag))?;
    verifier.verify(&nonce, &answer.signature)?;

    debug!(
        "client authenticated: {} role {} group {}",
        id, role, answer.group_id
    );

    // Everything already buffered past the answer is application data.
    let (stream, leftover) = framed.into_parts();
    let spec = ConnSpec::new(role)
        .with_group(answer.group_id)
        .with_initial_data(leftover.freeze());

    splice(broker, id, stream, spec).await?;
    Ok(())
}
