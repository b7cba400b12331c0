//! Keep-dialing pool
//!
//! A satellite keeps a fixed number of authenticated half-connections
//! parked at the relay so a pairing can be served without dial latency.
//! A counting semaphore bounds parked plus in-flight dials; a permit is
//! only restored — after a small randomized delay — once a parked half is
//! consumed by a pairing or drops, so the pool converges back to capacity
//! without reconnect storms.

use async_trait::async_trait;
use backhaul_auth::ChallengeSigner;
use backhaul_broker::{Broker, BrokerError, BrokerObserver, HalfInfo, Role, Status};
use backhaul_proto::{write_frame, ChallengeAnswer, FrameError, NONCE_LEN};
use rand::Rng;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Number of halves a satellite keeps parked at the relay.
pub const CONCURRENCY: usize = 5;

/// Backoff multiplier applied to the replacement delay after a failed dial.
const FAILURE_BACKOFF: u32 = 100;

#[derive(Debug, Error)]
pub enum DialError {
    #[error("failed to dial relay: {0}")]
    Connect(std::io::Error),

    #[error("TLS handshake with relay failed: {0}")]
    Tls(std::io::Error),

    #[error("invalid relay server name '{0}'")]
    BadServerName(String),

    #[error("invalid challenge from relay")]
    BadChallenge,

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("shutting down")]
    Closed,
}

/// Satellite-specific behaviour for an authenticated relay connection.
///
/// The entry point parks the half in its local broker straight away; the
/// reverse proxy first waits for the route payload and dials the target.
/// Implementations own all error reporting and must leave the half removed
/// from the broker when they return.
#[async_trait]
pub trait DialHandler: Send + Sync + 'static {
    async fn drive(&self, stream: TlsStream<TcpStream>, id: u64);
}

#[derive(Clone)]
pub struct DialerConfig {
    /// Relay address in `host:port` form.
    pub relay_addr: String,
    /// Name the relay certificate is verified against.
    pub server_name: String,
    /// Role the parked halves take in the *local* broker. The wire role
    /// announced to the relay is the opposite.
    pub local_role: Role,
    /// Tenant partition advertised in the handshake.
    pub group_id: u8,
    /// Pool capacity: parked + in-flight dials.
    pub concurrency: usize,
}

impl DialerConfig {
    pub fn new(relay_addr: impl Into<String>, server_name: impl Into<String>, local_role: Role) -> Self {
        Self {
            relay_addr: relay_addr.into(),
            server_name: server_name.into(),
            local_role,
            group_id: 0,
            concurrency: CONCURRENCY,
        }
    }

    pub fn with_group(mut self, group_id: u8) -> Self {
        self.group_id = group_id;
        self
    }
}

pub struct KeepDialer {
    broker: Arc<Broker>,
    connector: TlsConnector,
    signer: ChallengeSigner,
    handler: Arc<dyn DialHandler>,
    semaphore: Arc<Semaphore>,
    server_name: ServerName<'static>,
    config: DialerConfig,
}

impl KeepDialer {
    pub fn new(
        broker: Arc<Broker>,
        connector: TlsConnector,
        signer: ChallengeSigner,
        handler: Arc<dyn DialHandler>,
        config: DialerConfig,
    ) -> Result<Arc<Self>, DialError> {
        let server_name = ServerName::try_from(config.server_name.clone())
            .map_err(|_| DialError::BadServerName(config.server_name.clone()))?;

        let dialer = Arc::new(Self {
            broker,
            connector,
            signer,
            handler,
            semaphore: Arc::new(Semaphore::new(config.concurrency)),
            server_name,
            config,
        });

        // The pool restores its own capacity through the broker hooks.
        dialer.broker.set_observer(dialer.clone());
        Ok(dialer)
    }

    /// Dial loop: acquire a pool slot, spawn a dial, repeat until shutdown.
    pub async fn run(self: Arc<Self>) {
        let mut shutdown = self.broker.subscribe_shutdown();
        if *shutdown.borrow_and_update() {
            return;
        }
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("keep-dialer stopping");
                    return;
                }
                permit = self.semaphore.clone().acquire_owned() => {
                    let Ok(permit) = permit else { return };
                    let dialer = self.clone();
                    tokio::spawn(async move {
                        dialer.dial_once(permit).await;
                    });
                }
            }
        }
    }

    async fn dial_once(self: Arc<Self>, permit: tokio::sync::OwnedSemaphorePermit) {
        // Capacity is restored through exactly one of: the dial-failure
        // path below, or a broker hook once the registered half pairs or
        // drops. Never both.
        permit.forget();

        let mut stream = match self.connect().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("failed to dial relay: {}", e);
                self.release_after(FAILURE_BACKOFF);
                return;
            }
        };

        // Registered before the handshake: a drop from here on fires
        // `on_conn_closed` with pending status, which restores the slot.
        let id = match self.broker.register(self.config.local_role, 0) {
            Ok(id) => id,
            // Shutting down; the slot is intentionally not restored.
            Err(_) => return,
        };

        let mut shutdown = self.broker.subscribe_shutdown();
        let outcome = tokio::select! {
            _ = shutdown.changed() => Err(DialError::Closed),
            res = self.handshake(&mut stream) => res,
        };

        match outcome {
            Ok(()) => {
                debug!("parked connection {} at relay {}", id, self.config.relay_addr);
                self.handler.drive(stream, id).await;
                self.broker.remove(id);
            }
            Err(DialError::Closed) => {
                self.broker.remove(id);
            }
            Err(e) => {
                warn!("relay handshake failed: {}", e);
                self.broker.remove(id);
            }
        }
    }

    /// Dial the relay and complete the TLS handshake.
    async fn connect(&self) -> Result<TlsStream<TcpStream>, DialError> {
        let tcp = TcpStream::connect(&self.config.relay_addr)
            .await
            .map_err(DialError::Connect)?;
        self.connector
            .connect(self.server_name.clone(), tcp)
            .await
            .map_err(DialError::Tls)
    }

    async fn handshake(&self, stream: &mut TlsStream<TcpStream>) -> Result<(), DialError> {
        let mut nonce = [0u8; NONCE_LEN];
        stream
            .read_exact(&mut nonce)
            .await
            .map_err(|_| DialError::BadChallenge)?;

        let wire_role = self.config.local_role.opposite();
        let answer = ChallengeAnswer::new(wire_role.tag(), self.config.group_id, self.signer.sign(&nonce));
        write_frame(stream, &answer.encode()).await?;
        Ok(())
    }

    /// Restore one pool slot after the jittered replacement delay.
    fn release_after(&self, multiplier: u32) {
        let semaphore = self.semaphore.clone();
        let delay = replacement_delay(multiplier);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            semaphore.add_permits(1);
        });
    }

    /// Pool slots currently available (not parked, not dialling).
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl BrokerObserver for KeepDialer {
    fn on_connected(&self, _half: &HalfInfo, _peer: &HalfInfo) {
        // A pairing consumed one parked half; start a replacement.
        self.release_after(1);
    }

    fn on_conn_closed(&self, half: &HalfInfo) {
        // Only a parked half that dropped before pairing frees a slot;
        // client and target halves are not pool members.
        if half.role == self.config.local_role
            && half.status == Status::Pending
            && !self.broker.is_closed()
        {
            self.release_after(1);
        }
    }
}

fn replacement_delay(multiplier: u32) -> Duration {
    let jitter = rand::thread_rng().gen_range(50..100) as u64;
    Duration::from_millis(jitter * multiplier as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use std::time::Duration;

    struct NoopHandler;

    #[async_trait]
    impl DialHandler for NoopHandler {
        async fn drive(&self, _stream: TlsStream<TcpStream>, _id: u64) {}
    }

    fn test_dialer(local_role: Role) -> (Arc<Broker>, Arc<KeepDialer>) {
        let broker = Arc::new(Broker::new());

        backhaul_cert::ensure_crypto_provider();
        let roots = rustls::RootCertStore::empty();
        let tls = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(tls));

        let signer = ChallengeSigner::new(SigningKey::generate(&mut rand::rngs::OsRng));
        let dialer = KeepDialer::new(
            broker.clone(),
            connector,
            signer,
            Arc::new(NoopHandler),
            DialerConfig::new("127.0.0.1:1", "localhost", local_role),
        )
        .unwrap();

        (broker, dialer)
    }

    fn info(role: Role, status: Status) -> HalfInfo {
        HalfInfo {
            id: 1,
            role,
            group_id: 0,
            status,
        }
    }

    #[tokio::test]
    async fn test_pairing_restores_a_slot() {
        let (_broker, dialer) = test_dialer(Role::Down);

        // Simulate five parked halves.
        for _ in 0..CONCURRENCY {
            dialer.semaphore.clone().acquire_owned().await.unwrap().forget();
        }
        assert_eq!(dialer.available(), 0);

        dialer.on_connected(&info(Role::Down, Status::Connected), &info(Role::Up, Status::Connected));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(dialer.available(), 1);
    }

    #[tokio::test]
    async fn test_pending_drop_restores_a_slot() {
        let (_broker, dialer) = test_dialer(Role::Down);

        dialer.semaphore.clone().acquire_owned().await.unwrap().forget();
        assert_eq!(dialer.available(), CONCURRENCY - 1);

        dialer.on_conn_closed(&info(Role::Down, Status::Pending));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(dialer.available(), CONCURRENCY);
    }

    #[tokio::test]
    async fn test_foreign_halves_do_not_touch_the_pool() {
        let (_broker, dialer) = test_dialer(Role::Down);

        dialer.semaphore.clone().acquire_owned().await.unwrap().forget();

        // A client half (opposite role) dropping while pending, and a pool
        // half dropping after it was connected, both leave capacity alone.
        dialer.on_conn_closed(&info(Role::Up, Status::Pending));
        dialer.on_conn_closed(&info(Role::Down, Status::Connected));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(dialer.available(), CONCURRENCY - 1);
    }

    #[tokio::test]
    async fn test_no_release_after_close() {
        let (broker, dialer) = test_dialer(Role::Down);

        dialer.semaphore.clone().acquire_owned().await.unwrap().forget();
        broker.close();

        dialer.on_conn_closed(&info(Role::Down, Status::Pending));
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(dialer.available(), CONCURRENCY - 1);
    }

    #[test]
    fn test_replacement_delay_ranges() {
        for _ in 0..32 {
            let normal = replacement_delay(1);
            assert!(normal >= Duration::from_millis(50) && normal < Duration::from_millis(100));

            let backoff = replacement_delay(FAILURE_BACKOFF);
            assert!(backoff >= Duration::from_millis(5_000) && backoff < Duration::from_millis(10_000));
        }
    }
}
