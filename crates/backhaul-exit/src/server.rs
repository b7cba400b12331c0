//! Reverse-proxy server implementation

use async_trait::async_trait;
use backhaul_auth::ChallengeSigner;
use backhaul_broker::{splice, Broker, ConnSpec, Role};
use backhaul_dialer::{DialError, DialHandler, DialerConfig, KeepDialer};
use backhaul_proto::{decode_route, ROUTE_BLOB_LEN};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// How long the supervisor waits for live connections on shutdown.
const DRAIN_DEADLINE: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum ReverseProxyError {
    #[error(transparent)]
    Dialer(#[from] DialError),
}

#[derive(Clone)]
pub struct ReverseProxyConfig {
    pub relay_addr: String,
    pub server_name: String,
    pub group_id: u8,
}

pub struct ReverseProxyServer {
    broker: Arc<Broker>,
    dialer: Arc<KeepDialer>,
}

impl ReverseProxyServer {
    pub fn new(
        config: ReverseProxyConfig,
        connector: TlsConnector,
        signer: ChallengeSigner,
    ) -> Result<Self, ReverseProxyError> {
        let broker = Arc::new(Broker::new());

        // Relay halves face the client side of the bridge, so they are the
        // local upstream; on the wire they announce themselves downstream.
        let dialer_config = DialerConfig::new(config.relay_addr, config.server_name, Role::Up)
            .with_group(config.group_id);
        let handler = Arc::new(RouteFollower {
            broker: broker.clone(),
        });
        let dialer = KeepDialer::new(broker.clone(), connector, signer, handler, dialer_config)?;

        Ok(Self { broker, dialer })
    }

    pub fn broker(&self) -> Arc<Broker> {
        self.broker.clone()
    }

    /// Serve until shutdown. The reverse proxy has no listener; all its
    /// connections are outbound.
    pub async fn run(&self) {
        tokio::spawn(self.dialer.clone().run());

        let mut shutdown = self.broker.subscribe_shutdown();
        if !*shutdown.borrow_and_update() {
            let _ = shutdown.changed().await;
        }
    }

    /// Stop dialling, abandon parked halves and wait for the drain.
    pub async fn shutdown(&self) -> bool {
        self.broker.close();
        timeout(DRAIN_DEADLINE, self.broker.drain()).await.is_ok()
    }
}

/// Drives a parked relay connection: block on the fixed-width route
/// payload, dial the target it names, then bridge the two through the
/// local broker keyed by the route bytes.
struct RouteFollower {
    broker: Arc<Broker>,
}

#[async_trait]
impl DialHandler for RouteFollower {
    async fn drive(&self, stream: TlsStream<TcpStream>, id: u64) {
        self.follow_route(stream, id).await;
    }
}

impl RouteFollower {
    async fn follow_route<S>(&self, mut stream: S, id: u64)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut route = [0u8; ROUTE_BLOB_LEN];
        let mut shutdown = self.broker.subscribe_shutdown();
        if *shutdown.borrow_and_update() {
            return;
        }

        // The route is fixed-width and self-delimiting; on the wire a bad
        // payload can only show up as a close partway through it.
        let mut filled = 0;
        while filled < ROUTE_BLOB_LEN {
            tokio::select! {
                _ = shutdown.changed() => return,
                read = stream.read(&mut route[filled..]) => match read {
                    Ok(0) if filled == 0 => {
                        debug!("parked connection {} dropped before a route arrived", id);
                        return;
                    }
                    Ok(0) => {
                        warn!(
                            "connection {} sent a truncated route payload ({} of {} bytes)",
                            id, filled, ROUTE_BLOB_LEN
                        );
                        return;
                    }
                    Ok(n) => filled += n,
                    Err(e) => {
                        debug!("parked connection {} dropped before a route arrived: {}", id, e);
                        return;
                    }
                }
            }
        }

        let (target_ip, target_port) = match decode_route(&route) {
            Ok(addr) => addr,
            Err(e) => {
                warn!("connection {} sent an invalid route payload: {}", id, e);
                return;
            }
        };

        let target_addr = SocketAddr::from((target_ip, target_port));
        let target = match TcpStream::connect(target_addr).await {
            Ok(target) => target,
            Err(e) => {
                // Dropping the relay half tells the entry point to close
                // its client socket.
                warn!("failed to dial target {}: {}", target_addr, e);
                return;
            }
        };
        debug!("connection {} dialled target {}", id, target_addr);

        let token = Bytes::copy_from_slice(&route);

        // The target joins as a downstream half carrying the same token, so
        // it can only ever pair with the half that requested it.
        let broker = self.broker.clone();
        let target_token = token.clone();
        tokio::spawn(async move {
            let target_id = match broker.register(Role::Down, 0) {
                Ok(target_id) => target_id,
                Err(_) => return,
            };
            let spec = ConnSpec::new(Role::Down).with_match_token(target_token);
            if let Err(e) = splice(&broker, target_id, target, spec).await {
                debug!("target connection {} ended: {}", target_id, e);
            }
            broker.remove(target_id);
        });

        let spec = ConnSpec::new(Role::Up).with_match_token(token);
        if let Err(e) = splice(&self.broker, id, stream, spec).await {
            debug!("relay connection {} ended: {}", id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backhaul_proto::encode_route;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const TICK: Duration = Duration::from_secs(2);

    fn follower() -> (Arc<Broker>, Arc<RouteFollower>) {
        let broker = Arc::new(Broker::new());
        let follower = Arc::new(RouteFollower {
            broker: broker.clone(),
        });
        (broker, follower)
    }

    /// Register a relay half and drive it through `follow_route`, the way
    /// the keep-dialer does for a freshly parked connection.
    fn spawn_follower(
        broker: &Arc<Broker>,
        follower: Arc<RouteFollower>,
        stream: DuplexStream,
    ) -> (u64, JoinHandle<()>) {
        let id = broker.register(Role::Up, 0).unwrap();
        let task = tokio::spawn(async move {
            follower.follow_route(stream, id).await;
        });
        (id, task)
    }

    async fn wait_until_empty(broker: &Arc<Broker>) {
        for _ in 0..40 {
            if broker.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("broker did not drain, {} halves left", broker.len());
    }

    #[tokio::test]
    async fn test_truncated_route_closes_half() {
        let (broker, follower) = follower();
        let (mut local, remote) = tokio::io::duplex(256);
        let (id, task) = spawn_follower(&broker, follower, remote);

        // Seven bytes of an eighteen-byte route, then the peer goes away.
        local.write_all(&[0u8; 7]).await.unwrap();
        drop(local);

        timeout(TICK, task).await.unwrap().unwrap();

        // No target was dialled and nothing joined the pairing queues.
        assert_eq!(broker.pending_len(Role::Up), 0);
        assert_eq!(broker.pending_len(Role::Down), 0);
        broker.remove(id);
        assert!(broker.is_empty());
    }

    #[tokio::test]
    async fn test_drop_before_route_is_an_ordinary_drop() {
        let (broker, follower) = follower();
        let (local, remote) = tokio::io::duplex(256);
        let (id, task) = spawn_follower(&broker, follower, remote);

        drop(local);

        timeout(TICK, task).await.unwrap().unwrap();
        assert_eq!(broker.pending_len(Role::Up), 0);
        assert_eq!(broker.pending_len(Role::Down), 0);
        broker.remove(id);
        assert!(broker.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_target_drops_relay_half() {
        let (broker, follower) = follower();
        let (mut local, remote) = tokio::io::duplex(256);
        let (id, task) = spawn_follower(&broker, follower, remote);

        // Port 1 on loopback: nothing listens there.
        let route = encode_route("127.0.0.1".parse().unwrap(), 1);
        local.write_all(&route).await.unwrap();

        timeout(TICK, task).await.unwrap().unwrap();
        assert_eq!(broker.pending_len(Role::Up), 0);
        assert_eq!(broker.pending_len(Role::Down), 0);
        broker.remove(id);
        assert!(broker.is_empty());
    }

    #[tokio::test]
    async fn test_route_to_live_target_bridges_bytes() {
        let (broker, follower) = follower();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let mut buf = [0u8; 256];
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => {
                        if socket.write_all(&buf[..n]).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        let (mut local, remote) = tokio::io::duplex(4096);
        let (id, task) = spawn_follower(&broker, follower, remote);

        let route = encode_route("127.0.0.1".parse().unwrap(), port);
        local.write_all(&route).await.unwrap();
        local.write_all(b"ping!").await.unwrap();

        // The target echoes back through the relay half; the route bytes
        // themselves never reach it.
        let mut buf = [0u8; 5];
        timeout(TICK, local.read_exact(&mut buf))
            .await
            .expect("echo should arrive")
            .unwrap();
        assert_eq!(&buf, b"ping!");

        drop(local);
        timeout(TICK, task).await.unwrap().unwrap();
        broker.remove(id);
        wait_until_empty(&broker).await;
    }
}
