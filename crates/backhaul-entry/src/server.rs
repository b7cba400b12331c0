//! Entry-point server implementation

use async_trait::async_trait;
use backhaul_auth::ChallengeSigner;
use backhaul_broker::{splice, Broker, ConnSpec, Role};
use backhaul_dialer::{DialError, DialHandler, DialerConfig, KeepDialer};
use backhaul_proto::encode_route;
use backhaul_router::{HostPattern, RouteTable};
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};

/// How long the supervisor waits for live connections on shutdown.
const DRAIN_DEADLINE: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum EntryPointError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("no routes configured")]
    NoRoutes,

    #[error("cannot resolve listener address {0}")]
    BadListenAddr(String),

    #[error("failed to bind to {address}: {reason}")]
    BindError { address: String, reason: String },

    #[error(transparent)]
    Dialer(#[from] DialError),
}

#[derive(Clone)]
pub struct EntryPointConfig {
    pub relay_addr: String,
    pub server_name: String,
    pub group_id: u8,
}

pub struct EntryPointServer {
    broker: Arc<Broker>,
    routes: Arc<RouteTable>,
    dialer: Arc<KeepDialer>,
}

impl EntryPointServer {
    pub fn new(
        config: EntryPointConfig,
        routes: RouteTable,
        connector: TlsConnector,
        signer: ChallengeSigner,
    ) -> Result<Self, EntryPointError> {
        let broker = Arc::new(Broker::new());

        // Parked relay halves are the downstream side of the local broker;
        // on the wire they announce themselves as upstream.
        let dialer_config = DialerConfig::new(config.relay_addr, config.server_name, Role::Down)
            .with_group(config.group_id);
        let handler = Arc::new(ParkedHalfHandler {
            broker: broker.clone(),
        });
        let dialer = KeepDialer::new(broker.clone(), connector, signer, handler, dialer_config)?;

        Ok(Self {
            broker,
            routes: Arc::new(routes),
            dialer,
        })
    }

    pub fn broker(&self) -> Arc<Broker> {
        self.broker.clone()
    }

    /// Bind every derived listener address and serve until shutdown.
    pub async fn run(&self) -> Result<(), EntryPointError> {
        self.start().await?;

        let mut shutdown = self.broker.subscribe_shutdown();
        if !*shutdown.borrow_and_update() {
            let _ = shutdown.changed().await;
        }
        Ok(())
    }

    /// Bind the listeners and spawn the accept loops and the keep-dialer.
    /// Returns the bound listener addresses.
    pub async fn start(&self) -> Result<Vec<SocketAddr>, EntryPointError> {
        if self.routes.is_empty() {
            return Err(EntryPointError::NoRoutes);
        }

        tokio::spawn(self.dialer.clone().run());

        let mut bound = Vec::new();
        for (pattern, port) in self.routes.listen_addrs() {
            let listener = bind_listener(&pattern, port)?;
            let addr = listener.local_addr()?;
            info!("entry point listening on {} for {}:{}", addr, pattern, port);
            bound.push(addr);

            let broker = self.broker.clone();
            let routes = self.routes.clone();
            tokio::spawn(accept_loop(broker, routes, pattern, port, listener));
        }

        Ok(bound)
    }

    /// Stop accepting, abandon parked halves and wait for the drain.
    pub async fn shutdown(&self) -> bool {
        self.broker.close();
        timeout(DRAIN_DEADLINE, self.broker.drain()).await.is_ok()
    }
}

/// Drives a parked relay connection: it simply joins the local broker as a
/// pending downstream half and waits for a client to claim it.
struct ParkedHalfHandler {
    broker: Arc<Broker>,
}

#[async_trait]
impl DialHandler for ParkedHalfHandler {
    async fn drive(&self, stream: tokio_rustls::client::TlsStream<TcpStream>, id: u64) {
        if let Err(e) = splice(&self.broker, id, stream, ConnSpec::new(Role::Down)).await {
            debug!("parked connection {} ended: {}", id, e);
        }
    }
}

async fn accept_loop(
    broker: Arc<Broker>,
    routes: Arc<RouteTable>,
    pattern: HostPattern,
    port: u16,
    listener: TcpListener,
) {
    let host_key = pattern.to_string();
    let mut shutdown = broker.subscribe_shutdown();
    if *shutdown.borrow_and_update() {
        return;
    }

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!("listener for {}:{} closing", host_key, port);
                return;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer_addr)) => {
                        let broker = broker.clone();
                        let routes = routes.clone();
                        let host_key = host_key.clone();
                        tokio::spawn(async move {
                            handle_client(broker, routes, host_key, port, socket, peer_addr).await;
                        });
                    }
                    Err(e) => error!("failed to accept client connection: {}", e),
                }
            }
        }
    }
}

async fn handle_client(
    broker: Arc<Broker>,
    routes: Arc<RouteTable>,
    host_key: String,
    port: u16,
    socket: TcpStream,
    peer_addr: SocketAddr,
) {
    let Some(rule) = routes.lookup(&host_key, port) else {
        warn!(
            "no route for connection from {} on {}:{}",
            peer_addr, host_key, port
        );
        return;
    };

    let id = match broker.register(Role::Up, 0) {
        Ok(id) => id,
        Err(_) => return,
    };
    debug!("client connected: {} {} -> {}", id, peer_addr, rule);

    let route = encode_route(rule.dst_ip, rule.dst_port);
    let spec = ConnSpec::new(Role::Up).with_route(Bytes::copy_from_slice(&route));

    if let Err(e) = splice(&broker, id, socket, spec).await {
        debug!("client connection {} ended: {}", id, e);
    }
    broker.remove(id);
}

/// Bind with SO_REUSEADDR so restarts do not trip over TIME_WAIT sockets.
fn bind_listener(pattern: &HostPattern, port: u16) -> Result<TcpListener, EntryPointError> {
    let addr = (pattern.bind_host(), port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| EntryPointError::BadListenAddr(format!("{}:{}", pattern, port)))?;

    let bind = || -> std::io::Result<TcpListener> {
        let domain = Domain::for_address(addr);
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(128)?;
        socket.set_nonblocking(true)?;
        TcpListener::from_std(socket.into())
    };

    bind().map_err(|e| EntryPointError::BindError {
        address: addr.to_string(),
        reason: e.to_string(),
    })
}
