//! End-to-end scenarios: relay, entry point and reverse proxy in-process
//!
//! Each test wires up the full three-party system on loopback with a
//! self-signed relay certificate and a fresh Ed25519 deployment key, then
//! drives it with plain TCP clients against a local echo target.

use backhaul_auth::{ChallengeSigner, ChallengeVerifier};
use backhaul_broker::Role;
use backhaul_entry::{EntryPointConfig, EntryPointServer};
use backhaul_exit::{ReverseProxyConfig, ReverseProxyServer};
use backhaul_relay::{RelayConfig, RelayServer};
use backhaul_router::RouteTable;
use ed25519_dalek::SigningKey;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const TICK: Duration = Duration::from_secs(3);

struct TestNet {
    relay: Arc<RelayServer>,
    entry: Arc<EntryPointServer>,
    exit: Arc<ReverseProxyServer>,
    entry_addr: SocketAddr,
}

/// Spin up the full three-party system for the given route list. Routes use
/// source port 0 so every test binds ephemeral ports; the bound entry
/// address is returned in the net.
async fn start_net(test_name: &str, routes: &[String]) -> TestNet {
    backhaul_cert::ensure_crypto_provider();

    let dir = std::env::temp_dir().join(format!("backhaul-e2e-{}", test_name));
    std::fs::create_dir_all(&dir).unwrap();

    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_path = dir.join("server.crt");
    let key_path = dir.join("server.key");
    std::fs::File::create(&cert_path)
        .unwrap()
        .write_all(cert.cert.pem().as_bytes())
        .unwrap();
    std::fs::File::create(&key_path)
        .unwrap()
        .write_all(cert.key_pair.serialize_pem().as_bytes())
        .unwrap();

    let signing = SigningKey::generate(&mut rand::rngs::OsRng);
    let verifier = ChallengeVerifier::new(signing.verifying_key());

    // Relay on an ephemeral port.
    let acceptor = backhaul_cert::build_acceptor(&cert_path, &key_path).unwrap();
    let relay = Arc::new(RelayServer::new(
        RelayConfig::default(),
        acceptor,
        verifier,
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = listener.local_addr().unwrap();
    {
        let relay = relay.clone();
        tokio::spawn(async move {
            let _ = relay.serve(listener).await;
        });
    }

    // Reverse proxy.
    let exit = Arc::new(
        ReverseProxyServer::new(
            ReverseProxyConfig {
                relay_addr: relay_addr.to_string(),
                server_name: "localhost".to_string(),
                group_id: 0,
            },
            backhaul_cert::build_connector(&cert_path).unwrap(),
            ChallengeSigner::new(signing.clone()),
        )
        .unwrap(),
    );
    {
        let exit = exit.clone();
        tokio::spawn(async move { exit.run().await });
    }

    // Entry point.
    let entry = Arc::new(
        EntryPointServer::new(
            EntryPointConfig {
                relay_addr: relay_addr.to_string(),
                server_name: "localhost".to_string(),
                group_id: 0,
            },
            RouteTable::parse(routes).unwrap(),
            backhaul_cert::build_connector(&cert_path).unwrap(),
            ChallengeSigner::new(signing),
        )
        .unwrap(),
    );
    let bound = entry.start().await.unwrap();
    let entry_addr = bound[0];

    let net = TestNet {
        relay,
        entry,
        exit,
        entry_addr,
    };

    // Both pools fully parked.
    wait_for("keep-dialing pools to fill", || {
        net.entry.broker().pending_len(Role::Down) == 5 && net.relay.broker().len() == 10
    })
    .await;

    net
}

/// Local echo target; returns the bound port.
async fn start_echo_target() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
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
        }
    });
    port
}

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_happy_path_echo() {
    let target_port = start_echo_target().await;
    let net = start_net("happy", &[format!("0:{}", target_port)]).await;

    let mut client = TcpStream::connect(net.entry_addr).await.unwrap();
    client.write_all(b"PING").await.unwrap();

    // The reverse proxy strips the 18-byte route prefix, so the echo is
    // exactly what the client sent.
    let mut buf = [0u8; 4];
    timeout(TICK, client.read_exact(&mut buf))
        .await
        .expect("echo should arrive")
        .unwrap();
    assert_eq!(&buf, b"PING");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_large_payload_is_transparent() {
    let target_port = start_echo_target().await;
    let net = start_net("large", &[format!("0:{}", target_port)]).await;

    let payload: Vec<u8> = (0..32 * 1024).map(|i| (i % 241) as u8).collect();

    let mut client = TcpStream::connect(net.entry_addr).await.unwrap();
    client.write_all(&payload).await.unwrap();

    let mut echoed = vec![0u8; payload.len()];
    timeout(TICK, client.read_exact(&mut echoed))
        .await
        .expect("echo should arrive")
        .unwrap();
    assert_eq!(echoed, payload);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_sessions() {
    let target_port = start_echo_target().await;
    let net = start_net("concurrent", &[format!("0:{}", target_port)]).await;

    let mut tasks = Vec::new();
    for i in 0u8..3 {
        let addr = net.entry_addr;
        tasks.push(tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            let message = [b'a' + i; 16];
            client.write_all(&message).await.unwrap();

            let mut buf = [0u8; 16];
            timeout(TICK, client.read_exact(&mut buf))
                .await
                .expect("echo should arrive")
                .unwrap();
            assert_eq!(buf, message);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_consumed_parked_half_is_replaced() {
    let target_port = start_echo_target().await;
    let net = start_net("replace", &[format!("0:{}", target_port)]).await;

    let mut client = TcpStream::connect(net.entry_addr).await.unwrap();
    client.write_all(b"hold").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(TICK, client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();

    // The pairing consumed one parked half on each satellite; both pools
    // must refill on their own within the replacement delay.
    wait_for("entry pool to refill", || {
        net.entry.broker().pending_len(Role::Down) == 5
    })
    .await;
    wait_for("relay park count to recover", || {
        net.relay.broker().len() >= 10
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unreachable_target_closes_client() {
    // Port 1 on loopback: nothing listens there.
    let net = start_net("notarget", &["0:1".to_string()]).await;

    let mut client = TcpStream::connect(net.entry_addr).await.unwrap();
    client.write_all(b"doomed").await.unwrap();

    let mut buf = [0u8; 16];
    match timeout(TICK, client.read(&mut buf))
        .await
        .expect("client socket should close")
    {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("expected close, read {} bytes", n),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_clean_shutdown_drains_everything() {
    let target_port = start_echo_target().await;
    let net = start_net("shutdown", &[format!("0:{}", target_port)]).await;

    // One live session plus the parked pools.
    let mut client = TcpStream::connect(net.entry_addr).await.unwrap();
    client.write_all(b"live").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(TICK, client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();

    assert!(net.entry.shutdown().await, "entry point should drain");
    assert!(net.exit.shutdown().await, "reverse proxy should drain");
    assert!(net.relay.shutdown().await, "relay should drain");

    assert!(net.entry.broker().is_empty());
    assert!(net.exit.broker().is_empty());
    assert!(net.relay.broker().is_empty());
}
