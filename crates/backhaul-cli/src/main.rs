//! backhaul - expose TCP services behind NAT through a public relay

use anyhow::{Context, Result};
use backhaul_auth::{ChallengeSigner, ChallengeVerifier};
use backhaul_entry::{EntryPointConfig, EntryPointServer};
use backhaul_exit::{ReverseProxyConfig, ReverseProxyServer};
use backhaul_relay::{RelayConfig, RelayServer};
use backhaul_router::RouteTable;
use clap::{Parser, Subcommand};
use std::net::ToSocketAddrs;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Three-party TCP reverse proxy: relay, entry point and reverse proxy.
#[derive(Parser, Debug)]
#[command(name = "backhaul")]
#[command(about = "Expose TCP services behind NAT through a public relay")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the public relay server
    Relay {
        /// Server certificate path
        #[arg(long, default_value = "cert/server.crt")]
        server_cert: String,
        /// Server private key path
        #[arg(long, default_value = "cert/server.key")]
        server_key: String,
        /// Peer verifying key path (raw 32-byte Ed25519 public key)
        #[arg(long, default_value = "cert/auth.pub")]
        auth_public_key: String,
        /// Listen host
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Listen port
        #[arg(long, default_value_t = 4433)]
        port: u16,
    },
    /// Run the entry point near the public clients
    EntryPoint {
        /// Pinned relay certificate path
        #[arg(long, default_value = "cert/server.crt")]
        server_cert: String,
        /// Signing key path (raw 32-byte Ed25519 seed)
        #[arg(long, default_value = "cert/auth")]
        auth_private_key: String,
        /// Relay address
        #[arg(long, default_value = "localhost:4433")]
        server_address: String,
        /// Tenant group id
        #[arg(long, default_value_t = 0)]
        group_id: u8,
        /// Route rule (P:P, H:P:P, P:H:P or H:P:H:P); repeatable
        #[arg(long = "route", required = true)]
        routes: Vec<String>,
    },
    /// Run the reverse proxy next to the private targets
    ReverseProxy {
        /// Pinned relay certificate path
        #[arg(long, default_value = "cert/server.crt")]
        server_cert: String,
        /// Signing key path (raw 32-byte Ed25519 seed)
        #[arg(long, default_value = "cert/auth")]
        auth_private_key: String,
        /// Relay address
        #[arg(long, default_value = "localhost:4433")]
        server_address: String,
        /// Tenant group id
        #[arg(long, default_value_t = 0)]
        group_id: u8,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Relay {
            server_cert,
            server_key,
            auth_public_key,
            host,
            port,
        } => run_relay(server_cert, server_key, auth_public_key, host, port).await,
        Commands::EntryPoint {
            server_cert,
            auth_private_key,
            server_address,
            group_id,
            routes,
        } => run_entry_point(server_cert, auth_private_key, server_address, group_id, routes).await,
        Commands::ReverseProxy {
            server_cert,
            auth_private_key,
            server_address,
            group_id,
        } => run_reverse_proxy(server_cert, auth_private_key, server_address, group_id).await,
    }
}

async fn run_relay(
    server_cert: String,
    server_key: String,
    auth_public_key: String,
    host: String,
    port: u16,
) -> Result<()> {
    let acceptor = backhaul_cert::build_acceptor(&server_cert, &server_key)
        .context("failed to load relay certificate")?;
    let verifier = ChallengeVerifier::from_file(&auth_public_key)
        .context("failed to load peer verifying key")?;

    let bind_addr = (host.as_str(), port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .with_context(|| format!("cannot resolve listen address {}:{}", host, port))?;

    let config = RelayConfig {
        bind_addr,
        ..Default::default()
    };
    let server = Arc::new(RelayServer::new(config, acceptor, verifier));

    let mut run_task = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received interrupt signal, shutting down...");
            let drained = server.shutdown().await;
            let _ = run_task.await;
            report_shutdown(drained);
        }
        result = &mut run_task => {
            result.context("relay task failed")??;
        }
    }
    Ok(())
}

async fn run_entry_point(
    server_cert: String,
    auth_private_key: String,
    server_address: String,
    group_id: u8,
    routes: Vec<String>,
) -> Result<()> {
    let routes = RouteTable::parse(&routes).context("invalid route")?;
    let connector =
        backhaul_cert::build_connector(&server_cert).context("failed to load relay certificate")?;
    let signer =
        ChallengeSigner::from_file(&auth_private_key).context("failed to load signing key")?;

    let config = EntryPointConfig {
        server_name: server_name_of(&server_address),
        relay_addr: server_address,
        group_id,
    };
    let server = Arc::new(
        EntryPointServer::new(config, routes, connector, signer)
            .context("failed to set up entry point")?,
    );

    let mut run_task = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received interrupt signal, shutting down...");
            let drained = server.shutdown().await;
            let _ = run_task.await;
            report_shutdown(drained);
        }
        result = &mut run_task => {
            result.context("entry point task failed")??;
        }
    }
    Ok(())
}

async fn run_reverse_proxy(
    server_cert: String,
    auth_private_key: String,
    server_address: String,
    group_id: u8,
) -> Result<()> {
    let connector =
        backhaul_cert::build_connector(&server_cert).context("failed to load relay certificate")?;
    let signer =
        ChallengeSigner::from_file(&auth_private_key).context("failed to load signing key")?;

    let config = ReverseProxyConfig {
        server_name: server_name_of(&server_address),
        relay_addr: server_address,
        group_id,
    };
    let server = Arc::new(
        ReverseProxyServer::new(config, connector, signer)
            .context("failed to set up reverse proxy")?,
    );

    let run_task = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for interrupt")?;
    info!("received interrupt signal, shutting down...");
    let drained = server.shutdown().await;
    let _ = run_task.await;
    report_shutdown(drained);
    Ok(())
}

/// Report the drain outcome; a timed-out drain is a non-zero exit.
fn report_shutdown(drained: bool) {
    if drained {
        info!("server has been shut down");
    } else {
        error!("server shutdown timed out");
        std::process::exit(1);
    }
}

/// Host part of a `host:port` relay address, used as the TLS server name.
fn server_name_of(addr: &str) -> String {
    match addr.rsplit_once(':') {
        Some((host, _port)) => host.to_string(),
        None => addr.to_string(),
    }
}
