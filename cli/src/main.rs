// veilway — anonymizing relay network CLI
//
// Runs a signaling coordinator, a relay node, or one-shot anonymous fetches.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::sync::Arc;
use veilway_core::directory::{BandwidthClass, PeerDirectory, RelayCapabilities};
use veilway_core::engine::{EngineConfig, RelayEngine};
use veilway_core::fetch::{AnonymousRequest, RequestOptions, UreqFetcher};
use veilway_core::identity::RelayKeys;
use veilway_core::signaling::{Coordinator, SignalingClient, SignalingServer, ADVERTISE_INTERVAL};
use veilway_core::transport::TcpNet;

#[derive(Parser)]
#[command(name = "veilway")]
#[command(about = "Veilway — anonymous multi-hop request relay", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a signaling coordinator
    Coordinator {
        #[arg(short, long, default_value = "127.0.0.1:7400")]
        listen: String,
    },
    /// Run a relay node
    Node {
        /// Coordinator address
        #[arg(short, long, default_value = "127.0.0.1:7400")]
        coordinator: String,
        /// Participate as a client only, never relaying for others
        #[arg(long)]
        no_relay: bool,
        /// Advertised bandwidth class: low, standard, or high
        #[arg(long, default_value = "standard")]
        bandwidth: String,
    },
    /// Fetch a URL through the relay network
    Fetch {
        url: String,
        #[arg(short, long, default_value = "127.0.0.1:7400")]
        coordinator: String,
        /// Fail instead of falling back to a direct fetch
        #[arg(long)]
        strict: bool,
        #[arg(short, long, default_value = "GET")]
        method: String,
    },
    /// Show the coordinator's relay directory
    Status {
        #[arg(short, long, default_value = "127.0.0.1:7400")]
        coordinator: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Coordinator { listen } => cmd_coordinator(listen).await,
        Commands::Node {
            coordinator,
            no_relay,
            bandwidth,
        } => cmd_node(coordinator, no_relay, bandwidth).await,
        Commands::Fetch {
            url,
            coordinator,
            strict,
            method,
        } => cmd_fetch(url, coordinator, strict, method).await,
        Commands::Status { coordinator } => cmd_status(coordinator).await,
    }
}

async fn cmd_coordinator(listen: String) -> Result<()> {
    let server = Arc::new(SignalingServer::new(Arc::new(Coordinator::new())));
    let (addr, handle) = server
        .bind(&listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;

    println!("{}", "Veilway Coordinator".bold());
    println!("  Listening: {}", addr.to_string().bright_cyan());
    println!("  Press Ctrl+C to stop");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = handle => {}
    }
    Ok(())
}

async fn cmd_node(coordinator: String, no_relay: bool, bandwidth: String) -> Result<()> {
    let capabilities = if no_relay {
        RelayCapabilities::client_only()
    } else {
        RelayCapabilities::relay(parse_bandwidth(&bandwidth)?)
    };

    let keys = Arc::new(RelayKeys::generate());
    println!("{}", "Veilway Node".bold());
    println!("  Peer ID:   {}", keys.peer_id().as_str().bright_cyan());
    println!(
        "  Relaying:  {}",
        if capabilities.relay_enabled {
            "enabled".green()
        } else {
            "disabled".yellow()
        }
    );

    let (client, handshakes) = SignalingClient::connect(&coordinator)
        .await
        .with_context(|| format!("Failed to reach coordinator at {}", coordinator))?;
    client.advertise(&keys, capabilities).await?;
    // Keep the directory entry fresh for as long as the node runs.
    let _refresh = client.keep_advertised(keys.clone(), capabilities, ADVERTISE_INTERVAL);
    let (net, events) = TcpNet::start(keys.peer_id(), client.clone(), handshakes).await?;
    println!("  Channels:  {}", net.listen_addr().to_string().bright_cyan());

    let engine = RelayEngine::new(
        keys,
        client,
        net,
        Arc::new(UreqFetcher::new()),
        EngineConfig::default(),
    );
    engine.start(events)?;
    println!("  Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    engine.stop();
    Ok(())
}

async fn cmd_fetch(url: String, coordinator: String, strict: bool, method: String) -> Result<()> {
    let keys = Arc::new(RelayKeys::generate());
    let (client, handshakes) = SignalingClient::connect(&coordinator)
        .await
        .with_context(|| format!("Failed to reach coordinator at {}", coordinator))?;
    // Advertise as client-only so relays can negotiate channels back to us.
    client.advertise(&keys, RelayCapabilities::client_only()).await?;
    let (net, events) = TcpNet::start(keys.peer_id(), client.clone(), handshakes).await?;

    let engine = RelayEngine::new(
        keys,
        client,
        net,
        Arc::new(UreqFetcher::new()),
        EngineConfig::default(),
    );
    engine.start(events)?;

    let request = AnonymousRequest {
        url,
        options: RequestOptions {
            method,
            strict_anonymity: strict,
            ..Default::default()
        },
    };
    let response = engine.send_anonymous_request(&request).await?;
    engine.stop();

    eprintln!("{} {}", "Status:".bold(), response.status);
    for (name, value) in &response.headers {
        eprintln!("  {}: {}", name.bright_cyan(), value);
    }
    println!("{}", response.body_text());
    Ok(())
}

async fn cmd_status(coordinator: String) -> Result<()> {
    let (client, _handshakes) = SignalingClient::connect(&coordinator)
        .await
        .with_context(|| format!("Failed to reach coordinator at {}", coordinator))?;
    let peers = client.discover().await?;

    println!("{}", "Relay Directory".bold());
    if peers.is_empty() {
        println!("  {}", "No relays advertised".yellow());
        return Ok(());
    }
    for peer in peers {
        println!(
            "  {}  bandwidth: {}",
            peer.id.as_str().bright_cyan(),
            format!("{:?}", peer.capabilities.bandwidth_class).to_lowercase()
        );
    }
    Ok(())
}

fn parse_bandwidth(value: &str) -> Result<BandwidthClass> {
    match value.to_ascii_lowercase().as_str() {
        "low" => Ok(BandwidthClass::Low),
        "standard" => Ok(BandwidthClass::Standard),
        "high" => Ok(BandwidthClass::High),
        other => anyhow::bail!("Unknown bandwidth class: {}", other),
    }
}
