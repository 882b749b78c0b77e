// Copyright (c) 2026 Oracle Mesh Contributors. MIT License.
// See LICENSE for details.

//! # Oracle Node
//!
//! Entry point for the `oracle-node` binary. Parses CLI arguments,
//! initializes logging and metrics, starts the mesh node over libp2p and
//! serves the HTTP status API.
//!
//! The binary supports three subcommands:
//!
//! - `run`      start a node
//! - `simulate` run a chain of nodes in one process and check convergence
//! - `version`  print build version information

mod api;
mod cli;
mod logging;
mod metrics;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use libp2p::identity::Keypair;
use libp2p::PeerId;
use tokio::signal;
use tokio::sync::watch;

use oracle_protocol::network::{MemoryHost, MemoryNetwork, SwarmHost};
use oracle_protocol::node::{bootstrap_events, PeerEvent};
use oracle_protocol::{NodeConfig, NodeData, OracleNode};

use cli::{Commands, OracleNodeCli};
use logging::{LogFormat, DEFAULT_FILTER};
use metrics::NodeMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = OracleNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Simulate(args) => simulate(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Starts one node: P2P transport, discovery feed, API and metrics.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(DEFAULT_FILTER, args.log_format);

    let keypair = Keypair::generate_ed25519();
    let peer_id = keypair.public().to_peer_id();
    tracing::info!(
        peer = %peer_id,
        p2p_port = args.p2p_port,
        api_port = args.api_port,
        bootstrap = args.peers.len(),
        "starting oracle-node"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // --- Transport ---
    let p2p_addr = SocketAddr::new(args.listen_host, args.p2p_port);
    let host = SwarmHost::bind(keypair, p2p_addr, args.external_addrs, shutdown_rx.clone())
        .await
        .with_context(|| format!("failed to bind P2P listener on {p2p_addr}"))?;

    // --- Node ---
    let mut config = NodeConfig::default()
        .with_page_size(args.page_size)
        .with_staked(args.staked);
    if let Some(signature) = args.signature {
        config = config.with_signature(signature);
    }
    let node = Arc::new(OracleNode::new(
        Arc::new(host.clone()),
        Arc::new(host),
        config,
        shutdown_rx.clone(),
    ));
    node.start().await.context("failed to start node")?;

    // --- Discovery ---
    let events = node.peer_events();
    for event in bootstrap_events(&args.peers) {
        events
            .send(event)
            .await
            .context("discovery feed closed during bootstrap")?;
    }

    // --- API server ---
    let app_state = api::AppState {
        node: Arc::clone(&node),
        metrics: Arc::new(NodeMetrics::new().context("failed to register metrics")?),
        version: format!(
            "{} (protocol {})",
            env!("CARGO_PKG_VERSION"),
            oracle_protocol::config::PROTOCOL_VERSION,
        ),
    };
    let api_addr = SocketAddr::new(args.listen_host, args.api_port);
    let api_listener = tokio::net::TcpListener::bind(api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {api_addr}"))?;
    tracing::info!("API server listening on {}", api_addr);

    let router = api::create_router(app_state);
    let server = tokio::spawn(async move {
        axum::serve(api_listener, router)
            .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
            .await
    });

    shutdown_signal().await;
    tracing::info!("shutdown signal received, stopping node");
    shutdown_tx.send_replace(true);

    node.join().await;
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("API server error: {}", e),
        Err(e) => tracing::error!("API server task failed: {}", e),
    }

    tracing::info!("oracle-node stopped");
    Ok(())
}

/// Runs `args.nodes` nodes over an in-memory network connected as a chain,
/// seeds the first registry and waits for every registry to hold every
/// record.
async fn simulate(args: cli::SimulateArgs) -> Result<()> {
    logging::init_logging(DEFAULT_FILTER, LogFormat::Pretty);
    if args.nodes < 2 {
        bail!("a simulation needs at least two nodes");
    }

    let net = MemoryNetwork::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut nodes: Vec<(MemoryHost, OracleNode)> = Vec::with_capacity(args.nodes);
    for _ in 0..args.nodes {
        let host = net.add_host();
        let node = OracleNode::new(
            Arc::new(host.clone()),
            Arc::new(host.clone()),
            NodeConfig::default(),
            shutdown_rx.clone(),
        );
        node.start().await.context("failed to start simulated node")?;
        nodes.push((host, node));
    }

    let now = Utc::now();
    for _ in 0..args.records {
        nodes[0]
            .1
            .tracker()
            .handle_node_data(NodeData::joined(PeerId::random(), vec![], now));
    }

    let expected = args.nodes + args.records;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.timeout_secs);

    // Full sync only runs on a fresh connection, so each link waits for the
    // previous hop to have delivered before it is made.
    for pair in nodes.windows(2) {
        let (_, from) = &pair[0];
        let (to_host, to) = &pair[1];
        from.peer_events()
            .send(PeerEvent::joined("simulation", to_host.addr_info()))
            .await
            .context("discovery feed closed")?;

        let want = from.tracker().len();
        wait_until(deadline, || to.tracker().len() >= want).await;
    }

    let converged = wait_until(deadline, || {
        nodes.iter().all(|(_, node)| node.tracker().len() == expected)
    })
    .await;

    println!("{:<54} {:>8} {:>8} {:>10}", "peer", "records", "active", "syncs");
    for (_, node) in &nodes {
        let stats = node.stats();
        println!(
            "{:<54} {:>8} {:>8} {:>10}",
            node.local_peer_id().to_string(),
            node.tracker().len(),
            node.tracker().active_count(),
            stats.syncs_sent,
        );
    }

    shutdown_tx.send_replace(true);
    for (_, node) in &nodes {
        node.join().await;
    }

    if !converged {
        bail!("registries did not converge on {expected} records within {}s", args.timeout_secs);
    }
    println!("converged: {} nodes hold {expected} records each", args.nodes);
    Ok(())
}

/// Polls `condition` until it holds or `deadline` passes.
async fn wait_until(deadline: tokio::time::Instant, condition: impl Fn() -> bool) -> bool {
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Prints version information to stdout.
fn print_version() {
    println!("oracle-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol    {}", oracle_protocol::config::PROTOCOL_VERSION);
    println!("rustc       {}", rustc_version());
}

/// Returns the Rust compiler version used to build this binary.
fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

/// Resolves once the root cancellation fires or its sender is gone.
async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// A signal handler that cannot be installed is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
