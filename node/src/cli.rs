//! # CLI Interface
//!
//! Defines the command-line argument structure for `oracle-node` using
//! `clap` derive. Supports three subcommands: `run`, `simulate` and
//! `version`. Every `run` option can also come from an `ORACLE_*`
//! environment variable.

use std::net::IpAddr;

use clap::{Parser, Subcommand};
use libp2p::Multiaddr;

use crate::logging::LogFormat;

/// Oracle mesh node.
///
/// Joins the oracle peer-to-peer network, keeps a gossiping directory of
/// known peers and serves a small HTTP status API.
#[derive(Parser, Debug)]
#[command(
    name = "oracle-node",
    about = "Oracle mesh node",
    version,
    propagate_version = true
)]
pub struct OracleNodeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the oracle node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node.
    Run(RunArgs),
    /// Run several nodes in one process over an in-memory network and
    /// report whether their registries converge.
    Simulate(SimulateArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Interface to bind the P2P and API listeners on.
    #[arg(long, env = "ORACLE_LISTEN_HOST", default_value = "0.0.0.0")]
    pub listen_host: IpAddr,

    /// Port for P2P streams with other nodes.
    #[arg(long, env = "ORACLE_P2P_PORT", default_value_t = 4001)]
    pub p2p_port: u16,

    /// Port for the HTTP status API and Prometheus metrics.
    #[arg(long, env = "ORACLE_API_PORT", default_value_t = 8080)]
    pub api_port: u16,

    /// Bootstrap peers, comma separated, each ending in `/p2p/<peer-id>`.
    #[arg(long, env = "ORACLE_PEERS", value_delimiter = ',')]
    pub peers: Vec<Multiaddr>,

    /// Addresses this node is reachable at from outside, advertised in
    /// addition to the bound address.
    #[arg(long, env = "ORACLE_EXTERNAL_ADDRS", value_delimiter = ',')]
    pub external_addrs: Vec<Multiaddr>,

    /// Mark this node as staked in its registry record.
    #[arg(long, env = "ORACLE_STAKED")]
    pub staked: bool,

    /// Publisher signature. A node with a signature acts as a publisher.
    #[arg(long, env = "ORACLE_SIGNATURE")]
    pub signature: Option<String>,

    /// Records per full-sync page.
    #[arg(long, env = "ORACLE_PAGE_SIZE", default_value_t = oracle_protocol::config::PAGE_SIZE)]
    pub page_size: usize,

    /// Log output format.
    #[arg(long, env = "ORACLE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

/// Arguments for the `simulate` subcommand.
#[derive(Parser, Debug)]
pub struct SimulateArgs {
    /// Number of nodes, connected as a chain.
    #[arg(long, default_value_t = 4)]
    pub nodes: usize,

    /// Extra records seeded into the first node's registry.
    #[arg(long, default_value_t = 250)]
    pub records: usize,

    /// Seconds to wait for convergence before giving up.
    #[arg(long, default_value_t = 10)]
    pub timeout_secs: u64,
}
