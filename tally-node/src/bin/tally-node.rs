//! Tally node binary.
//!
//! This is the main entry point for a tally network node. It initializes
//! tracing and metrics and starts a node with configuration from
//! command-line arguments or environment variables.

use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use eyre::Context as _;
use tally_node::{NodeBuilder, config::NodeConfig};
use tally_types::NodeRole;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RoleArg {
    /// Run a coordinator (heavy) node.
    Coordinator,
    /// Run a participant (light) node.
    Participant,
}

impl From<RoleArg> for NodeRole {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Coordinator => NodeRole::Coordinator,
            RoleArg::Participant => NodeRole::Participant,
        }
    }
}

#[derive(Parser, Debug)]
struct Args {
    /// The role of this node.
    #[clap(long, env = "TALLY_NODE_ROLE")]
    role: RoleArg,

    #[clap(flatten)]
    config: NodeConfig,
}

#[tokio::main]
async fn main() -> eyre::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    tally_node::metrics::describe_metrics();

    let args = Args::parse();
    tracing::info!("starting tally-node with config: {:#?}", args.config);

    let cancellation_token = CancellationToken::new();
    tokio::spawn({
        let cancellation_token = cancellation_token.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("received ctrl-c, shutting down..");
                cancellation_token.cancel();
            }
        }
    });

    let node = NodeBuilder::new(args.config, args.role.into())
        .cancellation_token(cancellation_token)
        .start()
        .await
        .context("while starting node")?;
    tracing::info!(
        "node {} up on endpoint {} - waiting for shutdown..",
        node.uid(),
        node.endpoint()
    );

    node.join().await?;
    Ok(ExitCode::SUCCESS)
}
