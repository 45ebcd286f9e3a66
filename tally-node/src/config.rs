//! Configuration types and CLI/environment parsing for a tally node.
//!
//! Every knob can be set via environment variables or command line
//! arguments using `clap`. Embedders with a more detailed config can use
//! the exposed [`NodeConfig`] and flatten it with `#[clap(flatten)]`.

use std::{path::PathBuf, time::Duration};

use clap::Parser;

/// The configuration shared by coordinator and participant nodes.
#[derive(Parser, Debug, Clone)]
pub struct NodeConfig {
    /// Directory holding the shared network registry and the per-node
    /// local stores.
    #[clap(long, env = "TALLY_NODE_DATA_DIR", default_value = ".tally")]
    pub data_dir: PathBuf,

    /// Endpoint allocation base; the first node gets `base_endpoint + 1`.
    #[clap(long, env = "TALLY_NODE_BASE_ENDPOINT", default_value = "7999")]
    pub base_endpoint: u16,

    /// Max attempts when sending a message to another node.
    #[clap(long, env = "TALLY_NODE_SEND_RETRIES", default_value = "3")]
    pub send_retries: usize,

    /// Base delay between send attempts; attempt `n` waits `n` times
    /// this long.
    #[clap(
        long,
        env = "TALLY_NODE_SEND_RETRY_BACKOFF",
        default_value = "1s",
        value_parser = humantime::parse_duration
    )]
    pub send_retry_backoff: Duration,

    /// Aggregate timeout for a single message delivery attempt.
    #[clap(
        long,
        env = "TALLY_NODE_MESSAGE_TIMEOUT",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub message_timeout: Duration,

    /// Timeout for a reveal request to a secondary coordinator.
    #[clap(
        long,
        env = "TALLY_NODE_REVEAL_TIMEOUT",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    pub reveal_timeout: Duration,

    /// Fan-out cap when broadcasting to many nodes.
    #[clap(long, env = "TALLY_NODE_MAX_CONCURRENT_SENDS", default_value = "10")]
    pub max_concurrent_sends: usize,

    /// How long the primary waits for init confirms from both
    /// secondaries before proceeding without them.
    #[clap(
        long,
        env = "TALLY_NODE_INIT_CONFIRM_TIMEOUT",
        default_value = "3s",
        value_parser = humantime::parse_duration
    )]
    pub init_confirm_timeout: Duration,

    /// Grace period the primary allows for reveal responses after the
    /// reveal requests went out.
    #[clap(
        long,
        env = "TALLY_NODE_REVEAL_GRACE",
        default_value = "2s",
        value_parser = humantime::parse_duration
    )]
    pub reveal_grace: Duration,

    /// Default deadline for proposed computations, measured from
    /// submission.
    #[clap(
        long,
        env = "TALLY_NODE_DEFAULT_DEADLINE",
        default_value = "60s",
        value_parser = humantime::parse_duration
    )]
    pub default_deadline: Duration,

    /// Default anonymity threshold for proposed computations.
    #[clap(
        long,
        env = "TALLY_NODE_DEFAULT_MIN_PARTICIPANTS",
        default_value = "1"
    )]
    pub default_min_participants: u32,

    /// Max wait time for in-flight work during the shutdown drain.
    #[clap(
        long,
        env = "TALLY_NODE_DRAIN_TIMEOUT",
        default_value = "3s",
        value_parser = humantime::parse_duration
    )]
    pub drain_timeout: Duration,
}
