#![deny(missing_docs)]
//! Node service of the tally network, a privacy-preserving distributed
//! average computation system.
//!
//! A tally network consists of coordinator nodes and participant nodes
//! sharing one registry. Participants hold private values; for each
//! computation, every participant splits its value into additive shares
//! over the ring of integers modulo 2^32 and delivers one share to each
//! of the computation's three coordinators. No single coordinator ever
//! sees a participant's value: at the deadline each coordinator only
//! sums the shares it holds, and the primary coordinator combines the
//! three partial sums into the final total during the reveal exchange.
//!
//! The main entry point is the [`NodeBuilder`]: it registers the node in
//! the shared registry under a freshly allocated endpoint, opens the
//! node's local store, and starts the HTTP server. The returned
//! [`RunningNode`] is shut down by cancelling its `CancellationToken`
//! (or through the node's `/shutdown` endpoint or a `shutdown` message);
//! awaiting [`RunningNode::join`] then drains in-flight work within a
//! bound, removes the node from the registry, and purges its local
//! store.
//!
//! Computations are submitted with [`propose_computation`], which
//! persists the descriptor and delivers it to the three named
//! coordinators; the primary broadcasts it to all participants once the
//! coordinators have initialized. The outcome lands in the registry's
//! computation row: `completed` with the reconstructed sum and the
//! contributor count observed at the primary, or `failed:<reason>`.

use std::sync::Arc;

use eyre::Context as _;
use parking_lot::RwLock;
use tally_types::{NodeRole, NodeStatus, NodeUid};
use tokio_util::sync::CancellationToken;

pub(crate) mod api;
pub mod config;
pub mod metrics;
pub mod services;

pub use services::messaging::Messenger;
pub use services::participant::{RandomValue, ValueSource};
pub use services::proposer::{DEFAULT_RESPONSE_SCHEMA, ProposalArgs, propose_computation};
pub use services::registry::Registry;

use crate::{
    api::{AppState, RoleService},
    config::NodeConfig,
    services::{
        coordinator::CoordinatorService,
        participant::ParticipantService,
        store::{CoordinatorStore, ParticipantStore},
    },
};

enum LocalStore {
    Coordinator(CoordinatorStore),
    Participant(ParticipantStore),
}

impl LocalStore {
    async fn purge(self) -> eyre::Result<()> {
        match self {
            LocalStore::Coordinator(store) => store.purge().await,
            LocalStore::Participant(store) => store.purge().await,
        }
    }
}

/// Builder for a tally node.
pub struct NodeBuilder {
    config: NodeConfig,
    role: NodeRole,
    value_source: Arc<dyn ValueSource>,
    cancellation_token: Option<CancellationToken>,
}

impl NodeBuilder {
    /// Creates a builder for a node with the given role.
    pub fn new(config: NodeConfig, role: NodeRole) -> Self {
        Self {
            config,
            role,
            value_source: Arc::new(RandomValue::default()),
            cancellation_token: None,
        }
    }

    /// Replaces the participant's value policy (ignored on
    /// coordinators).
    pub fn value_source(mut self, source: Arc<dyn ValueSource>) -> Self {
        self.value_source = source;
        self
    }

    /// Uses the given token instead of a fresh one; cancelling it shuts
    /// the node down.
    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = Some(token);
        self
    }

    /// Starts the node: registers it, opens its local store, and binds
    /// the HTTP server on a freshly allocated endpoint.
    pub async fn start(self) -> eyre::Result<RunningNode> {
        let NodeBuilder {
            config,
            role,
            value_source,
            cancellation_token,
        } = self;
        let cancellation_token = cancellation_token.unwrap_or_default();

        let registry = Registry::open(&config.data_dir, config.base_endpoint)
            .await
            .context("while opening registry")?;
        let uid = NodeUid::generate();
        let endpoint = registry
            .next_available_endpoint()
            .await
            .context("while allocating endpoint")?;
        if !registry.register_node(uid, role, endpoint).await? {
            eyre::bail!("uid {uid} or endpoint {endpoint} is already registered");
        }

        let messenger = Messenger::new(uid, &config);
        let status = Arc::new(RwLock::new(NodeStatus::Active));
        let (role_service, store) = match role {
            NodeRole::Coordinator => {
                let store = CoordinatorStore::open(&config.data_dir, uid)
                    .await
                    .context("while opening coordinator store")?;
                let service = CoordinatorService::new(
                    uid,
                    config.clone(),
                    registry.clone(),
                    store.clone(),
                    messenger,
                    cancellation_token.clone(),
                );
                (
                    RoleService::Coordinator(service),
                    LocalStore::Coordinator(store),
                )
            }
            NodeRole::Participant => {
                let store = ParticipantStore::open(&config.data_dir, uid)
                    .await
                    .context("while opening participant store")?;
                let service = ParticipantService::new(
                    uid,
                    registry.clone(),
                    store.clone(),
                    messenger,
                    value_source,
                );
                (
                    RoleService::Participant(service),
                    LocalStore::Participant(store),
                )
            }
        };

        let router = api::routes(AppState {
            uid,
            status: Arc::clone(&status),
            role: role_service,
            cancellation_token: cancellation_token.clone(),
        });
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", endpoint))
            .await
            .with_context(|| format!("while binding endpoint {endpoint}"))?;
        tracing::info!("{role} node {uid} listening on endpoint {endpoint}");

        let server = tokio::spawn({
            let shutdown = cancellation_token.clone();
            async move {
                let result = axum::serve(listener, router)
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await;
                if let Err(err) = result {
                    tracing::error!("server error: {err:?}");
                }
            }
        });

        Ok(RunningNode {
            uid,
            endpoint,
            registry,
            status,
            cancellation_token,
            server,
            store,
            drain_timeout: config.drain_timeout,
        })
    }
}

/// A started node.
///
/// Cancel the token returned by [`RunningNode::shutdown_token`] (or hit
/// the node's `/shutdown` endpoint) to begin the drain, then await
/// [`RunningNode::join`].
pub struct RunningNode {
    uid: NodeUid,
    endpoint: u16,
    registry: Registry,
    status: Arc<RwLock<NodeStatus>>,
    cancellation_token: CancellationToken,
    server: tokio::task::JoinHandle<()>,
    store: LocalStore,
    drain_timeout: std::time::Duration,
}

impl RunningNode {
    /// The node's uid.
    pub fn uid(&self) -> NodeUid {
        self.uid
    }

    /// The endpoint the node is serving on.
    pub fn endpoint(&self) -> u16 {
        self.endpoint
    }

    /// The registry handle this node registered in.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// A token that shuts the node down when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Waits for the shutdown signal, then drains, deregisters, and
    /// purges the local store.
    pub async fn join(self) -> eyre::Result<()> {
        let RunningNode {
            uid,
            endpoint: _,
            registry,
            status,
            cancellation_token,
            server,
            store,
            drain_timeout,
        } = self;
        cancellation_token.cancelled().await;
        *status.write() = NodeStatus::Stopping;
        tracing::info!("draining node {uid}");
        match tokio::time::timeout(drain_timeout, server).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!("server task failed: {err}"),
            Err(_) => tracing::warn!("node {uid} did not drain within {drain_timeout:?}"),
        }
        match registry.remove_node(uid).await {
            Ok(true) => tracing::info!("removed node {uid} from the registry"),
            Ok(false) => tracing::warn!("node {uid} was already removed from the registry"),
            Err(err) => tracing::error!("could not deregister node {uid}: {err:?}"),
        }
        if let Err(err) = store.purge().await {
            tracing::warn!("could not purge local store of {uid}: {err:?}");
        }
        *status.write() = NodeStatus::Stopped;
        tracing::info!("node {uid} stopped");
        Ok(())
    }
}
