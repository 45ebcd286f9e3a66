//! Submitting computations to the network.
//!
//! A proposal persists the descriptor in the registry and delivers it to
//! the three named coordinators. The primary takes over from there and
//! broadcasts the computation to participants once its init barrier has
//! passed.

use chrono::{DateTime, Utc};
use eyre::Context as _;
use tally_types::{
    ComputationDescriptor, ComputationId, CoordinatorSet, NodeUid, message::MessageBody,
};
use tracing::instrument;

use crate::{
    config::NodeConfig,
    services::{messaging::Messenger, registry::Registry},
};

/// The schema tag proposers attach by default: a single number.
pub const DEFAULT_RESPONSE_SCHEMA: &str = r#"{"type": "number"}"#;

/// Arguments of a computation proposal; optional fields fall back to
/// the configured defaults.
pub struct ProposalArgs {
    /// The proposing participant.
    pub proposer_uid: NodeUid,
    /// The ordered coordinator triple to run the computation.
    pub coordinators: CoordinatorSet,
    /// The prompt delivered to participants.
    pub prompt: String,
    /// Response schema tag; defaults to [`DEFAULT_RESPONSE_SCHEMA`].
    pub response_schema: Option<String>,
    /// Share collection deadline; defaults to now plus the configured
    /// default deadline.
    pub deadline: Option<DateTime<Utc>>,
    /// Anonymity threshold; defaults to the configured value.
    pub min_participants: Option<u32>,
}

/// Submits a computation: persists the descriptor and delivers it to
/// the named coordinators.
///
/// Delivery failures to individual coordinators are logged and
/// tolerated; the computation can still complete if the primary and
/// enough shares get through, and fails through the usual terminal
/// states otherwise.
#[instrument(level = "debug", skip_all, fields(proposer = %args.proposer_uid))]
pub async fn propose_computation(
    registry: &Registry,
    messenger: &Messenger,
    config: &NodeConfig,
    args: ProposalArgs,
) -> eyre::Result<ComputationId> {
    let deadline = args.deadline.unwrap_or_else(|| {
        Utc::now()
            + chrono::Duration::from_std(config.default_deadline)
                .expect("configured deadline fits chrono range")
    });
    let descriptor = ComputationDescriptor {
        comp_id: ComputationId::generate(),
        proposer_uid: args.proposer_uid,
        coordinators: args.coordinators,
        prompt: args.prompt,
        response_schema: args
            .response_schema
            .unwrap_or_else(|| DEFAULT_RESPONSE_SCHEMA.to_owned()),
        deadline,
        min_participants: args
            .min_participants
            .unwrap_or(config.default_min_participants),
    };
    let comp_id = descriptor.comp_id;

    if !registry
        .add_computation(&descriptor)
        .await
        .context("while persisting proposal")?
    {
        eyre::bail!("computation {comp_id} already exists");
    }
    tracing::info!("proposed computation {comp_id} with deadline {deadline}");

    for coordinator in descriptor.coordinators.iter() {
        match registry
            .lookup_node(coordinator)
            .await
            .context("while resolving coordinator")?
        {
            Some(node) => {
                if let Err(err) = messenger
                    .send(node.endpoint, MessageBody::Computation(descriptor.clone()))
                    .await
                {
                    tracing::error!("could not deliver descriptor to coordinator {coordinator}: {err}");
                }
            }
            None => tracing::error!("coordinator {coordinator} is not registered"),
        }
    }
    Ok(comp_id)
}
