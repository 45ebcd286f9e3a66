//! The coordinator side of a computation.
//!
//! [`CoordinatorService`] owns the map of active aggregation states and
//! drives each one through its lifecycle: descriptor intake, the init
//! barrier, the share collection window, the deadline tick, and the
//! reveal exchange. The state machine itself lives in
//! [`tally_core::aggregation`]; this service owns the timers and the
//! messaging around it.
//!
//! Mutation of a single aggregation state is serialized by a per-entry
//! mutex that is never held across an await point; handlers stay fast
//! and all slow work (confirm sends, the deadline sleep, the reveal
//! exchange) runs in spawned tasks keyed by the computation.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use parking_lot::Mutex;
use tally_core::aggregation::{Aggregation, AggregationError, FinalizeOutcome, RevealOutcome};
use tally_types::{
    ComputationDescriptor, ComputationId, FailureReason, NodeRole, NodeUid,
    message::{
        InitConfirmPayload, MessageBody, RevealRequestPayload, RevealResponsePayload, SharePayload,
    },
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    api::errors::Error,
    config::NodeConfig,
    metrics::{
        METRICS_ID_NODE_COMPUTATIONS_ACTIVE, METRICS_ID_NODE_COMPUTATIONS_COMPLETED,
        METRICS_ID_NODE_COMPUTATIONS_FAILED, METRICS_ID_NODE_SHARES_RECEIVED,
    },
    services::{messaging::Messenger, registry::Registry, store::CoordinatorStore},
};

struct ComputationEntry {
    descriptor: ComputationDescriptor,
    state: Mutex<Aggregation>,
    confirms: Notify,
}

struct Inner {
    uid: NodeUid,
    config: NodeConfig,
    registry: Registry,
    store: CoordinatorStore,
    messenger: Messenger,
    cancellation_token: CancellationToken,
    computations: Mutex<HashMap<ComputationId, Arc<ComputationEntry>>>,
    // survives the aggregation state so a re-delivered descriptor cannot
    // resurrect a terminal computation
    processed: Mutex<HashSet<ComputationId>>,
}

/// Aggregation driver of a coordinator node.
#[derive(Clone)]
pub(crate) struct CoordinatorService {
    inner: Arc<Inner>,
}

impl CoordinatorService {
    pub(crate) fn new(
        uid: NodeUid,
        config: NodeConfig,
        registry: Registry,
        store: CoordinatorStore,
        messenger: Messenger,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                uid,
                config,
                registry,
                store,
                messenger,
                cancellation_token,
                computations: Mutex::new(HashMap::new()),
                processed: Mutex::new(HashSet::new()),
            }),
        }
    }

    fn entry(&self, comp_id: ComputationId) -> Result<Arc<ComputationEntry>, Error> {
        self.inner
            .computations
            .lock()
            .get(&comp_id)
            .cloned()
            .ok_or(Error::UnknownComputation(comp_id))
    }

    fn remove(&self, comp_id: ComputationId) {
        if self.inner.computations.lock().remove(&comp_id).is_some() {
            ::metrics::gauge!(METRICS_ID_NODE_COMPUTATIONS_ACTIVE).decrement(1);
        }
    }

    async fn lookup_endpoint(&self, uid: NodeUid) -> Result<u16, Error> {
        Ok(self
            .inner
            .registry
            .lookup_node(uid)
            .await?
            .ok_or(Error::UnknownNode(uid))?
            .endpoint)
    }

    /// Intake of a computation descriptor.
    ///
    /// Allocates aggregation state if this node is named in the
    /// descriptor's coordinator triple, then kicks off the init path and
    /// the deadline timer. Re-deliveries of a known descriptor are
    /// no-ops; descriptors naming other coordinators are dropped.
    #[instrument(level = "debug", skip_all, fields(comp_id = %descriptor.comp_id))]
    pub(crate) async fn handle_computation(
        &self,
        descriptor: ComputationDescriptor,
    ) -> Result<(), Error> {
        let comp_id = descriptor.comp_id;
        if !self.inner.processed.lock().insert(comp_id) {
            tracing::debug!("descriptor already known, ignoring re-delivery");
            return Ok(());
        }
        if !descriptor.coordinators.contains(self.inner.uid) {
            tracing::debug!("not named for this computation, dropping descriptor");
            return Ok(());
        }
        let aggregation = Aggregation::new(
            comp_id,
            self.inner.uid,
            descriptor.coordinators,
            descriptor.min_participants,
        )
        .map_err(|err| Error::Validation(err.to_string()))?;
        let entry = Arc::new(ComputationEntry {
            descriptor: descriptor.clone(),
            state: Mutex::new(aggregation),
            confirms: Notify::new(),
        });
        self.inner
            .computations
            .lock()
            .insert(comp_id, Arc::clone(&entry));
        ::metrics::gauge!(METRICS_ID_NODE_COMPUTATIONS_ACTIVE).increment(1);
        tracing::info!("initializing computation {comp_id}");
        self.inner
            .store
            .append_log(comp_id, "initialized", &format!("deadline {}", descriptor.deadline))
            .await?;

        if descriptor.coordinators.primary() == self.inner.uid {
            tokio::spawn(self.clone().run_init_barrier(Arc::clone(&entry)));
        } else {
            tokio::spawn(self.clone().confirm_init(Arc::clone(&entry)));
        }
        tokio::spawn(self.clone().run_deadline(entry));
        Ok(())
    }

    /// Secondary init path: open the collection window and confirm to
    /// the primary.
    async fn confirm_init(self, entry: Arc<ComputationEntry>) {
        let comp_id = entry.descriptor.comp_id;
        let primary = entry.descriptor.coordinators.primary();
        entry.state.lock().begin_collecting();
        let confirm = MessageBody::InitConfirm(InitConfirmPayload {
            comp_id,
            sender_uid: self.inner.uid,
        });
        match self.lookup_endpoint(primary).await {
            Ok(endpoint) => {
                if let Err(err) = self.inner.messenger.send(endpoint, confirm).await {
                    tracing::warn!("could not confirm initialization to primary {primary}: {err}");
                }
            }
            Err(err) => tracing::warn!("cannot resolve primary {primary}: {err}"),
        }
    }

    /// Primary init path: wait for both secondaries (bounded), open the
    /// collection window, and broadcast the descriptor to participants.
    async fn run_init_barrier(self, entry: Arc<ComputationEntry>) {
        let comp_id = entry.descriptor.comp_id;
        let barrier_ends =
            tokio::time::Instant::now() + self.inner.config.init_confirm_timeout;
        loop {
            let notified = entry.confirms.notified();
            if entry.state.lock().init_confirmed() {
                tracing::info!("all secondaries confirmed initialization of {comp_id}");
                break;
            }
            if tokio::time::timeout_at(barrier_ends, notified).await.is_err() {
                tracing::warn!(
                    "proceeding without init confirms from all secondaries for {comp_id}"
                );
                break;
            }
        }
        entry.state.lock().begin_collecting();
        if let Err(err) = self
            .inner
            .store
            .append_log(comp_id, "collecting", "broadcasting to participants")
            .await
        {
            tracing::error!("could not log collection start: {err:?}");
        }
        self.broadcast_to_participants(&entry.descriptor).await;
    }

    async fn broadcast_to_participants(&self, descriptor: &ComputationDescriptor) {
        let participants = match self.inner.registry.list_nodes_by_role(NodeRole::Participant).await
        {
            Ok(participants) => participants,
            Err(err) => {
                tracing::error!("cannot list participants: {err:?}");
                return;
            }
        };
        let endpoints = participants.iter().map(|p| p.endpoint).collect::<Vec<_>>();
        self.inner
            .messenger
            .broadcast(endpoints, MessageBody::Computation(descriptor.clone()))
            .await;
    }

    /// Deadline timer: sleeps until the descriptor's deadline, then
    /// finalizes the local aggregation state. A shutdown cancels the
    /// pending wait.
    async fn run_deadline(self, entry: Arc<ComputationEntry>) {
        let now = chrono::Utc::now();
        if let Ok(delay) = (entry.descriptor.deadline - now).to_std() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.inner.cancellation_token.cancelled() => {
                    tracing::debug!(
                        "deadline timer for {} cancelled by shutdown",
                        entry.descriptor.comp_id
                    );
                    return;
                }
            }
        }
        self.finalize(entry).await;
    }

    async fn finalize(self, entry: Arc<ComputationEntry>) {
        let comp_id = entry.descriptor.comp_id;
        let outcome = entry.state.lock().finalize();
        match outcome {
            FinalizeOutcome::AlreadyTerminal => {}
            FinalizeOutcome::ThresholdNotMet { contributors } => {
                tracing::warn!(
                    "computation {comp_id} saw {contributors} contributors, below the threshold of {}",
                    entry.descriptor.min_participants
                );
                self.log_or_warn(comp_id, "threshold_not_met", &format!("{contributors} contributors"))
                    .await;
                self.write_failure(comp_id, FailureReason::AnonymityThresholdNotMet)
                    .await;
                self.remove(comp_id);
            }
            FinalizeOutcome::AwaitReveal => {
                tracing::info!(
                    "computation {comp_id} finalized, awaiting reveal request from primary"
                );
                self.log_or_warn(comp_id, "finalized", "awaiting reveal request")
                    .await;
            }
            FinalizeOutcome::BeginReveal {
                partial_sum,
                contributors,
            } => {
                tracing::info!(
                    "computation {comp_id} finalized with {contributors} contributors, starting reveal"
                );
                self.log_or_warn(comp_id, "finalized", &format!("partial sum {partial_sum}"))
                    .await;
                self.run_reveal(entry).await;
            }
        }
    }

    /// Reveal exchange on the primary: request both partial sums, allow
    /// the grace period, then reconstruct or fail.
    async fn run_reveal(&self, entry: Arc<ComputationEntry>) {
        let comp_id = entry.descriptor.comp_id;
        let secondaries = entry.descriptor.coordinators.secondaries();
        let requests = secondaries.map(|peer| {
            let service = self.clone();
            async move {
                let request = MessageBody::RevealRequest(RevealRequestPayload {
                    comp_id,
                    sender_uid: service.inner.uid,
                });
                match service.lookup_endpoint(peer).await {
                    Ok(endpoint) => {
                        let reply = service
                            .inner
                            .messenger
                            .request_response(endpoint, request, service.inner.config.reveal_timeout)
                            .await;
                        match reply {
                            Some(ack) if ack.is_ok() => {
                                tracing::debug!("secondary {peer} acknowledged reveal request")
                            }
                            _ => tracing::warn!(
                                "secondary {peer} did not acknowledge reveal request for {comp_id}"
                            ),
                        }
                    }
                    Err(err) => tracing::warn!("cannot resolve secondary {peer}: {err}"),
                }
            }
        });
        futures::future::join_all(requests).await;
        tokio::time::sleep(self.inner.config.reveal_grace).await;
        self.try_reconstruct(&entry).await;
    }

    /// Closes the reveal phase; called by the grace timer and by an
    /// early completion when the last partial sum arrives. The state
    /// machine resolves the race to a single transition.
    async fn try_reconstruct(&self, entry: &ComputationEntry) {
        let comp_id = entry.descriptor.comp_id;
        let outcome = entry.state.lock().complete_reveal();
        match outcome {
            RevealOutcome::AlreadyTerminal => {}
            RevealOutcome::Completed {
                total,
                contributors,
            } => {
                match self
                    .inner
                    .registry
                    .set_computation_result(comp_id, total, contributors)
                    .await
                {
                    Ok(true) => {
                        tracing::info!(
                            "computation {comp_id} completed: result {total}, {contributors} contributors"
                        );
                        ::metrics::counter!(METRICS_ID_NODE_COMPUTATIONS_COMPLETED).increment(1);
                    }
                    Ok(false) => {
                        tracing::warn!("computation {comp_id} already terminal in the registry")
                    }
                    Err(err) => tracing::error!("cannot store result of {comp_id}: {err:?}"),
                }
                self.log_or_warn(comp_id, "completed", &format!("result {total}"))
                    .await;
                self.remove(comp_id);
            }
            RevealOutcome::MissingPartialSums { missing } => {
                tracing::warn!(
                    "computation {comp_id} is missing partial sums from {missing:?} after the grace period"
                );
                self.log_or_warn(comp_id, "failed", "missing partial sums").await;
                self.write_failure(comp_id, FailureReason::MissingPartialSums)
                    .await;
                self.remove(comp_id);
            }
        }
    }

    async fn write_failure(&self, comp_id: ComputationId, reason: FailureReason) {
        ::metrics::counter!(METRICS_ID_NODE_COMPUTATIONS_FAILED).increment(1);
        match self
            .inner
            .registry
            .set_computation_failed(comp_id, &reason)
            .await
        {
            Ok(true) => {}
            Ok(false) => tracing::warn!("computation {comp_id} already terminal in the registry"),
            Err(err) => tracing::error!("cannot store failure of {comp_id}: {err:?}"),
        }
    }

    async fn log_or_warn(&self, comp_id: ComputationId, action: &str, details: &str) {
        if let Err(err) = self.inner.store.append_log(comp_id, action, details).await {
            tracing::warn!("could not append to computation log: {err:?}");
        }
    }

    /// Share intake during the collection window.
    #[instrument(level = "debug", skip_all, fields(comp_id = %payload.comp_id))]
    pub(crate) async fn handle_share(&self, payload: SharePayload) -> Result<(), Error> {
        let entry = self.entry(payload.comp_id)?;
        let count = {
            let mut state = entry.state.lock();
            state.add_share(payload.sender_uid, payload.share_value)?;
            state.contributor_count()
        };
        ::metrics::counter!(METRICS_ID_NODE_SHARES_RECEIVED).increment(1);
        self.inner
            .store
            .upsert_share(payload.comp_id, payload.sender_uid, payload.share_value)
            .await?;
        tracing::debug!(
            "stored share from {}, {count} contributors so far",
            payload.sender_uid
        );
        Ok(())
    }

    /// Init confirm intake on the primary.
    pub(crate) async fn handle_init_confirm(
        &self,
        payload: InitConfirmPayload,
    ) -> Result<(), Error> {
        let entry = self.entry(payload.comp_id)?;
        let complete = {
            let mut state = entry.state.lock();
            state.record_init_confirm(payload.sender_uid)?
        };
        tracing::debug!(
            "init confirm from {} for {} (all confirmed: {complete})",
            payload.sender_uid,
            payload.comp_id
        );
        entry.confirms.notify_waiters();
        Ok(())
    }

    /// Reveal request intake on a secondary: answer with the partial
    /// sum and drop the local state.
    #[instrument(level = "debug", skip_all, fields(comp_id = %payload.comp_id))]
    pub(crate) async fn handle_reveal_request(
        &self,
        payload: RevealRequestPayload,
    ) -> Result<(), Error> {
        let comp_id = payload.comp_id;
        let entry = self.entry(comp_id)?;
        let (partial_sum, participant_count) = {
            let mut state = entry.state.lock();
            state.take_reveal()?
        };
        tracing::info!(
            "revealing partial sum {partial_sum} ({participant_count} contributors) to {}",
            payload.sender_uid
        );
        self.inner
            .store
            .append_log(comp_id, "revealed", &format!("partial sum {partial_sum}"))
            .await?;
        self.remove(comp_id);
        let service = self.clone();
        let requester = payload.sender_uid;
        tokio::spawn(async move {
            let response = MessageBody::RevealResponse(RevealResponsePayload {
                comp_id,
                sender_uid: service.inner.uid,
                partial_sum,
                participant_count,
            });
            match service.lookup_endpoint(requester).await {
                Ok(endpoint) => {
                    if let Err(err) = service.inner.messenger.send(endpoint, response).await {
                        tracing::warn!("could not send reveal response to {requester}: {err}");
                    }
                }
                Err(err) => tracing::warn!("cannot resolve requester {requester}: {err}"),
            }
        });
        Ok(())
    }

    /// Reveal response intake on the primary. Completes the computation
    /// early once the last partial sum arrives. A response arriving
    /// outside the reveal phase is dropped, not answered with an error.
    #[instrument(level = "debug", skip_all, fields(comp_id = %payload.comp_id))]
    pub(crate) async fn handle_reveal_response(
        &self,
        payload: RevealResponsePayload,
    ) -> Result<(), Error> {
        let entry = self.entry(payload.comp_id)?;
        let complete = {
            let mut state = entry.state.lock();
            match state.record_peer_partial_sum(payload.sender_uid, payload.partial_sum) {
                Ok(complete) => complete,
                Err(err @ AggregationError::PeerSumNotAccepted(_)) => {
                    tracing::debug!("dropping reveal response: {err}");
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            }
        };
        tracing::info!(
            "partial sum {} from secondary {} ({} contributors there)",
            payload.partial_sum,
            payload.sender_uid,
            payload.participant_count
        );
        if complete {
            self.try_reconstruct(&entry).await;
        }
        Ok(())
    }
}
