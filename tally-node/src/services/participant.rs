//! The participant side of a computation.
//!
//! On the first delivery of a descriptor, a participant produces its
//! private value, records it locally, splits it into one share per
//! coordinator, and delivers each share to its coordinator. Re-delivered
//! descriptors are dropped, so every computation is answered at most
//! once.
//!
//! How the value is chosen is a policy seam: embedders provide a
//! [`ValueSource`]; the default draws a uniform value from a small
//! range.

use std::{collections::HashSet, sync::Arc};

use parking_lot::Mutex;
use rand::Rng as _;
use tally_core::sharing::{self, NUM_SHARES};
use tally_types::{
    ComputationDescriptor, ComputationId, NodeUid,
    message::{MessageBody, SharePayload},
};
use tracing::instrument;

use crate::{
    api::errors::Error,
    services::{messaging::Messenger, registry::Registry, store::ParticipantStore},
};

/// Policy producing a participant's private contribution.
///
/// The contract is only that the produced value is a ring element; the
/// protocol places no smaller bound.
pub trait ValueSource: Send + Sync {
    /// Produces the contribution for one computation.
    fn produce(&self, descriptor: &ComputationDescriptor) -> u32;
}

/// Default [`ValueSource`]: a uniform random value in `[0, max]`.
pub struct RandomValue {
    max: u32,
}

impl RandomValue {
    /// Creates a source drawing uniformly from `[0, max]`.
    pub fn new(max: u32) -> Self {
        Self { max }
    }
}

impl Default for RandomValue {
    fn default() -> Self {
        Self { max: 100 }
    }
}

impl ValueSource for RandomValue {
    fn produce(&self, _descriptor: &ComputationDescriptor) -> u32 {
        rand::thread_rng().gen_range(0..=self.max)
    }
}

struct Inner {
    uid: NodeUid,
    registry: Registry,
    store: ParticipantStore,
    messenger: Messenger,
    value_source: Arc<dyn ValueSource>,
    processed: Mutex<HashSet<ComputationId>>,
}

/// Computation pipeline of a participant node.
#[derive(Clone)]
pub(crate) struct ParticipantService {
    inner: Arc<Inner>,
}

impl ParticipantService {
    pub(crate) fn new(
        uid: NodeUid,
        registry: Registry,
        store: ParticipantStore,
        messenger: Messenger,
        value_source: Arc<dyn ValueSource>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                uid,
                registry,
                store,
                messenger,
                value_source,
                processed: Mutex::new(HashSet::new()),
            }),
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

    /// Answers a computation: produce, record, split, distribute.
    ///
    /// The computation is marked processed and the value recorded before
    /// any share leaves the node. Share delivery failures are tolerated;
    /// the threshold logic at reconstruction time deals with partial
    /// delivery.
    #[instrument(level = "debug", skip_all, fields(comp_id = %descriptor.comp_id))]
    pub(crate) async fn handle_computation(
        &self,
        descriptor: ComputationDescriptor,
    ) -> Result<(), Error> {
        let comp_id = descriptor.comp_id;
        if !self.inner.processed.lock().insert(comp_id) {
            tracing::debug!("already answered computation {comp_id}, dropping re-delivery");
            return Ok(());
        }
        let value = self.inner.value_source.produce(&descriptor);
        tracing::info!("answering computation {comp_id}");
        self.inner.store.upsert_response(comp_id, value).await?;
        self.inner
            .store
            .append_log(comp_id, "responded", "value recorded")
            .await?;

        // all three coordinators must resolve before any share leaves
        let mut targets = Vec::with_capacity(NUM_SHARES);
        for uid in descriptor.coordinators.iter() {
            targets.push((uid, self.lookup_endpoint(uid).await?));
        }
        let shares = sharing::split(value, NUM_SHARES, &mut rand::thread_rng());

        let service = self.clone();
        tokio::spawn(async move {
            let sends = targets
                .into_iter()
                .zip(shares)
                .map(|((uid, endpoint), share_value)| {
                    let service = service.clone();
                    async move {
                        let share = MessageBody::Share(SharePayload {
                            comp_id,
                            sender_uid: service.inner.uid,
                            share_value,
                        });
                        if let Err(err) = service.inner.messenger.send(endpoint, share).await {
                            tracing::warn!("share delivery to coordinator {uid} failed: {err}");
                        }
                    }
                });
            futures::future::join_all(sends).await;
            tracing::debug!("share distribution for {comp_id} finished");
        });
        Ok(())
    }
}
