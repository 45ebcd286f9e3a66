use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU16, Ordering},
    },
    time::Duration,
};

use chrono::Utc;
use tally_node::{
    Messenger, NodeBuilder, ProposalArgs, Registry, RunningNode, ValueSource, config::NodeConfig,
    propose_computation,
};
use tally_types::{
    ComputationDescriptor, ComputationId, ComputationRecord, CoordinatorSet, NodeRole, NodeUid,
};
use tempfile::TempDir;

/// Each network claims a disjoint endpoint window so test cases can run
/// concurrently in one process.
static NEXT_BASE: AtomicU16 = AtomicU16::new(21000);

/// A value policy that always contributes the same value, so test
/// expectations are exact.
pub struct FixedValue(pub u32);

impl ValueSource for FixedValue {
    fn produce(&self, _descriptor: &ComputationDescriptor) -> u32 {
        self.0
    }
}

/// Node configuration with timings tightened for tests.
pub fn test_config(data_dir: PathBuf, base_endpoint: u16) -> NodeConfig {
    NodeConfig {
        data_dir,
        base_endpoint,
        send_retries: 2,
        send_retry_backoff: Duration::from_millis(100),
        message_timeout: Duration::from_secs(5),
        reveal_timeout: Duration::from_secs(2),
        max_concurrent_sends: 10,
        init_confirm_timeout: Duration::from_secs(1),
        reveal_grace: Duration::from_millis(700),
        default_deadline: Duration::from_secs(60),
        default_min_participants: 1,
        drain_timeout: Duration::from_secs(3),
    }
}

/// An in-process tally network backed by a scratch data directory.
pub struct TestNetwork {
    _data_dir: TempDir,
    pub config: NodeConfig,
    pub registry: Registry,
    pub coordinators: Vec<RunningNode>,
    pub participants: Vec<RunningNode>,
}

impl TestNetwork {
    /// Starts `coordinator_count` coordinators and one participant per
    /// entry of `participant_values`, each contributing that fixed
    /// value.
    pub async fn start(
        coordinator_count: usize,
        participant_values: &[u32],
    ) -> eyre::Result<Self> {
        let data_dir = TempDir::new()?;
        let base_endpoint = NEXT_BASE.fetch_add(100, Ordering::Relaxed);
        let config = test_config(data_dir.path().to_path_buf(), base_endpoint);
        let registry = Registry::open(data_dir.path(), base_endpoint).await?;

        let mut coordinators = Vec::with_capacity(coordinator_count);
        for _ in 0..coordinator_count {
            coordinators.push(
                NodeBuilder::new(config.clone(), NodeRole::Coordinator)
                    .start()
                    .await?,
            );
        }
        let mut participants = Vec::with_capacity(participant_values.len());
        for value in participant_values {
            participants.push(
                NodeBuilder::new(config.clone(), NodeRole::Participant)
                    .value_source(Arc::new(FixedValue(*value)))
                    .start()
                    .await?,
            );
        }
        Ok(Self {
            _data_dir: data_dir,
            config,
            registry,
            coordinators,
            participants,
        })
    }

    /// The ordered coordinator triple formed from the first three
    /// coordinators.
    pub fn coordinator_set(&self) -> CoordinatorSet {
        CoordinatorSet::new([
            self.coordinators[0].uid(),
            self.coordinators[1].uid(),
            self.coordinators[2].uid(),
        ])
    }

    /// A messenger identifying itself as a fresh uid, for hand-crafted
    /// protocol traffic.
    pub fn messenger(&self) -> Messenger {
        Messenger::new(NodeUid::generate(), &self.config)
    }

    /// Proposes a computation on the first three coordinators.
    pub async fn propose(
        &self,
        deadline_in: Duration,
        min_participants: u32,
    ) -> eyre::Result<ComputationId> {
        let proposer_uid = self
            .participants
            .first()
            .map(|p| p.uid())
            .unwrap_or_else(NodeUid::generate);
        let messenger = Messenger::new(proposer_uid, &self.config);
        propose_computation(
            &self.registry,
            &messenger,
            &self.config,
            ProposalArgs {
                proposer_uid,
                coordinators: self.coordinator_set(),
                prompt: "On a scale from 0 to 100, how do you feel today?".to_owned(),
                response_schema: None,
                deadline: Some(Utc::now() + chrono::Duration::from_std(deadline_in)?),
                min_participants: Some(min_participants),
            },
        )
        .await
    }

    /// Polls the registry until the computation reaches a terminal
    /// status.
    pub async fn wait_for_computation(
        &self,
        comp_id: ComputationId,
        timeout: Duration,
    ) -> eyre::Result<ComputationRecord> {
        let give_up = tokio::time::Instant::now() + timeout;
        loop {
            let record = self
                .registry
                .get_computation(comp_id)
                .await?
                .ok_or_else(|| eyre::eyre!("computation {comp_id} not found"))?;
            if record.status.is_terminal() {
                return Ok(record);
            }
            if tokio::time::Instant::now() >= give_up {
                eyre::bail!("computation {comp_id} still pending after {timeout:?}");
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Stops the coordinator at `index` and waits for its cleanup.
    pub async fn stop_coordinator(&mut self, index: usize) -> eyre::Result<()> {
        let node = self.coordinators.remove(index);
        node.shutdown_token().cancel();
        node.join().await
    }

    /// Shuts down every remaining node.
    pub async fn shutdown(self) -> eyre::Result<()> {
        for node in self.coordinators.into_iter().chain(self.participants) {
            node.shutdown_token().cancel();
            node.join().await?;
        }
        Ok(())
    }
}
