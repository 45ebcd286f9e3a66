use std::time::Duration;

use tally_types::{
    ComputationStatus, FailureReason, NodeRole, NodeUid,
    message::{MessageBody, SharePayload},
};
use tempfile::TempDir;

use crate::setup::TestNetwork;

mod setup;

const RESULT_TIMEOUT: Duration = Duration::from_secs(20);

#[tokio::test(flavor = "multi_thread")]
async fn single_contribution_completes() -> eyre::Result<()> {
    let network = TestNetwork::start(3, &[42]).await?;
    let comp_id = network.propose(Duration::from_secs(2), 1).await?;

    let record = network.wait_for_computation(comp_id, RESULT_TIMEOUT).await?;
    assert_eq!(record.status, ComputationStatus::Completed);
    assert_eq!(record.result, Some(42));
    assert_eq!(record.participants_count, Some(1));
    assert_eq!(record.average(), Some(42.0));
    assert!(record.completed_at.is_some());

    network.shutdown().await
}

#[tokio::test(flavor = "multi_thread")]
async fn contributions_are_summed() -> eyre::Result<()> {
    let network = TestNetwork::start(3, &[37, 25]).await?;
    let comp_id = network.propose(Duration::from_secs(2), 1).await?;

    let record = network.wait_for_computation(comp_id, RESULT_TIMEOUT).await?;
    assert_eq!(record.status, ComputationStatus::Completed);
    assert_eq!(record.result, Some(62));
    assert_eq!(record.participants_count, Some(2));

    network.shutdown().await
}

#[tokio::test(flavor = "multi_thread")]
async fn anonymity_threshold_fails_computation() -> eyre::Result<()> {
    let network = TestNetwork::start(3, &[10, 20]).await?;
    let comp_id = network.propose(Duration::from_secs(2), 3).await?;

    let record = network.wait_for_computation(comp_id, RESULT_TIMEOUT).await?;
    assert_eq!(
        record.status,
        ComputationStatus::Failed(FailureReason::AnonymityThresholdNotMet)
    );
    assert_eq!(record.result, None);
    assert_eq!(record.participants_count, None);

    network.shutdown().await
}

#[tokio::test(flavor = "multi_thread")]
async fn zero_contributors_fail_the_threshold() -> eyre::Result<()> {
    let network = TestNetwork::start(3, &[]).await?;
    let comp_id = network.propose(Duration::from_secs(1), 1).await?;

    let record = network.wait_for_computation(comp_id, RESULT_TIMEOUT).await?;
    assert_eq!(
        record.status,
        ComputationStatus::Failed(FailureReason::AnonymityThresholdNotMet)
    );

    network.shutdown().await
}

#[tokio::test(flavor = "multi_thread")]
async fn killed_secondary_fails_the_reveal() -> eyre::Result<()> {
    let mut network = TestNetwork::start(3, &[5]).await?;
    let comp_id = network.propose(Duration::from_secs(2), 1).await?;

    // let the shares land, then take a secondary down before the deadline
    tokio::time::sleep(Duration::from_millis(800)).await;
    network.stop_coordinator(2).await?;

    let record = network.wait_for_computation(comp_id, RESULT_TIMEOUT).await?;
    assert_eq!(
        record.status,
        ComputationStatus::Failed(FailureReason::MissingPartialSums)
    );
    assert_eq!(record.result, None);

    network.shutdown().await
}

/// A share that misses one coordinator's deadline is dropped there but
/// counted at the others; the computation still completes, with the sum
/// shifted by the dropped share.
#[tokio::test(flavor = "multi_thread")]
async fn late_share_is_dropped_but_computation_completes() -> eyre::Result<()> {
    let network = TestNetwork::start(3, &[]).await?;
    let endpoints = [
        network.coordinators[0].endpoint(),
        network.coordinators[1].endpoint(),
        network.coordinators[2].endpoint(),
    ];
    let comp_id = network.propose(Duration::from_millis(1500), 1).await?;
    tokio::time::sleep(Duration::from_millis(400)).await;

    let messenger = network.messenger();
    let share = |sender_uid: NodeUid, share_value: u32| {
        MessageBody::Share(SharePayload {
            comp_id,
            sender_uid,
            share_value,
        })
    };

    // first contributor reaches every coordinator in time
    let p1 = NodeUid::generate();
    for (endpoint, value) in endpoints.into_iter().zip([10u32, 20, 30]) {
        messenger.send(endpoint, share(p1, value)).await?;
    }
    // second contributor reaches only the first two in time
    let p2 = NodeUid::generate();
    messenger.send(endpoints[0], share(p2, 7)).await?;
    messenger.send(endpoints[1], share(p2, 9)).await?;

    // the third share arrives after the deadline and is answered with an
    // error status
    tokio::time::sleep(Duration::from_millis(1400)).await;
    assert!(messenger.send(endpoints[2], share(p2, 99)).await.is_err());

    let record = network.wait_for_computation(comp_id, RESULT_TIMEOUT).await?;
    assert_eq!(record.status, ComputationStatus::Completed);
    assert_eq!(record.result, Some(10 + 20 + 30 + 7 + 9));
    assert_eq!(record.participants_count, Some(2));

    network.shutdown().await
}

/// Re-sending a share from the same contributor replaces the stored
/// value instead of double counting it.
#[tokio::test(flavor = "multi_thread")]
async fn duplicate_share_does_not_double_count() -> eyre::Result<()> {
    let network = TestNetwork::start(3, &[]).await?;
    let endpoints = [
        network.coordinators[0].endpoint(),
        network.coordinators[1].endpoint(),
        network.coordinators[2].endpoint(),
    ];
    let comp_id = network.propose(Duration::from_millis(1500), 1).await?;
    tokio::time::sleep(Duration::from_millis(400)).await;

    let messenger = network.messenger();
    let sender_uid = NodeUid::generate();
    for (endpoint, share_value) in endpoints.into_iter().zip([50u32, 60, 70]) {
        messenger
            .send(
                endpoint,
                MessageBody::Share(SharePayload {
                    comp_id,
                    sender_uid,
                    share_value,
                }),
            )
            .await?;
    }
    // replay the first delivery
    messenger
        .send(
            endpoints[0],
            MessageBody::Share(SharePayload {
                comp_id,
                sender_uid,
                share_value: 50,
            }),
        )
        .await?;

    let record = network.wait_for_computation(comp_id, RESULT_TIMEOUT).await?;
    assert_eq!(record.status, ComputationStatus::Completed);
    assert_eq!(record.result, Some(180));
    assert_eq!(record.participants_count, Some(1));

    network.shutdown().await
}

/// Duplicate descriptor deliveries are idempotent on both roles: the
/// coordinator keeps a single aggregation state and the participant
/// answers at most once.
#[tokio::test(flavor = "multi_thread")]
async fn duplicate_descriptor_deliveries_are_idempotent() -> eyre::Result<()> {
    let network = TestNetwork::start(3, &[42]).await?;
    let comp_id = network.propose(Duration::from_secs(2), 1).await?;

    let descriptor = network
        .registry
        .get_computation(comp_id)
        .await?
        .expect("proposal is stored")
        .descriptor;
    let messenger = network.messenger();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let primary_ack = messenger
        .send(
            network.coordinators[0].endpoint(),
            MessageBody::Computation(descriptor.clone()),
        )
        .await?;
    assert!(primary_ack.is_ok());
    let participant_ack = messenger
        .send(
            network.participants[0].endpoint(),
            MessageBody::Computation(descriptor),
        )
        .await?;
    assert!(participant_ack.is_ok());

    let record = network.wait_for_computation(comp_id, RESULT_TIMEOUT).await?;
    assert_eq!(record.status, ComputationStatus::Completed);
    assert_eq!(record.result, Some(42));
    assert_eq!(record.participants_count, Some(1));

    network.shutdown().await
}

#[tokio::test(flavor = "multi_thread")]
async fn terminal_status_never_changes() -> eyre::Result<()> {
    let network = TestNetwork::start(3, &[42]).await?;
    let comp_id = network.propose(Duration::from_secs(2), 1).await?;
    let record = network.wait_for_computation(comp_id, RESULT_TIMEOUT).await?;
    assert_eq!(record.status, ComputationStatus::Completed);

    assert!(
        !network
            .registry
            .set_computation_failed(comp_id, &FailureReason::MissingPartialSums)
            .await?
    );
    assert!(!network.registry.set_computation_result(comp_id, 0, 0).await?);
    let record = network
        .registry
        .get_computation(comp_id)
        .await?
        .expect("still stored");
    assert_eq!(record.status, ComputationStatus::Completed);
    assert_eq!(record.result, Some(42));

    network.shutdown().await
}

#[tokio::test(flavor = "multi_thread")]
async fn registry_rejects_duplicate_uid_and_endpoint() -> eyre::Result<()> {
    let data_dir = TempDir::new()?;
    let registry = tally_node::Registry::open(data_dir.path(), 18999).await?;

    let uid = NodeUid::generate();
    let endpoint = registry.next_available_endpoint().await?;
    assert!(registry.register_node(uid, NodeRole::Coordinator, endpoint).await?);
    assert_eq!(registry.list_nodes().await?.len(), 1);
    assert_eq!(
        registry.list_nodes_by_role(NodeRole::Coordinator).await?.len(),
        1
    );
    assert!(
        registry
            .list_nodes_by_role(NodeRole::Participant)
            .await?
            .is_empty()
    );
    // same uid, fresh endpoint
    let other_endpoint = registry.next_available_endpoint().await?;
    assert_ne!(endpoint, other_endpoint);
    assert!(
        !registry
            .register_node(uid, NodeRole::Coordinator, other_endpoint)
            .await?
    );
    // fresh uid, taken endpoint
    assert!(
        !registry
            .register_node(NodeUid::generate(), NodeRole::Participant, endpoint)
            .await?
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn health_and_shutdown_endpoints() -> eyre::Result<()> {
    let mut network = TestNetwork::start(1, &[]).await?;
    let node_uid = network.coordinators[0].uid();
    let endpoint = network.coordinators[0].endpoint();

    let health: tally_types::api::HealthResponse =
        reqwest::get(format!("http://127.0.0.1:{endpoint}/health"))
            .await?
            .error_for_status()?
            .json()
            .await?;
    assert_eq!(health.status, "ok");
    assert_eq!(health.node_id, node_uid);
    assert_eq!(health.node_status, tally_types::NodeStatus::Active);

    let shutdown: tally_types::api::ShutdownResponse = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{endpoint}/shutdown"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    assert_eq!(shutdown.status, "shutting_down");

    // the endpoint already cancelled the node's token; join performs the
    // drain and removes the registry row
    let node = network.coordinators.remove(0);
    let registry = node.registry().clone();
    node.join().await?;
    assert!(registry.lookup_node(node_uid).await?.is_none());

    network.shutdown().await
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_and_misdirected_messages_are_answered_not_fatal() -> eyre::Result<()> {
    let network = TestNetwork::start(3, &[]).await?;
    let endpoint = network.coordinators[0].endpoint();
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{endpoint}/message");

    // unknown message type
    let response = client
        .post(&url)
        .json(&serde_json::json!({
            "type": "aggregate_request",
            "payload": {},
            "timestamp": chrono::Utc::now(),
        }))
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    // share with a missing required field
    let response = client
        .post(&url)
        .json(&serde_json::json!({
            "type": "share",
            "payload": { "comp_id": tally_types::ComputationId::generate() },
            "timestamp": chrono::Utc::now(),
        }))
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    // share for a computation this coordinator knows nothing about
    let response = client
        .post(&url)
        .json(&serde_json::json!({
            "type": "share",
            "payload": {
                "comp_id": tally_types::ComputationId::generate(),
                "sender_uid": NodeUid::generate(),
                "share_value": 1,
            },
            "timestamp": chrono::Utc::now(),
        }))
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    // the node is still healthy afterwards
    reqwest::get(format!("http://127.0.0.1:{endpoint}/health"))
        .await?
        .error_for_status()?;

    network.shutdown().await
}
