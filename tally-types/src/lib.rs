#![deny(missing_docs)]
//! Core type definitions for the tally network.
//!
//! This crate groups together the strongly-typed values and message
//! structures used across the tally system. It provides:
//!
//! * Thin wrappers around primitive values such as node and computation
//!   identifiers, with consistent serialization and display implementations.
//! * The computation descriptor submitted by proposers and delivered to
//!   every node taking part in a computation.
//! * Status types for nodes and computations, including the terminal
//!   failure reasons a coordinator can report.
//! * The wire message envelope exchanged between nodes (see [`message`]
//!   module) and the HTTP response bodies (see [`api`] module).
//!
//! Use these types to pass, store, and (de)serialize identifiers and
//! protocol values in a type-safe way throughout the system.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod api;
pub mod message;

/// Unique identifier of a node in the network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeUid(Uuid);

/// Unique identifier of a computation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComputationId(Uuid);

impl NodeUid {
    /// Generates a fresh random node uid.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Converts the uid into the wrapped [`Uuid`].
    pub fn into_inner(self) -> Uuid {
        self.0
    }
}

impl ComputationId {
    /// Generates a fresh random computation id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Converts the id into the wrapped [`Uuid`].
    pub fn into_inner(self) -> Uuid {
        self.0
    }
}

impl fmt::Display for NodeUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for ComputationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for NodeUid {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl TryFrom<String> for NodeUid {
    type Error = uuid::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl FromStr for ComputationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// The role a node plays in the network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Holds per-computation aggregation state and takes part in the
    /// reveal exchange.
    Coordinator,
    /// Contributes a value by splitting it into shares.
    Participant,
}

impl NodeRole {
    /// Returns the canonical string form used on the wire and in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Coordinator => "coordinator",
            NodeRole::Participant => "participant",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coordinator" => Ok(NodeRole::Coordinator),
            "participant" => Ok(NodeRole::Participant),
            other => Err(ParseStatusError(other.to_owned())),
        }
    }
}

/// Lifecycle status of a node, as reported by its health endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Serving requests.
    Active,
    /// Draining after a shutdown signal.
    Stopping,
    /// Fully stopped.
    Stopped,
}

impl NodeStatus {
    /// Returns the canonical string form used on the wire and in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Active => "active",
            NodeStatus::Stopping => "stopping",
            NodeStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(NodeStatus::Active),
            "stopping" => Ok(NodeStatus::Stopping),
            "stopped" => Ok(NodeStatus::Stopped),
            other => Err(ParseStatusError(other.to_owned())),
        }
    }
}

/// Reason a computation reached a failure terminal state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureReason {
    /// The primary observed fewer distinct contributors than
    /// `min_participants`.
    AnonymityThresholdNotMet,
    /// Not every secondary reported its partial sum within the reveal
    /// grace period.
    MissingPartialSums,
    /// Any other failure, carrying a short description.
    Other(String),
}

impl FailureReason {
    /// Returns the reason as the string stored in the registry status
    /// column (without the `failed:` prefix).
    pub fn as_str(&self) -> &str {
        match self {
            FailureReason::AnonymityThresholdNotMet => "anonymity_threshold_not_met",
            FailureReason::MissingPartialSums => "missing_partial_sums",
            FailureReason::Other(reason) => reason,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a computation, as recorded in the registry.
///
/// The status column is the single source of truth for the outcome. A
/// terminal status (completed or failed) never changes again.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ComputationStatus {
    /// Submitted but no terminal transition yet.
    Pending,
    /// The primary reconstructed and stored the final sum.
    Completed,
    /// The computation failed with the given reason.
    Failed(FailureReason),
}

impl ComputationStatus {
    /// Returns `true` iff this status is `completed` or `failed:*`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ComputationStatus::Pending)
    }
}

impl fmt::Display for ComputationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputationStatus::Pending => f.write_str("pending"),
            ComputationStatus::Completed => f.write_str("completed"),
            ComputationStatus::Failed(reason) => write!(f, "failed:{reason}"),
        }
    }
}

/// Error returned when parsing a status or role string from storage.
#[derive(Debug, thiserror::Error)]
#[error("unrecognized status string: {0}")]
pub struct ParseStatusError(String);

impl FromStr for ComputationStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ComputationStatus::Pending),
            "completed" => Ok(ComputationStatus::Completed),
            other => match other.strip_prefix("failed:") {
                Some("anonymity_threshold_not_met") => Ok(ComputationStatus::Failed(
                    FailureReason::AnonymityThresholdNotMet,
                )),
                Some("missing_partial_sums") => {
                    Ok(ComputationStatus::Failed(FailureReason::MissingPartialSums))
                }
                Some(reason) => Ok(ComputationStatus::Failed(FailureReason::Other(
                    reason.to_owned(),
                ))),
                None => Err(ParseStatusError(other.to_owned())),
            },
        }
    }
}

/// The ordered coordinator triple of a computation.
///
/// The first entry is the primary; the other two are secondaries. The
/// order is fixed at submission and determines share assignment: the
/// i-th share of every contribution goes to the i-th coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CoordinatorSet([NodeUid; 3]);

impl CoordinatorSet {
    /// Creates a coordinator set from an ordered triple.
    pub fn new(coordinators: [NodeUid; 3]) -> Self {
        Self(coordinators)
    }

    /// The primary coordinator (first in the triple).
    pub fn primary(&self) -> NodeUid {
        self.0[0]
    }

    /// The two secondary coordinators, in order.
    pub fn secondaries(&self) -> [NodeUid; 2] {
        [self.0[1], self.0[2]]
    }

    /// Returns `true` iff `uid` is named in this set.
    pub fn contains(&self, uid: NodeUid) -> bool {
        self.0.contains(&uid)
    }

    /// Iterates over the triple in order.
    pub fn iter(&self) -> impl Iterator<Item = NodeUid> + '_ {
        self.0.iter().copied()
    }

    /// The triple as an array.
    pub fn as_array(&self) -> [NodeUid; 3] {
        self.0
    }
}

/// A computation descriptor, immutable once submitted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComputationDescriptor {
    /// Globally unique computation id.
    pub comp_id: ComputationId,
    /// The participant that submitted the computation.
    pub proposer_uid: NodeUid,
    /// Ordered coordinator triple; the first entry is the primary.
    pub coordinators: CoordinatorSet,
    /// Opaque prompt payload delivered to participants.
    pub prompt: String,
    /// Opaque schema tag describing the expected response shape.
    pub response_schema: String,
    /// Instant after which coordinators admit no further shares.
    pub deadline: DateTime<Utc>,
    /// Minimum distinct contributor count for a valid result.
    pub min_participants: u32,
}

/// A node row in the network registry.
#[derive(Clone, Debug)]
pub struct NodeRecord {
    /// The node's uid.
    pub uid: NodeUid,
    /// The node's role.
    pub role: NodeRole,
    /// The node's endpoint (a TCP port on the shared host).
    pub endpoint: u16,
    /// The node's lifecycle status.
    pub status: NodeStatus,
    /// When the node registered.
    pub created_at: DateTime<Utc>,
}

/// A computation row in the network registry: descriptor plus outcome.
#[derive(Clone, Debug)]
pub struct ComputationRecord {
    /// The immutable descriptor.
    pub descriptor: ComputationDescriptor,
    /// Current outcome.
    pub status: ComputationStatus,
    /// Reconstructed sum (a ring element), present when completed.
    pub result: Option<u32>,
    /// Distinct contributor count observed at the primary, present when
    /// completed.
    pub participants_count: Option<u32>,
    /// When the computation was submitted.
    pub created_at: DateTime<Utc>,
    /// When the computation reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl ComputationRecord {
    /// Derives the average from the stored sum and contributor count.
    ///
    /// Returns `None` unless the computation completed with at least one
    /// contributor.
    pub fn average(&self) -> Option<f64> {
        match (self.result, self.participants_count) {
            (Some(sum), Some(count)) if count > 0 => Some(f64::from(sum) / f64::from(count)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computation_status_round_trips_through_strings() {
        for status in [
            ComputationStatus::Pending,
            ComputationStatus::Completed,
            ComputationStatus::Failed(FailureReason::AnonymityThresholdNotMet),
            ComputationStatus::Failed(FailureReason::MissingPartialSums),
            ComputationStatus::Failed(FailureReason::Other("reveal exchange error".to_owned())),
        ] {
            let parsed: ComputationStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn coordinator_set_primary_is_first() {
        let uids = [NodeUid::generate(), NodeUid::generate(), NodeUid::generate()];
        let set = CoordinatorSet::new(uids);
        assert_eq!(set.primary(), uids[0]);
        assert_eq!(set.secondaries(), [uids[1], uids[2]]);
        assert!(set.contains(uids[2]));
        assert!(!set.contains(NodeUid::generate()));
    }
}
