//! Per-computation aggregation state machine for coordinators.
//!
//! One [`Aggregation`] exists per `(coordinator, computation)` pair. It
//! is created when the descriptor first reaches the coordinator and
//! discarded once a terminal phase is reached. The machine is purely
//! event-driven: the hosting service feeds in shares, init confirms,
//! deadline ticks, and reveal traffic, and acts on the returned
//! outcomes. All mutation of one instance must be serialized by the
//! caller.
//!
//! Phases follow the collection protocol:
//!
//! ```text
//! READY -> COLLECTING -> FINALIZING -> REVEALING       -> DONE | FAILED
//!                                   -> AWAITING_REVEAL -> DONE
//! ```
//!
//! The primary coordinator (first of the ordered triple) walks the
//! `REVEALING` branch and is the only writer of the computation's
//! terminal status; secondaries walk `AWAITING_REVEAL` and answer a
//! single reveal request.

use std::collections::{HashMap, HashSet};
use std::fmt;

use tally_types::{ComputationId, CoordinatorSet, FailureReason, NodeUid};

/// Phase of the per-computation state machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Initialized; the primary is waiting for init confirms.
    Ready,
    /// Accepting shares until the deadline.
    Collecting,
    /// Primary: reveal requests are out, peer partial sums pending.
    Revealing,
    /// Secondary: partial sum computed, waiting for the reveal request.
    AwaitingReveal,
    /// Terminal: the computation finished on this coordinator.
    Done,
    /// Terminal: the computation failed on this coordinator.
    Failed(FailureReason),
}

impl Phase {
    /// Returns `true` iff the phase is `Done` or `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Failed(_))
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Ready => f.write_str("ready"),
            Phase::Collecting => f.write_str("collecting"),
            Phase::Revealing => f.write_str("revealing"),
            Phase::AwaitingReveal => f.write_str("awaiting_reveal"),
            Phase::Done => f.write_str("done"),
            Phase::Failed(reason) => write!(f, "failed:{reason}"),
        }
    }
}

/// Errors raised when an event is not acceptable for the current phase
/// or sender.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AggregationError {
    /// The local coordinator is not named in the computation's triple.
    #[error("coordinator {coordinator} is not named for computation {comp_id}")]
    NotACoordinator {
        /// The local coordinator.
        coordinator: NodeUid,
        /// The offending computation.
        comp_id: ComputationId,
    },
    /// A share arrived outside the collecting window.
    #[error("share not accepted in phase {0}")]
    ShareNotAccepted(Phase),
    /// A reveal request arrived while not awaiting one.
    #[error("reveal request not accepted in phase {0}")]
    RevealNotAccepted(Phase),
    /// A peer partial sum arrived outside the revealing phase.
    #[error("peer partial sum not accepted in phase {0}")]
    PeerSumNotAccepted(Phase),
    /// An init confirm arrived from a node that is not a secondary of
    /// this computation.
    #[error("init confirm from {0}, which is not a secondary")]
    UnknownSecondary(NodeUid),
    /// A partial sum arrived from a node that is not a secondary of
    /// this computation.
    #[error("partial sum from {0}, which is not a secondary")]
    UnknownPeer(NodeUid),
}

/// Outcome of the deadline tick.
#[derive(Debug, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// Primary with enough contributors: reveal requests should go out.
    BeginReveal {
        /// The local partial sum.
        partial_sum: u32,
        /// Distinct contributors observed locally.
        contributors: u32,
    },
    /// Secondary with enough contributors: wait for the reveal request.
    AwaitReveal,
    /// Fewer distinct contributors than the anonymity threshold; the
    /// machine moved to `Failed`.
    ThresholdNotMet {
        /// Distinct contributors observed locally.
        contributors: u32,
    },
    /// The machine was already terminal; nothing to do.
    AlreadyTerminal,
}

/// Outcome of closing the reveal phase on the primary.
#[derive(Debug, PartialEq, Eq)]
pub enum RevealOutcome {
    /// All partial sums present; the machine moved to `Done`.
    Completed {
        /// The reconstructed total, mod 2^32.
        total: u32,
        /// Distinct contributors observed at the primary.
        contributors: u32,
    },
    /// At least one peer sum missing after the grace period; the machine
    /// moved to `Failed`.
    MissingPartialSums {
        /// The secondaries that never reported.
        missing: Vec<NodeUid>,
    },
    /// The machine was already terminal; nothing to do.
    AlreadyTerminal,
}

/// Aggregation state of one coordinator for one computation.
#[derive(Debug)]
pub struct Aggregation {
    comp_id: ComputationId,
    coordinator: NodeUid,
    coordinators: CoordinatorSet,
    min_participants: u32,
    phase: Phase,
    received_shares: HashMap<NodeUid, u32>,
    peer_partial_sums: HashMap<NodeUid, u32>,
    init_confirmations: HashSet<NodeUid>,
}

impl Aggregation {
    /// Creates the aggregation state for `coordinator`, entering
    /// `Ready`.
    ///
    /// Fails if `coordinator` is not named in the computation's ordered
    /// triple; such descriptors must be dropped without allocating
    /// state.
    pub fn new(
        comp_id: ComputationId,
        coordinator: NodeUid,
        coordinators: CoordinatorSet,
        min_participants: u32,
    ) -> Result<Self, AggregationError> {
        if !coordinators.contains(coordinator) {
            return Err(AggregationError::NotACoordinator {
                coordinator,
                comp_id,
            });
        }
        Ok(Self {
            comp_id,
            coordinator,
            coordinators,
            min_participants,
            phase: Phase::Ready,
            received_shares: HashMap::new(),
            peer_partial_sums: HashMap::new(),
            init_confirmations: HashSet::new(),
        })
    }

    /// The computation this state belongs to.
    pub fn comp_id(&self) -> ComputationId {
        self.comp_id
    }

    /// The current phase.
    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// Returns `true` iff the local coordinator is the primary of this
    /// computation.
    pub fn is_primary(&self) -> bool {
        self.coordinators.primary() == self.coordinator
    }

    /// The two secondaries of this computation.
    pub fn secondaries(&self) -> [NodeUid; 2] {
        self.coordinators.secondaries()
    }

    /// The primary of this computation.
    pub fn primary(&self) -> NodeUid {
        self.coordinators.primary()
    }

    /// Number of distinct contributors observed locally.
    pub fn contributor_count(&self) -> u32 {
        self.received_shares.len() as u32
    }

    /// The local partial sum: wrapping sum of all stored shares.
    pub fn partial_sum(&self) -> u32 {
        self.received_shares
            .values()
            .fold(0u32, |acc, s| acc.wrapping_add(*s))
    }

    /// Opens the share collection window.
    ///
    /// A secondary calls this right after sending its init confirm; the
    /// primary after its init barrier elapsed. No-op unless in `Ready`.
    pub fn begin_collecting(&mut self) {
        if self.phase == Phase::Ready {
            self.phase = Phase::Collecting;
        }
    }

    /// Records an init confirm from a secondary (primary side).
    ///
    /// Returns `true` once both secondaries have confirmed. Confirms are
    /// accepted in `Ready` and, for stragglers, in `Collecting`.
    pub fn record_init_confirm(&mut self, peer: NodeUid) -> Result<bool, AggregationError> {
        if !self.secondaries().contains(&peer) {
            return Err(AggregationError::UnknownSecondary(peer));
        }
        self.init_confirmations.insert(peer);
        Ok(self
            .secondaries()
            .iter()
            .all(|s| self.init_confirmations.contains(s)))
    }

    /// Inserts a share, last-writer-wins per sender.
    ///
    /// Accepted only while `Collecting`; anything else is a state error
    /// for the caller to answer on the request channel.
    pub fn add_share(&mut self, sender: NodeUid, share: u32) -> Result<(), AggregationError> {
        if self.phase != Phase::Collecting {
            return Err(AggregationError::ShareNotAccepted(self.phase.clone()));
        }
        self.received_shares.insert(sender, share);
        Ok(())
    }

    /// Returns `true` once both secondaries have confirmed
    /// initialization (primary side).
    pub fn init_confirmed(&self) -> bool {
        self.secondaries()
            .iter()
            .all(|s| self.init_confirmations.contains(s))
    }

    /// Deadline tick: closes the window and computes the partial sum.
    ///
    /// The primary enforces the anonymity threshold and moves to
    /// `Revealing`; secondaries do not enforce the threshold and move to
    /// `AwaitingReveal` unconditionally. Idempotent once terminal.
    pub fn finalize(&mut self) -> FinalizeOutcome {
        if self.phase.is_terminal() {
            return FinalizeOutcome::AlreadyTerminal;
        }
        if !self.is_primary() {
            self.phase = Phase::AwaitingReveal;
            return FinalizeOutcome::AwaitReveal;
        }
        let contributors = self.contributor_count();
        if contributors < self.min_participants {
            self.phase = Phase::Failed(FailureReason::AnonymityThresholdNotMet);
            return FinalizeOutcome::ThresholdNotMet { contributors };
        }
        self.phase = Phase::Revealing;
        FinalizeOutcome::BeginReveal {
            partial_sum: self.partial_sum(),
            contributors,
        }
    }

    /// Answers the reveal request on a secondary.
    ///
    /// Returns the local partial sum and contributor count and moves to
    /// `Done`. Outside `AwaitingReveal` the request is answered with an
    /// error status.
    pub fn take_reveal(&mut self) -> Result<(u32, u32), AggregationError> {
        if self.phase != Phase::AwaitingReveal {
            return Err(AggregationError::RevealNotAccepted(self.phase.clone()));
        }
        let result = (self.partial_sum(), self.contributor_count());
        self.phase = Phase::Done;
        Ok(result)
    }

    /// Records a peer partial sum on the primary.
    ///
    /// Returns `true` once both secondaries have reported. Outside
    /// `Revealing` the call is rejected so the caller can drop the
    /// stray response.
    pub fn record_peer_partial_sum(
        &mut self,
        peer: NodeUid,
        partial_sum: u32,
    ) -> Result<bool, AggregationError> {
        if self.phase != Phase::Revealing {
            return Err(AggregationError::PeerSumNotAccepted(self.phase.clone()));
        }
        if !self.secondaries().contains(&peer) {
            return Err(AggregationError::UnknownPeer(peer));
        }
        self.peer_partial_sums.insert(peer, partial_sum);
        Ok(self.peer_partial_sums.len() == self.secondaries().len())
    }

    /// Closes the reveal phase on the primary.
    ///
    /// With both peer sums present, reconstructs the total as the
    /// wrapping sum of all three partial sums and moves to `Done`;
    /// otherwise moves to `Failed` and names the missing secondaries.
    /// Idempotent once terminal, so the grace timer and an early
    /// completion racing each other resolve to a single transition.
    pub fn complete_reveal(&mut self) -> RevealOutcome {
        if self.phase.is_terminal() {
            return RevealOutcome::AlreadyTerminal;
        }
        let missing = self
            .secondaries()
            .into_iter()
            .filter(|s| !self.peer_partial_sums.contains_key(s))
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            self.phase = Phase::Failed(FailureReason::MissingPartialSums);
            return RevealOutcome::MissingPartialSums { missing };
        }
        let total = self
            .peer_partial_sums
            .values()
            .fold(self.partial_sum(), |acc, s| acc.wrapping_add(*s));
        let contributors = self.contributor_count();
        self.phase = Phase::Done;
        RevealOutcome::Completed {
            total,
            contributors,
        }
    }

    /// Moves to `Failed` with `reason`, unless already terminal.
    pub fn fail(&mut self, reason: FailureReason) {
        if !self.phase.is_terminal() {
            self.phase = Phase::Failed(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triple() -> (CoordinatorSet, [NodeUid; 3]) {
        let uids = [NodeUid::generate(), NodeUid::generate(), NodeUid::generate()];
        (CoordinatorSet::new(uids), uids)
    }

    fn agg(coordinator: NodeUid, set: CoordinatorSet, min: u32) -> Aggregation {
        Aggregation::new(ComputationId::generate(), coordinator, set, min).unwrap()
    }

    #[test]
    fn unnamed_coordinator_is_rejected() {
        let (set, _) = triple();
        let err = Aggregation::new(ComputationId::generate(), NodeUid::generate(), set, 1)
            .unwrap_err();
        assert!(matches!(err, AggregationError::NotACoordinator { .. }));
    }

    #[test]
    fn shares_only_accepted_while_collecting() {
        let (set, uids) = triple();
        let mut agg = agg(uids[0], set, 1);
        let contributor = NodeUid::generate();

        assert_eq!(
            agg.add_share(contributor, 5),
            Err(AggregationError::ShareNotAccepted(Phase::Ready))
        );
        agg.begin_collecting();
        agg.add_share(contributor, 5).unwrap();
        agg.finalize();
        assert!(matches!(
            agg.add_share(contributor, 6),
            Err(AggregationError::ShareNotAccepted(_))
        ));
        // the late share did not leak into the partial sum
        assert_eq!(agg.partial_sum(), 5);
    }

    #[test]
    fn duplicate_share_is_last_writer_wins() {
        let (set, uids) = triple();
        let mut agg = agg(uids[1], set, 1);
        agg.begin_collecting();
        let contributor = NodeUid::generate();
        agg.add_share(contributor, 10).unwrap();
        agg.add_share(contributor, 20).unwrap();
        assert_eq!(agg.contributor_count(), 1);
        assert_eq!(agg.partial_sum(), 20);
    }

    #[test]
    fn partial_sum_wraps() {
        let (set, uids) = triple();
        let mut agg = agg(uids[0], set, 1);
        agg.begin_collecting();
        agg.add_share(NodeUid::generate(), u32::MAX).unwrap();
        agg.add_share(NodeUid::generate(), 2).unwrap();
        assert_eq!(agg.partial_sum(), 1);
    }

    #[test]
    fn primary_walks_reveal_branch() {
        let (set, uids) = triple();
        let mut agg = agg(uids[0], set, 1);
        assert!(agg.is_primary());
        agg.begin_collecting();
        agg.add_share(NodeUid::generate(), 40).unwrap();

        let outcome = agg.finalize();
        assert_eq!(
            outcome,
            FinalizeOutcome::BeginReveal {
                partial_sum: 40,
                contributors: 1
            }
        );
        assert!(!agg.record_peer_partial_sum(uids[1], 1).unwrap());
        assert!(agg.record_peer_partial_sum(uids[2], 1).unwrap());
        assert_eq!(
            agg.complete_reveal(),
            RevealOutcome::Completed {
                total: 42,
                contributors: 1
            }
        );
        assert_eq!(agg.phase(), &Phase::Done);
        // a racing grace timer sees the terminal phase and backs off
        assert_eq!(agg.complete_reveal(), RevealOutcome::AlreadyTerminal);
    }

    #[test]
    fn secondary_awaits_and_answers_reveal() {
        let (set, uids) = triple();
        let mut agg = agg(uids[2], set, 1);
        assert!(!agg.is_primary());
        agg.begin_collecting();
        agg.add_share(NodeUid::generate(), 7).unwrap();
        agg.add_share(NodeUid::generate(), 8).unwrap();

        assert_eq!(agg.finalize(), FinalizeOutcome::AwaitReveal);
        assert_eq!(agg.take_reveal().unwrap(), (15, 2));
        assert_eq!(agg.phase(), &Phase::Done);
        assert!(matches!(
            agg.take_reveal(),
            Err(AggregationError::RevealNotAccepted(_))
        ));
    }

    #[test]
    fn threshold_failure_at_deadline() {
        let (set, uids) = triple();
        let mut agg = agg(uids[0], set, 3);
        agg.begin_collecting();
        agg.add_share(NodeUid::generate(), 1).unwrap();
        agg.add_share(NodeUid::generate(), 2).unwrap();

        assert_eq!(
            agg.finalize(),
            FinalizeOutcome::ThresholdNotMet { contributors: 2 }
        );
        assert_eq!(
            agg.phase(),
            &Phase::Failed(FailureReason::AnonymityThresholdNotMet)
        );
        assert_eq!(agg.finalize(), FinalizeOutcome::AlreadyTerminal);
    }

    #[test]
    fn primary_with_zero_shares_fails_threshold_of_one() {
        let (set, uids) = triple();
        let mut agg = agg(uids[0], set, 1);
        agg.begin_collecting();
        assert_eq!(
            agg.finalize(),
            FinalizeOutcome::ThresholdNotMet { contributors: 0 }
        );
    }

    #[test]
    fn secondary_does_not_enforce_the_threshold() {
        let (set, uids) = triple();
        let mut agg = agg(uids[1], set, 5);
        agg.begin_collecting();
        assert_eq!(agg.finalize(), FinalizeOutcome::AwaitReveal);
        assert_eq!(agg.take_reveal().unwrap(), (0, 0));
    }

    #[test]
    fn missing_peer_sum_fails_reveal() {
        let (set, uids) = triple();
        let mut agg = agg(uids[0], set, 1);
        agg.begin_collecting();
        agg.add_share(NodeUid::generate(), 9).unwrap();
        agg.finalize();
        agg.record_peer_partial_sum(uids[1], 3).unwrap();

        match agg.complete_reveal() {
            RevealOutcome::MissingPartialSums { missing } => assert_eq!(missing, vec![uids[2]]),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(
            agg.phase(),
            &Phase::Failed(FailureReason::MissingPartialSums)
        );
    }

    #[test]
    fn init_confirms_complete_only_with_both_secondaries() {
        let (set, uids) = triple();
        let mut agg = agg(uids[0], set, 1);
        assert!(!agg.record_init_confirm(uids[1]).unwrap());
        // duplicate confirm is a no-op
        assert!(!agg.record_init_confirm(uids[1]).unwrap());
        assert!(agg.record_init_confirm(uids[2]).unwrap());
        assert!(matches!(
            agg.record_init_confirm(NodeUid::generate()),
            Err(AggregationError::UnknownSecondary(_))
        ));
    }

    #[test]
    fn peer_sums_rejected_outside_revealing() {
        let (set, uids) = triple();
        let mut agg = agg(uids[0], set, 1);
        assert!(matches!(
            agg.record_peer_partial_sum(uids[1], 1),
            Err(AggregationError::PeerSumNotAccepted(_))
        ));
    }
}
