//! Issuance epochs.
//!
//! Once per window each coordinator proposes per-account earnings, peers
//! recompute and vote, and a majority commit applies the distribution.
//! Epochs that fail to reach quorum stall; their earnings roll into the
//! next window.

use std::collections::{BTreeMap, HashMap};

use edgecoder_mesh_types::{IssuanceCheckpoint, IssuanceCommit, IssuanceProposal, IssuanceVote};
use edgecoder_primitives::{AccountId, Buf32, CoordinatorId, EpochId};
use tracing::{info, warn};

/// Lifecycle of one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochStatus {
    /// Proposal broadcast, votes collecting.
    Voting,
    Committed,
    Checkpointed,
    Anchored,
    /// Voting window elapsed without quorum; earnings rolled forward.
    Stalled,
}

/// What a vote pushed the epoch into.
#[derive(Debug, Clone, PartialEq)]
pub enum IssuanceOutcome {
    /// Still collecting votes.
    Pending,
    /// Quorum reached; apply and broadcast this commit.
    Commit(IssuanceCommit),
}

#[derive(Debug)]
struct EpochState {
    epoch: EpochId,
    window_start_ms: u64,
    window_end_ms: u64,
    status: EpochStatus,
    earnings: BTreeMap<AccountId, f64>,
    /// Remote proposals for the same epoch, for auditing counter-views.
    remote_proposals: HashMap<CoordinatorId, BTreeMap<AccountId, f64>>,
    votes: HashMap<CoordinatorId, bool>,
    opened_at_ms: u64,
    anchor_ref: Option<String>,
}

/// Drives the local coordinator's epochs.
#[derive(Debug)]
pub struct IssuanceManager {
    coordinator_id: CoordinatorId,
    issuance_window_ms: u64,
    voting_window_ms: u64,
    /// Coordinators participating in quorum, the local one included.
    quorum_pool: u32,
    current: Option<EpochState>,
    next_epoch: EpochId,
    last_window_end_ms: u64,
    /// Earnings from stalled epochs awaiting re-inclusion.
    rollover: BTreeMap<AccountId, f64>,
}

impl IssuanceManager {
    pub fn new(
        coordinator_id: CoordinatorId,
        issuance_window_ms: u64,
        voting_window_ms: u64,
    ) -> Self {
        Self {
            coordinator_id,
            issuance_window_ms,
            voting_window_ms,
            quorum_pool: 1,
            current: None,
            next_epoch: EpochId::new(0),
            last_window_end_ms: 0,
            rollover: BTreeMap::new(),
        }
    }

    /// Updates the participating-coordinator count used for quorum math.
    pub fn set_quorum_pool(&mut self, coordinators: u32) {
        self.quorum_pool = coordinators.max(1);
    }

    /// Votes needed to commit: a strict majority of the pool.
    pub fn quorum_threshold(&self) -> u32 {
        self.quorum_pool / 2 + 1
    }

    pub fn current_status(&self) -> Option<EpochStatus> {
        self.current.as_ref().map(|e| e.status)
    }

    /// Whether the issuance window has elapsed and no epoch is in flight.
    pub fn should_open_epoch(&self, now_ms: u64) -> bool {
        let in_flight = matches!(
            self.current_status(),
            Some(EpochStatus::Voting | EpochStatus::Committed | EpochStatus::Checkpointed)
        );
        !in_flight && now_ms >= self.last_window_end_ms + self.issuance_window_ms
    }

    /// Opens a new epoch over `[window_start, now]` with the computed
    /// earnings plus any rollover from stalled epochs. Returns the
    /// proposal to broadcast.
    pub fn open_epoch(
        &mut self,
        now_ms: u64,
        mut earnings: BTreeMap<AccountId, f64>,
    ) -> IssuanceProposal {
        for (account, credits) in std::mem::take(&mut self.rollover) {
            *earnings.entry(account).or_insert(0.0) += credits;
        }

        let epoch = self.next_epoch;
        self.next_epoch = epoch.next();
        let window_start_ms = self.last_window_end_ms;

        self.current = Some(EpochState {
            epoch,
            window_start_ms,
            window_end_ms: now_ms,
            status: EpochStatus::Voting,
            earnings: earnings.clone(),
            remote_proposals: HashMap::new(),
            votes: HashMap::new(),
            opened_at_ms: now_ms,
            anchor_ref: None,
        });
        info!(coordinator = %self.coordinator_id, %epoch, accounts = earnings.len(), "issuance epoch opened");

        IssuanceProposal {
            epoch,
            window_start_ms,
            window_end_ms: now_ms,
            earnings,
        }
    }

    /// Judges a remote proposal against the local view and produces the
    /// vote to broadcast. Agreement means every account matches within a
    /// rounding tolerance.
    pub fn evaluate_proposal(
        &mut self,
        proposer: CoordinatorId,
        proposal: &IssuanceProposal,
        local_view: &BTreeMap<AccountId, f64>,
    ) -> IssuanceVote {
        let approve = maps_agree(&proposal.earnings, local_view);
        if let Some(state) = self.current.as_mut() {
            if state.epoch == proposal.epoch {
                state
                    .remote_proposals
                    .insert(proposer.clone(), proposal.earnings.clone());
            }
        }
        IssuanceVote {
            epoch: proposal.epoch,
            proposer,
            approve,
            counter: (!approve).then(|| local_view.clone()),
        }
    }

    /// Records a vote on the local proposal. Once approvals (the local
    /// coordinator's implicit self-approval included) reach quorum, the
    /// epoch commits.
    pub fn record_vote(
        &mut self,
        voter: CoordinatorId,
        epoch: EpochId,
        approve: bool,
    ) -> IssuanceOutcome {
        let threshold = self.quorum_threshold();
        let Some(state) = self.current.as_mut() else {
            return IssuanceOutcome::Pending;
        };
        if state.epoch != epoch || state.status != EpochStatus::Voting {
            return IssuanceOutcome::Pending;
        }
        state.votes.insert(voter, approve);

        let approvals = 1 + state.votes.values().filter(|v| **v).count() as u32;
        if approvals < threshold {
            return IssuanceOutcome::Pending;
        }

        state.status = EpochStatus::Committed;
        info!(epoch = %state.epoch, approvals, "issuance epoch committed");
        IssuanceOutcome::Commit(IssuanceCommit {
            epoch: state.epoch,
            earnings: state.earnings.clone(),
            approvals,
        })
    }

    /// Stalls the epoch if its voting window has elapsed. Earnings move to
    /// the rollover pool for the next epoch.
    pub fn check_stall(&mut self, now_ms: u64) -> bool {
        let Some(state) = self.current.as_mut() else {
            return false;
        };
        if state.status != EpochStatus::Voting
            || now_ms < state.opened_at_ms + self.voting_window_ms
        {
            return false;
        }

        state.status = EpochStatus::Stalled;
        warn!(
            epoch = %state.epoch,
            remote_proposals = state.remote_proposals.len(),
            approvals = state.votes.values().filter(|v| **v).count(),
            "issuance epoch stalled without quorum"
        );
        for (account, credits) in std::mem::take(&mut state.earnings) {
            *self.rollover.entry(account).or_insert(0.0) += credits;
        }
        self.last_window_end_ms = state.window_end_ms;
        true
    }

    /// After the commit is ordered, packages the head for anchoring.
    pub fn checkpoint(&mut self, head_hash: Buf32) -> Option<IssuanceCheckpoint> {
        let state = self.current.as_mut()?;
        if state.status != EpochStatus::Committed {
            return None;
        }
        state.status = EpochStatus::Checkpointed;
        self.last_window_end_ms = state.window_end_ms;
        Some(IssuanceCheckpoint {
            epoch: state.epoch,
            head_hash,
            anchor_ref: None,
        })
    }

    /// Records the anchor reference returned by the anchor adapter.
    pub fn record_anchor(&mut self, anchor_ref: String) {
        if let Some(state) = self.current.as_mut() {
            if state.status == EpochStatus::Checkpointed {
                state.anchor_ref = Some(anchor_ref);
                state.status = EpochStatus::Anchored;
            }
        }
    }

    pub fn rollover_total(&self) -> f64 {
        self.rollover.values().sum()
    }

    /// Anchor reference of the current epoch, once anchored.
    pub fn anchor_ref(&self) -> Option<&str> {
        self.current.as_ref()?.anchor_ref.as_deref()
    }
}

fn maps_agree(a: &BTreeMap<AccountId, f64>, b: &BTreeMap<AccountId, f64>) -> bool {
    const TOLERANCE: f64 = 1e-6;
    if a.len() != b.len() {
        return false;
    }
    a.iter().all(|(account, credits)| {
        b.get(account)
            .is_some_and(|other| (credits - other).abs() <= TOLERANCE)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn earnings(pairs: &[(&str, f64)]) -> BTreeMap<AccountId, f64> {
        pairs
            .iter()
            .map(|(id, credits)| (AccountId::new(*id), *credits))
            .collect()
    }

    fn manager(pool: u32) -> IssuanceManager {
        let mut mgr = IssuanceManager::new(CoordinatorId::new("c1"), 86_400_000, 600_000);
        mgr.set_quorum_pool(pool);
        mgr
    }

    #[test]
    fn quorum_threshold_is_strict_majority() {
        assert_eq!(manager(1).quorum_threshold(), 1);
        assert_eq!(manager(2).quorum_threshold(), 2);
        assert_eq!(manager(3).quorum_threshold(), 2);
        assert_eq!(manager(5).quorum_threshold(), 3);
    }

    #[test]
    fn epoch_commits_on_quorum() {
        let mut mgr = manager(3);
        mgr.open_epoch(1_000, earnings(&[("a", 5.0)]));

        // self-approval plus one remote vote reaches 2-of-3
        let outcome = mgr.record_vote(CoordinatorId::new("c2"), EpochId::new(0), true);
        let IssuanceOutcome::Commit(commit) = outcome else {
            panic!("expected commit");
        };
        assert_eq!(commit.approvals, 2);
        assert_eq!(commit.earnings, earnings(&[("a", 5.0)]));
        assert_eq!(mgr.current_status(), Some(EpochStatus::Committed));
    }

    #[test]
    fn disapprovals_do_not_commit() {
        let mut mgr = manager(5);
        mgr.open_epoch(1_000, earnings(&[("a", 5.0)]));
        assert_eq!(
            mgr.record_vote(CoordinatorId::new("c2"), EpochId::new(0), false),
            IssuanceOutcome::Pending
        );
        assert_eq!(
            mgr.record_vote(CoordinatorId::new("c3"), EpochId::new(0), true),
            IssuanceOutcome::Pending
        );
    }

    #[test]
    fn stalled_epoch_rolls_earnings_forward() {
        let mut mgr = manager(5);
        mgr.open_epoch(1_000, earnings(&[("a", 5.0), ("b", 2.0)]));
        assert!(!mgr.check_stall(1_000 + 599_999));
        assert!(mgr.check_stall(1_000 + 600_000));
        assert_eq!(mgr.current_status(), Some(EpochStatus::Stalled));
        assert!((mgr.rollover_total() - 7.0).abs() < 1e-9);

        // next epoch re-includes the stalled earnings
        let proposal = mgr.open_epoch(90_000_000, earnings(&[("a", 1.0)]));
        assert_eq!(proposal.earnings, earnings(&[("a", 6.0), ("b", 2.0)]));
        assert_eq!(mgr.rollover_total(), 0.0);
    }

    #[test]
    fn checkpoint_then_anchor() {
        let mut mgr = manager(1);
        mgr.open_epoch(1_000, earnings(&[("a", 5.0)]));
        // pool of one: the first (and only) vote is the self-approval,
        // which record_vote counts implicitly on any incoming vote; with
        // no peers the driver commits directly after opening.
        let outcome = mgr.record_vote(CoordinatorId::new("c1"), EpochId::new(0), true);
        assert!(matches!(outcome, IssuanceOutcome::Commit(_)));

        let checkpoint = mgr.checkpoint(Buf32::new([9; 32])).unwrap();
        assert_eq!(checkpoint.head_hash, Buf32::new([9; 32]));
        assert_eq!(mgr.current_status(), Some(EpochStatus::Checkpointed));

        mgr.record_anchor("btc:txid".into());
        assert_eq!(mgr.current_status(), Some(EpochStatus::Anchored));
        assert_eq!(mgr.anchor_ref(), Some("btc:txid"));
    }

    #[test]
    fn votes_for_wrong_epoch_ignored() {
        let mut mgr = manager(3);
        mgr.open_epoch(1_000, earnings(&[("a", 5.0)]));
        assert_eq!(
            mgr.record_vote(CoordinatorId::new("c2"), EpochId::new(7), true),
            IssuanceOutcome::Pending
        );
    }

    #[test]
    fn proposal_evaluation_compares_views() {
        let mut mgr = manager(3);
        mgr.open_epoch(1_000, earnings(&[("a", 5.0)]));

        let local = earnings(&[("a", 5.0)]);
        let proposal = IssuanceProposal {
            epoch: EpochId::new(0),
            window_start_ms: 0,
            window_end_ms: 1_000,
            earnings: earnings(&[("a", 5.0)]),
        };
        let vote = mgr.evaluate_proposal(CoordinatorId::new("c2"), &proposal, &local);
        assert!(vote.approve);
        assert!(vote.counter.is_none());

        let disagreeing = IssuanceProposal {
            earnings: earnings(&[("a", 9.0)]),
            ..proposal
        };
        let vote = mgr.evaluate_proposal(CoordinatorId::new("c2"), &disagreeing, &local);
        assert!(!vote.approve);
        assert_eq!(vote.counter, Some(local));
    }
}
