//! Task offer / claim race.
//!
//! After broadcasting a `task_offer`, the coordinator waits out the claim
//! delay while claims accumulate here. The winner is the lowest-cost claim,
//! ties broken by earliest arrival, then agent id. Everyone else gets a
//! `claim_rejected`.

use std::collections::HashMap;

use edgecoder_primitives::{AgentId, TaskId};
use parking_lot::Mutex;
use tracing::debug;

/// One claim received during the delay window.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimRecord {
    pub claimant: AgentId,
    pub cost: f64,
    pub received_at_ms: u64,
}

/// Result of resolving an offer.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimOutcome {
    pub winner: ClaimRecord,
    pub losers: Vec<ClaimRecord>,
}

#[derive(Debug, Default)]
struct PendingOffer {
    opened_at_ms: u64,
    claims: Vec<ClaimRecord>,
}

/// Collects claims per offered task.
#[derive(Debug, Default)]
pub struct ClaimCollector {
    pending: Mutex<HashMap<TaskId, PendingOffer>>,
}

impl ClaimCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the claim window for a task.
    pub fn open_offer(&self, task_id: TaskId, now_ms: u64) {
        self.pending.lock().entry(task_id).or_insert(PendingOffer {
            opened_at_ms: now_ms,
            claims: Vec::new(),
        });
    }

    /// Records a claim if the task has an open window and the claimant has
    /// not already claimed. Returns whether the claim was accepted into
    /// the race.
    pub fn record_claim(
        &self,
        task_id: &TaskId,
        claimant: AgentId,
        cost: f64,
        now_ms: u64,
    ) -> bool {
        let mut pending = self.pending.lock();
        let Some(offer) = pending.get_mut(task_id) else {
            debug!(task = %task_id, claimant = %claimant, "claim for unknown offer");
            return false;
        };
        if offer.claims.iter().any(|c| c.claimant == claimant) {
            return false;
        }
        offer.claims.push(ClaimRecord {
            claimant,
            cost,
            received_at_ms: now_ms,
        });
        true
    }

    /// Closes the window and picks the winner, if anyone claimed.
    pub fn resolve(&self, task_id: &TaskId) -> Option<ClaimOutcome> {
        let offer = self.pending.lock().remove(task_id)?;
        let mut claims = offer.claims;
        if claims.is_empty() {
            return None;
        }

        claims.sort_by(|a, b| {
            a.cost
                .partial_cmp(&b.cost)
                .expect("claim costs are validated finite")
                .then_with(|| a.received_at_ms.cmp(&b.received_at_ms))
                .then_with(|| a.claimant.cmp(&b.claimant))
        });

        let winner = claims.remove(0);
        Some(ClaimOutcome {
            winner,
            losers: claims,
        })
    }

    /// Drops windows opened before `horizon_ms` whose offers were never
    /// resolved (e.g. the offering task was cancelled).
    pub fn expire_stale(&self, horizon_ms: u64) {
        self.pending
            .lock()
            .retain(|_, offer| offer.opened_at_ms >= horizon_ms);
    }

    pub fn open_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_cost_wins_regardless_of_arrival() {
        let collector = ClaimCollector::new();
        let task = TaskId::new("t2");
        collector.open_offer(task.clone(), 0);

        // a1 arrives at 10ms with cost 30, a2 at 150ms with cost 20
        assert!(collector.record_claim(&task, AgentId::new("a1"), 30.0, 10));
        assert!(collector.record_claim(&task, AgentId::new("a2"), 20.0, 150));

        let outcome = collector.resolve(&task).unwrap();
        assert_eq!(outcome.winner.claimant, AgentId::new("a2"));
        assert_eq!(outcome.losers.len(), 1);
        assert_eq!(outcome.losers[0].claimant, AgentId::new("a1"));
    }

    #[test]
    fn cost_tie_breaks_on_arrival_then_id() {
        let collector = ClaimCollector::new();
        let task = TaskId::new("t1");
        collector.open_offer(task.clone(), 0);
        collector.record_claim(&task, AgentId::new("b"), 10.0, 100);
        collector.record_claim(&task, AgentId::new("a"), 10.0, 100);
        collector.record_claim(&task, AgentId::new("c"), 10.0, 50);

        let outcome = collector.resolve(&task).unwrap();
        assert_eq!(outcome.winner.claimant, AgentId::new("c"));
        assert_eq!(outcome.losers[0].claimant, AgentId::new("a"));
        assert_eq!(outcome.losers[1].claimant, AgentId::new("b"));
    }

    #[test]
    fn claims_without_open_offer_rejected() {
        let collector = ClaimCollector::new();
        assert!(!collector.record_claim(&TaskId::new("t1"), AgentId::new("a1"), 1.0, 0));
    }

    #[test]
    fn double_claim_from_same_agent_ignored() {
        let collector = ClaimCollector::new();
        let task = TaskId::new("t1");
        collector.open_offer(task.clone(), 0);
        assert!(collector.record_claim(&task, AgentId::new("a1"), 5.0, 10));
        assert!(!collector.record_claim(&task, AgentId::new("a1"), 1.0, 20));
    }

    #[test]
    fn resolve_is_single_shot() {
        let collector = ClaimCollector::new();
        let task = TaskId::new("t1");
        collector.open_offer(task.clone(), 0);
        collector.record_claim(&task, AgentId::new("a1"), 5.0, 10);
        assert!(collector.resolve(&task).is_some());
        // the window is gone: no second winner, late claims rejected
        assert!(collector.resolve(&task).is_none());
        assert!(!collector.record_claim(&task, AgentId::new("a2"), 1.0, 20));
    }

    #[test]
    fn unclaimed_offer_resolves_to_none() {
        let collector = ClaimCollector::new();
        let task = TaskId::new("t1");
        collector.open_offer(task.clone(), 0);
        assert!(collector.resolve(&task).is_none());
    }

    #[test]
    fn stale_windows_expire() {
        let collector = ClaimCollector::new();
        collector.open_offer(TaskId::new("t1"), 100);
        collector.open_offer(TaskId::new("t2"), 900);
        collector.expire_stale(500);
        assert_eq!(collector.open_count(), 1);
    }
}
