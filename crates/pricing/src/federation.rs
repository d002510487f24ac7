//! Federated capability tracking and forward-target selection.

use std::collections::HashMap;

use edgecoder_mesh_types::CapabilitySummary;
use edgecoder_primitives::CoordinatorId;
use tracing::debug;

/// Where to forward a task the local mesh cannot serve.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardTarget {
    pub coordinator_id: CoordinatorId,
    pub total_param_capacity: f64,
    pub avg_load: f64,
}

/// The per-coordinator capability map fed by `capability_summary` gossip.
///
/// Merge rule is most-recent-timestamp-wins; staleness is judged against
/// the broadcast cadence by the caller.
#[derive(Debug, Default)]
pub struct FederatedCapabilities {
    summaries: HashMap<CoordinatorId, (u64, CapabilitySummary)>,
}

impl FederatedCapabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a summary unless a newer one is already held.
    pub fn upsert(&mut self, summary: CapabilitySummary, received_at_ms: u64) {
        match self.summaries.get(&summary.coordinator_id) {
            Some((held_at, _)) if *held_at > received_at_ms => {
                debug!(coordinator = %summary.coordinator_id, "ignoring older capability summary");
            }
            _ => {
                self.summaries
                    .insert(summary.coordinator_id.clone(), (received_at_ms, summary));
            }
        }
    }

    /// Drops summaries received before `horizon_ms`.
    pub fn purge_stale(&mut self, horizon_ms: u64) {
        self.summaries.retain(|_, (ts, _)| *ts >= horizon_ms);
    }

    pub fn len(&self) -> usize {
        self.summaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.summaries.is_empty()
    }

    pub fn get(&self, coordinator: &CoordinatorId) -> Option<&CapabilitySummary> {
        self.summaries.get(coordinator).map(|(_, s)| s)
    }

    /// Coordinators that can serve `model` (or, with `None`, any model of
    /// at least `required_param_size`), best first: highest total capacity,
    /// then lowest average load.
    pub fn forward_candidates(
        &self,
        model: Option<&str>,
        required_param_size: f64,
    ) -> Vec<ForwardTarget> {
        let mut candidates: Vec<ForwardTarget> = self
            .summaries
            .values()
            .filter_map(|(_, summary)| {
                let (capacity, load) = match model {
                    Some(name) => {
                        let cap = summary.models.get(name)?;
                        if cap.agent_count == 0 {
                            return None;
                        }
                        (cap.total_param_capacity, cap.avg_load)
                    }
                    None => {
                        let serving: Vec<_> = summary
                            .models
                            .values()
                            .filter(|c| {
                                c.agent_count > 0
                                    && c.total_param_capacity / c.agent_count as f64
                                        >= required_param_size
                            })
                            .collect();
                        if serving.is_empty() {
                            return None;
                        }
                        let capacity = serving.iter().map(|c| c.total_param_capacity).sum();
                        let load = serving.iter().map(|c| c.avg_load).sum::<f64>()
                            / serving.len() as f64;
                        (capacity, load)
                    }
                };
                Some(ForwardTarget {
                    coordinator_id: summary.coordinator_id.clone(),
                    total_param_capacity: capacity,
                    avg_load: load,
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.total_param_capacity
                .partial_cmp(&a.total_param_capacity)
                .expect("capacities are finite")
                .then(
                    a.avg_load
                        .partial_cmp(&b.avg_load)
                        .expect("loads are finite"),
                )
                .then(a.coordinator_id.cmp(&b.coordinator_id))
        });
        candidates
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use edgecoder_mesh_types::ModelCapability;

    use super::*;

    fn summary(id: &str, model: &str, agents: u64, capacity: f64, load: f64) -> CapabilitySummary {
        let mut models = BTreeMap::new();
        models.insert(
            model.to_owned(),
            ModelCapability {
                agent_count: agents,
                total_param_capacity: capacity,
                avg_load: load,
            },
        );
        CapabilitySummary {
            coordinator_id: CoordinatorId::new(id),
            agent_count: agents,
            models,
        }
    }

    #[test]
    fn ranks_by_capacity_then_load() {
        let mut fed = FederatedCapabilities::new();
        fed.upsert(summary("c1", "qwen:7b", 2, 14.0, 0.5), 100);
        fed.upsert(summary("c2", "qwen:7b", 4, 28.0, 0.9), 100);
        fed.upsert(summary("c3", "qwen:7b", 4, 28.0, 0.1), 100);

        let targets = fed.forward_candidates(Some("qwen:7b"), 7.0);
        let ids: Vec<_> = targets
            .iter()
            .map(|t| t.coordinator_id.as_str().to_owned())
            .collect();
        assert_eq!(ids, vec!["c3", "c2", "c1"]);
    }

    #[test]
    fn skips_coordinators_without_the_model() {
        let mut fed = FederatedCapabilities::new();
        fed.upsert(summary("c1", "qwen:7b", 2, 14.0, 0.5), 100);
        fed.upsert(summary("c2", "llama:3b", 4, 12.0, 0.1), 100);

        let targets = fed.forward_candidates(Some("qwen:7b"), 7.0);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].coordinator_id.as_str(), "c1");
    }

    #[test]
    fn zero_agent_entries_are_not_candidates() {
        let mut fed = FederatedCapabilities::new();
        fed.upsert(summary("c1", "qwen:7b", 0, 0.0, 0.0), 100);
        assert!(fed.forward_candidates(Some("qwen:7b"), 7.0).is_empty());
    }

    #[test]
    fn older_summary_does_not_replace_newer() {
        let mut fed = FederatedCapabilities::new();
        fed.upsert(summary("c1", "qwen:7b", 4, 28.0, 0.5), 200);
        fed.upsert(summary("c1", "qwen:7b", 1, 7.0, 0.5), 100);
        let held = fed.get(&CoordinatorId::new("c1")).unwrap();
        assert_eq!(held.agent_count, 4);
    }

    #[test]
    fn purge_drops_stale_entries() {
        let mut fed = FederatedCapabilities::new();
        fed.upsert(summary("c1", "qwen:7b", 2, 14.0, 0.5), 100);
        fed.upsert(summary("c2", "qwen:7b", 2, 14.0, 0.5), 900);
        fed.purge_stale(500);
        assert_eq!(fed.len(), 1);
        assert!(fed.get(&CoordinatorId::new("c2")).is_some());
    }

    #[test]
    fn model_agnostic_lookup_respects_required_size() {
        let mut fed = FederatedCapabilities::new();
        // average size 1.5B, below the requirement
        fed.upsert(summary("c1", "qwen:1.5b", 2, 3.0, 0.1), 100);
        // average size 7B
        fed.upsert(summary("c2", "qwen:7b", 2, 14.0, 0.1), 100);

        let targets = fed.forward_candidates(None, 7.0);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].coordinator_id.as_str(), "c2");
    }
}
