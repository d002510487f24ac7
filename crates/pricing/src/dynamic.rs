//! Dynamic compute pricing.

use edgecoder_mesh_types::ResourceClass;
use edgecoder_primitives::CoordinatorId;

/// Tunables for the price formula.
#[derive(Debug, Clone, Copy)]
pub struct PriceParams {
    pub base_price_sats: f64,
    /// Utilisation weight.
    pub alpha: f64,
    /// Idle-fraction weight.
    pub beta: f64,
    pub min_price_sats: f64,
    pub max_price_sats: f64,
}

impl Default for PriceParams {
    fn default() -> Self {
        Self {
            base_price_sats: 10.0,
            alpha: 1.5,
            beta: 0.5,
            min_price_sats: 1.0,
            max_price_sats: 1_000.0,
        }
    }
}

/// Computes price proposals from local load observations.
#[derive(Debug, Clone)]
pub struct DynamicPricer {
    params: PriceParams,
}

impl DynamicPricer {
    pub fn new(params: PriceParams) -> Self {
        Self { params }
    }

    /// `base × (1 + α·utilisation − β·idle)`, clamped into the configured
    /// band. `capacity` is the summed concurrent-task capacity of live
    /// agents; `idle_fraction` the share of them currently unloaded.
    pub fn propose(&self, queued_tasks: u64, capacity: u64, idle_fraction: f64) -> f64 {
        let utilisation = queued_tasks as f64 / (capacity.max(1) as f64);
        let raw = self.params.base_price_sats
            * (1.0 + self.params.alpha * utilisation - self.params.beta * idle_fraction);
        raw.clamp(self.params.min_price_sats, self.params.max_price_sats)
    }
}

/// Collects price proposals from the mesh; the consensus price is the
/// median of proposals still inside the window.
#[derive(Debug, Default)]
pub struct ProposalWindow {
    /// `(received_at_ms, coordinator, resource_class, price)`
    proposals: Vec<(u64, CoordinatorId, ResourceClass, f64)>,
}

impl ProposalWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a proposal; a coordinator's newer proposal replaces its
    /// older one for the same resource class.
    pub fn record(
        &mut self,
        coordinator: CoordinatorId,
        class: ResourceClass,
        price: f64,
        now_ms: u64,
    ) {
        self.proposals
            .retain(|(_, c, cls, _)| !(c == &coordinator && *cls == class));
        self.proposals.push((now_ms, coordinator, class, price));
    }

    /// Drops proposals older than the window.
    pub fn expire(&mut self, now_ms: u64, window_ms: u64) {
        let horizon = now_ms.saturating_sub(window_ms);
        self.proposals.retain(|(ts, ..)| *ts >= horizon);
    }

    /// Median of live proposals for the class, if any.
    pub fn consensus(&self, class: ResourceClass) -> Option<f64> {
        let mut prices: Vec<f64> = self
            .proposals
            .iter()
            .filter(|(_, _, cls, _)| *cls == class)
            .map(|(_, _, _, p)| *p)
            .collect();
        if prices.is_empty() {
            return None;
        }
        prices.sort_by(|a, b| a.partial_cmp(b).expect("prices are finite"));
        let mid = prices.len() / 2;
        Some(if prices.len() % 2 == 1 {
            prices[mid]
        } else {
            (prices[mid - 1] + prices[mid]) / 2.0
        })
    }
}
