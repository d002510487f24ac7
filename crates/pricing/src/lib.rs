//! Pricing policy and federation routing.
//!
//! Pure policy code: credit arithmetic (model quality multipliers, seed
//! rewards), the dynamic compute price with median consensus, and the
//! ranking of federated coordinators for cross-coordinator task routing.

mod dynamic;
mod federation;
mod multiplier;

pub use dynamic::{DynamicPricer, PriceParams, ProposalWindow};
pub use federation::{FederatedCapabilities, ForwardTarget};
pub use multiplier::{claim_cost, model_quality_multiplier, model_seed_credits, task_credits};
