//! Credit arithmetic.

/// Piecewise-constant quality multiplier on earned credits, by model
/// parameter size in billions.
pub fn model_quality_multiplier(param_size: f64) -> f64 {
    if param_size >= 7.0 {
        1.0
    } else if param_size >= 3.0 {
        0.7
    } else if param_size >= 1.5 {
        0.5
    } else {
        0.3
    }
}

/// Credits earned for a completed task.
pub fn task_credits(cpu_seconds: f64, base_rate: f64, param_size: f64) -> f64 {
    cpu_seconds * base_rate * model_quality_multiplier(param_size)
}

/// Credits earned for seeding a model file of `size_bytes` to a peer,
/// boosted while few seeders exist.
pub fn model_seed_credits(size_bytes: u64, seeder_count: u32) -> f64 {
    let size_gb = size_bytes as f64 / 1_073_741_824.0;
    0.5 * size_gb * (1.0 + 1.0 / (seeder_count.max(1) as f64))
}

/// Expected execution cost a node attaches to a gossip task claim. Mirrors
/// the local-mesh routing penalties with the radio terms zeroed: smaller
/// models and busier nodes bid higher, so the fittest claimant wins the
/// claim-delay race.
pub fn claim_cost(active_param_size: f64, current_load: u32) -> f64 {
    let model_preference_penalty = ((7.0 - active_param_size) * 8.0).max(0.0);
    let load_penalty = current_load as f64 * 20.0;
    model_preference_penalty + load_penalty
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiplier_table() {
        assert_eq!(model_quality_multiplier(13.0), 1.0);
        assert_eq!(model_quality_multiplier(7.0), 1.0);
        assert_eq!(model_quality_multiplier(6.9), 0.7);
        assert_eq!(model_quality_multiplier(3.0), 0.7);
        assert_eq!(model_quality_multiplier(2.9), 0.5);
        assert_eq!(model_quality_multiplier(1.5), 0.5);
        assert_eq!(model_quality_multiplier(1.4), 0.3);
        assert_eq!(model_quality_multiplier(0.5), 0.3);
    }

    #[test]
    fn task_credits_happy_path() {
        // 2 cpu-seconds on a 7B model at base rate 1.0
        assert_eq!(task_credits(2.0, 1.0, 7.0), 2.0);
        // quality discount on a 1.5B model
        assert_eq!(task_credits(2.0, 1.0, 1.5), 1.0);
    }

    #[test]
    fn seed_credits_scale_with_scarcity() {
        let one_gb = 1_073_741_824;
        // sole seeder: 0.5 * 1 * (1 + 1/1) = 1.0
        assert!((model_seed_credits(one_gb, 1) - 1.0).abs() < 1e-9);
        // crowded swarm approaches 0.5 * size
        assert!((model_seed_credits(one_gb, 100) - 0.505).abs() < 1e-9);
        // zero seeder count treated as one
        assert!((model_seed_credits(one_gb, 0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn claim_cost_prefers_big_idle_models() {
        // 7B idle beats 1.5B idle beats 7B busy
        assert_eq!(claim_cost(7.0, 0), 0.0);
        assert_eq!(claim_cost(1.5, 0), 44.0);
        assert_eq!(claim_cost(7.0, 2), 40.0);
        // oversized models earn no extra preference
        assert_eq!(claim_cost(13.0, 0), 0.0);
    }
}
