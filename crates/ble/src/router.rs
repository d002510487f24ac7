//! Cost-based peer selection.

use edgecoder_config::BleConfig;
use tracing::debug;

use crate::{BlePeer, DeviceType, UNAVAILABLE_LOAD};

/// Scores one peer. Lower is better.
///
/// ```text
/// cost = model_preference + load + battery + signal penalties
/// ```
fn peer_cost(peer: &BlePeer) -> f64 {
    let ad = &peer.advertisement;
    let model_preference_penalty = ((7.0 - ad.model_param_size) * 8.0).max(0.0);
    let load_penalty = ad.current_load.max(0) as f64 * 20.0;
    let battery_penalty = if ad.device_type == DeviceType::Phone {
        (100.0 - ad.battery_pct as f64) * 0.5
    } else {
        0.0
    };
    let signal_penalty = ((-peer.rssi as f64 - 30.0) * 0.5).clamp(0.0, 30.0);
    model_preference_penalty + load_penalty + battery_penalty + signal_penalty
}

/// Picks the cheapest routable peer.
///
/// Peers unseen for longer than the staleness bound are evicted from
/// consideration, peers mid-model-swap (`current_load == -1`) are skipped,
/// and a winning score at or above `max_cost` means no peer is acceptable.
pub fn select_peer<'a>(
    peers: &'a [BlePeer],
    now_ms: u64,
    config: &BleConfig,
) -> Option<&'a BlePeer> {
    let mut best: Option<(&BlePeer, f64)> = None;
    for peer in peers {
        if now_ms.saturating_sub(peer.last_seen_ms) > config.peer_stale_ms {
            continue;
        }
        if peer.advertisement.current_load == UNAVAILABLE_LOAD {
            continue;
        }
        let cost = peer_cost(peer);
        debug!(peer = %peer.advertisement.agent_id, cost, "scored ble peer");
        if best.is_none_or(|(_, best_cost)| cost < best_cost) {
            best = Some((peer, cost));
        }
    }

    let (peer, cost) = best?;
    (cost < config.max_cost).then_some(peer)
}

#[cfg(test)]
mod tests {
    use edgecoder_primitives::{AccountId, AgentId, Buf32};

    use super::*;
    use crate::BleAdvertisement;

    fn peer(
        id: &str,
        param_size: f64,
        load: i32,
        battery: u8,
        device: DeviceType,
        rssi: i32,
        last_seen: u64,
    ) -> BlePeer {
        BlePeer {
            advertisement: BleAdvertisement {
                agent_id: AgentId::new(id),
                mesh_token_hash: Buf32::zero(),
                account_id: AccountId::new(format!("acct-{id}")),
                model: "qwen:7b".into(),
                model_param_size: param_size,
                memory_mb: 16_384,
                battery_pct: battery,
                current_load: load,
                device_type: device,
            },
            rssi,
            last_seen_ms: last_seen,
        }
    }

    fn config() -> BleConfig {
        BleConfig::default()
    }

    #[test]
    fn laptop_with_big_model_beats_phone_with_small() {
        // scenario: phone with 1.5B model routes to an idle 7B laptop
        let peers = vec![
            peer("phone", 1.5, 0, 90, DeviceType::Phone, -40, 1_000),
            peer("laptop", 7.0, 0, 100, DeviceType::Laptop, -40, 1_000),
        ];
        let chosen = select_peer(&peers, 1_000, &config()).unwrap();
        assert_eq!(chosen.advertisement.agent_id, AgentId::new("laptop"));
    }

    #[test]
    fn swapping_peers_are_skipped() {
        let peers = vec![
            peer("swapping", 7.0, UNAVAILABLE_LOAD, 100, DeviceType::Laptop, -40, 1_000),
            peer("ready", 3.0, 1, 100, DeviceType::Laptop, -40, 1_000),
        ];
        let chosen = select_peer(&peers, 1_000, &config()).unwrap();
        assert_eq!(chosen.advertisement.agent_id, AgentId::new("ready"));
    }

    #[test]
    fn stale_peers_are_evicted() {
        let peers = vec![peer("old", 7.0, 0, 100, DeviceType::Laptop, -40, 1_000)];
        // 61 s after last sighting
        assert!(select_peer(&peers, 62_000, &config()).is_none());
    }

    #[test]
    fn all_expensive_peers_means_no_route() {
        // tiny model, fully loaded phone on a weak signal scores over 200
        let peers = vec![peer("weak", 0.5, 7, 10, DeviceType::Phone, -95, 1_000)];
        assert!(select_peer(&peers, 1_000, &config()).is_none());
    }

    #[test]
    fn battery_penalty_applies_to_phones_only() {
        let drained_phone = peer("phone", 7.0, 0, 20, DeviceType::Phone, -40, 1_000);
        let drained_laptop = peer("laptop", 7.0, 0, 20, DeviceType::Laptop, -40, 1_000);
        let peers = vec![drained_phone, drained_laptop];
        let chosen = select_peer(&peers, 1_000, &config()).unwrap();
        assert_eq!(chosen.advertisement.agent_id, AgentId::new("laptop"));
    }

    #[test]
    fn signal_penalty_clamps() {
        // rssi -100 → raw penalty 35, clamped to 30; still routable
        let peers = vec![peer("far", 7.0, 0, 100, DeviceType::Workstation, -100, 1_000)];
        assert!(select_peer(&peers, 1_000, &config()).is_some());
    }
}
