//! Default values for every tunable.

// Coordinator
pub(crate) const STALE_THRESHOLD_MS: u64 = 120_000;
pub(crate) const REAPER_INTERVAL_MS: u64 = 30_000;
pub(crate) const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub(crate) const MAX_REQUEUES: u32 = 3;
pub(crate) const DEFAULT_TASK_TIMEOUT_MS: u64 = 60_000;

// Gossip
pub(crate) const SKEW_WINDOW_MS: u64 = 60_000;
pub(crate) const REPLAY_WINDOW_MS: u64 = 300_000;
pub(crate) const RATE_LIMIT_MAX: usize = 200;
pub(crate) const RATE_LIMIT_WINDOW_MS: u64 = 10_000;
pub(crate) const DEDUP_CACHE_SIZE: usize = 10_000;
pub(crate) const FANOUT: usize = 8;
pub(crate) const DEFAULT_TTL: u32 = 3;
pub(crate) const CLAIM_DELAY_MS: u64 = 250;
pub(crate) const PEER_REFRESH_INTERVAL_MS: u64 = 45_000;
pub(crate) const MAX_MISSED_PROBES: u32 = 3;
pub(crate) const CAPABILITY_INTERVAL_MS: u64 = 60_000;
pub(crate) const CAPABILITY_STALE_FACTOR: u64 = 5;

// Pricing
pub(crate) const BASE_PRICE_SATS: f64 = 10.0;
pub(crate) const PRICE_ALPHA: f64 = 1.5;
pub(crate) const PRICE_BETA: f64 = 0.5;
pub(crate) const MIN_PRICE_SATS: f64 = 1.0;
pub(crate) const MAX_PRICE_SATS: f64 = 1_000.0;
pub(crate) const PROPOSAL_WINDOW_MS: u64 = 300_000;
pub(crate) const BASE_RATE_PER_CPU_SECOND: f64 = 1.0;

// Ledger
pub(crate) const SNAPSHOT_INTERVAL_MS: u64 = 30_000;
pub(crate) const ISSUANCE_WINDOW_MS: u64 = 86_400_000;
pub(crate) const VOTING_WINDOW_MS: u64 = 600_000;
pub(crate) const DIVERGENCE_LOOKBACK: u64 = 64;

// BLE
pub(crate) const BLE_MTU: usize = 512;
pub(crate) const REASSEMBLY_TIMEOUT_MS: u64 = 5_000;
pub(crate) const BLE_PEER_STALE_MS: u64 = 60_000;
pub(crate) const BLE_MAX_COST: f64 = 200.0;
pub(crate) const OFFLINE_AFTER_MISSED_HEARTBEATS: u32 = 3;

// RPC
pub(crate) const RPC_LISTEN_ADDR: &str = "127.0.0.1:8750";
