//! The platform radio boundary.

use async_trait::async_trait;
use edgecoder_mesh_types::{CreditTransaction, SignedBid, TaskResultStatus, TaskSpec};
use edgecoder_primitives::{AccountId, AgentId, Buf32, TaskId};
use serde::{Deserialize, Serialize};

use crate::BleError;

/// Load sentinel meaning "unavailable, model swap in progress".
pub const UNAVAILABLE_LOAD: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Phone,
    Laptop,
    Workstation,
}

/// What a node advertises over GATT.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BleAdvertisement {
    pub agent_id: AgentId,
    /// SHA-256 of the mesh token, proving membership without leaking it.
    pub mesh_token_hash: Buf32,
    pub account_id: AccountId,
    pub model: String,
    pub model_param_size: f64,
    pub memory_mb: u64,
    pub battery_pct: u8,
    /// [`UNAVAILABLE_LOAD`] while a model swap is in progress.
    pub current_load: i32,
    pub device_type: DeviceType,
}

/// A discovered peer: its advertisement plus radio observations.
#[derive(Debug, Clone, PartialEq)]
pub struct BlePeer {
    pub advertisement: BleAdvertisement,
    pub rssi: i32,
    pub last_seen_ms: u64,
}

/// A task dispatched over the local mesh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BleTaskRequest {
    pub task: TaskSpec,
    pub requester: AgentId,
    pub requester_account: AccountId,
    /// Pre-signed payment commitment, so the provider can assemble a
    /// dual-signed transaction without a round trip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid: Option<SignedBid>,
}

/// The provider's reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BleTaskResponse {
    pub task_id: TaskId,
    pub status: TaskResultStatus,
    pub output: String,
    pub cpu_seconds: f64,
    pub provider: AgentId,
    pub provider_account: AccountId,
    /// Dual-signed settlement assembled by the provider; zero credits on
    /// failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<CreditTransaction>,
}

/// Serves inbound task requests on the provider side.
#[async_trait]
pub trait TaskRequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: BleTaskRequest) -> BleTaskResponse;
}

/// Platform GATT implementation boundary: one service, characteristics for
/// identity, capabilities, task request/response, and ledger sync. Payloads
/// above the MTU are chunked by the implementation using
/// [`crate::encode_chunks`]/[`crate::Reassembler`].
#[cfg_attr(any(test, feature = "test-utils"), mockall::automock)]
#[async_trait]
pub trait BlePort: Send + Sync + 'static {
    async fn start_advertising(&self, ad: BleAdvertisement) -> Result<(), BleError>;
    async fn stop_advertising(&self) -> Result<(), BleError>;
    async fn update_advertisement(&self, ad: BleAdvertisement) -> Result<(), BleError>;
    async fn start_scanning(&self) -> Result<(), BleError>;
    async fn stop_scanning(&self) -> Result<(), BleError>;
    /// Peers seen since scanning started, newest observations included.
    async fn discovered_peers(&self) -> Result<Vec<BlePeer>, BleError>;
    /// Sends a task request to a specific peer and awaits its response.
    async fn send_task_request(
        &self,
        peer: &AgentId,
        request: BleTaskRequest,
    ) -> Result<BleTaskResponse, BleError>;
    /// Registers the handler invoked for requests arriving from peers.
    fn on_task_request(&self, handler: std::sync::Arc<dyn TaskRequestHandler>);
}
