//! The coordinator RPC trait.
//!
//! One method per coordinator endpoint. `status` is public; every other
//! method sits behind the mesh-token HTTP middleware installed by the
//! server.

use edgecoder_mesh_types::MeshEnvelope;
use edgecoder_rpc_types::{
    BleSyncRequest, BleSyncResponse, CapacityResponse, EnqueueRequest, EnqueueResponse,
    HeartbeatRequest, LedgerRangeResponse, MeshCapabilitiesResponse, MeshIngestResponse,
    MeshPeersResponse, OkResponse, PullRequest, PullResponse, RegisterRequest, RegisterResponse,
    ReportRequest, StatusResponse,
};
use jsonrpsee::{core::RpcResult, proc_macros::rpc};

#[cfg_attr(not(feature = "client"), rpc(server, namespace = "edge"))]
#[cfg_attr(feature = "client", rpc(server, client, namespace = "edge"))]
pub trait EdgeCoordinatorApi {
    /// Registers an agent (idempotent per agent id).
    #[method(name = "register")]
    async fn register(&self, req: RegisterRequest) -> RpcResult<RegisterResponse>;

    /// Heartbeat with telemetry and model fields.
    #[method(name = "heartbeat")]
    async fn heartbeat(&self, req: HeartbeatRequest) -> RpcResult<OkResponse>;

    /// Submits a task for scheduling.
    #[method(name = "enqueue")]
    async fn enqueue(&self, req: EnqueueRequest) -> RpcResult<EnqueueResponse>;

    /// Worker pulls claimed tasks under the fair-share policy.
    #[method(name = "pull")]
    async fn pull(&self, req: PullRequest) -> RpcResult<PullResponse>;

    /// Reports a task result.
    #[method(name = "report")]
    async fn report(&self, req: ReportRequest) -> RpcResult<OkResponse>;

    /// Coordinator snapshot (public).
    #[method(name = "status")]
    async fn status(&self) -> RpcResult<StatusResponse>;

    /// Per-agent capability summary.
    #[method(name = "capacity")]
    async fn capacity(&self) -> RpcResult<CapacityResponse>;

    /// Receives one gossip envelope.
    #[method(name = "mesh_ingest")]
    async fn mesh_ingest(&self, envelope: MeshEnvelope) -> RpcResult<MeshIngestResponse>;

    /// Lists known peers.
    #[method(name = "mesh_peers")]
    async fn mesh_peers(&self) -> RpcResult<MeshPeersResponse>;

    /// Federated capability lookup.
    #[method(name = "mesh_capabilities")]
    async fn mesh_capabilities(
        &self,
        model: Option<String>,
    ) -> RpcResult<MeshCapabilitiesResponse>;

    /// Ingests an offline transaction batch.
    #[method(name = "credits_ble_sync")]
    async fn credits_ble_sync(&self, req: BleSyncRequest) -> RpcResult<BleSyncResponse>;

    /// Ordering chain range for peer reconciliation.
    #[method(name = "ledger_range")]
    async fn ledger_range(&self, from: u64, to: u64) -> RpcResult<LedgerRangeResponse>;
}
