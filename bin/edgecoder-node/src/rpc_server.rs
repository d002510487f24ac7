//! The coordinator RPC server.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use edgecoder_coordinator::{
    Coordinator, CoordinatorError, EnqueueDisposition, ResultReport,
};
use edgecoder_db::PersistentStore;
use edgecoder_gossip::GossipMesh;
use edgecoder_mesh_types::{MeshEnvelope, MeshPayload, PeerInfo};
use edgecoder_primitives::TaskId;
use edgecoder_rpc_api::EdgeCoordinatorApiServer;
use edgecoder_rpc_types::{
    BleSyncRequest, BleSyncResponse, CapacityResponse, EnqueueRequest, EnqueueResponse,
    FederatedCoordinator, HeartbeatRequest, LedgerRangeResponse, MeshCapabilitiesResponse,
    MeshIngestResponse, MeshPeersResponse, OkResponse, PullRequest, PullResponse,
    RegisterRequest, RegisterResponse, ReportRequest, StatusResponse,
};
use jsonrpsee::{
    core::{async_trait, RpcResult},
    server::{ServerBuilder, ServerHandle},
    types::ErrorObjectOwned,
};
use tracing::{info, warn};

use crate::{auth::MeshAuthLayer, peer_client::RpcPeerClient};

const VALIDATION_CODE: i32 = -32001;
const AUTH_CODE: i32 = -32002;
const NOT_FOUND_CODE: i32 = -32004;
const CONFLICT_CODE: i32 = -32009;
const INTERNAL_CODE: i32 = -32099;

fn to_rpc_error(err: CoordinatorError) -> ErrorObjectOwned {
    let code = match &err {
        CoordinatorError::UnknownAgent(_) | CoordinatorError::UnknownTask(_) => NOT_FOUND_CODE,
        CoordinatorError::NotClaimer { .. } | CoordinatorError::InvalidTransition { .. } => {
            CONFLICT_CODE
        }
        CoordinatorError::BadSignature => VALIDATION_CODE,
        CoordinatorError::Db(_) | CoordinatorError::Ledger(_) => INTERNAL_CODE,
    };
    ErrorObjectOwned::owned(code, err.to_string(), None::<()>)
}

/// RPC facade over the coordinator and gossip mesh.
pub(crate) struct CoordinatorRpc<S> {
    coordinator: Arc<Coordinator<S>>,
    mesh: Arc<GossipMesh<RpcPeerClient>>,
    own_info: PeerInfo,
    default_timeout_ms: u64,
}

impl<S> Clone for CoordinatorRpc<S> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
            mesh: self.mesh.clone(),
            own_info: self.own_info.clone(),
            default_timeout_ms: self.default_timeout_ms,
        }
    }
}

impl<S: PersistentStore + 'static> CoordinatorRpc<S> {
    pub(crate) fn new(
        coordinator: Arc<Coordinator<S>>,
        mesh: Arc<GossipMesh<RpcPeerClient>>,
        own_info: PeerInfo,
        default_timeout_ms: u64,
    ) -> Self {
        Self {
            coordinator,
            mesh,
            own_info,
            default_timeout_ms,
        }
    }
}

#[async_trait]
impl<S: PersistentStore + 'static> EdgeCoordinatorApiServer for CoordinatorRpc<S> {
    async fn register(&self, req: RegisterRequest) -> RpcResult<RegisterResponse> {
        let agent_id = self
            .coordinator
            .register_agent(req.capability)
            .await
            .map_err(to_rpc_error)?;
        Ok(RegisterResponse {
            ok: true,
            agent_id,
        })
    }

    async fn heartbeat(&self, req: HeartbeatRequest) -> RpcResult<OkResponse> {
        self.coordinator
            .heartbeat(
                &req.agent_id,
                edgecoder_coordinator::HeartbeatUpdate {
                    power: req.power,
                    active_model: req.active_model,
                    active_model_param_size: req.active_model_param_size,
                    model_swap_in_progress: req.model_swap_in_progress,
                    current_load: req.current_load,
                    connected_peers: req.connected_peers,
                },
            )
            .map_err(to_rpc_error)?;
        Ok(OkResponse { ok: true })
    }

    async fn enqueue(&self, req: EnqueueRequest) -> RpcResult<EnqueueResponse> {
        let (spec, bid) = req.into_spec(self.default_timeout_ms);
        let (record, disposition) = self
            .coordinator
            .enqueue_task(spec, bid)
            .await
            .map_err(to_rpc_error)?;

        if disposition == EnqueueDisposition::Offer {
            let coordinator = self.coordinator.clone();
            let mesh = self.mesh.clone();
            let task_id = record.spec.task_id.clone();
            tokio::spawn(async move {
                run_offer_flow(coordinator, mesh, task_id).await;
            });
        }

        Ok(EnqueueResponse {
            task_id: record.spec.task_id,
            status: record.status,
        })
    }

    async fn pull(&self, req: PullRequest) -> RpcResult<PullResponse> {
        let claimed = self
            .coordinator
            .pull_tasks(&req.agent_id, req.max)
            .await
            .map_err(to_rpc_error)?;
        Ok(PullResponse {
            tasks: claimed.into_iter().map(|r| r.spec).collect(),
        })
    }

    async fn report(&self, req: ReportRequest) -> RpcResult<OkResponse> {
        self.coordinator
            .report_result(ResultReport {
                task_id: req.task_id,
                reporter: req.agent_id,
                output: req.output,
                cpu_seconds: req.cpu_seconds,
                tx_id: req.tx_id,
                signature: req.signature,
                failed: req.failed,
                error: req.error,
            })
            .await
            .map_err(to_rpc_error)?;
        Ok(OkResponse { ok: true })
    }

    async fn status(&self) -> RpcResult<StatusResponse> {
        let snapshot = self.coordinator.status().await.map_err(to_rpc_error)?;
        Ok(StatusResponse {
            coordinator_id: snapshot.coordinator_id,
            agent_count: snapshot.agent_count,
            queued_tasks: snapshot.queued_tasks,
            claimed_tasks: snapshot.claimed_tasks,
            completed_tasks: snapshot.completed_tasks,
            failed_tasks: snapshot.failed_tasks,
            expired_tasks: snapshot.expired_tasks,
            cpu_price_sats: snapshot.cpu_price_sats,
            gpu_price_sats: snapshot.gpu_price_sats,
            ledger_head: snapshot.ledger_head,
        })
    }

    async fn capacity(&self) -> RpcResult<CapacityResponse> {
        Ok(CapacityResponse {
            agents: self.coordinator.capacity(),
        })
    }

    async fn mesh_ingest(&self, envelope: MeshEnvelope) -> RpcResult<MeshIngestResponse> {
        let accepted = match self.mesh.ingest(envelope) {
            Ok(_) => true,
            Err(reason) => {
                // validation failures are logged and dropped, never errors
                warn!(%reason, "gossip message rejected");
                false
            }
        };

        let known_peers = self
            .mesh
            .peers()
            .list()
            .into_iter()
            .map(|p| PeerInfo {
                node_id: p.node_id,
                rpc_url: p.rpc_url,
            })
            .collect();

        Ok(MeshIngestResponse {
            accepted,
            node: Some(self.own_info.clone()),
            known_peers,
        })
    }

    async fn mesh_peers(&self) -> RpcResult<MeshPeersResponse> {
        Ok(MeshPeersResponse {
            peers: self
                .mesh
                .peers()
                .list()
                .into_iter()
                .map(|p| PeerInfo {
                    node_id: p.node_id,
                    rpc_url: p.rpc_url,
                })
                .collect(),
        })
    }

    async fn mesh_capabilities(
        &self,
        model: Option<String>,
    ) -> RpcResult<MeshCapabilitiesResponse> {
        Ok(MeshCapabilitiesResponse {
            coordinators: self
                .coordinator
                .federated_lookup(model.as_deref())
                .into_iter()
                .map(
                    |(coordinator_id, total_param_capacity, avg_load)| FederatedCoordinator {
                        coordinator_id,
                        total_param_capacity,
                        avg_load,
                    },
                )
                .collect(),
        })
    }

    async fn credits_ble_sync(&self, req: BleSyncRequest) -> RpcResult<BleSyncResponse> {
        let report = self
            .coordinator
            .ble_sync(req.transactions)
            .await
            .map_err(to_rpc_error)?;
        Ok(BleSyncResponse {
            applied: report.applied,
            skipped: report.skipped,
            total: report.total,
        })
    }

    async fn ledger_range(&self, from: u64, to: u64) -> RpcResult<LedgerRangeResponse> {
        Ok(LedgerRangeResponse {
            entries: self
                .coordinator
                .ledger_range(from, to)
                .await
                .map_err(to_rpc_error)?,
        })
    }
}

/// Runs one task offer through the gossip claim race and dispatches the
/// winner.
pub(crate) async fn run_offer_flow<S: PersistentStore + 'static>(
    coordinator: Arc<Coordinator<S>>,
    mesh: Arc<GossipMesh<RpcPeerClient>>,
    task_id: TaskId,
) {
    let payload = match coordinator.prepare_offer(&task_id).await {
        Ok(payload) => payload,
        Err(err) => {
            warn!(task = %task_id, error = %err, "offer preparation failed");
            return;
        }
    };

    let outcome = match mesh.offer_task(payload, task_id.clone()).await {
        Ok(Some(outcome)) => outcome,
        Ok(None) => {
            coordinator.offer_lapsed(&task_id);
            return;
        }
        Err(err) => {
            warn!(task = %task_id, error = %err, "offer broadcast failed");
            coordinator.offer_lapsed(&task_id);
            return;
        }
    };

    let winner = outcome.winner.claimant.clone();
    let forward = match coordinator.award_claim(&task_id, &winner).await {
        Ok(forward) => forward,
        Err(err) => {
            warn!(task = %task_id, error = %err, "claim award failed");
            return;
        }
    };
    info!(task = %task_id, winner = %winner, "claim race resolved");

    let payload = MeshPayload::TaskForward(forward);
    match mesh.peers().get(&winner) {
        Some(peer) => {
            if let Err(err) = mesh.send_to(&peer.rpc_url, payload, 1).await {
                warn!(task = %task_id, error = %err, "winner dispatch failed");
            }
        }
        None => {
            let _ = mesh.broadcast(payload, 3);
        }
    }
}

/// Builds and starts the RPC server with the mesh-token middleware.
pub(crate) async fn start_rpc_server<S: PersistentStore + 'static>(
    rpc: CoordinatorRpc<S>,
    listen_addr: &str,
    mesh_token: Option<String>,
) -> anyhow::Result<ServerHandle> {
    let addr: SocketAddr = listen_addr
        .parse()
        .with_context(|| format!("invalid listen address `{listen_addr}`"))?;

    let middleware = tower::ServiceBuilder::new().layer(MeshAuthLayer::new(mesh_token));
    let server = ServerBuilder::default()
        .set_http_middleware(middleware)
        .build(addr)
        .await
        .context("failed to bind rpc listener")?;

    info!(%addr, "coordinator rpc listening");
    Ok(server.start(rpc.into_rpc()))
}
