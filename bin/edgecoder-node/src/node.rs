//! Node composition and runtime wiring.
//!
//! A node is an optional coordinator, an optional local worker, and the
//! inference facade, selected by the runtime mode. All cross-component
//! communication runs through channels or the loopback RPC endpoint; the
//! worker never touches coordinator internals.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use edgecoder_ble::{BleAdvertisement, BleMeshManager, BlePort, DeviceType, LoopbackPort};
use edgecoder_config::{ConfigError, NodeConfig};
use edgecoder_coordinator::{Coordinator, MeshReaction, ModelBackend, Worker};
use edgecoder_crypto::{IdentityKey, KeySeed};
use edgecoder_db::{MemoryStore, PersistentStore, SledStore};
use edgecoder_gossip::{GossipMesh, MeshEvent};
use edgecoder_ledger::{AnchorAdapter, CreditEngine, NullAnchor, OrderingLog};
use edgecoder_mesh_types::{
    AgentCapability, AgentMode, ClientType, MeshPayload, PeerInfo, PowerTelemetry, ResourceClass,
};
use edgecoder_primitives::{sha256, AccountId, AgentId, CoordinatorId};
use edgecoder_rpc_api::EdgeCoordinatorApiClient;
use edgecoder_rpc_types::{
    BleSyncRequest, HeartbeatRequest, PullRequest, RegisterRequest, ReportRequest,
};
use jsonrpsee_http_client::{HttpClient, HttpClientBuilder};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::{
    adapters::{parse_param_size, HttpAnchorClient, OllamaBackend},
    args::{Args, NodeMode},
    peer_client::RpcPeerClient,
    rpc_server::{start_rpc_server, CoordinatorRpc},
    worker::{BleTaskService, LocalWorker},
};

const DEFAULT_OLLAMA_HOST: &str = "http://127.0.0.1:11434";
const DEFAULT_MODEL: &str = "qwen2.5-coder:1.5b";
const ISSUANCE_TICK_MS: u64 = 60_000;

/// Entry point: resolves config, opens the store, and runs the node until
/// interrupted.
pub(crate) async fn launch(args: Args) -> anyhow::Result<()> {
    let config = args.resolve_config()?;

    let identity = Arc::new(match &config.identity_seed_hex {
        Some(seed_hex) => {
            let mut bytes = [0u8; 32];
            hex::decode_to_slice(seed_hex, &mut bytes)
                .map_err(|_| ConfigError::Invalid("identity_seed_hex is not valid hex".into()))?;
            IdentityKey::from_seed(&KeySeed::new(bytes))
        }
        None => IdentityKey::generate(),
    });
    let node_id = AgentId::new(format!("node-{}", &identity.public_key().to_hex()[..12]));
    info!(node = %node_id, mode = ?args.mode, "starting edgecoder node");

    match config.datadir.clone() {
        Some(path) => {
            let db = sled::open(&path)
                .with_context(|| format!("failed to open data directory `{path}`"))?;
            let store = Arc::new(SledStore::open(&db)?);
            run_node(store, identity, node_id, config, &args).await
        }
        None => {
            let store = Arc::new(MemoryStore::new());
            run_node(store, identity, node_id, config, &args).await
        }
    }
}

async fn run_node<S: PersistentStore + 'static>(
    store: Arc<S>,
    identity: Arc<IdentityKey>,
    node_id: AgentId,
    config: NodeConfig,
    args: &Args,
) -> anyhow::Result<()> {
    if args.mode == NodeMode::Worker {
        let coordinator_url = args.coordinator_url.clone().ok_or_else(|| {
            ConfigError::Invalid("worker mode requires --coordinator-url".into())
        })?;
        return run_worker_only(identity, node_id, config, coordinator_url).await;
    }

    let coordinator_id = CoordinatorId::new(node_id.as_str());
    let rpc_url = format!("http://{}", config.rpc.listen_addr);

    let ordering = Arc::new(OrderingLog::new(
        store.clone(),
        identity.clone(),
        node_id.clone(),
    ));
    // a corrupt chain halts the node before it can serve anything
    let chain_len = ordering
        .audit()
        .await
        .context("ordering chain failed verification; refusing to start")?;
    info!(entries = chain_len, "ordering chain verified");

    let engine = Arc::new(CreditEngine::new(store.clone(), ordering));
    let anchor: Arc<dyn AnchorAdapter> = match &config.anchor_url {
        Some(url) => Arc::new(HttpAnchorClient::new(url.clone())),
        None => Arc::new(NullAnchor),
    };

    let (coordinator, outbound_rx) = Coordinator::new(
        coordinator_id,
        node_id.clone(),
        rpc_url.clone(),
        config.clone(),
        store,
        engine,
        anchor,
    );

    let peer_client = Arc::new(RpcPeerClient::new(config.rpc.mesh_auth_token.clone()));
    let (mesh, events_rx) = GossipMesh::new(
        node_id.clone(),
        rpc_url.clone(),
        identity.clone(),
        config.gossip.clone(),
        peer_client.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(run_event_pump(
        coordinator.clone(),
        mesh.clone(),
        peer_client,
        events_rx,
        shutdown_rx.clone(),
    ));
    tokio::spawn(run_outbound_pump(
        mesh.clone(),
        outbound_rx,
        config.gossip.default_ttl,
        shutdown_rx.clone(),
    ));
    tokio::spawn(coordinator.clone().run_reaper(shutdown_rx.clone()));
    tokio::spawn(mesh.clone().run_peer_refresh(shutdown_rx.clone()));
    tokio::spawn(run_periodic_broadcasts(
        coordinator.clone(),
        mesh.clone(),
        config.clone(),
        shutdown_rx.clone(),
    ));

    let own_info = PeerInfo {
        node_id: node_id.clone(),
        rpc_url: rpc_url.clone(),
    };
    let rpc = CoordinatorRpc::new(
        coordinator.clone(),
        mesh.clone(),
        own_info,
        config.coordinator.default_task_timeout_ms,
    );
    let server_handle = start_rpc_server(
        rpc,
        &config.rpc.listen_addr,
        config.rpc.mesh_auth_token.clone(),
    )
    .await?;

    mesh.bootstrap().await;

    if args.mode == NodeMode::Full {
        spawn_worker_stack(&config, identity, node_id, &rpc_url, shutdown_rx.clone()).await?;
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = server_handle.stop();
    Ok(())
}

/// Worker-only mode: serve a remote coordinator.
async fn run_worker_only(
    identity: Arc<IdentityKey>,
    node_id: AgentId,
    config: NodeConfig,
    coordinator_url: String,
) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_worker_stack(&config, identity, node_id, &coordinator_url, shutdown_rx).await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    let _ = shutdown_tx.send(true);
    Ok(())
}

/// Registers the local worker agent and spawns its pull/execute and
/// heartbeat loops plus the BLE offline manager.
async fn spawn_worker_stack(
    config: &NodeConfig,
    identity: Arc<IdentityKey>,
    node_id: AgentId,
    coordinator_url: &str,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let ollama_host = config
        .model
        .ollama_host
        .clone()
        .unwrap_or_else(|| DEFAULT_OLLAMA_HOST.to_owned());
    let model = config
        .model
        .ollama_model
        .clone()
        .unwrap_or_else(|| DEFAULT_MODEL.to_owned());
    let backend: Arc<dyn ModelBackend> = Arc::new(OllamaBackend::new(ollama_host));

    let mut local_models = vec![model.clone()];
    let mut param_size = parse_param_size(&model).unwrap_or(1.5);
    match backend.list_models().await {
        Ok(models) => {
            for info in models {
                if info.name == model {
                    param_size = info.param_size.unwrap_or(param_size);
                } else {
                    local_models.push(info.name);
                }
            }
        }
        Err(err) => {
            warn!(error = %err, "model backend unreachable at startup; continuing");
        }
    }

    let account_id = AccountId::new(format!("acct-{node_id}"));
    let capability = AgentCapability {
        agent_id: node_id.clone(),
        account_id: account_id.clone(),
        public_key: identity.public_key(),
        os: std::env::consts::OS.to_owned(),
        version: env!("CARGO_PKG_VERSION").to_owned(),
        client_type: ClientType::Headless,
        mode: AgentMode::SwarmOnly,
        resource_classes: vec![ResourceClass::Cpu],
        local_models,
        active_model: Some(model.clone()),
        active_model_param_size: param_size,
        model_swap_in_progress: false,
        max_concurrent_tasks: 2,
        current_load: 0,
        power: PowerTelemetry::default(),
    };

    let client = Arc::new(build_rpc_client(
        coordinator_url,
        config.rpc.mesh_auth_token.as_deref(),
    )?);
    client
        .register(RegisterRequest {
            capability: capability.clone(),
        })
        .await
        .context("worker registration failed")?;
    info!(agent = %node_id, model = %model, "worker registered");

    let worker = Arc::new(LocalWorker::new(
        backend,
        identity.clone(),
        account_id.clone(),
        model.clone(),
        param_size,
        config.pricing.base_rate_per_cpu_second,
    ));

    // offline (BLE) manager over the in-process loopback port; a platform
    // GATT port replaces it on mobile builds
    let bus = LoopbackPort::new_bus();
    let port = Arc::new(LoopbackPort::attach(bus, node_id.clone()));
    port.on_task_request(Arc::new(BleTaskService::new(
        worker.clone(),
        identity,
        node_id.clone(),
        account_id.clone(),
        param_size,
        config.pricing.base_rate_per_cpu_second,
        shutdown.clone(),
    )));
    let ble = Arc::new(BleMeshManager::new(
        port,
        config.ble.clone(),
        BleAdvertisement {
            agent_id: node_id.clone(),
            mesh_token_hash: sha256(
                config.rpc.mesh_auth_token.as_deref().unwrap_or_default(),
            ),
            account_id,
            model,
            model_param_size: param_size,
            memory_mb: 8_192,
            battery_pct: 100,
            current_load: 0,
            device_type: DeviceType::Workstation,
        },
    ));

    tokio::spawn(run_worker_loop(
        client.clone(),
        worker,
        node_id.clone(),
        shutdown.clone(),
    ));
    tokio::spawn(run_heartbeat_loop(
        client,
        ble,
        node_id,
        config.coordinator.heartbeat_interval_ms,
        shutdown,
    ));
    Ok(())
}

fn build_rpc_client(url: &str, token: Option<&str>) -> anyhow::Result<HttpClient> {
    let mut headers = http::HeaderMap::new();
    if let Some(token) = token {
        headers.insert(
            http::header::AUTHORIZATION,
            http::HeaderValue::from_str(&format!("Bearer {token}"))
                .context("mesh token is not a valid header value")?,
        );
    }
    HttpClientBuilder::default()
        .set_headers(headers)
        .build(url)
        .context("failed to build coordinator rpc client")
}

/// Pulls claimed tasks from the coordinator and executes them.
async fn run_worker_loop(
    client: Arc<HttpClient>,
    worker: Arc<LocalWorker>,
    agent_id: AgentId,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(2_000));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => return,
        }

        let pulled = match client
            .pull(PullRequest {
                agent_id: agent_id.clone(),
                max: 1,
            })
            .await
        {
            Ok(response) => response.tasks,
            Err(err) => {
                debug!(error = %err, "pull failed");
                continue;
            }
        };

        for task in pulled {
            let task_id = task.task_id.clone();
            let report = match worker.execute(task, shutdown.clone()).await {
                Ok(output) => ReportRequest {
                    task_id,
                    agent_id: agent_id.clone(),
                    output: output.output,
                    cpu_seconds: output.cpu_seconds,
                    tx_id: output.tx_id,
                    signature: output.signature,
                    failed: false,
                    error: None,
                },
                Err(err) => ReportRequest {
                    task_id,
                    agent_id: agent_id.clone(),
                    output: String::new(),
                    cpu_seconds: 0.0,
                    tx_id: edgecoder_primitives::TxId::generate(),
                    signature: edgecoder_primitives::Buf64::zero(),
                    failed: true,
                    error: Some(err.to_string()),
                },
            };
            if let Err(err) = client.report(report).await {
                warn!(error = %err, "result report failed");
            }
        }
    }
}

/// Heartbeats the coordinator; failures feed the BLE offline trigger and
/// recoveries flush the offline ledger.
async fn run_heartbeat_loop(
    client: Arc<HttpClient>,
    ble: Arc<BleMeshManager<LoopbackPort>>,
    agent_id: AgentId,
    interval_ms: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => return,
        }

        let heartbeat = client
            .heartbeat(HeartbeatRequest {
                agent_id: agent_id.clone(),
                power: Some(PowerTelemetry::default()),
                active_model: None,
                active_model_param_size: None,
                model_swap_in_progress: None,
                current_load: None,
                connected_peers: None,
            })
            .await;

        match heartbeat {
            Ok(_) => match ble.heartbeat_succeeded().await {
                Ok(Some(batch)) if !batch.is_empty() => {
                    match client
                        .credits_ble_sync(BleSyncRequest {
                            transactions: batch,
                        })
                        .await
                    {
                        Ok(response) => {
                            info!(
                                applied = response.applied.len(),
                                skipped = response.skipped.len(),
                                "offline ledger flushed"
                            );
                            ble.mark_synced(response.applied.iter().chain(&response.skipped));
                        }
                        Err(err) => warn!(error = %err, "offline ledger flush failed"),
                    }
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "ble transition failed"),
            },
            Err(err) => {
                debug!(error = %err, "heartbeat failed");
                if let Ok(true) = ble.heartbeat_failed().await {
                    warn!("connectivity lost; ble mesh active");
                }
            }
        }
    }
}

/// Routes fresh mesh events into the coordinator and performs any fetches
/// it requests.
async fn run_event_pump<S: PersistentStore + 'static>(
    coordinator: Arc<Coordinator<S>>,
    mesh: Arc<GossipMesh<RpcPeerClient>>,
    peer_client: Arc<RpcPeerClient>,
    mut events_rx: mpsc::UnboundedReceiver<MeshEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            event = events_rx.recv() => match event {
                Some(event) => event,
                None => return,
            },
            _ = shutdown.changed() => return,
        };

        let reaction = match coordinator
            .handle_mesh_event(
                event.sender,
                event.sender_key,
                event.payload,
                event.received_at_ms,
            )
            .await
        {
            Ok(reaction) => reaction,
            Err(err) => {
                warn!(error = %err, "mesh event handling failed");
                continue;
            }
        };

        match reaction {
            MeshReaction::None => {}
            MeshReaction::FetchLedgerRange {
                sender, from, to, ..
            } => {
                let Some(peer) = mesh.peers().get(&sender) else {
                    continue;
                };
                match peer_client.ledger_range(&peer.rpc_url, from, to).await {
                    Ok(entries) => {
                        if let Err(err) = coordinator.extend_chain(entries).await {
                            warn!(error = %err, "chain extension failed");
                        }
                    }
                    Err(err) => warn!(error = %err, "ledger range fetch failed"),
                }
            }
            MeshReaction::FetchForFork { sender, from, .. } => {
                let Some(peer) = mesh.peers().get(&sender) else {
                    continue;
                };
                match peer_client
                    .ledger_range(&peer.rpc_url, from, u64::MAX)
                    .await
                {
                    Ok(entries) => {
                        if let Err(err) = coordinator.resolve_fork(entries).await {
                            warn!(error = %err, "fork resolution failed; awaiting quorum");
                        }
                    }
                    Err(err) => warn!(error = %err, "fork range fetch failed"),
                }
            }
        }
    }
}

/// Forwards coordinator-origin payloads into the gossip mesh.
async fn run_outbound_pump(
    mesh: Arc<GossipMesh<RpcPeerClient>>,
    mut outbound_rx: mpsc::UnboundedReceiver<MeshPayload>,
    default_ttl: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let payload = tokio::select! {
            payload = outbound_rx.recv() => match payload {
                Some(payload) => payload,
                None => return,
            },
            _ = shutdown.changed() => return,
        };
        if let Err(err) = mesh.broadcast(payload, default_ttl) {
            warn!(error = %err, "broadcast failed");
        }
    }
}

/// Periodic capability, snapshot, pricing, and issuance work.
async fn run_periodic_broadcasts<S: PersistentStore + 'static>(
    coordinator: Arc<Coordinator<S>>,
    mesh: Arc<GossipMesh<RpcPeerClient>>,
    config: NodeConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut capability_ticker =
        tokio::time::interval(Duration::from_millis(config.gossip.capability_interval_ms));
    let mut snapshot_ticker =
        tokio::time::interval(Duration::from_millis(config.ledger.snapshot_interval_ms));
    let mut pricing_ticker = tokio::time::interval(Duration::from_millis(
        (config.pricing.proposal_window_ms / 2).max(1_000),
    ));
    let mut issuance_ticker = tokio::time::interval(Duration::from_millis(ISSUANCE_TICK_MS));

    loop {
        tokio::select! {
            _ = capability_ticker.tick() => {
                let payload = coordinator.capability_summary();
                if let Err(err) = mesh.broadcast(payload, config.gossip.default_ttl) {
                    warn!(error = %err, "capability broadcast failed");
                }
                let _ = mesh.broadcast(coordinator.queue_summary(), config.gossip.default_ttl);
            }
            _ = snapshot_ticker.tick() => {
                match coordinator.ordering_snapshot().await {
                    Ok(Some(payload)) => {
                        if let Err(err) = mesh.broadcast(payload, config.gossip.default_ttl) {
                            warn!(error = %err, "snapshot broadcast failed");
                        }
                    }
                    Ok(None) => {}
                    Err(err) => error!(error = %err, "snapshot build failed"),
                }
            }
            _ = pricing_ticker.tick() => {
                coordinator.pricing_tick();
            }
            _ = issuance_ticker.tick() => {
                if let Err(err) = coordinator.issuance_tick().await {
                    error!(error = %err, "issuance tick failed");
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}
