//! The offline mesh manager.
//!
//! Watches heartbeat outcomes: three consecutive failures flip the node
//! offline (advertise + scan + route over BLE); the next success flips it
//! back and surfaces the offline ledger for flushing.

use std::sync::Arc;

use edgecoder_config::BleConfig;
use edgecoder_mesh_types::{CreditReason, CreditTransaction, SignedBid, TaskResultStatus, TaskSpec};
use edgecoder_primitives::{now_millis, AccountId, AgentId, TxId};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::{
    select_peer, BleAdvertisement, BleError, BlePort, BleTaskRequest, BleTaskResponse,
    OfflineLedger,
};

/// Whether the node currently has an internet path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Online,
    Offline,
}

/// Drives BLE scanning/advertising from connectivity transitions and
/// routes tasks over the local mesh while offline.
pub struct BleMeshManager<P> {
    port: Arc<P>,
    config: BleConfig,
    agent_id: AgentId,
    account_id: AccountId,
    advertisement: Mutex<BleAdvertisement>,
    state: Mutex<ConnectivityState>,
    missed_heartbeats: Mutex<u32>,
    ledger: Arc<OfflineLedger>,
}

impl<P> std::fmt::Debug for BleMeshManager<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleMeshManager")
            .field("agent_id", &self.agent_id)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl<P: BlePort> BleMeshManager<P> {
    pub fn new(port: Arc<P>, config: BleConfig, advertisement: BleAdvertisement) -> Self {
        Self {
            port,
            config,
            agent_id: advertisement.agent_id.clone(),
            account_id: advertisement.account_id.clone(),
            advertisement: Mutex::new(advertisement),
            state: Mutex::new(ConnectivityState::Online),
            missed_heartbeats: Mutex::new(0),
            ledger: Arc::new(OfflineLedger::new()),
        }
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.lock()
    }

    pub fn ledger(&self) -> &Arc<OfflineLedger> {
        &self.ledger
    }

    /// Records a failed heartbeat. After the configured consecutive
    /// failures the node goes offline and the radio comes up. Returns
    /// `true` on the transition.
    pub async fn heartbeat_failed(&self) -> Result<bool, BleError> {
        let missed = {
            let mut missed = self.missed_heartbeats.lock();
            *missed += 1;
            *missed
        };
        if missed < self.config.offline_after_missed_heartbeats
            || self.state() == ConnectivityState::Offline
        {
            return Ok(false);
        }

        info!(missed, "entering offline mode");
        *self.state.lock() = ConnectivityState::Offline;
        let advertisement = self.advertisement.lock().clone();
        self.port.start_advertising(advertisement).await?;
        self.port.start_scanning().await?;
        Ok(true)
    }

    /// Records a successful heartbeat. Returning online stops scanning and
    /// hands back the pending offline batch for the caller to sync; call
    /// [`Self::mark_synced`] with the accepted ids afterwards.
    pub async fn heartbeat_succeeded(
        &self,
    ) -> Result<Option<Vec<CreditTransaction>>, BleError> {
        *self.missed_heartbeats.lock() = 0;
        if self.state() == ConnectivityState::Online {
            return Ok(None);
        }

        info!("back online, flushing offline ledger");
        *self.state.lock() = ConnectivityState::Online;
        self.port.stop_scanning().await?;
        Ok(Some(self.ledger.export_batch()))
    }

    pub fn mark_synced<'a>(&self, tx_ids: impl IntoIterator<Item = &'a TxId>) {
        self.ledger.mark_synced(tx_ids);
    }

    /// Pushes updated capability fields (load, battery) to the radio.
    pub async fn update_advertisement(&self, update: BleAdvertisement) -> Result<(), BleError> {
        *self.advertisement.lock() = update.clone();
        self.port.update_advertisement(update).await
    }

    /// Routes a task to the cheapest discovered peer and records the
    /// settlement in the offline ledger. The requester side records the
    /// transaction under `task_payment`.
    pub async fn dispatch_task(
        &self,
        task: TaskSpec,
        bid: Option<SignedBid>,
    ) -> Result<BleTaskResponse, BleError> {
        let peers = self.port.discovered_peers().await?;
        let peer = select_peer(&peers, now_millis(), &self.config)
            .ok_or(BleError::NoPeerAvailable)?;
        let peer_id = peer.advertisement.agent_id.clone();

        let response = self
            .port
            .send_task_request(
                &peer_id,
                BleTaskRequest {
                    task,
                    requester: self.agent_id.clone(),
                    requester_account: self.account_id.clone(),
                    bid,
                },
            )
            .await?;

        match &response.transaction {
            Some(tx) => {
                let mut recorded = tx.clone();
                recorded.reason = CreditReason::TaskPayment;
                if response.status == TaskResultStatus::Failed && recorded.credits != 0.0 {
                    warn!(tx_id = %recorded.tx_id, "failed task with non-zero credits; zeroing");
                    recorded.credits = 0.0;
                }
                self.ledger.record(recorded);
            }
            None => {
                warn!(task = %response.task_id, provider = %peer_id, "response carried no settlement");
            }
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use edgecoder_crypto::IdentityKey;
    use edgecoder_mesh_types::ProjectMeta;
    use edgecoder_primitives::{sha256, TaskId};

    use super::*;
    use crate::{DeviceType, LoopbackPort, MockBlePort, TaskRequestHandler};

    fn advertisement(id: &str, param_size: f64, device: DeviceType, battery: u8) -> BleAdvertisement {
        BleAdvertisement {
            agent_id: AgentId::new(id),
            mesh_token_hash: sha256(b"token"),
            account_id: AccountId::new(format!("acct-{id}")),
            model: if param_size >= 7.0 { "qwen:7b" } else { "qwen:1.5b" }.into(),
            model_param_size: param_size,
            memory_mb: 16_384,
            battery_pct: battery,
            current_load: 0,
            device_type: device,
        }
    }

    fn task(id: &str) -> TaskSpec {
        TaskSpec {
            task_id: TaskId::new(id),
            kind: "code".into(),
            language: "python".into(),
            input: "print(1)".into(),
            timeout_ms: 60_000,
            snapshot_ref: None,
            project: ProjectMeta::default(),
            required_model_size: 1.5,
            requester_account: Some(AccountId::new("acct-a")),
        }
    }

    /// Provider that completes every task in 3.2 cpu-seconds and assembles
    /// the dual-signed settlement.
    struct CompletingProvider {
        identity: IdentityKey,
        agent_id: AgentId,
        account_id: AccountId,
        credits_per_task: f64,
    }

    #[async_trait]
    impl TaskRequestHandler for CompletingProvider {
        async fn handle(&self, request: BleTaskRequest) -> BleTaskResponse {
            let bid = request.bid.expect("test requests carry bids");
            let tx_id = TxId::generate();
            let provider_signature = self.identity.sign(&CreditTransaction::provider_signing_bytes(
                &tx_id,
                &bid.task_hash,
                self.credits_per_task,
                3.2,
                &self.account_id,
            ));
            let transaction = CreditTransaction {
                tx_id: tx_id.clone(),
                requester_id: request.requester.clone(),
                provider_id: self.agent_id.clone(),
                requester_account: request.requester_account.clone(),
                provider_account: self.account_id.clone(),
                credits: self.credits_per_task,
                cpu_seconds: 3.2,
                task_hash: bid.task_hash,
                timestamp: bid.timestamp,
                reason: CreditReason::TaskExecution,
                requester_signature: bid.signature,
                provider_signature,
            };
            BleTaskResponse {
                task_id: request.task.task_id,
                status: TaskResultStatus::Completed,
                output: "1".into(),
                cpu_seconds: 3.2,
                provider: self.agent_id.clone(),
                provider_account: self.account_id.clone(),
                transaction: Some(transaction),
            }
        }
    }

    async fn offline_manager<P: BlePort>(
        port: Arc<P>,
        ad: BleAdvertisement,
    ) -> BleMeshManager<P> {
        let manager = BleMeshManager::new(port, BleConfig::default(), ad);
        for _ in 0..3 {
            manager.heartbeat_failed().await.unwrap();
        }
        assert_eq!(manager.state(), ConnectivityState::Offline);
        manager
    }

    #[tokio::test]
    async fn offline_after_three_missed_heartbeats() {
        let bus = LoopbackPort::new_bus();
        let port = Arc::new(LoopbackPort::attach(bus, AgentId::new("a")));
        let manager = BleMeshManager::new(
            port,
            BleConfig::default(),
            advertisement("a", 1.5, DeviceType::Phone, 90),
        );

        assert!(!manager.heartbeat_failed().await.unwrap());
        assert!(!manager.heartbeat_failed().await.unwrap());
        assert_eq!(manager.state(), ConnectivityState::Online);
        assert!(manager.heartbeat_failed().await.unwrap());
        assert_eq!(manager.state(), ConnectivityState::Offline);
    }

    #[tokio::test]
    async fn offline_dispatch_records_payment_and_flush_is_idempotent() {
        // scenario: phone A offline, laptop B discovered, task t3 routed,
        // 3.2 cpu-seconds on a 7B model at base rate 1.0
        let bus = LoopbackPort::new_bus();
        let port_a = Arc::new(LoopbackPort::attach(bus.clone(), AgentId::new("a")));
        let port_b = Arc::new(LoopbackPort::attach(bus, AgentId::new("b")));

        let provider_key = IdentityKey::generate();
        port_b.on_task_request(Arc::new(CompletingProvider {
            identity: provider_key,
            agent_id: AgentId::new("b"),
            account_id: AccountId::new("acct-b"),
            credits_per_task: 3.2,
        }));
        port_b
            .start_advertising(advertisement("b", 7.0, DeviceType::Laptop, 100))
            .await
            .unwrap();

        let manager =
            offline_manager(port_a, advertisement("a", 1.5, DeviceType::Phone, 90)).await;

        let requester_key = IdentityKey::generate();
        let spec = task("t3");
        let bid = SignedBid::create(
            &requester_key,
            spec.input_hash(),
            now_millis(),
            AccountId::new("acct-a"),
        );

        let response = manager.dispatch_task(spec, Some(bid)).await.unwrap();
        assert_eq!(response.status, TaskResultStatus::Completed);
        assert_eq!(response.provider, AgentId::new("b"));

        let pending = manager.ledger().pending();
        assert_eq!(pending.len(), 1);
        assert!((pending[0].credits - 3.2).abs() < 1e-9);
        assert_eq!(pending[0].reason, CreditReason::TaskPayment);

        // reconnect: the batch surfaces once, then marks synced
        let batch = manager.heartbeat_succeeded().await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        manager.mark_synced(batch.iter().map(|tx| &tx.tx_id));
        assert_eq!(manager.ledger().pending_count(), 0);

        // a second successful heartbeat flushes nothing
        assert!(manager.heartbeat_succeeded().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dispatch_without_peers_fails() {
        let bus = LoopbackPort::new_bus();
        let port = Arc::new(LoopbackPort::attach(bus, AgentId::new("a")));
        let manager =
            offline_manager(port, advertisement("a", 1.5, DeviceType::Phone, 90)).await;

        let err = manager.dispatch_task(task("t1"), None).await;
        assert!(matches!(err, Err(BleError::NoPeerAvailable)));
    }

    #[tokio::test]
    async fn radio_failures_surface_from_dispatch() {
        let mut port = MockBlePort::new();
        port.expect_start_advertising().returning(|_| Ok(()));
        port.expect_start_scanning().returning(|| Ok(()));
        port.expect_discovered_peers()
            .returning(|| Err(BleError::Port("radio unavailable".into())));

        let manager = offline_manager(
            Arc::new(port),
            advertisement("a", 1.5, DeviceType::Phone, 90),
        )
        .await;

        let err = manager.dispatch_task(task("t1"), None).await;
        assert!(matches!(err, Err(BleError::Port(_))));
    }
}
