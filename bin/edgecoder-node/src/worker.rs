//! The local worker: executes claimed tasks against the model backend and
//! signs the settlement terms.

use std::sync::Arc;

use async_trait::async_trait;
use edgecoder_ble::{BleTaskRequest, BleTaskResponse, TaskRequestHandler};
use edgecoder_coordinator::{ModelBackend, Worker, WorkerOutput};
use edgecoder_crypto::IdentityKey;
use edgecoder_mesh_types::{CreditReason, CreditTransaction, TaskResultStatus, TaskSpec};
use edgecoder_pricing::task_credits;
use edgecoder_primitives::{AccountId, AgentId, TxId};
use tokio::sync::watch;
use tracing::{debug, warn};

pub(crate) struct LocalWorker {
    backend: Arc<dyn ModelBackend>,
    identity: Arc<IdentityKey>,
    account_id: AccountId,
    model: String,
    model_param_size: f64,
    base_rate_per_cpu_second: f64,
}

impl LocalWorker {
    pub(crate) fn new(
        backend: Arc<dyn ModelBackend>,
        identity: Arc<IdentityKey>,
        account_id: AccountId,
        model: String,
        model_param_size: f64,
        base_rate_per_cpu_second: f64,
    ) -> Self {
        Self {
            backend,
            identity,
            account_id,
            model,
            model_param_size,
            base_rate_per_cpu_second,
        }
    }

    fn build_prompt(task: &TaskSpec) -> String {
        format!(
            "You are executing a {} task in {}.\n\n{}",
            task.kind, task.language, task.input
        )
    }
}

#[async_trait]
impl Worker for LocalWorker {
    async fn execute(
        &self,
        task: TaskSpec,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<WorkerOutput, anyhow::Error> {
        let prompt = Self::build_prompt(&task);
        debug!(task = %task.task_id, model = %self.model, "executing task");

        let generation = tokio::select! {
            result = self.backend.generate(&self.model, &prompt) => result?,
            _ = shutdown.changed() => anyhow::bail!("execution cancelled"),
        };

        // sign the settlement terms the coordinator will recompute
        let credits = task_credits(
            generation.cpu_seconds,
            self.base_rate_per_cpu_second,
            self.model_param_size,
        );
        let tx_id = TxId::generate();
        let signature = self.identity.sign(&CreditTransaction::provider_signing_bytes(
            &tx_id,
            &task.input_hash(),
            credits,
            generation.cpu_seconds,
            &self.account_id,
        ));

        Ok(WorkerOutput {
            output: generation.output,
            cpu_seconds: generation.cpu_seconds,
            tx_id,
            signature,
        })
    }
}

/// Serves task requests arriving over the local BLE mesh: executes them
/// with the same worker and assembles the dual-signed settlement from the
/// requester's bid.
pub(crate) struct BleTaskService {
    worker: Arc<LocalWorker>,
    identity: Arc<IdentityKey>,
    agent_id: AgentId,
    account_id: AccountId,
    model_param_size: f64,
    base_rate_per_cpu_second: f64,
    shutdown: watch::Receiver<bool>,
}

impl BleTaskService {
    pub(crate) fn new(
        worker: Arc<LocalWorker>,
        identity: Arc<IdentityKey>,
        agent_id: AgentId,
        account_id: AccountId,
        model_param_size: f64,
        base_rate_per_cpu_second: f64,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            worker,
            identity,
            agent_id,
            account_id,
            model_param_size,
            base_rate_per_cpu_second,
            shutdown,
        }
    }

    /// Builds the provider-signed settlement; zero credits for failures.
    fn settlement(
        &self,
        request: &BleTaskRequest,
        tx_id: TxId,
        credits: f64,
        cpu_seconds: f64,
    ) -> Option<CreditTransaction> {
        let bid = request.bid.as_ref()?;
        let provider_signature = self.identity.sign(&CreditTransaction::provider_signing_bytes(
            &tx_id,
            &bid.task_hash,
            credits,
            cpu_seconds,
            &self.account_id,
        ));
        Some(CreditTransaction {
            tx_id,
            requester_id: request.requester.clone(),
            provider_id: self.agent_id.clone(),
            requester_account: bid.requester_account.clone(),
            provider_account: self.account_id.clone(),
            credits,
            cpu_seconds,
            task_hash: bid.task_hash,
            timestamp: bid.timestamp,
            reason: CreditReason::TaskExecution,
            requester_signature: bid.signature,
            provider_signature,
        })
    }
}

#[async_trait]
impl TaskRequestHandler for BleTaskService {
    async fn handle(&self, request: BleTaskRequest) -> BleTaskResponse {
        let task_id = request.task.task_id.clone();
        match self
            .worker
            .execute(request.task.clone(), self.shutdown.clone())
            .await
        {
            Ok(output) => {
                let credits = task_credits(
                    output.cpu_seconds,
                    self.base_rate_per_cpu_second,
                    self.model_param_size,
                );
                let transaction =
                    self.settlement(&request, output.tx_id, credits, output.cpu_seconds);
                BleTaskResponse {
                    task_id,
                    status: TaskResultStatus::Completed,
                    output: output.output,
                    cpu_seconds: output.cpu_seconds,
                    provider: self.agent_id.clone(),
                    provider_account: self.account_id.clone(),
                    transaction,
                }
            }
            Err(err) => {
                warn!(task = %task_id, error = %err, "ble task execution failed");
                let transaction = self.settlement(&request, TxId::generate(), 0.0, 0.0);
                BleTaskResponse {
                    task_id,
                    status: TaskResultStatus::Failed,
                    output: String::new(),
                    cpu_seconds: 0.0,
                    provider: self.agent_id.clone(),
                    provider_account: self.account_id.clone(),
                    transaction,
                }
            }
        }
    }
}
