//! The coordinator service facade.
//!
//! Composes the registry, queue, credit engine, issuance manager, and
//! pricing state. The node binary routes inbound mesh events into
//! [`Coordinator::handle_mesh_event`] and drains the outbound payload
//! channel into the gossip mesh.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use edgecoder_config::NodeConfig;
use edgecoder_crypto::verify_signature;
use edgecoder_db::{
    AgentRecord, IntentState, OrderingEntry, PaymentIntent, PersistentStore, TaskRecord,
    TaskResult,
};
use edgecoder_ledger::{
    AnchorAdapter, BleSyncReport, CreditEngine, IssuanceManager, IssuanceOutcome, RecordOutcome,
    RemoteHeadStatus,
};
use edgecoder_mesh_types::{
    AgentCapability, CapabilitySummary, CreditReason, CreditTransaction, IssuanceCommit,
    IssuanceCheckpoint, MeshPayload, ModelCapability, OrderingSnapshot, PeerAnnounce, PeerStatus,
    PriceProposal, QueueSummary, ResourceClass, ResultAnnounce, SignedBid, TaskClaim,
    TaskForward, TaskOffer, TaskResultStatus, TaskSpec,
};
use edgecoder_pricing::{
    claim_cost, task_credits, DynamicPricer, FederatedCapabilities, PriceParams, ProposalWindow,
};
use edgecoder_primitives::{
    now_millis, AccountId, AgentId, Buf32, Buf64, CoordinatorId, EpochId, TaskId, TxId,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::{
    queue::MAX_RETRIES_REASON, AgentRegistry, CoordinatorError, HeartbeatUpdate, PullFilter,
    TaskQueue,
};

/// Operator-facing snapshot returned by `status`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusSnapshot {
    pub coordinator_id: CoordinatorId,
    pub agent_count: usize,
    pub queued_tasks: u64,
    pub claimed_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub expired_tasks: u64,
    pub cpu_price_sats: f64,
    pub gpu_price_sats: f64,
    pub ledger_head: Option<(u64, String)>,
}

/// A worker's result submission.
#[derive(Debug, Clone)]
pub struct ResultReport {
    pub task_id: TaskId,
    pub reporter: AgentId,
    pub output: String,
    pub cpu_seconds: f64,
    /// Transaction id minted by the provider for the settlement.
    pub tx_id: TxId,
    /// Provider signature over the settlement bytes.
    pub signature: Buf64,
    pub failed: bool,
    pub error: Option<String>,
}

/// How an accepted task will be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueDisposition {
    /// A live local agent can pull it.
    Local,
    /// Forwarded to a federated coordinator.
    Forwarded,
    /// No local agent or federated target; the caller should offer it to
    /// the mesh via the claim race.
    Offer,
}

/// Follow-up work a mesh event asks the binary to perform (fetches that
/// need a peer RPC client).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshReaction {
    None,
    /// Peer is ahead; fetch `from..=to` of its ordering chain and feed
    /// [`Coordinator::extend_chain`].
    FetchLedgerRange {
        coordinator: CoordinatorId,
        sender: AgentId,
        from: u64,
        to: u64,
    },
    /// Peer diverged; fetch from `from` and feed
    /// [`Coordinator::resolve_fork`].
    FetchForFork {
        coordinator: CoordinatorId,
        sender: AgentId,
        from: u64,
    },
}

/// The unified coordinator.
pub struct Coordinator<S> {
    coordinator_id: CoordinatorId,
    node_id: AgentId,
    rpc_url: String,
    config: NodeConfig,
    registry: AgentRegistry,
    queue: TaskQueue,
    engine: Arc<CreditEngine<S>>,
    store: Arc<S>,
    anchor: Arc<dyn AnchorAdapter>,
    pricer: DynamicPricer,
    issuance: Mutex<IssuanceManager>,
    federation: Mutex<FederatedCapabilities>,
    proposals: Mutex<ProposalWindow>,
    /// Provider earnings accumulated in the current issuance window.
    window_earnings: Mutex<BTreeMap<AccountId, f64>>,
    /// Remote offers we claimed and may yet be awarded; the award arrives
    /// as a `task_forward` carrying the spec.
    pending_remote_offers: Mutex<HashSet<TaskId>>,
    /// Issuance epochs whose commits have been applied to balances.
    applied_epochs: Mutex<HashSet<EpochId>>,
    outbound: mpsc::UnboundedSender<MeshPayload>,
}

impl<S> std::fmt::Debug for Coordinator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("coordinator_id", &self.coordinator_id)
            .field("agents", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl<S: PersistentStore + 'static> Coordinator<S> {
    /// Builds the coordinator and the outbound payload stream the binary
    /// forwards into the gossip mesh.
    pub fn new(
        coordinator_id: CoordinatorId,
        node_id: AgentId,
        rpc_url: String,
        config: NodeConfig,
        store: Arc<S>,
        engine: Arc<CreditEngine<S>>,
        anchor: Arc<dyn AnchorAdapter>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<MeshPayload>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let pricer = DynamicPricer::new(PriceParams {
            base_price_sats: config.pricing.base_price_sats,
            alpha: config.pricing.alpha,
            beta: config.pricing.beta,
            min_price_sats: config.pricing.min_price_sats,
            max_price_sats: config.pricing.max_price_sats,
        });
        let issuance = IssuanceManager::new(
            coordinator_id.clone(),
            config.ledger.issuance_window_ms,
            config.ledger.voting_window_ms,
        );
        let queue = TaskQueue::new(config.coordinator.max_requeues);

        let coordinator = Arc::new(Self {
            coordinator_id,
            node_id,
            rpc_url,
            config,
            registry: AgentRegistry::new(),
            queue,
            engine,
            store,
            anchor,
            pricer,
            issuance: Mutex::new(issuance),
            federation: Mutex::new(FederatedCapabilities::new()),
            proposals: Mutex::new(ProposalWindow::new()),
            window_earnings: Mutex::new(BTreeMap::new()),
            pending_remote_offers: Mutex::new(HashSet::new()),
            applied_epochs: Mutex::new(HashSet::new()),
            outbound,
        });
        (coordinator, outbound_rx)
    }

    pub fn coordinator_id(&self) -> &CoordinatorId {
        &self.coordinator_id
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn engine(&self) -> &Arc<CreditEngine<S>> {
        &self.engine
    }

    // ------------------------------------------------------------------
    // The public contract
    // ------------------------------------------------------------------

    /// Registers (or re-registers) an agent.
    pub async fn register_agent(
        &self,
        capability: AgentCapability,
    ) -> Result<AgentId, CoordinatorError> {
        let now = now_millis();
        let agent_id = self.registry.register(capability, now);
        if let Some(record) = self.registry.get(&agent_id) {
            self.store.put_agent(record).await?;
        }
        Ok(agent_id)
    }

    /// Processes a heartbeat; fails for unregistered agents.
    pub fn heartbeat(
        &self,
        agent_id: &AgentId,
        update: HeartbeatUpdate,
    ) -> Result<(), CoordinatorError> {
        self.registry.heartbeat(agent_id, update, now_millis())
    }

    /// Accepts a task and decides how it will be served: locally, by a
    /// federated coordinator, or by a mesh offer the caller runs.
    pub async fn enqueue_task(
        &self,
        spec: TaskSpec,
        bid: Option<SignedBid>,
    ) -> Result<(TaskRecord, EnqueueDisposition), CoordinatorError> {
        let now = now_millis();
        let record = self.queue.enqueue(spec, now);
        self.store.put_task(record.clone()).await?;

        if let Some(bid) = bid {
            self.store
                .put_intent(PaymentIntent {
                    task_id: record.spec.task_id.clone(),
                    bid,
                    state: IntentState::Pending,
                    created_at_ms: now,
                })
                .await?;
        }

        let disposition = if self.can_serve_locally(&record.spec, now) {
            EnqueueDisposition::Local
        } else if self.try_forward(&record).await? {
            EnqueueDisposition::Forwarded
        } else {
            EnqueueDisposition::Offer
        };
        Ok((record, disposition))
    }

    /// Marks a task as offered and builds the `task_offer` payload for
    /// the claim race.
    pub async fn prepare_offer(
        &self,
        task_id: &TaskId,
    ) -> Result<MeshPayload, CoordinatorError> {
        let record = self
            .queue
            .get(task_id)
            .ok_or_else(|| CoordinatorError::UnknownTask(task_id.clone()))?;
        self.queue.mark_offered(task_id)?;
        let bid = self
            .store
            .get_intent(task_id)
            .await?
            .map(|intent| intent.bid);
        Ok(MeshPayload::TaskOffer(TaskOffer {
            task: record.spec,
            bid,
        }))
    }

    /// Claims up to `max` tasks for a registered agent under the
    /// fair-share policy.
    pub async fn pull_tasks(
        &self,
        agent_id: &AgentId,
        max: usize,
    ) -> Result<Vec<TaskRecord>, CoordinatorError> {
        let record = self
            .registry
            .get(agent_id)
            .ok_or_else(|| CoordinatorError::UnknownAgent(agent_id.clone()))?;

        let filter = PullFilter {
            agent_id: agent_id.clone(),
            resource_classes: record.capability.resource_classes.clone(),
            model_param_size: record.capability.active_model_param_size,
        };
        let claimed = self.queue.pull(&filter, max, now_millis());
        for task in &claimed {
            self.store.put_task(task.clone()).await?;
        }
        Ok(claimed)
    }

    /// Settles a reported result: verifies the reporter holds the claim
    /// and the provider signature, transitions the task, records the
    /// credit transaction, and announces the result to the mesh.
    pub async fn report_result(
        &self,
        report: ResultReport,
    ) -> Result<TaskRecord, CoordinatorError> {
        let now = now_millis();
        let provider = self
            .registry
            .get(&report.reporter)
            .ok_or_else(|| CoordinatorError::UnknownAgent(report.reporter.clone()))?;

        if report.failed {
            let record = self.queue.fail(
                &report.task_id,
                &report.reporter,
                report.error.unwrap_or_else(|| "execution failed".to_owned()),
                now,
            )?;
            self.store.put_task(record.clone()).await?;
            self.store
                .set_intent_state(&report.task_id, IntentState::Voided)
                .await?;
            self.send_payload(MeshPayload::ResultAnnounce(ResultAnnounce {
                task_id: report.task_id.clone(),
                provider: report.reporter.clone(),
                status: TaskResultStatus::Failed,
                cpu_seconds: report.cpu_seconds,
                output: String::new(),
                transaction: None,
            }));
            return Ok(record);
        }

        let task = self
            .queue
            .get(&report.task_id)
            .ok_or_else(|| CoordinatorError::UnknownTask(report.task_id.clone()))?;
        if task.claimed_by.as_ref() != Some(&report.reporter) {
            return Err(CoordinatorError::NotClaimer {
                task: report.task_id.clone(),
                claimer: task
                    .claimed_by
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "nobody".to_owned()),
                reporter: report.reporter.clone(),
            });
        }
        let credits = task_credits(
            report.cpu_seconds,
            self.config.pricing.base_rate_per_cpu_second,
            provider.capability.active_model_param_size,
        );

        let provider_account = provider.capability.account_id.clone();
        let settlement_bytes = CreditTransaction::provider_signing_bytes(
            &report.tx_id,
            &task.spec.input_hash(),
            credits,
            report.cpu_seconds,
            &provider_account,
        );
        verify_signature(
            &provider.capability.public_key,
            &settlement_bytes,
            &report.signature,
        )
        .map_err(|_| CoordinatorError::BadSignature)?;

        let record = self.queue.complete(
            &report.task_id,
            &report.reporter,
            TaskResult {
                output: report.output.clone(),
                cpu_seconds: report.cpu_seconds,
                provider_signature: report.signature,
                error: None,
            },
            now,
        )?;
        self.store.put_task(record.clone()).await?;

        let transaction = self
            .settle_completed_task(&record, &provider, credits, &report)
            .await?;

        self.send_payload(MeshPayload::ResultAnnounce(ResultAnnounce {
            task_id: report.task_id.clone(),
            provider: report.reporter.clone(),
            status: TaskResultStatus::Completed,
            cpu_seconds: report.cpu_seconds,
            output: report.output,
            transaction,
        }));

        self.queue.remove_settled(&report.task_id);
        Ok(record)
    }

    /// Current queue/agent/pricing snapshot.
    pub async fn status(&self) -> Result<StatusSnapshot, CoordinatorError> {
        let counters = self.queue.counters();
        let head = self.engine.ordering().head().await?;
        let cpu = self
            .proposals
            .lock()
            .consensus(ResourceClass::Cpu)
            .unwrap_or(self.config.pricing.base_price_sats);
        let gpu = self
            .proposals
            .lock()
            .consensus(ResourceClass::Gpu)
            .unwrap_or(self.config.pricing.base_price_sats);
        Ok(StatusSnapshot {
            coordinator_id: self.coordinator_id.clone(),
            agent_count: self.registry.len(),
            queued_tasks: counters.queued,
            claimed_tasks: counters.claimed,
            completed_tasks: counters.completed,
            failed_tasks: counters.failed,
            expired_tasks: counters.expired,
            cpu_price_sats: cpu,
            gpu_price_sats: gpu,
            ledger_head: head.map(|(seq, hash)| (seq, hash.to_hex())),
        })
    }

    /// Live per-agent capabilities.
    pub fn capacity(&self) -> Vec<AgentCapability> {
        self.registry
            .live_capabilities(now_millis(), self.config.coordinator.stale_threshold_ms)
    }

    /// Federated lookup used by `mesh_capabilities`.
    pub fn federated_lookup(&self, model: Option<&str>) -> Vec<(CoordinatorId, f64, f64)> {
        self.federation
            .lock()
            .forward_candidates(model, 0.0)
            .into_iter()
            .map(|t| (t.coordinator_id, t.total_param_capacity, t.avg_load))
            .collect()
    }

    /// Ingests an offline (BLE) transaction batch.
    pub async fn ble_sync(
        &self,
        batch: Vec<CreditTransaction>,
    ) -> Result<BleSyncReport, CoordinatorError> {
        let report = self
            .engine
            .sync_offline_batch(batch, |account| self.registry.account_key(account))
            .await?;
        Ok(report)
    }

    /// Ordering entries for peer reconciliation.
    pub async fn ledger_range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<OrderingEntry>, CoordinatorError> {
        Ok(self.engine.ordering().get_range(from, to).await?)
    }

    // ------------------------------------------------------------------
    // Mesh event handling
    // ------------------------------------------------------------------

    /// Consumes one fresh mesh message. Returns any follow-up fetch the
    /// binary must perform.
    pub async fn handle_mesh_event(
        &self,
        sender: AgentId,
        sender_key: Buf32,
        payload: MeshPayload,
        received_at_ms: u64,
    ) -> Result<MeshReaction, CoordinatorError> {
        match payload {
            MeshPayload::CapabilitySummary(summary) => {
                let mut federation = self.federation.lock();
                federation.upsert(summary, received_at_ms);
                let stale_after = self.config.gossip.capability_interval_ms
                    * self.config.gossip.capability_stale_factor;
                federation.purge_stale(received_at_ms.saturating_sub(stale_after));
            }
            MeshPayload::PriceProposal(proposal) => {
                let mut proposals = self.proposals.lock();
                proposals.record(
                    proposal.coordinator_id,
                    proposal.resource_class,
                    proposal.price_per_compute_unit_sats,
                    received_at_ms,
                );
                proposals.expire(received_at_ms, self.config.pricing.proposal_window_ms);
            }
            MeshPayload::TaskOffer(offer) => self.consider_remote_offer(offer),
            MeshPayload::ClaimRejected(rejection) => {
                if rejection.claimant == self.node_id {
                    debug!(task = %rejection.task_id, winner = %rejection.winner, "lost claim race");
                    self.pending_remote_offers.lock().remove(&rejection.task_id);
                }
            }
            MeshPayload::TaskForward(forward) => {
                self.pending_remote_offers.lock().remove(&forward.task.task_id);
                info!(task = %forward.task.task_id, origin = %forward.origin_coordinator, "accepted forwarded task");
                self.enqueue_task(forward.task, forward.bid).await?;
            }
            MeshPayload::ResultAnnounce(result) => {
                self.handle_remote_result(sender, sender_key, result).await?;
            }
            MeshPayload::OrderingSnapshot(snapshot) => {
                return self.handle_ordering_snapshot(sender, snapshot).await;
            }
            MeshPayload::IssuanceProposal(proposal) => {
                let local_view = self.window_earnings.lock().clone();
                let vote = self.issuance.lock().evaluate_proposal(
                    CoordinatorId::new(sender.as_str()),
                    &proposal,
                    &local_view,
                );
                self.send_payload(MeshPayload::IssuanceVote(vote));
            }
            MeshPayload::IssuanceVote(vote) => {
                if vote.proposer == self.coordinator_id {
                    let outcome = self.issuance.lock().record_vote(
                        CoordinatorId::new(sender.as_str()),
                        vote.epoch,
                        vote.approve,
                    );
                    if let IssuanceOutcome::Commit(commit) = outcome {
                        self.commit_issuance(commit).await?;
                    }
                }
            }
            MeshPayload::IssuanceCommit(commit) => {
                let fresh = self.applied_epochs.lock().insert(commit.epoch);
                if fresh {
                    self.engine
                        .apply_issuance(commit.epoch, &commit.earnings)
                        .await?;
                }
            }
            MeshPayload::IssuanceCheckpoint(checkpoint) => {
                debug!(epoch = %checkpoint.epoch, "peer checkpoint observed");
            }
            MeshPayload::PeerAnnounce(_)
            | MeshPayload::QueueSummary(_)
            | MeshPayload::TaskClaim(_)
            | MeshPayload::BlacklistUpdate(_) => {
                // handled inside the gossip layer
            }
        }
        Ok(MeshReaction::None)
    }

    /// Claims a remotely offered task when the local worker can serve it.
    fn consider_remote_offer(&self, offer: TaskOffer) {
        let Some(own) = self.registry.get(&self.node_id) else {
            return;
        };
        let cap = &own.capability;
        let eligible = cap.has_capacity()
            && cap.serves_class(offer.task.project.resource_class)
            && cap.active_model_param_size >= offer.task.required_model_size;
        if !eligible {
            return;
        }

        let cost = claim_cost(cap.active_model_param_size, cap.current_load);
        self.pending_remote_offers
            .lock()
            .insert(offer.task.task_id.clone());
        self.send_payload(MeshPayload::TaskClaim(TaskClaim {
            task_id: offer.task.task_id,
            claimant: self.node_id.clone(),
            cost,
        }));
    }

    /// Applies a result announced for a task we hold (claimed remotely).
    async fn handle_remote_result(
        &self,
        sender: AgentId,
        sender_key: Buf32,
        result: ResultAnnounce,
    ) -> Result<(), CoordinatorError> {
        let Some(task) = self.queue.get(&result.task_id) else {
            return Ok(());
        };
        if task.claimed_by.as_ref() != Some(&result.provider) || sender != result.provider {
            return Ok(());
        }
        let now = now_millis();

        match result.status {
            TaskResultStatus::Failed => {
                let record = self.queue.fail(
                    &result.task_id,
                    &result.provider,
                    "remote execution failed".to_owned(),
                    now,
                )?;
                self.store.put_task(record).await?;
            }
            TaskResultStatus::Completed => {
                let provider_signature = result
                    .transaction
                    .as_ref()
                    .map(|tx| tx.provider_signature)
                    .unwrap_or(Buf64::zero());
                let record = self.queue.complete(
                    &result.task_id,
                    &result.provider,
                    TaskResult {
                        output: result.output,
                        cpu_seconds: result.cpu_seconds,
                        provider_signature,
                        error: None,
                    },
                    now,
                )?;
                self.store.put_task(record).await?;

                if let Some(tx) = result.transaction {
                    let requester_key = self.registry.account_key(&tx.requester_account);
                    match requester_key {
                        Some(requester_key) => {
                            match self
                                .engine
                                .record_transaction(tx, &requester_key, &sender_key)
                                .await
                            {
                                Ok(RecordOutcome::Applied(_)) => {
                                    self.store
                                        .set_intent_state(&result.task_id, IntentState::Settled)
                                        .await?;
                                }
                                Ok(RecordOutcome::Duplicate) => {}
                                Err(err) => {
                                    warn!(task = %result.task_id, error = %err, "remote settlement rejected");
                                }
                            }
                        }
                        None => {
                            warn!(task = %result.task_id, "remote settlement with unknown requester");
                        }
                    }
                }
                self.queue.remove_settled(&result.task_id);
            }
        }
        Ok(())
    }

    async fn handle_ordering_snapshot(
        &self,
        sender: AgentId,
        snapshot: OrderingSnapshot,
    ) -> Result<MeshReaction, CoordinatorError> {
        if snapshot.coordinator_id == self.coordinator_id {
            return Ok(MeshReaction::None);
        }
        let lookback = self.config.ledger.divergence_lookback;
        let status = self
            .engine
            .ordering()
            .classify_remote_head(snapshot.sequence_number, &snapshot.head_hash, lookback)
            .await?;

        Ok(match status {
            RemoteHeadStatus::InSync | RemoteHeadStatus::Ahead => MeshReaction::None,
            RemoteHeadStatus::Behind { from, to } => MeshReaction::FetchLedgerRange {
                coordinator: snapshot.coordinator_id,
                sender,
                from,
                to,
            },
            RemoteHeadStatus::Diverged => {
                warn!(peer = %snapshot.coordinator_id, "ordering chains diverged");
                let local_head = self
                    .engine
                    .ordering()
                    .head()
                    .await?
                    .map(|(seq, _)| seq)
                    .unwrap_or(0);
                MeshReaction::FetchForFork {
                    coordinator: snapshot.coordinator_id,
                    sender,
                    from: local_head.saturating_sub(lookback),
                }
            }
        })
    }

    /// Adopts a fetched remote range onto the local chain.
    pub async fn extend_chain(
        &self,
        entries: Vec<OrderingEntry>,
    ) -> Result<(), CoordinatorError> {
        self.engine.adopt_remote_entries(entries).await?;
        Ok(())
    }

    /// Resolves a detected fork with a remote segment.
    pub async fn resolve_fork(
        &self,
        entries: Vec<OrderingEntry>,
    ) -> Result<(), CoordinatorError> {
        self.engine.resolve_fork(entries).await?;
        Ok(())
    }

    /// Awards an offered task to a gossip claim-race winner; the caller
    /// dispatches the spec to the winner.
    pub async fn award_claim(
        &self,
        task_id: &TaskId,
        winner: &AgentId,
    ) -> Result<TaskForward, CoordinatorError> {
        let record = self.queue.claim_for(task_id, winner, now_millis())?;
        self.store.put_task(record.clone()).await?;
        let bid = self
            .store
            .get_intent(task_id)
            .await?
            .map(|intent| intent.bid);
        Ok(TaskForward {
            task: record.spec,
            bid,
            origin_coordinator: self.coordinator_id.clone(),
            origin_account: self.config_account(),
        })
    }

    /// Returns an unclaimed offer to the queue.
    pub fn offer_lapsed(&self, task_id: &TaskId) {
        if let Err(err) = self.queue.mark_unoffered(task_id) {
            debug!(task = %task_id, error = %err, "offer lapse had no effect");
        }
    }

    // ------------------------------------------------------------------
    // Periodic work
    // ------------------------------------------------------------------

    /// Builds the capability summary broadcast payload.
    pub fn capability_summary(&self) -> MeshPayload {
        let now = now_millis();
        let live = self
            .registry
            .live_capabilities(now, self.config.coordinator.stale_threshold_ms);

        let mut models: BTreeMap<String, ModelCapability> = BTreeMap::new();
        let mut loads: HashMap<String, (u64, u64)> = HashMap::new();
        for cap in &live {
            let Some(model) = &cap.active_model else {
                continue;
            };
            let entry = models.entry(model.clone()).or_insert(ModelCapability {
                agent_count: 0,
                total_param_capacity: 0.0,
                avg_load: 0.0,
            });
            entry.agent_count += 1;
            entry.total_param_capacity += cap.active_model_param_size;
            let (count, load) = loads.entry(model.clone()).or_insert((0, 0));
            *count += 1;
            *load += cap.current_load as u64;
        }
        for (model, entry) in models.iter_mut() {
            if let Some((count, load)) = loads.get(model.as_str()) {
                entry.avg_load = *load as f64 / (*count).max(1) as f64;
            }
        }

        MeshPayload::CapabilitySummary(CapabilitySummary {
            coordinator_id: self.coordinator_id.clone(),
            agent_count: live.len() as u64,
            models,
        })
    }

    /// Builds the queue summary broadcast payload.
    pub fn queue_summary(&self) -> MeshPayload {
        MeshPayload::QueueSummary(QueueSummary {
            coordinator_id: self.coordinator_id.clone(),
            queued_tasks: self.queue.queued_depth(),
            active_agents: self
                .registry
                .live_capabilities(now_millis(), self.config.coordinator.stale_threshold_ms)
                .len() as u64,
        })
    }

    /// Builds the ordering snapshot broadcast payload.
    pub async fn ordering_snapshot(&self) -> Result<Option<MeshPayload>, CoordinatorError> {
        Ok(self.engine.ordering().head().await?.map(|(seq, hash)| {
            MeshPayload::OrderingSnapshot(OrderingSnapshot {
                coordinator_id: self.coordinator_id.clone(),
                head_hash: hash,
                sequence_number: seq,
            })
        }))
    }

    /// Computes and broadcasts the local price proposal.
    pub fn pricing_tick(&self) {
        let now = now_millis();
        let (capacity, idle_fraction) = self
            .registry
            .load_figures(now, self.config.coordinator.stale_threshold_ms);
        let price = self
            .pricer
            .propose(self.queue.queued_depth(), capacity, idle_fraction);

        let mut proposals = self.proposals.lock();
        proposals.record(
            self.coordinator_id.clone(),
            ResourceClass::Cpu,
            price,
            now,
        );
        drop(proposals);

        self.send_payload(MeshPayload::PriceProposal(PriceProposal {
            coordinator_id: self.coordinator_id.clone(),
            resource_class: ResourceClass::Cpu,
            price_per_compute_unit_sats: price,
        }));
    }

    /// Opens, stalls, or progresses issuance epochs.
    pub async fn issuance_tick(&self) -> Result<(), CoordinatorError> {
        let now = now_millis();
        {
            let mut issuance = self.issuance.lock();
            issuance.set_quorum_pool(1 + self.federation.lock().len() as u32);
            issuance.check_stall(now);
        }

        let proposal = {
            let mut issuance = self.issuance.lock();
            if !issuance.should_open_epoch(now) {
                return Ok(());
            }
            let earnings = std::mem::take(&mut *self.window_earnings.lock());
            issuance.open_epoch(now, earnings)
        };

        // a lone coordinator commits immediately; peers vote otherwise
        let solo = self.federation.lock().is_empty();
        self.send_payload(MeshPayload::IssuanceProposal(proposal.clone()));
        if solo {
            let outcome = self.issuance.lock().record_vote(
                self.coordinator_id.clone(),
                proposal.epoch,
                true,
            );
            if let IssuanceOutcome::Commit(commit) = outcome {
                self.commit_issuance(commit).await?;
            }
        }
        Ok(())
    }

    /// The reaper loop: stale-agent eviction, claim-timeout requeues, and
    /// deadline expiry.
    pub async fn run_reaper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(
            self.config.coordinator.reaper_interval_ms,
        ));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    debug!("reaper stopping");
                    return;
                }
            }
            if let Err(err) = self.reap_once().await {
                warn!(error = %err, "reaper pass failed");
            }
        }
    }

    /// One reaper pass; factored out for tests.
    pub async fn reap_once(&self) -> Result<(), CoordinatorError> {
        let now = now_millis();
        let reaped = self
            .registry
            .reap(now, self.config.coordinator.stale_threshold_ms);

        for agent in &reaped {
            let agent_id = &agent.capability.agent_id;
            info!(agent = %agent_id, "agent reaped");
            self.store.remove_agent(agent_id).await?;
            for task in self.queue.requeue_for_agent(agent_id) {
                self.store.put_task(task).await?;
            }
            self.send_payload(MeshPayload::PeerAnnounce(PeerAnnounce {
                rpc_url: String::new(),
                status: PeerStatus::Stale,
                subject: Some(agent_id.clone()),
                known_peers: Vec::new(),
            }));
        }

        for task in self.queue.requeue_timeouts(now) {
            self.store.put_task(task.clone()).await?;
            if task.failure_reason.as_deref() == Some(MAX_RETRIES_REASON) {
                self.store
                    .set_intent_state(&task.spec.task_id, IntentState::Voided)
                    .await?;
            }
        }
        for task in self.queue.expire_overdue(now) {
            self.store.put_task(task.clone()).await?;
            self.store
                .set_intent_state(&task.spec.task_id, IntentState::Voided)
                .await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn settle_completed_task(
        &self,
        record: &TaskRecord,
        provider: &AgentRecord,
        credits: f64,
        report: &ResultReport,
    ) -> Result<Option<CreditTransaction>, CoordinatorError> {
        let Some(intent) = self.store.get_intent(&record.spec.task_id).await? else {
            debug!(task = %record.spec.task_id, "no payment intent, completion without settlement");
            return Ok(None);
        };
        if intent.state != IntentState::Pending {
            return Ok(None);
        }
        let Some(requester_key) = self.registry.account_key(&intent.bid.requester_account)
        else {
            warn!(task = %record.spec.task_id, "requester not registered, settlement skipped");
            return Ok(None);
        };

        let requester_id = AgentId::new(intent.bid.requester_account.as_str());
        let tx = CreditTransaction {
            tx_id: report.tx_id.clone(),
            requester_id,
            provider_id: provider.capability.agent_id.clone(),
            requester_account: intent.bid.requester_account.clone(),
            provider_account: provider.capability.account_id.clone(),
            credits,
            cpu_seconds: report.cpu_seconds,
            task_hash: record.spec.input_hash(),
            timestamp: intent.bid.timestamp,
            reason: CreditReason::TaskPayment,
            requester_signature: intent.bid.signature,
            provider_signature: report.signature,
        };

        match self
            .engine
            .record_transaction(tx.clone(), &requester_key, &provider.capability.public_key)
            .await
        {
            Ok(RecordOutcome::Applied(_)) => {
                self.store
                    .set_intent_state(&record.spec.task_id, IntentState::Settled)
                    .await?;
                let mut earnings = self.window_earnings.lock();
                *earnings
                    .entry(provider.capability.account_id.clone())
                    .or_insert(0.0) += credits;
                Ok(Some(tx))
            }
            Ok(RecordOutcome::Duplicate) => Ok(Some(tx)),
            Err(err) => {
                warn!(task = %record.spec.task_id, error = %err, "settlement failed");
                Ok(None)
            }
        }
    }

    async fn commit_issuance(&self, commit: IssuanceCommit) -> Result<(), CoordinatorError> {
        let fresh = self.applied_epochs.lock().insert(commit.epoch);
        if fresh {
            self.engine
                .apply_issuance(commit.epoch, &commit.earnings)
                .await?;
        }
        self.send_payload(MeshPayload::IssuanceCommit(commit));

        let head = self.engine.ordering().head().await?;
        if let Some((_, head_hash)) = head {
            let checkpoint = self.issuance.lock().checkpoint(head_hash);
            if let Some(checkpoint) = checkpoint {
                match self.anchor.submit(checkpoint.head_hash).await {
                    Ok(anchor_ref) => {
                        self.issuance.lock().record_anchor(anchor_ref.clone());
                        self.send_payload(MeshPayload::IssuanceCheckpoint(IssuanceCheckpoint {
                            anchor_ref: Some(anchor_ref),
                            ..checkpoint
                        }));
                    }
                    Err(err) => {
                        warn!(error = %err, "anchor submission failed");
                        self.send_payload(MeshPayload::IssuanceCheckpoint(checkpoint));
                    }
                }
            }
        }
        Ok(())
    }

    fn can_serve_locally(&self, spec: &TaskSpec, now_ms: u64) -> bool {
        self.registry
            .live_capabilities(now_ms, self.config.coordinator.stale_threshold_ms)
            .iter()
            .any(|cap| {
                cap.serves_class(spec.project.resource_class)
                    && cap.active_model_param_size >= spec.required_model_size
            })
    }

    /// Forwards the task to the best federated coordinator, if one can
    /// serve it. Returns whether a forward went out.
    async fn try_forward(&self, record: &TaskRecord) -> Result<bool, CoordinatorError> {
        let candidates = self
            .federation
            .lock()
            .forward_candidates(None, record.spec.required_model_size);
        let Some(target) = candidates.first() else {
            debug!(task = %record.spec.task_id, "no capable agent or federated target; task stays queued");
            return Ok(false);
        };

        info!(
            task = %record.spec.task_id,
            target = %target.coordinator_id,
            "forwarding task to federated coordinator"
        );
        let bid = self
            .store
            .get_intent(&record.spec.task_id)
            .await?
            .map(|intent| intent.bid);
        self.send_payload(MeshPayload::TaskForward(TaskForward {
            task: record.spec.clone(),
            bid,
            origin_coordinator: self.coordinator_id.clone(),
            origin_account: self.config_account(),
        }));
        self.queue.mark_offered(&record.spec.task_id)?;
        Ok(true)
    }

    fn config_account(&self) -> AccountId {
        // the coordinator settles federation fees through its own node
        // account, which shares the node id
        AccountId::new(self.node_id.as_str())
    }

    fn send_payload(&self, payload: MeshPayload) {
        if self.outbound.send(payload).is_err() {
            warn!("outbound mesh consumer gone");
        }
    }

    /// Advertised RPC endpoint of this coordinator.
    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }
}
