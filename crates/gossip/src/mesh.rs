//! The gossip mesh service.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use edgecoder_config::GossipConfig;
use edgecoder_crypto::IdentityKey;
use edgecoder_mesh_types::{
    ClaimRejected, MeshEnvelope, MeshPayload, PeerAnnounce, PeerInfo, PeerStatus,
};
use edgecoder_primitives::{now_millis, AgentId, Buf32, MessageId, TaskId};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::{
    Admittance, ClaimCollector, ClaimOutcome, GossipError, PeerTable, ReceivePipeline,
    RejectReason,
};

/// A peer's reply to our announce: who it is plus the peers it knows.
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    pub node: PeerInfo,
    pub known_peers: Vec<PeerInfo>,
}

/// Outbound transport to peer coordinators. The binary provides the RPC
/// implementation; tests use in-memory fakes.
#[async_trait]
pub trait PeerClient: Send + Sync + 'static {
    /// Delivers an envelope to the peer's mesh ingest endpoint.
    async fn deliver(&self, rpc_url: &str, envelope: &MeshEnvelope) -> Result<(), GossipError>;

    /// Sends our announce and returns the peer's announce response.
    async fn announce(
        &self,
        rpc_url: &str,
        envelope: &MeshEnvelope,
    ) -> Result<AnnounceResponse, GossipError>;

    /// Cheap liveness probe.
    async fn probe(&self, rpc_url: &str) -> Result<(), GossipError>;
}

/// A fresh mesh message handed to the coordinator for consumption.
#[derive(Debug, Clone)]
pub struct MeshEvent {
    pub sender: AgentId,
    /// The key that signed the envelope, already pipeline-verified.
    pub sender_key: Buf32,
    pub payload: MeshPayload,
    pub received_at_ms: u64,
}

/// What happened to an ingested envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Fresh message, consumed locally, not relayed (ttl exhausted).
    Processed,
    /// Fresh message, consumed and relayed to this many peers.
    Relayed(usize),
    /// Already seen; dropped silently.
    Duplicate,
}

/// The composed gossip endpoint of one node.
pub struct GossipMesh<C> {
    node_id: AgentId,
    rpc_url: String,
    identity: Arc<IdentityKey>,
    config: GossipConfig,
    peers: PeerTable,
    pipeline: ReceivePipeline,
    claims: ClaimCollector,
    client: Arc<C>,
    events_tx: mpsc::UnboundedSender<MeshEvent>,
}

impl<C> std::fmt::Debug for GossipMesh<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipMesh")
            .field("node_id", &self.node_id)
            .field("peers", &self.peers.len())
            .finish_non_exhaustive()
    }
}

impl<C: PeerClient> GossipMesh<C> {
    /// Builds the mesh and the event stream its consumer reads.
    pub fn new(
        node_id: AgentId,
        rpc_url: String,
        identity: Arc<IdentityKey>,
        config: GossipConfig,
        client: Arc<C>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<MeshEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pipeline = ReceivePipeline::new(&config);
        let mesh = Arc::new(Self {
            node_id,
            rpc_url,
            identity,
            config,
            peers: PeerTable::new(),
            pipeline,
            claims: ClaimCollector::new(),
            client,
            events_tx,
        });
        (mesh, events_rx)
    }

    pub fn node_id(&self) -> &AgentId {
        &self.node_id
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn pipeline(&self) -> &ReceivePipeline {
        &self.pipeline
    }

    pub fn claims(&self) -> &ClaimCollector {
        &self.claims
    }

    /// Runs an inbound envelope through the receive pipeline, consumes it,
    /// and relays it onward while TTL remains.
    pub fn ingest(self: &Arc<Self>, envelope: MeshEnvelope) -> Result<IngestOutcome, RejectReason> {
        let now = now_millis();
        match self.pipeline.admit(&envelope, now)? {
            Admittance::Duplicate => return Ok(IngestOutcome::Duplicate),
            Admittance::Fresh => {}
        }

        self.consume(&envelope, now);

        let relayed = self.relay(&envelope);
        if relayed > 0 {
            Ok(IngestOutcome::Relayed(relayed))
        } else {
            Ok(IngestOutcome::Processed)
        }
    }

    /// Applies gossip-internal side effects, then forwards the message to
    /// the coordinator's event stream.
    fn consume(&self, envelope: &MeshEnvelope, now_ms: u64) {
        match &envelope.payload {
            MeshPayload::PeerAnnounce(announce) => {
                if announce.status == PeerStatus::Leaving {
                    self.peers.remove(&envelope.sender_id);
                } else {
                    self.peers.upsert(
                        envelope.sender_id.clone(),
                        announce.rpc_url.clone(),
                        true,
                        now_ms,
                    );
                }
                self.peers
                    .merge_known_peers(&envelope.sender_id, &announce.known_peers, now_ms);
            }
            MeshPayload::TaskClaim(claim) => {
                // Claims are only valid for the agent that signed the envelope.
                if claim.claimant == envelope.sender_id {
                    self.claims
                        .record_claim(&claim.task_id, claim.claimant.clone(), claim.cost, now_ms);
                } else {
                    warn!(
                        sender = %envelope.sender_id,
                        claimant = %claim.claimant,
                        "claim on behalf of another agent ignored"
                    );
                    return;
                }
            }
            MeshPayload::BlacklistUpdate(update) => {
                self.pipeline.blacklist(update.blacklisted.iter().cloned());
            }
            _ => {}
        }

        let event = MeshEvent {
            sender: envelope.sender_id.clone(),
            sender_key: envelope.sender_public_key,
            payload: envelope.payload.clone(),
            received_at_ms: now_ms,
        };
        if self.events_tx.send(event).is_err() {
            warn!("mesh event consumer gone; dropping message");
        }
    }

    /// Relays to fan-out peers, excluding the sender. Returns the number
    /// of peers the relay went out to.
    fn relay(self: &Arc<Self>, envelope: &MeshEnvelope) -> usize {
        let Ok(relayed) = envelope.relayed() else {
            return 0;
        };
        let targets = self
            .peers
            .fanout_peers(&envelope.sender_id, self.config.fanout);
        for peer in &targets {
            let client = self.client.clone();
            let url = peer.rpc_url.clone();
            let copy = relayed.clone();
            let peer_id = peer.node_id.clone();
            tokio::spawn(async move {
                if let Err(err) = client.deliver(&url, &copy).await {
                    debug!(peer = %peer_id, error = %err, "relay delivery failed");
                }
            });
        }
        targets.len()
    }

    /// Signs and floods a payload to fan-out peers with the given TTL.
    pub fn broadcast(
        self: &Arc<Self>,
        payload: MeshPayload,
        ttl: u32,
    ) -> Result<MessageId, GossipError> {
        let envelope = MeshEnvelope::create(&self.identity, self.node_id.clone(), ttl, payload)?;
        self.pipeline.note_own_message(envelope.message_id.clone());
        let message_id = envelope.message_id.clone();

        let targets = self.peers.fanout_peers(&self.node_id, self.config.fanout);
        for peer in targets {
            let client = self.client.clone();
            let url = peer.rpc_url.clone();
            let copy = envelope.clone();
            let peer_id = peer.node_id;
            tokio::spawn(async move {
                if let Err(err) = client.deliver(&url, &copy).await {
                    debug!(peer = %peer_id, error = %err, "broadcast delivery failed");
                }
            });
        }
        Ok(message_id)
    }

    /// Signs a payload and delivers it to one peer only.
    pub async fn send_to(
        &self,
        rpc_url: &str,
        payload: MeshPayload,
        ttl: u32,
    ) -> Result<(), GossipError> {
        let envelope = MeshEnvelope::create(&self.identity, self.node_id.clone(), ttl, payload)?;
        self.pipeline.note_own_message(envelope.message_id.clone());
        self.client.deliver(rpc_url, &envelope).await
    }

    /// Announces to the configured bootstrap URLs and merges whatever
    /// peers they share back.
    pub async fn bootstrap(&self) -> usize {
        let bootstrap_urls = self.config.bootstrap_urls.clone();
        let mut reached = 0;
        for url in &bootstrap_urls {
            let announce = MeshPayload::PeerAnnounce(PeerAnnounce {
                rpc_url: self.rpc_url.clone(),
                status: PeerStatus::Active,
                subject: None,
                known_peers: self.known_peer_infos(),
            });
            let envelope = match MeshEnvelope::create(
                &self.identity,
                self.node_id.clone(),
                self.config.default_ttl,
                announce,
            ) {
                Ok(env) => env,
                Err(err) => {
                    warn!(error = %err, "failed to build announce");
                    continue;
                }
            };

            match self.client.announce(url, &envelope).await {
                Ok(response) => {
                    let now = now_millis();
                    self.peers.upsert(
                        response.node.node_id.clone(),
                        response.node.rpc_url.clone(),
                        true,
                        now,
                    );
                    self.peers
                        .merge_known_peers(&response.node.node_id, &response.known_peers, now);
                    reached += 1;
                }
                Err(err) => {
                    warn!(%url, error = %err, "bootstrap announce failed");
                }
            }
        }
        info!(reached, total = bootstrap_urls.len(), "bootstrap complete");
        reached
    }

    /// Offers a task to the mesh, waits out the claim delay, and resolves
    /// the race. Losers are notified over the reverse path.
    pub async fn offer_task(
        self: &Arc<Self>,
        payload: MeshPayload,
        task_id: TaskId,
    ) -> Result<Option<ClaimOutcome>, GossipError> {
        self.claims.open_offer(task_id.clone(), now_millis());
        self.broadcast(payload, self.config.default_ttl)?;

        tokio::time::sleep(Duration::from_millis(self.config.claim_delay_ms)).await;

        let Some(outcome) = self.claims.resolve(&task_id) else {
            return Ok(None);
        };

        for loser in &outcome.losers {
            let rejection = MeshPayload::ClaimRejected(ClaimRejected {
                task_id: task_id.clone(),
                claimant: loser.claimant.clone(),
                winner: outcome.winner.claimant.clone(),
            });
            match self.peers.get(&loser.claimant) {
                Some(peer) => {
                    if let Err(err) = self.send_to(&peer.rpc_url, rejection, 1).await {
                        debug!(loser = %loser.claimant, error = %err, "claim rejection failed");
                    }
                }
                None => {
                    // no direct path; let it flood back
                    let _ = self.broadcast(rejection, self.config.default_ttl);
                }
            }
        }

        Ok(Some(outcome))
    }

    /// Periodic liveness probing. Peers failing
    /// `max_missed_probes` consecutive probes are evicted.
    pub async fn run_peer_refresh(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.peer_refresh_interval_ms));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    debug!("peer refresh stopping");
                    return;
                }
            }

            for peer in self.peers.list() {
                match self.client.probe(&peer.rpc_url).await {
                    Ok(()) => self.peers.mark_alive(&peer.node_id, now_millis()),
                    Err(err) => {
                        debug!(peer = %peer.node_id, error = %err, "probe failed");
                        self.peers
                            .mark_probe_failure(&peer.node_id, self.config.max_missed_probes);
                    }
                }
            }

            // abandon claim windows that were never resolved
            let horizon = now_millis().saturating_sub(self.config.claim_delay_ms * 40);
            self.claims.expire_stale(horizon);
        }
    }

    fn known_peer_infos(&self) -> Vec<PeerInfo> {
        self.peers
            .list()
            .into_iter()
            .map(|p| PeerInfo {
                node_id: p.node_id,
                rpc_url: p.rpc_url,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use edgecoder_mesh_types::{QueueSummary, TaskClaim};
    use edgecoder_primitives::{CoordinatorId, TaskId};
    use parking_lot::Mutex;

    use super::*;

    /// Records deliveries instead of sending them anywhere.
    #[derive(Default)]
    struct RecordingClient {
        delivered: Mutex<Vec<(String, MeshEnvelope)>>,
    }

    #[async_trait]
    impl PeerClient for RecordingClient {
        async fn deliver(
            &self,
            rpc_url: &str,
            envelope: &MeshEnvelope,
        ) -> Result<(), GossipError> {
            self.delivered
                .lock()
                .push((rpc_url.to_owned(), envelope.clone()));
            Ok(())
        }

        async fn announce(
            &self,
            _rpc_url: &str,
            _envelope: &MeshEnvelope,
        ) -> Result<AnnounceResponse, GossipError> {
            Ok(AnnounceResponse {
                node: PeerInfo {
                    node_id: AgentId::new("boot"),
                    rpc_url: "http://boot".into(),
                },
                known_peers: vec![PeerInfo {
                    node_id: AgentId::new("p9"),
                    rpc_url: "http://p9".into(),
                }],
            })
        }

        async fn probe(&self, _rpc_url: &str) -> Result<(), GossipError> {
            Ok(())
        }
    }

    fn new_mesh() -> (
        Arc<GossipMesh<RecordingClient>>,
        mpsc::UnboundedReceiver<MeshEvent>,
        Arc<RecordingClient>,
    ) {
        let client = Arc::new(RecordingClient::default());
        let (mesh, events) = GossipMesh::new(
            AgentId::new("n0"),
            "http://n0".into(),
            Arc::new(IdentityKey::generate()),
            GossipConfig::default(),
            client.clone(),
        );
        (mesh, events, client)
    }

    fn summary_envelope(key: &IdentityKey, sender: &str, ttl: u32) -> MeshEnvelope {
        MeshEnvelope::create(
            key,
            AgentId::new(sender),
            ttl,
            MeshPayload::QueueSummary(QueueSummary {
                coordinator_id: CoordinatorId::new(sender),
                queued_tasks: 1,
                active_agents: 1,
            }),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn ingest_forwards_event_and_relays() {
        let (mesh, mut events, client) = new_mesh();
        mesh.peers
            .upsert(AgentId::new("p1"), "http://p1".into(), true, now_millis());
        mesh.peers
            .upsert(AgentId::new("p2"), "http://p2".into(), true, now_millis());

        let key = IdentityKey::generate();
        let envelope = summary_envelope(&key, "remote", 3);
        let outcome = mesh.ingest(envelope.clone()).unwrap();
        assert_eq!(outcome, IngestOutcome::Relayed(2));

        let event = events.recv().await.unwrap();
        assert_eq!(event.sender, AgentId::new("remote"));

        // allow spawned deliveries to land
        tokio::time::sleep(Duration::from_millis(50)).await;
        let delivered = client.delivered.lock();
        assert_eq!(delivered.len(), 2);
        for (_, copy) in delivered.iter() {
            assert_eq!(copy.ttl, 2);
            assert_eq!(copy.signature, envelope.signature);
        }
    }

    #[tokio::test]
    async fn ttl_one_is_consumed_but_not_relayed() {
        let (mesh, _events, client) = new_mesh();
        mesh.peers
            .upsert(AgentId::new("p1"), "http://p1".into(), true, now_millis());

        let key = IdentityKey::generate();
        let outcome = mesh.ingest(summary_envelope(&key, "remote", 1)).unwrap();
        assert_eq!(outcome, IngestOutcome::Processed);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(client.delivered.lock().is_empty());
    }

    #[tokio::test]
    async fn duplicate_ingest_drops_silently() {
        let (mesh, _events, _client) = new_mesh();
        let key = IdentityKey::generate();
        let envelope = summary_envelope(&key, "remote", 3);
        mesh.ingest(envelope.clone()).unwrap();
        assert_eq!(
            mesh.ingest(envelope.relayed().unwrap()).unwrap(),
            IngestOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn peer_announce_updates_table() {
        let (mesh, _events, _client) = new_mesh();
        let key = IdentityKey::generate();
        let envelope = MeshEnvelope::create(
            &key,
            AgentId::new("p1"),
            2,
            MeshPayload::PeerAnnounce(PeerAnnounce {
                rpc_url: "http://p1".into(),
                status: PeerStatus::Active,
                subject: None,
                known_peers: vec![PeerInfo {
                    node_id: AgentId::new("p2"),
                    rpc_url: "http://p2".into(),
                }],
            }),
        )
        .unwrap();

        mesh.ingest(envelope).unwrap();
        assert!(mesh.peers.get(&AgentId::new("p1")).unwrap().direct);
        assert!(!mesh.peers.get(&AgentId::new("p2")).unwrap().direct);
    }

    #[tokio::test]
    async fn claim_race_resolves_lowest_cost() {
        let (mesh, _events, _client) = new_mesh();
        let task_id = TaskId::new("t2");

        let a1 = IdentityKey::generate();
        let a2 = IdentityKey::generate();

        // run the offer concurrently with incoming claims
        let mesh_clone = mesh.clone();
        let offer_payload = MeshPayload::QueueSummary(QueueSummary {
            coordinator_id: CoordinatorId::new("n0"),
            queued_tasks: 0,
            active_agents: 0,
        });
        let tid = task_id.clone();
        let race = tokio::spawn(async move { mesh_clone.offer_task(offer_payload, tid).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let claim1 = MeshEnvelope::create(
            &a1,
            AgentId::new("a1"),
            1,
            MeshPayload::TaskClaim(TaskClaim {
                task_id: task_id.clone(),
                claimant: AgentId::new("a1"),
                cost: 30.0,
            }),
        )
        .unwrap();
        mesh.ingest(claim1).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let claim2 = MeshEnvelope::create(
            &a2,
            AgentId::new("a2"),
            1,
            MeshPayload::TaskClaim(TaskClaim {
                task_id: task_id.clone(),
                claimant: AgentId::new("a2"),
                cost: 20.0,
            }),
        )
        .unwrap();
        mesh.ingest(claim2).unwrap();

        let outcome = race.await.unwrap().unwrap().unwrap();
        assert_eq!(outcome.winner.claimant, AgentId::new("a2"));
        assert_eq!(outcome.losers.len(), 1);
    }

    #[tokio::test]
    async fn claims_for_other_agents_ignored() {
        let (mesh, _events, _client) = new_mesh();
        let task_id = TaskId::new("t1");
        mesh.claims.open_offer(task_id.clone(), now_millis());

        let key = IdentityKey::generate();
        let forged = MeshEnvelope::create(
            &key,
            AgentId::new("mallory"),
            1,
            MeshPayload::TaskClaim(TaskClaim {
                task_id: task_id.clone(),
                claimant: AgentId::new("victim"),
                cost: 0.0,
            }),
        )
        .unwrap();
        mesh.ingest(forged).unwrap();
        assert!(mesh.claims.resolve(&task_id).is_none());
    }

    #[tokio::test]
    async fn bootstrap_merges_responder_and_peers() {
        let client = Arc::new(RecordingClient::default());
        let config = GossipConfig {
            bootstrap_urls: vec!["http://boot".into()],
            ..GossipConfig::default()
        };
        let (mesh, _events) = GossipMesh::new(
            AgentId::new("n0"),
            "http://n0".into(),
            Arc::new(IdentityKey::generate()),
            config,
            client,
        );

        assert_eq!(mesh.bootstrap().await, 1);
        assert!(mesh.peers.get(&AgentId::new("boot")).unwrap().direct);
        assert!(mesh.peers.get(&AgentId::new("p9")).is_some());
    }

    #[tokio::test]
    async fn blacklist_update_applies_immediately() {
        let (mesh, _events, _client) = new_mesh();
        let key = IdentityKey::generate();
        let update = MeshEnvelope::create(
            &key,
            AgentId::new("judge"),
            2,
            MeshPayload::BlacklistUpdate(edgecoder_mesh_types::BlacklistUpdate {
                blacklisted: vec![AgentId::new("banned")],
                reason: "spam".into(),
            }),
        )
        .unwrap();
        mesh.ingest(update).unwrap();

        let banned_key = IdentityKey::generate();
        let msg = summary_envelope(&banned_key, "banned", 2);
        assert_eq!(mesh.ingest(msg), Err(RejectReason::Blacklisted));
    }
}
