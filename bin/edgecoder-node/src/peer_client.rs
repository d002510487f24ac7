//! RPC transport to peer coordinators.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use edgecoder_gossip::{AnnounceResponse, GossipError, PeerClient};
use edgecoder_mesh_types::MeshEnvelope;
use edgecoder_rpc_api::EdgeCoordinatorApiClient;
use jsonrpsee_http_client::{HttpClient, HttpClientBuilder};
use parking_lot::Mutex;

/// Delivers gossip envelopes to peers over their coordinator RPC
/// endpoints, caching one HTTP client per peer URL.
pub(crate) struct RpcPeerClient {
    mesh_token: Option<String>,
    clients: Mutex<HashMap<String, Arc<HttpClient>>>,
}

impl RpcPeerClient {
    pub(crate) fn new(mesh_token: Option<String>) -> Self {
        Self {
            mesh_token,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, url: &str) -> Result<Arc<HttpClient>, GossipError> {
        if let Some(client) = self.clients.lock().get(url) {
            return Ok(client.clone());
        }

        let mut headers = http::HeaderMap::new();
        if let Some(token) = &self.mesh_token {
            let value = http::HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| GossipError::Delivery(e.to_string()))?;
            headers.insert(http::header::AUTHORIZATION, value);
        }

        let client = HttpClientBuilder::default()
            .set_headers(headers)
            .build(url)
            .map_err(|e| GossipError::Unreachable(e.to_string()))?;
        let client = Arc::new(client);
        self.clients
            .lock()
            .insert(url.to_owned(), client.clone());
        Ok(client)
    }
}

impl RpcPeerClient {
    /// Fetches a peer's ordering chain range for reconciliation.
    pub(crate) async fn ledger_range(
        &self,
        rpc_url: &str,
        from: u64,
        to: u64,
    ) -> Result<Vec<edgecoder_db::OrderingEntry>, GossipError> {
        let client = self.client_for(rpc_url)?;
        let response = client
            .ledger_range(from, to)
            .await
            .map_err(|e| GossipError::Unreachable(e.to_string()))?;
        Ok(response.entries)
    }
}

#[async_trait]
impl PeerClient for RpcPeerClient {
    async fn deliver(&self, rpc_url: &str, envelope: &MeshEnvelope) -> Result<(), GossipError> {
        let client = self.client_for(rpc_url)?;
        client
            .mesh_ingest(envelope.clone())
            .await
            .map_err(|e| GossipError::Delivery(e.to_string()))?;
        Ok(())
    }

    async fn announce(
        &self,
        rpc_url: &str,
        envelope: &MeshEnvelope,
    ) -> Result<AnnounceResponse, GossipError> {
        let client = self.client_for(rpc_url)?;
        let response = client
            .mesh_ingest(envelope.clone())
            .await
            .map_err(|e| GossipError::Unreachable(e.to_string()))?;
        let node = response
            .node
            .ok_or_else(|| GossipError::Delivery("announce response without node".into()))?;
        Ok(AnnounceResponse {
            node,
            known_peers: response.known_peers,
        })
    }

    async fn probe(&self, rpc_url: &str) -> Result<(), GossipError> {
        let client = self.client_for(rpc_url)?;
        client
            .status()
            .await
            .map_err(|e| GossipError::Unreachable(e.to_string()))?;
        Ok(())
    }
}
