//! In-memory BLE port.
//!
//! Simulates a shared radio medium for tests and single-machine demos.
//! Requests and responses travel through the real chunk codec so the
//! framing path is exercised end to end.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use edgecoder_primitives::{now_millis, AgentId};
use parking_lot::Mutex;

use crate::{
    encode_chunks, BleAdvertisement, BleError, BlePeer, BlePort, BleTaskRequest, BleTaskResponse,
    Reassembler, TaskRequestHandler,
};

const LOOPBACK_MTU: usize = 512;
const LOOPBACK_RSSI: i32 = -42;

#[derive(Default)]
struct Station {
    advertisement: Option<BleAdvertisement>,
    handler: Option<Arc<dyn TaskRequestHandler>>,
    advertising: bool,
}

/// The shared medium all loopback ports attach to.
#[derive(Default)]
pub struct LoopbackBus {
    stations: Mutex<HashMap<AgentId, Station>>,
}

impl std::fmt::Debug for LoopbackBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackBus")
            .field("stations", &self.stations.lock().len())
            .finish()
    }
}

/// One device's endpoint on a [`LoopbackBus`].
#[derive(Debug)]
pub struct LoopbackPort {
    agent_id: AgentId,
    bus: Arc<LoopbackBus>,
    scanning: Mutex<bool>,
}

impl LoopbackPort {
    pub fn new_bus() -> Arc<LoopbackBus> {
        Arc::new(LoopbackBus::default())
    }

    pub fn attach(bus: Arc<LoopbackBus>, agent_id: AgentId) -> Self {
        bus.stations.lock().entry(agent_id.clone()).or_default();
        Self {
            agent_id,
            bus,
            scanning: Mutex::new(false),
        }
    }

    fn frame_round_trip<T: serde::Serialize + serde::de::DeserializeOwned>(
        value: &T,
    ) -> Result<T, BleError> {
        let bytes = serde_json::to_vec(value)?;
        let chunks = encode_chunks(&bytes, LOOPBACK_MTU)?;
        let mut reassembler = Reassembler::new(5_000);
        let mut payload = None;
        for chunk in &chunks {
            payload = reassembler.push(chunk, now_millis())?;
        }
        let payload = payload.ok_or(BleError::MissingChunks {
            missing: reassembler.missing(),
            total: chunks.len(),
        })?;
        Ok(serde_json::from_slice(&payload)?)
    }
}

#[async_trait]
impl BlePort for LoopbackPort {
    async fn start_advertising(&self, ad: BleAdvertisement) -> Result<(), BleError> {
        let mut stations = self.bus.stations.lock();
        let station = stations.entry(self.agent_id.clone()).or_default();
        station.advertisement = Some(ad);
        station.advertising = true;
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), BleError> {
        if let Some(station) = self.bus.stations.lock().get_mut(&self.agent_id) {
            station.advertising = false;
        }
        Ok(())
    }

    async fn update_advertisement(&self, ad: BleAdvertisement) -> Result<(), BleError> {
        if let Some(station) = self.bus.stations.lock().get_mut(&self.agent_id) {
            station.advertisement = Some(ad);
        }
        Ok(())
    }

    async fn start_scanning(&self) -> Result<(), BleError> {
        *self.scanning.lock() = true;
        Ok(())
    }

    async fn stop_scanning(&self) -> Result<(), BleError> {
        *self.scanning.lock() = false;
        Ok(())
    }

    async fn discovered_peers(&self) -> Result<Vec<BlePeer>, BleError> {
        if !*self.scanning.lock() {
            return Ok(Vec::new());
        }
        let now = now_millis();
        Ok(self
            .bus
            .stations
            .lock()
            .iter()
            .filter(|(id, station)| *id != &self.agent_id && station.advertising)
            .filter_map(|(_, station)| {
                station.advertisement.clone().map(|advertisement| BlePeer {
                    advertisement,
                    rssi: LOOPBACK_RSSI,
                    last_seen_ms: now,
                })
            })
            .collect())
    }

    async fn send_task_request(
        &self,
        peer: &AgentId,
        request: BleTaskRequest,
    ) -> Result<BleTaskResponse, BleError> {
        let handler = self
            .bus
            .stations
            .lock()
            .get(peer)
            .and_then(|s| s.handler.clone())
            .ok_or_else(|| BleError::Port(format!("peer {peer} not serving requests")))?;

        let request = Self::frame_round_trip(&request)?;
        let response = handler.handle(request).await;
        Self::frame_round_trip(&response)
    }

    fn on_task_request(&self, handler: Arc<dyn TaskRequestHandler>) {
        if let Some(station) = self.bus.stations.lock().get_mut(&self.agent_id) {
            station.handler = Some(handler);
        }
    }
}
