//! BLE local mesh.
//!
//! When the internet path drops, co-located devices keep routing tasks to
//! each other over BLE GATT: capability advertisements feed a cost-based
//! router, payloads are chunked to the 512-byte MTU, and settled credits
//! accumulate in an offline ledger that flushes to the coordinator on
//! reconnect. The radio itself sits behind the [`BlePort`] trait; an
//! in-memory loopback port ships for tests and simulations.

mod chunk;
mod errors;
mod ledger;
mod loopback;
mod manager;
mod port;
mod router;

pub use chunk::{encode_chunks, Reassembler, CHUNK_HEADER_LEN};
pub use errors::BleError;
pub use ledger::OfflineLedger;
pub use loopback::{LoopbackBus, LoopbackPort};
pub use manager::{BleMeshManager, ConnectivityState};
pub use port::{
    BleAdvertisement, BlePeer, BlePort, BleTaskRequest, BleTaskResponse, DeviceType,
    TaskRequestHandler, UNAVAILABLE_LOAD,
};
#[cfg(any(test, feature = "test-utils"))]
pub use port::MockBlePort;
pub use router::select_peer;
