use thiserror::Error;

/// BLE subsystem failures.
#[derive(Debug, Error)]
pub enum BleError {
    /// MTU too small to fit the chunk header plus any payload.
    #[error("mtu {0} cannot carry the 4-byte chunk header")]
    MtuTooSmall(usize),

    /// Payload would need more chunks than the u16 counter can express.
    #[error("payload of {0} bytes exceeds chunkable size")]
    PayloadTooLarge(usize),

    /// A chunk shorter than its header.
    #[error("truncated chunk")]
    TruncatedChunk,

    /// Chunk metadata disagreed with the reassembly in progress.
    #[error("inconsistent chunk: {0}")]
    InconsistentChunk(String),

    /// Reassembly finished with sequence numbers missing.
    #[error("reassembly missing {missing} of {total} chunks")]
    MissingChunks { missing: usize, total: usize },

    /// No new chunk arrived within the reassembly timeout.
    #[error("reassembly timed out")]
    ReassemblyTimeout,

    /// The platform port failed.
    #[error("ble port failure: {0}")]
    Port(String),

    /// Every candidate peer scored at or above the cost bound.
    #[error("no routable peer")]
    NoPeerAvailable,

    /// Request or response payload failed to (de)serialize.
    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),
}
