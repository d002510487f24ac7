//! Chunked transport framing.
//!
//! GATT writes are bounded by the MTU, so larger payloads are split into
//! chunks carrying a 4-byte big-endian header: `u16 seq_no` (0-indexed),
//! `u16 total_chunks`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::BleError;

/// Bytes of framing prepended to every chunk.
pub const CHUNK_HEADER_LEN: usize = 4;

/// Splits `data` into MTU-sized chunks. Empty payloads still produce one
/// (header-only) chunk so receivers always observe a transfer.
pub fn encode_chunks(data: &[u8], mtu: usize) -> Result<Vec<Bytes>, BleError> {
    if mtu <= CHUNK_HEADER_LEN {
        return Err(BleError::MtuTooSmall(mtu));
    }
    let capacity = mtu - CHUNK_HEADER_LEN;
    let total = data.len().div_ceil(capacity).max(1);
    if total > u16::MAX as usize {
        return Err(BleError::PayloadTooLarge(data.len()));
    }

    let mut chunks = Vec::with_capacity(total);
    for (seq, piece) in data.chunks(capacity).enumerate() {
        let mut chunk = BytesMut::with_capacity(CHUNK_HEADER_LEN + piece.len());
        chunk.put_u16(seq as u16);
        chunk.put_u16(total as u16);
        chunk.put_slice(piece);
        chunks.push(chunk.freeze());
    }
    if chunks.is_empty() {
        let mut chunk = BytesMut::with_capacity(CHUNK_HEADER_LEN);
        chunk.put_u16(0);
        chunk.put_u16(1);
        chunks.push(chunk.freeze());
    }
    Ok(chunks)
}

/// Reassembles one chunked transfer.
///
/// The reassembler owns its buffers exclusively; chunks may arrive out of
/// order, but completion requires every sequence number exactly once.
/// A gap of more than the idle timeout between chunks aborts the transfer.
#[derive(Debug)]
pub struct Reassembler {
    timeout_ms: u64,
    total: Option<u16>,
    received: Vec<Option<Bytes>>,
    received_count: usize,
    last_chunk_at_ms: Option<u64>,
}

impl Reassembler {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            timeout_ms,
            total: None,
            received: Vec::new(),
            received_count: 0,
            last_chunk_at_ms: None,
        }
    }

    /// Feeds one chunk. Returns the full payload once every chunk has
    /// arrived.
    pub fn push(&mut self, chunk: &[u8], now_ms: u64) -> Result<Option<Bytes>, BleError> {
        if chunk.len() < CHUNK_HEADER_LEN {
            return Err(BleError::TruncatedChunk);
        }
        if let Some(last) = self.last_chunk_at_ms {
            if now_ms.saturating_sub(last) > self.timeout_ms {
                return Err(BleError::ReassemblyTimeout);
            }
        }

        let mut header = &chunk[..CHUNK_HEADER_LEN];
        let seq = header.get_u16();
        let total = header.get_u16();
        if total == 0 {
            return Err(BleError::InconsistentChunk("total_chunks is zero".into()));
        }
        if seq >= total {
            return Err(BleError::InconsistentChunk(format!(
                "seq {seq} outside total {total}"
            )));
        }

        match self.total {
            None => {
                self.total = Some(total);
                self.received = vec![None; total as usize];
            }
            Some(known) if known != total => {
                return Err(BleError::InconsistentChunk(format!(
                    "total changed from {known} to {total}"
                )));
            }
            Some(_) => {}
        }

        let slot = &mut self.received[seq as usize];
        if slot.is_some() {
            return Err(BleError::InconsistentChunk(format!("duplicate seq {seq}")));
        }
        *slot = Some(Bytes::copy_from_slice(&chunk[CHUNK_HEADER_LEN..]));
        self.received_count += 1;
        self.last_chunk_at_ms = Some(now_ms);

        let total = self.total.expect("set on first chunk") as usize;
        if self.received_count < total {
            return Ok(None);
        }

        let mut payload = BytesMut::new();
        for slot in self.received.drain(..) {
            let piece = slot.ok_or(BleError::MissingChunks { missing: 0, total })?;
            payload.extend_from_slice(&piece);
        }
        Ok(Some(payload.freeze()))
    }

    /// Whether the transfer has gone idle past the timeout.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.last_chunk_at_ms
            .is_some_and(|last| now_ms.saturating_sub(last) > self.timeout_ms)
    }

    /// Sequence numbers still outstanding.
    pub fn missing(&self) -> usize {
        self.total
            .map(|t| t as usize - self.received_count)
            .unwrap_or(0)
    }
}

/// Convenience: reassembles a complete in-order chunk set.
pub fn decode_chunks(chunks: &[Bytes], timeout_ms: u64) -> Result<Bytes, BleError> {
    let mut reassembler = Reassembler::new(timeout_ms);
    let mut out = None;
    for chunk in chunks {
        out = reassembler.push(chunk, 0)?;
    }
    out.ok_or_else(|| {
        let total = chunks.len();
        BleError::MissingChunks {
            missing: reassembler.missing(),
            total,
        }
    })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn round_trip_exact_boundary() {
        // payload an exact multiple of the chunk capacity
        let data = vec![7u8; (512 - CHUNK_HEADER_LEN) * 3];
        let chunks = encode_chunks(&data, 512).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(decode_chunks(&chunks, 5_000).unwrap(), data);
    }

    #[test]
    fn single_chunk_payload() {
        let chunks = encode_chunks(b"hi", 512).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(decode_chunks(&chunks, 5_000).unwrap().as_ref(), b"hi");
    }

    #[test]
    fn empty_payload_still_transfers() {
        let chunks = encode_chunks(b"", 512).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(decode_chunks(&chunks, 5_000).unwrap().len(), 0);
    }

    #[test]
    fn mtu_must_exceed_header() {
        assert!(matches!(
            encode_chunks(b"data", CHUNK_HEADER_LEN),
            Err(BleError::MtuTooSmall(_))
        ));
    }

    #[test]
    fn header_is_big_endian() {
        let data = vec![0u8; 600];
        let chunks = encode_chunks(&data, 512).unwrap();
        // second chunk: seq=1, total=2
        assert_eq!(&chunks[1][..4], &[0x00, 0x01, 0x00, 0x02]);
    }

    #[test]
    fn out_of_order_chunks_reassemble() {
        let data: Vec<u8> = (0..=255).cycle().take(1500).map(|b| b as u8).collect();
        let chunks = encode_chunks(&data, 512).unwrap();
        let mut reassembler = Reassembler::new(5_000);
        assert!(reassembler.push(&chunks[2], 0).unwrap().is_none());
        assert!(reassembler.push(&chunks[0], 1).unwrap().is_none());
        let payload = reassembler.push(&chunks[1], 2).unwrap().unwrap();
        assert_eq!(payload, data);
    }

    #[test]
    fn duplicate_chunk_rejected() {
        let chunks = encode_chunks(&vec![1u8; 1000], 512).unwrap();
        let mut reassembler = Reassembler::new(5_000);
        reassembler.push(&chunks[0], 0).unwrap();
        assert!(matches!(
            reassembler.push(&chunks[0], 1),
            Err(BleError::InconsistentChunk(_))
        ));
    }

    #[test]
    fn idle_timeout_aborts() {
        let chunks = encode_chunks(&vec![1u8; 1000], 512).unwrap();
        let mut reassembler = Reassembler::new(5_000);
        reassembler.push(&chunks[0], 0).unwrap();
        assert!(matches!(
            reassembler.push(&chunks[1], 5_001 + 1),
            Err(BleError::ReassemblyTimeout)
        ));
    }

    #[test]
    fn seq_outside_total_rejected() {
        let mut chunk = BytesMut::new();
        chunk.put_u16(5);
        chunk.put_u16(2);
        chunk.put_slice(b"x");
        let mut reassembler = Reassembler::new(5_000);
        assert!(matches!(
            reassembler.push(&chunk, 0),
            Err(BleError::InconsistentChunk(_))
        ));
    }

    proptest! {
        #[test]
        fn round_trip_arbitrary_payloads(
            data in proptest::collection::vec(any::<u8>(), 1..4096),
            mtu in 5usize..600,
        ) {
            let chunks = encode_chunks(&data, mtu).unwrap();
            let decoded = decode_chunks(&chunks, 5_000).unwrap();
            prop_assert_eq!(decoded.as_ref(), data.as_slice());
        }
    }
}
