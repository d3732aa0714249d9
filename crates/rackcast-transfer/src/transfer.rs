//! One chunked payload and its per-chunk send/ack bookkeeping.
//!
//! A transfer is sized exactly once (by probing how much blob space a chunk
//! message leaves in a datagram) and after that only its bookkeeping changes.
//! Once it has failed or succeeded nothing about it changes again.

use std::ops::Range;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::builder::{probe_chunk_capacity, ChunkHeader, ChunkMessage};
use crate::error::TransferError;

/// Process-unique transfer identifier (an OSC int32 on the wire).
pub type TransferId = i32;

/// Default per-chunk send budget.
pub const MAX_SENDS: u8 = 5;

/// RGBA bytes per pixel.
pub const IMAGE_DEPTH: usize = 4;

/// What the payload is. Decides the trailing fields of every chunk message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Generic,
    Image { width: i32, height: i32 },
}

/// QOI-encode raw RGBA pixels. Anything that cannot be encoded is sent raw.
fn compress_image(id: TransferId, width: i32, height: i32, rgba: Bytes) -> Bytes {
    let (Ok(w), Ok(h)) = (u32::try_from(width), u32::try_from(height)) else {
        warn!(transfer_id = id, width, height, "bad image dimensions, sending uncompressed");
        return rgba;
    };
    if (w as usize).checked_mul(h as usize).and_then(|px| px.checked_mul(IMAGE_DEPTH))
        != Some(rgba.len())
    {
        warn!(transfer_id = id, width, height, len = rgba.len(), "not RGBA, sending uncompressed");
        return rgba;
    }
    match qoi::encode_to_vec(&rgba, w, h) {
        Ok(encoded) => {
            debug!(transfer_id = id, raw = rgba.len(), compressed = encoded.len(), "image compressed");
            Bytes::from(encoded)
        }
        Err(e) => {
            warn!(transfer_id = id, "failed to compress image data: {}", e);
            rgba
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Chunk size not yet known.
    Building,
    /// Sized; chunks being sent and acked.
    Active,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Default)]
struct ChunkState {
    sends: u8,
    first_sent: Option<Instant>,
    last_sent: Option<Instant>,
    acked_at: Option<Instant>,
}

pub struct Transfer {
    id: TransferId,
    kind: TransferKind,
    payload: Bytes,
    max_sends: u8,
    chunk_size: usize,
    chunks: Vec<ChunkState>,
    acked: usize,
    /// Chunk that exhausted its budget. Set at most once.
    exhausted: Option<u32>,
}

impl Transfer {
    /// Image payloads are QOI-compressed here; the chunks carry the
    /// compressed bytes and `size()` is the compressed length.
    pub fn new(id: TransferId, kind: TransferKind, payload: impl Into<Bytes>) -> Self {
        let mut payload = payload.into();
        if let TransferKind::Image { width, height } = kind {
            payload = compress_image(id, width, height, payload);
        }
        Self {
            id,
            kind,
            payload,
            max_sends: MAX_SENDS,
            chunk_size: 0,
            chunks: Vec::new(),
            acked: 0,
            exhausted: None,
        }
    }

    pub fn with_max_sends(mut self, max_sends: u8) -> Self {
        self.max_sends = max_sends.max(1);
        self
    }

    #[inline]
    pub fn id(&self) -> TransferId {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn max_sends(&self) -> u8 {
        self.max_sends
    }

    /// `None` until the transfer has been sized.
    pub fn chunk_size(&self) -> Option<usize> {
        (self.chunk_size > 0).then_some(self.chunk_size)
    }

    #[inline]
    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn state(&self) -> TransferState {
        if self.chunk_size == 0 {
            TransferState::Building
        } else if self.send_succeeded() {
            TransferState::Succeeded
        } else if self.send_failed() {
            TransferState::Failed
        } else {
            TransferState::Active
        }
    }

    /// Probe how much chunk data fits next to this transfer's metadata in a
    /// datagram of `capacity` bytes, and size the transfer with it.
    pub fn determine_chunk_size(&mut self, capacity: usize) -> Result<usize, TransferError> {
        if let Some(size) = self.chunk_size() {
            return Ok(size);
        }
        if self.payload.is_empty() {
            return Err(TransferError::EmptyPayload(self.id));
        }
        let available = probe_chunk_capacity(&self.header(0), capacity)?;
        self.set_chunk_size(available)?;
        Ok(available)
    }

    /// Size the transfer directly. Has no effect once sized.
    pub fn set_chunk_size(&mut self, chunk_size: usize) -> Result<(), TransferError> {
        if chunk_size == 0 {
            return Err(TransferError::ChunkCapacityExhausted { capacity: 0 });
        }
        if self.chunk_size != 0 {
            return Ok(());
        }
        self.chunk_size = chunk_size;
        self.chunks = vec![ChunkState::default(); self.size().div_ceil(chunk_size)];
        Ok(())
    }

    /// Byte length of chunk `n`: the full chunk size except for the last one.
    pub fn size_of_chunk(&self, n: u32) -> usize {
        let range = self.chunk_range(n);
        range.end - range.start
    }

    fn chunk_range(&self, n: u32) -> Range<usize> {
        let n = n as usize;
        if n >= self.num_chunks() {
            return 0..0;
        }
        let start = n * self.chunk_size;
        let end = (start + self.chunk_size).min(self.size());
        start..end
    }

    /// Zero-copy slice of the payload for chunk `n`.
    pub fn chunk_bytes(&self, n: u32) -> Bytes {
        self.payload.slice(self.chunk_range(n))
    }

    pub fn header(&self, n: u32) -> ChunkHeader {
        ChunkHeader {
            transfer_id: self.id,
            chunk_num: n,
            num_chunks: self.num_chunks() as u32,
            chunk_size: self.chunk_size as u32,
            total_size: self.size() as u64,
            kind: self.kind,
        }
    }

    pub fn chunk_message(&self, n: u32) -> ChunkMessage {
        ChunkMessage {
            header: self.header(n),
            data: self.chunk_bytes(n),
        }
    }

    /// Record an ack. Returns true only for the first ack of a live chunk.
    pub fn ack(&mut self, n: u32) -> bool {
        if self.is_terminal() {
            return false;
        }
        let Some(chunk) = self.chunks.get_mut(n as usize) else {
            return false;
        };
        if chunk.acked_at.is_some() {
            return false;
        }
        chunk.acked_at = Some(Instant::now());
        self.acked += 1;
        true
    }

    pub fn is_acked(&self, n: u32) -> bool {
        self.chunks
            .get(n as usize)
            .is_some_and(|c| c.acked_at.is_some())
    }

    /// Count one more send of chunk `n` and return its attempt count. A chunk
    /// reaching its budget without an ack fails the whole transfer.
    pub fn register_chunk_sent(&mut self, n: u32) -> u8 {
        if self.is_terminal() {
            return self.sends(n);
        }
        let max_sends = self.max_sends;
        let Some(chunk) = self.chunks.get_mut(n as usize) else {
            return 0;
        };
        let now = Instant::now();
        chunk.sends = chunk.sends.saturating_add(1);
        chunk.first_sent.get_or_insert(now);
        chunk.last_sent = Some(now);

        if chunk.sends >= max_sends && chunk.acked_at.is_none() {
            self.exhausted = Some(n);
        }
        chunk.sends
    }

    pub fn sends(&self, n: u32) -> u8 {
        self.chunks.get(n as usize).map_or(0, |c| c.sends)
    }

    /// Indices without an ack, in index order.
    pub fn unacked_chunks(&self) -> Vec<u32> {
        self.chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| c.acked_at.is_none())
            .map(|(n, _)| n as u32)
            .collect()
    }

    pub fn unacked_count(&self) -> usize {
        self.num_chunks() - self.acked
    }

    pub fn send_succeeded(&self) -> bool {
        self.chunk_size != 0 && self.acked == self.num_chunks()
    }

    pub fn send_failed(&self) -> bool {
        self.exhausted.is_some()
    }

    pub fn exhausted_chunk(&self) -> Option<u32> {
        self.exhausted
    }

    pub fn is_terminal(&self) -> bool {
        self.send_failed() || self.send_succeeded()
    }

    /// First send to ack for one chunk.
    pub fn round_trip(&self, n: u32) -> Option<Duration> {
        let chunk = self.chunks.get(n as usize)?;
        Some(chunk.acked_at?.saturating_duration_since(chunk.first_sent?))
    }

    /// Earliest send to latest ack, once every chunk is acked.
    pub fn completion_duration(&self) -> Option<Duration> {
        if !self.send_succeeded() {
            return None;
        }
        let first = self.chunks.iter().filter_map(|c| c.first_sent).min()?;
        let last = self.chunks.iter().filter_map(|c| c.acked_at).max()?;
        Some(last.saturating_duration_since(first))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sized(size: usize, chunk_size: usize) -> Transfer {
        let mut t = Transfer::new(1, TransferKind::Generic, vec![7u8; size]);
        t.set_chunk_size(chunk_size).unwrap();
        t
    }

    #[test]
    fn chunk_sizes_cover_payload() {
        for &size in &[1usize, 10, 1199, 1200, 1201, 100_000] {
            for &chunk_size in &[1usize, 7, 1200, 4096] {
                let t = sized(size, chunk_size);
                assert_eq!(t.num_chunks(), size.div_ceil(chunk_size));
                let total: usize = (0..t.num_chunks() as u32).map(|n| t.size_of_chunk(n)).sum();
                assert_eq!(total, size, "size={} chunk_size={}", size, chunk_size);
            }
        }
    }

    #[test]
    fn last_chunk_is_remainder() {
        let t = sized(100_000, 1200);
        assert_eq!(t.num_chunks(), 84);
        assert_eq!(t.size_of_chunk(0), 1200);
        assert_eq!(t.size_of_chunk(82), 1200);
        assert_eq!(t.size_of_chunk(83), 100_000 - 83 * 1200);
        assert_eq!(t.size_of_chunk(84), 0);
        assert_eq!(t.chunk_bytes(83).len(), 400);
    }

    #[test]
    fn chunk_bytes_are_payload_slices() {
        let payload: Vec<u8> = (0..=255u8).collect();
        let mut t = Transfer::new(3, TransferKind::Generic, payload.clone());
        t.set_chunk_size(100).unwrap();
        assert_eq!(&t.chunk_bytes(1)[..], &payload[100..200]);
        assert_eq!(&t.chunk_bytes(2)[..], &payload[200..]);
    }

    #[test]
    fn empty_payload_has_no_chunks() {
        let mut t = Transfer::new(1, TransferKind::Generic, Vec::new());
        assert_eq!(t.state(), TransferState::Building);
        t.set_chunk_size(1000).unwrap();
        assert_eq!(t.num_chunks(), 0);
    }

    #[test]
    fn empty_payload_cannot_be_probed() {
        let mut t = Transfer::new(6, TransferKind::Generic, Vec::new());
        assert!(matches!(
            t.determine_chunk_size(1452),
            Err(TransferError::EmptyPayload(6))
        ));
        assert_eq!(t.state(), TransferState::Building);
    }

    #[test]
    fn chunk_size_is_set_once() {
        let mut t = sized(5000, 1000);
        t.set_chunk_size(10).unwrap();
        assert_eq!(t.chunk_size(), Some(1000));
        assert_eq!(t.num_chunks(), 5);
        assert!(t.set_chunk_size(0).is_err());
    }

    #[test]
    fn ack_is_idempotent() {
        let mut t = sized(3000, 1000);
        assert_eq!(t.unacked_count(), 3);
        assert!(t.ack(1));
        assert_eq!(t.unacked_count(), 2);
        assert!(!t.ack(1));
        assert_eq!(t.unacked_count(), 2);
        assert_eq!(t.unacked_chunks(), vec![0, 2]);
        assert!(!t.ack(99));
    }

    #[test]
    fn all_acked_succeeds() {
        let mut t = sized(3000, 1000);
        t.register_chunk_sent(0);
        for n in 0..3 {
            t.ack(n);
        }
        assert!(t.send_succeeded());
        assert_eq!(t.state(), TransferState::Succeeded);
        assert!(t.completion_duration().is_some());
        assert!(t.round_trip(0).is_some());
        assert!(t.round_trip(1).is_none());
    }

    #[test]
    fn fails_after_max_sends_of_one_chunk() {
        let mut t = sized(3000, 1000);
        t.ack(1);
        t.ack(2);
        for attempt in 1..MAX_SENDS {
            assert_eq!(t.register_chunk_sent(0), attempt);
            assert!(!t.send_failed());
        }
        assert_eq!(t.register_chunk_sent(0), MAX_SENDS);
        assert!(t.send_failed());
        assert_eq!(t.exhausted_chunk(), Some(0));
        assert_eq!(t.state(), TransferState::Failed);
    }

    #[test]
    fn terminal_transfer_ignores_updates() {
        let mut t = sized(2000, 1000).with_max_sends(1);
        t.register_chunk_sent(1);
        assert!(t.send_failed());
        assert!(!t.ack(0));
        assert_eq!(t.register_chunk_sent(0), 0);
        assert_eq!(t.unacked_chunks(), vec![0, 1]);
    }

    #[test]
    fn acked_chunk_never_fails() {
        let mut t = sized(2000, 1000);
        t.ack(0);
        for _ in 0..MAX_SENDS {
            t.register_chunk_sent(0);
        }
        assert!(!t.send_failed());
    }

    #[test]
    fn probing_sizes_the_transfer() {
        let mut t = Transfer::new(9, TransferKind::Generic, vec![0u8; 10_000]);
        let size = t.determine_chunk_size(1452).unwrap();
        assert_eq!(t.chunk_size(), Some(size));
        assert_eq!(t.num_chunks(), 10_000usize.div_ceil(size));
        assert_eq!(t.state(), TransferState::Active);
    }

    #[test]
    fn image_payload_is_qoi_compressed() {
        let (width, height) = (40, 30);
        let rgba: Vec<u8> = (0..width * height)
            .flat_map(|i| [(i % 40) as u8 * 6, (i / 40) as u8 * 8, 0x20, 0xff])
            .collect();
        let t = Transfer::new(3, TransferKind::Image { width, height }, rgba.clone());
        assert!(t.size() < rgba.len());

        let (header, pixels) = qoi::decode_to_vec(t.payload()).unwrap();
        assert_eq!((header.width, header.height), (40, 30));
        assert_eq!(pixels, rgba);
    }

    #[test]
    fn image_with_wrong_length_is_sent_raw() {
        let t = Transfer::new(3, TransferKind::Image { width: 4, height: 4 }, vec![1u8; 10]);
        assert_eq!(t.payload().as_ref(), &[1u8; 10][..]);
        let t = Transfer::new(3, TransferKind::Image { width: -4, height: 4 }, vec![1u8; 64]);
        assert_eq!(t.size(), 64);
    }
}
