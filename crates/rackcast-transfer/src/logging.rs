//! Transfer logging trait for structured lifecycle logs.
//!
//! The registry reports chunked-transfer events here rather than
//! calling `tracing` directly, so a host can route them elsewhere (or drop
//! them in tests).

use std::fmt;

use crate::transfer::TransferId;

/// Structured log entry for a transfer operation.
#[derive(Debug, Clone)]
pub struct TransferLog {
    pub component: &'static str,
    pub transfer_id: TransferId,
    pub event: TransferEvent,
}

/// Transfer events that can be logged.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// Registry: chunk size probed and transfer registered
    Registered {
        size: usize,
        chunk_size: usize,
        num_chunks: usize,
    },
    /// Registry: empty or unsizable payload dropped before registration
    Discarded { reason: String },
    /// Registry: an in-flight transfer replaced by a new one with the same id
    Superseded,
    /// Registry: one retry pass enqueued these chunks
    PassEnqueued { pass: u32, chunks: usize },
    /// Registry: a chunk datagram left the socket
    ChunkSent { chunk_num: u32, attempt: u8 },
    /// Registry: first ack for a chunk
    ChunkAcked { chunk_num: u32, round_trip_ms: u64 },
    /// Registry: every chunk acked, transfer evicted
    Succeeded { total_bytes: usize, duration_ms: u64 },
    /// Registry: retry budget exhausted, transfer evicted
    Failed { chunk_num: u32, unacked: usize },
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registered { size, chunk_size, num_chunks } => {
                write!(f, "chunk_size_discovered size={} chunk_size={} chunks={}", size, chunk_size, num_chunks)
            }
            Self::Discarded { reason } => write!(f, "transfer_discarded: {}", reason),
            Self::Superseded => write!(f, "transfer_superseded"),
            Self::PassEnqueued { pass, chunks } => {
                write!(f, "pass_enqueued pass={} chunks={}", pass, chunks)
            }
            Self::ChunkSent { chunk_num, attempt } => {
                write!(f, "chunk_sent idx={} attempt={}", chunk_num, attempt)
            }
            Self::ChunkAcked { chunk_num, round_trip_ms } => {
                write!(f, "chunk_acked idx={} rtt_ms={}", chunk_num, round_trip_ms)
            }
            Self::Succeeded { total_bytes, duration_ms } => {
                write!(f, "transfer_succeeded bytes={} duration_ms={}", total_bytes, duration_ms)
            }
            Self::Failed { chunk_num, unacked } => {
                write!(f, "transfer_failed: chunk {} exhausted its sends, {} chunk(s) unacked", chunk_num, unacked)
            }
        }
    }
}

/// Trait for transfer logging. Implementations can write to tracing, collect
/// entries for inspection, or discard them.
pub trait TransferLogger: Send + Sync {
    fn log(&self, entry: TransferLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl TransferLogger for TracingLogger {
    fn log(&self, entry: TransferLog) {
        // info for lifecycle events, debug for per-chunk spam
        match &entry.event {
            TransferEvent::Failed { .. } | TransferEvent::Discarded { .. } => {
                tracing::warn!(
                    component = entry.component,
                    transfer_id = entry.transfer_id,
                    "{}",
                    entry.event,
                );
            }
            TransferEvent::Registered { .. }
            | TransferEvent::Superseded
            | TransferEvent::Succeeded { .. } => {
                tracing::info!(
                    component = entry.component,
                    transfer_id = entry.transfer_id,
                    "{}",
                    entry.event,
                );
            }
            _ => {
                tracing::debug!(
                    component = entry.component,
                    transfer_id = entry.transfer_id,
                    "{}",
                    entry.event,
                );
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl TransferLogger for NullLogger {
    fn log(&self, _entry: TransferLog) {}
}
