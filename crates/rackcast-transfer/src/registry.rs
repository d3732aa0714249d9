//! Keyed table of in-flight chunked transfers and their retry loop.
//!
//! ```text
//! add() --> [size] --> process() --enqueue unacked chunks--> BuilderSink
//!                         ^                                      |
//!                         +---- RetryTimer (retry interval) <----+
//! ack() ---> mark chunk; the next pass evicts once all are acked
//! ```
//!
//! Every registration gets a fresh generation number. Retry callbacks and
//! queued chunk builders carry the generation they were created for and do
//! nothing once their transfer has been evicted or superseded.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::builder::{ChunkMessage, Content, Hooks, MessageBuilder};
use crate::logging::{TransferEvent, TransferLog, TransferLogger};
use crate::config::{DEFAULT_DATAGRAM_CAPACITY, DEFAULT_RETRY_INTERVAL};
use crate::scheduler::RetryTimer;
use crate::transfer::{Transfer, TransferId, TransferKind, TransferState, MAX_SENDS};

const COMPONENT: &str = "registry";

/// Where the registry hands chunk builders for sending.
pub trait BuilderSink: Send + Sync {
    fn enqueue(&self, builder: MessageBuilder);
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Datagram size every chunk message must fit in.
    pub datagram_capacity: usize,
    /// Delay between retry passes.
    pub retry_interval: Duration,
    /// Sends per chunk before the transfer fails.
    pub max_sends: u8,
    /// Dispatcher pause after each chunk datagram.
    pub chunk_delay: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            datagram_capacity: DEFAULT_DATAGRAM_CAPACITY,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            max_sends: MAX_SENDS,
            chunk_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeStatus {
    Succeeded { elapsed: Duration },
    /// `chunk_num` ran out of sends.
    Failed { chunk_num: u32 },
    /// Replaced by a newer transfer with the same id before finishing.
    Superseded,
}

/// Published once per registered transfer when it leaves the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub id: TransferId,
    pub size: usize,
    pub num_chunks: usize,
    pub status: OutcomeStatus,
}

struct Slot {
    generation: u64,
    pass: u32,
    transfer: Transfer,
}

impl Slot {
    fn outcome(&self, status: OutcomeStatus) -> TransferOutcome {
        TransferOutcome {
            id: self.transfer.id(),
            size: self.transfer.size(),
            num_chunks: self.transfer.num_chunks(),
            status,
        }
    }
}

enum Pass {
    Evict(Slot),
    Send { pass: u32, chunks: Vec<ChunkMessage> },
}

#[derive(Clone)]
pub struct TransferRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    config: RegistryConfig,
    transfers: Mutex<HashMap<TransferId, Slot>>,
    next_id: AtomicI32,
    next_generation: AtomicU64,
    sink: Arc<dyn BuilderSink>,
    timer: Arc<dyn RetryTimer>,
    logger: Arc<dyn TransferLogger>,
    subscribers: Mutex<Vec<Sender<TransferOutcome>>>,
}

impl TransferRegistry {
    pub fn new(
        config: RegistryConfig,
        sink: Arc<dyn BuilderSink>,
        timer: Arc<dyn RetryTimer>,
        logger: Arc<dyn TransferLogger>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                transfers: Mutex::new(HashMap::new()),
                next_id: AtomicI32::new(0),
                next_generation: AtomicU64::new(0),
                sink,
                timer,
                logger,
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Next id from the process-wide counter.
    pub fn allocate_id(&self) -> TransferId {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Build a transfer under a freshly allocated id and start sending it.
    pub fn register(&self, kind: TransferKind, payload: impl Into<Bytes>) -> Option<TransferId> {
        let transfer = Transfer::new(self.allocate_id(), kind, payload);
        self.add(transfer)
    }

    /// Size `transfer`, store it under its id (replacing any previous
    /// transfer with that id) and run the first send pass. Empty or
    /// unsizable payloads are logged and dropped.
    pub fn add(&self, transfer: Transfer) -> Option<TransferId> {
        let inner = &self.inner;
        let id = transfer.id();
        let mut transfer = transfer.with_max_sends(inner.config.max_sends);

        let chunk_size = match transfer.determine_chunk_size(inner.config.datagram_capacity) {
            Ok(size) => size,
            Err(e) => {
                inner.log(id, TransferEvent::Discarded { reason: e.to_string() });
                return None;
            }
        };
        inner.log(
            id,
            TransferEvent::Registered {
                size: transfer.size(),
                chunk_size,
                num_chunks: transfer.num_chunks(),
            },
        );

        let generation = inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let previous = inner.transfers.lock().insert(
            id,
            Slot {
                generation,
                pass: 0,
                transfer,
            },
        );
        if let Some(previous) = previous {
            inner.log(id, TransferEvent::Superseded);
            inner.publish(previous.outcome(OutcomeStatus::Superseded));
        }

        inner.process(id, generation);
        Some(id)
    }

    /// Like `add`, but keeps an in-flight transfer with the same id unless
    /// `force` is set.
    pub fn add_unless_processing(&self, transfer: Transfer, force: bool) -> Option<TransferId> {
        if !force && self.is_processing(transfer.id()) {
            tracing::debug!(
                transfer_id = transfer.id(),
                "transfer already in flight, request ignored"
            );
            return None;
        }
        self.add(transfer)
    }

    /// Record a companion ack. Unknown ids and chunks are ignored.
    pub fn ack(&self, id: TransferId, chunk_num: u32) {
        let round_trip = {
            let mut transfers = self.inner.transfers.lock();
            let Some(slot) = transfers.get_mut(&id) else {
                return;
            };
            if !slot.transfer.ack(chunk_num) {
                return;
            }
            slot.transfer.round_trip(chunk_num).unwrap_or_default()
        };
        self.inner.log(
            id,
            TransferEvent::ChunkAcked {
                chunk_num,
                round_trip_ms: round_trip.as_millis() as u64,
            },
        );
    }

    /// Run an extra send pass for `id` now. The retry schedule is unchanged.
    pub fn process(&self, id: TransferId) {
        let generation = self.inner.transfers.lock().get(&id).map(|s| s.generation);
        if let Some(generation) = generation {
            self.inner.run_pass(id, generation);
        }
    }

    /// Registered and not yet succeeded.
    pub fn is_processing(&self, id: TransferId) -> bool {
        self.inner
            .transfers
            .lock()
            .get(&id)
            .is_some_and(|slot| !slot.transfer.send_succeeded())
    }

    pub fn state(&self, id: TransferId) -> Option<TransferState> {
        self.inner.transfers.lock().get(&id).map(|s| s.transfer.state())
    }

    pub fn in_flight(&self) -> usize {
        self.inner.transfers.lock().len()
    }

    /// Receive an outcome for every transfer that leaves the registry from
    /// now on.
    pub fn subscribe_outcomes(&self) -> Receiver<TransferOutcome> {
        let (tx, rx) = unbounded();
        self.inner.subscribers.lock().push(tx);
        rx
    }
}

impl RegistryInner {
    fn log(&self, transfer_id: TransferId, event: TransferEvent) {
        self.logger.log(TransferLog {
            component: COMPONENT,
            transfer_id,
            event,
        });
    }

    fn publish(&self, outcome: TransferOutcome) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(outcome.clone()).is_ok());
    }

    /// Run a pass and keep rescheduling until the transfer is gone.
    fn process(self: &Arc<Self>, id: TransferId, generation: u64) {
        if !self.run_pass(id, generation) {
            return;
        }
        let weak = Arc::downgrade(self);
        self.timer.schedule_after(
            self.config.retry_interval,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.process(id, generation);
                }
            }),
        );
    }

    /// Evict a finished transfer, or enqueue every unacked chunk. Returns
    /// false once the transfer is no longer live under `generation`.
    fn run_pass(self: &Arc<Self>, id: TransferId, generation: u64) -> bool {
        let pass = {
            let mut transfers = self.transfers.lock();
            let Entry::Occupied(mut entry) = transfers.entry(id) else {
                return false;
            };
            if entry.get().generation != generation {
                return false;
            }
            if entry.get().transfer.is_terminal() {
                Pass::Evict(entry.remove())
            } else {
                let slot = entry.get_mut();
                slot.pass += 1;
                let chunks = slot
                    .transfer
                    .unacked_chunks()
                    .into_iter()
                    .map(|n| slot.transfer.chunk_message(n))
                    .collect();
                Pass::Send {
                    pass: slot.pass,
                    chunks,
                }
            }
        };

        match pass {
            Pass::Evict(slot) => {
                self.evict(slot);
                false
            }
            Pass::Send { pass, chunks } => {
                self.log(
                    id,
                    TransferEvent::PassEnqueued {
                        pass,
                        chunks: chunks.len(),
                    },
                );
                for chunk in chunks {
                    let hooks = self.chunk_hooks(id, generation, chunk.header.chunk_num);
                    let builder = MessageBuilder::with_hooks(Content::Chunk(chunk), hooks)
                        .with_post_send_delay(self.config.chunk_delay);
                    self.sink.enqueue(builder);
                }
                true
            }
        }
    }

    fn evict(&self, slot: Slot) {
        let id = slot.transfer.id();
        let status = match slot.transfer.exhausted_chunk() {
            Some(chunk_num) => {
                self.log(
                    id,
                    TransferEvent::Failed {
                        chunk_num,
                        unacked: slot.transfer.unacked_count(),
                    },
                );
                OutcomeStatus::Failed { chunk_num }
            }
            None => {
                let elapsed = slot.transfer.completion_duration().unwrap_or_default();
                self.log(
                    id,
                    TransferEvent::Succeeded {
                        total_bytes: slot.transfer.size(),
                        duration_ms: elapsed.as_millis() as u64,
                    },
                );
                OutcomeStatus::Succeeded { elapsed }
            }
        };
        self.publish(slot.outcome(status));
    }

    fn chunk_hooks(self: &Arc<Self>, id: TransferId, generation: u64, chunk_num: u32) -> Hooks {
        let skip_ref: Weak<Self> = Arc::downgrade(self);
        let sent_ref: Weak<Self> = Arc::downgrade(self);
        Hooks {
            skip: Some(Box::new(move || {
                skip_ref
                    .upgrade()
                    .is_none_or(|inner| inner.chunk_settled(id, generation, chunk_num))
            })),
            on_sent: Some(Box::new(move || {
                if let Some(inner) = sent_ref.upgrade() {
                    inner.chunk_sent(id, generation, chunk_num);
                }
            })),
            on_done: None,
        }
    }

    /// True if the chunk no longer needs sending: acked, its transfer failed,
    /// or the transfer it belonged to is gone.
    fn chunk_settled(&self, id: TransferId, generation: u64, chunk_num: u32) -> bool {
        match self.transfers.lock().get(&id) {
            Some(slot) if slot.generation == generation => {
                slot.transfer.send_failed() || slot.transfer.is_acked(chunk_num)
            }
            _ => true,
        }
    }

    fn chunk_sent(&self, id: TransferId, generation: u64, chunk_num: u32) {
        let attempt = {
            let mut transfers = self.transfers.lock();
            match transfers.get_mut(&id) {
                Some(slot) if slot.generation == generation => {
                    slot.transfer.register_chunk_sent(chunk_num)
                }
                _ => return,
            }
        };
        self.log(id, TransferEvent::ChunkSent { chunk_num, attempt });
    }
}
