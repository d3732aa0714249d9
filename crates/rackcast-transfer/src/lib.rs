//! rackcast transfer: reliable chunked delivery over OSC/UDP.
//!
//! Moves large payloads (rendered panels, structure dumps) to a companion app
//! through size-limited datagrams:
//! - capacity probing so every chunk message fits one datagram
//! - per-chunk acks with a fixed retry cadence and a bounded send budget
//! - one dispatcher thread framing queued builders into OSC bundles
//! - one listener thread routing inbound messages by address
//! - broadcast discovery, then direct sends with heartbeat liveness

pub mod bridge;
pub mod builder;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod heartbeat;
pub mod logging;
pub mod osc;
pub mod payload;
pub mod receiver;
pub mod registry;
pub mod scheduler;
pub mod transfer;

// Re-export key types for convenience.
pub use bridge::Bridge;
pub use builder::{
    probe_chunk_capacity, ChunkHeader, ChunkMessage, Content, Heartbeat, Hooks, MessageBuilder,
    ACK_CHUNK_ADDRESS, ANNOUNCE_ADDRESS, BLOB_MARGIN, CHUNKED_ADDRESS, HEARTBEAT_ADDRESS,
};
pub use config::BridgeConfig;
pub use dispatcher::{Dispatcher, SendTarget, Transmit};
pub use error::{BridgeError, OscError, RouteError, TransferError};
pub use heartbeat::{HostMeter, IdleMeter, Liveness};
pub use logging::{NullLogger, TracingLogger, TransferEvent, TransferLog, TransferLogger};
pub use osc::{decode_packet, ArgCursor, OscArg, OscMessage, OscPacket, OscStream, EMPTY_BUNDLE_SIZE};
pub use payload::{Payload, PayloadSource};
pub use receiver::{Receiver, Routes, KEEPALIVE_ADDRESS, REGISTER_ADDRESS};
pub use registry::{BuilderSink, OutcomeStatus, RegistryConfig, TransferOutcome, TransferRegistry};
pub use scheduler::{RetryTimer, Scheduler};
pub use transfer::{Transfer, TransferId, TransferKind, TransferState, MAX_SENDS};
