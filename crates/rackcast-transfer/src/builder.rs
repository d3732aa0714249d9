//! Pull-based producers of outgoing OSC messages.
//!
//! A `MessageBuilder` is queued on the dispatcher, which repeatedly asks it to
//! fill a bundle until it runs out of messages. The builder owns its content;
//! the only link back to whoever queued it is the set of hooks passed in at
//! construction.

use std::time::Duration;

use bytes::Bytes;

use crate::error::{OscError, TransferError};
use crate::osc::{OscMessage, OscStream};
use crate::transfer::{TransferId, TransferKind};

pub const CHUNKED_ADDRESS: &str = "/chunked";
pub const ACK_CHUNK_ADDRESS: &str = "/ack_chunk";
pub const ANNOUNCE_ADDRESS: &str = "/announce";
pub const HEARTBEAT_ADDRESS: &str = "/heartbeat";

/// Blob space held back when probing: length prefix (4), worst-case blob
/// padding (3) and type-tag string growth (4).
pub const BLOB_MARGIN: usize = 11;

/// Metadata carried by every chunk message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub transfer_id: TransferId,
    pub chunk_num: u32,
    pub num_chunks: u32,
    pub chunk_size: u32,
    pub total_size: u64,
    pub kind: TransferKind,
}

impl ChunkHeader {
    /// The chunk message with everything but the blob. Used for probing.
    fn metadata_message(&self) -> OscMessage {
        let mut msg = self.fixed_fields();
        self.push_trailing(&mut msg);
        msg
    }

    fn fixed_fields(&self) -> OscMessage {
        OscMessage::new(CHUNKED_ADDRESS)
            .arg(self.transfer_id)
            .arg(self.chunk_num as i32)
            .arg(self.num_chunks as i32)
            .arg(self.chunk_size as i32)
            .arg(self.total_size as i64)
    }

    fn push_trailing(&self, msg: &mut OscMessage) {
        if let TransferKind::Image { width, height } = self.kind {
            msg.push(width);
            msg.push(height);
        }
    }
}

/// One chunk on the wire:
/// `/chunked id:i chunk:i num_chunks:i chunk_size:i total:h data:b [width:i height:i]`
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkMessage {
    pub header: ChunkHeader,
    pub data: Bytes,
}

impl ChunkMessage {
    pub fn to_message(&self) -> OscMessage {
        let mut msg = self.header.fixed_fields().arg(self.data.clone());
        self.header.push_trailing(&mut msg);
        msg
    }

    /// Parse a received `/chunked` message, as a companion would.
    pub fn parse(msg: &OscMessage) -> Result<Self, OscError> {
        if msg.address != CHUNKED_ADDRESS {
            return Err(OscError::InvalidAddress(msg.address.clone()));
        }
        let mut args = msg.cursor();
        let transfer_id = args.int32()?;
        let chunk_num = args.int32()? as u32;
        let num_chunks = args.int32()? as u32;
        let chunk_size = args.int32()? as u32;
        let total_size = args.int64()? as u64;
        let data = args.blob()?.clone();
        let kind = if args.remaining() >= 2 {
            TransferKind::Image {
                width: args.int32()?,
                height: args.int32()?,
            }
        } else {
            TransferKind::Generic
        };
        args.finish()?;

        Ok(Self {
            header: ChunkHeader {
                transfer_id,
                chunk_num,
                num_chunks,
                chunk_size,
                total_size,
                kind,
            },
            data,
        })
    }
}

/// How much blob data fits next to `header` in one bundle of `capacity`
/// bytes.
pub fn probe_chunk_capacity(header: &ChunkHeader, capacity: usize) -> Result<usize, TransferError> {
    let exhausted = |e: OscError| match e {
        OscError::OutOfBuffer { .. } => TransferError::ChunkCapacityExhausted { capacity },
        other => TransferError::Osc(other),
    };

    let mut stream = OscStream::new(capacity);
    stream.begin_bundle().map_err(exhausted)?;
    stream
        .write_message(&header.metadata_message())
        .map_err(exhausted)?;
    stream.end_bundle().map_err(exhausted)?;

    match stream.remaining().checked_sub(BLOB_MARGIN) {
        Some(available) if available > 0 => Ok(available),
        _ => Err(TransferError::ChunkCapacityExhausted { capacity }),
    }
}

/// Periodic liveness message. Which one is sent depends on whether a
/// companion is registered.
#[derive(Debug, Clone, PartialEq)]
pub enum Heartbeat {
    /// Broadcast while nobody is registered: where to reach us.
    Announce { rx_port: u16, interval_ms: u32 },
    /// Sent to the registered companion with host load readings.
    Direct { average: f32, max: f32 },
}

impl Heartbeat {
    fn to_message(&self) -> OscMessage {
        match self {
            Self::Announce { rx_port, interval_ms } => OscMessage::new(ANNOUNCE_ADDRESS)
                .arg(*rx_port as i32)
                .arg(*interval_ms as i32),
            Self::Direct { average, max } => OscMessage::new(HEARTBEAT_ADDRESS)
                .arg(format!("{:.1}%", average))
                .arg(format!("{:.1}%", max)),
        }
    }
}

/// What a builder produces.
#[derive(Debug, Clone)]
pub enum Content {
    /// One chunk of a transfer (generic or image, per the header's kind).
    Chunk(ChunkMessage),
    /// Structure dumps and other multi-message replies, sent in order.
    Messages(Vec<OscMessage>),
    Heartbeat(Heartbeat),
    Ack { transfer_id: TransferId, chunk_num: u32 },
}

impl Content {
    fn len(&self) -> usize {
        match self {
            Self::Messages(messages) => messages.len(),
            Self::Chunk(_) | Self::Heartbeat(_) | Self::Ack { .. } => 1,
        }
    }

    fn message(&self, idx: usize) -> Option<OscMessage> {
        match (self, idx) {
            (Self::Messages(messages), _) => messages.get(idx).cloned(),
            (Self::Chunk(chunk), 0) => Some(chunk.to_message()),
            (Self::Heartbeat(heartbeat), 0) => Some(heartbeat.to_message()),
            (Self::Ack { transfer_id, chunk_num }, 0) => Some(
                OscMessage::new(ACK_CHUNK_ADDRESS)
                    .arg(*transfer_id)
                    .arg(*chunk_num as i32),
            ),
            _ => None,
        }
    }

    fn path(&self, idx: usize) -> Option<&str> {
        match (self, idx) {
            (Self::Messages(messages), _) => messages.get(idx).map(|m| m.address.as_str()),
            (Self::Chunk(_), 0) => Some(CHUNKED_ADDRESS),
            (Self::Heartbeat(Heartbeat::Announce { .. }), 0) => Some(ANNOUNCE_ADDRESS),
            (Self::Heartbeat(Heartbeat::Direct { .. }), 0) => Some(HEARTBEAT_ADDRESS),
            (Self::Ack { .. }, 0) => Some(ACK_CHUNK_ADDRESS),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Chunk(chunk) => match chunk.header.kind {
                TransferKind::Generic => "chunk",
                TransferKind::Image { .. } => "image-chunk",
            },
            Self::Messages(_) => "messages",
            Self::Heartbeat(_) => "heartbeat",
            Self::Ack { .. } => "ack",
        }
    }
}

pub type SkipCheck = Box<dyn Fn() -> bool + Send>;
pub type Hook = Box<dyn FnOnce() + Send>;

/// Callbacks fixed at construction time.
#[derive(Default)]
pub struct Hooks {
    /// Checked before building; `true` drops the builder unsent.
    pub skip: Option<SkipCheck>,
    /// Runs once after the builder's datagrams went out.
    pub on_sent: Option<Hook>,
    /// Runs when the builder is disposed of, sent or not.
    pub on_done: Option<Hook>,
}

pub struct MessageBuilder {
    content: Content,
    cursor: usize,
    hooks: Hooks,
    post_send_delay: Duration,
}

impl MessageBuilder {
    pub fn new(content: Content) -> Self {
        Self::with_hooks(content, Hooks::default())
    }

    pub fn with_hooks(content: Content, hooks: Hooks) -> Self {
        Self {
            content,
            cursor: 0,
            hooks,
            post_send_delay: Duration::ZERO,
        }
    }

    /// A builder with nothing to send.
    pub fn noop() -> Self {
        Self::new(Content::Messages(Vec::new()))
    }

    /// Pause the dispatcher for `delay` after this builder is sent.
    pub fn with_post_send_delay(mut self, delay: Duration) -> Self {
        self.post_send_delay = delay;
        self
    }

    pub fn name(&self) -> &'static str {
        self.content.name()
    }

    pub fn content(&self) -> &Content {
        &self.content
    }

    pub fn post_send_delay(&self) -> Duration {
        self.post_send_delay
    }

    pub fn has_remaining_messages(&self) -> bool {
        self.cursor < self.content.len()
    }

    /// Skip the next message without sending it.
    pub fn advance(&mut self) {
        if self.has_remaining_messages() {
            self.cursor += 1;
        }
    }

    /// Address of the next message, for diagnostics.
    pub fn next_path(&self) -> Option<&str> {
        self.content.path(self.cursor)
    }

    /// Write as many pending messages into `stream` as fit. Returns how many
    /// were written; stops at the first one that does not fit.
    pub fn bundle(&mut self, stream: &mut OscStream) -> usize {
        let mut written = 0;
        while let Some(msg) = self.content.message(self.cursor) {
            match stream.write_message(&msg) {
                Ok(()) => {
                    self.cursor += 1;
                    written += 1;
                }
                Err(OscError::OutOfBuffer { .. }) => break,
                Err(e) => {
                    tracing::warn!(
                        builder = self.name(),
                        address = %msg.address,
                        "skipping unencodable message: {}",
                        e
                    );
                    self.cursor += 1;
                }
            }
        }
        written
    }

    /// True if there is nothing worth sending.
    pub fn is_noop(&self) -> bool {
        if self.content.len() == 0 {
            return true;
        }
        self.hooks.skip.as_ref().is_some_and(|skip| skip())
    }

    /// Called by the dispatcher once the builder's datagrams were sent.
    pub fn finish(&mut self) {
        if let Some(on_sent) = self.hooks.on_sent.take() {
            on_sent();
        }
    }

    /// Dispose of the builder. The done hook also runs on plain drop.
    pub fn done(self) {}
}

impl Drop for MessageBuilder {
    fn drop(&mut self) {
        if let Some(on_done) = self.hooks.on_done.take() {
            on_done();
        }
    }
}

impl std::fmt::Debug for MessageBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBuilder")
            .field("name", &self.name())
            .field("cursor", &self.cursor)
            .field("messages", &self.content.len())
            .finish()
    }
}
