//! Error types for the OSC bridge.
//!
//! None of these reach producers: the dispatcher, receiver and registry log
//! and absorb them. They exist so that each layer can say precisely what went
//! wrong before doing so.

use thiserror::Error;

/// Encoding and decoding failures in the OSC layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OscError {
    #[error("out of buffer space: need {needed} bytes, {remaining} remaining")]
    OutOfBuffer { needed: usize, remaining: usize },

    #[error("packet truncated at offset {0}")]
    Truncated(usize),

    #[error("unsupported type tag '{0}'")]
    UnsupportedTag(char),

    #[error("missing argument at position {0}")]
    MissingArgument(usize),

    #[error("wrong argument type at position {position}: expected {expected}, found {found}")]
    WrongArgumentType {
        position: usize,
        expected: &'static str,
        found: &'static str,
    },

    #[error("{0} excess argument(s)")]
    ExcessArguments(usize),

    #[error("invalid OSC string at offset {0}")]
    InvalidString(usize),

    #[error("malformed bundle: {0}")]
    MalformedBundle(&'static str),

    #[error("address pattern must start with '/': {0:?}")]
    InvalidAddress(String),
}

/// Why an inbound message was not handled.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("no route for {0}")]
    NoRoute(String),

    #[error("bad arguments for {address}: {source}")]
    Arguments {
        address: String,
        #[source]
        source: OscError,
    },
}

/// Failures while preparing a chunked transfer for registration.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer {0} has an empty payload")]
    EmptyPayload(i32),

    #[error("datagram capacity {capacity} leaves no room for chunk data")]
    ChunkCapacityExhausted { capacity: usize },

    #[error("image payload is {actual} bytes, expected {expected} for {width}x{height} RGBA")]
    ImageSizeMismatch {
        width: i32,
        height: i32,
        expected: usize,
        actual: usize,
    },

    #[error(transparent)]
    Osc(#[from] OscError),
}

/// Failures while starting or configuring the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("could not bind a UDP port in {first}..={last}")]
    Bind {
        first: u16,
        last: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid value for {key}: {reason}")]
    Config { key: &'static str, reason: String },
}
