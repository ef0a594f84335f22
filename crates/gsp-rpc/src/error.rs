use thiserror::Error;

use crate::hibernation::HibernationError;
use crate::message::Function;
use crate::poll::PollTimeout;
use crate::version::ProtocolVersion;

pub type Result<T> = std::result::Result<T, RpcError>;

/// Failure to publish an element into a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqueueError {
    #[error("queue full")]
    Full,
    #[error("element of {len} bytes exceeds the {max} byte element limit")]
    TooLarge { len: usize, max: usize },
    #[error("element of {len} bytes is not a whole number of slots")]
    Misaligned { len: usize },
    /// The peer's published read pointer is outside the ring.
    #[error("queue cursor out of range")]
    Desync,
}

/// Failure to consume an element from a queue.
///
/// Everything except [`DequeueError::Empty`] leaves the read cursor where it was
/// and is fatal to the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DequeueError {
    #[error("queue empty")]
    Empty,
    #[error(transparent)]
    Fault(#[from] TransportFault),
}

/// Channel corruption. Never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportFault {
    #[error("checksum mismatch on element seq {seq}")]
    CorruptChecksum { seq: u32 },
    #[error("sequence mismatch: expected {expected}, found {found}")]
    SequenceMismatch { expected: u32, found: u32 },
    #[error("queue desynchronized: {0}")]
    Desync(&'static str),
    #[error("record of {len} bytes exceeds the {max} byte record limit")]
    RecordTooLarge { len: usize, max: usize },
    #[error("malformed record: {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport fault: {0}")]
    Transport(#[from] TransportFault),

    /// The peer has not drained enough of the command queue.
    #[error("queue busy")]
    Busy,

    #[error("{0}")]
    Timeout(#[from] PollTimeout),

    /// Peer-reported failure below the reserved range, passed through verbatim.
    #[error("{function} failed with peer status {code:#x}")]
    Peer { function: Function, code: u32 },

    /// Peer-reported failure in the reserved range, collapsed.
    #[error("{function} failed with reserved peer status {code:#x}")]
    PeerGeneric { function: Function, code: u32 },

    #[error("peer protocol version {peer} is older than the minimum supported {min}")]
    VersionTooOld {
        peer: ProtocolVersion,
        min: ProtocolVersion,
    },

    #[error("version handshake failed")]
    HandshakeFailed,

    #[error("doorbell setup rejected with status {status:#x}")]
    SetupRejected { status: u32 },

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error(transparent)]
    Hibernation(#[from] HibernationError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<EnqueueError> for RpcError {
    fn from(err: EnqueueError) -> Self {
        match err {
            EnqueueError::Full => RpcError::Busy,
            EnqueueError::TooLarge { len, max } => {
                RpcError::Transport(TransportFault::RecordTooLarge { len, max })
            }
            EnqueueError::Misaligned { .. } => {
                RpcError::Transport(TransportFault::Malformed("element not slot aligned"))
            }
            EnqueueError::Desync => RpcError::Transport(TransportFault::Desync("queue cursor out of range")),
        }
    }
}

impl RpcError {
    /// Faults that leave the channel unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RpcError::Transport(_) | RpcError::VersionTooOld { .. } | RpcError::HandshakeFailed
        )
    }
}
