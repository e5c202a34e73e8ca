/// Concord error types.
///
/// Every failure a node can report, locally or to a remote caller, is one
/// variant of a single enum. Remote failures travel as numeric codes.

use serde::{Deserialize, Serialize};

/// Unified error type for all concord operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum ConcordError {
    #[error("unknown error")]
    Unknown,
    #[error("I/O error")]
    Eio,
    #[error("system error")]
    SystemError,
    #[error("invalid parameters")]
    InvalidParms,
    #[error("node is shutting down")]
    Shutdown,
    #[error("protocol version mismatch")]
    VerMismatch,
    #[error("peer credentials rejected")]
    AuthFailed,

    // Transport and framing
    #[error("network error between nodes")]
    NetworkError,
    #[error("malformed frame header")]
    MalformedFrame,
    #[error("stream ended inside a frame")]
    TruncatedFrame,
    #[error("failed to encode or decode message")]
    CodecError,
    #[error("unexpected message")]
    UnexpectedMessage,

    // Lock arbitration
    #[error("no peer available")]
    PeerUnavailable,
    #[error("lock is held by another node")]
    LockContended,

    // Mappings
    #[error("mapping is not configured")]
    UnknownMapping,
    #[error("mapping configured twice")]
    DuplicateMapping,
    #[error("mapping configuration is closed")]
    ConfigurationClosed,
    #[error("wrong kind of mapping for this operation")]
    WrongMappingKind,
    #[error("no master available for mapping")]
    NoMaster,
    #[error("node is not the master of this mapping")]
    NotMaster,
    #[error("unknown mapping action")]
    UnknownAction,
    #[error("mapping action failed")]
    ActionFailed,

    // Node actions
    #[error("node action registered twice")]
    DuplicateAction,
}

impl ConcordError {
    /// Convert from a wire error code. Code 0 is success.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0x00 => None,
            0x01 => Some(Self::Unknown),
            0x02 => Some(Self::Eio),
            0x03 => Some(Self::SystemError),
            0x04 => Some(Self::InvalidParms),
            0x05 => Some(Self::Shutdown),
            0x06 => Some(Self::VerMismatch),
            0x07 => Some(Self::AuthFailed),
            0x10 => Some(Self::NetworkError),
            0x11 => Some(Self::MalformedFrame),
            0x12 => Some(Self::TruncatedFrame),
            0x13 => Some(Self::CodecError),
            0x14 => Some(Self::UnexpectedMessage),
            0x20 => Some(Self::PeerUnavailable),
            0x21 => Some(Self::LockContended),
            0x30 => Some(Self::UnknownMapping),
            0x31 => Some(Self::DuplicateMapping),
            0x32 => Some(Self::ConfigurationClosed),
            0x33 => Some(Self::WrongMappingKind),
            0x34 => Some(Self::NoMaster),
            0x35 => Some(Self::NotMaster),
            0x36 => Some(Self::UnknownAction),
            0x37 => Some(Self::ActionFailed),
            0x40 => Some(Self::DuplicateAction),
            _ => Some(Self::Unknown),
        }
    }

    /// Convert to a wire error code.
    pub fn to_code(self) -> u32 {
        match self {
            Self::Unknown => 0x01,
            Self::Eio => 0x02,
            Self::SystemError => 0x03,
            Self::InvalidParms => 0x04,
            Self::Shutdown => 0x05,
            Self::VerMismatch => 0x06,
            Self::AuthFailed => 0x07,
            Self::NetworkError => 0x10,
            Self::MalformedFrame => 0x11,
            Self::TruncatedFrame => 0x12,
            Self::CodecError => 0x13,
            Self::UnexpectedMessage => 0x14,
            Self::PeerUnavailable => 0x20,
            Self::LockContended => 0x21,
            Self::UnknownMapping => 0x30,
            Self::DuplicateMapping => 0x31,
            Self::ConfigurationClosed => 0x32,
            Self::WrongMappingKind => 0x33,
            Self::NoMaster => 0x34,
            Self::NotMaster => 0x35,
            Self::UnknownAction => 0x36,
            Self::ActionFailed => 0x37,
            Self::DuplicateAction => 0x40,
        }
    }

}

/// Result type alias for concord operations.
pub type ConcordResult<T> = Result<T, ConcordError>;
