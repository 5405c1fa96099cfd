//! Error types for the protocol core.

use thiserror::Error;

/// A wire message that could not be turned into a [`Message`](crate::Message).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The text is not JSON, or its root is neither an object nor an array.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    /// A field the message variant requires is absent or has the wrong type.
    #[error("missing/invalid {0} field")]
    MissingField(&'static str),
    /// None of `request`, `response` or `notification` is present.
    #[error("missing request/response/notification field")]
    MissingDiscriminator,
    /// More than one of `request`, `response` or `notification` is present.
    #[error("more than one of request/response/notification fields")]
    MultipleDiscriminators,
}

/// Failures reported by a [`Transport`](crate::transport::Transport).
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport is closed and cannot carry more messages.
    #[error("transport closed")]
    Closed,
    /// An outgoing message could not be serialized.
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors surfaced by [`Peer`](crate::Peer) operations.
///
/// Callers of [`Peer::request`](crate::Peer::request) only ever see
/// `Protocol`, `Timeout` or `Closed`. `Transport` is reserved for the
/// fire-and-forget paths (`notify`, `accept`, `reject`).
#[derive(Debug, Error)]
pub enum PeerError {
    /// The remote answered with `ok: false`.
    #[error("request rejected [code:{code}, reason:{reason}]")]
    Protocol {
        /// Remote `errorCode`.
        code: i32,
        /// Remote `errorReason`.
        reason: String,
    },
    /// No response arrived before the deadline.
    #[error("request timeout [method:{method}, id:{id}]")]
    Timeout {
        /// Method of the request that timed out.
        method: String,
        /// Wire id of the request that timed out.
        id: u32,
    },
    /// The call can no longer complete: the peer closed (or was already
    /// closed), or a newer request took over its id.
    #[error("peer closed")]
    Closed,
    /// Sending a notification or reply failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl PeerError {
    /// Remote error code for `Protocol` errors.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Protocol { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Errors from [`Room`](crate::Room) operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    /// A peer with the same id is already registered.
    #[error("there is already a Peer with same peerId [peerId:{0}]")]
    Duplicate(String),
    /// The room has been closed.
    #[error("room closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_display() {
        assert_eq!(
            ParseError::MissingField("method").to_string(),
            "missing/invalid method field"
        );
        assert!(ParseError::InvalidJson("eof".into()).to_string().contains("eof"));
    }

    #[test]
    fn protocol_error_carries_code() {
        let err = PeerError::Protocol {
            code: 503,
            reason: "unavailable".into(),
        };
        assert_eq!(err.code(), Some(503));
        assert!(err.to_string().contains("unavailable"));
        assert_eq!(PeerError::Closed.code(), None);
    }

    #[test]
    fn transport_error_converts_into_peer_error() {
        let err: PeerError = TransportError::Closed.into();
        assert!(matches!(err, PeerError::Transport(TransportError::Closed)));
        assert_eq!(err.to_string(), "transport closed");
    }

    #[test]
    fn duplicate_names_the_peer() {
        let err = RoomError::Duplicate("alice".into());
        assert!(err.to_string().contains("peerId:alice"));
    }
}
