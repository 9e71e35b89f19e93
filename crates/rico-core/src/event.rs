use bytes::Bytes;
use std::fmt;

/// Identifier of one multiplexed stream within a connection.
///
/// Link adapters allocate these monotonically in QUIC client-initiated
/// bidirectional spacing (0, 4, 8, ...). An identifier is never reused while
/// a request on it is still pending.
pub type StreamId = u64;

/// A signal delivered by the transport to the layer above.
///
/// Consumers must match exhaustively: `StreamData` drives correlation, every
/// other kind is passed through to a lifecycle hook untouched rather than
/// silently dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A complete message arrived on a stream.
    StreamData { stream: StreamId, payload: Bytes },
    /// The encrypted transport finished its handshake.
    HandshakeConfirmed,
    /// The underlying connection terminated; no further events follow.
    Closed { reason: CloseReason },
}

/// Why a connection went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the connection, possibly with an application reason.
    ByPeer(String),
    /// The connection idled out.
    TimedOut,
    /// This endpoint closed the connection.
    LocallyClosed,
    /// The transport reported a protocol-level failure.
    Transport(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ByPeer(reason) if reason.is_empty() => write!(f, "closed by peer"),
            CloseReason::ByPeer(reason) => write!(f, "closed by peer: {reason}"),
            CloseReason::TimedOut => write!(f, "connection timed out"),
            CloseReason::LocallyClosed => write!(f, "closed locally"),
            CloseReason::Transport(reason) => write!(f, "transport failure: {reason}"),
        }
    }
}
