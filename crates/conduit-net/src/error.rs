use std::io;

use thiserror::Error;

/// Errors surfaced by the connection core itself, distinct from the
/// reason a connection eventually closes (see [`CloseReason`]).
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    #[error("buffer or context pool exhausted")]
    PoolExhausted,
    #[error("receive_async called with a registration already outstanding")]
    ConsumerAlreadyRegistered,
}

/// Why a [`Connection`](crate::Connection) transitioned to `Closed`.
///
/// Delivered exactly once to the `connection_closed` listener bound at
/// construction.
#[derive(Debug)]
pub enum CloseReason {
    /// `close()` was called explicitly.
    Requested,
    /// The peer performed an orderly shutdown (a zero-byte receive).
    PeerClosed,
    /// A non-success socket error occurred on send, receive, or init.
    Transport(io::Error),
}

impl CloseReason {
    /// True for the two reasons that do not represent a transport failure.
    pub fn is_success(&self) -> bool {
        matches!(self, CloseReason::Requested | CloseReason::PeerClosed)
    }
}
