//! Error codes surfaced by the connection and TCP layers.
//!
//! Errors are plain `Copy` enums, returned through `Result` at public entry
//! points only.  Internal list and address helpers return `bool`/`Option`
//! and trust the validation done by their caller.

/// Connection-layer errors visible to the application and IP layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    /// No free connection records (the only retryable condition)
    PoolEmpty,
    /// The connection id is out of range or not currently in use
    InvalidHandle,
    /// Requested address has not been set on the connection
    NotFound,
    /// Address already set and overwrite was not requested
    AlreadyExists,
    /// Malformed parameter or out-of-range configuration value
    InvalidArg,
    /// Operation not permitted in the connection's current TCP state
    InvalidState,
    /// Queue wait expired
    Timeout,
    /// Non-blocking operation could not make progress
    WouldBlock,
    /// Connection has been closed by the transport layer
    ConnClosed,
    /// Connection was reset by the peer
    ConnReset,
    /// IP layer refused to transmit
    TxFailed,
}

/// Result type for connection-layer operations
pub type NetResult<T> = Result<T, NetError>;

impl core::fmt::Display for NetError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            NetError::PoolEmpty => "connection pool empty",
            NetError::InvalidHandle => "invalid connection handle",
            NetError::NotFound => "address not set",
            NetError::AlreadyExists => "address already set",
            NetError::InvalidArg => "invalid argument",
            NetError::InvalidState => "invalid connection state",
            NetError::Timeout => "timed out",
            NetError::WouldBlock => "operation would block",
            NetError::ConnClosed => "connection closed",
            NetError::ConnReset => "connection reset",
            NetError::TxFailed => "transmit failed",
        };
        f.write_str(msg)
    }
}

impl NetError {
    /// Whether the caller should retry the request later with backoff
    /// rather than treat it as a hard failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NetError::PoolEmpty)
    }
}
