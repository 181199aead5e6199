use thiserror::Error;

/// Errors produced by the RPC runtime, on both the client and server side.
///
/// Transport and protocol errors are fatal to the connection they occur on;
/// everything else is carried in-band as a `FAIL` reply and surfaced to the
/// caller as [`RpcError::Remote`].
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("msgpack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("msgpack decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("msgpack value error: {0}")]
    ValueDecode(#[from] rmpv::ext::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer closed the connection cleanly.
    #[error("connection closed")]
    ConnectionClosed,

    /// A call was attempted while the client is disconnected.
    #[error("not connected")]
    NotConnected,

    /// The caller's deadline expired before a reply arrived.
    #[error("call timed out")]
    Timeout,

    /// The server answered with a failure reply; the message comes from the
    /// remote side (unknown function, argument mismatch, handler error).
    #[error("remote error: {0}")]
    Remote(String),
}

pub type Result<T> = std::result::Result<T, RpcError>;
