//! Error kinds of the transport and protocol layers.
//!
//! Transport-local failures are recovered into synthesized responses where a
//! pending call exists, so the single completion path of the registry
//! applies; everything here is what surfaces to callers directly.

use std::io;

/// Failures of the remoting stack: bind, connect, io, codec, limits and
/// channel lifecycle. Application errors never appear here, they travel
/// inside response payloads as [RpcError::Biz].
#[derive(Debug, thiserror::Error)]
pub enum RemotingError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to connect {addr}: {reason}")]
    Connect { addr: String, reason: String },
    #[error("io error on channel {peer}: {source}")]
    Io {
        peer: String,
        #[source]
        source: io::Error,
    },
    #[error("codec error: {0}")]
    Codec(String),
    /// Fail-fast guard on both encode and decode of a frame body.
    #[error("data length {size} exceeds payload limit {limit}")]
    PayloadLimit { size: usize, limit: usize },
    /// The channel refused the operation because it is closed or readonly.
    #[error("channel {peer} is closed")]
    ChannelClosed { peer: String },
    /// Synthesized terminal state of calls in flight when a channel died.
    #[error("channel inactive: {0}")]
    ChannelInactive(String),
    #[error("{0}")]
    Timeout(#[from] TimeoutError),
    #[error("unsupported message: {0}")]
    UnsupportedMessage(String),
    #[error("service not found: {0}")]
    ServiceNotFound(String),
    #[error("service already exported: {0}")]
    DuplicateExport(String),
    /// Remote peer answered with a non-OK exchange status.
    #[error("remote fault ({status}): {message}")]
    Fault { status: &'static str, message: String },
}

impl RemotingError {
    pub fn io(peer: &str, source: io::Error) -> Self {
        Self::Io { peer: peer.to_string(), source }
    }

    pub fn closed(peer: &str) -> Self {
        Self::ChannelClosed { peer: peer.to_string() }
    }
}

/// Which deadline fired for a timed-out call.
///
/// Client side means the request never left the send buffer before the
/// deadline; server side means it was sent and the reply did not come back
/// in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
pub enum TimeoutSide {
    #[strum(serialize = "client")]
    Client,
    #[strum(serialize = "server")]
    Server,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{side}-side timeout: {message}")]
pub struct TimeoutError {
    pub side: TimeoutSide,
    pub message: String,
}

/// The caller-facing split between application failures carried in response
/// payloads and stack failures. Biz errors are terminal at this layer: no
/// retry, no fallback.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("{0}")]
    Biz(String),
    #[error(transparent)]
    Remoting(#[from] RemotingError),
}

impl RpcError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Remoting(RemotingError::Timeout(_)))
    }

    pub fn timeout_side(&self) -> Option<TimeoutSide> {
        match self {
            Self::Remoting(RemotingError::Timeout(t)) => Some(t.side),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let e = RemotingError::PayloadLimit { size: 100, limit: 10 };
        assert_eq!(e.to_string(), "data length 100 exceeds payload limit 10");
        let t = TimeoutError { side: TimeoutSide::Server, message: "elapsed 12 ms".to_string() };
        assert!(t.to_string().starts_with("server-side timeout"));
        let rpc: RpcError = RemotingError::Timeout(t).into();
        assert!(rpc.is_timeout());
        assert_eq!(rpc.timeout_side(), Some(TimeoutSide::Server));
    }
}
