//! Error taxonomy for the DNS tunneling transport.

use thiserror::Error;

/// Errors raised by the session, framer, resolver, and worker pool.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// A would-be FQDN violates DNS label or total-length limits.
    #[error("message too long to fit in a single FQDN")]
    MsgTooLong,

    /// The handshake did not yield a non-zero 24-bit session id.
    #[error("invalid DNS session id")]
    InvalidDNSSessionID,

    /// Zero resolvers were configured, or zero survived fingerprinting.
    #[error("no resolvers available")]
    NoResolvers,

    /// A resolver call exhausted its retry budget.
    #[error("resolver query timed out")]
    Timeout,

    /// The session has been closed.
    #[error("session is closed")]
    Closed,

    /// A framing record failed to deserialize, had the wrong type, or
    /// failed authentication.
    #[error("invalid response from controller")]
    InvalidResponse,

    /// A downlink fragment declared offsets outside `[0, size]`.
    #[error("fragment declared an out-of-range offset")]
    InvalidIndex,

    /// Underlying socket or filesystem failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_stable() {
        assert_eq!(TunnelError::NoResolvers.to_string(), "no resolvers available");
        assert_eq!(TunnelError::Closed.to_string(), "session is closed");
    }

    #[test]
    fn io_error_converts_via_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "boom");
        let err: TunnelError = io_err.into();
        assert!(matches!(err, TunnelError::Io(_)));
    }
}
