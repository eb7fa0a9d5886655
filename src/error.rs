//! Error types for the connection engine.
//!
//! Low-level failures (socket, TLS, SOCKS, framing) are [`NetError`].
//! Authentication failures are [`SaslError`] and never tear down the
//! connection on their own. Everything that reaches the caller of
//! [`ConnectionManager::connect`](crate::manager::ConnectionManager::connect)
//! is folded into a single [`ConnError`] carrying a human-readable reason.

use thiserror::Error;

use crate::reconnect::Action;

/// Convenience type alias for Results using [`NetError`].
pub type Result<T, E = NetError> = std::result::Result<T, E>;

/// Transport and framing errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum NetError {
    /// I/O error during reading or writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A network phase did not complete within its budget.
    #[error("timed out while {0}")]
    Timeout(&'static str),

    /// Name resolution produced no candidate addresses.
    #[error("unable to resolve {host}:{port}")]
    Resolve {
        /// Requested host.
        host: String,
        /// Requested port.
        port: String,
    },

    /// Every resolved address refused or timed out.
    #[error("no address reachable")]
    NoAddressReachable,

    /// SOCKS5 negotiation failed.
    #[error("SOCKS: {0}")]
    Socks(String),

    /// TLS handshake or verification failure.
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// The server name is not usable for TLS.
    #[error("invalid server name: {0}")]
    InvalidServerName(String),

    /// An assembled message exceeded the configured cap.
    #[error("message too long: {actual} bytes (limit: {limit})")]
    MessageTooLong {
        /// Bytes buffered so far.
        actual: usize,
        /// Configured maximum.
        limit: usize,
    },

    /// A control-channel reply did not start with a valid code.
    #[error("malformed reply: {0}")]
    MalformedReply(String),

    /// Peer closed the connection.
    #[error("connection closed by peer")]
    ConnectionClosed,
}

impl NetError {
    /// Returns true if this error came from certificate name validation.
    pub fn is_hostname_mismatch(&self) -> bool {
        matches!(
            self,
            NetError::Tls(rustls::Error::InvalidCertificate(
                rustls::CertificateError::NotValidForName
                    | rustls::CertificateError::NotValidForNameContext { .. }
            ))
        )
    }
}

/// Errors that can occur during SASL authentication.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum SaslError {
    /// Base64 or UTF-8 decoding failed.
    #[error("invalid encoding")]
    InvalidEncoding,
    /// Server nonce doesn't extend the client nonce.
    #[error("server nonce doesn't match client nonce")]
    NonceMismatch,
    /// Missing nonce in server message.
    #[error("missing nonce in server message")]
    MissingNonce,
    /// Missing salt in server message.
    #[error("missing salt in server message")]
    MissingSalt,
    /// Missing iteration count in server message.
    #[error("missing iteration count")]
    MissingIterations,
    /// Invalid iteration count.
    #[error("invalid iteration count")]
    InvalidIterations,
    /// Server signature did not match the expected value.
    #[error("server verification failed")]
    ServerVerificationFailed,
    /// A message arrived in a state that cannot accept it.
    #[error("unexpected message in state {0}")]
    UnexpectedMessage(&'static str),
    /// Username or password not configured.
    #[error("missing SASL credentials")]
    MissingCredentials,
    /// Private key could not be loaded or written.
    #[error("key error: {0}")]
    Key(String),
    /// Cryptographic primitive failure.
    #[error("crypto error: {0}")]
    Crypto(String),
}

/// Errors raised while loading or validating [`Config`](crate::config::Config).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid TOML for this schema.
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// An integer setting is outside its permitted range.
    #[error("{key} = {value} is out of range ({min}..={max})")]
    OutOfRange {
        /// Setting name.
        key: &'static str,
        /// Offending value.
        value: u64,
        /// Lower bound.
        min: u64,
        /// Upper bound.
        max: u64,
    },
}

/// Outcome of a failed [`connect`](crate::manager::ConnectionManager::connect).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConnError {
    /// Another attempt holds the in-flight flag.
    #[error("connection attempt already in progress")]
    AlreadyInProgress,

    /// A session is already established.
    #[error("already connected")]
    AlreadyConnected,

    /// A user disconnect interrupted the attempt; the policy is untouched.
    #[error("connection attempt cancelled")]
    Cancelled,

    /// The attempt failed; `action` is what the reconnect policy decided.
    #[error("{reason}")]
    Failed {
        /// Human-readable reason shown to the user.
        reason: String,
        /// Retry decision taken for this failure.
        action: Action,
    },
}

impl ConnError {
    /// Human-readable reason.
    pub fn reason(&self) -> String {
        self.to_string()
    }

    /// Retry decision, if the policy was consulted.
    pub fn action(&self) -> Option<Action> {
        match self {
            ConnError::AlreadyInProgress | ConnError::AlreadyConnected | ConnError::Cancelled => None,
            ConnError::Failed { action, .. } => Some(*action),
        }
    }
}
