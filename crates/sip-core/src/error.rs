//! Error types for the SIP layer

use thiserror::Error;

/// Result type used throughout the SIP layer
pub type Result<T> = std::result::Result<T, SipError>;

/// Errors produced by parsing, transports, transactions and dialogs
#[derive(Debug, Error)]
pub enum SipError {
    /// Message could not be parsed as SIP
    #[error("failed to parse SIP message: {0}")]
    Parse(String),

    /// A required header is absent
    #[error("missing {0} header")]
    MissingHeader(&'static str),

    /// A header is present but malformed
    #[error("malformed {header} header: {reason}")]
    MalformedHeader {
        header: &'static str,
        reason: String,
    },

    /// Socket level failure
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// No transport is bound that can reach the destination
    #[error("no {0} transport bound")]
    NoTransport(&'static str),

    /// Transaction timed out waiting for a response (64*T1)
    #[error("transaction timed out")]
    TransactionTimeout,

    /// Transaction was terminated before a final response arrived
    #[error("transaction terminated")]
    TransactionTerminated,

    /// The dialog was terminated while an operation was pending
    #[error("dialog terminated")]
    DialogTerminated,

    /// Digest challenge could not be answered
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// A response arrived that the caller cannot act on
    #[error("unexpected response: {code} {reason}")]
    UnexpectedResponse { code: u16, reason: String },
}
