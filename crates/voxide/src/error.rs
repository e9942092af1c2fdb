//! Framework level errors

use thiserror::Error;
use voxide_media_core::MediaError;
use voxide_sip_core::SipError;

pub type Result<T> = std::result::Result<T, VoxideError>;

/// Errors surfaced to handlers by dialog sessions, the endpoint and bridges
#[derive(Debug, Error)]
pub enum VoxideError {
    #[error(transparent)]
    Sip(#[from] SipError),

    #[error(transparent)]
    Media(#[from] MediaError),

    /// Offer/answer failed; the dialog is torn down
    #[error("no compatible media")]
    NoCompatibleMedia,

    /// 200 was sent but the peer never acknowledged it
    #[error("no ACK received for answer")]
    NoAck,

    /// The INVITE was rejected with a final non-2xx response
    #[error("call rejected: {code} {reason}")]
    CallRejected { code: u16, reason: String },

    /// An operation does not fit the session's current state
    #[error("invalid state for operation: {0}")]
    InvalidState(&'static str),

    /// The request carried no SDP where one was required
    #[error("missing SDP body")]
    MissingSdp,

    /// Bridge membership or codec constraint violated
    #[error("{0}")]
    Bridge(String),

    /// In-dialog request for an unknown dialog
    #[error("dialog does not exist")]
    DialogNotFound,
}
