//! Media layer errors
//!
//! The media path distinguishes two "flow control" conditions from real
//! failures: [`MediaError::Eof`] (the stream is finished, wind down) and
//! [`MediaError::Timeout`] (a read/write deadline elapsed). Copy helpers
//! translate Timeout into a clean end of stream so a torn-down peer never
//! surfaces as an error to the handler.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MediaError>;

/// Errors produced by sessions, readers, writers and playback
#[derive(Debug, Error)]
pub enum MediaError {
    /// The stream or session has ended
    #[error("end of stream")]
    Eof,

    /// A read or write deadline elapsed
    #[error("media deadline elapsed")]
    Timeout,

    /// Payload type is not in the registry
    #[error("unknown codec for payload type {0}")]
    UnknownCodec(u8),

    /// Codec is registered but the operation cannot handle it
    #[error("unsupported codec {0}")]
    UnsupportedCodec(&'static str),

    /// Remote SDP could not be parsed
    #[error("malformed SDP: {0}")]
    MalformedSdp(String),

    /// Offer/answer produced an empty codec intersection
    #[error("no compatible codec in remote offer")]
    NoCompatibleCodec,

    /// RTP/RTCP port pair could not be bound
    #[error("failed to bind RTP port pair: {0}")]
    Bind(String),

    /// Socket level failure
    #[error("media I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Datagram did not parse as RTP/RTCP
    #[error("malformed {kind} packet: {reason}")]
    MalformedPacket {
        kind: &'static str,
        reason: String,
    },

    /// The session has no remote endpoint yet
    #[error("remote media address not negotiated")]
    NoRemoteAddress,

    /// WAV stream rejected
    #[error("unsupported WAV content: {0}")]
    InvalidWav(String),

    /// Playback HTTP source failure
    #[error("playback fetch failed: {0}")]
    Fetch(String),

    /// Caller misuse that is recoverable by fixing the call site
    #[error("{0}")]
    Usage(&'static str),
}

impl MediaError {
    /// True when the error means "stream finished", not "stream broken"
    pub fn is_clean_shutdown(&self) -> bool {
        matches!(self, MediaError::Eof | MediaError::Timeout)
    }
}
