//! Codec registry
//!
//! A fixed table of the audio formats voxide negotiates: G.711 µ-law and
//! A-law plus RFC 4733 telephone-event. The table is process-wide and
//! read-only; there is no dynamic registration during a call.

use std::time::Duration;

use crate::error::{MediaError, Result};

/// Default payload type for telephone-event/8000
pub const TELEPHONE_EVENT_PT: u8 = 101;

/// Canonical packetization interval
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// One entry of the codec registry
///
/// Holds the timing and sizing constants the RTP path needs:
/// `frame_duration * sample_rate * channels * 2 / 1s == pcm_frame_len`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Codec {
    pub payload_type: u8,
    pub sample_rate: u32,
    pub num_channels: u8,
    pub frame_duration: Duration,
    kind: CodecKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum CodecKind {
    Pcmu,
    Pcma,
    TelephoneEvent,
}

/// G.711 µ-law, static payload type 0
pub const PCMU: Codec = Codec {
    payload_type: 0,
    sample_rate: 8000,
    num_channels: 1,
    frame_duration: FRAME_DURATION,
    kind: CodecKind::Pcmu,
};

/// G.711 A-law, static payload type 8
pub const PCMA: Codec = Codec {
    payload_type: 8,
    sample_rate: 8000,
    num_channels: 1,
    frame_duration: FRAME_DURATION,
    kind: CodecKind::Pcma,
};

/// RFC 4733 telephone-event at the default dynamic payload type
pub const TELEPHONE_EVENT: Codec = Codec {
    payload_type: TELEPHONE_EVENT_PT,
    sample_rate: 8000,
    num_channels: 1,
    frame_duration: FRAME_DURATION,
    kind: CodecKind::TelephoneEvent,
};

/// Registry order doubles as the default local preference
pub const REGISTRY: [Codec; 3] = [PCMU, PCMA, TELEPHONE_EVENT];

impl Codec {
    /// Look up a registry entry by payload type
    pub fn from_payload_type(pt: u8) -> Result<Codec> {
        REGISTRY
            .iter()
            .find(|c| c.payload_type == pt)
            .copied()
            .ok_or(MediaError::UnknownCodec(pt))
    }

    /// Match an SDP rtpmap (name/clock/channels) to a registry entry,
    /// adopting the remote's dynamic payload type
    pub fn from_rtpmap(pt: u8, name: &str, clock: u32, channels: u8) -> Option<Codec> {
        let kind = match name.to_ascii_uppercase().as_str() {
            "PCMU" => CodecKind::Pcmu,
            "PCMA" => CodecKind::Pcma,
            "TELEPHONE-EVENT" => CodecKind::TelephoneEvent,
            _ => return None,
        };
        let template = REGISTRY.iter().find(|c| c.kind == kind)?;
        if template.sample_rate != clock || template.num_channels != channels {
            return None;
        }
        let mut codec = *template;
        codec.payload_type = pt;
        Some(codec)
    }

    /// SDP encoding name
    pub fn name(&self) -> &'static str {
        match self.kind {
            CodecKind::Pcmu => "PCMU",
            CodecKind::Pcma => "PCMA",
            CodecKind::TelephoneEvent => "telephone-event",
        }
    }

    /// True for the RFC 4733 event pseudo-codec
    pub fn is_telephone_event(&self) -> bool {
        self.kind == CodecKind::TelephoneEvent
    }

    /// True for audio-carrying codecs
    pub fn is_audio(&self) -> bool {
        !self.is_telephone_event()
    }

    /// RTP timestamp units (samples) per frame
    pub fn samples_per_frame(&self) -> u32 {
        (self.sample_rate / 1000) * self.frame_duration.as_millis() as u32
    }

    /// Bytes of 16-bit PCM per frame
    pub fn pcm_frame_len(&self) -> usize {
        self.samples_per_frame() as usize * self.num_channels as usize * 2
    }

    /// Bytes of encoded payload per frame (G.711 is one byte per sample)
    pub fn payload_frame_len(&self) -> usize {
        self.samples_per_frame() as usize * self.num_channels as usize
    }

    /// Compand one 16-bit linear sample into this codec's wire form
    pub fn encode_sample(&self, sample: i16) -> Result<u8> {
        match self.kind {
            CodecKind::Pcmu => Ok(crate::g711::linear_to_ulaw(sample)),
            CodecKind::Pcma => Ok(crate::g711::linear_to_alaw(sample)),
            CodecKind::TelephoneEvent => Err(MediaError::UnsupportedCodec("telephone-event")),
        }
    }

    /// Expand one companded sample into 16-bit linear PCM
    pub fn decode_sample(&self, code: u8) -> Result<i16> {
        match self.kind {
            CodecKind::Pcmu => Ok(crate::g711::ulaw_to_linear(code)),
            CodecKind::Pcma => Ok(crate::g711::alaw_to_linear(code)),
            CodecKind::TelephoneEvent => Err(MediaError::UnsupportedCodec("telephone-event")),
        }
    }

    /// Two codecs carry interchangeable media (payload type aside)
    pub fn is_compatible(&self, other: &Codec) -> bool {
        self.kind == other.kind
            && self.sample_rate == other.sample_rate
            && self.num_channels == other.num_channels
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.name(), self.sample_rate)
    }
}
