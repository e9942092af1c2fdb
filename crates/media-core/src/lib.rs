//! voxide-media-core
//!
//! Real-time media for the voxide stack: the codec registry, RTP/RTCP
//! framing, media sessions with SDP offer/answer, the sample-clocked RTP
//! reader/writer pair, RFC 4733 DTMF, the composable audio pipeline and the
//! playback/recording engines. The `voxide` crate couples all of this to
//! SIP dialogs.

pub mod audio;
pub mod codec;
pub mod dtmf;
pub mod error;
pub mod g711;
pub mod packet;
pub mod playback;
pub mod recording;
pub mod rtcp;
pub mod rtp_reader;
pub mod rtp_writer;
pub mod sdp;
pub mod session;
pub mod wav;

pub use audio::{
    copy_audio, AudioControl, AudioReader, AudioWriter, ControlledReader, ControlledWriter,
    PcmDecoderReader, PcmEncoderWriter,
};
pub use codec::{Codec, FRAME_DURATION, PCMA, PCMU, TELEPHONE_EVENT, TELEPHONE_EVENT_PT};
pub use dtmf::{char_to_event, event_to_char, DtmfEvent, DtmfReader, DtmfWriter};
pub use error::{MediaError, Result};
pub use packet::{RtpHeader, RtpPacket};
pub use playback::AudioPlayback;
pub use recording::{Recording, RecordingReader, RecordingWriter};
pub use rtcp::{NtpTimestamp, ReceiverReport, RtcpPacket, SenderReport};
pub use rtp_reader::RtpReader;
pub use rtp_writer::RtpWriter;
pub use sdp::{intersect_codecs, SdpMode, SessionDescription};
pub use session::{MediaSession, RtpScope};
pub use wav::{WavFormat, WavStream};

use std::sync::OnceLock;

/// Whether RTP_DEBUG per-packet tracing is enabled
pub fn rtp_debug_enabled() -> bool {
    static FLAG: OnceLock<bool> = OnceLock::new();
    *FLAG.get_or_init(|| env_flag("RTP_DEBUG"))
}

/// Whether RTCP_DEBUG per-packet tracing is enabled
pub fn rtcp_debug_enabled() -> bool {
    static FLAG: OnceLock<bool> = OnceLock::new();
    *FLAG.get_or_init(|| env_flag("RTCP_DEBUG"))
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| {
            let v = v.trim().to_ascii_lowercase();
            !v.is_empty() && v != "0" && v != "false" && v != "off"
        })
        .unwrap_or(false)
}
