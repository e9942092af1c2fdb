//! DTMF over RTP (RFC 4733 telephone-event)
//!
//! The reader side drains the diversion queue the RTP reader fills with
//! telephone-event packets, deduplicates the redundant end packets and
//! delivers one rune per key press. The writer side emits the standard
//! begin/end packet train on the negotiated event payload type, paced by
//! the RTP writer's sample clock.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::codec::TELEPHONE_EVENT_PT;
use crate::error::{MediaError, Result};
use crate::packet::{RtpHeader, RtpPacket};
use crate::rtp_reader::RtpReader;
use crate::rtp_writer::RtpWriter;

/// Queue depth for pending, not yet delivered events
const EVENT_QUEUE_DEPTH: usize = 32;

/// Begin packets emitted per digit
const DEFAULT_BEGIN_PACKETS: u16 = 3;
/// End packets emitted per digit (redundancy per RFC 4733 2.5.1.4)
const END_PACKETS: u16 = 3;

/// One decoded telephone-event payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtmfEvent {
    pub event: u8,
    pub end: bool,
    pub volume: u8,
    pub duration: u16,
}

impl DtmfEvent {
    /// Decode the 4-byte event payload
    pub fn decode(payload: &[u8]) -> Result<DtmfEvent> {
        if payload.len() < 4 {
            return Err(MediaError::MalformedPacket {
                kind: "telephone-event",
                reason: format!("{} bytes", payload.len()),
            });
        }
        Ok(DtmfEvent {
            event: payload[0],
            end: payload[1] & 0x80 != 0,
            volume: payload[1] & 0x3F,
            duration: u16::from_be_bytes([payload[2], payload[3]]),
        })
    }

    /// Encode to the 4-byte event payload
    pub fn encode(&self) -> [u8; 4] {
        let duration = self.duration.to_be_bytes();
        [
            self.event,
            ((self.end as u8) << 7) | (self.volume & 0x3F),
            duration[0],
            duration[1],
        ]
    }
}

/// Map an event code to its keypad rune
pub fn event_to_char(event: u8) -> Option<char> {
    match event {
        0..=9 => Some((b'0' + event) as char),
        10 => Some('*'),
        11 => Some('#'),
        12..=15 => Some((b'A' + event - 12) as char),
        _ => None,
    }
}

/// Map a keypad rune to its event code
pub fn char_to_event(c: char) -> Option<u8> {
    match c {
        '0'..='9' => Some(c as u8 - b'0'),
        '*' => Some(10),
        '#' => Some(11),
        'A'..='D' => Some(c as u8 - b'A' + 12),
        'a'..='d' => Some(c as u8 - b'a' + 12),
        _ => None,
    }
}

/// Receives digits diverted from an [`RtpReader`]
pub struct DtmfReader {
    queue: mpsc::Receiver<RtpPacket>,
    last_end: Option<(u8, u32)>,
}

impl DtmfReader {
    /// Attach to `reader`, diverting the negotiated telephone-event payload
    /// type (the default 101 when none was negotiated)
    pub fn new(reader: &RtpReader) -> DtmfReader {
        let payload_type = reader
            .session()
            .dtmf_codec()
            .map(|c| c.payload_type)
            .unwrap_or(TELEPHONE_EVENT_PT);
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        reader.set_dtmf_diversion(payload_type, tx);
        DtmfReader {
            queue: rx,
            last_end: None,
        }
    }

    /// Next digit; None when the underlying reader reached EOF
    ///
    /// Only end-flagged packets deliver a digit, and the redundant end
    /// packets of one event (same event code and RTP timestamp) collapse
    /// into a single delivery.
    pub async fn recv(&mut self) -> Option<char> {
        while let Some(packet) = self.queue.recv().await {
            let Ok(event) = DtmfEvent::decode(&packet.payload) else {
                continue;
            };
            if !event.end {
                continue;
            }
            let key = (event.event, packet.header.timestamp);
            if self.last_end == Some(key) {
                continue;
            }
            self.last_end = Some(key);
            if let Some(c) = event_to_char(event.event) {
                return Some(c);
            }
        }
        None
    }

    /// Deliver digits to `on_digit` from a background task until the
    /// underlying reader ends
    pub fn on_dtmf<F>(mut self, mut on_digit: F) -> JoinHandle<()>
    where
        F: FnMut(char) + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(digit) = self.recv().await {
                debug!(%digit, "DTMF received");
                on_digit(digit);
            }
        })
    }
}

/// Emits RFC 4733 digit trains through an [`RtpWriter`]
pub struct DtmfWriter {
    writer: Arc<RtpWriter>,
    payload_type: u8,
    begin_packets: u16,
}

impl DtmfWriter {
    /// Writer on the negotiated telephone-event payload type
    pub fn new(writer: Arc<RtpWriter>) -> DtmfWriter {
        let payload_type = writer
            .session()
            .dtmf_codec()
            .map(|c| c.payload_type)
            .unwrap_or(TELEPHONE_EVENT_PT);
        DtmfWriter {
            writer,
            payload_type,
            begin_packets: DEFAULT_BEGIN_PACKETS,
        }
    }

    pub fn set_begin_packets(&mut self, count: u16) {
        self.begin_packets = count.max(1);
    }

    /// Send one digit: begin packets with increasing duration, then the
    /// redundant end packets, all sample-clocked
    pub async fn write_digit(&self, digit: char) -> Result<()> {
        let event = char_to_event(digit)
            .ok_or(MediaError::Usage("not a DTMF digit"))?;

        let writer = &self.writer;
        let mut state = writer.state.lock().await;
        let samples = state.codec.samples_per_frame();
        let event_timestamp = state.timestamp;
        let session = writer.session();

        let total_packets = self.begin_packets + END_PACKETS;
        for i in 0..total_packets {
            state.tick_clock().tick().await;

            let is_end = i >= self.begin_packets;
            let duration = if is_end {
                samples as u16 * (self.begin_packets + 1)
            } else {
                samples as u16 * (i + 1)
            };
            let payload = DtmfEvent {
                event,
                end: is_end,
                volume: 10,
                duration,
            }
            .encode();

            let header = RtpHeader {
                // Marker only on the first packet of the event.
                marker: i == 0,
                payload_type: self.payload_type,
                sequence_number: state.seq,
                timestamp: event_timestamp,
                ssrc: writer.ssrc(),
                ..Default::default()
            };
            let wire = RtpPacket {
                header,
                payload: bytes::Bytes::copy_from_slice(&payload),
            }
            .render();
            session.write_rtp(&wire).await?;
            state.seq = state.seq.wrapping_add(1);
        }

        // The event occupied real time; keep the audio timestamp monotonic
        // past it.
        let total_duration = samples.wrapping_mul((self.begin_packets + 1) as u32);
        state.timestamp = state.timestamp.wrapping_add(total_duration);
        state.last_write = Some(tokio::time::Instant::now());
        debug!(%digit, "DTMF sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_payload_round_trip() {
        let event = DtmfEvent {
            event: 11,
            end: true,
            volume: 12,
            duration: 640,
        };
        assert_eq!(DtmfEvent::decode(&event.encode()).unwrap(), event);
    }

    #[test]
    fn digit_mapping_covers_the_keypad() {
        assert_eq!(char_to_event('0'), Some(0));
        assert_eq!(char_to_event('9'), Some(9));
        assert_eq!(char_to_event('*'), Some(10));
        assert_eq!(char_to_event('#'), Some(11));
        assert_eq!(char_to_event('D'), Some(15));
        assert_eq!(char_to_event('x'), None);
        for code in 0..16 {
            let c = event_to_char(code).unwrap();
            assert_eq!(char_to_event(c), Some(code));
        }
        assert_eq!(event_to_char(16), None);
    }

    #[test]
    fn short_payload_is_rejected() {
        assert!(DtmfEvent::decode(&[1, 2]).is_err());
    }
}
