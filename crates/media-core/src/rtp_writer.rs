//! Sample-clocked RTP writer
//!
//! Packetizes encoded payload into codec-sized frames, one RTP packet per
//! frame, paced by a tokio interval so output rate tracks real time (the
//! interval schedules ticks from its epoch, which absorbs scheduling
//! drift). Sequence numbers are strictly monotonic, the timestamp advances
//! by samples-per-frame per packet, and both survive a session swap:
//! `update_session` continues the sequence and advances the timestamp by
//! the elapsed frames.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::time::{Instant, Interval};
use tracing::trace;

use crate::audio::AudioWriter;
use crate::codec::Codec;
use crate::error::Result;
use crate::packet::{RtpHeader, RtpPacket};
use crate::session::MediaSession;

pub(crate) struct WriterState {
    pub(crate) codec: Codec,
    pub(crate) seq: u16,
    pub(crate) timestamp: u32,
    pub(crate) clock: Option<Interval>,
    pub(crate) first_packet: bool,
    pub(crate) last_write: Option<Instant>,
}

impl WriterState {
    pub(crate) fn tick_clock(&mut self) -> &mut Interval {
        self.clock.get_or_insert_with(|| {
            tokio::time::interval(self.codec.frame_duration)
        })
    }
}

/// Writes codec frames as paced RTP packets over the current session
pub struct RtpWriter {
    session: RwLock<Arc<MediaSession>>,
    ssrc: u32,
    init_timestamp: u32,
    pub(crate) state: tokio::sync::Mutex<WriterState>,
    last_header: Mutex<RtpHeader>,
}

impl RtpWriter {
    /// Writer over `session`'s negotiated audio codec with random SSRC,
    /// sequence and initial timestamp
    pub fn new(session: Arc<MediaSession>) -> Result<RtpWriter> {
        let codec = session.audio_codec()?;
        let init_timestamp = rand::random();
        Ok(RtpWriter {
            session: RwLock::new(session),
            ssrc: rand::random(),
            init_timestamp,
            state: tokio::sync::Mutex::new(WriterState {
                codec,
                seq: rand::random(),
                timestamp: init_timestamp,
                clock: None,
                first_packet: true,
                last_write: None,
            }),
            last_header: Mutex::new(RtpHeader::default()),
        })
    }

    /// Immutable stream identifier
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// The randomly chosen starting timestamp
    pub fn init_timestamp(&self) -> u32 {
        self.init_timestamp
    }

    /// Header of the most recently emitted packet
    pub fn last_header(&self) -> RtpHeader {
        self.last_header.lock().clone()
    }

    /// Write encoded payload, one packet per codec frame
    ///
    /// A trailing partial frame is zero-padded to full length. An empty
    /// buffer emits nothing and returns 0.
    pub async fn write_payload(&self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.state.lock().await;
        let frame_len = state.codec.payload_frame_len();
        let samples = state.codec.samples_per_frame();
        let session = self.session.read().clone();

        let mut written = 0usize;
        let mut frame = vec![0u8; frame_len];
        for chunk in buf.chunks(frame_len) {
            state.tick_clock().tick().await;

            frame[..chunk.len()].copy_from_slice(chunk);
            frame[chunk.len()..].fill(0);

            let header = RtpHeader {
                marker: state.first_packet,
                payload_type: state.codec.payload_type,
                sequence_number: state.seq,
                timestamp: state.timestamp,
                ssrc: self.ssrc,
                ..Default::default()
            };
            let wire = RtpPacket {
                header: header.clone(),
                payload: bytes::Bytes::copy_from_slice(&frame),
            }
            .render();
            session.write_rtp(&wire).await?;

            if crate::rtp_debug_enabled() {
                trace!(
                    seq = header.sequence_number,
                    ts = header.timestamp,
                    pt = header.payload_type,
                    len = frame.len(),
                    "RTP out"
                );
            }

            state.first_packet = false;
            state.seq = state.seq.wrapping_add(1);
            state.timestamp = state.timestamp.wrapping_add(samples);
            state.last_write = Some(Instant::now());
            *self.last_header.lock() = header;
            written += chunk.len();
        }
        Ok(written)
    }

    /// Rebind to a forked session after renegotiation
    ///
    /// The sequence number continues uninterrupted; the timestamp advances
    /// by the frames' worth of samples that elapsed since the last write,
    /// keeping it monotonic across the swap.
    pub async fn update_session(&self, new_session: Arc<MediaSession>) -> Result<()> {
        let mut state = self.state.lock().await;
        let new_codec = new_session.audio_codec()?;

        if let Some(last) = state.last_write {
            let frame_ms = state.codec.frame_duration.as_millis().max(1) as u64;
            let elapsed_frames = (last.elapsed().as_millis() as u64 / frame_ms).max(1) as u32;
            state.timestamp = state
                .timestamp
                .wrapping_add(elapsed_frames.wrapping_mul(state.codec.samples_per_frame()));
        }
        state.codec = new_codec;
        state.clock = None;
        *self.session.write() = new_session;
        Ok(())
    }

    /// The session currently written to
    pub fn session(&self) -> Arc<MediaSession> {
        self.session.read().clone()
    }
}

#[async_trait]
impl AudioWriter for Arc<RtpWriter> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.write_payload(buf).await
    }
}
