//! RTP reader
//!
//! Pulls datagrams off the current session and hands the handler only the
//! payload of packets matching the negotiated audio codec. Telephone-event
//! packets are diverted to an installed DTMF queue and never surface
//! through `read`; anything else is dropped and counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::trace;

use crate::audio::AudioReader;
use crate::codec::Codec;
use crate::error::{MediaError, Result};
use crate::packet::{RtpHeader, RtpPacket};
use crate::session::MediaSession;

const RECV_BUF_LEN: usize = 1500;

#[derive(Debug, Default)]
struct SeqTracker {
    last_seq: Option<u16>,
    received: u64,
    out_of_order: u64,
}

impl SeqTracker {
    fn observe(&mut self, seq: u16) {
        if let Some(last) = self.last_seq {
            let delta = seq.wrapping_sub(last);
            // Anything not a small forward step counts as reordered/old.
            if delta == 0 || delta > u16::MAX / 2 {
                self.out_of_order += 1;
            }
        }
        self.last_seq = Some(seq);
        self.received += 1;
    }

    fn reset(&mut self) {
        self.last_seq = None;
    }
}

struct DtmfDiversion {
    payload_type: u8,
    queue: mpsc::Sender<RtpPacket>,
}

/// Reads the negotiated audio stream from the current session
pub struct RtpReader {
    session: RwLock<Arc<MediaSession>>,
    codec: RwLock<Codec>,
    expected_ssrc: Mutex<Option<u32>>,
    seq: Mutex<SeqTracker>,
    last_header: Mutex<RtpHeader>,
    dtmf: Mutex<Option<DtmfDiversion>>,
    unknown_dropped: AtomicU64,
}

impl RtpReader {
    /// Reader over `session`'s negotiated audio codec
    pub fn new(session: Arc<MediaSession>) -> Result<RtpReader> {
        let codec = session.audio_codec()?;
        Ok(RtpReader {
            session: RwLock::new(session),
            codec: RwLock::new(codec),
            expected_ssrc: Mutex::new(None),
            seq: Mutex::new(SeqTracker::default()),
            last_header: Mutex::new(RtpHeader::default()),
            dtmf: Mutex::new(None),
            unknown_dropped: AtomicU64::new(0),
        })
    }

    /// Header of the most recently accepted packet
    pub fn last_header(&self) -> RtpHeader {
        self.last_header.lock().clone()
    }

    pub fn codec(&self) -> Codec {
        *self.codec.read()
    }

    /// Packets dropped because their payload type matched nothing
    pub fn unknown_dropped(&self) -> u64 {
        self.unknown_dropped.load(Ordering::Relaxed)
    }

    /// Install the DTMF diversion queue for `payload_type`
    pub(crate) fn set_dtmf_diversion(&self, payload_type: u8, queue: mpsc::Sender<RtpPacket>) {
        *self.dtmf.lock() = Some(DtmfDiversion {
            payload_type,
            queue,
        });
    }

    /// Next audio payload into `buf`
    pub async fn read_payload(&self, buf: &mut [u8]) -> Result<usize> {
        let mut raw = [0u8; RECV_BUF_LEN];
        loop {
            let session = self.session.read().clone();
            let n = match session.read_rtp(&mut raw).await {
                Ok(n) => n,
                Err(MediaError::Eof) => {
                    // Closing the diversion lets the DTMF delivery task end.
                    *self.dtmf.lock() = None;
                    return Err(MediaError::Eof);
                }
                Err(e) => return Err(e),
            };
            let packet = match RtpPacket::parse(&raw[..n]) {
                Ok(p) => p,
                Err(e) => {
                    trace!(error = %e, "dropping non-RTP datagram");
                    continue;
                }
            };

            let codec = *self.codec.read();
            if packet.header.payload_type == codec.payload_type {
                self.track(&packet.header);
                let len = packet.payload.len().min(buf.len());
                buf[..len].copy_from_slice(&packet.payload[..len]);
                if crate::rtp_debug_enabled() {
                    trace!(
                        seq = packet.header.sequence_number,
                        ts = packet.header.timestamp,
                        len,
                        "RTP in"
                    );
                }
                return Ok(len);
            }

            let diverted = {
                let dtmf = self.dtmf.lock();
                match dtmf.as_ref() {
                    Some(d) if d.payload_type == packet.header.payload_type => {
                        // A full queue drops the event rather than the audio.
                        let _ = d.queue.try_send(packet);
                        true
                    }
                    _ => false,
                }
            };
            if !diverted {
                self.unknown_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn track(&self, header: &RtpHeader) {
        let mut ssrc = self.expected_ssrc.lock();
        match *ssrc {
            Some(expected) if expected != header.ssrc => {
                // Stream restarted with a new SSRC; follow it.
                *ssrc = Some(header.ssrc);
                self.seq.lock().reset();
            }
            None => *ssrc = Some(header.ssrc),
            _ => {}
        }
        drop(ssrc);
        self.seq.lock().observe(header.sequence_number);
        *self.last_header.lock() = header.clone();
    }

    /// Rebind to a forked session; sequence and SSRC tracking reset
    pub fn update_session(&self, new_session: Arc<MediaSession>) -> Result<()> {
        let codec = new_session.audio_codec()?;
        let dtmf_pt = new_session.dtmf_codec().map(|c| c.payload_type);
        let mut session = self.session.write();
        *self.codec.write() = codec;
        if let (Some(pt), Some(diversion)) = (dtmf_pt, self.dtmf.lock().as_mut()) {
            diversion.payload_type = pt;
        }
        *session = new_session;
        self.seq.lock().reset();
        *self.expected_ssrc.lock() = None;
        Ok(())
    }

    /// The session currently read from
    pub fn session(&self) -> Arc<MediaSession> {
        self.session.read().clone()
    }
}

#[async_trait]
impl AudioReader for Arc<RtpReader> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.read_payload(buf).await
    }
}
