//! RTCP packets (RFC 3550)
//!
//! Enough of SR/RR/SDES/BYE to feed the session's control-channel loop and
//! the handler's `on_rtcp` callback, and to emit periodic sender reports.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{MediaError, Result};

pub const RTCP_VERSION: u8 = 2;

/// RTCP packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RtcpPacketType {
    SenderReport = 200,
    ReceiverReport = 201,
    SourceDescription = 202,
    Goodbye = 203,
    ApplicationDefined = 204,
}

/// NTP timestamp (64 bits, seconds since 1900)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NtpTimestamp {
    pub seconds: u32,
    pub fraction: u32,
}

impl NtpTimestamp {
    /// Current wall-clock time as NTP
    pub fn now() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0));
        // NTP epoch is 1900; UNIX epoch is 70 years later.
        let seconds = (now.as_secs() + 2_208_988_800) as u32;
        let fraction = (now.subsec_nanos() as u64 * 0x1_0000_0000 / 1_000_000_000) as u32;
        NtpTimestamp { seconds, fraction }
    }
}

/// One report block from an SR or RR
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReportBlock {
    pub ssrc: u32,
    pub fraction_lost: u8,
    pub cumulative_lost: u32,
    pub highest_seq: u32,
    pub jitter: u32,
    pub last_sr: u32,
    pub delay_since_last_sr: u32,
}

/// Sender report
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp: NtpTimestamp,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
    pub reports: Vec<ReportBlock>,
}

/// Receiver report
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReceiverReport {
    pub ssrc: u32,
    pub reports: Vec<ReportBlock>,
}

/// Goodbye
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Goodbye {
    pub sources: Vec<u32>,
    pub reason: Option<String>,
}

/// A decoded RTCP packet; compound datagrams yield several of these
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    SenderReport(SenderReport),
    ReceiverReport(ReceiverReport),
    /// SDES with the CNAME items we care to expose
    SourceDescription(Vec<(u32, String)>),
    Goodbye(Goodbye),
    /// Valid framing, packet type we do not decode
    Other(u8),
}

/// Parse one (possibly compound) RTCP datagram
pub fn parse_compound(data: &[u8]) -> Result<Vec<RtcpPacket>> {
    let mut packets = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        if rest.len() < 4 {
            return Err(MediaError::MalformedPacket {
                kind: "RTCP",
                reason: "trailing bytes shorter than a header".into(),
            });
        }
        let version = rest[0] >> 6;
        if version != RTCP_VERSION {
            return Err(MediaError::MalformedPacket {
                kind: "RTCP",
                reason: format!("version {}", version),
            });
        }
        let count = (rest[0] & 0x1F) as usize;
        let packet_type = rest[1];
        let length_words = u16::from_be_bytes([rest[2], rest[3]]) as usize;
        let total = (length_words + 1) * 4;
        if rest.len() < total {
            return Err(MediaError::MalformedPacket {
                kind: "RTCP",
                reason: "truncated packet".into(),
            });
        }
        let body = &rest[4..total];
        packets.push(parse_one(packet_type, count, body)?);
        rest = &rest[total..];
    }
    Ok(packets)
}

fn parse_one(packet_type: u8, count: usize, body: &[u8]) -> Result<RtcpPacket> {
    let short = |what: &'static str| MediaError::MalformedPacket {
        kind: "RTCP",
        reason: format!("truncated {}", what),
    };
    match packet_type {
        200 => {
            if body.len() < 24 {
                return Err(short("sender report"));
            }
            let reports = parse_report_blocks(&body[24..], count)?;
            Ok(RtcpPacket::SenderReport(SenderReport {
                ssrc: be32(&body[0..4]),
                ntp: NtpTimestamp {
                    seconds: be32(&body[4..8]),
                    fraction: be32(&body[8..12]),
                },
                rtp_timestamp: be32(&body[12..16]),
                packet_count: be32(&body[16..20]),
                octet_count: be32(&body[20..24]),
                reports,
            }))
        }
        201 => {
            if body.len() < 4 {
                return Err(short("receiver report"));
            }
            let reports = parse_report_blocks(&body[4..], count)?;
            Ok(RtcpPacket::ReceiverReport(ReceiverReport {
                ssrc: be32(&body[0..4]),
                reports,
            }))
        }
        202 => {
            let mut items = Vec::new();
            let mut rest = body;
            for _ in 0..count {
                if rest.len() < 4 {
                    break;
                }
                let ssrc = be32(&rest[0..4]);
                rest = &rest[4..];
                // Walk items until the zero terminator, keep CNAME (type 1).
                while !rest.is_empty() && rest[0] != 0 {
                    if rest.len() < 2 {
                        return Err(short("SDES item"));
                    }
                    let item_type = rest[0];
                    let len = rest[1] as usize;
                    if rest.len() < 2 + len {
                        return Err(short("SDES item body"));
                    }
                    if item_type == 1 {
                        items.push((ssrc, String::from_utf8_lossy(&rest[2..2 + len]).into_owned()));
                    }
                    rest = &rest[2 + len..];
                }
                // Skip the terminator and chunk padding.
                let consumed = body.len() - rest.len();
                let aligned = (consumed + 4) & !3;
                let skip = aligned.min(body.len()) - consumed;
                rest = &rest[skip.min(rest.len())..];
            }
            Ok(RtcpPacket::SourceDescription(items))
        }
        203 => {
            if body.len() < count * 4 {
                return Err(short("goodbye"));
            }
            let sources = (0..count).map(|i| be32(&body[i * 4..i * 4 + 4])).collect();
            let mut reason = None;
            let rest = &body[count * 4..];
            if !rest.is_empty() {
                let len = rest[0] as usize;
                if rest.len() >= 1 + len {
                    reason = Some(String::from_utf8_lossy(&rest[1..1 + len]).into_owned());
                }
            }
            Ok(RtcpPacket::Goodbye(Goodbye { sources, reason }))
        }
        other => Ok(RtcpPacket::Other(other)),
    }
}

fn parse_report_blocks(mut rest: &[u8], count: usize) -> Result<Vec<ReportBlock>> {
    let mut blocks = Vec::with_capacity(count);
    for _ in 0..count {
        if rest.len() < 24 {
            return Err(MediaError::MalformedPacket {
                kind: "RTCP",
                reason: "truncated report block".into(),
            });
        }
        blocks.push(ReportBlock {
            ssrc: be32(&rest[0..4]),
            fraction_lost: rest[4],
            cumulative_lost: u32::from_be_bytes([0, rest[5], rest[6], rest[7]]),
            highest_seq: be32(&rest[8..12]),
            jitter: be32(&rest[12..16]),
            last_sr: be32(&rest[16..20]),
            delay_since_last_sr: be32(&rest[20..24]),
        });
        rest = &rest[24..];
    }
    Ok(blocks)
}

impl SenderReport {
    /// Render as a single RTCP packet
    pub fn render(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(28 + self.reports.len() * 24);
        // length field counts 32-bit words minus one, header included
        let words = (4 + 24 + self.reports.len() * 24) / 4 - 1;
        out.put_u8((RTCP_VERSION << 6) | (self.reports.len() as u8 & 0x1F));
        out.put_u8(RtcpPacketType::SenderReport as u8);
        out.put_u16(words as u16);
        out.put_u32(self.ssrc);
        out.put_u32(self.ntp.seconds);
        out.put_u32(self.ntp.fraction);
        out.put_u32(self.rtp_timestamp);
        out.put_u32(self.packet_count);
        out.put_u32(self.octet_count);
        for block in &self.reports {
            put_report_block(&mut out, block);
        }
        out.freeze()
    }
}

impl ReceiverReport {
    /// Render as a single RTCP packet
    pub fn render(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(8 + self.reports.len() * 24);
        let words = (4 + 4 + self.reports.len() * 24) / 4 - 1;
        out.put_u8((RTCP_VERSION << 6) | (self.reports.len() as u8 & 0x1F));
        out.put_u8(RtcpPacketType::ReceiverReport as u8);
        out.put_u16(words as u16);
        out.put_u32(self.ssrc);
        for block in &self.reports {
            put_report_block(&mut out, block);
        }
        out.freeze()
    }
}

impl Goodbye {
    /// Render as a single RTCP packet
    pub fn render(&self) -> Bytes {
        let reason = self.reason.as_deref().unwrap_or("");
        let reason_len = if reason.is_empty() {
            0
        } else {
            (1 + reason.len() + 3) & !3
        };
        let words = (self.sources.len() * 4 + reason_len) / 4;
        let mut out = BytesMut::new();
        out.put_u8((RTCP_VERSION << 6) | (self.sources.len() as u8 & 0x1F));
        out.put_u8(RtcpPacketType::Goodbye as u8);
        out.put_u16(words as u16);
        for ssrc in &self.sources {
            out.put_u32(*ssrc);
        }
        if !reason.is_empty() {
            out.put_u8(reason.len() as u8);
            out.put_slice(reason.as_bytes());
            for _ in 0..(reason_len - 1 - reason.len()) {
                out.put_u8(0);
            }
        }
        out.freeze()
    }
}

fn put_report_block(out: &mut BytesMut, block: &ReportBlock) {
    out.put_u32(block.ssrc);
    out.put_u8(block.fraction_lost);
    let lost = block.cumulative_lost.to_be_bytes();
    out.put_slice(&lost[1..4]);
    out.put_u32(block.highest_seq);
    out.put_u32(block.jitter);
    out.put_u32(block.last_sr);
    out.put_u32(block.delay_since_last_sr);
}

fn be32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_report_round_trip() {
        let sr = SenderReport {
            ssrc: 0x1234_5678,
            ntp: NtpTimestamp {
                seconds: 100,
                fraction: 200,
            },
            rtp_timestamp: 160,
            packet_count: 50,
            octet_count: 8000,
            reports: vec![ReportBlock {
                ssrc: 0x9ABC_DEF0,
                fraction_lost: 3,
                cumulative_lost: 12,
                highest_seq: 4711,
                jitter: 5,
                last_sr: 1,
                delay_since_last_sr: 2,
            }],
        };
        let wire = sr.render();
        let parsed = parse_compound(&wire).unwrap();
        assert_eq!(parsed, vec![RtcpPacket::SenderReport(sr)]);
    }

    #[test]
    fn compound_rr_plus_bye() {
        let rr = ReceiverReport {
            ssrc: 7,
            reports: vec![],
        };
        let bye = Goodbye {
            sources: vec![7],
            reason: Some("shutdown".into()),
        };
        let mut wire = rr.render().to_vec();
        wire.extend_from_slice(&bye.render());
        let parsed = parse_compound(&wire).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0], RtcpPacket::ReceiverReport(rr));
        match &parsed[1] {
            RtcpPacket::Goodbye(g) => {
                assert_eq!(g.sources, vec![7]);
                assert_eq!(g.reason.as_deref(), Some("shutdown"));
            }
            other => panic!("expected Goodbye, got {:?}", other),
        }
    }

    #[test]
    fn rejects_truncated_compound() {
        let rr = ReceiverReport {
            ssrc: 7,
            reports: vec![],
        };
        let wire = rr.render();
        assert!(parse_compound(&wire[..wire.len() - 1]).is_err());
    }
}
