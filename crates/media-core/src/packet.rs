//! RTP packet framing (RFC 3550)
//!
//! Fixed 12-byte header plus optional CSRC list and extension. Padding and
//! extension words are honoured on parse and never produced on render.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{MediaError, Result};

pub const RTP_VERSION: u8 = 2;
pub const RTP_HEADER_LEN: usize = 12;

/// Parsed RTP header
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RtpHeader {
    pub padding: bool,
    pub extension: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc: Vec<u32>,
}

/// One RTP packet
#[derive(Debug, Clone, Default)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
}

impl RtpPacket {
    /// Parse a datagram
    pub fn parse(data: &[u8]) -> Result<RtpPacket> {
        if data.len() < RTP_HEADER_LEN {
            return Err(MediaError::MalformedPacket {
                kind: "RTP",
                reason: format!("{} bytes is shorter than the fixed header", data.len()),
            });
        }
        let version = data[0] >> 6;
        if version != RTP_VERSION {
            return Err(MediaError::MalformedPacket {
                kind: "RTP",
                reason: format!("version {}", version),
            });
        }
        let padding = data[0] & 0x20 != 0;
        let extension = data[0] & 0x10 != 0;
        let csrc_count = (data[0] & 0x0F) as usize;
        let marker = data[1] & 0x80 != 0;
        let payload_type = data[1] & 0x7F;
        let sequence_number = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut offset = RTP_HEADER_LEN + csrc_count * 4;
        if data.len() < offset {
            return Err(MediaError::MalformedPacket {
                kind: "RTP",
                reason: "truncated CSRC list".into(),
            });
        }
        let csrc = (0..csrc_count)
            .map(|i| {
                let at = RTP_HEADER_LEN + i * 4;
                u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
            })
            .collect();

        if extension {
            if data.len() < offset + 4 {
                return Err(MediaError::MalformedPacket {
                    kind: "RTP",
                    reason: "truncated extension header".into(),
                });
            }
            let words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4 + words * 4;
            if data.len() < offset {
                return Err(MediaError::MalformedPacket {
                    kind: "RTP",
                    reason: "truncated extension body".into(),
                });
            }
        }

        let mut end = data.len();
        if padding {
            let pad = *data.last().unwrap_or(&0) as usize;
            if pad == 0 || pad > end - offset {
                return Err(MediaError::MalformedPacket {
                    kind: "RTP",
                    reason: "bad padding length".into(),
                });
            }
            end -= pad;
        }

        Ok(RtpPacket {
            header: RtpHeader {
                padding,
                extension,
                marker,
                payload_type,
                sequence_number,
                timestamp,
                ssrc,
                csrc,
            },
            payload: Bytes::copy_from_slice(&data[offset..end]),
        })
    }

    /// Render to wire bytes
    pub fn render(&self) -> Bytes {
        let h = &self.header;
        let mut out = BytesMut::with_capacity(RTP_HEADER_LEN + h.csrc.len() * 4 + self.payload.len());
        out.put_u8((RTP_VERSION << 6) | (h.csrc.len() as u8 & 0x0F));
        out.put_u8(((h.marker as u8) << 7) | (h.payload_type & 0x7F));
        out.put_u16(h.sequence_number);
        out.put_u32(h.timestamp);
        out.put_u32(h.ssrc);
        for csrc in &h.csrc {
            out.put_u32(*csrc);
        }
        out.put_slice(&self.payload);
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_parse_round_trip() {
        let packet = RtpPacket {
            header: RtpHeader {
                marker: true,
                payload_type: 0,
                sequence_number: 4711,
                timestamp: 160_000,
                ssrc: 0xDEADBEEF,
                csrc: vec![1, 2],
                ..Default::default()
            },
            payload: Bytes::from_static(&[0xAA; 160]),
        };
        let wire = packet.render();
        let parsed = RtpPacket::parse(&wire).unwrap();
        assert_eq!(parsed.header, packet.header);
        assert_eq!(parsed.payload, packet.payload);
    }

    #[test]
    fn rejects_short_and_wrong_version() {
        assert!(RtpPacket::parse(&[0x80, 0, 0]).is_err());
        let mut wire = vec![0u8; 12];
        wire[0] = 0x40; // version 1
        assert!(RtpPacket::parse(&wire).is_err());
    }

    #[test]
    fn strips_padding() {
        let mut wire = RtpPacket {
            header: RtpHeader {
                payload_type: 8,
                sequence_number: 1,
                timestamp: 1,
                ssrc: 7,
                ..Default::default()
            },
            payload: Bytes::from_static(b"abcd"),
        }
        .render()
        .to_vec();
        wire[0] |= 0x20;
        wire.extend_from_slice(&[0, 0, 0, 4]);
        let parsed = RtpPacket::parse(&wire).unwrap();
        assert_eq!(&parsed.payload[..], b"abcd");
    }
}
