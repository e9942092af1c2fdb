//! SDP offer/answer bodies (RFC 4566)
//!
//! Only the single-m-line audio sessions voxide negotiates: origin,
//! connection, one `m=audio` with its rtpmap/fmtp attributes and a
//! direction. Unrecognized codecs in a remote offer are skipped, not
//! errors; an offer with no usable audio line is malformed.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::codec::Codec;
use crate::error::{MediaError, Result};

/// Media direction attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SdpMode {
    #[default]
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl SdpMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpMode::SendRecv => "sendrecv",
            SdpMode::SendOnly => "sendonly",
            SdpMode::RecvOnly => "recvonly",
            SdpMode::Inactive => "inactive",
        }
    }

    fn from_attr(attr: &str) -> Option<Self> {
        match attr {
            "sendrecv" => Some(SdpMode::SendRecv),
            "sendonly" => Some(SdpMode::SendOnly),
            "recvonly" => Some(SdpMode::RecvOnly),
            "inactive" => Some(SdpMode::Inactive),
            _ => None,
        }
    }

    /// The direction the answering side should advertise
    pub fn reverse(&self) -> SdpMode {
        match self {
            SdpMode::SendOnly => SdpMode::RecvOnly,
            SdpMode::RecvOnly => SdpMode::SendOnly,
            other => *other,
        }
    }
}

impl fmt::Display for SdpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed or to-be-rendered audio session description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub session_id: u64,
    pub session_version: u64,
    pub connection_addr: IpAddr,
    pub media_port: u16,
    /// Recognized codecs in m-line order
    pub codecs: Vec<Codec>,
    pub mode: SdpMode,
}

impl SessionDescription {
    pub fn new(addr: IpAddr, port: u16, codecs: Vec<Codec>) -> Self {
        SessionDescription {
            session_id: rand::random::<u32>() as u64,
            session_version: 1,
            connection_addr: addr,
            media_port: port,
            codecs,
            mode: SdpMode::SendRecv,
        }
    }

    /// The remote RTP endpoint this description advertises
    pub fn media_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.connection_addr, self.media_port)
    }

    /// Render to an SDP body
    pub fn render(&self) -> String {
        let ip_kind = match self.connection_addr {
            IpAddr::V4(_) => "IP4",
            IpAddr::V6(_) => "IP6",
        };
        let mut out = String::with_capacity(256);
        out.push_str("v=0\r\n");
        out.push_str(&format!(
            "o=- {} {} IN {} {}\r\n",
            self.session_id, self.session_version, ip_kind, self.connection_addr
        ));
        out.push_str("s=voxide\r\n");
        out.push_str(&format!("c=IN {} {}\r\n", ip_kind, self.connection_addr));
        out.push_str("t=0 0\r\n");
        let pts: Vec<String> = self
            .codecs
            .iter()
            .map(|c| c.payload_type.to_string())
            .collect();
        out.push_str(&format!("m=audio {} RTP/AVP {}\r\n", self.media_port, pts.join(" ")));
        for codec in &self.codecs {
            out.push_str(&format!(
                "a=rtpmap:{} {}/{}\r\n",
                codec.payload_type,
                codec.name(),
                codec.sample_rate
            ));
            if codec.is_telephone_event() {
                out.push_str(&format!("a=fmtp:{} 0-16\r\n", codec.payload_type));
            }
        }
        out.push_str(&format!("a={}\r\n", self.mode));
        out
    }
}

impl FromStr for SessionDescription {
    type Err = MediaError;

    fn from_str(s: &str) -> Result<Self> {
        let mut session_id = 0u64;
        let mut session_version = 0u64;
        let mut session_conn: Option<IpAddr> = None;
        let mut media_conn: Option<IpAddr> = None;
        let mut media_port: Option<u16> = None;
        let mut payload_types: Vec<u8> = Vec::new();
        let mut rtpmaps: Vec<(u8, String, u32, u8)> = Vec::new();
        let mut mode = SdpMode::SendRecv;
        let mut in_audio = false;
        let mut past_first_media = false;

        for line in s.lines() {
            let line = line.trim_end_matches('\r').trim();
            if line.is_empty() {
                continue;
            }
            let Some((kind, value)) = line.split_once('=') else {
                return Err(MediaError::MalformedSdp(format!("bad line {:?}", line)));
            };
            match kind {
                "o" => {
                    let fields: Vec<&str> = value.split_whitespace().collect();
                    if fields.len() >= 3 {
                        session_id = fields[1].parse().unwrap_or(0);
                        session_version = fields[2].parse().unwrap_or(0);
                    }
                }
                "c" => {
                    let addr = parse_connection(value)?;
                    if past_first_media {
                        if in_audio {
                            media_conn = Some(addr);
                        }
                    } else {
                        session_conn = Some(addr);
                    }
                }
                "m" => {
                    past_first_media = true;
                    let fields: Vec<&str> = value.split_whitespace().collect();
                    if fields.len() < 3 {
                        return Err(MediaError::MalformedSdp(format!("bad m-line {:?}", line)));
                    }
                    if fields[0] == "audio" && media_port.is_none() {
                        in_audio = true;
                        let port = fields[1]
                            .parse()
                            .map_err(|_| MediaError::MalformedSdp(format!("bad port {:?}", fields[1])))?;
                        media_port = Some(port);
                        payload_types = fields[3..]
                            .iter()
                            .filter_map(|pt| pt.parse().ok())
                            .collect();
                    } else {
                        in_audio = false;
                    }
                }
                "a" if in_audio || !past_first_media => {
                    if let Some(rest) = value.strip_prefix("rtpmap:") {
                        if let Some((pt, map)) = rest.split_once(char::is_whitespace) {
                            if let Ok(pt) = pt.parse::<u8>() {
                                let mut parts = map.trim().split('/');
                                let name = parts.next().unwrap_or_default().to_string();
                                let clock = parts
                                    .next()
                                    .and_then(|c| c.parse().ok())
                                    .unwrap_or(8000);
                                let channels =
                                    parts.next().and_then(|c| c.parse().ok()).unwrap_or(1);
                                rtpmaps.push((pt, name, clock, channels));
                            }
                        }
                    } else if let Some(m) = SdpMode::from_attr(value) {
                        mode = m;
                    }
                }
                _ => {}
            }
        }

        let media_port =
            media_port.ok_or_else(|| MediaError::MalformedSdp("no audio m-line".into()))?;
        let connection_addr = media_conn
            .or(session_conn)
            .ok_or_else(|| MediaError::MalformedSdp("no connection line".into()))?;

        let mut codecs = Vec::new();
        for pt in payload_types {
            let mapped = rtpmaps
                .iter()
                .find(|(map_pt, ..)| *map_pt == pt)
                .and_then(|(pt, name, clock, ch)| Codec::from_rtpmap(*pt, name, *clock, *ch));
            let codec = match mapped {
                Some(c) => Some(c),
                // Static payload types may omit the rtpmap.
                None if rtpmaps.iter().all(|(map_pt, ..)| *map_pt != pt) => {
                    Codec::from_payload_type(pt).ok()
                }
                None => None,
            };
            if let Some(codec) = codec {
                codecs.push(codec);
            }
        }

        Ok(SessionDescription {
            session_id,
            session_version,
            connection_addr,
            media_port,
            codecs,
            mode,
        })
    }
}

fn parse_connection(value: &str) -> Result<IpAddr> {
    let fields: Vec<&str> = value.split_whitespace().collect();
    if fields.len() != 3 || fields[0] != "IN" {
        return Err(MediaError::MalformedSdp(format!("bad c-line {:?}", value)));
    }
    fields[2]
        .parse()
        .map_err(|_| MediaError::MalformedSdp(format!("bad address {:?}", fields[2])))
}

/// Codec intersection in the REMOTE's preference order, adopting the
/// remote's (possibly dynamic) payload types
pub fn intersect_codecs(remote: &[Codec], local: &[Codec]) -> Vec<Codec> {
    remote
        .iter()
        .filter(|r| local.iter().any(|l| l.is_compatible(r)))
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{PCMA, PCMU, TELEPHONE_EVENT};

    const OFFER: &str = "v=0\r\n\
        o=- 123 2 IN IP4 192.0.2.5\r\n\
        s=call\r\n\
        c=IN IP4 192.0.2.5\r\n\
        t=0 0\r\n\
        m=audio 49170 RTP/AVP 8 0 96 101\r\n\
        a=rtpmap:8 PCMA/8000\r\n\
        a=rtpmap:0 PCMU/8000\r\n\
        a=rtpmap:96 opus/48000/2\r\n\
        a=rtpmap:101 telephone-event/8000\r\n\
        a=fmtp:101 0-16\r\n\
        a=sendrecv\r\n";

    #[test]
    fn parses_offer_in_remote_order() {
        let sdp: SessionDescription = OFFER.parse().unwrap();
        assert_eq!(sdp.media_port, 49170);
        assert_eq!(sdp.connection_addr.to_string(), "192.0.2.5");
        // opus is unknown to the registry and silently skipped
        let names: Vec<_> = sdp.codecs.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["PCMA", "PCMU", "telephone-event"]);
        assert_eq!(sdp.mode, SdpMode::SendRecv);
    }

    #[test]
    fn render_parse_round_trip_keeps_media_parameters() {
        let sdp = SessionDescription::new(
            "10.0.0.9".parse().unwrap(),
            40002,
            vec![PCMU, TELEPHONE_EVENT],
        );
        let again: SessionDescription = sdp.render().parse().unwrap();
        assert_eq!(again.media_port, sdp.media_port);
        assert_eq!(again.connection_addr, sdp.connection_addr);
        assert_eq!(again.codecs, sdp.codecs);
        assert_eq!(again.mode, sdp.mode);
        // And rendering the reparsed description is byte-stable.
        assert_eq!(again.render(), sdp.render());
    }

    #[test]
    fn static_payload_types_work_without_rtpmap() {
        let sdp: SessionDescription = "v=0\r\no=- 1 1 IN IP4 1.2.3.4\r\ns=x\r\n\
            c=IN IP4 1.2.3.4\r\nt=0 0\r\nm=audio 9000 RTP/AVP 0\r\n"
            .parse()
            .unwrap();
        assert_eq!(sdp.codecs, vec![PCMU]);
    }

    #[test]
    fn missing_media_line_is_malformed() {
        let err = "v=0\r\no=- 1 1 IN IP4 1.2.3.4\r\nc=IN IP4 1.2.3.4\r\n"
            .parse::<SessionDescription>()
            .unwrap_err();
        assert!(matches!(err, MediaError::MalformedSdp(_)));
    }

    #[test]
    fn intersection_keeps_remote_order_and_payload_types() {
        let mut remote_te = TELEPHONE_EVENT;
        remote_te.payload_type = 96;
        let remote = vec![PCMA, PCMU, remote_te];
        let local = vec![PCMU, PCMA, TELEPHONE_EVENT];
        let negotiated = intersect_codecs(&remote, &local);
        assert_eq!(negotiated[0], PCMA);
        assert_eq!(negotiated[1], PCMU);
        assert_eq!(negotiated[2].payload_type, 96);
    }
}
