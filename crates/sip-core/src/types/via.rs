//! Via header value

use std::fmt;
use std::str::FromStr;

use crate::error::SipError;
use super::uri::parse_host_port;

/// Magic cookie required at the start of every RFC 3261 branch
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

/// One Via hop: `SIP/2.0/<transport> host[:port];params`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    /// Transport token, uppercased (UDP, TCP, TLS, WS, WSS)
    pub transport: String,
    pub host: String,
    pub port: Option<u16>,
    pub params: Vec<(String, Option<String>)>,
}

impl Via {
    pub fn new(transport: &str, host: impl Into<String>, port: u16) -> Self {
        Via {
            transport: transport.to_ascii_uppercase(),
            host: host.into(),
            port: Some(port),
            params: Vec::new(),
        }
    }

    pub fn branch(&self) -> Option<&str> {
        self.param("branch")
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn set_param(&mut self, name: &str, value: Option<&str>) {
        if let Some(entry) = self
            .params
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            entry.1 = value.map(str::to_string);
        } else {
            self.params
                .push((name.to_string(), value.map(str::to_string)));
        }
    }

    /// The address responses should be sent to, honouring received/rport
    pub fn response_target(&self) -> (String, u16) {
        let host = self
            .param("received")
            .unwrap_or(self.host.as_str())
            .to_string();
        let port = self
            .param("rport")
            .and_then(|p| p.parse().ok())
            .or(self.port)
            .unwrap_or(5060);
        (host, port)
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}", self.transport, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (name, value) in &self.params {
            match value {
                Some(v) => write!(f, ";{}={}", name, v)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

impl FromStr for Via {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let rest = s
            .strip_prefix("SIP/2.0/")
            .ok_or_else(|| SipError::MalformedHeader {
                header: "Via",
                reason: format!("missing protocol in {:?}", s),
            })?;
        let (transport, rest) = rest
            .split_once(char::is_whitespace)
            .ok_or_else(|| SipError::MalformedHeader {
                header: "Via",
                reason: "missing sent-by".into(),
            })?;

        let mut segments = rest.trim().split(';');
        let sent_by = segments.next().unwrap_or_default().trim();
        let (host, port) = parse_host_port(sent_by)?;

        let mut params = Vec::new();
        for seg in segments {
            let seg = seg.trim();
            if seg.is_empty() {
                continue;
            }
            match seg.split_once('=') {
                Some((k, v)) => params.push((k.to_string(), Some(v.to_string()))),
                None => params.push((seg.to_string(), None)),
            }
        }

        Ok(Via {
            transport: transport.to_ascii_uppercase(),
            host: host.to_string(),
            port,
            params,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_via_with_branch() {
        let via: Via = "SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK776asdhds;rport"
            .parse()
            .unwrap();
        assert_eq!(via.transport, "UDP");
        assert_eq!(via.host, "10.0.0.1");
        assert_eq!(via.port, Some(5060));
        assert_eq!(via.branch(), Some("z9hG4bK776asdhds"));
    }

    #[test]
    fn response_target_prefers_received_rport() {
        let mut via: Via = "SIP/2.0/UDP a.example.com:5060;branch=z9hG4bKx"
            .parse()
            .unwrap();
        via.set_param("received", Some("192.0.2.7"));
        via.set_param("rport", Some("40123"));
        assert_eq!(via.response_target(), ("192.0.2.7".to_string(), 40123));
    }
}
