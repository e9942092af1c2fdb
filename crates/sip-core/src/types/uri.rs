//! SIP URI type and parsing
//!
//! Covers the sip:/sips: subset voxide routes on: user, host, port,
//! uri-parameters and headers. Anything more exotic (telephone-subscriber
//! syntax, escaping) is preserved opaquely in the user part.

use std::fmt;
use std::str::FromStr;

use crate::error::SipError;

/// URI scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Sip,
    Sips,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Sip => "sip",
            Scheme::Sips => "sips",
        }
    }
}

/// A SIP or SIPS URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    pub scheme: Scheme,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    /// uri-parameters in order of appearance; value-less params carry None
    pub params: Vec<(String, Option<String>)>,
    /// uri-headers after '?', in order of appearance
    pub headers: Vec<(String, String)>,
}

impl Uri {
    /// Build a bare sip: URI for a host
    pub fn new(host: impl Into<String>) -> Self {
        Uri {
            scheme: Scheme::Sip,
            user: None,
            host: host.into(),
            port: None,
            params: Vec::new(),
            headers: Vec::new(),
        }
    }

    /// Build a sip:user@host URI
    pub fn new_user(user: impl Into<String>, host: impl Into<String>) -> Self {
        let mut uri = Uri::new(host);
        uri.user = Some(user.into());
        uri
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Value of a uri-parameter, if present with a value
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.as_deref())
    }

    /// True if the parameter is present, with or without a value
    pub fn has_param(&self, name: &str) -> bool {
        self.params.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
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

    /// Transport parameter, lowercased, defaulting to udp
    pub fn transport(&self) -> String {
        self.param("transport")
            .map(|t| t.to_ascii_lowercase())
            .unwrap_or_else(|| "udp".to_string())
    }

    /// host:port with the default SIP port filled in
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port.unwrap_or(5060))
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme.as_str())?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (name, value) in &self.params {
            match value {
                Some(v) => write!(f, ";{}={}", name, v)?,
                None => write!(f, ";{}", name)?,
            }
        }
        for (i, (name, value)) in self.headers.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{}{}={}", sep, name, value)?;
        }
        Ok(())
    }
}

impl FromStr for Uri {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (scheme, rest) = if let Some(rest) = s.strip_prefix("sips:") {
            (Scheme::Sips, rest)
        } else if let Some(rest) = s.strip_prefix("sip:") {
            (Scheme::Sip, rest)
        } else {
            return Err(SipError::Parse(format!("unsupported URI scheme in {:?}", s)));
        };

        // Split off uri-headers first, then params, then userinfo.
        let (rest, header_part) = match rest.split_once('?') {
            Some((r, h)) => (r, Some(h)),
            None => (rest, None),
        };
        let mut segments = rest.split(';');
        let authority = segments
            .next()
            .ok_or_else(|| SipError::Parse("empty URI".into()))?;

        let (user, host_port) = match authority.rsplit_once('@') {
            Some((user, hp)) => (Some(user.to_string()), hp),
            None => (None, authority),
        };

        let (host, port) = parse_host_port(host_port)?;

        let mut params = Vec::new();
        for seg in segments {
            if seg.is_empty() {
                continue;
            }
            match seg.split_once('=') {
                Some((k, v)) => params.push((k.to_string(), Some(v.to_string()))),
                None => params.push((seg.to_string(), None)),
            }
        }

        let mut headers = Vec::new();
        if let Some(h) = header_part {
            for seg in h.split('&') {
                if let Some((k, v)) = seg.split_once('=') {
                    headers.push((k.to_string(), v.to_string()));
                }
            }
        }

        Ok(Uri {
            scheme,
            user,
            host: host.to_string(),
            port,
            params,
            headers,
        })
    }
}

/// Split host[:port], accepting bracketed IPv6 literals
pub(crate) fn parse_host_port(s: &str) -> Result<(&str, Option<u16>), SipError> {
    if s.is_empty() {
        return Err(SipError::Parse("empty host".into()));
    }
    if let Some(rest) = s.strip_prefix('[') {
        // [v6]:port
        let end = rest
            .find(']')
            .ok_or_else(|| SipError::Parse("unterminated IPv6 literal".into()))?;
        let host = &rest[..end];
        let after = &rest[end + 1..];
        let port = match after.strip_prefix(':') {
            Some(p) => Some(
                p.parse::<u16>()
                    .map_err(|_| SipError::Parse(format!("bad port {:?}", p)))?,
            ),
            None => None,
        };
        return Ok((host, port));
    }
    match s.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port
                .parse::<u16>()
                .map_err(|_| SipError::Parse(format!("bad port {:?}", port)))?;
            Ok((host, Some(port)))
        }
        _ => Ok((s, None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_uri() {
        let uri: Uri = "sip:alice@example.com:5080;transport=tcp;lr?Replaces=abc"
            .parse()
            .unwrap();
        assert_eq!(uri.scheme, Scheme::Sip);
        assert_eq!(uri.user.as_deref(), Some("alice"));
        assert_eq!(uri.host, "example.com");
        assert_eq!(uri.port, Some(5080));
        assert_eq!(uri.param("transport"), Some("tcp"));
        assert!(uri.has_param("lr"));
        assert_eq!(uri.headers[0].0, "Replaces");
    }

    #[test]
    fn parses_bare_host() {
        let uri: Uri = "sip:192.168.1.10".parse().unwrap();
        assert_eq!(uri.user, None);
        assert_eq!(uri.host, "192.168.1.10");
        assert_eq!(uri.port, None);
    }

    #[test]
    fn render_parse_round_trip() {
        let text = "sips:bob@host.test:5061;transport=tls";
        let uri: Uri = text.parse().unwrap();
        assert_eq!(uri.to_string(), text);
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!("http://example.com".parse::<Uri>().is_err());
    }
}
