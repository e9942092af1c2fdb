//! Name-addr values used by From, To, Contact, Refer-To and Referred-By

use std::fmt;
use std::str::FromStr;

use crate::error::SipError;
use super::uri::Uri;

/// A display-name + URI + header-parameters triple
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub display_name: Option<String>,
    pub uri: Uri,
    /// Header parameters after the URI (tag, expires, ...)
    pub params: Vec<(String, Option<String>)>,
}

impl Address {
    pub fn new(uri: Uri) -> Self {
        Address {
            display_name: None,
            uri,
            params: Vec::new(),
        }
    }

    /// The tag parameter, when present
    pub fn tag(&self) -> Option<&str> {
        self.param("tag")
    }

    pub fn set_tag(&mut self, tag: &str) {
        self.set_param("tag", Some(tag));
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
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.display_name {
            write!(f, "\"{}\" ", name)?;
        }
        write!(f, "<{}>", self.uri)?;
        for (name, value) in &self.params {
            match value {
                Some(v) => write!(f, ";{}={}", name, v)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

impl FromStr for Address {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        // name-addr form: [display-name] <uri> *(;param)
        if let Some(open) = s.find('<') {
            let close = s[open..]
                .find('>')
                .map(|i| open + i)
                .ok_or_else(|| SipError::Parse("unterminated name-addr".into()))?;
            let display = s[..open].trim().trim_matches('"').trim();
            let uri: Uri = s[open + 1..close].parse()?;
            let mut params = Vec::new();
            for seg in s[close + 1..].split(';') {
                let seg = seg.trim();
                if seg.is_empty() {
                    continue;
                }
                match seg.split_once('=') {
                    Some((k, v)) => params.push((k.to_string(), Some(v.to_string()))),
                    None => params.push((seg.to_string(), None)),
                }
            }
            return Ok(Address {
                display_name: if display.is_empty() {
                    None
                } else {
                    Some(display.to_string())
                },
                uri,
                params,
            });
        }

        // addr-spec form: params after the first ';' belong to the header,
        // not the URI (RFC 3261 20.10)
        let (uri_part, param_part) = match s.split_once(';') {
            Some((u, p)) => (u, Some(p)),
            None => (s, None),
        };
        let uri: Uri = uri_part.parse()?;
        let mut params = Vec::new();
        if let Some(p) = param_part {
            for seg in p.split(';') {
                let seg = seg.trim();
                if seg.is_empty() {
                    continue;
                }
                match seg.split_once('=') {
                    Some((k, v)) => params.push((k.to_string(), Some(v.to_string()))),
                    None => params.push((seg.to_string(), None)),
                }
            }
        }
        Ok(Address {
            display_name: None,
            uri,
            params,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_addr_with_tag() {
        let addr: Address = "\"Alice\" <sip:alice@example.com>;tag=88sja8x"
            .parse()
            .unwrap();
        assert_eq!(addr.display_name.as_deref(), Some("Alice"));
        assert_eq!(addr.uri.user.as_deref(), Some("alice"));
        assert_eq!(addr.tag(), Some("88sja8x"));
    }

    #[test]
    fn addr_spec_params_belong_to_header() {
        let addr: Address = "sip:bob@host.test;tag=abc".parse().unwrap();
        assert_eq!(addr.tag(), Some("abc"));
        assert!(!addr.uri.has_param("tag"));
    }

    #[test]
    fn display_round_trip() {
        let addr: Address = "<sip:carol@h.test:5080>;tag=x1".parse().unwrap();
        let again: Address = addr.to_string().parse().unwrap();
        assert_eq!(addr, again);
    }
}
