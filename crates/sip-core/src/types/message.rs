//! SIP request and response messages
//!
//! Both message kinds share the typed header accessors through
//! [`MessageExt`]; rendering always emits a correct Content-Length.

use std::str::FromStr;

use bytes::Bytes;

use crate::error::{Result, SipError};
use super::address::Address;
use super::headers::Headers;
use super::method::Method;
use super::status::StatusCode;
use super::uri::Uri;
use super::via::Via;

/// CSeq header value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

impl FromStr for CSeq {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self> {
        let (seq, method) = s
            .trim()
            .split_once(char::is_whitespace)
            .ok_or(SipError::MalformedHeader {
                header: "CSeq",
                reason: "expected `<seq> <method>`".into(),
            })?;
        let seq = seq.parse().map_err(|_| SipError::MalformedHeader {
            header: "CSeq",
            reason: format!("bad sequence number {:?}", seq),
        })?;
        Ok(CSeq {
            seq,
            method: method.trim().parse().unwrap(),
        })
    }
}

impl std::fmt::Display for CSeq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

/// A SIP request
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Self {
        Request {
            method,
            uri,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn set_body(&mut self, content_type: &str, body: impl Into<Bytes>) {
        self.body = body.into();
        self.headers.set("Content-Type", content_type);
    }

    /// Render to wire format
    pub fn render(&self) -> Vec<u8> {
        let mut out = format!("{} {} SIP/2.0\r\n", self.method, self.uri).into_bytes();
        render_headers_and_body(&mut out, &self.headers, &self.body);
        out
    }
}

/// A SIP response
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub reason: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Response {
            status,
            reason: status.reason().to_string(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Build a response to a request, copying the headers RFC 3261 8.2.6
    /// requires (Via set, From, To, Call-ID, CSeq)
    pub fn for_request(status: StatusCode, req: &Request) -> Self {
        let mut resp = Response::new(status);
        for via in req.headers.get_all("Via") {
            resp.headers.push("Via", via);
        }
        for name in ["From", "To", "Call-ID", "CSeq"] {
            if let Some(v) = req.headers.get(name) {
                resp.headers.push(name, v);
            }
        }
        for rr in req.headers.get_all("Record-Route") {
            resp.headers.push("Record-Route", rr);
        }
        resp
    }

    pub fn set_body(&mut self, content_type: &str, body: impl Into<Bytes>) {
        self.body = body.into();
        self.headers.set("Content-Type", content_type);
    }

    /// Render to wire format
    pub fn render(&self) -> Vec<u8> {
        let mut out = format!("SIP/2.0 {} {}\r\n", self.status.code(), self.reason).into_bytes();
        render_headers_and_body(&mut out, &self.headers, &self.body);
        out
    }
}

fn render_headers_and_body(out: &mut Vec<u8>, headers: &Headers, body: &Bytes) {
    for (name, value) in headers.iter() {
        if name.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    out.extend_from_slice(body);
}

/// Either kind of message, as produced by the parser
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(Request),
    Response(Response),
}

/// Typed accessors shared by requests and responses
pub trait MessageExt {
    fn headers(&self) -> &Headers;
    fn headers_mut(&mut self) -> &mut Headers;

    fn from_header(&self) -> Result<Address> {
        self.headers()
            .get("From")
            .ok_or(SipError::MissingHeader("From"))?
            .parse()
    }

    fn to_header(&self) -> Result<Address> {
        self.headers()
            .get("To")
            .ok_or(SipError::MissingHeader("To"))?
            .parse()
    }

    fn call_id(&self) -> Result<&str> {
        self.headers()
            .get("Call-ID")
            .ok_or(SipError::MissingHeader("Call-ID"))
    }

    fn cseq(&self) -> Result<CSeq> {
        self.headers()
            .get("CSeq")
            .ok_or(SipError::MissingHeader("CSeq"))?
            .parse()
    }

    fn top_via(&self) -> Result<Via> {
        self.headers()
            .get("Via")
            .ok_or(SipError::MissingHeader("Via"))?
            .parse()
    }

    fn contact(&self) -> Option<Address> {
        self.headers().get("Contact").and_then(|v| v.parse().ok())
    }

    /// Route set from Record-Route headers, top first
    fn record_route(&self) -> Vec<Uri> {
        self.headers()
            .get_all("Record-Route")
            .filter_map(|v| v.parse::<Address>().ok())
            .map(|a| a.uri)
            .collect()
    }

    fn expires(&self) -> Option<u32> {
        self.headers().get("Expires").and_then(|v| v.trim().parse().ok())
    }
}

impl MessageExt for Request {
    fn headers(&self) -> &Headers {
        &self.headers
    }
    fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }
}

impl MessageExt for Response {
    fn headers(&self) -> &Headers {
        &self.headers
    }
    fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }
}

impl MessageExt for SipMessage {
    fn headers(&self) -> &Headers {
        match self {
            SipMessage::Request(r) => &r.headers,
            SipMessage::Response(r) => &r.headers,
        }
    }
    fn headers_mut(&mut self) -> &mut Headers {
        match self {
            SipMessage::Request(r) => &mut r.headers,
            SipMessage::Response(r) => &mut r.headers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_content_length() {
        let mut req = Request::new(Method::Invite, "sip:bob@host.test".parse().unwrap());
        req.headers.push("Call-ID", "x@y");
        req.set_body("application/sdp", &b"v=0\r\n"[..]);
        let wire = String::from_utf8(req.render()).unwrap();
        assert!(wire.starts_with("INVITE sip:bob@host.test SIP/2.0\r\n"));
        assert!(wire.contains("Content-Length: 5\r\n"));
        assert!(wire.ends_with("v=0\r\n"));
    }

    #[test]
    fn response_copies_request_headers() {
        let mut req = Request::new(Method::Invite, "sip:bob@host.test".parse().unwrap());
        req.headers.push("Via", "SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK1");
        req.headers.push("From", "<sip:a@h>;tag=1");
        req.headers.push("To", "<sip:b@h>");
        req.headers.push("Call-ID", "cid");
        req.headers.push("CSeq", "1 INVITE");
        let resp = Response::for_request(StatusCode::RINGING, &req);
        assert_eq!(resp.reason, "Ringing");
        assert_eq!(resp.headers.get("Call-ID"), Some("cid"));
        assert_eq!(resp.cseq().unwrap().seq, 1);
    }
}
