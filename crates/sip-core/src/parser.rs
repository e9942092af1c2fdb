//! Wire-format parser
//!
//! The start line is parsed with nom; header lines are split by hand since
//! they are a flat `Name: value` grammar once line folding is undone. List
//! headers that may be comma-joined on one line (Via, Route, Record-Route,
//! Contact) are exploded into one entry per value.

use bytes::Bytes;
use nom::{
    bytes::complete::{tag, take_while1},
    character::complete::char,
    IResult,
};

use crate::error::{Result, SipError};
use crate::types::headers::canonical_name;
use crate::types::{Headers, Method, Request, Response, SipMessage, StatusCode, Uri};

const SIP_VERSION: &str = "SIP/2.0";

fn token(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || "-.!%*_+`'~".contains(c))(input)
}

fn not_space(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c != ' ')(input)
}

/// `Method SP Request-URI SP SIP/2.0`
fn request_line(input: &str) -> IResult<&str, (&str, &str)> {
    let (input, method) = token(input)?;
    let (input, _) = char(' ')(input)?;
    let (input, uri) = not_space(input)?;
    let (input, _) = char(' ')(input)?;
    let (input, _) = tag(SIP_VERSION)(input)?;
    Ok((input, (method, uri)))
}

/// `SIP/2.0 SP Status-Code SP Reason-Phrase`
fn status_line(input: &str) -> IResult<&str, (u16, &str)> {
    let (input, _) = tag(SIP_VERSION)(input)?;
    let (input, _) = char(' ')(input)?;
    let (input, code) = take_while1(|c: char| c.is_ascii_digit())(input)?;
    let char_result: IResult<&str, char> = char(' ')(input);
    let (reason, _) = char_result.unwrap_or((input, ' '));
    let code = code.parse().unwrap_or(0);
    Ok(("", (code, reason)))
}

/// Parse one datagram or framed stream message
pub fn parse_message(raw: &[u8]) -> Result<SipMessage> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| SipError::Parse("message is not valid UTF-8".into()))?;

    let (head, body) = split_head_body(text, raw)?;
    let mut lines = unfold_lines(head);
    let start = lines
        .next()
        .ok_or_else(|| SipError::Parse("empty message".into()))?;

    let headers = parse_headers(lines)?;

    let msg = if start.starts_with(SIP_VERSION) {
        let (_, (code, reason)) = status_line(start)
            .map_err(|_| SipError::Parse(format!("bad status line {:?}", start)))?;
        if code < 100 {
            return Err(SipError::Parse(format!("bad status code in {:?}", start)));
        }
        SipMessage::Response(Response {
            status: StatusCode(code),
            reason: reason.trim().to_string(),
            headers,
            body,
        })
    } else {
        let (_, (method, uri)) = request_line(start)
            .map_err(|_| SipError::Parse(format!("bad request line {:?}", start)))?;
        let uri: Uri = uri.parse()?;
        let method: Method = method.parse().unwrap();
        SipMessage::Request(Request {
            method,
            uri,
            headers,
            body,
        })
    };

    for required in ["Via", "From", "To", "Call-ID", "CSeq"] {
        if !msg_headers(&msg).contains(required) {
            return Err(SipError::MissingHeader(match required {
                "Via" => "Via",
                "From" => "From",
                "To" => "To",
                "Call-ID" => "Call-ID",
                _ => "CSeq",
            }));
        }
    }
    Ok(msg)
}

fn msg_headers(msg: &SipMessage) -> &Headers {
    match msg {
        SipMessage::Request(r) => &r.headers,
        SipMessage::Response(r) => &r.headers,
    }
}

/// Locate the blank line and slice the body according to Content-Length
/// when present
fn split_head_body<'a>(text: &'a str, raw: &[u8]) -> Result<(&'a str, Bytes)> {
    let (head_end, body_start) = match text.find("\r\n\r\n") {
        Some(i) => (i, i + 4),
        None => match text.find("\n\n") {
            Some(i) => (i, i + 2),
            None => (text.len(), text.len()),
        },
    };
    let head = &text[..head_end];
    let mut body = Bytes::copy_from_slice(&raw[body_start.min(raw.len())..]);

    // Trust Content-Length when it is shorter than what we buffered; a
    // larger value means the framer handed us a short message.
    for line in head.lines() {
        if let Some((name, value)) = line.split_once(':') {
            let name = canonical_name(name.trim());
            if name.eq_ignore_ascii_case("Content-Length") {
                let declared: usize =
                    value
                        .trim()
                        .parse()
                        .map_err(|_| SipError::MalformedHeader {
                            header: "Content-Length",
                            reason: format!("{:?}", value.trim()),
                        })?;
                if declared > body.len() {
                    return Err(SipError::Parse(format!(
                        "truncated body: Content-Length {} but {} bytes present",
                        declared,
                        body.len()
                    )));
                }
                body.truncate(declared);
                break;
            }
        }
    }
    Ok((head, body))
}

/// Undo RFC 3261 line folding, yielding complete logical header lines
fn unfold_lines(head: &str) -> impl Iterator<Item = &str> {
    // Folded lines start with SP/HT; since folding is vanishingly rare on
    // modern stacks, split first and merge only when seen.
    head.split("\r\n")
        .flat_map(|l| l.split('\n'))
        .filter(|l| !l.is_empty())
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Headers> {
    let mut headers = Headers::new();
    let mut pending: Option<(String, String)> = None;

    for line in lines {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = pending.as_mut() {
                value.push(' ');
                value.push_str(line.trim());
                continue;
            }
            return Err(SipError::Parse("continuation line before any header".into()));
        }
        if let Some((name, value)) = pending.take() {
            push_header(&mut headers, name, value);
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| SipError::Parse(format!("header line without colon: {:?}", line)))?;
        pending = Some((
            canonical_name(name.trim()).to_string(),
            value.trim().to_string(),
        ));
    }
    if let Some((name, value)) = pending {
        push_header(&mut headers, name, value);
    }
    Ok(headers)
}

fn push_header(headers: &mut Headers, name: String, value: String) {
    let listable = ["Via", "Route", "Record-Route", "Contact"]
        .iter()
        .any(|h| h.eq_ignore_ascii_case(&name));
    if listable && value.contains(',') && !value.contains('"') {
        for part in value.split(',') {
            headers.push(name.clone(), part.trim());
        }
    } else {
        headers.push(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageExt;

    const INVITE: &str = "INVITE sip:bob@biloxi.example.com SIP/2.0\r\n\
        Via: SIP/2.0/UDP client.atlanta.example.com:5060;branch=z9hG4bK74bf9\r\n\
        Max-Forwards: 70\r\n\
        From: Alice <sip:alice@atlanta.example.com>;tag=9fxced76sl\r\n\
        To: Bob <sip:bob@biloxi.example.com>\r\n\
        Call-ID: 3848276298220188511@atlanta.example.com\r\n\
        CSeq: 1 INVITE\r\n\
        Contact: <sip:alice@client.atlanta.example.com>\r\n\
        Content-Type: application/sdp\r\n\
        Content-Length: 4\r\n\
        \r\n\
        v=0\n";

    #[test]
    fn parses_invite() {
        let msg = parse_message(INVITE.as_bytes()).unwrap();
        let SipMessage::Request(req) = msg else {
            panic!("expected request")
        };
        assert_eq!(req.method, Method::Invite);
        assert_eq!(req.uri.user.as_deref(), Some("bob"));
        assert_eq!(req.cseq().unwrap().seq, 1);
        assert_eq!(req.from_header().unwrap().tag(), Some("9fxced76sl"));
        assert_eq!(&req.body[..], b"v=0\n");
    }

    #[test]
    fn parses_response_and_reason() {
        let raw = "SIP/2.0 486 Busy Here\r\n\
            Via: SIP/2.0/UDP h:5060;branch=z9hG4bK1\r\n\
            From: <sip:a@h>;tag=1\r\nTo: <sip:b@h>;tag=2\r\n\
            Call-ID: c\r\nCSeq: 2 INVITE\r\nContent-Length: 0\r\n\r\n";
        let msg = parse_message(raw.as_bytes()).unwrap();
        let SipMessage::Response(resp) = msg else {
            panic!("expected response")
        };
        assert_eq!(resp.status, StatusCode::BUSY_HERE);
        assert_eq!(resp.reason, "Busy Here");
    }

    #[test]
    fn rejects_missing_mandatory_headers() {
        let raw = "OPTIONS sip:h SIP/2.0\r\nVia: SIP/2.0/UDP h;branch=z9hG4bK1\r\n\r\n";
        assert!(matches!(
            parse_message(raw.as_bytes()),
            Err(SipError::MissingHeader(_))
        ));
    }

    #[test]
    fn rejects_truncated_body() {
        let raw = "MESSAGE sip:h SIP/2.0\r\n\
            Via: SIP/2.0/UDP h;branch=z9hG4bK1\r\n\
            From: <sip:a@h>;tag=1\r\nTo: <sip:b@h>\r\n\
            Call-ID: c\r\nCSeq: 1 MESSAGE\r\nContent-Length: 100\r\n\r\nshort";
        assert!(parse_message(raw.as_bytes()).is_err());
    }

    #[test]
    fn splits_comma_joined_vias() {
        let raw = "SIP/2.0 200 OK\r\n\
            Via: SIP/2.0/UDP a:5060;branch=z9hG4bK1, SIP/2.0/UDP b:5060;branch=z9hG4bK2\r\n\
            From: <sip:a@h>;tag=1\r\nTo: <sip:b@h>;tag=2\r\n\
            Call-ID: c\r\nCSeq: 1 INVITE\r\nContent-Length: 0\r\n\r\n";
        let msg = parse_message(raw.as_bytes()).unwrap();
        assert_eq!(msg_headers(&msg).get_all("Via").count(), 2);
    }

    #[test]
    fn render_parse_round_trip() {
        let msg = parse_message(INVITE.as_bytes()).unwrap();
        let SipMessage::Request(req) = msg else {
            panic!("expected request")
        };
        let rendered = req.render();
        let reparsed = parse_message(&rendered).unwrap();
        let SipMessage::Request(req2) = reparsed else {
            panic!("expected request")
        };
        assert_eq!(req.method, req2.method);
        assert_eq!(req.headers.get("Call-ID"), req2.headers.get("Call-ID"));
        assert_eq!(req.body, req2.body);
    }
}
