//! Digest access authentication (RFC 7616, MD5)
//!
//! Only the MD5 algorithm with qop=auth (or no qop) is supported, which is
//! what deployed SIP registrars challenge with.

use md5::{Digest, Md5};

use crate::error::{Result, SipError};
use crate::types::{Method, Request, Response};

/// A parsed WWW-Authenticate / Proxy-Authenticate challenge
#[derive(Debug, Clone, Default)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub qop: Option<String>,
    pub algorithm: Option<String>,
}

impl DigestChallenge {
    /// Parse the value of a `*-Authenticate` header
    pub fn parse(value: &str) -> Result<Self> {
        let rest = value
            .trim()
            .strip_prefix("Digest")
            .ok_or_else(|| SipError::AuthFailed(format!("not a Digest challenge: {:?}", value)))?;

        let mut challenge = DigestChallenge::default();
        for part in split_challenge_params(rest) {
            let Some((key, val)) = part.split_once('=') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let val = val.trim().trim_matches('"').to_string();
            match key.as_str() {
                "realm" => challenge.realm = val,
                "nonce" => challenge.nonce = val,
                "opaque" => challenge.opaque = Some(val),
                "qop" => challenge.qop = Some(val),
                "algorithm" => challenge.algorithm = Some(val),
                _ => {}
            }
        }
        if challenge.nonce.is_empty() {
            return Err(SipError::AuthFailed("challenge carries no nonce".into()));
        }
        if let Some(alg) = &challenge.algorithm {
            if !alg.eq_ignore_ascii_case("MD5") {
                return Err(SipError::AuthFailed(format!(
                    "unsupported digest algorithm {}",
                    alg
                )));
            }
        }
        Ok(challenge)
    }
}

/// Username/password pair configured by the host application
#[derive(Debug, Clone)]
pub struct DigestCredentials {
    pub username: String,
    pub password: String,
}

/// Compute an Authorization header value answering `challenge`
pub fn authorize(
    challenge: &DigestChallenge,
    creds: &DigestCredentials,
    method: &Method,
    uri: &str,
    cnonce: &str,
) -> String {
    let ha1 = md5_hex(&format!(
        "{}:{}:{}",
        creds.username, challenge.realm, creds.password
    ));
    let ha2 = md5_hex(&format!("{}:{}", method, uri));

    let mut value;
    if challenge
        .qop
        .as_deref()
        .map(|q| q.split(',').any(|v| v.trim() == "auth"))
        .unwrap_or(false)
    {
        let nc = "00000001";
        let response = md5_hex(&format!(
            "{}:{}:{}:{}:auth:{}",
            ha1, challenge.nonce, nc, cnonce, ha2
        ));
        value = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", \
             response=\"{}\", qop=auth, nc={}, cnonce=\"{}\", algorithm=MD5",
            creds.username, challenge.realm, challenge.nonce, uri, response, nc, cnonce
        );
    } else {
        let response = md5_hex(&format!("{}:{}:{}", ha1, challenge.nonce, ha2));
        value = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", \
             response=\"{}\", algorithm=MD5",
            creds.username, challenge.realm, challenge.nonce, uri, response
        );
    }
    if let Some(opaque) = &challenge.opaque {
        value.push_str(&format!(", opaque=\"{}\"", opaque));
    }
    value
}

/// Extract the challenge from a 401/407 response and attach the matching
/// Authorization header to `req`. Returns false when the response carries
/// no challenge.
pub fn answer_challenge(
    resp: &Response,
    req: &mut Request,
    creds: &DigestCredentials,
    cnonce: &str,
) -> Result<bool> {
    let (challenge_header, auth_header) = if resp.status.code() == 407 {
        ("Proxy-Authenticate", "Proxy-Authorization")
    } else {
        ("WWW-Authenticate", "Authorization")
    };
    let Some(value) = resp.headers.get(challenge_header) else {
        return Ok(false);
    };
    let challenge = DigestChallenge::parse(value)?;
    let uri = req.uri.to_string();
    let authorization = authorize(&challenge, creds, &req.method, &uri, cnonce);
    req.headers.set(auth_header, authorization);
    Ok(true)
}

/// Comma-split that respects quoted strings
fn split_challenge_params(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth_quote = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '"' => depth_quote = !depth_quote,
            ',' if !depth_quote => {
                parts.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(s[start..].trim());
    parts
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(32);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_challenge() {
        let ch = DigestChallenge::parse(
            "Digest realm=\"asterisk\", nonce=\"46ca3f4a\", qop=\"auth\", opaque=\"xyz\"",
        )
        .unwrap();
        assert_eq!(ch.realm, "asterisk");
        assert_eq!(ch.nonce, "46ca3f4a");
        assert_eq!(ch.qop.as_deref(), Some("auth"));
        assert_eq!(ch.opaque.as_deref(), Some("xyz"));
    }

    #[test]
    fn rfc2617_style_response_without_qop() {
        // Vector from RFC 2617 section 3.5 adapted to SIP method/URI
        let ch = DigestChallenge {
            realm: "testrealm@host.com".into(),
            nonce: "dcd98b7102dd2f0e8b11d0f600bfb0c093".into(),
            ..Default::default()
        };
        let creds = DigestCredentials {
            username: "Mufasa".into(),
            password: "Circle Of Life".into(),
        };
        let value = authorize(&ch, &creds, &Method::Register, "sip:host.com", "ignored");
        assert!(value.contains("username=\"Mufasa\""));
        assert!(value.contains("algorithm=MD5"));
        // response token is a 32-char lowercase hex string
        let resp = value
            .split("response=\"")
            .nth(1)
            .and_then(|s| s.split('"').next())
            .unwrap();
        assert_eq!(resp.len(), 32);
        assert!(resp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn rejects_non_md5() {
        assert!(DigestChallenge::parse(
            "Digest realm=\"r\", nonce=\"n\", algorithm=SHA-256"
        )
        .is_err());
    }
}
