//! Shared dialog-session machinery
//!
//! The state machine states, the trait bridges use to treat server and
//! client sessions uniformly, and the in-dialog helpers both kinds share
//! (SDP body extraction, REFER NOTIFY bodies, re-INVITE application).

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use voxide_sip_core::{
    Dialog, Method, Request, Response, ServerTransaction, StatusCode,
};

use crate::dialog_media::DialogMedia;
use crate::error::Result;

/// Dialog session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Trying,
    Ringing,
    EarlyMedia,
    Answered,
    Confirmed,
    Terminated,
}

impl SessionState {
    pub fn is_established(&self) -> bool {
        matches!(self, SessionState::Answered | SessionState::Confirmed)
    }
}

/// What bridges and transfer flows need from either session kind
#[async_trait]
pub trait DialogSession: Send + Sync {
    /// Stable identifier (the SIP Call-ID)
    fn session_id(&self) -> String;

    /// The per-call media state
    fn media(&self) -> &Arc<DialogMedia>;

    /// The underlying SIP dialog
    fn sip_dialog(&self) -> &Arc<Dialog>;

    /// Tear the call down
    async fn hangup(&self) -> Result<()>;
}

/// The SDP body of a request, when it carries one
pub(crate) fn sdp_body(req: &Request) -> Option<&[u8]> {
    let content_type = req.headers.get("Content-Type")?;
    if !content_type.eq_ignore_ascii_case("application/sdp") || req.body.is_empty() {
        return None;
    }
    Some(&req.body)
}

/// Send a REFER progress NOTIFY with a sipfrag body (RFC 3515 + 3892)
pub(crate) async fn send_refer_notify(
    dialog: &Dialog,
    status: StatusCode,
    reason: &str,
    terminated: bool,
) -> Result<()> {
    let mut req = dialog.make_request(Method::Notify);
    req.headers.push("Event", "refer");
    req.headers.push(
        "Subscription-State",
        if terminated {
            "terminated;reason=noresource".to_string()
        } else {
            "active;expires=60".to_string()
        },
    );
    req.set_body(
        "message/sipfrag;version=2.0",
        format!("SIP/2.0 {} {}\r\n", status.code(), reason).into_bytes(),
    );
    let resp = dialog.do_request(req).await?;
    if !resp.status.is_success() {
        warn!(status = %resp.status, "NOTIFY rejected");
    }
    Ok(())
}

/// Status code of a sipfrag NOTIFY body (`SIP/2.0 200 OK`)
pub(crate) fn parse_sipfrag(body: &[u8]) -> Option<u16> {
    let text = std::str::from_utf8(body).ok()?;
    let first = text.lines().next()?;
    let mut fields = first.split_whitespace();
    if fields.next()? != "SIP/2.0" {
        return None;
    }
    fields.next()?.parse().ok()
}

/// Apply an in-dialog re-INVITE against `media`, answering 200 with the
/// fresh SDP or 491 when renegotiation fails (400 when the SDP is absent
/// or unparsable)
pub(crate) async fn handle_re_invite(
    media: &DialogMedia,
    dialog: &Dialog,
    req: &Request,
    tx: &Arc<ServerTransaction>,
) -> Result<()> {
    let Some(body) = sdp_body(req) else {
        tx.respond_status(StatusCode::BAD_REQUEST).await?;
        return Ok(());
    };
    match media.sdp_re_invite(body).await {
        Ok(answer) => {
            let mut resp = Response::for_request(StatusCode::OK, req);
            resp.headers
                .set("Contact", dialog.local_contact().to_string());
            resp.set_body("application/sdp", answer.into_bytes());
            tx.respond(resp).await?;
            debug!("re-INVITE renegotiated");
        }
        Err(crate::error::VoxideError::Media(
            voxide_media_core::MediaError::MalformedSdp(_),
        )) => {
            tx.respond_status(StatusCode::BAD_REQUEST).await?;
        }
        Err(e) => {
            warn!(error = %e, "re-INVITE failed, keeping current media");
            tx.respond_status(StatusCode::REQUEST_PENDING).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sipfrag_parsing() {
        assert_eq!(parse_sipfrag(b"SIP/2.0 100 Trying\r\n"), Some(100));
        assert_eq!(parse_sipfrag(b"SIP/2.0 486 Busy Here\r\n"), Some(486));
        assert_eq!(parse_sipfrag(b"not a sipfrag"), None);
    }

    #[test]
    fn sdp_body_requires_content_type_and_payload() {
        let mut req = Request::new(Method::Invite, "sip:a@h".parse().unwrap());
        assert!(sdp_body(&req).is_none());
        req.set_body("application/sdp", &b"v=0\r\n"[..]);
        assert_eq!(sdp_body(&req).unwrap(), b"v=0\r\n");
        req.headers.set("Content-Type", "text/plain");
        assert!(sdp_body(&req).is_none());
    }
}
