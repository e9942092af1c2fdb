//! RFC 3261 dialogs
//!
//! A [`Dialog`] is the long-lived peer-to-peer association identified by
//! Call-ID plus the two tags. It tracks CSeq counters, the remote target and
//! route set, and exposes a state watch channel the session layer drives.
//! Request sending goes through the owning [`UserAgent`]'s transactions.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{Result, SipError};
use crate::transport::TransportKind;
use crate::types::{Address, MessageExt, Method, Request, Response, Uri};
use crate::user_agent::{new_tag, UserAgent};

/// Dialog identifier: Call-ID + local tag + remote tag
///
/// Keys are always "local first", so the same id computed from an incoming
/// request matches both server and client dialog caches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.call_id, self.local_tag, self.remote_tag)
    }
}

/// Dialog lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Initial,
    Early,
    Confirmed,
    Terminated,
}

/// A SIP dialog bound to a user agent
pub struct Dialog {
    ua: Arc<UserAgent>,
    pub call_id: String,
    pub local_tag: String,
    remote_tag: Mutex<Option<String>>,
    /// Our From (UAC) or To (UAS) identity, tag included
    pub local_address: Address,
    remote_address: Mutex<Address>,
    local_contact: Mutex<Address>,
    remote_target: Mutex<Uri>,
    route_set: Mutex<Vec<Uri>>,
    local_cseq: AtomicU32,
    /// Network destination for in-dialog requests
    remote_socket: Mutex<SocketAddr>,
    pub transport: TransportKind,
    state_tx: watch::Sender<DialogState>,
}

impl Dialog {
    /// Build the UAS side of a dialog from an incoming INVITE
    pub fn new_uas(
        ua: Arc<UserAgent>,
        invite: &Request,
        local_contact: Address,
        source: SocketAddr,
        transport: TransportKind,
    ) -> Result<Arc<Self>> {
        let call_id = invite.call_id()?.to_string();
        let remote_address = invite.from_header()?;
        let remote_tag = remote_address
            .tag()
            .ok_or(SipError::MalformedHeader {
                header: "From",
                reason: "request From has no tag".into(),
            })?
            .to_string();
        let mut local_address = invite.to_header()?;
        let local_tag = new_tag();
        local_address.set_tag(&local_tag);

        let remote_target = invite
            .contact()
            .map(|c| c.uri)
            .unwrap_or_else(|| Uri::new(source.ip().to_string()).with_port(source.port()));
        // RFC 3261 12.1.1: the UAS route set is the Record-Route values in
        // the order they appear.
        let route_set = invite.record_route();

        let (state_tx, _) = watch::channel(DialogState::Initial);
        Ok(Arc::new(Dialog {
            ua,
            call_id,
            local_tag,
            remote_tag: Mutex::new(Some(remote_tag)),
            local_address,
            remote_address: Mutex::new(remote_address),
            local_contact: Mutex::new(local_contact),
            remote_target: Mutex::new(remote_target),
            route_set: Mutex::new(route_set),
            local_cseq: AtomicU32::new(invite.cseq()?.seq),
            remote_socket: Mutex::new(source),
            transport,
            state_tx,
        }))
    }

    /// Build the UAC side of a dialog before the INVITE is sent
    pub fn new_uac(
        ua: Arc<UserAgent>,
        call_id: String,
        local_address: Address,
        remote_address: Address,
        local_contact: Address,
        remote_socket: SocketAddr,
        transport: TransportKind,
    ) -> Arc<Self> {
        let local_tag = local_address.tag().map(str::to_string).unwrap_or_else(new_tag);
        let remote_target = remote_address.uri.clone();
        let (state_tx, _) = watch::channel(DialogState::Initial);
        Arc::new(Dialog {
            ua,
            call_id,
            local_tag,
            remote_tag: Mutex::new(None),
            local_address,
            remote_address: Mutex::new(remote_address),
            local_contact: Mutex::new(local_contact),
            remote_target: Mutex::new(remote_target),
            route_set: Mutex::new(Vec::new()),
            local_cseq: AtomicU32::new(0),
            remote_socket: Mutex::new(remote_socket),
            transport,
            state_tx,
        })
    }

    /// Record what a UAC learns from a provisional or final response:
    /// remote tag, remote target and the (reversed) route set
    pub fn absorb_response(&self, resp: &Response) -> Result<()> {
        if let Ok(to) = resp.to_header() {
            if let Some(tag) = to.tag() {
                let mut remote_tag = self.remote_tag.lock();
                if remote_tag.as_deref() != Some(tag) {
                    *remote_tag = Some(tag.to_string());
                }
                let mut remote = self.remote_address.lock();
                *remote = to;
            }
        }
        if let Some(contact) = resp.contact() {
            *self.remote_target.lock() = contact.uri;
        }
        let mut routes = resp.record_route();
        if !routes.is_empty() {
            // RFC 3261 12.1.2: the UAC route set is Record-Route reversed.
            routes.reverse();
            *self.route_set.lock() = routes;
        }
        Ok(())
    }

    /// Current dialog id; None until the remote tag is known
    pub fn id(&self) -> Option<DialogId> {
        self.remote_tag.lock().as_ref().map(|remote| DialogId {
            call_id: self.call_id.clone(),
            local_tag: self.local_tag.clone(),
            remote_tag: remote.clone(),
        })
    }

    pub fn state(&self) -> watch::Receiver<DialogState> {
        self.state_tx.subscribe()
    }

    pub fn current_state(&self) -> DialogState {
        *self.state_tx.subscribe().borrow()
    }

    pub fn set_state(&self, state: DialogState) {
        if self.current_state() != state {
            debug!(call_id = %self.call_id, ?state, "dialog state");
            let _ = self.state_tx.send(state);
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.current_state() == DialogState::Terminated
    }

    /// Wait until the dialog reaches Terminated (the dialog "context")
    pub async fn wait_terminated(&self) {
        let mut state = self.state_tx.subscribe();
        loop {
            if *state.borrow() == DialogState::Terminated {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn remote_address(&self) -> Address {
        self.remote_address.lock().clone()
    }

    pub fn local_contact(&self) -> Address {
        self.local_contact.lock().clone()
    }

    pub fn remote_socket(&self) -> SocketAddr {
        *self.remote_socket.lock()
    }

    pub fn set_remote_socket(&self, addr: SocketAddr) {
        *self.remote_socket.lock() = addr;
    }

    pub fn next_cseq(&self) -> u32 {
        self.local_cseq.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn last_cseq(&self) -> u32 {
        self.local_cseq.load(Ordering::SeqCst)
    }

    /// Build an in-dialog request with the next CSeq
    pub fn make_request(&self, method: Method) -> Request {
        let uri = self.remote_target.lock().clone();
        let mut req = Request::new(method.clone(), uri);
        let mut from = self.local_address.clone();
        from.set_tag(&self.local_tag);
        req.headers.push("From", from.to_string());
        let mut to = self.remote_address.lock().clone();
        if let Some(tag) = self.remote_tag.lock().as_deref() {
            to.set_tag(tag);
        }
        req.headers.push("To", to.to_string());
        req.headers.push("Call-ID", self.call_id.clone());
        req.headers
            .push("CSeq", format!("{} {}", self.next_cseq(), method));
        for route in self.route_set.lock().iter() {
            req.headers.push("Route", format!("<{}>", route));
        }
        req.headers
            .push("Contact", self.local_contact.lock().to_string());
        req
    }

    /// Send an in-dialog request and await the final response
    pub async fn do_request(&self, req: Request) -> Result<Response> {
        let dest = self.remote_socket();
        let mut tx = self.ua.send_request(req, dest, self.transport).await?;
        tx.wait_final().await
    }

    /// Send an in-dialog request and stream its responses
    pub async fn send_request(
        &self,
        req: Request,
    ) -> Result<crate::transaction::ClientTransaction> {
        let dest = self.remote_socket();
        self.ua.send_request(req, dest, self.transport).await
    }

    /// ACK a 2xx response: same CSeq number as the INVITE, method ACK
    pub async fn write_ack(&self, invite_cseq: u32, body: Option<(&str, bytes::Bytes)>) -> Result<()> {
        let uri = self.remote_target.lock().clone();
        let mut ack = Request::new(Method::Ack, uri);
        let mut from = self.local_address.clone();
        from.set_tag(&self.local_tag);
        ack.headers.push("From", from.to_string());
        let mut to = self.remote_address.lock().clone();
        if let Some(tag) = self.remote_tag.lock().as_deref() {
            to.set_tag(tag);
        }
        ack.headers.push("To", to.to_string());
        ack.headers.push("Call-ID", self.call_id.clone());
        ack.headers.push("CSeq", format!("{} ACK", invite_cseq));
        for route in self.route_set.lock().iter() {
            ack.headers.push("Route", format!("<{}>", route));
        }
        ack.headers.push("Max-Forwards", "70");
        if let Some((content_type, body)) = body {
            ack.set_body(content_type, body);
        }
        self.ua
            .send_ack(ack, self.remote_socket(), self.transport)
            .await
    }

    /// Terminate with BYE; the dialog moves to Terminated regardless of the
    /// peer's answer
    pub async fn bye(&self) -> Result<()> {
        if self.is_terminated() {
            return Ok(());
        }
        let req = self.make_request(Method::Bye);
        let result = self.do_request(req).await;
        self.set_state(DialogState::Terminated);
        match result {
            Ok(resp) if resp.status.is_success() => Ok(()),
            Ok(resp) => {
                debug!(status = %resp.status, "BYE answered with non-2xx");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Dialog key of an incoming in-dialog request, from the receiver's view
/// (local tag = To tag, remote tag = From tag). Valid for lookups in both
/// server and client dialog caches since both key local-first.
pub fn request_dialog_id(req: &Request) -> Option<DialogId> {
    let call_id = req.call_id().ok()?.to_string();
    let local_tag = req.to_header().ok()?.tag()?.to_string();
    let remote_tag = req.from_header().ok()?.tag()?.to_string();
    Some(DialogId {
        call_id,
        local_tag,
        remote_tag,
    })
}

/// Dialog key of an incoming response, from the request sender's view
/// (local tag = From tag, remote tag = To tag)
pub fn response_dialog_id(resp: &Response) -> Option<DialogId> {
    let call_id = resp.call_id().ok()?.to_string();
    let local_tag = resp.from_header().ok()?.tag()?.to_string();
    let remote_tag = resp.to_header().ok()?.tag()?.to_string();
    Some(DialogId {
        call_id,
        local_tag,
        remote_tag,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_and_response_ids_mirror() {
        let raw = "BYE sip:a@h SIP/2.0\r\n\
            Via: SIP/2.0/UDP h;branch=z9hG4bK1\r\n\
            From: <sip:b@h>;tag=remote1\r\nTo: <sip:a@h>;tag=local1\r\n\
            Call-ID: cid1\r\nCSeq: 2 BYE\r\nContent-Length: 0\r\n\r\n";
        let msg = crate::parser::parse_message(raw.as_bytes()).unwrap();
        let crate::types::SipMessage::Request(req) = msg else {
            panic!()
        };
        let id = request_dialog_id(&req).unwrap();
        assert_eq!(id.call_id, "cid1");
        assert_eq!(id.local_tag, "local1");
        assert_eq!(id.remote_tag, "remote1");
    }
}
