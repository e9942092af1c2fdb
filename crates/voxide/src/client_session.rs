//! UAC dialog session
//!
//! Builds and sends the INVITE, tracks provisional responses, opens the
//! early-media path on a 183 with SDP, answers digest challenges once, and
//! always ACKs a 2xx — even one whose SDP turns out unusable, in which case
//! the ACK is followed by an immediate BYE per RFC 3261 13.2.2.4.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use voxide_media_core::{Codec, MediaSession};
use voxide_sip_core::auth::{answer_challenge, DigestCredentials};
use voxide_sip_core::types::MessageExt;
use voxide_sip_core::{
    new_call_id, new_tag, resolve_uri, Address, ClientTransaction, Dialog, DialogState, Method,
    Request, Response, ServerTransaction, StatusCode, TransportKind, Uri, UserAgent,
};

use crate::config::MediaEnv;
use crate::dialog_media::DialogMedia;
use crate::error::{Result, VoxideError};
use crate::session::{handle_re_invite, DialogSession, SessionState};

/// Outcome of one `wait_answer` call
#[derive(Debug, PartialEq, Eq)]
pub enum WaitAnswer {
    /// 200 received, media live, dialog confirmed
    Answered,
    /// 183 with SDP received; media is live pre-answer. Call `wait_answer`
    /// again to keep waiting for the final response.
    EarlyMedia,
}

/// Options for an outbound call
#[derive(Default)]
pub struct InviteOptions {
    /// Bridge originator whose negotiated codec the offer is narrowed to
    pub originator: Option<Arc<dyn DialogSession>>,
    /// Extra request headers (Referred-By and friends)
    pub headers: Vec<(String, String)>,
    /// Overall answer deadline; transaction default when unset
    pub timeout: Option<Duration>,
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("state", &self.state_tx.borrow())
            .finish()
    }
}

/// One outbound call
pub struct ClientSession {
    ua: Arc<UserAgent>,
    dialog: Arc<Dialog>,
    media: Arc<DialogMedia>,
    env: MediaEnv,
    credentials: Option<DigestCredentials>,
    state_tx: watch::Sender<SessionState>,
    invite_tx: tokio::sync::Mutex<Option<ClientTransaction>>,
    invite_cseq: AtomicU32,
    auth_retried: AtomicBool,
    /// Media session offered but not yet bound into DialogMedia
    pending_session: Mutex<Option<Arc<MediaSession>>>,
    /// SDP applied from a 183, to detect a differing 200
    early_sdp: Mutex<Option<Vec<u8>>>,
    answer_deadline: Mutex<Option<tokio::time::Instant>>,
    on_notify: Mutex<Option<Box<dyn Fn(u16) + Send + Sync>>>,
}

impl ClientSession {
    /// Create the session and send the INVITE
    pub(crate) async fn invite(
        ua: Arc<UserAgent>,
        env: MediaEnv,
        credentials: Option<DigestCredentials>,
        local_identity: Address,
        local_contact: Address,
        target: Uri,
        opts: InviteOptions,
    ) -> Result<Arc<Self>> {
        let transport =
            TransportKind::from_token(&target.transport()).unwrap_or(TransportKind::Udp);
        let dest = resolve_uri(&target).await?;

        // Media offer, optionally narrowed to the originator's codec so a
        // later bridge needs no transcoding.
        let mut session = MediaSession::new(env.media_ip, env.codecs.clone()).await?;
        session.set_external_ip(env.external_media_ip);
        if let Some(originator) = &opts.originator {
            if let Ok(orig_session) = originator.media().session() {
                let narrowed = preserve_originator_codecs(&orig_session.codecs(), &env.codecs);
                if narrowed.is_empty() {
                    return Err(VoxideError::NoCompatibleMedia);
                }
                session.set_local_codecs(narrowed);
            }
        }
        let offer = session.local_sdp();

        let mut local_identity = local_identity;
        if local_identity.tag().is_none() {
            local_identity.set_tag(&new_tag());
        }
        let remote_address = Address::new(target.clone());
        let dialog = Dialog::new_uac(
            ua.clone(),
            new_call_id(),
            local_identity.clone(),
            remote_address,
            local_contact.clone(),
            dest,
            transport,
        );

        let mut req = Request::new(Method::Invite, target);
        req.headers.push("From", local_identity.to_string());
        req.headers
            .push("To", dialog.remote_address().to_string());
        req.headers.push("Call-ID", dialog.call_id.clone());
        let cseq = dialog.next_cseq();
        req.headers.push("CSeq", format!("{} INVITE", cseq));
        req.headers.push("Contact", local_contact.to_string());
        for (name, value) in &opts.headers {
            req.headers.push(name.clone(), value.clone());
        }
        req.set_body("application/sdp", offer.into_bytes());

        let tx = ua.send_request(req, dest, transport).await?;
        info!(call_id = %dialog.call_id, %dest, "INVITE sent");

        let (state_tx, _) = watch::channel(SessionState::Trying);
        let deadline = opts
            .timeout
            .map(|t| tokio::time::Instant::now() + t);
        Ok(Arc::new(ClientSession {
            ua,
            dialog,
            media: Arc::new(DialogMedia::new()),
            env,
            credentials,
            state_tx,
            invite_tx: tokio::sync::Mutex::new(Some(tx)),
            invite_cseq: AtomicU32::new(cseq),
            auth_retried: AtomicBool::new(false),
            pending_session: Mutex::new(Some(Arc::new(session))),
            early_sdp: Mutex::new(None),
            answer_deadline: Mutex::new(deadline),
            on_notify: Mutex::new(None),
        }))
    }

    pub fn id(&self) -> String {
        self.dialog.call_id.clone()
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.subscribe().borrow()
    }

    pub fn state_channel(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Completes when the dialog terminates
    pub async fn wait_terminated(&self) {
        let mut rx = self.state_tx.subscribe();
        loop {
            if *rx.borrow() == SessionState::Terminated {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn set_state(&self, state: SessionState) {
        if *self.state_tx.subscribe().borrow() != state {
            debug!(call_id = %self.dialog.call_id, ?state, "client session state");
            let _ = self.state_tx.send(state);
        }
    }

    pub fn media(&self) -> &Arc<DialogMedia> {
        &self.media
    }

    pub fn audio_reader(&self) -> Result<crate::dialog_media::MediaReader> {
        self.media.audio_reader()
    }

    pub fn audio_writer(&self) -> Result<crate::dialog_media::MediaWriter> {
        self.media.audio_writer()
    }

    /// Wait for the next meaningful response
    ///
    /// Returns [`WaitAnswer::EarlyMedia`] on a 183 carrying SDP — media is
    /// live at that point — and [`WaitAnswer::Answered`] once the 200 is
    /// processed and ACKed. Call again after early media to resume waiting.
    pub async fn wait_answer(self: &Arc<Self>) -> Result<WaitAnswer> {
        let mut tx_slot = self.invite_tx.lock().await;
        loop {
            let tx = tx_slot
                .as_mut()
                .ok_or(VoxideError::InvalidState("INVITE not in flight"))?;
            let deadline_snapshot = *self.answer_deadline.lock();
            let resp = match deadline_snapshot {
                Some(deadline) => {
                    let remaining = deadline
                        .saturating_duration_since(tokio::time::Instant::now());
                    if remaining.is_zero() {
                        self.cancel_locked(tx).await.ok();
                        self.terminate();
                        return Err(VoxideError::Sip(
                            voxide_sip_core::SipError::TransactionTimeout,
                        ));
                    }
                    tx.recv_timeout(remaining).await?
                }
                None => tx.recv().await?,
            };

            match resp.status.code() {
                100..=199 => {
                    self.dialog.absorb_response(&resp).ok();
                    if resp.status == StatusCode::RINGING {
                        self.set_state(SessionState::Ringing);
                    }
                    if resp.status == StatusCode::SESSION_PROGRESS && !resp.body.is_empty() {
                        match self.apply_early_media(&resp) {
                            Ok(true) => {
                                self.dialog.set_state(DialogState::Early);
                                self.set_state(SessionState::EarlyMedia);
                                return Ok(WaitAnswer::EarlyMedia);
                            }
                            Ok(false) => {}
                            Err(e) => {
                                // Keep waiting for the final response; the
                                // 200 may still carry a workable SDP.
                                warn!(error = %e, "ignoring unusable 183 SDP");
                            }
                        }
                    }
                }
                200..=299 => {
                    self.dialog.absorb_response(&resp).ok();
                    let outcome = self.apply_answer(&resp).await;
                    // The ACK goes out regardless of how the SDP looked.
                    if let Err(e) = self
                        .dialog
                        .write_ack(self.invite_cseq.load(Ordering::SeqCst), None)
                        .await
                    {
                        warn!(error = %e, "ACK send failed");
                    }
                    match outcome {
                        Ok(()) => {
                            self.dialog.set_state(DialogState::Confirmed);
                            self.set_state(SessionState::Confirmed);
                            info!(call_id = %self.dialog.call_id, "call answered");
                            *tx_slot = None;
                            return Ok(WaitAnswer::Answered);
                        }
                        Err(e) => {
                            warn!(error = %e, "unusable answer SDP, sending BYE");
                            self.dialog.bye().await.ok();
                            self.terminate();
                            *tx_slot = None;
                            return Err(e);
                        }
                    }
                }
                401 | 407 => {
                    self.ack_non_2xx(tx, &resp).await.ok();
                    let retried = self.auth_retried.swap(true, Ordering::SeqCst);
                    let Some(creds) = self.credentials.clone() else {
                        self.terminate();
                        return Err(VoxideError::Sip(voxide_sip_core::SipError::AuthFailed(
                            "challenged but no credentials configured".into(),
                        )));
                    };
                    if retried {
                        self.terminate();
                        return Err(VoxideError::Sip(voxide_sip_core::SipError::AuthFailed(
                            "challenge repeated after digest retry".into(),
                        )));
                    }
                    let mut retry = tx.request.clone();
                    retry.headers.remove("Via");
                    let cseq = self.dialog.next_cseq();
                    retry.headers.set("CSeq", format!("{} INVITE", cseq));
                    self.invite_cseq.store(cseq, Ordering::SeqCst);
                    if !answer_challenge(&resp, &mut retry, &creds, &new_tag())? {
                        self.terminate();
                        return Err(VoxideError::Sip(voxide_sip_core::SipError::AuthFailed(
                            "401/407 without a challenge".into(),
                        )));
                    }
                    debug!("answering digest challenge");
                    let dest = tx.dest;
                    let transport = tx.transport;
                    *tx_slot = Some(self.ua.send_request(retry, dest, transport).await?);
                }
                _ => {
                    self.ack_non_2xx(tx, &resp).await.ok();
                    self.terminate();
                    *tx_slot = None;
                    return Err(VoxideError::CallRejected {
                        code: resp.status.code(),
                        reason: resp.reason,
                    });
                }
            }
        }
    }

    /// Apply a 183 SDP and publish early media; Ok(false) when media is
    /// already live from an earlier 183
    fn apply_early_media(&self, resp: &Response) -> Result<bool> {
        let session = self.pending_session.lock().take();
        let Some(session) = session else {
            return Ok(false);
        };
        if let Err(e) = session.set_remote_sdp(&resp.body) {
            // Keep the offer around for the final response.
            *self.pending_session.lock() = Some(session);
            return Err(VoxideError::Media(e));
        }
        *self.early_sdp.lock() = Some(resp.body.to_vec());
        self.media.init_media(session)?;
        Ok(true)
    }

    /// Apply the 200's SDP: first answer, no-op repeat, or early-media
    /// renegotiation (fork, as on re-INVITE)
    async fn apply_answer(&self, resp: &Response) -> Result<()> {
        if resp.body.is_empty() {
            return Err(VoxideError::MissingSdp);
        }
        let pending = self.pending_session.lock().take();
        match pending {
            Some(session) => {
                session.set_remote_sdp(&resp.body).map_err(|e| match e {
                    voxide_media_core::MediaError::NoCompatibleCodec => {
                        VoxideError::NoCompatibleMedia
                    }
                    other => VoxideError::Media(other),
                })?;
                self.media.init_media(session)
            }
            None => {
                // Early media already live; fork only if the 200 differs.
                let early = self.early_sdp.lock().clone();
                if early.as_deref() == Some(&resp.body[..]) {
                    return Ok(());
                }
                self.media.sdp_re_invite(&resp.body).await.map(|_| ())
            }
        }
    }

    /// Re-send the ACK for the answered INVITE (2xx retransmission path)
    pub async fn ack(&self) -> Result<()> {
        self.dialog
            .write_ack(self.invite_cseq.load(Ordering::SeqCst), None)
            .await
            .map_err(VoxideError::from)
    }

    /// Renegotiate mid-call with the current local SDP
    pub async fn re_invite(&self) -> Result<()> {
        if self.state() != SessionState::Confirmed {
            return Err(VoxideError::InvalidState("re-INVITE requires a confirmed dialog"));
        }
        let session = self.media.session()?;
        let mut req = self.dialog.make_request(Method::Invite);
        let cseq = req.cseq()?.seq;
        req.set_body("application/sdp", session.local_sdp().into_bytes());
        let resp = self.dialog.do_request(req).await?;
        if !resp.status.is_success() {
            return Err(VoxideError::CallRejected {
                code: resp.status.code(),
                reason: resp.reason,
            });
        }
        session
            .set_remote_sdp(&resp.body)
            .map_err(VoxideError::Media)?;
        self.dialog.write_ack(cseq, None).await?;
        Ok(())
    }

    /// Ask the peer to call `target` (blind transfer)
    pub async fn refer(&self, target: &Uri) -> Result<()> {
        if self.state() != SessionState::Confirmed {
            return Err(VoxideError::InvalidState("REFER requires a confirmed dialog"));
        }
        let mut req = self.dialog.make_request(Method::Refer);
        req.headers.push("Refer-To", format!("<{}>", target));
        let resp = self.dialog.do_request(req).await?;
        if resp.status != StatusCode::ACCEPTED && !resp.status.is_success() {
            return Err(VoxideError::CallRejected {
                code: resp.status.code(),
                reason: resp.reason,
            });
        }
        Ok(())
    }

    /// Hook invoked with each sipfrag status from REFER NOTIFYs
    pub fn on_notify<F>(&self, hook: F)
    where
        F: Fn(u16) + Send + Sync + 'static,
    {
        *self.on_notify.lock() = Some(Box::new(hook));
    }

    /// Tear the call down: BYE once confirmed, CANCEL while ringing
    pub async fn hangup(&self) -> Result<()> {
        match self.state() {
            SessionState::Terminated => Ok(()),
            SessionState::Confirmed | SessionState::Answered => {
                let result = self.dialog.bye().await;
                self.terminate();
                result.map_err(VoxideError::from)
            }
            _ => {
                let mut tx_slot = self.invite_tx.lock().await;
                if let Some(tx) = tx_slot.as_ref() {
                    self.cancel_locked(tx).await.ok();
                }
                *tx_slot = None;
                self.terminate();
                Ok(())
            }
        }
    }

    /// CANCEL the in-flight INVITE (same branch, same Via)
    async fn cancel_locked(&self, tx: &ClientTransaction) -> Result<()> {
        let mut cancel = Request::new(Method::Cancel, tx.request.uri.clone());
        for name in ["Via", "From", "To", "Call-ID"] {
            if let Some(value) = tx.request.headers.get(name) {
                cancel.headers.push(name, value);
            }
        }
        let seq = tx.request.cseq()?.seq;
        cancel.headers.push("CSeq", format!("{} CANCEL", seq));
        cancel.headers.push("Max-Forwards", "70");
        self.ua.send_ack(cancel, tx.dest, tx.transport).await?;
        debug!(call_id = %self.dialog.call_id, "CANCEL sent");
        Ok(())
    }

    /// Transaction-level ACK for a non-2xx final (RFC 3261 17.1.1.3)
    async fn ack_non_2xx(&self, tx: &ClientTransaction, resp: &Response) -> Result<()> {
        let mut ack = Request::new(Method::Ack, tx.request.uri.clone());
        for name in ["Via", "From", "Call-ID"] {
            if let Some(value) = tx.request.headers.get(name) {
                ack.headers.push(name, value);
            }
        }
        // To mirrors the response so its tag matches.
        if let Some(to) = resp.headers.get("To") {
            ack.headers.push("To", to);
        }
        let seq = tx.request.cseq()?.seq;
        ack.headers.push("CSeq", format!("{} ACK", seq));
        ack.headers.push("Max-Forwards", "70");
        self.ua.send_ack(ack, tx.dest, tx.transport).await
            .map_err(VoxideError::from)
    }

    pub(crate) fn terminate(&self) {
        self.media.close();
        self.dialog.set_state(DialogState::Terminated);
        self.set_state(SessionState::Terminated);
    }

    // In-dialog request handlers, driven by the endpoint's router.

    pub(crate) async fn handle_bye(&self, tx: &Arc<ServerTransaction>) -> Result<()> {
        tx.respond_status(StatusCode::OK).await?;
        info!(call_id = %self.dialog.call_id, "BYE received");
        self.terminate();
        Ok(())
    }

    pub(crate) async fn handle_re_invite(
        &self,
        req: &Request,
        tx: &Arc<ServerTransaction>,
    ) -> Result<()> {
        handle_re_invite(&self.media, &self.dialog, req, tx).await
    }

    pub(crate) async fn handle_notify(
        &self,
        req: &Request,
        tx: &Arc<ServerTransaction>,
    ) -> Result<()> {
        if let Some(code) = crate::session::parse_sipfrag(&req.body) {
            if let Some(hook) = self.on_notify.lock().as_ref() {
                hook(code);
            }
        }
        tx.respond_status(StatusCode::OK).await?;
        Ok(())
    }

    pub(crate) fn dialog(&self) -> &Arc<Dialog> {
        &self.dialog
    }
}

#[async_trait]
impl DialogSession for ClientSession {
    fn session_id(&self) -> String {
        self.id()
    }

    fn media(&self) -> &Arc<DialogMedia> {
        &self.media
    }

    fn sip_dialog(&self) -> &Arc<Dialog> {
        &self.dialog
    }

    async fn hangup(&self) -> Result<()> {
        ClientSession::hangup(self).await
    }
}

/// Keep exactly one audio codec from the originator's negotiation, plus its
/// matching-rate telephone-event codec when present, so bridged legs never
/// need transcoding
fn preserve_originator_codecs(originator: &[Codec], local: &[Codec]) -> Vec<Codec> {
    let Some(audio) = originator
        .iter()
        .find(|c| c.is_audio() && local.iter().any(|l| l.is_compatible(c)))
    else {
        return Vec::new();
    };
    let mut kept = vec![*audio];
    if let Some(dtmf) = originator
        .iter()
        .find(|c| c.is_telephone_event() && c.sample_rate == audio.sample_rate)
    {
        kept.push(*dtmf);
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxide_media_core::{PCMA, PCMU, TELEPHONE_EVENT};

    #[test]
    fn originator_preservation_keeps_one_audio_plus_dtmf() {
        let negotiated = vec![PCMA, PCMU, TELEPHONE_EVENT];
        let local = vec![PCMU, PCMA, TELEPHONE_EVENT];
        let kept = preserve_originator_codecs(&negotiated, &local);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0], PCMA);
        assert!(kept[1].is_telephone_event());
    }

    #[test]
    fn originator_preservation_empty_when_incompatible() {
        let kept = preserve_originator_codecs(&[PCMA], &[PCMU]);
        assert!(kept.is_empty());
    }

    #[test]
    fn originator_preservation_without_dtmf() {
        let kept = preserve_originator_codecs(&[PCMU], &[PCMU, PCMA]);
        assert_eq!(kept, vec![PCMU]);
    }
}
