//! UAS dialog session
//!
//! Drives an inbound INVITE through the answering state machine:
//! Init → Trying → (Ringing | EarlyMedia) → Answered → Confirmed →
//! Terminated. Media is negotiated against the INVITE's offer; `answer`
//! sends the 200 and waits for the ACK; `progress_media` opens the
//! early-media path under a 183.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use voxide_media_core::{MediaError, MediaSession};
use voxide_sip_core::types::MessageExt;
use voxide_sip_core::{
    Dialog, DialogState, Request, Response, ServerTransaction, StatusCode, UserAgent,
};

use crate::config::MediaEnv;
use crate::dialog_media::DialogMedia;
use crate::error::{Result, VoxideError};
use crate::session::{handle_re_invite, sdp_body, DialogSession, SessionState};

type NotifyHook = Box<dyn Fn(u16) + Send + Sync>;

/// One answered or answering inbound call
pub struct ServerSession {
    ua: Arc<UserAgent>,
    dialog: Arc<Dialog>,
    invite: Request,
    invite_tx: Arc<ServerTransaction>,
    media: Arc<DialogMedia>,
    env: MediaEnv,
    state_tx: watch::Sender<SessionState>,
    on_notify: Mutex<Option<NotifyHook>>,
}

impl ServerSession {
    pub(crate) fn new(
        ua: Arc<UserAgent>,
        dialog: Arc<Dialog>,
        invite: Request,
        invite_tx: Arc<ServerTransaction>,
        env: MediaEnv,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SessionState::Init);
        Arc::new(ServerSession {
            ua,
            dialog,
            invite,
            invite_tx,
            media: Arc::new(DialogMedia::new()),
            env,
            state_tx,
            on_notify: Mutex::new(None),
        })
    }

    /// Dialog identifier (Call-ID)
    pub fn id(&self) -> String {
        self.dialog.call_id.clone()
    }

    /// User part of the INVITE's From
    pub fn from_user(&self) -> String {
        self.invite
            .from_header()
            .ok()
            .and_then(|a| a.uri.user)
            .unwrap_or_default()
    }

    /// User part of the request URI (the called party)
    pub fn to_user(&self) -> String {
        self.invite.uri.user.clone().unwrap_or_default()
    }

    /// The INVITE that created this session
    pub fn invite_request(&self) -> &Request {
        &self.invite
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.subscribe().borrow()
    }

    pub fn state_channel(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Completes when the dialog terminates (the session "context")
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
            debug!(call_id = %self.dialog.call_id, ?state, "server session state");
            let _ = self.state_tx.send(state);
        }
    }

    /// 100 Trying
    pub async fn progress(&self) -> Result<()> {
        self.check_not_final("progress")?;
        self.invite_tx
            .respond(Response::for_request(StatusCode::TRYING, &self.invite))
            .await?;
        self.set_state(SessionState::Trying);
        Ok(())
    }

    /// 180 Ringing, no SDP
    pub async fn ringing(&self) -> Result<()> {
        self.check_not_final("ringing")?;
        self.invite_tx
            .respond(self.make_response(StatusCode::RINGING))
            .await?;
        self.set_state(SessionState::Ringing);
        Ok(())
    }

    /// 183 Session Progress with an SDP answer; media becomes writable
    /// before the call is answered
    pub async fn progress_media(&self) -> Result<()> {
        self.check_not_final("progress_media")?;
        self.ensure_media().await?;
        let mut resp = self.make_response(StatusCode::SESSION_PROGRESS);
        resp.set_body("application/sdp", self.media.session()?.local_sdp().into_bytes());
        self.invite_tx.respond(resp).await?;
        self.dialog.set_state(DialogState::Early);
        self.set_state(SessionState::EarlyMedia);
        Ok(())
    }

    /// 200 OK with SDP, then await the ACK
    pub async fn answer(&self) -> Result<()> {
        self.answer_options(&[]).await
    }

    /// Like `answer`, with extra response headers
    pub async fn answer_options(&self, headers: &[(&str, &str)]) -> Result<()> {
        self.check_not_final("answer")?;
        if self.invite_tx.is_cancelled() {
            self.invite_tx
                .respond_status(StatusCode::REQUEST_TERMINATED)
                .await?;
            self.terminate();
            return Err(VoxideError::InvalidState("INVITE was cancelled"));
        }
        if let Err(e) = self.ensure_media().await {
            let status = match &e {
                VoxideError::NoCompatibleMedia => StatusCode::NOT_ACCEPTABLE_HERE,
                VoxideError::MissingSdp => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            self.invite_tx.respond_status(status).await.ok();
            self.terminate();
            return Err(e);
        }

        let mut resp = self.make_response(StatusCode::OK);
        for (name, value) in headers {
            resp.headers.push(*name, *value);
        }
        resp.set_body("application/sdp", self.media.session()?.local_sdp().into_bytes());
        self.invite_tx.respond(resp).await?;
        self.set_state(SessionState::Answered);

        match self.invite_tx.wait_ack(self.env.ack_timeout).await {
            Ok(()) => {
                self.dialog.set_state(DialogState::Confirmed);
                self.set_state(SessionState::Confirmed);
                info!(call_id = %self.dialog.call_id, "call answered");
                Ok(())
            }
            Err(_) => {
                warn!(call_id = %self.dialog.call_id, "no ACK for 200");
                self.terminate();
                Err(VoxideError::NoAck)
            }
        }
    }

    /// Arbitrary response with optional body and extra headers
    pub async fn respond(
        &self,
        status: StatusCode,
        reason: Option<&str>,
        body: Option<(&str, Vec<u8>)>,
        headers: &[(&str, &str)],
    ) -> Result<()> {
        let mut resp = self.make_response(status);
        if let Some(reason) = reason {
            resp.reason = reason.to_string();
        }
        for (name, value) in headers {
            resp.headers.push(*name, *value);
        }
        if let Some((content_type, body)) = body {
            resp.set_body(content_type, body);
        }
        self.invite_tx.respond(resp).await?;
        if status.is_final() && !status.is_success() {
            self.terminate();
        }
        Ok(())
    }

    /// Tear the call down: BYE once established, a final non-2xx otherwise
    pub async fn hangup(&self) -> Result<()> {
        let state = self.state();
        match state {
            SessionState::Terminated => Ok(()),
            SessionState::Answered | SessionState::Confirmed => {
                let result = self.dialog.bye().await;
                self.terminate();
                result.map_err(VoxideError::from)
            }
            _ => {
                let status = if self.invite_tx.is_cancelled() {
                    StatusCode::REQUEST_TERMINATED
                } else {
                    StatusCode::TEMPORARILY_UNAVAILABLE
                };
                self.invite_tx.respond_status(status).await.ok();
                self.terminate();
                Ok(())
            }
        }
    }

    /// Watch for a peer CANCEL of the pending INVITE
    pub fn cancelled(&self) -> tokio::sync::watch::Receiver<bool> {
        self.invite_tx.cancelled()
    }

    /// Send an in-dialog REFER asking the peer to call `target`
    pub async fn refer(&self, target: &voxide_sip_core::Uri) -> Result<()> {
        if self.state() != SessionState::Confirmed {
            return Err(VoxideError::InvalidState("REFER requires a confirmed dialog"));
        }
        let mut req = self.dialog.make_request(voxide_sip_core::Method::Refer);
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

    /// Per-call media: reader/writer chain and hooks
    pub fn media(&self) -> &Arc<DialogMedia> {
        &self.media
    }

    /// Head of the audio read chain
    pub fn audio_reader(&self) -> Result<crate::dialog_media::MediaReader> {
        self.media.audio_reader()
    }

    /// Head of the audio write chain
    pub fn audio_writer(&self) -> Result<crate::dialog_media::MediaWriter> {
        self.media.audio_writer()
    }

    fn make_response(&self, status: StatusCode) -> Response {
        let mut resp = Response::for_request(status, &self.invite);
        if status != StatusCode::TRYING {
            if let Ok(mut to) = resp.to_header() {
                if to.tag().is_none() {
                    to.set_tag(&self.dialog.local_tag);
                    resp.headers.set("To", to.to_string());
                }
            }
            resp.headers
                .set("Contact", self.dialog.local_contact().to_string());
        }
        resp
    }

    /// Bind media and apply the INVITE's offer, once
    async fn ensure_media(&self) -> Result<()> {
        if self.media.session().is_ok() {
            return Ok(());
        }
        let body = sdp_body(&self.invite).ok_or(VoxideError::MissingSdp)?;
        let mut session = MediaSession::new(self.env.media_ip, self.env.codecs.clone()).await?;
        session.set_external_ip(self.env.external_media_ip);
        session.set_remote_sdp(body).map_err(|e| match e {
            MediaError::NoCompatibleCodec => VoxideError::NoCompatibleMedia,
            other => VoxideError::Media(other),
        })?;
        self.media.init_media(Arc::new(session))
    }

    fn check_not_final(&self, op: &'static str) -> Result<()> {
        match self.state() {
            SessionState::Terminated => Err(VoxideError::InvalidState(op)),
            SessionState::Answered | SessionState::Confirmed => {
                Err(VoxideError::InvalidState(op))
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn terminate(&self) {
        self.media.close();
        self.dialog.set_state(DialogState::Terminated);
        self.set_state(SessionState::Terminated);
        self.ua.release_server_tx(&self.invite_tx.key);
    }

    // In-dialog request handlers, driven by the endpoint's router.

    pub(crate) fn handle_ack(&self) {
        if self.state() == SessionState::Answered {
            self.dialog.set_state(DialogState::Confirmed);
            self.set_state(SessionState::Confirmed);
        }
    }

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
            // Consult the hook without holding the lock across the respond.
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

    pub(crate) fn invite_tx(&self) -> &Arc<ServerTransaction> {
        &self.invite_tx
    }
}

#[async_trait]
impl DialogSession for ServerSession {
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
        ServerSession::hangup(self).await
    }
}
