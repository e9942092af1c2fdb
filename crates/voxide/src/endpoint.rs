//! The voxide endpoint
//!
//! Owns the SIP user agent and the dialog registries. `serve` dispatches
//! inbound requests: a new INVITE becomes a server session handed to the
//! application handler (the call is hung up when the handler returns);
//! in-dialog ACK/BYE/INVITE/INFO/REFER/NOTIFY are routed by dialog id to
//! the server or client caches; OPTIONS pings are answered directly;
//! anything unmatched gets 481.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use voxide_sip_core::{
    request_dialog_id, Address, Dialog, DialogId, IncomingRequest, Method, Request,
    ServerTransaction, StatusCode, TransportKind, Uri, UserAgent,
};

use crate::bridge::Bridge;
use crate::client_session::{ClientSession, InviteOptions, WaitAnswer};
use crate::config::{EndpointConfig, MediaEnv};
use crate::error::{Result, VoxideError};
use crate::server_session::ServerSession;
use crate::session::{send_refer_notify, DialogSession};

/// Methods advertised in Allow
const ALLOW: &str = "INVITE, ACK, BYE, CANCEL, INFO, OPTIONS, REFER, NOTIFY";

/// A running SIP endpoint: listeners, registries, dial-out
pub struct Endpoint {
    ua: Arc<UserAgent>,
    config: EndpointConfig,
    server_sessions: DashMap<DialogId, Arc<ServerSession>>,
    client_sessions: DashMap<DialogId, Arc<ClientSession>>,
    /// Originated sessions whose dialog id is not complete yet
    pending_clients: Mutex<Vec<Arc<ClientSession>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Endpoint {
    /// Bind every configured transport and create the endpoint
    pub async fn new(config: EndpointConfig) -> Result<Arc<Endpoint>> {
        if config.transports.is_empty() {
            return Err(VoxideError::InvalidState("no transports configured"));
        }
        let ua = UserAgent::new();
        for transport in &config.transports {
            match transport.kind {
                TransportKind::Udp => {
                    let addr = ua.bind_udp(transport.bind).await?;
                    info!(%addr, "listening on UDP");
                }
                TransportKind::Tcp => {
                    let addr = ua.bind_tcp(transport.bind).await?;
                    info!(%addr, "listening on TCP");
                }
                TransportKind::Tls => {
                    let tls = config.tls.clone().ok_or(VoxideError::InvalidState(
                        "TLS transport configured without certificates",
                    ))?;
                    let addr = ua.bind_tls(transport.bind, tls).await?;
                    info!(%addr, "listening on TLS");
                }
            }
        }
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Arc::new(Endpoint {
            ua,
            config,
            server_sessions: DashMap::new(),
            client_sessions: DashMap::new(),
            pending_clients: Mutex::new(Vec::new()),
            shutdown_tx,
        }))
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub(crate) fn user_agent(&self) -> &Arc<UserAgent> {
        &self.ua
    }

    /// Local SIP address of the first bound transport of `kind`
    pub fn local_addr(&self, kind: TransportKind) -> Result<std::net::SocketAddr> {
        Ok(self.ua.local_addr(kind)?)
    }

    /// Stop `serve` and refuse further dispatch
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Serve inbound calls until `close` is called
    ///
    /// `handler` runs as its own task per call; when it returns the session
    /// is hung up (if the handler did not already) and dropped from the
    /// registry.
    pub async fn serve<F, Fut>(self: &Arc<Self>, handler: F) -> Result<()>
    where
        F: Fn(Arc<ServerSession>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut incoming = self
            .ua
            .take_incoming()
            .ok_or(VoxideError::InvalidState("serve may only be called once"))?;
        let handler = Arc::new(handler);
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            let request = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                maybe = incoming.recv() => match maybe {
                    Some(request) => request,
                    None => return Ok(()),
                },
            };
            if let Err(e) = self.dispatch(request, &handler).await {
                warn!(error = %e, "dispatch failed");
            }
        }
    }

    async fn dispatch<F, Fut>(
        self: &Arc<Self>,
        incoming: IncomingRequest,
        handler: &Arc<F>,
    ) -> Result<()>
    where
        F: Fn(Arc<ServerSession>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let IncomingRequest {
            request,
            source,
            transport,
            tx,
        } = incoming;

        match request.method.clone() {
            Method::Invite => {
                if let Some(id) = request_dialog_id(&request) {
                    // Mid-dialog renegotiation.
                    let tx = tx.ok_or(VoxideError::InvalidState("INVITE without transaction"))?;
                    if let Some(session) = self.server_sessions.get(&id).map(|s| s.clone()) {
                        return session.handle_re_invite(&request, &tx).await;
                    }
                    if let Some(session) = self.find_client(&id) {
                        return session.handle_re_invite(&request, &tx).await;
                    }
                    tx.respond_status(StatusCode::CALL_TRANSACTION_DOES_NOT_EXIST)
                        .await?;
                    return Ok(());
                }
                self.accept_invite(request, source, transport, tx, handler)
            }
            Method::Ack => {
                if let Some(id) = request_dialog_id(&request) {
                    if let Some(session) = self.server_sessions.get(&id).map(|s| s.clone()) {
                        session.handle_ack();
                    }
                }
                Ok(())
            }
            Method::Bye => {
                let tx = tx.ok_or(VoxideError::InvalidState("BYE without transaction"))?;
                match self.take_sessions(&request) {
                    (Some(session), _) => {
                        session.handle_bye(&tx).await?;
                        Ok(())
                    }
                    (_, Some(session)) => {
                        session.handle_bye(&tx).await?;
                        Ok(())
                    }
                    _ => {
                        tx.respond_status(StatusCode::CALL_TRANSACTION_DOES_NOT_EXIST)
                            .await?;
                        Ok(())
                    }
                }
            }
            Method::Info => {
                let tx = tx.ok_or(VoxideError::InvalidState("INFO without transaction"))?;
                let known = request_dialog_id(&request)
                    .map(|id| {
                        self.server_sessions.contains_key(&id) || self.find_client(&id).is_some()
                    })
                    .unwrap_or(false);
                let status = if known {
                    StatusCode::OK
                } else {
                    StatusCode::CALL_TRANSACTION_DOES_NOT_EXIST
                };
                tx.respond_status(status).await?;
                Ok(())
            }
            Method::Notify => {
                let tx = tx.ok_or(VoxideError::InvalidState("NOTIFY without transaction"))?;
                match self.lookup_sessions(&request) {
                    (Some(session), _) => session.handle_notify(&request, &tx).await,
                    (_, Some(session)) => session.handle_notify(&request, &tx).await,
                    _ => {
                        tx.respond_status(StatusCode::CALL_TRANSACTION_DOES_NOT_EXIST)
                            .await?;
                        Ok(())
                    }
                }
            }
            Method::Refer => {
                let tx = tx.ok_or(VoxideError::InvalidState("REFER without transaction"))?;
                match self.lookup_dyn(&request) {
                    Some(session) => {
                        self.clone().start_transfer(session, request, tx);
                        Ok(())
                    }
                    None => {
                        tx.respond_status(StatusCode::CALL_TRANSACTION_DOES_NOT_EXIST)
                            .await?;
                        Ok(())
                    }
                }
            }
            Method::Options => {
                let tx = tx.ok_or(VoxideError::InvalidState("OPTIONS without transaction"))?;
                let mut resp =
                    voxide_sip_core::Response::for_request(StatusCode::OK, &tx.request);
                resp.headers.push("Allow", ALLOW);
                tx.respond(resp).await?;
                Ok(())
            }
            Method::Cancel => Ok(()), // answered inside the transaction layer
            other => {
                debug!(method = %other, "unsupported method");
                if let Some(tx) = tx {
                    let mut resp = voxide_sip_core::Response::for_request(
                        StatusCode::NOT_IMPLEMENTED,
                        &tx.request,
                    );
                    resp.headers.push("Allow", ALLOW);
                    tx.respond(resp).await?;
                }
                Ok(())
            }
        }
    }

    /// New inbound call: create the server session and run the handler
    fn accept_invite<F, Fut>(
        self: &Arc<Self>,
        request: Request,
        source: std::net::SocketAddr,
        transport: TransportKind,
        tx: Option<Arc<ServerTransaction>>,
        handler: &Arc<F>,
    ) -> Result<()>
    where
        F: Fn(Arc<ServerSession>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let tx = tx.ok_or(VoxideError::InvalidState("INVITE without transaction"))?;
        let contact = self.local_contact(transport)?;
        let dialog = Dialog::new_uas(self.ua.clone(), &request, contact, source, transport)?;
        let session = ServerSession::new(
            self.ua.clone(),
            dialog.clone(),
            request,
            tx,
            MediaEnv::from(&self.config),
        );
        let Some(id) = dialog.id() else {
            return Err(VoxideError::InvalidState("UAS dialog without remote tag"));
        };
        self.server_sessions.insert(id.clone(), session.clone());
        info!(call_id = %id.call_id, from = %session.from_user(), "inbound call");

        let endpoint = self.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            handler(session.clone()).await;
            if let Err(e) = session.hangup().await {
                debug!(error = %e, "post-handler hangup");
            }
            endpoint.server_sessions.remove(&id);
        });
        Ok(())
    }

    /// Originate a call without waiting for the answer; drive it with
    /// `ClientSession::wait_answer`
    pub async fn invite(
        self: &Arc<Self>,
        target: Uri,
        opts: InviteOptions,
    ) -> Result<Arc<ClientSession>> {
        let transport =
            TransportKind::from_token(&target.transport()).unwrap_or(TransportKind::Udp);
        let identity = self.local_identity(transport)?;
        let contact = self.local_contact(transport)?;
        let session = ClientSession::invite(
            self.ua.clone(),
            MediaEnv::from(&self.config),
            self.config.credentials.clone(),
            identity,
            contact,
            target,
            opts,
        )
        .await?;
        self.pending_clients.lock().push(session.clone());
        Ok(session)
    }

    /// Originate a call and wait until it is answered
    pub async fn dial(
        self: &Arc<Self>,
        target: Uri,
        opts: InviteOptions,
    ) -> Result<Arc<ClientSession>> {
        let session = self.invite(target, opts).await?;
        let result = loop {
            match session.wait_answer().await {
                Ok(WaitAnswer::EarlyMedia) => continue,
                other => break other,
            }
        };
        self.promote_pending();
        match result {
            Ok(WaitAnswer::Answered) => Ok(session),
            Ok(WaitAnswer::EarlyMedia) => unreachable!("loop consumes early media"),
            Err(e) => {
                self.drop_client(&session);
                Err(e)
            }
        }
    }

    /// Dial and, once answered, add the new leg to `bridge`
    ///
    /// The offer is narrowed to the bridge originator's negotiated codec so
    /// the bridge never needs to transcode.
    pub async fn dial_bridge(
        self: &Arc<Self>,
        target: Uri,
        bridge: &Arc<Bridge>,
        mut opts: InviteOptions,
    ) -> Result<Arc<ClientSession>> {
        if opts.originator.is_none() {
            opts.originator = bridge.originator();
        }
        let session = self.dial(target, opts).await?;
        if let Err(e) = bridge.add_dialog_session(session.clone()).await {
            session.hangup().await.ok();
            return Err(e);
        }
        Ok(session)
    }

    /// Move pending originated sessions whose dialog id completed into the
    /// routable registry
    fn promote_pending(&self) {
        let mut pending = self.pending_clients.lock();
        pending.retain(|session| match session.dialog().id() {
            Some(id) => {
                self.client_sessions.insert(id, session.clone());
                false
            }
            None => true,
        });
    }

    fn find_client(&self, id: &DialogId) -> Option<Arc<ClientSession>> {
        self.promote_pending();
        self.client_sessions.get(id).map(|s| s.clone())
    }

    fn lookup_sessions(
        &self,
        request: &Request,
    ) -> (Option<Arc<ServerSession>>, Option<Arc<ClientSession>>) {
        let Some(id) = request_dialog_id(request) else {
            return (None, None);
        };
        (
            self.server_sessions.get(&id).map(|s| s.clone()),
            self.find_client(&id),
        )
    }

    /// Like `lookup_sessions`, but BYE also removes the entry
    fn take_sessions(
        &self,
        request: &Request,
    ) -> (Option<Arc<ServerSession>>, Option<Arc<ClientSession>>) {
        let Some(id) = request_dialog_id(request) else {
            return (None, None);
        };
        let server = self.server_sessions.remove(&id).map(|(_, s)| s);
        self.promote_pending();
        let client = self.client_sessions.remove(&id).map(|(_, s)| s);
        (server, client)
    }

    fn lookup_dyn(&self, request: &Request) -> Option<Arc<dyn DialogSession>> {
        let (server, client) = self.lookup_sessions(request);
        if let Some(s) = server {
            return Some(s);
        }
        if let Some(c) = client {
            return Some(c);
        }
        None
    }

    fn drop_client(&self, session: &Arc<ClientSession>) {
        self.pending_clients
            .lock()
            .retain(|s| !Arc::ptr_eq(s, session));
        if let Some(id) = session.dialog().id() {
            self.client_sessions.remove(&id);
        }
    }

    /// RFC 3515 transferee flow, run as its own task
    fn start_transfer(
        self: Arc<Self>,
        session: Arc<dyn DialogSession>,
        refer: Request,
        tx: Arc<ServerTransaction>,
    ) {
        tokio::spawn(async move {
            if let Err(e) = self.run_transfer(session, refer, tx).await {
                warn!(error = %e, "transfer failed");
            }
        });
    }

    async fn run_transfer(
        self: &Arc<Self>,
        session: Arc<dyn DialogSession>,
        refer: Request,
        tx: Arc<ServerTransaction>,
    ) -> Result<()> {
        let Some(refer_to) = refer
            .headers
            .get("Refer-To")
            .and_then(|v| v.parse::<Address>().ok())
        else {
            tx.respond_status(StatusCode::BAD_REQUEST).await?;
            return Ok(());
        };
        tx.respond_status(StatusCode::ACCEPTED).await?;
        info!(target = %refer_to.uri, "transfer accepted");

        let dialog = session.sip_dialog().clone();
        send_refer_notify(&dialog, StatusCode::TRYING, "Trying", false).await?;

        // Referred-By travels on the triggered INVITE (RFC 3892).
        let referred_by = refer
            .headers
            .get("Referred-By")
            .map(str::to_string)
            .or_else(|| refer.headers.get("From").map(str::to_string));
        let mut opts = InviteOptions {
            originator: Some(session.clone()),
            ..Default::default()
        };
        if let Some(referred_by) = referred_by {
            opts.headers.push(("Referred-By".to_string(), referred_by));
        }

        match self.dial(refer_to.uri.clone(), opts).await {
            Ok(new_leg) => {
                send_refer_notify(&dialog, StatusCode::OK, "OK", true).await.ok();
                // Bridge the referred party to the new leg.
                let bridge = Bridge::new();
                bridge.add_dialog_session(session.clone()).await?;
                if let Err(e) = bridge.add_dialog_session(new_leg.clone()).await {
                    warn!(error = %e, "bridging transferred call failed");
                    new_leg.hangup().await.ok();
                }
                Ok(())
            }
            Err(VoxideError::CallRejected { code, reason }) => {
                send_refer_notify(&dialog, StatusCode(code), &reason, true).await.ok();
                Ok(())
            }
            Err(e) => {
                send_refer_notify(
                    &dialog,
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Service Unavailable",
                    true,
                )
                .await
                .ok();
                Err(e)
            }
        }
    }

    /// Contact address advertised on the transport that carried the request
    fn local_contact(&self, transport: TransportKind) -> Result<Address> {
        let local = self.ua.local_addr(transport)?;
        let host = self
            .config
            .external_sip_host
            .clone()
            .unwrap_or_else(|| local.ip().to_string());
        let port = self.config.external_sip_port.unwrap_or_else(|| local.port());
        let mut uri = Uri::new_user(self.config.user.clone(), host).with_port(port);
        if transport != TransportKind::Udp {
            uri.set_param("transport", Some(&transport.as_str().to_ascii_lowercase()));
        }
        Ok(Address::new(uri))
    }

    /// From identity for originated requests
    fn local_identity(&self, transport: TransportKind) -> Result<Address> {
        self.local_contact(transport)
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
