//! Registration client
//!
//! Keeps an authenticated registration alive: REGISTER, answer one digest
//! challenge, then refresh at three quarters of the granted expiry (never
//! more often than every 30 seconds) until stopped. Stopping deregisters
//! with `Expires: 0` on a best-effort basis.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use voxide_sip_core::auth::{answer_challenge, DigestCredentials};
use voxide_sip_core::types::MessageExt;
use voxide_sip_core::{
    new_call_id, new_tag, resolve_uri, Address, Method, Request, TransportKind, Uri, UserAgent,
};

use crate::endpoint::Endpoint;
use crate::error::{Result, VoxideError};

/// Floor for the refresh interval
const MIN_REFRESH: Duration = Duration::from_secs(30);

/// Options for `Endpoint::register`
#[derive(Debug, Clone)]
pub struct RegisterOptions {
    /// Requested registration lifetime
    pub expiry: Duration,
    /// Keep refreshing in the background
    pub refresh: bool,
}

impl Default for RegisterOptions {
    fn default() -> Self {
        RegisterOptions {
            expiry: Duration::from_secs(3600),
            refresh: true,
        }
    }
}

/// A live registration; dropping it does NOT deregister, call `stop`
pub struct Registration {
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Registration {
    /// End the refresh loop and deregister best-effort
    pub async fn stop(mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.task.take() {
            task.await.ok();
        }
    }
}

struct RegisterClient {
    ua: Arc<UserAgent>,
    registrar: Uri,
    dest: SocketAddr,
    transport: TransportKind,
    identity: Address,
    contact: Address,
    call_id: String,
    cseq: AtomicU32,
    credentials: Option<DigestCredentials>,
}

impl RegisterClient {
    fn build_request(&self, expiry_seconds: u64) -> Request {
        let mut registrar = self.registrar.clone();
        registrar.user = None;
        let mut req = Request::new(Method::Register, registrar);
        req.headers.push("From", self.identity.to_string());
        let mut to = self.identity.clone();
        to.params.retain(|(k, _)| !k.eq_ignore_ascii_case("tag"));
        req.headers.push("To", to.to_string());
        req.headers.push("Call-ID", self.call_id.clone());
        req.headers.push(
            "CSeq",
            format!("{} REGISTER", self.cseq.fetch_add(1, Ordering::SeqCst) + 1),
        );
        req.headers.push("Contact", self.contact.to_string());
        req.headers.push("Expires", expiry_seconds.to_string());
        req
    }

    /// One REGISTER round with a single digest retry; returns the granted
    /// expiry in seconds
    async fn register_once(&self, expiry_seconds: u64) -> Result<u64> {
        let req = self.build_request(expiry_seconds);
        let mut tx = self.ua.send_request(req, self.dest, self.transport).await?;
        let mut resp = tx.wait_final().await?;

        if matches!(resp.status.code(), 401 | 407) {
            let Some(creds) = &self.credentials else {
                return Err(VoxideError::Sip(voxide_sip_core::SipError::AuthFailed(
                    "registrar challenged but no credentials configured".into(),
                )));
            };
            let mut retry = self.build_request(expiry_seconds);
            if !answer_challenge(&resp, &mut retry, creds, &new_tag())? {
                return Err(VoxideError::Sip(voxide_sip_core::SipError::AuthFailed(
                    "challenge response without a challenge".into(),
                )));
            }
            debug!("answering registrar digest challenge");
            let mut retry_tx = self.ua.send_request(retry, self.dest, self.transport).await?;
            resp = retry_tx.wait_final().await?;
        }

        if !resp.status.is_success() {
            return Err(VoxideError::CallRejected {
                code: resp.status.code(),
                reason: resp.reason,
            });
        }

        let granted = resp
            .expires()
            .map(u64::from)
            .or_else(|| {
                resp.contact()
                    .and_then(|c| c.param("expires").and_then(|e| e.parse().ok()))
            })
            .unwrap_or(expiry_seconds);
        Ok(granted)
    }
}

impl Endpoint {
    /// Register `user` (the endpoint identity) at `registrar` and keep the
    /// registration refreshed
    pub async fn register(
        self: &Arc<Self>,
        registrar: Uri,
        opts: RegisterOptions,
    ) -> Result<Registration> {
        let transport =
            TransportKind::from_token(&registrar.transport()).unwrap_or(TransportKind::Udp);
        let dest = resolve_uri(&registrar).await?;
        let local = self.local_addr(transport)?;

        let mut identity_uri = Uri::new_user(self.config().user.clone(), registrar.host.clone());
        if let Some(port) = registrar.port {
            identity_uri = identity_uri.with_port(port);
        }
        let mut identity = Address::new(identity_uri);
        identity.set_tag(&new_tag());

        let contact_host = self
            .config()
            .external_sip_host
            .clone()
            .unwrap_or_else(|| local.ip().to_string());
        let contact_port = self.config().external_sip_port.unwrap_or(local.port());
        let contact = Address::new(
            Uri::new_user(self.config().user.clone(), contact_host).with_port(contact_port),
        );

        let client = Arc::new(RegisterClient {
            ua: self.user_agent().clone(),
            registrar,
            dest,
            transport,
            identity,
            contact,
            call_id: new_call_id(),
            cseq: AtomicU32::new(0),
            credentials: self.config().credentials.clone(),
        });

        let requested = opts.expiry.as_secs().max(60);
        let granted = client.register_once(requested).await?;
        info!(expiry = granted, "registered");

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task = if opts.refresh {
            let client = client.clone();
            Some(tokio::spawn(async move {
                let mut current = granted;
                loop {
                    let refresh_after =
                        Duration::from_secs(current.saturating_mul(3) / 4).max(MIN_REFRESH);
                    tokio::select! {
                        _ = tokio::time::sleep(refresh_after) => {}
                        _ = stop_rx.changed() => {
                            if let Err(e) = client.register_once(0).await {
                                debug!(error = %e, "deregister failed");
                            }
                            return;
                        }
                    }
                    match client.register_once(requested).await {
                        Ok(expiry) => {
                            current = expiry;
                            debug!(expiry, "registration refreshed");
                        }
                        Err(e) => {
                            warn!(error = %e, "registration refresh failed");
                        }
                    }
                }
            }))
        } else {
            None
        };

        Ok(Registration { stop_tx, task })
    }
}
