//! Transaction layer
//!
//! A reduced RFC 3261 transaction machinery: client transactions retransmit
//! over datagram transports on a T1-doubling schedule and expire after 64*T1;
//! INVITE server transactions retransmit their final response until the ACK
//! arrives. Matching uses the Via branch plus the CSeq method, with the
//! special ACK/CANCEL rules handled by the dispatcher in `user_agent`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::error::{Result, SipError};
use crate::transport::{TransportKind, TransportLayer};
use crate::types::{Method, Request, Response, StatusCode};

/// SIP timer T1 (RTT estimate)
pub const T1: Duration = Duration::from_millis(500);
/// SIP timer T2 (retransmission cap)
pub const T2: Duration = Duration::from_secs(4);
/// Overall transaction lifetime, 64*T1
pub const TRANSACTION_TIMEOUT: Duration = Duration::from_secs(32);

/// Transaction key: Via branch + CSeq method
///
/// CANCEL shares its INVITE's branch but keys separately by method, per
/// RFC 3261 17.2.3.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TxKey {
    pub branch: String,
    pub method: Method,
}

/// Client transaction: the response stream for one sent request
pub struct ClientTransaction {
    pub key: TxKey,
    pub request: Request,
    pub dest: SocketAddr,
    pub transport: TransportKind,
    responses: mpsc::Receiver<Response>,
    // Signals the retransmit task that a response arrived.
    pub(crate) answered: Arc<watch::Sender<bool>>,
    // Removes the routing entry when the caller is done with the transaction.
    pub(crate) registry: Arc<Mutex<std::collections::HashMap<TxKey, ClientTxEntry>>>,
}

#[derive(Clone)]
pub(crate) struct ClientTxEntry {
    pub sender: mpsc::Sender<Response>,
    pub answered: Arc<watch::Sender<bool>>,
}

impl ClientTransaction {
    pub(crate) fn new(
        key: TxKey,
        request: Request,
        dest: SocketAddr,
        transport: TransportKind,
        responses: mpsc::Receiver<Response>,
        answered: Arc<watch::Sender<bool>>,
        registry: Arc<Mutex<std::collections::HashMap<TxKey, ClientTxEntry>>>,
    ) -> Self {
        ClientTransaction {
            key,
            request,
            dest,
            transport,
            responses,
            answered,
            registry,
        }
    }

    /// Next response, provisional or final
    pub async fn recv(&mut self) -> Result<Response> {
        match tokio::time::timeout(TRANSACTION_TIMEOUT, self.responses.recv()).await {
            Ok(Some(resp)) => Ok(resp),
            Ok(None) => Err(SipError::TransactionTerminated),
            Err(_) => Err(SipError::TransactionTimeout),
        }
    }

    /// Next response within `timeout`
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Response> {
        match tokio::time::timeout(timeout, self.responses.recv()).await {
            Ok(Some(resp)) => Ok(resp),
            Ok(None) => Err(SipError::TransactionTerminated),
            Err(_) => Err(SipError::TransactionTimeout),
        }
    }

    /// Discard provisionals and return the final response
    pub async fn wait_final(&mut self) -> Result<Response> {
        loop {
            let resp = self.recv().await?;
            if resp.status.is_final() {
                return Ok(resp);
            }
            trace!(status = %resp.status, "provisional response");
        }
    }
}

impl Drop for ClientTransaction {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.key);
        let _ = self.answered.send(true);
    }
}

/// Spawn the datagram retransmission schedule for a client request
pub(crate) fn spawn_client_retransmit(
    transport: Arc<TransportLayer>,
    kind: TransportKind,
    dest: SocketAddr,
    wire: Vec<u8>,
    answered: &Arc<watch::Sender<bool>>,
) {
    if !kind.is_unreliable() {
        return;
    }
    let mut seen = answered.subscribe();
    tokio::spawn(async move {
        let mut interval = T1;
        let deadline = tokio::time::Instant::now() + TRANSACTION_TIMEOUT;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = seen.changed() => return,
            }
            if *seen.borrow() || tokio::time::Instant::now() >= deadline {
                return;
            }
            trace!(%dest, "retransmitting request");
            if transport.send(kind, dest, &wire).await.is_err() {
                return;
            }
            interval = (interval * 2).min(T2);
        }
    });
}

/// Server transaction for one inbound request
///
/// Handles response sending, final-response retransmission (INVITE over
/// datagram transports), ACK arrival and CANCEL notification.
pub struct ServerTransaction {
    pub key: TxKey,
    pub request: Request,
    pub source: SocketAddr,
    pub transport: TransportKind,
    transport_layer: Arc<TransportLayer>,
    last_response: Mutex<Option<Vec<u8>>>,
    acked_tx: watch::Sender<bool>,
    cancelled_tx: watch::Sender<bool>,
}

impl ServerTransaction {
    pub(crate) fn new(
        key: TxKey,
        request: Request,
        source: SocketAddr,
        transport: TransportKind,
        transport_layer: Arc<TransportLayer>,
    ) -> Arc<Self> {
        let (acked_tx, _) = watch::channel(false);
        let (cancelled_tx, _) = watch::channel(false);
        Arc::new(ServerTransaction {
            key,
            request,
            source,
            transport,
            transport_layer,
            last_response: Mutex::new(None),
            acked_tx,
            cancelled_tx,
        })
    }

    /// Send a response for this transaction
    ///
    /// A final INVITE response over UDP keeps retransmitting until the ACK
    /// lands or the transaction times out.
    pub async fn respond(self: &Arc<Self>, resp: Response) -> Result<()> {
        let wire = resp.render();
        *self.last_response.lock() = Some(wire.clone());
        self.transport_layer
            .send(self.transport, self.source, &wire)
            .await?;

        if self.request.method == Method::Invite
            && resp.status.is_final()
            && self.transport.is_unreliable()
        {
            let this = self.clone();
            let mut acked = self.acked_tx.subscribe();
            tokio::spawn(async move {
                let mut interval = T1;
                let deadline = tokio::time::Instant::now() + TRANSACTION_TIMEOUT;
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = acked.changed() => return,
                    }
                    if *acked.borrow() || tokio::time::Instant::now() >= deadline {
                        return;
                    }
                    let wire = this.last_response.lock().clone();
                    if let Some(wire) = wire {
                        trace!(dest = %this.source, "retransmitting final response");
                        if this
                            .transport_layer
                            .send(this.transport, this.source, &wire)
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }
            });
        }
        Ok(())
    }

    /// Convenience: respond with a bare status code
    pub async fn respond_status(self: &Arc<Self>, status: StatusCode) -> Result<()> {
        self.respond(Response::for_request(status, &self.request))
            .await
    }

    /// Re-send the last response (absorbs request retransmissions)
    pub(crate) async fn retransmit_last(&self) {
        let wire = self.last_response.lock().clone();
        if let Some(wire) = wire {
            if let Err(e) = self
                .transport_layer
                .send(self.transport, self.source, &wire)
                .await
            {
                warn!(error = %e, "failed to retransmit response");
            }
        }
    }

    /// Mark the ACK as received, stopping final-response retransmission
    pub(crate) fn mark_acked(&self) {
        let _ = self.acked_tx.send(true);
    }

    /// Mark the transaction as cancelled by the peer
    pub(crate) fn mark_cancelled(&self) {
        debug!("transaction cancelled by peer");
        let _ = self.cancelled_tx.send(true);
    }

    /// Wait until the ACK for a final response arrives
    pub async fn wait_ack(&self, timeout: Duration) -> Result<()> {
        let mut acked = self.acked_tx.subscribe();
        if *acked.borrow() {
            return Ok(());
        }
        tokio::time::timeout(timeout, async {
            while acked.changed().await.is_ok() {
                if *acked.borrow() {
                    return Ok(());
                }
            }
            Err(SipError::TransactionTerminated)
        })
        .await
        .map_err(|_| SipError::TransactionTimeout)?
    }

    /// Watch for a peer CANCEL
    pub fn cancelled(&self) -> watch::Receiver<bool> {
        self.cancelled_tx.subscribe()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled_tx.subscribe().borrow()
    }
}
