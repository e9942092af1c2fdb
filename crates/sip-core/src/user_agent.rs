//! User agent core
//!
//! Owns the transport layer and the transaction tables, and runs the
//! dispatcher that routes every inbound message: responses to their client
//! transaction, retransmitted requests back to their server transaction,
//! ACK and CANCEL to the INVITE they belong to, and everything else to the
//! application's incoming queue.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::{Result, SipError};
use crate::transaction::{
    spawn_client_retransmit, ClientTransaction, ClientTxEntry, ServerTransaction, TxKey,
};
use crate::transport::{Incoming, TransportKind, TransportLayer};
use crate::types::{
    MessageExt, Method, Request, SipMessage, StatusCode, Uri, Via, BRANCH_MAGIC_COOKIE,
};

/// One application-visible inbound request
///
/// ACK carries no transaction (there is nothing to respond to); every other
/// method comes with the server transaction to respond through.
pub struct IncomingRequest {
    pub request: Request,
    pub source: SocketAddr,
    pub transport: TransportKind,
    pub tx: Option<Arc<ServerTransaction>>,
}

/// The SIP user agent: transports + transactions + dispatcher
pub struct UserAgent {
    transport: Arc<TransportLayer>,
    client_txs: Arc<Mutex<HashMap<TxKey, ClientTxEntry>>>,
    server_txs: Arc<Mutex<HashMap<TxKey, Arc<ServerTransaction>>>>,
    incoming_tx: mpsc::Sender<IncomingRequest>,
    incoming_rx: Mutex<Option<mpsc::Receiver<IncomingRequest>>>,
}

impl UserAgent {
    /// Create the agent; transports are bound separately
    pub fn new() -> Arc<Self> {
        let (transport, transport_rx) = TransportLayer::new();
        let (incoming_tx, incoming_rx) = mpsc::channel(64);

        let ua = Arc::new(UserAgent {
            transport,
            client_txs: Arc::new(Mutex::new(HashMap::new())),
            server_txs: Arc::new(Mutex::new(HashMap::new())),
            incoming_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
        });

        let dispatcher = ua.clone();
        tokio::spawn(async move {
            dispatcher.dispatch_loop(transport_rx).await;
        });

        ua
    }

    pub fn transport(&self) -> &Arc<TransportLayer> {
        &self.transport
    }

    pub async fn bind_udp(&self, addr: SocketAddr) -> Result<SocketAddr> {
        self.transport.bind_udp(addr).await
    }

    pub async fn bind_tcp(&self, addr: SocketAddr) -> Result<SocketAddr> {
        self.transport.bind_tcp(addr).await
    }

    pub async fn bind_tls(
        &self,
        addr: SocketAddr,
        config: crate::transport::TlsConfig,
    ) -> Result<SocketAddr> {
        self.transport.bind_tls(addr, config).await
    }

    pub fn local_addr(&self, kind: TransportKind) -> Result<SocketAddr> {
        self.transport.local_addr(kind)
    }

    /// Take the incoming-request receiver; may be taken once
    pub fn take_incoming(&self) -> Option<mpsc::Receiver<IncomingRequest>> {
        self.incoming_rx.lock().take()
    }

    /// Send `req` to `dest`, creating a client transaction
    ///
    /// A fresh Via with a new branch is pushed on top; Max-Forwards is added
    /// when absent.
    pub async fn send_request(
        self: &Arc<Self>,
        mut req: Request,
        dest: SocketAddr,
        kind: TransportKind,
    ) -> Result<ClientTransaction> {
        let local = self.transport.local_addr(kind)?;
        let branch = new_branch();
        let mut via = Via::new(kind.as_str(), local.ip().to_string(), local.port());
        via.set_param("branch", Some(&branch));
        req.headers.push_front("Via", via.to_string());
        if !req.headers.contains("Max-Forwards") {
            req.headers.push("Max-Forwards", "70");
        }

        let key = TxKey {
            branch,
            method: req.cseq()?.method,
        };
        let (resp_tx, resp_rx) = mpsc::channel(8);
        let (answered_tx, _) = tokio::sync::watch::channel(false);
        let answered = Arc::new(answered_tx);
        self.client_txs.lock().insert(
            key.clone(),
            ClientTxEntry {
                sender: resp_tx,
                answered: answered.clone(),
            },
        );

        let wire = req.render();
        self.transport.send(kind, dest, &wire).await?;
        spawn_client_retransmit(self.transport.clone(), kind, dest, wire, &answered);

        Ok(ClientTransaction::new(
            key,
            req,
            dest,
            kind,
            resp_rx,
            answered,
            self.client_txs.clone(),
        ))
    }

    /// Send a request without creating a transaction (ACK)
    pub async fn send_ack(
        &self,
        mut req: Request,
        dest: SocketAddr,
        kind: TransportKind,
    ) -> Result<()> {
        let local = self.transport.local_addr(kind)?;
        if req.headers.get("Via").is_none() {
            let mut via = Via::new(kind.as_str(), local.ip().to_string(), local.port());
            via.set_param("branch", Some(&new_branch()));
            req.headers.push_front("Via", via.to_string());
        }
        self.transport.send(kind, dest, &req.render()).await
    }

    /// Forget a server transaction once its dialog work is done
    pub fn release_server_tx(&self, key: &TxKey) {
        self.server_txs.lock().remove(key);
    }

    async fn dispatch_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Incoming>) {
        while let Some(incoming) = rx.recv().await {
            match incoming.msg {
                SipMessage::Response(resp) => self.dispatch_response(resp),
                SipMessage::Request(req) => {
                    self.dispatch_request(req, incoming.source, incoming.transport)
                        .await
                }
            }
        }
        debug!("dispatcher stopped: transport channel closed");
    }

    fn dispatch_response(&self, resp: crate::types::Response) {
        let Ok(via) = resp.top_via() else {
            warn!("response without Via, dropping");
            return;
        };
        let Some(branch) = via.branch().map(str::to_string) else {
            warn!("response without branch, dropping");
            return;
        };
        let Ok(cseq) = resp.cseq() else {
            warn!("response without CSeq, dropping");
            return;
        };
        let key = TxKey {
            branch,
            method: cseq.method,
        };
        let entry = self.client_txs.lock().get(&key).cloned();
        match entry {
            Some(entry) => {
                let _ = entry.answered.send(true);
                if entry.sender.try_send(resp).is_err() {
                    trace!("client transaction queue full or gone");
                }
            }
            None => {
                trace!(status = %resp.status, "stray response, no matching transaction");
            }
        }
    }

    async fn dispatch_request(
        self: &Arc<Self>,
        req: Request,
        source: SocketAddr,
        transport: TransportKind,
    ) {
        let Ok(via) = req.top_via() else {
            warn!("request without Via, dropping");
            return;
        };
        let branch = via
            .branch()
            .unwrap_or(BRANCH_MAGIC_COOKIE)
            .to_string();

        match req.method {
            Method::Ack => {
                // Stop final-response retransmission on the INVITE server
                // transaction this ACK belongs to, then let the dialog layer
                // see it (2xx ACKs carry a new branch, so match on
                // Call-ID + CSeq number).
                let call_id = req.call_id().map(str::to_string).unwrap_or_default();
                let seq = req.cseq().map(|c| c.seq).unwrap_or(0);
                let matched = self
                    .server_txs
                    .lock()
                    .values()
                    .find(|tx| {
                        tx.request.method == Method::Invite
                            && tx.request.call_id().map(str::to_string).unwrap_or_default()
                                == call_id
                            && tx.request.cseq().map(|c| c.seq).unwrap_or(u32::MAX) == seq
                    })
                    .cloned();
                if let Some(tx) = matched {
                    tx.mark_acked();
                }
                self.deliver(IncomingRequest {
                    request: req,
                    source,
                    transport,
                    tx: None,
                })
                .await;
            }
            Method::Cancel => {
                let invite_key = TxKey {
                    branch: branch.clone(),
                    method: Method::Invite,
                };
                let invite_tx = self.server_txs.lock().get(&invite_key).cloned();
                // The CANCEL itself gets an immediate 200 regardless.
                let cancel_key = TxKey {
                    branch,
                    method: Method::Cancel,
                };
                let cancel_tx = ServerTransaction::new(
                    cancel_key,
                    req.clone(),
                    source,
                    transport,
                    self.transport.clone(),
                );
                match invite_tx {
                    Some(invite) => {
                        let _ = cancel_tx.respond_status(StatusCode::OK).await;
                        invite.mark_cancelled();
                    }
                    None => {
                        let _ = cancel_tx
                            .respond_status(StatusCode::CALL_TRANSACTION_DOES_NOT_EXIST)
                            .await;
                    }
                }
            }
            _ => {
                let key = TxKey {
                    branch,
                    method: req.method.clone(),
                };
                let existing = self.server_txs.lock().get(&key).cloned();
                if let Some(tx) = existing {
                    trace!(method = %req.method, "request retransmission");
                    tx.retransmit_last().await;
                    return;
                }
                let tx = ServerTransaction::new(
                    key.clone(),
                    req.clone(),
                    source,
                    transport,
                    self.transport.clone(),
                );
                self.server_txs.lock().insert(key, tx.clone());
                self.deliver(IncomingRequest {
                    request: req,
                    source,
                    transport,
                    tx: Some(tx),
                })
                .await;
            }
        }
    }

    async fn deliver(&self, incoming: IncomingRequest) {
        if self.incoming_tx.send(incoming).await.is_err() {
            warn!("incoming queue closed, dropping request");
        }
    }
}

/// Resolve a SIP URI to a socket address using the system resolver
pub async fn resolve_uri(uri: &Uri) -> Result<SocketAddr> {
    let target = uri.host_port();
    let mut addrs = tokio::net::lookup_host(target.clone()).await?;
    addrs
        .next()
        .ok_or_else(|| SipError::Parse(format!("cannot resolve {:?}", target)))
}

/// Fresh RFC 3261 branch with the magic cookie
pub fn new_branch() -> String {
    format!("{}{}", BRANCH_MAGIC_COOKIE, random_token(16))
}

/// Fresh From/To tag
pub fn new_tag() -> String {
    random_token(10)
}

/// Fresh Call-ID
pub fn new_call_id() -> String {
    random_token(22)
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
