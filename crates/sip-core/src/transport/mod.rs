//! SIP transports
//!
//! A [`TransportLayer`] owns one listener per configured transport kind and
//! funnels every parsed inbound message into a single channel. Sending picks
//! the transport by kind; responses travel back on the kind that carried the
//! request (transport-matched, as the Via demands).

mod tcp;
mod tls;
mod udp;

use std::net::SocketAddr;

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::{Result, SipError};
use crate::types::{MessageExt, SipMessage};

pub use tcp::TcpTransport;
pub use tls::{TlsConfig, TlsTransport};
pub use udp::UdpTransport;

/// Transport kinds voxide listens and dials on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    Tcp,
    Tls,
}

impl TransportKind {
    /// Via transport token
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
        }
    }

    /// Map a transport token (Via or uri-parameter) to a kind
    pub fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_uppercase().as_str() {
            "UDP" => Some(TransportKind::Udp),
            "TCP" => Some(TransportKind::Tcp),
            "TLS" => Some(TransportKind::Tls),
            _ => None,
        }
    }

    /// Whether the transport retransmits are needed (datagram transports)
    pub fn is_unreliable(&self) -> bool {
        matches!(self, TransportKind::Udp)
    }
}

/// One inbound message with its arrival metadata
#[derive(Debug)]
pub struct Incoming {
    pub msg: SipMessage,
    pub source: SocketAddr,
    pub transport: TransportKind,
}

/// Owns the bound listeners and the inbound funnel
pub struct TransportLayer {
    udp: RwLock<Option<Arc<UdpTransport>>>,
    tcp: RwLock<Option<Arc<TcpTransport>>>,
    tls: RwLock<Option<Arc<TlsTransport>>>,
    inbound: mpsc::Sender<Incoming>,
}

impl TransportLayer {
    /// Create the layer and hand back the inbound receiver (consumed by the
    /// user agent's dispatcher)
    pub fn new() -> (Arc<Self>, mpsc::Receiver<Incoming>) {
        let (tx, rx) = mpsc::channel(256);
        (
            Arc::new(TransportLayer {
                udp: RwLock::new(None),
                tcp: RwLock::new(None),
                tls: RwLock::new(None),
                inbound: tx,
            }),
            rx,
        )
    }

    /// Bind a UDP listener; the receive loop runs until the socket errors
    pub async fn bind_udp(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let transport = UdpTransport::bind(addr, self.inbound.clone()).await?;
        let local = transport.local_addr();
        *self.udp.write() = Some(transport);
        Ok(local)
    }

    /// Bind a TCP listener
    pub async fn bind_tcp(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let transport = TcpTransport::bind(addr, self.inbound.clone()).await?;
        let local = transport.local_addr();
        *self.tcp.write() = Some(transport);
        Ok(local)
    }

    /// Bind a TLS listener
    pub async fn bind_tls(&self, addr: SocketAddr, config: TlsConfig) -> Result<SocketAddr> {
        let transport = TlsTransport::bind(addr, config, self.inbound.clone()).await?;
        let local = transport.local_addr();
        *self.tls.write() = Some(transport);
        Ok(local)
    }

    /// Local address of the bound listener of `kind`
    pub fn local_addr(&self, kind: TransportKind) -> Result<SocketAddr> {
        match kind {
            TransportKind::Udp => self
                .udp
                .read()
                .as_ref()
                .map(|t| t.local_addr())
                .ok_or(SipError::NoTransport("UDP")),
            TransportKind::Tcp => self
                .tcp
                .read()
                .as_ref()
                .map(|t| t.local_addr())
                .ok_or(SipError::NoTransport("TCP")),
            TransportKind::Tls => self
                .tls
                .read()
                .as_ref()
                .map(|t| t.local_addr())
                .ok_or(SipError::NoTransport("TLS")),
        }
    }

    /// Kinds that currently have a listener bound
    pub fn bound_kinds(&self) -> Vec<TransportKind> {
        let mut kinds = Vec::new();
        if self.udp.read().is_some() {
            kinds.push(TransportKind::Udp);
        }
        if self.tcp.read().is_some() {
            kinds.push(TransportKind::Tcp);
        }
        if self.tls.read().is_some() {
            kinds.push(TransportKind::Tls);
        }
        kinds
    }

    /// Send raw bytes to `dest` over `kind`
    pub async fn send(&self, kind: TransportKind, dest: SocketAddr, data: &[u8]) -> Result<()> {
        if crate::sip_debug_enabled() {
            tracing::debug!(
                %dest,
                transport = kind.as_str(),
                "SIP send:\n{}",
                String::from_utf8_lossy(data)
            );
        }
        match kind {
            TransportKind::Udp => {
                let udp = self
                    .udp
                    .read()
                    .clone()
                    .ok_or(SipError::NoTransport("UDP"))?;
                udp.send(dest, data).await
            }
            TransportKind::Tcp => {
                let tcp = self
                    .tcp
                    .read()
                    .clone()
                    .ok_or(SipError::NoTransport("TCP"))?;
                tcp.send(dest, data).await
            }
            TransportKind::Tls => {
                let tls = self
                    .tls
                    .read()
                    .clone()
                    .ok_or(SipError::NoTransport("TLS"))?;
                tls.send(dest, data).await
            }
        }
    }
}

/// Patch `received`/`rport` onto the top Via of an inbound request when the
/// source address disagrees with the advertised sent-by (RFC 3581)
pub(crate) fn patch_top_via(msg: &mut SipMessage, source: SocketAddr) {
    let SipMessage::Request(req) = msg else {
        return;
    };
    let Ok(mut via) = req.top_via() else {
        warn!("inbound request without parsable Via");
        return;
    };
    let mut changed = false;
    if via.host != source.ip().to_string() {
        via.set_param("received", Some(&source.ip().to_string()));
        changed = true;
    }
    let wants_rport = via
        .params
        .iter()
        .any(|(k, v)| k.eq_ignore_ascii_case("rport") && v.is_none());
    if wants_rport || changed {
        via.set_param("rport", Some(&source.port().to_string()));
        changed = true;
    }
    if changed {
        // Replace only the topmost Via, keeping any others in order.
        let rest: Vec<String> = req
            .headers
            .get_all("Via")
            .skip(1)
            .map(str::to_string)
            .collect();
        req.headers.remove("Via");
        req.headers.push("Via", via.to_string());
        for v in rest {
            req.headers.push("Via", v);
        }
    }
}
