//! Datagram transport

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::parser::parse_message;
use super::{patch_top_via, Incoming, TransportKind};

/// Maximum SIP datagram we accept; larger messages must use TCP
const MAX_DATAGRAM: usize = 65_535;

/// A bound UDP listener with its receive loop
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr, inbound: mpsc::Sender<Incoming>) -> Result<Arc<Self>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local = socket.local_addr()?;
        debug!(%local, "SIP UDP transport bound");

        let transport = Arc::new(UdpTransport {
            socket: socket.clone(),
            local,
        });

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let (n, source) = match socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "UDP receive loop ended");
                        return;
                    }
                };
                let raw = &buf[..n];
                // CRLF keep-alives are expected noise.
                if raw.iter().all(|b| *b == b'\r' || *b == b'\n') {
                    trace!(%source, "keep-alive");
                    continue;
                }
                if crate::sip_debug_enabled() {
                    debug!(%source, "SIP recv:\n{}", String::from_utf8_lossy(raw));
                }
                let mut msg = match parse_message(raw) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(%source, error = %e, "dropping unparsable datagram");
                        continue;
                    }
                };
                patch_top_via(&mut msg, source);
                if inbound
                    .send(Incoming {
                        msg,
                        source,
                        transport: TransportKind::Udp,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
        });

        Ok(transport)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub async fn send(&self, dest: SocketAddr, data: &[u8]) -> Result<()> {
        self.socket.send_to(data, dest).await?;
        Ok(())
    }
}
