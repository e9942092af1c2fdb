//! Stream transport with Content-Length framing
//!
//! Connections are kept open and reused for sending; an outbound send to a
//! peer without an established connection dials one first. The per-stream
//! read/write machinery is shared with the TLS transport.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::parser::parse_message;
use super::{patch_top_via, Incoming, TransportKind};

/// Upper bound on one framed message (headers + body)
const MAX_MESSAGE: usize = 1 << 20;

pub(crate) type ConnTable = Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>>;

/// A bound TCP listener plus its connection table
pub struct TcpTransport {
    local: SocketAddr,
    conns: ConnTable,
    inbound: mpsc::Sender<Incoming>,
}

impl TcpTransport {
    pub async fn bind(addr: SocketAddr, inbound: mpsc::Sender<Incoming>) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        debug!(%local, "SIP TCP transport bound");

        let transport = Arc::new(TcpTransport {
            local,
            conns: Arc::new(Mutex::new(HashMap::new())),
            inbound,
        });

        let accept_self = transport.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => adopt_stream(
                        stream,
                        peer,
                        TransportKind::Tcp,
                        accept_self.conns.clone(),
                        accept_self.inbound.clone(),
                    ),
                    Err(e) => {
                        warn!(error = %e, "TCP accept loop ended");
                        return;
                    }
                }
            }
        });

        Ok(transport)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub async fn send(self: &Arc<Self>, dest: SocketAddr, data: &[u8]) -> Result<()> {
        let sender = self.conns.lock().get(&dest).cloned();
        let sender = match sender {
            Some(s) => s,
            None => {
                let stream = TcpStream::connect(dest).await?;
                adopt_stream(
                    stream,
                    dest,
                    TransportKind::Tcp,
                    self.conns.clone(),
                    self.inbound.clone(),
                );
                self.conns.lock().get(&dest).cloned().ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "connection died on open")
                })?
            }
        };
        sender
            .send(data.to_vec())
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "connection closed"))?;
        Ok(())
    }
}

/// Register a framed SIP stream: spawn its writer task and read loop
pub(crate) fn adopt_stream<S>(
    stream: S,
    peer: SocketAddr,
    kind: TransportKind,
    conns: ConnTable,
    inbound: mpsc::Sender<Incoming>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let (write_tx, mut write_rx) = mpsc::channel::<Vec<u8>>(32);
    conns.lock().insert(peer, write_tx);

    tokio::spawn(async move {
        while let Some(data) = write_rx.recv().await {
            if write_half.write_all(&data).await.is_err() {
                return;
            }
        }
    });

    tokio::spawn(async move {
        let mut buf = Vec::with_capacity(4096);
        let mut chunk = [0u8; 4096];
        loop {
            match read_half.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
            if buf.len() > MAX_MESSAGE {
                warn!(%peer, "oversized stream message, dropping connection");
                break;
            }
            while let Some(frame) = take_frame(&mut buf) {
                let mut msg = match parse_message(&frame) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(%peer, error = %e, "dropping unparsable stream message");
                        continue;
                    }
                };
                patch_top_via(&mut msg, peer);
                if inbound
                    .send(Incoming {
                        msg,
                        source: peer,
                        transport: kind,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
        conns.lock().remove(&peer);
    });
}

/// Pop one complete message off the front of `buf`, if present
pub(crate) fn take_frame(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    // Discard leading keep-alive CRLFs.
    let start = buf
        .iter()
        .position(|b| *b != b'\r' && *b != b'\n')
        .unwrap_or(buf.len());
    if start > 0 {
        buf.drain(..start);
    }

    let head_end = find_subslice(buf, b"\r\n\r\n")?;
    let body_start = head_end + 4;
    let head = std::str::from_utf8(&buf[..head_end]).ok()?;

    let mut content_length = 0usize;
    for line in head.lines() {
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim();
            if name.eq_ignore_ascii_case("Content-Length") || name == "l" {
                content_length = value.trim().parse().unwrap_or(0);
                break;
            }
        }
    }

    let total = body_start + content_length;
    if buf.len() < total {
        return None;
    }
    let frame = buf[..total].to_vec();
    buf.drain(..total);
    Some(frame)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_one_message_with_body() {
        let mut buf = b"NOTIFY sip:a SIP/2.0\r\nContent-Length: 3\r\n\r\nabcEXTRA".to_vec();
        let frame = take_frame(&mut buf).unwrap();
        assert!(frame.ends_with(b"abc"));
        assert_eq!(buf, b"EXTRA");
    }

    #[test]
    fn waits_for_full_body() {
        let mut buf = b"NOTIFY sip:a SIP/2.0\r\nContent-Length: 10\r\n\r\nabc".to_vec();
        assert!(take_frame(&mut buf).is_none());
        assert!(!buf.is_empty());
    }

    #[test]
    fn skips_keepalive_crlf() {
        let mut buf = b"\r\n\r\nOPTIONS sip:a SIP/2.0\r\nContent-Length: 0\r\n\r\n".to_vec();
        let frame = take_frame(&mut buf).unwrap();
        assert!(frame.starts_with(b"OPTIONS"));
    }
}
