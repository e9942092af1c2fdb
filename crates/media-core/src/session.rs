//! Media session: the RTP/RTCP socket pair and its negotiated state
//!
//! A session binds two consecutive UDP ports (RTP on the even one, RTCP on
//! the odd one), renders the local SDP and absorbs the remote one. Reads and
//! writes may run from different tasks concurrently; deadlines let the
//! dialog interrupt blocked I/O without destroying the session, and
//! `close()` turns every pending and future read into a clean EOF.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::codec::Codec;
use crate::error::{MediaError, Result};
use crate::rtcp::{parse_compound, RtcpPacket};
use crate::sdp::{intersect_codecs, SdpMode, SessionDescription};

/// How long one blocked receive waits before re-checking deadlines
const POLL_SLICE: Duration = Duration::from_millis(500);

/// Which direction a deadline applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtpScope {
    Read,
    Write,
    Both,
}

#[derive(Debug, Clone)]
struct NegotiatedState {
    /// Configured local preference list
    local_codecs: Vec<Codec>,
    /// Intersection in remote order; None until the first remote SDP
    negotiated: Option<Vec<Codec>>,
    mode: SdpMode,
    remote_rtp: Option<SocketAddr>,
    remote_rtcp: Option<SocketAddr>,
}

/// One RTP+RTCP socket pair with its negotiation state
pub struct MediaSession {
    rtp_socket: UdpSocket,
    rtcp_socket: UdpSocket,
    local_addr: SocketAddr,
    /// Address advertised in SDP instead of the bind address, when set
    external_ip: Option<IpAddr>,
    state: RwLock<NegotiatedState>,
    sdp_ids: Mutex<(u64, u64)>,
    read_deadline: Mutex<Option<Instant>>,
    write_deadline: Mutex<Option<Instant>>,
    deadline_notify: Notify,
    closed: AtomicBool,
    close_notify: Notify,
}

impl MediaSession {
    /// Bind a fresh even/odd port pair on `ip`
    pub async fn new(ip: IpAddr, local_codecs: Vec<Codec>) -> Result<MediaSession> {
        let (rtp_socket, rtcp_socket) = bind_port_pair(ip).await?;
        let local_addr = rtp_socket.local_addr()?;
        debug!(%local_addr, "media session bound");
        Ok(MediaSession {
            rtp_socket,
            rtcp_socket,
            local_addr,
            external_ip: None,
            state: RwLock::new(NegotiatedState {
                local_codecs,
                negotiated: None,
                mode: SdpMode::SendRecv,
                remote_rtp: None,
                remote_rtcp: None,
            }),
            sdp_ids: Mutex::new((rand::random::<u32>() as u64, 1)),
            read_deadline: Mutex::new(None),
            write_deadline: Mutex::new(None),
            deadline_notify: Notify::new(),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        })
    }

    /// Advertise `ip` in SDP instead of the bind address (NAT deployments)
    pub fn set_external_ip(&mut self, ip: Option<IpAddr>) {
        self.external_ip = ip;
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The negotiated codec list in remote preference order, or the local
    /// preference before negotiation
    pub fn codecs(&self) -> Vec<Codec> {
        let state = self.state.read();
        state
            .negotiated
            .clone()
            .unwrap_or_else(|| state.local_codecs.clone())
    }

    /// First negotiated audio-carrying codec
    pub fn audio_codec(&self) -> Result<Codec> {
        self.codecs()
            .into_iter()
            .find(|c| c.is_audio())
            .ok_or(MediaError::NoCompatibleCodec)
    }

    /// Negotiated telephone-event codec, when present
    pub fn dtmf_codec(&self) -> Option<Codec> {
        self.codecs().into_iter().find(|c| c.is_telephone_event())
    }

    pub fn mode(&self) -> SdpMode {
        self.state.read().mode
    }

    pub fn remote_rtp_addr(&self) -> Option<SocketAddr> {
        self.state.read().remote_rtp
    }

    pub fn remote_rtcp_addr(&self) -> Option<SocketAddr> {
        self.state.read().remote_rtcp
    }

    /// Restrict the local offer to `codecs` (originator preservation)
    pub fn set_local_codecs(&self, codecs: Vec<Codec>) {
        let mut state = self.state.write();
        state.local_codecs = codecs;
        state.negotiated = None;
    }

    /// Render the local SDP offer/answer
    pub fn local_sdp(&self) -> String {
        let advertised = self.external_ip.unwrap_or_else(|| self.local_addr.ip());
        let (id, version) = *self.sdp_ids.lock();
        let mut sdp =
            SessionDescription::new(advertised, self.local_addr.port(), self.codecs());
        sdp.session_id = id;
        sdp.session_version = version;
        sdp.mode = self.mode();
        sdp.render()
    }

    /// Validate and apply a remote offer/answer atomically
    ///
    /// The negotiated codec list is the intersection with local support in
    /// the REMOTE's preference order; an empty audio intersection fails with
    /// [`MediaError::NoCompatibleCodec`] and leaves the session untouched.
    pub fn set_remote_sdp(&self, sdp: &[u8]) -> Result<()> {
        let text = std::str::from_utf8(sdp)
            .map_err(|_| MediaError::MalformedSdp("not valid UTF-8".into()))?;
        let remote: SessionDescription = text.parse()?;

        let mut state = self.state.write();
        let negotiated = intersect_codecs(&remote.codecs, &state.local_codecs);
        if !negotiated.iter().any(|c| c.is_audio()) {
            return Err(MediaError::NoCompatibleCodec);
        }
        let rtp = remote.media_addr();
        state.remote_rtp = Some(rtp);
        state.remote_rtcp = Some(SocketAddr::new(rtp.ip(), rtp.port() + 1));
        state.negotiated = Some(negotiated);
        state.mode = remote.mode.reverse();
        drop(state);

        self.sdp_ids.lock().1 += 1;
        trace!(remote = %rtp, "remote SDP applied");
        Ok(())
    }

    /// New session with fresh sockets sharing this one's negotiated state,
    /// used to rebind on mid-call renegotiation
    pub async fn fork(&self) -> Result<MediaSession> {
        let (rtp_socket, rtcp_socket) = bind_port_pair(self.local_addr.ip()).await?;
        let local_addr = rtp_socket.local_addr()?;
        debug!(old = %self.local_addr, new = %local_addr, "media session forked");
        let state = self.state.read().clone();
        let (id, version) = *self.sdp_ids.lock();
        Ok(MediaSession {
            rtp_socket,
            rtcp_socket,
            local_addr,
            external_ip: self.external_ip,
            state: RwLock::new(state),
            sdp_ids: Mutex::new((id, version + 1)),
            read_deadline: Mutex::new(None),
            write_deadline: Mutex::new(None),
            deadline_notify: Notify::new(),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        })
    }

    /// Set deadlines on the given scope; a deadline in the past unblocks
    /// pending I/O with [`MediaError::Timeout`]
    pub fn stop_rtp(&self, scope: RtpScope, deadline: Instant) {
        if matches!(scope, RtpScope::Read | RtpScope::Both) {
            *self.read_deadline.lock() = Some(deadline);
        }
        if matches!(scope, RtpScope::Write | RtpScope::Both) {
            *self.write_deadline.lock() = Some(deadline);
        }
        self.deadline_notify.notify_waiters();
    }

    /// Clear deadlines on the given scope
    pub fn start_rtp(&self, scope: RtpScope) {
        if matches!(scope, RtpScope::Read | RtpScope::Both) {
            *self.read_deadline.lock() = None;
        }
        if matches!(scope, RtpScope::Write | RtpScope::Both) {
            *self.write_deadline.lock() = None;
        }
        self.deadline_notify.notify_waiters();
    }

    /// Receive one RTP datagram into `buf`
    pub async fn read_rtp(&self, buf: &mut [u8]) -> Result<usize> {
        self.read_from(&self.rtp_socket, &self.read_deadline, buf).await
    }

    /// Send one RTP datagram to the negotiated remote address
    pub async fn write_rtp(&self, data: &[u8]) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MediaError::Eof);
        }
        if let Some(deadline) = *self.write_deadline.lock() {
            if Instant::now() >= deadline {
                return Err(MediaError::Timeout);
            }
        }
        let dest = self
            .state
            .read()
            .remote_rtp
            .ok_or(MediaError::NoRemoteAddress)?;
        Ok(self.rtp_socket.send_to(data, dest).await?)
    }

    /// Receive one RTCP datagram into `buf`
    pub async fn read_rtcp(&self, buf: &mut [u8]) -> Result<usize> {
        self.read_from(&self.rtcp_socket, &self.read_deadline, buf).await
    }

    /// Receive and decode one (possibly compound) RTCP datagram
    pub async fn read_rtcp_packets(&self) -> Result<Vec<RtcpPacket>> {
        let mut buf = [0u8; 1500];
        let n = self.read_rtcp(&mut buf).await?;
        parse_compound(&buf[..n])
    }

    /// Send one RTCP datagram to the negotiated control address
    pub async fn write_rtcp(&self, data: &[u8]) -> Result<usize> {
        let dest = self
            .state
            .read()
            .remote_rtcp
            .ok_or(MediaError::NoRemoteAddress)?;
        Ok(self.rtcp_socket.send_to(data, dest).await?)
    }

    async fn read_from(
        &self,
        socket: &UdpSocket,
        deadline: &Mutex<Option<Instant>>,
        buf: &mut [u8],
    ) -> Result<usize> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(MediaError::Eof);
            }
            let current = *deadline.lock();
            let slice = match current {
                Some(d) => {
                    let left = d.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(MediaError::Timeout);
                    }
                    left.min(POLL_SLICE)
                }
                None => POLL_SLICE,
            };
            tokio::select! {
                _ = self.close_notify.notified() => return Err(MediaError::Eof),
                _ = self.deadline_notify.notified() => continue,
                res = tokio::time::timeout(slice, socket.recv_from(buf)) => match res {
                    Ok(Ok((n, _source))) => return Ok(n),
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => continue,
                },
            }
        }
    }

    /// Mark the session closed; pending and future reads return EOF
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(local = %self.local_addr, "media session closed");
            self.close_notify.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Bind RTP on an even port with RTCP on the next odd one
async fn bind_port_pair(ip: IpAddr) -> Result<(UdpSocket, UdpSocket)> {
    let mut last_error = None;
    for _ in 0..64 {
        let probe = UdpSocket::bind((ip, 0)).await?;
        let port = probe.local_addr()?.port();
        let rtp_port = if port % 2 == 0 { port } else { port.saturating_sub(1) };
        if rtp_port == 0 || rtp_port == u16::MAX {
            continue;
        }
        drop(probe);
        let rtp = match UdpSocket::bind((ip, rtp_port)).await {
            Ok(s) => s,
            Err(e) => {
                last_error = Some(e);
                continue;
            }
        };
        match UdpSocket::bind((ip, rtp_port + 1)).await {
            Ok(rtcp) => return Ok((rtp, rtcp)),
            Err(e) => {
                last_error = Some(e);
                continue;
            }
        }
    }
    Err(MediaError::Bind(
        last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no even/odd port pair available".into()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{PCMA, PCMU, TELEPHONE_EVENT};

    fn local_codecs() -> Vec<Codec> {
        vec![PCMU, PCMA, TELEPHONE_EVENT]
    }

    #[tokio::test]
    async fn binds_even_odd_pair() {
        let session = MediaSession::new("127.0.0.1".parse().unwrap(), local_codecs())
            .await
            .unwrap();
        assert_eq!(session.local_addr().port() % 2, 0);
    }

    #[tokio::test]
    async fn negotiation_follows_remote_order() {
        let session = MediaSession::new("127.0.0.1".parse().unwrap(), local_codecs())
            .await
            .unwrap();
        let remote = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=x\r\nc=IN IP4 127.0.0.1\r\n\
            t=0 0\r\nm=audio 40000 RTP/AVP 8 0\r\na=rtpmap:8 PCMA/8000\r\na=rtpmap:0 PCMU/8000\r\n";
        session.set_remote_sdp(remote.as_bytes()).unwrap();
        assert_eq!(session.audio_codec().unwrap(), PCMA);
        assert_eq!(
            session.remote_rtp_addr().unwrap().to_string(),
            "127.0.0.1:40000"
        );
        assert_eq!(
            session.remote_rtcp_addr().unwrap().to_string(),
            "127.0.0.1:40001"
        );
    }

    #[tokio::test]
    async fn no_intersection_is_rejected_without_state_change() {
        let session = MediaSession::new("127.0.0.1".parse().unwrap(), vec![PCMU])
            .await
            .unwrap();
        let remote = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=x\r\nc=IN IP4 127.0.0.1\r\n\
            t=0 0\r\nm=audio 40000 RTP/AVP 8\r\na=rtpmap:8 PCMA/8000\r\n";
        assert!(matches!(
            session.set_remote_sdp(remote.as_bytes()),
            Err(MediaError::NoCompatibleCodec)
        ));
        assert!(session.remote_rtp_addr().is_none());
    }

    #[tokio::test]
    async fn malformed_sdp_is_rejected() {
        let session = MediaSession::new("127.0.0.1".parse().unwrap(), local_codecs())
            .await
            .unwrap();
        assert!(matches!(
            session.set_remote_sdp(b"not sdp at all"),
            Err(MediaError::MalformedSdp(_))
        ));
    }

    #[tokio::test]
    async fn deadline_in_the_past_unblocks_reads() {
        let session = MediaSession::new("127.0.0.1".parse().unwrap(), local_codecs())
            .await
            .unwrap();
        session.stop_rtp(RtpScope::Read, Instant::now());
        let mut buf = [0u8; 64];
        assert!(matches!(
            session.read_rtp(&mut buf).await,
            Err(MediaError::Timeout)
        ));

        session.start_rtp(RtpScope::Read);
        session.close();
        assert!(matches!(
            session.read_rtp(&mut buf).await,
            Err(MediaError::Eof)
        ));
    }

    #[tokio::test]
    async fn fork_preserves_negotiated_state_on_new_ports() {
        let session = MediaSession::new("127.0.0.1".parse().unwrap(), local_codecs())
            .await
            .unwrap();
        let remote = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=x\r\nc=IN IP4 127.0.0.1\r\n\
            t=0 0\r\nm=audio 40000 RTP/AVP 0\r\n";
        session.set_remote_sdp(remote.as_bytes()).unwrap();
        let fork = session.fork().await.unwrap();
        assert_ne!(fork.local_addr(), session.local_addr());
        assert_eq!(fork.audio_codec().unwrap(), session.audio_codec().unwrap());
        assert_eq!(fork.remote_rtp_addr(), session.remote_rtp_addr());
    }
}
