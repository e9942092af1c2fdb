//! Per-dialog media state
//!
//! `DialogMedia` owns the call's media session and the RTP reader/writer
//! pair, plus the optional interceptor chain the handler installs (DTMF
//! taps, recorders, controls). On a re-INVITE the session is forked and the
//! reader/writer handles are rebound atomically; handles handed out earlier
//! keep working because they delegate to the shared endpoints. Hooks: close
//! callbacks run LIFO exactly once, media-update callbacks run after the
//! swap is visible, and neither runs under the state lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use voxide_media_core::{
    AudioReader, AudioWriter, MediaError, MediaSession, Result as MediaResult, RtcpPacket,
    RtpReader, RtpWriter,
};

use crate::error::{Result, VoxideError};

/// An installed interceptor, shared between the dialog and handed-out handles
pub type SharedReader = Arc<tokio::sync::Mutex<dyn AudioReader>>;
/// See [`SharedReader`]
pub type SharedWriter = Arc<tokio::sync::Mutex<dyn AudioWriter>>;
type CloseFn = Box<dyn FnOnce() + Send>;
type MediaUpdateFn = Arc<dyn Fn(&Arc<MediaSession>) + Send + Sync>;

#[derive(Default)]
struct MediaInner {
    session: Option<Arc<MediaSession>>,
    rtp_reader: Option<Arc<RtpReader>>,
    rtp_writer: Option<Arc<RtpWriter>>,
    audio_reader: Option<SharedReader>,
    audio_writer: Option<SharedWriter>,
    on_close: Vec<CloseFn>,
    on_media_update: Vec<MediaUpdateFn>,
}

/// Mutable media state of one dialog
#[derive(Default)]
pub struct DialogMedia {
    inner: Mutex<MediaInner>,
    closed: AtomicBool,
}

impl DialogMedia {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initial bind: publish the session and its endpoint reader/writer
    pub fn init_media(&self, session: Arc<MediaSession>) -> Result<()> {
        let reader = Arc::new(RtpReader::new(session.clone()).map_err(map_codec_err)?);
        let writer = Arc::new(RtpWriter::new(session.clone()).map_err(map_codec_err)?);
        let mut inner = self.inner.lock();
        inner.session = Some(session);
        inner.rtp_reader = Some(reader);
        inner.rtp_writer = Some(writer);
        Ok(())
    }

    /// The current media session
    pub fn session(&self) -> Result<Arc<MediaSession>> {
        self.inner
            .lock()
            .session
            .clone()
            .ok_or(VoxideError::InvalidState("media not initialized"))
    }

    pub fn rtp_reader(&self) -> Result<Arc<RtpReader>> {
        self.inner
            .lock()
            .rtp_reader
            .clone()
            .ok_or(VoxideError::InvalidState("media not initialized"))
    }

    pub fn rtp_writer(&self) -> Result<Arc<RtpWriter>> {
        self.inner
            .lock()
            .rtp_writer
            .clone()
            .ok_or(VoxideError::InvalidState("media not initialized"))
    }

    /// Head of the read chain: the installed interceptor, else the RTP
    /// endpoint
    pub fn audio_reader(&self) -> Result<MediaReader> {
        let inner = self.inner.lock();
        if let Some(chained) = inner.audio_reader.clone() {
            return Ok(MediaReader::Chained(chained));
        }
        inner
            .rtp_reader
            .clone()
            .map(MediaReader::Rtp)
            .ok_or(VoxideError::InvalidState("media not initialized"))
    }

    /// Head of the write chain
    pub fn audio_writer(&self) -> Result<MediaWriter> {
        let inner = self.inner.lock();
        if let Some(chained) = inner.audio_writer.clone() {
            return Ok(MediaWriter::Chained(chained));
        }
        inner
            .rtp_writer
            .clone()
            .map(MediaWriter::Rtp)
            .ok_or(VoxideError::InvalidState("media not initialized"))
    }

    /// Install a read interceptor; visible on the next `audio_reader` call
    pub fn set_audio_reader<R: AudioReader + 'static>(&self, reader: R) {
        self.inner.lock().audio_reader = Some(Arc::new(tokio::sync::Mutex::new(reader)));
    }

    /// Install a write interceptor; visible on the next `audio_writer` call
    pub fn set_audio_writer<W: AudioWriter + 'static>(&self, writer: W) {
        self.inner.lock().audio_writer = Some(Arc::new(tokio::sync::Mutex::new(writer)));
    }

    /// Apply a re-INVITE: fork the session, apply the remote SDP to the
    /// fork, rebind reader and writer, then fire media-update callbacks.
    /// Returns the SDP answer to send.
    pub async fn sdp_re_invite(&self, remote_sdp: &[u8]) -> Result<String> {
        let (old_session, reader, writer) = {
            let inner = self.inner.lock();
            (
                inner
                    .session
                    .clone()
                    .ok_or(VoxideError::InvalidState("media not initialized"))?,
                inner
                    .rtp_reader
                    .clone()
                    .ok_or(VoxideError::InvalidState("media not initialized"))?,
                inner
                    .rtp_writer
                    .clone()
                    .ok_or(VoxideError::InvalidState("media not initialized"))?,
            )
        };

        let forked = Arc::new(old_session.fork().await?);
        forked.set_remote_sdp(remote_sdp)?;
        let answer = forked.local_sdp();

        // Writer first so its timestamp continuation sees the swap moment,
        // then the reader, then the published session handle.
        writer.update_session(forked.clone()).await?;
        reader.update_session(forked.clone())?;

        let callbacks: Vec<MediaUpdateFn> = {
            let mut inner = self.inner.lock();
            inner.session = Some(forked.clone());
            inner.on_media_update.clone()
        };
        old_session.close();

        for callback in callbacks {
            callback(&forked);
        }
        debug!(local = %forked.local_addr(), "media session renegotiated");
        Ok(answer)
    }

    /// Register a callback fired after each media session swap
    pub fn on_media_update<F>(&self, callback: F)
    where
        F: Fn(&Arc<MediaSession>) + Send + Sync + 'static,
    {
        self.inner.lock().on_media_update.push(Arc::new(callback));
    }

    /// Register a close callback; callbacks run LIFO on the first `close`
    pub fn on_close<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            // Already closed: run immediately to keep the guarantee that
            // every registered hook fires exactly once.
            callback();
            return;
        }
        self.inner.lock().on_close.push(Box::new(callback));
    }

    /// Deliver decoded RTCP packets to `callback` from a background task
    /// until the session closes; the callback must not block
    pub fn on_rtcp<F>(&self, callback: F) -> Result<()>
    where
        F: Fn(Vec<RtcpPacket>) + Send + Sync + 'static,
    {
        let session = self.session()?;
        tokio::spawn(async move {
            loop {
                match session.read_rtcp_packets().await {
                    Ok(packets) => {
                        if voxide_media_core::rtcp_debug_enabled() {
                            tracing::trace!(count = packets.len(), "RTCP in");
                        }
                        callback(packets);
                    }
                    Err(MediaError::Eof) => return,
                    Err(MediaError::Timeout) => continue,
                    Err(e) => {
                        warn!(error = %e, "RTCP read loop ended");
                        return;
                    }
                }
            }
        });
        Ok(())
    }

    /// Playback into this dialog's audio writer chain
    pub fn playback(&self) -> Result<voxide_media_core::AudioPlayback> {
        let codec = self
            .session()?
            .audio_codec()
            .map_err(VoxideError::Media)?;
        let writer = self.audio_writer()?;
        voxide_media_core::AudioPlayback::new(Box::new(writer), codec).map_err(VoxideError::Media)
    }

    /// Playback plus a mute/stop control
    pub fn playback_control(
        &self,
    ) -> Result<(voxide_media_core::AudioPlayback, voxide_media_core::AudioControl)> {
        let codec = self
            .session()?
            .audio_codec()
            .map_err(VoxideError::Media)?;
        let writer = self.audio_writer()?;
        voxide_media_core::AudioPlayback::with_control(Box::new(writer), codec)
            .map_err(VoxideError::Media)
    }

    /// Close the media state; idempotent, hooks run LIFO outside the lock
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let (session, mut hooks) = {
            let mut inner = self.inner.lock();
            (inner.session.take(), std::mem::take(&mut inner.on_close))
        };
        if let Some(session) = session {
            session.close();
        }
        while let Some(hook) = hooks.pop() {
            hook();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

fn map_codec_err(e: MediaError) -> VoxideError {
    match e {
        MediaError::NoCompatibleCodec => VoxideError::NoCompatibleMedia,
        other => VoxideError::Media(other),
    }
}

/// Read handle returned by [`DialogMedia::audio_reader`]
pub enum MediaReader {
    Rtp(Arc<RtpReader>),
    Chained(SharedReader),
}

#[async_trait]
impl AudioReader for MediaReader {
    async fn read(&mut self, buf: &mut [u8]) -> MediaResult<usize> {
        match self {
            MediaReader::Rtp(reader) => reader.read_payload(buf).await,
            MediaReader::Chained(shared) => shared.lock().await.read(buf).await,
        }
    }
}

/// Write handle returned by [`DialogMedia::audio_writer`]
pub enum MediaWriter {
    Rtp(Arc<RtpWriter>),
    Chained(SharedWriter),
}

#[async_trait]
impl AudioWriter for MediaWriter {
    async fn write(&mut self, buf: &[u8]) -> MediaResult<usize> {
        match self {
            MediaWriter::Rtp(writer) => writer.write_payload(buf).await,
            MediaWriter::Chained(shared) => shared.lock().await.write(buf).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn close_hooks_run_lifo_exactly_once() {
        let media = DialogMedia::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            media.on_close(move || order.lock().push(i));
        }
        media.close();
        media.close();
        assert_eq!(*order.lock(), vec![2, 1, 0]);

        // Hooks registered after close still fire, once.
        let late = Arc::new(AtomicUsize::new(0));
        let late_clone = late.clone();
        media.on_close(move || {
            late_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(late.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn accessors_fail_before_init() {
        let media = DialogMedia::new();
        assert!(media.session().is_err());
        assert!(media.audio_reader().is_err());
        assert!(media.audio_writer().is_err());
    }

    #[test]
    fn installed_interceptor_is_visible_on_next_query() {
        struct Silence;

        #[async_trait]
        impl AudioReader for Silence {
            async fn read(&mut self, _buf: &mut [u8]) -> MediaResult<usize> {
                Err(MediaError::Eof)
            }
        }

        let media = DialogMedia::new();
        assert!(media.audio_reader().is_err(), "no endpoint, no interceptor");
        media.set_audio_reader(Silence);
        assert!(
            matches!(media.audio_reader(), Ok(MediaReader::Chained(_))),
            "interceptor must head the chain"
        );
    }
}
