//! Audio pipeline building blocks
//!
//! The media path is a chain of [`AudioReader`]s and [`AudioWriter`]s
//! carrying encoded codec frames between the RTP endpoints and whatever the
//! handler plugs in: PCM transcoding shims, mute/stop control wrappers, DTMF
//! interceptors, recorders. End of stream is `Err(Eof)`, a deadline is
//! `Err(Timeout)`; the copy helper turns both into a clean return.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::codec::Codec;
use crate::error::{MediaError, Result};

/// Pull side of the audio chain; `read` fills `buf` with encoded payload
#[async_trait]
pub trait AudioReader: Send {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// Push side of the audio chain; `write` consumes encoded payload
#[async_trait]
pub trait AudioWriter: Send {
    async fn write(&mut self, buf: &[u8]) -> Result<usize>;
}

#[async_trait]
impl<R: AudioReader + ?Sized> AudioReader for Box<R> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf).await
    }
}

#[async_trait]
impl<W: AudioWriter + ?Sized> AudioWriter for Box<W> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        (**self).write(buf).await
    }
}

/// Decodes the companded frames of an inner reader into 16-bit LE PCM
pub struct PcmDecoderReader<R> {
    inner: R,
    codec: Codec,
    scratch: Vec<u8>,
}

impl<R: AudioReader> PcmDecoderReader<R> {
    pub fn new(codec: Codec, inner: R) -> Result<Self> {
        if !codec.is_audio() {
            return Err(MediaError::UnsupportedCodec("telephone-event"));
        }
        Ok(PcmDecoderReader {
            inner,
            codec,
            scratch: vec![0u8; codec.payload_frame_len()],
        })
    }
}

#[async_trait]
impl<R: AudioReader> AudioReader for PcmDecoderReader<R> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let want = (buf.len() / 2).min(self.scratch.len());
        if want == 0 {
            return Err(MediaError::Usage("PCM buffer shorter than one sample"));
        }
        let n = self.inner.read(&mut self.scratch[..want]).await?;
        for (i, &code) in self.scratch[..n].iter().enumerate() {
            let sample = self.codec.decode_sample(code)?;
            buf[i * 2..i * 2 + 2].copy_from_slice(&sample.to_le_bytes());
        }
        Ok(n * 2)
    }
}

/// Encodes 16-bit LE PCM writes into companded frames for an inner writer
pub struct PcmEncoderWriter<W> {
    inner: W,
    codec: Codec,
    scratch: Vec<u8>,
}

impl<W: AudioWriter> PcmEncoderWriter<W> {
    pub fn new(codec: Codec, inner: W) -> Result<Self> {
        if !codec.is_audio() {
            return Err(MediaError::UnsupportedCodec("telephone-event"));
        }
        Ok(PcmEncoderWriter {
            inner,
            codec,
            scratch: Vec::new(),
        })
    }
}

#[async_trait]
impl<W: AudioWriter> AudioWriter for PcmEncoderWriter<W> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if buf.len() % 2 != 0 {
            return Err(MediaError::Usage("PCM write is not sample-aligned"));
        }
        self.scratch.clear();
        self.scratch.reserve(buf.len() / 2);
        for pair in buf.chunks_exact(2) {
            let sample = i16::from_le_bytes([pair[0], pair[1]]);
            self.scratch.push(self.codec.encode_sample(sample)?);
        }
        let scratch = std::mem::take(&mut self.scratch);
        let result = self.inner.write(&scratch).await;
        self.scratch = scratch;
        let written = result?;
        Ok(written * 2)
    }
}

/// Shared mute/stop flags; cheap to clone, lock-free to consult
#[derive(Debug, Clone, Default)]
pub struct AudioControl {
    muted: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl AudioControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Muted streams carry silence instead of payload
    pub fn mute(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    /// Stopped streams answer every read/write with EOF
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// Transparent reader wrapper honouring an [`AudioControl`]
pub struct ControlledReader<R> {
    inner: R,
    control: AudioControl,
}

impl<R: AudioReader> ControlledReader<R> {
    pub fn new(inner: R, control: AudioControl) -> Self {
        ControlledReader { inner, control }
    }
}

#[async_trait]
impl<R: AudioReader> AudioReader for ControlledReader<R> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.control.is_stopped() {
            return Err(MediaError::Eof);
        }
        let n = self.inner.read(buf).await?;
        if self.control.is_muted() {
            buf[..n].fill(0);
        }
        Ok(n)
    }
}

/// Transparent writer wrapper honouring an [`AudioControl`]
pub struct ControlledWriter<W> {
    inner: W,
    control: AudioControl,
    silence: Vec<u8>,
}

impl<W: AudioWriter> ControlledWriter<W> {
    pub fn new(inner: W, control: AudioControl) -> Self {
        ControlledWriter {
            inner,
            control,
            silence: Vec::new(),
        }
    }
}

#[async_trait]
impl<W: AudioWriter> AudioWriter for ControlledWriter<W> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.control.is_stopped() {
            return Err(MediaError::Eof);
        }
        if self.control.is_muted() {
            if self.silence.len() < buf.len() {
                self.silence.resize(buf.len(), 0);
            }
            return self.inner.write(&self.silence[..buf.len()]).await;
        }
        self.inner.write(buf).await
    }
}

/// Pump frames from `reader` to `writer` until the stream ends
///
/// Timeouts from either side count as a clean shutdown (a peer that stops
/// sending, or a deadline set to interrupt the copy). Returns the bytes
/// moved.
pub async fn copy_audio<R, W>(reader: &mut R, writer: &mut W, frame_len: usize) -> Result<u64>
where
    R: AudioReader + ?Sized,
    W: AudioWriter + ?Sized,
{
    let mut frame = vec![0u8; frame_len];
    let mut total: u64 = 0;
    loop {
        let n = match reader.read(&mut frame).await {
            Ok(n) => n,
            Err(e) if e.is_clean_shutdown() => return Ok(total),
            Err(e) => return Err(e),
        };
        if n == 0 {
            continue;
        }
        match writer.write(&frame[..n]).await {
            Ok(written) => total += written as u64,
            Err(e) if e.is_clean_shutdown() => return Ok(total),
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PCMU;

    /// Feeds fixed frames, then EOF
    struct FrameSource {
        frames: Vec<Vec<u8>>,
    }

    #[async_trait]
    impl AudioReader for FrameSource {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            if self.frames.is_empty() {
                return Err(MediaError::Eof);
            }
            let frame = self.frames.remove(0);
            buf[..frame.len()].copy_from_slice(&frame);
            Ok(frame.len())
        }
    }

    /// Collects written frames
    #[derive(Default)]
    struct FrameSink {
        frames: Vec<Vec<u8>>,
    }

    #[async_trait]
    impl AudioWriter for FrameSink {
        async fn write(&mut self, buf: &[u8]) -> Result<usize> {
            self.frames.push(buf.to_vec());
            Ok(buf.len())
        }
    }

    #[tokio::test]
    async fn pcm_round_trip_through_encoder_and_decoder() {
        let sink = FrameSink::default();
        let mut encoder = PcmEncoderWriter::new(PCMU, sink).unwrap();

        let samples: Vec<i16> = (0..160).map(|i| (i * 97 - 8000) as i16).collect();
        let mut pcm = Vec::new();
        for s in &samples {
            pcm.extend_from_slice(&s.to_le_bytes());
        }
        assert_eq!(encoder.write(&pcm).await.unwrap(), pcm.len());

        let source = FrameSource {
            frames: encoder.inner.frames.clone(),
        };
        let mut decoder = PcmDecoderReader::new(PCMU, source).unwrap();
        let mut out = vec![0u8; 320];
        let n = decoder.read(&mut out).await.unwrap();
        assert_eq!(n, 320);
        for (i, pair) in out.chunks_exact(2).enumerate() {
            let decoded = i16::from_le_bytes([pair[0], pair[1]]);
            let err = (decoded as i32 - samples[i] as i32).abs();
            assert!(err <= 1 << 10, "sample {} err {}", i, err);
        }
    }

    #[tokio::test]
    async fn mute_zeroes_and_stop_ends() {
        let control = AudioControl::new();
        let mut writer = ControlledWriter::new(FrameSink::default(), control.clone());

        writer.write(&[1, 2, 3, 4]).await.unwrap();
        control.mute(true);
        writer.write(&[5, 6, 7, 8]).await.unwrap();
        control.mute(false);
        writer.write(&[9, 9]).await.unwrap();
        assert_eq!(writer.inner.frames[0], vec![1, 2, 3, 4]);
        assert_eq!(writer.inner.frames[1], vec![0, 0, 0, 0]);
        assert_eq!(writer.inner.frames[2], vec![9, 9]);

        control.stop();
        assert!(matches!(
            writer.write(&[1]).await,
            Err(MediaError::Eof)
        ));
    }

    #[tokio::test]
    async fn copy_translates_timeout_to_clean_end() {
        struct TimeoutAfter {
            left: usize,
        }
        #[async_trait]
        impl AudioReader for TimeoutAfter {
            async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
                if self.left == 0 {
                    return Err(MediaError::Timeout);
                }
                self.left -= 1;
                buf[..4].fill(7);
                Ok(4)
            }
        }

        let mut reader = TimeoutAfter { left: 3 };
        let mut sink = FrameSink::default();
        let moved = copy_audio(&mut reader, &mut sink, 160).await.unwrap();
        assert_eq!(moved, 12);
        assert_eq!(sink.frames.len(), 3);
    }
}
