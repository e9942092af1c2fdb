//! Playback engine
//!
//! Plays 16-bit PCM WAV content into an audio writer chain. The writer
//! handed in is the encoded-frame sink (normally the RTP writer); playback
//! wraps it in a PCM encoder so every 20 ms chunk of decoded audio becomes
//! exactly one RTP packet. Sources: in-memory/file streams and ranged HTTP.

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::audio::{AudioControl, AudioWriter, ControlledWriter, PcmEncoderWriter};
use crate::codec::Codec;
use crate::error::{MediaError, Result};
use crate::wav::WavStream;

/// First HTTP range window; subsequent windows double
const INITIAL_RANGE_WINDOW: u64 = 1024;

/// Per-range-request timeout
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Read chunk for file and in-memory sources
const SOURCE_CHUNK: usize = 8 * 1024;

type DynWriter = Box<dyn AudioWriter>;

/// Plays WAV content into one dialog's audio writer
pub struct AudioPlayback {
    writer: PcmEncoderWriter<DynWriter>,
    codec: Codec,
    total_written: u64,
}

impl AudioPlayback {
    /// Playback into `writer`, which takes `codec`-encoded frames
    pub fn new(writer: DynWriter, codec: Codec) -> Result<AudioPlayback> {
        Ok(AudioPlayback {
            writer: PcmEncoderWriter::new(codec, writer)?,
            codec,
            total_written: 0,
        })
    }

    /// Same, but muteable and stoppable through the returned control
    pub fn with_control(writer: DynWriter, codec: Codec) -> Result<(AudioPlayback, AudioControl)> {
        let control = AudioControl::new();
        let controlled: DynWriter = Box::new(ControlledWriter::new(writer, control.clone()));
        Ok((AudioPlayback::new(controlled, codec)?, control))
    }

    /// PCM bytes written over the lifetime of this playback, kept across
    /// source errors so partial progress is observable
    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    /// Play a WAV byte stream; `mime` must be an audio/wav flavour
    pub async fn play<R>(&mut self, mut source: R, mime: &str) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        check_mime(mime)?;
        let mut wav = WavStream::new();
        let mut chunk = vec![0u8; SOURCE_CHUNK];
        let mut written = 0u64;
        loop {
            let n = source.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            wav.push(&chunk[..n])?;
            written += self.drain(&mut wav, false).await?;
            if wav.finished() {
                break;
            }
        }
        written += self.drain(&mut wav, true).await?;
        Ok(written)
    }

    /// Open and play a WAV file
    pub async fn play_file(&mut self, path: impl AsRef<Path>) -> Result<u64> {
        let file = tokio::fs::File::open(path.as_ref()).await?;
        debug!(path = %path.as_ref().display(), "playing file");
        self.play(file, "audio/wav").await
    }

    /// Fetch and play a WAV resource over HTTP with RFC 7233 range windows
    ///
    /// The first request asks for `bytes=0-1023`; while the server answers
    /// `206 Partial Content` with a `Content-Range`, follow-up windows
    /// double in size until the advertised total is covered. A plain `200`
    /// on the first response falls back to one streamed fetch. Fetch and
    /// decode run concurrently and their errors are joined.
    pub async fn play_url(&mut self, url: &str) -> Result<u64> {
        let (tx, mut rx) = mpsc::channel::<Bytes>(8);
        let url = url.to_string();
        let fetcher = tokio::spawn(fetch_ranges(url, tx));

        let mut wav = WavStream::new();
        let mut written = 0u64;
        let mut decode_error: Option<MediaError> = None;
        while let Some(chunk) = rx.recv().await {
            if decode_error.is_some() {
                // Keep draining so the fetcher can finish and report.
                continue;
            }
            if let Err(e) = wav.push(&chunk) {
                decode_error = Some(e);
                continue;
            }
            match self.drain(&mut wav, false).await {
                Ok(n) => written += n,
                Err(e) => decode_error = Some(e),
            }
        }
        let fetch_result = fetcher.await.unwrap_or_else(|e| {
            Err(MediaError::Fetch(format!("fetch task panicked: {}", e)))
        });

        if let Some(e) = decode_error {
            if let Err(fetch_err) = fetch_result {
                warn!(error = %fetch_err, "fetch also failed");
            }
            return Err(e);
        }
        fetch_result?;
        written += self.drain(&mut wav, true).await?;
        Ok(written)
    }

    /// Write buffered PCM in codec-frame chunks; on `flush`, also write the
    /// trailing partial frame
    async fn drain(&mut self, wav: &mut WavStream, flush: bool) -> Result<u64> {
        if let Some(format) = wav.format() {
            format.validate_against(&self.codec)?;
        } else {
            return Ok(0);
        }
        let frame_len = self.codec.pcm_frame_len();
        let mut written = 0u64;
        while wav.pcm_available() >= frame_len || (flush && wav.pcm_available() > 0) {
            let chunk = wav.take_pcm(frame_len);
            // Keep sample alignment; a trailing odd byte cannot play.
            let usable = chunk.len() - chunk.len() % 2;
            if usable == 0 {
                break;
            }
            let n = self.writer.write(&chunk[..usable]).await?;
            written += n as u64;
            self.total_written += n as u64;
        }
        Ok(written)
    }
}

fn check_mime(mime: &str) -> Result<()> {
    let normalized = mime
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "audio/wav" | "audio/x-wav" | "audio/wave" | "audio/vnd.wave" => Ok(()),
        _ => Err(MediaError::Usage("unsupported playback MIME type")),
    }
}

/// Range-window fetch loop feeding the decoder channel
async fn fetch_ranges(url: String, tx: mpsc::Sender<Bytes>) -> Result<()> {
    let client = reqwest::Client::new();

    let first = client
        .get(&url)
        .header(reqwest::header::RANGE, range_header(0, INITIAL_RANGE_WINDOW))
        .timeout(FETCH_TIMEOUT)
        .send()
        .await
        .map_err(|e| MediaError::Fetch(e.to_string()))?;

    match first.status().as_u16() {
        206 => {
            let total = content_range_total(&first)?;
            let body = first
                .bytes()
                .await
                .map_err(|e| MediaError::Fetch(e.to_string()))?;
            let mut offset = body.len() as u64;
            if tx.send(body).await.is_err() {
                return Ok(());
            }

            let mut window = INITIAL_RANGE_WINDOW;
            while offset < total {
                window *= 2;
                let resp = client
                    .get(&url)
                    .header(reqwest::header::RANGE, range_header(offset, window))
                    .timeout(FETCH_TIMEOUT)
                    .send()
                    .await
                    .map_err(|e| MediaError::Fetch(e.to_string()))?;
                if resp.status().as_u16() != 206 {
                    return Err(MediaError::Fetch(format!(
                        "expected 206 for range at {}, got {}",
                        offset,
                        resp.status()
                    )));
                }
                content_range_total(&resp)?;
                let body = resp
                    .bytes()
                    .await
                    .map_err(|e| MediaError::Fetch(e.to_string()))?;
                if body.is_empty() {
                    return Err(MediaError::Fetch("empty range response".into()));
                }
                offset += body.len() as u64;
                if tx.send(body).await.is_err() {
                    return Ok(());
                }
            }
            Ok(())
        }
        200 => {
            // Server ignores ranges; stream the single response.
            let mut resp = first;
            while let Some(chunk) = resp
                .chunk()
                .await
                .map_err(|e| MediaError::Fetch(e.to_string()))?
            {
                if tx.send(chunk).await.is_err() {
                    return Ok(());
                }
            }
            Ok(())
        }
        status => Err(MediaError::Fetch(format!("unexpected status {}", status))),
    }
}

fn range_header(offset: u64, window: u64) -> String {
    format!("bytes={}-{}", offset, offset + window - 1)
}

/// Total length out of `Content-Range: bytes 0-1023/40000`
fn content_range_total(resp: &reqwest::Response) -> Result<u64> {
    let value = resp
        .headers()
        .get(reqwest::header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| MediaError::Fetch("206 without Content-Range".into()))?;
    value
        .rsplit('/')
        .next()
        .and_then(|total| total.trim().parse().ok())
        .ok_or_else(|| MediaError::Fetch(format!("unparsable Content-Range {:?}", value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_gate() {
        assert!(check_mime("audio/wav").is_ok());
        assert!(check_mime("audio/x-wav; rate=8000").is_ok());
        assert!(check_mime("AUDIO/WAVE").is_ok());
        assert!(check_mime("audio/mpeg").is_err());
    }

    #[test]
    fn range_header_shape() {
        assert_eq!(range_header(0, 1024), "bytes=0-1023");
        assert_eq!(range_header(1024, 2048), "bytes=1024-3071");
        assert_eq!(range_header(3072, 4096), "bytes=3072-7167");
    }
}
