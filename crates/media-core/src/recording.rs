//! Call recording
//!
//! Taps installed into the audio chain decode the passing codec frames to
//! 16-bit PCM and accumulate them; `save` writes the take as a WAV file via
//! hound. Taps are transparent: audio flows through unchanged.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::audio::{AudioReader, AudioWriter};
use crate::codec::Codec;
use crate::error::{MediaError, Result};

/// One accumulating recording, shareable across taps
#[derive(Clone)]
pub struct Recording {
    codec: Codec,
    samples: Arc<Mutex<Vec<i16>>>,
}

impl Recording {
    pub fn new(codec: Codec) -> Result<Recording> {
        if !codec.is_audio() {
            return Err(MediaError::UnsupportedCodec("telephone-event"));
        }
        Ok(Recording {
            codec,
            samples: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Samples captured so far
    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    fn append_payload(&self, payload: &[u8]) {
        let mut samples = self.samples.lock();
        samples.reserve(payload.len());
        for &code in payload {
            if let Ok(sample) = self.codec.decode_sample(code) {
                samples.push(sample);
            }
        }
    }

    /// Tap the read side of a chain
    pub fn tap_reader<R: AudioReader>(&self, inner: R) -> RecordingReader<R> {
        RecordingReader {
            inner,
            recording: self.clone(),
        }
    }

    /// Tap the write side of a chain
    pub fn tap_writer<W: AudioWriter>(&self, inner: W) -> RecordingWriter<W> {
        RecordingWriter {
            inner,
            recording: self.clone(),
        }
    }

    /// Write the take to `path` as 16-bit PCM WAV
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<u64> {
        let samples: Vec<i16> = self.samples.lock().clone();
        let spec = hound::WavSpec {
            channels: self.codec.num_channels as u16,
            sample_rate: self.codec.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let path = path.as_ref().to_path_buf();
        let count = samples.len() as u64;
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut writer = hound::WavWriter::create(&path, spec)
                .map_err(|e| MediaError::InvalidWav(e.to_string()))?;
            for sample in samples {
                writer
                    .write_sample(sample)
                    .map_err(|e| MediaError::InvalidWav(e.to_string()))?;
            }
            writer
                .finalize()
                .map_err(|e| MediaError::InvalidWav(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| MediaError::InvalidWav(format!("writer task failed: {}", e)))??;
        debug!(samples = count, "recording saved");
        Ok(count)
    }
}

/// Transparent recording tap on a reader
pub struct RecordingReader<R> {
    inner: R,
    recording: Recording,
}

#[async_trait]
impl<R: AudioReader> AudioReader for RecordingReader<R> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.inner.read(buf).await?;
        self.recording.append_payload(&buf[..n]);
        Ok(n)
    }
}

/// Transparent recording tap on a writer
pub struct RecordingWriter<W> {
    inner: W,
    recording: Recording,
}

#[async_trait]
impl<W: AudioWriter> AudioWriter for RecordingWriter<W> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.recording.append_payload(buf);
        self.inner.write(buf).await
    }
}
