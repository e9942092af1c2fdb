//! Incremental WAV container walker
//!
//! Playback sources arrive as a byte stream (ranged HTTP, file chunks), so
//! the RIFF structure is parsed incrementally: feed bytes in, pull decoded
//! PCM data out once the `fmt ` chunk has been seen. Only uncompressed
//! 16-bit PCM is accepted. Whole-file paths (recording, fixtures) use the
//! `hound` crate instead.

use crate::codec::Codec;
use crate::error::{MediaError, Result};

/// Format read from the `fmt ` chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavFormat {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
}

impl WavFormat {
    /// Reject sample-rate/depth/channel mismatches against the negotiated
    /// codec before any audio is written
    pub fn validate_against(&self, codec: &Codec) -> Result<()> {
        if self.bits_per_sample != 16 {
            return Err(MediaError::InvalidWav(format!(
                "{}-bit samples, only 16-bit PCM is playable",
                self.bits_per_sample
            )));
        }
        if self.sample_rate != codec.sample_rate {
            return Err(MediaError::InvalidWav(format!(
                "sample rate {} does not match codec {}",
                self.sample_rate, codec
            )));
        }
        if self.channels != codec.num_channels as u16 {
            return Err(MediaError::InvalidWav(format!(
                "{} channels, codec expects {}",
                self.channels, codec.num_channels
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
enum WalkState {
    /// Waiting for the 12-byte RIFF/WAVE preamble
    Preamble,
    /// Walking chunk headers looking for `fmt ` and `data`
    Chunks,
    /// Skipping an uninteresting chunk body
    Skipping(u64),
    /// Inside the data chunk; remaining payload (u64::MAX = unbounded)
    Data(u64),
    Done,
}

/// Streaming WAV parser: push bytes, take PCM
#[derive(Debug)]
pub struct WavStream {
    buf: Vec<u8>,
    state: WalkState,
    format: Option<WavFormat>,
    pcm: Vec<u8>,
}

impl WavStream {
    pub fn new() -> Self {
        WavStream {
            buf: Vec::new(),
            state: WalkState::Preamble,
            format: None,
            pcm: Vec::new(),
        }
    }

    /// Format, once the `fmt ` chunk has been parsed
    pub fn format(&self) -> Option<WavFormat> {
        self.format
    }

    /// Feed the next chunk of container bytes
    pub fn push(&mut self, bytes: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(bytes);
        self.advance()
    }

    /// Drain up to `max` decoded PCM bytes
    pub fn take_pcm(&mut self, max: usize) -> Vec<u8> {
        let n = self.pcm.len().min(max);
        self.pcm.drain(..n).collect()
    }

    pub fn pcm_available(&self) -> usize {
        self.pcm.len()
    }

    /// True once the data chunk has been fully consumed
    pub fn finished(&self) -> bool {
        matches!(self.state, WalkState::Done)
    }

    fn advance(&mut self) -> Result<()> {
        loop {
            match self.state {
                WalkState::Preamble => {
                    if self.buf.len() < 12 {
                        return Ok(());
                    }
                    if &self.buf[0..4] != b"RIFF" || &self.buf[8..12] != b"WAVE" {
                        return Err(MediaError::InvalidWav("missing RIFF/WAVE preamble".into()));
                    }
                    self.buf.drain(..12);
                    self.state = WalkState::Chunks;
                }
                WalkState::Chunks => {
                    if self.buf.len() < 8 {
                        return Ok(());
                    }
                    let id = [self.buf[0], self.buf[1], self.buf[2], self.buf[3]];
                    let size =
                        u32::from_le_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]);
                    match &id {
                        b"fmt " => {
                            if self.buf.len() < 8 + size as usize {
                                return Ok(());
                            }
                            let body = &self.buf[8..8 + size as usize];
                            if body.len() < 16 {
                                return Err(MediaError::InvalidWav("short fmt chunk".into()));
                            }
                            let audio_format = u16::from_le_bytes([body[0], body[1]]);
                            if audio_format != 1 {
                                return Err(MediaError::InvalidWav(format!(
                                    "compression format {} is not linear PCM",
                                    audio_format
                                )));
                            }
                            self.format = Some(WavFormat {
                                channels: u16::from_le_bytes([body[2], body[3]]),
                                sample_rate: u32::from_le_bytes([
                                    body[4], body[5], body[6], body[7],
                                ]),
                                bits_per_sample: u16::from_le_bytes([body[14], body[15]]),
                            });
                            self.buf.drain(..8 + size as usize);
                        }
                        b"data" => {
                            if self.format.is_none() {
                                return Err(MediaError::InvalidWav(
                                    "data chunk before fmt chunk".into(),
                                ));
                            }
                            self.buf.drain(..8);
                            // Size 0 or all-ones means a streamed/unknown
                            // length; consume until the source ends.
                            let remaining = if size == 0 || size == u32::MAX {
                                u64::MAX
                            } else {
                                size as u64
                            };
                            self.state = WalkState::Data(remaining);
                        }
                        _ => {
                            // Chunk bodies are word-aligned.
                            let skip = size as u64 + (size as u64 & 1);
                            self.buf.drain(..8);
                            self.state = WalkState::Skipping(skip);
                        }
                    }
                }
                WalkState::Skipping(left) => {
                    let n = (left as usize).min(self.buf.len());
                    self.buf.drain(..n);
                    let left = left - n as u64;
                    if left > 0 {
                        self.state = WalkState::Skipping(left);
                        return Ok(());
                    }
                    self.state = WalkState::Chunks;
                }
                WalkState::Data(left) => {
                    let n = (left as usize).min(self.buf.len());
                    self.pcm.extend_from_slice(&self.buf[..n]);
                    self.buf.drain(..n);
                    if left != u64::MAX {
                        let left = left - n as u64;
                        if left == 0 {
                            self.state = WalkState::Done;
                            continue;
                        }
                        self.state = WalkState::Data(left);
                    }
                    return Ok(());
                }
                WalkState::Done => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PCMU;

    /// A minimal 8 kHz mono 16-bit WAV with `samples` frames of data
    pub(crate) fn wav_bytes(samples: &[i16]) -> Vec<u8> {
        let mut pcm = Vec::with_capacity(samples.len() * 2);
        for s in samples {
            pcm.extend_from_slice(&s.to_le_bytes());
        }
        let data_len = pcm.len() as u32;
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes()); // PCM
        out.extend_from_slice(&1u16.to_le_bytes()); // mono
        out.extend_from_slice(&8000u32.to_le_bytes());
        out.extend_from_slice(&16000u32.to_le_bytes()); // byte rate
        out.extend_from_slice(&2u16.to_le_bytes()); // block align
        out.extend_from_slice(&16u16.to_le_bytes()); // bits
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        out.extend_from_slice(&pcm);
        out
    }

    #[test]
    fn parses_one_byte_at_a_time() {
        let samples: Vec<i16> = (0..400).map(|i| i as i16).collect();
        let wav = wav_bytes(&samples);
        let mut stream = WavStream::new();
        for b in &wav {
            stream.push(std::slice::from_ref(b)).unwrap();
        }
        let format = stream.format().unwrap();
        assert_eq!(format.sample_rate, 8000);
        assert_eq!(format.bits_per_sample, 16);
        format.validate_against(&PCMU).unwrap();
        assert!(stream.finished());
        assert_eq!(stream.pcm_available(), 800);
        let pcm = stream.take_pcm(usize::MAX);
        assert_eq!(i16::from_le_bytes([pcm[2], pcm[3]]), 1);
    }

    #[test]
    fn rejects_wrong_rate_and_depth() {
        let format = WavFormat {
            channels: 1,
            sample_rate: 44_100,
            bits_per_sample: 16,
        };
        assert!(format.validate_against(&PCMU).is_err());
        let format = WavFormat {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: 8,
        };
        assert!(format.validate_against(&PCMU).is_err());
    }

    #[test]
    fn skips_foreign_chunks() {
        let samples = [1i16, 2, 3];
        let mut wav = Vec::new();
        wav.extend_from_slice(b"RIFF");
        wav.extend_from_slice(&0u32.to_le_bytes());
        wav.extend_from_slice(b"WAVE");
        wav.extend_from_slice(b"LIST");
        wav.extend_from_slice(&5u32.to_le_bytes());
        wav.extend_from_slice(b"INFOx\0"); // 5 bytes + pad
        let rest = wav_bytes(&samples);
        wav.extend_from_slice(&rest[12..]); // strip the second preamble
        let mut stream = WavStream::new();
        stream.push(&wav).unwrap();
        assert!(stream.format().is_some());
        assert_eq!(stream.pcm_available(), 6);
    }

    #[test]
    fn garbage_preamble_is_rejected() {
        let mut stream = WavStream::new();
        assert!(stream.push(b"ID3\x04this is not a wav").is_err());
    }
}
