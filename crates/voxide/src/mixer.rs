//! N-party audio mixer
//!
//! Decodes each member's stream to linear PCM, sums one frame per member
//! per tick with saturation, and writes every member the mix minus their
//! own contribution so nobody hears themselves. Membership changes pause
//! the mix, rebuild the per-stream decode/encode chains and resume; members
//! hear silence for the rebuilt frame. State: 0 stopped, 1 running, 2
//! stopping.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use voxide_media_core::{
    AudioReader, AudioWriter, Codec, MediaError, PcmDecoderReader, PcmEncoderWriter,
};

use crate::dialog_media::{MediaReader, MediaWriter};
use crate::error::{Result, VoxideError};
use crate::session::DialogSession;

pub const MIXER_STOPPED: u8 = 0;
pub const MIXER_RUNNING: u8 = 1;
pub const MIXER_STOPPING: u8 = 2;

/// Frames buffered per member between its pump and the mix loop
const FRAME_QUEUE: usize = 2;

struct MixerInner {
    members: Vec<Arc<dyn DialogSession>>,
    pump_tasks: Vec<JoinHandle<()>>,
    mix_task: Option<JoinHandle<()>>,
    stop_tx: Option<watch::Sender<bool>>,
}

/// An N-party conference mix
pub struct Mixer {
    state: AtomicU8,
    inner: tokio::sync::Mutex<MixerInner>,
}

impl Mixer {
    pub fn new() -> Arc<Mixer> {
        Arc::new(Mixer {
            state: AtomicU8::new(MIXER_STOPPED),
            inner: tokio::sync::Mutex::new(MixerInner {
                members: Vec::new(),
                pump_tasks: Vec::new(),
                mix_task: None,
                stop_tx: None,
            }),
        })
    }

    /// 0 stopped, 1 running, 2 stopping
    pub fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    pub async fn member_count(&self) -> usize {
        self.inner.lock().await.members.len()
    }

    /// Add a member; sample rate and frame duration must match the mix
    pub async fn add_dialog_session(
        self: &Arc<Self>,
        session: Arc<dyn DialogSession>,
    ) -> Result<()> {
        let codec = session
            .media()
            .session()?
            .audio_codec()
            .map_err(VoxideError::Media)?;

        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.members.first() {
            let reference = existing
                .media()
                .session()?
                .audio_codec()
                .map_err(VoxideError::Media)?;
            if reference.sample_rate != codec.sample_rate
                || reference.frame_duration != codec.frame_duration
            {
                return Err(VoxideError::Bridge(format!(
                    "mixer requires matching clock: {} does not mix with {}",
                    codec, reference
                )));
            }
        }
        self.pause(&mut inner).await;
        inner.members.push(session.clone());
        info!(id = %session.session_id(), members = inner.members.len(), "mixer member joined");
        self.resume(&mut inner)?;
        Ok(())
    }

    /// Remove a member by its session id
    pub async fn remove_dialog_session(self: &Arc<Self>, session_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.pause(&mut inner).await;
        inner.members.retain(|m| m.session_id() != session_id);
        debug!(id = %session_id, members = inner.members.len(), "mixer member left");
        self.resume(&mut inner)?;
        Ok(())
    }

    /// Stop mixing and drop all members
    pub async fn close(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        self.pause(&mut inner).await;
        inner.members.clear();
    }

    /// Halt the mix loop and the pumps
    async fn pause(&self, inner: &mut MixerInner) {
        if self.state.load(Ordering::Acquire) != MIXER_RUNNING {
            return;
        }
        self.state.store(MIXER_STOPPING, Ordering::Release);
        if let Some(stop) = inner.stop_tx.take() {
            let _ = stop.send(true);
        }
        if let Some(task) = inner.mix_task.take() {
            task.await.ok();
        }
        for task in inner.pump_tasks.drain(..) {
            task.await.ok();
        }
        self.state.store(MIXER_STOPPED, Ordering::Release);
    }

    /// Rebuild every member's decode/encode chain and restart the loop
    fn resume(self: &Arc<Self>, inner: &mut MixerInner) -> Result<()> {
        if inner.members.is_empty() {
            return Ok(());
        }
        let reference = inner.members[0]
            .media()
            .session()?
            .audio_codec()
            .map_err(VoxideError::Media)?;
        let frame_duration = reference.frame_duration;
        let samples = reference.pcm_frame_len() / 2;

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut sinks = Vec::with_capacity(inner.members.len());
        let mut sources = Vec::with_capacity(inner.members.len());
        let mut pumps = Vec::with_capacity(inner.members.len());
        for member in &inner.members {
            let codec = member
                .media()
                .session()?
                .audio_codec()
                .map_err(VoxideError::Media)?;
            let reader = PcmDecoderReader::new(codec, member.media().audio_reader()?)
                .map_err(VoxideError::Media)?;
            let writer = PcmEncoderWriter::new(codec, member.media().audio_writer()?)
                .map_err(VoxideError::Media)?;
            let (frame_tx, frame_rx) = mpsc::channel::<Vec<i16>>(FRAME_QUEUE);
            pumps.push(spawn_pump(reader, frame_tx, codec, stop_rx.clone()));
            sources.push(frame_rx);
            sinks.push(writer);
        }
        inner.pump_tasks.extend(pumps);

        let mixer = self.clone();
        let mut stop_rx_loop = stop_rx;
        inner.mix_task = Some(tokio::spawn(async move {
            mixer
                .mix_loop(sources, sinks, samples, frame_duration, &mut stop_rx_loop)
                .await;
        }));
        inner.stop_tx = Some(stop_tx);
        self.state.store(MIXER_RUNNING, Ordering::Release);
        Ok(())
    }

    async fn mix_loop(
        &self,
        mut sources: Vec<mpsc::Receiver<Vec<i16>>>,
        mut sinks: Vec<PcmEncoderWriter<MediaWriter>>,
        samples: usize,
        frame_duration: Duration,
        stop: &mut watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(frame_duration);
        let mut contributions: Vec<Option<Vec<i16>>> = vec![None; sources.len()];
        loop {
            tokio::select! {
                _ = stop.changed() => return,
                _ = ticker.tick() => {}
            }

            // One frame per member; a stream with nothing buffered this
            // tick contributes silence.
            for (slot, source) in contributions.iter_mut().zip(sources.iter_mut()) {
                *slot = source.try_recv().ok();
            }

            let mut mixed = vec![0i32; samples];
            for frame in contributions.iter().flatten() {
                for (acc, &sample) in mixed.iter_mut().zip(frame.iter()) {
                    *acc += sample as i32;
                }
            }

            // Each member hears the mix minus their own contribution.
            let mut outs: Vec<Vec<u8>> = Vec::with_capacity(sinks.len());
            for contribution in &contributions {
                let mut pcm = Vec::with_capacity(samples * 2);
                for (i, &total) in mixed.iter().enumerate() {
                    let own = contribution
                        .as_ref()
                        .and_then(|f| f.get(i).copied())
                        .unwrap_or(0) as i32;
                    let sample = (total - own).clamp(i16::MIN as i32, i16::MAX as i32) as i16;
                    pcm.extend_from_slice(&sample.to_le_bytes());
                }
                outs.push(pcm);
            }

            let writes = sinks
                .iter_mut()
                .zip(outs.iter())
                .map(|(sink, out)| sink.write(out));
            for result in futures::future::join_all(writes).await {
                if let Err(e) = result {
                    if !e.is_clean_shutdown() {
                        warn!(error = %e, "mixer write failed");
                    }
                }
            }
        }
    }
}

/// Decode one member's stream into the frame queue until EOF or stop
fn spawn_pump(
    mut reader: PcmDecoderReader<MediaReader>,
    frames: mpsc::Sender<Vec<i16>>,
    codec: Codec,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; codec.pcm_frame_len()];
        loop {
            let read = tokio::select! {
                _ = stop.changed() => return,
                read = reader.read(&mut buf) => read,
            };
            match read {
                Ok(n) if n >= 2 => {
                    let frame: Vec<i16> = buf[..n]
                        .chunks_exact(2)
                        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
                        .collect();
                    if frames.try_send(frame).is_err() {
                        // Queue full: the mix is behind, drop the oldest by
                        // letting this frame go.
                        continue;
                    }
                }
                Ok(_) => continue,
                Err(MediaError::Timeout) => continue,
                Err(_) => return,
            }
        }
    })
}
