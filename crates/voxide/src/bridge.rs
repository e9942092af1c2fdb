//! Two-party proxy bridge
//!
//! Forwards audio between exactly two dialogs whose negotiated codecs are
//! identical; there is no transcoding. Once the member count reaches the
//! wait count, two copy tasks pump each direction with a codec-frame
//! buffer; a network timeout on either side winds the bridge down cleanly.
//! Optional DTMF pass-through re-emits digits detected on one leg onto the
//! other.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use voxide_media_core::{copy_audio, DtmfReader, DtmfWriter};

use crate::error::{Result, VoxideError};
use crate::session::DialogSession;

/// Proxy-mode member limit
const PROXY_MAX_MEMBERS: usize = 2;

#[derive(Default)]
struct BridgeState {
    members: Vec<Arc<dyn DialogSession>>,
    started: bool,
    tasks: Vec<JoinHandle<()>>,
}

/// A two-party audio bridge
pub struct Bridge {
    state: Mutex<BridgeState>,
    /// Members required before the copy tasks start
    wait_count: usize,
    dtmf_passthrough: bool,
}

impl Bridge {
    pub fn new() -> Arc<Bridge> {
        Arc::new(Bridge {
            state: Mutex::new(BridgeState::default()),
            wait_count: PROXY_MAX_MEMBERS,
            dtmf_passthrough: false,
        })
    }

    /// Bridge that also forwards RFC 4733 digits between the legs
    pub fn with_dtmf_passthrough() -> Arc<Bridge> {
        Arc::new(Bridge {
            state: Mutex::new(BridgeState::default()),
            wait_count: PROXY_MAX_MEMBERS,
            dtmf_passthrough: true,
        })
    }

    /// The first member, whose codec dial-outs should preserve
    pub fn originator(&self) -> Option<Arc<dyn DialogSession>> {
        self.state.lock().members.first().cloned()
    }

    pub fn member_count(&self) -> usize {
        self.state.lock().members.len()
    }

    /// Add a leg; starts the bridge when the wait count is reached
    ///
    /// Fails without touching existing members when the bridge is full or
    /// the new leg's codec does not match (no transcoding supported).
    pub async fn add_dialog_session(self: &Arc<Self>, session: Arc<dyn DialogSession>) -> Result<()> {
        let new_codec = session
            .media()
            .session()?
            .audio_codec()
            .map_err(VoxideError::Media)?;

        let start_pair = {
            let mut state = self.state.lock();
            if state.members.len() >= PROXY_MAX_MEMBERS {
                return Err(VoxideError::Bridge(format!(
                    "bridge only supports {} dialog sessions",
                    PROXY_MAX_MEMBERS
                )));
            }
            if let Some(existing) = state.members.first() {
                let existing_codec = existing
                    .media()
                    .session()?
                    .audio_codec()
                    .map_err(VoxideError::Media)?;
                if !existing_codec.is_compatible(&new_codec) {
                    return Err(VoxideError::Bridge(format!(
                        "no transcoding supported: {} does not match {}",
                        new_codec, existing_codec
                    )));
                }
            }
            state.members.push(session.clone());
            debug!(
                id = %session.session_id(),
                members = state.members.len(),
                "bridge member added"
            );
            if state.members.len() == self.wait_count && !state.started {
                state.started = true;
                Some((state.members[0].clone(), state.members[1].clone()))
            } else {
                None
            }
        };

        if let Some((a, b)) = start_pair {
            self.start(a, b)?;
        }
        Ok(())
    }

    fn start(self: &Arc<Self>, a: Arc<dyn DialogSession>, b: Arc<dyn DialogSession>) -> Result<()> {
        info!(
            a = %a.session_id(),
            b = %b.session_id(),
            dtmf = self.dtmf_passthrough,
            "bridge started"
        );
        let mut tasks = vec![
            spawn_copy(a.clone(), b.clone()),
            spawn_copy(b.clone(), a.clone()),
        ];
        if self.dtmf_passthrough {
            if let Some(task) = spawn_dtmf_forward(&a, &b) {
                tasks.push(task);
            }
            if let Some(task) = spawn_dtmf_forward(&b, &a) {
                tasks.push(task);
            }
        }
        self.state.lock().tasks.extend(tasks);
        Ok(())
    }

    /// Wait for the copy tasks to finish (stream end on either side)
    pub async fn wait(&self) {
        let tasks = std::mem::take(&mut self.state.lock().tasks);
        for task in tasks {
            task.await.ok();
        }
    }
}

/// One direction: source's audio reader into sink's audio writer
fn spawn_copy(source: Arc<dyn DialogSession>, sink: Arc<dyn DialogSession>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let frame_len = match source
            .media()
            .session()
            .and_then(|s| s.audio_codec().map_err(VoxideError::Media))
        {
            Ok(codec) => codec.payload_frame_len(),
            Err(e) => {
                warn!(error = %e, "bridge direction aborted");
                return;
            }
        };
        let (mut reader, mut writer) = match (
            source.media().audio_reader(),
            sink.media().audio_writer(),
        ) {
            (Ok(r), Ok(w)) => (r, w),
            _ => {
                warn!("bridge direction aborted: media not ready");
                return;
            }
        };
        match copy_audio(&mut reader, &mut writer, frame_len).await {
            Ok(moved) => debug!(
                from = %source.session_id(),
                to = %sink.session_id(),
                moved,
                "bridge direction finished"
            ),
            Err(e) => warn!(error = %e, "bridge direction failed"),
        }
    })
}

/// Forward detected digits from `source` onto `sink`
fn spawn_dtmf_forward(
    source: &Arc<dyn DialogSession>,
    sink: &Arc<dyn DialogSession>,
) -> Option<JoinHandle<()>> {
    let rtp_reader = source.media().rtp_reader().ok()?;
    let rtp_writer = sink.media().rtp_writer().ok()?;
    let mut dtmf_reader = DtmfReader::new(&rtp_reader);
    let dtmf_writer = DtmfWriter::new(rtp_writer);
    Some(tokio::spawn(async move {
        while let Some(digit) = dtmf_reader.recv().await {
            if let Err(e) = dtmf_writer.write_digit(digit).await {
                warn!(error = %e, "DTMF pass-through write failed");
                return;
            }
        }
    }))
}
