//! voxide
//!
//! A programmable B2BUA framework: SIP dialog sessions coupled to live RTP
//! media with composable audio pipelines. An [`Endpoint`] serves inbound
//! calls into your handler and dials outbound legs; each call is a
//! [`ServerSession`] or [`ClientSession`] whose media you drive through
//! playback, DTMF, recording, a two-party [`Bridge`] or an N-party
//! [`Mixer`].
//!
//! ```no_run
//! use voxide::{Endpoint, EndpointConfig};
//!
//! # async fn run() -> voxide::Result<()> {
//! let endpoint = Endpoint::new(EndpointConfig::default()).await?;
//! endpoint
//!     .serve(|call| async move {
//!         if call.answer().await.is_ok() {
//!             if let Ok(mut playback) = call.media().playback() {
//!                 playback.play_file("welcome.wav").await.ok();
//!             }
//!         }
//!     })
//!     .await
//! # }
//! ```
//!
//! Environment signals: `LOG_LEVEL` is the conventional filter hosts hand
//! to `tracing-subscriber`; `SIP_DEBUG`, `RTP_DEBUG` and `RTCP_DEBUG`
//! enable per-message tracing in the respective layers.

pub mod bridge;
pub mod client_session;
pub mod config;
pub mod dialog_media;
pub mod endpoint;
pub mod error;
pub mod mixer;
pub mod register;
pub mod server_session;
pub mod session;

pub use bridge::Bridge;
pub use client_session::{ClientSession, InviteOptions, WaitAnswer};
pub use config::{EndpointConfig, TransportConfig};
pub use dialog_media::{DialogMedia, MediaReader, MediaWriter};
pub use endpoint::Endpoint;
pub use error::{Result, VoxideError};
pub use mixer::Mixer;
pub use register::{RegisterOptions, Registration};
pub use server_session::ServerSession;
pub use session::{DialogSession, SessionState};

// The media and SIP layers are part of the public surface.
pub use voxide_media_core as media;
pub use voxide_sip_core as sip;
