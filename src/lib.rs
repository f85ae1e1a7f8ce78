//! rtmp-publish: an RTMP 1.0 publishing client
//!
//! Pushes a live H.264/AAC stream to an RTMP ingest (nginx-rtmp, FMS,
//! Wowza, Twitch-style services). The library owns the chunk protocol,
//! the AMF0 command plumbing, FLV frame shaping and a congestion-aware
//! write path; encoding is the application's job, it hands over NAL
//! units and AAC access units with timestamps.
//!
//! The core ([`RtmpSession`]) is a sans-io state machine driven by
//! socket notifications, so it embeds in any event loop and tests
//! without a network. [`client::PublishClient`] is the batteries
//! included tokio driver on top.
//!
//! # Example
//!
//! ```no_run
//! use rtmp_publish::{AmfObject, ClientConfig, PublishClient, SessionEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::from_url("rtmp://localhost/live/streamKey")
//!         .ok_or("bad URL")?;
//!     let (client, mut events) = PublishClient::launch(config)?;
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             SessionEvent::ConnectedToApp => client.begin_publishing().await?,
//!             SessionEvent::PublisherReady => {
//!                 let meta = AmfObject::new()
//!                     .with("width", 1280.0)
//!                     .with("height", 720.0)
//!                     .with("videocodecid", 7.0);
//!                 client.write_data_frame(meta).await?;
//!                 // write_avc_config_record, then frames...
//!             }
//!             SessionEvent::Disconnected => break,
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Gamer mode
//!
//! An opt-in process-wide throttle that smooths the uplink so a game
//! sharing the connection doesn't see latency spikes. Enable it with
//! [`gamer::set_enabled`] before creating sessions and call
//! [`RtmpSession::gamer_tick_event`] at the configured frequency; when
//! the link saturates anyway, the session falls back to plain TCP flow
//! control until the congestion clears.

pub mod amf;
pub mod client;
pub mod error;
pub mod media;
pub mod protocol;
pub mod session;
pub mod target;

pub use amf::{AmfObject, AmfValue};
pub use client::{ClientConfig, PublishClient, PublishCommand};
pub use error::{Error, ErrorKind, Result};
pub use session::pipeline::{gamer, Transport};
pub use session::{AckLimitType, ConnectionState, RtmpSession, SessionEvent};
pub use target::{RtmpTarget, TargetProtocol};
