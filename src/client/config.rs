//! Client configuration

use std::time::Duration;

use crate::target::RtmpTarget;

/// Configuration for [`PublishClient`](super::PublishClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Where to publish
    pub target: RtmpTarget,

    /// TCP connect timeout
    pub connect_timeout: Duration,

    /// `flashVer` string sent in `connect()`; `None` keeps the
    /// FMLE-compatible default
    pub version_string: Option<String>,

    /// Kernel send buffer size to request (`SO_SNDBUF`). Smaller
    /// buffers mean earlier congestion signals and better frame
    /// dropping; `None` keeps the OS default.
    pub os_write_buffer_size: Option<usize>,

    /// Gamer-mode average upload rate in bytes per second
    pub average_upload: Option<u32>,

    /// Seconds without congestion before saturation mode exits
    pub exit_sat_mode_time: Option<f32>,
}

impl ClientConfig {
    /// Configuration for a target URL whose last path segment is the
    /// stream name. Returns `None` for URLs the publisher cannot dial.
    pub fn from_url(url: &str) -> Option<Self> {
        Some(Self::new(RtmpTarget::from_url(url, true)?))
    }

    pub fn new(target: RtmpTarget) -> Self {
        Self {
            target,
            connect_timeout: Duration::from_secs(10),
            version_string: None,
            os_write_buffer_size: None,
            average_upload: None,
            exit_sat_mode_time: None,
        }
    }
}
