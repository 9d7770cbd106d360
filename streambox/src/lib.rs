//! Live H.264/AAC publishing over RTMP.
//!
//! A capture source feeds compressed frames into a [`StreamController`],
//! which parses their framing (ADTS for AAC, Annex B for H.264), rebases
//! timestamps onto a zero-origin millisecond clock and hands the resulting
//! frames to a publisher thread through a bounded [`FrameQueue`]. The
//! publisher drives an [`rtmp::RtmpSession`] over TCP: handshake, `connect`
//! and `publish` commands, then audio/video messages chunked per RTMP 1.0.

use std::time::Duration;

pub mod codec;
pub mod controller;
pub mod media;
pub mod muxer;
pub mod queue;
pub mod rtmp;

pub use controller::{PublisherEvent, ServerUrl, StreamController, UrlError};
pub use media::{AudioConfig, FrameKind, MediaFrame, StreamCounters, VideoConfig};
pub use muxer::MediaMuxer;
pub use queue::FrameQueue;

/// Tunables for a publishing session.
///
/// The defaults match the live-capture deployment this pipeline was built
/// for; they are constructor inputs rather than compile-time constants so a
/// host application can adjust them without a rebuild.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Outgoing RTMP chunk size, announced via Set Chunk Size.
    pub chunk_size: usize,
    /// Audio lane depth; audio gets twice the video depth because frames
    /// arrive at finer granularity.
    pub audio_queue_cap: usize,
    /// Video lane depth.
    pub video_queue_cap: usize,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Cumulative deadline for the server's handshake bytes.
    pub handshake_timeout: Duration,
    /// Poll interval for deadline-bounded reads; a stop request interrupts a
    /// blocked read within one interval.
    pub read_poll_interval: Duration,
    /// `flashVer` advertised in the connect command.
    pub flash_version: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            chunk_size: 4096,
            audio_queue_cap: 256,
            video_queue_cap: 128,
            connect_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(120),
            read_poll_interval: Duration::from_millis(500),
            flash_version: "FMLE/3.0 (compatible; streambox)".to_string(),
        }
    }
}
