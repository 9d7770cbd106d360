use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

/// The kind of media a frame carries.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FrameKind {
    Audio,
    Video,
    /// Sentinel posted into both queue lanes when the capture side is done.
    EndOfStream,
}

/// A timestamped compressed frame on its way to the publisher.
///
/// Timestamps are milliseconds on the session's zero-origin clock. For audio
/// `pts == dts`; for video `pts - dts` is the B-frame composition delay.
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub kind: FrameKind,
    pub payload: Bytes,
    pub dts: i64,
    pub pts: i64,
}

impl MediaFrame {
    pub fn audio(payload: Bytes, ts: i64) -> Self {
        MediaFrame {
            kind: FrameKind::Audio,
            payload,
            dts: ts,
            pts: ts,
        }
    }

    pub fn video(payload: Bytes, dts: i64, pts: i64) -> Self {
        MediaFrame {
            kind: FrameKind::Video,
            payload,
            dts,
            pts,
        }
    }

    pub fn end_of_stream() -> Self {
        MediaFrame {
            kind: FrameKind::EndOfStream,
            payload: Bytes::new(),
            dts: 0,
            pts: 0,
        }
    }
}

/// Audio parameters derived from the first ADTS header of a session.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AudioConfig {
    /// Audio object type (2 = AAC-LC).
    pub aot: u8,
    pub sampling_rate_index: u8,
    pub sampling_rate: u32,
    pub channels: u8,
    /// Sample size in bytes (fixed at 2 by the capture source).
    pub sample_size: u8,
}

impl AudioConfig {
    /// Packs the 2-byte MPEG-4 AudioSpecificConfig:
    /// `aot(5) | frequency_index(4) | channel_config(4) | 000`.
    pub fn specific_config(&self) -> [u8; 2] {
        [
            (self.aot << 3) | (self.sampling_rate_index >> 1),
            (self.sampling_rate_index << 7) | (self.channels << 3),
        ]
    }

    /// Recovers `(aot, sampling_rate_index, channel_count)` from a packed
    /// AudioSpecificConfig.
    pub fn from_specific_config(config: [u8; 2]) -> (u8, u8, u8) {
        let aot = config[0] >> 3;
        let index = ((config[0] & 0x07) << 1) | (config[1] >> 7);
        let channels = (config[1] >> 3) & 0x0F;
        (aot, index, channels)
    }

    pub fn sampling_rate_display(&self) -> String {
        format!("{} kHz", self.sampling_rate as f32 / 1000.0)
    }

    pub fn channel_display(&self) -> &'static str {
        if self.channels == 1 {
            "mono"
        } else {
            "stereo"
        }
    }
}

impl fmt::Display for AudioConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "AAC aot={} {} {}",
            self.aot,
            self.sampling_rate_display(),
            self.channel_display()
        )
    }
}

/// H.264 parameter sets for the session, stored without start codes.
#[derive(Debug, Clone)]
pub struct VideoConfig {
    pub sps: Bytes,
    pub pps: Bytes,
}

/// Frame and byte counters shared between the publisher side and the UI
/// thread. Writers are the queue (frames) and the wire (bytes).
#[derive(Debug, Default)]
pub struct StreamCounters {
    audio_frames: AtomicU64,
    video_frames: AtomicU64,
    dropped_frames: AtomicU64,
    bytes_written: AtomicU64,
}

impl StreamCounters {
    pub fn record_audio_frame(&self) {
        self.audio_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_video_frame(&self) {
        self.video_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_frame(&self) {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn audio_frames(&self) -> u64 {
        self.audio_frames.load(Ordering::Relaxed)
    }

    pub fn video_frames(&self) -> u64 {
        self.video_frames.load(Ordering::Relaxed)
    }

    pub fn total_frames(&self) -> u64 {
        self.audio_frames() + self.video_frames()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.audio_frames.store(0, Ordering::Relaxed);
        self.video_frames.store(0, Ordering::Relaxed);
        self.dropped_frames.store(0, Ordering::Relaxed);
        self.bytes_written.store(0, Ordering::Relaxed);
    }
}
