use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use log::trace;

use crate::{FrameKind, MediaFrame, StreamCounters};

struct Lanes {
    audio: VecDeque<MediaFrame>,
    video: VecDeque<MediaFrame>,
    stopped: bool,
    delivered_audio: bool,
    delivered_video: bool,
}

/// Bounded two-lane frame buffer between the capture thread and the
/// publisher thread.
///
/// Posting never blocks: a full lane drops the new frame and counts it.
/// Audio gets twice the video depth because it arrives at much finer
/// granularity.
pub struct FrameQueue {
    lanes: Mutex<Lanes>,
    available: Condvar,
    audio_cap: usize,
    video_cap: usize,
    counters: Arc<StreamCounters>,
}

impl FrameQueue {
    pub fn new(audio_cap: usize, video_cap: usize, counters: Arc<StreamCounters>) -> Self {
        FrameQueue {
            lanes: Mutex::new(Lanes {
                audio: VecDeque::new(),
                video: VecDeque::new(),
                stopped: false,
                delivered_audio: false,
                delivered_video: false,
            }),
            available: Condvar::new(),
            audio_cap,
            video_cap,
            counters,
        }
    }

    pub fn post(&self, frame: MediaFrame) {
        let mut lanes = self.lanes.lock().unwrap();
        if lanes.stopped {
            return;
        }

        match frame.kind {
            FrameKind::EndOfStream => {
                lanes.audio.push_back(frame.clone());
                lanes.video.push_back(frame);
                self.available.notify_all();
            }
            FrameKind::Audio => {
                self.counters.record_audio_frame();
                if lanes.audio.len() >= self.audio_cap {
                    trace!("audio lane full, dropping frame at dts {}", frame.dts);
                    self.counters.record_dropped_frame();
                } else {
                    lanes.audio.push_back(frame);
                    self.available.notify_all();
                }
            }
            FrameKind::Video => {
                self.counters.record_video_frame();
                if lanes.video.len() >= self.video_cap {
                    trace!("video lane full, dropping frame at dts {}", frame.dts);
                    self.counters.record_dropped_frame();
                } else {
                    lanes.video.push_back(frame);
                    self.available.notify_all();
                }
            }
        }
    }

    /// Takes the next frame to send, blocking until one is deliverable or the
    /// queue is stopped.
    ///
    /// Frames are interleaved in non-decreasing dts order across the two
    /// lanes, with audio winning ties. A lane that is alone in having data is
    /// only drained once the other kind has been delivered at least once, so
    /// a leading audio-only burst is not sent before the first keyframe is
    /// available (and vice versa). An `EndOfStream` at the head of either
    /// lane is delivered immediately.
    pub fn take(&self) -> Option<MediaFrame> {
        let mut lanes = self.lanes.lock().unwrap();

        loop {
            if let Some(frame) = Self::pick(&mut lanes) {
                match frame.kind {
                    FrameKind::Audio => lanes.delivered_audio = true,
                    FrameKind::Video => lanes.delivered_video = true,
                    FrameKind::EndOfStream => {}
                }
                return Some(frame);
            }

            if lanes.stopped {
                return None;
            }

            lanes = self.available.wait(lanes).unwrap();
        }
    }

    fn pick(lanes: &mut Lanes) -> Option<MediaFrame> {
        let audio_head = lanes.audio.front();
        let video_head = lanes.video.front();

        if matches!(audio_head.map(|f| f.kind), Some(FrameKind::EndOfStream)) {
            return lanes.audio.pop_front();
        }
        if matches!(video_head.map(|f| f.kind), Some(FrameKind::EndOfStream)) {
            return lanes.video.pop_front();
        }

        match (audio_head, video_head) {
            (Some(audio), Some(video)) => {
                if audio.dts <= video.dts {
                    lanes.audio.pop_front()
                } else {
                    lanes.video.pop_front()
                }
            }
            (Some(_), None) if lanes.delivered_video => lanes.audio.pop_front(),
            (None, Some(_)) if lanes.delivered_audio => lanes.video.pop_front(),
            _ => None,
        }
    }

    pub fn stop(&self) {
        let mut lanes = self.lanes.lock().unwrap();
        lanes.stopped = true;
        self.available.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.lanes.lock().unwrap().stopped
    }
}
