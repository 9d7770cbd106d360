use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info};
use once_cell::sync::OnceCell;

use crate::codec::aac::{self, AdtsHeader};
use crate::codec::{nal, CodecError};
use crate::{AudioConfig, MediaFrame, VideoConfig};

/// Milliseconds reserved at the start of the video timeline for the SPS and
/// PPS pseudo-frames that prime the session.
const PARAMETER_SET_OFFSET_MS: i64 = 2;

/// Turns raw capture frames into typed [`MediaFrame`]s.
///
/// The first audio frame yields the session's [`AudioConfig`] from its ADTS
/// header; the first video frame yields SPS/PPS from its Annex-B prelude.
/// Capture timestamps (microseconds, arbitrary origin) are rebased onto a
/// zero-origin millisecond clock per stream, carrying the sub-millisecond
/// remainder so rounding never drifts.
pub struct MediaMuxer {
    audio_start: Option<u64>,
    audio_remainder: u64,
    video_start: Option<u64>,
    video_remainder: u64,
    audio_config: Arc<OnceCell<AudioConfig>>,
    video_config: Option<VideoConfig>,
}

impl MediaMuxer {
    pub fn new(audio_config: Arc<OnceCell<AudioConfig>>) -> Self {
        MediaMuxer {
            audio_start: None,
            audio_remainder: 0,
            video_start: None,
            video_remainder: 0,
            audio_config,
            video_config: None,
        }
    }

    pub fn audio_config(&self) -> Option<AudioConfig> {
        self.audio_config.get().copied()
    }

    pub fn video_config(&self) -> Option<&VideoConfig> {
        self.video_config.as_ref()
    }

    /// Ingests one ADTS-framed AAC frame. The 7-byte header is stripped and
    /// the access unit is stamped with the rebased timestamp.
    pub fn handle_audio(&mut self, buffer: &[u8], ts_us: u64) -> Result<MediaFrame, CodecError> {
        if self.audio_start.is_none() {
            let header = AdtsHeader::parse(buffer)?;
            let config = header.config();
            info!("audio configuration: {config}");

            // First configuration wins; the session reads it when it sends
            // the AAC sequence header.
            let _ = self.audio_config.set(config);
            self.audio_start = Some(ts_us);
            self.audio_remainder = 0;
        }

        let data = aac::strip_header(buffer)?;
        let ts = rebase(self.audio_start.unwrap_or(ts_us), &mut self.audio_remainder, ts_us);

        Ok(MediaFrame::audio(Bytes::copy_from_slice(data), ts))
    }

    /// Ingests one Annex-B framed H.264 access unit.
    ///
    /// The first (key)frame contributes up to three frames: the SPS and PPS
    /// pseudo-frames at dts 0 and 1, then the slice itself. Slice frames are
    /// start-code-stripped and shifted by the parameter-set offset.
    pub fn handle_video(
        &mut self,
        buffer: &[u8],
        ts_us: u64,
        is_key: bool,
    ) -> Result<Vec<MediaFrame>, CodecError> {
        let mut frames = Vec::with_capacity(1);

        if self.video_start.is_none() {
            let config = nal::split_prelude(buffer)?;
            debug!(
                "video configuration: SPS {} bytes, PPS {} bytes",
                config.sps.len(),
                config.pps.len()
            );

            frames.push(MediaFrame::video(config.sps.clone(), 0, 0));
            frames.push(MediaFrame::video(config.pps.clone(), 1, 1));
            self.video_config = Some(config);
            self.video_start = Some(ts_us);
            self.video_remainder = 0;
        }

        let config = self.video_config.as_ref().ok_or(CodecError::MissingSpsPps)?;
        let data = if is_key {
            nal::keyframe_payload(buffer, config)?
        } else {
            nal::frame_payload(buffer)?
        };

        let ts = rebase(self.video_start.unwrap_or(ts_us), &mut self.video_remainder, ts_us);
        let dts = ts + PARAMETER_SET_OFFSET_MS;
        frames.push(MediaFrame::video(Bytes::copy_from_slice(data), dts, dts));

        Ok(frames)
    }
}

/// Millisecond timestamp on the stream's own clock. The microsecond
/// remainder accumulates across frames; a capture timestamp behind the
/// stream origin clamps to zero rather than going negative.
fn rebase(start: u64, remainder: &mut u64, ts_us: u64) -> i64 {
    let delta = ts_us.saturating_sub(start);
    *remainder += delta % 1000;
    let mut ms = (delta / 1000) as i64;
    if *remainder >= 1000 {
        ms += 1;
        *remainder -= 1000;
    }
    ms
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::FrameKind;
    use assert_matches::assert_matches;

    const SPS: [u8; 4] = [0x67, 0x42, 0xC0, 0x1F];
    const PPS: [u8; 4] = [0x68, 0xCE, 0x38, 0x80];
    const START_CODE: [u8; 4] = [0, 0, 0, 1];

    fn muxer() -> MediaMuxer {
        MediaMuxer::new(Arc::new(OnceCell::new()))
    }

    fn adts_frame(payload: &[u8]) -> Vec<u8> {
        let len = 7 + payload.len();
        let mut frame = vec![
            0xFF,
            0xF1,
            0x4C,
            0x80 | (len >> 11) as u8,
            (len >> 3) as u8,
            ((len & 7) as u8) << 5 | 0x1F,
            0xFC,
        ];
        frame.extend_from_slice(payload);
        frame
    }

    fn keyframe(idr: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        for nal in [&SPS[..], &PPS[..], idr] {
            buf.extend_from_slice(&START_CODE);
            buf.extend_from_slice(nal);
        }
        buf
    }

    fn delta_frame(slice: &[u8]) -> Vec<u8> {
        let mut buf = START_CODE.to_vec();
        buf.extend_from_slice(slice);
        buf
    }

    #[test]
    fn first_audio_frame_derives_config() {
        let cell = Arc::new(OnceCell::new());
        let mut muxer = MediaMuxer::new(cell.clone());

        let frame = muxer.handle_audio(&adts_frame(&[0xDE, 0xAD]), 5_000_000).unwrap();

        assert_eq!(FrameKind::Audio, frame.kind);
        assert_eq!(0, frame.dts);
        assert_eq!(&[0xDE, 0xAD], &frame.payload[..]);

        let config = cell.get().unwrap();
        assert_eq!((2, 3, 2), (config.aot, config.sampling_rate_index, config.channels));
        assert_eq!(48000, config.sampling_rate);
    }

    #[test]
    fn bad_first_audio_frame_does_not_start_the_stream() {
        let mut muxer = muxer();

        let mut bad = adts_frame(&[0]);
        bad[0] = 0x00;
        assert_matches!(
            muxer.handle_audio(&bad, 1_000_000),
            Err(CodecError::BadAdtsSync)
        );

        // The stream origin is still unset, so a good frame starts at zero.
        let frame = muxer.handle_audio(&adts_frame(&[1]), 2_000_000).unwrap();
        assert_eq!(0, frame.dts);
    }

    #[test]
    fn audio_rebase_carries_remainder() {
        let mut muxer = muxer();

        let ts0 = muxer.handle_audio(&adts_frame(&[0]), 1_000_000).unwrap().dts;
        let ts1 = muxer.handle_audio(&adts_frame(&[0]), 1_000_999).unwrap().dts;
        let ts2 = muxer.handle_audio(&adts_frame(&[0]), 1_001_998).unwrap().dts;

        assert_eq!(0, ts0);
        assert_eq!(0, ts1); // 999 us pending
        assert_eq!(2, ts2); // 999 + 998 us pending rounds up
    }

    #[test]
    fn audio_clock_skew_clamps_to_zero() {
        let mut muxer = muxer();

        muxer.handle_audio(&adts_frame(&[0]), 5_000_000).unwrap();
        let late = muxer.handle_audio(&adts_frame(&[0]), 4_900_000).unwrap();

        assert_eq!(0, late.dts);
    }

    #[test]
    fn first_video_frame_emits_parameter_set_pseudo_frames() {
        let mut muxer = muxer();

        let frames = muxer
            .handle_video(&keyframe(&[0x65, 0x88, 0x84]), 7_000_000, true)
            .unwrap();

        assert_eq!(3, frames.len());
        assert_eq!((&SPS[..], 0), (&frames[0].payload[..], frames[0].dts));
        assert_eq!((&PPS[..], 1), (&frames[1].payload[..], frames[1].dts));
        assert_eq!(&[0x65, 0x88, 0x84], &frames[2].payload[..]);
        assert_eq!(2, frames[2].dts);
    }

    #[test]
    fn later_frames_are_offset_past_the_parameter_sets() {
        let mut muxer = muxer();
        muxer
            .handle_video(&keyframe(&[0x65, 0x01]), 7_000_000, true)
            .unwrap();

        let frames = muxer
            .handle_video(&delta_frame(&[0x41, 0x9A]), 7_033_000, false)
            .unwrap();

        assert_eq!(1, frames.len());
        assert_eq!(35, frames[0].dts);
        assert_eq!(&[0x41, 0x9A], &frames[0].payload[..]);
    }

    #[test]
    fn video_before_keyframe_is_rejected() {
        let mut muxer = muxer();

        assert_matches!(
            muxer.handle_video(&delta_frame(&[0x41]), 1_000_000, false),
            Err(CodecError::MissingSpsPps)
        );
    }

    #[test]
    fn later_keyframes_strip_repeated_parameter_sets() {
        let mut muxer = muxer();
        muxer
            .handle_video(&keyframe(&[0x65, 0x01]), 7_000_000, true)
            .unwrap();

        let frames = muxer
            .handle_video(&keyframe(&[0x65, 0x02, 0x03]), 9_000_000, true)
            .unwrap();

        assert_eq!(1, frames.len());
        assert_eq!(&[0x65, 0x02, 0x03], &frames[0].payload[..]);
        assert_eq!(2002, frames[0].dts);
    }
}
