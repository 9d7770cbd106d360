use crate::{codec::CodecError, AudioConfig};

pub const ADTS_HEADER_LEN: usize = 7;

/// MPEG-4 sampling frequency table, indexed by the 4-bit frequency index.
const SAMPLING_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// Fields of a fixed+variable ADTS header, extracted from the first 7 bytes
/// of an AAC frame.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AdtsHeader {
    pub aot: u8,
    pub sampling_rate_index: u8,
    pub sampling_rate: u32,
    pub channels: u8,
    pub frame_length: usize,
}

impl AdtsHeader {
    pub fn parse(frame: &[u8]) -> Result<AdtsHeader, CodecError> {
        if frame.len() < ADTS_HEADER_LEN {
            return Err(CodecError::TruncatedFrame(frame.len()));
        }

        if frame[0] != 0xFF || frame[1] & 0xF0 != 0xF0 {
            return Err(CodecError::BadAdtsSync);
        }

        let aot = ((frame[2] >> 6) & 0x03) + 1;
        let sampling_rate_index = (frame[2] >> 2) & 0x0F;
        let channels = ((frame[2] & 0x01) << 2) | ((frame[3] >> 6) & 0x03);
        let frame_length = ((frame[3] & 0x03) as usize) << 11
            | (frame[4] as usize) << 3
            | ((frame[5] >> 5) & 0x07) as usize;

        if frame_length < ADTS_HEADER_LEN {
            return Err(CodecError::BadAdtsSize(frame_length));
        }

        let sampling_rate = *SAMPLING_RATES
            .get(sampling_rate_index as usize)
            .ok_or(CodecError::BadSamplingIndex(sampling_rate_index))?;

        Ok(AdtsHeader {
            aot,
            sampling_rate_index,
            sampling_rate,
            channels,
            frame_length,
        })
    }

    /// The session-scoped audio configuration this header describes. The
    /// capture source delivers 16-bit samples, so `sample_size` is fixed at
    /// 2 bytes.
    pub fn config(&self) -> AudioConfig {
        AudioConfig {
            aot: self.aot,
            sampling_rate_index: self.sampling_rate_index,
            sampling_rate: self.sampling_rate,
            channels: self.channels,
            sample_size: 2,
        }
    }
}

/// Returns the raw AAC access unit with the 7-byte ADTS header removed.
pub fn strip_header(frame: &[u8]) -> Result<&[u8], CodecError> {
    if frame.len() < ADTS_HEADER_LEN {
        return Err(CodecError::TruncatedFrame(frame.len()));
    }

    Ok(&frame[ADTS_HEADER_LEN..])
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;

    // 48 kHz stereo AAC-LC, frame_length = 255
    const HEADER: [u8; 7] = [0xFF, 0xF1, 0x4C, 0x80, 0x1F, 0xE0, 0xFC];

    #[test]
    fn parse_adts() {
        let header = AdtsHeader::parse(&HEADER).unwrap();

        assert_eq!(2, header.aot);
        assert_eq!(3, header.sampling_rate_index);
        assert_eq!(48000, header.sampling_rate);
        assert_eq!(2, header.channels);
        assert_eq!(255, header.frame_length);

        let config = header.config();
        assert_eq!([0x11, 0x90], config.specific_config());
        assert_eq!("48 kHz", config.sampling_rate_display());
        assert_eq!("stereo", config.channel_display());
    }

    #[test]
    fn bad_sync() {
        let mut header = HEADER;
        header[0] = 0xFE;
        assert_matches!(AdtsHeader::parse(&header), Err(CodecError::BadAdtsSync));

        header = HEADER;
        header[1] = 0x0F;
        assert_matches!(AdtsHeader::parse(&header), Err(CodecError::BadAdtsSync));
    }

    #[test]
    fn bad_frame_length() {
        // frame_length bits all zero
        let header = [0xFF, 0xF1, 0x4C, 0x80, 0x00, 0x00, 0xFC];
        assert_matches!(AdtsHeader::parse(&header), Err(CodecError::BadAdtsSize(0)));
    }

    #[test]
    fn bad_sampling_index() {
        // frequency index 13 is reserved
        let header = [0xFF, 0xF1, 0x74, 0x80, 0x1F, 0xE0, 0xFC];
        assert_matches!(
            AdtsHeader::parse(&header),
            Err(CodecError::BadSamplingIndex(13))
        );
    }

    #[test]
    fn truncated() {
        assert_matches!(
            AdtsHeader::parse(&HEADER[..5]),
            Err(CodecError::TruncatedFrame(5))
        );
    }

    #[test]
    fn strips_header() {
        let mut frame = HEADER.to_vec();
        frame.extend_from_slice(&[1, 2, 3]);

        assert_eq!(&[1, 2, 3], strip_header(&frame).unwrap());
    }
}
