use bytes::{BufMut, Bytes, BytesMut};
use h264_reader::nal::{NalHeader, UnitType};

use crate::{codec::CodecError, VideoConfig};

pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// How far into a keyframe prelude the SPS/PPS start codes are searched for.
const PRELUDE_SCAN_LIMIT: usize = 40;

pub fn unit_type(nal: &[u8]) -> Option<UnitType> {
    NalHeader::new(*nal.first()?).map(|h| h.nal_unit_type()).ok()
}

/// Splits the first keyframe's `[SC|SPS][SC|PPS][SC|IDR]` prelude into the
/// session's parameter sets, with the start codes stripped.
///
/// The capture source emits both parameter sets within the first few dozen
/// bytes, so the scan is bounded rather than walking the whole frame.
pub fn split_prelude(buffer: &[u8]) -> Result<VideoConfig, CodecError> {
    let mut sps_end = None;
    let mut pps_end = None;

    for i in 4..PRELUDE_SCAN_LIMIT.min(buffer.len()) {
        if buffer.len() < i + 4 || buffer[i..i + 4] != START_CODE {
            continue;
        }

        if sps_end.is_none() {
            sps_end = Some(i);
        } else {
            pps_end = Some(i);
            break;
        }
    }

    let (sps_end, pps_end) = match (sps_end, pps_end) {
        (Some(s), Some(p)) => (s, p),
        _ => return Err(CodecError::MissingSpsPps),
    };

    let sps = &buffer[START_CODE.len()..sps_end];
    let pps = &buffer[sps_end + START_CODE.len()..pps_end];

    expect_unit_type(sps, UnitType::SeqParameterSet)?;
    expect_unit_type(pps, UnitType::PicParameterSet)?;

    Ok(VideoConfig {
        sps: Bytes::copy_from_slice(sps),
        pps: Bytes::copy_from_slice(pps),
    })
}

fn expect_unit_type(nal: &[u8], expected: UnitType) -> Result<(), CodecError> {
    match unit_type(nal) {
        Some(t) if t == expected => Ok(()),
        _ => Err(CodecError::UnexpectedNalType(
            nal.first().map(|b| b & 0x1F).unwrap_or(0),
        )),
    }
}

/// Strips the `3x(00 00 00 01)` start codes plus the repeated SPS and PPS
/// from a keyframe buffer, leaving the bare IDR NALU.
pub fn keyframe_payload<'a>(
    buffer: &'a [u8],
    config: &VideoConfig,
) -> Result<&'a [u8], CodecError> {
    let prefix = 3 * START_CODE.len() + config.sps.len() + config.pps.len();
    if buffer.len() <= prefix {
        return Err(CodecError::TruncatedFrame(buffer.len()));
    }

    Ok(&buffer[prefix..])
}

/// Strips the leading 4-byte start code from a non-keyframe buffer.
pub fn frame_payload(buffer: &[u8]) -> Result<&[u8], CodecError> {
    if buffer.len() <= START_CODE.len() {
        return Err(CodecError::TruncatedFrame(buffer.len()));
    }

    Ok(&buffer[START_CODE.len()..])
}

/// Frames a bare NALU with the 4-byte big-endian length prefix used inside
/// RTMP video payloads.
pub fn length_prefixed(nal: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(4 + nal.len());
    out.put_u32(nal.len() as u32);
    out.put_slice(nal);
    out.freeze()
}

/// Builds the AVCDecoderConfigurationRecord for the video sequence header.
///
/// Profile, compatibility and level bytes are taken from the SPS per the
/// record layout; `lengthSizeMinusOne` is fixed at 3 to match the 4-byte
/// NALU length framing.
pub fn decoder_configuration_record(config: &VideoConfig) -> Result<Bytes, CodecError> {
    let (sps, pps) = (&config.sps, &config.pps);
    if sps.len() < 4 {
        return Err(CodecError::TruncatedFrame(sps.len()));
    }

    let mut out = BytesMut::with_capacity(11 + sps.len() + pps.len());
    out.put_u8(1); // configurationVersion
    out.put_u8(sps[1]); // AVCProfileIndication
    out.put_u8(sps[2]); // profile_compatibility
    out.put_u8(sps[3]); // AVCLevelIndication
    out.put_u8(0xFF); // reserved | lengthSizeMinusOne = 3
    out.put_u8(0xE1); // reserved | numOfSequenceParameterSets = 1
    out.put_u16(sps.len() as u16);
    out.put_slice(sps);
    out.put_u8(1); // numOfPictureParameterSets
    out.put_u16(pps.len() as u16);
    out.put_slice(pps);

    Ok(out.freeze())
}

/// Parses a configuration record back into its first SPS and PPS.
pub fn parse_decoder_configuration_record(data: &[u8]) -> Result<VideoConfig, CodecError> {
    if data.len() < 8 || data[0] != 1 {
        return Err(CodecError::TruncatedFrame(data.len()));
    }

    let sps_len = u16::from_be_bytes([data[6], data[7]]) as usize;
    let sps_end = 8 + sps_len;
    if data.len() < sps_end + 3 {
        return Err(CodecError::TruncatedFrame(data.len()));
    }
    let sps = &data[8..sps_end];

    let pps_len = u16::from_be_bytes([data[sps_end + 1], data[sps_end + 2]]) as usize;
    let pps_start = sps_end + 3;
    if data.len() < pps_start + pps_len {
        return Err(CodecError::TruncatedFrame(data.len()));
    }
    let pps = &data[pps_start..pps_start + pps_len];

    Ok(VideoConfig {
        sps: Bytes::copy_from_slice(sps),
        pps: Bytes::copy_from_slice(pps),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    const SPS: [u8; 4] = [0x67, 0x42, 0xC0, 0x1F];
    const PPS: [u8; 4] = [0x68, 0xCE, 0x38, 0x80];

    fn keyframe() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&START_CODE);
        buf.extend_from_slice(&SPS);
        buf.extend_from_slice(&START_CODE);
        buf.extend_from_slice(&PPS);
        buf.extend_from_slice(&START_CODE);
        buf.extend_from_slice(&[0x65, 0x88, 0x84, 0x21]);
        buf
    }

    #[test]
    fn splits_prelude() {
        let config = split_prelude(&keyframe()).unwrap();

        assert_eq!(&SPS[..], &config.sps[..]);
        assert_eq!(&PPS[..], &config.pps[..]);
    }

    #[test]
    fn prelude_without_parameter_sets() {
        let buffer = [0u8; 48];
        assert_matches!(split_prelude(&buffer), Err(CodecError::MissingSpsPps));
    }

    #[test]
    fn prelude_with_swapped_sets() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&START_CODE);
        buf.extend_from_slice(&PPS);
        buf.extend_from_slice(&START_CODE);
        buf.extend_from_slice(&SPS);
        buf.extend_from_slice(&START_CODE);
        buf.extend_from_slice(&[0x65]);

        assert_matches!(split_prelude(&buf), Err(CodecError::UnexpectedNalType(8)));
    }

    #[test]
    fn strips_keyframe_prefix() {
        let buf = keyframe();
        let config = split_prelude(&buf).unwrap();

        assert_eq!(
            &[0x65, 0x88, 0x84, 0x21],
            keyframe_payload(&buf, &config).unwrap()
        );
    }

    #[test]
    fn strips_frame_prefix() {
        let mut buf = START_CODE.to_vec();
        buf.extend_from_slice(&[0x41, 0x9A, 0x02]);

        assert_eq!(&[0x41, 0x9A, 0x02], frame_payload(&buf).unwrap());
    }

    #[test]
    fn length_prefix() {
        let framed = length_prefixed(&[0x65, 0x88]);
        assert_eq!(&[0, 0, 0, 2, 0x65, 0x88], &framed[..]);
    }

    #[test]
    fn configuration_record_layout() {
        let config = VideoConfig {
            sps: Bytes::copy_from_slice(&SPS),
            pps: Bytes::copy_from_slice(&PPS),
        };

        let record = decoder_configuration_record(&config).unwrap();

        let expected = [
            1, 0x42, 0xC0, 0x1F, // version, profile, compat, level
            0xFF, 0xE1, // length size 4, one SPS
            0, 4, 0x67, 0x42, 0xC0, 0x1F, // SPS
            1, 0, 4, 0x68, 0xCE, 0x38, 0x80, // one PPS
        ];
        assert_eq!(&expected[..], &record[..]);
    }

    #[test]
    fn configuration_record_round_trip() {
        let config = VideoConfig {
            sps: Bytes::copy_from_slice(&SPS),
            pps: Bytes::copy_from_slice(&PPS),
        };

        let record = decoder_configuration_record(&config).unwrap();
        let parsed = parse_decoder_configuration_record(&record).unwrap();

        assert_eq!(&config.sps[..], &parsed.sps[..]);
        assert_eq!(&config.pps[..], &parsed.pps[..]);
    }
}
