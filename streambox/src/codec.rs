pub mod aac;
pub mod nal;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Bad ADTS sync word")]
    BadAdtsSync,

    #[error("Bad ADTS frame length {0}")]
    BadAdtsSize(usize),

    #[error("Bad ADTS sampling rate index {0}")]
    BadSamplingIndex(u8),

    #[error("No SPS/PPS available before slice data")]
    MissingSpsPps,

    #[error("Unexpected NAL unit type {0}")]
    UnexpectedNalType(u8),

    #[error("Frame too short ({0} bytes)")]
    TruncatedFrame(usize),
}
