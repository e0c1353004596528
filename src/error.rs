use burn::config::ConfigError;
use burn::record::RecorderError;
use thiserror::Error;

use crate::loss::OptimizerPhase;

#[derive(Debug, Error)]
pub enum VqError {
    /// Encoder output (after projection) does not match the quantizer input.
    #[error("channel mismatch: quantizer expects {expected} channels, got {got}")]
    ChannelMismatch { expected: usize, got: usize },

    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("token sequence of length {0} cannot be reshaped into a square grid")]
    NonSquareTokens(usize),

    #[error("unsupported quantizer variant `{0}`")]
    UnsupportedVariant(String),

    #[error("cannot quantize an empty batch")]
    EmptyBatch,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("code index {index} is outside the codebook of {num_codes} entries")]
    CodeOutOfRange { index: i64, num_codes: usize },

    #[error("{0} quantizer does not support decoding from code indices")]
    UnsupportedOperation(&'static str),

    #[error("optimizer phase {got:?} requested, expected {expected:?}")]
    PhaseOrder {
        expected: Option<OptimizerPhase>,
        got: OptimizerPhase,
    },

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("record error: {0}")]
    Record(#[from] RecorderError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = VqError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_defaults_to_vq_error_and_takes_another() {
        let failed: Result<()> = Err(VqError::EmptyBatch);
        assert!(matches!(failed, Err(VqError::EmptyBatch)));

        let parsed: Result<u8, std::num::ParseIntError> = "7".parse();
        assert_eq!(parsed.unwrap(), 7);
    }
}
