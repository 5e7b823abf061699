use thiserror::Error;

/// Errors surfaced by state creation, weight validation and the forward pass.
///
/// Numeric edge cases (softmax underflow, NaN logits) are not represented
/// here: underflow is recovered locally inside the attention kernels and
/// NaN/Inf logits propagate to the sampler.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// The model configuration violates a structural invariant.
    #[error("invalid configuration: {reason}")]
    ConfigurationInvalid { reason: String },

    /// A weight tensor disagrees with the configured model geometry.
    #[error("weight shape mismatch for {name}: {detail}")]
    WeightShapeMismatch { name: String, detail: String },

    /// The requested position does not fit in the context window.
    #[error("position {position} out of range for context length {context_length}")]
    PositionOutOfRange {
        position: usize,
        context_length: usize,
    },

    /// A weight encoding the kernels cannot handle.
    #[error("unsupported quantization for {name}: {detail}")]
    UnsupportedQuantization { name: String, detail: String },
}

/// Convenience alias for inference results.
pub type Result<T> = std::result::Result<T, InferenceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_position_out_of_range() {
        let err = InferenceError::PositionOutOfRange {
            position: 4096,
            context_length: 2048,
        };
        assert_eq!(
            err.to_string(),
            "position 4096 out of range for context length 2048"
        );
    }

    #[test]
    fn error_display_weight_shape_mismatch() {
        let err = InferenceError::WeightShapeMismatch {
            name: "wq[2]".into(),
            detail: "expected 64x64, got 64x32".into(),
        };
        assert!(err.to_string().contains("wq[2]"));
        assert!(err.to_string().contains("64x32"));
    }
}
