use crate::error::{InferenceError, Result};

/// Default base frequency for rotary position embeddings.
///
/// Checkpoints trained with a different base must override
/// [`Configuration::rope_theta`]; both the precomputed table and the
/// accelerator kernel derive their angles from the configured value.
pub const ROPE_BASE_FREQ: f32 = 50_000.0;

/// Immutable model geometry, created once from the model file and shared for
/// the lifetime of the process.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Width of the residual stream.
    pub dim: usize,
    /// Width of the feed-forward hidden layer.
    pub hidden_dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    /// Key/value heads for grouped-query attention; `<= n_heads` and must
    /// divide it evenly.
    pub n_kv_heads: usize,
    pub head_dim: usize,
    pub vocab_size: usize,
    /// Maximum number of positions a session may process.
    pub seq_len: usize,
    pub rms_norm_eps: f32,
    pub rope_theta: f32,
    /// Beginning-of-text token id used to seed a fresh session.
    pub bos_token_id: usize,
}

impl Configuration {
    /// Width of the projected key/value vectors.
    pub fn kv_dim(&self) -> usize {
        self.n_kv_heads * self.head_dim
    }

    /// Number of query heads sharing one key/value head.
    pub fn kv_mul(&self) -> usize {
        self.n_heads / self.n_kv_heads
    }

    /// Validates the structural invariants of the configuration.
    pub fn validate(&self) -> Result<()> {
        let dimensions = [
            ("dim", self.dim),
            ("hidden_dim", self.hidden_dim),
            ("n_layers", self.n_layers),
            ("n_heads", self.n_heads),
            ("n_kv_heads", self.n_kv_heads),
            ("head_dim", self.head_dim),
            ("vocab_size", self.vocab_size),
            ("seq_len", self.seq_len),
        ];

        for (name, value) in dimensions {
            if value == 0 {
                return Err(invalid(format!("{name} must be positive")));
            }
        }

        if self.n_kv_heads > self.n_heads {
            return Err(invalid(format!(
                "n_kv_heads ({}) exceeds n_heads ({})",
                self.n_kv_heads, self.n_heads
            )));
        }
        if self.n_heads % self.n_kv_heads != 0 {
            return Err(invalid(format!(
                "n_heads ({}) not divisible by n_kv_heads ({})",
                self.n_heads, self.n_kv_heads
            )));
        }
        if self.dim != self.n_heads * self.head_dim {
            return Err(invalid(format!(
                "dim ({}) must equal n_heads * head_dim ({})",
                self.dim,
                self.n_heads * self.head_dim
            )));
        }
        if self.head_dim % 2 != 0 {
            return Err(invalid(format!(
                "head_dim ({}) must be even for rotary embeddings",
                self.head_dim
            )));
        }
        if !(self.rms_norm_eps > 0.0) {
            return Err(invalid(format!(
                "rms_norm_eps ({}) must be a positive float",
                self.rms_norm_eps
            )));
        }
        if !(self.rope_theta > 0.0) {
            return Err(invalid(format!(
                "rope_theta ({}) must be a positive float",
                self.rope_theta
            )));
        }

        Ok(())
    }
}

fn invalid(reason: String) -> InferenceError {
    InferenceError::ConfigurationInvalid { reason }
}
