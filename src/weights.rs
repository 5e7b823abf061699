use crate::configuration::Configuration;
use crate::error::{InferenceError, Result};
use crate::tensor::WeightTensor;

/// Learned parameters for one transformer block.
///
/// Layers execute strictly in order, so the per-layer weights live in an
/// owned array of structs rather than parallel collections.
#[derive(Debug)]
pub struct LayerWeights {
    /// Attention norm scale, `[dim]`.
    pub rms_att: Vec<f32>,
    /// Query projection, `[dim, dim]`.
    pub wq: WeightTensor,
    /// Key projection, `[kv_dim, dim]`.
    pub wk: WeightTensor,
    /// Value projection, `[kv_dim, dim]`.
    pub wv: WeightTensor,
    /// Attention output projection, `[dim, dim]`.
    pub wo: WeightTensor,
    /// Feed-forward norm scale, `[dim]`.
    pub rms_ffn: Vec<f32>,
    /// SwiGLU gate projection, `[hidden_dim, dim]`.
    pub w1: WeightTensor,
    /// Down projection, `[dim, hidden_dim]`.
    pub w2: WeightTensor,
    /// Up projection, `[hidden_dim, dim]`.
    pub w3: WeightTensor,
}

/// All learned parameters of a model, immutable for a session.
#[derive(Debug)]
pub struct ModelWeights {
    /// Dequantized embedding table, `[vocab_size, dim]`, looked up by row.
    pub token_embedding: Vec<f32>,
    pub layers: Vec<LayerWeights>,
    /// Final norm scale, `[dim]`.
    pub rms_final: Vec<f32>,
    /// Classifier, `[vocab_size, dim]`; may be tied to the embedding table.
    pub wcls: WeightTensor,
}

impl ModelWeights {
    /// Builds a classifier tied to the token embedding table.
    pub fn tied_classifier(
        token_embedding: &[f32],
        vocab_size: usize,
        dim: usize,
    ) -> Result<WeightTensor> {
        WeightTensor::from_f32("wcls", vocab_size, dim, token_embedding.to_vec())
    }

    /// Checks every tensor against the configured geometry. Fatal at load
    /// time; the forward pass assumes shapes are consistent.
    pub fn validate(&self, config: &Configuration) -> Result<()> {
        let dim = config.dim;
        let kv_dim = config.kv_dim();
        let hidden_dim = config.hidden_dim;

        check_len(
            "token_embedding",
            self.token_embedding.len(),
            config.vocab_size * dim,
        )?;
        check_len("rms_final", self.rms_final.len(), dim)?;
        check_shape("wcls", &self.wcls, config.vocab_size, dim)?;

        if self.layers.len() != config.n_layers {
            return Err(InferenceError::WeightShapeMismatch {
                name: "layers".into(),
                detail: format!(
                    "expected {} layers, got {}",
                    config.n_layers,
                    self.layers.len()
                ),
            });
        }

        for (l, layer) in self.layers.iter().enumerate() {
            check_len(&format!("rms_att[{l}]"), layer.rms_att.len(), dim)?;
            check_len(&format!("rms_ffn[{l}]"), layer.rms_ffn.len(), dim)?;
            check_shape(&format!("wq[{l}]"), &layer.wq, dim, dim)?;
            check_shape(&format!("wk[{l}]"), &layer.wk, kv_dim, dim)?;
            check_shape(&format!("wv[{l}]"), &layer.wv, kv_dim, dim)?;
            check_shape(&format!("wo[{l}]"), &layer.wo, dim, dim)?;
            check_shape(&format!("w1[{l}]"), &layer.w1, hidden_dim, dim)?;
            check_shape(&format!("w2[{l}]"), &layer.w2, dim, hidden_dim)?;
            check_shape(&format!("w3[{l}]"), &layer.w3, hidden_dim, dim)?;
        }

        Ok(())
    }
}

fn check_len(name: &str, actual: usize, expected: usize) -> Result<()> {
    if actual != expected {
        return Err(InferenceError::WeightShapeMismatch {
            name: name.into(),
            detail: format!("expected {expected} elements, got {actual}"),
        });
    }
    Ok(())
}

fn check_shape(name: &str, tensor: &WeightTensor, rows: usize, cols: usize) -> Result<()> {
    if tensor.rows() != rows || tensor.cols() != cols {
        return Err(InferenceError::WeightShapeMismatch {
            name: name.into(),
            detail: format!(
                "expected {rows}x{cols}, got {}x{}",
                tensor.rows(),
                tensor.cols()
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::ROPE_BASE_FREQ;

    fn config() -> Configuration {
        Configuration {
            dim: 4,
            hidden_dim: 8,
            n_layers: 1,
            n_heads: 2,
            n_kv_heads: 2,
            head_dim: 2,
            vocab_size: 5,
            seq_len: 4,
            rms_norm_eps: 1e-5,
            rope_theta: ROPE_BASE_FREQ,
            bos_token_id: 0,
        }
    }

    fn zeros(name: &str, rows: usize, cols: usize) -> WeightTensor {
        WeightTensor::from_f32(name, rows, cols, vec![0.0; rows * cols]).unwrap()
    }

    fn weights(config: &Configuration) -> ModelWeights {
        let dim = config.dim;
        let kv_dim = config.kv_dim();
        let hidden = config.hidden_dim;
        let token_embedding = vec![0.0; config.vocab_size * dim];
        let wcls =
            ModelWeights::tied_classifier(&token_embedding, config.vocab_size, dim).unwrap();
        ModelWeights {
            token_embedding,
            layers: vec![LayerWeights {
                rms_att: vec![1.0; dim],
                wq: zeros("wq", dim, dim),
                wk: zeros("wk", kv_dim, dim),
                wv: zeros("wv", kv_dim, dim),
                wo: zeros("wo", dim, dim),
                rms_ffn: vec![1.0; dim],
                w1: zeros("w1", hidden, dim),
                w2: zeros("w2", dim, hidden),
                w3: zeros("w3", hidden, dim),
            }],
            rms_final: vec![1.0; dim],
            wcls,
        }
    }

    #[test]
    fn accepts_consistent_shapes() {
        let config = config();
        assert!(weights(&config).validate(&config).is_ok());
    }

    #[test]
    fn rejects_transposed_projection() {
        let config = config();
        let mut w = weights(&config);
        w.layers[0].w2 = zeros("w2", config.hidden_dim, config.dim);
        let err = w.validate(&config).unwrap_err();
        assert!(err.to_string().contains("w2[0]"));
    }

    #[test]
    fn rejects_wrong_layer_count() {
        let mut config = config();
        let w = weights(&config);
        config.n_layers = 3;
        assert!(w.validate(&config).is_err());
    }
}
