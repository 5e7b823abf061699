//! Single-token inference core for LLaMA-family decoder-only transformers.
//!
//! Given a token id and a position, [`Model::forward`] advances a
//! per-session key/value cache by one step and produces unnormalized logits
//! over the vocabulary: an embedding lookup followed by a stack of identical
//! blocks (RMS norm, grouped-query attention with rotary embeddings, SwiGLU
//! feed-forward) and a final projection.
//!
//! Weight matrices may be dense f32 or block-quantized (Q8_0 / Q4_0); the
//! dot-product kernel is fixed per matrix at load time. Each session picks
//! an [`ExecutionPath`]: the plain CPU formulation, or the work-group kernel
//! formulation (tiled flash attention, tree-reduced matmuls, two-phase RMS
//! norm) with staged activation buffers.
//!
//! Model files, tokenizers and sampling strategies are the caller's
//! business: weights arrive through the `{rows, cols, encoding, bytes}`
//! contract of [`WeightTensor::from_raw`], and [`generate`] works on token
//! ids with any [`Sampler`] implementation.

mod accel;
mod attention;
mod configuration;
mod error;
mod generation;
mod math;
mod sampler;
mod state;
mod tensor;
mod transformer;
mod weights;

pub use configuration::{Configuration, ROPE_BASE_FREQ};
pub use error::{InferenceError, Result};
pub use generation::generate;
pub use math::{gelu, rmsnorm, rmsnorm_in_place, silu, RopeTable};
pub use sampler::{ArgmaxSampler, Sampler};
pub use state::{KvCache, State};
pub use tensor::{
    f16_to_f32, matvec, matvec_residual, quantize_q4_0, quantize_q8_0, TensorEncoding,
    WeightTensor, QUANT_BLOCK_SIZE,
};
pub use transformer::{ExecutionPath, Model};
pub use weights::{LayerWeights, ModelWeights};
