use crate::accel::kernels;
use crate::attention;
use crate::configuration::Configuration;
use crate::error::{InferenceError, Result};
use crate::math::{self, RopeTable};
use crate::state::State;
use crate::tensor::matvec;
use crate::weights::ModelWeights;

/// Where the per-layer kernels execute for a session.
///
/// Chosen at session creation and fixed for the session's lifetime; both
/// paths leave the same observable state behind each layer, modulo
/// floating-point rounding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionPath {
    #[default]
    Cpu,
    /// Work-group kernel formulation with staged activation buffers.
    Accelerator,
}

/// A loaded model: immutable configuration, weights and the precomputed
/// rotary table. Freely shared; per-session mutation lives in [`State`].
pub struct Model {
    pub config: Configuration,
    weights: ModelWeights,
    rope: RopeTable,
}

impl Model {
    pub fn new(config: Configuration, weights: ModelWeights) -> Result<Self> {
        config.validate()?;
        weights.validate(&config)?;
        let rope = RopeTable::new(config.seq_len, config.head_dim, config.rope_theta);
        Ok(Self {
            config,
            weights,
            rope,
        })
    }

    pub fn weights(&self) -> &ModelWeights {
        &self.weights
    }

    /// Allocates a fresh session with all scratch and cache buffers.
    pub fn create_state(&self, path: ExecutionPath) -> Result<State> {
        State::new(&self.config, path)
    }

    /// Advances the session by one token and returns a view of the logits,
    /// valid until the next call.
    pub fn forward<'a>(
        &self,
        state: &'a mut State,
        token: usize,
        position: usize,
    ) -> Result<&'a [f32]> {
        if position >= self.config.seq_len {
            return Err(InferenceError::PositionOutOfRange {
                position,
                context_length: self.config.seq_len,
            });
        }

        // Embedding lookup into the residual stream.
        let dim = self.config.dim;
        state
            .x
            .copy_from_slice(&self.weights.token_embedding[token * dim..(token + 1) * dim]);

        match state.execution_path() {
            ExecutionPath::Cpu => self.forward_cpu(state, position),
            ExecutionPath::Accelerator => self.forward_accel(state, position),
        }

        Ok(&state.logits)
    }

    fn forward_cpu(&self, state: &mut State, pos: usize) {
        let config = &self.config;
        let eps = config.rms_norm_eps;

        for (l, layer) in self.weights.layers.iter().enumerate() {
            // Attention block.
            math::rmsnorm(&mut state.xb, &state.x, &layer.rms_att, eps);
            matvec(&mut state.q, &layer.wq, &state.xb);
            matvec(&mut state.k, &layer.wk, &state.xb);
            matvec(&mut state.v, &layer.wv, &state.xb);

            self.rope.rotate(pos, &mut state.q, &mut state.k);

            let cache = &mut state.caches[l];
            cache.store(pos, &state.k, &state.v);
            attention::attend(
                &state.q,
                &cache.key,
                &cache.value,
                &mut state.att,
                &mut state.xb,
                pos,
                config.n_heads,
                config.head_dim,
                config.kv_mul(),
                config.seq_len,
            );

            matvec(&mut state.xb2, &layer.wo, &state.xb);
            math::add_in_place(&mut state.x, &state.xb2);

            // Feed-forward block.
            math::rmsnorm(&mut state.xb, &state.x, &layer.rms_ffn, eps);
            matvec(&mut state.hb, &layer.w1, &state.xb);
            matvec(&mut state.hb2, &layer.w3, &state.xb);
            state
                .hb
                .iter_mut()
                .zip(state.hb2.iter())
                .for_each(|(gate, &up)| *gate = math::silu(*gate) * up);
            matvec(&mut state.xb, &layer.w2, &state.hb);
            math::add_in_place(&mut state.x, &state.xb);
        }

        math::rmsnorm_in_place(&mut state.x, &self.weights.rms_final, config.rms_norm_eps);
        matvec(&mut state.logits, &self.weights.wcls, &state.x);
    }

    /// Accelerator-offloaded layer loop. The residual stream is staged into
    /// the session's device buffers once, every layer runs against them
    /// (the KV caches are session-resident on that side), and `x` and the
    /// logits are copied back at the end.
    fn forward_accel(&self, state: &mut State, pos: usize) {
        let config = &self.config;
        let eps = config.rms_norm_eps;
        let State {
            x,
            logits,
            caches,
            device: dev,
            ..
        } = state;

        dev.x.copy_from_slice(x);

        for (l, layer) in self.weights.layers.iter().enumerate() {
            kernels::rmsnorm_reduce(&mut dev.norm_scratch, &dev.x, eps);
            kernels::rmsnorm_apply(&mut dev.xb, &dev.x, &layer.rms_att, &dev.norm_scratch);

            kernels::matvec_auto(&mut dev.q, &layer.wq, &dev.xb, false);
            kernels::matvec_auto(&mut dev.k, &layer.wk, &dev.xb, false);
            kernels::matvec_auto(&mut dev.v, &layer.wv, &dev.xb, false);

            kernels::rope_rotate(&mut dev.q, &mut dev.k, pos, config.head_dim, config.rope_theta);

            let cache = &mut caches[l];
            cache.store(pos, &dev.k, &dev.v);
            kernels::flash_attention(
                &mut dev.xb,
                &dev.q,
                &cache.key,
                &cache.value,
                pos,
                config.n_heads,
                config.head_dim,
                config.kv_dim(),
                config.kv_mul(),
            );

            kernels::matvec_auto(&mut dev.x, &layer.wo, &dev.xb, true);

            kernels::rmsnorm_reduce(&mut dev.norm_scratch, &dev.x, eps);
            kernels::rmsnorm_apply(&mut dev.xb, &dev.x, &layer.rms_ffn, &dev.norm_scratch);
            kernels::fused_swiglu_auto(&mut dev.hb, &layer.w1, &layer.w3, &dev.xb);
            kernels::matvec_auto(&mut dev.x, &layer.w2, &dev.hb, true);
        }

        kernels::rmsnorm_reduce(&mut dev.norm_scratch, &dev.x, eps);
        kernels::rmsnorm_apply_in_place(&mut dev.x, &self.weights.rms_final, &dev.norm_scratch);
        kernels::matvec_auto(&mut dev.logits, &self.weights.wcls, &dev.x, false);

        x.copy_from_slice(&dev.x);
        logits.copy_from_slice(&dev.logits);
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("config", &self.config)
            .field("layers", &self.weights.layers.len())
            .finish()
    }
}
