use crate::accel::WORKGROUP_SIZE;
use crate::configuration::Configuration;
use crate::error::Result;
use crate::transformer::ExecutionPath;

/// Per-layer key/value cache, written once per position and read by every
/// later attention step of the session.
#[derive(Debug)]
pub struct KvCache {
    /// Keys, `[seq_len, kv_dim]` flattened.
    pub key: Vec<f32>,
    /// Values, `[seq_len, kv_dim]` flattened.
    pub value: Vec<f32>,
}

impl KvCache {
    /// Stores the projected key/value vectors into the slot for `pos`.
    pub(crate) fn store(&mut self, pos: usize, k: &[f32], v: &[f32]) {
        let kv_dim = k.len();
        let offset = pos * kv_dim;
        self.key[offset..offset + kv_dim].copy_from_slice(k);
        self.value[offset..offset + kv_dim].copy_from_slice(v);
    }
}

/// Accelerator-visible staging buffers for one session.
///
/// Activations are copied in once per forward step, the whole layer loop
/// runs against these buffers, and the residual stream and logits are
/// copied back at the end.
#[derive(Debug)]
pub(crate) struct DeviceBuffers {
    pub x: Vec<f32>,
    pub xb: Vec<f32>,
    pub q: Vec<f32>,
    pub k: Vec<f32>,
    pub v: Vec<f32>,
    pub hb: Vec<f32>,
    pub logits: Vec<f32>,
    /// Scratch for the two-phase RMS norm: slot 0 holds the combined scale,
    /// slots `1..=num_blocks` the per-group partial sums.
    pub norm_scratch: Vec<f32>,
}

impl DeviceBuffers {
    fn none() -> Self {
        Self {
            x: Vec::new(),
            xb: Vec::new(),
            q: Vec::new(),
            k: Vec::new(),
            v: Vec::new(),
            hb: Vec::new(),
            logits: Vec::new(),
            norm_scratch: Vec::new(),
        }
    }

    fn sized(config: &Configuration) -> Self {
        Self {
            x: vec![0.0; config.dim],
            xb: vec![0.0; config.dim],
            q: vec![0.0; config.dim],
            k: vec![0.0; config.kv_dim()],
            v: vec![0.0; config.kv_dim()],
            hb: vec![0.0; config.hidden_dim],
            logits: vec![0.0; config.vocab_size],
            norm_scratch: vec![0.0; config.dim.div_ceil(WORKGROUP_SIZE) + 1],
        }
    }
}

/// Mutable per-session state. Owned by exactly one caller; a session holds
/// the whole sequence history in its KV caches and is discarded at the end.
///
/// Buffers are pre-allocated once so the forward pass never allocates.
#[derive(Debug)]
pub struct State {
    /// Residual stream, `[dim]`.
    pub x: Vec<f32>,
    /// Activation scratch, `[dim]`.
    pub xb: Vec<f32>,
    /// Secondary activation scratch, `[dim]`.
    pub xb2: Vec<f32>,
    /// Feed-forward scratch, `[hidden_dim]`.
    pub hb: Vec<f32>,
    pub hb2: Vec<f32>,
    /// Per-step projections.
    pub q: Vec<f32>,
    pub k: Vec<f32>,
    pub v: Vec<f32>,
    /// Attention score scratch, `[n_heads, seq_len]` flattened.
    pub att: Vec<f32>,
    /// Output logits, `[vocab_size]`.
    pub logits: Vec<f32>,
    /// One cache per layer.
    pub caches: Vec<KvCache>,
    /// Last token fed to or produced by the session; seeded with the
    /// beginning-of-text id.
    pub latest_token: usize,
    pub(crate) path: ExecutionPath,
    pub(crate) device: DeviceBuffers,
}

impl State {
    pub(crate) fn new(config: &Configuration, path: ExecutionPath) -> Result<Self> {
        config.validate()?;

        let kv_dim = config.kv_dim();
        let caches = (0..config.n_layers)
            .map(|_| KvCache {
                key: vec![0.0; config.seq_len * kv_dim],
                value: vec![0.0; config.seq_len * kv_dim],
            })
            .collect();

        let device = match path {
            ExecutionPath::Cpu => DeviceBuffers::none(),
            ExecutionPath::Accelerator => DeviceBuffers::sized(config),
        };

        Ok(Self {
            x: vec![0.0; config.dim],
            xb: vec![0.0; config.dim],
            xb2: vec![0.0; config.dim],
            hb: vec![0.0; config.hidden_dim],
            hb2: vec![0.0; config.hidden_dim],
            q: vec![0.0; config.dim],
            k: vec![0.0; kv_dim],
            v: vec![0.0; kv_dim],
            att: vec![0.0; config.n_heads * config.seq_len],
            logits: vec![0.0; config.vocab_size],
            caches,
            latest_token: config.bos_token_id,
            path,
            device,
        })
    }

    pub fn execution_path(&self) -> ExecutionPath {
        self.path
    }
}
