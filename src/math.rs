//! Scalar numeric primitives shared by the CPU and work-group kernel paths.

/// Fused multiply-add: `a * b + c`.
#[inline(always)]
pub(crate) fn fma(a: f32, b: f32, c: f32) -> f32 {
    a.mul_add(b, c)
}

/// RMS normalization: `out[i] = weight[i] * x[i] / sqrt(mean(x^2) + eps)`.
pub fn rmsnorm(out: &mut [f32], x: &[f32], weight: &[f32], eps: f32) {
    debug_assert_eq!(out.len(), x.len());
    debug_assert_eq!(x.len(), weight.len());

    let scale = rms_scale(x, eps);
    out.iter_mut()
        .zip(x.iter())
        .zip(weight.iter())
        .for_each(|((out_val, &inp), &w)| {
            *out_val = w * (scale * inp);
        });
}

/// In-place member of the RMS-norm pair, for call sites where the output
/// buffer is the input buffer.
pub fn rmsnorm_in_place(x: &mut [f32], weight: &[f32], eps: f32) {
    debug_assert_eq!(x.len(), weight.len());

    let scale = rms_scale(x, eps);
    x.iter_mut().zip(weight.iter()).for_each(|(val, &w)| {
        *val = w * (scale * *val);
    });
}

#[inline]
fn rms_scale(x: &[f32], eps: f32) -> f32 {
    let sum_of_squares = x.iter().map(|&v| v * v).sum::<f32>();
    1.0f32 / ((sum_of_squares / x.len() as f32) + eps).sqrt()
}

/// In-place softmax with max subtraction.
///
/// A non-positive exponent sum degrades to uniform weights instead of
/// propagating the underflow.
pub(crate) fn softmax(x: &mut [f32]) {
    let max_val = x.iter().fold(f32::NEG_INFINITY, |acc, &val| acc.max(val));
    let sum = x
        .iter_mut()
        .map(|val| {
            *val = (*val - max_val).exp();
            *val
        })
        .sum::<f32>();
    if sum > 0.0 {
        let inv_sum = sum.recip();
        x.iter_mut().for_each(|val| *val *= inv_sum);
    } else {
        x.fill((x.len() as f32).recip());
    }
}

/// Sigmoid-weighted linear unit: `z * sigmoid(z)`.
#[inline]
pub fn silu(z: f32) -> f32 {
    z * (1.0f32 + (-z).exp()).recip()
}

/// Tanh-approximated GELU. Not used by the default feed-forward path.
#[inline]
pub fn gelu(z: f32) -> f32 {
    let z3 = z * z * z;
    0.5 * z * (1.0 + (0.797_885f32 * (z + 0.044_715 * z3)).tanh())
}

pub(crate) fn add_in_place(x: &mut [f32], delta: &[f32]) {
    x.iter_mut()
        .zip(delta.iter())
        .for_each(|(x_val, &d)| *x_val += d);
}

/// Precomputed `(cos, sin)` rotation table for rotary position embeddings,
/// indexed by `(position, pair)`.
#[derive(Debug)]
pub struct RopeTable {
    head_dim: usize,
    cos_sin: Vec<(f32, f32)>,
}

impl RopeTable {
    pub fn new(seq_len: usize, head_dim: usize, theta: f32) -> Self {
        debug_assert_eq!(head_dim % 2, 0);
        let pairs = head_dim / 2;
        let mut cos_sin = Vec::with_capacity(seq_len * pairs);
        for pos in 0..seq_len {
            for pair in 0..pairs {
                // Same expression as the fused kernel so both paths agree.
                let freq = 1.0 / theta.powf((2 * pair) as f32 / head_dim as f32);
                let angle = pos as f32 * freq;
                cos_sin.push((angle.cos(), angle.sin()));
            }
        }
        Self { head_dim, cos_sin }
    }

    /// Rotates adjacent pairs of `q` (full width) and `k` (while the pair
    /// index falls inside the key/value width) in place.
    pub fn rotate(&self, pos: usize, q: &mut [f32], k: &mut [f32]) {
        let pairs = self.head_dim / 2;
        let row = &self.cos_sin[pos * pairs..(pos + 1) * pairs];
        let kv_len = k.len();
        for i in (0..q.len()).step_by(2) {
            let (cos, sin) = row[(i % self.head_dim) / 2];
            rotate_pair(q, i, cos, sin);
            if i < kv_len {
                rotate_pair(k, i, cos, sin);
            }
        }
    }
}

#[inline]
pub(crate) fn rotate_pair(v: &mut [f32], i: usize, cos: f32, sin: f32) {
    let v0 = v[i];
    let v1 = v[i + 1];
    v[i] = v0 * cos - v1 * sin;
    v[i + 1] = v0 * sin + v1 * cos;
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const EPS: f32 = 1e-5;

    #[test]
    fn rmsnorm_unit_weight_sum_of_squares() {
        let x: Vec<f32> = (0..64).map(|i| (i as f32 * 0.37).sin() * 2.0).collect();
        let weight = vec![1.0f32; x.len()];
        let mut out = vec![0.0f32; x.len()];
        rmsnorm(&mut out, &x, &weight, EPS);

        let sum_x2: f32 = x.iter().map(|&v| v * v).sum();
        let sum_out2: f32 = out.iter().map(|&v| v * v).sum();
        let expected = x.len() as f32 / (1.0 + EPS * x.len() as f32 / sum_x2);
        assert!(
            (sum_out2 - expected).abs() <= 1e-3 * expected,
            "{sum_out2} vs {expected}"
        );
    }

    #[test]
    fn rmsnorm_zero_input_is_zero() {
        let x = vec![0.0f32; 16];
        let weight = vec![1.5f32; 16];
        let mut out = vec![7.0f32; 16];
        rmsnorm(&mut out, &x, &weight, EPS);
        assert!(out.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn rmsnorm_pair_agrees_in_place() {
        let x: Vec<f32> = (0..32).map(|i| (i as f32 - 15.0) * 0.1).collect();
        let weight: Vec<f32> = (0..32).map(|i| 0.5 + i as f32 * 0.01).collect();

        let mut out = vec![0.0f32; 32];
        rmsnorm(&mut out, &x, &weight, EPS);

        let mut in_place = x.clone();
        rmsnorm_in_place(&mut in_place, &weight, EPS);

        assert_eq!(out, in_place);
    }

    #[test]
    fn softmax_sums_to_one() {
        let mut x = vec![0.5f32, -1.0, 3.0, 0.0];
        softmax(&mut x);
        let sum: f32 = x.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(x.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn softmax_underflow_falls_back_to_uniform() {
        let mut x = vec![f32::NEG_INFINITY; 4];
        softmax(&mut x);
        assert_eq!(x, vec![0.25; 4]);
    }

    #[test]
    fn silu_known_values() {
        assert_eq!(silu(0.0), 0.0);
        assert!((silu(1.0) - 0.731_058_6).abs() < 1e-5);
        assert!((silu(-1.0) + 0.268_941_4).abs() < 1e-5);
    }

    #[test]
    fn gelu_known_values() {
        assert_eq!(gelu(0.0), 0.0);
        assert!((gelu(1.0) - 0.841_192).abs() < 1e-4);
    }

    #[test]
    fn rope_inverse_rotation_restores_input() {
        let head_dim = 8;
        let table = RopeTable::new(64, head_dim, 50_000.0);
        let original: Vec<f32> = (0..16).map(|i| (i as f32 * 0.71).cos()).collect();

        let pos = 13;
        let mut q = original.clone();
        let mut k = original[..head_dim].to_vec();
        table.rotate(pos, &mut q, &mut k);

        // Undo with the conjugate rotation from the same table row.
        let pairs = head_dim / 2;
        let row = &table.cos_sin[pos * pairs..(pos + 1) * pairs];
        for i in (0..q.len()).step_by(2) {
            let (cos, sin) = row[(i % head_dim) / 2];
            rotate_pair(&mut q, i, cos, -sin);
        }
        for (orig, got) in original.iter().zip(&q) {
            assert!((orig - got).abs() < 1e-5);
        }
    }

    #[test]
    fn rope_leaves_keys_beyond_kv_width_untouched() {
        let head_dim = 4;
        let table = RopeTable::new(8, head_dim, 50_000.0);
        let mut q = vec![1.0f32; 8];
        let mut k = vec![1.0f32; 4];
        let k_before = k.clone();
        table.rotate(3, &mut q, &mut k);
        assert_ne!(k, k_before);

        // Pairs at q indices >= k.len() must not touch k at all.
        let mut k_short = vec![2.0f32; 4];
        let snapshot = k_short.clone();
        let mut q_tail = vec![1.0f32; 8];
        table.rotate(0, &mut q_tail, &mut k_short);
        // Position 0 rotates by angle 0, so even the touched pairs are identity.
        assert_eq!(k_short, snapshot);
    }

    proptest! {
        #[test]
        fn rope_preserves_norm(values in prop::collection::vec(-2.0f32..2.0, 16), pos in 0usize..64) {
            let head_dim = 8;
            let table = RopeTable::new(64, head_dim, 50_000.0);
            let mut q = values.clone();
            let mut k = values[..head_dim].to_vec();
            table.rotate(pos, &mut q, &mut k);

            for head in 0..2 {
                let before: f32 = values[head * head_dim..(head + 1) * head_dim]
                    .iter()
                    .map(|&v| v * v)
                    .sum::<f32>()
                    .sqrt();
                let after: f32 = q[head * head_dim..(head + 1) * head_dim]
                    .iter()
                    .map(|&v| v * v)
                    .sum::<f32>()
                    .sqrt();
                prop_assert!((before - after).abs() <= 1e-3 * before.max(1.0));
            }
        }
    }
}
