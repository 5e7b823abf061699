use rayon::prelude::*;

use crate::math::{fma, softmax};

/// Reference causal self-attention for one position.
///
/// For every head: scaled dot-product scores against the cached keys
/// `0..=pos`, softmax, then the weighted sum of cached values into the
/// head's slice of `out`. Heads are independent and fan out over the
/// thread pool; each head owns a disjoint score row and output slice.
#[allow(clippy::too_many_arguments)]
pub(crate) fn attend(
    q: &[f32],
    key_cache: &[f32],
    value_cache: &[f32],
    att: &mut [f32],
    out: &mut [f32],
    pos: usize,
    n_heads: usize,
    head_dim: usize,
    kv_mul: usize,
    seq_len: usize,
) {
    let scale = (head_dim as f32).sqrt().recip();
    let kv_dim = n_heads / kv_mul * head_dim;

    att.par_chunks_mut(seq_len)
        .zip(out.par_chunks_mut(head_dim))
        .zip((0..n_heads).into_par_iter())
        .for_each(|((att_row, out_slice), head)| {
            let q_head = &q[head * head_dim..(head + 1) * head_dim];
            let kv_head = head / kv_mul;
            let scores = &mut att_row[..=pos];

            for (t, score) in scores.iter_mut().enumerate() {
                let key_start = t * kv_dim + kv_head * head_dim;
                *score = q_head
                    .iter()
                    .zip(&key_cache[key_start..key_start + head_dim])
                    .map(|(&qv, &kv)| qv * kv)
                    .sum::<f32>()
                    * scale;
            }

            softmax(scores);

            out_slice.fill(0.0);
            for (t, &weight) in scores.iter().enumerate() {
                let value_start = t * kv_dim + kv_head * head_dim;
                out_slice
                    .iter_mut()
                    .zip(&value_cache[value_start..value_start + head_dim])
                    .for_each(|(out_val, &v)| *out_val = fma(weight, v, *out_val));
            }
        });
}
