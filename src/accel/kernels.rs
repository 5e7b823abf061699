use rayon::prelude::*;

use super::{LocalMemory, WorkGroup, WORKGROUP_SIZE, tree_reduce};
use crate::math::{fma, rotate_pair, silu};
use crate::tensor::WeightTensor;

/// Sequence positions per flash-attention tile.
const FLASH_TILE: usize = 4;
/// Threads per flash-attention work group.
const FLASH_GROUP_SIZE: usize = 8;

/// Reduction phase of the two-phase RMS norm.
///
/// Each work group tree-reduces the squares of its slice of `x` into
/// `scratch[group + 1]`; the leader then combines every partial block sum,
/// divides by the true element count and stores `1/sqrt(mean + eps)` in
/// `scratch[0]`.
pub(crate) fn rmsnorm_reduce(scratch: &mut [f32], x: &[f32], eps: f32) {
    let size = x.len();
    let num_blocks = size.div_ceil(WORKGROUP_SIZE);
    debug_assert!(scratch.len() > num_blocks);

    for group_id in 0..num_blocks {
        let group = WorkGroup {
            id: group_id,
            size: WORKGROUP_SIZE,
        };
        let mut local = LocalMemory::for_group(&group);
        let mut squares = local.floats(&group, group.size);
        for lid in 0..group.size {
            let gid = group.id * group.size + lid;
            squares[lid] = if gid < size { x[gid] * x[gid] } else { 0.0 };
        }
        tree_reduce(&mut squares);
        scratch[group.id + 1] = squares[0];
    }

    let mut ss = scratch[1..=num_blocks].iter().sum::<f32>();
    ss /= size as f32;
    ss += eps;
    scratch[0] = 1.0 / ss.sqrt();
}

/// Elementwise phase of the two-phase RMS norm: applies the broadcast
/// scale from `scratch[0]`.
pub(crate) fn rmsnorm_apply(out: &mut [f32], x: &[f32], weight: &[f32], scratch: &[f32]) {
    let ss = scratch[0];
    out.par_iter_mut()
        .enumerate()
        .for_each(|(i, out_val)| *out_val = weight[i] * (ss * x[i]));
}

/// In-place member of the elementwise phase.
pub(crate) fn rmsnorm_apply_in_place(x: &mut [f32], weight: &[f32], scratch: &[f32]) {
    let ss = scratch[0];
    x.par_iter_mut()
        .enumerate()
        .for_each(|(i, val)| *val = weight[i] * (ss * *val));
}

/// Matrix-vector product for dense f32 weights, one work group per row.
///
/// The launch grid covers the whole output buffer, which may be padded past
/// the row count; surplus groups exit without touching their slot. With
/// `residual` the row result accumulates onto the previous output value.
pub(crate) fn matvec_wg(
    out: &mut [f32],
    w: &[f32],
    x: &[f32],
    rows: usize,
    cols: usize,
    residual: bool,
) {
    out.par_iter_mut().enumerate().for_each(|(group_id, slot)| {
        if group_id >= rows {
            return;
        }
        let group = WorkGroup {
            id: group_id,
            size: WORKGROUP_SIZE,
        };
        let mut local = LocalMemory::for_group(&group);
        let sum = row_reduce(&group, &mut local, &w[group.id * cols..], x, cols);
        // Leader thread writes the row.
        if residual {
            *slot += sum;
        } else {
            *slot = sum;
        }
    });
}

/// Strided per-thread partial dot products followed by a tree reduction.
fn row_reduce(
    group: &WorkGroup,
    local: &mut LocalMemory,
    w_row: &[f32],
    x: &[f32],
    cols: usize,
) -> f32 {
    let mut partial = local.floats(group, group.size);
    for lid in 0..group.size {
        let mut sum = 0.0f32;
        let mut j = lid;
        while j < cols {
            sum = fma(w_row[j], x[j], sum);
            j += group.size;
        }
        partial[lid] = sum;
    }
    tree_reduce(&mut partial);
    partial[0]
}

/// Matrix-vector product for quantized weights: a flat grid with one thread
/// per output row, each running the block-decoding dot kernel.
pub(crate) fn matvec_rows(out: &mut [f32], w: &WeightTensor, x: &[f32], residual: bool) {
    out.par_iter_mut().enumerate().for_each(|(row, slot)| {
        if row >= w.rows() {
            return;
        }
        let sum = w.dot_row(row, x);
        if residual {
            *slot += sum;
        } else {
            *slot = sum;
        }
    });
}

/// Dispatches between the cooperative f32 kernel and the per-row quantized
/// kernels based on the encoding fixed at load time.
pub(crate) fn matvec_auto(out: &mut [f32], w: &WeightTensor, x: &[f32], residual: bool) {
    match w.dense() {
        Some(dense) => matvec_wg(out, dense, x, w.rows(), w.cols(), residual),
        None => matvec_rows(out, w, x, residual),
    }
}

/// Fused SwiGLU feed-forward kernel for dense f32 gate/up projections: both
/// dots run in the same work group and the leader emits a single scalar per
/// row, skipping the intermediate buffer entirely.
pub(crate) fn fused_swiglu_wg(
    hb: &mut [f32],
    w1: &[f32],
    w3: &[f32],
    x: &[f32],
    rows: usize,
    cols: usize,
) {
    hb.par_iter_mut().enumerate().for_each(|(group_id, slot)| {
        if group_id >= rows {
            return;
        }
        let group = WorkGroup {
            id: group_id,
            size: WORKGROUP_SIZE,
        };
        let mut local = LocalMemory::for_group(&group);
        let gate = row_reduce(&group, &mut local, &w1[group.id * cols..], x, cols);
        let up = row_reduce(&group, &mut local, &w3[group.id * cols..], x, cols);
        *slot = silu(gate) * up;
    });
}

/// Fused SwiGLU for quantized gate/up projections, one thread per row.
pub(crate) fn fused_swiglu_rows(hb: &mut [f32], w1: &WeightTensor, w3: &WeightTensor, x: &[f32]) {
    hb.par_iter_mut().enumerate().for_each(|(row, slot)| {
        if row >= w1.rows() {
            return;
        }
        *slot = silu(w1.dot_row(row, x)) * w3.dot_row(row, x);
    });
}

/// Dispatch for the fused feed-forward gate: cooperative kernel when both
/// projections are dense, per-row kernel otherwise.
pub(crate) fn fused_swiglu_auto(hb: &mut [f32], w1: &WeightTensor, w3: &WeightTensor, x: &[f32]) {
    match (w1.dense(), w3.dense()) {
        (Some(d1), Some(d3)) => fused_swiglu_wg(hb, d1, d3, x, w1.rows(), w1.cols()),
        _ => fused_swiglu_rows(hb, w1, w3, x),
    }
}

/// RoPE kernel: one thread per even index rotates the query pair and,
/// while the index falls inside the key width, the key pair.
pub(crate) fn rope_rotate(q: &mut [f32], k: &mut [f32], pos: usize, head_dim: usize, theta: f32) {
    let kv_len = k.len();
    for i in (0..q.len()).step_by(2) {
        let d = (i % head_dim) as f32;
        let freq = 1.0 / theta.powf(d / head_dim as f32);
        let angle = pos as f32 * freq;
        let cos = angle.cos();
        let sin = angle.sin();
        rotate_pair(q, i, cos, sin);
        if i < kv_len {
            rotate_pair(k, i, cos, sin);
        }
    }
}

/// Tiled flash attention: one work group per head, a single pass over the
/// cached sequence with an online softmax.
#[allow(clippy::too_many_arguments)]
pub(crate) fn flash_attention(
    out: &mut [f32],
    q: &[f32],
    key_cache: &[f32],
    value_cache: &[f32],
    pos: usize,
    n_heads: usize,
    head_dim: usize,
    kv_dim: usize,
    kv_mul: usize,
) {
    out.par_chunks_mut(head_dim)
        .enumerate()
        .for_each(|(head, out_slice)| {
            if head >= n_heads {
                return;
            }
            let group = WorkGroup {
                id: head,
                size: FLASH_GROUP_SIZE,
            };
            let mut local = LocalMemory::for_group(&group);
            flash_attention_head(
                &group,
                &mut local,
                out_slice,
                q,
                key_cache,
                value_cache,
                pos,
                head_dim,
                kv_dim,
                kv_mul,
            );
        });
}

#[allow(clippy::too_many_arguments)]
fn flash_attention_head(
    group: &WorkGroup,
    local: &mut LocalMemory,
    out: &mut [f32],
    q: &[f32],
    key_cache: &[f32],
    value_cache: &[f32],
    pos: usize,
    head_dim: usize,
    kv_dim: usize,
    kv_mul: usize,
) {
    let head = group.id;
    let local_size = group.size;
    let kv_head = head / kv_mul;
    let scale = (head_dim as f32).sqrt();

    let mut q_shared = local.floats(group, head_dim);
    let mut k_tile = local.floats(group, FLASH_TILE * head_dim);
    let mut v_tile = local.floats(group, FLASH_TILE * head_dim);
    let mut s_tile = local.floats(group, FLASH_TILE);
    // Broadcast cell for the tile max; kept separate from the score tile so
    // publishing the max never clobbers a score before it is reread.
    let mut tile_max_cell = local.floats(group, 1);

    // Per-thread registers for the online softmax.
    let mut max_score = vec![f32::NEG_INFINITY; local_size];
    let mut sum_exp = vec![0.0f32; local_size];
    let mut acc = vec![0.0f32; local_size * head_dim];

    // Cooperative strided load of the query vector.
    for lid in 0..local_size {
        let mut i = lid;
        while i < head_dim {
            q_shared[i] = q[head * head_dim + i];
            i += local_size;
        }
    }
    // Barrier: q_shared visible to every thread.

    let mut tile = 0;
    while tile <= pos {
        let tile_end = (tile + FLASH_TILE - 1).min(pos);
        let valid = tile_end - tile + 1;

        // Cooperative load of the K/V rows for this tile.
        for lid in 0..local_size {
            let mut t = tile + lid;
            while t <= tile_end {
                let slot = (t - tile) * head_dim;
                let kv_offset = t * kv_dim + kv_head * head_dim;
                k_tile[slot..slot + head_dim]
                    .copy_from_slice(&key_cache[kv_offset..kv_offset + head_dim]);
                v_tile[slot..slot + head_dim]
                    .copy_from_slice(&value_cache[kv_offset..kv_offset + head_dim]);
                t += local_size;
            }
        }
        // Barrier: tile loads complete.

        // One score per thread.
        for lid in 0..local_size {
            let mut t = tile + lid;
            while t <= tile_end {
                let slot = t - tile;
                let mut score = 0.0f32;
                for d in 0..head_dim {
                    score += q_shared[d] * k_tile[slot * head_dim + d];
                }
                s_tile[slot] = score / scale;
                t += local_size;
            }
        }
        // Barrier: scores visible.

        // Every thread scans the tile; the leader publishes the broadcast
        // value all threads read back after the barrier.
        let mut tile_max = f32::NEG_INFINITY;
        for slot in 0..valid {
            tile_max = tile_max.max(s_tile[slot]);
        }
        tile_max_cell[0] = tile_max;
        // Barrier: broadcast visible.
        let current_tile_max = tile_max_cell[0];

        for lid in 0..local_size {
            let new_max = max_score[lid].max(current_tile_max);
            if new_max > max_score[lid] && max_score[lid] != f32::NEG_INFINITY {
                let rescale = (max_score[lid] - new_max).exp();
                sum_exp[lid] *= rescale;
                for d in 0..head_dim {
                    acc[lid * head_dim + d] *= rescale;
                }
            }
            max_score[lid] = new_max;

            for slot in 0..valid {
                let e = (s_tile[slot] - max_score[lid]).exp();
                sum_exp[lid] += e;
                for d in 0..head_dim {
                    acc[lid * head_dim + d] =
                        fma(e, v_tile[slot * head_dim + d], acc[lid * head_dim + d]);
                }
            }
        }
        // Barrier: tile buffers free for the next iteration.

        tile += FLASH_TILE;
    }

    // Strided final write; every thread normalizes its own dimensions.
    for lid in 0..local_size {
        let norm = if sum_exp[lid] > 0.0 {
            1.0 / sum_exp[lid]
        } else {
            0.0
        };
        let mut d = lid;
        while d < head_dim {
            out[d] = acc[lid * head_dim + d] * norm;
            d += local_size;
        }
    }
}
