use byteorder::{ByteOrder, LittleEndian};
use half::f16;
use rayon::prelude::*;

use crate::error::{InferenceError, Result};
use crate::math::fma;

/// Number of consecutive row elements sharing one half-precision scale.
pub const QUANT_BLOCK_SIZE: usize = 32;

/// Q8_0 block: little-endian f16 scale followed by 32 signed 8-bit codes.
const Q8_BLOCK_BYTES: usize = 2 + QUANT_BLOCK_SIZE;
/// Q4_0 block: little-endian f16 scale followed by 16 bytes of packed
/// 4-bit codes (low nibble of byte `b` is element `b`, high nibble is
/// element `b + 16`, each code offset by -8).
const Q4_BLOCK_BYTES: usize = 2 + QUANT_BLOCK_SIZE / 2;

const UNROLL: usize = 16;
const LANES: usize = 4;

/// Decodes an IEEE 754 binary16 bit pattern to f32.
///
/// Subnormal magnitudes are `frac * 2^-24`; signed zeros, infinities and
/// NaN follow the standard.
pub fn f16_to_f32(bits: u16) -> f32 {
    let sign = bits >> 15;
    let exp = (bits >> 10) & 0x1F;
    let frac = bits & 0x03FF;

    if exp == 0x1F {
        if frac != 0 {
            return f32::NAN;
        }
        return if sign == 0 {
            f32::INFINITY
        } else {
            f32::NEG_INFINITY
        };
    }

    let magnitude = if exp == 0 {
        // Subnormal: frac * 2^-24, exact in f32.
        frac as f32 * 5.960_464_5e-8
    } else {
        let mantissa = 1.0 + frac as f32 / 1024.0;
        if exp < 15 {
            mantissa / (1u32 << (15 - exp)) as f32
        } else {
            mantissa * (1u32 << (exp - 15)) as f32
        }
    };

    if sign == 0 { magnitude } else { -magnitude }
}

/// Storage encoding of a weight matrix. The kernel is selected per matrix
/// once at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorEncoding {
    F32,
    Q8_0,
    Q4_0,
}

impl TensorEncoding {
    /// Resolves the numeric tag used by the loader contract.
    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(TensorEncoding::F32),
            2 => Ok(TensorEncoding::Q4_0),
            8 => Ok(TensorEncoding::Q8_0),
            other => Err(InferenceError::UnsupportedQuantization {
                name: "tensor".into(),
                detail: format!("unknown encoding tag {other}"),
            }),
        }
    }

    /// Bytes occupied by a single row of `cols` elements.
    ///
    /// Every row starts at a block boundary; a trailing partial block is
    /// stored at full block width with padding codes.
    pub fn row_bytes(self, cols: usize) -> usize {
        match self {
            TensorEncoding::F32 => cols * std::mem::size_of::<f32>(),
            TensorEncoding::Q8_0 => cols.div_ceil(QUANT_BLOCK_SIZE) * Q8_BLOCK_BYTES,
            TensorEncoding::Q4_0 => cols.div_ceil(QUANT_BLOCK_SIZE) * Q4_BLOCK_BYTES,
        }
    }
}

#[derive(Debug, Clone)]
enum TensorData {
    F32(Vec<f32>),
    Q8_0(Vec<u8>),
    Q4_0(Vec<u8>),
}

/// A row-major weight matrix with its encoding fixed at load time.
///
/// The dot-product kernel is dispatched on the stored variant, so the layer
/// driver never branches on the encoding itself.
#[derive(Debug, Clone)]
pub struct WeightTensor {
    rows: usize,
    cols: usize,
    data: TensorData,
}

impl WeightTensor {
    /// Wraps an owned dense f32 matrix.
    pub fn from_f32(name: &str, rows: usize, cols: usize, values: Vec<f32>) -> Result<Self> {
        if values.len() != rows * cols {
            return Err(shape_mismatch(
                name,
                format!("expected {} f32 values, got {}", rows * cols, values.len()),
            ));
        }
        Ok(Self {
            rows,
            cols,
            data: TensorData::F32(values),
        })
    }

    /// Accepts a matrix from the loader contract: `{rows, cols, encoding,
    /// bytes}`. The byte length must match the encoding exactly.
    pub fn from_raw(
        name: &str,
        rows: usize,
        cols: usize,
        encoding: TensorEncoding,
        bytes: &[u8],
    ) -> Result<Self> {
        let expected = rows * encoding.row_bytes(cols);
        if bytes.len() != expected {
            return Err(shape_mismatch(
                name,
                format!(
                    "expected {expected} bytes for {rows}x{cols} {encoding:?}, got {}",
                    bytes.len()
                ),
            ));
        }

        let data = match encoding {
            TensorEncoding::F32 => {
                let mut values = vec![0.0f32; rows * cols];
                LittleEndian::read_f32_into(bytes, &mut values);
                TensorData::F32(values)
            }
            TensorEncoding::Q8_0 => TensorData::Q8_0(bytes.to_vec()),
            TensorEncoding::Q4_0 => TensorData::Q4_0(bytes.to_vec()),
        };

        Ok(Self { rows, cols, data })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn encoding(&self) -> TensorEncoding {
        match self.data {
            TensorData::F32(_) => TensorEncoding::F32,
            TensorData::Q8_0(_) => TensorEncoding::Q8_0,
            TensorData::Q4_0(_) => TensorEncoding::Q4_0,
        }
    }

    /// Dense view of the matrix, available only for the f32 encoding.
    pub(crate) fn dense(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(values) => Some(values),
            _ => None,
        }
    }

    /// Dot product of one matrix row with `x`.
    #[inline]
    pub fn dot_row(&self, row: usize, x: &[f32]) -> f32 {
        debug_assert!(row < self.rows);
        debug_assert_eq!(x.len(), self.cols);
        match &self.data {
            TensorData::F32(values) => {
                dot_row_f32(&values[row * self.cols..(row + 1) * self.cols], x)
            }
            TensorData::Q8_0(bytes) => dot_row_q8(bytes, row, self.cols, x),
            TensorData::Q4_0(bytes) => dot_row_q4(bytes, row, self.cols, x),
        }
    }

    /// Dequantizes the whole matrix to a dense row-major buffer.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match &self.data {
            TensorData::F32(values) => values.to_vec(),
            TensorData::Q8_0(bytes) => {
                let mut out = vec![0.0f32; self.rows * self.cols];
                let blocks_per_row = self.cols.div_ceil(QUANT_BLOCK_SIZE);
                for row in 0..self.rows {
                    for col in 0..self.cols {
                        let block = row * blocks_per_row + col / QUANT_BLOCK_SIZE;
                        let scale = block_scale(bytes, block, Q8_BLOCK_BYTES);
                        let code =
                            bytes[block * Q8_BLOCK_BYTES + 2 + col % QUANT_BLOCK_SIZE] as i8;
                        out[row * self.cols + col] = scale * code as f32;
                    }
                }
                out
            }
            TensorData::Q4_0(bytes) => {
                let mut out = vec![0.0f32; self.rows * self.cols];
                let blocks_per_row = self.cols.div_ceil(QUANT_BLOCK_SIZE);
                for row in 0..self.rows {
                    for col in 0..self.cols {
                        let block = row * blocks_per_row + col / QUANT_BLOCK_SIZE;
                        let scale = block_scale(bytes, block, Q4_BLOCK_BYTES);
                        let code = q4_code(bytes, block, col % QUANT_BLOCK_SIZE);
                        out[row * self.cols + col] = scale * code as f32;
                    }
                }
                out
            }
        }
    }
}

fn shape_mismatch(name: &str, detail: String) -> InferenceError {
    InferenceError::WeightShapeMismatch {
        name: name.into(),
        detail,
    }
}

#[inline]
fn block_scale(bytes: &[u8], block: usize, block_bytes: usize) -> f32 {
    let offset = block * block_bytes;
    f16_to_f32(LittleEndian::read_u16(&bytes[offset..offset + 2]))
}

#[inline]
fn q4_code(bytes: &[u8], block: usize, within: usize) -> i32 {
    let base = block * Q4_BLOCK_BYTES + 2;
    let nibble = if within < QUANT_BLOCK_SIZE / 2 {
        bytes[base + within] & 0x0F
    } else {
        bytes[base + within - QUANT_BLOCK_SIZE / 2] >> 4
    };
    nibble as i32 - 8
}

fn dot_row_f32(w: &[f32], x: &[f32]) -> f32 {
    let mut lanes = [0.0f32; LANES];
    let chunks = x.len() / LANES * LANES;
    let mut j = 0;
    while j < chunks {
        for lane in 0..LANES {
            lanes[lane] = fma(w[j + lane], x[j + lane], lanes[lane]);
        }
        j += LANES;
    }
    let mut sum = (lanes[0] + lanes[1]) + (lanes[2] + lanes[3]);
    for jj in chunks..x.len() {
        sum = fma(w[jj], x[jj], sum);
    }
    sum
}

fn dot_row_q8(bytes: &[u8], row: usize, cols: usize, x: &[f32]) -> f32 {
    let row_block = row * cols.div_ceil(QUANT_BLOCK_SIZE);
    let mut last_block = usize::MAX;
    let mut scale = 0.0f32;
    let mut lanes = [0.0f32; LANES];

    // Unrolled main loop with independent accumulator lanes; the scale is
    // decoded once per block change.
    let unrolled = cols / UNROLL * UNROLL;
    let mut j = 0;
    while j < unrolled {
        for group in (0..UNROLL).step_by(LANES) {
            for lane in 0..LANES {
                let col = j + group + lane;
                let block = row_block + col / QUANT_BLOCK_SIZE;
                if block != last_block {
                    scale = block_scale(bytes, block, Q8_BLOCK_BYTES);
                    last_block = block;
                }
                let code = bytes[block * Q8_BLOCK_BYTES + 2 + col % QUANT_BLOCK_SIZE] as i8;
                lanes[lane] = fma(code as f32 * scale, x[col], lanes[lane]);
            }
        }
        j += UNROLL;
    }

    let mut sum = (lanes[0] + lanes[1]) + (lanes[2] + lanes[3]);

    // Trailing tail, same logic without unrolling.
    for col in unrolled..cols {
        let block = row_block + col / QUANT_BLOCK_SIZE;
        if block != last_block {
            scale = block_scale(bytes, block, Q8_BLOCK_BYTES);
            last_block = block;
        }
        let code = bytes[block * Q8_BLOCK_BYTES + 2 + col % QUANT_BLOCK_SIZE] as i8;
        sum = fma(code as f32 * scale, x[col], sum);
    }
    sum
}

fn dot_row_q4(bytes: &[u8], row: usize, cols: usize, x: &[f32]) -> f32 {
    let row_block = row * cols.div_ceil(QUANT_BLOCK_SIZE);
    let mut last_block = usize::MAX;
    let mut scale = 0.0f32;
    let mut lanes = [0.0f32; LANES];

    let unrolled = cols / UNROLL * UNROLL;
    let mut j = 0;
    while j < unrolled {
        for group in (0..UNROLL).step_by(LANES) {
            for lane in 0..LANES {
                let col = j + group + lane;
                let block = row_block + col / QUANT_BLOCK_SIZE;
                if block != last_block {
                    scale = block_scale(bytes, block, Q4_BLOCK_BYTES);
                    last_block = block;
                }
                let code = q4_code(bytes, block, col % QUANT_BLOCK_SIZE);
                lanes[lane] = fma(code as f32 * scale, x[col], lanes[lane]);
            }
        }
        j += UNROLL;
    }

    let mut sum = (lanes[0] + lanes[1]) + (lanes[2] + lanes[3]);

    for col in unrolled..cols {
        let block = row_block + col / QUANT_BLOCK_SIZE;
        if block != last_block {
            scale = block_scale(bytes, block, Q4_BLOCK_BYTES);
            last_block = block;
        }
        let code = q4_code(bytes, block, col % QUANT_BLOCK_SIZE);
        sum = fma(code as f32 * scale, x[col], sum);
    }
    sum
}

/// Matrix-vector product: `out[r] = W[r] . x` for every row.
///
/// Rows fan out over the thread pool; each row accumulates sequentially so
/// results do not depend on scheduling.
pub fn matvec(out: &mut [f32], w: &WeightTensor, x: &[f32]) {
    assert!(
        out.len() >= w.rows(),
        "output slice too short: {} < {}",
        out.len(),
        w.rows()
    );
    out.par_iter_mut()
        .enumerate()
        .take(w.rows())
        .for_each(|(row, out_val)| {
            *out_val = w.dot_row(row, x);
        });
}

/// Matrix-vector product accumulated onto the existing output:
/// `out[r] += W[r] . x`. The previous value is read exactly once.
pub fn matvec_residual(out: &mut [f32], w: &WeightTensor, x: &[f32]) {
    assert!(
        out.len() >= w.rows(),
        "output slice too short: {} < {}",
        out.len(),
        w.rows()
    );
    out.par_iter_mut()
        .enumerate()
        .take(w.rows())
        .for_each(|(row, out_val)| {
            *out_val += w.dot_row(row, x);
        });
}

/// Quantizes values into Q8_0 blocks. A trailing partial block is padded
/// with zero codes.
pub fn quantize_q8_0(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len().div_ceil(QUANT_BLOCK_SIZE) * Q8_BLOCK_BYTES);
    for chunk in values.chunks(QUANT_BLOCK_SIZE) {
        let max_abs = chunk.iter().fold(0.0f32, |acc, &v| acc.max(v.abs()));
        // Round-trip the scale through f16 so codes are computed against the
        // scale that will actually be decoded.
        let scale_bits = f16::from_f32(max_abs / 127.0);
        let scale = scale_bits.to_f32();
        out.extend_from_slice(&scale_bits.to_bits().to_le_bytes());
        for &v in chunk {
            let code = if scale != 0.0 {
                (v / scale).round().clamp(-127.0, 127.0) as i8
            } else {
                0
            };
            out.push(code as u8);
        }
        for _ in chunk.len()..QUANT_BLOCK_SIZE {
            out.push(0);
        }
    }
    out
}

/// Quantizes values into Q4_0 blocks (codes 0..=15 with a -8 offset).
pub fn quantize_q4_0(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len().div_ceil(QUANT_BLOCK_SIZE) * Q4_BLOCK_BYTES);
    for chunk in values.chunks(QUANT_BLOCK_SIZE) {
        let max_abs = chunk.iter().fold(0.0f32, |acc, &v| acc.max(v.abs()));
        let scale_bits = f16::from_f32(max_abs / 7.0);
        let scale = scale_bits.to_f32();
        out.extend_from_slice(&scale_bits.to_bits().to_le_bytes());

        let code = |idx: usize| -> u8 {
            match chunk.get(idx) {
                Some(&v) if scale != 0.0 => {
                    ((v / scale).round().clamp(-8.0, 7.0) as i32 + 8) as u8
                }
                // Padding and zero-scale blocks decode to 0.
                _ => 8,
            }
        };
        for byte in 0..QUANT_BLOCK_SIZE / 2 {
            out.push(code(byte) | (code(byte + QUANT_BLOCK_SIZE / 2) << 4));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn f16_decode_named_patterns() {
        assert_eq!(f16_to_f32(0x0000).to_bits(), 0.0f32.to_bits());
        assert_eq!(f16_to_f32(0x8000).to_bits(), (-0.0f32).to_bits());
        assert_eq!(f16_to_f32(0x7C00), f32::INFINITY);
        assert_eq!(f16_to_f32(0xFC00), f32::NEG_INFINITY);
        assert!(f16_to_f32(0x7E00).is_nan());
        assert_eq!(f16_to_f32(0x0001), 5.960_464_5e-8);
        assert_eq!(f16_to_f32(0x3C00), 1.0);
        assert_eq!(f16_to_f32(0x7BFF), 65504.0);
    }

    #[test]
    fn f16_decode_agrees_with_half_over_all_patterns() {
        for bits in 0..=u16::MAX {
            let ours = f16_to_f32(bits);
            let reference = f16::from_bits(bits).to_f32();
            if reference.is_nan() {
                assert!(ours.is_nan(), "bits {bits:#06x}");
            } else {
                assert_eq!(ours.to_bits(), reference.to_bits(), "bits {bits:#06x}");
            }
        }
    }

    #[test]
    fn encoding_tag_round_trip() {
        assert_eq!(TensorEncoding::from_code(0).unwrap(), TensorEncoding::F32);
        assert_eq!(TensorEncoding::from_code(8).unwrap(), TensorEncoding::Q8_0);
        assert_eq!(TensorEncoding::from_code(2).unwrap(), TensorEncoding::Q4_0);
        assert!(matches!(
            TensorEncoding::from_code(99),
            Err(InferenceError::UnsupportedQuantization { .. })
        ));
    }

    #[test]
    fn from_raw_rejects_truncated_payload() {
        let bytes = vec![0u8; Q8_BLOCK_BYTES - 1];
        assert!(matches!(
            WeightTensor::from_raw("wq", 1, 32, TensorEncoding::Q8_0, &bytes),
            Err(InferenceError::WeightShapeMismatch { .. })
        ));
    }

    fn random_values(len: usize, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..len).map(|_| rng.gen_range(-4.0f32..4.0)).collect()
    }

    #[test]
    fn q8_dot_matches_naive_reference() {
        let rows = 5;
        let cols = 96;
        let weights = random_values(rows * cols, 11);
        let x = random_values(cols, 12);

        let bytes = quantize_q8_0(&weights);
        let tensor = WeightTensor::from_raw("w", rows, cols, TensorEncoding::Q8_0, &bytes).unwrap();
        let dense = tensor.to_f32_vec();

        for row in 0..rows {
            let naive: f32 = dense[row * cols..(row + 1) * cols]
                .iter()
                .zip(&x)
                .map(|(&w, &xv)| w * xv)
                .sum();
            let fast = tensor.dot_row(row, &x);
            assert!(
                (fast - naive).abs() <= 1e-3 * naive.abs().max(1.0),
                "row {row}: {fast} vs {naive}"
            );
        }
    }

    #[test]
    fn q4_dot_matches_naive_reference_with_partial_blocks() {
        // cols deliberately not a multiple of the block or unroll width.
        let rows = 3;
        let cols = 44;
        let weights = random_values(rows * cols, 21);
        let x = random_values(cols, 22);

        let mut bytes = Vec::new();
        for row in 0..rows {
            bytes.extend(quantize_q4_0(&weights[row * cols..(row + 1) * cols]));
        }
        let tensor = WeightTensor::from_raw("w", rows, cols, TensorEncoding::Q4_0, &bytes).unwrap();
        let dense = tensor.to_f32_vec();

        for row in 0..rows {
            let naive: f32 = dense[row * cols..(row + 1) * cols]
                .iter()
                .zip(&x)
                .map(|(&w, &xv)| w * xv)
                .sum();
            let fast = tensor.dot_row(row, &x);
            assert!(
                (fast - naive).abs() <= 1e-3 * naive.abs().max(1.0),
                "row {row}: {fast} vs {naive}"
            );
        }
    }

    #[test]
    fn matvec_linearity() {
        let rows = 16;
        let cols = 64;
        let w =
            WeightTensor::from_f32("w", rows, cols, random_values(rows * cols, 31)).unwrap();
        let a = random_values(cols, 32);
        let b = random_values(cols, 33);
        let sum: Vec<f32> = a.iter().zip(&b).map(|(&l, &r)| l + r).collect();

        let mut out_a = vec![0.0; rows];
        let mut out_b = vec![0.0; rows];
        let mut out_sum = vec![0.0; rows];
        matvec(&mut out_a, &w, &a);
        matvec(&mut out_b, &w, &b);
        matvec(&mut out_sum, &w, &sum);

        for row in 0..rows {
            let expected = out_a[row] + out_b[row];
            assert!(
                (out_sum[row] - expected).abs() <= 1e-3 * expected.abs().max(1.0),
                "row {row}"
            );
        }
    }

    #[test]
    fn matvec_residual_reads_previous_output_once() {
        let w = WeightTensor::from_f32("w", 2, 4, vec![1.0; 8]).unwrap();
        let x = vec![1.0, 2.0, 3.0, 4.0];
        let mut out = vec![100.0, -5.0];
        matvec_residual(&mut out, &w, &x);
        assert_eq!(out, vec![110.0, 5.0]);
    }

    proptest! {
        #[test]
        fn q8_round_trip_within_half_scale(values in prop::collection::vec(-8.0f32..8.0, QUANT_BLOCK_SIZE)) {
            let bytes = quantize_q8_0(&values);
            let tensor = WeightTensor::from_raw("w", 1, QUANT_BLOCK_SIZE, TensorEncoding::Q8_0, &bytes).unwrap();
            let decoded = tensor.to_f32_vec();
            let scale = block_scale(&bytes, 0, Q8_BLOCK_BYTES);
            for (orig, got) in values.iter().zip(&decoded) {
                prop_assert!((orig - got).abs() <= scale.abs() / 2.0 + 1e-5);
            }
        }

        #[test]
        fn q4_round_trip_within_half_scale(values in prop::collection::vec(-8.0f32..8.0, QUANT_BLOCK_SIZE)) {
            let bytes = quantize_q4_0(&values);
            let tensor = WeightTensor::from_raw("w", 1, QUANT_BLOCK_SIZE, TensorEncoding::Q4_0, &bytes).unwrap();
            let decoded = tensor.to_f32_vec();
            let scale = block_scale(&bytes, 0, Q4_BLOCK_BYTES);
            for (orig, got) in values.iter().zip(&decoded) {
                prop_assert!((orig - got).abs() <= scale.abs() / 2.0 + 1e-5);
            }
        }
    }
}
