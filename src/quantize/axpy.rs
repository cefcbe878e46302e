//! Batched AXPY accumulation of `Q4_0` weight rows.
//!
//! Sparse gather-accumulate: a row-wise predictor picks which weight rows
//! contribute to an output vector, and each contributes `coeff * row`. The
//! batch buffers up to eight `(coeff, row)` pairs and flushes them through a
//! fused kernel that dequantizes all buffered rows block-by-block while the
//! output block is hot, amortizing the load/store traffic across the batch.
//!
//! The accumulator target is either `f32` or `f16` (see [`AxpyTarget`]); the
//! `f32` target carries an AVX2 path.

use half::f16;

use super::f16_to_f32_lut;
use super::types::{row_size, QuantKind, BLOCK_Q4_0_BYTES, QK};

/// Rows buffered per fused pass
pub const AXPY_BATCH: usize = 8;

mod sealed {
    pub trait Sealed {}
    impl Sealed for f32 {}
    impl Sealed for half::f16 {}
}

/// Accumulator element type of an [`AxpyBatch`]
pub trait AxpyTarget: sealed::Sealed + Copy + Send + Sync {
    /// Accumulate `coeffs[j] * dequant(rows[j])` into `out` for every
    /// buffered row in one fused pass
    fn accumulate_batch(vec_dim: usize, coeffs: &[f32], rows: &[&[u8]], out: &mut [Self]);
}

impl AxpyTarget for f32 {
    fn accumulate_batch(vec_dim: usize, coeffs: &[f32], rows: &[&[u8]], out: &mut [f32]) {
        #[cfg(target_arch = "x86_64")]
        {
            if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
                // SAFETY: AVX2+FMA verified at runtime
                unsafe { accumulate_batch_f32_avx2(vec_dim, coeffs, rows, out) };
                return;
            }
        }
        accumulate_batch_f32_scalar(vec_dim, coeffs, rows, out);
    }
}

impl AxpyTarget for f16 {
    fn accumulate_batch(vec_dim: usize, coeffs: &[f32], rows: &[&[u8]], out: &mut [f16]) {
        let nb = vec_dim / QK;
        let mut tmp = [0.0f32; QK];

        for i in 0..nb {
            let out_block = &mut out[i * QK..(i + 1) * QK];
            for (t, o) in tmp.iter_mut().zip(out_block.iter()) {
                *t = f16_to_f32_lut(o.to_bits());
            }

            accumulate_block(i, coeffs, rows, &mut tmp);

            for (o, &t) in out_block.iter_mut().zip(tmp.iter()) {
                *o = f16::from_f32(t);
            }
        }
    }
}

/// Dequantize block `i` of every buffered row into `acc`
#[inline]
fn accumulate_block(i: usize, coeffs: &[f32], rows: &[&[u8]], acc: &mut [f32; QK]) {
    for (&coeff, row) in coeffs.iter().zip(rows.iter()) {
        let block = &row[i * BLOCK_Q4_0_BYTES..(i + 1) * BLOCK_Q4_0_BYTES];
        let d = coeff * f16_to_f32_lut(u16::from_le_bytes([block[0], block[1]]));
        for (j, &byte) in block[2..].iter().enumerate() {
            let lo = i32::from(byte & 0x0F) - 8;
            let hi = i32::from(byte >> 4) - 8;
            acc[j] += lo as f32 * d;
            acc[j + QK / 2] += hi as f32 * d;
        }
    }
}

fn accumulate_batch_f32_scalar(vec_dim: usize, coeffs: &[f32], rows: &[&[u8]], out: &mut [f32]) {
    let nb = vec_dim / QK;
    for i in 0..nb {
        let mut tmp = [0.0f32; QK];
        accumulate_block(i, coeffs, rows, &mut tmp);
        for (o, &t) in out[i * QK..(i + 1) * QK].iter_mut().zip(tmp.iter()) {
            *o += t;
        }
    }
}

/// AVX2 fused pass for the f32 target: four 256-bit accumulators per block,
/// one fmadd chain per buffered row.
///
/// # Safety
/// Caller must verify AVX2 + FMA.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
unsafe fn accumulate_batch_f32_avx2(
    vec_dim: usize,
    coeffs: &[f32],
    rows: &[&[u8]],
    out: &mut [f32],
) {
    // SAFETY: row and output lengths are enforced by AxpyBatch; unaligned
    // loads/stores throughout.
    unsafe {
        #[allow(clippy::wildcard_imports)]
        use std::arch::x86_64::*;

        let low_mask = _mm_set1_epi8(0x0F);
        let offset = _mm_set1_epi8(8);
        let nb = vec_dim / QK;

        for i in 0..nb {
            let mut acc0 = _mm256_setzero_ps();
            let mut acc1 = _mm256_setzero_ps();
            let mut acc2 = _mm256_setzero_ps();
            let mut acc3 = _mm256_setzero_ps();

            for (&coeff, row) in coeffs.iter().zip(rows.iter()) {
                let block = row.as_ptr().add(i * BLOCK_Q4_0_BYTES);
                let d = coeff * f16_to_f32_lut(u16::from_le_bytes([*block, *block.add(1)]));
                let vd = _mm256_set1_ps(d);

                let qs = _mm_loadu_si128(block.add(2).cast());
                let q_lo = _mm_sub_epi8(_mm_and_si128(qs, low_mask), offset);
                let q_hi = _mm_sub_epi8(_mm_and_si128(_mm_srli_epi16(qs, 4), low_mask), offset);

                let q_lo_hi_half = _mm_unpackhi_epi64(q_lo, _mm_setzero_si128());
                let q_hi_hi_half = _mm_unpackhi_epi64(q_hi, _mm_setzero_si128());

                acc0 = _mm256_fmadd_ps(_mm256_cvtepi32_ps(_mm256_cvtepi8_epi32(q_lo)), vd, acc0);
                acc1 = _mm256_fmadd_ps(
                    _mm256_cvtepi32_ps(_mm256_cvtepi8_epi32(q_lo_hi_half)),
                    vd,
                    acc1,
                );
                acc2 = _mm256_fmadd_ps(_mm256_cvtepi32_ps(_mm256_cvtepi8_epi32(q_hi)), vd, acc2);
                acc3 = _mm256_fmadd_ps(
                    _mm256_cvtepi32_ps(_mm256_cvtepi8_epi32(q_hi_hi_half)),
                    vd,
                    acc3,
                );
            }

            let py = out.as_mut_ptr().add(i * QK);
            _mm256_storeu_ps(py, _mm256_add_ps(_mm256_loadu_ps(py), acc0));
            _mm256_storeu_ps(py.add(8), _mm256_add_ps(_mm256_loadu_ps(py.add(8)), acc1));
            _mm256_storeu_ps(py.add(16), _mm256_add_ps(_mm256_loadu_ps(py.add(16)), acc2));
            _mm256_storeu_ps(py.add(24), _mm256_add_ps(_mm256_loadu_ps(py.add(24)), acc3));
        }
    }
}

/// Buffers up to eight `(coeff, Q4_0 row)` pairs against one output vector.
///
/// [`AxpyBatch::enqueue`] auto-flushes when the ninth pair arrives;
/// [`AxpyBatch::flush`] on an empty batch is a no-op and reads nothing.
/// Callers flush explicitly once the gather is complete — dropping a
/// non-empty batch without flushing discards the buffered rows.
pub struct AxpyBatch<'a, T: AxpyTarget> {
    vec_dim: usize,
    out: &'a mut [T],
    coeffs: [f32; AXPY_BATCH],
    rows: [&'a [u8]; AXPY_BATCH],
    len: usize,
}

impl<'a, T: AxpyTarget> AxpyBatch<'a, T> {
    /// Bind the batch to its output vector.
    ///
    /// # Panics
    /// `vec_dim` must be a non-zero multiple of 32 and `out` must hold
    /// exactly `vec_dim` elements.
    #[must_use]
    pub fn new(vec_dim: usize, out: &'a mut [T]) -> Self {
        assert!(vec_dim > 0 && vec_dim % QK == 0, "vector length {vec_dim} is not a multiple of {QK}");
        assert_eq!(out.len(), vec_dim, "output length mismatch");
        Self {
            vec_dim,
            out,
            coeffs: [0.0; AXPY_BATCH],
            rows: [&[]; AXPY_BATCH],
            len: 0,
        }
    }

    /// Number of currently buffered rows
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no rows are buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Buffer one weighted row, flushing first if the batch is full.
    ///
    /// # Panics
    /// `row` must hold at least `vec_dim / 32` `Q4_0` blocks.
    pub fn enqueue(&mut self, coeff: f32, row: &'a [u8]) {
        assert!(
            row.len() >= row_size(QuantKind::Q4_0, self.vec_dim),
            "weight row too short"
        );
        if self.len >= AXPY_BATCH {
            self.flush();
        }
        self.coeffs[self.len] = coeff;
        self.rows[self.len] = row;
        self.len += 1;
    }

    /// Apply all buffered rows to the output in one fused pass
    pub fn flush(&mut self) {
        if self.len == 0 {
            return;
        }
        T::accumulate_batch(
            self.vec_dim,
            &self.coeffs[..self.len],
            &self.rows[..self.len],
            self.out,
        );
        self.len = 0;
    }
}

/// Accumulate predictor-selected rows of a `Q4_0` weight matrix into `out`.
///
/// `mask` holds one bit per row (bit `r % 32` of word `r / 32`); rows whose
/// bit is unset are skipped without touching their data. `coeffs[r]` scales
/// row `r`.
///
/// # Panics
/// `weight` must hold `coeffs.len()` rows of `vec_dim` values and `mask`
/// must cover every row; `out` must hold `vec_dim` elements.
pub fn axpy_rows_masked(
    vec_dim: usize,
    weight: &[u8],
    coeffs: &[f32],
    mask: &[u32],
    out: &mut [f32],
) {
    let bytes_per_row = row_size(QuantKind::Q4_0, vec_dim);
    assert!(weight.len() >= coeffs.len() * bytes_per_row, "weight matrix too short");
    assert!(mask.len() * 32 >= coeffs.len(), "mask does not cover every row");

    let mut batch = AxpyBatch::<f32>::new(vec_dim, out);
    for (r, &coeff) in coeffs.iter().enumerate() {
        if mask[r / 32] & (1 << (r % 32)) == 0 {
            continue;
        }
        batch.enqueue(coeff, &weight[r * bytes_per_row..(r + 1) * bytes_per_row]);
    }
    batch.flush();
}
