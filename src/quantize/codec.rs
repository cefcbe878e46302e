//! Conversions between f32 rows and quantized blocks.
//!
//! `Q8_0` quantization sits on the hot path (activations are re-quantized
//! inside every forward call) and carries an AVX2 pipeline; `Q4_0`
//! quantization is a load-time concern and stays scalar.

use half::f16;

use super::types::{BlockQ4_0, BlockQ8_0, QK};

// ============================================================================
// Q8_0
// ============================================================================

/// Quantize a row of f32 values to `Q8_0` blocks.
///
/// Each 32-value block gets the scale `amax / 127` where `amax` is the
/// block's absolute maximum, and values are rounded to the nearest signed
/// int8. An all-zero block stores scale 0 and all-zero quants.
///
/// # Panics
/// `src.len()` must be a multiple of 32 and `dst` must hold exactly
/// `src.len() / 32` blocks.
pub fn quantize_row_q8_0(src: &[f32], dst: &mut [BlockQ8_0]) {
    assert!(src.len() % QK == 0, "row length {} is not a multiple of {QK}", src.len());
    assert_eq!(dst.len(), src.len() / QK, "output block count mismatch");

    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") {
            // SAFETY: AVX2 verified at runtime
            unsafe { quantize_row_q8_0_avx2(src, dst) };
            return;
        }
    }

    quantize_row_q8_0_scalar(src, dst);
}

/// Scalar `Q8_0` quantization; the reference semantics
pub(crate) fn quantize_row_q8_0_scalar(src: &[f32], dst: &mut [BlockQ8_0]) {
    for (chunk, block) in src.chunks_exact(QK).zip(dst.iter_mut()) {
        let amax = chunk.iter().fold(0.0f32, |acc, &v| acc.max(v.abs()));

        let d = amax / 127.0;
        let id = if d == 0.0 { 0.0 } else { 1.0 / d };

        block.d = f16::from_f32(d);
        for (q, &v) in block.qs.iter_mut().zip(chunk.iter()) {
            *q = (v * id).round() as i8;
        }
    }
}

/// AVX2 `Q8_0` quantization: block-wide abs-max reduction, scale, round,
/// pack i32 → i16 → i8 with a final cross-lane permute to restore order.
///
/// # Safety
/// Caller must verify AVX2 support.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn quantize_row_q8_0_avx2(src: &[f32], dst: &mut [BlockQ8_0]) {
    // SAFETY: slice lengths are asserted by the caller; all loads/stores are
    // unaligned intrinsics within bounds.
    unsafe {
        #[allow(clippy::wildcard_imports)]
        use std::arch::x86_64::*;

        for (chunk, block) in src.chunks_exact(QK).zip(dst.iter_mut()) {
            let p = chunk.as_ptr();
            let v0 = _mm256_loadu_ps(p);
            let v1 = _mm256_loadu_ps(p.add(8));
            let v2 = _mm256_loadu_ps(p.add(16));
            let v3 = _mm256_loadu_ps(p.add(24));

            // max(abs(v)) across the block
            let sign_bit = _mm256_set1_ps(-0.0);
            let mut max_abs = _mm256_andnot_ps(sign_bit, v0);
            max_abs = _mm256_max_ps(max_abs, _mm256_andnot_ps(sign_bit, v1));
            max_abs = _mm256_max_ps(max_abs, _mm256_andnot_ps(sign_bit, v2));
            max_abs = _mm256_max_ps(max_abs, _mm256_andnot_ps(sign_bit, v3));

            let mut max4 = _mm_max_ps(_mm256_extractf128_ps(max_abs, 1), _mm256_castps256_ps128(max_abs));
            max4 = _mm_max_ps(max4, _mm_movehl_ps(max4, max4));
            max4 = _mm_max_ss(max4, _mm_movehdup_ps(max4));
            let amax = _mm_cvtss_f32(max4);

            let d = amax / 127.0;
            let id = if amax == 0.0 { 0.0 } else { 127.0 / amax };
            block.d = f16::from_f32(d);

            let mul = _mm256_set1_ps(id);
            let i0 = _mm256_cvtps_epi32(_mm256_round_ps(
                _mm256_mul_ps(v0, mul),
                _MM_FROUND_TO_NEAREST_INT | _MM_FROUND_NO_EXC,
            ));
            let i1 = _mm256_cvtps_epi32(_mm256_round_ps(
                _mm256_mul_ps(v1, mul),
                _MM_FROUND_TO_NEAREST_INT | _MM_FROUND_NO_EXC,
            ));
            let i2 = _mm256_cvtps_epi32(_mm256_round_ps(
                _mm256_mul_ps(v2, mul),
                _MM_FROUND_TO_NEAREST_INT | _MM_FROUND_NO_EXC,
            ));
            let i3 = _mm256_cvtps_epi32(_mm256_round_ps(
                _mm256_mul_ps(v3, mul),
                _MM_FROUND_TO_NEAREST_INT | _MM_FROUND_NO_EXC,
            ));

            // i32 -> i16 -> i8; the 128-bit pack lanes scramble the order,
            // the permute puts the 32 bytes back in sequence
            let packed16_lo = _mm256_packs_epi32(i0, i1);
            let packed16_hi = _mm256_packs_epi32(i2, i3);
            let packed8 = _mm256_packs_epi16(packed16_lo, packed16_hi);
            let perm = _mm256_setr_epi32(0, 4, 1, 5, 2, 6, 3, 7);
            let ordered = _mm256_permutevar8x32_epi32(packed8, perm);

            _mm256_storeu_si256(block.qs.as_mut_ptr().cast(), ordered);
        }
    }
}

/// Dequantize `Q8_0` blocks back to f32 values.
///
/// # Panics
/// `dst` must hold exactly `src.len() * 32` values.
pub fn dequantize_row_q8_0(src: &[BlockQ8_0], dst: &mut [f32]) {
    assert_eq!(dst.len(), src.len() * QK, "output length mismatch");
    for (block, out) in src.iter().zip(dst.chunks_exact_mut(QK)) {
        let d = block.d.to_f32();
        for (o, &q) in out.iter_mut().zip(block.qs.iter()) {
            *o = d * f32::from(q);
        }
    }
}

// ============================================================================
// Q4_0
// ============================================================================

/// Quantize a row of f32 values to `Q4_0` blocks.
///
/// Uses the signed-max convention: the scale is `max / -8` where `max` is
/// the value with the largest magnitude, so the extreme value maps to the
/// quant -8 and the stored range [0, 15] covers [-8, 7] after the bias.
/// Nibble packing is low-half/high-half: byte `j` holds value `j` in the low
/// nibble and value `j + 16` in the high nibble.
///
/// # Panics
/// `src.len()` must be a multiple of 32 and `dst` must hold exactly
/// `src.len() / 32` blocks.
pub fn quantize_row_q4_0(src: &[f32], dst: &mut [BlockQ4_0]) {
    assert!(src.len() % QK == 0, "row length {} is not a multiple of {QK}", src.len());
    assert_eq!(dst.len(), src.len() / QK, "output block count mismatch");

    for (chunk, block) in src.chunks_exact(QK).zip(dst.iter_mut()) {
        let mut amax = 0.0f32;
        let mut max = 0.0f32;
        for &v in chunk {
            if v.abs() > amax {
                amax = v.abs();
                max = v;
            }
        }

        let d = max / -8.0;
        let id = if d == 0.0 { 0.0 } else { 1.0 / d };
        block.d = f16::from_f32(d);

        for j in 0..QK / 2 {
            let x0 = chunk[j] * id;
            let x1 = chunk[j + QK / 2] * id;
            let xi0 = ((x0 + 8.5) as i8).min(15) as u8;
            let xi1 = ((x1 + 8.5) as i8).min(15) as u8;
            block.qs[j] = xi0 | (xi1 << 4);
        }
    }
}

/// Dequantize `Q4_0` blocks back to f32 values.
///
/// # Panics
/// `dst` must hold exactly `src.len() * 32` values.
pub fn dequantize_row_q4_0(src: &[BlockQ4_0], dst: &mut [f32]) {
    assert_eq!(dst.len(), src.len() * QK, "output length mismatch");
    for (block, out) in src.iter().zip(dst.chunks_exact_mut(QK)) {
        let d = block.d.to_f32();
        for (j, &byte) in block.qs.iter().enumerate() {
            let x0 = i32::from(byte & 0x0F) - 8;
            let x1 = i32::from(byte >> 4) - 8;
            out[j] = x0 as f32 * d;
            out[j + QK / 2] = x1 as f32 * d;
        }
    }
}
