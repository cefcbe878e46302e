//! `Q4_0` × `Q8_0` vector dot product.
//!
//! The workhorse of every projection in the crate: one quantized weight row
//! against one quantized activation row. Per 32-value block the kernel
//! unpacks the weight nibbles to signed int8 (bias -8), multiplies
//! elementwise with the int8 activations, sums to i32 and scales by the
//! product of the two block scales.
//!
//! Backend selection happens once per process through runtime CPU-feature
//! detection ([`active_backend`]); a single binary carries the scalar
//! reference loop plus SSSE3, AVX2 and NEON specializations that agree with
//! it within floating-point rounding tolerance. Tests can force a specific
//! path through [`vec_dot_q4_0_q8_0_with`].

use std::sync::LazyLock;

use super::f16_to_f32_lut;
use super::types::{detect_kernel_backend, BlockQ8_0, KernelBackend, BLOCK_Q4_0_BYTES, QK};

static ACTIVE_BACKEND: LazyLock<KernelBackend> = LazyLock::new(detect_kernel_backend);

/// The dot-product backend selected for this process
#[must_use]
pub fn active_backend() -> KernelBackend {
    *ACTIVE_BACKEND
}

/// Scaled dot product of a `Q4_0` weight row and a `Q8_0` activation row.
///
/// `weight_row` is the raw wire bytes of `n / 32` consecutive `Q4_0` blocks
/// (weight rows are consumed as unaligned bytes straight out of a weight
/// file); `activations` holds at least `n / 32` blocks.
///
/// # Panics
/// `n` must be a non-zero multiple of 32 and both rows must cover `n`
/// values. Pure computation otherwise; there is no error path.
#[must_use]
pub fn vec_dot_q4_0_q8_0(n: usize, weight_row: &[u8], activations: &[BlockQ8_0]) -> f32 {
    vec_dot_q4_0_q8_0_with(active_backend(), n, weight_row, activations)
}

/// [`vec_dot_q4_0_q8_0`] with an explicitly chosen backend.
///
/// # Panics
/// Panics when the requested backend is not available on this CPU, in
/// addition to the length requirements of [`vec_dot_q4_0_q8_0`].
#[must_use]
pub fn vec_dot_q4_0_q8_0_with(
    backend: KernelBackend,
    n: usize,
    weight_row: &[u8],
    activations: &[BlockQ8_0],
) -> f32 {
    assert!(n > 0 && n % QK == 0, "row length {n} is not a multiple of {QK}");
    let nb = n / QK;
    assert!(weight_row.len() >= nb * BLOCK_Q4_0_BYTES, "weight row too short");
    assert!(activations.len() >= nb, "activation row too short");

    match backend {
        #[cfg(target_arch = "x86_64")]
        KernelBackend::Avx2 => {
            assert!(
                is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma"),
                "AVX2 backend requested on a CPU without AVX2+FMA"
            );
            // SAFETY: feature availability checked above, lengths asserted
            unsafe { dot_avx2(nb, weight_row, activations) }
        }
        #[cfg(target_arch = "x86_64")]
        KernelBackend::Ssse3 => {
            assert!(
                is_x86_feature_detected!("ssse3"),
                "SSSE3 backend requested on a CPU without SSSE3"
            );
            // SAFETY: feature availability checked above, lengths asserted
            unsafe { dot_ssse3(nb, weight_row, activations) }
        }
        #[cfg(target_arch = "aarch64")]
        KernelBackend::Neon => {
            // NEON is baseline on AArch64
            // SAFETY: lengths asserted above
            unsafe { dot_neon(nb, weight_row, activations) }
        }
        _ => dot_scalar(nb, weight_row, activations),
    }
}

/// Portable scalar loop; the reference semantics every SIMD path must match
fn dot_scalar(nb: usize, weight_row: &[u8], activations: &[BlockQ8_0]) -> f32 {
    let mut sum = 0.0f32;

    for i in 0..nb {
        let block = &weight_row[i * BLOCK_Q4_0_BYTES..(i + 1) * BLOCK_Q4_0_BYTES];
        let d_w = f16_to_f32_lut(u16::from_le_bytes([block[0], block[1]]));
        let act = &activations[i];
        let d_a = f16_to_f32_lut(act.d.to_bits());

        let mut isum = 0i32;
        for (j, &byte) in block[2..].iter().enumerate() {
            let lo = i32::from(byte & 0x0F) - 8;
            let hi = i32::from(byte >> 4) - 8;
            isum += lo * i32::from(act.qs[j]);
            isum += hi * i32::from(act.qs[j + QK / 2]);
        }

        sum += d_w * d_a * isum as f32;
    }

    sum
}

/// AVX2 path: maddubs with the sign trick, two blocks per iteration.
///
/// `maddubs` multiplies unsigned × signed bytes, so the weight quants are
/// made non-negative and their signs are transferred onto the activations
/// (`|w| * sign(a, w)`), which preserves every product.
///
/// # Safety
/// Caller must verify AVX2 + FMA and the length requirements.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
unsafe fn dot_avx2(nb: usize, weight_row: &[u8], activations: &[BlockQ8_0]) -> f32 {
    // SAFETY: all pointer arithmetic stays inside the asserted row lengths;
    // loads and stores are unaligned intrinsics.
    unsafe {
        #[allow(clippy::wildcard_imports)]
        use std::arch::x86_64::*;

        let low_mask = _mm256_set1_epi8(0x0F);
        let offset = _mm256_set1_epi8(8);
        let ones = _mm256_set1_epi16(1);

        let mut acc0 = _mm256_setzero_ps();
        let mut acc1 = _mm256_setzero_ps();

        // SAFETY: callers pass pointers to complete 18-byte blocks
        let expand_block = |w_ptr: *const u8| -> __m256i {
            unsafe {
                let q4_lo = _mm_loadu_si128(w_ptr.add(2).cast());
                let q4_hi = _mm_srli_epi16(q4_lo, 4);
                _mm256_sub_epi8(
                    _mm256_and_si256(_mm256_set_m128i(q4_hi, q4_lo), low_mask),
                    offset,
                )
            }
        };

        let mut i = 0;
        while i + 2 <= nb {
            if i + 4 <= nb {
                _mm_prefetch(
                    weight_row.as_ptr().add((i + 2) * BLOCK_Q4_0_BYTES).cast(),
                    _MM_HINT_T0,
                );
                _mm_prefetch(activations.as_ptr().add(i + 2).cast(), _MM_HINT_T0);
            }

            for k in 0..2 {
                let w_ptr = weight_row.as_ptr().add((i + k) * BLOCK_Q4_0_BYTES);
                let act = &activations[i + k];

                let d_w = f16_to_f32_lut(u16::from_le_bytes([*w_ptr, *w_ptr.add(1)]));
                let d_a = f16_to_f32_lut(act.d.to_bits());
                let scale = _mm256_set1_ps(d_w * d_a);

                let q4_signed = expand_block(w_ptr);
                let q8 = _mm256_loadu_si256(act.qs.as_ptr().cast());

                let q4_abs = _mm256_sign_epi8(q4_signed, q4_signed);
                let q8_signed = _mm256_sign_epi8(q8, q4_signed);

                let prod16 = _mm256_maddubs_epi16(q4_abs, q8_signed);
                let prod32 = _mm256_madd_epi16(prod16, ones);
                let prod = _mm256_cvtepi32_ps(prod32);

                if k == 0 {
                    acc0 = _mm256_fmadd_ps(scale, prod, acc0);
                } else {
                    acc1 = _mm256_fmadd_ps(scale, prod, acc1);
                }
            }

            i += 2;
        }

        // odd trailing block
        while i < nb {
            let w_ptr = weight_row.as_ptr().add(i * BLOCK_Q4_0_BYTES);
            let act = &activations[i];
            let d_w = f16_to_f32_lut(u16::from_le_bytes([*w_ptr, *w_ptr.add(1)]));
            let d_a = f16_to_f32_lut(act.d.to_bits());
            let scale = _mm256_set1_ps(d_w * d_a);

            let q4_signed = expand_block(w_ptr);
            let q8 = _mm256_loadu_si256(act.qs.as_ptr().cast());
            let q4_abs = _mm256_sign_epi8(q4_signed, q4_signed);
            let q8_signed = _mm256_sign_epi8(q8, q4_signed);
            let prod32 = _mm256_madd_epi16(_mm256_maddubs_epi16(q4_abs, q8_signed), ones);
            acc0 = _mm256_fmadd_ps(scale, _mm256_cvtepi32_ps(prod32), acc0);
            i += 1;
        }

        let acc = _mm256_add_ps(acc0, acc1);
        let sum128 = _mm_add_ps(_mm256_castps256_ps128(acc), _mm256_extractf128_ps(acc, 1));
        let sum64 = _mm_hadd_ps(sum128, sum128);
        let sum32 = _mm_hadd_ps(sum64, sum64);
        _mm_cvtss_f32(sum32)
    }
}

/// SSSE3 path: 128-bit lanes, one block per iteration.
///
/// # Safety
/// Caller must verify SSSE3 and the length requirements.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "ssse3")]
unsafe fn dot_ssse3(nb: usize, weight_row: &[u8], activations: &[BlockQ8_0]) -> f32 {
    // SAFETY: pointer arithmetic within asserted lengths; unaligned loads.
    unsafe {
        #[allow(clippy::wildcard_imports)]
        use std::arch::x86_64::*;

        let low_mask = _mm_set1_epi8(0x0F);
        let offset = _mm_set1_epi8(8);
        let ones = _mm_set1_epi16(1);

        let mut sum = 0.0f32;

        for i in 0..nb {
            let w_ptr = weight_row.as_ptr().add(i * BLOCK_Q4_0_BYTES);
            let act = &activations[i];

            let d_w = f16_to_f32_lut(u16::from_le_bytes([*w_ptr, *w_ptr.add(1)]));
            let d_a = f16_to_f32_lut(act.d.to_bits());

            let q4 = _mm_loadu_si128(w_ptr.add(2).cast());
            let w_lo = _mm_sub_epi8(_mm_and_si128(q4, low_mask), offset);
            let w_hi = _mm_sub_epi8(_mm_and_si128(_mm_srli_epi16(q4, 4), low_mask), offset);

            let a_lo = _mm_loadu_si128(act.qs.as_ptr().cast());
            let a_hi = _mm_loadu_si128(act.qs.as_ptr().add(16).cast());

            // sign trick per 128-bit half, then widen to i32
            let p_lo = _mm_madd_epi16(
                _mm_maddubs_epi16(_mm_sign_epi8(w_lo, w_lo), _mm_sign_epi8(a_lo, w_lo)),
                ones,
            );
            let p_hi = _mm_madd_epi16(
                _mm_maddubs_epi16(_mm_sign_epi8(w_hi, w_hi), _mm_sign_epi8(a_hi, w_hi)),
                ones,
            );

            let p = _mm_add_epi32(p_lo, p_hi);
            let p64 = _mm_add_epi32(p, _mm_shuffle_epi32::<0b00_01_10_11>(p));
            let p32 = _mm_add_epi32(p64, _mm_shuffle_epi32::<0b00_00_00_01>(p64));
            let isum = _mm_cvtsi128_si32(p32);

            sum += d_w * d_a * isum as f32;
        }

        sum
    }
}

/// NEON path: widening `vmull_s8` multiplies, one block per iteration.
///
/// Valid on all AArch64 (no dot-product ISA extension required); SVE
/// hardware runs this path as well.
///
/// # Safety
/// Caller must uphold the length requirements.
#[cfg(target_arch = "aarch64")]
#[target_feature(enable = "neon")]
unsafe fn dot_neon(nb: usize, weight_row: &[u8], activations: &[BlockQ8_0]) -> f32 {
    // SAFETY: pointer arithmetic within asserted lengths; unaligned loads.
    unsafe {
        #[allow(clippy::wildcard_imports)]
        use std::arch::aarch64::*;

        let low_mask = vdupq_n_u8(0x0F);
        let offset = vdupq_n_s8(8);

        let mut sum = 0.0f32;

        for i in 0..nb {
            let w_ptr = weight_row.as_ptr().add(i * BLOCK_Q4_0_BYTES);
            let act = &activations[i];

            let d_w = f16_to_f32_lut(u16::from_le_bytes([*w_ptr, *w_ptr.add(1)]));
            let d_a = f16_to_f32_lut(act.d.to_bits());

            let q4 = vld1q_u8(w_ptr.add(2));
            let w_lo = vsubq_s8(vreinterpretq_s8_u8(vandq_u8(q4, low_mask)), offset);
            let w_hi = vsubq_s8(vreinterpretq_s8_u8(vshrq_n_u8(q4, 4)), offset);

            let a_lo = vld1q_s8(act.qs.as_ptr());
            let a_hi = vld1q_s8(act.qs.as_ptr().add(16));

            let p0 = vmull_s8(vget_low_s8(w_lo), vget_low_s8(a_lo));
            let p1 = vmull_s8(vget_high_s8(w_lo), vget_high_s8(a_lo));
            let p2 = vmull_s8(vget_low_s8(w_hi), vget_low_s8(a_hi));
            let p3 = vmull_s8(vget_high_s8(w_hi), vget_high_s8(a_hi));

            let s01 = vaddq_s32(vpaddlq_s16(p0), vpaddlq_s16(p1));
            let s23 = vaddq_s32(vpaddlq_s16(p2), vpaddlq_s16(p3));
            let isum = vaddvq_s32(vaddq_s32(s01, s23));

            sum += d_w * d_a * isum as f32;
        }

        sum
    }
}

#[cfg(test)]
mod tests {
    use super::super::codec::quantize_row_q8_0;
    use super::super::types::{q4_0_rows_as_bytes, BlockQ4_0};
    use super::*;
    use half::f16;

    fn backends_to_test() -> Vec<KernelBackend> {
        let mut backends = vec![KernelBackend::Scalar];
        #[cfg(target_arch = "x86_64")]
        {
            if is_x86_feature_detected!("ssse3") {
                backends.push(KernelBackend::Ssse3);
            }
            if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
                backends.push(KernelBackend::Avx2);
            }
        }
        #[cfg(target_arch = "aarch64")]
        backends.push(KernelBackend::Neon);
        backends
    }

    fn make_rows(n: usize, seed: u32) -> (Vec<u8>, Vec<BlockQ8_0>) {
        let mut state = seed;
        let mut next = move || {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 16) as f32 / 32768.0 - 1.0
        };
        let weights: Vec<f32> = (0..n).map(|_| next() * 3.0).collect();
        let acts: Vec<f32> = (0..n).map(|_| next() * 5.0).collect();

        let mut w_blocks = vec![BlockQ4_0::default(); n / 32];
        super::super::codec::quantize_row_q4_0(&weights, &mut w_blocks);
        let mut a_blocks = vec![BlockQ8_0::default(); n / 32];
        quantize_row_q8_0(&acts, &mut a_blocks);

        (q4_0_rows_as_bytes(&w_blocks).to_vec(), a_blocks)
    }

    #[test]
    fn test_backends_agree_with_scalar() {
        for &n in &[32usize, 64, 96, 128, 4096] {
            let (weight, acts) = make_rows(n, 0xC0FF_EE00 ^ n as u32);
            let reference = vec_dot_q4_0_q8_0_with(KernelBackend::Scalar, n, &weight, &acts);
            for backend in backends_to_test() {
                let got = vec_dot_q4_0_q8_0_with(backend, n, &weight, &acts);
                let tol = reference.abs().max(1.0) * 1e-3;
                assert!(
                    (got - reference).abs() <= tol,
                    "{backend} disagrees with scalar at n={n}: {got} vs {reference}"
                );
            }
        }
    }

    #[test]
    fn test_known_pattern_dot() {
        // 4 blocks of weights all storing nibble 15 (= +7) with scale 0.25,
        // activations all +1 which quantize exactly to 127 with scale 1/127
        let n = 128;
        let w_blocks: Vec<BlockQ4_0> = (0..4)
            .map(|_| BlockQ4_0 {
                d: f16::from_f32(0.25),
                qs: [0xFF; 16],
            })
            .collect();
        let weight = q4_0_rows_as_bytes(&w_blocks).to_vec();

        let acts_f32 = [1.0f32; 128];
        let mut acts = vec![BlockQ8_0::default(); 4];
        quantize_row_q8_0(&acts_f32, &mut acts);

        let d_a = f16::from_f32(1.0 / 127.0).to_f32();
        let expected = 0.25 * d_a * (7 * 127 * 128) as f32;

        for backend in backends_to_test() {
            let got = vec_dot_q4_0_q8_0_with(backend, n, &weight, &acts);
            assert!(
                (got - expected).abs() <= expected.abs() * 1e-3,
                "{backend}: {got} vs {expected}"
            );
        }
    }

    #[test]
    #[should_panic(expected = "not a multiple of 32")]
    fn test_rejects_ragged_length() {
        let _ = vec_dot_q4_0_q8_0(33, &[0; 36], &[BlockQ8_0::default(); 2]);
    }
}
