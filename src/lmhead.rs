//! Sparse LM head gated by a two-layer activation profiler.
//!
//! Batch-1 vocabulary projection that skips most logit rows: a small `Q4_0`
//! profiler MLP predicts which vocabulary rows will score above zero, the
//! predictions are packed into a per-32-row bitmask, and only masked-in rows
//! get a real dot product — the rest are written as logit 0.
//!
//! Four phases over the pool: quantize input → profiler hidden projection →
//! profiler vocabulary scores + bitmask → masked logits. Each of the three
//! projection phases draws work from its own pool counter.

use crate::error::Result;
use crate::ffn::{check_len, check_min, quantize_rows_striped};
use crate::parallel::{ChunkGrid, ComputeParams, SharedOut};
use crate::quantize::codec::quantize_row_q8_0;
use crate::quantize::dot::vec_dot_q4_0_q8_0;
use crate::quantize::types::{row_size, QuantKind, QK};
use crate::workspace::{LmheadLayout, Workspace};

use std::sync::atomic::Ordering;

/// Rows grouped per bitmask word
const GROUP_ROWS: usize = 32;

/// Barrier-separated phases of the LM-head call, in execution order. A
/// barrier follows every phase, so the last one drains on all threads before
/// any returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LmheadPhase {
    /// Quantize the input activation
    Quantize,
    /// Profiler hidden projection
    ProfilerHidden,
    /// Profiler vocabulary scores packed to the bitmask
    ProfilerScores,
    /// Masked logits
    Logits,
}

impl LmheadPhase {
    const SEQUENCE: [LmheadPhase; 4] = [
        LmheadPhase::Quantize,
        LmheadPhase::ProfilerHidden,
        LmheadPhase::ProfilerScores,
        LmheadPhase::Logits,
    ];

    /// Position in the sequence; doubles as the phase's counter-pool slot
    fn index(self) -> usize {
        self as usize
    }
}

/// Weights and dimensions of one sparse LM-head call (batch size 1)
#[derive(Debug, Clone, Copy)]
pub struct LmheadArgs<'a> {
    /// Profiler first layer: `profiler_hidden_size` `Q4_0` rows of `n_embd`
    /// values
    pub profiler_w1: &'a [u8],
    /// Profiler second layer: `n_vocab` `Q4_0` rows of
    /// `profiler_hidden_size` values
    pub profiler_w2: &'a [u8],
    /// Vocabulary projection: `n_vocab` `Q4_0` rows of `n_embd` values
    pub lmhead: &'a [u8],
    /// Input activation, `n_embd` values
    pub input: &'a [f32],
    /// Model hidden size
    pub n_embd: usize,
    /// Vocabulary size
    pub n_vocab: usize,
    /// Profiler hidden size
    pub profiler_hidden_size: usize,
}

impl LmheadArgs<'_> {
    fn check_shapes(&self, dst_len: usize) -> Result<()> {
        let e = self.n_embd;
        let v = self.n_vocab;
        let hid = self.profiler_hidden_size;
        assert!(e % QK == 0, "embedding size {e} is not a multiple of {QK}");
        assert!(hid % QK == 0, "profiler hidden size {hid} is not a multiple of {QK}");
        assert!(v % GROUP_ROWS == 0, "vocabulary size {v} is not a multiple of {GROUP_ROWS}");

        check_len("input", self.input.len(), e)?;
        check_len("dst", dst_len, v)?;
        check_min("profiler_w1", self.profiler_w1.len(), hid * row_size(QuantKind::Q4_0, e))?;
        check_min("profiler_w2", self.profiler_w2.len(), v * row_size(QuantKind::Q4_0, hid))?;
        check_min("lmhead", self.lmhead.len(), v * row_size(QuantKind::Q4_0, e))
    }
}

/// Profiler-gated vocabulary projection, `Q4_0` weights over one f32 token.
///
/// Every thread of the pool calls this with the same arguments. Logits whose
/// profiler score is not above zero are exactly 0 in `dst` and their
/// vocabulary dot product is never computed.
///
/// # Errors
/// [`crate::DespertarError::ComputeBufferTooSmall`] when the workspace is
/// undersized; [`crate::DespertarError::InvalidShape`] on mismatched buffer
/// lengths.
pub fn lmhead_q4_0_f32(
    params: &ComputeParams<'_>,
    args: &LmheadArgs<'_>,
    workspace: &Workspace,
    dst: &SharedOut<'_, f32>,
) -> Result<()> {
    args.check_shapes(dst.len())?;
    let layout = LmheadLayout::new(args.n_embd, args.n_vocab, args.profiler_hidden_size);
    layout.validate(workspace)?;

    if params.is_lead() {
        params.reset_counters();
    }

    for phase in LmheadPhase::SEQUENCE {
        match phase {
            LmheadPhase::Quantize => {
                // SAFETY: striped disjoint writes
                let quant = unsafe { workspace.q8_region(layout.quant_input) };
                quantize_rows_striped(params, args.input, quant, args.n_embd, 1);
            }
            LmheadPhase::ProfilerHidden => {
                // SAFETY: quant_input complete after the barrier; each task
                // owns one output block
                let quant = unsafe { workspace.q8_region(layout.quant_input) };
                let hidden = unsafe { workspace.q8_region(layout.profiler_hidden) };

                let w1_row = row_size(QuantKind::Q4_0, args.n_embd);
                let num_blocks = args.profiler_hidden_size / QK;
                let counter = params.counter(phase.index());

                let mut tmp = [0.0f32; QK];
                loop {
                    let block = counter.fetch_add(1, Ordering::Relaxed);
                    if block >= num_blocks {
                        break;
                    }
                    let base_row = block * QK;
                    for (i, t) in tmp.iter_mut().enumerate() {
                        let w1 = &args.profiler_w1[(base_row + i) * w1_row..];
                        *t = vec_dot_q4_0_q8_0(args.n_embd, w1, quant);
                    }
                    quantize_row_q8_0(&tmp, &mut hidden[block..block + 1]);
                }
            }
            LmheadPhase::ProfilerScores => {
                // SAFETY: profiler_hidden complete after the barrier; each
                // task owns one mask word
                let hidden = unsafe { workspace.q8_region(layout.profiler_hidden) };
                let mask = unsafe { workspace.u32_region(layout.score_mask) };

                let w2_row = row_size(QuantKind::Q4_0, args.profiler_hidden_size);
                let num_groups = args.n_vocab / GROUP_ROWS;
                let counter = params.counter(phase.index());

                let mut tmp = [0.0f32; GROUP_ROWS];
                loop {
                    let group = counter.fetch_add(1, Ordering::Relaxed);
                    if group >= num_groups {
                        break;
                    }
                    let base_row = group * GROUP_ROWS;
                    for (i, t) in tmp.iter_mut().enumerate() {
                        let w2 = &args.profiler_w2[(base_row + i) * w2_row..];
                        *t = vec_dot_q4_0_q8_0(args.profiler_hidden_size, w2, hidden);
                    }
                    mask[group] = compare_fp32x32(&tmp, 0.0);
                }
            }
            LmheadPhase::Logits => {
                // SAFETY: score_mask complete after the barrier; logit chunks
                // are claimed exclusively
                let quant = unsafe { workspace.q8_region(layout.quant_input) };
                let mask = unsafe { workspace.u32_region(layout.score_mask) };
                let out = unsafe { dst.as_mut_slice() };

                let head_row = row_size(QuantKind::Q4_0, args.n_embd);
                let grid = ChunkGrid::new(args.n_vocab, 1, 64, params.nth);
                let counter = params.counter(phase.index());

                while let Some(chunk) = grid.steal(counter) {
                    if chunk.is_empty() {
                        continue;
                    }
                    for ir0 in chunk.i0 {
                        if mask[ir0 / GROUP_ROWS] & (1 << (ir0 % GROUP_ROWS)) == 0 {
                            out[ir0] = 0.0;
                            continue;
                        }
                        let row = &args.lmhead[ir0 * head_row..];
                        out[ir0] = vec_dot_q4_0_q8_0(args.n_embd, row, quant);
                    }
                }
            }
        }
        // no thread advances until every thread finished the phase
        params.arrive_and_wait();
    }

    Ok(())
}

/// Compare 32 floats against a threshold and pack `value > threshold` into a
/// `u32` bitmask, bit `i` for element `i`
#[must_use]
pub fn compare_fp32x32(values: &[f32; 32], threshold: f32) -> u32 {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx") {
            // SAFETY: AVX verified at runtime
            return unsafe { compare_fp32x32_avx(values, threshold) };
        }
    }
    compare_fp32x32_scalar(values, threshold)
}

fn compare_fp32x32_scalar(values: &[f32; 32], threshold: f32) -> u32 {
    let mut mask = 0u32;
    for (i, &v) in values.iter().enumerate() {
        if v > threshold {
            mask |= 1 << i;
        }
    }
    mask
}

/// # Safety
/// Caller must verify AVX support.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx")]
unsafe fn compare_fp32x32_avx(values: &[f32; 32], threshold: f32) -> u32 {
    // SAFETY: the array is exactly 32 floats; unaligned loads
    unsafe {
        #[allow(clippy::wildcard_imports)]
        use std::arch::x86_64::*;

        let t = _mm256_set1_ps(threshold);
        let p = values.as_ptr();

        let c0 = _mm256_movemask_ps(_mm256_cmp_ps::<_CMP_GT_OQ>(_mm256_loadu_ps(p), t)) as u32;
        let c1 =
            _mm256_movemask_ps(_mm256_cmp_ps::<_CMP_GT_OQ>(_mm256_loadu_ps(p.add(8)), t)) as u32;
        let c2 =
            _mm256_movemask_ps(_mm256_cmp_ps::<_CMP_GT_OQ>(_mm256_loadu_ps(p.add(16)), t)) as u32;
        let c3 =
            _mm256_movemask_ps(_mm256_cmp_ps::<_CMP_GT_OQ>(_mm256_loadu_ps(p.add(24)), t)) as u32;

        c0 | (c1 << 8) | (c2 << 16) | (c3 << 24)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_scalar_packs_bits_in_order() {
        let mut values = [0.0f32; 32];
        values[0] = 1.0;
        values[5] = 0.5;
        values[31] = 2.0;
        let mask = compare_fp32x32_scalar(&values, 0.0);
        assert_eq!(mask, (1 << 0) | (1 << 5) | (1 << 31));
    }

    #[test]
    fn test_compare_threshold_is_strict() {
        let values = [0.0f32; 32];
        assert_eq!(compare_fp32x32_scalar(&values, 0.0), 0);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_compare_avx_matches_scalar() {
        if !is_x86_feature_detected!("avx") {
            return;
        }
        let values: [f32; 32] = std::array::from_fn(|i| ((i as f32) - 15.5).sin());
        let scalar = compare_fp32x32_scalar(&values, 0.1);
        // SAFETY: feature checked above
        let simd = unsafe { compare_fp32x32_avx(&values, 0.1) };
        assert_eq!(scalar, simd);
    }
}
