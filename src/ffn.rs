//! Conditional (predictor-gated) FFN forward pass and its chunked drivers.
//!
//! One forward call runs five barrier-separated phases over the caller's
//! thread pool:
//!
//! 1. fused residual + RMSNorm of the input
//! 2. `Q8_0` quantization of the normalized activations
//! 3. up·gate projection, SiLU-gated, re-quantized to `Q8_0`
//! 4. down projection back to `hidden_size` floats
//! 5. residual accumulation, optionally through a trailing RMSNorm
//!
//! Phases 3 and 4 are chunked work-stealing mat-muls (sparsity makes
//! per-chunk cost uneven); phases 1, 2 and 5 stripe uniformly by thread.
//! The up·gate driver short-circuits: a non-positive gate projection zeroes
//! the element without computing the up projection at all, and an external
//! predictor can additionally switch whole intermediate rows off through a
//! per-token neuron bitmask.

use crate::error::{DespertarError, Result};
use crate::layernorm::post_attn_layernorm;
use crate::parallel::{Chunk, ChunkGrid, ComputeParams, SharedOut};
use crate::quantize::codec::quantize_row_q8_0;
use crate::quantize::dot::vec_dot_q4_0_q8_0;
use crate::quantize::types::{row_size, BlockQ8_0, QuantKind, QK};
use crate::workspace::{CondFfnLayout, Workspace};

/// `x * sigmoid(x)`
#[inline]
pub(crate) fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

/// Barrier-separated phases of an FFN-style forward call, in execution
/// order; shared by the conditional and MoE pipelines. A barrier follows
/// every phase, so the last one is fully drained on all threads before any
/// returns and the next call may reset the counter pool immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FfnPhase {
    /// Fused residual + RMSNorm into the arena
    Norm,
    /// `Q8_0` quantization of the normalized activations
    Quantize,
    /// SiLU-gated up·gate projection
    UpGate,
    /// Down projection
    Down,
    /// Residual fold, optionally through the trailing norm
    Fold,
}

impl FfnPhase {
    pub(crate) const SEQUENCE: [FfnPhase; 5] = [
        FfnPhase::Norm,
        FfnPhase::Quantize,
        FfnPhase::UpGate,
        FfnPhase::Down,
        FfnPhase::Fold,
    ];

    /// Position in the sequence; doubles as the phase's counter-pool slot
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Batch-row tile height of the chunk inner loops
pub(crate) const TILE_1: usize = 16;
/// Output-row tile width of the down-projection inner loop
pub(crate) const TILE_0: usize = 16;

/// Weights, inputs and dimensions of one conditional-FFN forward call.
///
/// Weight buffers are raw `Q4_0` wire bytes, one row per output feature:
/// `up` and `gate` have `intermediate_size` rows of `hidden_size` values,
/// `down` has `hidden_size` rows of `intermediate_size` values.
#[derive(Debug, Clone, Copy)]
pub struct CondFfnArgs<'a> {
    /// RMSNorm weight applied before the projections, `hidden_size` values
    pub ffn_norm_weight: &'a [f32],
    /// Up-projection weight, `Q4_0` rows
    pub up: &'a [u8],
    /// Gate-projection weight, `Q4_0` rows
    pub gate: &'a [u8],
    /// Down-projection weight, `Q4_0` rows
    pub down: &'a [u8],
    /// Predictor output: one bit per intermediate row and token (bit unset
    /// switches the row off), `intermediate_size / 32` words per token
    pub neuron_mask: Option<&'a [u32]>,
    /// Attention-block input folded into the residual stream before the norm
    pub residual_in: Option<&'a [f32]>,
    /// When present this is the final layer segment: the output is
    /// re-normalized with this weight and `dst` receives
    /// `[normed | residual]`, each `hidden_size * batch_size` values.
    /// Otherwise `dst` receives the residual-accumulated FFN output.
    pub output_norm_weight: Option<&'a [f32]>,
    /// Input activations, `hidden_size * batch_size` values
    pub input: &'a [f32],
    /// Model hidden size (columns of `up`/`gate`, rows of `down`)
    pub hidden_size: usize,
    /// FFN intermediate size (rows of `up`/`gate`, columns of `down`)
    pub intermediate_size: usize,
    /// Tokens in the batch
    pub batch_size: usize,
    /// RMSNorm epsilon
    pub eps: f32,
}

impl CondFfnArgs<'_> {
    fn check_shapes(&self, dst_len: usize) -> Result<()> {
        let h = self.hidden_size;
        let b = self.batch_size;
        let ff = self.intermediate_size;
        assert!(h % QK == 0, "hidden size {h} is not a multiple of {QK}");
        assert!(ff % QK == 0, "intermediate size {ff} is not a multiple of {QK}");

        check_len("input", self.input.len(), h * b)?;
        check_len("ffn_norm_weight", self.ffn_norm_weight.len(), h)?;
        check_min("up", self.up.len(), ff * row_size(QuantKind::Q4_0, h))?;
        check_min("gate", self.gate.len(), ff * row_size(QuantKind::Q4_0, h))?;
        check_min("down", self.down.len(), h * row_size(QuantKind::Q4_0, ff))?;
        if let Some(r) = self.residual_in {
            check_len("residual_in", r.len(), h * b)?;
        }
        if let Some(m) = self.neuron_mask {
            check_min("neuron_mask", m.len(), b * (ff / 32))?;
        }
        if let Some(w) = self.output_norm_weight {
            check_len("output_norm_weight", w.len(), h)?;
        }
        let expected_dst = if self.output_norm_weight.is_some() {
            2 * h * b
        } else {
            h * b
        };
        check_len("dst", dst_len, expected_dst)
    }
}

/// Conditional-FFN forward pass, `Q4_0` weights over f32 activations.
///
/// Every thread of the pool calls this with the same `args`, `workspace` and
/// `dst`; phases are synchronized internally. The workspace is validated
/// against the full requirement before anything is written — on failure
/// every thread returns [`DespertarError::ComputeBufferTooSmall`] and `dst`
/// is untouched.
///
/// # Errors
/// [`DespertarError::ComputeBufferTooSmall`] when the workspace cannot hold
/// the working set; [`DespertarError::InvalidShape`] on mismatched buffer
/// lengths. Both are detected identically by all threads before the first
/// barrier, so no thread is left stranded.
pub fn ffn_cond_q4_0_f32(
    params: &ComputeParams<'_>,
    args: &CondFfnArgs<'_>,
    workspace: &Workspace,
    dst: &SharedOut<'_, f32>,
) -> Result<()> {
    let h = args.hidden_size;
    let ff = args.intermediate_size;
    let b = args.batch_size;

    args.check_shapes(dst.len())?;
    let layout = CondFfnLayout::new(h, ff, b);
    layout.validate(workspace)?;

    if params.is_lead() {
        params.reset_counters();
    }

    for phase in FfnPhase::SEQUENCE {
        match phase {
            FfnPhase::Norm => {
                let norm = SharedOut::new(unsafe { workspace.f32_region(layout.norm) });
                let residual = SharedOut::new(unsafe { workspace.f32_region(layout.residual) });
                post_attn_layernorm(
                    params,
                    args.residual_in,
                    args.input,
                    Some(args.ffn_norm_weight),
                    None,
                    &norm,
                    &residual,
                    h,
                    b,
                    args.eps,
                )?;
            }
            FfnPhase::Quantize => {
                // SAFETY: norm was fully written before the barrier;
                // quant_input writes are striped disjointly
                let norm = unsafe { workspace.f32_region(layout.norm) };
                let quant = unsafe { workspace.q8_region(layout.quant_input) };
                quantize_rows_striped(params, norm, quant, h, b);
            }
            FfnPhase::UpGate => {
                // SAFETY: quant_input is complete after the barrier; up_gate
                // chunks are claimed exclusively and block-aligned
                let quant = unsafe { workspace.q8_region(layout.quant_input) };
                let up_gate = unsafe { workspace.q8_region(layout.up_gate) };
                forward_up_gate(params, phase.index(), args, quant, up_gate);
            }
            FfnPhase::Down => {
                // SAFETY: up_gate is complete after the barrier; ffn_out
                // chunks are claimed exclusively
                let up_gate = unsafe { workspace.q8_region(layout.up_gate) };
                let ffn_out = unsafe { workspace.f32_region(layout.ffn_out) };
                forward_down(params, phase.index(), args.down, up_gate, ffn_out, ff, h, b);
            }
            FfnPhase::Fold => {
                // SAFETY: ffn_out and residual are complete after the barrier
                let residual = unsafe { workspace.f32_region(layout.residual) };
                let ffn_out = unsafe { workspace.f32_region(layout.ffn_out) };

                if let Some(output_norm) = args.output_norm_weight {
                    let (dst_norm, dst_residual) = dst.split_at(h * b);
                    post_attn_layernorm(
                        params,
                        Some(&residual[..]),
                        &ffn_out[..],
                        Some(output_norm),
                        None,
                        &dst_norm,
                        &dst_residual,
                        h,
                        b,
                        args.eps,
                    )?;
                } else {
                    // SAFETY: rows striped by thread index
                    let out = unsafe { dst.as_mut_slice() };
                    for row in (params.ith..b).step_by(params.nth) {
                        let base = row * h;
                        for i in base..base + h {
                            out[i] = residual[i] + ffn_out[i];
                        }
                    }
                }
            }
        }
        // no thread advances until every thread finished the phase
        params.arrive_and_wait();
    }

    Ok(())
}

/// Quantize `nrows` rows of `ne00` normalized floats to `Q8_0`, striping
/// block groups across threads
pub(crate) fn quantize_rows_striped(
    params: &ComputeParams<'_>,
    src: &[f32],
    dst: &mut [BlockQ8_0],
    ne00: usize,
    nrows: usize,
) {
    // 4 blocks per task when the row allows it, to amortize dispatch
    let group_blocks = if ne00 % (4 * QK) == 0 { 4 } else { 1 };
    let group_f32 = group_blocks * QK;
    let num_tasks = nrows * ne00 / group_f32;

    for task in (params.ith..num_tasks).step_by(params.nth) {
        let src_group = &src[task * group_f32..(task + 1) * group_f32];
        let dst_group = &mut dst[task * group_blocks..(task + 1) * group_blocks];
        quantize_row_q8_0(src_group, dst_group);
    }
}

/// Work-stealing driver of the SiLU-gated up·gate projection.
///
/// Output space is `(intermediate_size × batch_size)`; chunk heights are
/// aligned to 32 rows so each chunk owns whole `Q8_0` output blocks.
fn forward_up_gate(
    params: &ComputeParams<'_>,
    phase: usize,
    args: &CondFfnArgs<'_>,
    quant_input: &[BlockQ8_0],
    dst: &mut [BlockQ8_0],
) {
    let grid = ChunkGrid::with_row_align(
        args.intermediate_size,
        args.batch_size,
        QK,
        params.nth,
        QK,
    );
    let counter = params.counter(phase);

    while let Some(chunk) = grid.steal(counter) {
        if chunk.is_empty() {
            continue;
        }
        up_gate_one_chunk(args, quant_input, dst, &chunk);
    }
}

fn up_gate_one_chunk(
    args: &CondFfnArgs<'_>,
    quant_input: &[BlockQ8_0],
    dst: &mut [BlockQ8_0],
    chunk: &Chunk,
) {
    let n_embd = args.hidden_size;
    let n_ff = args.intermediate_size;
    let nb01 = row_size(QuantKind::Q4_0, n_embd);
    let in_blocks = n_embd / QK;
    let out_blocks = n_ff / QK;
    let mask_words = n_ff / 32;

    let mut tmp = [0.0f32; QK];

    for iir1 in chunk.i1.clone().step_by(TILE_1) {
        for iir0 in chunk.i0.clone().step_by(QK) {
            for ir1 in iir1..(iir1 + TILE_1).min(chunk.i1.end) {
                let src1 = &quant_input[ir1 * in_blocks..(ir1 + 1) * in_blocks];
                let mask_row = args.neuron_mask.map(|m| &m[ir1 * mask_words..]);

                // chunk rows are 32-aligned, so this whole group is in range
                for ir0 in iir0..iir0 + QK {
                    tmp[ir0 - iir0] = gated_element(args, src1, mask_row, ir0, nb01, n_embd);
                }

                let dst_block = ir1 * out_blocks + iir0 / QK;
                quantize_row_q8_0(&tmp, &mut dst[dst_block..dst_block + 1]);
            }
        }
    }
}

/// One SiLU-gated up·gate element with the short-circuit order: predictor
/// bit, then gate, then up
#[inline]
fn gated_element(
    args: &CondFfnArgs<'_>,
    src1: &[BlockQ8_0],
    mask_row: Option<&[u32]>,
    ir0: usize,
    nb01: usize,
    n_embd: usize,
) -> f32 {
    if let Some(mask) = mask_row {
        if mask[ir0 / 32] & (1 << (ir0 % 32)) == 0 {
            return 0.0;
        }
    }

    let gate_val = vec_dot_q4_0_q8_0(n_embd, &args.gate[ir0 * nb01..], src1);
    if gate_val <= 0.0 {
        return 0.0;
    }

    let up_val = vec_dot_q4_0_q8_0(n_embd, &args.up[ir0 * nb01..], src1);
    if up_val <= 0.0 {
        return 0.0;
    }

    silu(gate_val) * up_val
}

/// Work-stealing driver of the down projection: plain dots into f32 output
#[allow(clippy::too_many_arguments)]
pub(crate) fn forward_down(
    params: &ComputeParams<'_>,
    phase: usize,
    down: &[u8],
    up_gate: &[BlockQ8_0],
    dst: &mut [f32],
    n_ff: usize,
    n_embd: usize,
    batch_size: usize,
) {
    // small results get taller chunks so the grid still feeds every thread
    let chunk_size = if n_embd == 1 || batch_size == 1 { 64 } else { TILE_0 };
    let grid = ChunkGrid::new(n_embd, batch_size, chunk_size, params.nth);
    let counter = params.counter(phase);

    let nb01 = row_size(QuantKind::Q4_0, n_ff);
    let in_blocks = n_ff / QK;

    while let Some(chunk) = grid.steal(counter) {
        if chunk.is_empty() {
            continue;
        }
        for iir1 in chunk.i1.clone().step_by(TILE_1) {
            for iir0 in chunk.i0.clone().step_by(TILE_0) {
                for ir1 in iir1..(iir1 + TILE_1).min(chunk.i1.end) {
                    let src1 = &up_gate[ir1 * in_blocks..(ir1 + 1) * in_blocks];
                    let dst_row = ir1 * n_embd;
                    for ir0 in iir0..(iir0 + TILE_0).min(chunk.i0.end) {
                        dst[dst_row + ir0] =
                            vec_dot_q4_0_q8_0(n_ff, &down[ir0 * nb01..], src1);
                    }
                }
            }
        }
    }
}

pub(crate) fn check_len(what: &str, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(DespertarError::InvalidShape {
            reason: format!("{what} length {got} does not match expected {expected}"),
        });
    }
    Ok(())
}

pub(crate) fn check_min(what: &str, got: usize, expected: usize) -> Result<()> {
    if got < expected {
        return Err(DespertarError::InvalidShape {
            reason: format!("{what} length {got} is below required {expected}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silu_fixed_points() {
        assert_eq!(silu(0.0), 0.0);
        assert!((silu(1.0) - 1.0 / (1.0 + (-1.0f32).exp())).abs() < 1e-7);
        // large positive saturates to identity, large negative to zero
        assert!((silu(20.0) - 20.0).abs() < 1e-3);
        assert!(silu(-20.0).abs() < 1e-3);
    }
}
