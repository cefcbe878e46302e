//! Sparse mixture-of-experts forward pass.
//!
//! Same five-phase pipeline as the conditional FFN, with the projections
//! routed through per-token expert selections. An external router writes
//! `n_expert_used` expert indices per token; the up·gate driver spans
//! `intermediate_size * n_expert_used` output rows per token, decomposing
//! each row index into a router slot and the row within that expert, and the
//! down driver sums the contributions of every active expert per output
//! element.
//!
//! Expert weights are expert-blocked: expert `e`'s up/gate rows start at
//! `e * intermediate_size` rows into the buffer, and its down block at
//! `e * hidden_size` rows.

use crate::error::Result;
use crate::ffn::{check_len, check_min, quantize_rows_striped, silu, FfnPhase, TILE_1};
use crate::layernorm::post_attn_layernorm;
use crate::parallel::{Chunk, ChunkGrid, ComputeParams, SharedOut};
use crate::quantize::codec::quantize_row_q8_0;
use crate::quantize::dot::vec_dot_q4_0_q8_0;
use crate::quantize::types::{row_size, BlockQ8_0, QuantKind, QK};
use crate::workspace::{MoeFfnLayout, Workspace};

/// Weights, router output and dimensions of one MoE forward call
#[derive(Debug, Clone, Copy)]
pub struct MoeFfnArgs<'a> {
    /// RMSNorm weight applied before the projections, `hidden_size` values
    pub ffn_norm_weight: &'a [f32],
    /// Up-projection weights, expert-blocked `Q4_0` rows:
    /// `n_expert * intermediate_size` rows of `hidden_size` values
    pub up: &'a [u8],
    /// Gate-projection weights, same layout as `up`
    pub gate: &'a [u8],
    /// Down-projection weights, expert-blocked `Q4_0` rows:
    /// `n_expert * hidden_size` rows of `intermediate_size` values
    pub down: &'a [u8],
    /// Router output: `n_expert_used` expert indices per token, read-only
    pub router: &'a [i32],
    /// Attention-block input folded into the residual stream before the norm
    pub residual_in: Option<&'a [f32]>,
    /// When present this is the final layer segment; `dst` receives
    /// `[normed | residual]` as in the conditional FFN
    pub output_norm_weight: Option<&'a [f32]>,
    /// Input activations, `hidden_size * batch_size` values
    pub input: &'a [f32],
    /// Model hidden size
    pub hidden_size: usize,
    /// Intermediate size of a single expert
    pub intermediate_size: usize,
    /// Experts in the weight buffers
    pub n_expert: usize,
    /// Experts each token is routed to
    pub n_expert_used: usize,
    /// Tokens in the batch
    pub batch_size: usize,
    /// RMSNorm epsilon
    pub eps: f32,
}

impl MoeFfnArgs<'_> {
    fn check_shapes(&self, dst_len: usize) -> Result<()> {
        let h = self.hidden_size;
        let ff = self.intermediate_size;
        let b = self.batch_size;
        assert!(h % QK == 0, "hidden size {h} is not a multiple of {QK}");
        assert!(ff % QK == 0, "intermediate size {ff} is not a multiple of {QK}");
        assert!(
            self.n_expert > 0 && self.n_expert_used > 0 && self.n_expert_used <= self.n_expert,
            "invalid expert counts"
        );

        check_len("input", self.input.len(), h * b)?;
        check_len("ffn_norm_weight", self.ffn_norm_weight.len(), h)?;
        check_len("router", self.router.len(), b * self.n_expert_used)?;
        let up_gate_rows = self.n_expert * ff;
        check_min("up", self.up.len(), up_gate_rows * row_size(QuantKind::Q4_0, h))?;
        check_min("gate", self.gate.len(), up_gate_rows * row_size(QuantKind::Q4_0, h))?;
        check_min(
            "down",
            self.down.len(),
            self.n_expert * h * row_size(QuantKind::Q4_0, ff),
        )?;
        if let Some(r) = self.residual_in {
            check_len("residual_in", r.len(), h * b)?;
        }
        if let Some(w) = self.output_norm_weight {
            check_len("output_norm_weight", w.len(), h)?;
        }
        for (i, &e) in self.router.iter().enumerate() {
            assert!(
                e >= 0 && (e as usize) < self.n_expert,
                "router slot {i} selects expert {e} of {}",
                self.n_expert
            );
        }
        let expected_dst = if self.output_norm_weight.is_some() {
            2 * h * b
        } else {
            h * b
        };
        check_len("dst", dst_len, expected_dst)
    }
}

/// Sparse-MoE forward pass, `Q4_0` expert weights over f32 activations.
///
/// Every thread of the pool calls this with the same arguments; phases are
/// synchronized internally, and the workspace is validated before anything
/// is written.
///
/// # Errors
/// [`crate::DespertarError::ComputeBufferTooSmall`] when the workspace is
/// undersized; [`crate::DespertarError::InvalidShape`] on mismatched buffer
/// lengths.
pub fn ffn_moe_sparse_q4_0_f32(
    params: &ComputeParams<'_>,
    args: &MoeFfnArgs<'_>,
    workspace: &Workspace,
    dst: &SharedOut<'_, f32>,
) -> Result<()> {
    let h = args.hidden_size;
    let ff = args.intermediate_size;
    let b = args.batch_size;

    args.check_shapes(dst.len())?;
    let layout = MoeFfnLayout::new(h, ff, args.n_expert_used, b);
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
                // SAFETY: norm is complete after the barrier; striped writes
                let norm = unsafe { workspace.f32_region(layout.norm) };
                let quant = unsafe { workspace.q8_region(layout.quant_input) };
                quantize_rows_striped(params, norm, quant, h, b);
            }
            FfnPhase::UpGate => {
                // SAFETY: quant_input complete after the barrier;
                // block-aligned exclusive chunks
                let quant = unsafe { workspace.q8_region(layout.quant_input) };
                let up_gate = unsafe { workspace.q8_region(layout.up_gate) };
                forward_up_gate_moe(params, phase.index(), args, quant, up_gate);
            }
            FfnPhase::Down => {
                // SAFETY: up_gate complete after the barrier; exclusive chunks
                let up_gate = unsafe { workspace.q8_region(layout.up_gate) };
                let ffn_out = unsafe { workspace.f32_region(layout.ffn_out) };
                forward_down_moe(params, phase.index(), args, up_gate, ffn_out);
            }
            FfnPhase::Fold => {
                // SAFETY: ffn_out and residual complete after the barrier
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

/// Work-stealing driver of the routed up·gate projection.
///
/// The output row space is `intermediate_size * n_expert_used` per token:
/// row `ir0` maps to router slot `ir0 / intermediate_size` and row
/// `ir0 % intermediate_size` of the expert that slot selected.
fn forward_up_gate_moe(
    params: &ComputeParams<'_>,
    phase: usize,
    args: &MoeFfnArgs<'_>,
    quant_input: &[BlockQ8_0],
    dst: &mut [BlockQ8_0],
) {
    let nr0 = args.intermediate_size * args.n_expert_used;
    let grid = ChunkGrid::with_row_align(nr0, args.batch_size, QK, params.nth, QK);
    let counter = params.counter(phase);

    while let Some(chunk) = grid.steal(counter) {
        if chunk.is_empty() {
            continue;
        }
        up_gate_moe_one_chunk(args, quant_input, dst, &chunk);
    }
}

fn up_gate_moe_one_chunk(
    args: &MoeFfnArgs<'_>,
    quant_input: &[BlockQ8_0],
    dst: &mut [BlockQ8_0],
    chunk: &Chunk,
) {
    let n_embd = args.hidden_size;
    let n_ff = args.intermediate_size;
    let nb01 = row_size(QuantKind::Q4_0, n_embd);
    let in_blocks = n_embd / QK;
    let out_blocks = n_ff * args.n_expert_used / QK;

    let mut tmp = [0.0f32; QK];

    for iir1 in chunk.i1.clone().step_by(TILE_1) {
        for iir0 in chunk.i0.clone().step_by(QK) {
            for ir1 in iir1..(iir1 + TILE_1).min(chunk.i1.end) {
                let src1 = &quant_input[ir1 * in_blocks..(ir1 + 1) * in_blocks];
                let router_row = &args.router[ir1 * args.n_expert_used..];

                for ir0 in iir0..iir0 + QK {
                    let slot = ir0 / n_ff;
                    let inner = ir0 % n_ff;
                    let expert = router_row[slot] as usize;
                    let row = expert * n_ff + inner;

                    let gate_val = vec_dot_q4_0_q8_0(n_embd, &args.gate[row * nb01..], src1);
                    if gate_val <= 0.0 {
                        tmp[ir0 - iir0] = 0.0;
                        continue;
                    }

                    let up_val = vec_dot_q4_0_q8_0(n_embd, &args.up[row * nb01..], src1);
                    if up_val <= 0.0 {
                        tmp[ir0 - iir0] = 0.0;
                        continue;
                    }

                    tmp[ir0 - iir0] = silu(gate_val) * up_val;
                }

                let dst_block = ir1 * out_blocks + iir0 / QK;
                quantize_row_q8_0(&tmp, &mut dst[dst_block..dst_block + 1]);
            }
        }
    }
}

/// Work-stealing driver of the routed down projection: each output element
/// sums the down dots of every expert the token was routed to
fn forward_down_moe(
    params: &ComputeParams<'_>,
    phase: usize,
    args: &MoeFfnArgs<'_>,
    up_gate: &[BlockQ8_0],
    dst: &mut [f32],
) {
    let n_embd = args.hidden_size;
    let n_ff = args.intermediate_size;
    let b = args.batch_size;

    let chunk_size = if n_embd == 1 || b == 1 { 64 } else { 16 };
    let grid = ChunkGrid::new(n_embd, b, chunk_size, params.nth);
    let counter = params.counter(phase);

    let expert_row = row_size(QuantKind::Q4_0, n_ff);
    let expert_bytes = expert_row * n_embd;
    let slot_blocks = n_ff / QK;
    let in_blocks = slot_blocks * args.n_expert_used;

    while let Some(chunk) = grid.steal(counter) {
        if chunk.is_empty() {
            continue;
        }
        for iir1 in chunk.i1.clone().step_by(TILE_1) {
            for iir0 in chunk.i0.clone().step_by(16) {
                for ir1 in iir1..(iir1 + TILE_1).min(chunk.i1.end) {
                    let token_blocks = &up_gate[ir1 * in_blocks..(ir1 + 1) * in_blocks];
                    let router_row = &args.router[ir1 * args.n_expert_used..];
                    let dst_row = ir1 * n_embd;

                    for ir0 in iir0..(iir0 + 16).min(chunk.i0.end) {
                        let mut acc = 0.0f32;
                        for (slot, &expert) in
                            router_row[..args.n_expert_used].iter().enumerate()
                        {
                            let weight_off = expert as usize * expert_bytes + ir0 * expert_row;
                            let src1 = &token_blocks[slot * slot_blocks..(slot + 1) * slot_blocks];
                            acc += vec_dot_q4_0_q8_0(n_ff, &args.down[weight_off..], src1);
                        }
                        dst[dst_row + ir0] = acc;
                    }
                }
            }
        }
    }
}
