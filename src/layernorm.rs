//! Fused residual-add + RMSNorm.
//!
//! Every row costs the same, so rows are striped across threads by simple
//! modulo (`ith`, `ith + nth`, ...) instead of the work-stealing grid the
//! sparse projections use.

use crate::error::{DespertarError, Result};
use crate::parallel::{ComputeParams, SharedOut};

/// Residual-add and RMS-normalize `nrows` rows of `ne00` values.
///
/// Per row: `residual = input (+ residual_in)`, then
/// `normed = residual / sqrt(mean(residual²) + eps)`, optionally multiplied
/// by a per-column `weight` and offset by a per-column `bias`. The residual
/// stream is written to `dst_residual` and the normalized row to `dst_norm`.
///
/// `residual_in` is absent when there is no incoming residual to fold in
/// (the row is normalized as-is).
///
/// All `nth` threads call this with the same arguments; each writes only its
/// own rows, so no barrier is needed inside. Callers that read the outputs
/// from other threads' rows must barrier first.
///
/// # Errors
/// Returns [`DespertarError::InvalidShape`] when a buffer length does not
/// match `ne00 * nrows` (or `ne00` for `weight`/`bias`).
#[allow(clippy::too_many_arguments)]
pub fn post_attn_layernorm(
    params: &ComputeParams<'_>,
    residual_in: Option<&[f32]>,
    input: &[f32],
    weight: Option<&[f32]>,
    bias: Option<&[f32]>,
    dst_norm: &SharedOut<'_, f32>,
    dst_residual: &SharedOut<'_, f32>,
    ne00: usize,
    nrows: usize,
    eps: f32,
) -> Result<()> {
    let total = ne00 * nrows;
    check_len("input", input.len(), total)?;
    check_len("dst_norm", dst_norm.len(), total)?;
    check_len("dst_residual", dst_residual.len(), total)?;
    if let Some(r) = residual_in {
        check_len("residual_in", r.len(), total)?;
    }
    if let Some(w) = weight {
        check_len("weight", w.len(), ne00)?;
    }
    if let Some(b) = bias {
        check_len("bias", b.len(), ne00)?;
    }

    // SAFETY: rows are striped by thread index, so writes are disjoint;
    // cross-thread reads happen only after the caller's next barrier.
    let norm_out = unsafe { dst_norm.as_mut_slice() };
    let residual_out = unsafe { dst_residual.as_mut_slice() };

    for i01 in (params.ith..nrows).step_by(params.nth) {
        let row = i01 * ne00;
        let input_row = &input[row..row + ne00];
        let residual = &mut residual_out[row..row + ne00];

        match residual_in {
            Some(prev) => {
                for ((r, &x), &p) in residual.iter_mut().zip(input_row).zip(&prev[row..row + ne00])
                {
                    *r = x + p;
                }
            }
            None => residual.copy_from_slice(input_row),
        }

        let sum: f32 = residual.iter().map(|&v| v * v).sum();
        let mean = sum / ne00 as f32;
        let scale = 1.0 / (mean + eps).sqrt();

        let y = &mut norm_out[row..row + ne00];
        for (o, &r) in y.iter_mut().zip(residual.iter()) {
            *o = r * scale;
        }
        if let Some(w) = weight {
            for (o, &wv) in y.iter_mut().zip(w.iter()) {
                *o *= wv;
            }
        }
        if let Some(b) = bias {
            for (o, &bv) in y.iter_mut().zip(b.iter()) {
                *o += bv;
            }
        }
    }

    Ok(())
}

fn check_len(what: &str, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(DespertarError::InvalidShape {
            reason: format!("{what} length {got} does not match expected {expected}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::CounterPool;
    use std::sync::Barrier;

    fn run_norm(
        residual_in: Option<&[f32]>,
        input: &[f32],
        weight: Option<&[f32]>,
        bias: Option<&[f32]>,
        ne00: usize,
        nrows: usize,
        eps: f32,
    ) -> (Vec<f32>, Vec<f32>) {
        let barrier = Barrier::new(1);
        let pool = CounterPool::new();
        let params = ComputeParams::new(0, 1, &barrier, &pool);

        let mut norm = vec![0.0f32; ne00 * nrows];
        let mut residual = vec![0.0f32; ne00 * nrows];
        {
            let norm_out = SharedOut::new(&mut norm);
            let residual_out = SharedOut::new(&mut residual);
            post_attn_layernorm(
                &params,
                residual_in,
                input,
                weight,
                bias,
                &norm_out,
                &residual_out,
                ne00,
                nrows,
                eps,
            )
            .unwrap();
        }
        (norm, residual)
    }

    #[test]
    fn test_unit_row_normalizes_to_unit_rms() {
        let input = vec![3.0f32; 8];
        let (norm, residual) = run_norm(None, &input, None, None, 8, 1, 0.0);
        assert_eq!(residual, input);
        for v in norm {
            assert!((v - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_residual_folded_before_norm() {
        let input = vec![1.0f32, 2.0, 3.0, 4.0];
        let prev = vec![1.0f32, 0.0, -1.0, 0.0];
        let (norm, residual) = run_norm(Some(&prev), &input, None, None, 4, 1, 1e-5);

        let expected_res = [2.0f32, 2.0, 2.0, 4.0];
        assert_eq!(residual, expected_res);

        let mean = expected_res.iter().map(|v| v * v).sum::<f32>() / 4.0;
        let scale = 1.0 / (mean + 1e-5).sqrt();
        for (n, r) in norm.iter().zip(expected_res.iter()) {
            assert!((n - r * scale).abs() < 1e-6);
        }
    }

    #[test]
    fn test_weight_and_bias_applied_per_column() {
        let input = vec![2.0f32; 4];
        let weight = vec![1.0f32, 2.0, 3.0, 4.0];
        let bias = vec![0.5f32; 4];
        let (norm, _) = run_norm(None, &input, Some(&weight), Some(&bias), 4, 1, 0.0);
        for (i, v) in norm.iter().enumerate() {
            let expected = 1.0 * weight[i] + 0.5;
            assert!((v - expected).abs() < 1e-6, "{v} vs {expected}");
        }
    }

    #[test]
    fn test_rejects_mismatched_input() {
        let barrier = Barrier::new(1);
        let pool = CounterPool::new();
        let params = ComputeParams::new(0, 1, &barrier, &pool);
        let mut norm = vec![0.0f32; 8];
        let mut residual = vec![0.0f32; 8];
        let norm_out = SharedOut::new(&mut norm);
        let residual_out = SharedOut::new(&mut residual);
        let err = post_attn_layernorm(
            &params,
            None,
            &[0.0; 7],
            None,
            None,
            &norm_out,
            &residual_out,
            8,
            1,
            1e-5,
        )
        .unwrap_err();
        assert!(matches!(err, DespertarError::InvalidShape { .. }));
    }
}
