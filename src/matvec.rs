//! Dense `Q4_0` matrix-vector product for callers without a thread pool.
//!
//! Quantizes the activation vector to `Q8_0` once, then runs one dot product
//! per output row, parallelized with rayon above an adaptive row-count
//! threshold (rayon's scheduling overhead dominates small matrices). The
//! barrier-phase forward passes never use this path.

use rayon::prelude::*;

use crate::error::{DespertarError, Result};
use crate::quantize::codec::quantize_row_q8_0;
use crate::quantize::dot::vec_dot_q4_0_q8_0;
use crate::quantize::types::{row_size, BlockQ8_0, QuantKind, QK};

/// Rows below this run sequentially
const PARALLEL_THRESHOLD: usize = 1024;
/// Minimum rows per rayon task, to keep scheduling overhead down
const CHUNK_SIZE: usize = 64;

/// Dense `weight · activations` into a fresh vector.
///
/// `weight` holds `out_dim` `Q4_0` rows of `in_dim` values.
///
/// # Errors
/// Returns [`DespertarError::InvalidShape`] when the weight buffer is too
/// small for `out_dim × in_dim` or the activation length is not `in_dim`.
pub fn q4_0_matvec(
    weight: &[u8],
    activations: &[f32],
    in_dim: usize,
    out_dim: usize,
) -> Result<Vec<f32>> {
    let mut output = vec![0.0f32; out_dim];
    q4_0_matvec_into(weight, activations, in_dim, &mut output)?;
    Ok(output)
}

/// Zero-allocation variant of [`q4_0_matvec`]: writes one value per element
/// of `output`.
///
/// # Errors
/// Returns [`DespertarError::InvalidShape`] under the same conditions as
/// [`q4_0_matvec`], with `out_dim` taken from `output.len()`.
pub fn q4_0_matvec_into(
    weight: &[u8],
    activations: &[f32],
    in_dim: usize,
    output: &mut [f32],
) -> Result<()> {
    let out_dim = output.len();

    if in_dim == 0 || in_dim % QK != 0 {
        return Err(DespertarError::InvalidShape {
            reason: format!("input dimension {in_dim} is not a multiple of {QK}"),
        });
    }
    let bytes_per_row = row_size(QuantKind::Q4_0, in_dim);
    if weight.len() < out_dim * bytes_per_row {
        return Err(DespertarError::InvalidShape {
            reason: format!(
                "Q4_0 weight data too small: need {} bytes for {out_dim}x{in_dim}, have {}",
                out_dim * bytes_per_row,
                weight.len()
            ),
        });
    }
    if activations.len() != in_dim {
        return Err(DespertarError::InvalidShape {
            reason: format!(
                "activation length {} does not match input dimension {in_dim}",
                activations.len()
            ),
        });
    }

    // quantize once, amortized over all rows
    let mut quantized = vec![BlockQ8_0::default(); in_dim / QK];
    quantize_row_q8_0(activations, &mut quantized);

    let dot_row = |o: usize| {
        let row = &weight[o * bytes_per_row..(o + 1) * bytes_per_row];
        vec_dot_q4_0_q8_0(in_dim, row, &quantized)
    };

    if out_dim < PARALLEL_THRESHOLD {
        for (o, out) in output.iter_mut().enumerate() {
            *out = dot_row(o);
        }
        return Ok(());
    }

    output
        .par_iter_mut()
        .with_min_len(CHUNK_SIZE)
        .enumerate()
        .for_each(|(o, out)| {
            *out = dot_row(o);
        });

    Ok(())
}
