//! Rotary position embedding over a precomputed cos/sin cache.
//!
//! The cache holds `rotary_dim` floats per absolute position, interleaved
//! `[cos0, sin0, cos1, sin1, ...]`, one cos/sin pair per rotated lane. Two
//! lane layouts are supported: `Paired` rotates `(x[2i], x[2i+1])` and
//! `Neox` rotates split halves `(x[i], x[rotary_dim/2 + i])`.
//!
//! Work is split per token by flattening the `(head × rotary_dim/2)` index
//! space and dividing it evenly across threads; rotation cost is uniform, so
//! no work stealing.

use crate::error::{DespertarError, Result};
use crate::parallel::{ComputeParams, SharedOut};

/// Lane layout of the rotated pairs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RopeLayout {
    /// Adjacent lanes rotate together: `(x[2i], x[2i+1])`
    Paired,
    /// Split halves rotate together: `(x[i], x[rotary_dim/2 + i])`
    Neox,
}

/// Dimensions and shared inputs of one rotary-embedding call
#[derive(Debug, Clone, Copy)]
pub struct RopeArgs<'a> {
    /// Cos/sin cache: `rotary_dim` floats per absolute position
    pub cache: &'a [f32],
    /// Absolute position of each token in the batch
    pub positions: &'a [i32],
    /// Lane layout
    pub layout: RopeLayout,
    /// Query heads per token
    pub num_head_q: usize,
    /// Key heads per token
    pub num_head_kv: usize,
    /// Values per head
    pub head_dim: usize,
    /// Rotated values per head; the remaining `head_dim - rotary_dim` lanes
    /// pass through unchanged
    pub rotary_dim: usize,
}

/// Rotate query and key heads in place of their destination buffers.
///
/// All `nth` threads call this with the same arguments; each writes a
/// disjoint share of the `(head × rotary_dim/2)` index space per token.
///
/// # Errors
/// Returns [`DespertarError::InvalidShape`] when buffer lengths do not match
/// the dimensions or a position falls outside the cache.
///
/// # Panics
/// `rotary_dim` must be even and no larger than `head_dim`.
pub fn rotary_embedding_f32(
    params: &ComputeParams<'_>,
    args: &RopeArgs<'_>,
    query: &[f32],
    key: &[f32],
    dst_q: &SharedOut<'_, f32>,
    dst_k: &SharedOut<'_, f32>,
) -> Result<()> {
    let RopeArgs {
        cache,
        positions,
        layout,
        num_head_q,
        num_head_kv,
        head_dim,
        rotary_dim,
    } = *args;

    assert!(rotary_dim % 2 == 0, "rotary dim {rotary_dim} must be even");
    assert!(rotary_dim <= head_dim, "rotary dim exceeds head dim");

    let num_tokens = positions.len();
    check_len("query", query.len(), num_tokens * num_head_q * head_dim)?;
    check_len("key", key.len(), num_tokens * num_head_kv * head_dim)?;
    check_len("dst_q", dst_q.len(), query.len())?;
    check_len("dst_k", dst_k.len(), key.len())?;

    for &pos in positions {
        let pos = usize::try_from(pos).map_err(|_| DespertarError::InvalidShape {
            reason: format!("negative token position {pos}"),
        })?;
        if (pos + 1) * rotary_dim > cache.len() {
            return Err(DespertarError::InvalidShape {
                reason: format!("position {pos} outside the rope cache"),
            });
        }
    }

    // SAFETY: each thread writes a disjoint slice of the flattened index
    // space; the caller barriers before reading across threads.
    let q_out = unsafe { dst_q.as_mut_slice() };
    let k_out = unsafe { dst_k.as_mut_slice() };

    for (token, &pos) in positions.iter().enumerate() {
        let cache_row = &cache[pos as usize * rotary_dim..(pos as usize + 1) * rotary_dim];

        rotate_heads(
            params, layout, cache_row, query, q_out, token, num_head_q, head_dim, rotary_dim,
        );
        rotate_heads(
            params, layout, cache_row, key, k_out, token, num_head_kv, head_dim, rotary_dim,
        );
    }

    Ok(())
}

/// Rotate one token's heads, splitting the flattened pair index space
/// evenly across threads
#[allow(clippy::too_many_arguments)]
fn rotate_heads(
    params: &ComputeParams<'_>,
    layout: RopeLayout,
    cache_row: &[f32],
    src: &[f32],
    dst: &mut [f32],
    token: usize,
    num_head: usize,
    head_dim: usize,
    rotary_dim: usize,
) {
    let embed_dim = rotary_dim / 2;
    let n = num_head * embed_dim;
    let per_thread = n.div_ceil(params.nth);
    let begin = (per_thread * params.ith).min(n);
    let end = (begin + per_thread).min(n);

    for i in begin..end {
        let head = i / embed_dim;
        let rot = i % embed_dim;
        let base = (token * num_head + head) * head_dim;

        let cos = cache_row[rot * 2];
        let sin = cache_row[rot * 2 + 1];

        let (xi, yi) = match layout {
            RopeLayout::Paired => (base + rot * 2, base + rot * 2 + 1),
            RopeLayout::Neox => (base + rot, base + embed_dim + rot),
        };

        let x = src[xi];
        let y = src[yi];
        dst[xi] = x * cos - y * sin;
        dst[yi] = y * cos + x * sin;
    }

    // non-rotated tail lanes pass through
    let tail = head_dim - rotary_dim;
    if tail > 0 {
        let nt = num_head * tail;
        let per_thread = nt.div_ceil(params.nth);
        let begin = (per_thread * params.ith).min(nt);
        let end = (begin + per_thread).min(nt);
        for i in begin..end {
            let head = i / tail;
            let lane = rotary_dim + i % tail;
            let idx = (token * num_head + head) * head_dim + lane;
            dst[idx] = src[idx];
        }
    }
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

    /// cos/sin cache for positions 0..max_pos with the usual 10000 base
    fn build_cache(max_pos: usize, rotary_dim: usize) -> Vec<f32> {
        let mut cache = vec![0.0f32; max_pos * rotary_dim];
        for pos in 0..max_pos {
            for i in 0..rotary_dim / 2 {
                let theta = pos as f32 / 10000f32.powf(2.0 * i as f32 / rotary_dim as f32);
                cache[pos * rotary_dim + 2 * i] = theta.cos();
                cache[pos * rotary_dim + 2 * i + 1] = theta.sin();
            }
        }
        cache
    }

    fn run_rope(
        layout: RopeLayout,
        positions: &[i32],
        query: &[f32],
        key: &[f32],
        num_head_q: usize,
        num_head_kv: usize,
        head_dim: usize,
        rotary_dim: usize,
    ) -> (Vec<f32>, Vec<f32>) {
        let cache = build_cache(16, rotary_dim);
        let barrier = Barrier::new(1);
        let pool = CounterPool::new();
        let params = ComputeParams::new(0, 1, &barrier, &pool);

        let mut q = vec![0.0f32; query.len()];
        let mut k = vec![0.0f32; key.len()];
        {
            let dst_q = SharedOut::new(&mut q);
            let dst_k = SharedOut::new(&mut k);
            let args = RopeArgs {
                cache: &cache,
                positions,
                layout,
                num_head_q,
                num_head_kv,
                head_dim,
                rotary_dim,
            };
            rotary_embedding_f32(&params, &args, query, key, &dst_q, &dst_k).unwrap();
        }
        (q, k)
    }

    #[test]
    fn test_position_zero_is_identity() {
        let query: Vec<f32> = (0..8).map(|i| i as f32).collect();
        let key: Vec<f32> = (0..8).map(|i| (i as f32) * 0.5).collect();
        let (q, k) = run_rope(RopeLayout::Paired, &[0], &query, &key, 1, 1, 8, 8);
        assert_eq!(q, query);
        assert_eq!(k, key);
    }

    #[test]
    fn test_paired_rotation_matches_reference() {
        let head_dim = 4;
        let query = vec![1.0f32, 0.0, 0.0, 1.0];
        let key = vec![0.0f32; 4];
        let (q, _) = run_rope(RopeLayout::Paired, &[3], &query, &key, 1, 1, head_dim, head_dim);

        let theta0 = 3.0f32;
        let theta1 = 3.0 / 10000f32.powf(2.0 / 4.0);
        assert!((q[0] - theta0.cos()).abs() < 1e-5);
        assert!((q[1] - theta0.sin()).abs() < 1e-5);
        assert!((q[2] - -theta1.sin()).abs() < 1e-5);
        assert!((q[3] - theta1.cos()).abs() < 1e-5);
    }

    #[test]
    fn test_neox_rotates_split_halves() {
        let head_dim = 4;
        // lanes 0/2 and 1/3 pair up under the neox layout
        let query = vec![1.0f32, 2.0, 0.0, 0.0];
        let key = vec![0.0f32; 4];
        let (q, _) = run_rope(RopeLayout::Neox, &[5], &query, &key, 1, 1, head_dim, head_dim);

        let theta0 = 5.0f32;
        let theta1 = 5.0 / 10000f32.powf(2.0 / 4.0);
        assert!((q[0] - theta0.cos()).abs() < 1e-5);
        assert!((q[2] - theta0.sin()).abs() < 1e-5);
        assert!((q[1] - 2.0 * theta1.cos()).abs() < 1e-5);
        assert!((q[3] - 2.0 * theta1.sin()).abs() < 1e-5);
    }

    #[test]
    fn test_rotation_preserves_pair_norm() {
        let head_dim = 8;
        let query: Vec<f32> = (0..16).map(|i| (i as f32) - 7.5).collect();
        let key: Vec<f32> = (0..16).map(|i| (i as f32) * 0.25).collect();
        let (q, k) = run_rope(RopeLayout::Paired, &[7, 11], &query, &key, 1, 1, head_dim, head_dim);

        for (src, dst) in [(&query, &q), (&key, &k)] {
            for pair in 0..src.len() / 2 {
                let before = src[2 * pair].hypot(src[2 * pair + 1]);
                let after = dst[2 * pair].hypot(dst[2 * pair + 1]);
                assert!((before - after).abs() < 1e-4, "pair {pair}: {before} vs {after}");
            }
        }
    }

    #[test]
    fn test_partial_rotary_dim_passes_tail_through() {
        let head_dim = 8;
        let rotary_dim = 4;
        let query: Vec<f32> = (0..8).map(|i| i as f32 + 1.0).collect();
        let key = query.clone();
        let (q, _) = run_rope(RopeLayout::Paired, &[2], &query, &key, 1, 1, head_dim, rotary_dim);
        assert_eq!(&q[rotary_dim..], &query[rotary_dim..]);
        assert!((q[0] - query[0]).abs() > 1e-3, "rotated lanes must change");
    }

    #[test]
    fn test_rejects_position_outside_cache() {
        let cache = build_cache(4, 4);
        let barrier = Barrier::new(1);
        let pool = CounterPool::new();
        let params = ComputeParams::new(0, 1, &barrier, &pool);
        let query = vec![0.0f32; 4];
        let key = vec![0.0f32; 4];
        let mut q = vec![0.0f32; 4];
        let mut k = vec![0.0f32; 4];
        let dst_q = SharedOut::new(&mut q);
        let dst_k = SharedOut::new(&mut k);
        let args = RopeArgs {
            cache: &cache,
            positions: &[4],
            layout: RopeLayout::Paired,
            num_head_q: 1,
            num_head_kv: 1,
            head_dim: 4,
            rotary_dim: 4,
        };
        let err = rotary_embedding_f32(&params, &args, &query, &key, &dst_q, &dst_k).unwrap_err();
        assert!(matches!(err, DespertarError::InvalidShape { .. }));
    }
}
