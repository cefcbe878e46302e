//! End-to-end sparse-MoE forward tests
//!
//! Multi-threaded kernel runs against a naive single-threaded reference that
//! mirrors the router decomposition and quantization round trips.

use std::sync::Barrier;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use despertar::parallel::{ComputeParams, CounterPool, SharedOut};
use despertar::quantize::{
    dequantize_row_q4_0, dequantize_row_q8_0, q4_0_rows_as_bytes, quantize_row_q4_0,
    quantize_row_q8_0, BlockQ4_0, BlockQ8_0,
};
use despertar::workspace::{MoeFfnLayout, Workspace};
use despertar::{ffn_moe_sparse_q4_0_f32, MoeFfnArgs, Result};

const HIDDEN: usize = 128;
const N_FF: usize = 64;
const N_EXPERT: usize = 4;
const N_USED: usize = 2;
const BATCH: usize = 3;
const EPS: f32 = 1e-5;

// ============================================================================
// Helpers
// ============================================================================

fn q4_matrix(rows: &[Vec<f32>]) -> (Vec<u8>, Vec<Vec<f32>>) {
    let mut bytes = Vec::new();
    let mut dequant = Vec::new();
    for row in rows {
        let mut blocks = vec![BlockQ4_0::default(); row.len() / 32];
        quantize_row_q4_0(row, &mut blocks);
        bytes.extend_from_slice(q4_0_rows_as_bytes(&blocks));
        let mut back = vec![0.0f32; row.len()];
        dequantize_row_q4_0(&blocks, &mut back);
        dequant.push(back);
    }
    (bytes, dequant)
}

fn q8_roundtrip(values: &[f32]) -> Vec<f32> {
    let mut blocks = vec![BlockQ8_0::default(); values.len() / 32];
    quantize_row_q8_0(values, &mut blocks);
    let mut back = vec![0.0f32; values.len()];
    dequantize_row_q8_0(&blocks, &mut back);
    back
}

fn rmsnorm(row: &[f32], weight: &[f32], eps: f32) -> Vec<f32> {
    let mean = row.iter().map(|v| v * v).sum::<f32>() / row.len() as f32;
    let scale = 1.0 / (mean + eps).sqrt();
    row.iter().zip(weight).map(|(&v, &w)| v * scale * w).collect()
}

fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(&x, &y)| x * y).sum()
}

fn random_matrix(rng: &mut StdRng, rows: usize, cols: usize, scale: f32) -> Vec<Vec<f32>> {
    (0..rows)
        .map(|_| (0..cols).map(|_| rng.gen_range(-scale..scale)).collect())
        .collect()
}

fn run_moe(args: &MoeFfnArgs<'_>, nth: usize, dst_len: usize) -> Result<Vec<f32>> {
    let layout = MoeFfnLayout::new(
        args.hidden_size,
        args.intermediate_size,
        args.n_expert_used,
        args.batch_size,
    );
    let workspace = Workspace::with_capacity(layout.required_bytes());
    let barrier = Barrier::new(nth);
    let pool = CounterPool::new();
    let mut dst = vec![f32::NAN; dst_len];

    let results = {
        let out = SharedOut::new(&mut dst);
        let out = &out;
        let barrier = &barrier;
        let pool = &pool;
        let workspace = &workspace;

        std::thread::scope(|s| {
            let handles: Vec<_> = (0..nth)
                .map(|ith| {
                    s.spawn(move || {
                        let params = ComputeParams::new(ith, nth, barrier, pool);
                        ffn_moe_sparse_q4_0_f32(&params, args, workspace, out)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("worker panicked"))
                .collect::<Vec<Result<()>>>()
        })
    };

    for r in results {
        r?;
    }
    Ok(dst)
}

/// Single-threaded reference with the same router decomposition
#[allow(clippy::too_many_arguments)]
fn reference_moe(
    input: &[f32],
    residual_in: Option<&[f32]>,
    ffn_norm: &[f32],
    up_rows: &[Vec<f32>],
    gate_rows: &[Vec<f32>],
    down_rows: &[Vec<f32>],
    router: &[i32],
) -> Vec<f32> {
    let mut residual = vec![0.0f32; HIDDEN * BATCH];
    for i in 0..HIDDEN * BATCH {
        residual[i] = input[i] + residual_in.map_or(0.0, |r| r[i]);
    }

    let mut dst = vec![0.0f32; HIDDEN * BATCH];
    for t in 0..BATCH {
        let res_row = &residual[t * HIDDEN..(t + 1) * HIDDEN];
        let normed = q8_roundtrip(&rmsnorm(res_row, ffn_norm, EPS));
        let router_row = &router[t * N_USED..(t + 1) * N_USED];

        let mut up_gate = vec![0.0f32; N_FF * N_USED];
        for (slot, &expert) in router_row.iter().enumerate() {
            for r in 0..N_FF {
                let weight_row = expert as usize * N_FF + r;
                let gate_val = dot(&gate_rows[weight_row], &normed);
                if gate_val <= 0.0 {
                    continue;
                }
                let up_val = dot(&up_rows[weight_row], &normed);
                if up_val <= 0.0 {
                    continue;
                }
                up_gate[slot * N_FF + r] = silu(gate_val) * up_val;
            }
        }
        let up_gate = q8_roundtrip(&up_gate);

        for o in 0..HIDDEN {
            let mut acc = 0.0f32;
            for (slot, &expert) in router_row.iter().enumerate() {
                let down_row = &down_rows[expert as usize * HIDDEN + o];
                acc += dot(down_row, &up_gate[slot * N_FF..(slot + 1) * N_FF]);
            }
            dst[t * HIDDEN + o] = residual[t * HIDDEN + o] + acc;
        }
    }
    dst
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_moe_matches_reference() {
    let mut rng = StdRng::seed_from_u64(23);
    let up_f = random_matrix(&mut rng, N_EXPERT * N_FF, HIDDEN, 0.6);
    let gate_f = random_matrix(&mut rng, N_EXPERT * N_FF, HIDDEN, 0.6);
    let down_f = random_matrix(&mut rng, N_EXPERT * HIDDEN, N_FF, 0.6);
    let (up, up_d) = q4_matrix(&up_f);
    let (gate, gate_d) = q4_matrix(&gate_f);
    let (down, down_d) = q4_matrix(&down_f);

    let input: Vec<f32> = (0..HIDDEN * BATCH).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let inp_sa: Vec<f32> = (0..HIDDEN * BATCH).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let ffn_norm: Vec<f32> = (0..HIDDEN).map(|_| rng.gen_range(0.5..1.5)).collect();
    let router: Vec<i32> = vec![0, 2, 1, 3, 3, 0];

    let args = MoeFfnArgs {
        ffn_norm_weight: &ffn_norm,
        up: &up,
        gate: &gate,
        down: &down,
        router: &router,
        residual_in: Some(&inp_sa),
        output_norm_weight: None,
        input: &input,
        hidden_size: HIDDEN,
        intermediate_size: N_FF,
        n_expert: N_EXPERT,
        n_expert_used: N_USED,
        batch_size: BATCH,
        eps: EPS,
    };

    let dst = run_moe(&args, 4, HIDDEN * BATCH).unwrap();
    let expected = reference_moe(&input, Some(&inp_sa), &ffn_norm, &up_d, &gate_d, &down_d, &router);

    for (i, (&got, &want)) in dst.iter().zip(expected.iter()).enumerate() {
        let tol = want.abs().max(1.0) * 0.02;
        assert!((got - want).abs() <= tol, "element {i}: {got} vs {want}");
    }
}

#[test]
fn test_moe_duplicate_router_slots_count_twice() {
    // both slots select expert 1, so its contribution doubles
    let mut rng = StdRng::seed_from_u64(31);
    let up_f = random_matrix(&mut rng, N_EXPERT * N_FF, HIDDEN, 0.5);
    let gate_f = random_matrix(&mut rng, N_EXPERT * N_FF, HIDDEN, 0.5);
    let down_f = random_matrix(&mut rng, N_EXPERT * HIDDEN, N_FF, 0.5);
    let (up, up_d) = q4_matrix(&up_f);
    let (gate, gate_d) = q4_matrix(&gate_f);
    let (down, down_d) = q4_matrix(&down_f);

    let input: Vec<f32> = (0..HIDDEN * BATCH).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let ffn_norm: Vec<f32> = vec![1.0; HIDDEN];
    let router: Vec<i32> = vec![1, 1, 1, 1, 1, 1];

    let args = MoeFfnArgs {
        ffn_norm_weight: &ffn_norm,
        up: &up,
        gate: &gate,
        down: &down,
        router: &router,
        residual_in: None,
        output_norm_weight: None,
        input: &input,
        hidden_size: HIDDEN,
        intermediate_size: N_FF,
        n_expert: N_EXPERT,
        n_expert_used: N_USED,
        batch_size: BATCH,
        eps: EPS,
    };

    let dst = run_moe(&args, 4, HIDDEN * BATCH).unwrap();
    let expected = reference_moe(&input, None, &ffn_norm, &up_d, &gate_d, &down_d, &router);

    for (i, (&got, &want)) in dst.iter().zip(expected.iter()).enumerate() {
        let tol = want.abs().max(1.0) * 0.02;
        assert!((got - want).abs() <= tol, "element {i}: {got} vs {want}");
    }
}

#[test]
fn test_moe_single_thread_equals_multi_thread() {
    let mut rng = StdRng::seed_from_u64(47);
    let up_f = random_matrix(&mut rng, N_EXPERT * N_FF, HIDDEN, 0.5);
    let gate_f = random_matrix(&mut rng, N_EXPERT * N_FF, HIDDEN, 0.5);
    let down_f = random_matrix(&mut rng, N_EXPERT * HIDDEN, N_FF, 0.5);
    let (up, _) = q4_matrix(&up_f);
    let (gate, _) = q4_matrix(&gate_f);
    let (down, _) = q4_matrix(&down_f);

    let input: Vec<f32> = (0..HIDDEN * BATCH).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let ffn_norm: Vec<f32> = vec![1.0; HIDDEN];
    let router: Vec<i32> = vec![2, 0, 0, 3, 1, 2];

    let args = MoeFfnArgs {
        ffn_norm_weight: &ffn_norm,
        up: &up,
        gate: &gate,
        down: &down,
        router: &router,
        residual_in: None,
        output_norm_weight: None,
        input: &input,
        hidden_size: HIDDEN,
        intermediate_size: N_FF,
        n_expert: N_EXPERT,
        n_expert_used: N_USED,
        batch_size: BATCH,
        eps: EPS,
    };

    // identical phase structure and quantization on any pool size, so the
    // results are bitwise equal
    let single = run_moe(&args, 1, HIDDEN * BATCH).unwrap();
    let multi = run_moe(&args, 8, HIDDEN * BATCH).unwrap();
    assert_eq!(single, multi);
}
