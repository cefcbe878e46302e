//! # Despertar
//!
//! CPU inference kernels for sparse mixture-of-experts and conditional-FFN
//! transformer layers. Despertar (Spanish: "to awaken") only computes the
//! neurons and experts a predictor wakes up.
//!
//! ## What's inside
//!
//! - **Quantized block codec**: `Q4_0` (4-bit, 32-value blocks) and `Q8_0`
//!   (8-bit, 32-value blocks) with an fp16 scale per block, wire-compatible
//!   with externally quantized weight files
//! - **SIMD dot kernels**: `Q4_0` weight row × `Q8_0` activation row with
//!   AVX2 / SSSE3 / NEON paths behind runtime CPU-feature dispatch and a
//!   scalar reference fallback
//! - **Batched AXPY**: fused gather-accumulate of up to 8 weighted `Q4_0`
//!   rows per pass, for predictor-selected sparse weight application
//! - **Chunked parallel drivers**: work-stealing partition of the
//!   (output-row × batch) space over a caller-owned thread pool
//! - **Forward passes**: conditional FFN, sparse MoE FFN, fused
//!   RMSNorm+residual, rotary embedding, and a profiler-gated sparse LM head,
//!   all phase-synchronized through a caller-owned barrier
//!
//! ## Threading model
//!
//! The forward entry points are designed to be called by *every* thread of a
//! fixed pool with a distinct `ith` and shared `nth`. Phases inside one call
//! are separated by [`parallel::ComputeParams::arrive_and_wait`]; work inside
//! a phase is claimed through atomic counters. The crate never spawns
//! threads of its own except in [`matvec`], the rayon-based dense
//! convenience path for callers without a pool.
//!
//! ## Example
//!
//! ```rust
//! use despertar::quantize::{quantize_row_q8_0, vec_dot_q4_0_q8_0, BlockQ8_0};
//! use half::f16;
//!
//! // One Q4_0 weight block: scale 0.5, all nibbles stored as 15 (value +7)
//! let weight: Vec<u8> = f16::from_f32(0.5)
//!     .to_le_bytes()
//!     .into_iter()
//!     .chain([0xFFu8; 16])
//!     .collect();
//!
//! let activations = [1.0f32; 32];
//! let mut quantized = [BlockQ8_0::default(); 1];
//! quantize_row_q8_0(&activations, &mut quantized);
//!
//! let dot = vec_dot_q4_0_q8_0(32, &weight, &quantized);
//! assert!((dot - 0.5 * 7.0 * 32.0).abs() / (0.5 * 7.0 * 32.0) < 1e-2);
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::module_name_repetitions,
    clippy::many_single_char_names,
    clippy::similar_names
)]

pub mod error;
pub mod ffn;
pub mod layernorm;
pub mod lmhead;
pub mod matvec;
pub mod moe;
pub mod parallel;
pub mod quantize;
pub mod rope;
pub mod workspace;

pub use error::{DespertarError, Result};
pub use ffn::{ffn_cond_q4_0_f32, CondFfnArgs};
pub use layernorm::post_attn_layernorm;
pub use lmhead::{lmhead_q4_0_f32, LmheadArgs};
pub use moe::{ffn_moe_sparse_q4_0_f32, MoeFfnArgs};
pub use parallel::{ChunkGrid, ComputeParams, CounterPool, SharedOut};
pub use rope::{rotary_embedding_f32, RopeArgs, RopeLayout};
pub use workspace::{CondFfnLayout, LmheadLayout, MoeFfnLayout, Workspace};
