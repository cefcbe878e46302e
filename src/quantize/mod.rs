//! Quantized block formats and the kernels that consume them
//!
//! Implements the two block formats the sparse forward passes exchange with
//! externally quantized weight files:
//!
//! ## `Q4_0` Format
//!
//! `Q4_0` stores weights in blocks of 32 values:
//! - 1 fp16 scale factor per block
//! - 16 bytes of 4-bit quantized values (2 values per byte, stored range
//!   [0, 15] maps to signed [-8, 7])
//! - Dequantization: `value = scale * (quantized - 8)`
//!
//! ## `Q8_0` Format
//!
//! `Q8_0` stores activations in blocks of 32 values:
//! - 1 fp16 scale factor per block
//! - 32 int8 quantized values
//! - Dequantization: `value = scale * quantized`
//!
//! The submodules hold the codec ([`codec`]), the SIMD-dispatched dot-product
//! kernel ([`dot`]) and the batched AXPY accumulator ([`axpy`]).

pub mod axpy;
pub mod codec;
pub mod dot;
pub mod types;

pub use axpy::{axpy_rows_masked, AxpyBatch};
pub use codec::{
    dequantize_row_q4_0, dequantize_row_q8_0, quantize_row_q4_0, quantize_row_q8_0,
};
pub use dot::{active_backend, vec_dot_q4_0_q8_0, vec_dot_q4_0_q8_0_with};
pub use types::{
    blocks_per_row, detect_kernel_backend, q4_0_rows_as_bytes, q4_0_rows_from_bytes,
    q8_0_rows_as_bytes, q8_0_rows_from_bytes, row_size, BlockQ4_0, BlockQ8_0, KernelBackend,
    QuantKind, BLOCK_Q4_0_BYTES, BLOCK_Q8_0_BYTES, QK,
};

/// Pre-computed f16 to f32 lookup table (65536 entries = 256KB)
///
/// Eliminates per-block f16 conversion overhead in hot paths. Built lazily
/// on first access and immutable thereafter; every kernel that mixes fp16
/// scales with f32 accumulation converts through this one table, so the
/// hardware and scalar paths can never disagree.
static F16_TO_F32_LUT: std::sync::LazyLock<Box<[f32; 65536]>> = std::sync::LazyLock::new(|| {
    let mut lut = Box::new([0.0f32; 65536]);
    for i in 0..65536u32 {
        lut[i as usize] = half::f16::from_bits(i as u16).to_f32();
    }
    lut
});

/// Fast f16 to f32 conversion using the pre-computed LUT
///
/// Takes raw u16 bits (little-endian) and returns the f32 value.
#[inline]
#[must_use]
pub fn f16_to_f32_lut(bits: u16) -> f32 {
    F16_TO_F32_LUT[bits as usize]
}
