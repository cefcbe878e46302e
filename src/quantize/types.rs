//! Block formats and runtime kernel-backend detection.
//!
//! ## Contents
//! - Constants: `QK`, block byte sizes
//! - Block structs: `BlockQ4_0`, `BlockQ8_0` (wire-compatible with externally
//!   quantized weight files: fp16 scale followed by packed quants)
//! - Row-size arithmetic: `row_size`, `blocks_per_row`
//! - `KernelBackend` + `detect_kernel_backend` — capability-checked SIMD
//!   dispatch, resolved once at process start

use half::f16;

/// Block width shared by `Q4_0` and `Q8_0`: one scale covers 32 values
pub const QK: usize = 32;

/// Bytes per `Q4_0` block: fp16 scale + 16 nibble-packed bytes
pub const BLOCK_Q4_0_BYTES: usize = 2 + QK / 2;

/// Bytes per `Q8_0` block: fp16 scale + 32 signed bytes
pub const BLOCK_Q8_0_BYTES: usize = 2 + QK;

/// `Q4_0` quantized block
///
/// 32 values packed as 4-bit nibbles, two per byte. The stored range [0, 15]
/// maps to signed [-8, 7] (bias 8). Byte `j` holds value `j` in its low
/// nibble and value `j + 16` in its high nibble. All 32 values share the fp16
/// scale `d`; dequantization is `value = d * (stored - 8)`.
#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockQ4_0 {
    /// Shared fp16 scale ("delta")
    pub d: f16,
    /// Nibble-packed quantized values
    pub qs: [u8; QK / 2],
}

/// `Q8_0` quantized block
///
/// 32 signed bytes sharing one fp16 scale; `value = d * stored`.
#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockQ8_0 {
    /// Shared fp16 scale ("delta")
    pub d: f16,
    /// Quantized values
    pub qs: [i8; QK],
}

// The wire layout is load-bearing: external weight files are reinterpreted
// directly as rows of these blocks.
const _: () = assert!(std::mem::size_of::<BlockQ4_0>() == BLOCK_Q4_0_BYTES);
const _: () = assert!(std::mem::size_of::<BlockQ8_0>() == BLOCK_Q8_0_BYTES);
const _: () = assert!(std::mem::align_of::<BlockQ4_0>() == 2);
const _: () = assert!(std::mem::align_of::<BlockQ8_0>() == 2);

/// Quantization formats understood by the row-size arithmetic
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantKind {
    /// 4-bit blocks, 18 bytes per 32 values
    Q4_0,
    /// 8-bit blocks, 34 bytes per 32 values
    Q8_0,
}

impl QuantKind {
    /// Bytes occupied by one 32-value block of this format
    #[must_use]
    pub const fn block_bytes(self) -> usize {
        match self {
            QuantKind::Q4_0 => BLOCK_Q4_0_BYTES,
            QuantKind::Q8_0 => BLOCK_Q8_0_BYTES,
        }
    }
}

/// Number of blocks in a row of `n` elements
///
/// # Panics
/// `n` must be a multiple of [`QK`].
#[must_use]
pub fn blocks_per_row(n: usize) -> usize {
    assert!(n % QK == 0, "row length {n} is not a multiple of {QK}");
    n / QK
}

/// Byte size of one quantized row of `n` elements
///
/// # Panics
/// `n` must be a multiple of [`QK`].
#[must_use]
pub fn row_size(kind: QuantKind, n: usize) -> usize {
    blocks_per_row(n) * kind.block_bytes()
}

/// Reinterpret `Q4_0` blocks as their wire bytes
///
/// `BlockQ4_0` is `#[repr(C)]` with no padding, so this is always valid.
#[must_use]
pub fn q4_0_rows_as_bytes(blocks: &[BlockQ4_0]) -> &[u8] {
    // SAFETY: repr(C), size 18, no padding; u8 has alignment 1
    unsafe {
        std::slice::from_raw_parts(
            blocks.as_ptr().cast::<u8>(),
            blocks.len() * BLOCK_Q4_0_BYTES,
        )
    }
}

/// Reinterpret `Q8_0` blocks as their wire bytes
#[must_use]
pub fn q8_0_rows_as_bytes(blocks: &[BlockQ8_0]) -> &[u8] {
    // SAFETY: repr(C), size 34, no padding; u8 has alignment 1
    unsafe {
        std::slice::from_raw_parts(
            blocks.as_ptr().cast::<u8>(),
            blocks.len() * BLOCK_Q8_0_BYTES,
        )
    }
}

/// Reinterpret wire bytes as `Q4_0` blocks.
///
/// Returns `None` when the length is not a whole number of blocks or the
/// data does not meet the block's 2-byte alignment. Weight rows that fail
/// the alignment check can still be consumed directly as bytes by every
/// kernel in this crate.
#[must_use]
pub fn q4_0_rows_from_bytes(bytes: &[u8]) -> Option<&[BlockQ4_0]> {
    if bytes.len() % BLOCK_Q4_0_BYTES != 0 || bytes.as_ptr().align_offset(2) != 0 {
        return None;
    }
    // SAFETY: length and alignment checked; any bit pattern is a valid block
    Some(unsafe {
        std::slice::from_raw_parts(
            bytes.as_ptr().cast::<BlockQ4_0>(),
            bytes.len() / BLOCK_Q4_0_BYTES,
        )
    })
}

/// Reinterpret wire bytes as `Q8_0` blocks; same checks as
/// [`q4_0_rows_from_bytes`]
#[must_use]
pub fn q8_0_rows_from_bytes(bytes: &[u8]) -> Option<&[BlockQ8_0]> {
    if bytes.len() % BLOCK_Q8_0_BYTES != 0 || bytes.as_ptr().align_offset(2) != 0 {
        return None;
    }
    // SAFETY: length and alignment checked; any bit pattern is a valid block
    Some(unsafe {
        std::slice::from_raw_parts(
            bytes.as_ptr().cast::<BlockQ8_0>(),
            bytes.len() / BLOCK_Q8_0_BYTES,
        )
    })
}

// ============================================================================
// Kernel backend detection
// ============================================================================

/// SIMD backend for the dot-product kernels, detected at runtime
///
/// The active backend is resolved once at first use (see
/// [`crate::quantize::dot::active_backend`]); a single binary stays portable
/// across machines with different instruction sets. AArch64 SVE hardware runs
/// the NEON path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KernelBackend {
    /// AVX2 + FMA (256-bit integer multiply-accumulate)
    Avx2,
    /// SSSE3 (128-bit lanes)
    Ssse3,
    /// ARM NEON (128-bit, baseline on AArch64)
    Neon,
    /// Portable scalar loop; the reference semantics
    #[default]
    Scalar,
}

impl std::fmt::Display for KernelBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelBackend::Avx2 => write!(f, "AVX2"),
            KernelBackend::Ssse3 => write!(f, "SSSE3"),
            KernelBackend::Neon => write!(f, "NEON"),
            KernelBackend::Scalar => write!(f, "Scalar"),
        }
    }
}

/// Detect the best available kernel backend for this CPU
#[must_use]
pub fn detect_kernel_backend() -> KernelBackend {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            return KernelBackend::Avx2;
        }
        if is_x86_feature_detected!("ssse3") {
            return KernelBackend::Ssse3;
        }
    }

    #[cfg(target_arch = "aarch64")]
    {
        return KernelBackend::Neon;
    }

    #[allow(unreachable_code)]
    KernelBackend::Scalar
}
