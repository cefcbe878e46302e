//! Caller-owned scratch arena and the per-operator workspace layouts.
//!
//! Every forward pass works out of one flat scratch buffer supplied by the
//! caller and reused across calls; the kernels never allocate. The layout
//! types here partition that buffer into named, 64-byte-aligned sub-regions
//! and compute the total requirement from the *same* cursor walk, so the
//! size validator and the actual partitioning can never drift apart.
//!
//! Region placement is a pure function of the call dimensions: every thread
//! derives identical offsets, so the partitioning itself needs no
//! synchronization. Cross-thread visibility of region contents is governed
//! by the barrier phases (see [`crate::parallel`]).

use std::cell::UnsafeCell;

use crate::error::{DespertarError, Result};
use crate::quantize::types::{row_size, BlockQ8_0, QuantKind};

/// Sub-regions start on 64-byte boundaries (one cache line)
const REGION_ALIGN: usize = 64;

// ============================================================================
// Arena
// ============================================================================

/// Caller-owned flat scratch buffer shared by all threads of a forward call.
///
/// Backed by `u64` words so every 64-byte-aligned region offset is valid for
/// the `f32` / `u32` / [`BlockQ8_0`] views the kernels take. The arena is
/// `Sync`: threads obtain raw region views through the `unsafe` accessors
/// and rely on the barrier-phase discipline for aliasing.
#[derive(Debug)]
pub struct Workspace {
    words: Box<[UnsafeCell<u64>]>,
    bytes: usize,
}

// SAFETY: all mutable access goes through the unsafe region accessors, whose
// contract requires disjoint writes within a phase and barrier-separated
// cross-thread reads.
unsafe impl Sync for Workspace {}

impl Workspace {
    /// Allocate a scratch buffer of exactly `bytes` usable bytes
    #[must_use]
    pub fn with_capacity(bytes: usize) -> Self {
        let words = (0..bytes.div_ceil(8))
            .map(|_| UnsafeCell::new(0u64))
            .collect();
        Self { words, bytes }
    }

    /// Usable capacity in bytes, as requested at construction
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes
    }

    /// True when the arena holds no bytes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.words.as_ptr()).cast::<u8>()
    }

    /// View a region as `f32` elements.
    ///
    /// # Safety
    /// `region` must come from a layout validated against this arena, and the
    /// caller must uphold the phase discipline: concurrent threads write
    /// disjoint elements, cross-thread reads only after a barrier.
    #[must_use]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn f32_region(&self, region: Region) -> &mut [f32] {
        debug_assert!(region.end() <= self.len());
        // SAFETY: offset is 64-byte aligned within the allocation; aliasing
        // per the contract above.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.base().add(region.offset).cast::<f32>(),
                region.bytes / std::mem::size_of::<f32>(),
            )
        }
    }

    /// View a region as `u32` elements.
    ///
    /// # Safety
    /// Same contract as [`Workspace::f32_region`].
    #[must_use]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn u32_region(&self, region: Region) -> &mut [u32] {
        debug_assert!(region.end() <= self.len());
        // SAFETY: as above
        unsafe {
            std::slice::from_raw_parts_mut(
                self.base().add(region.offset).cast::<u32>(),
                region.bytes / std::mem::size_of::<u32>(),
            )
        }
    }

    /// View a region as [`BlockQ8_0`] blocks.
    ///
    /// # Safety
    /// Same contract as [`Workspace::f32_region`].
    #[must_use]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn q8_region(&self, region: Region) -> &mut [BlockQ8_0] {
        debug_assert!(region.end() <= self.len());
        debug_assert!(region.bytes % std::mem::size_of::<BlockQ8_0>() == 0);
        // SAFETY: as above; BlockQ8_0 has alignment 2
        unsafe {
            std::slice::from_raw_parts_mut(
                self.base().add(region.offset).cast::<BlockQ8_0>(),
                region.bytes / std::mem::size_of::<BlockQ8_0>(),
            )
        }
    }
}

/// One named sub-region of the arena: a byte offset and length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// Byte offset from the arena base, always a multiple of 64
    pub offset: usize,
    /// Length in bytes
    pub bytes: usize,
}

impl Region {
    fn end(self) -> usize {
        self.offset + self.bytes
    }
}

/// Cursor that walks out a layout; also the single source of the total
/// requirement
#[derive(Debug, Default)]
struct LayoutCursor {
    offset: usize,
}

impl LayoutCursor {
    fn take(&mut self, bytes: usize) -> Region {
        let offset = self.offset.div_ceil(REGION_ALIGN) * REGION_ALIGN;
        self.offset = offset + bytes;
        Region { offset, bytes }
    }
}

fn validate(required: usize, workspace: &Workspace) -> Result<()> {
    if workspace.len() < required {
        return Err(DespertarError::ComputeBufferTooSmall {
            required,
            provided: workspace.len(),
        });
    }
    Ok(())
}

// ============================================================================
// Conditional-FFN layout
// ============================================================================

/// Workspace layout of one conditional-FFN forward call
#[derive(Debug, Clone)]
pub struct CondFfnLayout {
    /// RMSNorm output, `hidden_size * batch_size` f32
    pub norm: Region,
    /// Residual stream (`input + residual_in`), `hidden_size * batch_size` f32
    pub residual: Region,
    /// Down-projection output, `hidden_size * batch_size` f32
    pub ffn_out: Region,
    /// Normalized input quantized to `Q8_0`, one row per token
    pub quant_input: Region,
    /// SiLU-gated up·gate output quantized to `Q8_0`, one row per token
    pub up_gate: Region,
    required: usize,
}

impl CondFfnLayout {
    /// Compute the layout for the given call dimensions
    #[must_use]
    pub fn new(hidden_size: usize, intermediate_size: usize, batch_size: usize) -> Self {
        let f32_row = hidden_size * std::mem::size_of::<f32>();
        let mut cursor = LayoutCursor::default();

        let norm = cursor.take(f32_row * batch_size);
        let residual = cursor.take(f32_row * batch_size);
        let ffn_out = cursor.take(f32_row * batch_size);
        let quant_input = cursor.take(row_size(QuantKind::Q8_0, hidden_size) * batch_size);
        let up_gate = cursor.take(row_size(QuantKind::Q8_0, intermediate_size) * batch_size);

        Self {
            norm,
            residual,
            ffn_out,
            quant_input,
            up_gate,
            required: cursor.offset,
        }
    }

    /// Total bytes the call needs, from the same cursor walk that placed the
    /// regions
    #[must_use]
    pub fn required_bytes(&self) -> usize {
        self.required
    }

    /// Fail before any phase writes when the arena is too small
    pub fn validate(&self, workspace: &Workspace) -> Result<()> {
        validate(self.required, workspace)
    }
}

// ============================================================================
// MoE-FFN layout
// ============================================================================

/// Workspace layout of one sparse-MoE forward call
#[derive(Debug, Clone)]
pub struct MoeFfnLayout {
    /// RMSNorm output, `hidden_size * batch_size` f32
    pub norm: Region,
    /// Residual stream, `hidden_size * batch_size` f32
    pub residual: Region,
    /// Down-projection output, `hidden_size * batch_size` f32
    pub ffn_out: Region,
    /// Normalized input quantized to `Q8_0`, one row per token
    pub quant_input: Region,
    /// Up·gate output for all active experts of each token, `Q8_0`
    pub up_gate: Region,
    required: usize,
}

impl MoeFfnLayout {
    /// Compute the layout; the up·gate row spans `intermediate_size *
    /// n_expert_used` values per token
    #[must_use]
    pub fn new(
        hidden_size: usize,
        intermediate_size: usize,
        n_expert_used: usize,
        batch_size: usize,
    ) -> Self {
        let f32_row = hidden_size * std::mem::size_of::<f32>();
        let mut cursor = LayoutCursor::default();

        let norm = cursor.take(f32_row * batch_size);
        let residual = cursor.take(f32_row * batch_size);
        let ffn_out = cursor.take(f32_row * batch_size);
        let quant_input = cursor.take(row_size(QuantKind::Q8_0, hidden_size) * batch_size);
        let up_gate = cursor.take(
            row_size(QuantKind::Q8_0, intermediate_size * n_expert_used) * batch_size,
        );

        Self {
            norm,
            residual,
            ffn_out,
            quant_input,
            up_gate,
            required: cursor.offset,
        }
    }

    /// Total bytes the call needs
    #[must_use]
    pub fn required_bytes(&self) -> usize {
        self.required
    }

    /// Fail before any phase writes when the arena is too small
    pub fn validate(&self, workspace: &Workspace) -> Result<()> {
        validate(self.required, workspace)
    }
}

// ============================================================================
// LM-head layout
// ============================================================================

/// Workspace layout of one sparse LM-head call (batch size 1)
#[derive(Debug, Clone)]
pub struct LmheadLayout {
    /// Input activation quantized to `Q8_0`, `n_embd` values
    pub quant_input: Region,
    /// Profiler hidden activations quantized to `Q8_0`, `hidden_size` values
    pub profiler_hidden: Region,
    /// Vocabulary score bitmask, one `u32` per 32 vocabulary rows
    pub score_mask: Region,
    required: usize,
}

impl LmheadLayout {
    /// Compute the layout for the given dimensions
    ///
    /// # Panics
    /// `n_vocab` must be a multiple of 32.
    #[must_use]
    pub fn new(n_embd: usize, n_vocab: usize, hidden_size: usize) -> Self {
        assert!(n_vocab % 32 == 0, "vocabulary size {n_vocab} is not a multiple of 32");
        let mut cursor = LayoutCursor::default();

        let quant_input = cursor.take(row_size(QuantKind::Q8_0, n_embd));
        let profiler_hidden = cursor.take(row_size(QuantKind::Q8_0, hidden_size));
        let score_mask = cursor.take((n_vocab / 32) * std::mem::size_of::<u32>());

        Self {
            quant_input,
            profiler_hidden,
            score_mask,
            required: cursor.offset,
        }
    }

    /// Total bytes the call needs
    #[must_use]
    pub fn required_bytes(&self) -> usize {
        self.required
    }

    /// Fail before any phase writes when the arena is too small
    pub fn validate(&self, workspace: &Workspace) -> Result<()> {
        validate(self.required, workspace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regions_are_aligned_and_disjoint() {
        let layout = CondFfnLayout::new(128, 64, 3);
        let regions = [
            layout.norm,
            layout.residual,
            layout.ffn_out,
            layout.quant_input,
            layout.up_gate,
        ];
        for r in &regions {
            assert_eq!(r.offset % REGION_ALIGN, 0);
        }
        for (i, a) in regions.iter().enumerate() {
            for b in &regions[i + 1..] {
                assert!(
                    a.end() <= b.offset || b.end() <= a.offset,
                    "regions overlap: {a:?} vs {b:?}"
                );
            }
        }
        assert!(layout.required_bytes() >= regions.iter().copied().map(Region::end).max().unwrap());
    }

    #[test]
    fn test_validate_matches_required_bytes() {
        let layout = MoeFfnLayout::new(128, 64, 2, 2);
        let exact = Workspace::with_capacity(layout.required_bytes());
        assert!(layout.validate(&exact).is_ok());

        let small = Workspace::with_capacity(layout.required_bytes() - 1);
        let err = layout.validate(&small).unwrap_err();
        assert_eq!(err.to_string(), "The compute buffer is too small");
    }

    #[test]
    fn test_workspace_region_views() {
        let layout = LmheadLayout::new(64, 64, 32);
        let ws = Workspace::with_capacity(layout.required_bytes());
        // SAFETY: single thread, exclusive access
        unsafe {
            let quant = ws.q8_region(layout.quant_input);
            assert_eq!(quant.len(), 2);
            let mask = ws.u32_region(layout.score_mask);
            assert_eq!(mask.len(), 2);
            mask[1] = 0xDEAD_BEEF;
        }
        // SAFETY: as above
        unsafe {
            assert_eq!(ws.u32_region(layout.score_mask)[1], 0xDEAD_BEEF);
        }
    }
}
