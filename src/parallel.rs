//! Chunked work-stealing partition and barrier-phase coordination.
//!
//! The forward passes in this crate are executed by a fixed pool of
//! caller-owned OS threads. Every thread enters the same function with a
//! distinct `ith` and shared `nth`, claims rectangular chunks of the output
//! space through an atomic counter, and synchronizes phase transitions at a
//! shared barrier. This module holds the pieces of that scheme:
//!
//! - [`ChunkGrid`]: partitions `[0, nr0) × [0, nr1)` into chunks and hands
//!   them out via fetch-and-add work stealing
//! - [`CounterPool`]: a fixed set of cache-line-padded atomic counters owned
//!   by the per-call context, indexed by phase
//! - [`ComputeParams`]: the per-thread view of one forward call (thread
//!   index, barrier, counter pool)
//! - [`SharedOut`]: a `Sync` view over a caller-owned output slice that
//!   threads write at disjoint indices within a phase

use std::marker::PhantomData;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Barrier;

// ============================================================================
// Chunk grid
// ============================================================================

/// One rectangular sub-region of the (output-row × batch) iteration space,
/// claimed atomically by a single worker thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Row range along dimension 0 (output rows)
    pub i0: Range<usize>,
    /// Row range along dimension 1 (batch)
    pub i1: Range<usize>,
}

impl Chunk {
    /// True when the chunk covers no elements
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.i0.is_empty() || self.i1.is_empty()
    }
}

/// Partition of `[0, nr0) × [0, nr1)` into rectangular chunks.
///
/// Chunk dimensions are chosen so the chunk count comfortably exceeds the
/// thread count; when `nchunk0 * nchunk1 < nth * 4` the 2-D plan is scrapped
/// and the space is re-chunked one-dimensionally along whichever axis is
/// larger. Chunks exactly tile the space for every input: no overlap, no
/// gaps.
#[derive(Debug, Clone)]
pub struct ChunkGrid {
    nr0: usize,
    nr1: usize,
    dr0: usize,
    dr1: usize,
    nchunk0: usize,
    nchunk1: usize,
}

impl ChunkGrid {
    /// Build a grid over `nr0 × nr1` with square-ish chunks of `chunk_size`.
    ///
    /// `nth` is the worker-thread count the fallback re-chunking targets.
    #[must_use]
    pub fn new(nr0: usize, nr1: usize, chunk_size: usize, nth: usize) -> Self {
        Self::with_row_align(nr0, nr1, chunk_size, nth, 1)
    }

    /// Like [`ChunkGrid::new`], but rounds the row-chunk height up to a
    /// multiple of `align0`.
    ///
    /// Drivers that emit one quantized block per 32 output rows use
    /// `align0 = 32` so every chunk owns whole blocks and no two threads
    /// ever share a block.
    ///
    /// # Panics
    /// `chunk_size`, `nth` and `align0` must be non-zero.
    #[must_use]
    pub fn with_row_align(
        nr0: usize,
        nr1: usize,
        chunk_size: usize,
        nth: usize,
        align0: usize,
    ) -> Self {
        assert!(chunk_size > 0 && nth > 0 && align0 > 0);

        let mut nchunk0 = nr0.div_ceil(chunk_size);
        let mut nchunk1 = nr1.div_ceil(chunk_size);

        // Too few chunks for the pool: re-chunk one-dimensionally along the
        // larger axis so every thread still gets work.
        if nchunk0 * nchunk1 < nth * 4 {
            if nr0 > nr1 {
                nchunk0 = nth;
                nchunk1 = 1;
            } else {
                nchunk0 = 1;
                nchunk1 = nth;
            }
        }

        let dr0 = nr0.div_ceil(nchunk0.max(1)).max(1);
        let dr0 = dr0.div_ceil(align0) * align0;
        let dr1 = nr1.div_ceil(nchunk1.max(1)).max(1);

        Self {
            nr0,
            nr1,
            dr0,
            dr1,
            nchunk0: nchunk0.max(1),
            nchunk1: nchunk1.max(1),
        }
    }

    /// Total number of chunks handed out by the grid
    #[must_use]
    pub fn num_chunks(&self) -> usize {
        self.nchunk0 * self.nchunk1
    }

    /// The chunk at a claimed index.
    ///
    /// Rounded-up chunk heights can leave trailing chunks empty; callers
    /// skip those.
    ///
    /// # Panics
    /// `index` must be below [`ChunkGrid::num_chunks`].
    #[must_use]
    pub fn chunk(&self, index: usize) -> Chunk {
        assert!(index < self.num_chunks());
        let ith0 = index % self.nchunk0;
        let ith1 = index / self.nchunk0;

        let ir0_start = (self.dr0 * ith0).min(self.nr0);
        let ir0_end = (ir0_start + self.dr0).min(self.nr0);
        let ir1_start = (self.dr1 * ith1).min(self.nr1);
        let ir1_end = (ir1_start + self.dr1).min(self.nr1);

        Chunk {
            i0: ir0_start..ir0_end,
            i1: ir1_start..ir1_end,
        }
    }

    /// Claim the next unprocessed chunk via fetch-and-add.
    ///
    /// Every chunk index is handed out exactly once across all threads
    /// sharing `counter`; `None` means the grid is exhausted.
    pub fn steal(&self, counter: &AtomicUsize) -> Option<Chunk> {
        let index = counter.fetch_add(1, Ordering::Relaxed);
        (index < self.num_chunks()).then(|| self.chunk(index))
    }
}

// ============================================================================
// Counter pool
// ============================================================================

/// Counters available per forward call. Forward passes index the pool by a
/// phase's position in its enumerated sequence; no sequence is longer than
/// five phases or has a work-stealing phase past position 3.
pub const COUNTER_POOL_CAPACITY: usize = 4;

/// Atomic counter padded out to its own cache line
#[repr(align(64))]
#[derive(Debug, Default)]
struct PaddedCounter(AtomicUsize);

/// Fixed-capacity pool of work-stealing counters, indexed by phase number.
///
/// Owned by the caller alongside the barrier and reset by thread 0 once per
/// forward call, before the barrier that publishes the first counter-driven
/// phase.
#[derive(Debug, Default)]
pub struct CounterPool {
    counters: [PaddedCounter; COUNTER_POOL_CAPACITY],
}

impl CounterPool {
    /// A pool with all counters at zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The counter backing work-stealing phase `phase`
    ///
    /// # Panics
    /// `phase` must be below [`COUNTER_POOL_CAPACITY`].
    #[must_use]
    pub fn counter(&self, phase: usize) -> &AtomicUsize {
        &self.counters[phase].0
    }

    /// Reset every counter to zero.
    ///
    /// Called by thread 0 only, before the barrier that starts the first
    /// counter-driven phase of a forward call.
    pub fn reset(&self) {
        for c in &self.counters {
            c.0.store(0, Ordering::Relaxed);
        }
    }
}

// ============================================================================
// Per-thread compute parameters
// ============================================================================

/// Per-thread view of one barrier-phased forward call.
///
/// The barrier and counter pool are owned by the caller for the duration of
/// the call; this struct only borrows them. All `nth` threads must construct
/// params over the *same* barrier and pool, enter the same forward function,
/// and reach every [`ComputeParams::arrive_and_wait`] — no thread may skip a
/// barrier.
#[derive(Debug)]
pub struct ComputeParams<'a> {
    /// Index of this thread, `0 <= ith < nth`
    pub ith: usize,
    /// Total number of threads participating in the call
    pub nth: usize,
    barrier: &'a Barrier,
    counters: &'a CounterPool,
}

impl<'a> ComputeParams<'a> {
    /// Bind a thread index to the call-shared barrier and counter pool.
    ///
    /// # Panics
    /// `ith` must be below `nth`; `nth` must match the barrier's party count.
    #[must_use]
    pub fn new(ith: usize, nth: usize, barrier: &'a Barrier, counters: &'a CounterPool) -> Self {
        assert!(nth > 0 && ith < nth, "thread index {ith} out of range for {nth} threads");
        Self {
            ith,
            nth,
            barrier,
            counters,
        }
    }

    /// True for the thread that performs once-per-call work (counter resets)
    #[must_use]
    pub fn is_lead(&self) -> bool {
        self.ith == 0
    }

    /// Block until all `nth` threads have arrived
    pub fn arrive_and_wait(&self) {
        self.barrier.wait();
    }

    /// The work-stealing counter for phase `phase` of the current call
    #[must_use]
    pub fn counter(&self, phase: usize) -> &AtomicUsize {
        self.counters.counter(phase)
    }

    /// Reset all counters; lead thread only, before the publishing barrier
    pub fn reset_counters(&self) {
        debug_assert!(self.is_lead());
        self.counters.reset();
    }
}

// ============================================================================
// Shared output view
// ============================================================================

/// A `Send + Sync` view over a caller-owned output slice.
///
/// The forward entry points are called once per pool thread, so the
/// destination buffer cannot be passed as `&mut [f32]` to each of them.
/// `SharedOut` wraps the single mutable borrow and hands threads raw write
/// access under the crate's phase discipline:
///
/// - within a phase, threads write **disjoint** indices (guaranteed by the
///   chunk grid / modulo striping)
/// - a region written in phase N is read by other threads only after the
///   phase N barrier
pub struct SharedOut<'a, T> {
    ptr: *mut T,
    len: usize,
    _borrow: PhantomData<&'a mut [T]>,
}

unsafe impl<T: Send> Send for SharedOut<'_, T> {}
unsafe impl<T: Send> Sync for SharedOut<'_, T> {}

impl<'a, T> SharedOut<'a, T> {
    /// Wrap a mutable slice for the duration of one forward call
    #[must_use]
    pub fn new(slice: &'a mut [T]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
            _borrow: PhantomData,
        }
    }

    /// Number of elements in the underlying slice
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the underlying slice is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Split the view into two non-overlapping views at `mid`.
    ///
    /// # Panics
    /// `mid` must not exceed the length.
    #[must_use]
    pub fn split_at(&self, mid: usize) -> (SharedOut<'a, T>, SharedOut<'a, T>) {
        assert!(mid <= self.len);
        (
            SharedOut {
                ptr: self.ptr,
                len: mid,
                _borrow: PhantomData,
            },
            SharedOut {
                // SAFETY: mid <= len keeps the pointer inside the allocation
                ptr: unsafe { self.ptr.add(mid) },
                len: self.len - mid,
                _borrow: PhantomData,
            },
        )
    }

    /// Full mutable view of the underlying slice.
    ///
    /// # Safety
    /// The caller must uphold the phase discipline: concurrent threads write
    /// disjoint indices, and cross-thread reads happen only after a barrier.
    #[must_use]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [T] {
        // SAFETY: ptr/len come from a live &mut [T]; aliasing is governed by
        // the contract above.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_exact_tiling(grid: &ChunkGrid, nr0: usize, nr1: usize) {
        let mut cover = vec![0u8; nr0 * nr1];
        for idx in 0..grid.num_chunks() {
            let chunk = grid.chunk(idx);
            for i1 in chunk.i1.clone() {
                for i0 in chunk.i0.clone() {
                    cover[i1 * nr0 + i0] += 1;
                }
            }
        }
        assert!(
            cover.iter().all(|&c| c == 1),
            "grid over {nr0}x{nr1} does not tile exactly"
        );
    }

    #[test]
    fn test_chunk_grid_tiles_exactly() {
        for &(nr0, nr1, chunk, nth) in &[
            (128usize, 4usize, 32usize, 4usize),
            (64, 1, 64, 8),
            (1, 64, 16, 4),
            (100, 7, 16, 3),
            (33, 33, 16, 1),
        ] {
            let grid = ChunkGrid::new(nr0, nr1, chunk, nth);
            assert_exact_tiling(&grid, nr0, nr1);
        }
    }

    #[test]
    fn test_chunk_grid_row_align() {
        let grid = ChunkGrid::with_row_align(96, 3, 32, 8, 32);
        assert_exact_tiling(&grid, 96, 3);
        for idx in 0..grid.num_chunks() {
            let chunk = grid.chunk(idx);
            assert_eq!(chunk.i0.start % 32, 0);
            // interior chunks end on a block boundary; the last is bounded by nr0
            assert!(chunk.i0.end % 32 == 0 || chunk.i0.end == 96);
        }
    }

    #[test]
    fn test_chunk_grid_fallback_is_one_dimensional() {
        // 4x4 chunks for 16 threads would give 1 chunk; fallback re-chunks
        // along the larger axis with nth chunks.
        let grid = ChunkGrid::new(64, 2, 64, 16);
        assert_eq!(grid.num_chunks(), 16);
        assert_exact_tiling(&grid, 64, 2);
    }

    #[test]
    fn test_steal_hands_out_every_chunk_once() {
        let grid = ChunkGrid::new(128, 8, 16, 4);
        let counter = AtomicUsize::new(0);
        let mut seen = vec![false; grid.num_chunks()];
        let mut claimed = 0;
        while let Some(chunk) = grid.steal(&counter) {
            claimed += 1;
            let idx = counter.load(Ordering::Relaxed) - 1;
            assert!(!seen[idx], "chunk {idx} claimed twice");
            seen[idx] = true;
            let _ = chunk;
        }
        assert_eq!(claimed, grid.num_chunks());
        assert!(grid.steal(&counter).is_none());
    }

    #[test]
    fn test_counter_pool_reset() {
        let pool = CounterPool::new();
        pool.counter(0).fetch_add(7, Ordering::Relaxed);
        pool.counter(3).fetch_add(2, Ordering::Relaxed);
        pool.reset();
        for phase in 0..COUNTER_POOL_CAPACITY {
            assert_eq!(pool.counter(phase).load(Ordering::Relaxed), 0);
        }
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_params_rejects_bad_thread_index() {
        let barrier = Barrier::new(2);
        let pool = CounterPool::new();
        let _ = ComputeParams::new(2, 2, &barrier, &pool);
    }

    #[test]
    fn test_shared_out_roundtrip() {
        let mut buf = vec![0.0f32; 8];
        let out = SharedOut::new(&mut buf);
        assert_eq!(out.len(), 8);
        // SAFETY: single thread, exclusive access
        unsafe {
            out.as_mut_slice()[3] = 2.5;
        }
        assert_eq!(buf[3], 2.5);
    }
}
