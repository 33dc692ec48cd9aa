use std::mem::size_of;

/// Size of one heap page. Spans are always a whole number of pages.
pub const PAGE_SIZE: usize = 8 * 1024;
pub const PAGE_SHIFT: usize = 13;
/// Minimal allocation granularity.
pub const ATOM_SIZE: usize = 16;
/// Allocations above this size get a dedicated span.
pub const MAX_SMALL_SIZE: usize = 32 * 1024;
/// Sizes up to this one are rounded to a multiple of `ATOM_SIZE` instead of
/// following the geometric progression.
pub const PRECISE_CUTOFF: usize = 80;
pub const WORD: usize = size_of::<usize>();
pub const BITS_PER_WORD: usize = WORD * 8;

/// Capacity of a mutator's write barrier buffer before it is flushed into the
/// shared gray queue.
pub const WB_BUF_LEN: usize = 512;

pub const MAX_TYPES: usize = 1 << 14;
pub const MAX_FRAMES: usize = 1 << 14;
/// Maximum number of arenas. With the default 64MB arena this covers 64GB of heap.
pub const MAX_ARENAS: usize = 1024;

/// Number of pause durations kept in [GcStats](crate::statistics::GcStats).
pub const PAUSE_HISTORY: usize = 256;

/// Scan work an assist performs on top of its debt.
pub const GC_OVER_ASSIST_WORK: i64 = 64 << 10;
/// Scan work a background worker does before publishing it as credit.
pub const GC_CREDIT_SLACK: i64 = 2000;

#[inline(always)]
pub const fn align_down(addr: usize, align: usize) -> usize {
    addr & !align.wrapping_sub(1)
}

#[inline(always)]
pub const fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !align.wrapping_sub(1)
}

#[inline(always)]
pub const fn is_aligned(addr: usize, align: usize) -> bool {
    addr & align.wrapping_sub(1) == 0
}

#[inline(always)]
pub const fn pages_for(bytes: usize) -> usize {
    (bytes + PAGE_SIZE - 1) >> PAGE_SHIFT
}
