//! A span is a run of pages dedicated to one size class, or to a single large
//! object. Slot occupancy lives in `alloc_bits`; reachability in the current
//! cycle lives in `mark_bits`.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::{
    bitmap::AtomicBitmap,
    globals::{PAGE_SIZE, WORD},
    heap_corruption,
    size_class::LARGE_CLASS,
};

/// Which list currently owns the span. Only changed under the span lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpanList {
    /// Swept and has free slots; sits in its class's partial list.
    Partial,
    /// Owned by one mutator's allocation cache.
    Cached,
    /// No free slots. Reachable only through the span registry.
    Full,
    /// Waiting to be swept this cycle.
    Unswept,
    /// Pages returned to the page heap.
    Free,
}

pub struct SpanState {
    /// Slots below this index are known to be allocated.
    pub free_index: usize,
    pub allocated: usize,
    pub list: SpanList,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SweepOutcome {
    Empty,
    Partial,
    Full,
}

pub struct SweepResult {
    pub outcome: SweepOutcome,
    pub freed: usize,
}

pub struct Span {
    pub base: usize,
    pub npages: usize,
    pub class: u8,
    /// Bytes per slot. For a large span this is the object size rounded to words.
    pub elem_size: usize,
    pub nelems: usize,
    alloc_bits: AtomicBitmap,
    mark_bits: AtomicBitmap,
    /// Type index of the object in each slot, 0 when free.
    types: Box<[AtomicU32]>,
    sweepgen: AtomicU32,
    state: Mutex<SpanState>,
}

impl Span {
    pub fn new(base: usize, npages: usize, class: u8, elem_size: usize, sweepgen: u32) -> Self {
        let nelems = if class == LARGE_CLASS {
            1
        } else {
            (npages * PAGE_SIZE) / elem_size
        };
        Self {
            base,
            npages,
            class,
            elem_size,
            nelems,
            alloc_bits: AtomicBitmap::new(nelems),
            mark_bits: AtomicBitmap::new(nelems),
            types: (0..nelems).map(|_| AtomicU32::new(0)).collect(),
            sweepgen: AtomicU32::new(sweepgen),
            state: Mutex::new(SpanState {
                free_index: 0,
                allocated: 0,
                list: SpanList::Cached,
            }),
        }
    }

    #[inline]
    pub fn is_large(&self) -> bool {
        self.class == LARGE_CLASS
    }

    #[inline]
    pub fn limit(&self) -> usize {
        self.base + self.npages * PAGE_SIZE
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.limit()
    }

    /// Slot holding `addr`, or `None` when `addr` lands in the tail waste.
    #[inline]
    pub fn slot_of(&self, addr: usize) -> Option<usize> {
        let slot = (addr - self.base) / self.elem_size;
        if slot < self.nelems {
            Some(slot)
        } else {
            None
        }
    }

    #[inline]
    pub fn slot_addr(&self, slot: usize) -> usize {
        self.base + slot * self.elem_size
    }

    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, SpanState> {
        self.state.lock()
    }

    #[inline]
    pub fn sweepgen(&self) -> u32 {
        self.sweepgen.load(Ordering::Acquire)
    }

    pub(crate) fn set_sweepgen(&self, sweepgen: u32) {
        self.sweepgen.store(sweepgen, Ordering::Release);
    }

    #[inline]
    pub fn is_allocated(&self, slot: usize) -> bool {
        self.alloc_bits.test(slot)
    }

    #[inline]
    pub fn is_marked(&self, slot: usize) -> bool {
        self.mark_bits.test(slot)
    }

    /// Returns `true` if the slot was already marked.
    #[inline]
    pub fn test_and_mark(&self, slot: usize) -> bool {
        self.mark_bits.test_and_set(slot)
    }

    #[inline]
    pub fn type_of(&self, slot: usize) -> u32 {
        self.types[slot].load(Ordering::Acquire)
    }

    pub fn marked_count(&self) -> usize {
        self.mark_bits.count_ones()
    }

    pub fn allocated_count(&self) -> usize {
        self.alloc_bits.count_ones()
    }

    /// Claim the next free slot. The caller initializes the slot with
    /// [Span::init_slot] before the address escapes.
    pub fn alloc_slot(&self, state: &mut SpanState) -> Option<usize> {
        if state.allocated == self.nelems {
            return None;
        }
        let slot = self.alloc_bits.find_first_zero(state.free_index)?;
        if self.alloc_bits.set(slot) {
            heap_corruption!("slot {} of span {:#x} handed out twice", slot, self.base);
        }
        state.free_index = slot + 1;
        state.allocated += 1;
        Some(slot)
    }

    /// Zero the slot and record its type. With `black` set the object starts
    /// marked so the running cycle keeps it.
    pub fn init_slot(&self, slot: usize, type_index: u32, black: bool) -> usize {
        let addr = self.slot_addr(slot);
        unsafe {
            std::ptr::write_bytes(addr as *mut u8, 0, self.elem_size);
        }
        self.types[slot].store(type_index, Ordering::Release);
        if black {
            self.mark_bits.set(slot);
        }
        addr
    }

    /// Free every allocated slot that was not marked and reset marks for the
    /// next cycle. Caller holds the span lock and has checked the sweepgen.
    pub fn sweep(&self, state: &mut SpanState) -> SweepResult {
        self.mark_bits.for_each_set_not_in(&self.alloc_bits, |slot| {
            heap_corruption!(
                "slot {} of span {:#x} is marked but not allocated",
                slot,
                self.base
            );
        });
        let mut freed = 0;
        self.alloc_bits.for_each_set_not_in(&self.mark_bits, |slot| {
            if !self.alloc_bits.clear(slot) {
                heap_corruption!("double free of slot {} in span {:#x}", slot, self.base);
            }
            self.types[slot].store(0, Ordering::Relaxed);
            if cfg!(debug_assertions) {
                unsafe {
                    std::ptr::write_bytes(self.slot_addr(slot) as *mut u8, 0xdb, WORD);
                }
            }
            freed += 1;
        });
        self.mark_bits.clear_all();
        if freed > state.allocated {
            heap_corruption!(
                "span {:#x} freed {} slots but only {} were allocated",
                self.base,
                freed,
                state.allocated
            );
        }
        state.allocated -= freed;
        state.free_index = 0;
        let outcome = if state.allocated == 0 {
            SweepOutcome::Empty
        } else if state.allocated == self.nelems {
            SweepOutcome::Full
        } else {
            SweepOutcome::Partial
        };
        SweepResult { outcome, freed }
    }

    pub fn for_each_object(&self, mut f: impl FnMut(usize, usize)) {
        self.alloc_bits.for_each_set(|slot| f(slot, self.slot_addr(slot)));
    }
}
