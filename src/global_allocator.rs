//! Span allocator shared by all mutators. Mutators allocate slots through their
//! [AllocCache](crate::local_allocator::AllocCache); this module hands them
//! spans, carves new spans from the page heap, and takes back what the
//! sweeper frees.
//!
//! Lock order: a span's lock may be taken before a central list, the page heap
//! or the registry, never the other way around.

use std::sync::{
    atomic::{AtomicU32, AtomicUsize, Ordering},
    Arc,
};

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::{
    error::GcError,
    globals::{align_up, PAGE_SIZE, WORD},
    heap_corruption,
    page_heap::{ArenaSet, PageError, PageHeap},
    size_class::{SizeClasses, LARGE_CLASS},
    span::{Span, SpanList, SweepOutcome},
};

/// Per class span lists.
#[derive(Default)]
pub struct Central {
    /// Swept spans with at least one free slot.
    partial: Mutex<Vec<Arc<Span>>>,
    /// Spans left over from the last mark phase that still need sweeping.
    unswept: Mutex<Vec<Arc<Span>>>,
}

#[derive(Default)]
pub struct AllocCounters {
    /// Bytes in allocated slots, including garbage not yet swept.
    pub heap_live: AtomicUsize,
    pub total_alloc: AtomicUsize,
    pub mallocs: AtomicUsize,
    pub frees: AtomicUsize,
    pub large_allocs: AtomicUsize,
}

pub struct SpanAllocator {
    pub classes: SizeClasses,
    central: Box<[Central]>,
    large_unswept: Mutex<Vec<Arc<Span>>>,
    pages: Mutex<PageHeap>,
    pub arenas: ArenaSet,
    registry: Mutex<HashMap<usize, Arc<Span>, ahash::RandomState>>,
    sweepgen: AtomicU32,
    pub counters: AllocCounters,
}

/// Where a freshly swept span should go.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SweepMode {
    /// Background sweeper. Empty spans are released to the page heap.
    Release,
    /// Allocation path. A span with room is kept for the calling cache.
    Preserve,
}

impl SpanAllocator {
    pub fn new(progression: f64, arena_size: usize, heap_limit: usize, verbose: bool) -> Self {
        let classes = SizeClasses::new(progression, verbose);
        let central = (0..=classes.len()).map(|_| Central::default()).collect();
        Self {
            classes,
            central,
            large_unswept: Mutex::new(Vec::new()),
            pages: Mutex::new(PageHeap::new(arena_size, heap_limit)),
            arenas: ArenaSet::new(),
            registry: Mutex::new(HashMap::with_hasher(ahash::RandomState::new())),
            sweepgen: AtomicU32::new(0),
            counters: AllocCounters::default(),
        }
    }

    #[inline]
    pub fn sweepgen(&self) -> u32 {
        self.sweepgen.load(Ordering::Acquire)
    }

    fn page_error(&self, err: PageError, requested: usize) -> GcError {
        let heap_limit = match err {
            PageError::Limit => self.heap_limit(),
            PageError::Exhausted => 0,
        };
        GcError::OutOfMemory {
            requested,
            heap_limit,
        }
    }

    pub fn heap_limit(&self) -> usize {
        self.pages.lock().heap_limit()
    }

    fn new_span(&self, npages: usize, class: u8, elem_size: usize) -> Result<Arc<Span>, GcError> {
        let base = self
            .pages
            .lock()
            .alloc(&self.arenas, npages)
            .map_err(|err| self.page_error(err, npages * PAGE_SIZE))?;
        let span = Arc::new(Span::new(base, npages, class, elem_size, self.sweepgen()));
        self.arenas.set_span(&span);
        self.registry.lock().insert(base, span.clone());
        Ok(span)
    }

    fn release_span(&self, span: &Arc<Span>) {
        self.arenas.clear_span(span);
        self.registry.lock().remove(&span.base);
        self.pages.lock().free(&self.arenas, span.base, span.npages);
    }

    /// Find a span with a free slot for `class` and hand it to a cache. Tries
    /// swept partial spans first, then sweeps leftover spans of the class, and
    /// only then carves a new span.
    pub fn refill(&self, class: u8) -> Result<Arc<Span>, GcError> {
        let central = &self.central[class as usize];
        loop {
            let next = central.partial.lock().pop();
            let span = match next {
                Some(span) => span,
                None => break,
            };
            let mut state = span.lock();
            if state.list != SpanList::Partial {
                continue;
            }
            state.list = SpanList::Cached;
            drop(state);
            return Ok(span);
        }
        loop {
            let next = central.unswept.lock().pop();
            let span = match next {
                Some(span) => span,
                None => break,
            };
            if self.sweep_span(&span, SweepMode::Preserve) == Some(true) {
                return Ok(span);
            }
        }
        let class_info = self.classes.get(class);
        let span = self.new_span(class_info.npages, class, class_info.size)?;
        span.lock().list = SpanList::Cached;
        Ok(span)
    }

    /// Give a cached span back. Used when a cache is flushed outside of mark
    /// termination.
    pub fn uncache(&self, span: Arc<Span>) {
        let mut state = span.lock();
        if state.list != SpanList::Cached {
            return;
        }
        if state.allocated == span.nelems {
            state.list = SpanList::Full;
            return;
        }
        state.list = SpanList::Partial;
        drop(state);
        self.central[span.class as usize].partial.lock().push(span);
    }

    /// Allocate a dedicated span for one object of `size` bytes. The object
    /// sits in slot 0; `elem_size` holds its size rounded to words.
    pub fn alloc_large(&self, size: usize) -> Result<Arc<Span>, GcError> {
        let elem_size = align_up(size, WORD);
        let npages = align_up(elem_size, PAGE_SIZE) / PAGE_SIZE;
        let span = self.new_span(npages, LARGE_CLASS, elem_size)?;
        {
            let mut state = span.lock();
            if span.alloc_slot(&mut state).is_none() {
                heap_corruption!("fresh large span {:#x} has no free slot", span.base);
            }
            state.list = SpanList::Full;
        }
        self.counters.large_allocs.fetch_add(1, Ordering::Relaxed);
        Ok(span)
    }

    pub fn note_alloc(&self, bytes: usize) -> usize {
        self.counters.mallocs.fetch_add(1, Ordering::Relaxed);
        self.counters.total_alloc.fetch_add(bytes, Ordering::Relaxed);
        self.counters.heap_live.fetch_add(bytes, Ordering::Relaxed) + bytes
    }

    #[inline]
    pub fn heap_live(&self) -> usize {
        self.counters.heap_live.load(Ordering::Relaxed)
    }

    /// Span and slot of the object containing `addr`.
    ///
    /// `None` when `addr` is not heap memory. Pointers into pages no span owns
    /// or into free slots abort the process: a live object pointed there.
    ///
    /// A span is released only after sweeping finds it empty, so the span of a
    /// live object outlives any reference returned here.
    #[inline]
    pub fn find_object(&self, addr: usize) -> Option<(&Span, usize)> {
        let span = self.arenas.span_of(addr)?;
        if span.is_null() {
            heap_corruption!("pointer {:#x} into unused heap page", addr);
        }
        let span = unsafe { &*span };
        let slot = match span.slot_of(addr) {
            Some(slot) => slot,
            None => heap_corruption!("pointer {:#x} past the last slot of span {:#x}", addr, span.base),
        };
        if !span.is_allocated(slot) {
            heap_corruption!(
                "pointer {:#x} to free slot {} of span {:#x} (class {})",
                addr,
                slot,
                span.base,
                span.class
            );
        }
        Some((span, slot))
    }

    /// Like [SpanAllocator::find_object] but reports free slots and unused
    /// pages as `None` instead of aborting.
    pub fn lookup_allocated(&self, addr: usize) -> Option<(&Span, usize)> {
        let span = self.arenas.span_of(addr)?;
        if span.is_null() {
            return None;
        }
        let span = unsafe { &*span };
        let slot = span.slot_of(addr)?;
        if span.is_allocated(slot) {
            Some((span, slot))
        } else {
            None
        }
    }

    /// Sweep `span` if it still belongs to the previous mark phase.
    ///
    /// Returns `None` when another thread already swept it. With
    /// [SweepMode::Preserve] `Some(true)` means the span has free slots and
    /// is now cached by the caller.
    pub fn sweep_span(&self, span: &Arc<Span>, mode: SweepMode) -> Option<bool> {
        let sweepgen = self.sweepgen();
        let mut state = span.lock();
        if state.list != SpanList::Unswept || span.sweepgen() != sweepgen.wrapping_sub(2) {
            return None;
        }
        let result = span.sweep(&mut state);
        span.set_sweepgen(sweepgen);
        if result.freed != 0 {
            self.counters
                .heap_live
                .fetch_sub(result.freed * span.elem_size, Ordering::Relaxed);
            self.counters.frees.fetch_add(result.freed, Ordering::Relaxed);
        }
        let kept = match (result.outcome, mode) {
            (SweepOutcome::Full, _) => {
                state.list = SpanList::Full;
                false
            }
            (_, SweepMode::Preserve) if !span.is_large() => {
                state.list = SpanList::Cached;
                true
            }
            (SweepOutcome::Empty, _) => {
                state.list = SpanList::Free;
                drop(state);
                self.release_span(span);
                false
            }
            (SweepOutcome::Partial, _) => {
                state.list = SpanList::Partial;
                drop(state);
                self.central[span.class as usize].partial.lock().push(span.clone());
                false
            }
        };
        Some(kept)
    }

    /// Called with the world stopped at the end of marking, after every cache
    /// was flushed. Starts a new sweep generation and queues every span for
    /// sweeping. Returns the spans so the background sweeper can process them.
    pub fn prepare_sweep(&self) -> Vec<Arc<Span>> {
        let sweepgen = self.sweepgen.load(Ordering::Relaxed).wrapping_add(2);
        self.sweepgen.store(sweepgen, Ordering::Release);
        for central in self.central.iter() {
            central.partial.lock().clear();
            central.unswept.lock().clear();
        }
        self.large_unswept.lock().clear();

        let spans: Vec<Arc<Span>> = self.registry.lock().values().cloned().collect();
        for span in spans.iter() {
            let mut state = span.lock();
            match state.list {
                SpanList::Cached => heap_corruption!(
                    "span {:#x} still cached at the end of marking",
                    span.base
                ),
                SpanList::Free => heap_corruption!("released span {:#x} in registry", span.base),
                _ => {}
            }
            if span.sweepgen() != sweepgen.wrapping_sub(2) {
                heap_corruption!(
                    "span {:#x} has sweepgen {} but the heap is at {}",
                    span.base,
                    span.sweepgen(),
                    sweepgen
                );
            }
            state.list = SpanList::Unswept;
            drop(state);
            if span.is_large() {
                self.large_unswept.lock().push(span.clone());
            } else {
                self.central[span.class as usize].unswept.lock().push(span.clone());
            }
        }
        spans
    }

    /// Drop the per class leftover lists once the background sweeper has
    /// processed every span.
    pub fn finish_sweep(&self) {
        for central in self.central.iter() {
            central.unswept.lock().clear();
        }
        self.large_unswept.lock().clear();
    }

    pub fn scavenge(&self) -> usize {
        self.pages.lock().scavenge(&self.arenas)
    }

    /// Snapshot of every span. Sorted by address.
    pub fn spans(&self) -> Vec<Arc<Span>> {
        let mut spans: Vec<_> = self.registry.lock().values().cloned().collect();
        spans.sort_by_key(|s| s.base);
        spans
    }

    pub fn page_stats(&self) -> (usize, usize, usize) {
        let pages = self.pages.lock();
        (
            pages.pages_inuse * PAGE_SIZE,
            pages.pages_free * PAGE_SIZE,
            pages.pages_released * PAGE_SIZE,
        )
    }

    pub fn mapped_bytes(&self) -> usize {
        self.arenas.mapped_bytes()
    }
}
