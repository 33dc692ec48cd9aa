//! Arenas and the page level allocator spans are carved from.

use std::{
    collections::BTreeMap,
    ptr::null_mut,
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

use crate::{
    globals::{align_up, PAGE_SHIFT, PAGE_SIZE, MAX_ARENAS},
    mmap::Mmap,
    span::Span,
};

/// A reserved range of pages plus a map from each page to the span covering it.
pub struct Arena {
    map: Mmap,
    pages: Box<[AtomicPtr<Span>]>,
}

impl Arena {
    fn new(size: usize) -> Option<Self> {
        let map = Mmap::new(size)?;
        let npages = size / PAGE_SIZE;
        Some(Self {
            map,
            pages: (0..npages).map(|_| AtomicPtr::new(null_mut())).collect(),
        })
    }

    #[inline]
    pub fn start(&self) -> usize {
        self.map.start()
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.map.end()
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start() && addr < self.end()
    }

    #[inline]
    fn page_index(&self, addr: usize) -> usize {
        (addr - self.start()) >> PAGE_SHIFT
    }

    #[inline]
    pub fn span_at(&self, addr: usize) -> *const Span {
        self.pages[self.page_index(addr)].load(Ordering::Acquire)
    }

    fn set_span(&self, base: usize, npages: usize, span: *const Span) {
        let first = self.page_index(base);
        for page in &self.pages[first..first + npages] {
            page.store(span as *mut Span, Ordering::Release);
        }
    }
}

/// Fixed table of arenas that readers can search without taking a lock.
pub struct ArenaSet {
    arenas: Box<[AtomicPtr<Arena>]>,
    count: AtomicUsize,
}

impl ArenaSet {
    pub fn new() -> Self {
        Self {
            arenas: (0..MAX_ARENAS).map(|_| AtomicPtr::new(null_mut())).collect(),
            count: AtomicUsize::new(0),
        }
    }

    /// Caller holds the page heap lock.
    fn push(&self, arena: Arena) -> Option<usize> {
        let index = self.count.load(Ordering::Relaxed);
        if index >= self.arenas.len() {
            return None;
        }
        self.arenas[index].store(Box::into_raw(Box::new(arena)), Ordering::Release);
        self.count.store(index + 1, Ordering::Release);
        Some(index)
    }

    #[inline]
    pub fn get(&self, index: usize) -> &Arena {
        unsafe { &*self.arenas[index].load(Ordering::Acquire) }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find(&self, addr: usize) -> Option<&Arena> {
        (0..self.len()).map(|i| self.get(i)).find(|a| a.contains(addr))
    }

    fn find_index(&self, addr: usize) -> Option<usize> {
        (0..self.len()).find(|&i| self.get(i).contains(addr))
    }

    /// Span covering `addr`, or null when `addr` is in an arena page that no
    /// span owns. `None` means `addr` is not heap memory at all.
    #[inline]
    pub fn span_of(&self, addr: usize) -> Option<*const Span> {
        self.find(addr).map(|arena| arena.span_at(addr))
    }

    pub fn set_span(&self, span: &Span) {
        if let Some(arena) = self.find(span.base) {
            arena.set_span(span.base, span.npages, span as *const Span);
        }
    }

    pub fn clear_span(&self, span: &Span) {
        if let Some(arena) = self.find(span.base) {
            arena.set_span(span.base, span.npages, null_mut());
        }
    }

    pub fn mapped_bytes(&self) -> usize {
        (0..self.len()).map(|i| self.get(i).map.mapped_len()).sum()
    }
}

impl Default for ArenaSet {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ArenaSet {
    fn drop(&mut self) {
        for slot in self.arenas.iter() {
            let arena = slot.swap(null_mut(), Ordering::AcqRel);
            if !arena.is_null() {
                unsafe {
                    drop(Box::from_raw(arena));
                }
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct FreeRun {
    npages: usize,
    arena: usize,
    /// Pages were handed back to the OS.
    scavenged: bool,
}

/// Free page runs keyed by start address. Guarded by the allocator's page lock.
pub struct PageHeap {
    free: BTreeMap<usize, FreeRun>,
    arena_size: usize,
    heap_limit: usize,
    pub pages_inuse: usize,
    pub pages_free: usize,
    pub pages_released: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageError {
    /// Allocation would exceed the configured heap limit.
    Limit,
    /// The OS refused to map another arena.
    Exhausted,
}

impl PageHeap {
    pub fn new(arena_size: usize, heap_limit: usize) -> Self {
        Self {
            free: BTreeMap::new(),
            arena_size,
            heap_limit,
            pages_inuse: 0,
            pages_free: 0,
            pages_released: 0,
        }
    }

    /// Allocate `npages` contiguous pages, mapping a new arena when no free run
    /// is large enough. Returns the base address.
    pub fn alloc(&mut self, arenas: &ArenaSet, npages: usize) -> Result<usize, PageError> {
        if self.heap_limit != 0 && (self.pages_inuse + npages) * PAGE_SIZE > self.heap_limit {
            return Err(PageError::Limit);
        }
        let found = self
            .free
            .iter()
            .find(|(_, run)| run.npages >= npages)
            .map(|(&start, &run)| (start, run));
        let (start, run) = match found {
            Some(found) => found,
            None => {
                self.grow(arenas, npages)?;
                self.free
                    .iter()
                    .find(|(_, run)| run.npages >= npages)
                    .map(|(&start, &run)| (start, run))
                    .ok_or(PageError::Exhausted)?
            }
        };
        self.free.remove(&start);
        if run.npages > npages {
            self.free.insert(
                start + npages * PAGE_SIZE,
                FreeRun {
                    npages: run.npages - npages,
                    ..run
                },
            );
        }
        if run.scavenged {
            let arena = arenas.get(run.arena);
            arena.map.commit(start, npages * PAGE_SIZE);
            self.pages_released = self.pages_released.saturating_sub(npages);
        }
        self.pages_free -= npages;
        self.pages_inuse += npages;
        Ok(start)
    }

    fn grow(&mut self, arenas: &ArenaSet, npages: usize) -> Result<(), PageError> {
        let size = align_up(self.arena_size.max(npages * PAGE_SIZE), PAGE_SIZE);
        let arena = Arena::new(size).ok_or(PageError::Exhausted)?;
        let start = arena.start();
        let index = arenas.push(arena).ok_or(PageError::Exhausted)?;
        log::debug!(
            "mapped arena {} at {:#x} ({} pages)",
            index,
            start,
            size / PAGE_SIZE
        );
        self.insert_free(
            start,
            FreeRun {
                npages: size / PAGE_SIZE,
                arena: index,
                scavenged: false,
            },
        );
        self.pages_free += size / PAGE_SIZE;
        Ok(())
    }

    /// Return a run to the free map, merging it with neighbors from the same arena.
    pub fn free(&mut self, arenas: &ArenaSet, base: usize, npages: usize) {
        let arena = match arenas.find_index(base) {
            Some(arena) => arena,
            None => crate::heap_corruption!("freeing pages at {:#x} outside of any arena", base),
        };
        self.pages_inuse -= npages;
        self.pages_free += npages;
        self.insert_free(
            base,
            FreeRun {
                npages,
                arena,
                scavenged: false,
            },
        );
    }

    fn insert_free(&mut self, mut base: usize, mut run: FreeRun) {
        if let Some((&prev_start, &prev)) = self.free.range(..base).next_back() {
            let prev_end = prev_start + prev.npages * PAGE_SIZE;
            if prev_end > base {
                crate::heap_corruption!("page run at {:#x} freed twice", base);
            }
            if prev_end == base && prev.arena == run.arena {
                self.free.remove(&prev_start);
                base = prev_start;
                self.merge_run(&mut run, prev);
            }
        }
        let end = base + run.npages * PAGE_SIZE;
        if let Some(&next) = self.free.get(&end) {
            if next.arena == run.arena {
                self.free.remove(&end);
                self.merge_run(&mut run, next);
            }
        }
        self.free.insert(base, run);
    }

    /// A merged run is released only if both halves were. Otherwise the
    /// released half counts as held again until the next scavenge.
    fn merge_run(&mut self, run: &mut FreeRun, other: FreeRun) {
        if run.scavenged != other.scavenged {
            let held = if run.scavenged { run.npages } else { other.npages };
            self.pages_released = self.pages_released.saturating_sub(held);
            run.scavenged = false;
        }
        run.npages += other.npages;
    }

    /// Release physical memory of every free run that still holds it.
    /// Returns the number of bytes released.
    pub fn scavenge(&mut self, arenas: &ArenaSet) -> usize {
        let mut released = 0;
        for (&start, run) in self.free.iter_mut() {
            if run.scavenged {
                continue;
            }
            arenas.get(run.arena).map.dontneed(start, run.npages * PAGE_SIZE);
            run.scavenged = true;
            released += run.npages * PAGE_SIZE;
        }
        self.pages_released += released / PAGE_SIZE;
        released
    }

    pub fn heap_limit(&self) -> usize {
        self.heap_limit
    }

    pub fn free_runs(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free_coalesce() {
        let arenas = ArenaSet::new();
        let mut heap = PageHeap::new(64 * PAGE_SIZE, 0);
        let a = heap.alloc(&arenas, 4).ok().unwrap();
        let b = heap.alloc(&arenas, 4).ok().unwrap();
        let c = heap.alloc(&arenas, 8).ok().unwrap();
        assert_eq!(arenas.len(), 1);
        assert_eq!(b, a + 4 * PAGE_SIZE);
        assert_eq!(c, b + 4 * PAGE_SIZE);
        assert_eq!(heap.pages_inuse, 16);
        heap.free(&arenas, b, 4);
        // first fit reuses the hole
        let d = heap.alloc(&arenas, 2).ok().unwrap();
        assert_eq!(d, b);
        heap.free(&arenas, d, 2);
        heap.free(&arenas, a, 4);
        heap.free(&arenas, c, 8);
        assert_eq!(heap.free_runs(), 1);
        assert_eq!(heap.pages_inuse, 0);
        assert_eq!(heap.pages_free, 64);
    }

    #[test]
    fn test_grow_and_limit() {
        let arenas = ArenaSet::new();
        let mut heap = PageHeap::new(8 * PAGE_SIZE, 16 * PAGE_SIZE);
        let big = heap.alloc(&arenas, 12).ok().unwrap();
        assert!(arenas.find(big).is_some());
        assert!(heap.alloc(&arenas, 4).is_ok());
        assert!(matches!(heap.alloc(&arenas, 1), Err(PageError::Limit)));
        heap.free(&arenas, big, 12);
        assert!(heap.alloc(&arenas, 8).is_ok());
    }

    #[test]
    fn test_scavenge() {
        let arenas = ArenaSet::new();
        let mut heap = PageHeap::new(16 * PAGE_SIZE, 0);
        let a = heap.alloc(&arenas, 4).ok().unwrap();
        unsafe {
            *(a as *mut usize) = 42;
        }
        heap.free(&arenas, a, 4);
        assert_eq!(heap.scavenge(&arenas), 16 * PAGE_SIZE);
        assert_eq!(heap.scavenge(&arenas), 0);
        let b = heap.alloc(&arenas, 4).ok().unwrap();
        assert_eq!(a, b);
        assert_eq!(heap.pages_released, 12);
    }

    #[test]
    fn test_scavenge_after_merge() {
        let arenas = ArenaSet::new();
        let mut heap = PageHeap::new(16 * PAGE_SIZE, 0);
        let a = heap.alloc(&arenas, 4).ok().unwrap();
        let b = heap.alloc(&arenas, 4).ok().unwrap();
        heap.free(&arenas, a, 4);
        assert_eq!(heap.scavenge(&arenas), 12 * PAGE_SIZE);
        assert_eq!(heap.pages_released, 12);
        // b joins both released neighbors
        heap.free(&arenas, b, 4);
        assert_eq!(heap.free_runs(), 1);
        assert_eq!(heap.pages_released, 0);
        assert_eq!(heap.scavenge(&arenas), 16 * PAGE_SIZE);
        assert_eq!(heap.pages_released, 16);
        assert!(heap.pages_released <= heap.pages_free);
    }
}
