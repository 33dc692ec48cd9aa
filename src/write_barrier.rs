//! Pointer store barrier.
//!
//! While marking, a store shades both the overwritten pointer and the new one.
//! Shading the old value keeps every object reachable at the start of the
//! cycle alive even though each stack is scanned only once; shading the new
//! value covers pointers taken from stacks that were not scanned yet. Objects
//! allocated during marking start black.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    globals::WB_BUF_LEN,
    heap::HeapInner,
    marking::{self, Shade},
    mutator::MutatorShared,
};

/// `*slot = new` with the barrier applied.
#[inline(always)]
pub(crate) fn barrier_store(heap: &HeapInner, mutator: &MutatorShared, slot: &AtomicUsize, new: usize) {
    if heap.collector.wb_enabled() {
        barrier_store_slow(heap, mutator, slot, new);
    } else {
        slot.store(new, Ordering::Release);
    }
}

#[cold]
#[inline(never)]
fn barrier_store_slow(heap: &HeapInner, mutator: &MutatorShared, slot: &AtomicUsize, new: usize) {
    let old = slot.swap(new, Ordering::AcqRel);
    shade(heap, mutator, old);
    shade(heap, mutator, new);
}

/// Shade `addr` from mutator context. Gray objects go to the mutator's barrier
/// buffer, or straight to the shared queue once the collector asked for
/// prompt publication.
pub(crate) fn shade(heap: &HeapInner, mutator: &MutatorShared, addr: usize) {
    match marking::shade(heap, addr) {
        Shade::Skip => {}
        Shade::Black(bytes) => heap.collector.flush_marked(bytes, 0),
        Shade::Gray(object, bytes) => {
            heap.collector.flush_marked(bytes, 0);
            if heap.collector.prompt() {
                heap.queue.push(object);
                heap.collector.marker.notify();
                return;
            }
            let mut buf = mutator.wb_buf.lock();
            buf.push(object);
            if buf.len() >= WB_BUF_LEN {
                heap.queue.push_all(buf.drain(..));
                drop(buf);
                heap.collector.marker.notify();
            }
        }
    }
}

/// Publish the mutator's buffered gray objects. Returns how many there were.
pub(crate) fn flush(heap: &HeapInner, mutator: &MutatorShared) -> usize {
    let mut buf = mutator.wb_buf.lock();
    let count = buf.len();
    if count != 0 {
        heap.queue.push_all(buf.drain(..));
        drop(buf);
        heap.collector.marker.notify();
    }
    count
}
