//! Marking: shading objects, scanning them through their pointer masks, the
//! background mark workers and mutator assists.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{
    collector::GcPhase,
    globals::{GC_OVER_ASSIST_WORK, WORD},
    gray_queue::GcWork,
    heap::HeapInner,
    heap_corruption,
    mutator::Mutator,
    util::word_at,
};

/// Scan work a background worker does between checks for a stop request.
const MARK_SLICE: i64 = 64 * 1024;

/// Result of shading one pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Shade {
    /// Null, not a heap address, or already marked.
    Skip,
    /// Newly marked object without pointer fields. Carries its size.
    Black(usize),
    /// Newly marked object that must be scanned: base address and size.
    Gray(usize, usize),
}

/// Set the mark bit of the object containing `addr`.
#[inline]
pub(crate) fn shade(heap: &HeapInner, addr: usize) -> Shade {
    if addr == 0 {
        return Shade::Skip;
    }
    let (span, slot) = match heap.allocator.find_object(addr) {
        Some(found) => found,
        None => return Shade::Skip,
    };
    if span.test_and_mark(slot) {
        return Shade::Skip;
    }
    if heap.info.gc_info_for_scan(span.type_of(slot)).has_pointers {
        Shade::Gray(span.slot_addr(slot), span.elem_size)
    } else {
        Shade::Black(span.elem_size)
    }
}

/// Shade `addr` and queue it on `work` if it has to be scanned.
#[inline]
pub(crate) fn mark_root(heap: &HeapInner, work: &mut GcWork<'_>, addr: usize) {
    match shade(heap, addr) {
        Shade::Skip => {}
        Shade::Black(bytes) => work.bytes_marked += bytes,
        Shade::Gray(object, bytes) => {
            work.bytes_marked += bytes;
            work.push(object);
        }
    }
}

/// Shade every pointer field of the gray object at `object`. Returns the scan
/// work done in bytes.
pub(crate) fn scan_object(heap: &HeapInner, work: &mut GcWork<'_>, object: usize) -> i64 {
    let (span, slot) = match heap.allocator.find_object(object) {
        Some(found) => found,
        None => heap_corruption!("gray object {:#x} outside of the heap", object),
    };
    let info = heap.info.gc_info_for_scan(span.type_of(slot));
    // The slot holds a whole number of elements; the mask repeats per element.
    let elements = span.elem_size / info.size;
    let words = elements * info.mask.words();
    let base = span.slot_addr(slot);
    for word in info.mask.pointer_words(words) {
        let target = unsafe { word_at(base + word * WORD) }.load(Ordering::Acquire);
        mark_root(heap, work, target);
    }
    let scanned = span.elem_size as i64;
    work.scan_work += scanned;
    scanned
}

/// Scan gray objects until `budget` bytes were scanned or no work is left.
pub(crate) fn drain(heap: &HeapInner, work: &mut GcWork<'_>, budget: i64) -> i64 {
    let mut done = 0;
    while done < budget {
        match work.pop() {
            Some(object) => done += scan_object(heap, work, object),
            None => break,
        }
    }
    done
}

struct MarkState {
    active: bool,
    busy: usize,
    shutdown: bool,
}

/// Start/stop handshake between the coordinator and the mark workers.
pub(crate) struct MarkSignal {
    state: Mutex<MarkState>,
    active: AtomicBool,
    cv_work: Condvar,
    cv_idle: Condvar,
}

impl MarkSignal {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MarkState {
                active: false,
                busy: 0,
                shutdown: false,
            }),
            active: AtomicBool::new(false),
            cv_work: Condvar::new(),
            cv_idle: Condvar::new(),
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn start(&self) {
        let mut state = self.state.lock();
        state.active = true;
        self.active.store(true, Ordering::Release);
        self.cv_work.notify_all();
    }

    /// Deactivate the workers and wait until none is draining. Their local
    /// work is back in the shared queue once this returns.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.active = false;
        self.active.store(false, Ordering::Release);
        while state.busy > 0 {
            self.cv_idle.wait(&mut state);
        }
    }

    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        state.active = false;
        self.active.store(false, Ordering::Release);
        self.cv_work.notify_all();
    }

    /// New gray objects were published to the shared queue.
    pub fn notify(&self) {
        if self.is_active() {
            self.cv_work.notify_one();
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state.lock().busy == 0
    }

    /// Wait until no worker is draining and `done` holds, or `timeout` passes.
    pub fn wait_idle(&self, timeout: Duration, done: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.busy == 0 && done() {
                return true;
            }
            if self.cv_idle.wait_until(&mut state, deadline).timed_out() {
                return state.busy == 0 && done();
            }
        }
    }

    /// Block until marking is active and `has_work` holds. Returns `false`
    /// on shutdown.
    fn begin_work(&self, has_work: impl Fn() -> bool) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return false;
            }
            if state.active && has_work() {
                state.busy += 1;
                return true;
            }
            // Barrier buffers are published without a wakeup; poll for them.
            self.cv_work.wait_for(&mut state, Duration::from_millis(1));
        }
    }

    fn end_work(&self) {
        let mut state = self.state.lock();
        state.busy -= 1;
        self.cv_idle.notify_all();
    }
}

impl Default for MarkSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Body of a dedicated background mark worker thread.
pub(crate) fn mark_worker(heap: Arc<HeapInner>, index: usize) {
    let collector = &heap.collector;
    let mut work = heap.queue.register();
    log::debug!("mark worker {} started", index);
    while collector.marker.begin_work(|| !heap.queue.is_empty()) {
        let start = Instant::now();
        while collector.marker.is_active() {
            let done = drain(&heap, &mut work, MARK_SLICE);
            let scan = work.take_scan_work();
            collector.flush_marked(work.take_bytes_marked(), scan);
            collector.add_bg_credit(scan);
            if done < MARK_SLICE {
                break;
            }
        }
        work.dispose();
        collector.add_bg_time(start.elapsed());
        collector.marker.end_work();
    }
    log::debug!("mark worker {} exiting", index);
}

/// Pay off the allocation debt of `mutator` with mark work.
///
/// Credit the background workers banked is stolen first. What remains is paid
/// by scanning, rounded up to [GC_OVER_ASSIST_WORK]. With nothing to scan the
/// mutator parks until workers publish credit or marking ends.
pub(crate) fn assist_alloc(mutator: &Mutator) {
    let heap = &*mutator.heap;
    let collector = &heap.collector;
    let shared = &*mutator.shared;
    loop {
        if collector.phase() != GcPhase::Marking {
            // Debt does not carry over into the next cycle.
            shared.assist_bytes.store(0, Ordering::Relaxed);
            return;
        }
        let debt = -shared.assist_bytes.load(Ordering::Relaxed);
        let ratio = collector.assist_ratio();
        if debt <= 0 || ratio <= 0.0 {
            return;
        }
        let scan_debt = ((debt as f64 * ratio) as i64).max(1);

        let stolen = collector.steal_bg_credit(scan_debt);
        if stolen > 0 {
            shared
                .assist_bytes
                .fetch_add((stolen as f64 / ratio) as i64 + 1, Ordering::Relaxed);
            if stolen >= scan_debt {
                return;
            }
            continue;
        }

        let start = Instant::now();
        let mut work = heap.queue.local();
        let done = drain(heap, &mut work, scan_debt.max(GC_OVER_ASSIST_WORK));
        let scan = work.take_scan_work();
        collector.flush_marked(work.take_bytes_marked(), scan);
        drop(work);
        collector.add_assist_time(start.elapsed());

        if done > 0 {
            shared
                .assist_bytes
                .fetch_add((done as f64 / ratio) as i64 + 1, Ordering::Relaxed);
            continue;
        }
        if collector.workers == 0 {
            // Nobody will bank credit; marking is driven by the collecting thread.
            shared.assist_bytes.store(0, Ordering::Relaxed);
            return;
        }
        mutator.blocking(|| collector.wait_for_credit(Duration::from_millis(1)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_signal_handshake() {
        let signal = Arc::new(MarkSignal::new());
        assert!(signal.is_idle());
        signal.start();
        assert!(signal.is_active());
        assert!(signal.begin_work(|| true));
        assert!(!signal.is_idle());
        let stopper = {
            let signal = signal.clone();
            std::thread::spawn(move || signal.stop())
        };
        std::thread::sleep(Duration::from_millis(5));
        signal.end_work();
        stopper.join().unwrap();
        assert!(!signal.is_active());
        assert!(signal.is_idle());
        signal.shutdown();
        assert!(!signal.begin_work(|| true));
    }

    #[test]
    fn test_wait_idle_times_out() {
        let signal = MarkSignal::new();
        assert!(signal.wait_idle(Duration::from_millis(1), || true));
        assert!(!signal.wait_idle(Duration::from_millis(1), || false));
    }
}
