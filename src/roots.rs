//! Root enumeration: global slots, marking constraints and mutator stacks.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::{Mutex, RwLock};

use crate::{
    gray_queue::GcWork,
    heap::HeapInner,
    heap_corruption,
    marking::mark_root,
    mutator::{MutatorShared, POLL_SCAN},
    safepoint::Scheduler,
};

/// Receives root pointers reported by a [MarkingConstraint].
pub trait RootSink {
    fn visit(&mut self, addr: usize);
}

/// Additional root provider, e.g. a handle table owned by the embedder. Runs
/// when marking starts and again during mark termination.
pub trait MarkingConstraint: Send {
    fn name(&self) -> &str;
    /// Returns `true` once the constraint has nothing left to report. It is
    /// then removed from the heap.
    fn is_over(&self) -> bool {
        false
    }
    fn run(&mut self, sink: &mut dyn RootSink);
}

/// Index of a global root slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GlobalId(pub(crate) usize);

impl GlobalId {
    pub fn index(self) -> usize {
        self.0
    }
}

pub struct Roots {
    globals: RwLock<Vec<Box<AtomicUsize>>>,
    pub(crate) constraints: Mutex<Vec<Box<dyn MarkingConstraint>>>,
}

impl Roots {
    pub fn new() -> Self {
        Self {
            globals: RwLock::new(Vec::new()),
            constraints: Mutex::new(Vec::new()),
        }
    }

    pub fn add_global(&self) -> GlobalId {
        let mut globals = self.globals.write();
        globals.push(Box::new(AtomicUsize::new(0)));
        GlobalId(globals.len() - 1)
    }

    pub fn with_global<R>(&self, id: GlobalId, f: impl FnOnce(&AtomicUsize) -> R) -> R {
        let globals = self.globals.read();
        match globals.get(id.0) {
            Some(slot) => f(slot),
            None => panic!("unknown global root {}", id.0),
        }
    }

    pub fn for_each_global(&self, mut f: impl FnMut(GlobalId, usize)) {
        for (index, slot) in self.globals.read().iter().enumerate() {
            f(GlobalId(index), slot.load(Ordering::Acquire));
        }
    }

    pub fn add_constraint(&self, constraint: Box<dyn MarkingConstraint>) {
        self.constraints.lock().push(constraint);
    }

    pub fn constraint_count(&self) -> usize {
        self.constraints.lock().len()
    }
}

impl Default for Roots {
    fn default() -> Self {
        Self::new()
    }
}

struct MarkSink<'h, 'w, 'q> {
    heap: &'h HeapInner,
    work: &'w mut GcWork<'q>,
}

impl RootSink for MarkSink<'_, '_, '_> {
    fn visit(&mut self, addr: usize) {
        mark_root(self.heap, self.work, addr);
    }
}

/// Globals, and objects whose finalizer is queued or running.
pub(crate) fn scan_globals(heap: &HeapInner, work: &mut GcWork<'_>) {
    heap.roots.for_each_global(|_, addr| mark_root(heap, work, addr));
    heap.finalizers.for_each_ready(|addr| mark_root(heap, work, addr));
}

pub(crate) fn run_constraints(heap: &HeapInner, work: &mut GcWork<'_>) {
    let mut constraints = heap.roots.constraints.lock();
    constraints.retain(|constraint| {
        if constraint.is_over() {
            log::debug!("marking constraint '{}' is over", constraint.name());
            return false;
        }
        true
    });
    let mut sink = MarkSink { heap, work };
    for constraint in constraints.iter_mut() {
        constraint.run(&mut sink);
    }
}

/// Shade every pointer slot of every frame on `mutator`'s shadow stack. The
/// mutator is parked or is the calling thread.
pub(crate) fn scan_stack(heap: &HeapInner, mutator: &MutatorShared, work: &mut GcWork<'_>) {
    let stack = mutator.stack.lock();
    stack.walk(|depth, frame| {
        let info = match heap.info.get_frame_info(frame.id) {
            Some(info) => info,
            None => heap_corruption!(
                "frame {} of mutator {} has unknown stack map {}",
                depth,
                mutator.id,
                frame.id.as_u32()
            ),
        };
        if info.slots != frame.slots.len() {
            heap_corruption!(
                "frame {} of mutator {} has {} slots, its stack map {} describes {}",
                depth,
                mutator.id,
                frame.slots.len(),
                info.name,
                info.slots
            );
        }
        for slot in info.mask.pointer_words(info.slots) {
            mark_root(heap, work, frame.slots[slot]);
        }
    });
}

impl HeapInner {
    /// Safe point handler: scan the calling mutator's own stack if the running
    /// cycle still needs it.
    pub(crate) fn scan_own_stack(&self, mutator: &MutatorShared) {
        mutator.poll.fetch_and(!POLL_SCAN, Ordering::AcqRel);
        let cycle = self.collector.cycle();
        if !self.collector.wb_enabled() || mutator.scanned_cycle.load(Ordering::Acquire) >= cycle {
            return;
        }
        let mut work = self.queue.local();
        scan_stack(self, mutator, &mut work);
        self.collector.flush_work(&mut work);
        drop(work);
        mutator.scanned_cycle.store(cycle, Ordering::Release);
        self.collector.marker.notify();
        self.safepoint.notify_progress();
    }

    /// Scan one mutator's stack on the collector's side if it is parked.
    /// Returns `false` if the mutator is running and has to scan itself.
    fn try_scan_parked(&self, mutator: &Arc<MutatorShared>, cycle: u64, work: &mut GcWork<'_>) -> bool {
        if !self.safepoint.try_begin_scan(mutator) {
            return false;
        }
        if mutator.scanned_cycle.load(Ordering::Acquire) < cycle {
            scan_stack(self, mutator, work);
            mutator.scanned_cycle.store(cycle, Ordering::Release);
        }
        self.safepoint.end_scan(mutator);
        true
    }

    /// Make sure every mutator's stack was scanned once this cycle. Parked
    /// mutators are scanned right away; running ones are asked to scan
    /// themselves at their next safe point. A mutator that does not get there
    /// within `stack_scan_timeout` is reported and asked again.
    pub(crate) fn scan_stacks(&self) {
        let cycle = self.collector.cycle();
        let timeout = self.config.stack_scan_timeout;
        let mut since = Instant::now();
        loop {
            let mut pending = Vec::new();
            let mut work = self.queue.local();
            self.safepoint.for_each_task(&mut |mutator| {
                if mutator.scanned_cycle.load(Ordering::Acquire) >= cycle {
                    return;
                }
                if !self.try_scan_parked(mutator, cycle, &mut work) {
                    self.safepoint.request_safe_point(mutator);
                    pending.push(mutator.id);
                }
            });
            self.collector.flush_work(&mut work);
            drop(work);
            self.collector.marker.notify();
            if pending.is_empty() {
                return;
            }
            self.safepoint.wait_for_progress(Duration::from_millis(1));
            if since.elapsed() >= timeout {
                log::warn!(
                    "stack scan stalled: mutator(s) {:?} did not reach a safe point within {:?}",
                    pending,
                    since.elapsed()
                );
                since = Instant::now();
            }
        }
    }

    /// Stop-the-world fallback for stacks the concurrent phase missed.
    pub(crate) fn scan_remaining_stacks(&self, work: &mut GcWork<'_>) -> usize {
        let cycle = self.collector.cycle();
        let mut scanned = 0;
        self.safepoint.for_each_task(&mut |mutator| {
            if mutator.scanned_cycle.load(Ordering::Acquire) < cycle {
                scan_stack(self, mutator, work);
                mutator.scanned_cycle.store(cycle, Ordering::Release);
                scanned += 1;
            }
        });
        scanned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        runs: usize,
        limit: usize,
    }

    impl MarkingConstraint for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        fn is_over(&self) -> bool {
            self.runs >= self.limit
        }

        fn run(&mut self, sink: &mut dyn RootSink) {
            self.runs += 1;
            sink.visit(0);
        }
    }

    struct Collect(Vec<usize>);

    impl RootSink for Collect {
        fn visit(&mut self, addr: usize) {
            self.0.push(addr);
        }
    }

    #[test]
    fn test_globals() {
        let roots = Roots::new();
        let a = roots.add_global();
        let b = roots.add_global();
        assert_ne!(a, b);
        roots.with_global(b, |slot| slot.store(0x40, Ordering::Relaxed));
        let mut seen = vec![];
        roots.for_each_global(|id, addr| seen.push((id.index(), addr)));
        assert_eq!(seen, vec![(0, 0), (1, 0x40)]);
    }

    #[test]
    fn test_constraint_is_removed_when_over() {
        let roots = Roots::new();
        roots.add_constraint(Box::new(Counter { runs: 0, limit: 2 }));
        let mut sink = Collect(vec![]);
        for _ in 0..3 {
            let mut constraints = roots.constraints.lock();
            constraints.retain(|c| !c.is_over());
            for c in constraints.iter_mut() {
                c.run(&mut sink);
            }
        }
        assert_eq!(sink.0.len(), 2);
        assert_eq!(roots.constraint_count(), 0);
    }
}
