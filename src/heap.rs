use std::{
    io::{self, Write},
    sync::{atomic::Ordering, Arc},
    thread::{self, JoinHandle},
};

use parking_lot::Mutex;
use scoped_threadpool::Pool;

use crate::{
    collector::{Collector, GcPhase},
    error::GcError,
    finalizer::FinalizerRegistry,
    gc_info_table::{FrameId, GcInfoTable, TypeIndex},
    global_allocator::SpanAllocator,
    gray_queue::GrayQueue,
    heap_dump,
    marking::mark_worker,
    mutator::Mutator,
    roots::{GlobalId, MarkingConstraint, Roots},
    safepoint::{GlobalSafepoint, Scheduler},
    statistics::GcStats,
    weak::WeakRegistry,
    Config,
};

/// Everything the collector, the mark workers and the mutators share.
pub struct HeapInner {
    pub(crate) config: Config,
    pub(crate) allocator: SpanAllocator,
    pub(crate) info: GcInfoTable,
    pub(crate) collector: Collector,
    pub(crate) safepoint: GlobalSafepoint,
    pub(crate) roots: Roots,
    pub(crate) weak: WeakRegistry,
    pub(crate) finalizers: FinalizerRegistry,
    pub(crate) queue: GrayQueue,
    pub(crate) sweep_pool: Mutex<Pool>,
    /// Cycles run on the coordinator thread and start on their own.
    pub(crate) background: bool,
}

/// A garbage collected heap. Owns the coordinator and mark worker threads;
/// dropping it stops them. Mutators keep the shared state alive on their own
/// but should be dropped first.
pub struct Heap {
    inner: Arc<HeapInner>,
    coordinator: Option<JoinHandle<()>>,
    finalizer: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

fn spawn_error(err: io::Error) -> GcError {
    GcError::Spawn(err.to_string())
}

impl Heap {
    pub fn new(config: Config) -> Result<Heap, GcError> {
        Self::build(config, true)
    }

    /// Heap without collector threads: cycles only run when requested, on
    /// the requesting thread, and marking is done by that thread alone.
    pub fn new_manual(config: Config) -> Result<Heap, GcError> {
        Self::build(config, false)
    }

    fn build(config: Config, background: bool) -> Result<Heap, GcError> {
        config.validate()?;
        let workers = if background { config.mark_workers } else { 0 };
        let inner = Arc::new(HeapInner {
            allocator: SpanAllocator::new(
                config.size_class_progression,
                config.arena_size,
                config.heap_limit,
                config.verbose,
            ),
            info: GcInfoTable::new(),
            collector: Collector::new(&config, workers),
            safepoint: GlobalSafepoint::new(),
            roots: Roots::new(),
            weak: WeakRegistry::new(),
            finalizers: FinalizerRegistry::new(),
            queue: GrayQueue::new(),
            sweep_pool: Mutex::new(Pool::new(config.sweep_threads as u32)),
            background,
            config,
        });

        let mut heap = Heap {
            inner,
            coordinator: None,
            finalizer: None,
            workers: Vec::with_capacity(workers),
        };
        if background {
            let inner = heap.inner.clone();
            heap.coordinator = Some(
                thread::Builder::new()
                    .name("gc-coordinator".to_string())
                    .spawn(move || inner.coordinator_loop())
                    .map_err(spawn_error)?,
            );
            let inner = heap.inner.clone();
            heap.finalizer = Some(
                thread::Builder::new()
                    .name("gc-finalizer".to_string())
                    .spawn(move || inner.finalizers.finalizer_loop())
                    .map_err(spawn_error)?,
            );
            for index in 0..workers {
                let inner = heap.inner.clone();
                heap.workers.push(
                    thread::Builder::new()
                        .name(format!("gc-mark-{}", index))
                        .spawn(move || mark_worker(inner, index))
                        .map_err(spawn_error)?,
                );
            }
        }
        log::debug!(
            "heap created: {} mark worker(s), gc percent {}",
            workers,
            heap.inner.config.gc_percent
        );
        Ok(heap)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Attach a mutator for the calling thread.
    pub fn attach_mutator(&self) -> Mutator {
        Mutator::attach(self.inner.clone())
    }

    pub fn mutator_count(&self) -> usize {
        self.inner.safepoint.mutator_count()
    }

    /// Register a type whose elements are `size` bytes with pointers at the
    /// given word offsets.
    pub fn register_type(&self, name: &str, size: usize, pointer_words: &[usize]) -> Result<TypeIndex, GcError> {
        self.inner.info.add_gc_info(name, size, pointer_words)
    }

    /// Register a stack map: a frame of `slots` words with pointers in
    /// `pointer_slots`.
    pub fn register_frame(&self, name: &str, slots: usize, pointer_slots: &[usize]) -> Result<FrameId, GcError> {
        self.inner.info.add_frame_info(name, slots, pointer_slots)
    }

    pub fn add_global(&self) -> GlobalId {
        self.inner.roots.add_global()
    }

    pub fn add_constraint(&self, constraint: impl MarkingConstraint + 'static) {
        self.inner.roots.add_constraint(Box::new(constraint));
    }

    /// Run a full cycle and wait for it to finish sweeping.
    ///
    /// Must not be called by a thread whose mutator is running: the cycle
    /// stops the world and would wait for it. Use
    /// [Mutator::collect](crate::mutator::Mutator::collect) there.
    pub fn force_gc(&self) {
        self.inner.force_gc();
    }

    /// Run the finalizers queued by past cycles on the calling thread and
    /// return how many ran. Background heaps run them on their finalizer
    /// thread as well; manual heaps run them after each forced cycle.
    pub fn run_finalizers(&self) -> usize {
        self.inner.finalizers.run_ready()
    }

    /// Block until every queued finalizer has run.
    pub fn wait_for_finalizers(&self) {
        self.inner.finalizers.wait_idle();
    }

    pub fn phase(&self) -> GcPhase {
        self.inner.collector.phase()
    }

    /// Change the heap growth target. A negative value disables automatic
    /// cycles. Returns the previous value.
    pub fn set_gc_percent(&self, percent: i32) -> i32 {
        let previous = self.inner.collector.set_gc_percent(percent);
        log::debug!("gc percent {} -> {}", previous, percent);
        previous
    }

    pub fn read_stats(&self) -> GcStats {
        let inner = &*self.inner;
        let allocator = &inner.allocator;
        let (heap_bytes, _, heap_released) = allocator.page_stats();
        let (next_gc, heap_goal, gc_percent) = {
            let pacer = inner.collector.pacer.lock();
            (pacer.trigger(), pacer.goal(), pacer.gc_percent())
        };
        let (pauses, pause_total) = {
            let history = inner.collector.history.lock();
            (history.pauses(), history.total())
        };
        GcStats {
            heap_bytes,
            live_bytes: inner.collector.last_marked.load(Ordering::Relaxed),
            heap_alloc: allocator.heap_live(),
            heap_mapped: allocator.mapped_bytes(),
            heap_released,
            num_cycles: inner.collector.completed_cycles(),
            pauses,
            pause_total,
            total_alloc: allocator.counters.total_alloc.load(Ordering::Relaxed),
            mallocs: allocator.counters.mallocs.load(Ordering::Relaxed),
            frees: allocator.counters.frees.load(Ordering::Relaxed),
            large_allocs: allocator.counters.large_allocs.load(Ordering::Relaxed),
            next_gc,
            heap_goal,
            gc_percent,
        }
    }

    /// Write the object graph and the roots to `out`, see
    /// [heap_dump](crate::heap_dump). Waits for a running cycle to finish and
    /// stops the world while writing, so like [Heap::force_gc] it must not be
    /// called with a running mutator on this thread.
    pub fn dump_heap(&self, out: &mut impl Write) -> io::Result<()> {
        let inner = &*self.inner;
        let _cycle = inner.collector.cycle_lock.lock();
        inner.safepoint.stop_all_tasks();
        let result = heap_dump::write_dump(inner, out);
        inner.safepoint.resume_all_tasks();
        result
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<HeapInner> {
        &self.inner
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.inner.collector.shutdown();
        if let Some(coordinator) = self.coordinator.take() {
            let _ = coordinator.join();
        }
        self.inner.collector.marker.shutdown();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        self.inner.finalizers.shutdown();
        if let Some(finalizer) = self.finalizer.take() {
            let _ = finalizer.join();
        }
        log::debug!("heap shut down");
    }
}
