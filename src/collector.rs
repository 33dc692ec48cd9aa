//! Collector context and the cycle state machine:
//! `Off -> Marking -> MarkTermination -> Sweeping -> Off`.
//!
//! One coordinator drives every cycle. Cycles never overlap: a cycle is only
//! started once the previous one finished sweeping.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use atomic::Atomic;
use crossbeam_utils::CachePadded;
use hashbrown::HashSet;
use parking_lot::{Condvar, Mutex};

use crate::{
    globals::{GC_CREDIT_SLACK, WORD},
    gray_queue::GcWork,
    heap::HeapInner,
    heap_corruption,
    marking::{drain, mark_root, MarkSignal},
    pacer::{CycleReport, Pacer},
    roots::{run_constraints, scan_globals, RootSink},
    safepoint::Scheduler,
    span::Span,
    statistics::PauseHistory,
    sweeper::parallel_sweep,
    util::{formatted_size, num_cpus, word_at},
    write_barrier, Config,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum GcPhase {
    Off = 0,
    Marking = 1,
    MarkTermination = 2,
    Sweeping = 3,
}

struct Control {
    /// Highest cycle number somebody asked for.
    requested: u64,
    completed: u64,
    running: bool,
    shutdown: bool,
}

/// Measurements of the cycle in progress, or of the last one.
#[derive(Clone, Copy)]
pub(crate) struct CycleStats {
    pub cycle: u64,
    pub heap_before: usize,
    pub heap_marked: usize,
    pub heap_goal: usize,
    pub stw1: Duration,
    pub mark: Duration,
    pub stw2: Duration,
    pub mark_start: Instant,
}

pub struct Collector {
    phase: Atomic<GcPhase>,
    wb_enabled: AtomicBool,
    /// Write barriers publish gray objects right away instead of buffering.
    prompt: AtomicBool,
    cycle: AtomicU64,
    pub(crate) pacer: Mutex<Pacer>,
    /// Copy of the pacer's trigger for the allocation path.
    trigger: AtomicUsize,
    /// Scan work owed per allocated byte, as `f64` bits.
    assist_ratio: AtomicU64,
    pub(crate) bytes_marked: CachePadded<AtomicUsize>,
    scan_work: CachePadded<AtomicI64>,
    bg_scan_credit: CachePadded<AtomicI64>,
    bg_nanos: AtomicU64,
    assist_nanos: AtomicU64,
    credit_lock: Mutex<()>,
    cv_credit: Condvar,
    control: Mutex<Control>,
    cv_request: Condvar,
    cv_done: Condvar,
    /// Held for the duration of a cycle.
    pub(crate) cycle_lock: Mutex<()>,
    pub(crate) marker: MarkSignal,
    pub(crate) history: Mutex<PauseHistory>,
    pub(crate) stats: Mutex<Option<CycleStats>>,
    pub(crate) last_marked: AtomicUsize,
    /// Number of background mark worker threads.
    pub(crate) workers: usize,
}

impl Collector {
    pub fn new(config: &Config, workers: usize) -> Self {
        let pacer = Pacer::new(config.gc_percent, config.min_heap);
        Self {
            phase: Atomic::new(GcPhase::Off),
            wb_enabled: AtomicBool::new(false),
            prompt: AtomicBool::new(false),
            cycle: AtomicU64::new(0),
            trigger: AtomicUsize::new(pacer.trigger()),
            pacer: Mutex::new(pacer),
            assist_ratio: AtomicU64::new(0f64.to_bits()),
            bytes_marked: CachePadded::new(AtomicUsize::new(0)),
            scan_work: CachePadded::new(AtomicI64::new(0)),
            bg_scan_credit: CachePadded::new(AtomicI64::new(0)),
            bg_nanos: AtomicU64::new(0),
            assist_nanos: AtomicU64::new(0),
            credit_lock: Mutex::new(()),
            cv_credit: Condvar::new(),
            control: Mutex::new(Control {
                requested: 0,
                completed: 0,
                running: false,
                shutdown: false,
            }),
            cv_request: Condvar::new(),
            cv_done: Condvar::new(),
            cycle_lock: Mutex::new(()),
            marker: MarkSignal::new(),
            history: Mutex::new(PauseHistory::new()),
            stats: Mutex::new(None),
            last_marked: AtomicUsize::new(0),
            workers,
        }
    }

    #[inline]
    pub fn phase(&self) -> GcPhase {
        self.phase.load(Ordering::Acquire)
    }

    fn set_phase(&self, to: GcPhase) {
        let from = self.phase();
        assert!(
            matches!(
                (from, to),
                (GcPhase::Off, GcPhase::Marking)
                    | (GcPhase::Marking, GcPhase::MarkTermination)
                    | (GcPhase::MarkTermination, GcPhase::Sweeping)
                    | (GcPhase::Sweeping, GcPhase::Off)
            ),
            "invalid gc phase transition {:?} -> {:?}",
            from,
            to
        );
        self.phase.store(to, Ordering::Release);
        log::debug!("GC({}) {:?} -> {:?}", self.cycle(), from, to);
    }

    #[inline(always)]
    pub fn wb_enabled(&self) -> bool {
        self.wb_enabled.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn prompt(&self) -> bool {
        self.prompt.load(Ordering::Relaxed)
    }

    /// Objects allocated now start marked.
    #[inline]
    pub fn allocate_black(&self) -> bool {
        matches!(self.phase(), GcPhase::Marking | GcPhase::MarkTermination)
    }

    /// Number of the running cycle, or of the last one.
    #[inline]
    pub fn cycle(&self) -> u64 {
        self.cycle.load(Ordering::Acquire)
    }

    #[inline]
    pub fn trigger(&self) -> usize {
        self.trigger.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn assist_ratio(&self) -> f64 {
        f64::from_bits(self.assist_ratio.load(Ordering::Relaxed))
    }

    fn set_assist_ratio(&self, ratio: f64) {
        self.assist_ratio.store(ratio.to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn set_gc_percent(&self, percent: i32) -> i32 {
        let mut pacer = self.pacer.lock();
        let previous = pacer.set_gc_percent(percent);
        self.trigger.store(pacer.trigger(), Ordering::Relaxed);
        previous
    }

    pub(crate) fn flush_marked(&self, bytes: usize, scan: i64) {
        if bytes != 0 {
            self.bytes_marked.fetch_add(bytes, Ordering::Relaxed);
        }
        if scan != 0 {
            self.scan_work.fetch_add(scan, Ordering::Relaxed);
        }
    }

    pub(crate) fn flush_work(&self, work: &mut GcWork<'_>) {
        self.flush_marked(work.take_bytes_marked(), work.take_scan_work());
    }

    /// Bank scan work done by a background worker for indebted mutators.
    pub(crate) fn add_bg_credit(&self, scan: i64) {
        if scan == 0 {
            return;
        }
        let credit = self.bg_scan_credit.fetch_add(scan, Ordering::AcqRel) + scan;
        if credit >= GC_CREDIT_SLACK {
            self.wake_assists();
        }
    }

    /// Take up to `want` units of banked credit.
    pub(crate) fn steal_bg_credit(&self, want: i64) -> i64 {
        let mut credit = self.bg_scan_credit.load(Ordering::Acquire);
        loop {
            if credit <= 0 {
                return 0;
            }
            let take = credit.min(want);
            match self.bg_scan_credit.compare_exchange_weak(
                credit,
                credit - take,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return take,
                Err(current) => credit = current,
            }
        }
    }

    pub(crate) fn wait_for_credit(&self, timeout: Duration) {
        let mut guard = self.credit_lock.lock();
        if self.phase() != GcPhase::Marking || self.bg_scan_credit.load(Ordering::Acquire) > 0 {
            return;
        }
        self.cv_credit.wait_for(&mut guard, timeout);
    }

    fn wake_assists(&self) {
        let _guard = self.credit_lock.lock();
        self.cv_credit.notify_all();
    }

    pub(crate) fn add_bg_time(&self, elapsed: Duration) {
        self.bg_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_assist_time(&self, elapsed: Duration) {
        self.assist_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    fn reset_cycle_counters(&self) {
        self.bytes_marked.store(0, Ordering::Relaxed);
        self.scan_work.store(0, Ordering::Relaxed);
        self.bg_scan_credit.store(0, Ordering::Relaxed);
        self.bg_nanos.store(0, Ordering::Relaxed);
        self.assist_nanos.store(0, Ordering::Relaxed);
    }

    fn mark_utilization(&self, mark_time: Duration) -> f64 {
        let wall = mark_time.as_nanos() as f64 * num_cpus() as f64;
        if wall <= 0.0 {
            return 0.0;
        }
        let used = (self.bg_nanos.load(Ordering::Relaxed) + self.assist_nanos.load(Ordering::Relaxed)) as f64;
        (used / wall).min(1.0)
    }

    pub(crate) fn record_pause(&self, pause: Duration) {
        self.history.lock().record(pause);
    }

    pub(crate) fn completed_cycles(&self) -> u64 {
        self.control.lock().completed
    }

    pub(crate) fn shutdown(&self) {
        let mut control = self.control.lock();
        control.shutdown = true;
        self.cv_request.notify_all();
        self.cv_done.notify_all();
    }
}

/// Collects every reachable object that is not marked. Used by the mark
/// verification pass.
struct ReachSink<'a> {
    heap: &'a HeapInner,
    seen: HashSet<usize, ahash::RandomState>,
    stack: Vec<usize>,
}

impl ReachSink<'_> {
    fn push(&mut self, addr: usize) {
        if addr == 0 {
            return;
        }
        if let Some((span, slot)) = self.heap.allocator.find_object(addr) {
            let base = span.slot_addr(slot);
            if self.seen.insert(base) {
                self.stack.push(base);
            }
        }
    }
}

impl RootSink for ReachSink<'_> {
    fn visit(&mut self, addr: usize) {
        self.push(addr);
    }
}

impl HeapInner {
    /// Ask the coordinator for a cycle if none is pending. Does not wait.
    pub(crate) fn request_cycle(&self) {
        let collector = &self.collector;
        let mut control = collector.control.lock();
        if control.running || control.requested > control.completed || control.shutdown {
            return;
        }
        control.requested = control.completed + 1;
        collector.cv_request.notify_one();
    }

    /// Allocation hook: start a cycle once the heap crossed the trigger.
    #[inline]
    pub(crate) fn maybe_trigger(&self, heap_live: usize) {
        if self.background
            && heap_live >= self.collector.trigger()
            && self.collector.phase() == GcPhase::Off
        {
            self.request_cycle();
        }
    }

    /// Run a complete cycle, sweeping included, that starts after this call.
    /// The calling thread must not own a running mutator.
    pub(crate) fn force_gc(&self) {
        if !self.background {
            self.run_cycle();
            self.finalizers.run_ready();
            return;
        }
        let collector = &self.collector;
        let mut control = collector.control.lock();
        let target = if control.running {
            collector.cycle() + 1
        } else {
            control.completed + 1
        };
        control.requested = control.requested.max(target);
        collector.cv_request.notify_one();
        while control.completed < target && !control.shutdown {
            collector.cv_done.wait(&mut control);
        }
    }

    pub(crate) fn coordinator_loop(&self) {
        log::debug!("gc coordinator started");
        let collector = &self.collector;
        loop {
            {
                let mut control = collector.control.lock();
                while !control.shutdown && control.requested <= control.completed {
                    collector.cv_request.wait(&mut control);
                }
                if control.shutdown {
                    break;
                }
                control.running = true;
            }
            self.run_cycle();
        }
        log::debug!("gc coordinator exiting");
    }

    pub(crate) fn run_cycle(&self) {
        let _cycle = self.collector.cycle_lock.lock();
        self.gc_start();
        self.gc_mark_concurrent();
        let spans = self.gc_mark_termination();
        self.gc_sweep(spans);
    }

    /// Off -> Marking. Stops the world, enables the write barrier, shades the
    /// global roots and releases the mark workers.
    pub(crate) fn gc_start(&self) {
        let collector = &self.collector;
        let start = Instant::now();
        self.safepoint.stop_all_tasks();
        let heap_before = self.allocator.heap_live();
        collector.set_phase(GcPhase::Marking);
        let cycle = collector.cycle.fetch_add(1, Ordering::AcqRel) + 1;
        collector.reset_cycle_counters();
        let (ratio, heap_goal) = {
            let mut pacer = collector.pacer.lock();
            let ratio = pacer.start_cycle(heap_before);
            (ratio, pacer.goal())
        };
        collector.set_assist_ratio(ratio);
        self.safepoint.for_each_task(&mut |mutator| {
            mutator.assist_bytes.store(0, Ordering::Relaxed);
        });
        collector.wb_enabled.store(true, Ordering::Release);

        let mut work = self.queue.local();
        scan_globals(self, &mut work);
        run_constraints(self, &mut work);
        collector.flush_work(&mut work);
        drop(work);

        collector.marker.start();
        let stw1 = start.elapsed();
        collector.record_pause(stw1);
        *collector.stats.lock() = Some(CycleStats {
            cycle,
            heap_before,
            heap_marked: 0,
            heap_goal,
            stw1,
            mark: Duration::ZERO,
            stw2: Duration::ZERO,
            mark_start: Instant::now(),
        });
        self.safepoint.resume_all_tasks();
        log::debug!(
            "GC({}) marking, heap {} goal {} assist ratio {:.4}",
            cycle,
            formatted_size(heap_before),
            formatted_size(heap_goal),
            ratio
        );
    }

    /// Marking: scan every stack once, then wait until the workers ran out of
    /// gray objects and no mutator has buffered any.
    pub(crate) fn gc_mark_concurrent(&self) {
        let collector = &self.collector;
        self.scan_stacks();
        collector.prompt.store(true, Ordering::Release);
        loop {
            if collector.workers == 0 {
                let mut work = self.queue.local();
                drain(self, &mut work, i64::MAX);
                collector.flush_work(&mut work);
            } else {
                collector
                    .marker
                    .wait_idle(Duration::from_millis(10), || self.queue.is_empty());
            }
            let ratio = collector.pacer.lock().revise(
                self.allocator.heap_live(),
                collector.scan_work.load(Ordering::Relaxed),
            );
            collector.set_assist_ratio(ratio);

            let mut flushed = 0;
            self.safepoint.for_each_task(&mut |mutator| {
                flushed += write_barrier::flush(self, mutator);
            });
            if flushed == 0 && self.queue.is_empty() && collector.marker.is_idle() {
                break;
            }
        }
    }

    /// Marking -> MarkTermination -> Sweeping, all inside one stop-the-world
    /// pause. Returns the spans queued for the background sweeper.
    pub(crate) fn gc_mark_termination(&self) -> Vec<Arc<Span>> {
        let collector = &self.collector;
        collector.marker.stop();
        let start = Instant::now();
        self.safepoint.stop_all_tasks();
        collector.set_phase(GcPhase::MarkTermination);
        collector.prompt.store(false, Ordering::Release);
        collector.wake_assists();
        let cycle = collector.cycle();

        // Nothing can be shaded concurrently anymore. Flush, rescan and drain
        // until the gray queue is authoritatively empty.
        self.safepoint.for_each_task(&mut |mutator| {
            write_barrier::flush(self, mutator);
        });
        let mut work = self.queue.local();
        scan_globals(self, &mut work);
        run_constraints(self, &mut work);
        let late = self.scan_remaining_stacks(&mut work);
        if late != 0 {
            log::debug!("GC({}) scanned {} stack(s) during termination", cycle, late);
        }
        drain(self, &mut work, i64::MAX);
        collector.flush_work(&mut work);
        drop(work);
        if !self.queue.is_empty() {
            heap_corruption!("gray objects left after mark termination");
        }

        if self.config.verify_marks {
            self.verify_marks();
        }
        let cleared = self.weak.process(|addr| self.is_marked(addr));
        if cleared != 0 {
            log::debug!("GC({}) cleared {} weak handle(s)", cycle, cleared);
        }
        // Unreachable objects with a finalizer survive this cycle, and so
        // does everything they reach.
        let mut work = self.queue.local();
        let queued = self
            .finalizers
            .queue_unreachable(|addr| self.is_marked(addr), |addr| mark_root(self, &mut work, addr));
        if queued != 0 {
            drain(self, &mut work, i64::MAX);
            collector.flush_work(&mut work);
            log::debug!("GC({}) queued {} finalizer(s)", cycle, queued);
        }
        drop(work);

        let heap_live = self.allocator.heap_live();
        let heap_marked = collector.bytes_marked.load(Ordering::Relaxed);
        let mark = collector
            .stats
            .lock()
            .map_or(Duration::ZERO, |stats| stats.mark_start.elapsed());
        let utilization = collector.mark_utilization(mark);
        {
            let mut pacer = collector.pacer.lock();
            pacer.end_cycle(CycleReport {
                heap_live,
                heap_marked,
                utilization,
            });
            collector.trigger.store(pacer.trigger(), Ordering::Relaxed);
        }
        collector.last_marked.store(heap_marked, Ordering::Relaxed);
        collector.wb_enabled.store(false, Ordering::Release);
        collector.set_assist_ratio(0.0);

        self.safepoint.for_each_task(&mut |mutator| {
            mutator.cache.lock().revoke();
            mutator.assist_bytes.store(0, Ordering::Relaxed);
        });
        let spans = self.allocator.prepare_sweep();
        collector.set_phase(GcPhase::Sweeping);

        let stw2 = start.elapsed();
        collector.record_pause(stw2);
        if let Some(stats) = collector.stats.lock().as_mut() {
            stats.heap_marked = heap_marked;
            stats.mark = mark;
            stats.stw2 = stw2;
        }
        self.safepoint.resume_all_tasks();
        if queued != 0 {
            self.finalizers.notify();
        }
        spans
    }

    /// Sweeping -> Off. Mutators keep allocating and sweep lazily in parallel.
    pub(crate) fn gc_sweep(&self, spans: Vec<Arc<Span>>) {
        let collector = &self.collector;
        let total = spans.len();
        let swept = {
            let mut pool = self.sweep_pool.lock();
            parallel_sweep(&mut pool, &self.allocator, spans)
        };
        self.allocator.finish_sweep();
        collector.set_phase(GcPhase::Off);
        let released = if self.config.release_to_os {
            self.allocator.scavenge()
        } else {
            0
        };
        let cycle = collector.cycle();
        log::debug!(
            "GC({}) swept {} of {} span(s) in the background, released {}",
            cycle,
            swept,
            total,
            formatted_size(released)
        );

        {
            let mut control = collector.control.lock();
            control.completed = cycle;
            control.running = false;
            collector.cv_done.notify_all();
        }

        if let Some(stats) = *collector.stats.lock() {
            logln_if!(
                self.config.verbose,
                "[gc] GC({}) {:.3}ms+{:.3}ms+{:.3}ms {}->{}({}) {}W",
                stats.cycle,
                stats.stw1.as_secs_f64() * 1000.0,
                stats.mark.as_secs_f64() * 1000.0,
                stats.stw2.as_secs_f64() * 1000.0,
                formatted_size(stats.heap_before),
                formatted_size(stats.heap_marked),
                formatted_size(stats.heap_goal),
                collector.workers
            );
        }
    }

    pub(crate) fn is_marked(&self, addr: usize) -> bool {
        self.allocator
            .lookup_allocated(addr)
            .map_or(false, |(span, slot)| span.is_marked(slot))
    }

    /// Walk everything reachable from the roots with the world stopped and
    /// abort if an object was missed by marking.
    fn verify_marks(&self) {
        let mut sink = ReachSink {
            heap: self,
            seen: HashSet::with_hasher(ahash::RandomState::new()),
            stack: Vec::new(),
        };
        self.roots.for_each_global(|_, addr| sink.push(addr));
        self.finalizers.for_each_ready(|addr| sink.push(addr));
        {
            let mut constraints = self.roots.constraints.lock();
            for constraint in constraints.iter_mut() {
                constraint.run(&mut sink);
            }
        }
        self.safepoint.for_each_task(&mut |mutator| {
            let stack = mutator.stack.lock();
            stack.walk(|_, frame| {
                if let Some(info) = self.info.get_frame_info(frame.id) {
                    for slot in info.mask.pointer_words(frame.slots.len()) {
                        sink.push(frame.slots[slot]);
                    }
                }
            });
        });
        while let Some(object) = sink.stack.pop() {
            let (span, slot) = match self.allocator.find_object(object) {
                Some(found) => found,
                None => continue,
            };
            if !span.is_marked(slot) {
                heap_corruption!(
                    "reachable object {:#x} (slot {} of span {:#x}) is not marked",
                    object,
                    slot,
                    span.base
                );
            }
            let info = self.info.gc_info_for_scan(span.type_of(slot));
            let words = (span.elem_size / info.size) * info.mask.words();
            for word in info.mask.pointer_words(words) {
                let target = unsafe { word_at(object + word * WORD) }.load(Ordering::Acquire);
                sink.push(target);
            }
        }
        log::debug!("GC({}) verified {} reachable object(s)", self.collector.cycle(), sink.seen.len());
    }
}
