//! Parallel background sweeping of the spans queued at mark termination.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use crossbeam::deque::{Injector, Steal, Stealer, Worker};
use rand::distributions::{Distribution, Uniform};
use rand::thread_rng;
use scoped_threadpool::Pool;

use crate::{
    global_allocator::{SpanAllocator, SweepMode},
    span::Span,
};

/// Sweep `spans` on the pool's threads. Spans a mutator already swept on its
/// allocation path are skipped. Returns how many spans this call swept.
pub fn parallel_sweep(pool: &mut Pool, allocator: &SpanAllocator, spans: Vec<Arc<Span>>) -> usize {
    let n_threads = pool.thread_count() as usize;
    let swept = AtomicUsize::new(0);
    let mut workers = Vec::with_capacity(n_threads);
    let mut stealers = Vec::with_capacity(n_threads);
    let injector = Injector::new();
    for _ in 0..n_threads {
        let w = Worker::new_lifo();
        stealers.push(w.stealer());
        workers.push(w);
    }
    for span in spans {
        injector.push(span);
    }

    let terminator = Terminator::new(n_threads);
    pool.scoped(|scoped| {
        for (task_id, worker) in workers.into_iter().enumerate() {
            let injector = &injector;
            let stealers = &stealers;
            let terminator = &terminator;
            let swept = &swept;
            scoped.execute(move || {
                let mut sweeper = Sweeper {
                    task_id,
                    worker,
                    injector,
                    stealers,
                    terminator,
                    allocator,
                    swept,
                };
                sweeper.run();
            });
        }
    });

    swept.load(Ordering::Relaxed)
}

struct Sweeper<'a> {
    task_id: usize,
    worker: Worker<Arc<Span>>,
    injector: &'a Injector<Arc<Span>>,
    stealers: &'a [Stealer<Arc<Span>>],
    terminator: &'a Terminator,
    allocator: &'a SpanAllocator,
    swept: &'a AtomicUsize,
}

pub struct Terminator {
    const_nworkers: usize,
    nworkers: AtomicUsize,
}

impl Terminator {
    pub fn new(number_workers: usize) -> Terminator {
        Terminator {
            const_nworkers: number_workers,
            nworkers: AtomicUsize::new(number_workers),
        }
    }

    pub fn try_terminate(&self) -> bool {
        if self.const_nworkers == 1 {
            return true;
        }

        if self.decrease_workers() {
            // reached 0, no need to wait
            return true;
        }

        thread::sleep(Duration::from_micros(1));
        self.zero_or_increase_workers()
    }

    fn decrease_workers(&self) -> bool {
        self.nworkers.fetch_sub(1, Ordering::Relaxed) == 1
    }

    fn zero_or_increase_workers(&self) -> bool {
        let mut nworkers = self.nworkers.load(Ordering::Relaxed);

        loop {
            if nworkers == 0 {
                return true;
            }

            match self.nworkers.compare_exchange(
                nworkers,
                nworkers + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                // Another worker still has spans; keep going.
                Ok(_) => return false,
                Err(prev_nworkers) => nworkers = prev_nworkers,
            }
        }
    }
}

impl<'a> Sweeper<'a> {
    fn pop(&mut self) -> Option<Arc<Span>> {
        self.worker
            .pop()
            .or_else(|| self.pop_global())
            .or_else(|| self.steal())
    }

    fn pop_global(&mut self) -> Option<Arc<Span>> {
        loop {
            match self.injector.steal_batch_and_pop(&self.worker) {
                Steal::Empty => return None,
                Steal::Success(span) => return Some(span),
                Steal::Retry => continue,
            }
        }
    }

    fn steal(&self) -> Option<Arc<Span>> {
        if self.stealers.len() == 1 {
            return None;
        }

        let mut rng = thread_rng();
        let range = Uniform::new(0, self.stealers.len());

        for _ in 0..2 * self.stealers.len() {
            let mut stealer_id = self.task_id;
            while stealer_id == self.task_id {
                stealer_id = range.sample(&mut rng);
            }

            loop {
                match self.stealers[stealer_id].steal_batch_and_pop(&self.worker) {
                    Steal::Empty => break,
                    Steal::Success(span) => return Some(span),
                    Steal::Retry => continue,
                }
            }
        }

        None
    }

    fn run(&mut self) {
        loop {
            let span = if let Some(span) = self.pop() {
                span
            } else if self.terminator.try_terminate() {
                break;
            } else {
                continue;
            };

            if self.allocator.sweep_span(&span, SweepMode::Release).is_some() {
                self.swept.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminator_single_worker() {
        assert!(Terminator::new(1).try_terminate());
    }

    #[test]
    fn test_terminator_waits_for_peers() {
        let terminator = Terminator::new(2);
        // The peer is still busy, so the first attempt backs out.
        assert!(!terminator.try_terminate());
        assert!(!terminator.decrease_workers());
        assert!(terminator.decrease_workers());
        assert_eq!(terminator.nworkers.load(Ordering::Relaxed), 0);
    }
}
