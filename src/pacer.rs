//! Feedback controller deciding when a cycle starts and how much mark work
//! allocating mutators owe.
//!
//! The heap goal for a cycle is `heap_marked * (1 + gc_percent / 100)` where
//! `heap_marked` is what the previous mark phase found live. The cycle is
//! triggered earlier, at `heap_marked * (1 + trigger_ratio)`, and the trigger
//! ratio is adjusted after every cycle so that marking finishes close to the
//! goal while background workers use about [GOAL_UTILIZATION] of the CPU.

use crate::globals::PAGE_SIZE;

pub const GOAL_UTILIZATION: f64 = 0.25;
pub const TRIGGER_GAIN: f64 = 0.5;
pub const INITIAL_TRIGGER_RATIO: f64 = 7.0 / 8.0;
/// Smallest runway assists are computed against.
pub const MIN_RUNWAY: usize = 1024 * 1024;

pub struct Pacer {
    gc_percent: i32,
    min_heap: usize,
    trigger_ratio: f64,
    /// Live heap found by the last mark phase, possibly faked up to the
    /// minimum heap.
    heap_marked: usize,
    trigger: usize,
    goal: usize,
    /// Heap size when the running cycle started.
    heap_start: usize,
    /// Scan work the running cycle is expected to do.
    scan_expected: i64,
    assist_ratio: f64,
}

/// What the collector measured over one cycle.
#[derive(Clone, Copy, Debug)]
pub struct CycleReport {
    /// `heap_live` at mark termination.
    pub heap_live: usize,
    /// Bytes marked (live) this cycle.
    pub heap_marked: usize,
    /// Fraction of total CPU spent on background marking and assists
    /// while marking ran.
    pub utilization: f64,
}

impl Pacer {
    pub fn new(gc_percent: i32, min_heap: usize) -> Self {
        let mut pacer = Self {
            gc_percent,
            min_heap,
            trigger_ratio: INITIAL_TRIGGER_RATIO,
            heap_marked: 0,
            trigger: 0,
            goal: 0,
            heap_start: 0,
            scan_expected: 0,
            assist_ratio: 0.0,
        };
        pacer.heap_marked = (pacer.heap_minimum() as f64 / (1.0 + pacer.trigger_ratio)) as usize;
        pacer.recompute();
        pacer
    }

    /// Minimum heap goal scaled by `gc_percent`.
    pub fn heap_minimum(&self) -> usize {
        if self.gc_percent <= 0 {
            return self.min_heap;
        }
        ((self.min_heap as u128 * self.gc_percent as u128) / 100).max(PAGE_SIZE as u128) as usize
    }

    fn goal_ratio(&self) -> f64 {
        self.gc_percent.max(0) as f64 / 100.0
    }

    fn recompute(&mut self) {
        if self.gc_percent < 0 {
            self.trigger = usize::MAX;
            self.goal = usize::MAX;
            return;
        }
        let max_ratio = 0.95 * self.goal_ratio();
        self.trigger_ratio = self.trigger_ratio.clamp(0.0, max_ratio.max(0.0));
        let mut trigger = (self.heap_marked as f64 * (1.0 + self.trigger_ratio)) as usize;
        if trigger < self.heap_minimum() {
            // Pretend the previous cycle ended with a heap that puts the
            // trigger at the minimum so the goal keeps its ratio to it.
            trigger = self.heap_minimum();
            self.heap_marked = (trigger as f64 / (1.0 + self.trigger_ratio)) as usize;
        }
        self.trigger = trigger;
        self.goal = ((self.heap_marked as f64 * (1.0 + self.goal_ratio())) as usize).max(trigger);
    }

    #[inline]
    pub fn trigger(&self) -> usize {
        self.trigger
    }

    #[inline]
    pub fn goal(&self) -> usize {
        self.goal
    }

    pub fn trigger_ratio(&self) -> f64 {
        self.trigger_ratio
    }

    pub fn heap_marked(&self) -> usize {
        self.heap_marked
    }

    pub fn gc_percent(&self) -> i32 {
        self.gc_percent
    }

    #[inline]
    pub fn assist_ratio(&self) -> f64 {
        self.assist_ratio
    }

    /// Change the growth target. Returns the previous value.
    pub fn set_gc_percent(&mut self, percent: i32) -> i32 {
        let previous = self.gc_percent;
        self.gc_percent = percent.max(-1);
        self.recompute();
        previous
    }

    /// Start of a cycle. Computes scan work per allocated byte mutators owe.
    pub fn start_cycle(&mut self, heap_live: usize) -> f64 {
        self.heap_start = heap_live;
        if self.gc_percent < 0 {
            // Forced cycle while pacing is off. Give assists a runway equal to
            // the live heap.
            self.goal = heap_live.saturating_mul(2).max(heap_live + MIN_RUNWAY);
        } else if self.goal < heap_live + MIN_RUNWAY {
            self.goal = heap_live + MIN_RUNWAY;
        }
        self.scan_expected = self.heap_marked.max(PAGE_SIZE) as i64;
        self.revise(heap_live, 0)
    }

    /// Recompute the assist ratio from progress so far.
    pub fn revise(&mut self, heap_live: usize, scan_work_done: i64) -> f64 {
        let scan_remaining = (self.scan_expected - scan_work_done).max(1000);
        let heap_remaining = self.goal.saturating_sub(heap_live).max(MIN_RUNWAY);
        self.assist_ratio = scan_remaining as f64 / heap_remaining as f64;
        self.assist_ratio
    }

    /// End of mark phase. Adjusts the trigger ratio from how far the heap grew
    /// compared to how much it was allowed to, and sets up the next cycle.
    pub fn end_cycle(&mut self, report: CycleReport) {
        if self.gc_percent >= 0 && self.heap_marked > 0 {
            let goal_growth = self.goal_ratio();
            let actual_growth = report.heap_live as f64 / self.heap_marked as f64 - 1.0;
            let trigger_error = goal_growth
                - self.trigger_ratio
                - report.utilization / GOAL_UTILIZATION * (actual_growth - self.trigger_ratio);
            self.trigger_ratio += TRIGGER_GAIN * trigger_error;
        }
        self.heap_marked = report.heap_marked;
        self.assist_ratio = 0.0;
        self.recompute();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: usize = 1024 * 1024;

    #[test]
    fn test_initial_trigger() {
        let pacer = Pacer::new(100, 4 * MB);
        assert_eq!(pacer.heap_minimum(), 4 * MB);
        assert!(pacer.trigger() >= 4 * MB - 8);
        assert!(pacer.trigger() <= pacer.goal());
        assert!(pacer.trigger_ratio() <= 0.95);
    }

    #[test]
    fn test_gc_percent_scales_minimum() {
        let mut pacer = Pacer::new(200, 4 * MB);
        assert_eq!(pacer.heap_minimum(), 8 * MB);
        assert_eq!(pacer.set_gc_percent(-1), 200);
        assert_eq!(pacer.trigger(), usize::MAX);
        assert_eq!(pacer.set_gc_percent(50), -1);
        assert_eq!(pacer.heap_minimum(), 2 * MB);
        assert!(pacer.trigger_ratio() <= 0.95 * 0.5 + f64::EPSILON);
    }

    #[test]
    fn test_assist_ratio() {
        let mut pacer = Pacer::new(100, 4 * MB);
        pacer.end_cycle(CycleReport {
            heap_live: 64 * MB,
            heap_marked: 32 * MB,
            utilization: GOAL_UTILIZATION,
        });
        let ratio = pacer.start_cycle(pacer.trigger());
        assert!(ratio > 0.0);
        // half the work done, heap halfway through the runway
        let mid = (pacer.trigger() + pacer.goal()) / 2;
        let revised = pacer.revise(mid, 16 * MB as i64);
        assert!(revised > 0.0);
        // beyond the goal the runway is clamped, not negative
        assert!(pacer.revise(pacer.goal() * 2, 0) > 0.0);
    }

    /// A mutator with a fixed live heap that allocates at a constant rate
    /// relative to the collector: the trigger should settle instead of
    /// drifting.
    #[test]
    fn test_convergence() {
        let mut pacer = Pacer::new(100, 4 * MB);
        let live = 64 * MB;
        pacer.end_cycle(CycleReport {
            heap_live: live,
            heap_marked: live,
            utilization: GOAL_UTILIZATION,
        });
        let mut triggers = vec![];
        for _ in 0..40 {
            let trigger = pacer.trigger();
            triggers.push(trigger);
            pacer.start_cycle(trigger);
            // marking allocates another 10% of the live heap
            let heap_live = trigger + live / 10;
            pacer.end_cycle(CycleReport {
                heap_live,
                heap_marked: live,
                utilization: GOAL_UTILIZATION,
            });
        }
        let last = &triggers[30..];
        let min = *last.iter().min().unwrap() as f64;
        let max = *last.iter().max().unwrap() as f64;
        assert!(max / min < 1.01, "trigger did not settle: {:?}", last);
        // never thrash below the live heap nor run past the goal ratio
        assert!(min > live as f64);
        assert!(max <= live as f64 * 1.95 + 1.0);
    }
}
