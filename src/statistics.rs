use std::{collections::VecDeque, time::Duration};

use crate::{globals::PAUSE_HISTORY, util::formatted_size};

/// Snapshot returned by [Heap::read_stats](crate::heap::Heap::read_stats).
#[derive(Clone, Debug, Default)]
pub struct GcStats {
    /// Bytes held by spans.
    pub heap_bytes: usize,
    /// Bytes the last mark phase found reachable.
    pub live_bytes: usize,
    /// Bytes in allocated slots, garbage not yet swept included.
    pub heap_alloc: usize,
    pub heap_mapped: usize,
    /// Free page memory returned to the OS.
    pub heap_released: usize,
    pub num_cycles: u64,
    /// Most recent stop-the-world pauses, oldest first.
    pub pauses: Vec<Duration>,
    pub pause_total: Duration,
    pub total_alloc: usize,
    pub mallocs: usize,
    pub frees: usize,
    pub large_allocs: usize,
    /// `heap_alloc` at which the next cycle starts.
    pub next_gc: usize,
    pub heap_goal: usize,
    pub gc_percent: i32,
}

impl std::fmt::Display for GcStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Heap statistics:")?;
        writeln!(
            f,
            "  Span memory: {} ({} mapped, {} released)",
            formatted_size(self.heap_bytes),
            formatted_size(self.heap_mapped),
            formatted_size(self.heap_released)
        )?;
        writeln!(f, "  Allocated: {}", formatted_size(self.heap_alloc))?;
        writeln!(f, "  Live after last mark: {}", formatted_size(self.live_bytes))?;
        writeln!(f, "  Total GC cycles count: {}", self.num_cycles)?;
        writeln!(
            f,
            "  Total memory allocated: {}",
            formatted_size(self.total_alloc)
        )?;
        writeln!(
            f,
            "  Objects allocated: {} (freed {}, large {})",
            self.mallocs, self.frees, self.large_allocs
        )?;
        match self.gc_percent {
            p if p < 0 => writeln!(f, "  Next GC: off")?,
            p => writeln!(
                f,
                "  Next GC: {} (goal {}, GC percent {})",
                formatted_size(self.next_gc),
                formatted_size(self.heap_goal),
                p
            )?,
        }
        let max = self.pauses.iter().max().copied().unwrap_or_default();
        writeln!(
            f,
            "  Pauses: {:.3}ms total, {:.3}ms max over the last {}",
            self.pause_total.as_secs_f64() * 1000.0,
            max.as_secs_f64() * 1000.0,
            self.pauses.len()
        )?;
        Ok(())
    }
}

/// Ring of recent pause durations.
pub(crate) struct PauseHistory {
    pauses: VecDeque<Duration>,
    total: Duration,
}

impl PauseHistory {
    pub fn new() -> Self {
        Self {
            pauses: VecDeque::with_capacity(PAUSE_HISTORY),
            total: Duration::ZERO,
        }
    }

    pub fn record(&mut self, pause: Duration) {
        if self.pauses.len() == PAUSE_HISTORY {
            self.pauses.pop_front();
        }
        self.pauses.push_back(pause);
        self.total += pause;
    }

    pub fn pauses(&self) -> Vec<Duration> {
        self.pauses.iter().copied().collect()
    }

    pub fn total(&self) -> Duration {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pause_history_is_bounded() {
        let mut history = PauseHistory::new();
        for i in 0..PAUSE_HISTORY + 10 {
            history.record(Duration::from_micros(i as u64));
        }
        let pauses = history.pauses();
        assert_eq!(pauses.len(), PAUSE_HISTORY);
        assert_eq!(pauses[0], Duration::from_micros(10));
        let expected: u64 = (0..(PAUSE_HISTORY + 10) as u64).sum();
        assert_eq!(history.total(), Duration::from_micros(expected));
    }

    #[test]
    fn test_display() {
        let stats = GcStats {
            gc_percent: -1,
            pauses: vec![Duration::from_millis(2)],
            ..Default::default()
        };
        let text = stats.to_string();
        assert!(text.contains("Next GC: off"));
        assert!(text.contains("2.000ms max"));
    }
}
