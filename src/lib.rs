//! Concurrent tri-color mark&sweep garbage collector.
//!
//! Objects live in size-class spans handed out by a page heap. Marking runs on
//! background threads while mutators keep going: a write barrier shades both
//! the overwritten and the stored pointer, objects allocated during marking are
//! black, and every mutator's shadow stack is scanned once per cycle at a safe
//! point. A short stop-the-world pause finishes marking, after which spans are
//! swept in the background and lazily by allocating mutators. A pacer decides
//! when cycles start and how much marking allocating mutators have to assist
//! with.
//!
//! ```
//! use cms::{Config, Heap};
//!
//! let heap = Heap::new(Config::default()).unwrap();
//! let node = heap.register_type("Node", 16, &[0]).unwrap();
//! let frame = heap.register_frame("main", 1, &[0]).unwrap();
//! let mutator = heap.attach_mutator();
//! let locals = mutator.enter_frame(frame);
//! let a = mutator.alloc_object(node).unwrap();
//! // root `a` before the next allocation can start a cycle
//! locals.set(0, Some(a));
//! let b = mutator.alloc_object(node).unwrap();
//! mutator.write_field(a, 0, Some(b));
//! mutator.collect();
//! assert_eq!(mutator.read_field(a, 0), Some(b));
//! ```

use std::{fmt, num::NonZeroUsize, time::Duration};

macro_rules! logln_if {
    ($cond: expr, $($t:tt)*) => {
        if $cond {
            eprintln!($($t)*);
        }
    };
}

pub mod bitmap;
pub mod collector;
pub mod error;
pub mod finalizer;
pub mod gc_info_table;
pub mod global_allocator;
pub mod globals;
pub mod gray_queue;
pub mod heap;
pub mod heap_dump;
pub mod local_allocator;
pub mod marking;
pub mod mmap;
pub mod mutator;
pub mod pacer;
pub mod page_heap;
pub mod roots;
pub mod safepoint;
pub mod shadow_stack;
pub mod size_class;
pub mod span;
pub mod statistics;
pub mod sweeper;
pub mod util;
pub mod weak;
pub mod write_barrier;

#[cfg(test)]
mod tests;

pub use collector::GcPhase;
pub use error::GcError;
pub use gc_info_table::{FrameId, TypeIndex};
pub use heap::Heap;
pub use heap_dump::{read_dump, HeapDump};
pub use mutator::{FrameGuard, Mutator};
pub use roots::{GlobalId, MarkingConstraint, RootSink};
pub use safepoint::Scheduler;
pub use statistics::GcStats;
pub use weak::WeakHandle;

use globals::{MAX_SMALL_SIZE, PAGE_SIZE};

/// Address of a heap object. Never null.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef(NonZeroUsize);

impl ObjectRef {
    #[inline]
    pub(crate) fn from_addr(addr: usize) -> Option<ObjectRef> {
        NonZeroUsize::new(addr).map(ObjectRef)
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.0.get()
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.addr())
    }
}

/// Configuration for heap constructor.
#[derive(Clone, Debug)]
pub struct Config {
    /// Heap growth over the live heap before the next cycle, in percent.
    /// Negative disables automatic cycles.
    pub gc_percent: i32,
    /// Heap goal is never below this (scaled by `gc_percent`).
    pub min_heap: usize,
    /// Size of each memory mapping the page heap grows by.
    pub arena_size: usize,
    /// Hard cap on span memory, 0 for none. Going over it is out of memory.
    pub heap_limit: usize,
    /// Dedicated background mark threads.
    pub mark_workers: usize,
    /// Threads sweeping spans after mark termination.
    pub sweep_threads: usize,
    /// Growth factor of the size class table.
    pub size_class_progression: f64,
    /// How long stack scanning waits on one mutator before complaining.
    pub stack_scan_timeout: Duration,
    /// Check at every mark termination that everything reachable is marked.
    pub verify_marks: bool,
    /// Return free pages to the OS after sweeping.
    pub release_to_os: bool,
    /// Enables verbose printing
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gc_percent: 100,
            min_heap: 4 * 1024 * 1024,
            arena_size: 64 * 1024 * 1024,
            heap_limit: 0,
            mark_workers: (util::num_cpus() / 4).max(1),
            sweep_threads: 1,
            size_class_progression: 1.4,
            stack_scan_timeout: Duration::from_millis(10),
            verify_marks: false,
            release_to_os: true,
            verbose: false,
        }
    }
}

impl Config {
    /// Defaults overridden by `COMET_GC` (a percentage or `off`) and
    /// `COMET_GCTRACE` (`1` prints a line per cycle).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("COMET_GC") {
            match value.trim() {
                "off" => config.gc_percent = -1,
                value => match value.parse::<i32>() {
                    Ok(percent) => config.gc_percent = percent,
                    Err(_) => log::warn!("ignoring COMET_GC={:?}", value),
                },
            }
        }
        if let Ok(value) = std::env::var("COMET_GCTRACE") {
            config.verbose = !matches!(value.trim(), "" | "0");
        }
        config
    }

    pub fn with_gc_percent(mut self, percent: i32) -> Self {
        self.gc_percent = percent;
        self
    }

    pub fn with_min_heap(mut self, bytes: usize) -> Self {
        self.min_heap = bytes;
        self
    }

    pub fn with_heap_limit(mut self, bytes: usize) -> Self {
        self.heap_limit = bytes;
        self
    }

    pub fn with_mark_workers(mut self, workers: usize) -> Self {
        self.mark_workers = workers;
        self
    }

    pub fn with_sweep_threads(mut self, threads: usize) -> Self {
        self.sweep_threads = threads;
        self
    }

    pub fn with_verify_marks(mut self, verify: bool) -> Self {
        self.verify_marks = verify;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn validate(&self) -> Result<(), GcError> {
        let invalid = |msg: String| Err(GcError::InvalidConfig(msg));
        if self.arena_size % PAGE_SIZE != 0 || self.arena_size < MAX_SMALL_SIZE {
            return invalid(format!(
                "arena size {} must be a multiple of {} and at least {}",
                self.arena_size, PAGE_SIZE, MAX_SMALL_SIZE
            ));
        }
        if self.mark_workers == 0 {
            return invalid("at least one mark worker is required".to_string());
        }
        if self.sweep_threads == 0 {
            return invalid("at least one sweep thread is required".to_string());
        }
        if !(self.size_class_progression > 1.0) {
            return invalid(format!(
                "size class progression {} must be greater than 1",
                self.size_class_progression
            ));
        }
        if self.min_heap < PAGE_SIZE {
            return invalid(format!("minimum heap {} is below one page", self.min_heap));
        }
        Ok(())
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(Config::default().validate().is_ok());
        let bad = Config {
            arena_size: PAGE_SIZE + 1,
            ..Config::default()
        };
        assert!(matches!(bad.validate(), Err(GcError::InvalidConfig(_))));
        assert!(Config::default().with_mark_workers(0).validate().is_err());
        assert!(Config::default().with_sweep_threads(0).validate().is_err());
        let bad = Config {
            size_class_progression: 1.0,
            ..Config::default()
        };
        assert!(bad.validate().is_err());
        let bad = Config {
            size_class_progression: f64::NAN,
            ..Config::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_object_ref() {
        assert!(ObjectRef::from_addr(0).is_none());
        let object = ObjectRef::from_addr(0x1230).unwrap();
        assert_eq!(object.addr(), 0x1230);
        assert_eq!(format!("{:?}", object), "ObjectRef(0x1230)");
    }
}
