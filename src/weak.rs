//! Weak references. A handle is a shared cell holding the referent's address;
//! the collector zeroes the cell during mark termination once the referent
//! turned out unreachable, before any sweeping can free it.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::ObjectRef;

struct WeakCell {
    target: AtomicUsize,
}

/// Handle returned by `make_weak`. Cloning shares the same cell.
#[derive(Clone)]
pub struct WeakHandle(Arc<WeakCell>);

impl WeakHandle {
    /// Address of the referent, or 0 once cleared.
    #[inline]
    pub(crate) fn load(&self) -> usize {
        self.0.target.load(Ordering::Acquire)
    }

    pub fn is_cleared(&self) -> bool {
        self.load() == 0
    }

    pub fn ptr_eq(&self, other: &WeakHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for WeakHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.load() {
            0 => write!(f, "WeakHandle(cleared)"),
            addr => write!(f, "WeakHandle({:#x})", addr),
        }
    }
}

/// One cell per referent, so every handle to the same object clears together.
pub struct WeakRegistry {
    cells: Mutex<HashMap<usize, Arc<WeakCell>, ahash::RandomState>>,
}

impl WeakRegistry {
    pub fn new() -> Self {
        Self {
            cells: Mutex::new(HashMap::with_hasher(ahash::RandomState::new())),
        }
    }

    pub fn make_weak(&self, object: ObjectRef) -> WeakHandle {
        let mut cells = self.cells.lock();
        let cell = cells.entry(object.addr()).or_insert_with(|| {
            Arc::new(WeakCell {
                target: AtomicUsize::new(object.addr()),
            })
        });
        WeakHandle(cell.clone())
    }

    /// Clear every handle whose referent is not marked. Runs with the world
    /// stopped after marking finished. Cells nobody holds a handle to anymore
    /// are dropped. Returns the number of cleared handles.
    pub fn process(&self, is_marked: impl Fn(usize) -> bool) -> usize {
        let mut cleared = 0;
        self.cells.lock().retain(|&addr, cell| {
            if !is_marked(addr) {
                cell.target.store(0, Ordering::Release);
                cleared += 1;
                return false;
            }
            Arc::strong_count(cell) > 1
        });
        cleared
    }

    pub fn len(&self) -> usize {
        self.cells.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for WeakRegistry {
    fn default() -> Self {
        Self::new()
    }
}
