//! Finalizers. An object with a finalizer that turns out unreachable at mark
//! termination is marked again, together with everything it points to, and
//! handed to the finalizer thread. It stays a root until its finalizer
//! returned and is freed by the first cycle that finds it unreachable after
//! that. Each finalizer runs at most once.

use std::{
    collections::VecDeque,
    panic::{catch_unwind, AssertUnwindSafe},
};

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};

use crate::ObjectRef;

pub type Finalizer = Box<dyn FnOnce(ObjectRef) + Send>;

struct ReadyQueue {
    queue: VecDeque<(ObjectRef, Finalizer)>,
    /// Object whose finalizer is executing right now.
    running: Option<ObjectRef>,
    shutdown: bool,
}

pub struct FinalizerRegistry {
    pending: Mutex<HashMap<usize, Finalizer, ahash::RandomState>>,
    ready: Mutex<ReadyQueue>,
    cv_ready: Condvar,
    cv_idle: Condvar,
}

impl FinalizerRegistry {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::with_hasher(ahash::RandomState::new())),
            ready: Mutex::new(ReadyQueue {
                queue: VecDeque::new(),
                running: None,
                shutdown: false,
            }),
            cv_ready: Condvar::new(),
            cv_idle: Condvar::new(),
        }
    }

    /// Install `finalizer` for `object`, replacing any previous one. Returns
    /// true if one was replaced.
    pub fn set(&self, object: ObjectRef, finalizer: Finalizer) -> bool {
        self.pending.lock().insert(object.addr(), finalizer).is_some()
    }

    /// Drop the finalizer of `object` unless it was already queued.
    pub fn clear(&self, object: ObjectRef) -> bool {
        self.pending.lock().remove(&object.addr()).is_some()
    }

    /// Objects with a finalizer that has not been queued yet.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move the finalizers of unmarked objects to the ready queue, calling
    /// `resurrect` on each object first. Runs with the world stopped, after
    /// weak handles were cleared. Returns the number of queued finalizers.
    pub fn queue_unreachable(
        &self,
        is_marked: impl Fn(usize) -> bool,
        mut resurrect: impl FnMut(usize),
    ) -> usize {
        let mut pending = self.pending.lock();
        let mut ready = self.ready.lock();
        let before = ready.queue.len();
        let unreachable: Vec<usize> = pending.keys().copied().filter(|&addr| !is_marked(addr)).collect();
        for addr in unreachable {
            let entry = match (pending.remove(&addr), ObjectRef::from_addr(addr)) {
                (Some(finalizer), Some(object)) => (object, finalizer),
                _ => continue,
            };
            resurrect(addr);
            ready.queue.push_back(entry);
        }
        ready.queue.len() - before
    }

    /// Visit every object waiting for or running its finalizer.
    pub fn for_each_ready(&self, mut f: impl FnMut(usize)) {
        let ready = self.ready.lock();
        for (object, _) in ready.queue.iter() {
            f(object.addr());
        }
        if let Some(object) = ready.running {
            f(object.addr());
        }
    }

    pub fn ready_len(&self) -> usize {
        self.ready.lock().queue.len()
    }

    pub fn notify(&self) {
        self.cv_ready.notify_one();
    }

    /// Run queued finalizers on the calling thread until the queue is empty.
    /// Returns how many ran.
    pub fn run_ready(&self) -> usize {
        let mut count = 0;
        let mut ready = self.ready.lock();
        while let Some((object, finalizer)) = ready.queue.pop_front() {
            ready.running = Some(object);
            drop(ready);
            run_one(object, finalizer);
            count += 1;
            ready = self.ready.lock();
            ready.running = None;
        }
        self.cv_idle.notify_all();
        count
    }

    /// Block until the ready queue is empty and no finalizer is running.
    pub fn wait_idle(&self) {
        let mut ready = self.ready.lock();
        while !ready.queue.is_empty() || ready.running.is_some() {
            if ready.shutdown {
                return;
            }
            self.cv_idle.wait(&mut ready);
        }
    }

    /// Body of the finalizer thread.
    pub(crate) fn finalizer_loop(&self) {
        log::debug!("finalizer thread started");
        loop {
            {
                let mut ready = self.ready.lock();
                while ready.queue.is_empty() && !ready.shutdown {
                    self.cv_ready.wait(&mut ready);
                }
                if ready.queue.is_empty() && ready.shutdown {
                    break;
                }
            }
            let ran = self.run_ready();
            log::trace!("ran {} finalizer(s)", ran);
        }
        log::debug!("finalizer thread exiting");
    }

    pub(crate) fn shutdown(&self) {
        self.ready.lock().shutdown = true;
        self.cv_ready.notify_all();
        self.cv_idle.notify_all();
    }
}

impl Default for FinalizerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn run_one(object: ObjectRef, finalizer: Finalizer) {
    if catch_unwind(AssertUnwindSafe(move || finalizer(object))).is_err() {
        log::error!("finalizer of {:?} panicked", object);
    }
}
