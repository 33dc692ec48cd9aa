//! Work stealing gray object queue. Each marking thread owns a local deque;
//! overflow and write barrier flushes go to a shared injector.

use crossbeam::deque::{Injector, Steal, Stealer, Worker};
use parking_lot::RwLock;
use rand::distributions::{Distribution, Uniform};
use rand::thread_rng;

/// Entries are object base addresses.
pub struct GrayQueue {
    injector: Injector<usize>,
    stealers: RwLock<Vec<Stealer<usize>>>,
}

impl GrayQueue {
    pub fn new() -> Self {
        Self {
            injector: Injector::new(),
            stealers: RwLock::new(Vec::new()),
        }
    }

    #[inline]
    pub fn push(&self, object: usize) {
        self.injector.push(object);
    }

    pub fn push_all(&self, objects: impl IntoIterator<Item = usize>) {
        for object in objects {
            self.injector.push(object);
        }
    }

    /// Shared part of the queue is empty. Local deques are not observed.
    pub fn is_empty(&self) -> bool {
        self.injector.is_empty()
    }

    /// Local deque whose items other workers may steal. Meant for the long
    /// lived mark worker threads.
    pub fn register(&self) -> GcWork<'_> {
        let local = Worker::new_lifo();
        let id = {
            let mut stealers = self.stealers.write();
            stealers.push(local.stealer());
            stealers.len() - 1
        };
        GcWork {
            queue: self,
            local,
            id: Some(id),
            scan_work: 0,
            bytes_marked: 0,
        }
    }

    /// Private deque for a short marking burst (assist, root scan). Whatever is
    /// left in it goes back to the injector on drop.
    pub fn local(&self) -> GcWork<'_> {
        GcWork {
            queue: self,
            local: Worker::new_lifo(),
            id: None,
            scan_work: 0,
            bytes_marked: 0,
        }
    }

    #[cfg(test)]
    pub fn take_all(&self) -> Vec<usize> {
        let mut out = vec![];
        loop {
            match self.injector.steal() {
                Steal::Success(object) => out.push(object),
                Steal::Retry => continue,
                Steal::Empty => break,
            }
        }
        out
    }
}

impl Default for GrayQueue {
    fn default() -> Self {
        Self::new()
    }
}

pub struct GcWork<'a> {
    queue: &'a GrayQueue,
    local: Worker<usize>,
    id: Option<usize>,
    /// Bytes of objects scanned since the counter was last taken.
    pub scan_work: i64,
    /// Bytes of objects shaded since the counter was last taken.
    pub bytes_marked: usize,
}

impl<'a> GcWork<'a> {
    #[inline]
    pub fn push(&mut self, object: usize) {
        self.local.push(object);
    }

    pub fn pop(&mut self) -> Option<usize> {
        self.local
            .pop()
            .or_else(|| self.pop_global())
            .or_else(|| self.steal())
    }

    fn pop_global(&mut self) -> Option<usize> {
        loop {
            match self.queue.injector.steal_batch_and_pop(&self.local) {
                Steal::Empty => return None,
                Steal::Success(object) => return Some(object),
                Steal::Retry => continue,
            }
        }
    }

    fn steal(&self) -> Option<usize> {
        let stealers = self.queue.stealers.read();
        if stealers.is_empty() {
            return None;
        }
        // Start at a random victim so idle workers do not all hit the same deque.
        let start = Uniform::new(0, stealers.len()).sample(&mut thread_rng());
        for i in 0..stealers.len() {
            let stealer_id = (start + i) % stealers.len();
            if Some(stealer_id) == self.id {
                continue;
            }
            loop {
                match stealers[stealer_id].steal_batch_and_pop(&self.local) {
                    Steal::Empty => break,
                    Steal::Success(object) => return Some(object),
                    Steal::Retry => continue,
                }
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty()
    }

    /// Move local work to the shared injector.
    pub fn dispose(&mut self) {
        while let Some(object) = self.local.pop() {
            self.queue.injector.push(object);
        }
    }

    pub fn take_scan_work(&mut self) -> i64 {
        std::mem::take(&mut self.scan_work)
    }

    pub fn take_bytes_marked(&mut self) -> usize {
        std::mem::take(&mut self.bytes_marked)
    }
}

impl Drop for GcWork<'_> {
    fn drop(&mut self) {
        self.dispose();
    }
}
