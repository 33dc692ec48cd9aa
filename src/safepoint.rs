use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use parking_lot::{Condvar, Mutex};

use crate::mutator::{MutatorShared, MutatorState, POLL_SCAN, POLL_STOP};

/// Hooks the collector needs from whatever schedules mutators.
pub trait Scheduler {
    /// Call `f` for every live task.
    fn for_each_task(&self, f: &mut dyn FnMut(&Arc<MutatorShared>));
    /// Ask `task` to scan its own stack at its next safe point.
    fn request_safe_point(&self, task: &MutatorShared);
    /// Returns once every task is parked.
    fn stop_all_tasks(&self);
    fn resume_all_tasks(&self);
}

struct SafepointState {
    mutators: Vec<Arc<MutatorShared>>,
    armed: bool,
}

/// Used to bring all threads with heap access to a safepoint such that e.g. a
/// garbage collection can be performed.
pub struct GlobalSafepoint {
    inner: Mutex<SafepointState>,
    cv_stopped: Condvar,
    cv_resume: Condvar,
}

impl GlobalSafepoint {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SafepointState {
                mutators: Vec::new(),
                armed: false,
            }),
            cv_stopped: Condvar::new(),
            cv_resume: Condvar::new(),
        }
    }

    /// Register a mutator. Waits out a stop in progress; `init` runs under the
    /// registry lock so it observes a stable collector state.
    pub fn attach(&self, mutator: Arc<MutatorShared>, init: impl FnOnce(&MutatorShared)) {
        let mut inner = self.inner.lock();
        while inner.armed {
            self.cv_resume.wait(&mut inner);
        }
        init(&mutator);
        inner.mutators.push(mutator);
    }

    pub fn detach(&self, mutator: &Arc<MutatorShared>) {
        let mut inner = self.inner.lock();
        while mutator.state() == MutatorState::Scanning {
            self.cv_resume.wait(&mut inner);
        }
        inner.mutators.retain(|m| !Arc::ptr_eq(m, mutator));
        self.cv_stopped.notify_all();
    }

    pub fn mutator_count(&self) -> usize {
        self.inner.lock().mutators.len()
    }

    pub fn mutators(&self) -> Vec<Arc<MutatorShared>> {
        self.inner.lock().mutators.clone()
    }

    /// Enter a region in which the mutator does not touch the heap.
    pub fn park(&self, mutator: &MutatorShared) {
        let _inner = self.inner.lock();
        mutator.set_state(MutatorState::Parked);
        self.cv_stopped.notify_all();
    }

    /// Leave a parked region. Blocks while the world is stopped or while the
    /// collector is scanning this mutator's stack.
    pub fn unpark(&self, mutator: &MutatorShared) {
        let mut inner = self.inner.lock();
        loop {
            if !inner.armed && mutator.try_transition(MutatorState::Parked, MutatorState::Running) {
                return;
            }
            self.cv_resume.wait(&mut inner);
        }
    }

    /// Stop requested: park until the world resumes.
    pub fn wait_at_safepoint(&self, mutator: &MutatorShared) {
        let mut inner = self.inner.lock();
        mutator.set_state(MutatorState::Parked);
        self.cv_stopped.notify_all();
        loop {
            if !inner.armed && mutator.try_transition(MutatorState::Parked, MutatorState::Running) {
                return;
            }
            self.cv_resume.wait(&mut inner);
        }
    }

    /// Claim a parked mutator for stack scanning.
    pub fn try_begin_scan(&self, mutator: &MutatorShared) -> bool {
        mutator.try_transition(MutatorState::Parked, MutatorState::Scanning)
    }

    pub fn end_scan(&self, mutator: &MutatorShared) {
        mutator.set_state(MutatorState::Parked);
        let _inner = self.inner.lock();
        self.cv_resume.notify_all();
        self.cv_stopped.notify_all();
    }

    /// Wake whoever waits in [GlobalSafepoint::wait_for_progress].
    pub fn notify_progress(&self) {
        let _inner = self.inner.lock();
        self.cv_stopped.notify_all();
    }

    /// Sleep until some mutator parks, finishes a scan, or `timeout` passes.
    pub fn wait_for_progress(&self, timeout: Duration) {
        let mut inner = self.inner.lock();
        self.cv_stopped.wait_for(&mut inner, timeout);
    }
}

impl Default for GlobalSafepoint {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for GlobalSafepoint {
    fn for_each_task(&self, f: &mut dyn FnMut(&Arc<MutatorShared>)) {
        for mutator in self.mutators().iter() {
            f(mutator);
        }
    }

    fn request_safe_point(&self, task: &MutatorShared) {
        task.poll.fetch_or(POLL_SCAN, Ordering::AcqRel);
    }

    fn stop_all_tasks(&self) {
        let mut inner = self.inner.lock();
        debug_assert!(!inner.armed);
        inner.armed = true;
        for mutator in inner.mutators.iter() {
            mutator.poll.fetch_or(POLL_STOP, Ordering::AcqRel);
        }
        while inner
            .mutators
            .iter()
            .any(|m| m.state() == MutatorState::Running)
        {
            self.cv_stopped.wait(&mut inner);
        }
    }

    fn resume_all_tasks(&self) {
        let mut inner = self.inner.lock();
        inner.armed = false;
        for mutator in inner.mutators.iter() {
            mutator.poll.fetch_and(!POLL_STOP, Ordering::AcqRel);
        }
        self.cv_resume.notify_all();
    }
}
