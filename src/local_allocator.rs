use std::sync::Arc;

use crate::{
    error::GcError,
    global_allocator::SpanAllocator,
    span::{Span, SpanList},
};

/// Per mutator span cache: one span per size class that only its owner
/// allocates from, so the hot path never touches a central list.
pub struct AllocCache {
    spans: Vec<Option<Arc<Span>>>,
}

impl AllocCache {
    pub fn new(nclasses: usize) -> Self {
        Self {
            spans: vec![None; nclasses + 1],
        }
    }

    /// Take a slot of `class`. Returns the span and the slot index; the
    /// caller initializes the slot.
    pub fn alloc(&mut self, allocator: &SpanAllocator, class: u8) -> Result<(Arc<Span>, usize), GcError> {
        let entry = &mut self.spans[class as usize];
        loop {
            if let Some(span) = entry {
                let mut state = span.lock();
                if let Some(slot) = span.alloc_slot(&mut state) {
                    drop(state);
                    return Ok((span.clone(), slot));
                }
                state.list = SpanList::Full;
                drop(state);
                *entry = None;
            }
            *entry = Some(allocator.refill(class)?);
        }
    }

    /// Hand every cached span back to the allocator.
    pub fn release_all(&mut self, allocator: &SpanAllocator) {
        for entry in self.spans.iter_mut() {
            if let Some(span) = entry.take() {
                allocator.uncache(span);
            }
        }
    }

    /// Drop every cached span at mark termination. The spans stay in the
    /// registry and are queued for sweeping by
    /// [SpanAllocator::prepare_sweep].
    pub fn revoke(&mut self) {
        for entry in self.spans.iter_mut() {
            if let Some(span) = entry.take() {
                let mut state = span.lock();
                state.list = if state.allocated == span.nelems {
                    SpanList::Full
                } else {
                    SpanList::Partial
                };
            }
        }
    }
}
