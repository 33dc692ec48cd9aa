use std::{
    cell::Cell,
    marker::PhantomData,
    sync::{
        atomic::{AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use atomic::Atomic;
use parking_lot::Mutex;

use crate::{
    collector::GcPhase,
    error::{oom_abort, GcError},
    gc_info_table::{FrameId, FrameInfo, TypeIndex},
    globals::WORD,
    heap::HeapInner,
    local_allocator::AllocCache,
    marking,
    roots::GlobalId,
    shadow_stack::ShadowStack,
    size_class::LARGE_CLASS,
    span::Span,
    util::word_at,
    weak::WeakHandle,
    write_barrier, ObjectRef,
};

/// Poll bit: the world is being stopped.
pub const POLL_STOP: u8 = 1;
/// Poll bit: scan your own stack.
pub const POLL_SCAN: u8 = 2;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum MutatorState {
    /// Executing and may touch the heap at any time.
    Running = 0,
    /// At a safe point or inside a blocking region. Its stack is stable.
    Parked = 1,
    /// Parked, and the collector is walking its stack.
    Scanning = 2,
}

/// Part of a mutator the collector can reach.
pub struct MutatorShared {
    pub id: usize,
    state: Atomic<MutatorState>,
    pub(crate) poll: AtomicU8,
    /// Last cycle whose stack scan covered this mutator.
    pub(crate) scanned_cycle: AtomicU64,
    pub(crate) stack: Mutex<ShadowStack>,
    /// Objects shaded by the write barrier that still need scanning.
    pub(crate) wb_buf: Mutex<Vec<usize>>,
    pub(crate) cache: Mutex<AllocCache>,
    /// Allocation credit in bytes. Negative means the mutator owes mark work.
    pub(crate) assist_bytes: AtomicI64,
}

impl MutatorShared {
    fn new(id: usize, nclasses: usize) -> Self {
        Self {
            id,
            state: Atomic::new(MutatorState::Running),
            poll: AtomicU8::new(0),
            scanned_cycle: AtomicU64::new(0),
            stack: Mutex::new(ShadowStack::new()),
            wb_buf: Mutex::new(Vec::new()),
            cache: Mutex::new(AllocCache::new(nclasses)),
            assist_bytes: AtomicI64::new(0),
        }
    }

    #[inline]
    pub fn state(&self) -> MutatorState {
        self.state.load(Ordering::Acquire)
    }

    pub(crate) fn set_state(&self, state: MutatorState) {
        self.state.store(state, Ordering::Release);
    }

    pub(crate) fn try_transition(&self, from: MutatorState, to: MutatorState) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

static NEXT_MUTATOR_ID: AtomicUsize = AtomicUsize::new(1);

/// A task allowed to allocate and mutate the heap. Every pointer store into
/// the heap goes through a mutator so the write barrier runs.
///
/// A mutator may move between threads but is used by one thread at a time.
/// Dropping it detaches it from the heap.
pub struct Mutator {
    pub(crate) heap: Arc<HeapInner>,
    pub(crate) shared: Arc<MutatorShared>,
    _not_sync: PhantomData<Cell<()>>,
}

impl Mutator {
    pub(crate) fn attach(heap: Arc<HeapInner>) -> Mutator {
        let id = NEXT_MUTATOR_ID.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(MutatorShared::new(id, heap.allocator.classes.len()));
        heap.safepoint.attach(shared.clone(), |m| {
            // An empty stack has nothing to scan in the running cycle.
            m.scanned_cycle
                .store(heap.collector.cycle(), Ordering::Release);
        });
        log::debug!("mutator {} attached", id);
        Mutator {
            heap,
            shared,
            _not_sync: PhantomData,
        }
    }

    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// Spawn a thread running `closure` with its own mutator attached to the
    /// same heap.
    pub fn spawn_mutator<F, R>(&self, closure: F) -> JoinHandle<R>
    where
        F: FnOnce(Mutator) -> R + Send + 'static,
        R: Send + 'static,
    {
        let heap = self.heap.clone();
        let mutator = self.blocking(move || Mutator::attach(heap));
        std::thread::spawn(move || closure(mutator))
    }

    /// Allocate `size` bytes of objects of type `ty`. The size is rounded up to
    /// a whole number of `ty` elements; the memory is zeroed.
    pub fn alloc(&self, size: usize, ty: TypeIndex) -> Result<ObjectRef, GcError> {
        self.safepoint();
        let info = self
            .heap
            .info
            .get_gc_info(ty)
            .ok_or(GcError::InvalidType(ty.as_u32()))?;
        let elements = (size.max(1) + info.size - 1) / info.size;
        let size = elements * info.size;

        if self.heap.collector.phase() == GcPhase::Marking {
            let credit = self
                .shared
                .assist_bytes
                .fetch_sub(size as i64, Ordering::Relaxed)
                - size as i64;
            if credit < 0 {
                marking::assist_alloc(self);
            }
        }

        match self.try_alloc(size, ty) {
            Err(GcError::OutOfMemory { .. }) => {
                log::debug!("mutator {} out of memory, collecting", self.id());
                self.collect();
                self.try_alloc(size, ty)
            }
            result => result,
        }
    }

    pub fn alloc_object(&self, ty: TypeIndex) -> Result<ObjectRef, GcError> {
        self.alloc(0, ty)
    }

    pub fn alloc_array(&self, ty: TypeIndex, len: usize) -> Result<ObjectRef, GcError> {
        let size = self
            .heap
            .info
            .get_gc_info(ty)
            .ok_or(GcError::InvalidType(ty.as_u32()))?
            .size;
        self.alloc(size * len.max(1), ty)
    }

    /// Like [Mutator::alloc] but aborts the process when the heap is exhausted.
    pub fn alloc_or_abort(&self, size: usize, ty: TypeIndex) -> ObjectRef {
        match self.alloc(size, ty) {
            Ok(object) => object,
            Err(err) => oom_abort(&err),
        }
    }

    fn try_alloc(&self, size: usize, ty: TypeIndex) -> Result<ObjectRef, GcError> {
        let heap = &*self.heap;
        let class = heap.allocator.classes.class_for(size);
        let black = heap.collector.allocate_black();
        let (span, slot) = if class == LARGE_CLASS {
            (heap.allocator.alloc_large(size)?, 0)
        } else {
            self.shared.cache.lock().alloc(&heap.allocator, class)?
        };
        let addr = span.init_slot(slot, ty.as_u32(), black);
        if black {
            heap.collector
                .bytes_marked
                .fetch_add(span.elem_size, Ordering::Relaxed);
        }
        let heap_live = heap.allocator.note_alloc(span.elem_size);
        heap.maybe_trigger(heap_live);
        match ObjectRef::from_addr(addr) {
            Some(object) => Ok(object),
            None => crate::heap_corruption!("allocated object at null"),
        }
    }

    fn object(&self, object: ObjectRef) -> (&Span, usize) {
        match self.heap.allocator.find_object(object.addr()) {
            Some(found) => found,
            None => panic!("{:?} is not a heap object", object),
        }
    }

    /// Word `index` of `object`, and whether the type's layout makes it a
    /// pointer word.
    #[inline]
    fn field(&self, object: ObjectRef, index: usize) -> (&AtomicUsize, bool) {
        let (span, slot) = self.object(object);
        let base = span.slot_addr(slot);
        assert!(
            object.addr() == base && index < span.elem_size / WORD,
            "field {} out of bounds of {:?} ({} bytes)",
            index,
            object,
            span.elem_size
        );
        let info = self.heap.info.gc_info_for_scan(span.type_of(slot));
        let words = (span.elem_size / info.size) * info.mask.words();
        let is_pointer = index < words && info.mask.is_pointer(index);
        (unsafe { word_at(base + index * WORD) }, is_pointer)
    }

    #[inline]
    fn pointer_field(&self, object: ObjectRef, index: usize) -> &AtomicUsize {
        let (slot, is_pointer) = self.field(object, index);
        assert!(
            is_pointer,
            "word {} of {:?} ({}) is not a pointer field",
            index,
            object,
            self.type_name(object)
        );
        slot
    }

    fn type_name(&self, object: ObjectRef) -> &str {
        let (span, slot) = self.object(object);
        &self.heap.info.gc_info_for_scan(span.type_of(slot)).name
    }

    /// Store a pointer into word `index` of `object`. Panics unless the word
    /// is a pointer field of the object's type.
    pub fn write_field(&self, object: ObjectRef, index: usize, value: Option<ObjectRef>) {
        let slot = self.pointer_field(object, index);
        write_barrier::barrier_store(&self.heap, &self.shared, slot, value.map_or(0, ObjectRef::addr));
    }

    pub fn read_field(&self, object: ObjectRef, index: usize) -> Option<ObjectRef> {
        ObjectRef::from_addr(self.pointer_field(object, index).load(Ordering::Acquire))
    }

    /// Store a non-pointer word. No barrier. Panics on pointer fields, which
    /// only take stores through `write_field`.
    pub fn write_word(&self, object: ObjectRef, index: usize, value: usize) {
        let (slot, is_pointer) = self.field(object, index);
        assert!(
            !is_pointer,
            "word {} of {:?} ({}) is a pointer field",
            index,
            object,
            self.type_name(object)
        );
        slot.store(value, Ordering::Relaxed);
    }

    pub fn read_word(&self, object: ObjectRef, index: usize) -> usize {
        self.field(object, index).0.load(Ordering::Relaxed)
    }

    /// Raw barrier entry point for generated code: `*slot = new`.
    ///
    /// # Safety
    /// `slot` must point to a pointer word inside a live heap object or a
    /// global root, and `new` must be 0 or the address of a live object.
    pub unsafe fn barrier_store(&self, slot: *const AtomicUsize, new: usize) {
        write_barrier::barrier_store(&self.heap, &self.shared, &*slot, new);
    }

    /// Size in bytes of the slot holding `object`.
    pub fn object_size(&self, object: ObjectRef) -> usize {
        self.object(object).0.elem_size
    }

    pub fn type_of(&self, object: ObjectRef) -> TypeIndex {
        let (span, slot) = self.object(object);
        TypeIndex(span.type_of(slot))
    }

    /// Push a frame described by the stack map `id`. The frame is popped when
    /// the guard drops.
    pub fn enter_frame(&self, id: FrameId) -> FrameGuard<'_> {
        let info = match self.heap.info.get_frame_info(id) {
            Some(info) => info,
            None => panic!("unknown frame id {}", id.as_u32()),
        };
        let depth = self.shared.stack.lock().push(id, info.slots);
        FrameGuard {
            mutator: self,
            info,
            depth,
        }
    }

    /// Poll for collector requests.
    #[inline(always)]
    pub fn safepoint(&self) {
        if self.shared.poll.load(Ordering::Relaxed) != 0 {
            self.safepoint_slow();
        }
    }

    #[cold]
    fn safepoint_slow(&self) {
        if self.shared.poll.load(Ordering::Acquire) & POLL_STOP != 0 {
            self.heap.safepoint.wait_at_safepoint(&self.shared);
        }
        if self.shared.poll.load(Ordering::Acquire) & POLL_SCAN != 0 {
            self.heap.scan_own_stack(&self.shared);
        }
    }

    /// Run `f` without access to the heap, e.g. around blocking I/O. The
    /// collector may stop the world and scan this mutator's stack meanwhile.
    pub fn blocking<R>(&self, f: impl FnOnce() -> R) -> R {
        self.heap.safepoint.park(&self.shared);
        let result = f();
        self.heap.safepoint.unpark(&self.shared);
        self.safepoint();
        result
    }

    /// Run a full collection cycle and wait for it, sweeping included.
    pub fn collect(&self) {
        let heap = self.heap.clone();
        self.blocking(move || heap.force_gc());
    }

    pub fn make_weak(&self, object: ObjectRef) -> WeakHandle {
        self.heap.weak.make_weak(object)
    }

    /// Referent of `handle`, or `None` once the collector found it unreachable.
    pub fn resolve(&self, handle: &WeakHandle) -> Option<ObjectRef> {
        let object = ObjectRef::from_addr(handle.load())?;
        if self.heap.collector.wb_enabled() {
            // The referent escapes into a possibly scanned stack.
            write_barrier::shade(&self.heap, &self.shared, object.addr());
        }
        Some(object)
    }

    /// Call `finalizer` once after a cycle found `object` unreachable. The
    /// object and everything it reaches stay allocated until the finalizer
    /// returned; a later cycle frees them. Returns true if a previous
    /// finalizer was replaced.
    pub fn set_finalizer(&self, object: ObjectRef, finalizer: impl FnOnce(ObjectRef) + Send + 'static) -> bool {
        let (span, slot) = self.object(object);
        assert_eq!(object.addr(), span.slot_addr(slot), "{:?} is an interior pointer", object);
        self.heap.finalizers.set(object, Box::new(finalizer))
    }

    /// Remove the finalizer of `object` if it has not been queued yet.
    pub fn clear_finalizer(&self, object: ObjectRef) -> bool {
        self.heap.finalizers.clear(object)
    }

    pub fn set_global(&self, id: GlobalId, value: Option<ObjectRef>) {
        self.heap.roots.with_global(id, |slot| {
            write_barrier::barrier_store(&self.heap, &self.shared, slot, value.map_or(0, ObjectRef::addr))
        });
    }

    pub fn global(&self, id: GlobalId) -> Option<ObjectRef> {
        self.heap
            .roots
            .with_global(id, |slot| ObjectRef::from_addr(slot.load(Ordering::Acquire)))
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        write_barrier::flush(&self.heap, &self.shared);
        self.shared.cache.lock().release_all(&self.heap.allocator);
        self.shared.stack.lock().pop_to(0);
        self.heap.safepoint.detach(&self.shared);
        log::debug!("mutator {} detached", self.shared.id);
    }
}

/// A frame on the mutator's shadow stack. Slots hold either pointers or plain
/// words as described by the frame's stack map.
pub struct FrameGuard<'a> {
    mutator: &'a Mutator,
    info: &'a FrameInfo,
    depth: usize,
}

impl<'a> FrameGuard<'a> {
    /// Store a pointer into a slot the stack map marks as a pointer slot.
    pub fn set(&self, slot: usize, value: Option<ObjectRef>) {
        assert!(
            self.is_pointer_slot(slot),
            "slot {} of frame {} is not a pointer slot",
            slot,
            self.info.name
        );
        self.store(slot, value.map_or(0, ObjectRef::addr));
    }

    pub fn get(&self, slot: usize) -> Option<ObjectRef> {
        ObjectRef::from_addr(self.get_word(slot))
    }

    /// Store a plain word into a non-pointer slot.
    pub fn set_word(&self, slot: usize, value: usize) {
        assert!(
            !self.is_pointer_slot(slot),
            "slot {} of frame {} is a pointer slot",
            slot,
            self.info.name
        );
        self.store(slot, value);
    }

    fn is_pointer_slot(&self, slot: usize) -> bool {
        slot < self.info.slots && self.info.mask.is_pointer(slot)
    }

    fn store(&self, slot: usize, value: usize) {
        self.mutator.shared.stack.lock().frame_mut(self.depth).slots[slot] = value;
    }

    pub fn get_word(&self, slot: usize) -> usize {
        self.mutator.shared.stack.lock().frame(self.depth).slots[slot]
    }

    pub fn mutator(&self) -> &'a Mutator {
        self.mutator
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        self.mutator.shared.stack.lock().pop_to(self.depth);
    }
}
