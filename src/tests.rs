use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use crate::{
    error::GcError,
    gc_info_table::{FrameId, TypeIndex},
    globals::WORD,
    heap::HeapInner,
    heap_dump::{read_dump, DumpRoot},
    marking::{drain, mark_root},
    mutator::POLL_SCAN,
    roots::{MarkingConstraint, RootSink},
    safepoint::Scheduler,
    util::word_at,
    GcPhase, Heap, ObjectRef,
};

fn manual_heap() -> Heap {
    Heap::new_manual(crate::Config {
        verify_marks: true,
        ..Default::default()
    })
    .unwrap()
}

/// Two word node: a pointer to the next node and a plain value.
fn node_type(heap: &Heap) -> TypeIndex {
    heap.register_type("Node", 16, &[0]).unwrap()
}

fn frame(heap: &Heap, slots: usize) -> FrameId {
    let pointers: Vec<usize> = (0..slots).collect();
    heap.register_frame("test", slots, &pointers).unwrap()
}

#[test]
fn test_unreachable_objects_are_freed() {
    let heap = manual_heap();
    let node = node_type(&heap);
    let m = heap.attach_mutator();
    for i in 0..1000 {
        let object = m.alloc_object(node).unwrap();
        m.write_word(object, 1, i);
    }
    let before = heap.read_stats();
    assert_eq!(before.mallocs, 1000);
    assert_eq!(before.heap_alloc, 1000 * 16);

    m.collect();
    let after = heap.read_stats();
    assert_eq!(after.num_cycles, 1);
    assert!(after.frees >= 1000, "only {} objects freed", after.frees);
    assert_eq!(after.heap_alloc, 0);
    assert_eq!(heap.phase(), GcPhase::Off);
}

#[test]
fn test_reachable_graph_survives() {
    let heap = manual_heap();
    let node = node_type(&heap);
    let main = frame(&heap, 1);
    let m = heap.attach_mutator();
    let locals = m.enter_frame(main);

    let mut head = None;
    for i in 0..500 {
        let object = m.alloc_object(node).unwrap();
        m.write_field(object, 0, head);
        m.write_word(object, 1, i);
        head = Some(object);
        locals.set(0, head);
        // garbage in between
        m.alloc_object(node).unwrap();
    }
    m.collect();
    m.collect();

    let mut count = 0;
    let mut cursor = locals.get(0);
    while let Some(object) = cursor {
        assert_eq!(m.read_word(object, 1), 499 - count);
        count += 1;
        cursor = m.read_field(object, 0);
    }
    assert_eq!(count, 500);
    assert_eq!(heap.read_stats().heap_alloc, 500 * 16);
}

#[test]
fn test_write_barrier_shades_stored_pointer() {
    let heap = manual_heap();
    let node = node_type(&heap);
    let main = frame(&heap, 2);
    let m = heap.attach_mutator();
    let locals = m.enter_frame(main);
    let a = m.alloc_object(node).unwrap();
    let b = m.alloc_object(node).unwrap();
    locals.set(0, Some(a));
    locals.set(1, Some(b));

    let inner = heap.inner().clone();
    m.blocking(|| inner.gc_start());
    assert_eq!(heap.phase(), GcPhase::Marking);
    assert!(inner.collector.wb_enabled());

    // Blacken B by hand while A is still white and only on the unscanned stack.
    {
        let mut work = inner.queue.local();
        mark_root(&inner, &mut work, b.addr());
        drain(&inner, &mut work, i64::MAX);
        inner.collector.flush_work(&mut work);
    }
    assert!(inner.is_marked(b.addr()));
    assert!(!inner.is_marked(a.addr()));

    // Move the only reference to A into the black object.
    m.write_field(b, 0, Some(a));
    locals.set(0, None);
    assert!(inner.is_marked(a.addr()));
    assert!(m.shared.wb_buf.lock().contains(&a.addr()));

    m.blocking(|| {
        inner.gc_mark_concurrent();
        let spans = inner.gc_mark_termination();
        inner.gc_sweep(spans);
    });
    assert_eq!(heap.phase(), GcPhase::Off);
    assert!(m.shared.wb_buf.lock().is_empty());
    assert!(inner.allocator.lookup_allocated(a.addr()).is_some());
    assert_eq!(m.read_field(b, 0), Some(a));
}

#[test]
fn test_allocate_black_while_marking() {
    let heap = manual_heap();
    let node = node_type(&heap);
    let m = heap.attach_mutator();
    let inner = heap.inner().clone();

    let white = m.alloc_object(node).unwrap();
    assert!(!inner.is_marked(white.addr()));
    m.blocking(|| inner.gc_start());
    let black = m.alloc_object(node).unwrap();
    assert!(inner.is_marked(black.addr()));
    assert!(!inner.is_marked(white.addr()));

    m.blocking(|| {
        inner.gc_mark_concurrent();
        let spans = inner.gc_mark_termination();
        inner.gc_sweep(spans);
    });
    // Allocated during the cycle, so it survives it even though unreachable.
    assert!(inner.allocator.lookup_allocated(black.addr()).is_some());
    assert!(inner.allocator.lookup_allocated(white.addr()).is_none());
}

#[test]
fn test_weak_handle_cleared() {
    let heap = manual_heap();
    let node = node_type(&heap);
    let main = frame(&heap, 1);
    let m = heap.attach_mutator();
    let locals = m.enter_frame(main);

    let dead = m.alloc_object(node).unwrap();
    let alive = m.alloc_object(node).unwrap();
    locals.set(0, Some(alive));
    let dead_weak = m.make_weak(dead);
    let alive_weak = m.make_weak(alive);
    assert!(dead_weak.ptr_eq(&m.make_weak(dead)));
    assert_eq!(m.resolve(&dead_weak), Some(dead));

    m.collect();
    assert!(dead_weak.is_cleared());
    assert_eq!(m.resolve(&dead_weak), None);
    assert_eq!(m.resolve(&alive_weak), Some(alive));
}

#[test]
fn test_stack_root_survives_in_spawned_mutator() {
    let heap = Heap::new(crate::Config {
        min_heap: 256 * 1024,
        ..Default::default()
    })
    .unwrap();
    let node = node_type(&heap);
    let main = frame(&heap, 1);
    let m = heap.attach_mutator();

    let handle = m.spawn_mutator(move |m| {
        let locals = m.enter_frame(main);
        let object = m.alloc_object(node).unwrap();
        m.write_word(object, 1, 0xcafe);
        locals.set(0, Some(object));
        for round in 0..3 {
            for _ in 0..10_000 {
                m.alloc_object(node).unwrap();
            }
            m.collect();
            assert_eq!(m.read_word(object, 1), 0xcafe, "round {}", round);
        }
        locals.get(0) == Some(object)
    });
    assert!(m.blocking(|| handle.join()).unwrap());
    assert!(heap.read_stats().num_cycles >= 3);
}

#[test]
fn test_concurrent_allocation_is_exclusive() {
    let heap = Heap::new(crate::Config {
        min_heap: 256 * 1024,
        mark_workers: 2,
        verify_marks: true,
        ..Default::default()
    })
    .unwrap();
    let node = node_type(&heap);
    let main = frame(&heap, 1);
    let m = heap.attach_mutator();
    let globals: Vec<_> = (0..4).map(|_| heap.add_global()).collect();

    let handles: Vec<_> = globals
        .iter()
        .enumerate()
        .map(|(thread, &global)| {
            m.spawn_mutator(move |m| {
                let locals = m.enter_frame(main);
                for i in 0..20_000 {
                    let object = m.alloc_object(node).unwrap();
                    m.write_field(object, 0, locals.get(0));
                    m.write_word(object, 1, (thread << 32) | i);
                    locals.set(0, Some(object));
                    // garbage
                    m.alloc_array(node, 4).unwrap();
                }
                m.set_global(global, locals.get(0));
            })
        })
        .collect();
    m.blocking(|| {
        for handle in handles {
            handle.join().unwrap();
        }
    });

    let mut seen = HashSet::new();
    for (thread, &global) in globals.iter().enumerate() {
        let mut expected = 20_000;
        let mut cursor = m.global(global);
        while let Some(object) = cursor {
            expected -= 1;
            assert_eq!(m.read_word(object, 1), (thread << 32) | expected);
            assert!(seen.insert(object.addr()), "{:?} handed out twice", object);
            cursor = m.read_field(object, 0);
        }
        assert_eq!(expected, 0);
    }
    assert!(heap.read_stats().num_cycles > 0);
}

#[test]
fn test_out_of_memory() {
    let heap = Heap::new_manual(crate::Config {
        heap_limit: 1024 * 1024,
        ..Default::default()
    })
    .unwrap();
    let bytes = heap.register_type("Bytes", 8, &[]).unwrap();
    let m = heap.attach_mutator();
    match m.alloc(2 * 1024 * 1024, bytes) {
        Err(GcError::OutOfMemory {
            requested,
            heap_limit,
        }) => {
            assert!(requested >= 2 * 1024 * 1024);
            assert_eq!(heap_limit, 1024 * 1024);
        }
        other => panic!("expected out of memory, got {:?}", other),
    }
    // Garbage is collected to make room.
    for _ in 0..8 {
        m.alloc(512 * 1024, bytes).unwrap();
    }
    assert!(heap.read_stats().num_cycles > 0);
    assert!(matches!(
        m.alloc_object(TypeIndex(9999)),
        Err(GcError::InvalidType(9999))
    ));
}

#[test]
fn test_large_objects() {
    let heap = manual_heap();
    let bytes = heap.register_type("Bytes", 8, &[]).unwrap();
    let holder = node_type(&heap);
    let main = frame(&heap, 1);
    let m = heap.attach_mutator();
    let locals = m.enter_frame(main);

    let big = m.alloc_object(holder).unwrap();
    let kept = m.alloc(100 * 1024, bytes).unwrap();
    let dropped = m.alloc(100 * 1024, bytes).unwrap();
    m.write_word(kept, 100, 7);
    m.write_field(big, 0, Some(kept));
    locals.set(0, Some(big));
    assert_eq!(m.object_size(kept), 100 * 1024);
    assert_eq!(m.type_of(big), holder);

    m.collect();
    let stats = heap.read_stats();
    assert_eq!(stats.large_allocs, 2);
    assert!(stats.frees >= 1);
    assert_eq!(m.read_field(big, 0), Some(kept));
    assert_eq!(m.read_word(kept, 100), 7);
    let inner = heap.inner();
    assert!(inner.allocator.lookup_allocated(dropped.addr()).is_none());
}

#[test]
fn test_gc_percent() {
    let heap = Heap::new_manual(crate::Config {
        gc_percent: 50,
        ..Default::default()
    })
    .unwrap();
    let stats = heap.read_stats();
    assert_eq!(stats.gc_percent, 50);
    assert!(stats.next_gc <= stats.heap_goal);
    assert_eq!(heap.set_gc_percent(-1), 50);
    let stats = heap.read_stats();
    assert_eq!(stats.next_gc, usize::MAX);
    assert_eq!(stats.heap_goal, usize::MAX);
}

#[test]
fn test_stats_after_cycles() {
    let heap = manual_heap();
    let node = node_type(&heap);
    let m = heap.attach_mutator();
    for _ in 0..100 {
        m.alloc_object(node).unwrap();
    }
    m.collect();
    m.collect();
    let stats = heap.read_stats();
    assert_eq!(stats.num_cycles, 2);
    // two pauses per cycle
    assert_eq!(stats.pauses.len(), 4);
    assert_eq!(stats.total_alloc, 100 * 16);
    assert!(stats.heap_mapped >= stats.heap_bytes);
    assert!(format!("{}", stats).contains("Heap statistics"));
}

#[test]
fn test_globals_are_roots() {
    let heap = manual_heap();
    let node = node_type(&heap);
    let m = heap.attach_mutator();
    let global = heap.add_global();
    let object = m.alloc_object(node).unwrap();
    m.write_word(object, 1, 42);
    m.set_global(global, Some(object));
    m.collect();
    assert_eq!(m.global(global), Some(object));
    assert_eq!(m.read_word(object, 1), 42);

    m.set_global(global, None);
    m.collect();
    assert!(heap.inner().allocator.lookup_allocated(object.addr()).is_none());
}

struct Handles {
    slots: Arc<AtomicUsize>,
}

impl MarkingConstraint for Handles {
    fn name(&self) -> &str {
        "handles"
    }

    fn run(&mut self, sink: &mut dyn RootSink) {
        sink.visit(self.slots.load(Ordering::Acquire));
    }
}

#[test]
fn test_marking_constraint() {
    let heap = manual_heap();
    let node = node_type(&heap);
    let m = heap.attach_mutator();
    let slots = Arc::new(AtomicUsize::new(0));
    heap.add_constraint(Handles {
        slots: slots.clone(),
    });

    let object = m.alloc_object(node).unwrap();
    let child = m.alloc_object(node).unwrap();
    m.write_field(object, 0, Some(child));
    slots.store(object.addr(), Ordering::Release);
    m.collect();
    assert_eq!(m.read_field(object, 0), Some(child));
    assert!(heap.inner().allocator.lookup_allocated(child.addr()).is_some());
}

#[test]
fn test_heap_dump() {
    let heap = manual_heap();
    let node = node_type(&heap);
    let main = frame(&heap, 1);
    let m = heap.attach_mutator();
    let locals = m.enter_frame(main);
    let global = heap.add_global();

    let a = m.alloc_object(node).unwrap();
    let b = m.alloc_object(node).unwrap();
    m.write_field(a, 0, Some(b));
    m.set_global(global, Some(a));
    locals.set(0, Some(b));
    m.collect();

    let mut buf = Vec::new();
    m.blocking(|| heap.dump_heap(&mut buf)).unwrap();
    let dump = read_dump(&mut &buf[..]).unwrap();
    assert_eq!(dump.cycles, 1);
    assert!(dump.types.iter().any(|t| t.name == "Node" && t.size == 16));
    let object = dump.object_at(a.addr() as u64).unwrap();
    assert_eq!(object.fields, vec![(0, b.addr() as u64)]);
    assert!(dump.object_at(b.addr() as u64).unwrap().fields.is_empty());
    assert!(dump
        .roots
        .iter()
        .any(|root| matches!(root, DumpRoot::Global { .. }) && root.target() == a.addr() as u64));
    assert!(dump.roots.iter().any(|root| matches!(
        root,
        DumpRoot::Stack { mutator, .. } if *mutator == m.id() as u64
    ) && root.target() == b.addr() as u64));
}

#[test]
fn test_object_ref_from_heap() {
    let heap = manual_heap();
    let node = node_type(&heap);
    let m = heap.attach_mutator();
    let object = m.alloc_object(node).unwrap();
    assert_eq!(ObjectRef::from_addr(object.addr()), Some(object));
    assert_eq!(m.read_field(object, 0), None);
    assert_eq!(m.read_word(object, 1), 0);
}

#[test]
#[should_panic(expected = "is not a pointer field")]
fn test_write_field_rejects_plain_word() {
    let heap = manual_heap();
    let node = node_type(&heap);
    let m = heap.attach_mutator();
    let a = m.alloc_object(node).unwrap();
    let b = m.alloc_object(node).unwrap();
    m.write_field(a, 1, Some(b));
}

#[test]
#[should_panic(expected = "is a pointer field")]
fn test_write_word_rejects_pointer_field() {
    let heap = manual_heap();
    let node = node_type(&heap);
    let m = heap.attach_mutator();
    let a = m.alloc_object(node).unwrap();
    m.write_word(a, 0, 0xdead_beef);
}

#[test]
#[should_panic(expected = "is not a pointer slot")]
fn test_frame_set_rejects_plain_slot() {
    let heap = manual_heap();
    let node = node_type(&heap);
    let mixed = heap.register_frame("mixed", 2, &[0]).unwrap();
    let m = heap.attach_mutator();
    let locals = m.enter_frame(mixed);
    locals.set_word(1, 7);
    assert_eq!(locals.get_word(1), 7);
    let object = m.alloc_object(node).unwrap();
    locals.set(0, Some(object));
    locals.set(1, Some(object));
}

#[test]
fn test_array_fields_repeat_layout() {
    let heap = manual_heap();
    let node = node_type(&heap);
    let m = heap.attach_mutator();
    let array = m.alloc_array(node, 3).unwrap();
    let target = m.alloc_object(node).unwrap();
    // pointer words at 0, 2 and 4
    m.write_field(array, 4, Some(target));
    m.write_word(array, 5, 9);
    assert_eq!(m.read_field(array, 4), Some(target));
    assert_eq!(m.read_word(array, 5), 9);
}

#[test]
fn test_object_rooted_before_next_allocation() {
    let heap = manual_heap();
    let node = node_type(&heap);
    let main = frame(&heap, 1);
    let m = heap.attach_mutator();
    let locals = m.enter_frame(main);
    let inner = heap.inner().clone();

    let a = m.alloc_object(node).unwrap();
    locals.set(0, Some(a));
    // a cycle starts between the two allocations
    m.blocking(|| inner.gc_start());
    let b = m.alloc_object(node).unwrap();
    m.write_field(a, 0, Some(b));
    m.blocking(|| {
        inner.gc_mark_concurrent();
        let spans = inner.gc_mark_termination();
        inner.gc_sweep(spans);
    });
    m.collect();
    assert_eq!(m.read_field(a, 0), Some(b));
    assert!(inner.allocator.lookup_allocated(b.addr()).is_some());
}

/// Gray objects: queued for scanning or sitting in a write barrier buffer.
fn gray_set(inner: &HeapInner) -> HashSet<usize> {
    let queued = inner.queue.take_all();
    let mut gray: HashSet<usize> = queued.iter().copied().collect();
    inner.queue.push_all(queued);
    inner.safepoint.for_each_task(&mut |mutator| {
        gray.extend(mutator.wb_buf.lock().iter().copied());
    });
    gray
}

/// Walk the heap and fail on any black object holding a white pointer.
fn assert_no_black_to_white(inner: &HeapInner) -> usize {
    let gray = gray_set(inner);
    let mut black = 0;
    for span in inner.allocator.spans() {
        span.for_each_object(|slot, addr| {
            if !span.is_marked(slot) || gray.contains(&addr) {
                return;
            }
            black += 1;
            let info = inner.info.gc_info_for_scan(span.type_of(slot));
            let words = (span.elem_size / info.size) * info.mask.words();
            for word in info.mask.pointer_words(words) {
                let target = unsafe { word_at(addr + word * WORD) }.load(Ordering::Acquire);
                assert!(
                    target == 0 || inner.is_marked(target),
                    "black object {:#x} points to white {:#x} in word {}",
                    addr,
                    target,
                    word
                );
            }
        });
    }
    black
}

#[test]
fn test_no_black_object_points_to_white_while_marking() {
    let heap = manual_heap();
    let pair = heap.register_type("Pair", 16, &[0, 1]).unwrap();
    let main = frame(&heap, 1);
    let m = heap.attach_mutator();
    let locals = m.enter_frame(main);
    let global = heap.add_global();
    let inner = heap.inner().clone();

    // A global chain, marked from the roots, and a stack chain, still white.
    let mut chain = Vec::new();
    let mut head = None;
    for _ in 0..64 {
        let node = m.alloc_object(pair).unwrap();
        m.write_field(node, 0, head);
        head = Some(node);
        chain.push(node);
    }
    m.set_global(global, head);
    let mut stack_chain = Vec::new();
    let mut stack_head = None;
    for _ in 0..64 {
        let node = m.alloc_object(pair).unwrap();
        m.write_field(node, 0, stack_head);
        stack_head = Some(node);
        stack_chain.push(node);
    }
    locals.set(0, stack_head);

    m.blocking(|| inner.gc_start());
    assert_no_black_to_white(&inner);
    {
        let mut work = inner.queue.local();
        drain(&inner, &mut work, 16 * 16);
        inner.collector.flush_work(&mut work);
    }
    let black = assert_no_black_to_white(&inner);
    assert!(black > 0);

    // Hide white stack objects in black ones, then drop the stack root.
    let scanned = chain[63];
    assert!(inner.is_marked(scanned.addr()));
    m.write_field(scanned, 1, Some(stack_chain[10]));
    let fresh = m.alloc_object(pair).unwrap();
    m.write_field(fresh, 1, Some(stack_chain[40]));
    m.write_field(chain[62], 1, Some(fresh));
    locals.set(0, None);
    assert_no_black_to_white(&inner);

    m.blocking(|| {
        inner.gc_mark_concurrent();
        let spans = inner.gc_mark_termination();
        inner.gc_sweep(spans);
    });
    for node in chain.iter().chain(&stack_chain[..=40]) {
        assert!(inner.allocator.lookup_allocated(node.addr()).is_some());
    }
    assert_eq!(m.read_field(fresh, 1), Some(stack_chain[40]));
}

#[test]
fn test_running_mutator_scans_own_stack() {
    let heap = manual_heap();
    let node = node_type(&heap);
    let main = frame(&heap, 1);
    let m = heap.attach_mutator();
    let locals = m.enter_frame(main);
    let object = m.alloc_object(node).unwrap();
    locals.set(0, Some(object));
    let inner = heap.inner().clone();

    m.blocking(|| inner.gc_start());
    let cycle = inner.collector.cycle();
    assert!(m.shared.scanned_cycle.load(Ordering::Acquire) < cycle);
    assert!(!inner.is_marked(object.addr()));

    inner.safepoint.request_safe_point(&m.shared);
    assert_ne!(m.shared.poll.load(Ordering::Acquire) & POLL_SCAN, 0);
    m.safepoint();
    assert_eq!(m.shared.poll.load(Ordering::Acquire) & POLL_SCAN, 0);
    assert_eq!(m.shared.scanned_cycle.load(Ordering::Acquire), cycle);
    assert!(inner.is_marked(object.addr()));

    m.blocking(|| {
        inner.gc_mark_concurrent();
        let spans = inner.gc_mark_termination();
        inner.gc_sweep(spans);
    });
    assert!(inner.allocator.lookup_allocated(object.addr()).is_some());
}

#[test]
fn test_finalizer_runs_once_then_object_is_freed() {
    let heap = manual_heap();
    let node = node_type(&heap);
    let m = heap.attach_mutator();
    let inner = heap.inner().clone();
    let finalized = Arc::new(AtomicUsize::new(0));
    let runs = Arc::new(AtomicUsize::new(0));

    let object = m.alloc_object(node).unwrap();
    let child = m.alloc_object(node).unwrap();
    m.write_field(object, 0, Some(child));
    let (seen, count) = (finalized.clone(), runs.clone());
    assert!(!m.set_finalizer(object, move |o| {
        seen.store(o.addr(), Ordering::SeqCst);
        count.fetch_add(1, Ordering::SeqCst);
    }));
    let spared = m.alloc_object(node).unwrap();
    m.set_finalizer(spared, |_| panic!("cleared finalizer ran"));
    assert!(m.clear_finalizer(spared));

    m.collect();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(finalized.load(Ordering::SeqCst), object.addr());
    // kept for the finalizer, together with what it reaches
    assert!(inner.allocator.lookup_allocated(object.addr()).is_some());
    assert!(inner.allocator.lookup_allocated(child.addr()).is_some());
    assert!(inner.allocator.lookup_allocated(spared.addr()).is_none());

    m.collect();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(inner.allocator.lookup_allocated(object.addr()).is_none());
    assert!(inner.allocator.lookup_allocated(child.addr()).is_none());
    assert!(inner.finalizers.is_empty());
}

#[test]
fn test_finalizer_thread() {
    let heap = Heap::new(crate::Config::default()).unwrap();
    let node = node_type(&heap);
    let m = heap.attach_mutator();
    let runs = Arc::new(AtomicUsize::new(0));
    let object = m.alloc_object(node).unwrap();
    let count = runs.clone();
    m.set_finalizer(object, move |_| {
        count.fetch_add(1, Ordering::SeqCst);
    });
    m.collect();
    m.blocking(|| heap.wait_for_finalizers());
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    m.collect();
    assert!(heap.inner().allocator.lookup_allocated(object.addr()).is_none());
    assert_eq!(heap.run_finalizers(), 0);
}
