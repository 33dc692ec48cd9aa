use cms::{Config, FrameId, Heap, Mutator, ObjectRef, TypeIndex};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

struct Tree {
    node: TypeIndex,
    frame: FrameId,
}

impl Tree {
    fn new(heap: &Heap) -> Self {
        Self {
            node: heap.register_type("TreeNode", 16, &[0, 1]).unwrap(),
            frame: heap.register_frame("bottom_up", 1, &[0]).unwrap(),
        }
    }

    fn bottom_up(&self, m: &Mutator, depth: usize) -> ObjectRef {
        let locals = m.enter_frame(self.frame);
        let node = m.alloc_object(self.node).unwrap();
        locals.set(0, Some(node));
        if depth > 0 {
            let left = self.bottom_up(m, depth - 1);
            m.write_field(node, 0, Some(left));
            let right = self.bottom_up(m, depth - 1);
            m.write_field(node, 1, Some(right));
        }
        node
    }

    fn item_check(&self, m: &Mutator, node: ObjectRef) -> usize {
        match (m.read_field(node, 0), m.read_field(node, 1)) {
            (Some(left), Some(right)) => 1 + self.item_check(m, left) + self.item_check(m, right),
            _ => 1,
        }
    }
}

fn run(heap: &Heap, tree: &Tree, max_depth: usize) {
    let min_depth = 4;
    let m = heap.attach_mutator();
    let mut depth = min_depth;
    while depth < max_depth {
        let iterations = 1 << (max_depth - depth + min_depth);
        for _ in 0..iterations {
            let node = tree.bottom_up(&m, depth);
            tree.item_check(&m, node);
        }
        depth += 2;
    }
}

pub fn bench_gcs(c: &mut Criterion) {
    let mut group = c.benchmark_group("binary trees");
    group.sample_size(10);

    for max_depth in [12usize, 14, 16] {
        for workers in [1usize, 4] {
            group.bench_function(
                BenchmarkId::new(format!("cms({}w)", workers), max_depth),
                |b| {
                    b.iter_batched_ref(
                        || {
                            let heap = Heap::new(Config {
                                mark_workers: workers,
                                ..Default::default()
                            })
                            .unwrap();
                            let tree = Tree::new(&heap);
                            (heap, tree)
                        },
                        |(heap, tree)| run(heap, tree, max_depth),
                        criterion::BatchSize::LargeInput,
                    );
                },
            );
        }
        group.bench_function(BenchmarkId::new("cms(manual)", max_depth), |b| {
            b.iter_batched_ref(
                || {
                    let heap = Heap::new_manual(Config::default()).unwrap();
                    let tree = Tree::new(&heap);
                    (heap, tree)
                },
                |(heap, tree)| {
                    run(heap, tree, max_depth);
                    heap.force_gc();
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_gcs);
criterion_main!(benches);
