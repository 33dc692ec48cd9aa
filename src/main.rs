use cms::{Config, FrameId, Heap, Mutator, ObjectRef, TypeIndex};

struct Tree {
    node: TypeIndex,
    frame: FrameId,
}

impl Tree {
    fn bottom_up(&self, m: &Mutator, depth: usize) -> ObjectRef {
        let locals = m.enter_frame(self.frame);
        let node = m.alloc_or_abort(0, self.node);
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

fn main() {
    let n = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse::<usize>().ok())
        .unwrap_or(16);
    let min_depth = 4;
    let max_depth = n.max(min_depth + 2);

    let heap = Heap::new(Config::from_env()).unwrap_or_else(|err| {
        eprintln!("{}", err);
        std::process::exit(1);
    });
    let tree = Tree {
        node: heap.register_type("TreeNode", 16, &[0, 1]).unwrap(),
        frame: heap.register_frame("bottom_up", 1, &[0]).unwrap(),
    };
    let m = heap.attach_mutator();
    let main_frame = heap.register_frame("main", 1, &[0]).unwrap();
    let locals = m.enter_frame(main_frame);

    {
        let depth = max_depth + 1;
        let stretch = tree.bottom_up(&m, depth);
        println!(
            "stretch tree of depth {}\t check: {}",
            depth,
            tree.item_check(&m, stretch)
        );
    }

    let long_lived = tree.bottom_up(&m, max_depth);
    locals.set(0, Some(long_lived));

    let mut depth = min_depth;
    while depth <= max_depth {
        let iterations = 1 << (max_depth - depth + min_depth);
        let mut check = 0;
        for _ in 0..iterations {
            let tree_node = tree.bottom_up(&m, depth);
            check += tree.item_check(&m, tree_node);
        }
        println!("{}\t trees of depth {}\t check: {}", iterations, depth, check);
        depth += 2;
    }

    println!(
        "long lived tree of depth {}\t check: {}",
        max_depth,
        tree.item_check(&m, long_lived)
    );
    drop(locals);
    drop(m);
    println!("{}", heap.read_stats());
}
