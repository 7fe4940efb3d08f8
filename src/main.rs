use std::time::Instant;

use cgc::{
    formatted_size, GarbageCollected, Handle, Heap, HeapOptions, Member, StackState, Trace, Visitor,
};

struct Node {
    left: Member<Node>,
    right: Member<Node>,
    val: i32,
}

impl Trace for Node {
    fn trace(&self, visitor: &mut dyn Visitor) {
        self.left.trace(visitor);
        self.right.trace(visitor);
    }
}

impl GarbageCollected for Node {}

fn bottom_up_tree(heap: &mut Heap, depth: i32) -> Handle<Node> {
    if depth <= 0 {
        return heap.allocate(Node {
            left: Member::null(),
            right: Member::null(),
            val: 0,
        });
    }

    let left = bottom_up_tree(heap, depth - 1);
    let right = bottom_up_tree(heap, depth - 1);

    heap.allocate(Node {
        left: Member::new(left),
        right: Member::new(right),
        val: depth,
    })
}

fn item_check(node: &Node) -> i32 {
    match (node.left.get(), node.right.get()) {
        (Some(left), Some(right)) => 1 + item_check(&left) + item_check(&right),
        _ => 1,
    }
}

fn main() {
    env_logger::init();

    let options = HeapOptions::from_env();
    let mut heap = Heap::new(options);
    let max_depth = 16;
    let start = Instant::now();

    let long_lived = bottom_up_tree(&mut heap, max_depth);
    heap.add_persistent_root(long_lived);

    let mut depth = 4;
    while depth <= max_depth {
        let iterations = 1 << (max_depth - depth + 4);
        let mut check = 0;
        for i in 0..iterations {
            let tree = bottom_up_tree(&mut heap, depth);
            check += item_check(&tree);
            // Nothing but the long lived tree is reachable between iterations.
            if i % 64 == 63 {
                heap.force_collection(StackState::NoHeapPointers, "iteration batch");
            }
        }
        println!("{}\t trees of depth {}\t check: {}", iterations, depth, check);
        depth += 2;
    }

    println!(
        "long lived tree of depth {}\t check: {} (root value {})",
        max_depth,
        item_check(&long_lived),
        long_lived.val
    );

    heap.force_collection(StackState::NoHeapPointers, "end of benchmark");
    heap.finish_sweeping();
    println!("{}", heap.statistics());
    println!(
        "done in {:.2}ms, {} committed",
        start.elapsed().as_micros() as f64 / 1000.0,
        formatted_size(heap.statistics().committed_size)
    );
}
