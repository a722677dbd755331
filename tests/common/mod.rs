//! Deterministic random-tree generation shared by the integration tests

use kdpack::{Axis, EncodingWord, Node, PageBits};

/// Parameters for one generated tree
#[derive(Debug, Clone, Copy)]
pub struct RandomSettings {
    pub max_nodes: usize,
    pub max_leaves: usize,
    pub distance_length: usize,
    pub percent_subnodes: u32,
    pub percent_empty: u32,
    pub seed: u16,
    pub page_bits: PageBits,
}

/// 16-bit LCG; deterministic across platforms, so seeds pin down trees
pub struct Lcg {
    seed: u16,
}

impl Lcg {
    pub fn new(seed: u16) -> Self {
        Self { seed }
    }

    pub fn next_u16(&mut self) -> u16 {
        self.seed = ((self.seed as u32 * 32719 + 3) % 32749) as u16;
        self.seed
    }

    pub fn chance(&mut self, percent: u32) -> bool {
        (self.next_u16() as u32 % 100) < percent
    }

    pub fn below(&mut self, max: u64) -> u64 {
        assert!(max > 0);
        let mut x = self.next_u16() as u64;
        for _ in 0..3 {
            x = (x << 16) | self.next_u16() as u64;
        }
        x % max
    }
}

enum Slot {
    Pending,
    Cut {
        axis: Axis,
        distance: u64,
        distance_length: usize,
        subnodes: [Option<usize>; 2],
    },
    Leaf(Vec<u16>),
}

/// Grow a canonical random tree the way the original tool's test bed does:
/// keep an active frontier, expand a random member into a cut or a leaf,
/// and finally stuff leaves into whatever is left unfinished
pub fn generate_random_tree(settings: &RandomSettings) -> Node {
    let mut lcg = Lcg::new(settings.seed);
    let mut slots = vec![Slot::Pending];
    let mut active = vec![0usize];
    let mut budget = settings.max_nodes as isize;

    while !active.is_empty() {
        let pick = lcg.below(active.len() as u64) as usize;
        let current = active.swap_remove(pick);

        let less = lcg.chance(settings.percent_subnodes);
        let greater = lcg.chance(settings.percent_subnodes);

        if less || greater {
            let axis = Axis::from_raw(lcg.next_u16() % 3).unwrap();
            let distance = random_distance(&mut lcg, settings.distance_length);
            let mut subnodes = [None, None];
            for (j, wanted) in [less, greater].into_iter().enumerate() {
                if wanted {
                    slots.push(Slot::Pending);
                    subnodes[j] = Some(slots.len() - 1);
                    active.push(slots.len() - 1);
                    budget -= 1;
                }
            }
            slots[current] = Slot::Cut {
                axis,
                distance,
                distance_length: settings.distance_length,
                subnodes,
            };
            if budget < 2 {
                break;
            }
        } else if !lcg.chance(settings.percent_empty) {
            let count = lcg.below(settings.max_leaves as u64 + 1) as usize;
            slots[current] = Slot::Leaf((0..count).map(|_| lcg.next_u16()).collect());
        }
    }

    // Leaves for the unfinished frontier keep the tree canonical.
    while let Some(current) = active.pop() {
        let count = lcg.below(settings.max_leaves as u64 - 1) as usize + 1;
        slots[current] = Slot::Leaf((0..count).map(|_| lcg.next_u16()).collect());
    }

    let mut root = materialize(&mut slots, 0);
    if root.trim_empty() {
        root.clear();
    }
    root
}

fn random_distance(lcg: &mut Lcg, distance_length: usize) -> u64 {
    if distance_length == 1 {
        lcg.below(EncodingWord::DISTANCE_IMMEDIATE_MAX as u64)
            & EncodingWord::DISTANCE_IMMEDIATE_MASK as u64
    } else {
        let bound =
            (EncodingWord::DISTANCE_PREFIX_MAX as u64 + 1) << (16 * (distance_length - 1));
        lcg.below(bound)
    }
}

fn materialize(slots: &mut [Slot], id: usize) -> Node {
    match std::mem::replace(&mut slots[id], Slot::Pending) {
        Slot::Pending => Node::new(),
        Slot::Leaf(words) => {
            let mut node = Node::new();
            node.set_leaves(words).unwrap();
            node
        }
        Slot::Cut {
            axis,
            distance,
            distance_length,
            subnodes,
        } => {
            let less = subnodes[0].map(|sub| materialize(slots, sub));
            let greater = subnodes[1].map(|sub| materialize(slots, sub));
            let mut node = Node::new();
            node.set_cut_scalar(distance, distance_length, axis, less, greater)
                .unwrap();
            node
        }
    }
}

/// Count of leaf nodes and total leaf payload words in a canonical tree
pub fn leaf_totals(node: &Node) -> (usize, usize) {
    if !node.has_subnodes() {
        return (1, node.leaf_count());
    }
    let mut nodes = 0;
    let mut words = 0;
    for j in 0..2 {
        if let Some(sub) = node.subnode(j) {
            let (n, w) = leaf_totals(sub);
            nodes += n;
            words += w;
        }
    }
    (nodes, words)
}
