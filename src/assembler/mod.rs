//! Compiles a k-d tree into its paged binary encoding
//!
//! The driver distributes nodes into virtual pages breadth-first, merges
//! and bin-packs underfull pages, keeps the physical address space dense,
//! and finally emits every page behind the two-word header. All scratch
//! state lives in per-assembly side tables; the input tree is only read
//! (apart from canonicalisation and compare-id assignment up front).

mod arena;
mod page;
mod packer;

use std::collections::VecDeque;

use crate::encoding::{EncodingHeader, EncodingWord, PageBits, HEADER_LENGTH};
use crate::tree::Node;
use arena::{Arena, NodeId};
use page::{PageAllocator, PageId};
use packer::PagePacker;

/// How far, in bucket positions, the bin packer scans around the physically
/// closest page in each direction
const MAX_PAGE_MERGE_SCAN_DISTANCE: usize = 3;

/// Tail words kept free while distributing nodes, as headroom for far
/// references that may lengthen when pages merge later
const DISTRIBUTION_PAD_WORDS: usize = 1;

/// Default number of internal ticks between activity callbacks
pub const DEFAULT_ACTIVITY_FREQUENCY: u32 = 10_000;

struct Activity {
    callback: Option<Box<dyn FnMut()>>,
    frequency: u32,
    counter: u32,
}

impl Activity {
    fn tick(&mut self) {
        self.counter += 1;
        if self.counter >= self.frequency {
            self.counter = 0;
            if let Some(callback) = &mut self.callback {
                callback();
            }
        }
    }
}

/// Converts a tree of [`Node`]s into a cache-page-aligned word image
///
/// Reusable across assemblies; holds only the activity-callback
/// configuration between runs.
///
/// # Examples
///
/// ```rust
/// use kdpack::{Assembler, Node, PageBits};
///
/// let mut root = Node::new();
/// root.set_leaves(vec![0x1000, 0x1001])?;
/// let image = Assembler::new().assemble(&mut root, PageBits::Page64B);
/// assert_eq!(image.len() % PageBits::Page64B.page_words(), 0);
/// # Ok::<(), kdpack::KdpackError>(())
/// ```
pub struct Assembler {
    activity: Activity,
}

impl Assembler {
    /// Create an assembler with no activity callback
    pub fn new() -> Self {
        Self {
            activity: Activity {
                callback: None,
                frequency: DEFAULT_ACTIVITY_FREQUENCY,
                counter: 0,
            },
        }
    }

    /// Install a progress callback invoked every `frequency` internal ticks
    ///
    /// The callback runs on the assembling thread and must not re-enter the
    /// assembler (the borrow rules already prevent it).
    pub fn set_activity_callback<F>(&mut self, frequency: u32, callback: F)
    where
        F: FnMut() + 'static,
    {
        self.activity.callback = Some(Box::new(callback));
        self.activity.frequency = frequency.max(1);
    }

    /// Assemble `root`'s tree into an encoded image
    ///
    /// The tree is canonicalised (`trim_empty`) and compare ids are
    /// assigned; it is otherwise untouched. The returned image is a whole
    /// number of pages and starts with the header. Construction-validated
    /// trees always assemble; internal failures are assertions, not errors.
    pub fn assemble(&mut self, root: &mut Node, page_bits: PageBits) -> Vec<u16> {
        if root.trim_empty() {
            // No leaf data anywhere: encode as an empty leaf block.
            root.clear();
        }
        root.assign_compare_ids(1); // id 0 means "no failure"

        log::debug!(
            "assembling {} distance-length-{} tree at {:?}",
            if root.has_subnodes() { "interior-rooted" } else { "leaf-rooted" },
            root.distance_length(),
            page_bits,
        );

        let mut assembly = Assembly {
            arena: Arena::build(root),
            alloc: PageAllocator::new(page_bits),
            packer: PagePacker::new(page_bits),
            global_queue: VecDeque::new(),
            page_queue: VecDeque::new(),
            activity: &mut self.activity,
        };
        assembly.run(page_bits)
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Assemble `root`'s tree into an encoded image
///
/// Convenience wrapper over [`Assembler`] for callers that do not need an
/// activity callback.
pub fn assemble(root: &mut Node, page_bits: PageBits) -> Vec<u16> {
    Assembler::new().assemble(root, page_bits)
}

/// State of one assembly run
struct Assembly<'t, 'a> {
    arena: Arena<'t>,
    alloc: PageAllocator,
    packer: PagePacker,
    /// Pending page-root nodes; front is processed next
    global_queue: VecDeque<NodeId>,
    /// Candidates for migration into the page being filled
    page_queue: VecDeque<NodeId>,
    activity: &'a mut Activity,
}

impl Assembly<'_, '_> {
    fn run(&mut self, page_bits: PageBits) -> Vec<u16> {
        // The root always owns its encoding word; there is no parent slot to
        // piggy-back on.
        self.arena.scratch_mut(0).force_far_addressing = true;

        self.ensure_page(0);
        let root_page = self.arena.page(0).expect("root was just paged");
        debug_assert_ne!(self.alloc.page(root_page).page_start(), 0); // header page
        self.global_queue.push_back(0);
        while !self.global_queue.is_empty() {
            self.pack_next_page();
        }
        log::debug!(
            "distributed {} nodes over {} live pages",
            self.arena.len(),
            self.alloc.live_pages_by_start().len()
        );

        self.alloc.compact_physical_pages();
        self.subpage_merge();
        self.bin_pack();
        self.alloc.compact_physical_pages();

        let image = self.emit(page_bits);
        log::debug!("emitted {} words over {} pages", image.len(), image.len() / self.alloc.page_words());
        image
    }

    /// Give `node` a singleton page if it has none, and flag oversized
    /// leaves for far addressing
    fn ensure_page(&mut self, node: NodeId) {
        if self.arena.page(node).is_some() {
            return;
        }
        let required = self.alloc.physical_pages_required(node, &self.arena);
        let page = self.alloc.allocate(required);
        self.alloc.insert_node(page, node, &mut self.arena);

        let oversized =
            self.arena.node(node).leaf_count() > EncodingWord::LEAF_WORD_LENGTH_MAX as usize;
        let scratch = self.arena.scratch_mut(node);
        scratch.force_far_addressing = scratch.force_far_addressing || oversized;
    }

    /// Fill the page owned by the next queued page root by migrating its
    /// descendants in breadth-first order until they stop fitting
    fn pack_next_page(&mut self) {
        self.activity.tick();

        let page_root = *self.global_queue.front().expect("global queue non-empty");
        for j in 0..2 {
            if let Some(sub) = self.arena.subnode(page_root, j) {
                self.ensure_page(sub);
            }
        }
        self.global_queue.pop_front();

        let page = self.arena.page(page_root).expect("page root has a page");

        self.page_queue.clear();
        for j in 0..2 {
            if let Some(sub) = self.arena.subnode(page_root, j) {
                self.page_queue.push_back(sub);
            }
        }

        while let Some(&candidate) = self.page_queue.front() {
            for j in 0..2 {
                if let Some(sub) = self.arena.subnode(candidate, j) {
                    self.ensure_page(sub);
                }
            }

            let previous = self.arena.page(candidate).expect("candidate has a page");
            self.alloc.remove_node(previous, candidate, &mut self.arena);
            debug_assert_eq!(self.alloc.page(previous).node_count(), 0);
            self.alloc.insert_node(page, candidate, &mut self.arena);

            if self
                .packer
                .pack(page, true, DISTRIBUTION_PAD_WORDS, &mut self.arena, &mut self.alloc)
            {
                self.alloc.recycle(previous);
                self.page_queue.pop_front();
                for j in 0..2 {
                    if let Some(sub) = self.arena.subnode(candidate, j) {
                        self.page_queue.push_back(sub);
                    }
                }
                if self.page_queue.is_empty() {
                    return;
                }
            } else {
                // The candidate keeps its own page and becomes a page root
                // to fill later.
                self.alloc.remove_node(page, candidate, &mut self.arena);
                self.alloc.insert_node(previous, candidate, &mut self.arena);
                self.global_queue.push_back(candidate);
                self.page_queue.pop_front();
            }
        }

        if self.alloc.page(page).node_count() == 1 {
            // No migration ever succeeded, so no layout was saved yet.
            let packed = self.packer.pack(page, true, 0, &mut self.arena, &mut self.alloc);
            debug_assert!(packed, "a lone node must pack into its own page run");
        }
    }

    /// Pages holding a child of a node on `page`
    fn find_subpages(&self, page: PageId) -> Vec<PageId> {
        let mut subpages = Vec::new();
        for &node in self.alloc.page(page).nodes() {
            for j in 0..2 {
                if let Some(sub) = self.arena.subnode(node, j) {
                    let sub_page = self.arena.page(sub).expect("placed node's child has a page");
                    if sub_page != page && !subpages.contains(&sub_page) {
                        subpages.push(sub_page);
                    }
                }
            }
        }
        subpages
    }

    /// Pages holding a node whose child lies on `page`
    fn find_superpages(&self, page: PageId) -> Vec<PageId> {
        let mut superpages = Vec::new();
        for &node in self.alloc.page(page).nodes() {
            if let Some(supernode) = self.arena.scratch(node).supernode {
                let super_page = self.arena.page(supernode).expect("supernode has a page");
                if super_page != page && !superpages.contains(&super_page) {
                    superpages.push(super_page);
                }
            }
        }
        superpages
    }

    /// Consolidate cold tails: walk the page hierarchy depth-first and try
    /// to merge each childless page into the previous childless page met
    fn subpage_merge(&mut self) {
        let root_page = self.arena.page(0).expect("root has a page");
        let mut stack = vec![root_page];
        let mut visited = vec![false; self.alloc.page_count()];
        let mut previous_leaf: Option<PageId> = None;
        let mut waste = 0usize;

        while let Some(page) = stack.pop() {
            if visited[page] {
                continue;
            }
            visited[page] = true;
            self.activity.tick();

            let subpages = self.find_subpages(page);
            if !subpages.is_empty() {
                for sub in subpages.into_iter().rev() {
                    stack.push(sub);
                }
                continue;
            }

            if let Some(previous) = previous_leaf {
                if previous != page && self.try_bin_pack(previous, page) {
                    log::trace!("subpage merge: page {page} into {previous}");
                    waste += self.alloc.page(page).physical_page_count();
                    self.alloc.recycle(page);
                    if waste > EncodingWord::IMMEDIATE_OFFSET_MAX as usize / 2 {
                        waste = 0;
                        self.alloc.compact_physical_pages();
                    }
                    continue;
                }
            }
            previous_leaf = Some(page);
        }
    }

    /// Fill underfull pages from physically nearby smaller pages, largest
    /// free space first
    fn bin_pack(&mut self) {
        let pages = self.alloc.live_pages_by_start();
        if pages.len() <= 2 {
            return;
        }
        let page_words = self.alloc.page_words();

        // Bucket by encoding size. The root page is skipped (it is packed
        // densely already), as are pages within one word of full. Buckets
        // are filled in descending physical order so popping yields the
        // page closest to the tree root first; the last bucket collects
        // multi-page runs, which act as bins only.
        let mut by_size: Vec<Vec<PageId>> = vec![Vec::new(); page_words + 1];
        for &page in pages.iter().skip(1).rev() {
            let size = self.alloc.page(page).encoding_size();
            if size >= page_words + 1 {
                by_size[page_words].push(page);
            } else if size < page_words - 1 {
                by_size[size].push(page);
            }
        }
        by_size[page_words].sort_by_key(|&page| self.alloc.page(page).encoding_size());

        let mut waste = 0usize;
        for bucket_size in (1..=page_words).rev() {
            while let Some(bin) = by_size[bucket_size].pop() {
                if self.alloc.page(bin).node_count() == 0 {
                    continue;
                }
                loop {
                    let capacity = self.alloc.page(bin).physical_page_count() * page_words;
                    let mut remaining =
                        capacity.saturating_sub(self.alloc.page(bin).encoding_size());
                    if remaining > bucket_size {
                        // Larger pages were already packed and removed.
                        remaining = bucket_size;
                    }

                    let mut merged = false;
                    for size in (1..=remaining).rev() {
                        let mut merged_position = None;
                        for position in self.merge_candidates(bin, &by_size[size]) {
                            self.activity.tick();
                            let page = by_size[size][position];
                            if self.try_bin_pack(bin, page) {
                                merged_position = Some(position);
                                break;
                            }
                        }
                        if let Some(position) = merged_position {
                            let page = by_size[size].remove(position);
                            log::trace!("bin pack: page {page} into {bin}");
                            waste += self.alloc.page(page).physical_page_count();
                            self.alloc.recycle(page);
                            if waste > EncodingWord::IMMEDIATE_OFFSET_MAX as usize / 2 {
                                waste = 0;
                                self.alloc.compact_physical_pages();
                            }
                            merged = true;
                            break;
                        }
                    }
                    if !merged {
                        break;
                    }
                }
            }
        }
    }

    /// Bucket positions to try for merging into `bin`: the physically
    /// closest page, then outward up to the scan distance each way
    fn merge_candidates(&self, bin: PageId, bucket: &[PageId]) -> Vec<usize> {
        if bucket.is_empty() {
            return Vec::new();
        }
        let bin_start = self.alloc.page(bin).physical_page_start();
        // Buckets are ordered by descending physical start.
        let pivot = bucket
            .partition_point(|&page| self.alloc.page(page).physical_page_start() > bin_start)
            .min(bucket.len() - 1);

        let mut order = vec![pivot];
        for distance in 1..=MAX_PAGE_MERGE_SCAN_DISTANCE {
            if pivot + distance < bucket.len() {
                order.push(pivot + distance);
            }
            if pivot >= distance {
                order.push(pivot - distance);
            }
        }
        order
    }

    /// Move every node of `page` into `bin` if `bin` and all pages
    /// referring into it still encode; revert everything otherwise
    ///
    /// When exactly one superpage stops fitting, the branch nodes it holds
    /// whose children lie in the bin are pulled into the bin too and the
    /// merge is re-tested before giving up.
    fn try_bin_pack(&mut self, bin: PageId, page: PageId) -> bool {
        debug_assert_ne!(bin, page);
        if self.alloc.page(page).node_count() == 0 {
            return false;
        }

        let moved: Vec<NodeId> = self.alloc.page(page).nodes().to_vec();
        for &node in &moved {
            self.alloc.remove_node(page, node, &mut self.arena);
            self.alloc.insert_node(bin, node, &mut self.arena);
        }

        let mut repaired: Option<(PageId, Vec<NodeId>)> = None;
        let mut pack_ok = self.packer.pack(bin, false, 0, &mut self.arena, &mut self.alloc);
        if pack_ok {
            let superpages = self.find_superpages(bin);
            let mut failing = Vec::new();
            for &superpage in &superpages {
                if !self.packer.pack(superpage, false, 0, &mut self.arena, &mut self.alloc) {
                    failing.push(superpage);
                }
            }
            if failing.len() == 1 {
                // Repair: pull the offending branch nodes into the bin and
                // re-test the merge as a whole.
                let superpage = failing[0];
                let mut branch_nodes = Vec::new();
                for node in self.alloc.page(superpage).nodes().to_vec() {
                    if node == 0 {
                        // The tree root is the traversal entry point and must
                        // stay on the header page.
                        continue;
                    }
                    let child_in_bin = (0..2).any(|j| {
                        self.arena
                            .subnode(node, j)
                            .map(|sub| self.arena.page(sub) == Some(bin))
                            .unwrap_or(false)
                    });
                    if child_in_bin {
                        self.alloc.remove_node(superpage, node, &mut self.arena);
                        self.alloc.insert_node(bin, node, &mut self.arena);
                        branch_nodes.push(node);
                    }
                }
                pack_ok = !branch_nodes.is_empty()
                    && self.packer.pack(bin, false, 0, &mut self.arena, &mut self.alloc)
                    && self
                        .find_superpages(bin)
                        .into_iter()
                        .all(|sp| self.packer.pack(sp, false, 0, &mut self.arena, &mut self.alloc));
                repaired = Some((superpage, branch_nodes));
            } else {
                pack_ok = failing.is_empty();
            }
        }

        if pack_ok {
            // Commit: persist the new layouts of the bin and of every page
            // now referring into it.
            let saved = self.packer.pack(bin, true, 0, &mut self.arena, &mut self.alloc);
            debug_assert!(saved, "feasibility pack succeeded moments ago");
            for superpage in self.find_superpages(bin) {
                let saved = self.packer.pack(superpage, true, 0, &mut self.arena, &mut self.alloc);
                debug_assert!(saved, "superpage feasibility pack succeeded moments ago");
            }
            true
        } else {
            if let Some((superpage, branch_nodes)) = repaired {
                for &node in &branch_nodes {
                    self.alloc.remove_node(bin, node, &mut self.arena);
                    self.alloc.insert_node(superpage, node, &mut self.arena);
                }
            }
            for &node in &moved {
                self.alloc.remove_node(bin, node, &mut self.arena);
                self.alloc.insert_node(page, node, &mut self.arena);
            }
            false
        }
    }

    /// Concatenate every live page's words and stamp the header
    fn emit(&mut self, page_bits: PageBits) -> Vec<u16> {
        let mut image = Vec::with_capacity(self.alloc.allocated_size());
        let pages = self.alloc.live_pages_by_start();
        debug_assert_eq!(self.alloc.page(pages[0]).physical_page_start(), Some(0));
        debug_assert!(self.alloc.page(pages[0]).nodes().contains(&0));
        // Traversal enters at word 2: the root's encoding word, or for a
        // leaf-rooted tree its count word, must sit right behind the header.
        let root_indices = &self.arena.scratch(0).internal_indices;
        if self.arena.node(0).has_subnodes() {
            debug_assert_eq!(root_indices.encoding_word, Some(HEADER_LENGTH));
        } else {
            debug_assert_eq!(root_indices.extra_data, Some(HEADER_LENGTH));
        }

        for &page in &pages {
            let words = self.packer.encode(page, &mut self.arena, &self.alloc);
            image.extend_from_slice(words);
            self.activity.tick();
        }
        debug_assert_eq!(image.len(), self.alloc.allocated_size());

        let root = self.arena.node(0);
        let mut header = EncodingHeader::new();
        header.set_distance_length(root.distance_length());
        header.set_leaves_at_root(!root.has_subnodes());
        header.set_page_bits(page_bits);

        debug_assert_eq!(image[0], EncodingWord::PAD_VALUE);
        debug_assert_eq!(image[1], EncodingWord::PAD_VALUE);
        image[0] = header.raw(0);
        image[1] = header.raw(1);
        image
    }
}
