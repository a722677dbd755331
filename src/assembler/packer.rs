//! Packs the nodes of one virtual page into its physical word budget
//!
//! Extra data is allocated downward from the page tail; encoding words are
//! then placed by heap index from the page head, cutting subtrees over to
//! internal jumps when a child's slot is taken. The packer's state is
//! scratch: a failed [`PagePacker::pack`] leaves previously saved layouts
//! untouched, which the driver's migrate-and-revert loops depend on.

use super::arena::{Arena, EncodingIndices, NodeId};
use super::page::{PageAllocator, PageId};
use crate::encoding::{EncodingWord, PageBits};

#[derive(Debug)]
struct PageTemp {
    node: NodeId,
    /// Owner is external to this page, so the node is entered far
    is_page_root: bool,
    /// Off-page child; encodes as a far reference from this page
    is_external: bool,
    indices: EncodingIndices,
}

#[derive(Debug, Clone, Copy, Default)]
struct PackingStats {
    encoding_words: usize,
    internal_jumps: usize,
}

/// Scratch-state packer reused across all pages of one assembly
pub(crate) struct PagePacker {
    page_word_bits: u32,
    current_page_words: usize,
    page_start: usize,
    extra_data_start: usize,
    page: PageId,
    /// Word position -> temp slot occupying it
    allocation_map: Vec<Option<usize>>,
    temp: Vec<PageTemp>,
    tree_roots_remaining: Vec<usize>,
    encoding: Vec<u16>,
    /// (position in `tree_roots_remaining`, word index, tree index)
    best_fit: Option<(usize, usize, usize)>,
}

impl PagePacker {
    pub fn new(page_bits: PageBits) -> Self {
        Self {
            // Words are two bytes wide.
            page_word_bits: page_bits as u32 - 1,
            current_page_words: 0,
            page_start: 0,
            extra_data_start: 0,
            page: 0,
            allocation_map: Vec::new(),
            temp: Vec::new(),
            tree_roots_remaining: Vec::new(),
            encoding: Vec::new(),
            best_fit: None,
        }
    }

    /// Decide whether `page` (with its current node membership) encodes
    /// within its physical word budget
    ///
    /// `padding` words at the page tail are kept free as headroom for far
    /// references that may lengthen during later merges. With `save`, a
    /// successful layout is written to each node's scratch record and the
    /// page's encoding size is updated; on failure nothing is changed.
    pub fn pack(
        &mut self,
        page: PageId,
        save: bool,
        padding: usize,
        arena: &mut Arena,
        alloc: &mut PageAllocator,
    ) -> bool {
        debug_assert!(alloc.page(page).physical_page_start().is_some());
        self.page = page;
        self.page_start = alloc.page(page).page_start();
        self.current_page_words = alloc.page_words() * alloc.page(page).physical_page_count();
        self.allocation_map.clear();
        self.allocation_map.resize(self.current_page_words, None);

        self.build_temp(arena, alloc);

        let mut pack_ok = self.pack_extra_data(padding, arena, alloc);
        if pack_ok {
            pack_ok = self.pack_encoding_words(arena);
            if pack_ok && save {
                self.save_indices(arena);
                let free = if alloc.page(page).physical_page_start() == Some(0) {
                    self.allocation_map.iter().filter(|s| s.is_none()).count()
                } else {
                    self.allocation_map[..self.extra_data_start]
                        .iter()
                        .filter(|s| s.is_none())
                        .count()
                };
                alloc
                    .page_mut(page)
                    .set_encoding_size(self.current_page_words - free);
            }
        }

        self.clear_temp(arena);
        pack_ok
    }

    /// Emit the final words of `page` from its saved layout
    pub fn encode(&mut self, page: PageId, arena: &mut Arena, alloc: &PageAllocator) -> &[u16] {
        self.page = page;
        self.page_start = alloc.page(page).page_start();
        self.current_page_words = alloc.page_words() * alloc.page(page).physical_page_count();

        self.build_temp(arena, alloc);
        self.use_saved_indices(arena);

        self.encoding.clear();
        self.encoding
            .resize(self.current_page_words, EncodingWord::PAD_VALUE);
        self.write_encoding(arena, alloc);

        self.clear_temp(arena);
        &self.encoding
    }

    fn build_temp(&mut self, arena: &mut Arena, alloc: &PageAllocator) {
        self.temp.clear();
        let nodes: Vec<NodeId> = alloc.page(self.page).nodes().to_vec();

        // Entries for the nodes physically on the page.
        for &node in &nodes {
            let slot = self.temp.len();
            self.temp.push(PageTemp {
                node,
                is_page_root: true,
                is_external: false,
                indices: EncodingIndices::default(),
            });
            arena.scratch_mut(node).temp_slot = Some(slot);
        }

        // Entries for off-page children; same-page children are only page
        // roots when they must be far-addressable anyway.
        for &node in &nodes {
            for j in 0..2 {
                let Some(sub) = arena.subnode(node, j) else {
                    continue;
                };
                if arena.page(sub) != Some(self.page) {
                    debug_assert!(arena.scratch(sub).temp_slot.is_none());
                    let slot = self.temp.len();
                    self.temp.push(PageTemp {
                        node: sub,
                        is_page_root: false,
                        is_external: true,
                        indices: EncodingIndices::default(),
                    });
                    arena.scratch_mut(sub).temp_slot = Some(slot);
                } else {
                    let slot = arena.scratch(sub).temp_slot.expect("on-page child has a slot");
                    debug_assert!(!self.temp[slot].is_external);
                    self.temp[slot].is_page_root = arena.scratch(sub).force_far_addressing;
                }
            }
        }
    }

    fn clear_temp(&mut self, arena: &mut Arena) {
        for t in &self.temp {
            arena.scratch_mut(t.node).temp_slot = None;
        }
    }

    fn pack_extra_data(&mut self, padding: usize, arena: &Arena, alloc: &PageAllocator) -> bool {
        // Leaves at root: the payload sits directly behind the header.
        if alloc.page(self.page).physical_page_start() == Some(0) && self.temp.len() == 1 {
            let size = self.node_extra_data_size(0, arena, alloc);
            let t = &mut self.temp[0];
            t.indices.extra_data = Some(self.page_start);
            t.indices.extra_data_size = size;
            for j in 0..size {
                self.allocation_map[self.page_start + j] = Some(0);
            }
            self.extra_data_start = self.page_start;
            return true;
        }

        let mut index = self.current_page_words.saturating_sub(padding);
        for slot in 0..self.temp.len() {
            let size = self.node_extra_data_size(slot, arena, alloc);
            if size == 0 {
                continue;
            }
            index = match index.checked_sub(size) {
                Some(next) if next >= self.page_start => next,
                _ => return false,
            };
            let t = &mut self.temp[slot];
            t.indices.extra_data = Some(index);
            t.indices.extra_data_size = size;
            for j in 0..size {
                self.allocation_map[index + j] = Some(slot);
            }
        }
        self.extra_data_start = index;
        true
    }

    fn pack_encoding_words(&mut self, arena: &Arena) -> bool {
        // Initial tree roots are the non-leaf page roots; leaves referenced
        // by LEAVES_FAR need no encoding word of their own.
        self.tree_roots_remaining.clear();
        for slot in 0..self.temp.len() {
            let t = &self.temp[slot];
            if t.is_page_root && arena.node(t.node).has_subnodes() {
                self.temp[slot].indices.tree_index = Some(0);
                self.tree_roots_remaining.push(slot);
            }
        }

        while !self.tree_roots_remaining.is_empty() {
            // A placement that lays down no encoding words is never taken: a
            // lone jump would only waste a word.
            let mut best_stats = PackingStats {
                encoding_words: 0,
                internal_jumps: 1,
            };
            self.best_fit = None;

            for root_position in 0..self.tree_roots_remaining.len() {
                let slot = self.tree_roots_remaining[root_position];
                for index in self.page_start..self.extra_data_start {
                    if self.allocation_map[index].is_some() {
                        continue;
                    }
                    // A root that already owns a jump word must land within
                    // the jump's signed offset range.
                    if let Some(jump_index) = self.temp[slot].indices.internal_jump {
                        let delta = index as i64 - jump_index as i64;
                        if delta.abs() > EncodingWord::OFFSET_MAX {
                            continue;
                        }
                    }
                    if self.temp[slot].indices.tree_index != Some(0) {
                        // Overflow roots are entered by JUMP and may start at
                        // any encodable tree index.
                        let mut tree_index_end = self.extra_data_start - index;
                        if tree_index_end > EncodingWord::TREE_INDEX_MAX as usize + 1 {
                            tree_index_end = EncodingWord::TREE_INDEX_MAX as usize + 1;
                        }
                        for tree_index in 0..tree_index_end {
                            if self.evaluate_packing(root_position, index, tree_index, &mut best_stats, arena)
                            {
                                break;
                            }
                        }
                    } else {
                        // Far-entered roots always start at tree index 0.
                        self.evaluate_packing(root_position, index, 0, &mut best_stats, arena);
                    }
                }
            }

            let Some((root_position, index, tree_index)) = self.best_fit else {
                self.tree_roots_remaining.clear();
                return false;
            };
            let slot = self.tree_roots_remaining.remove(root_position);
            self.commit_subtree(slot, index, tree_index, arena);
        }
        true
    }

    /// Returns true when no better placement for this root and index exists
    fn evaluate_packing(
        &mut self,
        root_position: usize,
        index: usize,
        tree_index: usize,
        best_fit_stats: &mut PackingStats,
        arena: &Arena,
    ) -> bool {
        let slot = self.tree_roots_remaining[root_position];
        let mut stats = PackingStats::default();
        self.evaluate_subtree(slot, index, tree_index, &mut stats, arena);

        if best_fit_stats.encoding_words < stats.encoding_words
            || (best_fit_stats.encoding_words == stats.encoding_words
                && best_fit_stats.internal_jumps < stats.internal_jumps)
        {
            *best_fit_stats = stats;
            self.best_fit = Some((root_position, index, tree_index));
        }

        stats.internal_jumps == 0
    }

    fn evaluate_subtree(
        &self,
        slot: usize,
        index: usize,
        tree_index: usize,
        stats: &mut PackingStats,
        arena: &Arena,
    ) {
        debug_assert!(self.temp[slot].indices.encoding_word.is_none());
        debug_assert!(self.allocation_map[index].is_none());

        let t = &self.temp[slot];
        if t.is_external || !arena.node(t.node).has_subnodes() {
            stats.encoding_words += 1;
            return;
        }

        let mut sub_stats = PackingStats {
            encoding_words: 1,
            internal_jumps: 0,
        };
        for j in 0..2 {
            let Some(sub) = arena.subnode(t.node, j) else {
                continue;
            };
            // Subnodes lie at 2t+1 and 2t+2; the word position is already
            // offset by the parent's own position.
            let sub_index = index + tree_index + 1 + j;
            if sub_index >= self.extra_data_start || self.allocation_map[sub_index].is_some() {
                stats.internal_jumps += 1;
                return;
            }
            let sub_slot = arena.scratch(sub).temp_slot.expect("child has a slot");
            self.evaluate_subtree(sub_slot, sub_index, tree_index * 2 + 1 + j, &mut sub_stats, arena);
        }

        stats.encoding_words += sub_stats.encoding_words;
        stats.internal_jumps += sub_stats.internal_jumps;
    }

    fn commit_subtree(&mut self, slot: usize, index: usize, tree_index: usize, arena: &Arena) {
        debug_assert!(self.temp[slot].indices.encoding_word.is_none());
        debug_assert!(self.allocation_map[index].is_none());

        self.allocation_map[index] = Some(slot);

        let node = self.temp[slot].node;
        if self.temp[slot].is_external || !arena.node(node).has_subnodes() {
            // Page-root leaves placed through an in-page jump chain get a
            // LEAVES_FAR word at this position.
            self.temp[slot].indices.encoding_word = Some(index);
            return;
        }

        let mut subnodes_ok = true;
        for j in 0..2 {
            if arena.subnode(node, j).is_some() {
                let sub_index = index + tree_index + 1 + j;
                if sub_index >= self.extra_data_start || self.allocation_map[sub_index].is_some() {
                    subnodes_ok = false;
                    break;
                }
            }
        }

        if subnodes_ok {
            debug_assert!(matches!(self.temp[slot].indices.tree_index, None | Some(0)));
            self.temp[slot].indices.encoding_word = Some(index);
            self.temp[slot].indices.tree_index = Some(tree_index);

            for j in 0..2 {
                if let Some(sub) = arena.subnode(node, j) {
                    let sub_slot = arena.scratch(sub).temp_slot.expect("child has a slot");
                    self.commit_subtree(sub_slot, index + tree_index + 1 + j, tree_index * 2 + 1 + j, arena);
                }
            }
        } else {
            // The subtree is cut here: a JUMP occupies this position and the
            // subtree becomes a new root placed in a later round. Its tree
            // index is decided then.
            debug_assert!(self.temp[slot].indices.internal_jump.is_none());
            self.temp[slot].indices.internal_jump = Some(index);
            self.tree_roots_remaining.push(slot);
        }
    }

    fn save_indices(&self, arena: &mut Arena) {
        for t in &self.temp {
            if t.is_external {
                arena.scratch_mut(t.node).external_indices = t.indices;
            } else {
                arena.scratch_mut(t.node).internal_indices = t.indices;
            }
        }
    }

    fn use_saved_indices(&mut self, arena: &Arena) {
        for t in &mut self.temp {
            t.indices = if t.is_external {
                arena.scratch(t.node).external_indices
            } else {
                arena.scratch(t.node).internal_indices
            };
        }
    }

    fn write_encoding(&mut self, arena: &Arena, alloc: &PageAllocator) {
        for slot in 0..self.temp.len() {
            let indices = self.temp[slot].indices;
            if let Some(jump_index) = indices.internal_jump {
                self.write_internal_jump(slot, jump_index);
            }
            if let Some(extra_index) = indices.extra_data {
                self.write_extra_data(slot, extra_index, arena, alloc);
            }
            if let Some(word_index) = indices.encoding_word {
                self.write_node_encoding(slot, word_index, arena, alloc);
            }
        }
    }

    fn write_internal_jump(&mut self, slot: usize, jump_index: usize) {
        let t = &self.temp[slot];
        debug_assert!(!t.is_external && !t.is_page_root);
        let word_index = t.indices.encoding_word.expect("jump destination placed");
        let tree_index = t.indices.tree_index.expect("jump destination tree index");

        let mut word = EncodingWord::default();
        word.set_axis(EncodingWord::AXIS_OPCODE);
        word.set_opcode(EncodingWord::OPCODE_JUMP);
        word.set_offset(word_index as i64 - jump_index as i64);
        word.set_tree_index_start(tree_index as u16);
        self.encoding[jump_index] = word.raw();
    }

    fn write_extra_data(&mut self, slot: usize, extra_index: usize, arena: &Arena, alloc: &PageAllocator) {
        let node = arena.node(self.temp[slot].node);
        if !self.temp[slot].is_external {
            if node.has_subnodes() {
                // Distance tail; the prefix rides in the cut word.
                let tail = &node.distance()[1..];
                self.encoding[extra_index..extra_index + tail.len()].copy_from_slice(tail);
            } else {
                let mut payload_index = extra_index;
                if self.temp[slot].is_page_root {
                    // Entered by LEAVES_FAR, so the count leads the block.
                    self.encoding[extra_index] = node.leaf_count() as u16;
                    payload_index += 1;
                }
                self.encoding[payload_index..payload_index + node.leaf_count()]
                    .copy_from_slice(node.leaves());
            }
        } else {
            let size = self.temp[slot].indices.extra_data_size;
            let mut offset = self.node_far_offset(slot, arena, alloc);
            for i in (0..size).rev() {
                self.encoding[extra_index + i] = offset as u16;
                offset >>= 16;
            }
            // Check for fit; the top written bit must match the sign.
            debug_assert!(offset == 0 || offset == -1);
            debug_assert_eq!(self.encoding[extra_index] & 0x8000 != 0, offset == -1);
        }
    }

    fn write_node_encoding(&mut self, slot: usize, word_index: usize, arena: &Arena, alloc: &PageAllocator) {
        let t = &self.temp[slot];
        let node = arena.node(t.node);
        let mut word = EncodingWord::default();

        if !t.is_external && (!t.is_page_root || node.has_subnodes()) {
            if node.has_subnodes() {
                word.set_axis(node.axis().expect("interior node has an axis").raw());
                word.set_stop0(node.subnode(0).is_none());
                word.set_stop1(node.subnode(1).is_none());

                let distance = node.distance();
                if distance.len() == 1 {
                    word.set_distance_immediate(distance[0]);
                } else {
                    let extra_index =
                        t.indices.extra_data.expect("multi-word distance has extra data");
                    word.set_distance_prefix(distance[0]);
                    word.set_offset(extra_index as i64 - word_index as i64);
                }
            } else {
                // Leaves referenced by LEAVES_FAR have no encoding word.
                debug_assert!(!t.is_page_root);
                let extra_index = t.indices.extra_data.unwrap_or(word_index);
                word.set_axis(EncodingWord::AXIS_OPCODE);
                word.set_opcode(EncodingWord::OPCODE_LEAVES);
                word.set_offset(extra_index as i64 - word_index as i64);
                word.set_length(t.indices.extra_data_size as u16);
            }
        } else {
            word.set_axis(EncodingWord::AXIS_OPCODE);
            word.set_opcode(if node.has_subnodes() {
                EncodingWord::OPCODE_JUMP_FAR
            } else {
                EncodingWord::OPCODE_LEAVES_FAR
            });

            if !t.is_external || t.indices.extra_data_size == 0 {
                let offset = self.node_far_offset(slot, arena, alloc);
                word.set_is_immediate_offset(true);
                word.set_immediate_offset(offset);
            } else {
                let extra_index = t.indices.extra_data.expect("far reference has extra data");
                word.set_is_immediate_offset(false);
                word.set_far_words_offset(extra_index as i64 - word_index as i64);
                word.set_far_words_count(t.indices.extra_data_size);
            }
        }

        self.encoding[word_index] = word.raw();
    }

    /// Size of a node's extra data on this page, in words
    fn node_extra_data_size(&self, slot: usize, arena: &Arena, alloc: &PageAllocator) -> usize {
        let t = &self.temp[slot];
        let node = arena.node(t.node);

        if !t.is_external {
            if node.has_subnodes() {
                node.distance_length() - 1
            } else if t.is_page_root {
                // Entered by LEAVES_FAR, which lands on a count word.
                node.leaf_count() + 1
            } else {
                node.leaf_count()
            }
        } else {
            // Bound the eventual word offset from above so compaction, which
            // only shrinks inter-page distances, can never outgrow this
            // allocation.
            let this_page = alloc.page(self.page);
            let other_page = alloc.page(arena.page(t.node).expect("external node has a page"));
            let this_start = this_page.physical_page_start().expect("page is bound");
            let other_start = other_page.physical_page_start().expect("page is bound");
            let delta = this_start.abs_diff(other_start)
                + this_page.physical_page_count()
                + other_page.physical_page_count();
            words_required((delta << self.page_word_bits) as u64)
        }
    }

    /// Word offset of a far reference, from the referring word
    fn node_far_offset(&self, slot: usize, arena: &Arena, alloc: &PageAllocator) -> i64 {
        let t = &self.temp[slot];
        let node_scratch = arena.scratch(t.node);

        let target_index = match node_scratch.internal_indices.encoding_word {
            Some(encoding_word) if t.is_external => encoding_word,
            _ => {
                // Far-addressed leaves point straight at their extra data.
                debug_assert!(!arena.node(t.node).has_subnodes());
                node_scratch
                    .internal_indices
                    .extra_data
                    .expect("far leaf has extra data")
            }
        };

        let page_words = alloc.page_words() as i64;
        let this_start =
            alloc.page(self.page).physical_page_start().expect("page is bound") as i64;
        let target_page = arena.page(t.node).expect("node has a page");
        let target_start =
            alloc.page(target_page).physical_page_start().expect("page is bound") as i64;

        let referring = this_start * page_words
            + t.indices.encoding_word.expect("far reference is placed") as i64;
        let target = target_start * page_words + target_index as i64;
        target - referring
    }
}

fn words_required(offset_bound: u64) -> usize {
    if offset_bound <= EncodingWord::IMMEDIATE_OFFSET_MAX as u64 {
        return 0;
    }
    // Allow for negation and sign extension.
    let mut words = 1;
    let mut x = offset_bound;
    while x > 0x7fff {
        words += 1;
        x >>= 16;
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::HEADER_LENGTH;
    use crate::tree::{Axis, Node};

    fn leaf(words: &[u16]) -> Node {
        let mut n = Node::new();
        n.set_leaves(words.to_vec()).unwrap();
        n
    }

    #[test]
    fn test_words_required() {
        assert_eq!(words_required(0), 0);
        assert_eq!(words_required(0x3ff), 0);
        assert_eq!(words_required(0x400), 1);
        assert_eq!(words_required(0x7fff), 1);
        assert_eq!(words_required(0x8000), 2);
        assert_eq!(words_required(0x7fff_ffff), 2);
        assert_eq!(words_required(0x8000_0000), 3);
    }

    #[test]
    fn test_single_page_heap_placement() {
        // root cut with two leaf children, all on the root page.
        let mut root = Node::new();
        root.set_cut_immediate(0x7ff0, Axis::Y, Some(leaf(&[1, 2, 3, 4])), Some(leaf(&[5; 5])))
            .unwrap();
        root.assign_compare_ids(1);

        let mut arena = Arena::build(&root);
        arena.scratch_mut(0).force_far_addressing = true;
        let mut alloc = PageAllocator::new(PageBits::Page64B);
        let page = alloc.allocate(1);
        for id in 0..arena.len() {
            alloc.insert_node(page, id, &mut arena);
        }

        let mut packer = PagePacker::new(PageBits::Page64B);
        assert!(packer.pack(page, true, 0, &mut arena, &mut alloc));

        // Root at the first free word after the header, children at the
        // heap positions for tree indices 1 and 2.
        assert_eq!(arena.scratch(0).internal_indices.encoding_word, Some(HEADER_LENGTH));
        assert_eq!(arena.scratch(0).internal_indices.tree_index, Some(0));
        assert_eq!(arena.scratch(1).internal_indices.encoding_word, Some(HEADER_LENGTH + 1));
        assert_eq!(arena.scratch(2).internal_indices.encoding_word, Some(HEADER_LENGTH + 2));

        // Extra data fills the page tail: the second leaf's block was
        // allocated after the first, so it sits below it.
        assert_eq!(arena.scratch(1).internal_indices.extra_data, Some(32 - 4));
        assert_eq!(arena.scratch(2).internal_indices.extra_data, Some(32 - 9));

        let words = packer.encode(page, &mut arena, &alloc).to_vec();
        assert_eq!(words.len(), 32);

        let root_word = EncodingWord::from_raw(words[HEADER_LENGTH]);
        assert_eq!(root_word.axis(), EncodingWord::AXIS_Y);
        assert!(!root_word.stop0());
        assert!(!root_word.stop1());
        assert_eq!(root_word.distance_immediate(), 0x7ff0);

        let leaves_word = EncodingWord::from_raw(words[HEADER_LENGTH + 1]);
        assert_eq!(leaves_word.axis(), EncodingWord::AXIS_OPCODE);
        assert_eq!(leaves_word.opcode(), EncodingWord::OPCODE_LEAVES);
        assert_eq!(leaves_word.length(), 4);
        let target = (HEADER_LENGTH + 1) as i64 + leaves_word.offset();
        assert_eq!(target, 28);
        assert_eq!(&words[28..32], &[1, 2, 3, 4]);

        // Untouched words are padding.
        assert_eq!(words[0], EncodingWord::PAD_VALUE);
        assert_eq!(words[HEADER_LENGTH + 3], EncodingWord::PAD_VALUE);
    }

    #[test]
    fn test_pack_fails_when_page_too_small() {
        let mut root = Node::new();
        root.set_cut_immediate(0x0040, Axis::X, Some(leaf(&[1; 10])), Some(leaf(&[2; 10])))
            .unwrap();
        root.assign_compare_ids(1);

        let mut arena = Arena::build(&root);
        arena.scratch_mut(0).force_far_addressing = true;
        let mut alloc = PageAllocator::new(PageBits::Page32B);
        let page = alloc.allocate(1);
        for id in 0..arena.len() {
            alloc.insert_node(page, id, &mut arena);
        }

        // 20 payload words + 3 encoding words + header cannot fit 16 words.
        let mut packer = PagePacker::new(PageBits::Page32B);
        assert!(!packer.pack(page, true, 0, &mut arena, &mut alloc));
        // A failed pack leaves no saved layout behind.
        assert!(arena.scratch(1).internal_indices.encoding_word.is_none());
    }
}
