//! Reconstructs a tree from an encoded image
//!
//! The disassembler walks the image the way the runtime traversal would,
//! rebuilding an owned [`Node`] tree. With a `compare_to` tree it instead
//! validates the image, reporting the compare id of the earliest expected
//! node at which the two diverge.

mod stats;

pub use stats::EncodingStats;

use crate::encoding::{
    unpack_signed_words, EncodingHeader, EncodingWord, DISTANCE_LENGTH_MAX, HEADER_LENGTH,
};
use crate::tree::{Axis, Node};

/// Decodes and validates encoded images
///
/// # Examples
///
/// ```rust
/// use kdpack::{assemble, Disassembler, Node, PageBits};
///
/// let mut root = Node::new();
/// root.set_leaves(vec![1, 2, 3])?;
/// let image = assemble(&mut root, PageBits::Page64B);
///
/// let decoded = Disassembler::new().disassemble(&image, None).unwrap();
/// assert!(decoded.equals(&root, true));
/// # Ok::<(), kdpack::KdpackError>(())
/// ```
pub struct Disassembler {
    distance_length: usize,
    page_words: usize,
    compare_fail_id: u32,
    cache_miss_depth: usize,
}

impl Disassembler {
    /// Create a disassembler
    pub fn new() -> Self {
        Self {
            distance_length: 0,
            page_words: 0,
            compare_fail_id: 0,
            cache_miss_depth: 0,
        }
    }

    /// Rebuild the tree encoded in `image`
    ///
    /// Returns `None` when the magic word mismatches or, in compare mode,
    /// when the image diverges from `compare_to` (see
    /// [`Disassembler::compare_fail_id`]). Structural invariant violations
    /// in the image itself (padding reached by traversal, out-of-image
    /// references) are programming errors of the producer and panic.
    pub fn disassemble(&mut self, image: &[u16], compare_to: Option<&Node>) -> Option<Node> {
        self.compare_fail_id = 0;
        let header = EncodingHeader::from_words(image).ok()?;
        self.page_words = header.page_bits().page_words();

        let result = if header.leaves_at_root() {
            self.decode_leaves_far(image, HEADER_LENGTH, compare_to)
        } else {
            self.distance_length = header.distance_length();
            self.decode_node(image, HEADER_LENGTH, 0, compare_to)
        };

        if self.compare_fail_id != 0 {
            return None;
        }
        result
    }

    /// Compare id of the expected node at the first divergence found by the
    /// last compare-mode disassembly; 0 means no failure
    #[inline]
    pub fn compare_fail_id(&self) -> u32 {
        self.compare_fail_id
    }

    fn decode_node(
        &mut self,
        image: &[u16],
        position: usize,
        tree_index: usize,
        compare_to: Option<&Node>,
    ) -> Option<Node> {
        let word = EncodingWord::from_raw(image[position]);
        let raw_axis = word.axis();

        if raw_axis == EncodingWord::AXIS_OPCODE {
            return match word.opcode() {
                EncodingWord::OPCODE_LEAVES => {
                    let target = offset_position(position, word.offset());
                    self.decode_leaves(image, target, word.length() as usize, compare_to)
                }
                EncodingWord::OPCODE_LEAVES_FAR => {
                    let target = offset_position(position, self.far_offset(image, position));
                    self.decode_leaves_far(image, target, compare_to)
                }
                EncodingWord::OPCODE_JUMP => {
                    let target = offset_position(position, word.offset());
                    self.decode_node(image, target, word.tree_index_start() as usize, compare_to)
                }
                _ => {
                    let target = offset_position(position, self.far_offset(image, position));
                    self.decode_node(image, target, 0, compare_to)
                }
            };
        }

        // A padding word would decode as an X cut with both stop bits set.
        assert!(
            !(word.stop0() && word.stop1()),
            "padding reached by traversal at word {position}"
        );

        let mut distance = [0u16; DISTANCE_LENGTH_MAX];
        if self.distance_length == 1 {
            distance[0] = word.distance_immediate();
        } else {
            distance[0] = word.distance_prefix();
            let extra = offset_position(position, word.offset());
            for i in 1..self.distance_length {
                distance[i] = image[extra + i - 1];
            }
        }

        let axis = Axis::from_raw(raw_axis).expect("axis checked against the opcode escape");

        if let Some(expected) = compare_to {
            if expected.axis() != Some(axis)
                || expected.distance_length() != self.distance_length
                || expected.distance() != &distance[..self.distance_length]
                || word.stop0() != expected.subnode(0).is_none()
                || word.stop1() != expected.subnode(1).is_none()
            {
                self.compare_fail_id = expected.compare_id();
                return None;
            }
        }

        let mut subnodes: [Option<Box<Node>>; 2] = [None, None];
        for j in 0..2 {
            let stopped = if j == 0 { word.stop0() } else { word.stop1() };
            if stopped {
                continue;
            }
            // Subnodes lie at 2t+1 and 2t+2, and the position is already
            // offset by t.
            let target = position + tree_index + 1 + j;
            let sub_compare = compare_to.and_then(|c| c.subnode(j));
            let subnode = self.decode_node(image, target, tree_index * 2 + 1 + j, sub_compare);
            if self.compare_fail_id != 0 {
                // First divergence wins; stop descending.
                return None;
            }
            subnodes[j] = subnode.map(Box::new);
        }

        Some(Node::new_cut_decoded(
            &distance[..self.distance_length],
            axis,
            subnodes,
        ))
    }

    fn decode_leaves_far(
        &mut self,
        image: &[u16],
        position: usize,
        compare_to: Option<&Node>,
    ) -> Option<Node> {
        let leaf_count = image[position] as usize;
        assert!(
            leaf_count < EncodingWord::LEAF_COUNT_OVERFLOW as usize,
            "leaf block overflow requires a caller-embedded header"
        );
        self.decode_leaves(image, position + 1, leaf_count, compare_to)
    }

    fn decode_leaves(
        &mut self,
        image: &[u16],
        position: usize,
        leaf_count: usize,
        compare_to: Option<&Node>,
    ) -> Option<Node> {
        let leaves = image[position..position + leaf_count].to_vec();

        if let Some(expected) = compare_to {
            if expected.leaves() != &leaves[..] {
                self.compare_fail_id = expected.compare_id();
                return None;
            }
        }

        Some(Node::new_leaves_decoded(leaves))
    }

    /// Resolve a far reference's word offset, immediate or from extra data
    fn far_offset(&self, image: &[u16], position: usize) -> i64 {
        let word = EncodingWord::from_raw(image[position]);
        if word.is_immediate_offset() {
            word.immediate_offset()
        } else {
            let words_position = offset_position(position, word.far_words_offset());
            let count = word.far_words_count();
            unpack_signed_words(&image[words_position..words_position + count])
        }
    }

    /// First word index of the page containing `position`
    fn page_base(&self, position: usize) -> usize {
        position & !(self.page_words - 1)
    }
}

impl Default for Disassembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Rebuild the tree encoded in `image`
///
/// Convenience wrapper over [`Disassembler`] without compare mode.
pub fn disassemble(image: &[u16]) -> Option<Node> {
    Disassembler::new().disassemble(image, None)
}

fn offset_position(position: usize, offset: i64) -> usize {
    let target = position as i64 + offset;
    assert!(target >= 0, "reference before image start");
    target as usize
}
