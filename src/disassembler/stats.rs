//! Size and cache-behavior accounting over an encoded image

use super::{offset_position, Disassembler};
use crate::encoding::{EncodingHeader, EncodingWord, HEADER_LENGTH};

/// Word-level breakdown of an encoded image
///
/// All fields count 16-bit words except the `*_count` fields, which count
/// occurrences, and `total_leaf_cache_misses`, which sums the page-load
/// depth over every leaf visit.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EncodingStats {
    /// Words accounted to any node, extra data, or the header
    pub total_encoding_data: usize,
    /// Unused words (and the whole image on a version mismatch)
    pub padding_data: usize,
    /// Header words
    pub header_data: usize,
    /// Cutting-plane encoding words
    pub cutting_plane_node_count: usize,
    /// Distance-tail words owned by cutting planes
    pub cutting_plane_extra_data: usize,
    /// Leaf-count prefix words of far-addressed leaf blocks
    pub leaf_header_count: usize,
    /// Leaf payload words, near and far
    pub leaf_block_data: usize,
    /// `LEAVES` words
    pub leaf_node_count: usize,
    /// `LEAVES_FAR` words
    pub leaf_node_far_count: usize,
    /// Extra-data words holding `LEAVES_FAR` offsets
    pub leaf_node_far_extra_data: usize,
    /// `JUMP` words
    pub jump_node_count: usize,
    /// `JUMP_FAR` words
    pub jump_node_far_count: usize,
    /// Extra-data words holding `JUMP_FAR` offsets
    pub jump_node_far_extra_data: usize,
    /// Sum over leaf visits of the number of page loads on the path
    pub total_leaf_cache_misses: usize,
}

impl Disassembler {
    /// Accumulate statistics over `image`
    ///
    /// A version mismatch records the whole image as padding. The cache-miss
    /// depth starts at 1 for the root page load and grows by one around
    /// every far reference that crosses a page boundary.
    pub fn stats(&mut self, image: &[u16]) -> EncodingStats {
        let mut stats = EncodingStats::default();
        let Ok(header) = EncodingHeader::from_words(image) else {
            stats.padding_data = image.len();
            return stats;
        };

        stats.header_data = HEADER_LENGTH;
        self.page_words = header.page_bits().page_words();
        self.cache_miss_depth = 1;

        if header.leaves_at_root() {
            self.stats_leaves_far(image, HEADER_LENGTH, &mut stats);
        } else {
            self.distance_length = header.distance_length();
            self.stats_node(image, HEADER_LENGTH, 0, &mut stats);
        }

        stats.total_encoding_data = stats.cutting_plane_node_count
            + stats.cutting_plane_extra_data
            + stats.leaf_header_count
            + stats.leaf_block_data
            + stats.leaf_node_count
            + stats.leaf_node_far_count
            + stats.leaf_node_far_extra_data
            + stats.jump_node_count
            + stats.jump_node_far_count
            + stats.jump_node_far_extra_data
            + stats.header_data;
        stats.padding_data = image.len() - stats.total_encoding_data;
        stats
    }

    fn stats_node(
        &mut self,
        image: &[u16],
        position: usize,
        tree_index: usize,
        stats: &mut EncodingStats,
    ) {
        let word = EncodingWord::from_raw(image[position]);

        if word.axis() == EncodingWord::AXIS_OPCODE {
            match word.opcode() {
                EncodingWord::OPCODE_LEAVES => {
                    stats.leaf_node_count += 1;
                    // Technically extra data, but counting it as leaf block
                    // keeps the leaf total meaningful.
                    stats.leaf_block_data += word.length() as usize;
                    stats.total_leaf_cache_misses += self.cache_miss_depth;
                }
                EncodingWord::OPCODE_LEAVES_FAR => {
                    stats.leaf_node_far_count += 1;
                    if !word.is_immediate_offset() {
                        stats.leaf_node_far_extra_data += word.far_words_count();
                    }
                    let target = offset_position(position, self.far_offset(image, position));
                    let crosses = self.page_base(position) != self.page_base(target);
                    if crosses {
                        self.cache_miss_depth += 1;
                    }
                    self.stats_leaves_far(image, target, stats);
                    if crosses {
                        self.cache_miss_depth -= 1;
                    }
                }
                EncodingWord::OPCODE_JUMP => {
                    stats.jump_node_count += 1;
                    let target = offset_position(position, word.offset());
                    self.stats_node(image, target, word.tree_index_start() as usize, stats);
                }
                _ => {
                    stats.jump_node_far_count += 1;
                    if !word.is_immediate_offset() {
                        stats.jump_node_far_extra_data += word.far_words_count();
                    }
                    let target = offset_position(position, self.far_offset(image, position));
                    let crosses = self.page_base(position) != self.page_base(target);
                    if crosses {
                        self.cache_miss_depth += 1;
                    }
                    self.stats_node(image, target, 0, stats);
                    if crosses {
                        self.cache_miss_depth -= 1;
                    }
                }
            }
            return;
        }

        stats.cutting_plane_node_count += 1;
        stats.cutting_plane_extra_data += self.distance_length - 1;

        if !word.stop0() {
            self.stats_node(image, position + tree_index + 1, tree_index * 2 + 1, stats);
        }
        if !word.stop1() {
            self.stats_node(image, position + tree_index + 2, tree_index * 2 + 2, stats);
        }
    }

    fn stats_leaves_far(&mut self, image: &[u16], position: usize, stats: &mut EncodingStats) {
        let leaf_count = image[position] as usize;
        assert!(
            leaf_count < EncodingWord::LEAF_COUNT_OVERFLOW as usize,
            "leaf block overflow requires a caller-embedded header"
        );
        stats.leaf_header_count += 1;
        stats.leaf_block_data += leaf_count;
        stats.total_leaf_cache_misses += self.cache_miss_depth;
    }
}
