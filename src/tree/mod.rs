//! In-memory k-d tree fed to the assembler and produced by the disassembler
//!
//! A [`Node`] is either an interior cutting plane with up to two owned
//! children or a leaf holding opaque 16-bit payload words, never both.
//! Transitions between the two shapes go through [`Node::set_cut`] /
//! [`Node::set_leaves`], which discard the previous content, so the
//! exclusivity invariant cannot be broken from outside the crate. All
//! user-input validation happens here; the assembler itself is total.

use crate::encoding::{EncodingWord, DISTANCE_LENGTH_MAX};
use crate::error::{KdpackError, Result};

/// Cutting-plane axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Axis {
    /// Plane perpendicular to X
    X = 0,
    /// Plane perpendicular to Y
    Y = 1,
    /// Plane perpendicular to Z
    Z = 2,
}

impl Axis {
    /// Build from a raw encoded value; `3` is the opcode escape, not an axis
    pub fn from_raw(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::X),
            1 => Some(Self::Y),
            2 => Some(Self::Z),
            _ => None,
        }
    }

    /// The raw encoded value
    #[inline]
    pub fn raw(self) -> u16 {
        self as u16
    }
}

#[derive(Debug, Clone)]
struct CutData {
    axis: Axis,
    distance: [u16; DISTANCE_LENGTH_MAX],
    distance_length: u8,
    subnodes: [Option<Box<Node>>; 2],
}

#[derive(Debug, Clone)]
enum Content {
    Leaves(Vec<u16>),
    Cut(CutData),
}

/// One k-d tree node: an interior cutting plane or a leaf payload block
///
/// A fresh node is an empty leaf. Parents exclusively own their children;
/// moving a node into [`Node::set_cut`] transfers ownership.
///
/// # Examples
///
/// ```rust
/// use kdpack::{Axis, Node};
///
/// let mut left = Node::new();
/// left.set_leaves(vec![0x1234])?;
/// let mut root = Node::new();
/// root.set_cut_immediate(0x7ff0, Axis::Y, Some(left), None)?;
/// assert!(root.has_subnodes());
/// # Ok::<(), kdpack::KdpackError>(())
/// ```
#[derive(Debug, Clone)]
pub struct Node {
    content: Content,
    compare_id: u32,
}

impl Node {
    /// Create an empty leaf node
    pub fn new() -> Self {
        Self {
            content: Content::Leaves(Vec::new()),
            compare_id: 0,
        }
    }

    /// Whether any child is present
    #[inline]
    pub fn has_subnodes(&self) -> bool {
        match &self.content {
            Content::Cut(cut) => cut.subnodes.iter().any(|s| s.is_some()),
            Content::Leaves(_) => false,
        }
    }

    /// The cutting axis, or `None` for a leaf
    pub fn axis(&self) -> Option<Axis> {
        match &self.content {
            Content::Cut(cut) => Some(cut.axis),
            Content::Leaves(_) => None,
        }
    }

    /// The distance words, high-order first; empty for a leaf
    pub fn distance(&self) -> &[u16] {
        match &self.content {
            Content::Cut(cut) => &cut.distance[..cut.distance_length as usize],
            Content::Leaves(_) => &[],
        }
    }

    /// The distance length in words; 0 for a leaf
    ///
    /// Constant across a whole tree, it is encoded once in the image header.
    pub fn distance_length(&self) -> usize {
        match &self.content {
            Content::Cut(cut) => cut.distance_length as usize,
            Content::Leaves(_) => 0,
        }
    }

    /// Child 0 (less side) or child 1 (greater side)
    pub fn subnode(&self, index: usize) -> Option<&Node> {
        assert!(index < 2, "subnode index out of range");
        match &self.content {
            Content::Cut(cut) => cut.subnodes[index].as_deref(),
            Content::Leaves(_) => None,
        }
    }

    /// Number of leaf payload words; 0 for an interior node
    pub fn leaf_count(&self) -> usize {
        match &self.content {
            Content::Leaves(leaves) => leaves.len(),
            Content::Cut(_) => 0,
        }
    }

    /// Leaf payload words; empty for an interior node
    pub fn leaves(&self) -> &[u16] {
        match &self.content {
            Content::Leaves(leaves) => leaves,
            Content::Cut(_) => &[],
        }
    }

    /// Turn this node into an interior cutting plane
    ///
    /// `distance` is the quantised plane distance, high-order word first; its
    /// length is the tree-wide distance length. Previous content is
    /// discarded. Fails without modifying the node when the distance is out
    /// of range or an interior child disagrees on distance length.
    pub fn set_cut(
        &mut self,
        distance: &[u16],
        axis: Axis,
        less: Option<Node>,
        greater: Option<Node>,
    ) -> Result<()> {
        let distance_length = distance.len();
        if distance_length == 0 || distance_length > DISTANCE_LENGTH_MAX {
            return Err(KdpackError::invalid_distance_length(format!(
                "distance length {} outside 1..={}",
                distance_length, DISTANCE_LENGTH_MAX
            )));
        }
        if distance[0] > EncodingWord::DISTANCE_IMMEDIATE_MAX {
            return Err(KdpackError::invalid_distance(format!(
                "first distance word {:#06x} exceeds {:#06x}",
                distance[0],
                EncodingWord::DISTANCE_IMMEDIATE_MAX
            )));
        }
        if distance_length == 1 {
            if distance[0] & !EncodingWord::DISTANCE_IMMEDIATE_MASK != 0 {
                return Err(KdpackError::invalid_distance(format!(
                    "immediate distance {:#06x} has trailing bits that would be lost",
                    distance[0]
                )));
            }
        } else if distance[0] > EncodingWord::DISTANCE_PREFIX_MAX {
            return Err(KdpackError::invalid_distance(format!(
                "distance prefix {:#06x} exceeds {:#06x}",
                distance[0],
                EncodingWord::DISTANCE_PREFIX_MAX
            )));
        }
        for child in [&less, &greater].into_iter().flatten() {
            if child.has_subnodes() && child.distance_length() != distance_length {
                return Err(KdpackError::invalid_distance_length(format!(
                    "child distance length {} differs from parent {}",
                    child.distance_length(),
                    distance_length
                )));
            }
        }

        let mut words = [0u16; DISTANCE_LENGTH_MAX];
        words[..distance_length].copy_from_slice(distance);
        self.content = Content::Cut(CutData {
            axis,
            distance: words,
            distance_length: distance_length as u8,
            subnodes: [less.map(Box::new), greater.map(Box::new)],
        });
        Ok(())
    }

    /// [`Node::set_cut`] for a scalar distance split into big-endian words
    pub fn set_cut_scalar(
        &mut self,
        distance: u64,
        distance_length: usize,
        axis: Axis,
        less: Option<Node>,
        greater: Option<Node>,
    ) -> Result<()> {
        if distance_length == 0 || distance_length > DISTANCE_LENGTH_MAX {
            return Err(KdpackError::invalid_distance_length(format!(
                "distance length {} outside 1..={}",
                distance_length, DISTANCE_LENGTH_MAX
            )));
        }
        let mut words = [0u16; DISTANCE_LENGTH_MAX];
        let mut value = distance;
        for word in words[..distance_length].iter_mut().rev() {
            *word = value as u16;
            value >>= 16;
        }
        if value != 0 {
            return Err(KdpackError::invalid_distance(format!(
                "distance {:#x} does not fit in {} words",
                distance, distance_length
            )));
        }
        self.set_cut(&words[..distance_length], axis, less, greater)
    }

    /// [`Node::set_cut`] for distance length 1
    pub fn set_cut_immediate(
        &mut self,
        distance: u16,
        axis: Axis,
        less: Option<Node>,
        greater: Option<Node>,
    ) -> Result<()> {
        self.set_cut(&[distance], axis, less, greater)
    }

    /// Turn this node into a leaf owning `leaves`
    ///
    /// Previous content is discarded. Counts at or beyond
    /// [`EncodingWord::LEAF_COUNT_OVERFLOW`] would need a caller-embedded
    /// length header and are rejected.
    pub fn set_leaves(&mut self, leaves: Vec<u16>) -> Result<()> {
        if leaves.len() >= EncodingWord::LEAF_COUNT_OVERFLOW as usize {
            return Err(KdpackError::leaf_overflow(
                leaves.len(),
                EncodingWord::LEAF_COUNT_OVERFLOW as usize - 1,
            ));
        }
        self.content = Content::Leaves(leaves);
        Ok(())
    }

    /// Reset to an empty leaf, dropping children and payload
    pub fn clear(&mut self) {
        self.content = Content::Leaves(Vec::new());
    }

    /// Deep structural equality, optionally ignoring children
    ///
    /// Compare ids are not part of a node's value and are ignored.
    pub fn equals(&self, other: &Node, check_subnodes: bool) -> bool {
        if self.has_subnodes() || other.has_subnodes() {
            let (a, b) = match (&self.content, &other.content) {
                (Content::Cut(a), Content::Cut(b)) => (a, b),
                _ => return false,
            };
            if a.axis != b.axis || a.distance_length != b.distance_length {
                return false;
            }
            let len = a.distance_length as usize;
            if a.distance[..len] != b.distance[..len] {
                return false;
            }
            if !check_subnodes {
                return true;
            }
            for (sa, sb) in a.subnodes.iter().zip(&b.subnodes) {
                match (sa, sb) {
                    (Some(sa), Some(sb)) => {
                        if !sa.equals(sb, check_subnodes) {
                            return false;
                        }
                    }
                    (None, None) => {}
                    _ => return false,
                }
            }
            return true;
        }
        self.leaves() == other.leaves()
    }

    /// Canonicalise the subtree, returning true iff it holds no leaf data
    ///
    /// Interior nodes whose subtrees are empty are removed. A true return
    /// means the whole subtree is empty and the caller may drop this node
    /// too. Idempotent.
    pub fn trim_empty(&mut self) -> bool {
        match &mut self.content {
            Content::Cut(cut) => {
                for sub in cut.subnodes.iter_mut() {
                    if let Some(node) = sub {
                        if node.trim_empty() {
                            *sub = None;
                        }
                    }
                }
                cut.subnodes.iter().all(|s| s.is_none())
            }
            Content::Leaves(leaves) => leaves.is_empty(),
        }
    }

    /// Pre-order id assigned by the last assembly, 0 before any assembly
    ///
    /// The disassembler's compare mode reports divergence positions through
    /// these ids.
    #[inline]
    pub fn compare_id(&self) -> u32 {
        self.compare_id
    }

    /// Assign pre-order compare ids starting at `id`, returning the last id
    /// used. Id 0 is reserved for "no failure".
    pub(crate) fn assign_compare_ids(&mut self, id: u32) -> u32 {
        self.compare_id = id;
        let mut last = id;
        if let Content::Cut(cut) = &mut self.content {
            for sub in cut.subnodes.iter_mut().flatten() {
                last = sub.assign_compare_ids(last + 1);
            }
        }
        last
    }

    /// Build an interior node from decoded parts, bypassing user validation.
    /// The field widths of the encoding already bound every value.
    pub(crate) fn new_cut_decoded(
        distance: &[u16],
        axis: Axis,
        subnodes: [Option<Box<Node>>; 2],
    ) -> Self {
        debug_assert!(!distance.is_empty() && distance.len() <= DISTANCE_LENGTH_MAX);
        let mut words = [0u16; DISTANCE_LENGTH_MAX];
        words[..distance.len()].copy_from_slice(distance);
        Self {
            content: Content::Cut(CutData {
                axis,
                distance: words,
                distance_length: distance.len() as u8,
                subnodes,
            }),
            compare_id: 0,
        }
    }

    /// Build a leaf node from decoded payload, bypassing user validation
    pub(crate) fn new_leaves_decoded(leaves: Vec<u16>) -> Self {
        debug_assert!(leaves.len() < EncodingWord::LEAF_COUNT_OVERFLOW as usize);
        Self {
            content: Content::Leaves(leaves),
            compare_id: 0,
        }
    }
}

impl Default for Node {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(words: &[u16]) -> Node {
        let mut n = Node::new();
        n.set_leaves(words.to_vec()).unwrap();
        n
    }

    #[test]
    fn test_new_node_is_empty_leaf() {
        let n = Node::new();
        assert!(!n.has_subnodes());
        assert_eq!(n.leaf_count(), 0);
        assert_eq!(n.distance_length(), 0);
        assert_eq!(n.axis(), None);
        assert_eq!(n.compare_id(), 0);
    }

    #[test]
    fn test_set_cut_immediate() {
        let mut n = Node::new();
        n.set_cut_immediate(0x7ff0, Axis::Y, Some(leaf(&[1])), None)
            .unwrap();
        assert!(n.has_subnodes());
        assert_eq!(n.axis(), Some(Axis::Y));
        assert_eq!(n.distance(), &[0x7ff0]);
        assert!(n.subnode(0).is_some());
        assert!(n.subnode(1).is_none());
    }

    #[test]
    fn test_set_cut_rejects_bad_distances() {
        let mut n = Node::new();
        // Immediate with trailing bits that the 12-bit field cannot hold.
        assert!(n
            .set_cut_immediate(0x0008, Axis::X, Some(leaf(&[1])), None)
            .is_err());
        // Immediate beyond the max.
        assert!(n
            .set_cut_immediate(0xfff0, Axis::X, Some(leaf(&[1])), None)
            .is_err());
        // Prefix word too large for 5 bits.
        assert!(n
            .set_cut(&[0x0020, 0x0000], Axis::X, Some(leaf(&[1])), None)
            .is_err());
        // Length out of range.
        assert!(n.set_cut(&[], Axis::X, None, None).is_err());
        assert!(n.set_cut(&[0; 8], Axis::X, None, None).is_err());
        // Failed calls leave the node untouched.
        assert_eq!(n.leaf_count(), 0);
        assert!(!n.has_subnodes());
    }

    #[test]
    fn test_set_cut_scalar_splits_words() {
        let mut n = Node::new();
        n.set_cut_scalar(0x0003_0000_ffff, 3, Axis::Z, Some(leaf(&[1])), None)
            .unwrap();
        assert_eq!(n.distance(), &[0x0003, 0x0000, 0xffff]);
        // Value too wide for the word count.
        let mut m = Node::new();
        assert!(m
            .set_cut_scalar(0x1_0000_0000, 2, Axis::Z, Some(leaf(&[1])), None)
            .is_err());
    }

    #[test]
    fn test_distance_length_must_match_children() {
        let mut child = Node::new();
        child
            .set_cut(&[0x0001, 0x1234], Axis::X, Some(leaf(&[1])), None)
            .unwrap();
        let mut parent = Node::new();
        let err = parent.set_cut_immediate(0x0010, Axis::Y, Some(child), None);
        assert!(err.is_err());
    }

    #[test]
    fn test_set_leaves_overflow() {
        let mut n = Node::new();
        assert!(n.set_leaves(vec![0; 0xffff]).is_err());
        assert!(n.set_leaves(vec![0; 0xfffe]).is_ok());
    }

    #[test]
    fn test_shape_transition_discards_content() {
        let mut n = leaf(&[1, 2, 3]);
        n.set_cut_immediate(0x0040, Axis::X, Some(leaf(&[9])), None)
            .unwrap();
        assert_eq!(n.leaf_count(), 0);
        n.set_leaves(vec![7]).unwrap();
        assert!(!n.has_subnodes());
        assert_eq!(n.leaves(), &[7]);
    }

    #[test]
    fn test_trim_empty() {
        // cut -> (cut -> (empty leaf), leaf)
        let mut inner = Node::new();
        inner
            .set_cut_immediate(0x0020, Axis::X, Some(Node::new()), None)
            .unwrap();
        let mut root = Node::new();
        root.set_cut_immediate(0x0040, Axis::Y, Some(inner), Some(leaf(&[5])))
            .unwrap();

        assert!(!root.trim_empty());
        // The empty branch is gone, the populated one stays.
        assert!(root.subnode(0).is_none());
        assert!(root.subnode(1).is_some());

        // Idempotent.
        assert!(!root.trim_empty());
        assert!(root.subnode(1).is_some());
    }

    #[test]
    fn test_trim_empty_whole_tree() {
        let mut root = Node::new();
        root.set_cut_immediate(0x0040, Axis::Y, Some(Node::new()), Some(Node::new()))
            .unwrap();
        assert!(root.trim_empty());
        assert!(Node::new().trim_empty());
    }

    #[test]
    fn test_equals() {
        let mut a = Node::new();
        a.set_cut_immediate(0x0040, Axis::Y, Some(leaf(&[1, 2])), None)
            .unwrap();
        let mut b = Node::new();
        b.set_cut_immediate(0x0040, Axis::Y, Some(leaf(&[1, 2])), None)
            .unwrap();
        assert!(a.equals(&b, true));
        assert!(b.equals(&a, true));
        assert!(a.equals(&a, true));

        // Divergent child payload: caught deep, ignored shallow.
        let mut c = Node::new();
        c.set_cut_immediate(0x0040, Axis::Y, Some(leaf(&[1, 3])), None)
            .unwrap();
        assert!(!a.equals(&c, true));
        assert!(a.equals(&c, false));

        // Kind mismatch.
        assert!(!a.equals(&leaf(&[1]), true));
        assert!(!leaf(&[1]).equals(&a, true));
    }

    #[test]
    fn test_compare_id_assignment_is_preorder() {
        let mut gc = Node::new();
        gc.set_cut_immediate(0x0020, Axis::X, Some(leaf(&[1])), Some(leaf(&[2])))
            .unwrap();
        let mut root = Node::new();
        root.set_cut_immediate(0x0040, Axis::Y, Some(gc), Some(leaf(&[3])))
            .unwrap();

        let last = root.assign_compare_ids(1);
        assert_eq!(last, 5);
        assert_eq!(root.compare_id(), 1);
        assert_eq!(root.subnode(0).unwrap().compare_id(), 2);
        assert_eq!(root.subnode(0).unwrap().subnode(0).unwrap().compare_id(), 3);
        assert_eq!(root.subnode(0).unwrap().subnode(1).unwrap().compare_id(), 4);
        assert_eq!(root.subnode(1).unwrap().compare_id(), 5);
    }
}
