//! Per-assembly scratch state
//!
//! The assembler never mutates the caller's tree. Everything it needs to
//! track per node (parent links, page membership, packed word indices) lives
//! in an [`Arena`] side-table keyed by a pre-order node id and torn down when
//! the assembly ends.

use super::page::PageId;
use crate::tree::Node;

/// Index of a node within the assembly arena
pub(crate) type NodeId = usize;

/// Word positions computed while packing or replaying a page layout
///
/// `encoding_word` is where traversal lands for the node (or where the
/// external far reference lives), `extra_data` the start of its owned tail
/// words, `internal_jump` the position of a `JUMP` word left behind when the
/// node's subtree had to be re-rooted inside its page.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct EncodingIndices {
    pub encoding_word: Option<usize>,
    pub extra_data: Option<usize>,
    pub extra_data_size: usize,
    pub internal_jump: Option<usize>,
    pub tree_index: Option<usize>,
}

impl EncodingIndices {
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Scratch attached to one node for the duration of one assembly
#[derive(Debug, Default)]
pub(crate) struct NodeScratch {
    /// Parent in the tree, if any
    pub supernode: Option<NodeId>,
    /// Children, mirroring `Node::subnode`
    pub subnodes: [Option<NodeId>; 2],
    /// Must carry an encoding word reachable from outside its page
    pub force_far_addressing: bool,
    /// Virtual page currently holding the node
    pub page: Option<PageId>,
    /// Packer temp-record slot while its page is being packed
    pub temp_slot: Option<usize>,
    /// Saved layout on the page the node lives on
    pub internal_indices: EncodingIndices,
    /// Saved layout of the far reference on the page that points at the node
    pub external_indices: EncodingIndices,
}

/// Side-table of per-node scratch built once per assembly
///
/// Ids are assigned pre-order, so `id + 1` equals the node's compare id.
pub(crate) struct Arena<'t> {
    nodes: Vec<&'t Node>,
    scratch: Vec<NodeScratch>,
}

impl<'t> Arena<'t> {
    /// Flatten `root`'s tree into the arena
    pub fn build(root: &'t Node) -> Self {
        let mut arena = Self {
            nodes: Vec::new(),
            scratch: Vec::new(),
        };
        arena.add(root, None);
        arena
    }

    fn add(&mut self, node: &'t Node, supernode: Option<NodeId>) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(node);
        self.scratch.push(NodeScratch {
            supernode,
            ..NodeScratch::default()
        });
        for j in 0..2 {
            if let Some(sub) = node.subnode(j) {
                let sub_id = self.add(sub, Some(id));
                self.scratch[id].subnodes[j] = Some(sub_id);
            }
        }
        id
    }

    #[inline]
    pub fn node(&self, id: NodeId) -> &'t Node {
        self.nodes[id]
    }

    #[inline]
    pub fn scratch(&self, id: NodeId) -> &NodeScratch {
        &self.scratch[id]
    }

    #[inline]
    pub fn scratch_mut(&mut self, id: NodeId) -> &mut NodeScratch {
        &mut self.scratch[id]
    }

    #[inline]
    pub fn subnode(&self, id: NodeId, index: usize) -> Option<NodeId> {
        self.scratch[id].subnodes[index]
    }

    #[inline]
    pub fn page(&self, id: NodeId) -> Option<PageId> {
        self.scratch[id].page
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}
