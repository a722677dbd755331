//! # Kdpack: cache-optimized binary encoding for k-d trees
//!
//! This crate compiles a k-d tree (interior nodes carrying axis-aligned
//! cutting planes, leaves carrying opaque 16-bit payload words) into a
//! compact paged instruction stream, and disassembles such images back into
//! trees.
//!
//! The encoding is built for traversal with minimal cache-line transfers:
//! ancestor and descendant nodes share a fixed-size page whenever possible,
//! children are located implicitly by heap index instead of stored
//! pointers, and references that must leave a page are compressed to as few
//! bits as the layout permits.
//!
//! ## Key pieces
//!
//! - **Tree IR** ([`Node`]): the mutable, caller-owned input and output
//!   representation, validated at construction
//! - **Assembler** ([`assemble`], [`Assembler`]): distributes nodes over
//!   virtual pages, packs each page by heap-indexed placement with
//!   internal-jump fallbacks, bin-packs underfull pages, and emits the image
//! - **Disassembler** ([`Disassembler`]): rebuilds the tree, optionally
//!   comparing against an expected tree and reporting the first divergence
//! - **Statistics** ([`EncodingStats`]): word-level accounting and
//!   cache-miss totals over an image
//!
//! ## Quick start
//!
//! ```rust
//! use kdpack::{assemble, Axis, Disassembler, Node, PageBits};
//!
//! // cut(Y) -> [leaves, leaves]
//! let mut less = Node::new();
//! less.set_leaves(vec![0x0101, 0x0102])?;
//! let mut greater = Node::new();
//! greater.set_leaves(vec![0x0201])?;
//! let mut root = Node::new();
//! root.set_cut_immediate(0x7ff0, Axis::Y, Some(less), Some(greater))?;
//!
//! let image = assemble(&mut root, PageBits::Page64B);
//! assert_eq!(image.len() % PageBits::Page64B.page_words(), 0);
//!
//! let mut disassembler = Disassembler::new();
//! let decoded = disassembler.disassemble(&image, Some(&root)).unwrap();
//! assert!(decoded.equals(&root, true));
//!
//! let stats = disassembler.stats(&image);
//! assert_eq!(stats.leaf_block_data, 3);
//! # Ok::<(), kdpack::KdpackError>(())
//! ```

#![warn(missing_docs)]

pub mod assembler;
pub mod disassembler;
pub mod encoding;
pub mod error;
pub mod tree;

// Re-export core types
pub use assembler::{assemble, Assembler, DEFAULT_ACTIVITY_FREQUENCY};
pub use disassembler::{disassemble, Disassembler, EncodingStats};
pub use encoding::{
    EncodingHeader, EncodingWord, PageBits, DISTANCE_LENGTH_MAX, HEADER_LENGTH, VERSION_1,
};
pub use error::{KdpackError, Result};
pub use tree::{Axis, Node};
