//! Binary instruction format for encoded k-d trees
//!
//! The encoded image is a sequence of 16-bit words grouped into fixed-size
//! pages. The first two words form the header; every other word is a node's
//! encoding word, node-owned extra data, an internal-jump word, or padding.

pub mod header;
pub mod word;

pub use header::{EncodingHeader, PageBits, DISTANCE_LENGTH_MAX, HEADER_LENGTH, VERSION_1};
pub use word::{unpack_signed_words, unpack_unsigned_words, EncodingWord};
