//! Variable-length blobs over the L1-L3 block stack, stored as balanced
//! trees of fixed-size blocks.

mod node;
mod tree;

pub use node::TreeGeometry;
pub use tree::{BlobHandle, BlobStore};
