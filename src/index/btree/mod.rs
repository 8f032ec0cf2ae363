pub mod codec;
pub mod error;
pub mod index;
pub mod node;

pub use error::BTreeError;
pub use index::base::BTreeIndex;
pub use index::range_scan::BTreeIterator;
pub use node::{BTreeNode, NodeType};
