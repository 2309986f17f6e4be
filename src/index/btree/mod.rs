pub mod error;
pub mod index;
pub mod key;
pub mod node;
pub mod serialization;

pub use error::BTreeError;
pub use index::{BTreeIndex, IndexIterator};
pub use key::{GenericKey, IndexKey};
pub use node::BTreeNode;
