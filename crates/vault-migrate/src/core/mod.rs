//! Store-agnostic core: node model and store traits.

pub mod node;
pub mod traits;

pub use node::{
    node_id, ContainerRef, DeletedNodeEvent, GroupUri, Node, NodeKind, NodeProperty, NodeType,
    SourceKind, SourceNode, SourceProperty,
};
pub use traits::{DeletionLog, DestinationStore, PropertyCache, SourceStore};
