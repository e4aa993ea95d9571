//! Minimal local document model.
//!
//! `EditorState` stands in for the editor engine: it owns the node tree, runs
//! edit transactions and reports which nodes each transaction touched.

mod editor;
mod node;
mod state_map;

pub use editor::{EditorError, EditorState, EditorUpdate, NodeMap, UpdateOrigin};
pub use node::{LocalNode, NodeData, NodeKey, NodeKind, Properties, TextFormat};
pub use state_map::{StateMap, StateMapChange, StateMapId};
