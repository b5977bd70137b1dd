pub mod assembler;
pub mod context;
pub mod document;
pub mod ids;
pub mod message;
pub mod settings;
pub mod thread;
pub mod title;
pub mod tree;
pub mod workspace;

pub use assembler::{AssemblyError, AssemblyPhase, StreamAssembler};
pub use document::{DocumentKey, DocumentSet, is_document_mime};
pub use ids::{EdgeId, NodeId, ROOT_NODE_ID};
pub use message::{Attachment, Message, Role};
pub use settings::{Settings, SettingsError, SettingsStore};
pub use thread::{Thread, ThreadContextManager, ThreadError};
pub use tree::{ActivePath, Edge, Node, Position, TreeError, TreeSnapshot, TreeStore};
pub use workspace::{TREE_BLOB_KEY, TurnOutcome, Workspace, WorkspaceError, relay};
