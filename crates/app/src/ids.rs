use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Literal id of the tree's root node.
pub const ROOT_NODE_ID: &str = "root";

// Macro keeps all id wrappers structurally identical, so snapshots stay predictable.
macro_rules! define_tree_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn new_v7() -> Self {
                Self(Uuid::now_v7().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

define_tree_id!(NodeId);
define_tree_id!(EdgeId);

impl NodeId {
    pub fn root() -> Self {
        Self::new(ROOT_NODE_ID)
    }

    pub fn is_root(&self) -> bool {
        self.0 == ROOT_NODE_ID
    }
}
