//! Conversation tree: nodes holding message histories, joined by parent→child edges.
//!
//! The store is the single owner of node and edge collections. Every mutation goes
//! through a method here, and every structural mutation leaves the tree rooted at
//! [`ROOT_NODE_ID`](crate::ids::ROOT_NODE_ID): exactly one node without an incoming
//! edge, reachable from all others, never removable.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use snafu::{OptionExt, Snafu, ensure};

use crate::ids::{EdgeId, NodeId};
use crate::message::Message;

pub const ROOT_LABEL: &str = "New conversation";

const BRANCH_OFFSET_X: f64 = 320.0;
const BRANCH_OFFSET_Y: f64 = 240.0;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    pub label: String,
    #[serde(default)]
    pub chat_history: Vec<Message>,
    #[serde(default)]
    pub position: Position,
    /// Length of the parent's history when this node was branched off it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branched_at: Option<usize>,
}

impl Node {
    fn new(id: NodeId, label: impl Into<String>, position: Position) -> Self {
        Self {
            id,
            label: label.into(),
            chat_history: Vec::new(),
            position,
            branched_at: None,
        }
    }

    fn fresh_root() -> Self {
        Self::new(NodeId::root(), ROOT_LABEL, Position::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub source: NodeId,
    pub target: NodeId,
}

/// Root-to-node route, for highlighting. Carries no mutation semantics.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ActivePath {
    pub nodes: Vec<NodeId>,
    pub edges: Vec<EdgeId>,
}

/// Whole-tree image exchanged with the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeSnapshot {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub active_node_id: NodeId,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TreeError {
    #[snafu(display("node '{id}' was not found"))]
    NotFound { stage: &'static str, id: NodeId },
    #[snafu(display("invalid tree operation: {details}"))]
    InvalidOperation {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("node '{id}' has no message at index {index} (history length {len})"))]
    MessageIndex {
        stage: &'static str,
        id: NodeId,
        index: usize,
        len: usize,
    },
    #[snafu(display("tree structure is corrupted: {details}"))]
    Corrupted {
        stage: &'static str,
        details: String,
    },
}

pub type TreeResult<T> = Result<T, TreeError>;

#[derive(Debug, Clone, PartialEq)]
pub struct TreeStore {
    nodes: HashMap<NodeId, Node>,
    edges: Vec<Edge>,
}

impl Default for TreeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeStore {
    pub fn new() -> Self {
        let root = Node::fresh_root();
        Self {
            nodes: HashMap::from([(root.id.clone(), root)]),
            edges: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node(&self, id: &NodeId) -> TreeResult<&Node> {
        self.nodes.get(id).context(NotFoundSnafu {
            stage: "tree-node",
            id: id.clone(),
        })
    }

    fn node_mut(&mut self, id: &NodeId, stage: &'static str) -> TreeResult<&mut Node> {
        self.nodes.get_mut(id).context(NotFoundSnafu {
            stage,
            id: id.clone(),
        })
    }

    pub fn history(&self, id: &NodeId) -> TreeResult<&[Message]> {
        Ok(&self.node(id)?.chat_history)
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn parent(&self, id: &NodeId) -> Option<&NodeId> {
        self.edges
            .iter()
            .find(|edge| &edge.target == id)
            .map(|edge| &edge.source)
    }

    pub fn children(&self, id: &NodeId) -> Vec<NodeId> {
        self.edges
            .iter()
            .filter(|edge| &edge.source == id)
            .map(|edge| edge.target.clone())
            .collect()
    }

    /// Allocates a child of `source_id` with an empty history.
    pub fn create_branch(
        &mut self,
        source_id: &NodeId,
        label: impl Into<String>,
    ) -> TreeResult<NodeId> {
        let source = self.nodes.get(source_id).context(NotFoundSnafu {
            stage: "tree-create-branch-source",
            id: source_id.clone(),
        })?;

        let sibling_count = self.children(source_id).len() as f64;
        let position = Position::new(
            source.position.x + sibling_count * BRANCH_OFFSET_X,
            source.position.y + BRANCH_OFFSET_Y,
        );

        let branched_at = source.chat_history.len();
        let id = NodeId::new_v7();
        let mut node = Node::new(id.clone(), label, position);
        node.branched_at = Some(branched_at);
        self.nodes.insert(id.clone(), node);
        self.edges.push(Edge {
            id: EdgeId::new_v7(),
            source: source_id.clone(),
            target: id.clone(),
        });

        tracing::debug!(source_id = %source_id, node_id = %id, "created branch");
        Ok(id)
    }

    /// Breadth-first descendants of `id`, excluding `id` itself.
    pub fn descendants(&self, id: &NodeId) -> Vec<NodeId> {
        let mut outgoing: HashMap<&NodeId, Vec<&NodeId>> = HashMap::new();
        for edge in &self.edges {
            outgoing.entry(&edge.source).or_default().push(&edge.target);
        }

        let mut found = Vec::new();
        let mut seen = HashSet::from([id.clone()]);
        let mut queue = VecDeque::from([id.clone()]);
        while let Some(current) = queue.pop_front() {
            for child in outgoing.get(&current).into_iter().flatten() {
                if seen.insert((*child).clone()) {
                    found.push((*child).clone());
                    queue.push_back((*child).clone());
                }
            }
        }
        found
    }

    /// Clears `id` and removes its whole subtree. Returns the removed ids; empty when
    /// `id` is absent.
    pub fn reset_node(&mut self, id: &NodeId) -> Vec<NodeId> {
        let Some(node) = self.nodes.get_mut(id) else {
            tracing::debug!(node_id = %id, "reset ignored for missing node");
            return Vec::new();
        };
        node.chat_history.clear();
        node.label = if id.is_root() {
            ROOT_LABEL.to_string()
        } else {
            String::new()
        };

        let removed = self.descendants(id);
        self.remove_nodes(&removed);
        tracing::info!(node_id = %id, removed = removed.len(), "reset node");
        removed
    }

    /// Removes `id` and its subtree. Returns every removed id, `id` first.
    pub fn delete_node_and_descendants(&mut self, id: &NodeId) -> TreeResult<Vec<NodeId>> {
        ensure!(
            !id.is_root(),
            InvalidOperationSnafu {
                stage: "tree-delete-root",
                details: "the root node cannot be deleted".to_string(),
            }
        );
        ensure!(
            self.contains(id),
            NotFoundSnafu {
                stage: "tree-delete-missing",
                id: id.clone(),
            }
        );

        let mut removed = vec![id.clone()];
        removed.extend(self.descendants(id));
        self.remove_nodes(&removed);
        tracing::info!(node_id = %id, removed = removed.len(), "deleted subtree");
        Ok(removed)
    }

    fn remove_nodes(&mut self, ids: &[NodeId]) {
        if ids.is_empty() {
            return;
        }

        let doomed: HashSet<&NodeId> = ids.iter().collect();
        self.edges
            .retain(|edge| !doomed.contains(&edge.source) && !doomed.contains(&edge.target));
        for id in ids {
            self.nodes.remove(id);
        }
        self.ensure_root();
    }

    fn ensure_root(&mut self) {
        if !self.nodes.contains_key(&NodeId::root()) {
            tracing::warn!("tree lost its root; inserting a fresh one");
            let root = Node::fresh_root();
            self.nodes.insert(root.id.clone(), root);
        }
    }

    /// Node ids from the root down to `id`, inclusive.
    pub fn path_to_root(&self, id: &NodeId) -> TreeResult<Vec<NodeId>> {
        ensure!(
            self.contains(id),
            NotFoundSnafu {
                stage: "tree-path-missing",
                id: id.clone(),
            }
        );

        let parents: HashMap<&NodeId, &NodeId> = self
            .edges
            .iter()
            .map(|edge| (&edge.target, &edge.source))
            .collect();

        let mut path = vec![id.clone()];
        let mut seen = HashSet::from([id]);
        let mut current = id;
        while let Some(parent) = parents.get(current) {
            if !self.nodes.contains_key(*parent) {
                tracing::error!(
                    node_id = %current,
                    parent_id = %parent,
                    "edge points at a missing parent"
                );
                return CorruptedSnafu {
                    stage: "tree-path-dangling-edge",
                    details: format!("edge into '{current}' starts at missing node '{parent}'"),
                }
                .fail();
            }
            if !seen.insert(*parent) {
                tracing::error!(
                    node_id = %current,
                    parent_id = %parent,
                    "cycle while walking to root"
                );
                return CorruptedSnafu {
                    stage: "tree-path-cycle",
                    details: format!("cycle through '{parent}'"),
                }
                .fail();
            }
            path.push((*parent).clone());
            current = *parent;
        }

        path.reverse();
        Ok(path)
    }

    /// Ancestor messages of `id`, root first, as they stood when each branch on the
    /// path was taken. Messages an ancestor gained afterwards are left out. Nodes
    /// without a recorded branch point see their parent's whole history.
    pub fn history_at_branch(&self, id: &NodeId) -> TreeResult<Vec<Message>> {
        let path = self.path_to_root(id)?;
        let mut messages = Vec::new();
        for pair in path.windows(2) {
            let history = self.history(&pair[0])?;
            let cut = match self.node(&pair[1])?.branched_at {
                Some(at) => at.min(history.len()),
                None => history.len(),
            };
            messages.extend_from_slice(&history[..cut]);
        }
        Ok(messages)
    }

    pub fn depth(&self, id: &NodeId) -> TreeResult<usize> {
        Ok(self.path_to_root(id)?.len() - 1)
    }

    pub fn active_path(&self, id: &NodeId) -> TreeResult<ActivePath> {
        let nodes = self.path_to_root(id)?;
        let edges = nodes
            .windows(2)
            .filter_map(|pair| {
                self.edges
                    .iter()
                    .find(|edge| edge.source == pair[0] && edge.target == pair[1])
                    .map(|edge| edge.id.clone())
            })
            .collect();
        Ok(ActivePath { nodes, edges })
    }

    /// Appends to the node's history and returns the new message's index.
    pub fn append_message(&mut self, id: &NodeId, message: Message) -> TreeResult<usize> {
        let node = self.node_mut(id, "tree-append-message")?;
        node.chat_history.push(message);
        Ok(node.chat_history.len() - 1)
    }

    pub fn replace_message(
        &mut self,
        id: &NodeId,
        index: usize,
        message: Message,
    ) -> TreeResult<()> {
        let node = self.node_mut(id, "tree-replace-message")?;
        let len = node.chat_history.len();
        let slot = node.chat_history.get_mut(index).context(MessageIndexSnafu {
            stage: "tree-replace-message-index",
            id: id.clone(),
            index,
            len,
        })?;
        *slot = message;
        Ok(())
    }

    /// Drops every message at or after `len`.
    pub fn truncate_history(&mut self, id: &NodeId, len: usize) -> TreeResult<()> {
        self.node_mut(id, "tree-truncate-history")?
            .chat_history
            .truncate(len);
        Ok(())
    }

    pub fn set_label(&mut self, id: &NodeId, label: impl Into<String>) -> TreeResult<()> {
        self.node_mut(id, "tree-set-label")?.label = label.into();
        Ok(())
    }

    pub fn set_position(&mut self, id: &NodeId, position: Position) -> TreeResult<()> {
        self.node_mut(id, "tree-set-position")?.position = position;
        Ok(())
    }

    /// Nodes in breadth-first order from the root, children in edge order.
    pub fn nodes_breadth_first(&self) -> Vec<&Node> {
        let root = NodeId::root();
        let mut ordered = Vec::with_capacity(self.nodes.len());
        if let Some(node) = self.nodes.get(&root) {
            ordered.push(node);
        }
        ordered.extend(
            self.descendants(&root)
                .iter()
                .filter_map(|id| self.nodes.get(id)),
        );
        ordered
    }

    pub fn snapshot(&self, active_node_id: &NodeId) -> TreeSnapshot {
        TreeSnapshot {
            nodes: self.nodes_breadth_first().into_iter().cloned().collect(),
            edges: self.edges.clone(),
            active_node_id: active_node_id.clone(),
        }
    }

    /// Rebuilds a store from a persisted image, repairing anything that would break
    /// the rooted-tree shape. Returns the store and a valid active node id.
    pub fn from_snapshot(snapshot: TreeSnapshot) -> (Self, NodeId) {
        let mut nodes = HashMap::with_capacity(snapshot.nodes.len());
        for mut node in snapshot.nodes {
            if nodes.contains_key(&node.id) {
                tracing::warn!(node_id = %node.id, "dropping duplicate node from snapshot");
                continue;
            }
            for message in &mut node.chat_history {
                message.upgrade_legacy_content();
            }
            nodes.insert(node.id.clone(), node);
        }

        let mut store = Self {
            nodes,
            edges: Vec::with_capacity(snapshot.edges.len()),
        };
        store.ensure_root();

        let mut has_parent = HashSet::new();
        for edge in snapshot.edges {
            let keep = store.contains(&edge.source)
                && store.contains(&edge.target)
                && edge.source != edge.target
                && !edge.target.is_root()
                && !has_parent.contains(&edge.target);
            if keep {
                has_parent.insert(edge.target.clone());
                store.edges.push(edge);
            } else {
                tracing::warn!(
                    edge_id = %edge.id,
                    source_id = %edge.source,
                    target_id = %edge.target,
                    "dropping invalid edge from snapshot"
                );
            }
        }

        store.reattach_unreachable();

        let active = if store.contains(&snapshot.active_node_id) {
            snapshot.active_node_id
        } else {
            NodeId::root()
        };
        (store, active)
    }

    /// Hangs every node not reachable from the root directly under it. Orphans without a
    /// parent go first; cycles are broken at their smallest id.
    fn reattach_unreachable(&mut self) {
        loop {
            let root = NodeId::root();
            let mut reachable: HashSet<NodeId> = self.descendants(&root).into_iter().collect();
            reachable.insert(root.clone());

            let mut unreachable = self
                .nodes
                .keys()
                .filter(|id| !reachable.contains(*id))
                .cloned()
                .collect::<Vec<_>>();
            if unreachable.is_empty() {
                return;
            }
            unreachable.sort();

            let orphans = unreachable
                .iter()
                .filter(|id| self.parent(id).is_none())
                .cloned()
                .collect::<Vec<_>>();
            let to_attach = if orphans.is_empty() {
                // Only cycles remain; cut one open.
                let cut = unreachable[0].clone();
                self.edges.retain(|edge| edge.target != cut);
                vec![cut]
            } else {
                orphans
            };

            for id in to_attach {
                tracing::warn!(node_id = %id, "reattaching unreachable node under root");
                self.edges.push(Edge {
                    id: EdgeId::new_v7(),
                    source: root.clone(),
                    target: id,
                });
            }
        }
    }
}
