//! Arena tree of acquisition objects.
//!
//! Node 0 is the root sentinel and carries no object. Nodes are never removed,
//! only moved, so a [`NodeId`] stays valid for the lifetime of the tree.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use crate::acquisition::{AcqObject, ObjectId};

/// Index of a node in a [`Tree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);

    pub fn is_root(self) -> bool {
        self == Self::ROOT
    }
}

#[derive(Debug, Clone)]
struct Node {
    object: Option<AcqObject>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

#[derive(Debug, Clone)]
pub struct Tree {
    nodes: Vec<Node>,
    index: HashMap<ObjectId, NodeId>,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                object: None,
                parent: None,
                children: Vec::new(),
            }],
            index: HashMap::new(),
        }
    }

    /// Number of object nodes (root excluded).
    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn node_of(&self, object: &AcqObject) -> Option<NodeId> {
        self.index.get(&object.id()).copied()
    }

    pub fn contains(&self, object: &AcqObject) -> bool {
        self.index.contains_key(&object.id())
    }

    /// Object stored at `node`, `None` for the root.
    pub fn object(&self, node: NodeId) -> Option<&AcqObject> {
        self.nodes.get(node.0).and_then(|n| n.object.as_ref())
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.get(node.0).and_then(|n| n.parent)
    }

    pub fn children(&self, node: NodeId) -> &[NodeId] {
        self.nodes
            .get(node.0)
            .map(|n| n.children.as_slice())
            .unwrap_or_default()
    }

    /// Objects directly below `node`, in insertion order.
    pub fn child_objects(&self, node: NodeId) -> Vec<AcqObject> {
        self.children(node)
            .iter()
            .filter_map(|c| self.object(*c).cloned())
            .collect()
    }

    /// Nodes directly below the root.
    pub fn top_level(&self) -> &[NodeId] {
        self.children(NodeId::ROOT)
    }

    /// Distance from the root.
    pub fn depth(&self, node: NodeId) -> usize {
        let mut depth = 0;
        let mut current = node;
        while let Some(parent) = self.parent(current) {
            depth += 1;
            current = parent;
        }
        depth
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|n| n.object.as_ref().is_some_and(|o| o.name() == name))
            .map(NodeId)
    }

    /// True when `ancestor` lies on the path from `node` up to the root.
    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = self.parent(node);
        while let Some(parent) = current {
            if parent == ancestor {
                return true;
            }
            current = self.parent(parent);
        }
        false
    }

    pub(crate) fn insert(&mut self, parent: NodeId, object: AcqObject) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.index.insert(object.id(), id);
        self.nodes.push(Node {
            object: Some(object),
            parent: Some(parent),
            children: Vec::new(),
        });
        self.nodes[parent.0].children.push(id);
        id
    }

    /// Detach `node` (with its sub-tree) and append it below `new_parent`.
    /// The caller checks that `new_parent` is not inside the sub-tree.
    pub(crate) fn move_node(&mut self, node: NodeId, new_parent: NodeId) {
        if let Some(old) = self.parent(node) {
            self.nodes[old.0].children.retain(|c| *c != node);
        }
        self.nodes[node.0].parent = Some(new_parent);
        self.nodes[new_parent.0].children.push(node);
    }

    /// Object nodes grouped by depth, shallowest first.
    pub fn levels(&self) -> Vec<Vec<NodeId>> {
        let mut levels: Vec<Vec<NodeId>> = Vec::new();
        let mut queue: VecDeque<(NodeId, usize)> = self
            .top_level()
            .iter()
            .map(|node| (*node, 0))
            .collect();
        while let Some((node, level)) = queue.pop_front() {
            if levels.len() <= level {
                levels.push(Vec::new());
            }
            levels[level].push(node);
            queue.extend(self.children(node).iter().map(|c| (*c, level + 1)));
        }
        levels
    }

    /// Object nodes in depth-first pre-order.
    pub fn depth_first(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.len());
        let mut stack: Vec<NodeId> = self.top_level().iter().rev().copied().collect();
        while let Some(node) = stack.pop() {
            order.push(node);
            stack.extend(self.children(node).iter().rev());
        }
        order
    }

    /// Copy of the sub-tree rooted at `node`, re-rooted so that `node` becomes
    /// a top-level node.
    pub fn subtree(&self, node: NodeId) -> Tree {
        let mut tree = Tree::new();
        let mut stack = vec![(node, NodeId::ROOT)];
        while let Some((source, parent)) = stack.pop() {
            let Some(object) = self.object(source) else {
                continue;
            };
            let copied = tree.insert(parent, object.clone());
            // reversed so that siblings keep their insertion order
            for child in self.children(source).iter().rev() {
                stack.push((*child, copied));
            }
        }
        tree
    }

    fn render(&self, f: &mut fmt::Formatter<'_>, node: NodeId, prefix: &str) -> fmt::Result {
        let children = self.children(node);
        for (i, child) in children.iter().enumerate() {
            let last = i + 1 == children.len();
            let name = self.object(*child).map_or("?", |o| o.name());
            writeln!(f, "{}{}{}", prefix, if last { "└── " } else { "├── " }, name)?;
            let nested = format!("{}{}", prefix, if last { "    " } else { "│   " });
            self.render(f, *child, &nested)?;
        }
        Ok(())
    }
}

impl fmt::Display for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "acquisition chain")?;
        self.render(f, NodeId::ROOT, "")
    }
}
