use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

/// Annotation properties attached to a data node by the model layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeProps {
    pub relevant: bool,
    pub readonly: bool,
    pub required: bool,
    pub valid: bool,
}

impl Default for NodeProps {
    fn default() -> Self {
        Self {
            relevant: true,
            readonly: false,
            required: false,
            valid: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataNode {
    pub id: NodeId,
    pub name: String,
    pub value: String,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    #[serde(default)]
    pub props: NodeProps,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DataError {
    #[error("node {0:?} does not exist")]
    UnknownNode(NodeId),
    #[error("the root element cannot be deleted")]
    RootDeletion,
    #[error("node {0:?} is read-only")]
    ReadOnly(NodeId),
    #[error("instance `{0}` is shared and cannot be modified")]
    SharedInstance(String),
    #[error("instance `{0}` does not exist")]
    UnknownInstance(String),
}

/// An XML-like element tree holding the bound data of one instance.
///
/// Nodes live in an id-keyed arena. Every mutation bumps `revision`, which the
/// binding updater compares to skip evaluation when nothing changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "InstanceSnapshot", into = "InstanceSnapshot")]
pub struct InstanceDocument {
    nodes: HashMap<NodeId, DataNode>,
    root: NodeId,
    next_id: u64,
    revision: u64,
}

impl InstanceDocument {
    pub fn new(root_name: impl Into<String>) -> Self {
        let root = NodeId(0);
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            DataNode {
                id: root,
                name: root_name.into(),
                value: String::new(),
                parent: None,
                children: Vec::new(),
                props: NodeProps::default(),
            },
        );
        Self {
            nodes,
            root,
            next_id: 1,
            revision: 0,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Option<&DataNode> {
        self.nodes.get(&id)
    }

    pub fn value(&self, id: NodeId) -> Option<&str> {
        self.nodes.get(&id).map(|n| n.value.as_str())
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.nodes
            .get(&id)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn children_named(&self, id: NodeId, name: &str) -> Vec<NodeId> {
        self.children(id)
            .iter()
            .copied()
            .filter(|c| self.nodes.get(c).is_some_and(|n| n.name == name))
            .collect()
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(&id).and_then(|n| n.parent)
    }

    /// Append a new element under `parent` and return its id.
    pub fn append(
        &mut self,
        parent: NodeId,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<NodeId, DataError> {
        if !self.nodes.contains_key(&parent) {
            return Err(DataError::UnknownNode(parent));
        }
        let position = self.children(parent).len();
        let id = self.allocate(name.into(), value.into(), Some(parent));
        self.node_mut(parent)?.children.insert(position, id);
        self.revision += 1;
        Ok(id)
    }

    /// Set the string value of a node. Returns whether the value changed.
    pub fn set_value(&mut self, id: NodeId, value: impl Into<String>) -> Result<bool, DataError> {
        let value = value.into();
        let node = self.node_mut(id)?;
        if node.props.readonly {
            return Err(DataError::ReadOnly(id));
        }
        if node.value == value {
            return Ok(false);
        }
        node.value = value;
        self.revision += 1;
        Ok(true)
    }

    pub fn set_props(&mut self, id: NodeId, props: NodeProps) -> Result<(), DataError> {
        let node = self.node_mut(id)?;
        if node.props != props {
            node.props = props;
            self.revision += 1;
        }
        Ok(())
    }

    /// Deep-copy the subtree at `origin` and insert it as child `index`
    /// (0-based, clamped) of `parent`.
    pub fn insert_copy(
        &mut self,
        origin: NodeId,
        parent: NodeId,
        index: usize,
    ) -> Result<NodeId, DataError> {
        if !self.nodes.contains_key(&parent) {
            return Err(DataError::UnknownNode(parent));
        }
        let copy = self.copy_subtree(origin, parent)?;
        let children = &mut self.node_mut(parent)?.children;
        let index = index.min(children.len());
        children.insert(index, copy);
        self.revision += 1;
        Ok(copy)
    }

    /// Deep-copy the subtree at `origin` in `source` and insert it as child
    /// `index` (0-based, clamped) of `parent` in this document.
    pub fn import_copy(
        &mut self,
        source: &InstanceDocument,
        origin: NodeId,
        parent: NodeId,
        index: usize,
    ) -> Result<NodeId, DataError> {
        if !self.nodes.contains_key(&parent) {
            return Err(DataError::UnknownNode(parent));
        }
        let copy = self.import_subtree(source, origin, parent)?;
        let children = &mut self.node_mut(parent)?.children;
        let index = index.min(children.len());
        children.insert(index, copy);
        self.revision += 1;
        Ok(copy)
    }

    /// Element names from the root down to `id`, root included.
    pub fn path_names(&self, id: NodeId) -> Vec<&str> {
        let mut names = Vec::new();
        let mut current = Some(id);
        while let Some(node) = current.and_then(|c| self.nodes.get(&c)) {
            names.push(node.name.as_str());
            current = node.parent;
        }
        names.reverse();
        names
    }

    /// Follow `names` from `start`, taking the first matching child each step.
    pub fn descend<'n>(
        &self,
        start: NodeId,
        names: impl IntoIterator<Item = &'n str>,
    ) -> Option<NodeId> {
        names.into_iter().try_fold(start, |at, name| {
            self.children(at)
                .iter()
                .copied()
                .find(|c| self.nodes.get(c).is_some_and(|n| n.name == name))
        })
    }

    /// Remove the subtree rooted at `id`. Returns the former parent and the
    /// 0-based index the node occupied.
    pub fn delete(&mut self, id: NodeId) -> Result<(NodeId, usize), DataError> {
        if id == self.root {
            return Err(DataError::RootDeletion);
        }
        let parent = self.parent(id).ok_or(DataError::UnknownNode(id))?;
        let siblings = &mut self.node_mut(parent)?.children;
        let index = siblings
            .iter()
            .position(|c| *c == id)
            .ok_or(DataError::UnknownNode(id))?;
        siblings.remove(index);

        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.remove(&current) {
                stack.extend(node.children);
            }
        }
        self.revision += 1;
        Ok((parent, index))
    }

    /// Hash of names and values in document order.
    pub fn content_hash(&self) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.get(&id) {
                hasher.update(node.name.as_bytes());
                hasher.update(&[0]);
                hasher.update(node.value.as_bytes());
                hasher.update(&[1]);
                stack.extend(node.children.iter().rev());
            }
        }
        hasher.finalize()
    }

    fn allocate(&mut self, name: String, value: String, parent: Option<NodeId>) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(
            id,
            DataNode {
                id,
                name,
                value,
                parent,
                children: Vec::new(),
                props: NodeProps::default(),
            },
        );
        id
    }

    fn copy_subtree(&mut self, origin: NodeId, parent: NodeId) -> Result<NodeId, DataError> {
        let source = self
            .nodes
            .get(&origin)
            .cloned()
            .ok_or(DataError::UnknownNode(origin))?;
        let copy = self.allocate(source.name, source.value, Some(parent));
        self.node_mut(copy)?.props = source.props;
        for child in source.children {
            let child_copy = self.copy_subtree(child, copy)?;
            self.node_mut(copy)?.children.push(child_copy);
        }
        Ok(copy)
    }

    fn import_subtree(
        &mut self,
        source: &InstanceDocument,
        origin: NodeId,
        parent: NodeId,
    ) -> Result<NodeId, DataError> {
        let node = source.node(origin).ok_or(DataError::UnknownNode(origin))?;
        let copy = self.allocate(node.name.clone(), node.value.clone(), Some(parent));
        self.node_mut(copy)?.props = node.props;
        for &child in &node.children {
            let child_copy = self.import_subtree(source, child, copy)?;
            self.node_mut(copy)?.children.push(child_copy);
        }
        Ok(copy)
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut DataNode, DataError> {
        self.nodes.get_mut(&id).ok_or(DataError::UnknownNode(id))
    }
}

/// Serialized form with nodes in id order so encodings are deterministic.
#[derive(Serialize, Deserialize)]
struct InstanceSnapshot {
    root: NodeId,
    next_id: u64,
    nodes: Vec<DataNode>,
}

impl From<InstanceSnapshot> for InstanceDocument {
    fn from(snapshot: InstanceSnapshot) -> Self {
        Self {
            nodes: snapshot.nodes.into_iter().map(|n| (n.id, n)).collect(),
            root: snapshot.root,
            next_id: snapshot.next_id,
            revision: 0,
        }
    }
}

impl From<InstanceDocument> for InstanceSnapshot {
    fn from(doc: InstanceDocument) -> Self {
        let mut nodes: Vec<DataNode> = doc.nodes.into_values().collect();
        nodes.sort_by_key(|n| n.id);
        Self {
            root: doc.root,
            next_id: doc.next_id,
            nodes,
        }
    }
}
