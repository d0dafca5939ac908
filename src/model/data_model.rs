use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::instance::{DataError, DataNode, InstanceDocument, NodeId};

/// Address of a node across all instances of a [`DataModel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeRef {
    pub instance: usize,
    pub node: NodeId,
}

impl NodeRef {
    pub fn new(instance: usize, node: NodeId) -> Self {
        Self { instance, node }
    }
}

/// An instance is either owned by one document or shared read-only between
/// documents through the shared-instance cache.
#[derive(Debug, Clone)]
pub enum InstanceHandle {
    Owned(InstanceDocument),
    Shared(Arc<InstanceDocument>),
}

impl InstanceHandle {
    pub fn document(&self) -> &InstanceDocument {
        match self {
            InstanceHandle::Owned(doc) => doc,
            InstanceHandle::Shared(doc) => doc,
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, InstanceHandle::Shared(_))
    }
}

#[derive(Debug, Clone)]
pub struct DataInstance {
    pub id: String,
    pub source: Option<String>,
    pub handle: InstanceHandle,
}

#[derive(Debug, Clone, Default)]
pub struct DataModel {
    instances: Vec<DataInstance>,
}

impl DataModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_owned(&mut self, id: impl Into<String>, doc: InstanceDocument) -> usize {
        self.instances.push(DataInstance {
            id: id.into(),
            source: None,
            handle: InstanceHandle::Owned(doc),
        });
        self.instances.len() - 1
    }

    pub fn add_shared(
        &mut self,
        id: impl Into<String>,
        source: impl Into<String>,
        doc: Arc<InstanceDocument>,
    ) -> usize {
        self.instances.push(DataInstance {
            id: id.into(),
            source: Some(source.into()),
            handle: InstanceHandle::Shared(doc),
        });
        self.instances.len() - 1
    }

    pub fn instances(&self) -> &[DataInstance] {
        &self.instances
    }

    pub fn instance_index(&self, id: &str) -> Option<usize> {
        self.instances.iter().position(|i| i.id == id)
    }

    pub fn document(&self, index: usize) -> Option<&InstanceDocument> {
        self.instances.get(index).map(|i| i.handle.document())
    }

    pub fn document_mut(&mut self, index: usize) -> Result<&mut InstanceDocument, DataError> {
        let instance = self
            .instances
            .get_mut(index)
            .ok_or_else(|| DataError::UnknownInstance(index.to_string()))?;
        match &mut instance.handle {
            InstanceHandle::Owned(doc) => Ok(doc),
            InstanceHandle::Shared(_) => Err(DataError::SharedInstance(instance.id.clone())),
        }
    }

    /// Root element of the first instance; the default evaluation context.
    pub fn default_root(&self) -> Option<NodeRef> {
        self.document(0).map(|doc| NodeRef::new(0, doc.root()))
    }

    pub fn root_of(&self, index: usize) -> Option<NodeRef> {
        self.document(index).map(|doc| NodeRef::new(index, doc.root()))
    }

    pub fn node(&self, node: NodeRef) -> Option<&DataNode> {
        self.document(node.instance).and_then(|doc| doc.node(node.node))
    }

    pub fn value(&self, node: NodeRef) -> Option<&str> {
        self.node(node).map(|n| n.value.as_str())
    }

    /// Sum of the instance revisions. Any mutation changes it.
    pub fn revision(&self) -> u64 {
        self.instances
            .iter()
            .map(|i| i.handle.document().revision())
            .sum()
    }

    pub fn set_value(&mut self, node: NodeRef, value: impl Into<String>) -> Result<bool, DataError> {
        self.document_mut(node.instance)?.set_value(node.node, value)
    }

    pub fn insert_copy(
        &mut self,
        origin: NodeRef,
        parent: NodeRef,
        index: usize,
    ) -> Result<NodeRef, DataError> {
        if origin.instance != parent.instance {
            return Err(DataError::UnknownNode(parent.node));
        }
        let doc = self.document_mut(parent.instance)?;
        let copy = doc.insert_copy(origin.node, parent.node, index)?;
        Ok(NodeRef::new(parent.instance, copy))
    }

    /// Copy a subtree from a document outside the model, such as the initial
    /// data of the form definition.
    pub fn import_copy(
        &mut self,
        source: &InstanceDocument,
        origin: NodeId,
        parent: NodeRef,
        index: usize,
    ) -> Result<NodeRef, DataError> {
        let doc = self.document_mut(parent.instance)?;
        let copy = doc.import_copy(source, origin, parent.node, index)?;
        Ok(NodeRef::new(parent.instance, copy))
    }

    pub fn delete(&mut self, node: NodeRef) -> Result<(NodeRef, usize), DataError> {
        let (parent, index) = self.document_mut(node.instance)?.delete(node.node)?;
        Ok((NodeRef::new(node.instance, parent), index))
    }

    pub fn parent(&self, node: NodeRef) -> Option<NodeRef> {
        self.document(node.instance)
            .and_then(|doc| doc.parent(node.node))
            .map(|p| NodeRef::new(node.instance, p))
    }

    /// Instances that belong to this document and must be serialized.
    pub fn owned_instances(&self) -> impl Iterator<Item = (&str, &InstanceDocument)> + '_ {
        self.instances.iter().filter_map(|i| match &i.handle {
            InstanceHandle::Owned(doc) => Some((i.id.as_str(), doc)),
            InstanceHandle::Shared(_) => None,
        })
    }

    pub fn shared_sources(&self) -> impl Iterator<Item = &str> + '_ {
        self.instances.iter().filter_map(|i| match &i.handle {
            InstanceHandle::Shared(_) => i.source.as_deref(),
            InstanceHandle::Owned(_) => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_instances_are_read_only() {
        let mut model = DataModel::new();
        model.add_owned("main", InstanceDocument::new("data"));
        let shared = model.add_shared(
            "countries",
            "http://example.org/countries.xml",
            Arc::new(InstanceDocument::new("countries")),
        );
        assert!(model.document_mut(0).is_ok());
        assert_eq!(
            model.document_mut(shared).unwrap_err(),
            DataError::SharedInstance("countries".to_string())
        );
        assert_eq!(model.owned_instances().count(), 1);
        assert_eq!(
            model.shared_sources().collect::<Vec<_>>(),
            vec!["http://example.org/countries.xml"]
        );
    }

    #[test]
    fn revision_sums_instances() {
        let mut model = DataModel::new();
        model.add_owned("main", InstanceDocument::new("data"));
        let root = model.default_root().unwrap();
        let before = model.revision();
        let child = model.document_mut(0).unwrap().append(root.node, "a", "").unwrap();
        model.set_value(NodeRef::new(0, child), "x").unwrap();
        assert_eq!(model.revision(), before + 2);
    }
}
