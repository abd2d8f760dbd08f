use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::{
    Aspect, KernelError, NewVersion, Node, NodeRef, Properties, PropertyKey, TypeTag, Value,
    Version, VersionHistory, VersionRef,
};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub enum AssocType {
    /// Record chain edge, newer record to older record.
    Versions,
    /// Declared document to the record copy it was declared from.
    Original,
    Custom(String),
}

impl AssocType {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Versions => "versions",
            Self::Original => "original",
            Self::Custom(name) => name,
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "versions" => Some(Self::Versions),
            "original" => Some(Self::Original),
            other if other.contains(':') && !other.starts_with(':') && !other.ends_with(':') => {
                Some(Self::Custom(other.to_string()))
            }
            _ => None,
        }
    }
}

impl TryFrom<String> for AssocType {
    type Error = KernelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
            .ok_or_else(|| KernelError::Validation(format!("unknown association type: {value}")))
    }
}

impl From<AssocType> for String {
    fn from(value: AssocType) -> Self {
        value.as_str().to_string()
    }
}

impl Display for AssocType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChildAssoc {
    pub parent: NodeRef,
    pub child: NodeRef,
    pub is_primary: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
pub struct PeerAssoc {
    pub source: NodeRef,
    pub target: NodeRef,
    pub assoc_type: AssocType,
}

impl PeerAssoc {
    #[must_use]
    pub fn versions(source: NodeRef, target: NodeRef) -> Self {
        Self {
            source,
            target,
            assoc_type: AssocType::Versions,
        }
    }
}

/// Node graph collaborator. Implementations are expected to run inside the caller's transaction.
pub trait NodeStore {
    /// # Errors
    /// Fails when `parent` does not exist or the write fails.
    fn create_node(
        &mut self,
        parent: Option<NodeRef>,
        type_tag: TypeTag,
        aspects: &[Aspect],
        properties: Properties,
    ) -> Result<NodeRef, KernelError>;

    /// # Errors
    /// Storage failures.
    fn exists(&self, node: NodeRef) -> Result<bool, KernelError>;

    /// # Errors
    /// Storage failures.
    fn get_node(&self, node: NodeRef) -> Result<Option<Node>, KernelError>;

    /// # Errors
    /// Storage failures.
    fn get_property(&self, node: NodeRef, key: &PropertyKey) -> Result<Option<Value>, KernelError>;

    /// # Errors
    /// `NotFound` for a missing node.
    fn set_property(&mut self, node: NodeRef, key: PropertyKey, value: Value)
        -> Result<(), KernelError>;

    /// # Errors
    /// Storage failures.
    fn remove_property(&mut self, node: NodeRef, key: &PropertyKey) -> Result<(), KernelError>;

    /// # Errors
    /// Storage failures.
    fn has_aspect(&self, node: NodeRef, aspect: &Aspect) -> Result<bool, KernelError>;

    /// Adds the aspect together with its properties.
    ///
    /// # Errors
    /// `NotFound` for a missing node.
    fn add_aspect(
        &mut self,
        node: NodeRef,
        aspect: Aspect,
        properties: Properties,
    ) -> Result<(), KernelError>;

    /// # Errors
    /// Storage failures.
    fn remove_aspect(&mut self, node: NodeRef, aspect: &Aspect) -> Result<(), KernelError>;

    /// # Errors
    /// Storage failures.
    fn primary_parent(&self, node: NodeRef) -> Result<Option<ChildAssoc>, KernelError>;

    /// # Errors
    /// Storage failures.
    fn child_assocs(&self, parent: NodeRef) -> Result<Vec<ChildAssoc>, KernelError>;

    /// Adds a secondary parent link.
    ///
    /// # Errors
    /// `NotFound` when either node is missing.
    fn add_child(&mut self, parent: NodeRef, child: NodeRef) -> Result<ChildAssoc, KernelError>;

    /// Replaces the primary parent.
    ///
    /// # Errors
    /// `NotFound` when either node is missing.
    fn move_node(&mut self, node: NodeRef, new_parent: NodeRef) -> Result<(), KernelError>;

    /// # Errors
    /// `NotFound` when either node is missing.
    fn create_assoc(
        &mut self,
        source: NodeRef,
        target: NodeRef,
        assoc_type: AssocType,
    ) -> Result<PeerAssoc, KernelError>;

    /// Returns whether an association was removed.
    ///
    /// # Errors
    /// Storage failures.
    fn remove_assoc(
        &mut self,
        source: NodeRef,
        target: NodeRef,
        assoc_type: &AssocType,
    ) -> Result<bool, KernelError>;

    /// Outgoing associations of `source`.
    ///
    /// # Errors
    /// Storage failures.
    fn target_assocs(
        &self,
        source: NodeRef,
        assoc_type: &AssocType,
    ) -> Result<Vec<PeerAssoc>, KernelError>;

    /// Incoming associations of `target`.
    ///
    /// # Errors
    /// Storage failures.
    fn source_assocs(
        &self,
        target: NodeRef,
        assoc_type: &AssocType,
    ) -> Result<Vec<PeerAssoc>, KernelError>;

    /// # Errors
    /// Storage failures.
    fn nodes_of_type(&self, type_tag: TypeTag) -> Result<Vec<NodeRef>, KernelError>;

    /// `node` followed by its primary-child subtree in pre-order.
    ///
    /// # Errors
    /// Storage failures.
    fn primary_descendants(&self, node: NodeRef) -> Result<Vec<NodeRef>, KernelError>;

    /// Deletes the node, its primary subtree and every association touching them.
    ///
    /// # Errors
    /// `NotFound` for a missing node.
    fn delete_node(&mut self, node: NodeRef) -> Result<Vec<NodeRef>, KernelError>;

    /// # Errors
    /// `NotFound` for a missing node.
    fn require_node(&self, node: NodeRef) -> Result<Node, KernelError> {
        self.get_node(node)?
            .ok_or_else(|| KernelError::NotFound(format!("node {node}")))
    }

    /// # Errors
    /// First failing `set_property`.
    fn add_properties(&mut self, node: NodeRef, properties: Properties) -> Result<(), KernelError> {
        for (key, value) in properties {
            self.set_property(node, key, value)?;
        }
        Ok(())
    }
}

/// Version history collaborator.
pub trait VersionStore {
    /// `None` when the document has never been versioned.
    ///
    /// # Errors
    /// Storage failures or a corrupt history.
    fn version_history(&self, document: NodeRef) -> Result<Option<VersionHistory>, KernelError>;

    /// # Errors
    /// Storage failures.
    fn get_version(&self, version_ref: VersionRef) -> Result<Option<Version>, KernelError>;

    /// # Errors
    /// `Validation` when the label does not increase past the head.
    fn append_version(&mut self, new_version: NewVersion) -> Result<Version, KernelError>;

    /// Sets the forward pointer and the reverse index row together.
    ///
    /// # Errors
    /// `InvariantViolation` when the version is destroyed or already recorded.
    fn set_version_record(&mut self, version_ref: VersionRef, record: NodeRef)
        -> Result<(), KernelError>;

    /// Clears the forward pointer and reverse index row and sets the destroyed marker.
    ///
    /// # Errors
    /// `NotFound` for a missing version.
    fn mark_version_destroyed(&mut self, version_ref: VersionRef) -> Result<(), KernelError>;

    /// # Errors
    /// Storage failures.
    fn find_version_by_record(&self, record: NodeRef) -> Result<Option<Version>, KernelError>;

    /// Returns the number of removed versions.
    ///
    /// # Errors
    /// Storage failures.
    fn delete_version_history(&mut self, document: NodeRef) -> Result<usize, KernelError>;

    /// # Errors
    /// Storage failures.
    fn current_version(&self, document: NodeRef) -> Result<Option<Version>, KernelError> {
        Ok(self
            .version_history(document)?
            .and_then(|history| history.head().cloned()))
    }
}

/// Nested rollback scopes inside an already open transaction. Names are static identifiers.
pub trait Savepoints {
    /// # Errors
    /// Storage failures.
    fn savepoint(&mut self, name: &'static str) -> Result<(), KernelError>;

    /// Keeps every write made since `savepoint(name)`.
    ///
    /// # Errors
    /// Storage failures or an unknown savepoint.
    fn release_savepoint(&mut self, name: &'static str) -> Result<(), KernelError>;

    /// Discards every write made since `savepoint(name)` and closes the scope.
    ///
    /// # Errors
    /// Storage failures or an unknown savepoint.
    fn rollback_to_savepoint(&mut self, name: &'static str) -> Result<(), KernelError>;
}

/// Edits that keep the record chain one-in/one-out when `node` leaves it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainRepair {
    pub removed: Vec<PeerAssoc>,
    pub relink: Option<PeerAssoc>,
}

#[must_use]
pub fn plan_chain_repair(
    node: NodeRef,
    incoming: &[PeerAssoc],
    outgoing: &[PeerAssoc],
) -> ChainRepair {
    let incoming: Vec<_> = incoming
        .iter()
        .filter(|assoc| assoc.assoc_type == AssocType::Versions && assoc.target == node)
        .collect();
    let outgoing: Vec<_> = outgoing
        .iter()
        .filter(|assoc| assoc.assoc_type == AssocType::Versions && assoc.source == node)
        .collect();

    let relink = match (incoming.as_slice(), outgoing.as_slice()) {
        ([next], [prev]) if next.source != prev.target => {
            Some(PeerAssoc::versions(next.source, prev.target))
        }
        _ => None,
    };

    ChainRepair {
        removed: incoming.into_iter().chain(outgoing).cloned().collect(),
        relink,
    }
}
