use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

mod filter;
mod graph;
mod policy;
mod security;
mod version;

pub use filter::{
    content_differs, is_content_property, is_record_excluded_aspect, is_record_excluded_property,
    record_copy_of, RecordCopy,
};
pub use graph::{
    plan_chain_repair, AssocType, ChainRepair, ChildAssoc, NodeStore, PeerAssoc, Savepoints,
    VersionStore,
};
pub use policy::{
    resolve_recording_decision, should_record, RecordableVersionPolicy, RecordingDecision,
    VersionCreationParams,
};
pub use security::{
    check_capability, AccessStatus, Capability, CapabilityGate, GateTarget, Privilege, Role,
    RoleCapabilityGate,
};
pub use version::{
    FrozenState, NewVersion, Version, VersionHistory, VersionLabel, VersionState, VersionType,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeRef(pub Ulid);

impl NodeRef {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for NodeRef {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for NodeRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeRef {
    type Err = KernelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ulid::from_str(value)
            .map(Self)
            .map_err(|_| KernelError::Validation(format!("invalid node reference: {value}")))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VersionRef(pub Ulid);

impl VersionRef {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for VersionRef {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for VersionRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for VersionRef {
    type Err = KernelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ulid::from_str(value)
            .map(Self)
            .map_err(|_| KernelError::Validation(format!("invalid version reference: {value}")))
    }
}

/// Node type taxonomy. Every type except `Object` has exactly one supertype.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TypeTag {
    Object,
    Folder,
    Content,
    Link,
    FilePlan,
    UnfiledRecordContainer,
    RecordFolder,
}

impl TypeTag {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Object => "object",
            Self::Folder => "folder",
            Self::Content => "content",
            Self::Link => "link",
            Self::FilePlan => "file_plan",
            Self::UnfiledRecordContainer => "unfiled_record_container",
            Self::RecordFolder => "record_folder",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "object" => Some(Self::Object),
            "folder" => Some(Self::Folder),
            "content" => Some(Self::Content),
            "link" => Some(Self::Link),
            "file_plan" => Some(Self::FilePlan),
            "unfiled_record_container" => Some(Self::UnfiledRecordContainer),
            "record_folder" => Some(Self::RecordFolder),
            _ => None,
        }
    }

    #[must_use]
    pub fn supertype(self) -> Option<Self> {
        match self {
            Self::Object => None,
            Self::Folder | Self::Content | Self::Link => Some(Self::Object),
            Self::FilePlan | Self::UnfiledRecordContainer | Self::RecordFolder => Some(Self::Folder),
        }
    }

    #[must_use]
    pub fn is_subtype_of(self, other: Self) -> bool {
        let mut current = Some(self);
        while let Some(type_tag) = current {
            if type_tag == other {
                return true;
            }
            current = type_tag.supertype();
        }
        false
    }
}

fn is_qualified_name(value: &str) -> bool {
    let Some((prefix, local)) = value.split_once(':') else {
        return false;
    };
    let valid_part = |part: &str| {
        !part.is_empty()
            && part.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
    };
    valid_part(prefix) && valid_part(local)
}

/// Attachable capability bundle. Built-in aspects use bare codes; add-on aspects carry a
/// qualified `prefix:local` name.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub enum Aspect {
    Versionable,
    RecordableVersionable,
    VersionRecord,
    Record,
    MetadataStub,
    Frozen,
    Temporary,
    Auditable,
    Ownable,
    Titled,
    RecordOriginatingDetails,
    Custom(String),
}

impl Aspect {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Versionable => "versionable",
            Self::RecordableVersionable => "recordable_versionable",
            Self::VersionRecord => "version_record",
            Self::Record => "record",
            Self::MetadataStub => "metadata_stub",
            Self::Frozen => "frozen",
            Self::Temporary => "temporary",
            Self::Auditable => "auditable",
            Self::Ownable => "ownable",
            Self::Titled => "titled",
            Self::RecordOriginatingDetails => "record_originating_details",
            Self::Custom(name) => name,
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "versionable" => Some(Self::Versionable),
            "recordable_versionable" => Some(Self::RecordableVersionable),
            "version_record" => Some(Self::VersionRecord),
            "record" => Some(Self::Record),
            "metadata_stub" => Some(Self::MetadataStub),
            "frozen" => Some(Self::Frozen),
            "temporary" => Some(Self::Temporary),
            "auditable" => Some(Self::Auditable),
            "ownable" => Some(Self::Ownable),
            "titled" => Some(Self::Titled),
            "record_originating_details" => Some(Self::RecordOriginatingDetails),
            other if is_qualified_name(other) => Some(Self::Custom(other.to_string())),
            _ => None,
        }
    }
}

impl TryFrom<String> for Aspect {
    type Error = KernelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| KernelError::Validation(format!("unknown aspect: {value}")))
    }
}

impl From<Aspect> for String {
    fn from(value: Aspect) -> Self {
        value.as_str().to_string()
    }
}

impl Display for Aspect {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub enum PropertyKey {
    Name,
    Title,
    Description,
    Content,
    ContentHash,
    Owner,
    Creator,
    Created,
    Modifier,
    Modified,
    Accessed,
    VersionLabel,
    VersionType,
    AutoVersion,
    AutoVersionOnUpdateProps,
    RecordableVersionPolicy,
    FilePlan,
    SiteId,
    RecordVersionLabel,
    RecordVersionDescription,
    VersionedNode,
    Identifier,
    DeclaredAt,
    DeclaredBy,
    DateFiled,
    OriginatingLocation,
    OriginatingUser,
    OriginatingCreated,
    Custom(String),
}

impl PropertyKey {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Name => "name",
            Self::Title => "title",
            Self::Description => "description",
            Self::Content => "content",
            Self::ContentHash => "content_hash",
            Self::Owner => "owner",
            Self::Creator => "creator",
            Self::Created => "created",
            Self::Modifier => "modifier",
            Self::Modified => "modified",
            Self::Accessed => "accessed",
            Self::VersionLabel => "version_label",
            Self::VersionType => "version_type",
            Self::AutoVersion => "auto_version",
            Self::AutoVersionOnUpdateProps => "auto_version_on_update_props",
            Self::RecordableVersionPolicy => "recordable_version_policy",
            Self::FilePlan => "file_plan",
            Self::SiteId => "site_id",
            Self::RecordVersionLabel => "record_version_label",
            Self::RecordVersionDescription => "record_version_description",
            Self::VersionedNode => "versioned_node",
            Self::Identifier => "identifier",
            Self::DeclaredAt => "declared_at",
            Self::DeclaredBy => "declared_by",
            Self::DateFiled => "date_filed",
            Self::OriginatingLocation => "originating_location",
            Self::OriginatingUser => "originating_user",
            Self::OriginatingCreated => "originating_created",
            Self::Custom(name) => name,
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "name" => Some(Self::Name),
            "title" => Some(Self::Title),
            "description" => Some(Self::Description),
            "content" => Some(Self::Content),
            "content_hash" => Some(Self::ContentHash),
            "owner" => Some(Self::Owner),
            "creator" => Some(Self::Creator),
            "created" => Some(Self::Created),
            "modifier" => Some(Self::Modifier),
            "modified" => Some(Self::Modified),
            "accessed" => Some(Self::Accessed),
            "version_label" => Some(Self::VersionLabel),
            "version_type" => Some(Self::VersionType),
            "auto_version" => Some(Self::AutoVersion),
            "auto_version_on_update_props" => Some(Self::AutoVersionOnUpdateProps),
            "recordable_version_policy" => Some(Self::RecordableVersionPolicy),
            "file_plan" => Some(Self::FilePlan),
            "site_id" => Some(Self::SiteId),
            "record_version_label" => Some(Self::RecordVersionLabel),
            "record_version_description" => Some(Self::RecordVersionDescription),
            "versioned_node" => Some(Self::VersionedNode),
            "identifier" => Some(Self::Identifier),
            "declared_at" => Some(Self::DeclaredAt),
            "declared_by" => Some(Self::DeclaredBy),
            "date_filed" => Some(Self::DateFiled),
            "originating_location" => Some(Self::OriginatingLocation),
            "originating_user" => Some(Self::OriginatingUser),
            "originating_created" => Some(Self::OriginatingCreated),
            other if is_qualified_name(other) => Some(Self::Custom(other.to_string())),
            _ => None,
        }
    }
}

impl TryFrom<String> for PropertyKey {
    type Error = KernelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
            .ok_or_else(|| KernelError::Validation(format!("unknown property key: {value}")))
    }
}

impl From<PropertyKey> for String {
    fn from(value: PropertyKey) -> Self {
        value.as_str().to_string()
    }
}

impl Display for PropertyKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Text(String),
    Bool(bool),
    Int(i64),
    Timestamp(#[serde(with = "time::serde::rfc3339")] OffsetDateTime),
    Node(NodeRef),
}

impl Value {
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_node(&self) -> Option<NodeRef> {
        match self {
            Self::Node(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_timestamp(&self) -> Option<OffsetDateTime> {
        match self {
            Self::Timestamp(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<NodeRef> for Value {
    fn from(value: NodeRef) -> Self {
        Self::Node(value)
    }
}

impl From<OffsetDateTime> for Value {
    fn from(value: OffsetDateTime) -> Self {
        Self::Timestamp(value)
    }
}

pub type Properties = BTreeMap<PropertyKey, Value>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Node {
    pub node_ref: NodeRef,
    pub type_tag: TypeTag,
    pub aspects: BTreeSet<Aspect>,
    pub properties: Properties,
}

impl Node {
    #[must_use]
    pub fn has_aspect(&self, aspect: &Aspect) -> bool {
        self.aspects.contains(aspect)
    }

    #[must_use]
    pub fn property(&self, key: &PropertyKey) -> Option<&Value> {
        self.properties.get(key)
    }

    #[must_use]
    pub fn text(&self, key: &PropertyKey) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_text)
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.text(&PropertyKey::Name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_containers_are_folders_and_not_content() {
        assert!(TypeTag::FilePlan.is_subtype_of(TypeTag::Folder));
        assert!(TypeTag::RecordFolder.is_subtype_of(TypeTag::Object));
        assert!(TypeTag::Content.is_subtype_of(TypeTag::Content));
        assert!(!TypeTag::Link.is_subtype_of(TypeTag::Content));
        assert!(!TypeTag::Object.is_subtype_of(TypeTag::Folder));
    }

    #[test]
    fn aspect_and_property_codes_round_trip_through_parse() {
        for aspect in [
            Aspect::Versionable,
            Aspect::RecordableVersionable,
            Aspect::VersionRecord,
            Aspect::MetadataStub,
            Aspect::Custom("acme:invoice".to_string()),
        ] {
            assert_eq!(Aspect::parse(aspect.as_str()), Some(aspect.clone()));
        }
        assert_eq!(PropertyKey::parse("file_plan"), Some(PropertyKey::FilePlan));
        assert_eq!(
            PropertyKey::parse("acme:amount"),
            Some(PropertyKey::Custom("acme:amount".to_string()))
        );
    }

    #[test]
    fn unqualified_unknown_names_are_rejected() {
        assert_eq!(Aspect::parse("mystery"), None);
        assert_eq!(Aspect::parse(":local"), None);
        assert_eq!(PropertyKey::parse("acme:"), None);
        assert!(PropertyKey::try_from("bad key".to_string()).is_err());
    }

    #[test]
    fn node_json_uses_string_keys_and_tagged_values() -> Result<(), serde_json::Error> {
        let node_ref = NodeRef::new();
        let mut properties = Properties::new();
        properties.insert(PropertyKey::Name, Value::from("report.txt"));
        properties.insert(PropertyKey::AutoVersion, Value::from(true));
        let node = Node {
            node_ref,
            type_tag: TypeTag::Content,
            aspects: BTreeSet::from([Aspect::Versionable]),
            properties,
        };

        let json = serde_json::to_value(&node)?;
        assert_eq!(json["properties"]["name"]["type"], "text");
        assert_eq!(json["aspects"][0], "versionable");
        assert_eq!(json["type_tag"], "content");

        let decoded: Node = serde_json::from_value(json)?;
        assert_eq!(decoded, node);
        assert_eq!(decoded.name(), Some("report.txt"));
        Ok(())
    }

    #[test]
    fn node_refs_parse_from_display_form() {
        let node_ref = NodeRef::new();
        assert_eq!(node_ref.to_string().parse::<NodeRef>(), Ok(node_ref));
        assert!(matches!("nope".parse::<NodeRef>(), Err(KernelError::Validation(_))));
    }
}
