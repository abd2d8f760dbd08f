use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{Aspect, KernelError, Node, NodeRef, Properties, TypeTag, VersionRef};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VersionType {
    Major,
    Minor,
}

impl VersionType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Major => "major",
            Self::Minor => "minor",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "major" => Some(Self::Major),
            "minor" => Some(Self::Minor),
            _ => None,
        }
    }
}

/// `major.minor` label. Ordering follows the numeric components.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct VersionLabel {
    pub major: u32,
    pub minor: u32,
}

impl VersionLabel {
    #[must_use]
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    #[must_use]
    pub fn initial(version_type: VersionType) -> Self {
        match version_type {
            VersionType::Major => Self::new(1, 0),
            VersionType::Minor => Self::new(0, 1),
        }
    }

    #[must_use]
    pub fn next(self, version_type: VersionType) -> Self {
        match version_type {
            VersionType::Major => Self::new(self.major.saturating_add(1), 0),
            VersionType::Minor => Self::new(self.major, self.minor.saturating_add(1)),
        }
    }
}

impl Display for VersionLabel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for VersionLabel {
    type Err = KernelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || KernelError::Validation(format!("invalid version label: {value}"));
        let (major, minor) = value.trim().split_once('.').ok_or_else(invalid)?;
        let major = major.parse::<u32>().map_err(|_| invalid())?;
        let minor = minor.parse::<u32>().map_err(|_| invalid())?;
        Ok(Self::new(major, minor))
    }
}

impl TryFrom<String> for VersionLabel {
    type Error = KernelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VersionLabel> for String {
    fn from(value: VersionLabel) -> Self {
        value.to_string()
    }
}

/// Snapshot of a document taken when a version is created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FrozenState {
    pub type_tag: TypeTag,
    pub aspects: BTreeSet<Aspect>,
    pub properties: Properties,
}

impl FrozenState {
    #[must_use]
    pub fn capture(node: &Node) -> Self {
        Self {
            type_tag: node.type_tag,
            aspects: node.aspects.clone(),
            properties: node.properties.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum VersionState {
    LiveUnrecorded,
    LiveRecorded,
    Destroyed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Version {
    pub version_ref: VersionRef,
    pub document: NodeRef,
    pub seq: u32,
    pub label: VersionLabel,
    pub version_type: VersionType,
    pub description: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub frozen: FrozenState,
    pub recorded: bool,
    pub record: Option<NodeRef>,
    pub destroyed: bool,
}

impl Version {
    #[must_use]
    pub fn state(&self) -> VersionState {
        if self.destroyed {
            VersionState::Destroyed
        } else if self.recorded {
            VersionState::LiveRecorded
        } else {
            VersionState::LiveUnrecorded
        }
    }

    /// Record node of a live recorded version.
    #[must_use]
    pub fn live_record(&self) -> Option<NodeRef> {
        if self.destroyed {
            None
        } else {
            self.record
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewVersion {
    pub document: NodeRef,
    pub label: VersionLabel,
    pub version_type: VersionType,
    pub description: Option<String>,
    pub created_at: OffsetDateTime,
    pub frozen: FrozenState,
}

/// Linear version history of one document, held oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionHistory {
    document: NodeRef,
    versions: Vec<Version>,
}

impl VersionHistory {
    /// # Errors
    /// Returns `KernelError::InvariantViolation` when versions belong to another document or
    /// sequence numbers and labels do not strictly increase.
    pub fn new(document: NodeRef, mut versions: Vec<Version>) -> Result<Self, KernelError> {
        versions.sort_by_key(|version| version.seq);
        for version in &versions {
            if version.document != document {
                return Err(KernelError::InvariantViolation(format!(
                    "version {} belongs to {} not {document}",
                    version.version_ref, version.document
                )));
            }
        }
        for pair in versions.windows(2) {
            if pair[0].seq >= pair[1].seq || pair[0].label >= pair[1].label {
                return Err(KernelError::InvariantViolation(format!(
                    "version history of {document} is not strictly ordered at {}",
                    pair[1].label
                )));
            }
        }
        Ok(Self { document, versions })
    }

    #[must_use]
    pub fn document(&self) -> NodeRef {
        self.document
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Oldest first.
    #[must_use]
    pub fn versions(&self) -> &[Version] {
        &self.versions
    }

    #[must_use]
    pub fn into_versions(self) -> Vec<Version> {
        self.versions
    }

    #[must_use]
    pub fn head(&self) -> Option<&Version> {
        self.versions.last()
    }

    #[must_use]
    pub fn root(&self) -> Option<&Version> {
        self.versions.first()
    }

    #[must_use]
    pub fn get(&self, version_ref: VersionRef) -> Option<&Version> {
        self.versions.iter().find(|version| version.version_ref == version_ref)
    }

    #[must_use]
    pub fn get_by_label(&self, label: VersionLabel) -> Option<&Version> {
        self.versions.iter().find(|version| version.label == label)
    }

    fn position(&self, version_ref: VersionRef) -> Option<usize> {
        self.versions.iter().position(|version| version.version_ref == version_ref)
    }

    #[must_use]
    pub fn predecessor(&self, version_ref: VersionRef) -> Option<&Version> {
        let index = self.position(version_ref)?;
        index.checked_sub(1).and_then(|prev| self.versions.get(prev))
    }

    #[must_use]
    pub fn successor(&self, version_ref: VersionRef) -> Option<&Version> {
        let index = self.position(version_ref)?;
        self.versions.get(index + 1)
    }

    /// Walks backwards from `version_ref`, nearest predecessor first.
    pub fn predecessors(&self, version_ref: VersionRef) -> impl Iterator<Item = &Version> {
        let end = self.position(version_ref).unwrap_or(0);
        self.versions[..end].iter().rev()
    }

    /// Walks forwards from `version_ref`, nearest successor first.
    pub fn successors(&self, version_ref: VersionRef) -> impl Iterator<Item = &Version> {
        let start = self
            .position(version_ref)
            .map_or(self.versions.len(), |index| index + 1);
        self.versions[start..].iter()
    }

    /// All versions, newest first.
    pub fn newest_first(&self) -> impl Iterator<Item = &Version> {
        self.versions.iter().rev()
    }

    #[must_use]
    pub fn effective_version_type(&self, requested: Option<VersionType>) -> VersionType {
        requested.unwrap_or(if self.is_empty() {
            VersionType::Major
        } else {
            VersionType::Minor
        })
    }

    /// Label bumps from the head, destroyed or not, so labels are never reused.
    #[must_use]
    pub fn next_label(&self, version_type: VersionType) -> VersionLabel {
        self.head().map_or_else(
            || VersionLabel::initial(version_type),
            |head| head.label.next(version_type),
        )
    }

    #[must_use]
    pub fn next_seq(&self) -> u32 {
        self.head().map_or(1, |head| head.seq + 1)
    }
}
