use serde::{Deserialize, Serialize};

use crate::{Aspect, KernelError, Node, NodeRef, PropertyKey, Value, VersionType};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordableVersionPolicy {
    None,
    MajorOnly,
    All,
}

impl RecordableVersionPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::MajorOnly => "MAJOR_ONLY",
            Self::All => "ALL",
        }
    }

    /// Case-insensitive; `-` and `_` are interchangeable.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "NONE" => Some(Self::None),
            "MAJOR_ONLY" => Some(Self::MajorOnly),
            "ALL" => Some(Self::All),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RecordingDecision {
    AlwaysRecord,
    NeverRecord,
    RecordIfVersionType(VersionType),
}

impl RecordingDecision {
    #[must_use]
    pub fn records(self, version_type: VersionType) -> bool {
        match self {
            Self::AlwaysRecord => true,
            Self::NeverRecord => false,
            Self::RecordIfVersionType(required) => required == version_type,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionCreationParams {
    pub version_type: Option<VersionType>,
    pub description: Option<String>,
    /// Per-call override of the document policy.
    pub recordable: Option<bool>,
    pub file_plan: Option<NodeRef>,
}

impl VersionCreationParams {
    #[must_use]
    pub fn with_type(version_type: VersionType) -> Self {
        Self {
            version_type: Some(version_type),
            ..Self::default()
        }
    }
}

/// # Errors
/// Returns `KernelError::Configuration` when the stored policy value is not a recognised policy.
pub fn resolve_recording_decision(
    document: &Node,
    params: &VersionCreationParams,
) -> Result<RecordingDecision, KernelError> {
    if let Some(recordable) = params.recordable {
        return Ok(if recordable {
            RecordingDecision::AlwaysRecord
        } else {
            RecordingDecision::NeverRecord
        });
    }
    if !document.has_aspect(&Aspect::RecordableVersionable) {
        return Ok(RecordingDecision::NeverRecord);
    }

    let policy = match document.property(&PropertyKey::RecordableVersionPolicy) {
        None => RecordableVersionPolicy::None,
        Some(Value::Text(raw)) => RecordableVersionPolicy::parse(raw).ok_or_else(|| {
            KernelError::Configuration(format!(
                "unrecognised recordable version policy {raw:?} on {}",
                document.node_ref
            ))
        })?,
        Some(other) => {
            return Err(KernelError::Configuration(format!(
                "recordable version policy on {} must be text, found {other:?}",
                document.node_ref
            )))
        }
    };

    Ok(match policy {
        RecordableVersionPolicy::None => RecordingDecision::NeverRecord,
        RecordableVersionPolicy::MajorOnly => RecordingDecision::RecordIfVersionType(VersionType::Major),
        RecordableVersionPolicy::All => RecordingDecision::AlwaysRecord,
    })
}

/// # Errors
/// Propagates policy resolution failures.
pub fn should_record(
    document: &Node,
    params: &VersionCreationParams,
    effective_type: VersionType,
) -> Result<bool, KernelError> {
    Ok(resolve_recording_decision(document, params)?.records(effective_type))
}
