use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::{KernelError, NodeRef};

/// Authority an operation runs with. Internal bookkeeping passes `System`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", content = "principal", rename_all = "snake_case")]
pub enum Privilege {
    System,
    Caller(String),
}

impl Privilege {
    #[must_use]
    pub fn caller(principal: impl Into<String>) -> Self {
        Self::Caller(principal.into())
    }

    #[must_use]
    pub fn principal(&self) -> &str {
        match self {
            Self::System => "system",
            Self::Caller(principal) => principal,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    CreateVersion,
    CreateRecord,
    DeclareRecord,
    DeleteRecord,
    DestroyRecord,
    FileRecord,
    ViewRecords,
    ManagePolicy,
}

impl Capability {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateVersion => "create_version",
            Self::CreateRecord => "create_record",
            Self::DeclareRecord => "declare_record",
            Self::DeleteRecord => "delete_record",
            Self::DestroyRecord => "destroy_record",
            Self::FileRecord => "file_record",
            Self::ViewRecords => "view_records",
            Self::ManagePolicy => "manage_policy",
        }
    }
}

impl Display for Capability {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AccessStatus {
    Allowed,
    Denied,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Administrator,
    RecordsManager,
    PowerUser,
    User,
}

impl Role {
    #[must_use]
    pub fn capabilities(self) -> &'static [Capability] {
        match self {
            Self::Administrator | Self::RecordsManager => &[
                Capability::CreateVersion,
                Capability::CreateRecord,
                Capability::DeclareRecord,
                Capability::DeleteRecord,
                Capability::DestroyRecord,
                Capability::FileRecord,
                Capability::ViewRecords,
                Capability::ManagePolicy,
            ],
            Self::PowerUser => &[
                Capability::CreateVersion,
                Capability::CreateRecord,
                Capability::DeclareRecord,
                Capability::FileRecord,
                Capability::ViewRecords,
            ],
            Self::User => &[Capability::CreateVersion, Capability::ViewRecords],
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct GateTarget {
    pub node: NodeRef,
    pub frozen: bool,
}

pub trait CapabilityGate {
    fn evaluate(&self, principal: &str, capability: Capability, target: &GateTarget) -> AccessStatus;
}

#[derive(Debug, Clone, Default)]
pub struct RoleCapabilityGate {
    roles: BTreeMap<String, Role>,
    grants: BTreeMap<NodeRef, BTreeMap<String, BTreeSet<Capability>>>,
}

impl RoleCapabilityGate {
    #[must_use]
    pub fn new(roles: BTreeMap<String, Role>) -> Self {
        Self {
            roles,
            grants: BTreeMap::new(),
        }
    }

    pub fn assign_role(&mut self, principal: impl Into<String>, role: Role) {
        self.roles.insert(principal.into(), role);
    }

    pub fn grant(&mut self, node: NodeRef, principal: impl Into<String>, capability: Capability) {
        self.grants
            .entry(node)
            .or_default()
            .entry(principal.into())
            .or_default()
            .insert(capability);
    }

    #[must_use]
    pub fn role_of(&self, principal: &str) -> Option<Role> {
        self.roles.get(principal).copied()
    }
}

impl CapabilityGate for RoleCapabilityGate {
    fn evaluate(&self, principal: &str, capability: Capability, target: &GateTarget) -> AccessStatus {
        if target.frozen
            && matches!(
                capability,
                Capability::DeleteRecord | Capability::DestroyRecord | Capability::FileRecord
            )
        {
            return AccessStatus::Denied;
        }
        let by_role = self
            .role_of(principal)
            .is_some_and(|role| role.capabilities().contains(&capability));
        let by_grant = self
            .grants
            .get(&target.node)
            .and_then(|grants| grants.get(principal))
            .is_some_and(|capabilities| capabilities.contains(&capability));
        if by_role || by_grant {
            AccessStatus::Allowed
        } else {
            AccessStatus::Denied
        }
    }
}

/// `System` bypasses the gate.
///
/// # Errors
/// Returns `KernelError::AccessDenied` when the gate denies the caller.
pub fn check_capability(
    gate: &dyn CapabilityGate,
    privilege: &Privilege,
    capability: Capability,
    target: &GateTarget,
) -> Result<(), KernelError> {
    let Privilege::Caller(principal) = privilege else {
        return Ok(());
    };
    match gate.evaluate(principal, capability, target) {
        AccessStatus::Allowed => Ok(()),
        AccessStatus::Denied => Err(KernelError::AccessDenied(format!(
            "{principal} lacks {capability} on {}",
            target.node
        ))),
    }
}
