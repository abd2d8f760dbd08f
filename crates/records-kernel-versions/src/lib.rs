//! Recordable versions: decides when a document version becomes a record, materializes the
//! record copy, keeps the derived record chain linked, and reconciles it when records go away.

use records_kernel_core::{
    check_capability, Aspect, Capability, CapabilityGate, GateTarget, KernelError, Node, NodeStore,
    Privilege, RoleCapabilityGate, Savepoints, VersionStore,
};

mod chain;
mod materializer;
mod reconciler;
mod records;
mod versioning;

pub use chain::record_chain;
pub use reconciler::{DestroyOutcome, Reconciliation};
pub use versioning::VersionOutcome;

/// Store capable of serving both collaborator contracts, usually one open transaction.
pub trait RepositoryStore: NodeStore + VersionStore + Savepoints {}

impl<T: NodeStore + VersionStore + Savepoints> RepositoryStore for T {}

/// Records are immutable: they take no content edits, new versions, reverts or policy changes.
///
/// # Errors
/// `Validation` when `node` carries the `Record` aspect.
pub fn ensure_mutable(node: &Node) -> Result<(), KernelError> {
    if node.has_aspect(&Aspect::Record) {
        return Err(KernelError::Validation(format!(
            "{} is a record and cannot be modified",
            node.node_ref
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersioningSettings {
    /// Site whose file plan is used when neither the call nor the document names one.
    pub default_file_plan_site: String,
    pub auto_version_on_record_creation: bool,
    pub auto_version_description: String,
    pub final_version_label: String,
    pub final_version_description: String,
}

impl Default for VersioningSettings {
    fn default() -> Self {
        Self {
            default_file_plan_site: "rm".to_string(),
            auto_version_on_record_creation: false,
            auto_version_description: "Auto-version on record creation".to_string(),
            final_version_label: "final".to_string(),
            final_version_description: "Final version declared as record".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct RecordableVersionService<G = RoleCapabilityGate> {
    gate: G,
    settings: VersioningSettings,
}

impl<G: CapabilityGate> RecordableVersionService<G> {
    #[must_use]
    pub fn new(gate: G, settings: VersioningSettings) -> Self {
        Self { gate, settings }
    }

    #[must_use]
    pub fn settings(&self) -> &VersioningSettings {
        &self.settings
    }

    #[must_use]
    pub fn gate(&self) -> &G {
        &self.gate
    }

    fn authorize(
        &self,
        privilege: &Privilege,
        capability: Capability,
        node: &Node,
    ) -> Result<(), KernelError> {
        let target = GateTarget {
            node: node.node_ref,
            frozen: node.has_aspect(&Aspect::Frozen),
        };
        check_capability(&self.gate, privilege, capability, &target)
    }
}
