use records_kernel_core::{
    plan_chain_repair, Aspect, AssocType, Capability, CapabilityGate, KernelError, NodeRef,
    PeerAssoc, Privilege, PropertyKey, Value, Version, VersionLabel, VersionRef,
};
use serde::{Deserialize, Serialize};

use crate::{RecordableVersionService, RepositoryStore};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Reconciliation {
    pub record: NodeRef,
    /// Owning version now marked destroyed; `None` for orphaned records.
    pub version: Option<VersionRef>,
    pub removed_links: Vec<PeerAssoc>,
    pub relinked: Option<PeerAssoc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DestroyOutcome {
    MetadataStub,
    Deleted,
}

/// Owning version of `record`, by reverse index first and by its stamped source and label
/// second.
fn owning_version<S: RepositoryStore>(
    store: &S,
    record: NodeRef,
) -> Result<Option<Version>, KernelError> {
    if let Some(version) = store.find_version_by_record(record)? {
        return Ok(Some(version));
    }
    let document = store
        .get_property(record, &PropertyKey::VersionedNode)?
        .as_ref()
        .and_then(Value::as_node);
    let label = store
        .get_property(record, &PropertyKey::RecordVersionLabel)?
        .as_ref()
        .and_then(Value::as_text)
        .and_then(|raw| raw.parse::<VersionLabel>().ok());
    let (Some(document), Some(label)) = (document, label) else {
        return Ok(None);
    };
    Ok(store.version_history(document)?.and_then(|history| {
        history
            .get_by_label(label)
            .filter(|version| version.record == Some(record))
            .cloned()
    }))
}

fn reconcile<S: RepositoryStore>(
    store: &mut S,
    record: NodeRef,
) -> Result<Reconciliation, KernelError> {
    let version = owning_version(store, record)?;
    if let Some(version) = &version {
        store.mark_version_destroyed(version.version_ref)?;
    } else {
        tracing::debug!("record {record} has no owning version, repairing chain only");
    }

    let incoming = store.source_assocs(record, &AssocType::Versions)?;
    let outgoing = store.target_assocs(record, &AssocType::Versions)?;
    let repair = plan_chain_repair(record, &incoming, &outgoing);
    for link in &repair.removed {
        store.remove_assoc(link.source, link.target, &link.assoc_type)?;
    }
    if let Some(relink) = &repair.relink {
        let existing = store.target_assocs(relink.source, &AssocType::Versions)?;
        if existing.is_empty() {
            store.create_assoc(relink.source, relink.target, AssocType::Versions)?;
        } else {
            tracing::warn!(
                "record {} already links elsewhere, not bridging over {record}",
                relink.source
            );
        }
    } else if incoming.len() > 1 || outgoing.len() > 1 {
        tracing::warn!(
            "record {record} had {} incoming and {} outgoing chain links, left unbridged",
            incoming.len(),
            outgoing.len()
        );
    }

    Ok(Reconciliation {
        record,
        version: version.map(|version| version.version_ref),
        removed_links: repair.removed,
        relinked: repair.relink,
    })
}

const RECONCILE_SAVEPOINT: &str = "record_reconciliation";

/// Reconciles the version history and record chain for a record about to disappear. A failed
/// reconciliation is undone as a whole, logged and swallowed so the deletion itself goes ahead.
pub(crate) fn reconcile_before_removal<S: RepositoryStore>(
    store: &mut S,
    record: NodeRef,
) -> Option<Reconciliation> {
    if let Err(err) = store.savepoint(RECONCILE_SAVEPOINT) {
        tracing::warn!("reconciliation of record {record} skipped, deletion proceeds: {err}");
        return None;
    }
    match reconcile(store, record) {
        Ok(reconciliation) => {
            if let Err(err) = store.release_savepoint(RECONCILE_SAVEPOINT) {
                tracing::warn!("failed to release reconciliation of record {record}: {err}");
            }
            tracing::info!(
                "reconciled record {record} (version destroyed: {})",
                reconciliation.version.is_some()
            );
            Some(reconciliation)
        }
        Err(err) => {
            if let Err(rollback) = store.rollback_to_savepoint(RECONCILE_SAVEPOINT) {
                tracing::warn!("failed to undo partial reconciliation of {record}: {rollback}");
            }
            tracing::warn!("reconciliation of record {record} failed, deletion proceeds: {err}");
            None
        }
    }
}

impl<G: CapabilityGate> RecordableVersionService<G> {
    /// Deletes `node` and its primary subtree. Version records inside it are reconciled first and
    /// version histories of deleted documents are dropped.
    ///
    /// # Errors
    /// `NotFound` for a missing node, `AccessDenied` when the subtree holds a record the caller
    /// may not delete. Nothing is written then.
    pub fn delete_node<S: RepositoryStore>(
        &self,
        store: &mut S,
        node: NodeRef,
        privilege: &Privilege,
    ) -> Result<Vec<NodeRef>, KernelError> {
        store.require_node(node)?;
        let members = store.primary_descendants(node)?;
        for member in &members {
            let member = store.require_node(*member)?;
            if member.has_aspect(&Aspect::Record) {
                self.authorize(privilege, Capability::DeleteRecord, &member)?;
            }
        }

        for member in &members {
            if store.has_aspect(*member, &Aspect::VersionRecord)? {
                reconcile_before_removal(store, *member);
            }
        }

        let deleted = store.delete_node(node)?;
        for document in deleted.iter().copied() {
            let removed = store.delete_version_history(document)?;
            if removed > 0 {
                tracing::debug!("dropped {removed} versions of deleted document {document}");
            }
        }
        Ok(deleted)
    }

    /// Destroys a record. With `keep_metadata` the node stays as a metadata stub without content,
    /// otherwise it is deleted. Either way its version is marked destroyed and the chain repaired.
    ///
    /// # Errors
    /// `NotFound` for a missing node, `Validation` when it is not a live record, `AccessDenied`
    /// for callers without destroy permission (always the case for frozen records).
    pub fn destroy_record<S: RepositoryStore>(
        &self,
        store: &mut S,
        record: NodeRef,
        keep_metadata: bool,
        privilege: &Privilege,
    ) -> Result<DestroyOutcome, KernelError> {
        let node = store.require_node(record)?;
        if !node.has_aspect(&Aspect::Record) {
            return Err(KernelError::Validation(format!("{record} is not a record")));
        }
        if node.has_aspect(&Aspect::MetadataStub) {
            return Err(KernelError::Validation(format!("record {record} is already destroyed")));
        }
        self.authorize(privilege, Capability::DestroyRecord, &node)?;

        if node.has_aspect(&Aspect::VersionRecord) {
            reconcile_before_removal(store, record);
        }

        if keep_metadata {
            store.remove_property(record, &PropertyKey::Content)?;
            store.remove_property(record, &PropertyKey::ContentHash)?;
            store.add_aspect(record, Aspect::MetadataStub, Default::default())?;
            tracing::info!("destroyed content of record {record}, metadata kept");
            Ok(DestroyOutcome::MetadataStub)
        } else {
            store.delete_node(record)?;
            tracing::info!("destroyed record {record}");
            Ok(DestroyOutcome::Deleted)
        }
    }

    /// Explicit reconciliation entry point for repositories that delete records themselves.
    pub fn before_record_removed<S: RepositoryStore>(
        &self,
        store: &mut S,
        record: NodeRef,
    ) -> Option<Reconciliation> {
        reconcile_before_removal(store, record)
    }
}
