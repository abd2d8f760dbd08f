use std::collections::BTreeSet;

use records_kernel_core::{
    Aspect, AssocType, KernelError, NodeRef, NodeStore, Version, VersionHistory,
};

use crate::RepositoryStore;

/// A record still taking part in the chain: present, not destroyed, not reduced to a stub.
fn live_record_of<S: NodeStore>(store: &S, version: &Version) -> Result<Option<NodeRef>, KernelError> {
    let Some(record) = version.live_record() else {
        return Ok(None);
    };
    match store.get_node(record)? {
        Some(node) if !node.has_aspect(&Aspect::MetadataStub) => Ok(Some(record)),
        _ => Ok(None),
    }
}

/// Splices `new_record` into the record chain next to the nearest live records of the
/// versions around `version`.
pub(crate) fn link_to_predecessor<S: RepositoryStore>(
    store: &mut S,
    new_record: NodeRef,
    version: &Version,
    history: &VersionHistory,
) -> Result<Option<NodeRef>, KernelError> {
    if !store.target_assocs(new_record, &AssocType::Versions)?.is_empty() {
        return Err(KernelError::InvariantViolation(format!(
            "record {new_record} already has a predecessor link"
        )));
    }

    let mut predecessor = None;
    for candidate in history.predecessors(version.version_ref) {
        if let Some(record) = live_record_of(store, candidate)? {
            predecessor = Some(record);
            break;
        }
        tracing::trace!("skipping version {} without a live record", candidate.label);
    }

    let mut successor = None;
    for candidate in history.successors(version.version_ref) {
        if let Some(record) = live_record_of(store, candidate)? {
            successor = Some(record);
            break;
        }
    }

    if let Some(predecessor) = predecessor {
        store.create_assoc(new_record, predecessor, AssocType::Versions)?;
        tracing::trace!("linked record {new_record} to predecessor {predecessor}");
    }

    if let Some(successor) = successor {
        let outgoing = store.target_assocs(successor, &AssocType::Versions)?;
        let points_at_predecessor = match predecessor {
            Some(predecessor) => outgoing.iter().any(|assoc| assoc.target == predecessor),
            None => outgoing.is_empty(),
        };
        if points_at_predecessor {
            if let Some(predecessor) = predecessor {
                store.remove_assoc(successor, predecessor, &AssocType::Versions)?;
            }
            store.create_assoc(successor, new_record, AssocType::Versions)?;
            tracing::trace!("re-pointed successor record {successor} at {new_record}");
        }
    }

    Ok(predecessor)
}

/// Follows outgoing `Versions` links from `record`, newest first.
///
/// # Errors
/// `NotFound` for a missing start record, `InvariantViolation` when a record has more than one
/// predecessor link or the chain loops.
pub fn record_chain<S: NodeStore>(store: &S, record: NodeRef) -> Result<Vec<NodeRef>, KernelError> {
    if !store.exists(record)? {
        return Err(KernelError::NotFound(format!("record {record}")));
    }
    let mut chain = vec![record];
    let mut seen = BTreeSet::from([record]);
    let mut current = record;
    loop {
        let outgoing = store.target_assocs(current, &AssocType::Versions)?;
        let next = match outgoing.as_slice() {
            [] => return Ok(chain),
            [only] => only.target,
            _ => {
                return Err(KernelError::InvariantViolation(format!(
                    "record {current} has {} predecessor links",
                    outgoing.len()
                )))
            }
        };
        if !seen.insert(next) {
            return Err(KernelError::InvariantViolation(format!(
                "record chain starting at {record} loops back to {next}"
            )));
        }
        chain.push(next);
        current = next;
    }
}
