use records_kernel_core::{
    content_differs, is_content_property, resolve_recording_decision, Aspect, Capability,
    CapabilityGate, FrozenState, KernelError, NewVersion, NodeRef, Privilege, Properties,
    PropertyKey, RecordableVersionPolicy, Value, Version, VersionCreationParams, VersionHistory,
    VersionLabel, VersionRef, VersionType,
};
use serde::Serialize;
use time::OffsetDateTime;

use crate::{ensure_mutable, RecordableVersionService, RepositoryStore};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct VersionOutcome {
    pub version: Version,
    pub record: Option<NodeRef>,
}

pub(crate) fn effective_version_type(
    history: Option<&VersionHistory>,
    requested: Option<VersionType>,
) -> VersionType {
    history.map_or_else(
        || requested.unwrap_or(VersionType::Major),
        |history| history.effective_version_type(requested),
    )
}

impl<G: CapabilityGate> RecordableVersionService<G> {
    /// Creates the next version of `document`, then records it when the document policy or the
    /// per-call override asks for it.
    ///
    /// # Errors
    /// `NotFound` for a missing document, `Validation` for records, `Configuration` for an
    /// unparseable policy or a recording that has no usable file plan. Nothing is written then.
    pub fn create_version<S: RepositoryStore>(
        &self,
        store: &mut S,
        document: NodeRef,
        params: &VersionCreationParams,
        privilege: &Privilege,
    ) -> Result<VersionOutcome, KernelError> {
        let node = store.require_node(document)?;
        ensure_mutable(&node)?;
        self.authorize(privilege, Capability::CreateVersion, &node)?;

        let history = store.version_history(document)?;
        let version_type = effective_version_type(history.as_ref(), params.version_type);
        let decision = resolve_recording_decision(&node, params)?;
        let recording = decision.records(version_type);
        tracing::debug!(
            "recording decision for {document}: {decision:?} with {} version, recording={recording}",
            version_type.as_str()
        );

        let file_plan = if recording {
            self.authorize(privilege, Capability::CreateRecord, &node)?;
            let file_plan = self.resolve_file_plan(store, &node, params.file_plan)?;
            self.unfiled_container(store, file_plan)?;
            Some(file_plan)
        } else {
            None
        };

        let label = history.as_ref().map_or_else(
            || VersionLabel::initial(version_type),
            |history| history.next_label(version_type),
        );
        if !node.has_aspect(&Aspect::Versionable) {
            store.add_aspect(document, Aspect::Versionable, Properties::new())?;
        }
        store.set_property(document, PropertyKey::VersionLabel, Value::from(label.to_string()))?;
        let frozen = FrozenState::capture(&store.require_node(document)?);

        let version = store.append_version(NewVersion {
            document,
            label,
            version_type,
            description: params.description.clone(),
            created_at: OffsetDateTime::now_utc(),
            frozen,
        })?;
        tracing::info!("created version {} of {document}", version.label);

        let record = match file_plan {
            Some(file_plan) => self.materialize(store, file_plan, &version)?,
            None => None,
        };
        let version = store.get_version(version.version_ref)?.unwrap_or(version);
        Ok(VersionOutcome { version, record })
    }

    /// Auto-versions a document after a content update. Only versionable documents whose
    /// `auto_version` flag is not switched off and whose content moved past the head are touched.
    ///
    /// # Errors
    /// `Validation` for records, otherwise version creation failures.
    pub fn on_content_updated<S: RepositoryStore>(
        &self,
        store: &mut S,
        document: NodeRef,
        privilege: &Privilege,
    ) -> Result<Option<VersionOutcome>, KernelError> {
        let node = store.require_node(document)?;
        ensure_mutable(&node)?;
        if !node.has_aspect(&Aspect::Versionable) {
            return Ok(None);
        }
        let auto_version = node
            .property(&PropertyKey::AutoVersion)
            .and_then(Value::as_bool)
            .unwrap_or(true);
        if !auto_version {
            tracing::debug!("auto-versioning disabled on {document}");
            return Ok(None);
        }
        if let Some(head) = store.current_version(document)? {
            if !content_differs(&node, &head.frozen) {
                return Ok(None);
            }
        }
        self.create_version(
            store,
            document,
            &VersionCreationParams::with_type(VersionType::Minor),
            privilege,
        )
        .map(Some)
    }

    /// Restores the content of `version` onto its document. Bookkeeping such as the recordable
    /// version policy, the file plan pointer and the current label stays as it is.
    ///
    /// # Errors
    /// `NotFound` for a missing document or version, `Validation` for records or when the
    /// version belongs to another document.
    pub fn revert<S: RepositoryStore>(
        &self,
        store: &mut S,
        document: NodeRef,
        version_ref: VersionRef,
        privilege: &Privilege,
    ) -> Result<(), KernelError> {
        let node = store.require_node(document)?;
        ensure_mutable(&node)?;
        self.authorize(privilege, Capability::CreateVersion, &node)?;
        let version = store
            .get_version(version_ref)?
            .ok_or_else(|| KernelError::NotFound(format!("version {version_ref}")))?;
        if version.document != document {
            return Err(KernelError::Validation(format!(
                "version {version_ref} belongs to {} not {document}",
                version.document
            )));
        }

        for key in node.properties.keys().filter(|key| is_content_property(key)) {
            if !version.frozen.properties.contains_key(key) {
                store.remove_property(document, key)?;
            }
        }
        for (key, value) in &version.frozen.properties {
            if is_content_property(key) {
                store.set_property(document, key.clone(), value.clone())?;
            }
        }
        for aspect in &version.frozen.aspects {
            if !node.has_aspect(aspect) {
                store.add_aspect(document, aspect.clone(), Properties::new())?;
            }
        }
        tracing::info!("reverted {document} to version {}", version.label);
        Ok(())
    }

    /// Sets or clears the recordable version policy of `document`. Setting a policy makes the
    /// document recordable-versionable.
    ///
    /// # Errors
    /// `NotFound` for a missing document, `AccessDenied` without the manage-policy capability.
    pub fn set_recordable_version_policy<S: RepositoryStore>(
        &self,
        store: &mut S,
        document: NodeRef,
        policy: Option<RecordableVersionPolicy>,
        privilege: &Privilege,
    ) -> Result<(), KernelError> {
        let node = store.require_node(document)?;
        ensure_mutable(&node)?;
        self.authorize(privilege, Capability::ManagePolicy, &node)?;
        match policy {
            Some(policy) => {
                if !node.has_aspect(&Aspect::RecordableVersionable) {
                    store.add_aspect(document, Aspect::RecordableVersionable, Properties::new())?;
                }
                store.set_property(
                    document,
                    PropertyKey::RecordableVersionPolicy,
                    Value::from(policy.as_str()),
                )?;
                tracing::info!("set recordable version policy of {document} to {}", policy.as_str());
            }
            None => {
                store.remove_property(document, &PropertyKey::RecordableVersionPolicy)?;
                tracing::info!("cleared recordable version policy of {document}");
            }
        }
        Ok(())
    }

    /// # Errors
    /// Storage failures.
    pub fn version_history<S: RepositoryStore>(
        &self,
        store: &S,
        document: NodeRef,
    ) -> Result<Option<VersionHistory>, KernelError> {
        store.version_history(document)
    }
}
