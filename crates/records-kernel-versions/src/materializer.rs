use records_kernel_core::{
    content_differs, record_copy_of, Aspect, Capability, CapabilityGate, KernelError, Node,
    NodeRef, Privilege, PropertyKey, TypeTag, Value, Version, VersionCreationParams, VersionRef,
    VersionType,
};

use crate::{chain, RecordableVersionService, RepositoryStore};

impl<G: CapabilityGate> RecordableVersionService<G> {
    /// File plan for a recording: the explicit one, else the document's, else the file plan of
    /// the configured default site.
    ///
    /// # Errors
    /// `Configuration` when none of them yields a file plan.
    pub fn resolve_file_plan<S: RepositoryStore>(
        &self,
        store: &S,
        document: &Node,
        explicit: Option<NodeRef>,
    ) -> Result<NodeRef, KernelError> {
        if let Some(file_plan) = explicit {
            return self.require_file_plan(store, file_plan);
        }
        if let Some(file_plan) = document.property(&PropertyKey::FilePlan).and_then(Value::as_node) {
            return self.require_file_plan(store, file_plan);
        }

        let site = &self.settings.default_file_plan_site;
        for candidate in store.nodes_of_type(TypeTag::FilePlan)? {
            let site_id = store.get_property(candidate, &PropertyKey::SiteId)?;
            if site_id.as_ref().and_then(Value::as_text) == Some(site.as_str()) {
                return Ok(candidate);
            }
        }
        Err(KernelError::Configuration(format!(
            "no file plan resolves for {}: none given, none on the document, none for site {site}",
            document.node_ref
        )))
    }

    fn require_file_plan<S: RepositoryStore>(
        &self,
        store: &S,
        file_plan: NodeRef,
    ) -> Result<NodeRef, KernelError> {
        match store.get_node(file_plan)? {
            Some(node) if node.type_tag.is_subtype_of(TypeTag::FilePlan) => Ok(file_plan),
            Some(node) => Err(KernelError::Configuration(format!(
                "{file_plan} is a {} not a file plan",
                node.type_tag.as_str()
            ))),
            None => Err(KernelError::Configuration(format!("file plan {file_plan} does not exist"))),
        }
    }

    /// # Errors
    /// `Configuration` when `file_plan` is not a file plan or has no unfiled record container.
    pub fn unfiled_container<S: RepositoryStore>(
        &self,
        store: &S,
        file_plan: NodeRef,
    ) -> Result<NodeRef, KernelError> {
        self.require_file_plan(store, file_plan)?;
        for assoc in store.child_assocs(file_plan)? {
            if !assoc.is_primary {
                continue;
            }
            let is_container = store
                .get_node(assoc.child)?
                .is_some_and(|child| child.type_tag == TypeTag::UnfiledRecordContainer);
            if is_container {
                return Ok(assoc.child);
            }
        }
        Err(KernelError::Configuration(format!(
            "file plan {file_plan} has no unfiled record container"
        )))
    }

    /// Materializes a record for one version. Returns `None` when the version was already
    /// recorded or destroyed.
    ///
    /// # Errors
    /// `NotFound` for a missing version or source document, `Configuration` for an unusable file
    /// plan or a non-content version.
    pub fn create_record_from_version<S: RepositoryStore>(
        &self,
        store: &mut S,
        file_plan: NodeRef,
        version_ref: VersionRef,
        privilege: &Privilege,
    ) -> Result<Option<NodeRef>, KernelError> {
        let version = store
            .get_version(version_ref)?
            .ok_or_else(|| KernelError::NotFound(format!("version {version_ref}")))?;
        if version.recorded || version.destroyed {
            tracing::debug!(
                "version {} of {} already recorded, nothing to create",
                version.label,
                version.document
            );
            return Ok(None);
        }
        let document = store.require_node(version.document)?;
        self.authorize(privilege, Capability::CreateRecord, &document)?;
        self.materialize(store, file_plan, &version)
    }

    /// Records the head version of `document`. With `force_new_version` (or the configured
    /// auto-version flag) pending modifications are first captured in a new minor version.
    ///
    /// # Errors
    /// `NotFound` for a missing document, otherwise as [`Self::create_record_from_version`].
    pub fn create_record_from_latest_version<S: RepositoryStore>(
        &self,
        store: &mut S,
        file_plan: NodeRef,
        document: NodeRef,
        force_new_version: bool,
        privilege: &Privilege,
    ) -> Result<Option<NodeRef>, KernelError> {
        let node = store.require_node(document)?;
        if !node.has_aspect(&Aspect::Versionable) {
            tracing::debug!("{document} is not versionable, no version record to create");
            return Ok(None);
        }
        self.authorize(privilege, Capability::CreateRecord, &node)?;

        let mut head = store.current_version(document)?;
        let force = force_new_version || self.settings.auto_version_on_record_creation;
        let dirty = head
            .as_ref()
            .map_or(true, |head| content_differs(&node, &head.frozen));
        if force && dirty {
            let params = VersionCreationParams {
                version_type: Some(VersionType::Minor),
                description: Some(self.settings.auto_version_description.clone()),
                recordable: Some(false),
                file_plan: None,
            };
            let outcome = self.create_version(store, document, &params, &Privilege::System)?;
            tracing::info!(
                "created version {} of {document} ahead of record declaration",
                outcome.version.label
            );
            head = Some(outcome.version);
        }

        let Some(head) = head else {
            return Ok(None);
        };
        self.create_record_from_version(store, file_plan, head.version_ref, privilege)
    }

    pub(crate) fn materialize<S: RepositoryStore>(
        &self,
        store: &mut S,
        file_plan: NodeRef,
        version: &Version,
    ) -> Result<Option<NodeRef>, KernelError> {
        let container = self.unfiled_container(store, file_plan)?;
        if !store.exists(version.document)? {
            return Err(KernelError::NotFound(format!(
                "source document {} of version {}",
                version.document, version.label
            )));
        }
        if !version.frozen.type_tag.is_subtype_of(TypeTag::Content) {
            return Err(KernelError::Configuration(format!(
                "version {} of {} is a {} and cannot become a record",
                version.label,
                version.document,
                version.frozen.type_tag.as_str()
            )));
        }

        let copy = record_copy_of(&version.frozen);
        let mut properties = copy.properties;
        properties.insert(
            PropertyKey::RecordVersionLabel,
            Value::from(version.label.to_string()),
        );
        if let Some(description) = &version.description {
            properties.insert(
                PropertyKey::RecordVersionDescription,
                Value::from(description.as_str()),
            );
        }
        properties.insert(PropertyKey::VersionedNode, Value::Node(version.document));
        properties.insert(
            PropertyKey::VersionType,
            Value::from(version.version_type.as_str()),
        );
        let mut aspects: Vec<Aspect> = copy.aspects.into_iter().collect();
        aspects.push(Aspect::VersionRecord);

        let record = store.create_node(Some(container), copy.type_tag, &aspects, properties)?;
        self.stamp_record(store, record, &Privilege::System)?;
        store.set_version_record(version.version_ref, record)?;

        let history = store.version_history(version.document)?.ok_or_else(|| {
            KernelError::InvariantViolation(format!(
                "version {} has no history for {}",
                version.version_ref, version.document
            ))
        })?;
        chain::link_to_predecessor(store, record, version, &history)?;

        tracing::info!(
            "recorded version {} of {} as {record}",
            version.label,
            version.document
        );
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use records_kernel_core::{
        AssocType, NodeStore, Properties, VersionCreationParams, VersionStore,
    };

    use super::*;
    use crate::test_support::{open_store, recordable_document, seed_file_plan, service};

    #[test]
    fn recorded_copy_is_filtered_and_stamped() -> Result<()> {
        let service = service();
        let mut store = open_store()?;
        store.transaction(|tx| {
            let fixture = seed_file_plan(tx)?;
            let document = recordable_document(tx, fixture.folder, "ALL")?;
            tx.add_aspect(document, Aspect::Titled, Properties::new())?;
            let outcome = service.create_version(
                tx,
                document,
                &VersionCreationParams {
                    description: Some("first cut".to_string()),
                    ..VersionCreationParams::default()
                },
                &Privilege::System,
            )?;
            let record = outcome
                .record
                .ok_or_else(|| KernelError::NotFound("record".to_string()))?;
            let node = tx.require_node(record)?;

            assert_eq!(node.type_tag, TypeTag::Content);
            assert!(node.has_aspect(&Aspect::Record));
            assert!(node.has_aspect(&Aspect::VersionRecord));
            assert!(node.has_aspect(&Aspect::Titled));
            assert!(!node.has_aspect(&Aspect::Versionable));
            assert!(!node.has_aspect(&Aspect::RecordableVersionable));

            assert_eq!(node.text(&PropertyKey::Content), Some("draft"));
            assert_eq!(node.text(&PropertyKey::RecordVersionLabel), Some("1.0"));
            assert_eq!(node.text(&PropertyKey::RecordVersionDescription), Some("first cut"));
            assert_eq!(node.text(&PropertyKey::VersionType), Some("major"));
            assert_eq!(
                node.property(&PropertyKey::VersionedNode),
                Some(&Value::Node(document))
            );
            assert!(node.property(&PropertyKey::Identifier).is_some());
            assert!(node.property(&PropertyKey::DeclaredAt).is_some());
            for excluded in [
                PropertyKey::Owner,
                PropertyKey::RecordableVersionPolicy,
                PropertyKey::VersionLabel,
                PropertyKey::FilePlan,
            ] {
                assert_eq!(node.property(&excluded), None);
            }

            let parent = tx.primary_parent(record)?;
            assert_eq!(parent.map(|assoc| assoc.parent), Some(fixture.unfiled));
            assert_eq!(
                tx.find_version_by_record(record)?.map(|v| v.version_ref),
                Some(outcome.version.version_ref)
            );
            Ok(())
        })
    }

    #[test]
    fn major_only_policy_records_major_versions() -> Result<()> {
        let service = service();
        let mut store = open_store()?;
        store.transaction(|tx| {
            let fixture = seed_file_plan(tx)?;
            let document = recordable_document(tx, fixture.folder, "MAJOR_ONLY")?;
            let major = service.create_version(
                tx,
                document,
                &VersionCreationParams::default(),
                &Privilege::System,
            )?;
            let minor = service.create_version(
                tx,
                document,
                &VersionCreationParams::default(),
                &Privilege::System,
            )?;
            assert!(major.record.is_some());
            assert!(minor.record.is_none());
            Ok(())
        })
    }

    #[test]
    fn already_recorded_version_yields_none() -> Result<()> {
        let service = service();
        let mut store = open_store()?;
        store.transaction(|tx| {
            let fixture = seed_file_plan(tx)?;
            let document = recordable_document(tx, fixture.folder, "ALL")?;
            let outcome = service.create_version(
                tx,
                document,
                &VersionCreationParams::default(),
                &Privilege::System,
            )?;
            let again = service.create_record_from_version(
                tx,
                fixture.file_plan,
                outcome.version.version_ref,
                &Privilege::System,
            )?;
            assert!(again.is_none());
            assert_eq!(tx.child_assocs(fixture.unfiled)?.len(), 1);
            Ok(())
        })
    }

    #[test]
    fn missing_file_plan_fails_before_any_write() -> Result<()> {
        let service = service();
        let mut store = open_store()?;
        store.transaction(|tx| {
            let folder = tx.create_node(None, TypeTag::Folder, &[], Properties::new())?;
            let document = recordable_document(tx, folder, "ALL")?;
            let result = service.create_version(
                tx,
                document,
                &VersionCreationParams::default(),
                &Privilege::System,
            );
            assert!(matches!(result, Err(KernelError::Configuration(_))));
            assert!(tx.version_history(document)?.is_none());
            assert_eq!(tx.get_property(document, &PropertyKey::VersionLabel)?, None);
            Ok(())
        })
    }

    #[test]
    fn file_plan_without_unfiled_container_is_a_configuration_error() -> Result<()> {
        let service = service();
        let mut store = open_store()?;
        store.transaction(|tx| {
            let bare_plan = tx.create_node(None, TypeTag::FilePlan, &[], Properties::new())?;
            let folder = tx.create_node(None, TypeTag::Folder, &[], Properties::new())?;
            let document = recordable_document(tx, folder, "ALL")?;
            let result = service.create_version(
                tx,
                document,
                &VersionCreationParams {
                    file_plan: Some(bare_plan),
                    ..VersionCreationParams::default()
                },
                &Privilege::System,
            );
            assert!(matches!(result, Err(KernelError::Configuration(_))));

            let not_a_plan = service.create_version(
                tx,
                document,
                &VersionCreationParams {
                    file_plan: Some(folder),
                    ..VersionCreationParams::default()
                },
                &Privilege::System,
            );
            assert!(matches!(not_a_plan, Err(KernelError::Configuration(_))));
            Ok(())
        })
    }

    #[test]
    fn non_content_versions_cannot_become_records() -> Result<()> {
        let service = service();
        let mut store = open_store()?;
        store.transaction(|tx| {
            let fixture = seed_file_plan(tx)?;
            let link = tx.create_node(
                Some(fixture.folder),
                TypeTag::Link,
                &[Aspect::Versionable],
                Properties::new(),
            )?;
            let outcome = service.create_version(
                tx,
                link,
                &VersionCreationParams::default(),
                &Privilege::System,
            )?;
            let result = service.create_record_from_version(
                tx,
                fixture.file_plan,
                outcome.version.version_ref,
                &Privilege::System,
            );
            assert!(matches!(result, Err(KernelError::Configuration(_))));
            Ok(())
        })
    }

    #[test]
    fn declaring_latest_twice_is_idempotent() -> Result<()> {
        let service = service();
        let mut store = open_store()?;
        store.transaction(|tx| {
            let fixture = seed_file_plan(tx)?;
            let document = recordable_document(tx, fixture.folder, "NONE")?;
            service.create_version(
                tx,
                document,
                &VersionCreationParams::default(),
                &Privilege::System,
            )?;

            let first = service.create_record_from_latest_version(
                tx,
                fixture.file_plan,
                document,
                false,
                &Privilege::System,
            )?;
            let second = service.create_record_from_latest_version(
                tx,
                fixture.file_plan,
                document,
                false,
                &Privilege::System,
            )?;
            assert!(first.is_some());
            assert!(second.is_none());
            assert_eq!(tx.child_assocs(fixture.unfiled)?.len(), 1);
            Ok(())
        })
    }

    #[test]
    fn forced_declaration_versions_pending_changes_first() -> Result<()> {
        let service = service();
        let mut store = open_store()?;
        store.transaction(|tx| {
            let fixture = seed_file_plan(tx)?;
            let document = recordable_document(tx, fixture.folder, "NONE")?;
            service.create_version(
                tx,
                document,
                &VersionCreationParams::default(),
                &Privilege::System,
            )?;
            tx.set_property(document, PropertyKey::Content, Value::from("final text"))?;

            let record = service
                .create_record_from_latest_version(
                    tx,
                    fixture.file_plan,
                    document,
                    true,
                    &Privilege::System,
                )?
                .ok_or_else(|| KernelError::NotFound("record".to_string()))?;

            let history = tx
                .version_history(document)?
                .ok_or_else(|| KernelError::NotFound("history".to_string()))?;
            let head = history
                .head()
                .ok_or_else(|| KernelError::NotFound("head".to_string()))?;
            assert_eq!(head.label.to_string(), "1.1");
            assert_eq!(head.version_type, VersionType::Minor);
            assert_eq!(
                head.description.as_deref(),
                Some("Auto-version on record creation")
            );
            assert_eq!(head.record, Some(record));
            assert_eq!(tx.require_node(record)?.text(&PropertyKey::Content), Some("final text"));
            Ok(())
        })
    }

    #[test]
    fn forced_declaration_without_changes_does_not_bump_the_label() -> Result<()> {
        let service = service();
        let mut store = open_store()?;
        store.transaction(|tx| {
            let fixture = seed_file_plan(tx)?;
            let document = recordable_document(tx, fixture.folder, "ALL")?;
            service.create_version(
                tx,
                document,
                &VersionCreationParams::default(),
                &Privilege::System,
            )?;

            let result = service.create_record_from_latest_version(
                tx,
                fixture.file_plan,
                document,
                true,
                &Privilege::System,
            )?;
            assert!(result.is_none());
            assert_eq!(tx.version_history(document)?.map(|h| h.len()), Some(1));
            Ok(())
        })
    }

    #[test]
    fn non_versionable_documents_yield_no_record() -> Result<()> {
        let service = service();
        let mut store = open_store()?;
        store.transaction(|tx| {
            let fixture = seed_file_plan(tx)?;
            let plain = tx.create_node(
                Some(fixture.folder),
                TypeTag::Content,
                &[],
                Properties::new(),
            )?;
            let result = service.create_record_from_latest_version(
                tx,
                fixture.file_plan,
                plain,
                true,
                &Privilege::System,
            )?;
            assert!(result.is_none());
            assert!(matches!(
                service.create_record_from_latest_version(
                    tx,
                    fixture.file_plan,
                    NodeRef::new(),
                    false,
                    &Privilege::System,
                ),
                Err(KernelError::NotFound(_))
            ));
            Ok(())
        })
    }

    #[test]
    fn default_site_file_plan_is_used_when_nothing_else_resolves() -> Result<()> {
        let service = service();
        let mut store = open_store()?;
        store.transaction(|tx| {
            let fixture = seed_file_plan(tx)?;
            let document = recordable_document(tx, fixture.folder, "ALL")?;
            let outcome = service.create_version(
                tx,
                document,
                &VersionCreationParams::default(),
                &Privilege::System,
            )?;
            let record = outcome
                .record
                .ok_or_else(|| KernelError::NotFound("record".to_string()))?;
            assert!(tx.target_assocs(record, &AssocType::Versions)?.is_empty());
            assert_eq!(
                tx.primary_parent(record)?.map(|assoc| assoc.parent),
                Some(fixture.unfiled)
            );
            Ok(())
        })
    }
}
