use records_kernel_core::{
    Aspect, AssocType, Capability, CapabilityGate, KernelError, Node, NodeRef, Privilege,
    Properties, PropertyKey, TypeTag, Value, Version, VersionRef,
};
use time::OffsetDateTime;

use crate::{RecordableVersionService, RepositoryStore};

fn record_identifier(record: NodeRef, declared_at: OffsetDateTime) -> String {
    format!("{}-{record}", declared_at.year())
}

impl<G: CapabilityGate> RecordableVersionService<G> {
    pub(crate) fn stamp_record<S: RepositoryStore>(
        &self,
        store: &mut S,
        node: NodeRef,
        privilege: &Privilege,
    ) -> Result<(), KernelError> {
        let declared_at = OffsetDateTime::now_utc();
        let mut properties = Properties::new();
        properties.insert(
            PropertyKey::Identifier,
            Value::from(record_identifier(node, declared_at)),
        );
        properties.insert(PropertyKey::DeclaredAt, Value::Timestamp(declared_at));
        properties.insert(PropertyKey::DeclaredBy, Value::from(privilege.principal()));
        store.add_aspect(node, Aspect::Record, properties)?;
        store.remove_property(node, &PropertyKey::Owner)?;
        Ok(())
    }

    /// Turns `node` into an unfiled record in place.
    ///
    /// # Errors
    /// `NotFound` for a missing node, `Validation` when it already is a record.
    pub fn make_record<S: RepositoryStore>(
        &self,
        store: &mut S,
        node: NodeRef,
        privilege: &Privilege,
    ) -> Result<(), KernelError> {
        let current = store.require_node(node)?;
        if current.has_aspect(&Aspect::Record) {
            return Err(KernelError::Validation(format!("{node} is already a record")));
        }
        self.authorize(privilege, Capability::DeclareRecord, &current)?;
        self.stamp_record(store, node, privilege)
    }

    /// # Errors
    /// Storage failures.
    pub fn is_record<S: RepositoryStore>(&self, store: &S, node: NodeRef) -> Result<bool, KernelError> {
        store.has_aspect(node, &Aspect::Record)
    }

    /// # Errors
    /// Storage failures.
    pub fn is_metadata_stub<S: RepositoryStore>(
        &self,
        store: &S,
        node: NodeRef,
    ) -> Result<bool, KernelError> {
        store.has_aspect(node, &Aspect::MetadataStub)
    }

    /// A record is filed once its primary parent is a record folder.
    ///
    /// # Errors
    /// Storage failures.
    pub fn is_filed<S: RepositoryStore>(&self, store: &S, record: NodeRef) -> Result<bool, KernelError> {
        if !self.is_record(store, record)? {
            return Ok(false);
        }
        let Some(parent) = store.primary_parent(record)? else {
            return Ok(false);
        };
        Ok(store
            .get_node(parent.parent)?
            .is_some_and(|node| node.type_tag == TypeTag::RecordFolder))
    }

    /// Moves a record into a record folder and stamps the filing date.
    ///
    /// # Errors
    /// `Validation` when `record` is not a record or `folder` is not a record folder.
    pub fn file_record<S: RepositoryStore>(
        &self,
        store: &mut S,
        record: NodeRef,
        folder: NodeRef,
        privilege: &Privilege,
    ) -> Result<(), KernelError> {
        let node = store.require_node(record)?;
        if !node.has_aspect(&Aspect::Record) {
            return Err(KernelError::Validation(format!("{record} is not a record")));
        }
        let target = store.require_node(folder)?;
        if target.type_tag != TypeTag::RecordFolder {
            return Err(KernelError::Validation(format!(
                "{folder} is a {} not a record folder",
                target.type_tag.as_str()
            )));
        }
        self.authorize(privilege, Capability::FileRecord, &node)?;
        store.move_node(record, folder)?;
        store.set_property(
            record,
            PropertyKey::DateFiled,
            Value::Timestamp(OffsetDateTime::now_utc()),
        )?;
        tracing::info!("filed record {record} into {folder}");
        Ok(())
    }

    /// Attaches an additional record type, expressed as a custom aspect.
    ///
    /// # Errors
    /// `Validation` when `record` is not a record or `aspect` is a built-in aspect.
    pub fn add_record_type<S: RepositoryStore>(
        &self,
        store: &mut S,
        record: NodeRef,
        aspect: Aspect,
        privilege: &Privilege,
    ) -> Result<(), KernelError> {
        let node = store.require_node(record)?;
        if !node.has_aspect(&Aspect::Record) {
            return Err(KernelError::Validation(format!("{record} is not a record")));
        }
        if !matches!(aspect, Aspect::Custom(_)) {
            return Err(KernelError::Validation(format!(
                "{aspect} is a built-in aspect, not a record type"
            )));
        }
        self.authorize(privilege, Capability::DeclareRecord, &node)?;
        store.add_aspect(record, aspect, Properties::new())
    }

    /// Declares the document itself as a record. It moves into the unfiled container, stays
    /// reachable from its original folder, stops being versionable and, when earlier versions
    /// were recorded, closes the record chain as the final version record.
    ///
    /// # Errors
    /// `Validation` for documents that already are records, `Configuration` for an unusable
    /// file plan.
    pub fn declare_document_as_record<S: RepositoryStore>(
        &self,
        store: &mut S,
        file_plan: NodeRef,
        document: NodeRef,
        privilege: &Privilege,
    ) -> Result<NodeRef, KernelError> {
        let node = store.require_node(document)?;
        if node.has_aspect(&Aspect::Record) {
            return Err(KernelError::Validation(format!("{document} is already a record")));
        }
        self.authorize(privilege, Capability::DeclareRecord, &node)?;
        let container = self.unfiled_container(store, file_plan)?;

        let mut latest_record = None;
        if let Some(history) = store.version_history(document)? {
            for version in history.newest_first() {
                let Some(record) = version.live_record() else {
                    continue;
                };
                if store.exists(record)? && !store.has_aspect(record, &Aspect::MetadataStub)? {
                    latest_record = Some(record);
                    break;
                }
            }
        }

        let original_parent = store.primary_parent(document)?;
        store.move_node(document, container)?;
        let mut originating = Properties::new();
        originating.insert(PropertyKey::OriginatingUser, Value::from(privilege.principal()));
        originating.insert(
            PropertyKey::OriginatingCreated,
            node.property(&PropertyKey::Created)
                .cloned()
                .unwrap_or_else(|| Value::Timestamp(OffsetDateTime::now_utc())),
        );
        if let Some(parent) = original_parent {
            store.add_child(parent.parent, document)?;
            originating.insert(PropertyKey::OriginatingLocation, Value::Node(parent.parent));
        }
        store.add_aspect(document, Aspect::RecordOriginatingDetails, originating)?;
        self.stamp_record(store, document, privilege)?;
        store.remove_aspect(document, &Aspect::Versionable)?;
        store.remove_aspect(document, &Aspect::RecordableVersionable)?;
        store.remove_property(document, &PropertyKey::RecordableVersionPolicy)?;

        if let Some(previous) = latest_record {
            let mut properties = Properties::new();
            properties.insert(
                PropertyKey::RecordVersionLabel,
                Value::from(self.settings.final_version_label.as_str()),
            );
            properties.insert(
                PropertyKey::RecordVersionDescription,
                Value::from(self.settings.final_version_description.as_str()),
            );
            properties.insert(PropertyKey::VersionedNode, Value::Node(document));
            store.add_aspect(document, Aspect::VersionRecord, properties)?;
            store.create_assoc(document, previous, AssocType::Versions)?;
            tracing::info!("declared {document} as final version record after {previous}");
        } else {
            tracing::info!("declared {document} as record");
        }
        Ok(document)
    }

    /// Loads a record for a caller allowed to view records.
    ///
    /// # Errors
    /// `NotFound` for a missing node, `Validation` when it is not a record, `AccessDenied`
    /// without the view capability.
    pub fn view_record<S: RepositoryStore>(
        &self,
        store: &S,
        record: NodeRef,
        privilege: &Privilege,
    ) -> Result<Node, KernelError> {
        let node = store.require_node(record)?;
        if !node.has_aspect(&Aspect::Record) {
            return Err(KernelError::Validation(format!("{record} is not a record")));
        }
        self.authorize(privilege, Capability::ViewRecords, &node)?;
        Ok(node)
    }

    /// # Errors
    /// `NotFound` for a missing version, `InvariantViolation` when its record pointer dangles.
    pub fn get_version_record<S: RepositoryStore>(
        &self,
        store: &S,
        version_ref: VersionRef,
    ) -> Result<Option<NodeRef>, KernelError> {
        let version = self.require_version(store, version_ref)?;
        match version.record {
            Some(record) if !store.exists(record)? => Err(KernelError::InvariantViolation(format!(
                "version {} of {} points at missing record {record}",
                version.label, version.document
            ))),
            record => Ok(record),
        }
    }

    /// # Errors
    /// `NotFound` for a missing version.
    pub fn is_recorded_version<S: RepositoryStore>(
        &self,
        store: &S,
        version_ref: VersionRef,
    ) -> Result<bool, KernelError> {
        Ok(self.require_version(store, version_ref)?.record.is_some())
    }

    /// # Errors
    /// `NotFound` for a missing version.
    pub fn is_recorded_version_destroyed<S: RepositoryStore>(
        &self,
        store: &S,
        version_ref: VersionRef,
    ) -> Result<bool, KernelError> {
        Ok(self.require_version(store, version_ref)?.destroyed)
    }

    /// # Errors
    /// `NotFound` for a missing document.
    pub fn is_current_version_recorded<S: RepositoryStore>(
        &self,
        store: &S,
        document: NodeRef,
    ) -> Result<bool, KernelError> {
        if !store.exists(document)? {
            return Err(KernelError::NotFound(format!("node {document}")));
        }
        Ok(store
            .current_version(document)?
            .is_some_and(|head| head.record.is_some()))
    }

    /// # Errors
    /// Storage failures.
    pub fn get_recorded_version<S: RepositoryStore>(
        &self,
        store: &S,
        record: NodeRef,
    ) -> Result<Option<Version>, KernelError> {
        store.find_version_by_record(record)
    }

    fn require_version<S: RepositoryStore>(
        &self,
        store: &S,
        version_ref: VersionRef,
    ) -> Result<Version, KernelError> {
        store
            .get_version(version_ref)?
            .ok_or_else(|| KernelError::NotFound(format!("version {version_ref}")))
    }
}
