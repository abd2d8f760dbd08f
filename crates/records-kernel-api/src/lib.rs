use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use records_kernel_core::{
    Aspect, Node, NodeRef, NodeStore, Privilege, Properties, PropertyKey, RecordableVersionPolicy,
    TypeTag, Value, Version, VersionCreationParams, VersionHistory, VersionRef, VersionStore,
    VersionType,
};
use records_kernel_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore, SqliteTxn};
use records_kernel_versions::{
    ensure_mutable, record_chain, DestroyOutcome, RecordableVersionService, VersionOutcome,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

mod config;

pub use config::KernelConfig;

pub const API_CONTRACT_VERSION: &str = "api.v1";

const UNFILED_CONTAINER_NAME: &str = "Unfiled Records";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateFilePlanRequest {
    pub site_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilePlanResult {
    pub file_plan: NodeRef,
    pub unfiled_container: NodeRef,
    pub site_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateFolderRequest {
    pub parent: Option<NodeRef>,
    pub name: String,
    /// Creates a record folder, which must live under a file plan or another record folder.
    pub record_folder: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateDocumentRequest {
    pub parent: NodeRef,
    pub name: String,
    pub content: String,
    pub title: Option<String>,
    pub versionable: bool,
    pub policy: Option<RecordableVersionPolicy>,
    pub file_plan: Option<NodeRef>,
    pub auto_version: Option<bool>,
    pub principal: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateDocumentRequest {
    pub document: NodeRef,
    pub content: String,
    pub principal: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DocumentResult {
    pub document: Node,
    pub version: Option<VersionOutcome>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DocumentView {
    pub document: Node,
    pub versions: Vec<Version>,
    pub current_version_recorded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateVersionRequest {
    pub document: NodeRef,
    pub version_type: Option<VersionType>,
    pub description: Option<String>,
    pub recordable: Option<bool>,
    pub file_plan: Option<NodeRef>,
    pub principal: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeclareRecordRequest {
    pub document: NodeRef,
    pub file_plan: Option<NodeRef>,
    pub force_new_version: bool,
    pub principal: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeclareRecordResult {
    pub document: NodeRef,
    pub file_plan: NodeRef,
    /// `None` when the current version was already recorded.
    pub record: Option<NodeRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DestroyRecordResult {
    pub record: NodeRef,
    pub outcome: DestroyOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteResult {
    pub deleted: Vec<NodeRef>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RecordView {
    pub record: Node,
    pub version: Option<Version>,
    pub chain: Vec<NodeRef>,
    pub filed: bool,
    pub metadata_stub: bool,
}

fn privilege_of(principal: Option<&str>) -> Privilege {
    principal.map_or(Privilege::System, Privilege::caller)
}

fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    format!("sha256:{digest:x}")
}

#[derive(Debug)]
pub struct RecordsKernelApi {
    db_path: PathBuf,
    config: KernelConfig,
    service: RecordableVersionService,
}

impl RecordsKernelApi {
    #[must_use]
    pub fn new(db_path: PathBuf, config: KernelConfig) -> Self {
        let service =
            RecordableVersionService::new(config.capability_gate(), config.versioning_settings());
        Self {
            db_path,
            config,
            service,
        }
    }

    #[must_use]
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    /// Runs `operation` inside one store transaction on a migrated database.
    fn run<T>(
        &self,
        operation: impl FnOnce(&RecordableVersionService, &mut SqliteTxn<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.transaction(|tx| operation(&self.service, tx))
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when the integrity probes cannot run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.integrity_check()
    }

    /// # Errors
    /// Returns an error when the online backup fails.
    pub fn backup(&self, out_file: &Path) -> Result<()> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.backup_database(out_file)
    }

    /// Replace the database with a backup, then migrate it to the latest schema.
    ///
    /// # Errors
    /// Returns an error when the backup is missing or the restore fails.
    pub fn restore(&self, in_file: &Path) -> Result<SchemaStatus> {
        let mut store = self.open_store()?;
        store.restore_database(in_file)?;
        store.schema_status()
    }

    /// Create a file plan for `site_id` together with its unfiled record container.
    ///
    /// # Errors
    /// Returns an error when a file plan for the site already exists.
    pub fn create_file_plan(&self, input: CreateFilePlanRequest) -> Result<FilePlanResult> {
        if input.site_id.trim().is_empty() {
            return Err(anyhow!("site_id cannot be empty"));
        }
        self.run(|_, tx| {
            for existing in tx.nodes_of_type(TypeTag::FilePlan)? {
                let site = tx.get_property(existing, &PropertyKey::SiteId)?;
                if site.as_ref().and_then(Value::as_text) == Some(input.site_id.as_str()) {
                    return Err(anyhow!(
                        "site {} already has file plan {existing}",
                        input.site_id
                    ));
                }
            }
            let file_plan = tx.create_node(
                None,
                TypeTag::FilePlan,
                &[],
                Properties::from([
                    (PropertyKey::Name, Value::from(input.name.as_str())),
                    (PropertyKey::SiteId, Value::from(input.site_id.as_str())),
                ]),
            )?;
            let unfiled_container = tx.create_node(
                Some(file_plan),
                TypeTag::UnfiledRecordContainer,
                &[],
                Properties::from([(PropertyKey::Name, Value::from(UNFILED_CONTAINER_NAME))]),
            )?;
            tracing::info!("created file plan {file_plan} for site {}", input.site_id);
            Ok(FilePlanResult {
                file_plan,
                unfiled_container,
                site_id: input.site_id,
            })
        })
    }

    /// # Errors
    /// Returns an error for a missing parent or a record folder outside a file plan.
    pub fn create_folder(&self, input: CreateFolderRequest) -> Result<Node> {
        self.run(|_, tx| {
            let type_tag = if input.record_folder {
                let parent = input
                    .parent
                    .ok_or_else(|| anyhow!("a record folder needs a parent"))?;
                let parent_type = tx.require_node(parent)?.type_tag;
                if !matches!(parent_type, TypeTag::FilePlan | TypeTag::RecordFolder) {
                    return Err(anyhow!(
                        "record folders belong under a file plan or record folder, not a {}",
                        parent_type.as_str()
                    ));
                }
                TypeTag::RecordFolder
            } else {
                TypeTag::Folder
            };
            let folder = tx.create_node(
                input.parent,
                type_tag,
                &[],
                Properties::from([(PropertyKey::Name, Value::from(input.name.as_str()))]),
            )?;
            Ok(tx.require_node(folder)?)
        })
    }

    /// Create a document. A versionable document immediately receives its first version, which
    /// is recorded when its policy asks for it.
    ///
    /// # Errors
    /// Returns an error when the parent is missing or the first version cannot be recorded.
    pub fn create_document(&self, input: CreateDocumentRequest) -> Result<DocumentResult> {
        let privilege = privilege_of(input.principal.as_deref());
        self.run(|service, tx| {
            let now = OffsetDateTime::now_utc();
            let principal = privilege.principal();
            let mut aspects = vec![Aspect::Auditable, Aspect::Ownable];
            let mut properties = Properties::from([
                (PropertyKey::Name, Value::from(input.name.as_str())),
                (PropertyKey::Content, Value::from(input.content.as_str())),
                (PropertyKey::ContentHash, Value::from(content_hash(&input.content))),
                (PropertyKey::Created, Value::from(now)),
                (PropertyKey::Creator, Value::from(principal)),
                (PropertyKey::Modified, Value::from(now)),
                (PropertyKey::Modifier, Value::from(principal)),
                (PropertyKey::Owner, Value::from(principal)),
            ]);
            if let Some(title) = &input.title {
                aspects.push(Aspect::Titled);
                properties.insert(PropertyKey::Title, Value::from(title.as_str()));
            }
            if let Some(auto_version) = input.auto_version {
                properties.insert(PropertyKey::AutoVersion, Value::from(auto_version));
            }
            if let Some(file_plan) = input.file_plan {
                properties.insert(PropertyKey::FilePlan, Value::Node(file_plan));
            }
            if let Some(policy) = input.policy {
                aspects.push(Aspect::RecordableVersionable);
                properties
                    .insert(PropertyKey::RecordableVersionPolicy, Value::from(policy.as_str()));
            }
            if input.versionable {
                aspects.push(Aspect::Versionable);
            }

            let document =
                tx.create_node(Some(input.parent), TypeTag::Content, &aspects, properties)?;
            tracing::info!("created document {document} in {}", input.parent);
            let version = if input.versionable {
                Some(service.create_version(
                    tx,
                    document,
                    &VersionCreationParams::default(),
                    &privilege,
                )?)
            } else {
                None
            };
            Ok(DocumentResult {
                document: tx.require_node(document)?,
                version,
            })
        })
    }

    /// Replace document content, then let the auto-versioning hook decide on a new version.
    ///
    /// # Errors
    /// Returns an error for a missing document or a failing auto-version.
    pub fn update_document(&self, input: UpdateDocumentRequest) -> Result<DocumentResult> {
        let privilege = privilege_of(input.principal.as_deref());
        self.run(|service, tx| {
            let node = tx.require_node(input.document)?;
            if node.type_tag != TypeTag::Content {
                return Err(anyhow!(
                    "{} is a {} not a document",
                    input.document,
                    node.type_tag.as_str()
                ));
            }
            ensure_mutable(&node)?;
            tx.add_properties(
                input.document,
                Properties::from([
                    (PropertyKey::Content, Value::from(input.content.as_str())),
                    (PropertyKey::ContentHash, Value::from(content_hash(&input.content))),
                    (PropertyKey::Modified, Value::from(OffsetDateTime::now_utc())),
                    (PropertyKey::Modifier, Value::from(privilege.principal())),
                ]),
            )?;
            let version = service.on_content_updated(tx, input.document, &privilege)?;
            Ok(DocumentResult {
                document: tx.require_node(input.document)?,
                version,
            })
        })
    }

    /// # Errors
    /// Returns an error for a missing document or a denied policy change.
    pub fn set_policy(
        &self,
        document: NodeRef,
        policy: Option<RecordableVersionPolicy>,
        principal: Option<&str>,
    ) -> Result<Node> {
        let privilege = privilege_of(principal);
        self.run(|service, tx| {
            service.set_recordable_version_policy(tx, document, policy, &privilege)?;
            Ok(tx.require_node(document)?)
        })
    }

    /// # Errors
    /// Returns an error for a missing document or a version of another document.
    pub fn revert(
        &self,
        document: NodeRef,
        version_ref: VersionRef,
        principal: Option<&str>,
    ) -> Result<Node> {
        let privilege = privilege_of(principal);
        self.run(|service, tx| {
            service.revert(tx, document, version_ref, &privilege)?;
            Ok(tx.require_node(document)?)
        })
    }

    /// Delete a node with its primary subtree, reconciling the record chain of every version
    /// record removed on the way.
    ///
    /// # Errors
    /// Returns an error for a missing node or a denied record deletion.
    pub fn delete_node(&self, node: NodeRef, principal: Option<&str>) -> Result<DeleteResult> {
        let privilege = privilege_of(principal);
        self.run(|service, tx| {
            let deleted = service.delete_node(tx, node, &privilege)?;
            Ok(DeleteResult { deleted })
        })
    }

    /// # Errors
    /// Returns an error for a missing document.
    pub fn show_document(&self, document: NodeRef) -> Result<DocumentView> {
        self.run(|service, tx| {
            let node = tx.require_node(document)?;
            let versions = tx
                .version_history(document)?
                .map(VersionHistory::into_versions)
                .unwrap_or_default();
            Ok(DocumentView {
                document: node,
                versions,
                current_version_recorded: service.is_current_version_recorded(&*tx, document)?,
            })
        })
    }

    /// # Errors
    /// Returns an error when version creation or recording fails; nothing is written then.
    pub fn create_version(&self, input: CreateVersionRequest) -> Result<VersionOutcome> {
        let privilege = privilege_of(input.principal.as_deref());
        self.run(|service, tx| {
            let params = VersionCreationParams {
                version_type: input.version_type,
                description: input.description,
                recordable: input.recordable,
                file_plan: input.file_plan,
            };
            Ok(service.create_version(tx, input.document, &params, &privilege)?)
        })
    }

    /// Versions oldest first; empty for documents that were never versioned.
    ///
    /// # Errors
    /// Returns an error for a missing document.
    pub fn version_history(&self, document: NodeRef) -> Result<Vec<Version>> {
        self.run(|service, tx| {
            tx.require_node(document)?;
            Ok(service
                .version_history(&*tx, document)?
                .map(VersionHistory::into_versions)
                .unwrap_or_default())
        })
    }

    /// Record the current version of a document.
    ///
    /// # Errors
    /// Returns an error when no file plan resolves or recording is denied.
    pub fn declare_record(&self, input: DeclareRecordRequest) -> Result<DeclareRecordResult> {
        let privilege = privilege_of(input.principal.as_deref());
        self.run(|service, tx| {
            let node = tx.require_node(input.document)?;
            let file_plan = service.resolve_file_plan(&*tx, &node, input.file_plan)?;
            let record = service.create_record_from_latest_version(
                tx,
                file_plan,
                input.document,
                input.force_new_version,
                &privilege,
            )?;
            Ok(DeclareRecordResult {
                document: input.document,
                file_plan,
                record,
            })
        })
    }

    /// Declare the document itself as a record.
    ///
    /// # Errors
    /// Returns an error when no file plan resolves or the document already is a record.
    pub fn declare_document_as_record(
        &self,
        document: NodeRef,
        file_plan: Option<NodeRef>,
        principal: Option<&str>,
    ) -> Result<RecordView> {
        let privilege = privilege_of(principal);
        self.run(|service, tx| {
            let node = tx.require_node(document)?;
            let file_plan = service.resolve_file_plan(&*tx, &node, file_plan)?;
            let record = service.declare_document_as_record(tx, file_plan, document, &privilege)?;
            record_view(service, tx, record, &privilege)
        })
    }

    /// # Errors
    /// Returns an error when `record` is not a live record or destruction is denied.
    pub fn destroy_record(
        &self,
        record: NodeRef,
        keep_metadata: bool,
        principal: Option<&str>,
    ) -> Result<DestroyRecordResult> {
        let privilege = privilege_of(principal);
        self.run(|service, tx| {
            let outcome = service.destroy_record(tx, record, keep_metadata, &privilege)?;
            Ok(DestroyRecordResult { record, outcome })
        })
    }

    /// # Errors
    /// Returns an error for a missing record, a denied view or a corrupt chain.
    pub fn record_chain(&self, record: NodeRef, principal: Option<&str>) -> Result<Vec<NodeRef>> {
        let privilege = privilege_of(principal);
        self.run(|service, tx| {
            service.view_record(&*tx, record, &privilege)?;
            Ok(record_chain(&*tx, record)?)
        })
    }

    /// # Errors
    /// Returns an error for a missing record or a denied view.
    pub fn show_record(&self, record: NodeRef, principal: Option<&str>) -> Result<RecordView> {
        let privilege = privilege_of(principal);
        self.run(|service, tx| record_view(service, tx, record, &privilege))
    }

    /// # Errors
    /// Returns an error when `folder` is not a record folder or filing is denied.
    pub fn file_record(
        &self,
        record: NodeRef,
        folder: NodeRef,
        principal: Option<&str>,
    ) -> Result<RecordView> {
        let privilege = privilege_of(principal);
        self.run(|service, tx| {
            service.file_record(tx, record, folder, &privilege)?;
            record_view(service, tx, record, &privilege)
        })
    }
}

fn record_view(
    service: &RecordableVersionService,
    tx: &SqliteTxn<'_>,
    record: NodeRef,
    privilege: &Privilege,
) -> Result<RecordView> {
    let node = service.view_record(tx, record, privilege)?;
    Ok(RecordView {
        version: service.get_recorded_version(tx, record)?,
        chain: record_chain(tx, record)?,
        filed: service.is_filed(tx, record)?,
        metadata_stub: service.is_metadata_stub(tx, record)?,
        record: node,
    })
}
