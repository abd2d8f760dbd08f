use std::collections::BTreeSet;
use std::fmt::Display;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use records_kernel_core::{
    Aspect, AssocType, ChildAssoc, FrozenState, KernelError, NewVersion, Node, NodeRef, NodeStore,
    PeerAssoc, Properties, PropertyKey, Savepoints, TypeTag, Value, Version, VersionHistory,
    VersionLabel, VersionRef, VersionStore, VersionType,
};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS nodes (
  node_ref TEXT PRIMARY KEY,
  type_tag TEXT NOT NULL CHECK (type_tag IN ('object','folder','content','link','file_plan','unfiled_record_container','record_folder')),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS node_aspects (
  node_ref TEXT NOT NULL,
  aspect TEXT NOT NULL,
  PRIMARY KEY (node_ref, aspect),
  FOREIGN KEY (node_ref) REFERENCES nodes(node_ref) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS node_properties (
  node_ref TEXT NOT NULL,
  property_key TEXT NOT NULL,
  value_json TEXT NOT NULL,
  PRIMARY KEY (node_ref, property_key),
  FOREIGN KEY (node_ref) REFERENCES nodes(node_ref) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS child_assocs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  parent_ref TEXT NOT NULL,
  child_ref TEXT NOT NULL,
  is_primary INTEGER NOT NULL CHECK (is_primary IN (0, 1)),
  UNIQUE(parent_ref, child_ref),
  FOREIGN KEY (parent_ref) REFERENCES nodes(node_ref) ON DELETE CASCADE,
  FOREIGN KEY (child_ref) REFERENCES nodes(node_ref) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS peer_assocs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  source_ref TEXT NOT NULL,
  target_ref TEXT NOT NULL,
  assoc_type TEXT NOT NULL,
  created_at TEXT NOT NULL,
  UNIQUE(source_ref, target_ref, assoc_type),
  FOREIGN KEY (source_ref) REFERENCES nodes(node_ref) ON DELETE CASCADE,
  FOREIGN KEY (target_ref) REFERENCES nodes(node_ref) ON DELETE CASCADE
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_child_assocs_primary ON child_assocs(child_ref) WHERE is_primary = 1;
CREATE INDEX IF NOT EXISTS idx_child_assocs_parent ON child_assocs(parent_ref);
CREATE INDEX IF NOT EXISTS idx_nodes_type ON nodes(type_tag);
CREATE INDEX IF NOT EXISTS idx_peer_assocs_source ON peer_assocs(source_ref, assoc_type);
CREATE INDEX IF NOT EXISTS idx_peer_assocs_target ON peer_assocs(target_ref, assoc_type);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS versions (
  version_ref TEXT PRIMARY KEY,
  document_ref TEXT NOT NULL,
  seq INTEGER NOT NULL CHECK (seq >= 1),
  version_label TEXT NOT NULL,
  version_type TEXT NOT NULL CHECK (version_type IN ('major','minor')),
  description TEXT,
  created_at TEXT NOT NULL,
  frozen_json TEXT NOT NULL,
  recorded INTEGER NOT NULL DEFAULT 0 CHECK (recorded IN (0, 1)),
  record_ref TEXT,
  destroyed INTEGER NOT NULL DEFAULT 0 CHECK (destroyed IN (0, 1)),
  CHECK (destroyed = 0 OR record_ref IS NULL),
  UNIQUE(document_ref, seq),
  UNIQUE(document_ref, version_label)
);

CREATE TABLE IF NOT EXISTS version_records (
  record_ref TEXT PRIMARY KEY,
  version_ref TEXT NOT NULL UNIQUE,
  FOREIGN KEY (version_ref) REFERENCES versions(version_ref) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_versions_document ON versions(document_ref, seq);
";

const VERSION_COLUMNS: &str = "version_ref, document_ref, seq, version_label, version_type, \
     description, created_at, frozen_json, recorded, record_ref, destroyed";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    /// Version pointers whose reverse index row is missing or points elsewhere.
    pub record_index_mismatches: Vec<String>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed repository store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 {
            self.apply_migration_2()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&self) -> Result<i64> {
        if !table_exists(&self.conn, "nodes")? {
            apply_migration_1(&self.conn)?;
            return Ok(1);
        }

        // Tables exist without migration rows; adopt whatever shape is already there.
        record_schema_version(&self.conn, 1)?;
        if table_exists(&self.conn, "versions")? {
            record_schema_version(&self.conn, 2)?;
            return Ok(2);
        }
        Ok(1)
    }

    fn apply_migration_2(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration v2 transaction")?;
        tx.execute_batch(MIGRATION_002_SQL).context("failed to create version history tables")?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![2_i64, now_rfc3339()?],
        )
        .context("failed to record migration version 2")?;
        tx.commit().context("failed to commit migration v2")?;
        Ok(())
    }

    /// Run `operation` inside one immediate transaction. Commits on `Ok`, rolls back on `Err`.
    ///
    /// # Errors
    /// Returns the operation's error, or an error when the transaction cannot start or commit.
    pub fn transaction<T, F>(&mut self, operation: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteTxn<'_>) -> Result<T>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start transaction")?;
        let mut txn = SqliteTxn { tx };
        let value = operation(&mut txn)?;
        txn.tx.commit().context("failed to commit transaction")?;
        Ok(value)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        Ok(())
    }

    /// Run quick-check, foreign-key-check, record index, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        let record_index_mismatches = if table_exists(&self.conn, "versions")? {
            self.record_index_mismatches()?
        } else {
            Vec::new()
        };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            record_index_mismatches,
            schema_status,
        })
    }

    fn record_index_mismatches(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT v.version_ref
                 FROM versions v
                 LEFT JOIN version_records r ON r.version_ref = v.version_ref
                 WHERE (v.record_ref IS NULL AND r.record_ref IS NOT NULL)
                    OR (v.record_ref IS NOT NULL AND (r.record_ref IS NULL OR r.record_ref != v.record_ref))
                 ORDER BY v.version_ref",
            )
            .context("failed to prepare record index probe")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut mismatches = Vec::new();
        for row in rows {
            mismatches.push(row?);
        }
        Ok(mismatches)
    }
}

/// Open store transaction implementing the repository collaborator traits.
pub struct SqliteTxn<'conn> {
    tx: Transaction<'conn>,
}

struct VersionRow {
    version_ref: String,
    document_ref: String,
    seq: i64,
    version_label: String,
    version_type: String,
    description: Option<String>,
    created_at: String,
    frozen_json: String,
    recorded: bool,
    record_ref: Option<String>,
    destroyed: bool,
}

impl VersionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            version_ref: row.get(0)?,
            document_ref: row.get(1)?,
            seq: row.get(2)?,
            version_label: row.get(3)?,
            version_type: row.get(4)?,
            description: row.get(5)?,
            created_at: row.get(6)?,
            frozen_json: row.get(7)?,
            recorded: row.get(8)?,
            record_ref: row.get(9)?,
            destroyed: row.get(10)?,
        })
    }

    fn into_version(self) -> Result<Version, KernelError> {
        let version_type = VersionType::parse(&self.version_type).ok_or_else(|| {
            KernelError::Storage(format!("unknown version type: {}", self.version_type))
        })?;
        let frozen: FrozenState = serde_json::from_str(&self.frozen_json)
            .map_err(storage("failed to decode frozen state"))?;
        Ok(Version {
            version_ref: self.version_ref.parse()?,
            document: self.document_ref.parse()?,
            seq: u32::try_from(self.seq).map_err(storage("version sequence out of range"))?,
            label: self.version_label.parse::<VersionLabel>()?,
            version_type,
            description: self.description,
            created_at: parse_rfc3339(&self.created_at)?,
            frozen,
            recorded: self.recorded,
            record: self.record_ref.map(|raw| raw.parse()).transpose()?,
            destroyed: self.destroyed,
        })
    }
}

impl SqliteTxn<'_> {
    fn ensure_exists(&self, node: NodeRef) -> Result<(), KernelError> {
        if self.exists(node)? {
            Ok(())
        } else {
            Err(KernelError::NotFound(format!("node {node}")))
        }
    }

    fn query_strings(
        &self,
        sql: &str,
        param: &str,
        context: &'static str,
    ) -> Result<Vec<String>, KernelError> {
        let mut stmt = self.tx.prepare_cached(sql).map_err(storage(context))?;
        let rows = stmt
            .query_map(params![param], |row| row.get::<_, String>(0))
            .map_err(storage(context))?;
        let mut values = Vec::new();
        for row in rows {
            values.push(row.map_err(storage(context))?);
        }
        Ok(values)
    }

    fn query_child_assocs(
        &self,
        sql: &str,
        node: NodeRef,
        context: &'static str,
    ) -> Result<Vec<ChildAssoc>, KernelError> {
        let mut stmt = self.tx.prepare_cached(sql).map_err(storage(context))?;
        let rows = stmt
            .query_map(params![node.to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, bool>(2)?))
            })
            .map_err(storage(context))?;
        let mut assocs = Vec::new();
        for row in rows {
            let (parent, child, is_primary) = row.map_err(storage(context))?;
            assocs.push(ChildAssoc {
                parent: parent.parse()?,
                child: child.parse()?,
                is_primary,
            });
        }
        Ok(assocs)
    }

    fn query_peer_assocs(
        &self,
        sql: &str,
        node: NodeRef,
        assoc_type: &AssocType,
        context: &'static str,
    ) -> Result<Vec<PeerAssoc>, KernelError> {
        let mut stmt = self.tx.prepare_cached(sql).map_err(storage(context))?;
        let rows = stmt
            .query_map(params![node.to_string(), assoc_type.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(storage(context))?;
        let mut assocs = Vec::new();
        for row in rows {
            let (source, target) = row.map_err(storage(context))?;
            assocs.push(PeerAssoc {
                source: source.parse()?,
                target: target.parse()?,
                assoc_type: assoc_type.clone(),
            });
        }
        Ok(assocs)
    }

    fn load_aspects(&self, node: NodeRef) -> Result<BTreeSet<Aspect>, KernelError> {
        self.query_strings(
            "SELECT aspect FROM node_aspects WHERE node_ref = ?1 ORDER BY aspect",
            &node.to_string(),
            "failed to load node aspects",
        )?
        .into_iter()
        .map(|raw| {
            Aspect::parse(&raw).ok_or_else(|| KernelError::Storage(format!("unknown aspect: {raw}")))
        })
        .collect()
    }

    fn load_properties(&self, node: NodeRef) -> Result<Properties, KernelError> {
        let context = "failed to load node properties";
        let mut stmt = self
            .tx
            .prepare_cached(
                "SELECT property_key, value_json FROM node_properties WHERE node_ref = ?1",
            )
            .map_err(storage(context))?;
        let rows = stmt
            .query_map(params![node.to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(storage(context))?;
        let mut properties = Properties::new();
        for row in rows {
            let (raw_key, value_json) = row.map_err(storage(context))?;
            let key = PropertyKey::parse(&raw_key)
                .ok_or_else(|| KernelError::Storage(format!("unknown property key: {raw_key}")))?;
            properties.insert(key, decode_value(&value_json)?);
        }
        Ok(properties)
    }

    fn query_versions(&self, sql: &str, param: &str) -> Result<Vec<Version>, KernelError> {
        let context = "failed to load versions";
        let mut stmt = self.tx.prepare_cached(sql).map_err(storage(context))?;
        let rows = stmt
            .query_map(params![param], VersionRow::from_row)
            .map_err(storage(context))?;
        let mut versions = Vec::new();
        for row in rows {
            versions.push(row.map_err(storage(context))?.into_version()?);
        }
        Ok(versions)
    }
}

impl NodeStore for SqliteTxn<'_> {
    fn create_node(
        &mut self,
        parent: Option<NodeRef>,
        type_tag: TypeTag,
        aspects: &[Aspect],
        properties: Properties,
    ) -> Result<NodeRef, KernelError> {
        if let Some(parent) = parent {
            self.ensure_exists(parent)?;
        }
        let node = NodeRef::new();
        self.tx
            .execute(
                "INSERT INTO nodes(node_ref, type_tag, created_at) VALUES (?1, ?2, ?3)",
                params![node.to_string(), type_tag.as_str(), now_rfc3339()?],
            )
            .map_err(storage("failed to insert node"))?;
        for aspect in aspects {
            self.tx
                .execute(
                    "INSERT OR IGNORE INTO node_aspects(node_ref, aspect) VALUES (?1, ?2)",
                    params![node.to_string(), aspect.as_str()],
                )
                .map_err(storage("failed to insert node aspect"))?;
        }
        self.add_properties(node, properties)?;
        if let Some(parent) = parent {
            self.tx
                .execute(
                    "INSERT INTO child_assocs(parent_ref, child_ref, is_primary) VALUES (?1, ?2, 1)",
                    params![parent.to_string(), node.to_string()],
                )
                .map_err(storage("failed to insert primary child association"))?;
        }
        Ok(node)
    }

    fn exists(&self, node: NodeRef) -> Result<bool, KernelError> {
        let exists = self
            .tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM nodes WHERE node_ref = ?1)",
                params![node.to_string()],
                |row| row.get::<_, i64>(0),
            )
            .map_err(storage("failed to check node existence"))?;
        Ok(exists == 1)
    }

    fn get_node(&self, node: NodeRef) -> Result<Option<Node>, KernelError> {
        let raw_type: Option<String> = self
            .tx
            .query_row(
                "SELECT type_tag FROM nodes WHERE node_ref = ?1",
                params![node.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage("failed to load node"))?;
        let Some(raw_type) = raw_type else {
            return Ok(None);
        };
        let type_tag = TypeTag::parse(&raw_type)
            .ok_or_else(|| KernelError::Storage(format!("unknown type tag: {raw_type}")))?;
        Ok(Some(Node {
            node_ref: node,
            type_tag,
            aspects: self.load_aspects(node)?,
            properties: self.load_properties(node)?,
        }))
    }

    fn get_property(&self, node: NodeRef, key: &PropertyKey) -> Result<Option<Value>, KernelError> {
        let value_json: Option<String> = self
            .tx
            .query_row(
                "SELECT value_json FROM node_properties WHERE node_ref = ?1 AND property_key = ?2",
                params![node.to_string(), key.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage("failed to load node property"))?;
        value_json.as_deref().map(decode_value).transpose()
    }

    fn set_property(
        &mut self,
        node: NodeRef,
        key: PropertyKey,
        value: Value,
    ) -> Result<(), KernelError> {
        self.ensure_exists(node)?;
        let value_json =
            serde_json::to_string(&value).map_err(storage("failed to encode property value"))?;
        self.tx
            .execute(
                "INSERT INTO node_properties(node_ref, property_key, value_json) VALUES (?1, ?2, ?3)
                 ON CONFLICT(node_ref, property_key) DO UPDATE SET value_json = excluded.value_json",
                params![node.to_string(), key.as_str(), value_json],
            )
            .map_err(storage("failed to write node property"))?;
        Ok(())
    }

    fn remove_property(&mut self, node: NodeRef, key: &PropertyKey) -> Result<(), KernelError> {
        self.tx
            .execute(
                "DELETE FROM node_properties WHERE node_ref = ?1 AND property_key = ?2",
                params![node.to_string(), key.as_str()],
            )
            .map_err(storage("failed to remove node property"))?;
        Ok(())
    }

    fn has_aspect(&self, node: NodeRef, aspect: &Aspect) -> Result<bool, KernelError> {
        let present = self
            .tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM node_aspects WHERE node_ref = ?1 AND aspect = ?2)",
                params![node.to_string(), aspect.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .map_err(storage("failed to check node aspect"))?;
        Ok(present == 1)
    }

    fn add_aspect(
        &mut self,
        node: NodeRef,
        aspect: Aspect,
        properties: Properties,
    ) -> Result<(), KernelError> {
        self.ensure_exists(node)?;
        self.tx
            .execute(
                "INSERT OR IGNORE INTO node_aspects(node_ref, aspect) VALUES (?1, ?2)",
                params![node.to_string(), aspect.as_str()],
            )
            .map_err(storage("failed to add node aspect"))?;
        self.add_properties(node, properties)
    }

    fn remove_aspect(&mut self, node: NodeRef, aspect: &Aspect) -> Result<(), KernelError> {
        self.tx
            .execute(
                "DELETE FROM node_aspects WHERE node_ref = ?1 AND aspect = ?2",
                params![node.to_string(), aspect.as_str()],
            )
            .map_err(storage("failed to remove node aspect"))?;
        Ok(())
    }

    fn primary_parent(&self, node: NodeRef) -> Result<Option<ChildAssoc>, KernelError> {
        Ok(self
            .query_child_assocs(
                "SELECT parent_ref, child_ref, is_primary FROM child_assocs
                 WHERE child_ref = ?1 AND is_primary = 1",
                node,
                "failed to load primary parent",
            )?
            .into_iter()
            .next())
    }

    fn child_assocs(&self, parent: NodeRef) -> Result<Vec<ChildAssoc>, KernelError> {
        self.query_child_assocs(
            "SELECT parent_ref, child_ref, is_primary FROM child_assocs
             WHERE parent_ref = ?1 ORDER BY id",
            parent,
            "failed to load child associations",
        )
    }

    fn add_child(&mut self, parent: NodeRef, child: NodeRef) -> Result<ChildAssoc, KernelError> {
        self.ensure_exists(parent)?;
        self.ensure_exists(child)?;
        self.tx
            .execute(
                "INSERT OR IGNORE INTO child_assocs(parent_ref, child_ref, is_primary) VALUES (?1, ?2, 0)",
                params![parent.to_string(), child.to_string()],
            )
            .map_err(storage("failed to add secondary child association"))?;
        let is_primary = self
            .primary_parent(child)?
            .is_some_and(|assoc| assoc.parent == parent);
        Ok(ChildAssoc {
            parent,
            child,
            is_primary,
        })
    }

    fn move_node(&mut self, node: NodeRef, new_parent: NodeRef) -> Result<(), KernelError> {
        self.ensure_exists(node)?;
        self.ensure_exists(new_parent)?;
        if self.primary_descendants(node)?.contains(&new_parent) {
            return Err(KernelError::Validation(format!(
                "cannot move {node} beneath its own descendant {new_parent}"
            )));
        }
        self.tx
            .execute(
                "DELETE FROM child_assocs WHERE child_ref = ?1 AND (is_primary = 1 OR parent_ref = ?2)",
                params![node.to_string(), new_parent.to_string()],
            )
            .map_err(storage("failed to detach node from its primary parent"))?;
        self.tx
            .execute(
                "INSERT INTO child_assocs(parent_ref, child_ref, is_primary) VALUES (?1, ?2, 1)",
                params![new_parent.to_string(), node.to_string()],
            )
            .map_err(storage("failed to attach node to its new parent"))?;
        Ok(())
    }

    fn create_assoc(
        &mut self,
        source: NodeRef,
        target: NodeRef,
        assoc_type: AssocType,
    ) -> Result<PeerAssoc, KernelError> {
        self.ensure_exists(source)?;
        self.ensure_exists(target)?;
        let inserted = self
            .tx
            .execute(
                "INSERT OR IGNORE INTO peer_assocs(source_ref, target_ref, assoc_type, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![source.to_string(), target.to_string(), assoc_type.as_str(), now_rfc3339()?],
            )
            .map_err(storage("failed to create peer association"))?;
        if inserted == 0 {
            return Err(KernelError::InvariantViolation(format!(
                "{assoc_type} association {source} -> {target} already exists"
            )));
        }
        Ok(PeerAssoc {
            source,
            target,
            assoc_type,
        })
    }

    fn remove_assoc(
        &mut self,
        source: NodeRef,
        target: NodeRef,
        assoc_type: &AssocType,
    ) -> Result<bool, KernelError> {
        let removed = self
            .tx
            .execute(
                "DELETE FROM peer_assocs WHERE source_ref = ?1 AND target_ref = ?2 AND assoc_type = ?3",
                params![source.to_string(), target.to_string(), assoc_type.as_str()],
            )
            .map_err(storage("failed to remove peer association"))?;
        Ok(removed > 0)
    }

    fn target_assocs(
        &self,
        source: NodeRef,
        assoc_type: &AssocType,
    ) -> Result<Vec<PeerAssoc>, KernelError> {
        self.query_peer_assocs(
            "SELECT source_ref, target_ref FROM peer_assocs
             WHERE source_ref = ?1 AND assoc_type = ?2 ORDER BY id",
            source,
            assoc_type,
            "failed to load outgoing associations",
        )
    }

    fn source_assocs(
        &self,
        target: NodeRef,
        assoc_type: &AssocType,
    ) -> Result<Vec<PeerAssoc>, KernelError> {
        self.query_peer_assocs(
            "SELECT source_ref, target_ref FROM peer_assocs
             WHERE target_ref = ?1 AND assoc_type = ?2 ORDER BY id",
            target,
            assoc_type,
            "failed to load incoming associations",
        )
    }

    fn nodes_of_type(&self, type_tag: TypeTag) -> Result<Vec<NodeRef>, KernelError> {
        let context = "failed to list nodes by type";
        let mut stmt = self
            .tx
            .prepare_cached("SELECT node_ref, type_tag FROM nodes ORDER BY created_at, node_ref")
            .map_err(storage(context))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(storage(context))?;
        let mut nodes = Vec::new();
        for row in rows {
            let (raw_ref, raw_type) = row.map_err(storage(context))?;
            let matches = TypeTag::parse(&raw_type).is_some_and(|tag| tag.is_subtype_of(type_tag));
            if matches {
                nodes.push(raw_ref.parse()?);
            }
        }
        Ok(nodes)
    }

    fn primary_descendants(&self, node: NodeRef) -> Result<Vec<NodeRef>, KernelError> {
        let mut ordered = Vec::new();
        let mut pending = vec![node];
        while let Some(current) = pending.pop() {
            ordered.push(current);
            let children = self.query_child_assocs(
                "SELECT parent_ref, child_ref, is_primary FROM child_assocs
                 WHERE parent_ref = ?1 AND is_primary = 1 ORDER BY id DESC",
                current,
                "failed to load primary children",
            )?;
            pending.extend(children.into_iter().map(|assoc| assoc.child));
        }
        Ok(ordered)
    }

    fn delete_node(&mut self, node: NodeRef) -> Result<Vec<NodeRef>, KernelError> {
        self.ensure_exists(node)?;
        let doomed = self.primary_descendants(node)?;
        for victim in doomed.iter().rev() {
            self.tx
                .execute("DELETE FROM nodes WHERE node_ref = ?1", params![victim.to_string()])
                .map_err(storage("failed to delete node"))?;
        }
        Ok(doomed)
    }
}

impl VersionStore for SqliteTxn<'_> {
    fn version_history(&self, document: NodeRef) -> Result<Option<VersionHistory>, KernelError> {
        let versions = self.query_versions(
            &format!("SELECT {VERSION_COLUMNS} FROM versions WHERE document_ref = ?1 ORDER BY seq"),
            &document.to_string(),
        )?;
        if versions.is_empty() {
            return Ok(None);
        }
        VersionHistory::new(document, versions).map(Some)
    }

    fn get_version(&self, version_ref: VersionRef) -> Result<Option<Version>, KernelError> {
        Ok(self
            .query_versions(
                &format!("SELECT {VERSION_COLUMNS} FROM versions WHERE version_ref = ?1"),
                &version_ref.to_string(),
            )?
            .into_iter()
            .next())
    }

    fn append_version(&mut self, new_version: NewVersion) -> Result<Version, KernelError> {
        let head = self.current_version(new_version.document)?;
        if let Some(head) = &head {
            if new_version.label <= head.label {
                return Err(KernelError::Validation(format!(
                    "version label {} does not follow head {} of {}",
                    new_version.label, head.label, new_version.document
                )));
            }
        }
        let version = Version {
            version_ref: VersionRef::new(),
            document: new_version.document,
            seq: head.map_or(1, |head| head.seq + 1),
            label: new_version.label,
            version_type: new_version.version_type,
            description: new_version.description,
            created_at: new_version.created_at,
            frozen: new_version.frozen,
            recorded: false,
            record: None,
            destroyed: false,
        };
        let frozen_json = serde_json::to_string(&version.frozen)
            .map_err(storage("failed to encode frozen state"))?;
        self.tx
            .execute(
                "INSERT INTO versions(
                    version_ref, document_ref, seq, version_label, version_type,
                    description, created_at, frozen_json, recorded, record_ref, destroyed
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, NULL, 0)",
                params![
                    version.version_ref.to_string(),
                    version.document.to_string(),
                    i64::from(version.seq),
                    version.label.to_string(),
                    version.version_type.as_str(),
                    version.description,
                    rfc3339(version.created_at)?,
                    frozen_json,
                ],
            )
            .map_err(storage("failed to insert version"))?;
        Ok(version)
    }

    fn set_version_record(
        &mut self,
        version_ref: VersionRef,
        record: NodeRef,
    ) -> Result<(), KernelError> {
        let version = self
            .get_version(version_ref)?
            .ok_or_else(|| KernelError::NotFound(format!("version {version_ref}")))?;
        if version.destroyed {
            return Err(KernelError::InvariantViolation(format!(
                "version {} of {} is destroyed and cannot be recorded",
                version.label, version.document
            )));
        }
        if let Some(existing) = version.record {
            return Err(KernelError::InvariantViolation(format!(
                "version {} of {} is already recorded as {existing}",
                version.label, version.document
            )));
        }
        if self.find_version_by_record(record)?.is_some() {
            return Err(KernelError::InvariantViolation(format!(
                "record {record} already belongs to another version"
            )));
        }
        self.tx
            .execute(
                "UPDATE versions SET recorded = 1, record_ref = ?2 WHERE version_ref = ?1",
                params![version_ref.to_string(), record.to_string()],
            )
            .map_err(storage("failed to set version record"))?;
        self.tx
            .execute(
                "INSERT INTO version_records(record_ref, version_ref) VALUES (?1, ?2)",
                params![record.to_string(), version_ref.to_string()],
            )
            .map_err(storage("failed to index version record"))?;
        Ok(())
    }

    fn mark_version_destroyed(&mut self, version_ref: VersionRef) -> Result<(), KernelError> {
        let updated = self
            .tx
            .execute(
                "UPDATE versions SET destroyed = 1, record_ref = NULL WHERE version_ref = ?1",
                params![version_ref.to_string()],
            )
            .map_err(storage("failed to mark version destroyed"))?;
        if updated == 0 {
            return Err(KernelError::NotFound(format!("version {version_ref}")));
        }
        self.tx
            .execute(
                "DELETE FROM version_records WHERE version_ref = ?1",
                params![version_ref.to_string()],
            )
            .map_err(storage("failed to clear version record index"))?;
        Ok(())
    }

    fn find_version_by_record(&self, record: NodeRef) -> Result<Option<Version>, KernelError> {
        Ok(self
            .query_versions(
                &format!(
                    "SELECT {VERSION_COLUMNS} FROM versions WHERE version_ref =
                     (SELECT version_ref FROM version_records WHERE record_ref = ?1)"
                ),
                &record.to_string(),
            )?
            .into_iter()
            .next())
    }

    fn delete_version_history(&mut self, document: NodeRef) -> Result<usize, KernelError> {
        self.tx
            .execute(
                "DELETE FROM versions WHERE document_ref = ?1",
                params![document.to_string()],
            )
            .map_err(storage("failed to delete version history"))
    }
}

impl Savepoints for SqliteTxn<'_> {
    fn savepoint(&mut self, name: &'static str) -> Result<(), KernelError> {
        self.tx
            .execute_batch(&format!("SAVEPOINT {name}"))
            .map_err(storage("failed to open savepoint"))
    }

    fn release_savepoint(&mut self, name: &'static str) -> Result<(), KernelError> {
        self.tx
            .execute_batch(&format!("RELEASE SAVEPOINT {name}"))
            .map_err(storage("failed to release savepoint"))
    }

    fn rollback_to_savepoint(&mut self, name: &'static str) -> Result<(), KernelError> {
        self.tx
            .execute_batch(&format!("ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name}"))
            .map_err(storage("failed to roll back savepoint"))
    }
}

fn storage<E: Display>(context: &'static str) -> impl FnOnce(E) -> KernelError {
    move |err| KernelError::Storage(format!("{context}: {err}"))
}

fn decode_value(value_json: &str) -> Result<Value, KernelError> {
    serde_json::from_str(value_json).map_err(storage("failed to decode property value"))
}

fn apply_migration_1(conn: &Connection) -> Result<()> {
    conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration 001")?;
    record_schema_version(conn, 1)?;
    Ok(())
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "nodes")? {
        return Ok((0, false));
    }

    if table_exists(conn, "versions")? {
        return Ok((2, true));
    }

    Ok((1, true))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now_rfc3339()?],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String, KernelError> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String, KernelError> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(storage("failed to format RFC3339 timestamp"))
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime, KernelError> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| KernelError::Storage(format!("invalid RFC3339 timestamp {value}: {err}")))
}
