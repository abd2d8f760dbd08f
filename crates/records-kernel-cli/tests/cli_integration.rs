use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_rk<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_rk"))
        .args(args)
        .env_remove("RK_LOG")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute rk binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_rk(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "rk command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn pointer_str<'a>(value: &'a Value, pointer: &str) -> &'a str {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string at `{pointer}` in payload: {value}"))
}

fn string_array(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing array field `{key}` in payload: {value}"))
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect()
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

struct Seeded {
    file_plan: String,
    folder: String,
    document: String,
    first_record: String,
}

fn seed_recorded_document(db: &Path, policy: &str) -> Seeded {
    let plan = run_json(["--db", path_str(db), "fileplan", "create", "--site", "rm"]);
    let file_plan = as_str(&plan, "file_plan").to_string();

    let folder = run_json(["--db", path_str(db), "folder", "create", "--name", "Board"]);
    let folder = as_str(&folder, "node_ref").to_string();

    let created = run_json([
        "--db",
        path_str(db),
        "doc",
        "create",
        "--parent",
        &folder,
        "--name",
        "minutes.txt",
        "--content",
        "first draft",
        "--versionable",
        "--policy",
        policy,
    ]);
    let document = pointer_str(&created, "/document/node_ref").to_string();
    let first_record = created
        .pointer("/version/record")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_default();

    Seeded {
        file_plan,
        folder,
        document,
        first_record,
    }
}

#[test]
fn db_commands_cover_migrate_integrity_backup_restore() {
    let sandbox = unique_temp_dir("records-kernel-cli-db");
    let db_a = sandbox.join("a.sqlite3");
    let db_b = sandbox.join("b.sqlite3");
    let backup_file = sandbox.join("backup.sqlite3");

    let schema_before = run_json(["--db", path_str(&db_a), "db", "schema-version"]);
    assert_eq!(as_i64(&schema_before, "current_version"), 0);
    assert_eq!(as_str(&schema_before, "contract_version"), "cli.v1");

    let dry_run = run_json(["--db", path_str(&db_a), "db", "migrate", "--dry-run"]);
    assert_eq!(
        dry_run
            .get("would_apply_versions")
            .and_then(Value::as_array)
            .map(std::vec::Vec::len)
            .unwrap_or_default(),
        2
    );

    let migrate = run_json(["--db", path_str(&db_a), "db", "migrate"]);
    assert_eq!(as_i64(&migrate, "after_version"), 2);

    let seeded = seed_recorded_document(&db_a, "all");
    assert!(!seeded.first_record.is_empty());

    let integrity = run_json(["--db", path_str(&db_a), "db", "integrity-check"]);
    assert!(integrity.get("quick_check_ok").and_then(Value::as_bool).unwrap_or(false));
    assert!(string_array(&integrity, "record_index_mismatches").is_empty());

    let backup =
        run_json(["--db", path_str(&db_a), "db", "backup", "--out", path_str(&backup_file)]);
    assert_eq!(as_str(&backup, "status"), "ok");
    assert!(Path::new(as_str(&backup, "backup_path")).exists());

    let restore =
        run_json(["--db", path_str(&db_b), "db", "restore", "--in", path_str(&backup_file)]);
    assert_eq!(as_i64(&restore, "current_version"), 2);

    let shown =
        run_json(["--db", path_str(&db_b), "record", "show", "--record", &seeded.first_record]);
    assert_eq!(pointer_str(&shown, "/version/label"), "1.0");

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn recorded_versions_chain_and_reconcile_through_the_cli() {
    let sandbox = unique_temp_dir("records-kernel-cli-chain");
    let db = sandbox.join("kernel.sqlite3");
    let seeded = seed_recorded_document(&db, "all");

    let second = run_json([
        "--db",
        path_str(&db),
        "doc",
        "update",
        "--doc",
        &seeded.document,
        "--content",
        "second draft",
    ]);
    let second_record = pointer_str(&second, "/version/record").to_string();

    let third = run_json([
        "--db",
        path_str(&db),
        "version",
        "create",
        "--doc",
        &seeded.document,
        "--description",
        "board approved",
    ]);
    assert_eq!(pointer_str(&third, "/version/label"), "1.2");
    let third_record = pointer_str(&third, "/record").to_string();

    let chain = run_json(["--db", path_str(&db), "record", "chain", "--record", &third_record]);
    assert_eq!(
        string_array(&chain, "chain"),
        vec![third_record.clone(), second_record.clone(), seeded.first_record.clone()]
    );

    let deleted =
        run_json(["--db", path_str(&db), "record", "delete", "--record", &second_record]);
    assert_eq!(string_array(&deleted, "deleted"), vec![second_record.clone()]);

    let chain = run_json(["--db", path_str(&db), "record", "chain", "--record", &third_record]);
    assert_eq!(
        string_array(&chain, "chain"),
        vec![third_record.clone(), seeded.first_record.clone()]
    );

    let history =
        run_json(["--db", path_str(&db), "version", "history", "--doc", &seeded.document]);
    let versions = history
        .get("versions")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("history should list versions: {history}"));
    assert_eq!(versions.len(), 3);
    assert_eq!(versions[1].get("destroyed").and_then(Value::as_bool), Some(true));
    assert!(versions[1].get("record").is_some_and(Value::is_null));

    let destroyed = run_json([
        "--db",
        path_str(&db),
        "record",
        "destroy",
        "--record",
        &seeded.first_record,
        "--keep-metadata",
    ]);
    assert_eq!(as_str(&destroyed, "outcome"), "metadata_stub");

    let stub =
        run_json(["--db", path_str(&db), "record", "show", "--record", &seeded.first_record]);
    assert_eq!(stub.get("metadata_stub").and_then(Value::as_bool), Some(true));

    let declared = run_json([
        "--db",
        path_str(&db),
        "record",
        "declare",
        "--doc",
        &seeded.document,
        "--file-plan",
        &seeded.file_plan,
    ]);
    assert!(declared.get("record").is_some_and(Value::is_null));

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn policy_and_declaration_commands_follow_the_document_lifecycle() {
    let sandbox = unique_temp_dir("records-kernel-cli-declare");
    let db = sandbox.join("kernel.sqlite3");
    let seeded = seed_recorded_document(&db, "none");
    assert!(seeded.first_record.is_empty());

    let policy = run_json([
        "--db",
        path_str(&db),
        "doc",
        "set-policy",
        "--doc",
        &seeded.document,
        "--policy",
        "major-only",
    ]);
    assert_eq!(
        pointer_str(&policy, "/properties/recordable_version_policy/value"),
        "MAJOR_ONLY"
    );

    let minor = run_json([
        "--db",
        path_str(&db),
        "version",
        "create",
        "--doc",
        &seeded.document,
        "--type",
        "minor",
    ]);
    assert!(minor.get("record").is_some_and(Value::is_null));

    let major = run_json([
        "--db",
        path_str(&db),
        "version",
        "create",
        "--doc",
        &seeded.document,
        "--type",
        "major",
    ]);
    assert_eq!(pointer_str(&major, "/version/label"), "2.0");
    let major_record = pointer_str(&major, "/record").to_string();

    let declared = run_json([
        "--db",
        path_str(&db),
        "record",
        "declare-document",
        "--doc",
        &seeded.document,
    ]);
    assert_eq!(
        pointer_str(&declared, "/record/properties/record_version_label/value"),
        "final"
    );
    assert_eq!(
        string_array(&declared, "chain"),
        vec![seeded.document.clone(), major_record.clone()]
    );

    let edit_after_declaration = run_rk([
        "--db",
        path_str(&db),
        "doc",
        "update",
        "--doc",
        &seeded.document,
        "--content",
        "rewritten record",
    ]);
    assert!(!edit_after_declaration.status.success());
    let stderr = String::from_utf8_lossy(&edit_after_declaration.stderr);
    assert!(stderr.contains("cannot be modified"), "unexpected stderr: {stderr}");
    let chain = run_json(["--db", path_str(&db), "record", "chain", "--record", &seeded.document]);
    assert_eq!(string_array(&chain, "chain"), vec![seeded.document.clone(), major_record.clone()]);

    let record_folder = run_json([
        "--db",
        path_str(&db),
        "folder",
        "create",
        "--name",
        "2026",
        "--parent",
        &seeded.file_plan,
        "--record-folder",
    ]);
    let record_folder = as_str(&record_folder, "node_ref").to_string();
    let filed = run_json([
        "--db",
        path_str(&db),
        "record",
        "file",
        "--record",
        &major_record,
        "--folder",
        &record_folder,
    ]);
    assert_eq!(filed.get("filed").and_then(Value::as_bool), Some(true));

    let misfiled = run_rk([
        "--db",
        path_str(&db),
        "record",
        "file",
        "--record",
        &seeded.document,
        "--folder",
        &seeded.folder,
    ]);
    assert!(!misfiled.status.success());

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn callers_are_gated_by_configured_roles() {
    let sandbox = unique_temp_dir("records-kernel-cli-roles");
    let db = sandbox.join("kernel.sqlite3");
    let config = sandbox.join("kernel.yaml");
    fs::write(&config, "role_assignments:\n  carol: records_manager\n  dave: user\n")
        .unwrap_or_else(|err| panic!("failed to write config {}: {err}", config.display()));
    let seeded = seed_recorded_document(&db, "all");

    let viewed = run_json([
        "--db",
        path_str(&db),
        "--config",
        path_str(&config),
        "--as",
        "dave",
        "record",
        "show",
        "--record",
        &seeded.first_record,
    ]);
    assert_eq!(pointer_str(&viewed, "/record/node_ref"), seeded.first_record);
    let unknown_viewer = run_rk([
        "--db",
        path_str(&db),
        "--config",
        path_str(&config),
        "--as",
        "erin",
        "record",
        "chain",
        "--record",
        &seeded.first_record,
    ]);
    assert!(!unknown_viewer.status.success());

    let denied = run_rk([
        "--db",
        path_str(&db),
        "--config",
        path_str(&config),
        "--as",
        "dave",
        "record",
        "destroy",
        "--record",
        &seeded.first_record,
    ]);
    assert!(!denied.status.success());
    let stderr = String::from_utf8_lossy(&denied.stderr);
    assert!(stderr.contains("denied"), "unexpected stderr: {stderr}");

    let destroyed = run_json([
        "--db",
        path_str(&db),
        "--config",
        path_str(&config),
        "--as",
        "carol",
        "record",
        "destroy",
        "--record",
        &seeded.first_record,
    ]);
    assert_eq!(as_str(&destroyed, "outcome"), "deleted");

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn malformed_inputs_are_rejected() {
    let sandbox = unique_temp_dir("records-kernel-cli-invalid");
    let db = sandbox.join("kernel.sqlite3");
    let config = sandbox.join("kernel.yaml");
    fs::write(&config, "unknown_setting: true\n")
        .unwrap_or_else(|err| panic!("failed to write config {}: {err}", config.display()));

    let bad_ref = run_rk(["--db", path_str(&db), "record", "chain", "--record", "not-a-ulid"]);
    assert!(!bad_ref.status.success());
    let stderr = String::from_utf8_lossy(&bad_ref.stderr);
    assert!(stderr.contains("invalid ULID"), "unexpected stderr: {stderr}");

    let bad_config = run_rk([
        "--db",
        path_str(&db),
        "--config",
        path_str(&config),
        "db",
        "schema-version",
    ]);
    assert!(!bad_config.status.success());

    let _ = fs::remove_dir_all(&sandbox);
}
