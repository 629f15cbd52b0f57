use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;

fn unique_temp_db_path() -> PathBuf {
    std::env::temp_dir().join(format!("jottask-cli-{}.sqlite3", ulid::Ulid::new()))
}

fn run_jt<I, S>(db: &Path, args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_jt"))
        .arg("--db")
        .arg(db)
        .args(args)
        .env_remove("JOTTASK_SHARED_IMAP_PASSWORD")
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute jt binary: {err}"))
}

fn run_json<I, S>(db: &Path, args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_jt(db, args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "jt command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn array_len(value: &Value, key: &str) -> usize {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or_else(|| panic!("missing array field `{key}` in payload: {value}"))
}

fn create_user(db: &Path, email: &str) -> String {
    let user = run_json(db, ["user", "create", "--email", email]);
    as_str(&user, "id").to_string()
}

fn cleanup(paths: &[&Path]) {
    for path in paths {
        let _ = fs::remove_file(path);
    }
}

#[test]
fn db_commands_report_schema_and_integrity() {
    let db = unique_temp_db_path();

    let planned = run_json(&db, ["db", "migrate", "--dry-run"]);
    assert_eq!(planned["contract_version"], "cli.v1");
    assert_eq!(planned["dry_run"], true);
    assert_eq!(planned["current_version"], 0);

    let applied = run_json(&db, ["db", "migrate"]);
    assert_eq!(applied["up_to_date"], true);

    let status = run_json(&db, ["db", "schema-version"]);
    assert_eq!(status["up_to_date"], true);
    assert_eq!(status["current_version"], status["target_version"]);

    let report = run_json(&db, ["db", "integrity-check"]);
    assert_eq!(report["quick_check_ok"], true);
    assert_eq!(array_len(&report, "tables_without_policy"), 0);

    cleanup(&[&db]);
}

#[test]
fn owner_manages_tasks_and_sees_digest() {
    let db = unique_temp_db_path();
    let user_id = create_user(&db, "owner@example.com");

    let task = run_json(
        &db,
        [
            "--as-user",
            &user_id,
            "task",
            "add",
            "--user",
            &user_id,
            "--title",
            "Quote for Jane",
            "--due-date",
            "2026-04-09",
            "--client-email",
            "Jane@Example.com",
        ],
    );
    assert_eq!(as_str(&task, "status"), "pending");
    assert_eq!(as_str(&task, "client_email"), "jane@example.com");
    let task_id = as_str(&task, "id").to_string();

    let digest = run_json(
        &db,
        ["--as-user", &user_id, "task", "digest", "--user", &user_id, "--today", "2026-04-10"],
    );
    assert_eq!(array_len(&digest, "overdue"), 1);

    let done = run_json(
        &db,
        ["--as-user", &user_id, "task", "set-status", "--id", &task_id, "--status", "completed"],
    );
    assert_eq!(as_str(&done, "status"), "completed");

    let listed = run_json(
        &db,
        ["--as-user", &user_id, "task", "list", "--user", &user_id, "--status", "pending"],
    );
    assert_eq!(array_len(&listed, "tasks"), 0);

    cleanup(&[&db]);
}

#[test]
fn owner_cannot_touch_another_owners_task() {
    let db = unique_temp_db_path();
    let owner = create_user(&db, "owner@example.com");
    let intruder = create_user(&db, "intruder@example.com");

    let task = run_json(&db, ["task", "add", "--user", &owner, "--title", "Private"]);
    let task_id = as_str(&task, "id").to_string();

    let output = run_jt(&db, ["--as-user", &intruder, "task", "show", "--id", &task_id]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("not found"), "unexpected stderr: {stderr}");

    let output = run_jt(
        &db,
        ["--as-user", &intruder, "task", "add", "--user", &owner, "--title", "Sneaky"],
    );
    assert!(!output.status.success());

    cleanup(&[&db]);
}

#[test]
fn action_approval_creates_follow_up_once() {
    let db = unique_temp_db_path();
    let user_id = create_user(&db, "owner@example.com");

    let action = run_json(
        &db,
        [
            "action",
            "create",
            "--user",
            &user_id,
            "--kind",
            "update_crm",
            "--title",
            "Log call",
            "--customer-name",
            "Jane Smith",
            "--crm-notes",
            "Wants a site visit",
        ],
    );
    assert_eq!(as_str(&action, "status"), "pending");
    let token = as_str(&action, "token").to_string();
    assert_eq!(token.len(), 32);

    let resolution = run_json(&db, ["action", "approve", "--token", &token]);
    assert_eq!(resolution["action"]["status"], "approved");
    assert_eq!(resolution["follow_up_task"]["title"], "CRM Update: Jane Smith");
    assert_eq!(resolution["follow_up_task"]["category"], "crm");

    let again = run_jt(&db, ["action", "approve", "--token", &token]);
    assert!(!again.status.success());

    let synced = run_json(&db, ["action", "crm-synced", "--token", &token]);
    assert_eq!(synced["newly_synced"], true);

    let tasks = run_json(&db, ["task", "list", "--user", &user_id]);
    assert_eq!(array_len(&tasks, "tasks"), 1);

    cleanup(&[&db]);
}

#[test]
fn ingest_is_at_most_once() {
    let db = unique_temp_db_path();
    let user_id = create_user(&db, "owner@example.com");
    let args = [
        "email",
        "ingest",
        "--message-id",
        "<abc@mail.example.com>",
        "--user",
        &user_id,
        "--sender-email",
        "Jane@Example.com",
        "--subject",
        "Leaking tap",
    ];

    let first = run_json(&db, args);
    assert_eq!(as_str(&first, "outcome"), "created");
    let second = run_json(&db, args);
    assert_eq!(as_str(&second, "outcome"), "duplicate");

    let contacts = run_json(&db, ["contact", "list", "--user", &user_id]);
    assert_eq!(array_len(&contacts, "contacts"), 1);

    let processed = run_json(
        &db,
        ["email", "is-processed", "--message-id", "<abc@mail.example.com>"],
    );
    assert_eq!(processed["processed"], true);

    cleanup(&[&db]);
}

#[test]
fn seed_file_preserves_existing_values() {
    let db = unique_temp_db_path();
    let seed_path = std::env::temp_dir().join(format!("jottask-seed-{}.yaml", ulid::Ulid::new()));
    let user_id = create_user(&db, "owner@example.com");
    fs::write(
        &seed_path,
        "account_email: Owner@Example.com\n\
         ai_context: Plumber in Brisbane\n\
         email_connection:\n  provider: gmail\n  email_address: jobs@example.com\n  credential_source: shared\n",
    )
    .unwrap_or_else(|err| panic!("failed to write seed file: {err}"));

    let seed_arg = seed_path.to_string_lossy().to_string();
    let first = run_json(&db, ["seed", "--file", &seed_arg]);
    assert_eq!(as_str(&first, "mode"), "preserve");
    assert_eq!(array_len(&first, "written"), 2);

    run_json(&db, ["user", "update", "--id", &user_id, "--ai-context", "Edited"]);
    let second = run_json(&db, ["seed", "--file", &seed_arg]);
    assert_eq!(array_len(&second, "written"), 0);
    let user = run_json(&db, ["user", "show", "--id", &user_id]);
    assert_eq!(as_str(&user, "ai_context"), "Edited");

    let overwrite = run_json(&db, ["seed", "--file", &seed_arg, "--mode", "overwrite"]);
    assert_eq!(array_len(&overwrite, "written"), 2);

    let owner_attempt = run_jt(&db, ["--as-user", &user_id, "seed", "--file", &seed_arg]);
    assert!(!owner_attempt.status.success());

    cleanup(&[&db, &seed_path]);
}

#[test]
fn backup_and_restore_round_trip() {
    let db = unique_temp_db_path();
    let backup = unique_temp_db_path();
    let user_id = create_user(&db, "owner@example.com");
    let backup_arg = backup.to_string_lossy().to_string();

    let result = run_json(&db, ["db", "backup", "--out", &backup_arg]);
    assert_eq!(as_str(&result, "status"), "ok");

    run_json(&db, ["user", "delete", "--id", &user_id]);
    assert!(!run_jt(&db, ["user", "show", "--id", &user_id])
        .status
        .success());

    run_json(&db, ["db", "restore", "--in", &backup_arg]);
    let user = run_json(&db, ["user", "show", "--id", &user_id]);
    assert_eq!(as_str(&user, "email"), "owner@example.com");

    cleanup(&[&db, &backup]);
}
