//! SQLite persistence for the Jottask task and notification store.
//!
//! The schema is built by an ordered list of idempotent migrations. Every
//! operation takes the caller's [`Identity`] and enforces the row policy from
//! `jottask-core`: owners see and change only their own rows, the service
//! identity sees everything.

use std::error::Error as StdError;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use jottask_core::{CoreError, Identity, Operation, Table};
use rusqlite::types::Type;
use rusqlite::{params, Connection, DatabaseName, Row, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};

mod actions;
mod contacts;
mod crm;
mod email;
mod migrations;
mod projects;
mod referrals;
mod seed;
mod tasks;
mod users;

pub use actions::{ActionResolution, CrmSyncClaim, ExpirySweep};
pub use contacts::BackfillSummary;
pub use migrations::LATEST_SCHEMA_VERSION;
pub use referrals::ReferralOutcome;
pub use seed::SeedReport;

use migrations::{Migration, CREATE_SCHEMA_MIGRATIONS_SQL, MIGRATIONS};

#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationInfo {
    pub version: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub pending: Vec<MigrationInfo>,
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
    /// Tables present in the database that no row policy covers.
    pub tables_without_policy: Vec<String>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed store and configure required runtime pragmas.
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
        let current_version = current_schema_version(&self.conn)?;
        let pending = MIGRATIONS
            .iter()
            .filter(|migration| migration.version > current_version)
            .map(Migration::info)
            .collect::<Vec<_>>();

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions: pending.iter().map(|migration| migration.version).collect(),
            pending,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// Each migration runs in its own write transaction and records its version in
    /// the same transaction. Re-running on an up-to-date database is a no-op.
    ///
    /// # Errors
    /// Returns an error when the database is newer than this build or any step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; this build supports up to {LATEST_SCHEMA_VERSION}"
            ));
        }

        for migration in MIGRATIONS.iter().filter(|migration| migration.version > version) {
            let tx = self.write_tx()?;
            // Another connection may have applied it while we waited for the lock.
            if migration_recorded(&tx, migration.version)? {
                continue;
            }
            (migration.apply)(&tx).with_context(|| {
                format!("migration {} ({}) failed", migration.version, migration.name)
            })?;
            record_schema_version(&tx, migration)?;
            tx.commit().with_context(|| {
                format!("failed to commit migration {}", migration.version)
            })?;
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "applied schema migration"
            );
        }

        Ok(())
    }

    /// Re-run the body of an already applied migration.
    ///
    /// Every migration is guarded, so this repairs a partially applied step without
    /// changing a healthy schema or duplicating rows.
    ///
    /// # Errors
    /// Returns an error for an unknown or not yet applied version, or when the body fails.
    pub fn reapply_migration(&mut self, version: i64) -> Result<MigrationInfo> {
        let migration = MIGRATIONS
            .iter()
            .find(|migration| migration.version == version)
            .ok_or_else(|| anyhow!("unknown migration version {version}"))?;

        let tx = self.write_tx()?;
        if !migration_recorded(&tx, version)? {
            return Err(anyhow!("migration {version} has not been applied; run migrate instead"));
        }
        (migration.apply)(&tx).with_context(|| {
            format!("reapplying migration {} ({}) failed", migration.version, migration.name)
        })?;
        tx.commit()
            .with_context(|| format!("failed to commit reapplied migration {version}"))?;

        tracing::info!(version, name = migration.name, "reapplied schema migration");
        Ok(migration.info())
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

    /// Run quick-check, foreign-key-check, policy coverage and schema status checks.
    ///
    /// # Errors
    /// Returns an error when any integrity check query fails.
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

        let mut stmt = self
            .conn
            .prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name <> 'schema_migrations'
                 ORDER BY name",
            )
            .context("failed to list tables")?;
        let tables = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut tables_without_policy = Vec::new();
        for table in tables {
            let table = table?;
            if !Table::ALL.iter().any(|known| known.as_str() == table) {
                tables_without_policy.push(table);
            }
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            tables_without_policy,
            schema_status,
        })
    }

    fn write_tx(&mut self) -> Result<Transaction<'_>> {
        self.conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin write transaction")
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn migration_recorded(conn: &Connection, version: i64) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE version = ?1)",
            params![version],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check migration version {version}"))?;
    Ok(exists == 1)
}

fn record_schema_version(conn: &Connection, migration: &Migration) -> Result<()> {
    let now = rfc3339(now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, name, applied_at) VALUES (?1, ?2, ?3)",
        params![migration.version, migration.name, now],
    )
    .with_context(|| format!("failed to record migration version {}", migration.version))?;
    Ok(())
}

pub(crate) fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

pub(crate) fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

/// Current UTC time truncated to whole seconds, so stored timestamps sort as text.
pub(crate) fn now_utc() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_nanosecond(0).unwrap_or(now)
}

pub(crate) fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .to_offset(UtcOffset::UTC)
        .replace_nanosecond(0)
        .context("failed to truncate timestamp")?
        .format(&Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: Into<Box<dyn StdError + Send + Sync>>,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

pub(crate) fn parse_column<T, E>(
    row: &Row<'_>,
    idx: usize,
    parse: impl FnOnce(&str) -> Result<T, E>,
) -> rusqlite::Result<T>
where
    E: Into<Box<dyn StdError + Send + Sync>>,
{
    let raw: String = row.get(idx)?;
    parse(&raw).map_err(|err| conversion_error(idx, err))
}

pub(crate) fn parse_optional_column<T, E>(
    row: &Row<'_>,
    idx: usize,
    parse: impl FnOnce(&str) -> Result<T, E>,
) -> rusqlite::Result<Option<T>>
where
    E: Into<Box<dyn StdError + Send + Sync>>,
{
    let raw: Option<String> = row.get(idx)?;
    raw.map(|value| parse(&value))
        .transpose()
        .map_err(|err| conversion_error(idx, err))
}

pub(crate) fn id_column<T: FromStr<Err = CoreError>>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    parse_column(row, idx, str::parse::<T>)
}

pub(crate) fn optional_id_column<T: FromStr<Err = CoreError>>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    parse_optional_column(row, idx, str::parse::<T>)
}

pub(crate) fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    parse_column(row, idx, |raw| OffsetDateTime::parse(raw, &Rfc3339))
}

pub(crate) fn optional_timestamp_column(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<OffsetDateTime>> {
    parse_optional_column(row, idx, |raw| OffsetDateTime::parse(raw, &Rfc3339))
}

pub(crate) fn enum_column<T>(
    row: &Row<'_>,
    idx: usize,
    what: &'static str,
    parse: fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    parse_column(row, idx, |raw| parse(raw).ok_or_else(|| format!("unknown {what}: {raw}")))
}

/// Reject owners outright for operations only the backend performs.
pub(crate) fn require_service(
    identity: Identity,
    table: Table,
    operation: Operation,
) -> Result<()> {
    if identity.is_service() {
        Ok(())
    } else {
        Err(CoreError::AccessDenied {
            table: table.as_str(),
            operation: operation.as_str(),
        }
        .into())
    }
}

pub(crate) fn not_found(entity: &'static str, key: impl std::fmt::Display) -> anyhow::Error {
    CoreError::not_found(entity, key).into()
}


#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use jottask_core::{NewTask, UserId};
    use ulid::Ulid;

    use super::test_support::{migrated_store, mk_user};
    use super::*;

    fn schema_snapshot(store: &SqliteStore) -> Result<Vec<(String, String)>> {
        let mut stmt = store.conn.prepare(
            "SELECT name, COALESCE(sql, '') FROM sqlite_master
             WHERE name NOT LIKE 'sqlite_%' ORDER BY type, name",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut snapshot = Vec::new();
        for row in rows {
            snapshot.push(row?);
        }
        Ok(snapshot)
    }

    fn row_counts(store: &SqliteStore) -> Result<BTreeMap<String, i64>> {
        let mut counts = BTreeMap::new();
        for table in Table::ALL {
            let count: i64 = store.conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", table.as_str()),
                [],
                |row| row.get(0),
            )?;
            counts.insert(table.as_str().to_string(), count);
        }
        Ok(counts)
    }

    #[test]
    fn fresh_database_reports_every_migration_pending() -> Result<()> {
        let store = SqliteStore::open(Path::new(":memory:"))?;
        let status = store.schema_status()?;
        assert_eq!(status.current_version, 0);
        assert_eq!(status.target_version, LATEST_SCHEMA_VERSION);
        assert_eq!(status.pending_versions, (1..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>());
        assert_eq!(status.pending[0].name, "create_core_tables");
        Ok(())
    }

    #[test]
    fn migrate_twice_is_a_no_op() -> Result<()> {
        let mut store = migrated_store()?;
        let before = schema_snapshot(&store)?;
        store.migrate()?;
        assert_eq!(schema_snapshot(&store)?, before);

        let status = store.schema_status()?;
        assert_eq!(status.current_version, LATEST_SCHEMA_VERSION);
        assert!(status.pending_versions.is_empty());
        Ok(())
    }

    #[test]
    fn reapplying_every_migration_preserves_schema_and_rows() -> Result<()> {
        let mut store = migrated_store()?;
        let user = mk_user(&mut store, "owner@example.com")?;
        let mut task = NewTask::new(user.id, "Call Jane");
        task.client_email = Some("Jane@Example.com".to_string());
        store.create_task(Identity::Service, &task)?;
        store.backfill_contacts(Identity::Service)?;

        let schema_before = schema_snapshot(&store)?;
        let rows_before = row_counts(&store)?;

        for version in 1..=LATEST_SCHEMA_VERSION {
            let info = store.reapply_migration(version)?;
            assert_eq!(info.version, version);
        }

        assert_eq!(schema_snapshot(&store)?, schema_before);
        assert_eq!(row_counts(&store)?, rows_before);
        Ok(())
    }

    #[test]
    fn reapply_rejects_unapplied_and_unknown_versions() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.schema_status()?;
        assert!(store.reapply_migration(1).is_err());

        store.migrate()?;
        assert!(store.reapply_migration(LATEST_SCHEMA_VERSION + 1).is_err());
        Ok(())
    }

    #[test]
    fn migrate_rejects_database_from_newer_build() -> Result<()> {
        let mut store = migrated_store()?;
        store.conn.execute(
            "INSERT INTO schema_migrations(version, name, applied_at) VALUES (?1, 'future', ?2)",
            params![LATEST_SCHEMA_VERSION + 1, "2026-01-01T00:00:00Z"],
        )?;
        assert!(store.migrate().is_err());
        Ok(())
    }

    #[test]
    fn sqlite_constraints_enforce_checks_and_foreign_keys() -> Result<()> {
        let store = migrated_store()?;

        let check_result = store.conn.execute(
            "INSERT INTO users(id, email, created_at) VALUES (?1, ?2, ?3)",
            params![UserId::new().to_string(), "Upper@Example.com", "2026-01-01T00:00:00Z"],
        );
        assert!(check_result.is_err());

        let fk_result = store.conn.execute(
            "INSERT INTO tasks(id, user_id, title, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                Ulid::new().to_string(),
                UserId::new().to_string(),
                "orphan",
                "2026-01-01T00:00:00Z"
            ],
        );
        assert!(fk_result.is_err());

        let status_result = store.conn.execute(
            "INSERT INTO pending_actions(id, token, action_type, action_data, status, created_at, expires_at)
             VALUES (?1, ?2, 'send_email', '{}', 'processing', ?3, ?3)",
            params![Ulid::new().to_string(), "tok", "2026-01-01T00:00:00Z"],
        );
        assert!(status_result.is_err());

        let provider_result = store.conn.execute(
            "INSERT INTO crm_connections(id, user_id, provider, display_name, created_at, updated_at)
             VALUES (?1, ?2, 'pipedrive', 'x', ?3, ?3)",
            params![Ulid::new().to_string(), UserId::new().to_string(), "2026-01-01T00:00:00Z"],
        );
        assert!(provider_result.is_err());

        Ok(())
    }

    #[test]
    fn backup_and_restore_database_round_trip() -> Result<()> {
        let mut source = migrated_store()?;
        let user = mk_user(&mut source, "backup@example.com")?;

        let backup_file =
            std::env::temp_dir().join(format!("jottask-backup-{}.sqlite3", Ulid::new()));
        source.backup_database(&backup_file)?;

        let mut target = SqliteStore::open(Path::new(":memory:"))?;
        target.restore_database(&backup_file)?;
        let restored = target.get_user(Identity::Service, user.id)?;
        assert_eq!(restored.email, "backup@example.com");

        fs::remove_file(&backup_file).with_context(|| {
            format!("failed to cleanup temp backup file {}", backup_file.display())
        })?;

        Ok(())
    }

    #[test]
    fn integrity_check_reports_clean_database() -> Result<()> {
        let store = migrated_store()?;

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        assert!(report.tables_without_policy.is_empty());
        assert_eq!(report.schema_status.current_version, LATEST_SCHEMA_VERSION);

        Ok(())
    }

    #[test]
    fn integrity_check_flags_tables_without_policy() -> Result<()> {
        let store = migrated_store()?;
        store.conn.execute_batch("CREATE TABLE scratch (id INTEGER PRIMARY KEY);")?;

        let report = store.integrity_check()?;
        assert_eq!(report.tables_without_policy, vec!["scratch".to_string()]);
        Ok(())
    }
}
