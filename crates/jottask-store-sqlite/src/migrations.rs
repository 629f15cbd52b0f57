//! Ordered, idempotent schema migrations.
//!
//! Every body is guarded with `IF NOT EXISTS` or a `PRAGMA table_info` check so it
//! can be re-run against a database that already carries the change.

use anyhow::{Context, Result};
use rusqlite::Connection;

use crate::contacts::backfill_contacts_tx;
use crate::{table_has_column, MigrationInfo};

pub const LATEST_SCHEMA_VERSION: i64 = 8;

pub(crate) const CREATE_SCHEMA_MIGRATIONS_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  name TEXT NOT NULL DEFAULT '',
  applied_at TEXT NOT NULL
);
";

pub(crate) struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub apply: fn(&Connection) -> Result<()>,
}

impl Migration {
    pub(crate) fn info(&self) -> MigrationInfo {
        MigrationInfo {
            version: self.version,
            name: self.name.to_string(),
        }
    }
}

pub(crate) const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_core_tables",
        apply: create_core_tables,
    },
    Migration {
        version: 2,
        name: "create_pending_actions",
        apply: create_pending_actions,
    },
    Migration {
        version: 3,
        name: "create_contacts",
        apply: create_contacts,
    },
    Migration {
        version: 4,
        name: "extend_processed_emails",
        apply: extend_processed_emails,
    },
    Migration {
        version: 5,
        name: "backfill_contacts_from_tasks",
        apply: backfill_contacts_from_tasks,
    },
    Migration {
        version: 6,
        name: "create_crm_connections",
        apply: create_crm_connections,
    },
    Migration {
        version: 7,
        name: "create_referrals_and_support",
        apply: create_referrals_and_support,
    },
    Migration {
        version: 8,
        name: "email_connection_credentials",
        apply: email_connection_credentials,
    },
];

const CORE_TABLES_SQL: &str = "
CREATE TABLE IF NOT EXISTS users (
  id TEXT PRIMARY KEY,
  email TEXT NOT NULL UNIQUE CHECK (email <> '' AND email = lower(email)),
  full_name TEXT,
  company_name TEXT,
  timezone TEXT NOT NULL DEFAULT 'Australia/Brisbane',
  onboarding_completed INTEGER NOT NULL DEFAULT 0 CHECK (onboarding_completed IN (0, 1)),
  daily_summary_enabled INTEGER NOT NULL DEFAULT 1 CHECK (daily_summary_enabled IN (0, 1)),
  daily_summary_time TEXT NOT NULL DEFAULT '08:00:00',
  subscription_status TEXT NOT NULL DEFAULT 'trial'
    CHECK (subscription_status IN ('trial', 'active', 'past_due', 'cancelled')),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
  id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
  title TEXT NOT NULL CHECK (length(trim(title)) > 0),
  description TEXT,
  due_date TEXT,
  due_time TEXT,
  priority TEXT NOT NULL DEFAULT 'medium'
    CHECK (priority IN ('low', 'medium', 'high', 'urgent')),
  status TEXT NOT NULL DEFAULT 'pending'
    CHECK (status IN ('pending', 'completed', 'cancelled')),
  category TEXT,
  client_name TEXT,
  client_email TEXT,
  business_id TEXT,
  reminder_sent_at TEXT,
  created_at TEXT NOT NULL,
  completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_tasks_user_status ON tasks(user_id, status);
CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks(user_id, due_date, due_time);

CREATE TABLE IF NOT EXISTS projects (
  id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
  name TEXT NOT NULL CHECK (length(trim(name)) > 0),
  color TEXT NOT NULL DEFAULT '#6366F1',
  status TEXT NOT NULL DEFAULT 'active'
    CHECK (status IN ('active', 'completed', 'archived')),
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_projects_user ON projects(user_id);

CREATE TABLE IF NOT EXISTS project_items (
  id TEXT PRIMARY KEY,
  project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
  title TEXT NOT NULL CHECK (length(trim(title)) > 0),
  is_completed INTEGER NOT NULL DEFAULT 0 CHECK (is_completed IN (0, 1)),
  display_order INTEGER NOT NULL DEFAULT 0 CHECK (display_order >= 0),
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_project_items_project ON project_items(project_id, display_order);

CREATE TABLE IF NOT EXISTS email_connections (
  id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
  provider TEXT NOT NULL CHECK (provider IN ('gmail', 'outlook', 'imap')),
  email_address TEXT NOT NULL,
  imap_server TEXT,
  imap_password TEXT,
  is_active INTEGER NOT NULL DEFAULT 1 CHECK (is_active IN (0, 1)),
  last_checked_at TEXT,
  created_at TEXT NOT NULL,
  UNIQUE(user_id, email_address)
);

CREATE TABLE IF NOT EXISTS processed_emails (
  email_id TEXT PRIMARY KEY,
  processed_at TEXT NOT NULL
);
";

fn create_core_tables(conn: &Connection) -> Result<()> {
    conn
        .execute_batch(CORE_TABLES_SQL)
        .context("failed to create core tables")
}

const PENDING_ACTIONS_SQL: &str = "
CREATE TABLE IF NOT EXISTS pending_actions (
  id TEXT PRIMARY KEY,
  token TEXT NOT NULL UNIQUE,
  user_id TEXT REFERENCES users(id) ON DELETE CASCADE,
  action_type TEXT NOT NULL,
  action_data TEXT NOT NULL CHECK (json_valid(action_data)),
  status TEXT NOT NULL DEFAULT 'pending'
    CHECK (status IN ('pending', 'approved', 'rejected', 'failed', 'expired')),
  failure_reason TEXT,
  created_at TEXT NOT NULL,
  expires_at TEXT NOT NULL,
  processed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_pending_actions_token ON pending_actions(token);
CREATE INDEX IF NOT EXISTS idx_pending_actions_status_expiry ON pending_actions(status, expires_at);

CREATE TRIGGER IF NOT EXISTS trg_pending_actions_terminal_status
BEFORE UPDATE OF status ON pending_actions
WHEN OLD.status <> 'pending' AND NEW.status <> OLD.status
BEGIN
  SELECT RAISE(ABORT, 'pending action status is terminal');
END;
";

fn create_pending_actions(conn: &Connection) -> Result<()> {
    conn
        .execute_batch(PENDING_ACTIONS_SQL)
        .context("failed to create pending_actions")
}

const CONTACTS_SQL: &str = "
CREATE TABLE IF NOT EXISTS contacts (
  id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
  name TEXT,
  email TEXT,
  phone TEXT,
  company TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_contacts_user_email
  ON contacts(user_id, lower(email))
  WHERE email IS NOT NULL AND email <> '';
CREATE INDEX IF NOT EXISTS idx_contacts_user ON contacts(user_id);
";

fn create_contacts(conn: &Connection) -> Result<()> {
    conn
        .execute_batch(CONTACTS_SQL)
        .context("failed to create contacts")?;
    add_column_if_absent(
        conn,
        "tasks",
        "contact_id",
        "TEXT REFERENCES contacts(id) ON DELETE SET NULL",
    )?;
    conn.execute_batch("CREATE INDEX IF NOT EXISTS idx_tasks_contact ON tasks(contact_id);")
        .context("failed to index tasks.contact_id")
}

fn extend_processed_emails(conn: &Connection) -> Result<()> {
    add_column_if_absent(
        conn,
        "processed_emails",
        "user_id",
        "TEXT REFERENCES users(id) ON DELETE SET NULL",
    )?;
    add_column_if_absent(conn, "processed_emails", "sender_email", "TEXT")?;
    add_column_if_absent(conn, "processed_emails", "sender_name", "TEXT")?;
    add_column_if_absent(conn, "processed_emails", "subject", "TEXT")?;
    add_column_if_absent(
        conn,
        "processed_emails",
        "contact_id",
        "TEXT REFERENCES contacts(id) ON DELETE SET NULL",
    )?;
    add_column_if_absent(
        conn,
        "processed_emails",
        "task_id",
        "TEXT REFERENCES tasks(id) ON DELETE SET NULL",
    )?;
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_processed_emails_user ON processed_emails(user_id);
         CREATE INDEX IF NOT EXISTS idx_processed_emails_contact ON processed_emails(contact_id);",
    )
    .context("failed to index processed_emails")
}

fn backfill_contacts_from_tasks(conn: &Connection) -> Result<()> {
    let summary = backfill_contacts_tx(conn)?;
    tracing::info!(
        created = summary.created,
        skipped_existing = summary.skipped_existing,
        linked_tasks = summary.linked_tasks,
        "backfilled contacts from task history"
    );
    Ok(())
}

const CRM_CONNECTIONS_SQL: &str = "
CREATE TABLE IF NOT EXISTS crm_connections (
  id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
  provider TEXT NOT NULL
    CHECK (provider IN ('pipereply', 'hubspot', 'zoho', 'salesforce', 'none')),
  display_name TEXT NOT NULL,
  api_key TEXT,
  api_base_url TEXT,
  connection_status TEXT NOT NULL DEFAULT 'pending'
    CHECK (connection_status IN ('pending', 'connected', 'error', 'disconnected')),
  is_active INTEGER NOT NULL DEFAULT 1 CHECK (is_active IN (0, 1)),
  last_error TEXT,
  last_sync_at TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  UNIQUE(user_id, provider)
);
";

const CRM_SYNCED_LATCH_SQL: &str = "
CREATE TRIGGER IF NOT EXISTS trg_pending_actions_crm_synced_latch
BEFORE UPDATE OF crm_synced ON pending_actions
WHEN OLD.crm_synced = 1 AND (NEW.crm_synced IS NULL OR NEW.crm_synced <> 1)
BEGIN
  SELECT RAISE(ABORT, 'crm_synced cannot be cleared');
END;
";

fn create_crm_connections(conn: &Connection) -> Result<()> {
    conn
        .execute_batch(CRM_CONNECTIONS_SQL)
        .context("failed to create crm_connections")?;
    add_column_if_absent(
        conn,
        "pending_actions",
        "crm_synced",
        "INTEGER CHECK (crm_synced IN (0, 1))",
    )?;
    conn
        .execute_batch(CRM_SYNCED_LATCH_SQL)
        .context("failed to create crm_synced latch")
}

const REFERRALS_AND_SUPPORT_SQL: &str = "
CREATE TABLE IF NOT EXISTS referrals (
  id TEXT PRIMARY KEY,
  referrer_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
  referred_id TEXT NOT NULL UNIQUE REFERENCES users(id) ON DELETE CASCADE,
  status TEXT NOT NULL DEFAULT 'pending'
    CHECK (status IN ('pending', 'trial', 'converted', 'expired')),
  created_at TEXT NOT NULL,
  trial_started_at TEXT,
  resolved_at TEXT,
  CHECK (referrer_id <> referred_id)
);

CREATE INDEX IF NOT EXISTS idx_referrals_referrer ON referrals(referrer_id);

CREATE TABLE IF NOT EXISTS support_conversations (
  id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
  subject TEXT NOT NULL,
  status TEXT NOT NULL DEFAULT 'open',
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_support_conversations_user ON support_conversations(user_id);
";

fn create_referrals_and_support(conn: &Connection) -> Result<()> {
    conn.execute_batch(REFERRALS_AND_SUPPORT_SQL)
        .context("failed to create referrals and support_conversations")
}

fn email_connection_credentials(conn: &Connection) -> Result<()> {
    add_column_if_absent(conn, "users", "ai_context", "TEXT")?;
    add_column_if_absent(
        conn,
        "email_connections",
        "credential_source",
        "TEXT NOT NULL DEFAULT 'stored' CHECK (credential_source IN ('stored', 'shared'))",
    )
}

fn add_column_if_absent(
    conn: &Connection,
    table: &str,
    column: &str,
    definition: &str,
) -> Result<()> {
    if table_has_column(conn, table, column)? {
        return Ok(());
    }
    conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {definition};"))
        .with_context(|| format!("failed to add {table}.{column}"))
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use rusqlite::params;

    use super::*;
    use crate::test_support::migrated_store;
    use crate::SqliteStore;

    #[test]
    fn versions_are_contiguous_and_end_at_latest() {
        for (index, migration) in MIGRATIONS.iter().enumerate() {
            assert_eq!(migration.version, i64::try_from(index).unwrap_or_default() + 1);
        }
        assert_eq!(
            MIGRATIONS.last().map(|migration| migration.version),
            Some(LATEST_SCHEMA_VERSION)
        );
    }

    #[test]
    fn late_columns_exist_after_migrate() -> Result<()> {
        let store = migrated_store()?;
        for (table, column) in [
            ("tasks", "contact_id"),
            ("processed_emails", "task_id"),
            ("pending_actions", "crm_synced"),
            ("users", "ai_context"),
            ("email_connections", "credential_source"),
        ] {
            assert!(table_has_column(&store.conn, table, column)?, "{table}.{column} missing");
        }
        Ok(())
    }

    #[test]
    fn add_column_if_absent_is_idempotent() -> Result<()> {
        let store = SqliteStore::open(Path::new(":memory:"))?;
        store.conn.execute_batch("CREATE TABLE sample (id INTEGER PRIMARY KEY);")?;
        add_column_if_absent(&store.conn, "sample", "note", "TEXT")?;
        add_column_if_absent(&store.conn, "sample", "note", "TEXT")?;
        assert!(table_has_column(&store.conn, "sample", "note")?);
        Ok(())
    }

    #[test]
    fn terminal_trigger_blocks_raw_status_rewrites() -> Result<()> {
        let store = migrated_store()?;
        store.conn.execute(
            "INSERT INTO pending_actions(id, token, action_type, action_data, status, created_at, expires_at)
             VALUES ('a1', 'tok-1', 'send_email', '{}', 'rejected', ?1, ?1)",
            params!["2026-01-01T00:00:00Z"],
        )?;
        let rewrite = store
            .conn
            .execute("UPDATE pending_actions SET status = 'approved' WHERE id = 'a1'", []);
        assert!(rewrite.is_err());
        Ok(())
    }

    #[test]
    fn crm_synced_trigger_blocks_clearing_latch() -> Result<()> {
        let store = migrated_store()?;
        store.conn.execute(
            "INSERT INTO pending_actions(id, token, action_type, action_data, status, crm_synced, created_at, expires_at)
             VALUES ('a2', 'tok-2', 'update_crm', '{}', 'approved', 1, ?1, ?1)",
            params!["2026-01-01T00:00:00Z"],
        )?;
        assert!(store
            .conn
            .execute("UPDATE pending_actions SET crm_synced = 0 WHERE id = 'a2'", [])
            .is_err());
        assert!(store
            .conn
            .execute("UPDATE pending_actions SET crm_synced = NULL WHERE id = 'a2'", [])
            .is_err());
        Ok(())
    }

    #[test]
    fn action_data_must_be_json() -> Result<()> {
        let store = migrated_store()?;
        let insert = store.conn.execute(
            "INSERT INTO pending_actions(id, token, action_type, action_data, created_at, expires_at)
             VALUES ('a3', 'tok-3', 'send_email', 'not json', ?1, ?1)",
            params!["2026-01-01T00:00:00Z"],
        );
        assert!(insert.is_err());
        Ok(())
    }
}
