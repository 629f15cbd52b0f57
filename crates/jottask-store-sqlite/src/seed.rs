use anyhow::{Context, Result};
use jottask_core::{AccountSeed, Identity, Operation, SeedMode, Table, UserId};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::email::write_email_connection;
use crate::{id_column, not_found, require_service, SqliteStore};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeedReport {
    pub user_id: UserId,
    pub mode: SeedMode,
    /// Fields the seed wrote.
    pub written: Vec<String>,
    /// Fields left alone because they were already set.
    pub preserved: Vec<String>,
}

impl SqliteStore {
    /// Apply per-account configuration to an existing user.
    ///
    /// In `preserve` mode only missing values are filled, so re-running a seed never
    /// undoes changes made since. `overwrite` resets every seeded value.
    ///
    /// # Errors
    /// Returns `AccessDenied` for owner identities, a validation error for a malformed
    /// seed, or `NotFound` when no user has the seed's email; nothing is written then.
    pub fn seed_account(
        &mut self,
        identity: Identity,
        seed: &AccountSeed,
        mode: SeedMode,
    ) -> Result<SeedReport> {
        require_service(identity, Table::Users, Operation::Update)?;
        seed.validate()?;
        let email = seed.normalized_account_email();

        let tx = self.write_tx()?;
        let user_id = tx
            .query_row("SELECT id FROM users WHERE email = ?1", params![email], |row| {
                id_column::<UserId>(row, 0)
            })
            .optional()
            .context("failed to look up seed account")?
            .ok_or_else(|| not_found("user", &email))?;

        let mut report = SeedReport {
            user_id,
            mode,
            written: Vec::new(),
            preserved: Vec::new(),
        };

        if let Some(ai_context) = &seed.ai_context {
            let sql = match mode {
                SeedMode::Preserve => {
                    "UPDATE users SET ai_context = ?2
                     WHERE id = ?1 AND (ai_context IS NULL OR trim(ai_context) = '')"
                }
                SeedMode::Overwrite => "UPDATE users SET ai_context = ?2 WHERE id = ?1",
            };
            let changed = tx
                .execute(sql, params![user_id.to_string(), ai_context])
                .context("failed to seed ai_context")?;
            let bucket = if changed == 1 {
                &mut report.written
            } else {
                &mut report.preserved
            };
            bucket.push("ai_context".to_string());
        }

        if let Some(connection) = &seed.email_connection {
            let connection = connection.for_user(user_id);
            let changed =
                write_email_connection(&tx, &connection, mode == SeedMode::Overwrite)?;
            let field = format!("email_connection:{}", connection.email_address);
            if changed > 0 {
                report.written.push(field);
            } else {
                report.preserved.push(field);
            }
        }

        tx.commit().context("failed to commit account seed")?;
        tracing::info!(
            user_id = %user_id,
            mode = mode.as_str(),
            written = report.written.len(),
            preserved = report.preserved.len(),
            "seeded account"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use jottask_core::{
        CoreError, CredentialSource, EmailConnectionSeed, EmailProvider, UserProfileUpdate,
    };

    use super::*;
    use crate::test_support::{migrated_store, mk_user};

    fn seed() -> AccountSeed {
        AccountSeed {
            account_email: "Owner@Example.com".to_string(),
            ai_context: Some("Tradie; quotes within 24h".to_string()),
            email_connection: Some(EmailConnectionSeed {
                provider: EmailProvider::Gmail,
                email_address: "jobs@example.com".to_string(),
                imap_server: None,
                imap_password: None,
                credential_source: CredentialSource::Shared,
            }),
        }
    }

    #[test]
    fn missing_account_aborts_without_writes() -> Result<()> {
        let mut store = migrated_store()?;
        let err = store
            .seed_account(Identity::Service, &seed(), SeedMode::Preserve)
            .err();
        assert!(matches!(
            err.as_ref().and_then(|err| err.downcast_ref::<CoreError>()),
            Some(CoreError::NotFound { .. })
        ));
        let connections: i64 =
            store.conn.query_row("SELECT COUNT(*) FROM email_connections", [], |row| row.get(0))?;
        assert_eq!(connections, 0);
        Ok(())
    }

    #[test]
    fn preserve_mode_fills_gaps_and_never_overwrites() -> Result<()> {
        let mut store = migrated_store()?;
        let user = mk_user(&mut store, "owner@example.com")?;

        let first = store.seed_account(Identity::Service, &seed(), SeedMode::Preserve)?;
        assert_eq!(first.written, vec!["ai_context", "email_connection:jobs@example.com"]);
        assert!(first.preserved.is_empty());

        let owner = Identity::Owner(user.id);
        store.update_user_profile(
            owner,
            user.id,
            &UserProfileUpdate {
                ai_context: Some("Edited by owner".to_string()),
                ..UserProfileUpdate::default()
            },
        )?;
        let connection = store.list_email_connections(owner, user.id)?.remove(0);
        store.set_email_connection_active(owner, connection.id, false)?;

        let second = store.seed_account(Identity::Service, &seed(), SeedMode::Preserve)?;
        assert!(second.written.is_empty());
        assert_eq!(second.preserved.len(), 2);
        assert_eq!(store.get_user(owner, user.id)?.ai_context.as_deref(), Some("Edited by owner"));
        assert!(!store.get_email_connection(owner, connection.id)?.is_active);
        Ok(())
    }

    #[test]
    fn overwrite_mode_resets_seeded_values() -> Result<()> {
        let mut store = migrated_store()?;
        let user = mk_user(&mut store, "owner@example.com")?;
        store.seed_account(Identity::Service, &seed(), SeedMode::Preserve)?;
        store.update_user_profile(
            Identity::Service,
            user.id,
            &UserProfileUpdate {
                ai_context: Some("Edited".to_string()),
                ..UserProfileUpdate::default()
            },
        )?;

        let report = store.seed_account(Identity::Service, &seed(), SeedMode::Overwrite)?;
        assert_eq!(report.written.len(), 2);
        assert_eq!(
            store
                .get_user(Identity::Service, user.id)?
                .ai_context
                .as_deref(),
            Some("Tradie; quotes within 24h")
        );
        Ok(())
    }

    #[test]
    fn seeding_is_service_only() -> Result<()> {
        let mut store = migrated_store()?;
        let user = mk_user(&mut store, "owner@example.com")?;
        assert!(store
            .seed_account(Identity::Owner(user.id), &seed(), SeedMode::Preserve)
            .is_err());
        Ok(())
    }
}
