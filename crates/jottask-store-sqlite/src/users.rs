use anyhow::{Context, Result};
use jottask_core::dates::{format_clock, parse_clock};
use jottask_core::{
    authorize, normalize_email, CoreError, Identity, NewUser, Operation, SubscriptionStatus, Table,
    User, UserId, UserProfileUpdate,
};
use rusqlite::{params, OptionalExtension, Row};

use crate::{
    enum_column, id_column, not_found, now_utc, parse_column, require_service, rfc3339,
    timestamp_column, SqliteStore,
};

const USER_COLUMNS: &str = "id, email, full_name, company_name, timezone, ai_context,
    onboarding_completed, daily_summary_enabled, daily_summary_time, subscription_status, created_at";

pub(crate) fn map_user(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: id_column(row, 0)?,
        email: row.get(1)?,
        full_name: row.get(2)?,
        company_name: row.get(3)?,
        timezone: row.get(4)?,
        ai_context: row.get(5)?,
        onboarding_completed: row.get(6)?,
        daily_summary_enabled: row.get(7)?,
        daily_summary_time: parse_column(row, 8, parse_clock)?,
        subscription_status: enum_column(row, 9, "subscription_status", SubscriptionStatus::parse)?,
        created_at: timestamp_column(row, 10)?,
    })
}

impl SqliteStore {
    /// Register an account mirrored from the external auth provider.
    ///
    /// # Errors
    /// Returns `AccessDenied` for owner identities, a validation error for a bad
    /// or already registered email, or an error when the insert fails.
    pub fn create_user(&mut self, identity: Identity, user: &NewUser) -> Result<User> {
        authorize(identity, Table::Users, Operation::Insert)?;
        user.validate()?;
        let email = normalize_email(&user.email).unwrap_or_default();

        let existing: Option<String> = self
            .conn
            .query_row("SELECT id FROM users WHERE email = ?1", params![email], |row| row.get(0))
            .optional()
            .context("failed to check for existing user")?;
        if existing.is_some() {
            return Err(CoreError::Validation(format!("user already exists: {email}")).into());
        }

        let id = user.id.unwrap_or_default();
        self.conn
            .execute(
                "INSERT INTO users(id, email, full_name, company_name, timezone, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.to_string(),
                    email,
                    user.full_name,
                    user.company_name,
                    user.timezone_or_default(),
                    rfc3339(now_utc())?,
                ],
            )
            .context("failed to insert user")?;

        tracing::info!(user_id = %id, "created user");
        self.get_user(identity, id)
    }

    /// # Errors
    /// Returns `NotFound` when the user does not exist or is not visible to `identity`.
    pub fn get_user(&self, identity: Identity, user_id: UserId) -> Result<User> {
        authorize(identity, Table::Users, Operation::Select)?;
        self.conn
            .query_row(
                &format!(
                    "SELECT {USER_COLUMNS} FROM users WHERE id = ?1 AND (?2 IS NULL OR id = ?2)"
                ),
                params![user_id.to_string(), identity.scope_param()],
                map_user,
            )
            .optional()
            .context("failed to read user")?
            .ok_or_else(|| not_found("user", user_id))
    }

    /// # Errors
    /// Returns an error when the lookup query fails.
    pub fn find_user_by_email(&self, identity: Identity, email: &str) -> Result<Option<User>> {
        authorize(identity, Table::Users, Operation::Select)?;
        let Some(email) = normalize_email(email) else {
            return Ok(None);
        };
        self.conn
            .query_row(
                &format!(
                    "SELECT {USER_COLUMNS} FROM users WHERE email = ?1 AND (?2 IS NULL OR id = ?2)"
                ),
                params![email, identity.scope_param()],
                map_user,
            )
            .optional()
            .context("failed to look up user by email")
    }

    /// Apply a partial profile update; absent fields keep their stored values.
    ///
    /// # Errors
    /// Returns `NotFound` for an invisible user or a validation error for a blank timezone.
    pub fn update_user_profile(
        &mut self,
        identity: Identity,
        user_id: UserId,
        update: &UserProfileUpdate,
    ) -> Result<User> {
        authorize(identity, Table::Users, Operation::Update)?;
        if update.timezone.as_deref().is_some_and(|timezone| timezone.trim().is_empty()) {
            return Err(CoreError::Validation("timezone MUST NOT be blank".to_string()).into());
        }

        let updated = self
            .conn
            .execute(
                "UPDATE users SET
                   full_name = COALESCE(?3, full_name),
                   company_name = COALESCE(?4, company_name),
                   timezone = COALESCE(?5, timezone),
                   ai_context = COALESCE(?6, ai_context),
                   onboarding_completed = COALESCE(?7, onboarding_completed),
                   daily_summary_enabled = COALESCE(?8, daily_summary_enabled),
                   daily_summary_time = COALESCE(?9, daily_summary_time)
                 WHERE id = ?1 AND (?2 IS NULL OR id = ?2)",
                params![
                    user_id.to_string(),
                    identity.scope_param(),
                    update.full_name,
                    update.company_name,
                    update.timezone.as_deref().map(str::trim),
                    update.ai_context,
                    update.onboarding_completed,
                    update.daily_summary_enabled,
                    update.daily_summary_time.map(format_clock),
                ],
            )
            .context("failed to update user profile")?;
        if updated == 0 {
            return Err(not_found("user", user_id));
        }
        self.get_user(identity, user_id)
    }

    /// # Errors
    /// Returns `AccessDenied` for owner identities or `NotFound` for an unknown user.
    pub fn set_subscription_status(
        &mut self,
        identity: Identity,
        user_id: UserId,
        status: SubscriptionStatus,
    ) -> Result<User> {
        require_service(identity, Table::Users, Operation::Update)?;
        let updated = self
            .conn
            .execute(
                "UPDATE users SET subscription_status = ?2 WHERE id = ?1",
                params![user_id.to_string(), status.as_str()],
            )
            .context("failed to update subscription status")?;
        if updated == 0 {
            return Err(not_found("user", user_id));
        }
        self.get_user(identity, user_id)
    }

    /// Remove an account and, by cascade, everything it owns.
    ///
    /// # Errors
    /// Returns `AccessDenied` for owner identities or `NotFound` for an unknown user.
    pub fn delete_user(&mut self, identity: Identity, user_id: UserId) -> Result<()> {
        authorize(identity, Table::Users, Operation::Delete)?;
        let deleted = self
            .conn
            .execute("DELETE FROM users WHERE id = ?1", params![user_id.to_string()])
            .context("failed to delete user")?;
        if deleted == 0 {
            return Err(not_found("user", user_id));
        }
        tracing::info!(user_id = %user_id, "deleted user");
        Ok(())
    }
}
