use std::path::{Path, PathBuf};

use anyhow::Result;
use jottask_core::{
    AccountSeed, ActionToken, Contact, ContactId, CredentialResolver, CrmConnection,
    CrmConnectionId, CrmConnectionStatus, EmailConnection, EmailConnectionId, Identity,
    InboundEmail, IngestOutcome, NewContact, NewCrmConnection, NewEmailConnection,
    NewPendingAction, NewProject, NewProjectItem, NewReferral, NewTask, NewUser, PendingAction,
    PendingActionStatus, ProcessedEmail, Project, ProjectId, ProjectItem, ProjectItemId,
    ProjectProgress, ProjectStatus, ProjectWithProgress, Referral, ReferralStatus,
    ResolvedCredentials, SeedMode, SubscriptionStatus, SupportConversation, SupportConversationId,
    SupportConversationStatus, Task, TaskDigest, TaskId, TaskStatus, User, UserId,
    UserProfileUpdate,
};
pub use jottask_store_sqlite::{
    ActionResolution, BackfillSummary, CrmSyncClaim, ExpirySweep, ForeignKeyViolation,
    IntegrityReport, MigrationInfo, ReferralOutcome, SchemaStatus, SeedReport,
};
use jottask_store_sqlite::SqliteStore;
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

pub mod logging;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReminderResult {
    pub task_id: TaskId,
    /// `false` when a reminder had already been recorded.
    pub marked: bool,
}

/// Library entry point. Every call opens the database, brings the schema up to
/// date and runs one store operation as the given identity.
#[derive(Debug, Clone)]
pub struct JottaskApi {
    db_path: PathBuf,
}

impl JottaskApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn with_store<T>(&self, op: impl FnOnce(&mut SqliteStore) -> Result<T>) -> Result<T> {
        let mut store = self.open_store()?;
        store.migrate()?;
        op(&mut store)
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
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Re-run one applied migration to repair a partially applied step.
    ///
    /// # Errors
    /// Returns an error for an unknown or unapplied version, or when the body fails.
    pub fn reapply_migration(&self, version: i64) -> Result<MigrationInfo> {
        self.with_store(|store| store.reapply_migration(version))
    }

    /// # Errors
    /// Returns an error when an integrity check fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        self.with_store(|store| store.integrity_check())
    }

    /// # Errors
    /// Returns an error when the backup cannot be written.
    pub fn backup(&self, out_file: &Path) -> Result<()> {
        self.with_store(|store| store.backup_database(out_file))
    }

    /// # Errors
    /// Returns an error when the backup is missing or restoring fails.
    pub fn restore(&self, in_file: &Path) -> Result<()> {
        let mut store = self.open_store()?;
        store.restore_database(in_file)
    }

    // Users

    /// # Errors
    /// Returns an error when the identity may not create users or the input is invalid.
    pub fn create_user(&self, identity: Identity, user: &NewUser) -> Result<User> {
        self.with_store(|store| store.create_user(identity, user))
    }

    /// # Errors
    /// Returns `NotFound` when the user is not visible to `identity`.
    pub fn get_user(&self, identity: Identity, user_id: UserId) -> Result<User> {
        self.with_store(|store| store.get_user(identity, user_id))
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn find_user_by_email(&self, identity: Identity, email: &str) -> Result<Option<User>> {
        self.with_store(|store| store.find_user_by_email(identity, email))
    }

    /// # Errors
    /// Returns `NotFound` when the user is not visible to `identity`.
    pub fn update_user_profile(
        &self,
        identity: Identity,
        user_id: UserId,
        update: &UserProfileUpdate,
    ) -> Result<User> {
        self.with_store(|store| store.update_user_profile(identity, user_id, update))
    }

    /// # Errors
    /// Returns an error for owner identities or an unknown user.
    pub fn set_subscription_status(
        &self,
        identity: Identity,
        user_id: UserId,
        status: SubscriptionStatus,
    ) -> Result<User> {
        self.with_store(|store| store.set_subscription_status(identity, user_id, status))
    }

    /// # Errors
    /// Returns an error for owner identities or an unknown user.
    pub fn delete_user(&self, identity: Identity, user_id: UserId) -> Result<()> {
        self.with_store(|store| store.delete_user(identity, user_id))
    }

    // Tasks

    /// # Errors
    /// Returns an error when the task is invalid or not owned by `identity`.
    pub fn create_task(&self, identity: Identity, task: &NewTask) -> Result<Task> {
        self.with_store(|store| store.create_task(identity, task))
    }

    /// # Errors
    /// Returns `NotFound` when the task is not visible to `identity`.
    pub fn get_task(&self, identity: Identity, task_id: TaskId) -> Result<Task> {
        self.with_store(|store| store.get_task(identity, task_id))
    }

    /// # Errors
    /// Returns an error when the listing fails.
    pub fn list_tasks(
        &self,
        identity: Identity,
        user_id: UserId,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Task>> {
        self.with_store(|store| store.list_tasks(identity, user_id, status))
    }

    /// # Errors
    /// Returns `InvalidTransition` or `NotFound` from the store.
    pub fn set_task_status(
        &self,
        identity: Identity,
        task_id: TaskId,
        status: TaskStatus,
    ) -> Result<Task> {
        self.with_store(|store| store.set_task_status(identity, task_id, status))
    }

    /// # Errors
    /// Returns `NotFound` when the task is not visible to `identity`.
    pub fn delete_task(&self, identity: Identity, task_id: TaskId) -> Result<()> {
        self.with_store(|store| store.delete_task(identity, task_id))
    }

    /// # Errors
    /// Returns `NotFound` when the task is not visible to `identity`.
    pub fn mark_reminder_sent(
        &self,
        identity: Identity,
        task_id: TaskId,
    ) -> Result<ReminderResult> {
        self.with_store(|store| {
            let marked = store.mark_reminder_sent(identity, task_id)?;
            Ok(ReminderResult { task_id, marked })
        })
    }

    /// Digest of pending tasks relative to `today`, which defaults to the current UTC date.
    ///
    /// # Errors
    /// Returns an error when the task listing fails.
    pub fn task_digest(
        &self,
        identity: Identity,
        user_id: UserId,
        today: Option<Date>,
    ) -> Result<TaskDigest> {
        let today = today.unwrap_or_else(|| OffsetDateTime::now_utc().date());
        self.with_store(|store| store.task_digest(identity, user_id, today))
    }

    // Projects

    /// # Errors
    /// Returns an error when the project is invalid or not owned by `identity`.
    pub fn create_project(&self, identity: Identity, project: &NewProject) -> Result<Project> {
        self.with_store(|store| store.create_project(identity, project))
    }

    /// # Errors
    /// Returns `NotFound` when the project is not visible to `identity`.
    pub fn get_project(
        &self,
        identity: Identity,
        project_id: ProjectId,
    ) -> Result<ProjectWithProgress> {
        self.with_store(|store| store.get_project(identity, project_id))
    }

    /// # Errors
    /// Returns `NotFound` when the project is not visible to `identity`.
    pub fn set_project_status(
        &self,
        identity: Identity,
        project_id: ProjectId,
        status: ProjectStatus,
    ) -> Result<ProjectWithProgress> {
        self.with_store(|store| store.set_project_status(identity, project_id, status))
    }

    /// # Errors
    /// Returns an error when the listing fails.
    pub fn list_projects(
        &self,
        identity: Identity,
        user_id: UserId,
    ) -> Result<Vec<ProjectWithProgress>> {
        self.with_store(|store| store.list_projects(identity, user_id))
    }

    /// # Errors
    /// Returns `NotFound` when the project is not visible to `identity`.
    pub fn delete_project(&self, identity: Identity, project_id: ProjectId) -> Result<()> {
        self.with_store(|store| store.delete_project(identity, project_id))
    }

    /// # Errors
    /// Returns `NotFound` when the parent project is not visible to `identity`.
    pub fn add_project_item(
        &self,
        identity: Identity,
        item: &NewProjectItem,
    ) -> Result<ProjectItem> {
        self.with_store(|store| store.add_project_item(identity, item))
    }

    /// # Errors
    /// Returns `NotFound` when the item is not visible to `identity`.
    pub fn get_project_item(
        &self,
        identity: Identity,
        item_id: ProjectItemId,
    ) -> Result<ProjectItem> {
        self.with_store(|store| store.get_project_item(identity, item_id))
    }

    /// # Errors
    /// Returns `NotFound` when the project is not visible to `identity`.
    pub fn list_project_items(
        &self,
        identity: Identity,
        project_id: ProjectId,
    ) -> Result<Vec<ProjectItem>> {
        self.with_store(|store| store.list_project_items(identity, project_id))
    }

    /// # Errors
    /// Returns `NotFound` when the item is not visible to `identity`.
    pub fn set_project_item_completed(
        &self,
        identity: Identity,
        item_id: ProjectItemId,
        completed: bool,
    ) -> Result<ProjectItem> {
        self.with_store(|store| store.set_project_item_completed(identity, item_id, completed))
    }

    /// # Errors
    /// Returns `NotFound` when the project is not visible to `identity`.
    pub fn project_progress(
        &self,
        identity: Identity,
        project_id: ProjectId,
    ) -> Result<ProjectProgress> {
        self.with_store(|store| store.project_progress(identity, project_id))
    }

    // Contacts

    /// # Errors
    /// Returns an error when the contact is invalid or not owned by `identity`.
    pub fn upsert_contact(&self, identity: Identity, contact: &NewContact) -> Result<Contact> {
        self.with_store(|store| store.upsert_contact(identity, contact))
    }

    /// # Errors
    /// Returns `NotFound` when the contact is not visible to `identity`.
    pub fn get_contact(&self, identity: Identity, contact_id: ContactId) -> Result<Contact> {
        self.with_store(|store| store.get_contact(identity, contact_id))
    }

    /// # Errors
    /// Returns an error when the listing fails.
    pub fn list_contacts(&self, identity: Identity, user_id: UserId) -> Result<Vec<Contact>> {
        self.with_store(|store| store.list_contacts(identity, user_id))
    }

    /// # Errors
    /// Returns `NotFound` when the contact is not visible to `identity`.
    pub fn delete_contact(&self, identity: Identity, contact_id: ContactId) -> Result<()> {
        self.with_store(|store| store.delete_contact(identity, contact_id))
    }

    /// # Errors
    /// Returns `NotFound` when the contact is not visible to `identity`.
    pub fn contact_history(
        &self,
        identity: Identity,
        contact_id: ContactId,
    ) -> Result<Vec<ProcessedEmail>> {
        self.with_store(|store| store.contact_history(identity, contact_id))
    }

    /// # Errors
    /// Returns an error for owner identities or when the backfill fails.
    pub fn backfill_contacts(&self, identity: Identity) -> Result<BackfillSummary> {
        self.with_store(|store| store.backfill_contacts(identity))
    }

    // Email

    /// # Errors
    /// Returns an error when the settings are invalid or not owned by `identity`.
    pub fn save_email_connection(
        &self,
        identity: Identity,
        connection: &NewEmailConnection,
    ) -> Result<EmailConnection> {
        self.with_store(|store| store.save_email_connection(identity, connection))
    }

    /// # Errors
    /// Returns `NotFound` when the connection is not visible to `identity`.
    pub fn get_email_connection(
        &self,
        identity: Identity,
        connection_id: EmailConnectionId,
    ) -> Result<EmailConnection> {
        self.with_store(|store| store.get_email_connection(identity, connection_id))
    }

    /// # Errors
    /// Returns an error when the listing fails.
    pub fn list_email_connections(
        &self,
        identity: Identity,
        user_id: UserId,
    ) -> Result<Vec<EmailConnection>> {
        self.with_store(|store| store.list_email_connections(identity, user_id))
    }

    /// # Errors
    /// Returns `NotFound` when the connection is not visible to `identity`.
    pub fn set_email_connection_active(
        &self,
        identity: Identity,
        connection_id: EmailConnectionId,
        active: bool,
    ) -> Result<EmailConnection> {
        self.with_store(|store| store.set_email_connection_active(identity, connection_id, active))
    }

    /// # Errors
    /// Returns `NotFound` when the connection is not visible to `identity`.
    pub fn mark_email_checked(
        &self,
        identity: Identity,
        connection_id: EmailConnectionId,
    ) -> Result<EmailConnection> {
        self.with_store(|store| store.mark_email_checked(identity, connection_id))
    }

    /// # Errors
    /// Returns `NotFound` when the connection is not visible to `identity`.
    pub fn delete_email_connection(
        &self,
        identity: Identity,
        connection_id: EmailConnectionId,
    ) -> Result<()> {
        self.with_store(|store| store.delete_email_connection(identity, connection_id))
    }

    /// # Errors
    /// Returns an error for owner identities or when no secret is available.
    pub fn resolve_email_credentials(
        &self,
        identity: Identity,
        connection_id: EmailConnectionId,
        resolver: &CredentialResolver,
    ) -> Result<ResolvedCredentials> {
        self.with_store(|store| store.resolve_email_credentials(identity, connection_id, resolver))
    }

    /// # Errors
    /// Returns an error for owner identities, invalid messages or unknown users.
    pub fn ingest_email(&self, identity: Identity, email: &InboundEmail) -> Result<IngestOutcome> {
        self.with_store(|store| store.ingest_email(identity, email))
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn is_email_processed(&self, identity: Identity, message_id: &str) -> Result<bool> {
        self.with_store(|store| store.is_email_processed(identity, message_id))
    }

    /// # Errors
    /// Returns an error when the listing fails.
    pub fn list_processed_emails(
        &self,
        identity: Identity,
        user_id: UserId,
    ) -> Result<Vec<ProcessedEmail>> {
        self.with_store(|store| store.list_processed_emails(identity, user_id))
    }

    // Pending actions

    /// # Errors
    /// Returns an error for owner identities or an invalid action.
    pub fn create_pending_action(
        &self,
        identity: Identity,
        action: &NewPendingAction,
    ) -> Result<PendingAction> {
        self.with_store(|store| store.create_pending_action(identity, action))
    }

    /// # Errors
    /// Returns `NotFound` when the token is not visible to `identity`.
    pub fn get_pending_action(
        &self,
        identity: Identity,
        token: &ActionToken,
    ) -> Result<PendingAction> {
        self.with_store(|store| store.get_pending_action(identity, token))
    }

    /// # Errors
    /// Returns an error when the listing fails.
    pub fn list_pending_actions(
        &self,
        identity: Identity,
        user_id: Option<UserId>,
        status: Option<PendingActionStatus>,
    ) -> Result<Vec<PendingAction>> {
        self.with_store(|store| store.list_pending_actions(identity, user_id, status))
    }

    /// # Errors
    /// Returns `Expired`, `InvalidTransition` or `NotFound` from the store.
    pub fn approve_pending_action(
        &self,
        identity: Identity,
        token: &ActionToken,
    ) -> Result<ActionResolution> {
        self.with_store(|store| store.approve_pending_action(identity, token))
    }

    /// # Errors
    /// Returns `InvalidTransition` or `NotFound` from the store.
    pub fn reject_pending_action(
        &self,
        identity: Identity,
        token: &ActionToken,
    ) -> Result<PendingAction> {
        self.with_store(|store| store.reject_pending_action(identity, token))
    }

    /// # Errors
    /// Returns `InvalidTransition` or `NotFound` from the store.
    pub fn fail_pending_action(
        &self,
        identity: Identity,
        token: &ActionToken,
        reason: &str,
    ) -> Result<PendingAction> {
        self.with_store(|store| store.fail_pending_action(identity, token, reason))
    }

    /// Expire pending actions whose window closed before `now` (default: the current time).
    ///
    /// # Errors
    /// Returns an error for owner identities or when the sweep fails.
    pub fn expire_stale_actions(
        &self,
        identity: Identity,
        now: Option<OffsetDateTime>,
    ) -> Result<ExpirySweep> {
        let now = now.unwrap_or_else(OffsetDateTime::now_utc);
        self.with_store(|store| store.expire_stale_actions(identity, now))
    }

    /// # Errors
    /// Returns `InvalidTransition` when the action is not approved.
    pub fn mark_crm_synced(&self, identity: Identity, token: &ActionToken) -> Result<CrmSyncClaim> {
        self.with_store(|store| store.mark_crm_synced(identity, token))
    }

    // CRM

    /// # Errors
    /// Returns an error when the credentials are invalid or not owned by `identity`.
    pub fn save_crm_connection(
        &self,
        identity: Identity,
        connection: &NewCrmConnection,
    ) -> Result<CrmConnection> {
        self.with_store(|store| store.save_crm_connection(identity, connection))
    }

    /// # Errors
    /// Returns `NotFound` when the connection is not visible to `identity`.
    pub fn get_crm_connection(
        &self,
        identity: Identity,
        id: CrmConnectionId,
    ) -> Result<CrmConnection> {
        self.with_store(|store| store.get_crm_connection(identity, id))
    }

    /// # Errors
    /// Returns `InvalidTransition` or `NotFound` from the store.
    pub fn set_crm_connection_status(
        &self,
        identity: Identity,
        id: CrmConnectionId,
        status: CrmConnectionStatus,
        error: Option<&str>,
    ) -> Result<CrmConnection> {
        self.with_store(|store| store.set_crm_connection_status(identity, id, status, error))
    }

    /// # Errors
    /// Returns an error when the listing fails.
    pub fn list_crm_connections(
        &self,
        identity: Identity,
        user_id: UserId,
    ) -> Result<Vec<CrmConnection>> {
        self.with_store(|store| store.list_crm_connections(identity, user_id))
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn active_crm_connection(
        &self,
        identity: Identity,
        user_id: UserId,
    ) -> Result<Option<CrmConnection>> {
        self.with_store(|store| store.active_crm_connection(identity, user_id))
    }

    /// # Errors
    /// Returns `NotFound` when the connection is not visible to `identity`.
    pub fn delete_crm_connection(&self, identity: Identity, id: CrmConnectionId) -> Result<()> {
        self.with_store(|store| store.delete_crm_connection(identity, id))
    }

    // Referrals and support

    /// # Errors
    /// Returns an error for owner identities, self-referrals or unknown users.
    pub fn record_referral(
        &self,
        identity: Identity,
        referral: &NewReferral,
    ) -> Result<ReferralOutcome> {
        self.with_store(|store| store.record_referral(identity, referral))
    }

    /// # Errors
    /// Returns `InvalidTransition` or `NotFound` from the store.
    pub fn advance_referral(
        &self,
        identity: Identity,
        referred_id: UserId,
        status: ReferralStatus,
    ) -> Result<Referral> {
        self.with_store(|store| store.advance_referral(identity, referred_id, status))
    }

    /// # Errors
    /// Returns an error when the listing fails.
    pub fn list_referrals(&self, identity: Identity, user_id: UserId) -> Result<Vec<Referral>> {
        self.with_store(|store| store.list_referrals(identity, user_id))
    }

    /// # Errors
    /// Returns an error for a blank subject or a foreign owner.
    pub fn open_support_conversation(
        &self,
        identity: Identity,
        user_id: UserId,
        subject: &str,
    ) -> Result<SupportConversation> {
        self.with_store(|store| store.open_support_conversation(identity, user_id, subject))
    }

    /// # Errors
    /// Returns `NotFound` when the conversation is not visible to `identity`.
    pub fn set_support_conversation_status(
        &self,
        identity: Identity,
        id: SupportConversationId,
        status: SupportConversationStatus,
    ) -> Result<SupportConversation> {
        self.with_store(|store| store.set_support_conversation_status(identity, id, status))
    }

    /// # Errors
    /// Returns an error when the listing fails.
    pub fn list_support_conversations(
        &self,
        identity: Identity,
        user_id: UserId,
        status: Option<SupportConversationStatus>,
    ) -> Result<Vec<SupportConversation>> {
        self.with_store(|store| store.list_support_conversations(identity, user_id, status))
    }

    /// # Errors
    /// Returns an error for owner identities, malformed seeds or a missing account.
    pub fn seed_account(
        &self,
        identity: Identity,
        seed: &AccountSeed,
        mode: SeedMode,
    ) -> Result<SeedReport> {
        self.with_store(|store| store.seed_account(identity, seed, mode))
    }
}

#[cfg(test)]
mod tests {
    use jottask_core::{ActionKind, ActionPayload, CoreError};
    use time::macros::date;

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("jottask-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn mk_user(api: &JottaskApi, email: &str) -> Result<User> {
        api.create_user(
            Identity::Service,
            &NewUser {
                id: None,
                email: email.to_string(),
                full_name: None,
                company_name: None,
                timezone: None,
            },
        )
    }

    #[test]
    fn migrate_dry_run_then_apply() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = JottaskApi::new(db_path.clone());

        let planned = api.migrate(true)?;
        assert!(planned.dry_run);
        assert_eq!(planned.current_version, 0);
        assert_eq!(planned.would_apply_versions.len(), 8);
        assert_eq!(planned.after_version, None);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(applied.target_version));
        assert_eq!(applied.up_to_date, Some(true));

        let again = api.migrate(false)?;
        assert!(again.would_apply_versions.is_empty());

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn owner_task_flow_and_digest() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = JottaskApi::new(db_path.clone());
        let user = mk_user(&api, "owner@example.com")?;
        let owner = Identity::Owner(user.id);

        let mut task = NewTask::new(user.id, "Call supplier");
        task.due_date = Some(date!(2026 - 04 - 09));
        let task = api.create_task(owner, &task)?;

        let digest = api.task_digest(owner, user.id, Some(date!(2026 - 04 - 10)))?;
        assert_eq!(digest.overdue.len(), 1);

        let reminder = api.mark_reminder_sent(owner, task.id)?;
        assert!(reminder.marked);
        assert!(!api.mark_reminder_sent(owner, task.id)?.marked);

        api.set_task_status(owner, task.id, TaskStatus::Completed)?;
        let digest = api.task_digest(owner, user.id, Some(date!(2026 - 04 - 10)))?;
        assert_eq!(digest.total_pending, 0);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn approval_by_token_survives_reopen() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = JottaskApi::new(db_path.clone());
        let user = mk_user(&api, "owner@example.com")?;

        let mut payload = ActionPayload::new(ActionKind::SendEmail, "Reply to Jane");
        payload.description = Some("Confirm Tuesday install".to_string());
        let action = api.create_pending_action(
            Identity::Service,
            &NewPendingAction {
                user_id: Some(user.id),
                payload,
                expires_in_days: None,
            },
        )?;

        let reopened = JottaskApi::new(db_path.clone());
        let resolution = reopened.approve_pending_action(Identity::Service, &action.token)?;
        assert_eq!(resolution.action.status, PendingActionStatus::Approved);
        assert_eq!(
            resolution.follow_up_task.and_then(|task| task.category),
            Some("email".to_string())
        );

        let err = reopened
            .approve_pending_action(Identity::Service, &action.token)
            .err();
        assert!(matches!(
            err.as_ref().and_then(|err| err.downcast_ref::<CoreError>()),
            Some(CoreError::InvalidTransition { .. })
        ));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn backup_restore_and_integrity() -> Result<()> {
        let db_path = unique_temp_db_path();
        let backup_path = unique_temp_db_path();
        let api = JottaskApi::new(db_path.clone());
        let user = mk_user(&api, "owner@example.com")?;

        api.backup(&backup_path)?;
        api.delete_user(Identity::Service, user.id)?;
        api.restore(&backup_path)?;
        assert_eq!(api.get_user(Identity::Service, user.id)?.email, "owner@example.com");

        let report = api.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.tables_without_policy.is_empty());

        let _ = std::fs::remove_file(&db_path);
        let _ = std::fs::remove_file(&backup_path);
        Ok(())
    }
}
