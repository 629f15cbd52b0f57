use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime, Time};

use crate::action::{ActionPayload, ActionToken, DEFAULT_ACTION_TTL_DAYS};
use crate::derived::ProjectProgress;
use crate::status::{
    CredentialSource, CrmConnectionStatus, CrmProvider, EmailProvider, PendingActionStatus,
    ProjectStatus, ReferralStatus, SubscriptionStatus, SupportConversationStatus, TaskPriority,
    TaskStatus,
};
use crate::{
    ContactId, CoreError, CrmConnectionId, EmailConnectionId, PendingActionId, ProjectId,
    ProjectItemId, ReferralId, SupportConversationId, TaskId, UserId,
};

pub const DEFAULT_TIMEZONE: &str = "Australia/Brisbane";
pub const DEFAULT_PROJECT_COLOR: &str = "#6366F1";

const MAX_TITLE_CHARS: usize = 500;

/// Trim and lower-case an email address. Blank input yields `None`.
#[must_use]
pub fn normalize_email(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}

fn required_email(field: &str, raw: &str) -> Result<String, CoreError> {
    match normalize_email(raw) {
        Some(email) if email.contains('@') => Ok(email),
        Some(email) => Err(CoreError::Validation(format!(
            "{field} is not an email address: {email}"
        ))),
        None => Err(CoreError::Validation(format!("{field} MUST be provided"))),
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(ToString::to_string)
}

fn validate_title(field: &str, value: &str) -> Result<(), CoreError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(CoreError::Validation(format!("{field} MUST be provided")));
    }
    if trimmed.chars().count() > MAX_TITLE_CHARS {
        return Err(CoreError::Validation(format!(
            "{field} MUST be at most {MAX_TITLE_CHARS} characters"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub full_name: Option<String>,
    pub company_name: Option<String>,
    pub timezone: String,
    pub ai_context: Option<String>,
    pub onboarding_completed: bool,
    pub daily_summary_enabled: bool,
    #[serde(with = "crate::dates::clock_time")]
    pub daily_summary_time: Time,
    pub subscription_status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewUser {
    /// Identifier issued by the external auth provider. Generated when absent.
    #[serde(default)]
    pub id: Option<UserId>,
    pub email: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub company_name: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
}

impl NewUser {
    /// # Errors
    /// Returns a validation error for a missing or malformed email.
    pub fn validate(&self) -> Result<(), CoreError> {
        required_email("email", &self.email)?;
        if let Some(timezone) = &self.timezone {
            if timezone.trim().is_empty() {
                return Err(CoreError::validation("timezone MUST NOT be blank"));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn timezone_or_default(&self) -> String {
        non_blank(self.timezone.as_deref()).unwrap_or_else(|| DEFAULT_TIMEZONE.to_string())
    }
}

/// Partial profile update. `None` leaves the stored value unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfileUpdate {
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub company_name: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub ai_context: Option<String>,
    #[serde(default)]
    pub onboarding_completed: Option<bool>,
    #[serde(default)]
    pub daily_summary_enabled: Option<bool>,
    #[serde(default, with = "crate::dates::clock_time::option")]
    pub daily_summary_time: Option<Time>,
}

impl UserProfileUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: TaskId,
    pub user_id: UserId,
    pub title: String,
    pub description: Option<String>,
    #[serde(with = "crate::dates::iso_date::option")]
    pub due_date: Option<Date>,
    #[serde(with = "crate::dates::clock_time::option")]
    pub due_time: Option<Time>,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub category: Option<String>,
    pub client_name: Option<String>,
    pub client_email: Option<String>,
    pub business_id: Option<String>,
    pub contact_id: Option<ContactId>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub reminder_sent_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewTask {
    pub user_id: UserId,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, with = "crate::dates::iso_date::option")]
    pub due_date: Option<Date>,
    #[serde(default, with = "crate::dates::clock_time::option")]
    pub due_time: Option<Time>,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub client_email: Option<String>,
    #[serde(default)]
    pub business_id: Option<String>,
    #[serde(default)]
    pub contact_id: Option<ContactId>,
}

impl NewTask {
    #[must_use]
    pub fn new(user_id: UserId, title: impl Into<String>) -> Self {
        Self {
            user_id,
            title: title.into(),
            description: None,
            due_date: None,
            due_time: None,
            priority: TaskPriority::default(),
            category: None,
            client_name: None,
            client_email: None,
            business_id: None,
            contact_id: None,
        }
    }

    /// # Errors
    /// Returns a validation error for a blank or oversized title, or a
    /// malformed client email.
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_title("title", &self.title)?;
        if let Some(client_email) = self.client_email.as_deref() {
            if normalize_email(client_email).is_some() {
                required_email("client_email", client_email)?;
            }
        }
        if self.due_time.is_some() && self.due_date.is_none() {
            return Err(CoreError::validation("due_time requires due_date"));
        }
        Ok(())
    }

    /// Dated tasks without an explicit time are due at the default hour.
    #[must_use]
    pub fn effective_due_time(&self) -> Option<Time> {
        match (self.due_date, self.due_time) {
            (_, Some(due_time)) => Some(due_time),
            (Some(_), None) => Some(crate::dates::DEFAULT_DUE_TIME),
            (None, None) => None,
        }
    }

    #[must_use]
    pub fn normalized_client_email(&self) -> Option<String> {
        self.client_email.as_deref().and_then(normalize_email)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Project {
    pub id: ProjectId,
    pub user_id: UserId,
    pub name: String,
    pub color: String,
    pub status: ProjectStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewProject {
    pub user_id: UserId,
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
}

impl NewProject {
    /// # Errors
    /// Returns a validation error for a blank name or a color that is not `#RRGGBB`.
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_title("name", &self.name)?;
        if let Some(color) = &self.color {
            let hex = color.strip_prefix('#').unwrap_or_default();
            if hex.len() != 6 || !hex.chars().all(|ch| ch.is_ascii_hexdigit()) {
                return Err(CoreError::Validation(format!(
                    "color MUST be formatted as #RRGGBB: {color}"
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn color_or_default(&self) -> String {
        self
            .color
            .clone()
            .unwrap_or_else(|| DEFAULT_PROJECT_COLOR.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectItem {
    pub id: ProjectItemId,
    pub project_id: ProjectId,
    pub title: String,
    pub is_completed: bool,
    pub display_order: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewProjectItem {
    pub project_id: ProjectId,
    pub title: String,
    /// Appended after the last item when absent.
    #[serde(default)]
    pub display_order: Option<i64>,
}

impl NewProjectItem {
    /// # Errors
    /// Returns a validation error for a blank title or negative order.
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_title("title", &self.title)?;
        if self.display_order.is_some_and(|order| order < 0) {
            return Err(CoreError::validation("display_order MUST be >= 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectWithProgress {
    #[serde(flatten)]
    pub project: Project,
    pub progress: ProjectProgress,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contact {
    pub id: ContactId,
    pub user_id: UserId,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewContact {
    pub user_id: UserId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
}

impl NewContact {
    /// # Errors
    /// Returns a validation error when neither a name nor an email is given,
    /// or the email is malformed.
    pub fn validate(&self) -> Result<(), CoreError> {
        let name = non_blank(self.name.as_deref());
        let email = self.email.as_deref().and_then(normalize_email);
        if name.is_none() && email.is_none() {
            return Err(CoreError::validation("contact needs a name or an email"));
        }
        if let Some(raw) = self.email.as_deref() {
            if email.is_some() {
                required_email("email", raw)?;
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn normalized(&self) -> Self {
        Self {
            user_id: self.user_id,
            name: non_blank(self.name.as_deref()),
            email: self.email.as_deref().and_then(normalize_email),
            phone: non_blank(self.phone.as_deref()),
            company: non_blank(self.company.as_deref()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmailConnection {
    pub id: EmailConnectionId,
    pub user_id: UserId,
    pub provider: EmailProvider,
    pub email_address: String,
    pub imap_server: Option<String>,
    #[serde(skip_serializing, default)]
    pub imap_password: Option<String>,
    pub credential_source: CredentialSource,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_checked_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewEmailConnection {
    pub user_id: UserId,
    pub provider: EmailProvider,
    pub email_address: String,
    #[serde(default)]
    pub imap_server: Option<String>,
    #[serde(default)]
    pub imap_password: Option<String>,
    #[serde(default)]
    pub credential_source: CredentialSource,
}

impl NewEmailConnection {
    /// Lower-case the address, strip spaces from app passwords and fill the
    /// provider's default IMAP host. Shared-credential rows never keep a secret.
    #[must_use]
    pub fn normalized(&self) -> Self {
        let imap_password = match self.credential_source {
            CredentialSource::Shared => None,
            CredentialSource::Stored => self
                .imap_password
                .as_deref()
                .map(|raw| raw.chars().filter(|ch| !ch.is_whitespace()).collect::<String>())
                .filter(|password| !password.is_empty()),
        };
        Self {
            user_id: self.user_id,
            provider: self.provider,
            email_address: normalize_email(&self.email_address).unwrap_or_default(),
            imap_server: non_blank(self.imap_server.as_deref())
                .or_else(|| self.provider.default_imap_server().map(ToString::to_string)),
            imap_password,
            credential_source: self.credential_source,
        }
    }

    /// # Errors
    /// Returns a validation error for a malformed address, a missing stored
    /// secret, or a generic IMAP provider without a server.
    pub fn validate(&self) -> Result<(), CoreError> {
        required_email("email_address", &self.email_address)?;
        let normalized = self.normalized();
        if normalized.credential_source == CredentialSource::Stored
            && normalized.imap_password.is_none()
        {
            return Err(CoreError::validation(
                "imap_password MUST be provided for stored credentials",
            ));
        }
        if normalized.imap_server.is_none() {
            return Err(CoreError::validation("imap_server MUST be provided for imap provider"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessedEmail {
    pub email_id: String,
    pub user_id: Option<UserId>,
    pub sender_email: Option<String>,
    pub sender_name: Option<String>,
    pub subject: Option<String>,
    pub contact_id: Option<ContactId>,
    pub task_id: Option<TaskId>,
    #[serde(with = "time::serde::rfc3339")]
    pub processed_at: OffsetDateTime,
}

/// An inbound message already parsed into a task by the email worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InboundEmail {
    pub message_id: String,
    pub user_id: UserId,
    #[serde(default)]
    pub sender_email: Option<String>,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, with = "crate::dates::iso_date::option")]
    pub due_date: Option<Date>,
    #[serde(default, with = "crate::dates::clock_time::option")]
    pub due_time: Option<Time>,
    #[serde(default)]
    pub priority: TaskPriority,
}

impl InboundEmail {
    /// # Errors
    /// Returns a validation error for a blank message id or an invalid derived task.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.message_id.trim().is_empty() {
            return Err(CoreError::validation("message_id MUST be provided"));
        }
        self.task().validate()
    }

    #[must_use]
    pub fn sender(&self) -> Option<String> {
        self.sender_email.as_deref().and_then(normalize_email)
    }

    /// The task created for this message. Long subjects are cut to the title limit.
    #[must_use]
    pub fn task(&self) -> NewTask {
        let title = non_blank(self.title.as_deref())
            .or_else(|| non_blank(self.subject.as_deref()))
            .unwrap_or_else(|| "(no subject)".to_string());
        let title = match title.char_indices().nth(MAX_TITLE_CHARS) {
            Some((cut, _)) => title[..cut].trim_end().to_string(),
            None => title,
        };
        NewTask {
            description: non_blank(self.description.as_deref()),
            due_date: self.due_date,
            due_time: self.due_time,
            priority: self.priority,
            category: Some("email".to_string()),
            client_name: non_blank(self.sender_name.as_deref()),
            client_email: self.sender(),
            ..NewTask::new(self.user_id, title)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    Created {
        task: Task,
        contact_id: Option<ContactId>,
    },
    Duplicate { message_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingAction {
    pub id: PendingActionId,
    pub token: ActionToken,
    pub user_id: Option<UserId>,
    pub payload: ActionPayload,
    pub status: PendingActionStatus,
    pub failure_reason: Option<String>,
    pub crm_synced: Option<bool>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
}

impl PendingAction {
    /// A still-pending action whose approval window has closed.
    #[must_use]
    pub fn is_stale_at(&self, now: OffsetDateTime) -> bool {
        self.status == PendingActionStatus::Pending && now >= self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewPendingAction {
    #[serde(default)]
    pub user_id: Option<UserId>,
    pub payload: ActionPayload,
    #[serde(default)]
    pub expires_in_days: Option<i64>,
}

impl NewPendingAction {
    /// # Errors
    /// Returns a validation error for an invalid payload or an expiry outside 1..=90 days.
    pub fn validate(&self) -> Result<(), CoreError> {
        self.payload.validate()?;
        let days = self.ttl_days();
        if !(1..=90).contains(&days) {
            return Err(CoreError::Validation(format!(
                "expires_in_days MUST be within 1..=90, got {days}"
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn ttl_days(&self) -> i64 {
        self.expires_in_days.unwrap_or(DEFAULT_ACTION_TTL_DAYS)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CrmConnection {
    pub id: CrmConnectionId,
    pub user_id: UserId,
    pub provider: CrmProvider,
    pub display_name: String,
    #[serde(skip_serializing, default)]
    pub api_key: Option<String>,
    pub api_base_url: Option<String>,
    pub connection_status: CrmConnectionStatus,
    pub is_active: bool,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_sync_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Credentials for one CRM provider. Saving replaces any previous set for the
/// same provider and restarts its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewCrmConnection {
    pub user_id: UserId,
    pub provider: CrmProvider,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    /// `pending` unless the caller already verified the credentials.
    #[serde(default)]
    pub verified: bool,
}

impl NewCrmConnection {
    /// # Errors
    /// Returns a validation error when a provider that needs a key has none.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.provider.requires_api_key() && non_blank(self.api_key.as_deref()).is_none() {
            return Err(CoreError::Validation(format!(
                "api_key MUST be provided for {}",
                self.provider.as_str()
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn display_name_or_default(&self) -> String {
        non_blank(self.display_name.as_deref())
            .unwrap_or_else(|| format!("{} CRM", self.provider.label()))
    }

    #[must_use]
    pub fn initial_status(&self) -> CrmConnectionStatus {
        if self.verified {
            CrmConnectionStatus::Connected
        } else {
            CrmConnectionStatus::Pending
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Referral {
    pub id: ReferralId,
    pub referrer_id: UserId,
    pub referred_id: UserId,
    pub status: ReferralStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub resolved_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewReferral {
    pub referrer_id: UserId,
    pub referred_id: UserId,
}

impl NewReferral {
    /// # Errors
    /// Returns a validation error for a self-referral.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.referrer_id == self.referred_id {
            return Err(CoreError::validation("a user cannot refer themselves"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SupportConversation {
    pub id: SupportConversationId,
    pub user_id: UserId,
    pub subject: String,
    pub status: SupportConversationStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// How seeding treats values that are already set.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SeedMode {
    /// Fill only what is missing.
    #[default]
    Preserve,
    /// Reset to the seed values.
    Overwrite,
}

impl SeedMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preserve => "preserve",
            Self::Overwrite => "overwrite",
        }
    }
}

/// Per-account configuration applied by the operator seeding command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountSeed {
    pub account_email: String,
    #[serde(default)]
    pub ai_context: Option<String>,
    #[serde(default)]
    pub email_connection: Option<EmailConnectionSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmailConnectionSeed {
    pub provider: EmailProvider,
    pub email_address: String,
    #[serde(default)]
    pub imap_server: Option<String>,
    #[serde(default)]
    pub imap_password: Option<String>,
    #[serde(default)]
    pub credential_source: CredentialSource,
}

impl AccountSeed {
    /// # Errors
    /// Returns a validation error for a malformed account email or connection.
    pub fn validate(&self) -> Result<(), CoreError> {
        required_email("account_email", &self.account_email)?;
        if let Some(connection) = &self.email_connection {
            connection.for_user(UserId::new()).validate()?;
        }
        Ok(())
    }

    #[must_use]
    pub fn normalized_account_email(&self) -> String {
        normalize_email(&self.account_email).unwrap_or_default()
    }
}

impl EmailConnectionSeed {
    #[must_use]
    pub fn for_user(&self, user_id: UserId) -> NewEmailConnection {
        NewEmailConnection {
            user_id,
            provider: self.provider,
            email_address: self.email_address.clone(),
            imap_server: self.imap_server.clone(),
            imap_password: self.imap_password.clone(),
            credential_source: self.credential_source,
        }
        .normalized()
    }
}
