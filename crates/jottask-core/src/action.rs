use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use time::{Date, OffsetDateTime, Time};
use ulid::Ulid;

use crate::model::NewTask;
use crate::{CoreError, UserId};

/// Approval window for a pending action unless the creator picks another.
pub const DEFAULT_ACTION_TTL_DAYS: i64 = 7;

const TOKEN_HEX_CHARS: usize = 32;
const MAX_TOKEN_CHARS: usize = 128;

/// The `action_type` of a pending action.
///
/// Kinds the worker invents beyond the named ones are kept verbatim in
/// `Other` and approve into a plain task.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(from = "String", into = "String")]
pub enum ActionKind {
    UpdateCrm,
    SendEmail,
    CreateCalendarEvent,
    ChangeDealStatus,
    CreateTask,
    Other(String),
}

impl ActionKind {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::UpdateCrm => "update_crm",
            Self::SendEmail => "send_email",
            Self::CreateCalendarEvent => "create_calendar_event",
            Self::ChangeDealStatus => "change_deal_status",
            Self::CreateTask => "create_task",
            Self::Other(kind) => kind,
        }
    }

    /// Accept a kind typed by a caller: any non-blank snake_case identifier.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let well_formed = !value.is_empty()
            && value
                .chars()
                .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_');
        well_formed.then(|| Self::from(value.to_string()))
    }

    /// Task category given to the follow-up task created on approval.
    #[must_use]
    pub fn follow_up_category(&self) -> Option<&'static str> {
        match self {
            Self::UpdateCrm => Some("crm"),
            Self::SendEmail => Some("email"),
            Self::CreateCalendarEvent => Some("calendar"),
            Self::ChangeDealStatus => Some("deals"),
            Self::CreateTask | Self::Other(_) => None,
        }
    }
}

impl From<String> for ActionKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "update_crm" => Self::UpdateCrm,
            "send_email" => Self::SendEmail,
            "create_calendar_event" => Self::CreateCalendarEvent,
            "change_deal_status" => Self::ChangeDealStatus,
            "create_task" => Self::CreateTask,
            _ => Self::Other(value),
        }
    }
}

impl From<ActionKind> for String {
    fn from(kind: ActionKind) -> Self {
        match kind {
            ActionKind::Other(kind) => kind,
            named => named.as_str().to_string(),
        }
    }
}

impl Display for ActionKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed body of a pending action, persisted as JSON.
///
/// Fields the worker sends that are not modelled here survive in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionPayload {
    #[serde(rename = "action_type")]
    pub kind: ActionKind,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crm_notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calendar_details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deal_status: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "crate::dates::iso_date::option"
    )]
    pub due_date: Option<Date>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "crate::dates::clock_time::option"
    )]
    pub due_time: Option<Time>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// What approving an action does to the owner's data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalEffect {
    CreateTask(NewTask),
    Nothing,
}

impl ActionPayload {
    #[must_use]
    pub fn new(kind: ActionKind, title: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            description: None,
            customer_name: None,
            crm_notes: None,
            calendar_details: None,
            deal_status: None,
            due_date: None,
            due_time: None,
            extra: Map::new(),
        }
    }

    /// # Errors
    /// Returns a validation error for a blank title, a blank kind or a kind
    /// missing its required field.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.title.trim().is_empty() {
            return Err(CoreError::validation("action title MUST be provided"));
        }
        if self.due_time.is_some() && self.due_date.is_none() {
            return Err(CoreError::validation("due_time requires due_date"));
        }
        match &self.kind {
            ActionKind::Other(kind) if kind.trim().is_empty() => {
                Err(CoreError::validation("action_type MUST be provided"))
            }
            ActionKind::ChangeDealStatus if blank(self.deal_status.as_deref()) => {
                Err(CoreError::validation("change_deal_status actions MUST name deal_status"))
            }
            _ => Ok(()),
        }
    }

    /// Derive the effect of approval for `owner`. Ownerless actions have none.
    #[must_use]
    pub fn approval_effect(&self, owner: Option<UserId>) -> ApprovalEffect {
        let Some(user_id) = owner else {
            return ApprovalEffect::Nothing;
        };

        let title = match (&self.kind, self.customer_name.as_deref()) {
            (ActionKind::UpdateCrm, Some(customer)) if !customer.trim().is_empty() => {
                format!("CRM Update: {}", customer.trim())
            }
            _ => self.title.trim().to_string(),
        };

        let description = match &self.kind {
            ActionKind::UpdateCrm => self
                .crm_notes
                .as_deref()
                .filter(|notes| !notes.trim().is_empty())
                .map(|notes| format!("CRM Notes: {}", notes.trim())),
            ActionKind::CreateCalendarEvent => self
                .calendar_details
                .as_deref()
                .filter(|details| !details.trim().is_empty())
                .map(|details| format!("Calendar: {}", details.trim())),
            ActionKind::ChangeDealStatus => self
                .deal_status
                .as_deref()
                .map(|status| format!("Deal status: {}", status.trim())),
            _ => None,
        }
        .or_else(|| self.description.clone());

        ApprovalEffect::CreateTask(NewTask {
            description,
            due_date: self.due_date,
            due_time: self.due_time,
            category: self.kind.follow_up_category().map(ToString::to_string),
            client_name: self.customer_name.clone(),
            ..NewTask::new(user_id, title)
        })
    }
}

fn blank(value: Option<&str>) -> bool {
    value.map_or(true, |text| text.trim().is_empty())
}

/// Capability token embedded in approval links.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ActionToken(String);

impl ActionToken {
    /// Derive an unguessable token from the action title, the clock and a fresh ULID.
    #[must_use]
    pub fn generate(title: &str, now: OffsetDateTime) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(title.as_bytes());
        hasher.update(b"-");
        hasher.update(now.unix_timestamp_nanos().to_string().as_bytes());
        hasher.update(b"-");
        hasher.update(Ulid::new().to_string().as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        Self(digest.chars().take(TOKEN_HEX_CHARS).collect())
    }

    /// Accept a token presented by a caller.
    ///
    /// # Errors
    /// Returns a validation error for blank, oversized or non-URL-safe input.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CoreError::validation("missing token"));
        }
        if trimmed.len() > MAX_TOKEN_CHARS
            || !trimmed.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
        {
            return Err(CoreError::validation("malformed token"));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ActionToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// `crm_synced` is a one-way latch: unset or false may become true, never the reverse.
///
/// # Errors
/// Returns `InvalidTransition` when clearing a set latch.
pub fn crm_sync_transition(current: Option<bool>, next: bool) -> Result<Option<bool>, CoreError> {
    if current == Some(true) && !next {
        return Err(CoreError::transition("crm_synced", "true", "false"));
    }
    Ok(Some(next))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use time::macros::{date, datetime};

    use super::*;

    #[test]
    fn generated_tokens_are_32_hex_chars_and_unique() {
        let now = datetime!(2026-01-01 00:00 UTC);
        let first = ActionToken::generate("Update CRM", now);
        let second = ActionToken::generate("Update CRM", now);
        assert_eq!(first.as_str().len(), 32);
        assert!(first.as_str().chars().all(|ch| ch.is_ascii_hexdigit()));
        assert_ne!(first, second);
        assert_eq!(ActionToken::parse(first.as_str()), Ok(first));
    }

    #[test]
    fn token_parse_rejects_blank_and_unsafe_input() {
        assert!(ActionToken::parse("  ").is_err());
        assert!(ActionToken::parse("abc/../def").is_err());
        assert!(ActionToken::parse(&"a".repeat(129)).is_err());
    }

    #[test]
    fn payload_keeps_unknown_fields() {
        let json = serde_json::json!({
            "action_type": "update_crm",
            "title": "Log call",
            "customer_name": "Acme",
            "deal_value": 4200
        });
        let payload: ActionPayload = match serde_json::from_value(json) {
            Ok(value) => value,
            Err(err) => panic!("payload should deserialize: {err}"),
        };
        assert_eq!(payload.kind, ActionKind::UpdateCrm);
        assert_eq!(payload.extra.get("deal_value"), Some(&Value::from(4200)));

        let round_trip = serde_json::to_value(&payload).unwrap_or_default();
        assert_eq!(round_trip["deal_value"], 4200);
        assert_eq!(round_trip["action_type"], "update_crm");
    }

    #[test]
    fn unnamed_action_types_survive_and_approve_into_plain_tasks() {
        let kinds = [
            "set_callback",
            "set_reminder",
            "snooze_task",
            "update_task_notes",
            "delete_task",
        ];
        for raw in kinds {
            let json = serde_json::json!({"action_type": raw, "title": "Call back Jane"});
            let payload: ActionPayload = match serde_json::from_value(json) {
                Ok(value) => value,
                Err(err) => panic!("{raw} payload should deserialize: {err}"),
            };
            assert_eq!(payload.kind, ActionKind::Other(raw.to_string()));
            assert!(payload.validate().is_ok());
            assert_eq!(serde_json::to_value(&payload).unwrap_or_default()["action_type"], raw);

            let user_id = UserId::new();
            let ApprovalEffect::CreateTask(task) = payload.approval_effect(Some(user_id)) else {
                panic!("{raw} should approve into a task");
            };
            assert_eq!(task.title, "Call back Jane");
            assert_eq!(task.category, None);
        }
    }

    #[test]
    fn kind_parse_accepts_identifiers_only() {
        assert_eq!(ActionKind::parse("update_crm"), Some(ActionKind::UpdateCrm));
        assert_eq!(
            ActionKind::parse(" set_callback "),
            Some(ActionKind::Other("set_callback".to_string()))
        );
        assert_eq!(ActionKind::parse("  "), None);
        assert_eq!(ActionKind::parse("Launch Rocket"), None);
    }

    #[test]
    fn kinds_require_their_fields() {
        let blank = ActionPayload::new(ActionKind::Other(String::new()), "Untyped");
        assert!(blank.validate().is_err());
        let deal = ActionPayload::new(ActionKind::ChangeDealStatus, "Close deal");
        assert!(deal.validate().is_err());
        assert!(ActionPayload::new(ActionKind::SendEmail, "  ")
            .validate()
            .is_err());
        assert!(ActionPayload::new(ActionKind::SendEmail, "Reply")
            .validate()
            .is_ok());
    }

    #[test]
    fn crm_update_approval_creates_titled_follow_up() {
        let user_id = UserId::new();
        let mut payload = ActionPayload::new(ActionKind::UpdateCrm, "Update CRM");
        payload.customer_name = Some("Acme Pty".to_string());
        payload.crm_notes = Some("Wants a quote".to_string());
        payload.due_date = Some(date!(2026 - 02 - 03));

        let ApprovalEffect::CreateTask(task) = payload.approval_effect(Some(user_id)) else {
            panic!("expected follow-up task");
        };
        assert_eq!(task.user_id, user_id);
        assert_eq!(task.title, "CRM Update: Acme Pty");
        assert_eq!(task.description.as_deref(), Some("CRM Notes: Wants a quote"));
        assert_eq!(task.category.as_deref(), Some("crm"));
        assert_eq!(task.due_date, Some(date!(2026 - 02 - 03)));
    }

    #[test]
    fn calendar_and_generic_follow_ups() {
        let user_id = UserId::new();
        let mut calendar = ActionPayload::new(ActionKind::CreateCalendarEvent, "Site visit");
        calendar.calendar_details = Some("Tue 10am".to_string());
        let ApprovalEffect::CreateTask(task) = calendar.approval_effect(Some(user_id)) else {
            panic!("expected follow-up task");
        };
        assert_eq!(task.description.as_deref(), Some("Calendar: Tue 10am"));
        assert_eq!(task.category.as_deref(), Some("calendar"));

        let mut generic = ActionPayload::new(ActionKind::CreateTask, "Order stock");
        generic.description = Some("10 boxes".to_string());
        let ApprovalEffect::CreateTask(task) = generic.approval_effect(Some(user_id)) else {
            panic!("expected follow-up task");
        };
        assert_eq!(task.category, None);
        assert_eq!(task.description.as_deref(), Some("10 boxes"));
    }

    #[test]
    fn ownerless_actions_have_no_effect() {
        let payload = ActionPayload::new(ActionKind::SendEmail, "Reply");
        assert_eq!(payload.approval_effect(None), ApprovalEffect::Nothing);
    }

    #[test]
    fn crm_latch_cannot_be_cleared() {
        assert_eq!(crm_sync_transition(None, true), Ok(Some(true)));
        assert_eq!(crm_sync_transition(Some(false), true), Ok(Some(true)));
        assert_eq!(crm_sync_transition(Some(true), true), Ok(Some(true)));
        assert!(crm_sync_transition(Some(true), false).is_err());
    }

    proptest! {
        #[test]
        fn property_crm_latch_is_monotonic(steps in prop::collection::vec(any::<bool>(), 0..16)) {
            let mut state: Option<bool> = None;
            let mut seen_true = false;
            for next in steps {
                match crm_sync_transition(state, next) {
                    Ok(updated) => state = updated,
                    Err(_) => prop_assert!(seen_true && !next),
                }
                seen_true |= state == Some(true);
                if seen_true {
                    prop_assert_eq!(state, Some(true));
                }
            }
        }
    }
}
