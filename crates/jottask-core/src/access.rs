//! Row-level access policy.
//!
//! Every per-user table is deny-by-default. An owner identity may perform only the
//! operations listed for the table, and only on rows it owns. The service identity
//! bypasses the policy entirely.

use serde::{Deserialize, Serialize};

use crate::{CoreError, UserId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(tag = "kind", content = "user_id", rename_all = "snake_case")]
pub enum Identity {
    Owner(UserId),
    Service,
}

impl Identity {
    #[must_use]
    pub fn owner(self) -> Option<UserId> {
        match self {
            Self::Owner(user_id) => Some(user_id),
            Self::Service => None,
        }
    }

    #[must_use]
    pub fn is_service(self) -> bool {
        matches!(self, Self::Service)
    }

    /// Whether a row owned by `row_owner` is visible to this identity.
    #[must_use]
    pub fn can_see(self, row_owner: Option<UserId>) -> bool {
        match self {
            Self::Service => true,
            Self::Owner(user_id) => row_owner == Some(user_id),
        }
    }

    /// Owner filter value bound into `(?N IS NULL OR user_id = ?N)` clauses.
    #[must_use]
    pub fn scope_param(self) -> Option<String> {
        self.owner().map(|user_id| user_id.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Select,
    Insert,
    Update,
    Delete,
}

impl Operation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

const OWNER_ALL: &[Operation] =
    &[Operation::Select, Operation::Insert, Operation::Update, Operation::Delete];
const OWNER_READ: &[Operation] = &[Operation::Select];
const OWNER_READ_UPDATE: &[Operation] = &[Operation::Select, Operation::Update];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Users,
    Tasks,
    Projects,
    ProjectItems,
    Contacts,
    EmailConnections,
    ProcessedEmails,
    PendingActions,
    CrmConnections,
    Referrals,
    SupportConversations,
}

impl Table {
    pub const ALL: [Self; 11] = [
        Self::Users,
        Self::Tasks,
        Self::Projects,
        Self::ProjectItems,
        Self::Contacts,
        Self::EmailConnections,
        Self::ProcessedEmails,
        Self::PendingActions,
        Self::CrmConnections,
        Self::Referrals,
        Self::SupportConversations,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Tasks => "tasks",
            Self::Projects => "projects",
            Self::ProjectItems => "project_items",
            Self::Contacts => "contacts",
            Self::EmailConnections => "email_connections",
            Self::ProcessedEmails => "processed_emails",
            Self::PendingActions => "pending_actions",
            Self::CrmConnections => "crm_connections",
            Self::Referrals => "referrals",
            Self::SupportConversations => "support_conversations",
        }
    }

    /// Operations an owner may perform on rows it owns.
    #[must_use]
    pub fn owner_operations(self) -> &'static [Operation] {
        match self {
            Self::Users => OWNER_READ_UPDATE,
            Self::Tasks
            | Self::Projects
            | Self::ProjectItems
            | Self::Contacts
            | Self::EmailConnections
            | Self::CrmConnections
            | Self::SupportConversations => OWNER_ALL,
            Self::ProcessedEmails | Self::PendingActions | Self::Referrals => OWNER_READ,
        }
    }
}

/// Check that `identity` may perform `operation` on `table` at all.
///
/// Row ownership is enforced separately by the owner filter on each statement.
///
/// # Errors
/// Returns `AccessDenied` when an owner identity is not granted the operation.
pub fn authorize(identity: Identity, table: Table, operation: Operation) -> Result<(), CoreError> {
    if identity.is_service() || table.owner_operations().contains(&operation) {
        return Ok(());
    }
    Err(CoreError::AccessDenied {
        table: table.as_str(),
        operation: operation.as_str(),
    })
}

/// Check an operation against a concrete row owner, as an insert check would.
///
/// # Errors
/// Returns `AccessDenied` when the operation is not granted or the row belongs
/// to someone else.
pub fn authorize_row(
    identity: Identity,
    table: Table,
    operation: Operation,
    row_owner: Option<UserId>,
) -> Result<(), CoreError> {
    authorize(identity, table, operation)?;
    if identity.can_see(row_owner) {
        Ok(())
    } else {
        Err(CoreError::AccessDenied {
            table: table.as_str(),
            operation: operation.as_str(),
        })
    }
}
