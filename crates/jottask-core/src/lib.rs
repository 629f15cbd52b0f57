//! Domain model for the Jottask task and notification store.
//!
//! Everything here is pure: identifiers, status state machines, the per-table
//! access policy, typed action payloads and the views derived on read. Persistence
//! lives in `jottask-store-sqlite`.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

mod access;
mod action;
mod credentials;
pub mod dates;
mod derived;
mod model;
mod status;

pub use access::{authorize, authorize_row, Identity, Operation, Table};
pub use action::{
    crm_sync_transition, ActionKind, ActionPayload, ActionToken, ApprovalEffect,
    DEFAULT_ACTION_TTL_DAYS,
};
pub use credentials::{
    CredentialProvider, CredentialResolver, ResolvedCredentials, SharedCredentials,
    StoredCredentials,
};
pub use derived::{build_task_digest, ProjectProgress, TaskDigest, UPCOMING_DIGEST_LIMIT};
pub use model::{
    normalize_email, AccountSeed, Contact, CrmConnection, EmailConnection, EmailConnectionSeed,
    InboundEmail, IngestOutcome, NewContact, NewCrmConnection, NewEmailConnection,
    NewPendingAction, NewProject, NewProjectItem, NewReferral, NewTask, NewUser, PendingAction,
    ProcessedEmail, Project, ProjectItem, ProjectWithProgress, Referral, SeedMode,
    SupportConversation, Task, User, UserProfileUpdate, DEFAULT_PROJECT_COLOR, DEFAULT_TIMEZONE,
};
pub use status::{
    CredentialSource, CrmConnectionStatus, CrmProvider, EmailProvider, PendingActionStatus,
    ProjectStatus, ReferralStatus, SubscriptionStatus, SupportConversationStatus, TaskPriority,
    TaskStatus,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },
    #[error("access denied: {operation} on {table}")]
    AccessDenied {
        table: &'static str,
        operation: &'static str,
    },
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },
    #[error("pending action expired: {0}")]
    Expired(String),
    #[error("credentials unavailable: {0}")]
    Credentials(String),
}

impl CoreError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    #[must_use]
    pub fn not_found(entity: &'static str, key: impl Display) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub(crate) fn transition(entity: &'static str, from: &str, to: &str) -> Self {
        Self::InvalidTransition {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                Ulid::from_string(raw.trim()).map(Self).map_err(|err| {
                    CoreError::Validation(format!(
                        "invalid {} `{raw}`: {err}",
                        stringify!($name)
                    ))
                })
            }
        }
    };
}

ulid_id!(
    /// Account identifier. Mirrors the external auth identity.
    UserId
);
ulid_id!(TaskId);
ulid_id!(ProjectId);
ulid_id!(ProjectItemId);
ulid_id!(ContactId);
ulid_id!(EmailConnectionId);
ulid_id!(PendingActionId);
ulid_id!(CrmConnectionId);
ulid_id!(ReferralId);
ulid_id!(SupportConversationId);
