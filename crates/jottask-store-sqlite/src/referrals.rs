use anyhow::{Context, Result};
use jottask_core::{
    authorize, authorize_row, CoreError, Identity, NewReferral, Operation, Referral, ReferralId,
    ReferralStatus, SupportConversation, SupportConversationId, SupportConversationStatus, Table,
    UserId,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::tasks::user_exists;
use crate::{
    enum_column, id_column, not_found, now_utc, optional_timestamp_column, rfc3339,
    timestamp_column, SqliteStore,
};

const REFERRAL_COLUMNS: &str =
    "id, referrer_id, referred_id, status, created_at, trial_started_at, resolved_at";
const SUPPORT_COLUMNS: &str = "id, user_id, subject, status, created_at, updated_at";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferralOutcome {
    pub referral: Referral,
    /// `false` when the referred user already had a referral on record.
    pub created: bool,
}

fn map_referral(row: &Row<'_>) -> rusqlite::Result<Referral> {
    Ok(Referral {
        id: id_column(row, 0)?,
        referrer_id: id_column(row, 1)?,
        referred_id: id_column(row, 2)?,
        status: enum_column(row, 3, "referral status", ReferralStatus::parse)?,
        created_at: timestamp_column(row, 4)?,
        trial_started_at: optional_timestamp_column(row, 5)?,
        resolved_at: optional_timestamp_column(row, 6)?,
    })
}

fn map_support(row: &Row<'_>) -> rusqlite::Result<SupportConversation> {
    Ok(SupportConversation {
        id: id_column(row, 0)?,
        user_id: id_column(row, 1)?,
        subject: row.get(2)?,
        status: enum_column(row, 3, "support status", SupportConversationStatus::parse)?,
        created_at: timestamp_column(row, 4)?,
        updated_at: timestamp_column(row, 5)?,
    })
}

fn load_referral(conn: &Connection, identity: Identity, referred_id: UserId) -> Result<Referral> {
    conn.query_row(
        &format!(
            "SELECT {REFERRAL_COLUMNS} FROM referrals
             WHERE referred_id = ?1 AND (?2 IS NULL OR referrer_id = ?2 OR referred_id = ?2)"
        ),
        params![referred_id.to_string(), identity.scope_param()],
        map_referral,
    )
    .optional()
    .context("failed to read referral")?
    .ok_or_else(|| not_found("referral", referred_id))
}

fn load_support(
    conn: &Connection,
    identity: Identity,
    id: SupportConversationId,
) -> Result<SupportConversation> {
    conn.query_row(
        &format!(
            "SELECT {SUPPORT_COLUMNS} FROM support_conversations
             WHERE id = ?1 AND (?2 IS NULL OR user_id = ?2)"
        ),
        params![id.to_string(), identity.scope_param()],
        map_support,
    )
    .optional()
    .context("failed to read support conversation")?
    .ok_or_else(|| not_found("support_conversation", id))
}

impl SqliteStore {
    /// Record who referred a new account. A user can be referred only once; a
    /// repeat call returns the existing record untouched.
    ///
    /// # Errors
    /// Returns `AccessDenied` for owner identities, a validation error for a
    /// self-referral, or `NotFound` for an unknown user.
    pub fn record_referral(
        &mut self,
        identity: Identity,
        referral: &NewReferral,
    ) -> Result<ReferralOutcome> {
        authorize(identity, Table::Referrals, Operation::Insert)?;
        referral.validate()?;
        for user_id in [referral.referrer_id, referral.referred_id] {
            if !user_exists(&self.conn, user_id)? {
                return Err(not_found("user", user_id));
            }
        }

        let inserted = self
            .conn
            .execute(
                "INSERT INTO referrals(id, referrer_id, referred_id, status, created_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4)
                 ON CONFLICT(referred_id) DO NOTHING",
                params![
                    ReferralId::new().to_string(),
                    referral.referrer_id.to_string(),
                    referral.referred_id.to_string(),
                    rfc3339(now_utc())?,
                ],
            )
            .context("failed to insert referral")?;

        let stored = load_referral(&self.conn, identity, referral.referred_id)?;
        Ok(ReferralOutcome {
            referral: stored,
            created: inserted == 1,
        })
    }

    /// Move a referral along `pending -> trial -> converted`, or expire it.
    ///
    /// # Errors
    /// Returns `InvalidTransition` for a disallowed move or `NotFound` when the
    /// referred user has no referral.
    pub fn advance_referral(
        &mut self,
        identity: Identity,
        referred_id: UserId,
        next: ReferralStatus,
    ) -> Result<Referral> {
        authorize(identity, Table::Referrals, Operation::Update)?;
        let tx = self.write_tx()?;
        let current = load_referral(&tx, identity, referred_id)?;
        current.status.transition(next)?;

        let now = rfc3339(now_utc())?;
        let trial_started_at = (next == ReferralStatus::Trial).then(|| now.clone());
        let resolved_at = next.is_terminal().then(|| now.clone());
        tx.execute(
            "UPDATE referrals
             SET status = ?3,
                 trial_started_at = COALESCE(?4, trial_started_at),
                 resolved_at = COALESCE(?5, resolved_at)
             WHERE referred_id = ?1 AND status = ?2",
            params![
                referred_id.to_string(),
                current.status.as_str(),
                next.as_str(),
                trial_started_at,
                resolved_at,
            ],
        )
        .context("failed to update referral")?;
        let updated = load_referral(&tx, identity, referred_id)?;
        tx.commit().context("failed to commit referral status")?;

        tracing::info!(
            referred_id = %referred_id,
            from = current.status.as_str(),
            to = next.as_str(),
            "referral advanced"
        );
        Ok(updated)
    }

    /// Referrals where `user_id` is either side.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn list_referrals(&self, identity: Identity, user_id: UserId) -> Result<Vec<Referral>> {
        authorize(identity, Table::Referrals, Operation::Select)?;
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {REFERRAL_COLUMNS} FROM referrals
                 WHERE (referrer_id = ?1 OR referred_id = ?1)
                   AND (?2 IS NULL OR referrer_id = ?2 OR referred_id = ?2)
                 ORDER BY created_at, id"
            ))
            .context("failed to prepare referral listing")?;
        let rows =
            stmt.query_map(params![user_id.to_string(), identity.scope_param()], map_referral)?;

        let mut referrals = Vec::new();
        for row in rows {
            referrals.push(row?);
        }
        Ok(referrals)
    }

    /// # Errors
    /// Returns `AccessDenied` when an owner opens a conversation for someone else
    /// or a validation error for a blank subject.
    pub fn open_support_conversation(
        &mut self,
        identity: Identity,
        user_id: UserId,
        subject: &str,
    ) -> Result<SupportConversation> {
        authorize_row(identity, Table::SupportConversations, Operation::Insert, Some(user_id))?;
        let subject = subject.trim();
        if subject.is_empty() {
            return Err(CoreError::Validation("subject MUST be provided".to_string()).into());
        }
        if !user_exists(&self.conn, user_id)? {
            return Err(not_found("user", user_id));
        }

        let id = SupportConversationId::new();
        let now = rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT INTO support_conversations(id, user_id, subject, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'open', ?4, ?4)",
                params![id.to_string(), user_id.to_string(), subject, now],
            )
            .context("failed to insert support conversation")?;
        load_support(&self.conn, identity, id)
    }

    /// Support statuses are not a state machine; any known status may follow any other.
    ///
    /// # Errors
    /// Returns `NotFound` when the conversation is missing or not visible to `identity`.
    pub fn set_support_conversation_status(
        &mut self,
        identity: Identity,
        id: SupportConversationId,
        status: SupportConversationStatus,
    ) -> Result<SupportConversation> {
        authorize(identity, Table::SupportConversations, Operation::Update)?;
        let updated = self
            .conn
            .execute(
                "UPDATE support_conversations SET status = ?3, updated_at = ?4
                 WHERE id = ?1 AND (?2 IS NULL OR user_id = ?2)",
                params![
                    id.to_string(),
                    identity.scope_param(),
                    status.as_str(),
                    rfc3339(now_utc())?
                ],
            )
            .context("failed to update support conversation")?;
        if updated == 0 {
            return Err(not_found("support_conversation", id));
        }
        load_support(&self.conn, identity, id)
    }

    /// # Errors
    /// Returns an error when the query fails.
    pub fn list_support_conversations(
        &self,
        identity: Identity,
        user_id: UserId,
        status: Option<SupportConversationStatus>,
    ) -> Result<Vec<SupportConversation>> {
        authorize(identity, Table::SupportConversations, Operation::Select)?;
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {SUPPORT_COLUMNS} FROM support_conversations
                 WHERE user_id = ?1 AND (?2 IS NULL OR user_id = ?2) AND (?3 IS NULL OR status = ?3)
                 ORDER BY updated_at DESC, id"
            ))
            .context("failed to prepare support conversation listing")?;
        let rows = stmt.query_map(
            params![
                user_id.to_string(),
                identity.scope_param(),
                status.map(SupportConversationStatus::as_str),
            ],
            map_support,
        )?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?);
        }
        Ok(conversations)
    }
}
