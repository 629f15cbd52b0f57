//! Token-addressed pending actions awaiting human approval.
//!
//! Every status change is a conditional `UPDATE ... WHERE status = 'pending'`
//! inside a write transaction, so concurrent resolutions of one token settle it
//! exactly once. A database trigger rejects any later rewrite of a terminal status.

use anyhow::{Context, Result};
use jottask_core::{
    authorize, crm_sync_transition, ActionPayload, ActionToken, ApprovalEffect, CoreError,
    Identity, NewPendingAction, Operation, PendingAction, PendingActionId, PendingActionStatus,
    Table, Task, UserId,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::tasks::{insert_task, load_task, user_exists};
use crate::{
    enum_column, id_column, not_found, now_utc, optional_id_column, optional_timestamp_column,
    parse_column, rfc3339, timestamp_column, SqliteStore,
};

const ACTION_COLUMNS: &str = "id, token, user_id, action_data, status, failure_reason, crm_synced,
    created_at, expires_at, processed_at";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionResolution {
    pub action: PendingAction,
    /// Task created by approving an owned action.
    pub follow_up_task: Option<Task>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExpirySweep {
    pub expired: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CrmSyncClaim {
    pub action: PendingAction,
    /// `false` when another worker already set the latch.
    pub newly_synced: bool,
}

fn map_action(row: &Row<'_>) -> rusqlite::Result<PendingAction> {
    Ok(PendingAction {
        id: id_column(row, 0)?,
        token: parse_column(row, 1, ActionToken::parse)?,
        user_id: optional_id_column(row, 2)?,
        payload: parse_column(row, 3, |raw| serde_json::from_str::<ActionPayload>(raw))?,
        status: enum_column(row, 4, "pending action status", PendingActionStatus::parse)?,
        failure_reason: row.get(5)?,
        crm_synced: row.get(6)?,
        created_at: timestamp_column(row, 7)?,
        expires_at: timestamp_column(row, 8)?,
        processed_at: optional_timestamp_column(row, 9)?,
    })
}

fn load_action(
    conn: &Connection,
    identity: Identity,
    token: &ActionToken,
) -> Result<PendingAction> {
    conn.query_row(
        &format!(
            "SELECT {ACTION_COLUMNS} FROM pending_actions
             WHERE token = ?1 AND (?2 IS NULL OR user_id = ?2)"
        ),
        params![token.as_str(), identity.scope_param()],
        map_action,
    )
    .optional()
    .context("failed to read pending action")?
    .ok_or_else(|| not_found("pending_action", token))
}

/// Move a still-pending action to a terminal status. Returns `false` when another
/// writer resolved it first.
fn settle(
    conn: &Connection,
    id: PendingActionId,
    next: PendingActionStatus,
    failure_reason: Option<&str>,
    now: OffsetDateTime,
) -> Result<bool> {
    let updated = conn
        .execute(
            "UPDATE pending_actions
             SET status = ?2, failure_reason = COALESCE(?3, failure_reason), processed_at = ?4
             WHERE id = ?1 AND status = 'pending'",
            params![id.to_string(), next.as_str(), failure_reason, rfc3339(now)?],
        )
        .context("failed to update pending action status")?;
    Ok(updated == 1)
}

fn lost_race(current: PendingActionStatus, next: PendingActionStatus) -> anyhow::Error {
    CoreError::InvalidTransition {
        entity: "pending_action",
        from: current.as_str().to_string(),
        to: next.as_str().to_string(),
    }
    .into()
}

impl SqliteStore {
    /// Queue an action for approval and issue its token.
    ///
    /// # Errors
    /// Returns `AccessDenied` for owner identities, a validation error for an invalid
    /// payload or expiry, or `NotFound` for an unknown owner.
    pub fn create_pending_action(
        &mut self,
        identity: Identity,
        action: &NewPendingAction,
    ) -> Result<PendingAction> {
        authorize(identity, Table::PendingActions, Operation::Insert)?;
        action.validate()?;
        if let Some(user_id) = action.user_id {
            if !user_exists(&self.conn, user_id)? {
                return Err(not_found("user", user_id));
            }
        }

        let now = now_utc();
        let token = ActionToken::generate(&action.payload.title, now);
        let action_data =
            serde_json::to_string(&action.payload).context("failed to serialize action payload")?;
        self.conn
            .execute(
                "INSERT INTO pending_actions(
                   id, token, user_id, action_type, action_data, status, created_at, expires_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7)",
                params![
                    PendingActionId::new().to_string(),
                    token.as_str(),
                    action.user_id.map(|user_id| user_id.to_string()),
                    action.payload.kind.as_str(),
                    action_data,
                    rfc3339(now)?,
                    rfc3339(now + Duration::days(action.ttl_days()))?,
                ],
            )
            .context("failed to insert pending action")?;

        tracing::info!(
            kind = action.payload.kind.as_str(),
            ttl_days = action.ttl_days(),
            "queued pending action"
        );
        load_action(&self.conn, identity, &token)
    }

    /// # Errors
    /// Returns `NotFound` when the token is unknown or not visible to `identity`.
    pub fn get_pending_action(
        &self,
        identity: Identity,
        token: &ActionToken,
    ) -> Result<PendingAction> {
        authorize(identity, Table::PendingActions, Operation::Select)?;
        load_action(&self.conn, identity, token)
    }

    /// # Errors
    /// Returns an error when the query fails.
    pub fn list_pending_actions(
        &self,
        identity: Identity,
        user_id: Option<UserId>,
        status: Option<PendingActionStatus>,
    ) -> Result<Vec<PendingAction>> {
        authorize(identity, Table::PendingActions, Operation::Select)?;
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {ACTION_COLUMNS} FROM pending_actions
                 WHERE (?1 IS NULL OR user_id = ?1)
                   AND (?2 IS NULL OR user_id = ?2)
                   AND (?3 IS NULL OR status = ?3)
                 ORDER BY created_at DESC, id DESC"
            ))
            .context("failed to prepare pending action listing")?;
        let rows = stmt.query_map(
            params![
                user_id.map(|user_id| user_id.to_string()),
                identity.scope_param(),
                status.map(PendingActionStatus::as_str),
            ],
            map_action,
        )?;

        let mut actions = Vec::new();
        for row in rows {
            actions.push(row?);
        }
        Ok(actions)
    }

    /// Approve an action and apply its effect in the same transaction.
    ///
    /// An action past its expiry is marked `expired` instead and `Expired` is
    /// returned; that status change is kept.
    ///
    /// # Errors
    /// Returns `Expired` for a stale action, `InvalidTransition` for a resolved one,
    /// or `NotFound` for an unknown token.
    pub fn approve_pending_action(
        &mut self,
        identity: Identity,
        token: &ActionToken,
    ) -> Result<ActionResolution> {
        authorize(identity, Table::PendingActions, Operation::Update)?;
        let now = now_utc();
        let tx = self.write_tx()?;
        let action = load_action(&tx, identity, token)?;
        action.status.transition(PendingActionStatus::Approved)?;

        if action.is_stale_at(now) {
            settle(&tx, action.id, PendingActionStatus::Expired, None, now)?;
            tx.commit()
                .context("failed to commit expired pending action")?;
            tracing::info!(action_id = %action.id, "approval refused for expired action");
            return Err(CoreError::Expired(token.to_string()).into());
        }

        let follow_up_task = match action.payload.approval_effect(action.user_id) {
            ApprovalEffect::CreateTask(task) => {
                let task_id = insert_task(&tx, &task)?;
                Some(load_task(&tx, Identity::Service, task_id)?)
            }
            ApprovalEffect::Nothing => None,
        };

        if !settle(&tx, action.id, PendingActionStatus::Approved, None, now)? {
            return Err(lost_race(action.status, PendingActionStatus::Approved));
        }
        let action = load_action(&tx, identity, token)?;
        tx.commit()
            .context("failed to commit approved pending action")?;

        tracing::info!(
            action_id = %action.id,
            kind = action.payload.kind.as_str(),
            follow_up = follow_up_task.is_some(),
            "approved pending action"
        );
        Ok(ActionResolution {
            action,
            follow_up_task,
        })
    }

    /// # Errors
    /// Returns `InvalidTransition` for a resolved action or `NotFound` for an unknown token.
    pub fn reject_pending_action(
        &mut self,
        identity: Identity,
        token: &ActionToken,
    ) -> Result<PendingAction> {
        self.resolve_without_effect(identity, token, PendingActionStatus::Rejected, None)
    }

    /// Record that executing an approved-for-execution action failed.
    ///
    /// # Errors
    /// Returns `InvalidTransition` for a resolved action or `NotFound` for an unknown token.
    pub fn fail_pending_action(
        &mut self,
        identity: Identity,
        token: &ActionToken,
        reason: &str,
    ) -> Result<PendingAction> {
        let reason = reason.trim();
        let reason = if reason.is_empty() {
            None
        } else {
            Some(reason)
        };
        self.resolve_without_effect(identity, token, PendingActionStatus::Failed, reason)
    }

    fn resolve_without_effect(
        &mut self,
        identity: Identity,
        token: &ActionToken,
        next: PendingActionStatus,
        failure_reason: Option<&str>,
    ) -> Result<PendingAction> {
        authorize(identity, Table::PendingActions, Operation::Update)?;
        let tx = self.write_tx()?;
        let action = load_action(&tx, identity, token)?;
        action.status.transition(next)?;

        if !settle(&tx, action.id, next, failure_reason, now_utc())? {
            return Err(lost_race(action.status, next));
        }
        let action = load_action(&tx, identity, token)?;
        tx.commit()
            .context("failed to commit pending action status")?;

        tracing::info!(action_id = %action.id, status = next.as_str(), "resolved pending action");
        Ok(action)
    }

    /// Expire every pending action whose window closed at or before `now`.
    ///
    /// # Errors
    /// Returns `AccessDenied` for owner identities or an error when the update fails.
    pub fn expire_stale_actions(
        &mut self,
        identity: Identity,
        now: OffsetDateTime,
    ) -> Result<ExpirySweep> {
        authorize(identity, Table::PendingActions, Operation::Update)?;
        let now = rfc3339(now)?;
        let expired = self
            .conn
            .execute(
                "UPDATE pending_actions SET status = 'expired', processed_at = ?1
                 WHERE status = 'pending' AND expires_at <= ?1",
                params![now],
            )
            .context("failed to expire stale pending actions")?;

        let sweep = ExpirySweep {
            expired: u64::try_from(expired).unwrap_or_default(),
        };
        if sweep.expired > 0 {
            tracing::info!(expired = sweep.expired, "expired stale pending actions");
        }
        Ok(sweep)
    }

    /// Set the one-way CRM sync latch on an approved action.
    ///
    /// # Errors
    /// Returns `InvalidTransition` when the action is not approved or `NotFound` for
    /// an unknown token.
    pub fn mark_crm_synced(
        &mut self,
        identity: Identity,
        token: &ActionToken,
    ) -> Result<CrmSyncClaim> {
        authorize(identity, Table::PendingActions, Operation::Update)?;
        let tx = self.write_tx()?;
        let action = load_action(&tx, identity, token)?;
        if action.status != PendingActionStatus::Approved {
            return Err(CoreError::InvalidTransition {
                entity: "crm_synced",
                from: action.status.as_str().to_string(),
                to: "synced".to_string(),
            }
            .into());
        }
        crm_sync_transition(action.crm_synced, true)?;

        let updated = tx
            .execute(
                "UPDATE pending_actions SET crm_synced = 1
                 WHERE id = ?1 AND (crm_synced IS NULL OR crm_synced = 0)",
                params![action.id.to_string()],
            )
            .context("failed to set crm_synced")?;
        let action = load_action(&tx, identity, token)?;
        tx.commit().context("failed to commit crm_synced")?;

        Ok(CrmSyncClaim {
            action,
            newly_synced: updated == 1,
        })
    }
}
