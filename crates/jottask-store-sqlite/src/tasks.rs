use anyhow::{Context, Result};
use jottask_core::dates::{format_clock, format_date, parse_clock, parse_date};
use jottask_core::{
    authorize, authorize_row, build_task_digest, Identity, NewTask, Operation, Table,
    Task, TaskDigest, TaskId, TaskPriority, TaskStatus, UserId,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use time::Date;

use crate::{
    enum_column, id_column, not_found, now_utc, optional_id_column, optional_timestamp_column,
    parse_optional_column, rfc3339, timestamp_column, SqliteStore,
};

pub(crate) const TASK_COLUMNS: &str = "id, user_id, title, description, due_date, due_time,
    priority, status, category, client_name, client_email, business_id, contact_id,
    reminder_sent_at, created_at, completed_at";

fn map_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: id_column(row, 0)?,
        user_id: id_column(row, 1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        due_date: parse_optional_column(row, 4, parse_date)?,
        due_time: parse_optional_column(row, 5, parse_clock)?,
        priority: enum_column(row, 6, "priority", TaskPriority::parse)?,
        status: enum_column(row, 7, "task status", TaskStatus::parse)?,
        category: row.get(8)?,
        client_name: row.get(9)?,
        client_email: row.get(10)?,
        business_id: row.get(11)?,
        contact_id: optional_id_column(row, 12)?,
        reminder_sent_at: optional_timestamp_column(row, 13)?,
        created_at: timestamp_column(row, 14)?,
        completed_at: optional_timestamp_column(row, 15)?,
    })
}

pub(crate) fn user_exists(conn: &Connection, user_id: UserId) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE id = ?1)",
            params![user_id.to_string()],
            |row| row.get::<_, i64>(0),
        )
        .context("failed to check user existence")?;
    Ok(exists == 1)
}

/// Insert a validated task. The contact, when given, must belong to the same user.
pub(crate) fn insert_task(conn: &Connection, task: &NewTask) -> Result<TaskId> {
    task.validate()?;
    if !user_exists(conn, task.user_id)? {
        return Err(not_found("user", task.user_id));
    }
    if let Some(contact_id) = task.contact_id {
        let owned = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM contacts WHERE id = ?1 AND user_id = ?2)",
                params![contact_id.to_string(), task.user_id.to_string()],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to check task contact")?;
        if owned == 0 {
            return Err(not_found("contact", contact_id));
        }
    }

    let id = TaskId::new();
    conn.execute(
        "INSERT INTO tasks(
           id, user_id, title, description, due_date, due_time, priority, status,
           category, client_name, client_email, business_id, contact_id, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            id.to_string(),
            task.user_id.to_string(),
            task.title.trim(),
            task.description,
            task.due_date.map(format_date),
            task.effective_due_time().map(format_clock),
            task.priority.as_str(),
            task.category,
            task.client_name,
            task.normalized_client_email(),
            task.business_id,
            task.contact_id.map(|contact_id| contact_id.to_string()),
            rfc3339(now_utc())?,
        ],
    )
    .context("failed to insert task")?;
    Ok(id)
}

pub(crate) fn load_task(conn: &Connection, identity: Identity, task_id: TaskId) -> Result<Task> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1 AND (?2 IS NULL OR user_id = ?2)"),
        params![task_id.to_string(), identity.scope_param()],
        map_task,
    )
    .optional()
    .context("failed to read task")?
    .ok_or_else(|| not_found("task", task_id))
}

impl SqliteStore {
    /// # Errors
    /// Returns `AccessDenied` when an owner creates a task for someone else, a
    /// validation error for bad input, or `NotFound` for an unknown user or contact.
    pub fn create_task(&mut self, identity: Identity, task: &NewTask) -> Result<Task> {
        authorize_row(identity, Table::Tasks, Operation::Insert, Some(task.user_id))?;
        let id = insert_task(&self.conn, task)?;
        tracing::debug!(task_id = %id, user_id = %task.user_id, "created task");
        load_task(&self.conn, identity, id)
    }

    /// # Errors
    /// Returns `NotFound` when the task is missing or not visible to `identity`.
    pub fn get_task(&self, identity: Identity, task_id: TaskId) -> Result<Task> {
        authorize(identity, Table::Tasks, Operation::Select)?;
        load_task(&self.conn, identity, task_id)
    }

    /// List a user's tasks ordered by due date, undated last.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn list_tasks(
        &self,
        identity: Identity,
        user_id: UserId,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Task>> {
        authorize(identity, Table::Tasks, Operation::Select)?;
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE user_id = ?1 AND (?2 IS NULL OR user_id = ?2) AND (?3 IS NULL OR status = ?3)
                 ORDER BY due_date IS NULL, due_date, due_time, created_at, id"
            ))
            .context("failed to prepare task listing")?;
        let rows = stmt.query_map(
            params![user_id.to_string(), identity.scope_param(), status.map(TaskStatus::as_str)],
            map_task,
        )?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    /// Move a task through its lifecycle. Completing stamps `completed_at`;
    /// reopening or cancelling clears it.
    ///
    /// # Errors
    /// Returns `InvalidTransition` for a disallowed move or `NotFound` for an invisible task.
    pub fn set_task_status(
        &mut self,
        identity: Identity,
        task_id: TaskId,
        next: TaskStatus,
    ) -> Result<Task> {
        authorize(identity, Table::Tasks, Operation::Update)?;
        let tx = self.write_tx()?;
        let current = load_task(&tx, identity, task_id)?;
        current.status.transition(next)?;

        let completed_at = if next == TaskStatus::Completed {
            Some(rfc3339(now_utc())?)
        } else {
            None
        };
        tx.execute(
            "UPDATE tasks SET status = ?3, completed_at = ?4 WHERE id = ?1 AND status = ?2",
            params![task_id.to_string(), current.status.as_str(), next.as_str(), completed_at],
        )
        .context("failed to update task status")?;
        let task = load_task(&tx, identity, task_id)?;
        tx.commit().context("failed to commit task status")?;

        tracing::info!(
            task_id = %task_id,
            from = current.status.as_str(),
            to = next.as_str(),
            "task status changed"
        );
        Ok(task)
    }

    /// # Errors
    /// Returns `NotFound` when the task is missing or not visible to `identity`.
    pub fn delete_task(&mut self, identity: Identity, task_id: TaskId) -> Result<()> {
        authorize(identity, Table::Tasks, Operation::Delete)?;
        let deleted = self
            .conn
            .execute(
                "DELETE FROM tasks WHERE id = ?1 AND (?2 IS NULL OR user_id = ?2)",
                params![task_id.to_string(), identity.scope_param()],
            )
            .context("failed to delete task")?;
        if deleted == 0 {
            return Err(not_found("task", task_id));
        }
        Ok(())
    }

    /// Stamp `reminder_sent_at` once. Returns `false` when it was already set.
    ///
    /// # Errors
    /// Returns `NotFound` when the task is missing or not visible to `identity`.
    pub fn mark_reminder_sent(&mut self, identity: Identity, task_id: TaskId) -> Result<bool> {
        authorize(identity, Table::Tasks, Operation::Update)?;
        let updated = self
            .conn
            .execute(
                "UPDATE tasks SET reminder_sent_at = ?3
                 WHERE id = ?1 AND (?2 IS NULL OR user_id = ?2) AND reminder_sent_at IS NULL",
                params![task_id.to_string(), identity.scope_param(), rfc3339(now_utc())?],
            )
            .context("failed to mark reminder sent")?;
        if updated == 1 {
            return Ok(true);
        }
        load_task(&self.conn, identity, task_id)?;
        Ok(false)
    }

    /// Group a user's pending tasks relative to `today`.
    ///
    /// # Errors
    /// Returns an error when the task listing fails.
    pub fn task_digest(
        &self,
        identity: Identity,
        user_id: UserId,
        today: Date,
    ) -> Result<TaskDigest> {
        let pending = self.list_tasks(identity, user_id, Some(TaskStatus::Pending))?;
        Ok(build_task_digest(&pending, today))
    }
}

#[cfg(test)]
mod tests {
    use jottask_core::CoreError;
    use time::macros::{date, time};

    use super::*;
    use crate::test_support::{migrated_store, mk_user};

    fn core_error(err: Option<anyhow::Error>) -> Option<CoreError> {
        err.and_then(|err| err.downcast_ref::<CoreError>().cloned())
    }

    #[test]
    fn create_task_normalizes_and_defaults_due_time() -> Result<()> {
        let mut store = migrated_store()?;
        let user = mk_user(&mut store, "owner@example.com")?;

        let mut new_task = NewTask::new(user.id, "  Send quote  ");
        new_task.due_date = Some(date!(2026 - 05 - 01));
        new_task.client_email = Some(" Jane@Example.com ".to_string());
        let task = store.create_task(Identity::Owner(user.id), &new_task)?;

        assert_eq!(task.title, "Send quote");
        assert_eq!(task.due_time, Some(time!(9:00)));
        assert_eq!(task.client_email.as_deref(), Some("jane@example.com"));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, TaskPriority::Medium);
        Ok(())
    }

    #[test]
    fn owner_cannot_create_or_read_foreign_tasks() -> Result<()> {
        let mut store = migrated_store()?;
        let alice = mk_user(&mut store, "alice@example.com")?;
        let bob = mk_user(&mut store, "bob@example.com")?;
        let as_alice = Identity::Owner(alice.id);

        let denied = store
            .create_task(as_alice, &NewTask::new(bob.id, "Not mine"))
            .err();
        assert!(matches!(core_error(denied), Some(CoreError::AccessDenied { .. })));

        let bobs = store.create_task(Identity::Owner(bob.id), &NewTask::new(bob.id, "Bob's"))?;
        let hidden = store.get_task(as_alice, bobs.id).err();
        assert!(matches!(core_error(hidden), Some(CoreError::NotFound { .. })));
        assert!(store.list_tasks(as_alice, bob.id, None)?.is_empty());
        assert!(store
            .set_task_status(as_alice, bobs.id, TaskStatus::Completed)
            .is_err());
        assert!(store.delete_task(as_alice, bobs.id).is_err());
        assert_eq!(store.list_tasks(Identity::Service, bob.id, None)?.len(), 1);
        Ok(())
    }

    #[test]
    fn status_lifecycle_stamps_completed_at() -> Result<()> {
        let mut store = migrated_store()?;
        let user = mk_user(&mut store, "owner@example.com")?;
        let owner = Identity::Owner(user.id);
        let task = store.create_task(owner, &NewTask::new(user.id, "Invoice"))?;

        let done = store.set_task_status(owner, task.id, TaskStatus::Completed)?;
        assert!(done.completed_at.is_some());

        let err = store
            .set_task_status(owner, task.id, TaskStatus::Cancelled)
            .err();
        assert!(matches!(core_error(err), Some(CoreError::InvalidTransition { .. })));

        let reopened = store.set_task_status(owner, task.id, TaskStatus::Pending)?;
        assert_eq!(reopened.status, TaskStatus::Pending);
        assert_eq!(reopened.completed_at, None);

        let pending = store.list_tasks(owner, user.id, Some(TaskStatus::Pending))?;
        assert_eq!(pending.len(), 1);
        Ok(())
    }

    #[test]
    fn reminder_is_sent_at_most_once() -> Result<()> {
        let mut store = migrated_store()?;
        let user = mk_user(&mut store, "owner@example.com")?;
        let task = store.create_task(Identity::Service, &NewTask::new(user.id, "Ping"))?;

        assert!(store.mark_reminder_sent(Identity::Service, task.id)?);
        assert!(!store.mark_reminder_sent(Identity::Service, task.id)?);
        assert!(store
            .get_task(Identity::Service, task.id)?
            .reminder_sent_at
            .is_some());
        assert!(store
            .mark_reminder_sent(Identity::Service, TaskId::new())
            .is_err());
        Ok(())
    }

    #[test]
    fn task_contact_must_belong_to_same_user() -> Result<()> {
        let mut store = migrated_store()?;
        let alice = mk_user(&mut store, "alice@example.com")?;
        let bob = mk_user(&mut store, "bob@example.com")?;
        let contact = store.upsert_contact(
            Identity::Service,
            &jottask_core::NewContact {
                user_id: bob.id,
                name: Some("Jane".to_string()),
                email: None,
                phone: None,
                company: None,
            },
        )?;

        let mut task = NewTask::new(alice.id, "Cross-linked");
        task.contact_id = Some(contact.id);
        assert!(store.create_task(Identity::Service, &task).is_err());
        Ok(())
    }

    #[test]
    fn digest_groups_pending_tasks() -> Result<()> {
        let mut store = migrated_store()?;
        let user = mk_user(&mut store, "owner@example.com")?;
        let today = date!(2026 - 04 - 10);

        for (title, due_date) in [
            ("late", Some(date!(2026 - 04 - 09))),
            ("now", Some(today)),
            ("soon", Some(date!(2026 - 04 - 12))),
            ("someday", None),
        ] {
            let mut task = NewTask::new(user.id, title);
            task.due_date = due_date;
            store.create_task(Identity::Service, &task)?;
        }
        let done = store.create_task(Identity::Service, &NewTask::new(user.id, "done"))?;
        store.set_task_status(Identity::Service, done.id, TaskStatus::Completed)?;

        let digest = store.task_digest(Identity::Owner(user.id), user.id, today)?;
        assert_eq!(digest.total_pending, 4);
        assert_eq!(digest.overdue.len(), 1);
        assert_eq!(digest.due_today.len(), 1);
        assert_eq!(
            digest
                .upcoming
                .iter()
                .map(|task| task.title.as_str())
                .collect::<Vec<_>>(),
            vec!["soon", "someday"]
        );
        Ok(())
    }
}
