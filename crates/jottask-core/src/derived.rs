//! Views computed on read. None of these are persisted.

use serde::{Deserialize, Serialize};
use time::Date;

use crate::model::{ProjectItem, Task};
use crate::status::TaskStatus;

/// Upcoming tasks shown in a digest beyond the overdue and due-today groups.
pub const UPCOMING_DIGEST_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ProjectProgress {
    pub total: u64,
    pub completed: u64,
    pub percent: u8,
}

impl ProjectProgress {
    /// `floor(completed * 100 / total)`, and zero for an empty project.
    #[must_use]
    pub fn from_counts(completed: u64, total: u64) -> Self {
        let completed = completed.min(total);
        let percent = if total == 0 {
            0
        } else {
            u8::try_from(completed.saturating_mul(100) / total).unwrap_or(100)
        };
        Self {
            total,
            completed,
            percent,
        }
    }

    #[must_use]
    pub fn from_items(items: &[ProjectItem]) -> Self {
        let completed = items.iter().filter(|item| item.is_completed).count();
        Self::from_counts(completed as u64, items.len() as u64)
    }

    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.completed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskDigest {
    #[serde(with = "crate::dates::iso_date")]
    pub today: Date,
    pub overdue: Vec<Task>,
    pub due_today: Vec<Task>,
    pub upcoming: Vec<Task>,
    pub total_pending: usize,
}

/// Group pending tasks for a daily summary.
///
/// Tasks are ordered by due date then time. Undated tasks count as upcoming and
/// sort last. Only the first [`UPCOMING_DIGEST_LIMIT`] upcoming tasks are kept.
#[must_use]
pub fn build_task_digest(tasks: &[Task], today: Date) -> TaskDigest {
    let mut pending = tasks
        .iter()
        .filter(|task| task.status == TaskStatus::Pending)
        .collect::<Vec<_>>();
    pending.sort_by_key(|task| (task.due_date.is_none(), task.due_date, task.due_time, task.id));

    let total_pending = pending.len();
    let mut overdue = Vec::new();
    let mut due_today = Vec::new();
    let mut upcoming = Vec::new();

    for task in pending {
        match task.due_date {
            Some(due) if due < today => overdue.push(task.clone()),
            Some(due) if due == today => due_today.push(task.clone()),
            _ if upcoming.len() < UPCOMING_DIGEST_LIMIT => upcoming.push(task.clone()),
            _ => {}
        }
    }

    TaskDigest {
        today,
        overdue,
        due_today,
        upcoming,
        total_pending,
    }
}

#[cfg(test)]
mod tests {
    use time::macros::{date, time};
    use time::OffsetDateTime;

    use super::*;
    use crate::{ProjectId, ProjectItemId, TaskId, TaskPriority, UserId};

    fn mk_item(is_completed: bool) -> ProjectItem {
        ProjectItem {
            id: ProjectItemId::new(),
            project_id: ProjectId::new(),
            title: "step".to_string(),
            is_completed,
            display_order: 0,
            created_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn mk_task(due_date: Option<Date>, status: TaskStatus) -> Task {
        Task {
            id: TaskId::new(),
            user_id: UserId::new(),
            title: "task".to_string(),
            description: None,
            due_date,
            due_time: due_date.map(|_| time!(9:00)),
            priority: TaskPriority::Medium,
            status,
            category: None,
            client_name: None,
            client_email: None,
            business_id: None,
            contact_id: None,
            reminder_sent_at: None,
            created_at: OffsetDateTime::UNIX_EPOCH,
            completed_at: None,
        }
    }

    #[test]
    fn progress_floors_percentage() {
        let items = vec![mk_item(true), mk_item(false), mk_item(false)];
        let progress = ProjectProgress::from_items(&items);
        assert_eq!(progress.total, 3);
        assert_eq!(progress.completed, 1);
        assert_eq!(progress.percent, 33);
        assert_eq!(progress.remaining(), 2);
    }

    #[test]
    fn empty_project_is_zero_percent() {
        assert_eq!(ProjectProgress::from_items(&[]), ProjectProgress::default());
        assert_eq!(ProjectProgress::from_counts(2, 2).percent, 100);
    }

    #[test]
    fn remaining_never_underflows_on_inconsistent_counts() {
        let json = serde_json::json!({"total": 1, "completed": 3, "percent": 100});
        let progress: ProjectProgress = serde_json::from_value(json).unwrap_or_default();
        assert_eq!(progress.completed, 3);
        assert_eq!(progress.remaining(), 0);
    }

    #[test]
    fn digest_groups_pending_tasks() {
        let today = date!(2026 - 04 - 10);
        let tasks = vec![
            mk_task(Some(date!(2026 - 04 - 09)), TaskStatus::Pending),
            mk_task(Some(today), TaskStatus::Pending),
            mk_task(Some(date!(2026 - 04 - 12)), TaskStatus::Pending),
            mk_task(None, TaskStatus::Pending),
            mk_task(Some(date!(2026 - 04 - 01)), TaskStatus::Completed),
        ];

        let digest = build_task_digest(&tasks, today);
        assert_eq!(digest.total_pending, 4);
        assert_eq!(digest.overdue.len(), 1);
        assert_eq!(digest.due_today.len(), 1);
        assert_eq!(digest.upcoming.len(), 2);
        assert_eq!(digest.upcoming[0].due_date, Some(date!(2026 - 04 - 12)));
        assert_eq!(digest.upcoming[1].due_date, None);
    }

    #[test]
    fn digest_caps_upcoming_but_counts_everything() {
        let today = date!(2026 - 04 - 10);
        let tasks = (0..15).map(|_| mk_task(None, TaskStatus::Pending)).collect::<Vec<_>>();
        let digest = build_task_digest(&tasks, today);
        assert_eq!(digest.upcoming.len(), UPCOMING_DIGEST_LIMIT);
        assert_eq!(digest.total_pending, 15);
    }
}
