use anyhow::{Context, Result};
use jottask_core::{
    authorize, authorize_row, Identity, NewProject, NewProjectItem, Operation, Project, ProjectId,
    ProjectItem, ProjectItemId, ProjectProgress, ProjectStatus, ProjectWithProgress, Table, UserId,
};
use rusqlite::{params, OptionalExtension, Row};

use crate::{
    enum_column, id_column, not_found, now_utc, rfc3339, timestamp_column, SqliteStore,
};

// Progress is recomputed from item counts on every read.
const PROJECT_WITH_PROGRESS_SELECT: &str = "
SELECT p.id, p.user_id, p.name, p.color, p.status, p.created_at,
       COUNT(i.id), COALESCE(SUM(i.is_completed), 0)
FROM projects p
LEFT JOIN project_items i ON i.project_id = p.id";

const ITEM_COLUMNS: &str = "id, project_id, title, is_completed, display_order, created_at";

fn map_project_with_progress(row: &Row<'_>) -> rusqlite::Result<ProjectWithProgress> {
    let total: i64 = row.get(6)?;
    let completed: i64 = row.get(7)?;
    Ok(ProjectWithProgress {
        project: Project {
            id: id_column(row, 0)?,
            user_id: id_column(row, 1)?,
            name: row.get(2)?,
            color: row.get(3)?,
            status: enum_column(row, 4, "project status", ProjectStatus::parse)?,
            created_at: timestamp_column(row, 5)?,
        },
        progress: ProjectProgress::from_counts(
            u64::try_from(completed).unwrap_or_default(),
            u64::try_from(total).unwrap_or_default(),
        ),
    })
}

fn map_item(row: &Row<'_>) -> rusqlite::Result<ProjectItem> {
    Ok(ProjectItem {
        id: id_column(row, 0)?,
        project_id: id_column(row, 1)?,
        title: row.get(2)?,
        is_completed: row.get(3)?,
        display_order: row.get(4)?,
        created_at: timestamp_column(row, 5)?,
    })
}

impl SqliteStore {
    /// # Errors
    /// Returns `AccessDenied` when an owner creates a project for someone else or
    /// a validation error for a blank name or malformed color.
    pub fn create_project(&mut self, identity: Identity, project: &NewProject) -> Result<Project> {
        authorize_row(identity, Table::Projects, Operation::Insert, Some(project.user_id))?;
        project.validate()?;

        let id = ProjectId::new();
        self.conn
            .execute(
                "INSERT INTO projects(id, user_id, name, color, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'active', ?5)",
                params![
                    id.to_string(),
                    project.user_id.to_string(),
                    project.name.trim(),
                    project.color_or_default(),
                    rfc3339(now_utc())?,
                ],
            )
            .context("failed to insert project")?;
        Ok(self.get_project(identity, id)?.project)
    }

    /// # Errors
    /// Returns `NotFound` when the project is missing or not visible to `identity`.
    pub fn get_project(
        &self,
        identity: Identity,
        project_id: ProjectId,
    ) -> Result<ProjectWithProgress> {
        authorize(identity, Table::Projects, Operation::Select)?;
        self.conn
            .query_row(
                &format!(
                    "{PROJECT_WITH_PROGRESS_SELECT}
                     WHERE p.id = ?1 AND (?2 IS NULL OR p.user_id = ?2)
                     GROUP BY p.id"
                ),
                params![project_id.to_string(), identity.scope_param()],
                map_project_with_progress,
            )
            .optional()
            .context("failed to read project")?
            .ok_or_else(|| not_found("project", project_id))
    }

    /// # Errors
    /// Returns an error when the query fails.
    pub fn list_projects(
        &self,
        identity: Identity,
        user_id: UserId,
    ) -> Result<Vec<ProjectWithProgress>> {
        authorize(identity, Table::Projects, Operation::Select)?;
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{PROJECT_WITH_PROGRESS_SELECT}
                 WHERE p.user_id = ?1 AND (?2 IS NULL OR p.user_id = ?2)
                 GROUP BY p.id
                 ORDER BY p.created_at, p.id"
            ))
            .context("failed to prepare project listing")?;
        let rows = stmt.query_map(
            params![user_id.to_string(), identity.scope_param()],
            map_project_with_progress,
        )?;

        let mut projects = Vec::new();
        for row in rows {
            projects.push(row?);
        }
        Ok(projects)
    }

    /// # Errors
    /// Returns `NotFound` when the project is missing or not visible to `identity`.
    pub fn set_project_status(
        &mut self,
        identity: Identity,
        project_id: ProjectId,
        status: ProjectStatus,
    ) -> Result<ProjectWithProgress> {
        authorize(identity, Table::Projects, Operation::Update)?;
        let updated = self
            .conn
            .execute(
                "UPDATE projects SET status = ?3 WHERE id = ?1 AND (?2 IS NULL OR user_id = ?2)",
                params![project_id.to_string(), identity.scope_param(), status.as_str()],
            )
            .context("failed to update project status")?;
        if updated == 0 {
            return Err(not_found("project", project_id));
        }
        self.get_project(identity, project_id)
    }

    /// Delete a project together with its items.
    ///
    /// # Errors
    /// Returns `NotFound` when the project is missing or not visible to `identity`.
    pub fn delete_project(&mut self, identity: Identity, project_id: ProjectId) -> Result<()> {
        authorize(identity, Table::Projects, Operation::Delete)?;
        let deleted = self
            .conn
            .execute(
                "DELETE FROM projects WHERE id = ?1 AND (?2 IS NULL OR user_id = ?2)",
                params![project_id.to_string(), identity.scope_param()],
            )
            .context("failed to delete project")?;
        if deleted == 0 {
            return Err(not_found("project", project_id));
        }
        Ok(())
    }

    /// Append an item to a project. Without an explicit order it goes last.
    ///
    /// # Errors
    /// Returns `NotFound` when the parent project is not visible or a validation error
    /// for a blank title or negative order.
    pub fn add_project_item(
        &mut self,
        identity: Identity,
        item: &NewProjectItem,
    ) -> Result<ProjectItem> {
        authorize(identity, Table::ProjectItems, Operation::Insert)?;
        item.validate()?;
        self.get_project(identity, item.project_id)?;

        let display_order = match item.display_order {
            Some(order) => order,
            None => self
                .conn
                .query_row(
                    "SELECT COALESCE(MAX(display_order) + 1, 0) FROM project_items WHERE project_id = ?1",
                    params![item.project_id.to_string()],
                    |row| row.get::<_, i64>(0),
                )
                .context("failed to compute next display order")?,
        };

        let id = ProjectItemId::new();
        self.conn
            .execute(
                "INSERT INTO project_items(id, project_id, title, is_completed, display_order, created_at)
                 VALUES (?1, ?2, ?3, 0, ?4, ?5)",
                params![
                    id.to_string(),
                    item.project_id.to_string(),
                    item.title.trim(),
                    display_order,
                    rfc3339(now_utc())?,
                ],
            )
            .context("failed to insert project item")?;
        self.get_project_item(identity, id)
    }

    /// # Errors
    /// Returns `NotFound` when the item or its project is not visible to `identity`.
    pub fn get_project_item(
        &self,
        identity: Identity,
        item_id: ProjectItemId,
    ) -> Result<ProjectItem> {
        authorize(identity, Table::ProjectItems, Operation::Select)?;
        self.conn
            .query_row(
                &format!(
                    "SELECT {ITEM_COLUMNS} FROM project_items
                     WHERE id = ?1
                       AND project_id IN (SELECT id FROM projects WHERE ?2 IS NULL OR user_id = ?2)"
                ),
                params![item_id.to_string(), identity.scope_param()],
                map_item,
            )
            .optional()
            .context("failed to read project item")?
            .ok_or_else(|| not_found("project_item", item_id))
    }

    /// # Errors
    /// Returns `NotFound` when the item or its project is not visible to `identity`.
    pub fn set_project_item_completed(
        &mut self,
        identity: Identity,
        item_id: ProjectItemId,
        completed: bool,
    ) -> Result<ProjectItem> {
        authorize(identity, Table::ProjectItems, Operation::Update)?;
        let updated = self
            .conn
            .execute(
                "UPDATE project_items SET is_completed = ?3
                 WHERE id = ?1
                   AND project_id IN (SELECT id FROM projects WHERE ?2 IS NULL OR user_id = ?2)",
                params![item_id.to_string(), identity.scope_param(), completed],
            )
            .context("failed to update project item")?;
        if updated == 0 {
            return Err(not_found("project_item", item_id));
        }
        self.get_project_item(identity, item_id)
    }

    /// # Errors
    /// Returns `NotFound` when the project is not visible to `identity`.
    pub fn list_project_items(
        &self,
        identity: Identity,
        project_id: ProjectId,
    ) -> Result<Vec<ProjectItem>> {
        authorize(identity, Table::ProjectItems, Operation::Select)?;
        self.get_project(identity, project_id)?;

        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {ITEM_COLUMNS} FROM project_items WHERE project_id = ?1
                 ORDER BY display_order, created_at, id"
            ))
            .context("failed to prepare project item listing")?;
        let rows = stmt.query_map(params![project_id.to_string()], map_item)?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    /// # Errors
    /// Returns `NotFound` when the project is not visible to `identity`.
    pub fn project_progress(
        &self,
        identity: Identity,
        project_id: ProjectId,
    ) -> Result<ProjectProgress> {
        Ok(self.get_project(identity, project_id)?.progress)
    }
}
