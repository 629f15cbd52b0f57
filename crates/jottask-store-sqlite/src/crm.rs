use anyhow::{Context, Result};
use jottask_core::{
    authorize, authorize_row, CrmConnection, CrmConnectionId, CrmConnectionStatus, CrmProvider,
    Identity, NewCrmConnection, Operation, Table, UserId,
};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::{
    enum_column, id_column, not_found, now_utc, optional_timestamp_column, rfc3339,
    timestamp_column, SqliteStore,
};

const CRM_COLUMNS: &str = "id, user_id, provider, display_name, api_key, api_base_url,
    connection_status, is_active, last_error, last_sync_at, created_at, updated_at";

fn map_crm(row: &Row<'_>) -> rusqlite::Result<CrmConnection> {
    Ok(CrmConnection {
        id: id_column(row, 0)?,
        user_id: id_column(row, 1)?,
        provider: enum_column(row, 2, "crm provider", CrmProvider::parse)?,
        display_name: row.get(3)?,
        api_key: row.get(4)?,
        api_base_url: row.get(5)?,
        connection_status: enum_column(
            row,
            6,
            "crm connection status",
            CrmConnectionStatus::parse,
        )?,
        is_active: row.get(7)?,
        last_error: row.get(8)?,
        last_sync_at: optional_timestamp_column(row, 9)?,
        created_at: timestamp_column(row, 10)?,
        updated_at: timestamp_column(row, 11)?,
    })
}

fn load_crm(conn: &Connection, identity: Identity, id: CrmConnectionId) -> Result<CrmConnection> {
    conn.query_row(
        &format!(
            "SELECT {CRM_COLUMNS} FROM crm_connections WHERE id = ?1 AND (?2 IS NULL OR user_id = ?2)"
        ),
        params![id.to_string(), identity.scope_param()],
        map_crm,
    )
    .optional()
    .context("failed to read crm connection")?
    .ok_or_else(|| not_found("crm_connection", id))
}

impl SqliteStore {
    /// Store credentials for a provider. Saving again for the same provider replaces
    /// them and restarts the connection lifecycle.
    ///
    /// # Errors
    /// Returns `AccessDenied` when an owner writes for someone else or a validation
    /// error when the provider needs an API key and none is given.
    pub fn save_crm_connection(
        &mut self,
        identity: Identity,
        connection: &NewCrmConnection,
    ) -> Result<CrmConnection> {
        authorize_row(
            identity,
            Table::CrmConnections,
            Operation::Insert,
            Some(connection.user_id),
        )?;
        connection.validate()?;

        let now = rfc3339(now_utc())?;
        let status = connection.initial_status();
        let last_sync_at = (status == CrmConnectionStatus::Connected).then(|| now.clone());
        self.conn
            .execute(
                "INSERT INTO crm_connections(
                   id, user_id, provider, display_name, api_key, api_base_url,
                   connection_status, is_active, last_error, last_sync_at, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, NULL, ?8, ?9, ?9)
                 ON CONFLICT(user_id, provider) DO UPDATE SET
                   display_name = excluded.display_name,
                   api_key = excluded.api_key,
                   api_base_url = excluded.api_base_url,
                   connection_status = excluded.connection_status,
                   is_active = 1,
                   last_error = NULL,
                   last_sync_at = excluded.last_sync_at,
                   updated_at = excluded.updated_at",
                params![
                    CrmConnectionId::new().to_string(),
                    connection.user_id.to_string(),
                    connection.provider.as_str(),
                    connection.display_name_or_default(),
                    connection.api_key.as_deref().map(str::trim),
                    connection.api_base_url.as_deref().map(str::trim),
                    status.as_str(),
                    last_sync_at,
                    now,
                ],
            )
            .context("failed to save crm connection")?;

        tracing::info!(
            user_id = %connection.user_id,
            provider = connection.provider.as_str(),
            status = status.as_str(),
            "saved crm connection"
        );
        self.conn
            .query_row(
                &format!(
                    "SELECT {CRM_COLUMNS} FROM crm_connections WHERE user_id = ?1 AND provider = ?2"
                ),
                params![connection.user_id.to_string(), connection.provider.as_str()],
                map_crm,
            )
            .context("failed to read saved crm connection")
    }

    /// # Errors
    /// Returns `NotFound` when the connection is missing or not visible to `identity`.
    pub fn get_crm_connection(
        &self,
        identity: Identity,
        id: CrmConnectionId,
    ) -> Result<CrmConnection> {
        authorize(identity, Table::CrmConnections, Operation::Select)?;
        load_crm(&self.conn, identity, id)
    }

    /// Advance a connection's lifecycle. `connected` clears the last error and
    /// stamps `last_sync_at`; `error` records `error`; `disconnected` deactivates it.
    ///
    /// # Errors
    /// Returns `InvalidTransition` for a disallowed move or `NotFound` for an
    /// invisible connection.
    pub fn set_crm_connection_status(
        &mut self,
        identity: Identity,
        id: CrmConnectionId,
        next: CrmConnectionStatus,
        error: Option<&str>,
    ) -> Result<CrmConnection> {
        authorize(identity, Table::CrmConnections, Operation::Update)?;
        let tx = self.write_tx()?;
        let current = load_crm(&tx, identity, id)?;
        current.connection_status.transition(next)?;

        let now = rfc3339(now_utc())?;
        let (is_active, last_error, last_sync_at) = match next {
            CrmConnectionStatus::Connected => (true, None, Some(now.clone())),
            CrmConnectionStatus::Error => (
                current.is_active,
                Some(
                    error
                        .map(str::trim)
                        .filter(|text| !text.is_empty())
                        .unwrap_or("unknown error"),
                ),
                current.last_sync_at.map(rfc3339).transpose()?,
            ),
            CrmConnectionStatus::Disconnected => (
                false,
                current.last_error.as_deref(),
                current.last_sync_at.map(rfc3339).transpose()?,
            ),
            CrmConnectionStatus::Pending => {
                (true, None, current.last_sync_at.map(rfc3339).transpose()?)
            }
        };
        tx.execute(
            "UPDATE crm_connections
             SET connection_status = ?3, is_active = ?4, last_error = ?5, last_sync_at = ?6, updated_at = ?7
             WHERE id = ?1 AND connection_status = ?2",
            params![
                id.to_string(),
                current.connection_status.as_str(),
                next.as_str(),
                is_active,
                last_error,
                last_sync_at,
                now,
            ],
        )
        .context("failed to update crm connection status")?;
        let updated = load_crm(&tx, identity, id)?;
        tx.commit()
            .context("failed to commit crm connection status")?;

        tracing::info!(
            crm_connection_id = %id,
            from = current.connection_status.as_str(),
            to = next.as_str(),
            "crm connection status changed"
        );
        Ok(updated)
    }

    /// # Errors
    /// Returns an error when the query fails.
    pub fn list_crm_connections(
        &self,
        identity: Identity,
        user_id: UserId,
    ) -> Result<Vec<CrmConnection>> {
        authorize(identity, Table::CrmConnections, Operation::Select)?;
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {CRM_COLUMNS} FROM crm_connections
                 WHERE user_id = ?1 AND (?2 IS NULL OR user_id = ?2)
                 ORDER BY created_at, id"
            ))
            .context("failed to prepare crm connection listing")?;
        let rows = stmt.query_map(params![user_id.to_string(), identity.scope_param()], map_crm)?;

        let mut connections = Vec::new();
        for row in rows {
            connections.push(row?);
        }
        Ok(connections)
    }

    /// The connection actions should sync to: active and connected, most recently updated.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn active_crm_connection(
        &self,
        identity: Identity,
        user_id: UserId,
    ) -> Result<Option<CrmConnection>> {
        authorize(identity, Table::CrmConnections, Operation::Select)?;
        self.conn
            .query_row(
                &format!(
                    "SELECT {CRM_COLUMNS} FROM crm_connections
                     WHERE user_id = ?1 AND (?2 IS NULL OR user_id = ?2)
                       AND is_active = 1 AND connection_status = 'connected'
                     ORDER BY updated_at DESC, id DESC
                     LIMIT 1"
                ),
                params![user_id.to_string(), identity.scope_param()],
                map_crm,
            )
            .optional()
            .context("failed to read active crm connection")
    }

    /// # Errors
    /// Returns `NotFound` when the connection is missing or not visible to `identity`.
    pub fn delete_crm_connection(&mut self, identity: Identity, id: CrmConnectionId) -> Result<()> {
        authorize(identity, Table::CrmConnections, Operation::Delete)?;
        let deleted = self
            .conn
            .execute(
                "DELETE FROM crm_connections WHERE id = ?1 AND (?2 IS NULL OR user_id = ?2)",
                params![id.to_string(), identity.scope_param()],
            )
            .context("failed to delete crm connection")?;
        if deleted == 0 {
            return Err(not_found("crm_connection", id));
        }
        Ok(())
    }
}
