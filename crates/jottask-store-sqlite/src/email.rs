use anyhow::{Context, Result};
use jottask_core::{
    authorize, authorize_row, CredentialResolver, CredentialSource, EmailConnection,
    EmailConnectionId, EmailProvider, Identity, InboundEmail, IngestOutcome, NewContact,
    NewEmailConnection, NewTask, Operation, ProcessedEmail, ResolvedCredentials, Table, UserId,
};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::contacts::ensure_contact;
use crate::tasks::{insert_task, load_task, user_exists};
use crate::{
    enum_column, id_column, not_found, now_utc, optional_id_column, optional_timestamp_column,
    require_service, rfc3339, timestamp_column, SqliteStore,
};

const CONNECTION_COLUMNS: &str = "id, user_id, provider, email_address, imap_server, imap_password,
    credential_source, is_active, last_checked_at, created_at";

pub(crate) const PROCESSED_EMAIL_COLUMNS: &str =
    "email_id, user_id, sender_email, sender_name, subject, contact_id, task_id, processed_at";

fn map_connection(row: &Row<'_>) -> rusqlite::Result<EmailConnection> {
    Ok(EmailConnection {
        id: id_column(row, 0)?,
        user_id: id_column(row, 1)?,
        provider: enum_column(row, 2, "email provider", EmailProvider::parse)?,
        email_address: row.get(3)?,
        imap_server: row.get(4)?,
        imap_password: row.get(5)?,
        credential_source: enum_column(row, 6, "credential source", CredentialSource::parse)?,
        is_active: row.get(7)?,
        last_checked_at: optional_timestamp_column(row, 8)?,
        created_at: timestamp_column(row, 9)?,
    })
}

pub(crate) fn map_processed_email(row: &Row<'_>) -> rusqlite::Result<ProcessedEmail> {
    Ok(ProcessedEmail {
        email_id: row.get(0)?,
        user_id: optional_id_column(row, 1)?,
        sender_email: row.get(2)?,
        sender_name: row.get(3)?,
        subject: row.get(4)?,
        contact_id: optional_id_column(row, 5)?,
        task_id: optional_id_column(row, 6)?,
        processed_at: timestamp_column(row, 7)?,
    })
}

/// Write a normalized connection. With `replace` an existing row for the same
/// address takes the new settings; otherwise it is left alone. Returns rows written.
pub(crate) fn write_email_connection(
    conn: &Connection,
    connection: &NewEmailConnection,
    replace: bool,
) -> Result<usize> {
    let on_conflict = if replace {
        "ON CONFLICT(user_id, email_address) DO UPDATE SET
           provider = excluded.provider,
           imap_server = excluded.imap_server,
           imap_password = excluded.imap_password,
           credential_source = excluded.credential_source,
           is_active = 1"
    } else {
        "ON CONFLICT(user_id, email_address) DO NOTHING"
    };
    conn.execute(
        &format!(
            "INSERT INTO email_connections(
               id, user_id, provider, email_address, imap_server, imap_password,
               credential_source, is_active, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8)
             {on_conflict}"
        ),
        params![
            EmailConnectionId::new().to_string(),
            connection.user_id.to_string(),
            connection.provider.as_str(),
            connection.email_address,
            connection.imap_server,
            connection.imap_password,
            connection.credential_source.as_str(),
            rfc3339(now_utc())?,
        ],
    )
    .context("failed to write email connection")
}

fn load_connection(
    conn: &Connection,
    identity: Identity,
    connection_id: EmailConnectionId,
) -> Result<EmailConnection> {
    conn.query_row(
        &format!(
            "SELECT {CONNECTION_COLUMNS} FROM email_connections
             WHERE id = ?1 AND (?2 IS NULL OR user_id = ?2)"
        ),
        params![connection_id.to_string(), identity.scope_param()],
        map_connection,
    )
    .optional()
    .context("failed to read email connection")?
    .ok_or_else(|| not_found("email_connection", connection_id))
}

impl SqliteStore {
    /// Save IMAP settings for an address. Saving the same address again replaces
    /// its settings and reactivates it.
    ///
    /// # Errors
    /// Returns `AccessDenied` when an owner writes for someone else or a validation
    /// error for incomplete settings.
    pub fn save_email_connection(
        &mut self,
        identity: Identity,
        connection: &NewEmailConnection,
    ) -> Result<EmailConnection> {
        authorize_row(
            identity,
            Table::EmailConnections,
            Operation::Insert,
            Some(connection.user_id),
        )?;
        connection.validate()?;
        let connection = connection.normalized();
        write_email_connection(&self.conn, &connection, true)?;

        self.conn
            .query_row(
                &format!(
                    "SELECT {CONNECTION_COLUMNS} FROM email_connections
                     WHERE user_id = ?1 AND email_address = ?2"
                ),
                params![connection.user_id.to_string(), connection.email_address],
                map_connection,
            )
            .context("failed to read saved email connection")
    }

    /// # Errors
    /// Returns `NotFound` when the connection is missing or not visible to `identity`.
    pub fn get_email_connection(
        &self,
        identity: Identity,
        connection_id: EmailConnectionId,
    ) -> Result<EmailConnection> {
        authorize(identity, Table::EmailConnections, Operation::Select)?;
        load_connection(&self.conn, identity, connection_id)
    }

    /// # Errors
    /// Returns an error when the query fails.
    pub fn list_email_connections(
        &self,
        identity: Identity,
        user_id: UserId,
    ) -> Result<Vec<EmailConnection>> {
        authorize(identity, Table::EmailConnections, Operation::Select)?;
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {CONNECTION_COLUMNS} FROM email_connections
                 WHERE user_id = ?1 AND (?2 IS NULL OR user_id = ?2)
                 ORDER BY created_at, id"
            ))
            .context("failed to prepare email connection listing")?;
        let rows =
            stmt.query_map(params![user_id.to_string(), identity.scope_param()], map_connection)?;

        let mut connections = Vec::new();
        for row in rows {
            connections.push(row?);
        }
        Ok(connections)
    }

    /// # Errors
    /// Returns `NotFound` when the connection is missing or not visible to `identity`.
    pub fn set_email_connection_active(
        &mut self,
        identity: Identity,
        connection_id: EmailConnectionId,
        active: bool,
    ) -> Result<EmailConnection> {
        authorize(identity, Table::EmailConnections, Operation::Update)?;
        let updated = self
            .conn
            .execute(
                "UPDATE email_connections SET is_active = ?3
                 WHERE id = ?1 AND (?2 IS NULL OR user_id = ?2)",
                params![connection_id.to_string(), identity.scope_param(), active],
            )
            .context("failed to update email connection")?;
        if updated == 0 {
            return Err(not_found("email_connection", connection_id));
        }
        load_connection(&self.conn, identity, connection_id)
    }

    /// Record that the mailbox was polled.
    ///
    /// # Errors
    /// Returns `NotFound` when the connection is missing or not visible to `identity`.
    pub fn mark_email_checked(
        &mut self,
        identity: Identity,
        connection_id: EmailConnectionId,
    ) -> Result<EmailConnection> {
        authorize(identity, Table::EmailConnections, Operation::Update)?;
        let updated = self
            .conn
            .execute(
                "UPDATE email_connections SET last_checked_at = ?3
                 WHERE id = ?1 AND (?2 IS NULL OR user_id = ?2)",
                params![connection_id.to_string(), identity.scope_param(), rfc3339(now_utc())?],
            )
            .context("failed to stamp email connection")?;
        if updated == 0 {
            return Err(not_found("email_connection", connection_id));
        }
        load_connection(&self.conn, identity, connection_id)
    }

    /// # Errors
    /// Returns `NotFound` when the connection is missing or not visible to `identity`.
    pub fn delete_email_connection(
        &mut self,
        identity: Identity,
        connection_id: EmailConnectionId,
    ) -> Result<()> {
        authorize(identity, Table::EmailConnections, Operation::Delete)?;
        let deleted = self
            .conn
            .execute(
                "DELETE FROM email_connections WHERE id = ?1 AND (?2 IS NULL OR user_id = ?2)",
                params![connection_id.to_string(), identity.scope_param()],
            )
            .context("failed to delete email connection")?;
        if deleted == 0 {
            return Err(not_found("email_connection", connection_id));
        }
        Ok(())
    }

    /// Resolve the IMAP login for a connection through the configured providers.
    ///
    /// # Errors
    /// Returns `AccessDenied` for owner identities, `NotFound` for an unknown
    /// connection, or `Credentials` when no secret can be produced.
    pub fn resolve_email_credentials(
        &self,
        identity: Identity,
        connection_id: EmailConnectionId,
        resolver: &CredentialResolver,
    ) -> Result<ResolvedCredentials> {
        require_service(identity, Table::EmailConnections, Operation::Select)?;
        let connection = load_connection(&self.conn, identity, connection_id)?;
        Ok(resolver.resolve(&connection)?)
    }

    /// Turn an inbound message into a task at most once per message id.
    ///
    /// The processed-email marker, the sender's contact and the task are written in
    /// one transaction. A message id seen before yields `Duplicate` and writes nothing.
    ///
    /// # Errors
    /// Returns `AccessDenied` for owner identities, a validation error for a bad
    /// message, or `NotFound` for an unknown user.
    pub fn ingest_email(
        &mut self,
        identity: Identity,
        email: &InboundEmail,
    ) -> Result<IngestOutcome> {
        authorize(identity, Table::ProcessedEmails, Operation::Insert)?;
        email.validate()?;
        let message_id = email.message_id.trim().to_string();

        let tx = self.write_tx()?;
        if !user_exists(&tx, email.user_id)? {
            return Err(not_found("user", email.user_id));
        }

        let claimed = tx
            .execute(
                "INSERT INTO processed_emails(email_id, processed_at, user_id, sender_email, sender_name, subject)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(email_id) DO NOTHING",
                params![
                    message_id,
                    rfc3339(now_utc())?,
                    email.user_id.to_string(),
                    email.sender(),
                    email.sender_name,
                    email.subject,
                ],
            )
            .context("failed to claim processed email")?;
        if claimed == 0 {
            tracing::debug!(message_id = %message_id, "skipping already processed email");
            return Ok(IngestOutcome::Duplicate { message_id });
        }

        let contact_id = match email.sender() {
            Some(sender) => Some(ensure_contact(
                &tx,
                &NewContact {
                    user_id: email.user_id,
                    name: email.sender_name.clone(),
                    email: Some(sender),
                    phone: None,
                    company: None,
                },
            )?),
            None => None,
        };

        let task_id = insert_task(&tx, &NewTask {
            contact_id,
            ..email.task()
        })?;
        tx.execute(
            "UPDATE processed_emails SET contact_id = ?2, task_id = ?3 WHERE email_id = ?1",
            params![
                message_id,
                contact_id.map(|contact_id| contact_id.to_string()),
                task_id.to_string(),
            ],
        )
        .context("failed to link processed email")?;
        let task = load_task(&tx, Identity::Service, task_id)?;
        tx.commit().context("failed to commit email ingestion")?;

        tracing::info!(message_id = %message_id, task_id = %task_id, "ingested email");
        Ok(IngestOutcome::Created { task, contact_id })
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn is_email_processed(&self, identity: Identity, message_id: &str) -> Result<bool> {
        authorize(identity, Table::ProcessedEmails, Operation::Select)?;
        let exists = self
            .conn
            .query_row(
                "SELECT EXISTS(
                   SELECT 1 FROM processed_emails
                   WHERE email_id = ?1 AND (?2 IS NULL OR user_id = ?2)
                 )",
                params![message_id.trim(), identity.scope_param()],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to check processed email")?;
        Ok(exists == 1)
    }

    /// # Errors
    /// Returns an error when the query fails.
    pub fn list_processed_emails(
        &self,
        identity: Identity,
        user_id: UserId,
    ) -> Result<Vec<ProcessedEmail>> {
        authorize(identity, Table::ProcessedEmails, Operation::Select)?;
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {PROCESSED_EMAIL_COLUMNS} FROM processed_emails
                 WHERE user_id = ?1 AND (?2 IS NULL OR user_id = ?2)
                 ORDER BY processed_at DESC, email_id"
            ))
            .context("failed to prepare processed email listing")?;
        let rows = stmt
            .query_map(params![user_id.to_string(), identity.scope_param()], map_processed_email)?;

        let mut emails = Vec::new();
        for row in rows {
            emails.push(row?);
        }
        Ok(emails)
    }
}
