use anyhow::{Context, Result};
use jottask_core::{
    authorize, authorize_row, Contact, ContactId, Identity, NewContact, Operation, ProcessedEmail,
    Table, UserId,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::email::{map_processed_email, PROCESSED_EMAIL_COLUMNS};
use crate::{
    id_column, not_found, now_utc, require_service, rfc3339, timestamp_column, SqliteStore,
};

const CONTACT_COLUMNS: &str = "id, user_id, name, email, phone, company, created_at, updated_at";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackfillSummary {
    pub created: u64,
    pub skipped_existing: u64,
    pub linked_tasks: u64,
}

fn map_contact(row: &Row<'_>) -> rusqlite::Result<Contact> {
    Ok(Contact {
        id: id_column(row, 0)?,
        user_id: id_column(row, 1)?,
        name: row.get(2)?,
        email: row.get(3)?,
        phone: row.get(4)?,
        company: row.get(5)?,
        created_at: timestamp_column(row, 6)?,
        updated_at: timestamp_column(row, 7)?,
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

fn load_contact(conn: &Connection, identity: Identity, contact_id: ContactId) -> Result<Contact> {
    conn.query_row(
        &format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1 AND (?2 IS NULL OR user_id = ?2)"
        ),
        params![contact_id.to_string(), identity.scope_param()],
        map_contact,
    )
    .optional()
    .context("failed to read contact")?
    .ok_or_else(|| not_found("contact", contact_id))
}

/// Insert a contact unless one with the same normalized email exists, and return
/// the id of whichever row now holds that email. Existing rows are not modified.
pub(crate) fn ensure_contact(conn: &Connection, contact: &NewContact) -> Result<ContactId> {
    contact.validate()?;
    let contact = contact.normalized();
    let now = rfc3339(now_utc())?;
    let id = ContactId::new();

    conn.execute(
        "INSERT INTO contacts(id, user_id, name, email, phone, company, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
         ON CONFLICT DO NOTHING",
        params![
            id.to_string(),
            contact.user_id.to_string(),
            contact.name,
            contact.email,
            contact.phone,
            contact.company,
            now,
        ],
    )
    .context("failed to insert contact")?;

    let Some(email) = contact.email else {
        return Ok(id);
    };
    conn.query_row(
        "SELECT id FROM contacts
         WHERE user_id = ?1 AND lower(email) = ?2 AND email IS NOT NULL AND email <> ''",
        params![contact.user_id.to_string(), email],
        |row| id_column(row, 0),
    )
    .context("failed to resolve contact by email")
}

/// Derive one contact per distinct client email found on tasks, then link tasks
/// that have no contact yet. Existing contacts are skipped, never overwritten.
pub(crate) fn backfill_contacts_tx(conn: &Connection) -> Result<BackfillSummary> {
    let mut stmt = conn
        .prepare(
            "SELECT user_id, lower(trim(client_email)), client_name FROM tasks
             WHERE client_email IS NOT NULL AND trim(client_email) <> ''
             ORDER BY user_id, lower(trim(client_email)), created_at DESC, id DESC",
        )
        .context("failed to prepare contact backfill scan")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, Option<String>>(2)?))
    })?;

    // Rows arrive newest first within each group, so the first name seen wins.
    let mut groups: Vec<(String, String, Option<String>)> = Vec::new();
    for row in rows {
        let (user_id, email, name) = row?;
        match groups.last_mut() {
            Some((last_user, last_email, last_name))
                if *last_user == user_id && *last_email == email =>
            {
                if last_name.is_none() {
                    *last_name = non_blank(name);
                }
            }
            _ => groups.push((user_id, email, non_blank(name))),
        }
    }

    let now = rfc3339(now_utc())?;
    let mut summary = BackfillSummary::default();
    for (user_id, email, name) in groups {
        let inserted = conn
            .execute(
                "INSERT INTO contacts(id, user_id, name, email, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT DO NOTHING",
                params![ContactId::new().to_string(), user_id, name, email, now],
            )
            .context("failed to insert backfilled contact")?;
        if inserted == 1 {
            summary.created += 1;
        } else {
            summary.skipped_existing += 1;
        }
    }

    let linked = conn
        .execute(
            "UPDATE tasks SET contact_id = (
               SELECT c.id FROM contacts c
               WHERE c.user_id = tasks.user_id
                 AND c.email IS NOT NULL AND c.email <> ''
                 AND lower(c.email) = lower(trim(tasks.client_email))
             )
             WHERE contact_id IS NULL
               AND client_email IS NOT NULL AND trim(client_email) <> ''
               AND EXISTS (
                 SELECT 1 FROM contacts c
                 WHERE c.user_id = tasks.user_id
                   AND c.email IS NOT NULL AND c.email <> ''
                   AND lower(c.email) = lower(trim(tasks.client_email))
               )",
            [],
        )
        .context("failed to link tasks to contacts")?;
    summary.linked_tasks = u64::try_from(linked).unwrap_or_default();

    Ok(summary)
}

impl SqliteStore {
    /// Create a contact, or return the existing one with the same normalized email.
    ///
    /// # Errors
    /// Returns `AccessDenied` when an owner writes for someone else or a validation
    /// error when neither a name nor a valid email is given.
    pub fn upsert_contact(&mut self, identity: Identity, contact: &NewContact) -> Result<Contact> {
        authorize_row(identity, Table::Contacts, Operation::Insert, Some(contact.user_id))?;
        let id = ensure_contact(&self.conn, contact)?;
        load_contact(&self.conn, identity, id)
    }

    /// # Errors
    /// Returns `NotFound` when the contact is missing or not visible to `identity`.
    pub fn get_contact(&self, identity: Identity, contact_id: ContactId) -> Result<Contact> {
        authorize(identity, Table::Contacts, Operation::Select)?;
        load_contact(&self.conn, identity, contact_id)
    }

    /// # Errors
    /// Returns an error when the query fails.
    pub fn list_contacts(&self, identity: Identity, user_id: UserId) -> Result<Vec<Contact>> {
        authorize(identity, Table::Contacts, Operation::Select)?;
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {CONTACT_COLUMNS} FROM contacts
                 WHERE user_id = ?1 AND (?2 IS NULL OR user_id = ?2)
                 ORDER BY lower(COALESCE(name, email)), id"
            ))
            .context("failed to prepare contact listing")?;
        let rows = stmt.query_map(
            params![user_id.to_string(), identity.scope_param()],
            map_contact,
        )?;

        let mut contacts = Vec::new();
        for row in rows {
            contacts.push(row?);
        }
        Ok(contacts)
    }

    /// Delete a contact. Tasks and processed emails that referenced it keep their
    /// rows with the reference cleared.
    ///
    /// # Errors
    /// Returns `NotFound` when the contact is missing or not visible to `identity`.
    pub fn delete_contact(&mut self, identity: Identity, contact_id: ContactId) -> Result<()> {
        authorize(identity, Table::Contacts, Operation::Delete)?;
        let deleted = self
            .conn
            .execute(
                "DELETE FROM contacts WHERE id = ?1 AND (?2 IS NULL OR user_id = ?2)",
                params![contact_id.to_string(), identity.scope_param()],
            )
            .context("failed to delete contact")?;
        if deleted == 0 {
            return Err(not_found("contact", contact_id));
        }
        Ok(())
    }

    /// Processed emails linked to a contact, newest first.
    ///
    /// # Errors
    /// Returns `NotFound` when the contact is not visible to `identity`.
    pub fn contact_history(
        &self,
        identity: Identity,
        contact_id: ContactId,
    ) -> Result<Vec<ProcessedEmail>> {
        authorize(identity, Table::ProcessedEmails, Operation::Select)?;
        load_contact(&self.conn, identity, contact_id)?;

        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {PROCESSED_EMAIL_COLUMNS} FROM processed_emails
                 WHERE contact_id = ?1
                 ORDER BY processed_at DESC, email_id"
            ))
            .context("failed to prepare contact history")?;
        let rows = stmt.query_map(params![contact_id.to_string()], map_processed_email)?;

        let mut history = Vec::new();
        for row in rows {
            history.push(row?);
        }
        Ok(history)
    }

    /// # Errors
    /// Returns `AccessDenied` for owner identities or an error when the backfill fails.
    pub fn backfill_contacts(&mut self, identity: Identity) -> Result<BackfillSummary> {
        require_service(identity, Table::Contacts, Operation::Insert)?;
        let tx = self.write_tx()?;
        let summary = backfill_contacts_tx(&tx)?;
        tx.commit().context("failed to commit contact backfill")?;

        tracing::info!(
            created = summary.created,
            skipped_existing = summary.skipped_existing,
            linked_tasks = summary.linked_tasks,
            "contact backfill finished"
        );
        Ok(summary)
    }
}
