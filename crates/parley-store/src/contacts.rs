//! CRUD operations for saved [`Contact`]s and email lookup of principals.
//!
//! A contact is owned by one principal and points at another principal
//! through its lowercase email; the link is resolved at read time, so a
//! contact saved before its user registered still resolves later.

use rusqlite::params;

use parley_shared::models::{Contact, ContactEntry, ContactMatch, UserSummary};
use parley_shared::types::{ContactId, UserId};

use crate::database::Database;
use crate::error::{not_found, Result, StoreError};
use crate::rows::{fmt_ts, opt_uuid_at, ts_at, uuid_at};

const CONTACT_COLUMNS: &str = "c.id, c.owner, c.name, c.phone, c.email, c.created_at, c.updated_at";

impl Database {
    pub fn insert_contact(&self, contact: &Contact) -> Result<()> {
        self.conn().execute(
            "INSERT INTO contacts (id, owner, name, phone, email, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                contact.id.to_string(),
                contact.owner.to_string(),
                contact.name,
                contact.phone,
                contact.email,
                fmt_ts(&contact.created_at),
                fmt_ts(&contact.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_contact(&self, id: ContactId) -> Result<Contact> {
        self.conn()
            .query_row(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts c WHERE c.id = ?1"),
                params![id.to_string()],
                row_to_contact,
            )
            .map_err(not_found)
    }

    pub fn find_contact(&self, owner: UserId, email: &str) -> Result<Option<Contact>> {
        match self.conn().query_row(
            &format!("SELECT {CONTACT_COLUMNS} FROM contacts c WHERE c.owner = ?1 AND c.email = ?2"),
            params![owner.to_string(), email],
            row_to_contact,
        ) {
            Ok(contact) => Ok(Some(contact)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// `owner`'s contacts by name, each with the principal it resolves to.
    pub fn contact_entries(&self, owner: UserId) -> Result<Vec<ContactEntry>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CONTACT_COLUMNS}, u.id, u.name, u.email
             FROM contacts c
             LEFT JOIN users u ON u.email = c.email AND u.id <> c.owner
             WHERE c.owner = ?1
             ORDER BY c.name COLLATE NOCASE ASC, c.created_at ASC"
        ))?;

        let rows = stmt.query_map(params![owner.to_string()], |row| {
            let contact = row_to_contact(row)?;
            let user = match opt_uuid_at(row, 7)? {
                Some(id) => Some(UserSummary {
                    id: UserId(id),
                    name: row.get(8)?,
                    email: row.get(9)?,
                }),
                None => None,
            };
            Ok(ContactEntry { contact, user })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn get_contact_entry(&self, id: ContactId) -> Result<ContactEntry> {
        let contact = self.get_contact(id)?;
        let user = self
            .find_user_by_email(&contact.email)?
            .filter(|u| u.id != contact.owner)
            .map(|u| u.summary());
        Ok(ContactEntry { contact, user })
    }

    /// Rewrite name, phone, email and `updated_at`.
    pub fn update_contact(&self, contact: &Contact) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE contacts SET name = ?2, phone = ?3, email = ?4, updated_at = ?5 WHERE id = ?1",
            params![
                contact.id.to_string(),
                contact.name,
                contact.phone,
                contact.email,
                fmt_ts(&contact.updated_at),
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn delete_contact(&self, id: ContactId) -> Result<()> {
        let affected = self
            .conn()
            .execute("DELETE FROM contacts WHERE id = ?1", params![id.to_string()])?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Principals other than `searcher` whose email contains `fragment`
    /// (case-insensitive), flagged when `searcher` already saved them.
    pub fn search_users_by_email(
        &self,
        searcher: UserId,
        fragment: &str,
        limit: usize,
    ) -> Result<Vec<ContactMatch>> {
        let mut stmt = self.conn().prepare(
            "SELECT u.id, u.name, u.email,
                    EXISTS (SELECT 1 FROM contacts c WHERE c.owner = ?1 AND c.email = u.email)
             FROM users u
             WHERE u.id <> ?1 AND instr(lower(u.email), lower(?2)) > 0
             ORDER BY u.email ASC
             LIMIT ?3",
        )?;

        let rows = stmt.query_map(
            params![searcher.to_string(), fragment, limit as i64],
            |row| {
                Ok(ContactMatch {
                    user: UserSummary {
                        id: UserId(uuid_at(row, 0)?),
                        name: row.get(1)?,
                        email: row.get(2)?,
                    },
                    is_saved: row.get(3)?,
                })
            },
        )?;

        let mut matches = Vec::new();
        for row in rows {
            matches.push(row?);
        }
        Ok(matches)
    }
}

fn row_to_contact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Contact> {
    Ok(Contact {
        id: ContactId(uuid_at(row, 0)?),
        owner: UserId(uuid_at(row, 1)?),
        name: row.get(2)?,
        phone: row.get(3)?,
        email: row.get(4)?,
        created_at: ts_at(row, 5)?,
        updated_at: ts_at(row, 6)?,
    })
}
