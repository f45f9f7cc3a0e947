//! Contact directory.
//!
//! Each principal keeps a private list of saved contacts. A contact can only
//! be saved for an email that belongs to a registered principal, which is
//! how an endpoint turns an address it knows into a callee or chat partner.

use chrono::Utc;
use tracing::{debug, info};

use parley_shared::constants::MAX_CONTACT_SEARCH_RESULTS;
use parley_shared::models::{Contact, ContactEntry, ContactMatch};
use parley_shared::protocol::{ContactDraft, ContactPatch};
use parley_shared::types::{ContactId, UserId};

use parley_store::Database;

use crate::error::{OrNotFound, ServerError};
use crate::store::StoreHandle;

#[derive(Clone)]
pub struct ContactDirectory {
    store: StoreHandle,
}

impl ContactDirectory {
    pub fn new(store: StoreHandle) -> Self {
        Self { store }
    }

    /// The owner's contacts sorted by name.
    pub fn list(&self, owner: UserId) -> Result<Vec<ContactEntry>, ServerError> {
        Ok(self.store.with(|db| db.contact_entries(owner))?)
    }

    pub fn add(&self, owner: UserId, draft: ContactDraft) -> Result<ContactEntry, ServerError> {
        let name = required("name", &draft.name)?;
        let phone = required("phone", &draft.phone)?;
        let email = normalize_email(&draft.email)?;

        // Checks and insert run under one store lock.
        let entry = self.store.with(|db| -> Result<_, ServerError> {
            check_target(db, owner, &email)?;

            let now = Utc::now();
            let contact = Contact {
                id: ContactId::new(),
                owner,
                name,
                phone,
                email,
                created_at: now,
                updated_at: now,
            };
            db.insert_contact(&contact)?;
            Ok(db.get_contact_entry(contact.id)?)
        })?;

        info!(owner = %owner, contact = %entry.contact.id, "Contact saved");
        Ok(entry)
    }

    /// Apply the fields present in `patch`. Only the owner may update.
    pub fn update(
        &self,
        owner: UserId,
        id: ContactId,
        patch: ContactPatch,
    ) -> Result<ContactEntry, ServerError> {
        let name = patch.name.as_deref().map(|n| required("name", n)).transpose()?;
        let phone = patch.phone.as_deref().map(|p| required("phone", p)).transpose()?;
        let email = patch.email.as_deref().map(normalize_email).transpose()?;

        let entry = self.store.with(|db| -> Result<_, ServerError> {
            let mut contact = owned(db, owner, id)?;

            if let Some(email) = email {
                if email != contact.email {
                    check_target(db, owner, &email)?;
                    contact.email = email;
                }
            }
            if let Some(name) = name {
                contact.name = name;
            }
            if let Some(phone) = phone {
                contact.phone = phone;
            }
            contact.updated_at = Utc::now();

            db.update_contact(&contact).or_not_found("contact", id)?;
            Ok(db.get_contact_entry(id)?)
        })?;

        debug!(owner = %owner, contact = %id, "Contact updated");
        Ok(entry)
    }

    pub fn remove(&self, owner: UserId, id: ContactId) -> Result<(), ServerError> {
        self.store.with(|db| -> Result<_, ServerError> {
            owned(db, owner, id)?;
            db.delete_contact(id).or_not_found("contact", id)
        })?;

        info!(owner = %owner, contact = %id, "Contact removed");
        Ok(())
    }

    /// Registered principals whose email contains `email`, excluding the
    /// searcher.
    pub fn search(&self, searcher: UserId, email: &str) -> Result<Vec<ContactMatch>, ServerError> {
        let fragment = email.trim();
        if fragment.is_empty() {
            return Err(ServerError::Validation("email query is required".into()));
        }
        Ok(self.store.with(|db| {
            db.search_users_by_email(searcher, fragment, MAX_CONTACT_SEARCH_RESULTS)
        })?)
    }
}

fn required(field: &str, value: &str) -> Result<String, ServerError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ServerError::Validation(format!("{field} is required")));
    }
    Ok(value.to_string())
}

fn normalize_email(raw: &str) -> Result<String, ServerError> {
    let email = raw.trim().to_lowercase();
    if !email.contains('@') {
        return Err(ServerError::Validation(format!("invalid email: {email}")));
    }
    Ok(email)
}

/// `email` must belong to another registered principal that `owner` has
/// not saved yet.
fn check_target(db: &Database, owner: UserId, email: &str) -> Result<(), ServerError> {
    if db.find_contact(owner, email)?.is_some() {
        return Err(ServerError::Validation(format!(
            "contact already exists: {email}"
        )));
    }
    match db.find_user_by_email(email)? {
        None => Err(ServerError::Validation(format!(
            "no registered user with email {email}"
        ))),
        Some(user) if user.id == owner => Err(ServerError::Validation(
            "cannot save yourself as a contact".into(),
        )),
        Some(_) => Ok(()),
    }
}

fn owned(db: &Database, owner: UserId, id: ContactId) -> Result<Contact, ServerError> {
    let contact = db.get_contact(id).or_not_found("contact", id)?;
    if contact.owner != owner {
        return Err(ServerError::Forbidden(format!(
            "contact {id} belongs to another user"
        )));
    }
    Ok(contact)
}
