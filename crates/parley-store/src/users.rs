//! CRUD operations for [`User`] records and their persisted presence.

use chrono::{DateTime, Utc};
use rusqlite::params;

use parley_shared::models::{Presence, User};
use parley_shared::types::UserId;

use crate::database::Database;
use crate::error::{not_found, Result, StoreError};
use crate::rows::{fmt_ts, opt_ts_at, ts_at, uuid_at};

const USER_COLUMNS: &str = "id, name, email, is_online, last_seen, created_at";

impl Database {
    pub fn insert_user(&self, user: &User) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users (id, name, email, is_online, last_seen, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user.id.to_string(),
                user.name,
                user.email,
                user.is_online,
                user.last_seen.as_ref().map(fmt_ts),
                fmt_ts(&user.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: UserId) -> Result<User> {
        self.conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id.to_string()],
                row_to_user,
            )
            .map_err(not_found)
    }

    pub fn user_exists(&self, id: UserId) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM users WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        match self.conn().query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1"),
            params![email],
            row_to_user,
        ) {
            Ok(user) => Ok(Some(user)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist a presence change. Fails with `NotFound` when the principal
    /// has no user row, so callers never broadcast an unpersisted change.
    pub fn set_presence(
        &self,
        id: UserId,
        is_online: bool,
        last_seen: DateTime<Utc>,
    ) -> Result<Presence> {
        let affected = self.conn().execute(
            "UPDATE users SET is_online = ?2, last_seen = ?3 WHERE id = ?1",
            params![id.to_string(), is_online, fmt_ts(&last_seen)],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(Presence {
            user_id: id,
            is_online,
            last_seen: Some(last_seen),
        })
    }

    pub fn get_presence(&self, id: UserId) -> Result<Presence> {
        let user = self.get_user(id)?;
        Ok(Presence {
            user_id: user.id,
            is_online: user.is_online,
            last_seen: user.last_seen,
        })
    }

    /// Principals who know `id`: everyone sharing a chat with it plus
    /// everyone holding it in their saved contacts. Excludes `id`.
    pub fn contacts_of(&self, id: UserId) -> Result<Vec<UserId>> {
        let mut stmt = self.conn().prepare(
            "SELECT other.user_id
             FROM chat_participants me
             JOIN chat_participants other ON other.chat_id = me.chat_id
             WHERE me.user_id = ?1 AND other.user_id <> ?1
             UNION
             SELECT c.owner
             FROM contacts c
             JOIN users u ON u.email = c.email
             WHERE u.id = ?1 AND c.owner <> ?1",
        )?;

        let rows = stmt.query_map(params![id.to_string()], |row| uuid_at(row, 0))?;

        let mut contacts = Vec::new();
        for row in rows {
            contacts.push(UserId(row?));
        }
        Ok(contacts)
    }

    /// Mark every principal offline, e.g. after an unclean shutdown.
    pub fn reset_presence(&self, now: DateTime<Utc>) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE users SET is_online = 0, last_seen = ?1 WHERE is_online = 1",
            params![fmt_ts(&now)],
        )?;
        Ok(affected)
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: UserId(uuid_at(row, 0)?),
        name: row.get(1)?,
        email: row.get(2)?,
        is_online: row.get(3)?,
        last_seen: opt_ts_at(row, 4)?,
        created_at: ts_at(row, 5)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn make_user(db: &Database, name: &str) -> User {
        let user = User {
            id: UserId::new(),
            name: name.to_string(),
            email: format!("{}@example.com", name.to_lowercase()),
            is_online: false,
            last_seen: None,
            created_at: Utc::now(),
        };
        db.insert_user(&user).unwrap();
        user
    }

    #[test]
    fn insert_and_get_user() {
        let db = Database::open_in_memory().unwrap();
        let user = make_user(&db, "Ada");

        assert_eq!(db.get_user(user.id).unwrap(), user);
        assert!(db.user_exists(user.id).unwrap());
        assert_eq!(
            db.find_user_by_email("ada@example.com").unwrap(),
            Some(user)
        );
    }

    #[test]
    fn missing_user_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            db.get_user(UserId::new()),
            Err(StoreError::NotFound)
        ));
        assert!(!db.user_exists(UserId::new()).unwrap());
    }

    #[test]
    fn presence_requires_a_user_row() {
        let db = Database::open_in_memory().unwrap();
        let user = make_user(&db, "Ada");
        let now = Utc::now();

        let presence = db.set_presence(user.id, true, now).unwrap();
        assert!(presence.is_online);
        assert_eq!(db.get_presence(user.id).unwrap().last_seen, Some(now));

        assert!(matches!(
            db.set_presence(UserId::new(), true, now),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn contacts_of_covers_chats_and_saved_contacts() {
        use crate::chats::tests::make_chat;
        use crate::contacts::tests::save_contact;

        let db = Database::open_in_memory().unwrap();
        let ada = make_user(&db, "Ada");
        let bob = make_user(&db, "Bob");
        let cy = make_user(&db, "Cy");
        let eve = make_user(&db, "Eve");

        make_chat(&db, &[ada.id, bob.id]);
        save_contact(&db, cy.id, "Ada", &ada.email);
        save_contact(&db, bob.id, "Ada", &ada.email);
        save_contact(&db, ada.id, "Eve", &eve.email);

        let mut audience = db.contacts_of(ada.id).unwrap();
        audience.sort();
        let mut expected = vec![bob.id, cy.id];
        expected.sort();
        assert_eq!(audience, expected);
    }

    #[test]
    fn reset_presence_marks_everyone_offline() {
        let db = Database::open_in_memory().unwrap();
        let a = make_user(&db, "Ada");
        let b = make_user(&db, "Bob");
        db.set_presence(a.id, true, Utc::now()).unwrap();
        db.set_presence(b.id, true, Utc::now()).unwrap();

        assert_eq!(db.reset_presence(Utc::now()).unwrap(), 2);
        assert!(!db.get_presence(a.id).unwrap().is_online);
    }
}
