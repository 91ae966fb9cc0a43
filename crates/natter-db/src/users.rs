use rusqlite::{Connection, OptionalExtension, params};
use tracing::{info, warn};

use natter_types::models::User;

use crate::error::{StoreError, StoreResult, is_unique_violation};
use crate::{Database, IdKind, now};

pub const MIN_USERNAME_LEN: usize = 3;
pub const MAX_USERNAME_LEN: usize = 32;

impl Database {
    /// Return the user called `name`, creating it on first login.
    pub fn ensure_user(&self, name: &str) -> StoreResult<User> {
        let name = validate_username(name)?;

        let created = self.with_tx(|tx| {
            if let Some(existing) = query_user_by_name(tx, name)? {
                return Ok(existing);
            }

            let user = User {
                id: self.next_id(tx, IdKind::User)?,
                name: name.to_string(),
                photo_id: None,
                created_at: now(),
            };
            tx.execute(
                "INSERT INTO users (id, name, created_at) VALUES (?1, ?2, ?3)",
                params![user.id, user.name, user.created_at],
            )
            .map_err(|e| conflict_or_internal(e, name))?;

            info!("Created user {} ({})", user.name, user.id);
            Ok(user)
        });

        match created {
            // Another writer claimed the name between our check and insert.
            Err(StoreError::Conflict(_)) => {
                warn!("Username {} created concurrently, re-reading", name);
                self.find_user_by_name(name)
            }
            other => other,
        }
    }

    pub fn get_user(&self, user_id: &str) -> StoreResult<User> {
        self.with_conn(|conn| {
            query_user_by_id(conn, user_id)?.ok_or_else(|| StoreError::not_found(format!("user {}", user_id)))
        })
    }

    pub fn find_user_by_name(&self, name: &str) -> StoreResult<User> {
        self.with_conn(|conn| {
            query_user_by_name(conn, name.trim())?
                .ok_or_else(|| StoreError::not_found(format!("user '{}'", name.trim())))
        })
    }

    pub fn rename_user(&self, user_id: &str, new_name: &str) -> StoreResult<User> {
        let new_name = validate_username(new_name)?;

        self.with_tx(|tx| {
            let mut user = query_user_by_id(tx, user_id)?
                .ok_or_else(|| StoreError::not_found(format!("user {}", user_id)))?;
            if user.name == new_name {
                return Ok(user);
            }
            if query_user_by_name(tx, new_name)?.is_some() {
                return Err(StoreError::Conflict(format!("username '{}' is taken", new_name)));
            }

            tx.execute("UPDATE users SET name = ?1 WHERE id = ?2", params![new_name, user_id])
                .map_err(|e| conflict_or_internal(e, new_name))?;

            info!("Renamed user {} from {} to {}", user_id, user.name, new_name);
            user.name = new_name.to_string();
            Ok(user)
        })
    }

    pub fn set_user_photo(&self, user_id: &str, data: &[u8], media_type: &str) -> StoreResult<User> {
        self.with_tx(|tx| {
            let mut user = query_user_by_id(tx, user_id)?
                .ok_or_else(|| StoreError::not_found(format!("user {}", user_id)))?;

            let media_id = self.insert_media(tx, data, media_type)?;
            tx.execute("UPDATE users SET photo_id = ?1 WHERE id = ?2", params![media_id, user_id])?;

            user.photo_id = Some(media_id);
            Ok(user)
        })
    }
}

fn conflict_or_internal(e: rusqlite::Error, name: &str) -> StoreError {
    if is_unique_violation(&e) {
        StoreError::Conflict(format!("username '{}' is taken", name))
    } else {
        e.into()
    }
}

/// Trim and check a username. Returns the trimmed form.
pub fn validate_username(name: &str) -> StoreResult<&str> {
    let name = name.trim();
    let len = name.chars().count();
    if !(MIN_USERNAME_LEN..=MAX_USERNAME_LEN).contains(&len) {
        return Err(StoreError::Validation(format!(
            "username must be {}-{} characters",
            MIN_USERNAME_LEN, MAX_USERNAME_LEN
        )));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')) {
        return Err(StoreError::Validation(format!(
            "username '{}' may only contain letters, digits, '_', '.' and '-'",
            name
        )));
    }
    Ok(name)
}

pub(crate) fn user_exists(conn: &Connection, user_id: &str) -> StoreResult<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM users WHERE id = ?1)",
        [user_id],
        |row| row.get(0),
    )?)
}

pub(crate) fn query_user_by_id(conn: &Connection, id: &str) -> StoreResult<Option<User>> {
    let mut stmt = conn.prepare("SELECT id, name, photo_id, created_at FROM users WHERE id = ?1")?;
    Ok(stmt.query_row([id], map_user).optional()?)
}

pub(crate) fn query_user_by_name(conn: &Connection, name: &str) -> StoreResult<Option<User>> {
    let mut stmt = conn.prepare("SELECT id, name, photo_id, created_at FROM users WHERE name = ?1")?;
    Ok(stmt.query_row([name], map_user).optional()?)
}

fn map_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        name: row.get(1)?,
        photo_id: row.get(2)?,
        created_at: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{count, db};

    #[test]
    fn first_login_creates_then_returns_same_user() {
        let db = db();
        let first = db.ensure_user("alice").unwrap();
        let again = db.ensure_user("  alice ").unwrap();

        assert_eq!(first, again);
        assert!(IdKind::User.matches(&first.id));
        assert_eq!(count(&db, "users"), 1);
    }

    #[test]
    fn username_rules() {
        assert!(validate_username("ab").is_err());
        assert!(validate_username("has space").is_err());
        assert!(validate_username(&"x".repeat(33)).is_err());
        assert_eq!(validate_username(" bob.smith-2 ").unwrap(), "bob.smith-2");
    }

    #[test]
    fn rename_rejects_taken_name() {
        let db = db();
        let alice = db.ensure_user("alice").unwrap();
        db.ensure_user("bob").unwrap();

        assert!(db.rename_user(&alice.id, "bob").unwrap_err().is_conflict());

        let renamed = db.rename_user(&alice.id, "alicia").unwrap();
        assert_eq!(renamed.name, "alicia");
        assert_eq!(db.find_user_by_name("alicia").unwrap().id, alice.id);
        assert!(db.find_user_by_name("alice").unwrap_err().is_not_found());
    }

    #[test]
    fn photo_update_stores_blob() {
        let db = db();
        let alice = db.ensure_user("alice").unwrap();

        let updated = db.set_user_photo(&alice.id, b"jpegbytes", "image/jpeg").unwrap();
        let photo_id = updated.photo_id.unwrap();
        assert_eq!(db.get_media(&photo_id).unwrap().data, b"jpegbytes");
        assert_eq!(db.get_user(&alice.id).unwrap().photo_id, Some(photo_id));
    }

    #[test]
    fn photo_update_for_unknown_user_writes_nothing() {
        let db = db();
        let err = db.set_user_photo("AAAAAAAAAAAA", b"x", "image/png").unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(count(&db, "media"), 0);
    }
}
