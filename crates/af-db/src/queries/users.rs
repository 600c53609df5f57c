//! User records. Only what track ownership needs; authentication lives in
//! the web layer.

use chrono::Utc;
use rusqlite::Connection;
use uuid::Uuid;

use af_core::{Error, Result, UserId};

use crate::models::User;

/// Well-known owner of tracks registered outside a user session (seeded by
/// migration V3).
pub fn system_user_id() -> UserId {
    UserId::from(Uuid::nil())
}

/// Create a new user.
pub fn create_user(conn: &Connection, username: &str) -> Result<User> {
    let id = UserId::new();
    let now = Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO users (id, username, created_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![id.to_string(), username, &now],
    )
    .map_err(|e| Error::database(e.to_string()))?;

    Ok(User {
        id,
        username: username.to_string(),
        created_at: now,
    })
}

/// Get a user by ID.
pub fn get_user(conn: &Connection, id: UserId) -> Result<Option<User>> {
    let result = conn.query_row(
        "SELECT id, username, created_at FROM users WHERE id = ?1",
        [id.to_string()],
        User::from_row,
    );
    match result {
        Ok(u) => Ok(Some(u)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(Error::database(e.to_string())),
    }
}
