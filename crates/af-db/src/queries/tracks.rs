//! Track catalogue operations.

use chrono::Utc;
use rusqlite::Connection;

use af_core::{Error, Result, TrackId, UserId};

use crate::models::Track;

const COLS: &str = "id, user_id, title, artist, album, duration_secs, file_path, quality,
    size_bytes, mime_type, created_at, updated_at";

/// Metadata supplied when registering an uploaded file as a track.
#[derive(Debug, Clone)]
pub struct NewTrack<'a> {
    pub user_id: UserId,
    pub title: &'a str,
    pub artist: &'a str,
    pub album: Option<&'a str>,
    pub file_path: &'a str,
    pub size_bytes: i64,
    pub mime_type: Option<&'a str>,
}

/// Register a new track. Duration is filled in later by probing.
pub fn create_track(conn: &Connection, new: &NewTrack) -> Result<Track> {
    let id = TrackId::new();
    let now = Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO tracks (id, user_id, title, artist, album, file_path, size_bytes,
            mime_type, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
        rusqlite::params![
            id.to_string(),
            new.user_id.to_string(),
            new.title,
            new.artist,
            new.album,
            new.file_path,
            new.size_bytes,
            new.mime_type,
            &now
        ],
    )
    .map_err(|e| Error::database(e.to_string()))?;

    Ok(Track {
        id,
        user_id: new.user_id,
        title: new.title.to_string(),
        artist: new.artist.to_string(),
        album: new.album.map(String::from),
        duration_secs: None,
        file_path: new.file_path.to_string(),
        quality: None,
        size_bytes: new.size_bytes,
        mime_type: new.mime_type.map(String::from),
        created_at: now.clone(),
        updated_at: now,
    })
}

/// Get a track by ID.
pub fn get_track(conn: &Connection, id: TrackId) -> Result<Option<Track>> {
    let q = format!("SELECT {COLS} FROM tracks WHERE id = ?1");
    let result = conn.query_row(&q, [id.to_string()], Track::from_row);
    match result {
        Ok(t) => Ok(Some(t)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(Error::database(e.to_string())),
    }
}

/// List tracks, newest first.
pub fn list_tracks(conn: &Connection, offset: i64, limit: i64) -> Result<Vec<Track>> {
    let q = format!(
        "SELECT {COLS} FROM tracks ORDER BY created_at DESC LIMIT ?1 OFFSET ?2"
    );
    let mut stmt = conn
        .prepare(&q)
        .map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map(rusqlite::params![limit, offset], Track::from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}

/// Record the probed duration of a track.
pub fn set_duration(conn: &Connection, id: TrackId, duration_secs: f64) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let n = conn
        .execute(
            "UPDATE tracks SET duration_secs = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![duration_secs, &now, id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::init_memory_pool;
    use crate::queries::users;

    fn new_track<'a>(file_path: &'a str) -> NewTrack<'a> {
        NewTrack {
            user_id: users::system_user_id(),
            title: "Night Drive",
            artist: "Test Artist",
            album: Some("Demo"),
            file_path,
            size_bytes: 1024,
            mime_type: Some("audio/flac"),
        }
    }

    #[test]
    fn create_and_get() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        let track = create_track(&conn, &new_track("/uploads/a.flac")).unwrap();
        assert!(track.duration_secs.is_none());

        let found = get_track(&conn, track.id).unwrap().unwrap();
        assert_eq!(found.title, "Night Drive");
        assert_eq!(found.album.as_deref(), Some("Demo"));
    }

    #[test]
    fn duplicate_file_path_refused() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        create_track(&conn, &new_track("/uploads/dup.flac")).unwrap();
        assert!(create_track(&conn, &new_track("/uploads/dup.flac")).is_err());
    }

    #[test]
    fn list_pagination() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        for i in 0..5 {
            create_track(&conn, &new_track(&format!("/uploads/{i}.flac"))).unwrap();
        }

        let all = list_tracks(&conn, 0, 100).unwrap();
        assert_eq!(all.len(), 5);

        let page = list_tracks(&conn, 2, 2).unwrap();
        assert_eq!(page.len(), 2);
    }

    #[test]
    fn duration_update() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        let track = create_track(&conn, &new_track("/uploads/d.flac")).unwrap();

        assert!(set_duration(&conn, track.id, 183.5).unwrap());
        let found = get_track(&conn, track.id).unwrap().unwrap();
        assert!((found.duration_secs.unwrap() - 183.5).abs() < f64::EPSILON);
    }

    #[test]
    fn unknown_track_is_none() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        assert!(get_track(&conn, TrackId::new()).unwrap().is_none());
    }
}
