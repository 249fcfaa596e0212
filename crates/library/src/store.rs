use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::{now_secs, Album, Artist, Track, TrackTags};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::LibraryError;
use crate::schema;

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const TRACK_COLUMNS: &str = "t.id, t.path, t.fingerprint, t.title, t.album_id, al.name, \
     t.artist_id, ar.name, t.track_no, t.disc_no, t.duration, t.genre, t.year, \
     t.last_modified, t.indexed_at";

const TRACK_JOINS: &str = "FROM tracks t \
     LEFT JOIN albums al ON al.id = t.album_id \
     LEFT JOIN artists ar ON ar.id = t.artist_id";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LibraryStats {
    pub artists: usize,
    pub albums: usize,
    pub tracks: usize,
    pub scan_errors: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanErrorEntry {
    pub path: String,
    pub message: String,
    pub last_seen: i64,
}

/// Handle to the on-disk index. Cheap to clone; every call opens its own
/// connection so reads never contend with a scan's open transaction.
#[derive(Clone, Debug)]
pub struct LibraryStore {
    db_path: PathBuf,
    art_dir: PathBuf,
}

impl LibraryStore {
    pub fn open(db_path: PathBuf, art_dir: PathBuf) -> Result<Self, LibraryError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::create_dir_all(&art_dir)?;

        let store = Self { db_path, art_dir };
        let mut conn = store.connect()?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let found = schema::migrate(&mut conn)?;
        if found < schema::SCHEMA_VERSION {
            info!(
                "Library db at {:?} upgraded from version {} to {}",
                store.db_path,
                found,
                schema::SCHEMA_VERSION
            );
        } else {
            info!("Loaded library db from {:?}", store.db_path);
        }
        Ok(store)
    }

    pub fn connect(&self) -> Result<Connection, LibraryError> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute("PRAGMA foreign_keys = ON;", [])?;
        Ok(conn)
    }

    pub fn art_dir(&self) -> &Path {
        &self.art_dir
    }

    pub fn get_or_create_artist(&self, name: &str) -> Result<Option<i64>, LibraryError> {
        Ok(get_or_create_artist(&self.connect()?, name)?)
    }

    pub fn get_or_create_album(
        &self,
        name: &str,
        artist_id: Option<i64>,
        year: Option<i32>,
    ) -> Result<Option<i64>, LibraryError> {
        Ok(get_or_create_album(&self.connect()?, name, artist_id, year)?)
    }

    pub fn upsert_track(
        &self,
        path: &str,
        fingerprint: &str,
        tags: &TrackTags,
        album_id: Option<i64>,
        artist_id: Option<i64>,
        last_modified: f64,
    ) -> Result<bool, LibraryError> {
        Ok(upsert_track(
            &self.connect()?,
            path,
            fingerprint,
            tags,
            album_id,
            artist_id,
            last_modified,
        )?)
    }

    pub fn prune_tracks_not_in(&self, current_paths: &HashSet<String>) -> Result<usize, LibraryError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let removed = prune_tracks_not_in(&tx, current_paths)?;
        tx.commit()?;
        Ok(removed)
    }

    pub fn list_artists(&self) -> Result<Vec<Artist>, LibraryError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, name FROM artists ORDER BY name COLLATE NOCASE, id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Artist {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// All albums, or only those credited to `artist_id`.
    pub fn list_albums(&self, artist_id: Option<i64>) -> Result<Vec<Album>, LibraryError> {
        let conn = self.connect()?;
        let base = "SELECT al.id, al.name, al.artist_id, ar.name, al.year, al.art_filename \
             FROM albums al LEFT JOIN artists ar ON ar.id = al.artist_id";
        let order = "ORDER BY al.name COLLATE NOCASE, al.id";
        let mut albums = match artist_id {
            Some(artist_id) => {
                let mut stmt =
                    conn.prepare(&format!("{} WHERE al.artist_id = ?1 {}", base, order))?;
                let rows = stmt.query_map(params![artist_id], album_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!("{} {}", base, order))?;
                let rows = stmt.query_map([], album_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        for album in &mut albums {
            album.art_path = album
                .art_filename
                .as_deref()
                .and_then(|name| self.existing_art(name));
        }
        Ok(albums)
    }

    pub fn list_tracks(&self, album_id: i64) -> Result<Vec<Track>, LibraryError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} {} WHERE t.album_id = ?1 \
             ORDER BY t.disc_no, t.track_no, t.title COLLATE NOCASE, t.id",
            TRACK_COLUMNS, TRACK_JOINS
        ))?;
        let rows = stmt.query_map(params![album_id], track_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn find_track_by_path(&self, path: &str) -> Result<Option<Track>, LibraryError> {
        let conn = self.connect()?;
        let track = conn
            .query_row(
                &format!("SELECT {} {} WHERE t.path = ?1", TRACK_COLUMNS, TRACK_JOINS),
                params![path],
                track_from_row,
            )
            .optional()?;
        Ok(track)
    }

    /// Thumbnail of the album the track at `path` belongs to, if one is on disk.
    pub fn find_art_path_for_track(&self, path: &str) -> Result<Option<PathBuf>, LibraryError> {
        let conn = self.connect()?;
        let filename: Option<Option<String>> = conn
            .query_row(
                "SELECT al.art_filename FROM tracks t \
                 JOIN albums al ON al.id = t.album_id WHERE t.path = ?1",
                params![path],
                |row| row.get(0),
            )
            .optional()?;
        Ok(filename
            .flatten()
            .and_then(|name| self.existing_art(&name)))
    }

    pub fn track_path(&self, track_id: i64) -> Result<Option<String>, LibraryError> {
        let conn = self.connect()?;
        let path = conn
            .query_row(
                "SELECT path FROM tracks WHERE id = ?1",
                params![track_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(path)
    }

    pub fn stats(&self) -> Result<LibraryStats, LibraryError> {
        let conn = self.connect()?;
        let count = |table: &str| -> Result<usize, rusqlite::Error> {
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|value| value.max(0) as usize)
        };
        Ok(LibraryStats {
            artists: count("artists")?,
            albums: count("albums")?,
            tracks: count("tracks")?,
            scan_errors: count("scan_errors")?,
        })
    }

    pub fn list_scan_errors(&self) -> Result<Vec<ScanErrorEntry>, LibraryError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT path, message, last_seen FROM scan_errors ORDER BY path",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ScanErrorEntry {
                path: row.get(0)?,
                message: row.get(1)?,
                last_seen: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn existing_art(&self, filename: &str) -> Option<PathBuf> {
        let path = self.art_dir.join(filename);
        path.is_file().then_some(path)
    }
}

fn album_from_row(row: &Row<'_>) -> rusqlite::Result<Album> {
    Ok(Album {
        id: row.get(0)?,
        name: row.get(1)?,
        artist_id: row.get(2)?,
        artist_name: row.get(3)?,
        year: row.get(4)?,
        art_filename: row.get(5)?,
        art_path: None,
    })
}

fn track_from_row(row: &Row<'_>) -> rusqlite::Result<Track> {
    Ok(Track {
        id: row.get(0)?,
        path: row.get(1)?,
        fingerprint: row.get(2)?,
        title: row.get(3)?,
        album_id: row.get(4)?,
        album_name: row.get(5)?,
        artist_id: row.get(6)?,
        artist_name: row.get(7)?,
        track_no: row.get(8)?,
        disc_no: row.get(9)?,
        duration_secs: row.get(10)?,
        genre: row.get(11)?,
        year: row.get(12)?,
        last_modified: row.get(13)?,
        indexed_at: row.get(14)?,
    })
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _) if inner.code == ErrorCode::ConstraintViolation
    )
}

fn find_artist(conn: &Connection, name: &str) -> rusqlite::Result<Option<i64>> {
    conn.query_row(
        "SELECT id FROM artists WHERE name = ?1",
        params![name],
        |row| row.get(0),
    )
    .optional()
}

/// Id of the artist called `name` (case-insensitive), inserting it if needed.
/// Blank names have no artist.
pub fn get_or_create_artist(conn: &Connection, name: &str) -> rusqlite::Result<Option<i64>> {
    let name = name.trim();
    if name.is_empty() {
        return Ok(None);
    }
    if let Some(id) = find_artist(conn, name)? {
        return Ok(Some(id));
    }
    match conn.execute("INSERT INTO artists (name) VALUES (?1)", params![name]) {
        Ok(_) => Ok(Some(conn.last_insert_rowid())),
        // Another writer inserted the same name in between.
        Err(err) if is_constraint_violation(&err) => find_artist(conn, name),
        Err(err) => Err(err),
    }
}

fn find_album(
    conn: &Connection,
    name: &str,
    artist_id: Option<i64>,
) -> rusqlite::Result<Option<i64>> {
    conn.query_row(
        "SELECT id FROM albums WHERE name = ?1 AND artist_id IS ?2",
        params![name, artist_id],
        |row| row.get(0),
    )
    .optional()
}

/// Id of the album identified by (`name`, `artist_id`). `year` is only
/// recorded when the row is created.
pub fn get_or_create_album(
    conn: &Connection,
    name: &str,
    artist_id: Option<i64>,
    year: Option<i32>,
) -> rusqlite::Result<Option<i64>> {
    let name = name.trim();
    if name.is_empty() {
        return Ok(None);
    }
    if let Some(id) = find_album(conn, name, artist_id)? {
        return Ok(Some(id));
    }
    match conn.execute(
        "INSERT INTO albums (name, artist_id, year) VALUES (?1, ?2, ?3)",
        params![name, artist_id, year],
    ) {
        Ok(_) => Ok(Some(conn.last_insert_rowid())),
        Err(err) if is_constraint_violation(&err) => find_album(conn, name, artist_id),
        Err(err) => Err(err),
    }
}

pub fn album_has_art(conn: &Connection, album_id: i64) -> rusqlite::Result<bool> {
    let filename: Option<Option<String>> = conn
        .query_row(
            "SELECT art_filename FROM albums WHERE id = ?1",
            params![album_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(matches!(filename, Some(Some(_))))
}

/// Records the album's thumbnail unless one is already set. Returns whether it was written.
pub fn set_album_art_if_missing(
    conn: &Connection,
    album_id: i64,
    filename: &str,
) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE albums SET art_filename = ?1 WHERE id = ?2 AND art_filename IS NULL",
        params![filename, album_id],
    )?;
    Ok(changed > 0)
}

/// True when the stored row for `path` has exactly this fingerprint and mtime.
pub fn track_is_unchanged(
    conn: &Connection,
    path: &str,
    fingerprint: &str,
    last_modified: f64,
) -> rusqlite::Result<bool> {
    let stored: Option<(Option<String>, Option<f64>)> = conn
        .query_row(
            "SELECT fingerprint, last_modified FROM tracks WHERE path = ?1",
            params![path],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(matches!(
        stored,
        Some((Some(stored_fingerprint), Some(stored_modified)))
            if stored_fingerprint == fingerprint && stored_modified == last_modified
    ))
}

/// Inserts or refreshes the row for `path`. Returns `false` without writing
/// when the stored fingerprint and mtime already match.
pub fn upsert_track(
    conn: &Connection,
    path: &str,
    fingerprint: &str,
    tags: &TrackTags,
    album_id: Option<i64>,
    artist_id: Option<i64>,
    last_modified: f64,
) -> rusqlite::Result<bool> {
    if track_is_unchanged(conn, path, fingerprint, last_modified)? {
        return Ok(false);
    }
    conn.execute(
        "INSERT INTO tracks (path, fingerprint, title, album_id, artist_id, track_no, \
             disc_no, duration, genre, year, last_modified, indexed_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
         ON CONFLICT(path) DO UPDATE SET \
             fingerprint = excluded.fingerprint, \
             title = excluded.title, \
             album_id = excluded.album_id, \
             artist_id = excluded.artist_id, \
             track_no = excluded.track_no, \
             disc_no = excluded.disc_no, \
             duration = excluded.duration, \
             genre = excluded.genre, \
             year = excluded.year, \
             last_modified = excluded.last_modified, \
             indexed_at = excluded.indexed_at",
        params![
            path,
            fingerprint,
            tags.title,
            album_id,
            artist_id,
            tags.track_no,
            tags.disc_no,
            tags.duration_secs,
            tags.genre,
            tags.year,
            last_modified,
            now_secs(),
        ],
    )?;
    conn.execute("DELETE FROM scan_errors WHERE path = ?1", params![path])?;
    Ok(true)
}

pub fn record_scan_error(conn: &Connection, path: &str, message: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO scan_errors (path, message, last_seen) VALUES (?1, ?2, ?3) \
         ON CONFLICT(path) DO UPDATE SET message = excluded.message, last_seen = excluded.last_seen",
        params![path, message, now_secs()],
    )?;
    Ok(())
}

/// Deletes every track (and scan error) whose path is not in `current_paths`.
/// Returns the number of tracks removed.
pub fn prune_tracks_not_in(
    conn: &Connection,
    current_paths: &HashSet<String>,
) -> rusqlite::Result<usize> {
    let stale_tracks = stale_paths(conn, "SELECT path FROM tracks", current_paths)?;
    let mut delete = conn.prepare("DELETE FROM tracks WHERE path = ?1")?;
    let mut removed = 0usize;
    for path in &stale_tracks {
        removed += delete.execute(params![path])?;
    }

    let stale_errors = stale_paths(conn, "SELECT path FROM scan_errors", current_paths)?;
    let mut delete = conn.prepare("DELETE FROM scan_errors WHERE path = ?1")?;
    for path in &stale_errors {
        delete.execute(params![path])?;
    }
    Ok(removed)
}

fn stale_paths(
    conn: &Connection,
    sql: &str,
    current_paths: &HashSet<String>,
) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let paths = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut stale = Vec::new();
    for path in paths {
        let path = path?;
        if !current_paths.contains(&path) {
            stale.push(path);
        }
    }
    Ok(stale)
}
