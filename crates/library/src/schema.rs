use rusqlite::{Connection, Transaction};
use tracing::info;

pub const SCHEMA_VERSION: u32 = 2;

type Migration = fn(&Transaction) -> rusqlite::Result<()>;

// Index i upgrades a database from version i to i + 1.
const MIGRATIONS: &[Migration] = &[create_core_tables, add_scan_bookkeeping];

fn create_core_tables(tx: &Transaction) -> rusqlite::Result<()> {
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS artists (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE COLLATE NOCASE
        );
        CREATE TABLE IF NOT EXISTS albums (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL COLLATE NOCASE,
            artist_id INTEGER REFERENCES artists(id) ON DELETE CASCADE,
            art_filename TEXT,
            year INTEGER
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_albums_identity
            ON albums(name COLLATE NOCASE, IFNULL(artist_id, -1));
        CREATE TABLE IF NOT EXISTS tracks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            path TEXT NOT NULL UNIQUE,
            fingerprint TEXT,
            title TEXT,
            album_id INTEGER REFERENCES albums(id) ON DELETE SET NULL,
            artist_id INTEGER REFERENCES artists(id) ON DELETE SET NULL,
            track_no INTEGER,
            disc_no INTEGER,
            duration REAL,
            genre TEXT,
            year INTEGER,
            last_modified REAL
        );
        CREATE INDEX IF NOT EXISTS idx_tracks_album ON tracks(album_id);
        CREATE INDEX IF NOT EXISTS idx_tracks_artist ON tracks(artist_id);",
    )
}

fn add_scan_bookkeeping(tx: &Transaction) -> rusqlite::Result<()> {
    if !has_column(tx, "tracks", "indexed_at")? {
        tx.execute_batch("ALTER TABLE tracks ADD COLUMN indexed_at INTEGER;")?;
    }
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS scan_errors (
            path TEXT PRIMARY KEY,
            message TEXT NOT NULL,
            last_seen INTEGER NOT NULL
        );",
    )
}

fn has_column(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({});", table))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.query_row("PRAGMA user_version;", [], |row| row.get(0))
}

/// Brings the database up to `SCHEMA_VERSION` in one transaction.
/// Returns the version found before migrating.
pub fn migrate(conn: &mut Connection) -> rusqlite::Result<u32> {
    let found = schema_version(conn)?;
    if found >= SCHEMA_VERSION {
        return Ok(found);
    }

    let tx = conn.transaction()?;
    for (from, migration) in MIGRATIONS.iter().enumerate().skip(found as usize) {
        info!("Migrating library db from version {} to {}", from, from + 1);
        migration(&tx)?;
    }
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    tx.commit()?;
    Ok(found)
}
