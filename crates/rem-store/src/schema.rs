use rusqlite::Connection;

use crate::error::Result;

pub const SCHEMA_VERSION: i64 = 2;

pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    conn.pragma_update(None, "wal_autocheckpoint", 100)?;

    // Fails on in-memory and fresh databases; not fatal.
    if conn
        .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
        .is_ok()
    {
        tracing::debug!("startup WAL checkpoint complete");
    }

    // For v1 databases CREATE TABLE IF NOT EXISTS is a no-op; the columns
    // added since are patched in below.
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS memories (
            id            TEXT PRIMARY KEY,
            title         TEXT NOT NULL,
            note          TEXT NOT NULL DEFAULT '',
            latitude      REAL NOT NULL,
            longitude     REAL NOT NULL,
            radius_meters REAL NOT NULL,
            created_at    INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS visits (
            id        INTEGER PRIMARY KEY AUTOINCREMENT,
            memory_id TEXT REFERENCES memories(id) ON DELETE CASCADE,
            latitude  REAL NOT NULL,
            longitude REAL NOT NULL,
            timestamp INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS regions (
            id              TEXT PRIMARY KEY,
            latitude        REAL NOT NULL,
            longitude       REAL NOT NULL,
            radius_meters   REAL NOT NULL,
            created_at      INTEGER NOT NULL,
            expires_at      INTEGER,
            last_visited_at INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_visits_memory ON visits(memory_id);
        CREATE INDEX IF NOT EXISTS idx_visits_timestamp ON visits(timestamp);
        ",
    )?;

    // v1 → v2: least-recently-visited eviction needs the last visit
    if conn
        .prepare("SELECT last_visited_at FROM regions LIMIT 0")
        .is_err()
    {
        conn.execute_batch("ALTER TABLE regions ADD COLUMN last_visited_at INTEGER;")?;
        backfill_last_visited(conn)?;
    }

    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

/// Seed `regions.last_visited_at` from the newest tagged visit per memory.
fn backfill_last_visited(conn: &Connection) -> Result<()> {
    let updated = conn.execute(
        "UPDATE regions SET last_visited_at = (
             SELECT MAX(v.timestamp) FROM visits v WHERE v.memory_id = regions.id
         )",
        [],
    )?;
    tracing::info!("backfilled last_visited_at on {updated} regions");
    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<Option<i64>> {
    let mut stmt = conn.prepare("SELECT value FROM metadata WHERE key = 'schema_version'")?;
    let version = stmt
        .query_row([], |row| {
            let v: String = row.get(0)?;
            Ok(v.parse::<i64>().unwrap_or(0))
        })
        .ok();
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();

        for table in &["metadata", "memories", "visits", "regions"] {
            let count: i64 = conn
                .query_row(&format!("SELECT count(*) FROM {table}"), [], |row| {
                    row.get(0)
                })
                .unwrap();
            assert!(count >= 0, "table {table} should exist");
        }
    }

    #[test]
    fn test_schema_version_set() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, Some(SCHEMA_VERSION));
    }

    #[test]
    fn test_wal_mode_enabled() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();

        // in-memory databases report "memory"
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert!(mode == "memory" || mode == "wal", "got mode: {mode}");
    }

    #[test]
    fn test_idempotent_initialize() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        initialize(&conn).unwrap();
    }

    #[test]
    fn test_busy_timeout_set() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();

        let timeout: i64 = conn
            .query_row("PRAGMA busy_timeout", [], |row| row.get(0))
            .unwrap();
        assert_eq!(timeout, 5000);
    }

    #[test]
    fn test_foreign_keys_on() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();

        let on: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(on, 1);
    }

    #[test]
    fn test_upgrade_v1_adds_last_visited_at() {
        let conn = Connection::open_in_memory().unwrap();

        conn.execute_batch(
            "
            CREATE TABLE metadata (key TEXT PRIMARY KEY, value TEXT NOT NULL);
            INSERT INTO metadata (key, value) VALUES ('schema_version', '1');

            CREATE TABLE memories (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                note TEXT NOT NULL DEFAULT '',
                latitude REAL NOT NULL, longitude REAL NOT NULL,
                radius_meters REAL NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE visits (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                memory_id TEXT REFERENCES memories(id) ON DELETE CASCADE,
                latitude REAL NOT NULL, longitude REAL NOT NULL,
                timestamp INTEGER NOT NULL
            );
            CREATE TABLE regions (
                id TEXT PRIMARY KEY,
                latitude REAL NOT NULL, longitude REAL NOT NULL,
                radius_meters REAL NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER
            );

            INSERT INTO memories VALUES ('m1', 'cafe', '', 37.0, -122.0, 100.0, 1);
            INSERT INTO memories VALUES ('m2', 'park', '', 37.1, -122.1, 100.0, 2);
            INSERT INTO visits (memory_id, latitude, longitude, timestamp) VALUES ('m1', 37.0, -122.0, 500);
            INSERT INTO visits (memory_id, latitude, longitude, timestamp) VALUES ('m1', 37.0, -122.0, 900);
            INSERT INTO regions VALUES ('m1', 37.0, -122.0, 100.0, 1, NULL);
            INSERT INTO regions VALUES ('m2', 37.1, -122.1, 100.0, 2, NULL);
            ",
        )
        .unwrap();

        initialize(&conn).unwrap();

        let last: Option<i64> = conn
            .query_row(
                "SELECT last_visited_at FROM regions WHERE id = 'm1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(last, Some(900));

        let never: Option<i64> = conn
            .query_row(
                "SELECT last_visited_at FROM regions WHERE id = 'm2'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(never, None);

        assert_eq!(get_schema_version(&conn).unwrap(), Some(2));
    }
}
