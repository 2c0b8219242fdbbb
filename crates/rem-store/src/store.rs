use std::path::Path;

use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use uuid::Uuid;

use rem_core::{
    CollaboratorError, Coordinate, Memory, MonitoredRegion, Storage, UnixMillis, Visit,
};

use crate::error::{Result, StoreError};
use crate::schema;

pub struct Store {
    conn: Connection,
}

/// Row counts for `rem stats`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub memories: u64,
    pub visits: u64,
    pub regions: u64,
    pub schema_version: Option<i64>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    // --- Metadata ---

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    // --- Memories ---

    /// Insert a memory under a fresh v4 id.
    pub fn create_memory(
        &self,
        title: &str,
        note: &str,
        coordinate: Coordinate,
        radius_meters: f64,
        created_at: UnixMillis,
    ) -> Result<Memory> {
        let memory = Memory {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            note: note.to_string(),
            coordinate,
            radius_meters,
            created_at,
        };
        self.insert_memory(&memory)?;
        Ok(memory)
    }

    pub fn insert_memory(&self, memory: &Memory) -> Result<()> {
        if !memory.coordinate.is_valid() {
            return Err(StoreError::InvalidData(format!(
                "memory '{}' has invalid coordinate {}",
                memory.id, memory.coordinate
            )));
        }
        self.conn.execute(
            "INSERT INTO memories (id, title, note, latitude, longitude, radius_meters, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                memory.id,
                memory.title,
                memory.note,
                memory.coordinate.latitude,
                memory.coordinate.longitude,
                memory.radius_meters,
                to_sql_millis(memory.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_memory(&self, id: &str) -> Result<Option<Memory>> {
        let memory = self
            .conn
            .query_row(
                "SELECT id, title, note, latitude, longitude, radius_meters, created_at
                 FROM memories WHERE id = ?1",
                [id],
                memory_from_row,
            )
            .optional()?;
        Ok(memory)
    }

    /// Newest first.
    pub fn list_memories(&self) -> Result<Vec<Memory>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title, note, latitude, longitude, radius_meters, created_at
             FROM memories ORDER BY created_at DESC, rowid DESC",
        )?;
        let memories = stmt
            .query_map([], memory_from_row)?
            .collect::<std::result::Result<_, _>>()?;
        Ok(memories)
    }

    /// Deletes the memory and, by cascade, its visits. Returns whether a
    /// row was removed.
    pub fn remove_memory(&self, id: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM memories WHERE id = ?1", [id])?;
        Ok(n > 0)
    }

    // --- Visits ---

    pub fn add_visit(
        &self,
        coordinate: Coordinate,
        timestamp: UnixMillis,
        memory_id: Option<&str>,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO visits (memory_id, latitude, longitude, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![
                memory_id,
                coordinate.latitude,
                coordinate.longitude,
                to_sql_millis(timestamp)
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Most recent first. `memory_id = None` returns every visit.
    pub fn visits(&self, memory_id: Option<&str>, limit: usize) -> Result<Vec<Visit>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let visits = match memory_id {
            Some(id) => {
                let mut stmt = self.conn.prepare(
                    "SELECT memory_id, latitude, longitude, timestamp FROM visits
                     WHERE memory_id = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2",
                )?;
                stmt.query_map(params![id, limit], visit_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = self.conn.prepare(
                    "SELECT memory_id, latitude, longitude, timestamp FROM visits
                     ORDER BY timestamp DESC, id DESC LIMIT ?1",
                )?;
                stmt.query_map([limit], visit_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            }
        };
        Ok(visits)
    }

    // --- Regions ---

    pub fn upsert_region(&self, region: &MonitoredRegion) -> Result<()> {
        self.conn.execute(
            "INSERT INTO regions (id, latitude, longitude, radius_meters, created_at, expires_at, last_visited_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                 latitude = excluded.latitude,
                 longitude = excluded.longitude,
                 radius_meters = excluded.radius_meters,
                 created_at = excluded.created_at,
                 expires_at = excluded.expires_at,
                 last_visited_at = excluded.last_visited_at",
            params![
                region.id,
                region.center.latitude,
                region.center.longitude,
                region.radius_meters,
                to_sql_millis(region.created_at),
                region.expires_at.map(to_sql_millis),
                region.last_visited_at.map(to_sql_millis),
            ],
        )?;
        Ok(())
    }

    /// Oldest-created first.
    pub fn get_regions(&self) -> Result<Vec<MonitoredRegion>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, latitude, longitude, radius_meters, created_at, expires_at, last_visited_at
             FROM regions ORDER BY created_at, rowid",
        )?;
        let regions = stmt
            .query_map([], |row| {
                Ok(MonitoredRegion {
                    id: row.get(0)?,
                    center: Coordinate::new(row.get(1)?, row.get(2)?),
                    radius_meters: row.get(3)?,
                    created_at: from_sql_millis(row.get(4)?),
                    expires_at: row.get::<_, Option<i64>>(5)?.map(from_sql_millis),
                    last_visited_at: row.get::<_, Option<i64>>(6)?.map(from_sql_millis),
                })
            })?
            .collect::<std::result::Result<_, _>>()?;
        Ok(regions)
    }

    pub fn delete_region(&self, id: &str) -> Result<bool> {
        let n = self.conn.execute("DELETE FROM regions WHERE id = ?1", [id])?;
        Ok(n > 0)
    }

    // --- Maintenance ---

    pub fn stats(&self) -> Result<StoreStats> {
        Ok(StoreStats {
            memories: self.count("memories")?,
            visits: self.count("visits")?,
            regions: self.count("regions")?,
            schema_version: schema::get_schema_version(&self.conn)?,
        })
    }

    fn count(&self, table: &str) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            })?;
        Ok(u64::try_from(n).unwrap_or(0))
    }

    /// Fold the WAL back into the main database file.
    pub fn checkpoint(&self) -> Result<()> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }
}

impl Storage for Store {
    fn record_visit(
        &mut self,
        coordinate: Coordinate,
        timestamp: UnixMillis,
        memory_id: Option<&str>,
    ) -> std::result::Result<(), CollaboratorError> {
        self.add_visit(coordinate, timestamp, memory_id)?;
        Ok(())
    }

    fn find_memory_by_id(&self, id: &str) -> std::result::Result<Option<Memory>, CollaboratorError> {
        Ok(self.get_memory(id)?)
    }

    fn delete_memory(&mut self, id: &str) -> std::result::Result<(), CollaboratorError> {
        self.remove_memory(id)?;
        Ok(())
    }

    fn load_regions(&self) -> std::result::Result<Vec<MonitoredRegion>, CollaboratorError> {
        Ok(self.get_regions()?)
    }

    fn save_region(&mut self, region: &MonitoredRegion) -> std::result::Result<(), CollaboratorError> {
        Ok(self.upsert_region(region)?)
    }

    fn remove_region(&mut self, id: &str) -> std::result::Result<(), CollaboratorError> {
        self.delete_region(id)?;
        Ok(())
    }
}

fn memory_from_row(row: &Row<'_>) -> rusqlite::Result<Memory> {
    Ok(Memory {
        id: row.get(0)?,
        title: row.get(1)?,
        note: row.get(2)?,
        coordinate: Coordinate::new(row.get(3)?, row.get(4)?),
        radius_meters: row.get(5)?,
        created_at: from_sql_millis(row.get(6)?),
    })
}

fn visit_from_row(row: &Row<'_>) -> rusqlite::Result<Visit> {
    Ok(Visit {
        memory_id: row.get(0)?,
        coordinate: Coordinate::new(row.get(1)?, row.get(2)?),
        timestamp: from_sql_millis(row.get(3)?),
    })
}

// SQLite integers are i64; timestamps are unsigned milliseconds.
fn to_sql_millis(millis: UnixMillis) -> i64 {
    i64::try_from(millis).unwrap_or(i64::MAX)
}

fn from_sql_millis(value: i64) -> UnixMillis {
    u64::try_from(value).unwrap_or(0)
}
