//! Reference adapter backed by rusqlite.

use crate::backend::{DatabaseAdapter, SqlRow, SqlValue};
use crate::error::{RepositoryError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;

/// SQLite implementation of the adapter contract.
///
/// The connection is wrapped in a mutex so the adapter can be shared across
/// threads; SQLite itself serializes writers anyway.
pub struct SqliteAdapter {
    conn: Mutex<Connection>,
}

impl SqliteAdapter {
    /// Open or create a database file and ensure the table layout exists.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let adapter = SqliteAdapter {
            conn: Mutex::new(conn),
        };
        adapter.initialize_tables()?;
        Ok(adapter)
    }

    /// Open an in-memory database (used heavily in tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let adapter = SqliteAdapter {
            conn: Mutex::new(conn),
        };
        adapter.initialize_tables()?;
        Ok(adapter)
    }

    fn initialize_tables(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS principals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS schema_versions (
                version INTEGER PRIMARY KEY,
                specification TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sequences (
                name TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS entities (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid TEXT NOT NULL UNIQUE,
                type TEXT NOT NULL,
                name TEXT NOT NULL UNIQUE,
                auth_key TEXT,
                resolved_auth_key TEXT,
                status TEXT NOT NULL,
                valid INTEGER NOT NULL DEFAULT 1,
                valid_published INTEGER,
                dirty INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                latest_entity_versions_id INTEGER,
                published_entity_versions_id INTEGER
            );

            CREATE TABLE IF NOT EXISTS entity_versions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entities_id INTEGER NOT NULL REFERENCES entities(id),
                version INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                created_by INTEGER NOT NULL REFERENCES principals(id),
                fields TEXT NOT NULL,
                UNIQUE (entities_id, version)
            );

            CREATE TABLE IF NOT EXISTS entity_latest_locations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entities_id INTEGER NOT NULL REFERENCES entities(id),
                lat REAL NOT NULL,
                lng REAL NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_entity_latest_locations_entity
                ON entity_latest_locations(entities_id);

            CREATE TABLE IF NOT EXISTS unique_index_values (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entities_id INTEGER NOT NULL REFERENCES entities(id),
                index_name TEXT NOT NULL,
                value TEXT NOT NULL,
                latest INTEGER NOT NULL DEFAULT 0,
                published INTEGER NOT NULL DEFAULT 0,
                UNIQUE (entities_id, index_name, value)
            );

            CREATE INDEX IF NOT EXISTS idx_unique_index_values_lookup
                ON unique_index_values(index_name, value);

            CREATE TABLE IF NOT EXISTS advisory_locks (
                name TEXT PRIMARY KEY,
                handle INTEGER NOT NULL,
                acquired_at INTEGER NOT NULL,
                renewed_at INTEGER NOT NULL,
                lease_duration INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid TEXT NOT NULL UNIQUE,
                type TEXT NOT NULL,
                created_by INTEGER NOT NULL REFERENCES principals(id),
                created_at TEXT NOT NULL,
                payload TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS event_entity_versions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                events_id INTEGER NOT NULL REFERENCES events(id),
                entity_versions_id INTEGER NOT NULL REFERENCES entity_versions(id)
            );
            ",
        )?;
        // FTS over the latest version's text content; rowid mirrors entities.id.
        conn.execute_batch(
            "CREATE VIRTUAL TABLE IF NOT EXISTS entities_latest_fts USING fts5(content);",
        )?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means a panic mid-statement; continuing with the
        // connection is still sound for SQLite.
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn to_rusqlite(value: &SqlValue) -> rusqlite::types::Value {
    match value {
        SqlValue::Null => rusqlite::types::Value::Null,
        SqlValue::Integer(n) => rusqlite::types::Value::Integer(*n),
        SqlValue::Real(f) => rusqlite::types::Value::Real(*f),
        SqlValue::Text(s) => rusqlite::types::Value::Text(s.clone()),
    }
}

fn from_rusqlite(value: rusqlite::types::Value) -> SqlValue {
    match value {
        rusqlite::types::Value::Null => SqlValue::Null,
        rusqlite::types::Value::Integer(n) => SqlValue::Integer(n),
        rusqlite::types::Value::Real(f) => SqlValue::Real(f),
        rusqlite::types::Value::Text(s) => SqlValue::Text(s),
        rusqlite::types::Value::Blob(b) => {
            SqlValue::Text(String::from_utf8_lossy(&b).into_owned())
        }
    }
}

impl DatabaseAdapter for SqliteAdapter {
    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(sql)?;
        let column_count = stmt.column_count();
        let bound: Vec<rusqlite::types::Value> = params.iter().map(to_rusqlite).collect();

        let mapped = stmt.query_map(rusqlite::params_from_iter(bound.iter()), |row| {
            let mut values = Vec::with_capacity(column_count);
            for i in 0..column_count {
                values.push(from_rusqlite(row.get::<_, rusqlite::types::Value>(i)?));
            }
            Ok(SqlRow::new(values))
        })?;

        let mut rows = Vec::new();
        for row in mapped {
            rows.push(row?);
        }
        Ok(rows)
    }

    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        let conn = self.lock();
        let bound: Vec<rusqlite::types::Value> = params.iter().map(to_rusqlite).collect();
        let count = conn.execute(sql, rusqlite::params_from_iter(bound.iter()))?;
        Ok(count)
    }

    fn begin_transaction(&self) -> Result<()> {
        self.lock().execute_batch("BEGIN TRANSACTION")?;
        Ok(())
    }

    fn commit_transaction(&self) -> Result<()> {
        self.lock().execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback_transaction(&self) -> Result<()> {
        self.lock().execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn begin_savepoint(&self, name: &str) -> Result<()> {
        self.lock().execute_batch(&format!("SAVEPOINT {name}"))?;
        Ok(())
    }

    fn release_savepoint(&self, name: &str) -> Result<()> {
        self.lock().execute_batch(&format!("RELEASE {name}"))?;
        Ok(())
    }

    fn rollback_savepoint(&self, name: &str) -> Result<()> {
        self.lock()
            .execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}"))?;
        Ok(())
    }

    fn is_unique_violation(&self, error: &RepositoryError, constraint: &str) -> bool {
        match error {
            RepositoryError::Sqlite(err) => {
                let text = err.to_string();
                text.contains("UNIQUE constraint failed") && text.contains(constraint)
            }
            _ => false,
        }
    }

    fn encode_cursor(&self, raw: &str) -> String {
        STANDARD.encode(raw.as_bytes())
    }

    fn decode_cursor(&self, encoded: &str) -> Result<String> {
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|_| RepositoryError::bad_request(format!("malformed cursor: {encoded}")))?;
        String::from_utf8(bytes)
            .map_err(|_| RepositoryError::bad_request(format!("malformed cursor: {encoded}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_roundtrip() {
        let adapter = SqliteAdapter::open_in_memory().unwrap();
        adapter
            .execute("CREATE TABLE t (a INTEGER, b TEXT, c REAL)", &[])
            .unwrap();
        adapter
            .execute(
                "INSERT INTO t (a, b, c) VALUES (?1, ?2, ?3)",
                &[
                    SqlValue::Integer(42),
                    SqlValue::text("hello"),
                    SqlValue::Real(2.5),
                ],
            )
            .unwrap();

        let rows = adapter.query("SELECT a, b, c FROM t", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].integer(0).unwrap(), 42);
        assert_eq!(rows[0].text(1).unwrap(), "hello");
        assert_eq!(rows[0].real(2).unwrap(), 2.5);
    }

    #[test]
    fn test_cursor_roundtrip() {
        let adapter = SqliteAdapter::open_in_memory().unwrap();
        for raw in ["123", "hello world", "", "käse"] {
            let encoded = adapter.encode_cursor(raw);
            assert_eq!(adapter.decode_cursor(&encoded).unwrap(), raw);
        }
    }

    #[test]
    fn test_decode_cursor_malformed() {
        let adapter = SqliteAdapter::open_in_memory().unwrap();
        let err = adapter.decode_cursor("!!! not base64 !!!").unwrap_err();
        assert!(matches!(err, RepositoryError::BadRequest(_)));
    }

    #[test]
    fn test_unique_violation_detection() {
        let adapter = SqliteAdapter::open_in_memory().unwrap();
        adapter
            .execute("CREATE TABLE u (name TEXT NOT NULL UNIQUE)", &[])
            .unwrap();
        adapter
            .execute("INSERT INTO u (name) VALUES ('x')", &[])
            .unwrap();
        let err = adapter
            .execute("INSERT INTO u (name) VALUES ('x')", &[])
            .unwrap_err();
        assert!(adapter.is_unique_violation(&err, "u.name"));
        assert!(!adapter.is_unique_violation(&err, "u.other"));
        assert!(!adapter.is_unique_violation(&RepositoryError::generic("nope"), "u.name"));
    }

    #[test]
    fn test_fts_table_available() {
        let adapter = SqliteAdapter::open_in_memory().unwrap();
        adapter
            .execute(
                "INSERT INTO entities_latest_fts (rowid, content) VALUES (1, 'quick brown fox')",
                &[],
            )
            .unwrap();
        let rows = adapter
            .query(
                "SELECT rowid FROM entities_latest_fts WHERE entities_latest_fts MATCH ?1",
                &[SqlValue::text("fox")],
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].integer(0).unwrap(), 1);
    }

    #[test]
    fn test_open_file_backed() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("repo.db");
        {
            let adapter = SqliteAdapter::open(&path).unwrap();
            adapter
                .execute(
                    "INSERT INTO sequences (name, value) VALUES ('x', 7)",
                    &[],
                )
                .unwrap();
        }
        let adapter = SqliteAdapter::open(&path).unwrap();
        let row = adapter
            .query_one("SELECT value FROM sequences WHERE name = 'x'", &[])
            .unwrap();
        assert_eq!(row.integer(0).unwrap(), 7);
    }
}
