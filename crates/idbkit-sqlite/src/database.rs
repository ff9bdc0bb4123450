//! Engine metadata file
//!
//! One SQLite connection shared by every database the engine hosts.
//! Besides raw access it knows how databases, their versions and their
//! table schemas are recorded.

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

use idbkit_engine::{IndexSchema, TableSchema};

use crate::migrations::run_migrations;
use crate::Result;

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let _: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        Self::prepare(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> Result<Self> {
        // Deleting a database cascades to its tables, indexes and records
        conn.pragma_update(None, "foreign_keys", "ON")?;
        run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run `f` in one SQLite transaction; an `Err` rolls everything back.
    pub fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Committed version of `name`, if it exists
    pub fn version_of(&self, name: &str) -> Result<Option<u32>> {
        self.with_connection(|conn| load_version(conn, name))
    }

    /// Table schemas of `name` ordered by table name
    pub fn schemas_of(&self, name: &str) -> Result<Vec<TableSchema>> {
        self.with_connection(|conn| load_schemas(conn, name))
    }

    /// Record `created` and move `name` to `version`. Returns false without
    /// writing anything if the stored version is already at or past it.
    pub fn commit_version(&self, name: &str, version: u32, created: &[TableSchema]) -> Result<bool> {
        self.transaction(|conn| {
            if load_version(conn, name)?.unwrap_or(0) >= version {
                return Ok(false);
            }

            conn.execute(
                "INSERT INTO databases (name, version) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET version = excluded.version",
                rusqlite::params![name, version],
            )?;

            for schema in created {
                conn.execute(
                    "INSERT INTO object_stores (db_name, name, key_path, auto_increment, next_key)
                     VALUES (?1, ?2, ?3, ?4, 1)",
                    rusqlite::params![name, schema.name, schema.key_path, schema.auto_increment],
                )?;
                for (position, index) in schema.indexes.iter().enumerate() {
                    conn.execute(
                        "INSERT INTO indexes (db_name, store_name, name, key_path, is_unique, position)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        rusqlite::params![
                            name,
                            schema.name,
                            index.name,
                            index.key_path,
                            index.unique,
                            position as i64,
                        ],
                    )?;
                }
            }
            Ok(true)
        })
    }

    /// Drop `name` with its tables and records
    pub fn drop_database(&self, name: &str) -> Result<bool> {
        self.with_connection(|conn| {
            Ok(conn.execute("DELETE FROM databases WHERE name = ?1", [name])? > 0)
        })
    }
}

fn load_version(conn: &Connection, name: &str) -> Result<Option<u32>> {
    Ok(conn
        .query_row(
            "SELECT version FROM databases WHERE name = ?1",
            [name],
            |row| row.get(0),
        )
        .optional()?)
}

fn load_schemas(conn: &Connection, name: &str) -> Result<Vec<TableSchema>> {
    let mut stores = conn.prepare(
        "SELECT name, key_path, auto_increment FROM object_stores
         WHERE db_name = ?1 ORDER BY name",
    )?;
    let mut schemas: Vec<TableSchema> = stores
        .query_map([name], |row| {
            Ok(TableSchema::new(
                row.get::<_, String>(0)?,
                row.get(1)?,
                row.get(2)?,
            ))
        })?
        .collect::<std::result::Result<_, _>>()?;

    let mut indexes = conn.prepare(
        "SELECT name, key_path, is_unique FROM indexes
         WHERE db_name = ?1 AND store_name = ?2 ORDER BY position",
    )?;
    for schema in &mut schemas {
        schema.indexes = indexes
            .query_map([name, schema.name.as_str()], |row| {
                Ok(IndexSchema {
                    name: row.get(0)?,
                    key_path: row.get(1)?,
                    unique: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<_, _>>()?;
    }

    Ok(schemas)
}
