//! Metadata schema migrations
//!
//! The metadata schema version lives in `PRAGMA user_version`.
//! Tables: databases, object_stores, indexes, records

use crate::Result;
use rusqlite::Connection;

const SCHEMA_VERSION: i32 = 1;

pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if current > SCHEMA_VERSION {
        return Err(crate::StorageError::Corrupt(format!(
            "metadata schema v{} is newer than supported v{}",
            current, SCHEMA_VERSION
        )));
    }

    if current < 1 {
        migrate_v1(conn)?;
    }

    if current != SCHEMA_VERSION {
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    }
    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    tracing::info!("Running migration v1: engine metadata");

    // One row per named database with its committed version
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS databases (
            name TEXT PRIMARY KEY,
            version INTEGER NOT NULL
        );
    "#,
    )?;

    // Tables (object stores) and their key configuration
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS object_stores (
            db_name TEXT NOT NULL,
            name TEXT NOT NULL,
            key_path TEXT,
            auto_increment INTEGER NOT NULL DEFAULT 0,
            next_key INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (db_name, name),
            FOREIGN KEY (db_name) REFERENCES databases(name) ON DELETE CASCADE
        );
    "#,
    )?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS indexes (
            db_name TEXT NOT NULL,
            store_name TEXT NOT NULL,
            name TEXT NOT NULL,
            key_path TEXT NOT NULL,
            is_unique INTEGER NOT NULL DEFAULT 0,
            position INTEGER NOT NULL,
            PRIMARY KEY (db_name, store_name, name),
            FOREIGN KEY (db_name, store_name)
                REFERENCES object_stores(db_name, name) ON DELETE CASCADE
        );
    "#,
    )?;

    // key_kind 0 = integer key, 1 = text key; ordering follows (kind, int, text)
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            db_name TEXT NOT NULL,
            store_name TEXT NOT NULL,
            key_kind INTEGER NOT NULL,
            key_int INTEGER NOT NULL DEFAULT 0,
            key_text TEXT NOT NULL DEFAULT '',
            value TEXT NOT NULL,
            PRIMARY KEY (db_name, store_name, key_kind, key_int, key_text),
            FOREIGN KEY (db_name, store_name)
                REFERENCES object_stores(db_name, name) ON DELETE CASCADE
        );
    "#,
    )?;

    Ok(())
}
