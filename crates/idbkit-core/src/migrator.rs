//! Schema migrator
//!
//! Creates a table the first time a record is written to an unknown name:
//! the connection is closed, reopened at the next version, and the table
//! plus one index per field of the sample record are created inside the
//! version change. The schema is never touched again after that.
//!
//! A failed creation aborts the version change, so neither the table nor
//! the version bump is stored, and the handle is reopened at the version it
//! had before. If another connection has already moved the stored version
//! on, the handle catches up to it and tries again from there.

use idbkit_engine::{EngineError, Record, TableSchema, VersionChange};

use crate::connection::{ConnectionHandle, ConnectionState, Opened};
use crate::error::StoreError;
use crate::Result;

/// Version bumps tried before giving up on a database that keeps moving
const MAX_ATTEMPTS: usize = 3;

/// How one bump attempt ended.
enum Attempt {
    Created(TableSchema),
    /// The handle now sits on a newer stored version; check again
    Behind,
}

/// Make sure `table` exists, creating it from `sample` if needed.
///
/// Callers must hold the handle exclusively so migrations run one at a time.
pub async fn ensure_table(
    handle: &mut ConnectionHandle,
    table: &str,
    sample: &Record,
    key_field: Option<&str>,
) -> Result<TableSchema> {
    handle.database()?;

    for _ in 0..MAX_ATTEMPTS {
        if let Some(schema) = handle.schema(table) {
            if schema.key_path.as_deref() != key_field {
                tracing::debug!(
                    table = %table,
                    key_path = ?schema.key_path,
                    requested = ?key_field,
                    "Table exists with a different key path; keeping it"
                );
            }
            return Ok(schema);
        }

        match bump(handle, table, sample, key_field).await? {
            Attempt::Created(schema) => return Ok(schema),
            Attempt::Behind => continue,
        }
    }

    Err(StoreError::Schema {
        table: table.to_string(),
        source: EngineError::InvalidState(format!(
            "database '{}' moved on during {} attempts",
            handle.name(),
            MAX_ATTEMPTS
        )),
    })
}

async fn bump(
    handle: &mut ConnectionHandle,
    table: &str,
    sample: &Record,
    key_field: Option<&str>,
) -> Result<Attempt> {
    let from = handle.current_version();
    let to = from + 1;
    handle.begin_migration()?;

    let mut change = match handle.request(Some(to)).await {
        Ok(Opened::Upgrade(change)) => change,
        Ok(Opened::Ready(database)) => {
            // Another connection already committed `to`
            handle.install(database)?;
            tracing::debug!(database = %handle.name(), version = to, "Caught up with stored version");
            return Ok(Attempt::Behind);
        }
        Err(StoreError::Connection {
            source: EngineError::Version { current, .. },
            ..
        }) => {
            tracing::debug!(
                database = %handle.name(),
                requested = to,
                current,
                "Stored version is ahead; reopening at it"
            );
            reopen(handle, None).await?;
            return Ok(Attempt::Behind);
        }
        Err(err) => {
            let _ = reopen(handle, Some(from)).await;
            return Err(err);
        }
    };

    if let Err(source) = build_table(&mut change, table, sample, key_field) {
        tracing::warn!(table = %table, error = %source, "Table creation failed; aborting upgrade");
        change.abort();
        let _ = reopen(handle, Some(from)).await;
        return Err(StoreError::Schema {
            table: table.to_string(),
            source,
        });
    }

    let database = match change.commit() {
        Ok(database) => database,
        Err(source) => {
            tracing::warn!(table = %table, error = %source, "Version change failed to commit");
            let _ = reopen(handle, Some(from)).await;
            return Err(StoreError::Schema {
                table: table.to_string(),
                source,
            });
        }
    };
    handle.install(database)?;

    let schema = handle.schema(table).ok_or_else(|| StoreError::Schema {
        table: table.to_string(),
        source: EngineError::NotFound(format!("table '{}' after upgrade", table)),
    })?;

    tracing::info!(
        database = %handle.name(),
        table = %table,
        version = to,
        key_path = ?schema.key_path,
        indexes = schema.indexes.len(),
        "Created table"
    );

    Ok(Attempt::Created(schema))
}

fn build_table(
    change: &mut VersionChange,
    table: &str,
    sample: &Record,
    key_field: Option<&str>,
) -> std::result::Result<(), EngineError> {
    change.create_table(table, key_field, key_field.is_none())?;
    for field in sample.keys() {
        change.create_index(table, field, field, key_field == Some(field.as_str()))?;
    }
    Ok(())
}

/// Reopen a migrating handle at `version` (or the stored one). A handle
/// that cannot be reopened is left `Failed`.
async fn reopen(handle: &mut ConnectionHandle, version: Option<u32>) -> Result<()> {
    let reopened = match handle.request(version).await {
        Ok(Opened::Ready(database)) => Ok(database),
        Ok(Opened::Upgrade(change)) => change.commit().map_err(|source| StoreError::Connection {
            name: handle.name().to_string(),
            source,
        }),
        Err(err) => Err(err),
    };

    match reopened.and_then(|database| handle.install(database)) {
        Ok(()) => {
            tracing::debug!(
                database = %handle.name(),
                version = handle.current_version(),
                "Reopened during migration"
            );
            Ok(())
        }
        Err(err) => {
            tracing::error!(database = %handle.name(), error = %err, "Failed to reopen during migration");
            let _ = handle.transition(ConnectionState::Failed);
            Err(err)
        }
    }
}
