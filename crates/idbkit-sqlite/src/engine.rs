//! SQLite storage engine

use rusqlite::{Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use idbkit_engine::exec::{self, StoreAccess};
use idbkit_engine::{
    plan_open, BatchExecutor, EngineDatabase, EngineError, EngineTransaction, Faults, Key,
    OpenEvent, OpenPlan, OpenRequest, Operation, QueuedTransaction, Record, RequestEvent,
    StorageEngine, TableSchema, TransactionMode, UpgradeTarget, VersionChange,
};

use crate::database::Database;
use crate::error::{backend, StorageError};
use crate::Result;

type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Clone)]
pub struct SqliteEngine {
    db: Database,
    faults: Arc<Faults>,
}

impl SqliteEngine {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = Database::open(path)?;
        Ok(Self {
            db,
            faults: Arc::new(Faults::new()),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory()?;
        Ok(Self {
            db,
            faults: Arc::new(Faults::new()),
        })
    }

    pub fn faults(&self) -> &Arc<Faults> {
        &self.faults
    }

    /// Stored version of `name`, if the database exists
    pub fn stored_version(&self, name: &str) -> Result<Option<u32>> {
        self.db.version_of(name)
    }

    /// Drop a database with all its tables and records
    pub fn delete_database(&self, name: &str) -> Result<bool> {
        let removed = self.db.drop_database(name)?;
        if removed {
            tracing::info!(database = %name, "Deleted database");
        }
        Ok(removed)
    }

    fn connection(&self, name: &str, version: u32) -> Result<Arc<dyn EngineDatabase>> {
        let tables: BTreeMap<String, TableSchema> = self
            .db
            .schemas_of(name)?
            .into_iter()
            .map(|schema| (schema.name.clone(), schema))
            .collect();

        Ok(Arc::new(SqliteDatabase {
            name: name.to_string(),
            version,
            tables,
            db: self.db.clone(),
            faults: Arc::clone(&self.faults),
            closed: AtomicBool::new(false),
        }))
    }

    fn plan(
        &self,
        name: &str,
        version: Option<u32>,
        events: &mpsc::UnboundedSender<OpenEvent>,
    ) -> EngineResult<OpenEvent> {
        let current = self.stored_version(name).map_err(backend)?.unwrap_or(0);

        match plan_open(current, version)? {
            OpenPlan::Open(version) => Ok(OpenEvent::Success(
                self.connection(name, version).map_err(backend)?,
            )),
            OpenPlan::Upgrade { from, to } => {
                let existing = self.db.schemas_of(name).map_err(backend)?;
                Ok(OpenEvent::UpgradeNeeded(VersionChange::new(
                    from,
                    to,
                    existing,
                    Box::new(SqliteUpgrade {
                        engine: self.clone(),
                        name: name.to_string(),
                    }),
                    Arc::clone(&self.faults),
                    events.clone(),
                )))
            }
        }
    }
}

impl StorageEngine for SqliteEngine {
    fn is_supported(&self) -> bool {
        !self.faults.unsupported()
    }

    fn open(&self, name: &str, version: Option<u32>) -> OpenRequest {
        let (events, request) = OpenRequest::channel();

        if !self.is_supported() {
            let _ = events.send(OpenEvent::Error(EngineError::Unsupported));
            return request;
        }
        if self.faults.reject_open() {
            let _ = events.send(OpenEvent::Error(EngineError::Rejected(format!(
                "open of '{}' refused",
                name
            ))));
            return request;
        }

        let event = self
            .plan(name, version, &events)
            .unwrap_or_else(OpenEvent::Error);
        let _ = events.send(event);

        request
    }
}

struct SqliteUpgrade {
    engine: SqliteEngine,
    name: String,
}

impl UpgradeTarget for SqliteUpgrade {
    fn apply(
        self: Box<Self>,
        version: u32,
        created: Vec<TableSchema>,
    ) -> EngineResult<Arc<dyn EngineDatabase>> {
        let name = self.name.as_str();
        let applied = self
            .engine
            .db
            .commit_version(name, version, &created)
            .map_err(backend)?;

        if !applied {
            return Err(EngineError::InvalidState(format!(
                "database '{}' is already at version {} or later",
                name, version
            )));
        }

        tracing::debug!(database = %name, version, tables = created.len(), "Committed version change");
        self.engine.connection(name, version).map_err(backend)
    }
}

struct SqliteDatabase {
    name: String,
    version: u32,
    tables: BTreeMap<String, TableSchema>,
    db: Database,
    faults: Arc<Faults>,
    closed: AtomicBool,
}

impl EngineDatabase for SqliteDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    fn schema(&self, table: &str) -> Option<TableSchema> {
        self.tables.get(table).cloned()
    }

    fn transaction(
        &self,
        tables: &[&str],
        mode: TransactionMode,
    ) -> EngineResult<Box<dyn EngineTransaction>> {
        if self.is_closed() {
            return Err(EngineError::InvalidState(format!(
                "connection to '{}' is closed",
                self.name
            )));
        }

        let mut scope = BTreeMap::new();
        for table in tables {
            let schema = self
                .tables
                .get(*table)
                .ok_or_else(|| EngineError::NotFound(format!("table '{}'", table)))?;
            scope.insert(table.to_string(), schema.clone());
        }

        let executor = SqliteBatch {
            db: self.db.clone(),
            name: self.name.clone(),
            tables: scope,
            faults: Arc::clone(&self.faults),
        };
        Ok(Box::new(QueuedTransaction::new(mode, tables, Box::new(executor))))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct SqliteBatch {
    db: Database,
    name: String,
    tables: BTreeMap<String, TableSchema>,
    faults: Arc<Faults>,
}

impl BatchExecutor for SqliteBatch {
    fn execute(
        self: Box<Self>,
        _mode: TransactionMode,
        requests: Vec<(String, Operation)>,
    ) -> EngineResult<Vec<RequestEvent>> {
        if self.faults.abort_transactions() {
            return Err(EngineError::Aborted("transaction aborted by engine".to_string()));
        }

        self.db
            .transaction(|conn| {
                let mut events = Vec::with_capacity(requests.len());
                for (table, operation) in requests {
                    let Some(schema) = self.tables.get(&table) else {
                        events.push(Err(EngineError::NotFound(format!("table '{}'", table))));
                        continue;
                    };

                    // Each request gets its own savepoint so a failure only undoes itself
                    conn.execute_batch("SAVEPOINT request")?;
                    let mut store = SqliteStore {
                        conn,
                        db_name: &self.name,
                        table: &table,
                    };
                    let event = exec::apply(schema, &mut store, operation);
                    if event.is_ok() {
                        conn.execute_batch("RELEASE request")?;
                    } else {
                        conn.execute_batch("ROLLBACK TO request; RELEASE request")?;
                    }
                    events.push(event);
                }
                Ok(events)
            })
            .map_err(backend)
    }
}

struct SqliteStore<'a> {
    conn: &'a Connection,
    db_name: &'a str,
    table: &'a str,
}

impl SqliteStore<'_> {
    fn load(&self, key: &Key) -> Result<Option<Record>> {
        let (kind, int, text) = key_columns(key);
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM records
                 WHERE db_name = ?1 AND store_name = ?2
                   AND key_kind = ?3 AND key_int = ?4 AND key_text = ?5",
                rusqlite::params![self.db_name, self.table, kind, int, text],
                |row| row.get(0),
            )
            .optional()?;

        value
            .map(|json| serde_json::from_str(&json).map_err(StorageError::from))
            .transpose()
    }

    fn load_all(&self) -> Result<Vec<(Key, Record)>> {
        let mut stmt = self.conn.prepare(
            "SELECT key_kind, key_int, key_text, value FROM records
             WHERE db_name = ?1 AND store_name = ?2
             ORDER BY key_kind, key_int, key_text",
        )?;

        let rows = stmt
            .query_map([self.db_name, self.table], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(kind, int, text, json)| {
                Ok((decode_key(kind, int, text)?, serde_json::from_str(&json)?))
            })
            .collect()
    }

    fn store(&self, key: &Key, record: &Record) -> Result<()> {
        let (kind, int, text) = key_columns(key);
        let json = serde_json::to_string(record)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO records
             (db_name, store_name, key_kind, key_int, key_text, value)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![self.db_name, self.table, kind, int, text, json],
        )?;
        Ok(())
    }

    fn delete(&self, key: &Key) -> Result<()> {
        let (kind, int, text) = key_columns(key);
        self.conn.execute(
            "DELETE FROM records
             WHERE db_name = ?1 AND store_name = ?2
               AND key_kind = ?3 AND key_int = ?4 AND key_text = ?5",
            rusqlite::params![self.db_name, self.table, kind, int, text],
        )?;
        Ok(())
    }

    fn delete_all(&self) -> Result<()> {
        self.conn.execute(
            "DELETE FROM records WHERE db_name = ?1 AND store_name = ?2",
            [self.db_name, self.table],
        )?;
        Ok(())
    }

    fn next_key(&self) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT next_key FROM object_stores WHERE db_name = ?1 AND name = ?2",
            [self.db_name, self.table],
            |row| row.get(0),
        )?)
    }

    fn update_next_key(&self, next: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE object_stores SET next_key = ?3 WHERE db_name = ?1 AND name = ?2",
            rusqlite::params![self.db_name, self.table, next],
        )?;
        Ok(())
    }
}

impl StoreAccess for SqliteStore<'_> {
    fn get(&mut self, key: &Key) -> EngineResult<Option<Record>> {
        self.load(key).map_err(backend)
    }

    fn scan(&mut self) -> EngineResult<Vec<(Key, Record)>> {
        self.load_all().map_err(backend)
    }

    fn write(&mut self, key: Key, record: Record) -> EngineResult<()> {
        self.store(&key, &record).map_err(backend)
    }

    fn remove(&mut self, key: &Key) -> EngineResult<()> {
        self.delete(key).map_err(backend)
    }

    fn truncate(&mut self) -> EngineResult<()> {
        self.delete_all().map_err(backend)
    }

    fn generator(&mut self) -> EngineResult<i64> {
        self.next_key().map_err(backend)
    }

    fn set_generator(&mut self, next: i64) -> EngineResult<()> {
        self.update_next_key(next).map_err(backend)
    }
}

fn key_columns(key: &Key) -> (i64, i64, &str) {
    match key {
        Key::Integer(n) => (0, *n, ""),
        Key::Text(s) => (1, 0, s.as_str()),
    }
}

fn decode_key(kind: i64, int: i64, text: String) -> Result<Key> {
    match kind {
        0 => Ok(Key::Integer(int)),
        1 => Ok(Key::Text(text)),
        other => Err(StorageError::Corrupt(format!("unknown key kind {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idbkit_engine::{RequestOutput, TransactionEvent};
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        value.as_object().unwrap().clone()
    }

    async fn upgrade(engine: &SqliteEngine, version: Option<u32>) -> VersionChange {
        let mut request = engine.open("demo", version);
        match request.next_event().await {
            Some(OpenEvent::UpgradeNeeded(change)) => change,
            other => panic!("expected upgrade, got {:?}", other),
        }
    }

    async fn members(engine: &SqliteEngine) -> Arc<dyn EngineDatabase> {
        let mut change = upgrade(engine, None).await;
        change.create_table("members", Some("id"), false).unwrap();
        change.create_index("members", "id", "id", true).unwrap();
        change.create_index("members", "email", "email", true).unwrap();
        change.commit().unwrap()
    }

    async fn run(
        db: &Arc<dyn EngineDatabase>,
        mode: TransactionMode,
        operations: Vec<Operation>,
    ) -> (Vec<RequestEvent>, TransactionEvent) {
        let mut tx = db.transaction(&["members"], mode).unwrap();
        let pending: Vec<_> = operations
            .into_iter()
            .map(|op| tx.issue("members", op))
            .collect();
        let done = tx.commit();

        let mut events = Vec::new();
        for rx in pending {
            events.push(rx.await.unwrap());
        }
        (events, done.await.unwrap())
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let engine = SqliteEngine::open_in_memory().unwrap();
        let db = members(&engine).await;
        assert_eq!(db.version(), 1);
        assert_eq!(db.schema("members").unwrap().indexes.len(), 2);

        let (events, done) = run(
            &db,
            TransactionMode::ReadWrite,
            vec![
                Operation::Put(record(json!({"id": 2, "name": "b"}))),
                Operation::Put(record(json!({"id": 1, "name": "a"}))),
            ],
        )
        .await;
        assert!(events.iter().all(|e| e.is_ok()));
        assert_eq!(done, TransactionEvent::Complete);

        let (events, _) = run(&db, TransactionMode::ReadOnly, vec![Operation::GetAll]).await;
        let Ok(RequestOutput::Records(records)) = &events[0] else {
            panic!("expected records");
        };
        let keys: Vec<_> = records.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![Key::Integer(1), Key::Integer(2)]);
    }

    #[tokio::test]
    async fn test_failed_item_rolls_back_alone() {
        let engine = SqliteEngine::open_in_memory().unwrap();
        let db = members(&engine).await;

        run(
            &db,
            TransactionMode::ReadWrite,
            vec![Operation::Put(record(json!({"id": 1, "email": "a@x"})))],
        )
        .await;

        let (events, done) = run(
            &db,
            TransactionMode::ReadWrite,
            vec![
                Operation::Put(record(json!({"id": 2, "email": "a@x"}))),
                Operation::Put(record(json!({"id": 3, "email": "c@x"}))),
                Operation::Delete(Key::Integer(1)),
            ],
        )
        .await;
        assert!(matches!(events[0], Err(EngineError::Constraint(_))));
        assert!(events[1].is_ok());
        assert!(events[2].is_ok());
        assert_eq!(done, TransactionEvent::Complete);

        let (events, _) = run(&db, TransactionMode::ReadOnly, vec![Operation::GetAll]).await;
        let Ok(RequestOutput::Records(records)) = &events[0] else {
            panic!("expected records");
        };
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, Key::Integer(3));
    }

    #[tokio::test]
    async fn test_aborted_upgrade_persists_nothing() {
        let engine = SqliteEngine::open_in_memory().unwrap();
        members(&engine).await.close();

        let mut change = upgrade(&engine, Some(2)).await;
        change.create_table("orders", None, true).unwrap();
        change.abort();

        assert_eq!(engine.stored_version("demo").unwrap(), Some(1));
        let mut request = engine.open("demo", None);
        let Some(OpenEvent::Success(db)) = request.next_event().await else {
            panic!("expected success");
        };
        assert_eq!(db.table_names(), vec!["members".to_string()]);
    }

    #[tokio::test]
    async fn test_data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idbkit.db");

        {
            let engine = SqliteEngine::open(&path).unwrap();
            let db = members(&engine).await;
            run(
                &db,
                TransactionMode::ReadWrite,
                vec![Operation::Put(record(json!({"id": 1, "name": "wdz", "age": 18})))],
            )
            .await;
        }

        let engine = SqliteEngine::open(&path).unwrap();
        let mut request = engine.open("demo", None);
        let Some(OpenEvent::Success(db)) = request.next_event().await else {
            panic!("expected success");
        };
        assert_eq!(db.version(), 1);
        assert_eq!(db.schema("members").unwrap().key_path.as_deref(), Some("id"));

        let (events, _) = run(&db, TransactionMode::ReadOnly, vec![Operation::Get(Key::Integer(1))]).await;
        assert_eq!(
            events[0],
            Ok(RequestOutput::Record(Some(record(json!({"id": 1, "name": "wdz", "age": 18})))))
        );
    }

    #[tokio::test]
    async fn test_generated_keys_persist_counter() {
        let engine = SqliteEngine::open_in_memory().unwrap();
        let mut change = upgrade(&engine, None).await;
        change.create_table("log", None, true).unwrap();
        let db = change.commit().unwrap();

        for expected in 1..=3 {
            let mut tx = db.transaction(&["log"], TransactionMode::ReadWrite).unwrap();
            let put = tx.issue("log", Operation::Put(record(json!({"line": expected}))));
            tx.commit();
            assert_eq!(put.await.unwrap(), Ok(RequestOutput::Key(Key::Integer(expected))));
        }
    }

    #[tokio::test]
    async fn test_delete_database() {
        let engine = SqliteEngine::open_in_memory().unwrap();
        members(&engine).await;

        assert!(engine.delete_database("demo").unwrap());
        assert_eq!(engine.stored_version("demo").unwrap(), None);
        assert!(!engine.delete_database("demo").unwrap());
    }
}
