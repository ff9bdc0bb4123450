//! In-memory engine
//!
//! Databases live as long as the engine value (and its clones). Useful for
//! tests and for hosts without persistent storage.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::engine::{plan_open, EngineDatabase, EngineTransaction, OpenPlan, StorageEngine};
use crate::error::EngineError;
use crate::events::{OpenEvent, OpenRequest, Operation, RequestEvent, TransactionMode};
use crate::exec::{self, StoreAccess};
use crate::fault::Faults;
use crate::key::{Key, Record};
use crate::queue::{BatchExecutor, QueuedTransaction};
use crate::schema::TableSchema;
use crate::upgrade::{UpgradeTarget, VersionChange};
use crate::Result;

#[derive(Debug, Default)]
struct EngineState {
    databases: HashMap<String, DatabaseState>,
}

#[derive(Debug, Default)]
struct DatabaseState {
    version: u32,
    tables: BTreeMap<String, TableState>,
}

#[derive(Debug)]
struct TableState {
    schema: TableSchema,
    data: TableData,
}

#[derive(Debug)]
struct TableData {
    records: BTreeMap<Key, Record>,
    next_key: i64,
}

impl StoreAccess for TableData {
    fn get(&mut self, key: &Key) -> Result<Option<Record>> {
        Ok(self.records.get(key).cloned())
    }

    fn scan(&mut self) -> Result<Vec<(Key, Record)>> {
        Ok(self
            .records
            .iter()
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect())
    }

    fn write(&mut self, key: Key, record: Record) -> Result<()> {
        self.records.insert(key, record);
        Ok(())
    }

    fn remove(&mut self, key: &Key) -> Result<()> {
        self.records.remove(key);
        Ok(())
    }

    fn truncate(&mut self) -> Result<()> {
        self.records.clear();
        Ok(())
    }

    fn generator(&mut self) -> Result<i64> {
        Ok(self.next_key)
    }

    fn set_generator(&mut self, next: i64) -> Result<()> {
        self.next_key = next;
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MemoryEngine {
    state: Arc<RwLock<EngineState>>,
    faults: Arc<Faults>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &Arc<Faults> {
        &self.faults
    }

    /// Stored version of `name`, if the database exists
    pub fn stored_version(&self, name: &str) -> Option<u32> {
        self.state.read().databases.get(name).map(|db| db.version)
    }

    pub fn delete_database(&self, name: &str) -> bool {
        self.state.write().databases.remove(name).is_some()
    }

    fn connection(&self, name: &str, version: u32) -> Arc<dyn EngineDatabase> {
        let tables: BTreeMap<String, TableSchema> = self
            .state
            .read()
            .databases
            .get(name)
            .map(|db| {
                db.tables
                    .iter()
                    .map(|(table, state)| (table.clone(), state.schema.clone()))
                    .collect()
            })
            .unwrap_or_default();

        Arc::new(MemoryDatabase {
            name: name.to_string(),
            version,
            tables,
            engine: self.clone(),
            closed: AtomicBool::new(false),
        })
    }
}

impl StorageEngine for MemoryEngine {
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

        let current = self.stored_version(name).unwrap_or(0);
        match plan_open(current, version) {
            Ok(OpenPlan::Open(version)) => {
                let _ = events.send(OpenEvent::Success(self.connection(name, version)));
            }
            Ok(OpenPlan::Upgrade { from, to }) => {
                let existing: Vec<TableSchema> = self
                    .state
                    .read()
                    .databases
                    .get(name)
                    .map(|db| db.tables.values().map(|t| t.schema.clone()).collect())
                    .unwrap_or_default();
                let target = MemoryUpgrade {
                    engine: self.clone(),
                    name: name.to_string(),
                };
                let change = VersionChange::new(
                    from,
                    to,
                    existing,
                    Box::new(target),
                    Arc::clone(&self.faults),
                    events.clone(),
                );
                let _ = events.send(OpenEvent::UpgradeNeeded(change));
            }
            Err(err) => {
                let _ = events.send(OpenEvent::Error(err));
            }
        }

        request
    }
}

struct MemoryUpgrade {
    engine: MemoryEngine,
    name: String,
}

impl UpgradeTarget for MemoryUpgrade {
    fn apply(
        self: Box<Self>,
        version: u32,
        created: Vec<TableSchema>,
    ) -> Result<Arc<dyn EngineDatabase>> {
        {
            let mut state = self.engine.state.write();
            let db = state.databases.entry(self.name.clone()).or_default();
            if db.version >= version {
                return Err(EngineError::InvalidState(format!(
                    "database '{}' is already at version {}",
                    self.name, db.version
                )));
            }

            for schema in created {
                db.tables.insert(
                    schema.name.clone(),
                    TableState {
                        schema,
                        data: TableData {
                            records: BTreeMap::new(),
                            next_key: 1,
                        },
                    },
                );
            }
            db.version = version;
        }

        Ok(self.engine.connection(&self.name, version))
    }
}

struct MemoryDatabase {
    name: String,
    version: u32,
    tables: BTreeMap<String, TableSchema>,
    engine: MemoryEngine,
    closed: AtomicBool,
}

impl EngineDatabase for MemoryDatabase {
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
    ) -> Result<Box<dyn EngineTransaction>> {
        if self.is_closed() {
            return Err(EngineError::InvalidState(format!(
                "connection to '{}' is closed",
                self.name
            )));
        }
        if let Some(missing) = tables.iter().find(|t| !self.tables.contains_key(**t)) {
            return Err(EngineError::NotFound(format!("table '{}'", missing)));
        }

        let executor = MemoryBatch {
            engine: self.engine.clone(),
            name: self.name.clone(),
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

struct MemoryBatch {
    engine: MemoryEngine,
    name: String,
}

impl BatchExecutor for MemoryBatch {
    fn execute(
        self: Box<Self>,
        _mode: TransactionMode,
        requests: Vec<(String, Operation)>,
    ) -> Result<Vec<RequestEvent>> {
        if self.engine.faults.abort_transactions() {
            return Err(EngineError::Aborted("transaction aborted by engine".to_string()));
        }

        let mut state = self.engine.state.write();
        let db = state
            .databases
            .get_mut(&self.name)
            .ok_or_else(|| EngineError::NotFound(format!("database '{}'", self.name)))?;

        let events: Vec<RequestEvent> = requests
            .into_iter()
            .map(|(table, operation)| match db.tables.get_mut(&table) {
                Some(table) => exec::apply(&table.schema, &mut table.data, operation),
                None => Err(EngineError::NotFound(format!("table '{}'", table))),
            })
            .collect();

        Ok(events)
    }
}
