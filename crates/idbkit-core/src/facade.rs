//! Storage facade
//!
//! Public get/set/clear surface. Reads and writes share the connection
//! handle; a migration takes it exclusively, so two first writes to
//! different unknown tables bump the version one after the other.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use idbkit_engine::{Key, Record, RequestOutput, StorageEngine, TableSchema};

use crate::connection::{ConnectionHandle, ConnectionState};
use crate::error::StoreError;
use crate::migrator;
use crate::runner::{run_batch, BatchOutcome, BatchRequest};
use crate::Result;

/// Shape of a whole-table read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReturnType {
    /// Records in key order
    #[default]
    List,
    /// Records keyed by primary key
    Map,
}

/// How `set` writes its values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PassType {
    /// Insert or overwrite
    #[default]
    Put,
    /// Insert only; records whose key exists fail individually
    Add,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetRequest {
    pub table: String,
    pub key: Option<Key>,
    pub return_type: ReturnType,
}

impl GetRequest {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key: None,
            return_type: ReturnType::List,
        }
    }

    pub fn key(mut self, key: impl Into<Key>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn returning(mut self, return_type: ReturnType) -> Self {
        self.return_type = return_type;
        self
    }
}

impl From<&str> for GetRequest {
    fn from(table: &str) -> Self {
        Self::new(table)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetRequest {
    pub table: String,
    pub values: Vec<Record>,
    /// Key field used if the table has to be created
    pub key_path: Option<String>,
    pub pass_type: PassType,
}

impl SetRequest {
    pub fn new(table: impl Into<String>, values: Vec<Record>) -> Self {
        Self {
            table: table.into(),
            values,
            key_path: None,
            pass_type: PassType::Put,
        }
    }

    pub fn key_path(mut self, key_path: impl Into<String>) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    pub fn pass_type(mut self, pass_type: PassType) -> Self {
        self.pass_type = pass_type;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClearRequest {
    pub table: String,
    /// `None` empties the table
    pub keys: Option<Vec<Key>>,
}

impl ClearRequest {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            keys: None,
        }
    }

    pub fn keys<K: Into<Key>>(mut self, keys: impl IntoIterator<Item = K>) -> Self {
        self.keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }
}

impl From<&str> for ClearRequest {
    fn from(table: &str) -> Self {
        Self::new(table)
    }
}

/// Result of a read.
#[derive(Debug, Clone, PartialEq)]
pub enum GetResult {
    /// The table does not exist
    NoTable,
    /// A key was given and no record has it
    NoMatch,
    List(Vec<Record>),
    Map(BTreeMap<Key, Record>),
}

impl GetResult {
    /// Records in key order; empty for `NoTable` and `NoMatch`
    pub fn into_records(self) -> Vec<Record> {
        match self {
            GetResult::NoTable | GetResult::NoMatch => Vec::new(),
            GetResult::List(records) => records,
            GetResult::Map(records) => records.into_values().collect(),
        }
    }

    fn shape(rows: Vec<(Key, Record)>, return_type: ReturnType) -> Self {
        match return_type {
            ReturnType::List => GetResult::List(rows.into_iter().map(|(_, record)| record).collect()),
            ReturnType::Map => GetResult::Map(rows.into_iter().collect()),
        }
    }
}

/// A connected database.
pub struct Model {
    connection: Arc<RwLock<ConnectionHandle>>,
}

impl Model {
    pub fn new(handle: ConnectionHandle) -> Self {
        Self {
            connection: Arc::new(RwLock::new(handle)),
        }
    }

    pub async fn get(&self, request: impl Into<GetRequest>) -> Result<GetResult> {
        let GetRequest {
            table,
            key,
            return_type,
        } = request.into();
        let handle = self.connection.read().await;
        let database = handle.database()?;

        if !handle.table_exists(&table) {
            tracing::debug!(table = %table, "Read from missing table");
            return Ok(GetResult::NoTable);
        }

        let Some(key) = key else {
            let outcome = run_batch(database.as_ref(), BatchRequest::get_all(&table)).await?;
            let rows = match first_output(&table, outcome)? {
                RequestOutput::Records(rows) => rows,
                _ => Vec::new(),
            };
            return Ok(GetResult::shape(rows, return_type));
        };

        let outcome = run_batch(database.as_ref(), BatchRequest::get(&table, key.clone())).await?;
        match first_output(&table, outcome)? {
            RequestOutput::Record(Some(record)) => {
                Ok(GetResult::shape(vec![(key, record)], return_type))
            }
            _ => Ok(GetResult::NoMatch),
        }
    }

    /// Write `values`, creating the table from the first value if needed.
    pub async fn set(&self, request: SetRequest) -> Result<BatchOutcome> {
        let SetRequest {
            table,
            values,
            key_path,
            pass_type,
        } = request;

        let Some(sample) = values.first() else {
            return Ok(BatchOutcome::empty());
        };
        self.ensure_table(&table, sample, key_path.as_deref()).await?;

        let batch = match pass_type {
            PassType::Put => BatchRequest::put(&table, values),
            PassType::Add => BatchRequest::add(&table, values),
        };
        let handle = self.connection.read().await;
        let outcome = run_batch(handle.database()?.as_ref(), batch).await?;

        tracing::debug!(table = %table, summary = ?outcome.summary(), "Set completed");
        Ok(outcome)
    }

    /// Delete the given keys, or every record when no keys are given.
    pub async fn clear(&self, request: impl Into<ClearRequest>) -> Result<BatchOutcome> {
        let ClearRequest { table, keys } = request.into();
        let handle = self.connection.read().await;
        let database = handle.database()?;

        if !handle.table_exists(&table) {
            return Err(StoreError::TableNotFound(table));
        }

        let batch = match keys {
            Some(keys) => BatchRequest::delete(&table, keys),
            None => BatchRequest::clear(&table),
        };
        run_batch(database.as_ref(), batch).await
    }

    /// Positional form of [`Model::get`]
    pub async fn fetch(&self, table: &str, key: Option<Key>) -> Result<GetResult> {
        let mut request = GetRequest::new(table);
        request.key = key;
        self.get(request).await
    }

    /// Positional form of [`Model::set`]
    pub async fn put(
        &self,
        table: &str,
        values: Vec<Record>,
        key_field: Option<&str>,
    ) -> Result<BatchOutcome> {
        let mut request = SetRequest::new(table, values);
        request.key_path = key_field.map(str::to_string);
        self.set(request).await
    }

    /// Positional form of [`Model::clear`]
    pub async fn remove(&self, table: &str, keys: Option<Vec<Key>>) -> Result<BatchOutcome> {
        self.clear(ClearRequest {
            table: table.to_string(),
            keys,
        })
        .await
    }

    async fn ensure_table(&self, table: &str, sample: &Record, key_field: Option<&str>) -> Result<()> {
        {
            let handle = self.connection.read().await;
            handle.database()?;
            if handle.table_exists(table) {
                return Ok(());
            }
        }

        let mut handle = self.connection.write().await;
        migrator::ensure_table(&mut handle, table, sample, key_field).await?;
        Ok(())
    }

    pub async fn name(&self) -> String {
        self.connection.read().await.name().to_string()
    }

    pub async fn version(&self) -> u32 {
        self.connection.read().await.current_version()
    }

    pub async fn tables(&self) -> Vec<String> {
        self.connection.read().await.table_names()
    }

    pub async fn schema(&self, table: &str) -> Option<TableSchema> {
        self.connection.read().await.schema(table)
    }

    pub async fn state(&self) -> ConnectionState {
        self.connection.read().await.state()
    }

    pub async fn close(&self) {
        self.connection.write().await.close();
    }
}

impl Clone for Model {
    fn clone(&self) -> Self {
        Self {
            connection: Arc::clone(&self.connection),
        }
    }
}

/// Output of a single-request read batch; a failed read is an error here.
fn first_output(table: &str, mut outcome: BatchOutcome) -> Result<RequestOutput> {
    if let Some(failure) = outcome.failures.pop() {
        return Err(StoreError::Request {
            table: table.to_string(),
            source: failure.error,
        });
    }
    Ok(outcome.outputs.into_iter().flatten().next().unwrap_or(RequestOutput::Done))
}

/// Whether `engine` can be used in this environment.
pub fn is_supported(engine: &dyn StorageEngine) -> bool {
    engine.is_supported()
}

/// Open `name` and wrap it in a [`Model`].
pub async fn connect(
    engine: Arc<dyn StorageEngine>,
    name: &str,
    version: Option<u32>,
) -> Result<Model> {
    let handle = ConnectionHandle::open(engine, name, version).await?;
    Ok(Model::new(handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use idbkit_engine::{EngineError, IndexSchema, MemoryEngine};
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        value.as_object().unwrap().clone()
    }

    async fn model(engine: &MemoryEngine) -> Model {
        connect(Arc::new(engine.clone()), "demo", None).await.unwrap()
    }

    #[tokio::test]
    async fn test_members_scenario() {
        let engine = MemoryEngine::new();
        let model = model(&engine).await;
        let before = model.version().await;

        let member = record(json!({"id": 1, "name": "wdz", "age": 18}));
        let outcome = model
            .set(SetRequest::new("members", vec![member.clone()]).key_path("id"))
            .await
            .unwrap();

        assert!(outcome.is_clean());
        assert_eq!(model.version().await, before + 1);
        let schema = model.schema("members").await.unwrap();
        assert_eq!(
            schema.index("id"),
            Some(&IndexSchema {
                name: "id".to_string(),
                key_path: "id".to_string(),
                unique: true,
            })
        );
        assert_eq!(schema.unique_indexes().count(), 1);

        assert_eq!(model.get("members").await.unwrap(), GetResult::List(vec![member]));
    }

    #[tokio::test]
    async fn test_missing_table_reads_as_no_table() {
        let model = model(&MemoryEngine::new()).await;

        assert_eq!(model.get("ghost").await.unwrap(), GetResult::NoTable);
        assert_eq!(
            model.get(GetRequest::new("ghost").key(1)).await.unwrap(),
            GetResult::NoTable
        );
    }

    #[tokio::test]
    async fn test_second_set_keeps_version() {
        let model = model(&MemoryEngine::new()).await;

        model
            .put("members", vec![record(json!({"id": 1}))], Some("id"))
            .await
            .unwrap();
        let version = model.version().await;

        model
            .put("members", vec![record(json!({"id": 2, "extra": true}))], Some("id"))
            .await
            .unwrap();
        assert_eq!(model.version().await, version);
        assert_eq!(model.schema("members").await.unwrap().indexes.len(), 1);
        assert_eq!(model.get("members").await.unwrap().into_records().len(), 2);
    }

    #[tokio::test]
    async fn test_keyed_lookup() {
        let model = model(&MemoryEngine::new()).await;
        let member = record(json!({"id": "a", "name": "x"}));
        model.put("members", vec![member.clone()], Some("id")).await.unwrap();

        assert_eq!(
            model.fetch("members", Some(Key::from("a"))).await.unwrap(),
            GetResult::List(vec![member.clone()])
        );
        assert_eq!(
            model.fetch("members", Some(Key::from("b"))).await.unwrap(),
            GetResult::NoMatch
        );

        let keyed = model
            .get(GetRequest::new("members").key("a").returning(ReturnType::Map))
            .await
            .unwrap();
        assert_eq!(keyed, GetResult::Map(BTreeMap::from([(Key::from("a"), member)])));
    }

    #[tokio::test]
    async fn test_map_of_generated_keys() {
        let model = model(&MemoryEngine::new()).await;
        model
            .put(
                "log",
                vec![record(json!({"msg": "a"})), record(json!({"msg": "b"}))],
                None,
            )
            .await
            .unwrap();

        let GetResult::Map(rows) = model
            .get(GetRequest::new("log").returning(ReturnType::Map))
            .await
            .unwrap()
        else {
            panic!("expected map");
        };
        assert_eq!(rows.keys().cloned().collect::<Vec<_>>(), vec![Key::from(1), Key::from(2)]);
        assert_eq!(rows[&Key::from(2)]["msg"], json!("b"));
    }

    #[tokio::test]
    async fn test_clear_whole_table() {
        let model = model(&MemoryEngine::new()).await;
        model
            .put(
                "members",
                vec![record(json!({"id": 1})), record(json!({"id": 2}))],
                Some("id"),
            )
            .await
            .unwrap();

        let outcome = model.clear("members").await.unwrap();
        assert!(outcome.completed);
        assert_eq!(model.get("members").await.unwrap(), GetResult::List(Vec::new()));
    }

    #[tokio::test]
    async fn test_clear_selected_keys() {
        let model = model(&MemoryEngine::new()).await;
        let third = record(json!({"id": 3, "name": "keep"}));
        model
            .put(
                "members",
                vec![record(json!({"id": 1})), record(json!({"id": 2})), third.clone()],
                Some("id"),
            )
            .await
            .unwrap();

        model
            .clear(ClearRequest::new("members").keys([1, 2]))
            .await
            .unwrap();

        assert_eq!(model.get("members").await.unwrap(), GetResult::List(vec![third.clone()]));
        assert_eq!(
            model.fetch("members", Some(Key::from(3))).await.unwrap(),
            GetResult::List(vec![third])
        );
    }

    #[tokio::test]
    async fn test_clear_empty_key_list_deletes_nothing() {
        let model = model(&MemoryEngine::new()).await;
        model
            .put("members", vec![record(json!({"id": 1}))], Some("id"))
            .await
            .unwrap();

        let outcome = model.remove("members", Some(Vec::new())).await.unwrap();
        assert_eq!(outcome, BatchOutcome::empty());
        assert_eq!(model.get("members").await.unwrap().into_records().len(), 1);
    }

    #[tokio::test]
    async fn test_clear_unknown_table() {
        let model = model(&MemoryEngine::new()).await;
        let err = model.clear("unknown_table").await.unwrap_err();
        assert!(matches!(err, StoreError::TableNotFound(table) if table == "unknown_table"));
    }

    #[tokio::test]
    async fn test_item_failures_do_not_fail_set() {
        let model = model(&MemoryEngine::new()).await;

        let outcome = model
            .put(
                "members",
                vec![record(json!({"id": 1})), record(json!({"name": "no id"}))],
                Some("id"),
            )
            .await
            .unwrap();

        assert!(outcome.completed);
        assert_eq!(outcome.failures.len(), 1);
        assert!(matches!(outcome.failures[0].error, EngineError::Data(_)));
        assert_eq!(model.get("members").await.unwrap().into_records().len(), 1);
    }

    #[tokio::test]
    async fn test_add_does_not_overwrite() {
        let model = model(&MemoryEngine::new()).await;
        model
            .put("members", vec![record(json!({"id": 1, "age": 18}))], Some("id"))
            .await
            .unwrap();

        let outcome = model
            .set(
                SetRequest::new("members", vec![record(json!({"id": 1, "age": 99}))])
                    .pass_type(PassType::Add),
            )
            .await
            .unwrap();

        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(
            model.get("members").await.unwrap(),
            GetResult::List(vec![record(json!({"id": 1, "age": 18}))])
        );
    }

    #[tokio::test]
    async fn test_empty_set_creates_nothing() {
        let model = model(&MemoryEngine::new()).await;
        let outcome = model.put("members", Vec::new(), Some("id")).await.unwrap();

        assert_eq!(outcome, BatchOutcome::empty());
        assert!(model.tables().await.is_empty());
        assert_eq!(model.version().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_writes_serialize_migrations() {
        let model = model(&MemoryEngine::new()).await;
        let other = model.clone();

        let (a, b) = tokio::join!(
            model.put("members", vec![record(json!({"id": 1}))], Some("id")),
            other.put("orders", vec![record(json!({"sku": "x"}))], Some("sku")),
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(model.version().await, 3);
        assert_eq!(model.tables().await, vec!["members".to_string(), "orders".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_first_writes_to_same_table_migrate_once() {
        let model = model(&MemoryEngine::new()).await;
        let other = model.clone();

        let (a, b) = tokio::join!(
            model.put("members", vec![record(json!({"id": 1}))], Some("id")),
            other.put("members", vec![record(json!({"id": 2}))], Some("id")),
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(model.version().await, 2);
        assert_eq!(model.get("members").await.unwrap().into_records().len(), 2);
    }

    #[tokio::test]
    async fn test_stale_model_writes_after_other_model_migrates() {
        let engine = MemoryEngine::new();
        let a = model(&engine).await;
        let b = model(&engine).await;

        b.put("orders", vec![record(json!({"id": 1, "total": 5}))], Some("id"))
            .await
            .unwrap();
        b.put("notes", vec![record(json!({"id": 1, "text": "hi"}))], Some("id"))
            .await
            .unwrap();
        assert_eq!(engine.stored_version("demo"), Some(3));

        let outcome = a
            .put("members", vec![record(json!({"id": 1, "name": "wdz"}))], Some("id"))
            .await
            .unwrap();
        assert!(outcome.is_clean());
        assert_eq!(a.state().await, ConnectionState::Open);
        assert_eq!(a.version().await, 4);

        assert_eq!(
            a.get("members").await.unwrap(),
            GetResult::List(vec![record(json!({"id": 1, "name": "wdz"}))])
        );
        assert_eq!(
            a.get("orders").await.unwrap(),
            GetResult::List(vec![record(json!({"id": 1, "total": 5}))])
        );
    }

    #[tokio::test]
    async fn test_transaction_abort_rejects() {
        let engine = MemoryEngine::new();
        let model = model(&engine).await;
        model
            .put("members", vec![record(json!({"id": 1}))], Some("id"))
            .await
            .unwrap();

        engine.faults().set_abort_transactions(true);
        let err = model
            .put("members", vec![record(json!({"id": 2}))], Some("id"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Transaction { .. }));

        engine.faults().set_abort_transactions(false);
        assert_eq!(model.get("members").await.unwrap().into_records().len(), 1);
    }

    #[tokio::test]
    async fn test_schema_failure_keeps_model_usable() {
        let engine = MemoryEngine::new();
        let model = model(&engine).await;
        engine.faults().set_fail_index_creation(true);

        let err = model
            .put("members", vec![record(json!({"id": 1}))], Some("id"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Schema { .. }));
        assert_eq!(model.state().await, ConnectionState::Open);
        assert_eq!(model.get("members").await.unwrap(), GetResult::NoTable);
    }

    #[tokio::test]
    async fn test_closed_model() {
        let model = model(&MemoryEngine::new()).await;
        model.close().await;

        assert_eq!(model.state().await, ConnectionState::Closed);
        assert!(matches!(
            model.get("members").await,
            Err(StoreError::InvalidState(ConnectionState::Closed))
        ));
    }

    #[tokio::test]
    async fn test_sqlite_backed_model_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idbkit.db");

        {
            let engine = Arc::new(idbkit_sqlite::SqliteEngine::open(&path).unwrap());
            let model = connect(engine, "demo", None).await.unwrap();
            model
                .put("members", vec![record(json!({"id": 1, "name": "wdz", "age": 18}))], Some("id"))
                .await
                .unwrap();
            model.close().await;
        }

        let engine = Arc::new(idbkit_sqlite::SqliteEngine::open(&path).unwrap());
        let model = connect(engine, "demo", None).await.unwrap();
        assert_eq!(model.version().await, 2);
        assert_eq!(
            model.get("members").await.unwrap(),
            GetResult::List(vec![record(json!({"id": 1, "name": "wdz", "age": 18}))])
        );
    }

    #[test]
    fn test_is_supported() {
        let engine = MemoryEngine::new();
        assert!(is_supported(&engine));
        engine.faults().set_unsupported(true);
        assert!(!is_supported(&engine));
    }
}
