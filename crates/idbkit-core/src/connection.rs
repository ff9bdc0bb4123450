//! Connection handle
//!
//! Owns one open connection to a named, versioned database.
//!
//! ```text
//! Unopened
//!   ↓ open
//! Opening ──→ Open ⇄ Migrating
//!   ↓           ↓ close
//! Failed      Closed
//! ```

use std::sync::Arc;

use idbkit_engine::{EngineDatabase, EngineError, OpenEvent, StorageEngine, TableSchema, VersionChange};

use crate::error::StoreError;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unopened,
    Opening,
    Open,
    /// Old connection closed, reopening at the next version
    Migrating,
    Closed,
    /// A migration or open left no usable connection
    Failed,
}

impl ConnectionState {
    pub fn can_transition_to(&self, target: ConnectionState) -> bool {
        match (self, target) {
            (ConnectionState::Unopened, ConnectionState::Opening) => true,
            (ConnectionState::Opening, ConnectionState::Open) => true,
            (ConnectionState::Opening, ConnectionState::Failed) => true,
            (ConnectionState::Open, ConnectionState::Migrating) => true,
            (ConnectionState::Open, ConnectionState::Closed) => true,
            (ConnectionState::Migrating, ConnectionState::Open) => true,
            (ConnectionState::Migrating, ConnectionState::Failed) => true,
            (ConnectionState::Failed, ConnectionState::Closed) => true,
            (a, b) if *a == b => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Unopened => "unopened",
            ConnectionState::Opening => "opening",
            ConnectionState::Open => "open",
            ConnectionState::Migrating => "migrating",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the first event of an open attempt delivered.
pub(crate) enum Opened {
    Ready(Arc<dyn EngineDatabase>),
    Upgrade(VersionChange),
}

pub struct ConnectionHandle {
    engine: Arc<dyn StorageEngine>,
    name: String,
    state: ConnectionState,
    database: Option<Arc<dyn EngineDatabase>>,
}

impl ConnectionHandle {
    pub fn new(engine: Arc<dyn StorageEngine>, name: impl Into<String>) -> Self {
        Self {
            engine,
            name: name.into(),
            state: ConnectionState::Unopened,
            database: None,
        }
    }

    /// Open `name`, committing any upgrade the engine asks for without
    /// schema changes.
    pub async fn open(
        engine: Arc<dyn StorageEngine>,
        name: impl Into<String>,
        version: Option<u32>,
    ) -> Result<Self> {
        let mut handle = Self::new(engine, name);
        handle.transition(ConnectionState::Opening)?;

        let database = match handle.request(version).await {
            Ok(Opened::Ready(database)) => Ok(database),
            Ok(Opened::Upgrade(change)) => change.commit().map_err(|source| StoreError::Connection {
                name: handle.name.clone(),
                source,
            }),
            Err(err) => Err(err),
        };

        match database {
            Ok(database) => {
                handle.install(database)?;
                tracing::info!(
                    database = %handle.name,
                    version = handle.current_version(),
                    tables = handle.table_names().len(),
                    "Opened database"
                );
                Ok(handle)
            }
            Err(err) => {
                handle.transition(ConnectionState::Failed)?;
                Err(err)
            }
        }
    }

    /// Issue one open attempt and resolve on its first event. Later events
    /// of the same attempt are ignored.
    pub(crate) async fn request(&self, version: Option<u32>) -> Result<Opened> {
        if !self.engine.is_supported() {
            return Err(StoreError::UnsupportedEnvironment);
        }

        let mut request = self.engine.open(&self.name, version);
        match request.next_event().await {
            Some(OpenEvent::Success(database)) => Ok(Opened::Ready(database)),
            Some(OpenEvent::UpgradeNeeded(change)) => Ok(Opened::Upgrade(change)),
            Some(OpenEvent::Error(EngineError::Unsupported)) => {
                Err(StoreError::UnsupportedEnvironment)
            }
            Some(OpenEvent::Error(source)) => Err(StoreError::Connection {
                name: self.name.clone(),
                source,
            }),
            None => Err(StoreError::Connection {
                name: self.name.clone(),
                source: EngineError::Aborted("open request ended without an event".to_string()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Version of the live connection, 0 when none is open
    pub fn current_version(&self) -> u32 {
        self.database.as_ref().map_or(0, |db| db.version())
    }

    pub fn table_exists(&self, table: &str) -> bool {
        self.database
            .as_ref()
            .is_some_and(|db| db.schema(table).is_some())
    }

    pub fn table_names(&self) -> Vec<String> {
        self.database
            .as_ref()
            .map(|db| db.table_names())
            .unwrap_or_default()
    }

    pub fn schema(&self, table: &str) -> Option<TableSchema> {
        self.database.as_ref().and_then(|db| db.schema(table))
    }

    /// The live connection; fails unless the handle is open.
    pub fn database(&self) -> Result<&Arc<dyn EngineDatabase>> {
        match (&self.database, self.state) {
            (Some(database), ConnectionState::Open) => Ok(database),
            _ => Err(StoreError::InvalidState(self.state)),
        }
    }

    pub fn close(&mut self) {
        if let Some(database) = self.database.take() {
            database.close();
        }
        if self.state.can_transition_to(ConnectionState::Closed) {
            self.state = ConnectionState::Closed;
            tracing::debug!(database = %self.name, "Closed connection");
        }
    }

    pub(crate) fn transition(&mut self, next: ConnectionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(StoreError::InvalidState(self.state));
        }
        tracing::trace!(database = %self.name, from = %self.state, to = %next, "Connection state");
        self.state = next;
        Ok(())
    }

    /// Close the live connection before a version change.
    pub(crate) fn begin_migration(&mut self) -> Result<()> {
        self.transition(ConnectionState::Migrating)?;
        if let Some(database) = self.database.take() {
            database.close();
        }
        Ok(())
    }

    pub(crate) fn install(&mut self, database: Arc<dyn EngineDatabase>) -> Result<()> {
        self.transition(ConnectionState::Open)?;
        self.database = Some(database);
        Ok(())
    }
}
