//! Version change scope
//!
//! Tables and indexes are staged here while an upgrade is in progress and
//! handed to the engine in one piece on commit. Aborting, or dropping the
//! scope, leaves the stored database untouched at its old version.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::engine::EngineDatabase;
use crate::error::EngineError;
use crate::events::OpenEvent;
use crate::fault::Faults;
use crate::schema::{IndexSchema, TableSchema};
use crate::Result;

/// Engine side of a version change.
pub trait UpgradeTarget: Send {
    /// Persist `created` and bump the stored version to `version`, returning
    /// a connection at the new version.
    fn apply(
        self: Box<Self>,
        version: u32,
        created: Vec<TableSchema>,
    ) -> Result<Arc<dyn EngineDatabase>>;
}

pub struct VersionChange {
    old_version: u32,
    new_version: u32,
    existing: BTreeMap<String, TableSchema>,
    created: Vec<TableSchema>,
    target: Box<dyn UpgradeTarget>,
    faults: Arc<Faults>,
    events: mpsc::UnboundedSender<OpenEvent>,
}

impl VersionChange {
    pub fn new(
        old_version: u32,
        new_version: u32,
        existing: Vec<TableSchema>,
        target: Box<dyn UpgradeTarget>,
        faults: Arc<Faults>,
        events: mpsc::UnboundedSender<OpenEvent>,
    ) -> Self {
        Self {
            old_version,
            new_version,
            existing: existing
                .into_iter()
                .map(|schema| (schema.name.clone(), schema))
                .collect(),
            created: Vec::new(),
            target,
            faults,
            events,
        }
    }

    pub fn old_version(&self) -> u32 {
        self.old_version
    }

    pub fn new_version(&self) -> u32 {
        self.new_version
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .existing
            .keys()
            .cloned()
            .chain(self.created.iter().map(|schema| schema.name.clone()))
            .collect();
        names.sort();
        names
    }

    pub fn create_table(
        &mut self,
        name: &str,
        key_path: Option<&str>,
        auto_increment: bool,
    ) -> Result<()> {
        if self.existing.contains_key(name) || self.created.iter().any(|t| t.name == name) {
            return Err(EngineError::Constraint(format!("table '{}' already exists", name)));
        }
        if auto_increment && key_path == Some("") {
            return Err(EngineError::Data(
                "an auto-increment table cannot use an empty key path".to_string(),
            ));
        }

        self.created.push(TableSchema::new(
            name,
            key_path.map(str::to_string),
            auto_increment,
        ));
        Ok(())
    }

    /// Indexes can only be added to tables created in this version change.
    pub fn create_index(
        &mut self,
        table: &str,
        name: &str,
        key_path: &str,
        unique: bool,
    ) -> Result<()> {
        if self.faults.fail_index_creation() {
            return Err(EngineError::Backend(format!(
                "index creation failed for '{}.{}'",
                table, name
            )));
        }

        let Some(schema) = self.created.iter_mut().find(|t| t.name == table) else {
            return Err(if self.existing.contains_key(table) {
                EngineError::InvalidState(format!(
                    "table '{}' was not created in this version change",
                    table
                ))
            } else {
                EngineError::NotFound(format!("table '{}'", table))
            });
        };

        if schema.index(name).is_some() {
            return Err(EngineError::Constraint(format!(
                "index '{}' already exists on '{}'",
                name, table
            )));
        }

        schema.indexes.push(IndexSchema {
            name: name.to_string(),
            key_path: key_path.to_string(),
            unique,
        });
        Ok(())
    }

    pub fn commit(self) -> Result<Arc<dyn EngineDatabase>> {
        let Self {
            new_version,
            created,
            target,
            events,
            ..
        } = self;

        match target.apply(new_version, created) {
            Ok(db) => {
                let _ = events.send(OpenEvent::Success(Arc::clone(&db)));
                Ok(db)
            }
            Err(err) => {
                let _ = events.send(OpenEvent::Error(err.clone()));
                Err(err)
            }
        }
    }

    pub fn abort(self) {
        tracing::debug!(
            old_version = self.old_version,
            new_version = self.new_version,
            "Version change aborted"
        );
        let _ = self.events.send(OpenEvent::Error(EngineError::Aborted(
            "version change aborted".to_string(),
        )));
    }
}
