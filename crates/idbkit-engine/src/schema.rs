//! Table and index schema

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSchema {
    pub name: String,
    pub key_path: String,
    pub unique: bool,
}

/// Shape of a table. Fixed once the version change that created it commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    /// Field holding the primary key; `None` means out-of-line keys
    pub key_path: Option<String>,
    /// Whether the engine generates sequential integer keys
    pub auto_increment: bool,
    pub indexes: Vec<IndexSchema>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, key_path: Option<String>, auto_increment: bool) -> Self {
        Self {
            name: name.into(),
            key_path,
            auto_increment,
            indexes: Vec::new(),
        }
    }

    pub fn index(&self, name: &str) -> Option<&IndexSchema> {
        self.indexes.iter().find(|index| index.name == name)
    }

    pub fn unique_indexes(&self) -> impl Iterator<Item = &IndexSchema> {
        self.indexes.iter().filter(|index| index.unique)
    }
}
