//! Request execution shared by the engines
//!
//! Engines expose one table through [`StoreAccess`]; [`apply`] runs a single
//! operation against it. All checks happen before the first mutation, so a
//! failed item leaves the table as it was.

use serde_json::Value;

use crate::error::EngineError;
use crate::events::{Operation, RequestEvent, RequestOutput};
use crate::key::{inject_at, value_at, Key, Record};
use crate::schema::TableSchema;
use crate::Result;

pub trait StoreAccess {
    fn get(&mut self, key: &Key) -> Result<Option<Record>>;
    /// All records in key order
    fn scan(&mut self) -> Result<Vec<(Key, Record)>>;
    fn write(&mut self, key: Key, record: Record) -> Result<()>;
    fn remove(&mut self, key: &Key) -> Result<()>;
    fn truncate(&mut self) -> Result<()>;
    /// Next key the generator hands out
    fn generator(&mut self) -> Result<i64>;
    fn set_generator(&mut self, next: i64) -> Result<()>;
}

pub fn apply(schema: &TableSchema, store: &mut dyn StoreAccess, operation: Operation) -> RequestEvent {
    match operation {
        Operation::Put(record) => write_record(schema, store, record, false),
        Operation::Add(record) => write_record(schema, store, record, true),
        Operation::Get(key) => Ok(RequestOutput::Record(store.get(&key)?)),
        Operation::GetAll => Ok(RequestOutput::Records(store.scan()?)),
        Operation::Delete(key) => {
            store.remove(&key)?;
            Ok(RequestOutput::Done)
        }
        Operation::Clear => {
            store.truncate()?;
            Ok(RequestOutput::Done)
        }
    }
}

fn write_record(
    schema: &TableSchema,
    store: &mut dyn StoreAccess,
    mut record: Record,
    no_overwrite: bool,
) -> RequestEvent {
    let key = resolve_key(schema, store, &mut record)?;

    if no_overwrite && store.get(&key)?.is_some() {
        return Err(EngineError::Constraint(format!(
            "key {} already exists in '{}'",
            key, schema.name
        )));
    }
    check_unique(schema, store, &key, &record)?;

    store.write(key.clone(), record)?;

    // Explicit numeric keys push the generator past them
    if schema.auto_increment {
        if let Key::Integer(n) = key {
            if n >= store.generator()? {
                store.set_generator(n.saturating_add(1))?;
            }
        }
    }

    Ok(RequestOutput::Key(key))
}

fn resolve_key(schema: &TableSchema, store: &mut dyn StoreAccess, record: &mut Record) -> Result<Key> {
    match &schema.key_path {
        Some(path) => match value_at(record, path) {
            Some(value) => Key::from_value(value).ok_or_else(|| {
                EngineError::Data(format!("value at key path '{}' is not a valid key", path))
            }),
            None if schema.auto_increment => {
                let next = store.generator()?;
                if !inject_at(record, path, Value::from(next)) {
                    return Err(EngineError::Data(format!(
                        "cannot inject generated key at '{}'",
                        path
                    )));
                }
                Ok(Key::Integer(next))
            }
            None => Err(EngineError::Data(format!(
                "record has no value at key path '{}'",
                path
            ))),
        },
        None if schema.auto_increment => Ok(Key::Integer(store.generator()?)),
        None => Err(EngineError::Data(format!(
            "table '{}' has neither a key path nor a key generator",
            schema.name
        ))),
    }
}

fn check_unique(
    schema: &TableSchema,
    store: &mut dyn StoreAccess,
    key: &Key,
    record: &Record,
) -> Result<()> {
    let constrained: Vec<_> = schema
        .unique_indexes()
        .filter_map(|index| value_at(record, &index.key_path).map(|value| (index, value)))
        .collect();
    if constrained.is_empty() {
        return Ok(());
    }

    for (existing_key, existing) in store.scan()? {
        if &existing_key == key {
            continue;
        }
        for (index, value) in &constrained {
            if value_at(&existing, &index.key_path) == Some(*value) {
                return Err(EngineError::Constraint(format!(
                    "unique index '{}' on '{}' already holds {}",
                    index.name, schema.name, value
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::IndexSchema;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct Table {
        records: BTreeMap<Key, Record>,
        next_key: i64,
    }

    impl StoreAccess for Table {
        fn get(&mut self, key: &Key) -> Result<Option<Record>> {
            Ok(self.records.get(key).cloned())
        }
        fn scan(&mut self) -> Result<Vec<(Key, Record)>> {
            Ok(self.records.iter().map(|(k, r)| (k.clone(), r.clone())).collect())
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
            Ok(self.next_key.max(1))
        }
        fn set_generator(&mut self, next: i64) -> Result<()> {
            self.next_key = next;
            Ok(())
        }
    }

    fn record(value: serde_json::Value) -> Record {
        value.as_object().unwrap().clone()
    }

    fn members_schema() -> TableSchema {
        let mut schema = TableSchema::new("members", Some("id".to_string()), false);
        schema.indexes.push(IndexSchema {
            name: "id".to_string(),
            key_path: "id".to_string(),
            unique: true,
        });
        schema.indexes.push(IndexSchema {
            name: "email".to_string(),
            key_path: "email".to_string(),
            unique: true,
        });
        schema
    }

    #[test]
    fn test_put_uses_inline_key() {
        let schema = members_schema();
        let mut table = Table::default();

        let out = apply(&schema, &mut table, Operation::Put(record(json!({"id": 1, "name": "wdz"}))));
        assert_eq!(out.unwrap(), RequestOutput::Key(Key::Integer(1)));

        let missing = apply(&schema, &mut table, Operation::Put(record(json!({"name": "nokey"}))));
        assert!(matches!(missing, Err(EngineError::Data(_))));
        assert_eq!(table.records.len(), 1);
    }

    #[test]
    fn test_put_overwrites_but_add_does_not() {
        let schema = members_schema();
        let mut table = Table::default();

        apply(&schema, &mut table, Operation::Put(record(json!({"id": 1, "age": 18})))).unwrap();
        apply(&schema, &mut table, Operation::Put(record(json!({"id": 1, "age": 19})))).unwrap();
        assert_eq!(table.records[&Key::Integer(1)]["age"], json!(19));

        let add = apply(&schema, &mut table, Operation::Add(record(json!({"id": 1, "age": 20}))));
        assert!(matches!(add, Err(EngineError::Constraint(_))));
        assert_eq!(table.records[&Key::Integer(1)]["age"], json!(19));
    }

    #[test]
    fn test_unique_index_violation() {
        let schema = members_schema();
        let mut table = Table::default();

        apply(&schema, &mut table, Operation::Put(record(json!({"id": 1, "email": "a@x"})))).unwrap();
        let dup = apply(&schema, &mut table, Operation::Put(record(json!({"id": 2, "email": "a@x"}))));
        assert!(matches!(dup, Err(EngineError::Constraint(_))));

        // Same record may keep its own value
        apply(&schema, &mut table, Operation::Put(record(json!({"id": 1, "email": "a@x", "n": 1})))).unwrap();
        // Records without the field are not indexed
        apply(&schema, &mut table, Operation::Put(record(json!({"id": 3})))).unwrap();
        assert_eq!(table.records.len(), 2);
    }

    #[test]
    fn test_key_generator() {
        let schema = TableSchema::new("log", None, true);
        let mut table = Table::default();

        for _ in 0..3 {
            apply(&schema, &mut table, Operation::Put(record(json!({"msg": "hi"})))).unwrap();
        }
        let keys: Vec<_> = table.records.keys().cloned().collect();
        assert_eq!(keys, vec![Key::Integer(1), Key::Integer(2), Key::Integer(3)]);
    }

    #[test]
    fn test_generator_injects_and_skips_explicit_keys() {
        let schema = TableSchema::new("items", Some("seq".to_string()), true);
        let mut table = Table::default();

        apply(&schema, &mut table, Operation::Put(record(json!({"seq": 10})))).unwrap();
        let out = apply(&schema, &mut table, Operation::Put(record(json!({"v": 1})))).unwrap();
        assert_eq!(out, RequestOutput::Key(Key::Integer(11)));
        assert_eq!(table.records[&Key::Integer(11)]["seq"], json!(11));
    }
}
