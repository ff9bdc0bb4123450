//! Members table operations

use anyhow::{Context, Result};
use serde_json::json;

use idbkit_core::{GetResult, Key, Model, Record, StoreError};

const TABLE: &str = "members";

pub struct Members {
    model: Model,
}

impl Members {
    pub fn new(model: Model) -> Self {
        Self { model }
    }

    /// Members in id order; empty before the first write
    pub async fn list(&self) -> Result<Vec<Record>> {
        Ok(self.model.get(TABLE).await?.into_records())
    }

    /// Add a member whose id is one past the highest stored id
    pub async fn add_next(&self) -> Result<()> {
        let next = self
            .list()
            .await?
            .iter()
            .filter_map(|member| member.get("id").and_then(|v| v.as_i64()))
            .max()
            .unwrap_or(0)
            + 1;
        let member = member(next, &format!("member {}", next), next + 10);

        let outcome = self.model.put(TABLE, vec![member], Some("id")).await?;
        tracing::info!(id = next, summary = ?outcome.summary(), "Added member");
        Ok(())
    }

    pub async fn bump_age(&self, id: i64) -> Result<()> {
        let mut current = match self.model.fetch(TABLE, Some(Key::from(id))).await? {
            GetResult::List(records) => records
                .into_iter()
                .next()
                .with_context(|| format!("member {} not found", id))?,
            _ => anyhow::bail!("member {} not found", id),
        };

        let age = current.get("age").and_then(|v| v.as_i64()).unwrap_or(0);
        current.insert("age".to_string(), json!(age + 1));
        self.model.put(TABLE, vec![current], Some("id")).await?;

        tracing::info!(id, age = age + 1, "Bumped member age");
        Ok(())
    }

    pub async fn remove(&self, id: i64) -> Result<()> {
        let outcome = self.model.remove(TABLE, Some(vec![Key::from(id)])).await?;
        tracing::info!(id, summary = ?outcome.summary(), "Removed member");
        Ok(())
    }

    pub async fn reset(&self) -> Result<()> {
        match self.model.remove(TABLE, None).await {
            Ok(_) | Err(StoreError::TableNotFound(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn render(&self) -> Result<String> {
        let members = self.list().await?;
        if members.is_empty() {
            return Ok("no members yet\n".to_string());
        }

        let mut out = format!("{:<6}{:<16}{}\n", "id", "name", "age");
        for member in &members {
            out.push_str(&format!(
                "{:<6}{:<16}{}\n",
                member.get("id").map(|v| v.to_string()).unwrap_or_default(),
                member.get("name").and_then(|v| v.as_str()).unwrap_or(""),
                member.get("age").map(|v| v.to_string()).unwrap_or_default(),
            ));
        }
        Ok(out)
    }
}

fn member(id: i64, name: &str, age: i64) -> Record {
    let mut record = Record::new();
    record.insert("id".to_string(), json!(id));
    record.insert("name".to_string(), json!(name));
    record.insert("age".to_string(), json!(age));
    record
}
