//! Persistence collaborators for parsed records
//!
//! Plugins reach storage through the [`RecordStore`] trait on their
//! context. The bundled backend is an append-only JSONL file; an in-memory
//! store backs tests.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Filter for [`RecordStore::query`]. Matches on the record's top-level
/// `type` field when `kind` is set.
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub kind: Option<String>,
    pub limit: Option<usize>,
}

/// Save/query interface handed to plugins.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn save(&self, record: &Value) -> Result<()>;

    async fn save_batch(&self, records: &[Value]) -> Result<()>;

    async fn query(&self, query: &RecordQuery) -> Result<Vec<Value>>;
}

fn matches(record: &Value, query: &RecordQuery) -> bool {
    match &query.kind {
        Some(kind) => record.get("type").and_then(Value::as_str) == Some(kind.as_str()),
        None => true,
    }
}

/// Append-only store writing one JSON document per line.
pub struct JsonlStore {
    path: PathBuf,
    // Serializes appends so interleaved batches cannot shear lines.
    write_lock: Mutex<()>,
}

impl JsonlStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    async fn append(&self, lines: String) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(lines.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for JsonlStore {
    async fn save(&self, record: &Value) -> Result<()> {
        self.save_batch(std::slice::from_ref(record)).await
    }

    async fn save_batch(&self, records: &[Value]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut lines = String::new();
        for record in records {
            lines.push_str(&serde_json::to_string(record)?);
            lines.push('\n');
        }
        self.append(lines).await
    }

    async fn query(&self, query: &RecordQuery) -> Result<Vec<Value>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut results = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let record: Value = serde_json::from_str(line)
                .map_err(|err| Error::Storage(format!("corrupt record line: {err}")))?;
            if matches(&record, query) {
                results.push(record);
            }
            if let Some(limit) = query.limit {
                if results.len() >= limit {
                    break;
                }
            }
        }
        Ok(results)
    }
}

/// In-memory store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    records: tokio::sync::RwLock<Vec<Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn save(&self, record: &Value) -> Result<()> {
        self.records.write().await.push(record.clone());
        Ok(())
    }

    async fn save_batch(&self, records: &[Value]) -> Result<()> {
        self.records.write().await.extend_from_slice(records);
        Ok(())
    }

    async fn query(&self, query: &RecordQuery) -> Result<Vec<Value>> {
        let records = self.records.read().await;
        let mut results: Vec<Value> = records
            .iter()
            .filter(|record| matches(record, query))
            .cloned()
            .collect();
        if let Some(limit) = query.limit {
            results.truncate(limit);
        }
        Ok(results)
    }
}
