//! Persistence collaborator.
//!
//! The poller only needs a key/value surface with schema declarations. A
//! JSON file store is provided for the collector binary and an in-memory
//! store for tests and embedding.

use crate::error::{Result, Sun2000Error};
use crate::registers::{Meta, Value, ValueKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredValue {
    pub value: Value,
    pub updated: DateTime<Utc>,
}

/// Declared schema of a key, as kept by a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub role: String,
    #[serde(rename = "type")]
    pub kind: ValueKind,
}

impl From<&Meta> for ObjectRecord {
    fn from(meta: &Meta) -> Self {
        Self {
            name: meta.name.to_string(),
            unit: meta.unit.map(str::to_string),
            role: meta.role.to_string(),
            kind: meta.kind,
        }
    }
}

pub trait Store {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<StoredValue>>> + Send;

    fn set(&mut self, key: &str, value: &Value) -> impl Future<Output = Result<()>> + Send;

    /// Declare the schema of `key`. Declaring twice is harmless.
    fn declare(&mut self, key: &str, meta: &Meta) -> impl Future<Output = Result<()>> + Send;

    /// Make the writes so far durable.
    fn commit(&mut self) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    states: BTreeMap<String, StoredValue>,
    #[serde(default)]
    objects: BTreeMap<String, ObjectRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Snapshot,
    failing: bool,
    writes: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a value with an explicit timestamp.
    pub fn insert(&mut self, key: &str, value: impl Into<Value>, updated: DateTime<Utc>) {
        self.data.states.insert(
            key.to_string(),
            StoredValue {
                value: value.into(),
                updated,
            },
        );
    }

    /// Make every following `set` and `declare` fail.
    pub fn set_failing(&mut self, failing: bool) {
        self.failing = failing;
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.data.states.get(key).map(|s| &s.value)
    }

    pub fn object(&self, key: &str) -> Option<&ObjectRecord> {
        self.data.objects.get(key)
    }

    /// Number of successful `set` calls.
    pub fn writes(&self) -> usize {
        self.writes
    }
}

impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<StoredValue>> {
        Ok(self.data.states.get(key).cloned())
    }

    async fn set(&mut self, key: &str, value: &Value) -> Result<()> {
        if self.failing {
            return Err(Sun2000Error::Store(format!("cannot write {key}")));
        }
        self.insert(key, value.clone(), Utc::now());
        self.writes += 1;
        Ok(())
    }

    async fn declare(&mut self, key: &str, meta: &Meta) -> Result<()> {
        if self.failing {
            return Err(Sun2000Error::Store(format!("cannot declare {key}")));
        }
        self.data.objects.insert(key.to_string(), meta.into());
        Ok(())
    }
}

/// Store kept as one JSON document on disk, rewritten on `commit`.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    data: Snapshot,
    dirty: bool,
}

impl FileStore {
    /// Open `path`, starting empty when the file does not exist yet.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                Sun2000Error::Store(format!("{} is not a valid state file: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(e) => return Err(e.into()),
        };
        tracing::info!(
            "Loaded {} states from {}",
            data.states.len(),
            path.display()
        );
        Ok(Self {
            path,
            data,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Store for FileStore {
    async fn get(&self, key: &str) -> Result<Option<StoredValue>> {
        Ok(self.data.states.get(key).cloned())
    }

    async fn set(&mut self, key: &str, value: &Value) -> Result<()> {
        self.data.states.insert(
            key.to_string(),
            StoredValue {
                value: value.clone(),
                updated: Utc::now(),
            },
        );
        self.dirty = true;
        Ok(())
    }

    async fn declare(&mut self, key: &str, meta: &Meta) -> Result<()> {
        let record = ObjectRecord::from(meta);
        if self.data.objects.get(key) != Some(&record) {
            self.data.objects.insert(key.to_string(), record);
            self.dirty = true;
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let text = serde_json::to_string_pretty(&self.data)
            .map_err(|e| Sun2000Error::Store(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, text).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        self.dirty = false;
        Ok(())
    }
}
