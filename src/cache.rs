use crate::registers::{Meta, Value, ValueKind};
use crate::store::Store;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub value: Value,
    pub kind: ValueKind,
    pub persisted: bool,
}

/// Latest value of every key, and whether the store has seen it yet.
///
/// All decoded and derived values pass through here; `flush` writes the
/// entries that changed since the last flush.
#[derive(Debug, Default)]
pub struct ValueCache {
    entries: BTreeMap<String, CacheEntry>,
    declared: HashSet<String>,
    pending_schemas: Vec<(String, Meta)>,
}

fn kind_of(value: &Value) -> ValueKind {
    match value {
        Value::Bool(_) => ValueKind::Boolean,
        Value::Number(_) => ValueKind::Number,
        Value::Text(_) => ValueKind::String,
    }
}

impl ValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&mut self, key: String, value: Value, persisted: bool) {
        let kind = kind_of(&value);
        self.entries.insert(
            key,
            CacheEntry {
                value,
                kind,
                persisted,
            },
        );
    }

    /// Store `value`; it is flushed again only if it changed.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        let unchanged = self.entries.get(&key).is_some_and(|e| e.value == value);
        if unchanged {
            return;
        }
        self.write(key, value, false);
    }

    /// Store `value` and flush it even when it did not change.
    pub fn renew(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.write(key.into(), value.into(), false);
    }

    /// Store a value loaded from the store; nothing to flush.
    pub fn restore(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.write(key.into(), value.into(), true);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).map(|e| &e.value)
    }

    pub fn entry(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn number(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }

    /// Queue a schema declaration for `key` unless it was declared before.
    pub fn declare(&mut self, key: impl Into<String>, meta: Meta) {
        let key = key.into();
        if self.declared.insert(key.clone()) {
            self.pending_schemas.push((key, meta));
        }
    }

    /// Entries waiting for the next flush.
    pub fn unpersisted(&self) -> usize {
        self.entries.values().filter(|e| !e.persisted).count()
    }

    /// Write pending schemas and every unpersisted entry to `store`, then
    /// commit. Failed entries stay unpersisted and are retried by the next
    /// flush. Returns the number of values written.
    pub async fn flush<S: Store>(&mut self, store: &mut S) -> usize {
        let schemas = std::mem::take(&mut self.pending_schemas);
        for (key, meta) in schemas {
            if let Err(e) = store.declare(&key, &meta).await {
                tracing::warn!("Error while declaring {}: {}", key, e);
                self.pending_schemas.push((key, meta));
            }
        }

        let mut written = 0;
        for (key, entry) in self.entries.iter_mut().filter(|(_, e)| !e.persisted) {
            match store.set(key, &entry.value).await {
                Ok(()) => {
                    entry.persisted = true;
                    written += 1;
                    tracing::debug!("Fetched {}, val={}", key, entry.value);
                }
                Err(e) => {
                    tracing::warn!("Error while fetching {}, val={} err={}", key, entry.value, e);
                }
            }
        }

        if let Err(e) = store.commit().await {
            tracing::warn!("Error while committing states: {}", e);
        }
        written
    }
}
