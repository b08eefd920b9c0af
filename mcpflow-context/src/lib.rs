//! ABOUTME: Serialization-safe shared context for inter-step data flow
//! ABOUTME: every write is gated by an eager round-trip serializability probe

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use mcpflow_core::Value;
use serde::{Deserialize, Serialize};

/// Errors raised by [`WorkflowContext`] mutations.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("value for key '{0}' is not serializable")]
    NonSerializableValue(String),
}

/// Deterministic, serializable snapshot of a [`WorkflowContext`], used for
/// persistence and for carrying context across step boundaries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub data: HashMap<String, Value>,
    pub metadata: HashMap<String, Value>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Shared inter-step key/value store. Every write is validated by an eager
/// round-trip through a portable binary encoding before it is accepted;
/// values that fail are rejected rather than silently kept.
pub struct WorkflowContext {
    data: RwLock<HashMap<String, Value>>,
    metadata: RwLock<HashMap<String, Value>>,
    created_at: DateTime<Utc>,
    last_updated: RwLock<DateTime<Utc>>,
}

impl WorkflowContext {
    #[must_use]
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            data: RwLock::new(HashMap::new()),
            metadata: RwLock::new(HashMap::new()),
            created_at: now,
            last_updated: RwLock::new(now),
        }
    }

    /// Validates `value` with the serializability probe and, on success,
    /// stores it under `key`.
    pub fn set(&self, key: impl Into<String>, value: Value) -> Result<(), ContextError> {
        let key = key.into();
        probe_serializable(&value).map_err(|()| ContextError::NonSerializableValue(key.clone()))?;
        self.data_mut().insert(key, value);
        self.touch();
        Ok(())
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.data_ref().get(key).cloned()
    }

    #[must_use]
    pub fn get_or(&self, key: &str, default: Value) -> Value {
        self.get(key).unwrap_or(default)
    }

    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.data_ref().contains_key(key)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        let removed = self.data_mut().remove(key);
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    /// Bulk-merges `fields` into metadata; every value is probed the same
    /// way `set` probes data values.
    pub fn update_metadata(&self, fields: HashMap<String, Value>) -> Result<(), ContextError> {
        for (key, value) in &fields {
            probe_serializable(value).map_err(|()| ContextError::NonSerializableValue(key.clone()))?;
        }
        self.metadata_mut().extend(fields);
        self.touch();
        Ok(())
    }

    #[must_use]
    pub fn get_metadata(&self, key: &str) -> Option<Value> {
        self.metadata_ref().get(key).cloned()
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn last_updated(&self) -> DateTime<Utc> {
        *self.last_updated.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Deterministic snapshot for persistence or cross-step transport.
    #[must_use]
    pub fn to_map(&self) -> ContextSnapshot {
        ContextSnapshot {
            data: self.data_ref().clone(),
            metadata: self.metadata_ref().clone(),
            created_at: Some(self.created_at),
            last_updated: Some(self.last_updated()),
        }
    }

    /// Reconstructs a context from a snapshot. Values are assumed already
    /// serializable (they came from a prior `to_map`) and are not re-probed.
    #[must_use]
    pub fn from_map(snapshot: ContextSnapshot) -> Self {
        let now = Utc::now();
        Self {
            data: RwLock::new(snapshot.data),
            metadata: RwLock::new(snapshot.metadata),
            created_at: snapshot.created_at.unwrap_or(now),
            last_updated: RwLock::new(snapshot.last_updated.unwrap_or(now)),
        }
    }

    fn touch(&self) {
        *self.last_updated.write().unwrap_or_else(std::sync::PoisonError::into_inner) = Utc::now();
    }

    fn data_ref(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Value>> {
        self.data.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn data_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Value>> {
        self.data.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn metadata_ref(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Value>> {
        self.metadata.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn metadata_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Value>> {
        self.metadata.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for WorkflowContext {
    fn default() -> Self {
        Self::new()
    }
}

fn probe_serializable(value: &Value) -> Result<(), ()> {
    if mcpflow_core::serializable::probe(value) {
        Ok(())
    } else {
        Err(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_then_get_roundtrips() {
        let ctx = WorkflowContext::new();
        ctx.set("a", json!({"v": 2})).unwrap();
        assert_eq!(ctx.get("a"), Some(json!({"v": 2})));
    }

    #[test]
    fn set_updates_last_updated() {
        let ctx = WorkflowContext::new();
        let before = ctx.last_updated();
        std::thread::sleep(std::time::Duration::from_millis(5));
        ctx.set("a", json!(1)).unwrap();
        assert!(ctx.last_updated() >= before);
    }

    #[test]
    fn has_and_remove() {
        let ctx = WorkflowContext::new();
        ctx.set("a", json!(1)).unwrap();
        assert!(ctx.has("a"));
        assert_eq!(ctx.remove("a"), Some(json!(1)));
        assert!(!ctx.has("a"));
    }

    #[test]
    fn get_or_returns_default_when_missing() {
        let ctx = WorkflowContext::new();
        assert_eq!(ctx.get_or("missing", json!(null)), json!(null));
    }

    #[test]
    fn update_metadata_merges_fields() {
        let ctx = WorkflowContext::new();
        let mut fields = HashMap::new();
        fields.insert("run_id".to_string(), json!("abc"));
        ctx.update_metadata(fields).unwrap();
        assert_eq!(ctx.get_metadata("run_id"), Some(json!("abc")));
    }

    #[test]
    fn to_map_from_map_fixpoint() {
        let ctx = WorkflowContext::new();
        ctx.set("a", json!([1, 2, 3])).unwrap();
        ctx.update_metadata(HashMap::from([("k".to_string(), json!("v"))])).unwrap();

        let once = ctx.to_map();
        let restored = WorkflowContext::from_map(once.clone());
        let twice = restored.to_map();
        assert_eq!(once.data, twice.data);
        assert_eq!(once.metadata, twice.metadata);
    }

    #[test]
    fn every_json_value_shape_is_serializable() {
        let ctx = WorkflowContext::new();
        for value in [
            json!(null),
            json!(true),
            json!(42),
            json!(3.5),
            json!("text"),
            json!([1, "two", false]),
            json!({"nested": {"a": [1,2]}}),
        ] {
            assert!(ctx.set("k", value).is_ok());
        }
    }

    proptest::proptest! {
        #[test]
        fn arbitrary_json_objects_always_pass_the_probe(
            pairs in proptest::collection::vec((proptest::string::string_regex("[a-z]{1,8}").unwrap(), proptest::num::i32::ANY), 0..8)
        ) {
            let ctx = WorkflowContext::new();
            for (k, v) in pairs {
                ctx.set(k, json!(v)).unwrap();
            }
        }
    }
}
