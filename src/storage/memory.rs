use color_eyre::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use super::KeyValueStore;
use crate::lock;

#[derive(Debug, Clone, PartialEq)]
enum Value {
  Text(String),
  Int(i64),
}

/// Process-local store. Nothing survives a restart of the process, but
/// separate managers sharing one `Arc<MemoryStore>` see each other's writes,
/// which is how tests simulate a reload.
#[derive(Debug, Default)]
pub struct MemoryStore {
  values: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl KeyValueStore for MemoryStore {
  fn get_string(&self, key: &str) -> Result<Option<String>> {
    Ok(match lock(&self.values).get(key) {
      Some(Value::Text(s)) => Some(s.clone()),
      _ => None,
    })
  }

  fn set_string(&self, key: &str, value: &str) -> Result<()> {
    lock(&self.values).insert(key.to_string(), Value::Text(value.to_string()));
    Ok(())
  }

  fn get_int(&self, key: &str) -> Result<Option<i64>> {
    Ok(match lock(&self.values).get(key) {
      Some(Value::Int(i)) => Some(*i),
      _ => None,
    })
  }

  fn set_int(&self, key: &str, value: i64) -> Result<()> {
    lock(&self.values).insert(key.to_string(), Value::Int(value));
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<bool> {
    Ok(lock(&self.values).remove(key).is_some())
  }

  fn keys(&self) -> Result<BTreeSet<String>> {
    Ok(lock(&self.values).keys().cloned().collect())
  }
}
