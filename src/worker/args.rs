use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Extra arguments handed to every callback of a run: positional values plus
/// keyed values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkArgs {
    #[serde(default)]
    positional: Vec<Value>,
    #[serde(default)]
    keyed: BTreeMap<String, Value>,
}

impl WorkArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keyed.insert(key.into(), value.into());
        self
    }

    /// Combines construction-time arguments (`self`) with call-time ones:
    /// positional values are appended, keyed values override.
    pub fn merged(&self, call_time: &WorkArgs) -> WorkArgs {
        let mut positional = self.positional.clone();
        positional.extend(call_time.positional.iter().cloned());

        let mut keyed = self.keyed.clone();
        for (key, value) in &call_time.keyed {
            keyed.insert(key.clone(), value.clone());
        }

        WorkArgs { positional, keyed }
    }

    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    pub fn keyed(&self) -> &BTreeMap<String, Value> {
        &self.keyed
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.keyed.get(key)
    }

    /// Deserializes the keyed value `key` into `T`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .keyed
            .get(key)
            .with_context(|| format!("missing keyed argument `{key}`"))?;
        serde_json::from_value(value.clone())
            .with_context(|| format!("keyed argument `{key}` has an unexpected type"))
    }

    /// Deserializes the positional value at `index` into `T`.
    pub fn arg_as<T: DeserializeOwned>(&self, index: usize) -> Result<T> {
        let value = self
            .positional
            .get(index)
            .with_context(|| format!("missing positional argument {index}"))?;
        serde_json::from_value(value.clone())
            .with_context(|| format!("positional argument {index} has an unexpected type"))
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyed.is_empty()
    }
}
