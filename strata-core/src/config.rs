//! Module Configuration
//!
//! Registration functions receive a [`Configuration`]: a JSON table of
//! module parameters, typically one per registered module. Lookups
//! deserialize into whatever type the module asks for, and a missing or
//! ill-typed key is a [`ConfigurationError::Config`] naming the key.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::ConfigurationError;

/// One module's parameter table.
#[derive(Debug, Clone, Default)]
pub struct Configuration {
    table: Map<String, Value>,
}

impl Configuration {
    pub fn new(table: Map<String, Value>) -> Self {
        Self { table }
    }

    /// Parse a JSON object literal.
    pub fn from_json(json: &str) -> Result<Self, ConfigurationError> {
        let value: Value = serde_json::from_str(json).map_err(|e| ConfigurationError::Config {
            key: "<root>".to_string(),
            reason: e.to_string(),
        })?;
        match value {
            Value::Object(table) => Ok(Self { table }),
            other => Err(ConfigurationError::Config {
                key: "<root>".to_string(),
                reason: format!("expected an object, got {other}"),
            }),
        }
    }

    /// Required lookup: the key must exist and deserialize to `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, ConfigurationError> {
        let value = self
            .table
            .get(key)
            .ok_or_else(|| ConfigurationError::Config {
                key: key.to_string(),
                reason: "missing".to_string(),
            })?;
        serde_json::from_value(value.clone()).map_err(|e| ConfigurationError::Config {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    /// Optional lookup with a fallback. An ill-typed present value is
    /// still an error; only absence falls back.
    pub fn get_or<T: DeserializeOwned>(
        &self,
        key: &str,
        default: T,
    ) -> Result<T, ConfigurationError> {
        if self.table.contains_key(key) {
            self.get(key)
        } else {
            Ok(default)
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.table.contains_key(key)
    }

    pub fn table(&self) -> &Map<String, Value> {
        &self.table
    }
}
