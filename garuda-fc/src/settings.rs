//! Device-local settings written by `set_config`

use crate::error::{Error, Result};
use serde_json::{Map, Value};
use std::fs;
use std::path::PathBuf;

/// JSON settings object, optionally backed by a file
#[derive(Debug, Default)]
pub struct DeviceSettings {
    values: Map<String, Value>,
    path: Option<PathBuf>,
}

impl DeviceSettings {
    /// In-memory settings
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Settings persisted at `path`; existing content is loaded
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            match serde_json::from_str::<Value>(&contents)? {
                Value::Object(map) => map,
                other => {
                    return Err(Error::Config(format!(
                        "{} holds {} instead of an object",
                        path.display(),
                        json_kind(&other)
                    )));
                }
            }
        } else {
            Map::new()
        };
        log::info!("Device settings: {} ({} keys)", path.display(), values.len());
        Ok(Self {
            values,
            path: Some(path),
        })
    }

    /// Merge a JSON object payload into the settings and persist them.
    ///
    /// Top-level keys replace existing ones. Nothing changes on error.
    pub fn merge_json(&mut self, payload: &str) -> Result<usize> {
        let incoming = match serde_json::from_str::<Value>(payload)? {
            Value::Object(map) => map,
            other => {
                return Err(Error::Other(format!(
                    "set_config expects an object, got {}",
                    json_kind(&other)
                )));
            }
        };

        let mut merged = self.values.clone();
        let count = incoming.len();
        merged.extend(incoming);
        self.persist(&merged)?;
        self.values = merged;
        Ok(count)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn persist(&self, values: &Map<String, Value>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(values)?;
        fs::write(path, contents)?;
        Ok(())
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
