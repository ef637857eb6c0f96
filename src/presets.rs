//! API request presets loaded from a JSON file.
//!
//! A preset file is a JSON array of `{"method": ..., "params": {...}}`
//! entries that operators can fire by index instead of typing methods by
//! hand. Selection is validated synchronously: a bad index or a preset with
//! no method is rejected before any request is built, so malformed input
//! never reaches the wire.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Preset-specific error types.
#[derive(Debug, Error)]
pub enum PresetError {
    /// Selected index is outside the preset list.
    #[error("preset index {index} out of range ({count} presets loaded)")]
    OutOfRange { index: usize, count: usize },

    /// The preset entry has no method name.
    #[error("preset {index} is invalid: missing method")]
    MissingMethod { index: usize },

    /// The preset file could not be read.
    #[error("failed to read preset file {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The preset file is not a JSON array of presets.
    #[error("invalid preset file {path}: {source}")]
    Invalid {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// One API request preset.
///
/// Fields are optional on disk; validation happens at selection time so a
/// single bad entry does not prevent the rest of the file from loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiPreset {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

/// An ordered collection of API presets.
#[derive(Debug, Clone, Default)]
pub struct PresetBook {
    presets: Vec<ApiPreset>,
}

impl PresetBook {
    /// An empty book; every selection fails with `OutOfRange`.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load presets from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns `Unreadable` if the file cannot be read and `Invalid` if it
    /// does not parse as a JSON array of preset entries.
    pub fn load(path: &Path) -> Result<Self, PresetError> {
        let text = std::fs::read_to_string(path).map_err(|source| PresetError::Unreadable {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text).map_err(|source| PresetError::Invalid {
            path: path.display().to_string(),
            source,
        })
    }

    /// Parse presets from JSON text.
    ///
    /// # Errors
    ///
    /// Returns the underlying deserialization error if the text is not a
    /// JSON array of preset entries.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let presets: Vec<ApiPreset> = serde_json::from_str(text)?;
        Ok(Self { presets })
    }

    pub fn len(&self) -> usize {
        self.presets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }

    /// Iterate over the presets in file order.
    pub fn iter(&self) -> impl Iterator<Item = &ApiPreset> {
        self.presets.iter()
    }

    /// Resolve the preset at `index` (zero-based) into a `(method, params)`
    /// pair ready for [`MoonrakerClient::call`](crate::rpc::MoonrakerClient::call).
    ///
    /// Params that are not a JSON object are replaced with an empty object,
    /// matching how Moonraker's own test tooling tolerates sloppy presets.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` or `MissingMethod`; both fire before any
    /// request is constructed.
    pub fn request(&self, index: usize) -> Result<(&str, Value), PresetError> {
        let preset = self.presets.get(index).ok_or(PresetError::OutOfRange {
            index,
            count: self.presets.len(),
        })?;
        let method = preset
            .method
            .as_deref()
            .ok_or(PresetError::MissingMethod { index })?;
        let params = match &preset.params {
            Some(value @ Value::Object(_)) => value.clone(),
            _ => Value::Object(serde_json::Map::new()),
        };
        Ok((method, params))
    }
}
