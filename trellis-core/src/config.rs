//! Runtime configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config.

use serde::Deserialize;

use crate::error::Result;

/// Knobs for a [`Runtime`](crate::reactive::Runtime).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Name recorded on runtime-level log events.
    pub name: String,

    /// Emit a `trace!` event for every tracked read.
    pub trace_reads: bool,

    /// Name given to the fresh batch a dispatcher creates per dispatch.
    pub dispatch_batch: String,
}

impl RuntimeConfig {
    /// Parse a config from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            name: "trellis".to_string(),
            trace_reads: false,
            dispatch_batch: "dispatcher".to_string(),
        }
    }
}
