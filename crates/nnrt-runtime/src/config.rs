//! Session configuration.

use nnrt_core::{NnrtError, Result};
use serde::{Deserialize, Serialize};

/// Options fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Keep kernel results on the device between operators. When off, every
    /// dispatch returns its result to the host.
    pub pipeline: bool,

    /// Upload constant operator inputs (weights, biases, normalization
    /// statistics) to the device on first use and keep them there.
    pub cache_parameters: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pipeline: true,
            cache_parameters: true,
        }
    }
}

impl SessionConfig {
    pub fn with_pipeline(mut self, pipeline: bool) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn with_cache_parameters(mut self, cache_parameters: bool) -> Self {
        self.cache_parameters = cache_parameters;
        self
    }

    /// Parse a JSON object; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| NnrtError::Format(format!("session config: {e}")))
    }
}
