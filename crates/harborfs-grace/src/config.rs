//! Configuration for the grace subsystem.

use serde::{Deserialize, Serialize};

/// Process-wide grace settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraceConfig {
    /// Key of the shared grace object in the cluster KV store.
    pub grace_object_name: String,
}

impl Default for GraceConfig {
    fn default() -> Self {
        Self {
            grace_object_name: "grace".to_string(),
        }
    }
}
