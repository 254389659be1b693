use serde::{Deserialize, Serialize};

use crate::fingerprint::FingerprintMode;

/// Engine settings of one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name of the state file inside the scope cache directory.
    pub state_file: String,
    /// Scheduler lane used by [`Tasks::run_async`](crate::Tasks::run_async).
    pub lane: String,
    /// Fingerprint mode of newly declared tasks.
    pub fingerprint: FingerprintMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_file: String::from("tasks.db"),
            lane: String::from("tasks"),
            fingerprint: FingerprintMode::Metadata,
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
