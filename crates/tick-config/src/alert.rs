use serde::{Deserialize, Serialize};

use crate::types::HumanDuration;

/// Handler delivery policy: bounded retries with exponential backoff capped
/// at `backoff_max`. A handler that fails `max_attempts` times drops the
/// event and bumps its dropped counter.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AlertConfig {
    pub max_attempts: u32,
    pub backoff_base: HumanDuration,
    pub backoff_max: HumanDuration,
    /// Per-topic delivery queue capacity.
    pub queue_capacity: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: "500ms".parse().expect("static duration"),
            backoff_max: "30s".parse().expect("static duration"),
            queue_capacity: 1000,
        }
    }
}
