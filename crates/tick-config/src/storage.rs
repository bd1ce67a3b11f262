use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the durable store (tasks, templates, topic state).
    pub dir: PathBuf,
    /// Where recording artifacts live; defaults to `<dir>/recordings`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recordings: Option<PathBuf>,
}

impl StorageConfig {
    pub fn recordings_dir(&self) -> PathBuf {
        self.recordings
            .clone()
            .unwrap_or_else(|| self.dir.join("recordings"))
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data"),
            recordings: None,
        }
    }
}
