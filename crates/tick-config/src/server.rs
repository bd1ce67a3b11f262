use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address for the point receiver, e.g. `"tcp://127.0.0.1:9092"`.
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "tcp://127.0.0.1:9092".to_string(),
        }
    }
}
