use serde::{Deserialize, Serialize};

use crate::types::HumanDuration;

/// One upstream time-series database reachable by batch query nodes.
/// `password` is a secret: it round-trips through TOML but is redacted in
/// override-service responses.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct UpstreamConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_timeout")]
    pub timeout: HumanDuration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

fn default_timeout() -> HumanDuration {
    "30s".parse().expect("static duration")
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            url: String::new(),
            timeout: default_timeout(),
            username: None,
            password: None,
        }
    }
}
