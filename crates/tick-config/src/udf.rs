use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::HumanDuration;

/// `[udf]` section: the default per-request timeout plus the named
/// functions tasks may reference with `@name(...)`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct UdfConfig {
    pub timeout: HumanDuration,
    pub functions: HashMap<String, UdfFunction>,
}

impl Default for UdfConfig {
    fn default() -> Self {
        Self {
            timeout: "30s".parse().expect("static duration"),
            functions: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct UdfFunction {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<HumanDuration>,
}
