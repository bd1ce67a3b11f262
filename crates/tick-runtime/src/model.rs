use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tick_lang::ast::Expr;
use tick_lang::vars::VarValue;

// ---------------------------------------------------------------------------
// Id validation
// ---------------------------------------------------------------------------

/// Ids for tasks, templates, recordings and replays: `[A-Za-z0-9._-]+`.
pub fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

// ---------------------------------------------------------------------------
// API error taxonomy
// ---------------------------------------------------------------------------

/// Behavioral error kinds surfaced synchronously to API callers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DbrpRecord {
    pub db: String,
    pub rp: String,
}

impl From<&tick_lang::ast::Dbrp> for DbrpRecord {
    fn from(d: &tick_lang::ast::Dbrp) -> Self {
        DbrpRecord {
            db: d.db.clone(),
            rp: d.rp.clone(),
        }
    }
}

/// A task var as persisted and accepted over the API. Lambdas and regexes
/// travel as source strings and are parsed at bind time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum VarRecord {
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Nanoseconds.
    Duration(i64),
    String(String),
    Regex(String),
    /// Lambda body source, e.g. `"\"value\" > 5"`.
    Lambda(String),
    List(Vec<VarRecord>),
    Star,
}

impl VarRecord {
    pub fn to_value(&self) -> Result<VarValue> {
        Ok(match self {
            VarRecord::Bool(b) => VarValue::Bool(*b),
            VarRecord::Int(i) => VarValue::Int(*i),
            VarRecord::Float(f) => VarValue::Float(*f),
            VarRecord::Duration(ns) => VarValue::Duration(*ns),
            VarRecord::String(s) => VarValue::Str(s.clone()),
            VarRecord::Regex(r) => VarValue::Regex(r.clone()),
            VarRecord::Lambda(src) => {
                let expr = tick_lang::parse_expression(src)?;
                // Accept either a bare expression or a full lambda literal.
                match expr {
                    Expr::Lambda(body) => VarValue::Lambda(*body),
                    other => VarValue::Lambda(other),
                }
            }
            VarRecord::List(items) => VarValue::List(
                items
                    .iter()
                    .map(|i| i.to_value())
                    .collect::<Result<Vec<_>>>()?,
            ),
            VarRecord::Star => VarValue::Star,
        })
    }
}

/// Convert a var map to the form the compiler binds against.
pub fn bind_vars(vars: &BTreeMap<String, VarRecord>) -> Result<BTreeMap<String, VarValue>> {
    vars.iter()
        .map(|(k, v)| Ok((k.clone(), v.to_value()?)))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// `stream` or `batch`, inferred at compile time.
    pub task_type: String,
    pub dbrps: Vec<DbrpRecord>,
    pub script: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default)]
    pub vars: BTreeMap<String, VarRecord>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_enabled: Option<DateTime<Utc>>,
    /// Last execution error; empty while healthy.
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub script: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    pub id: String,
    /// `stream` or `batch`.
    pub kind: String,
    pub status: RunStatus,
    pub size: u64,
    pub date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Checksum of the artifact bytes, filled when the recording finishes.
    #[serde(default)]
    pub sha256: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayClock {
    Fast,
    Real,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Replay {
    pub id: String,
    pub task: String,
    pub recording: String,
    pub clock: ReplayClock,
    pub recording_time: bool,
    pub status: RunStatus,
    pub date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_pattern() {
        assert!(valid_id("my-task_1.2"));
        assert!(valid_id("A"));
        assert!(!valid_id(""));
        assert!(!valid_id("bad id"));
        assert!(!valid_id("no/slash"));
        assert!(!valid_id("no:colon"));
    }

    #[test]
    fn lambda_var_parses_to_expression() {
        let v = VarRecord::Lambda("\"value\" > 5".into()).to_value().unwrap();
        assert!(matches!(v, VarValue::Lambda(_)));
    }

    #[test]
    fn var_record_serde_is_tagged() {
        let v = VarRecord::Duration(10_000_000_000);
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, r#"{"type":"duration","value":10000000000}"#);
        let back: VarRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn task_record_roundtrip() {
        let task = Task {
            id: "t1".into(),
            task_type: "stream".into(),
            dbrps: vec![DbrpRecord {
                db: "telegraf".into(),
                rp: "autogen".into(),
            }],
            script: "stream|from()".into(),
            status: TaskStatus::Disabled,
            template_id: None,
            vars: BTreeMap::new(),
            created: Utc::now(),
            modified: Utc::now(),
            last_enabled: None,
            error: String::new(),
        };
        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(task, back);
    }
}
