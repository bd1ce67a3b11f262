use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Field values
// ---------------------------------------------------------------------------

/// A typed field value. Tags are always strings; fields carry one of the
/// four scalar types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(f) => Some(*f),
            FieldValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Bool(b) => write!(f, "{b}"),
            FieldValue::Int(i) => write!(f, "{i}"),
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Str(s) => write!(f, "{s}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Group keys
// ---------------------------------------------------------------------------

/// Identity of a logical substream: measurement plus the tag values of the
/// current dimensions, rendered `name\u{0}k=v,k=v`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey(String);

impl GroupKey {
    pub fn new(name: &str, tags: &BTreeMap<String, String>, dims: &[String]) -> GroupKey {
        let mut key = String::with_capacity(name.len() + dims.len() * 8);
        key.push_str(name);
        key.push('\u{0}');
        for (i, d) in dims.iter().enumerate() {
            if i > 0 {
                key.push(',');
            }
            key.push_str(d);
            key.push('=');
            if let Some(v) = tags.get(d) {
                key.push_str(v);
            }
        }
        GroupKey(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Render the NUL separator as ':' for human consumption.
        match self.0.split_once('\u{0}') {
            Some((name, rest)) if !rest.is_empty() => write!(f, "{name}:{rest}"),
            Some((name, _)) => write!(f, "{name}"),
            None => write!(f, "{}", self.0),
        }
    }
}

// ---------------------------------------------------------------------------
// Points & batches
// ---------------------------------------------------------------------------

/// A single immutable time-series sample.
///
/// `dimensions` is the sorted subset of tag keys that defines the point's
/// group; it is set by `from`/`groupBy` nodes as the point moves through a
/// task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub time: DateTime<Utc>,
    pub name: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dimensions: Vec<String>,
}

impl Point {
    pub fn new(time: DateTime<Utc>, name: impl Into<String>) -> Point {
        Point {
            time,
            name: name.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            dimensions: Vec::new(),
        }
    }

    /// Replace the group dimensions, keeping them sorted.
    pub fn with_dimensions(mut self, mut dims: Vec<String>) -> Point {
        dims.sort();
        dims.dedup();
        self.dimensions = dims;
        self
    }

    pub fn group_key(&self) -> GroupKey {
        GroupKey::new(&self.name, &self.tags, &self.dimensions)
    }

    /// Tag values for the current dimensions only.
    pub fn group_tags(&self) -> BTreeMap<String, String> {
        self.dimensions
            .iter()
            .filter_map(|d| self.tags.get(d).map(|v| (d.clone(), v.clone())))
            .collect()
    }
}

/// An ordered run of points sharing a measurement and group, covering
/// `[t_min, t_max]` as stamped by the producing node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub name: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub group: GroupKey,
    pub t_min: DateTime<Utc>,
    pub t_max: DateTime<Utc>,
    pub points: Vec<Point>,
}

// ---------------------------------------------------------------------------
// Messages & barriers
// ---------------------------------------------------------------------------

/// Control token flowing with the data: a group close or a checkpoint.
/// Barriers are never reordered past the data they follow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Barrier {
    /// The closed group, or None for a whole-edge checkpoint.
    pub group: Option<GroupKey>,
    pub time: DateTime<Utc>,
}

/// What an edge carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Point(Point),
    Batch(Batch),
    Barrier(Barrier),
}

impl Message {
    /// Group key of the payload, if any.
    pub fn group(&self) -> Option<GroupKey> {
        match self {
            Message::Point(p) => Some(p.group_key()),
            Message::Batch(b) => Some(b.group.clone()),
            Message::Barrier(b) => b.group.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn point_with_tags(tags: &[(&str, &str)], dims: &[&str]) -> Point {
        let mut p = Point::new(Utc.timestamp_opt(0, 0).unwrap(), "m");
        for (k, v) in tags {
            p.tags.insert(k.to_string(), v.to_string());
        }
        p.with_dimensions(dims.iter().map(|d| d.to_string()).collect())
    }

    #[test]
    fn group_key_includes_only_dimensions() {
        let p = point_with_tags(&[("host", "a"), ("dc", "x")], &["host"]);
        let q = point_with_tags(&[("host", "a"), ("dc", "y")], &["host"]);
        assert_eq!(p.group_key(), q.group_key());
    }

    #[test]
    fn group_key_distinguishes_values() {
        let p = point_with_tags(&[("host", "a")], &["host"]);
        let q = point_with_tags(&[("host", "b")], &["host"]);
        assert_ne!(p.group_key(), q.group_key());
    }

    #[test]
    fn dimensions_sorted_and_deduped() {
        let p = point_with_tags(&[("b", "1"), ("a", "2")], &["b", "a", "b"]);
        assert_eq!(p.dimensions, vec!["a", "b"]);
    }

    #[test]
    fn group_key_display_hides_nul() {
        let p = point_with_tags(&[("host", "a")], &["host"]);
        assert_eq!(p.group_key().to_string(), "m:host=a");
    }

    #[test]
    fn point_serde_roundtrip() {
        let mut p = point_with_tags(&[("host", "a")], &["host"]);
        p.fields.insert("value".into(), FieldValue::Float(1.5));
        p.fields.insert("n".into(), FieldValue::Int(3));
        let json = serde_json::to_string(&p).unwrap();
        let back: Point = serde_json::from_str(&json).unwrap();
        assert_eq!(p, back);
    }
}
