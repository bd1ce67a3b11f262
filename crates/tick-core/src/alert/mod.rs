use std::collections::{BTreeMap, HashMap};
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tick_lang::compiler::{HandlerCall, InhibitSpec};

use crate::point::Point;

// ---------------------------------------------------------------------------
// Levels
// ---------------------------------------------------------------------------

/// Alert severity. The derive order gives `OK < INFO < WARNING < CRITICAL`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    #[default]
    Ok,
    Info,
    Warning,
    Critical,
}

impl Level {
    pub fn name(&self) -> &'static str {
        match self {
            Level::Ok => "OK",
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// The triggering data attached to an event: the point (or batch contents)
/// the alert node evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    pub name: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub points: Vec<Point>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub topic: String,
    pub id: String,
    pub message: String,
    pub details: String,
    pub time: DateTime<Utc>,
    pub level: Level,
    pub previous_level: Level,
    /// Nanoseconds since the last OK→non-OK transition; 0 while OK.
    pub duration: i64,
    /// Whether the producing node tracks state changes (hysteresis).
    pub recoverable: bool,
    pub data: EventData,
}

/// Handler match lambdas resolve names against the event itself, then the
/// event tags, then the first data point's fields.
impl crate::eval::Scope for AlertEvent {
    fn lookup(&self, name: &str) -> Option<crate::eval::Value> {
        use crate::eval::Value;
        match name {
            "level" => return Some(Value::Str(self.level.name().to_string())),
            "previousLevel" => return Some(Value::Str(self.previous_level.name().to_string())),
            "id" => return Some(Value::Str(self.id.clone())),
            "topic" => return Some(Value::Str(self.topic.clone())),
            "message" => return Some(Value::Str(self.message.clone())),
            "duration" => return Some(Value::Duration(self.duration)),
            "name" => return Some(Value::Str(self.data.name.clone())),
            _ => {}
        }
        if let Some(v) = self.data.tags.get(name) {
            return Some(Value::Str(v.clone()));
        }
        self.data
            .points
            .first()
            .and_then(|p| p.fields.get(name).map(Value::from))
    }
}

// ---------------------------------------------------------------------------
// Per-(topic,id) state machine
// ---------------------------------------------------------------------------

/// Durable state of one `(topic, id)` pair. `advance` applies one candidate
/// level and yields the `(previous_level, duration)` pair for the event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventState {
    pub level: Level,
    pub first_non_ok: Option<DateTime<Utc>>,
    pub last_event: DateTime<Utc>,
    pub message: String,
}

impl EventState {
    pub fn new(now: DateTime<Utc>) -> EventState {
        EventState {
            level: Level::Ok,
            first_non_ok: None,
            last_event: now,
            message: String::new(),
        }
    }

    /// Apply a candidate level at `now`.
    pub fn advance(&mut self, level: Level, now: DateTime<Utc>) -> (Level, i64) {
        let previous = self.level;
        let duration = if level == Level::Ok {
            self.first_non_ok = None;
            0
        } else {
            match self.first_non_ok {
                Some(first) => (now - first).num_nanoseconds().unwrap_or(0),
                None => {
                    self.first_non_ok = Some(now);
                    0
                }
            }
        };
        self.level = level;
        self.last_event = now;
        (previous, duration)
    }
}

// ---------------------------------------------------------------------------
// Topic handler specs
// ---------------------------------------------------------------------------

/// A handler bound to a topic, as persisted in the topic-handler store.
/// `options` is kind-specific: `{"path": ...}` for log, `{"url": ...}` for
/// post, `{"address": ...}` for tcp, `{"topics": [...]}` for publish,
/// `{"interval": "10s", "topic": ...}` for aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerSpec {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub options: serde_json::Value,
    /// Lambda source filtering events before delivery; absent = match all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_expr: Option<String>,
}

// ---------------------------------------------------------------------------
// Inhibition
// ---------------------------------------------------------------------------

/// Active suppression matrix.
///
/// A CRITICAL event whose node declares `.inhibit(category, tags...)`
/// registers one matcher per inhibit clause; any event in the inhibited
/// category whose tags carry the same values for the scoped keys is
/// suppressed at routing time.
#[derive(Debug, Default)]
pub struct Inhibitor {
    /// inhibited category → source key → required tag values.
    rules: HashMap<String, HashMap<String, BTreeMap<String, String>>>,
}

impl Inhibitor {
    /// Register or clear the matchers owned by `source` (a `(topic,id)`
    /// rendering) according to whether its event is an active CRITICAL.
    pub fn update_source(
        &mut self,
        source: &str,
        specs: &[InhibitSpec],
        tags: &BTreeMap<String, String>,
        active: bool,
    ) {
        for spec in specs {
            let by_source = self.rules.entry(spec.category.clone()).or_default();
            if active {
                let scoped: BTreeMap<String, String> = spec
                    .tags
                    .iter()
                    .filter_map(|k| tags.get(k).map(|v| (k.clone(), v.clone())))
                    .collect();
                by_source.insert(source.to_string(), scoped);
            } else {
                by_source.remove(source);
            }
        }
    }

    pub fn is_inhibited(&self, category: &str, tags: &BTreeMap<String, String>) -> bool {
        let Some(by_source) = self.rules.get(category) else {
            return false;
        };
        by_source
            .values()
            .any(|required| required.iter().all(|(k, v)| tags.get(k) == Some(v)))
    }

    /// Drop every matcher registered by sources under a key prefix; used
    /// when a topic (and the events that own the matchers) goes away.
    pub fn clear_source_prefix(&mut self, prefix: &str) {
        for by_source in self.rules.values_mut() {
            by_source.retain(|source, _| !source.starts_with(prefix));
        }
        self.rules.retain(|_, by_source| !by_source.is_empty());
    }
}

// ---------------------------------------------------------------------------
// EventSink — the node-side boundary of the alert service
// ---------------------------------------------------------------------------

/// Extra routing context an alert node supplies with each event.
#[derive(Debug, Clone, Default)]
pub struct EventContext {
    /// Inhibition category this event belongs to.
    pub category: Option<String>,
    /// Inhibit clauses this node declares.
    pub inhibits: Vec<InhibitSpec>,
    /// Node-local handler call-sites (`.log()`, `.post()`, `.tcp()`).
    pub local_handlers: Vec<HandlerCall>,
}

/// The alert service as seen by alert nodes: publish an event, and read
/// back persisted state for hysteresis restoration after restart.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: AlertEvent, ctx: EventContext) -> anyhow::Result<()>;

    async fn last_state(&self, topic: &str, id: &str) -> Option<EventState>;
}

/// A sink that drops everything, for tasks executed without alerting wired
/// up (replays into a bare DAG, unit tests).
pub struct NullEventSink;

#[async_trait]
impl EventSink for NullEventSink {
    async fn publish(&self, _event: AlertEvent, _ctx: EventContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn last_state(&self, _topic: &str, _id: &str) -> Option<EventState> {
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn level_ordering() {
        assert!(Level::Ok < Level::Info);
        assert!(Level::Info < Level::Warning);
        assert!(Level::Warning < Level::Critical);
    }

    #[test]
    fn state_tracks_duration_across_levels() {
        let mut s = EventState::new(t(0));
        let (prev, dur) = s.advance(Level::Warning, t(0));
        assert_eq!((prev, dur), (Level::Ok, 0));

        // WARNING → CRITICAL keeps the original non-OK anchor.
        let (prev, dur) = s.advance(Level::Critical, t(1));
        assert_eq!(prev, Level::Warning);
        assert_eq!(dur, 1_000_000_000);

        let (prev, dur) = s.advance(Level::Critical, t(5));
        assert_eq!(prev, Level::Critical);
        assert_eq!(dur, 5_000_000_000);
    }

    #[test]
    fn recovery_resets_duration() {
        let mut s = EventState::new(t(0));
        s.advance(Level::Critical, t(0));
        let (prev, dur) = s.advance(Level::Ok, t(10));
        assert_eq!(prev, Level::Critical);
        assert_eq!(dur, 0);
        assert_eq!(s.first_non_ok, None);

        // A fresh excursion re-anchors.
        let (_, dur) = s.advance(Level::Warning, t(20));
        assert_eq!(dur, 0);
        let (_, dur) = s.advance(Level::Warning, t(23));
        assert_eq!(dur, 3_000_000_000);
    }

    fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn inhibitor_scoped_by_tags() {
        let mut inh = Inhibitor::default();
        let specs = vec![InhibitSpec {
            category: "cpu".into(),
            tags: vec!["region".into()],
        }];
        inh.update_source("region_alert/us-east", &specs, &tags(&[("region", "us-east")]), true);

        assert!(inh.is_inhibited("cpu", &tags(&[("region", "us-east"), ("host", "a")])));
        assert!(!inh.is_inhibited("cpu", &tags(&[("region", "us-west"), ("host", "a")])));
        assert!(!inh.is_inhibited("mem", &tags(&[("region", "us-east")])));

        inh.update_source("region_alert/us-east", &specs, &tags(&[]), false);
        assert!(!inh.is_inhibited("cpu", &tags(&[("region", "us-east")])));
    }

    #[test]
    fn inhibitor_prefix_clear_drops_topic_sources() {
        let mut inh = Inhibitor::default();
        let specs = vec![InhibitSpec {
            category: "cpu".into(),
            tags: vec!["region".into()],
        }];
        inh.update_source("main:t1:alert2/a", &specs, &tags(&[("region", "eu")]), true);
        inh.update_source("ops/b", &specs, &tags(&[("region", "eu")]), true);

        inh.clear_source_prefix("main:t1:alert2/");
        // The other topic's matcher survives.
        assert!(inh.is_inhibited("cpu", &tags(&[("region", "eu")])));
        inh.clear_source_prefix("ops/");
        assert!(!inh.is_inhibited("cpu", &tags(&[("region", "eu")])));
    }

    #[test]
    fn inhibitor_requires_all_scoped_tags() {
        let mut inh = Inhibitor::default();
        let specs = vec![InhibitSpec {
            category: "disk".into(),
            tags: vec!["region".into(), "host".into()],
        }];
        inh.update_source(
            "host_alert/h1",
            &specs,
            &tags(&[("region", "eu"), ("host", "h1")]),
            true,
        );
        assert!(inh.is_inhibited("disk", &tags(&[("region", "eu"), ("host", "h1")])));
        assert!(!inh.is_inhibited("disk", &tags(&[("region", "eu"), ("host", "h2")])));
    }
}
