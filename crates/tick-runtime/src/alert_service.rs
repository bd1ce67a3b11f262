use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tick_config::{AlertConfig, HumanDuration};
use tick_core::alert::{
    AlertEvent, EventContext, EventData, EventSink, EventState, HandlerSpec, Inhibitor, Level,
};
use tick_core::eval::Evaluator;
use tick_lang::ast::Expr;

use crate::handlers::{Handler, build_handler};
use crate::store::FsStore;

// ---------------------------------------------------------------------------
// Topic model
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct TopicRecord {
    id: String,
}

enum HandlerImpl {
    Delivery(Arc<dyn Handler>),
    /// Re-emits each event to other topics (after source inhibition).
    Publish { topics: Vec<String> },
    Aggregate(Arc<Aggregator>),
}

struct TopicHandler {
    spec: HandlerSpec,
    imp: HandlerImpl,
    match_expr: Option<Expr>,
    dropped: Arc<AtomicU64>,
}

struct TopicState {
    events: HashMap<String, EventState>,
    handlers: Vec<TopicHandler>,
}

pub struct Topic {
    pub id: String,
    state: Mutex<TopicState>,
    queue: mpsc::Sender<DeliveryJob>,
    pub delivered: Arc<AtomicU64>,
    pub dropped: Arc<AtomicU64>,
}

impl Topic {
    /// Max level of the currently non-OK events.
    pub fn level(&self) -> Level {
        self.state
            .lock()
            .expect("topic state lock")
            .events
            .values()
            .map(|e| e.level)
            .max()
            .unwrap_or(Level::Ok)
    }

    pub fn events(&self) -> Vec<(String, EventState)> {
        let st = self.state.lock().expect("topic state lock");
        let mut out: Vec<_> = st
            .events
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn handler_specs(&self) -> Vec<HandlerSpec> {
        self.state
            .lock()
            .expect("topic state lock")
            .handlers
            .iter()
            .map(|h| h.spec.clone())
            .collect()
    }
}

struct DeliveryJob {
    event: AlertEvent,
    handlers: Vec<(Arc<dyn Handler>, Arc<AtomicU64>)>,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Topic routing, durable event state, inhibition, and handler delivery.
///
/// Event persistence is synchronous and precedes handler dispatch, so the
/// last known level per `(topic, id)` is restored after a restart. Each
/// topic owns one delivery worker; retries use exponential backoff capped
/// at `backoff_max`, and a handler that exhausts its budget drops the event
/// and bumps its counter.
pub struct AlertService {
    store: Arc<FsStore>,
    config: AlertConfig,
    base_dir: PathBuf,
    topics: Mutex<HashMap<String, Arc<Topic>>>,
    inhibitor: Mutex<Inhibitor>,
    republish_tx: mpsc::Sender<AlertEvent>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl AlertService {
    pub fn new(store: Arc<FsStore>, config: AlertConfig, base_dir: PathBuf) -> Arc<AlertService> {
        let (republish_tx, mut republish_rx) = mpsc::channel::<AlertEvent>(config.queue_capacity);
        let shutdown = CancellationToken::new();
        let service = Arc::new(AlertService {
            store,
            config,
            base_dir,
            topics: Mutex::new(HashMap::new()),
            inhibitor: Mutex::new(Inhibitor::default()),
            republish_tx,
            workers: Mutex::new(Vec::new()),
            shutdown: shutdown.clone(),
        });

        // Pump for publish/aggregate re-emissions; holds only a weak ref so
        // dropping or shutting down the service ends it.
        let weak = Arc::downgrade(&service);
        let pump = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    e = republish_rx.recv() => e,
                    _ = shutdown.cancelled() => None,
                };
                let Some(event) = event else { break };
                let Some(service) = weak.upgrade() else { break };
                if let Err(e) = service.publish(event, EventContext::default()).await {
                    td_warn!(alert, error = %e, "re-publish failed");
                }
            }
        });
        service.workers.lock().expect("workers lock").push(pump);
        service
    }

    /// Rebuild every persisted topic (events + handlers) at startup.
    pub fn restore(&self) -> Result<usize> {
        let ids = self.store.list("topics")?;
        let n = ids.len();
        for id in ids {
            self.topic(&id)?;
        }
        Ok(n)
    }

    // -- topic registry -----------------------------------------------------

    fn topic(&self, id: &str) -> Result<Arc<Topic>> {
        let mut topics = self.topics.lock().expect("topics lock");
        if let Some(t) = topics.get(id) {
            return Ok(Arc::clone(t));
        }

        // Lazily created: load persisted state, spawn the delivery worker.
        let mut events = HashMap::new();
        for event_id in self.store.list(&format!("topic-events/{id}"))? {
            if let Some(state) = self
                .store
                .get::<EventState>(&format!("topic-events/{id}/{event_id}"))?
            {
                events.insert(event_id, state);
            }
        }
        let mut handlers = Vec::new();
        for handler_id in self.store.list(&format!("topic-handlers/{id}"))? {
            if let Some(spec) = self
                .store
                .get::<HandlerSpec>(&format!("topic-handlers/{id}/{handler_id}"))?
            {
                handlers.push(self.build_topic_handler(spec)?);
            }
        }

        self.store.put(&format!("topics/{id}"), &TopicRecord { id: id.to_string() })?;

        let (queue_tx, queue_rx) = mpsc::channel(self.config.queue_capacity);
        let delivered = Arc::new(AtomicU64::new(0));
        let dropped = Arc::new(AtomicU64::new(0));
        let topic = Arc::new(Topic {
            id: id.to_string(),
            state: Mutex::new(TopicState { events, handlers }),
            queue: queue_tx,
            delivered: Arc::clone(&delivered),
            dropped: Arc::clone(&dropped),
        });

        let worker = tokio::spawn(run_delivery_worker(
            queue_rx,
            self.config.clone(),
            id.to_string(),
            delivered,
            dropped,
        ));
        self.workers.lock().expect("workers lock").push(worker);

        topics.insert(id.to_string(), Arc::clone(&topic));
        Ok(topic)
    }

    fn build_topic_handler(&self, spec: HandlerSpec) -> Result<TopicHandler> {
        let match_expr = spec
            .match_expr
            .as_deref()
            .map(tick_lang::parse_expression)
            .transpose()
            .context("invalid handler match expression")?;
        let dropped = Arc::new(AtomicU64::new(0));
        let imp = match spec.kind.as_str() {
            "publish" => {
                let topics: Vec<String> = spec
                    .options
                    .get("topics")
                    .and_then(|v| {
                        serde_json::from_value::<Vec<String>>(v.clone()).ok()
                    })
                    .ok_or_else(|| anyhow!("publish handler requires option \"topics\""))?;
                HandlerImpl::Publish { topics }
            }
            "aggregate" => {
                let interval: HumanDuration = spec
                    .options
                    .get("interval")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow!("aggregate handler requires option \"interval\""))?
                    .parse()
                    .map_err(|e| anyhow!("aggregate interval: {e}"))?;
                let topic = spec
                    .options
                    .get("topic")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow!("aggregate handler requires option \"topic\""))?
                    .to_string();
                let agg = Aggregator::spawn(
                    interval,
                    topic,
                    self.republish_tx.clone(),
                    self.shutdown.clone(),
                );
                self.workers
                    .lock()
                    .expect("workers lock")
                    .push(agg.flusher.lock().expect("flusher lock").take().expect("fresh"));
                HandlerImpl::Aggregate(agg)
            }
            kind => HandlerImpl::Delivery(build_handler(kind, &spec.options, &self.base_dir)?),
        };
        Ok(TopicHandler {
            spec,
            imp,
            match_expr,
            dropped,
        })
    }

    // -- admin surface ------------------------------------------------------

    pub fn list_topics(&self, pattern: Option<&str>, min_level: Level) -> Vec<(String, Level)> {
        let topics = self.topics.lock().expect("topics lock");
        let mut out: Vec<(String, Level)> = topics
            .values()
            .filter(|t| {
                pattern
                    .map(|p| wildmatch::WildMatch::new(p).matches(&t.id))
                    .unwrap_or(true)
            })
            .map(|t| (t.id.clone(), t.level()))
            .filter(|(_, level)| *level >= min_level)
            .collect();
        out.sort();
        out
    }

    pub fn get_topic(&self, id: &str) -> Option<Arc<Topic>> {
        self.topics.lock().expect("topics lock").get(id).cloned()
    }

    pub fn delete_topic(&self, id: &str) -> Result<()> {
        self.topics.lock().expect("topics lock").remove(id);
        // Matchers owned by this topic's events must not outlive it.
        self.inhibitor
            .lock()
            .expect("inhibitor lock")
            .clear_source_prefix(&format!("{id}/"));
        self.store.delete(&format!("topics/{id}"))?;
        self.store.delete_prefix(&format!("topic-events/{id}"))?;
        self.store.delete_prefix(&format!("topic-handlers/{id}"))?;
        Ok(())
    }

    /// Drop the anonymous topics owned by a task (disable/delete cleanup).
    pub fn remove_task_topics(&self, task_id: &str) -> Result<()> {
        let prefix = format!("main:{task_id}:alert");
        let loaded: Vec<String> = {
            let topics = self.topics.lock().expect("topics lock");
            topics
                .keys()
                .filter(|id| id.starts_with(&prefix))
                .cloned()
                .collect()
        };
        let mut ids = self.store.list("topics")?;
        ids.retain(|id| id.starts_with(&prefix));
        ids.extend(loaded);
        ids.sort();
        ids.dedup();
        for id in ids {
            self.delete_topic(&id)?;
        }
        Ok(())
    }

    pub fn set_handler(&self, topic_id: &str, spec: HandlerSpec) -> Result<()> {
        let built = self.build_topic_handler(spec.clone())?;
        self.store
            .put(&format!("topic-handlers/{topic_id}/{}", spec.id), &spec)?;
        let topic = self.topic(topic_id)?;
        let mut st = topic.state.lock().expect("topic state lock");
        st.handlers.retain(|h| h.spec.id != spec.id);
        st.handlers.push(built);
        Ok(())
    }

    pub fn remove_handler(&self, topic_id: &str, handler_id: &str) -> Result<bool> {
        let removed = self
            .store
            .delete(&format!("topic-handlers/{topic_id}/{handler_id}"))?;
        if let Some(topic) = self.get_topic(topic_id) {
            topic
                .state
                .lock()
                .expect("topic state lock")
                .handlers
                .retain(|h| h.spec.id != handler_id);
        }
        Ok(removed)
    }

    /// JSON Patch subset (`add`/`remove`/`replace`) over one handler spec.
    pub fn patch_handler(
        &self,
        topic_id: &str,
        handler_id: &str,
        ops: &[PatchOp],
    ) -> Result<HandlerSpec> {
        let key = format!("topic-handlers/{topic_id}/{handler_id}");
        let spec: HandlerSpec = self
            .store
            .get(&key)?
            .ok_or_else(|| anyhow!("unknown handler \"{handler_id}\" on topic \"{topic_id}\""))?;
        let mut value = serde_json::to_value(&spec)?;
        for op in ops {
            op.apply(&mut value)?;
        }
        let patched: HandlerSpec = serde_json::from_value(value)?;
        if patched.id != handler_id {
            anyhow::bail!("handler id cannot be changed by patch");
        }
        self.set_handler(topic_id, patched.clone())?;
        Ok(patched)
    }

    /// Wait for in-flight deliveries and stop all workers.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.topics.lock().expect("topics lock").clear();
        let workers: Vec<_> = self
            .workers
            .lock()
            .expect("workers lock")
            .drain(..)
            .collect();
        for w in workers {
            let _ = w.await;
        }
    }
}

// ---------------------------------------------------------------------------
// EventSink — the node-facing surface
// ---------------------------------------------------------------------------

#[async_trait]
impl EventSink for AlertService {
    async fn publish(&self, event: AlertEvent, ctx: EventContext) -> Result<()> {
        let topic = self.topic(&event.topic)?;

        // 1. Synchronous persistence before any dispatch.
        let state = EventState {
            level: event.level,
            first_non_ok: if event.level == Level::Ok {
                None
            } else {
                Some(event.time - chrono::Duration::nanoseconds(event.duration))
            },
            last_event: event.time,
            message: event.message.clone(),
        };
        self.store.put(
            &format!("topic-events/{}/{}", event.topic, event.id),
            &state,
        )?;
        topic
            .state
            .lock()
            .expect("topic state lock")
            .events
            .insert(event.id.clone(), state);

        // 2. Inhibition, evaluated at routing time. The event's own
        // CRITICAL transitions maintain the matrix; an inhibited event is
        // persisted above but never reaches handlers.
        {
            let mut inh = self.inhibitor.lock().expect("inhibitor lock");
            if !ctx.inhibits.is_empty() {
                let source = format!("{}/{}", event.topic, event.id);
                inh.update_source(
                    &source,
                    &ctx.inhibits,
                    &event.data.tags,
                    event.level == Level::Critical,
                );
            }
            if let Some(category) = &ctx.category
                && inh.is_inhibited(category, &event.data.tags)
            {
                td_debug!(alert, topic = %event.topic, id = %event.id, "event inhibited");
                return Ok(());
            }
        }

        // 3. Resolve matching handlers.
        let mut eval = Evaluator::default();
        let mut deliver: Vec<(Arc<dyn Handler>, Arc<AtomicU64>)> = Vec::new();
        let mut publish_to: Vec<String> = Vec::new();
        {
            let st = topic.state.lock().expect("topic state lock");
            for th in &st.handlers {
                if let Some(expr) = &th.match_expr {
                    match eval.eval_bool(expr, &event) {
                        Ok(true) => {}
                        Ok(false) => continue,
                        Err(e) => {
                            td_warn!(alert, topic = %event.topic, error = %e, "match lambda failed");
                            continue;
                        }
                    }
                }
                match &th.imp {
                    HandlerImpl::Delivery(h) => {
                        deliver.push((Arc::clone(h), Arc::clone(&th.dropped)))
                    }
                    HandlerImpl::Publish { topics } => publish_to.extend(topics.iter().cloned()),
                    HandlerImpl::Aggregate(agg) => agg.push(event.clone()),
                }
            }
        }

        // Node-local call-sites behave as implicit handlers of the topic.
        for hc in &ctx.local_handlers {
            let option_key = match hc.kind.as_str() {
                "log" => "path",
                "post" => "url",
                "tcp" => "address",
                other => {
                    td_warn!(alert, kind = other, "unknown local handler kind");
                    continue;
                }
            };
            let options = serde_json::json!({ option_key: hc.target });
            match build_handler(&hc.kind, &options, &self.base_dir) {
                Ok(h) => deliver.push((h, Arc::clone(&topic.dropped))),
                Err(e) => td_warn!(alert, error = %e, "bad local handler"),
            }
        }

        // 4. Enqueue; a full queue exerts backpressure on the alert node.
        if !deliver.is_empty() {
            topic
                .queue
                .send(DeliveryJob {
                    event: event.clone(),
                    handlers: deliver,
                })
                .await
                .map_err(|_| anyhow!("topic \"{}\" delivery queue closed", event.topic))?;
        }

        // 5. Publish handlers re-emit through the pump.
        for target in publish_to {
            if target == event.topic {
                continue;
            }
            let mut copy = event.clone();
            copy.topic = target;
            if self.republish_tx.send(copy).await.is_err() {
                break;
            }
        }

        Ok(())
    }

    async fn last_state(&self, topic: &str, id: &str) -> Option<EventState> {
        if let Some(t) = self.get_topic(topic) {
            if let Some(state) = t
                .state
                .lock()
                .expect("topic state lock")
                .events
                .get(id)
                .cloned()
            {
                return Some(state);
            }
        }
        self.store
            .get(&format!("topic-events/{topic}/{id}"))
            .ok()
            .flatten()
    }
}

// ---------------------------------------------------------------------------
// Delivery worker
// ---------------------------------------------------------------------------

/// One worker per topic: preserves per-topic delivery order and retries
/// each handler independently with capped exponential backoff.
async fn run_delivery_worker(
    mut rx: mpsc::Receiver<DeliveryJob>,
    config: AlertConfig,
    topic_id: String,
    delivered: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
) {
    while let Some(job) = rx.recv().await {
        for (handler, handler_dropped) in &job.handlers {
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                match handler.handle(&job.event).await {
                    Ok(()) => {
                        delivered.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                    Err(e) if e.permanent || attempt >= config.max_attempts => {
                        td_warn!(alert,
                            topic = %topic_id,
                            handler = handler.kind(),
                            attempts = attempt,
                            error = %e,
                            "event dropped"
                        );
                        dropped.fetch_add(1, Ordering::Relaxed);
                        handler_dropped.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                    Err(e) => {
                        let backoff = backoff_delay(&config, attempt);
                        td_debug!(alert,
                            topic = %topic_id,
                            handler = handler.kind(),
                            attempt = attempt,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "delivery retry"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
    }
}

fn backoff_delay(config: &AlertConfig, attempt: u32) -> Duration {
    let base = config.backoff_base.as_duration();
    let max = config.backoff_max.as_duration();
    let exp = base.saturating_mul(1u32 << (attempt - 1).min(16));
    exp.min(max)
}

// ---------------------------------------------------------------------------
// Aggregation handler
// ---------------------------------------------------------------------------

/// Buffers events for an interval, then emits one synthesized event to a
/// downstream topic.
struct Aggregator {
    interval: HumanDuration,
    target: String,
    buf: Mutex<Vec<AlertEvent>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl Aggregator {
    fn spawn(
        interval: HumanDuration,
        target: String,
        republish_tx: mpsc::Sender<AlertEvent>,
        shutdown: CancellationToken,
    ) -> Arc<Aggregator> {
        let agg = Arc::new(Aggregator {
            interval,
            target,
            buf: Mutex::new(Vec::new()),
            flusher: Mutex::new(None),
        });
        let weak = Arc::downgrade(&agg);
        let handle = tokio::spawn(async move {
            let period = interval.as_duration();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(period) => {}
                    _ = shutdown.cancelled() => break,
                }
                let Some(agg) = weak.upgrade() else { break };
                if let Some(event) = agg.flush() {
                    if republish_tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
        });
        *agg.flusher.lock().expect("flusher lock") = Some(handle);
        agg
    }

    fn push(&self, event: AlertEvent) {
        self.buf.lock().expect("aggregate buf lock").push(event);
    }

    fn flush(&self) -> Option<AlertEvent> {
        let events: Vec<AlertEvent> = {
            let mut buf = self.buf.lock().expect("aggregate buf lock");
            std::mem::take(&mut *buf)
        };
        if events.is_empty() {
            return None;
        }

        let level = events.iter().map(|e| e.level).max().unwrap_or(Level::Ok);
        let details = events
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let mut points = Vec::new();
        for e in &events {
            points.extend(e.data.points.iter().cloned());
        }
        let last = events.last().expect("non-empty");
        Some(AlertEvent {
            topic: self.target.clone(),
            id: last.id.clone(),
            message: format!(
                "Received {} events in the last {}.",
                events.len(),
                self.interval
            ),
            details,
            time: last.time,
            level,
            previous_level: Level::Ok,
            duration: last.duration,
            recoverable: last.recoverable,
            data: EventData {
                name: last.data.name.clone(),
                tags: last.data.tags.clone(),
                points,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// JSON Patch subset
// ---------------------------------------------------------------------------

/// `{op: add|remove|replace, path, value}` applied to a handler spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchOp {
    pub op: String,
    pub path: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

impl PatchOp {
    fn apply(&self, target: &mut serde_json::Value) -> Result<()> {
        let pointer = self.path.trim_start_matches('/');
        let (parent, key) = match pointer.rsplit_once('/') {
            Some((p, k)) => (format!("/{p}"), k.to_string()),
            None => (String::new(), pointer.to_string()),
        };
        let parent_val = if parent.is_empty() {
            &mut *target
        } else {
            target
                .pointer_mut(&parent)
                .ok_or_else(|| anyhow!("patch path {:?} not found", self.path))?
        };
        let obj = parent_val
            .as_object_mut()
            .ok_or_else(|| anyhow!("patch path {:?} is not an object", self.path))?;
        match self.op.as_str() {
            "add" | "replace" => {
                obj.insert(key, self.value.clone());
            }
            "remove" => {
                obj.remove(&key);
            }
            other => anyhow::bail!("unsupported patch op {other:?}"),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
