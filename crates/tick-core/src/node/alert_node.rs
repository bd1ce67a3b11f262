use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tick_lang::ast::Expr;
use tick_lang::compiler::AlertSpec;
use tracing::debug;

use crate::alert::{AlertEvent, EventContext, EventData, EventState, Level};
use crate::edge::{EdgeRx, EdgeTx};
use crate::eval::Evaluator;
use crate::node::{Node, NodeContext, NodeStats, forward, next_msg, single_input};
use crate::point::{Message, Point};

/// Evaluates the level predicates per item, advances the per-id state
/// machine, and publishes events to the alert service. Items pass through
/// unchanged.
pub struct AlertNode {
    name: String,
    /// Position in the DAG; names the anonymous topic.
    index: usize,
    spec: AlertSpec,
    ctx: NodeContext,
    stats: Arc<NodeStats>,
    eval: Evaluator,
    states: HashMap<String, EventState>,
}

impl AlertNode {
    pub fn new(name: String, index: usize, spec: AlertSpec, ctx: NodeContext) -> AlertNode {
        AlertNode {
            name,
            index,
            spec,
            ctx,
            stats: Arc::new(NodeStats::default()),
            eval: Evaluator::default(),
            states: HashMap::new(),
        }
    }

    fn topic(&self) -> String {
        match &self.spec.topic {
            Some(t) => t.clone(),
            None => format!("main:{}:alert{}", self.ctx.task_id, self.index),
        }
    }

    /// Highest satisfied level predicate for one point.
    fn candidate(&mut self, p: &Point) -> Level {
        let checks: [(&Option<Expr>, Level); 3] = [
            (&self.spec.crit, Level::Critical),
            (&self.spec.warn, Level::Warning),
            (&self.spec.info, Level::Info),
        ];
        for (expr, level) in checks {
            if let Some(expr) = expr {
                match self.eval.eval_bool(expr, p) {
                    Ok(true) => return level,
                    Ok(false) => {}
                    Err(e) => {
                        self.stats.errors.fetch_add(1, Ordering::Relaxed);
                        debug!(node = %self.name, error = %e, "level predicate failed");
                    }
                }
            }
        }
        Level::Ok
    }

    fn render(&self, tmpl: &str, id: &str, group: &str, name: &str, level: Level) -> String {
        tmpl.replace("{task}", &self.ctx.task_id)
            .replace("{name}", name)
            .replace("{group}", group)
            .replace("{id}", id)
            .replace("{level}", level.name())
    }

    async fn process(
        &mut self,
        level: Level,
        time: DateTime<Utc>,
        data: EventData,
    ) -> Result<()> {
        let topic = self.topic();
        let group = crate::point::GroupKey::new(
            &data.name,
            &data.tags,
            &data.tags.keys().cloned().collect::<Vec<_>>(),
        )
        .to_string();

        let id_tmpl = self
            .spec
            .id_tmpl
            .clone()
            .unwrap_or_else(|| "{task}:{group}".to_string());
        let id = self.render(&id_tmpl, "", &group, &data.name, level);

        // Seed from the durable store so hysteresis survives restarts.
        if !self.states.contains_key(&id) {
            let seeded = self
                .ctx
                .events
                .last_state(&topic, &id)
                .await
                .unwrap_or_else(|| EventState::new(time));
            self.states.insert(id.clone(), seeded);
        }

        let state_changes_only = self.spec.state_changes_only;
        let advanced = {
            let state = self.states.get_mut(&id).expect("state just inserted");
            if state_changes_only && level == state.level {
                None
            } else {
                Some(state.advance(level, time))
            }
        };
        let Some((previous, duration)) = advanced else {
            return Ok(());
        };

        let msg_tmpl = self
            .spec
            .message_tmpl
            .clone()
            .unwrap_or_else(|| "{id} is {level}".to_string());
        let message = self.render(&msg_tmpl, &id, &group, &data.name, level);
        let details = self
            .spec
            .details_tmpl
            .as_ref()
            .map(|t| self.render(t, &id, &group, &data.name, level))
            .unwrap_or_default();
        self.states.get_mut(&id).expect("present").message = message.clone();

        let event = AlertEvent {
            topic,
            id,
            message,
            details,
            time,
            level,
            previous_level: previous,
            duration,
            recoverable: self.spec.state_changes_only,
            data,
        };
        let ectx = EventContext {
            category: self.spec.category.clone(),
            inhibits: self.spec.inhibits.clone(),
            local_handlers: self.spec.handlers.clone(),
        };
        if let Err(e) = self.ctx.events.publish(event, ectx).await {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            debug!(node = %self.name, error = %e, "event publish failed");
        }
        self.stats
            .groups
            .store(self.states.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl Node for AlertNode {
    fn node_name(&self) -> &str {
        &self.name
    }

    fn stats(&self) -> Arc<NodeStats> {
        Arc::clone(&self.stats)
    }

    async fn run(mut self: Box<Self>, ins: Vec<EdgeRx>, outs: Vec<EdgeTx>) -> Result<()> {
        let mut input = single_input(ins, &self.name)?;
        while let Some(msg) = next_msg(&mut input, &self.ctx.cancel).await {
            self.stats.points_in.fetch_add(1, Ordering::Relaxed);
            match &msg {
                Message::Point(p) => {
                    let level = self.candidate(p);
                    let data = EventData {
                        name: p.name.clone(),
                        tags: p.group_tags(),
                        points: vec![p.clone()],
                    };
                    self.process(level, p.time, data).await?;
                }
                Message::Batch(b) => {
                    let mut level = Level::Ok;
                    for p in &b.points {
                        level = level.max(self.candidate(p));
                    }
                    let data = EventData {
                        name: b.name.clone(),
                        tags: b.tags.clone(),
                        points: b.points.clone(),
                    };
                    self.process(level, b.t_max, data).await?;
                }
                Message::Barrier(_) => {}
            }
            if !forward(&outs, &msg, &self.ctx.cancel).await {
                break;
            }
            self.stats.points_out.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
