use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Result;
use async_trait::async_trait;
use tick_lang::compiler::EvalSpec;
use tracing::debug;

use crate::edge::{EdgeRx, EdgeTx};
use crate::eval::{Evaluator, Overlay};
use crate::node::{Node, NodeContext, NodeStats, forward, next_msg, single_input};
use crate::point::{FieldValue, Message, Point};

/// Adds or overwrites fields from lambdas. Each lambda sees the results of
/// the previous ones; `.keep()` restricts the surviving field set.
pub struct EvalNode {
    name: String,
    spec: EvalSpec,
    ctx: NodeContext,
    stats: Arc<NodeStats>,
    eval: Evaluator,
}

impl EvalNode {
    pub fn new(name: String, spec: EvalSpec, ctx: NodeContext) -> EvalNode {
        EvalNode {
            name,
            spec,
            ctx,
            stats: Arc::new(NodeStats::default()),
            eval: Evaluator::default(),
        }
    }

    fn apply(&mut self, p: Point) -> Option<Point> {
        let mut extra: BTreeMap<String, FieldValue> = BTreeMap::new();
        for (expr, name) in self.spec.exprs.iter().zip(&self.spec.names) {
            let scope = Overlay {
                base: &p,
                extra: &extra,
            };
            match self.eval.eval(expr, &scope) {
                Ok(v) => {
                    extra.insert(name.clone(), v.into_field());
                }
                Err(e) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    debug!(node = %self.name, error = %e, "eval failed");
                    return None;
                }
            }
        }

        let mut out = p;
        out.fields.extend(extra);
        if let Some(keep) = &self.spec.keep {
            out.fields.retain(|k, _| keep.contains(k));
        }
        Some(out)
    }
}

#[async_trait]
impl Node for EvalNode {
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
            let out_msg = match msg {
                Message::Point(p) => match self.apply(p) {
                    Some(p) => Message::Point(p),
                    None => continue,
                },
                Message::Batch(mut b) => {
                    let mut points = Vec::with_capacity(b.points.len());
                    for p in b.points {
                        if let Some(p) = self.apply(p) {
                            points.push(p);
                        }
                    }
                    b.points = points;
                    Message::Batch(b)
                }
                barrier => barrier,
            };
            if !forward(&outs, &out_msg, &self.ctx.cancel).await {
                break;
            }
            self.stats.points_out.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}
