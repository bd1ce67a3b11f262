use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Result;
use async_trait::async_trait;
use tick_lang::compiler::WhereSpec;
use tracing::debug;

use crate::edge::{EdgeRx, EdgeTx};
use crate::eval::Evaluator;
use crate::node::{Node, NodeContext, NodeStats, forward, next_msg, single_input};
use crate::point::Message;

/// Emits only items for which the lambda evaluates true. For batches the
/// filter applies point-wise within the batch.
pub struct WhereNode {
    name: String,
    spec: WhereSpec,
    ctx: NodeContext,
    stats: Arc<NodeStats>,
    eval: Evaluator,
}

impl WhereNode {
    pub fn new(name: String, spec: WhereSpec, ctx: NodeContext) -> WhereNode {
        WhereNode {
            name,
            spec,
            ctx,
            stats: Arc::new(NodeStats::default()),
            eval: Evaluator::default(),
        }
    }

    fn keep(&mut self, point: &crate::point::Point) -> bool {
        match self.eval.eval_bool(&self.spec.filter, point) {
            Ok(v) => v,
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                debug!(node = %self.name, error = %e, "filter failed");
                false
            }
        }
    }
}

#[async_trait]
impl Node for WhereNode {
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
                Message::Point(p) => {
                    if !self.keep(&p) {
                        continue;
                    }
                    Message::Point(p)
                }
                Message::Batch(mut b) => {
                    b.points.retain(|p| {
                        match self.eval.eval_bool(&self.spec.filter, p) {
                            Ok(v) => v,
                            Err(_) => {
                                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                                false
                            }
                        }
                    });
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
