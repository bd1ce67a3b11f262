use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use tick_lang::compiler::FromSpec;
use tracing::debug;

use crate::edge::{EdgeRx, EdgeTx};
use crate::eval::Evaluator;
use crate::node::{Node, NodeContext, NodeStats, forward, next_msg, single_input};
use crate::point::Message;

/// Stream entry filter: measurement match, optional `where` lambda, and the
/// task's initial group-by dimensions.
pub struct FromNode {
    name: String,
    spec: FromSpec,
    ctx: NodeContext,
    stats: Arc<NodeStats>,
    eval: Evaluator,
}

impl FromNode {
    pub fn new(name: String, spec: FromSpec, ctx: NodeContext) -> FromNode {
        FromNode {
            name,
            spec,
            ctx,
            stats: Arc::new(NodeStats::default()),
            eval: Evaluator::default(),
        }
    }
}

#[async_trait]
impl Node for FromNode {
    fn node_name(&self) -> &str {
        &self.name
    }

    fn stats(&self) -> Arc<NodeStats> {
        Arc::clone(&self.stats)
    }

    async fn run(mut self: Box<Self>, ins: Vec<EdgeRx>, outs: Vec<EdgeTx>) -> Result<()> {
        let mut input = single_input(ins, &self.name)?;
        while let Some(msg) = next_msg(&mut input, &self.ctx.cancel).await {
            let started = Instant::now();
            self.stats.points_in.fetch_add(1, Ordering::Relaxed);

            let out_msg = match msg {
                Message::Point(p) => {
                    if let Some(m) = &self.spec.measurement
                        && p.name != *m
                    {
                        continue;
                    }
                    if let Some(filter) = &self.spec.filter {
                        match self.eval.eval_bool(filter, &p) {
                            Ok(true) => {}
                            Ok(false) => continue,
                            Err(e) => {
                                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                                debug!(node = %self.name, error = %e, "where filter failed");
                                continue;
                            }
                        }
                    }
                    let p = if self.spec.group_by_star {
                        let dims = p.tags.keys().cloned().collect();
                        p.with_dimensions(dims)
                    } else if !self.spec.group_by.is_empty() {
                        p.with_dimensions(self.spec.group_by.clone())
                    } else {
                        p.with_dimensions(Vec::new())
                    };
                    Message::Point(p)
                }
                other => other,
            };

            if !forward(&outs, &out_msg, &self.ctx.cancel).await {
                break;
            }
            self.stats.points_out.fetch_add(1, Ordering::Relaxed);
            self.stats
                .exec_nanos
                .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
            self.stats.execs.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}
