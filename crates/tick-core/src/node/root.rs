use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Result;
use async_trait::async_trait;

use crate::edge::{EdgeRx, EdgeTx};
use crate::node::{Node, NodeContext, NodeStats, forward, next_msg, single_input};

/// Task source node: forwards the task's input edge (live points, query
/// batches, or replayed items) into the DAG.
pub struct RootNode {
    name: String,
    ctx: NodeContext,
    stats: Arc<NodeStats>,
}

impl RootNode {
    pub fn new(name: String, ctx: NodeContext) -> RootNode {
        RootNode {
            name,
            ctx,
            stats: Arc::new(NodeStats::default()),
        }
    }
}

#[async_trait]
impl Node for RootNode {
    fn node_name(&self) -> &str {
        &self.name
    }

    fn stats(&self) -> Arc<NodeStats> {
        Arc::clone(&self.stats)
    }

    async fn run(self: Box<Self>, ins: Vec<EdgeRx>, outs: Vec<EdgeTx>) -> Result<()> {
        let mut input = single_input(ins, &self.name)?;
        while let Some(msg) = next_msg(&mut input, &self.ctx.cancel).await {
            self.stats.points_in.fetch_add(1, Ordering::Relaxed);
            if !forward(&outs, &msg, &self.ctx.cancel).await {
                break;
            }
            self.stats.points_out.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}
