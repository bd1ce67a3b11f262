use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Result;
use async_trait::async_trait;
use tick_lang::compiler::GroupBySpec;

use crate::edge::{EdgeRx, EdgeTx};
use crate::node::{Node, NodeContext, NodeStats, forward, next_msg, single_input};
use crate::point::{Batch, GroupKey, Message, Point};

/// Regroups the stream by a (possibly different) tag set. `*` promotes
/// every tag to a dimension. Batches are split per new group.
pub struct GroupByNode {
    name: String,
    spec: GroupBySpec,
    ctx: NodeContext,
    stats: Arc<NodeStats>,
}

impl GroupByNode {
    pub fn new(name: String, spec: GroupBySpec, ctx: NodeContext) -> GroupByNode {
        GroupByNode {
            name,
            spec,
            ctx,
            stats: Arc::new(NodeStats::default()),
        }
    }

    fn regroup(&self, p: Point) -> Point {
        if self.spec.star {
            let dims = p.tags.keys().cloned().collect();
            p.with_dimensions(dims)
        } else {
            p.with_dimensions(self.spec.dims.clone())
        }
    }
}

#[async_trait]
impl Node for GroupByNode {
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
            match msg {
                Message::Point(p) => {
                    let out = Message::Point(self.regroup(p));
                    if !forward(&outs, &out, &self.ctx.cancel).await {
                        break;
                    }
                    self.stats.points_out.fetch_add(1, Ordering::Relaxed);
                }
                Message::Batch(b) => {
                    // Split the batch per new group key, preserving order.
                    let mut split: BTreeMap<GroupKey, Vec<Point>> = BTreeMap::new();
                    let (name, t_min, t_max) = (b.name.clone(), b.t_min, b.t_max);
                    for p in b.points {
                        let p = self.regroup(p);
                        split.entry(p.group_key()).or_default().push(p);
                    }
                    let mut closed = true;
                    for (group, points) in split {
                        let tags = points
                            .first()
                            .map(|p| p.group_tags())
                            .unwrap_or_default();
                        let out = Message::Batch(Batch {
                            name: name.clone(),
                            tags,
                            group,
                            t_min,
                            t_max,
                            points,
                        });
                        if !forward(&outs, &out, &self.ctx.cancel).await {
                            closed = false;
                            break;
                        }
                        self.stats.points_out.fetch_add(1, Ordering::Relaxed);
                    }
                    if !closed {
                        break;
                    }
                }
                barrier => {
                    if !forward(&outs, &barrier, &self.ctx.cancel).await {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}
