use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tick_lang::compiler::QuerySpec;
use tracing::debug;

use crate::edge::{EdgeRx, EdgeTx};
use crate::node::{Node, NodeContext, NodeStats, forward, next_msg, single_input};
use crate::point::{Batch, Message};

/// The upstream DB boundary. Implementations issue the query over
/// `[start, stop]` and shape the result into group batches; the subscription
/// protocol and codecs behind this trait are not part of the core.
#[async_trait]
pub trait BatchQuerier: Send + Sync {
    async fn query(
        &self,
        q: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
        cluster: Option<&str>,
    ) -> Result<Vec<Batch>>;
}

/// Batch source: on an `every` schedule issues the query covering
/// `[stop - period, stop]`, choosing `stop` on aligned boundaries when
/// `.align()` is set. Replayed items arriving on the input edge are
/// forwarded unchanged; without a querier wired (replay mode) the schedule
/// is disabled entirely.
pub struct QueryNode {
    name: String,
    spec: QuerySpec,
    ctx: NodeContext,
    stats: Arc<NodeStats>,
}

impl QueryNode {
    pub fn new(name: String, spec: QuerySpec, ctx: NodeContext) -> QueryNode {
        QueryNode {
            name,
            spec,
            ctx,
            stats: Arc::new(NodeStats::default()),
        }
    }

    fn window(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let stop = if self.spec.align {
            let ns = now.timestamp_nanos_opt().unwrap_or(0);
            Utc.timestamp_nanos(ns.div_euclid(self.spec.every) * self.spec.every)
        } else {
            now
        };
        (stop - chrono::Duration::nanoseconds(self.spec.period), stop)
    }
}

#[async_trait]
impl Node for QueryNode {
    fn node_name(&self) -> &str {
        &self.name
    }

    fn stats(&self) -> Arc<NodeStats> {
        Arc::clone(&self.stats)
    }

    async fn run(self: Box<Self>, ins: Vec<EdgeRx>, outs: Vec<EdgeTx>) -> Result<()> {
        let mut input = single_input(ins, &self.name)?;

        let Some(querier) = self.ctx.querier.clone() else {
            // Replay mode: pure pass-through of injected batches.
            while let Some(msg) = next_msg(&mut input, &self.ctx.cancel).await {
                self.stats.points_in.fetch_add(1, Ordering::Relaxed);
                if !forward(&outs, &msg, &self.ctx.cancel).await {
                    break;
                }
                self.stats.points_out.fetch_add(1, Ordering::Relaxed);
            }
            return Ok(());
        };

        let every = std::time::Duration::from_nanos(self.spec.every as u64);
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The immediate first tick would query a partial window.
        ticker.tick().await;

        let mut input_open = true;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let (start, stop) = self.window(Utc::now());
                    match querier
                        .query(&self.spec.query, start, stop, self.spec.cluster.as_deref())
                        .await
                    {
                        Ok(batches) => {
                            for b in batches {
                                if !forward(&outs, &Message::Batch(b), &self.ctx.cancel).await {
                                    return Ok(());
                                }
                                self.stats.points_out.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        Err(e) => {
                            // Upstream unreachable is transient; the next
                            // tick retries.
                            self.stats.errors.fetch_add(1, Ordering::Relaxed);
                            debug!(node = %self.name, error = %e, "query failed");
                        }
                    }
                }
                msg = input.recv(), if input_open => {
                    match msg {
                        Some(msg) => {
                            self.stats.points_in.fetch_add(1, Ordering::Relaxed);
                            if !forward(&outs, &msg, &self.ctx.cancel).await {
                                return Ok(());
                            }
                            self.stats.points_out.fetch_add(1, Ordering::Relaxed);
                        }
                        None => input_open = false,
                    }
                }
                _ = self.ctx.cancel.cancelled() => return Ok(()),
            }
        }
    }
}
