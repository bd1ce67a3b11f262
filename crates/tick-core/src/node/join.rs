use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Result;
use async_trait::async_trait;
use chrono::TimeZone;
use tick_lang::compiler::JoinSpec;
use tokio::sync::mpsc;

use crate::edge::{EdgeRx, EdgeTx};
use crate::node::{Node, NodeContext, NodeStats, forward};
use crate::point::{Message, Point};

enum JoinMsg {
    Item(usize, Message),
    Closed(usize),
}

/// Aligns N inputs by time within `.tolerance()`. A combined point is
/// emitted once every input has a value for the same group at the same
/// aligned time; sets that can no longer complete expire as the low
/// watermark advances.
pub struct JoinNode {
    name: String,
    spec: JoinSpec,
    ctx: NodeContext,
    stats: Arc<NodeStats>,
}

impl JoinNode {
    pub fn new(name: String, spec: JoinSpec, ctx: NodeContext) -> JoinNode {
        JoinNode {
            name,
            spec,
            ctx,
            stats: Arc::new(NodeStats::default()),
        }
    }

    fn bucket(&self, t_ns: i64) -> i64 {
        if self.spec.tolerance > 0 {
            t_ns.div_euclid(self.spec.tolerance) * self.spec.tolerance
        } else {
            t_ns
        }
    }

    fn merge(&self, bucket_ns: i64, slots: Vec<Option<Point>>) -> Point {
        let points: Vec<Point> = slots.into_iter().flatten().collect();
        let mut out = Point::new(
            chrono::Utc.timestamp_nanos(bucket_ns),
            self.spec.names.join("_"),
        );
        out.dimensions = points[0].dimensions.clone();
        for (i, p) in points.iter().enumerate() {
            for (k, v) in &p.tags {
                out.tags.entry(k.clone()).or_insert_with(|| v.clone());
            }
            let prefix = &self.spec.names[i];
            for (k, v) in &p.fields {
                out.fields.insert(format!("{prefix}.{k}"), v.clone());
            }
        }
        out
    }
}

#[async_trait]
impl Node for JoinNode {
    fn node_name(&self) -> &str {
        &self.name
    }

    fn stats(&self) -> Arc<NodeStats> {
        Arc::clone(&self.stats)
    }

    async fn run(self: Box<Self>, ins: Vec<EdgeRx>, outs: Vec<EdgeTx>) -> Result<()> {
        let n = ins.len();
        let (tx, mut rx) = mpsc::channel::<JoinMsg>(64);

        // One forwarder per input so a slow side cannot starve the other.
        for (i, mut input) in ins.into_iter().enumerate() {
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some(msg) = input.recv().await {
                    if tx.send(JoinMsg::Item(i, msg)).await.is_err() {
                        return;
                    }
                }
                let _ = tx.send(JoinMsg::Closed(i)).await;
            });
        }
        drop(tx);

        // (group tags, bucket) → one slot per input.
        let mut sets: HashMap<(BTreeMap<String, String>, i64), Vec<Option<Point>>> =
            HashMap::new();
        let mut last_time = vec![i64::MIN; n];
        let mut open = vec![true; n];

        'outer: loop {
            let msg = tokio::select! {
                m = rx.recv() => m,
                _ = self.ctx.cancel.cancelled() => None,
            };
            let Some(msg) = msg else { break };

            match msg {
                JoinMsg::Closed(i) => {
                    open[i] = false;
                    last_time[i] = i64::MAX;
                    if !open.iter().any(|o| *o) {
                        break;
                    }
                }
                JoinMsg::Item(i, Message::Point(p)) => {
                    self.stats.points_in.fetch_add(1, Ordering::Relaxed);
                    let t = p.time.timestamp_nanos_opt().unwrap_or(0);
                    last_time[i] = last_time[i].max(t);
                    let key = (p.group_tags(), self.bucket(t));
                    let slots = sets.entry(key.clone()).or_insert_with(|| vec![None; n]);
                    if slots[i].is_none() {
                        slots[i] = Some(p);
                    }
                    if slots.iter().all(|s| s.is_some()) {
                        let slots = sets.remove(&key).unwrap();
                        let merged = self.merge(key.1, slots);
                        if !forward(&outs, &Message::Point(merged), &self.ctx.cancel).await {
                            break 'outer;
                        }
                        self.stats.points_out.fetch_add(1, Ordering::Relaxed);
                    }

                    // Expire sets below the low watermark; they can no
                    // longer be completed by in-order input.
                    let watermark = last_time.iter().copied().min().unwrap_or(i64::MIN);
                    if watermark > i64::MIN {
                        let tol = self.spec.tolerance;
                        sets.retain(|(_, bucket), _| *bucket + tol >= watermark - tol);
                    }
                    self.stats
                        .groups
                        .store(sets.len() as u64, Ordering::Relaxed);
                }
                JoinMsg::Item(_, Message::Batch(_)) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                }
                JoinMsg::Item(_, barrier) => {
                    if !forward(&outs, &barrier, &self.ctx.cancel).await {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::NullEventSink;
    use crate::edge::edge;
    use crate::node::{HttpOutRegistry, SideloadRegistry, UdfRegistry};
    use crate::point::FieldValue;
    use chrono::Utc;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> NodeContext {
        NodeContext {
            task_id: Arc::from("t"),
            cancel: CancellationToken::new(),
            events: Arc::new(NullEventSink),
            http_out: Arc::new(HttpOutRegistry::default()),
            sideloads: Arc::new(SideloadRegistry::default()),
            udfs: Arc::new(UdfRegistry::default()),
            querier: None,
            base_dir: std::env::temp_dir(),
        }
    }

    fn point(name: &str, secs: i64, host: &str, value: f64) -> Point {
        let mut p = Point::new(Utc.timestamp_opt(secs, 0).unwrap(), name);
        p.tags.insert("host".into(), host.into());
        p.fields.insert("value".into(), FieldValue::Float(value));
        p.with_dimensions(vec!["host".into()])
    }

    #[tokio::test]
    async fn joins_matching_times_and_groups() {
        let spec = JoinSpec {
            names: vec!["errors".into(), "requests".into()],
            tolerance: 1_000_000_000,
        };
        let node = Box::new(JoinNode::new("join3".into(), spec, ctx()));
        let (a_tx, a_rx) = edge(16);
        let (b_tx, b_rx) = edge(16);
        let (out_tx, mut out_rx) = edge(16);
        let handle = tokio::spawn(node.run(vec![a_rx, b_rx], vec![out_tx]));

        a_tx.send(Message::Point(point("errors", 10, "a", 2.0)))
            .await
            .unwrap();
        b_tx.send(Message::Point(point("requests", 10, "a", 100.0)))
            .await
            .unwrap();
        drop(a_tx);
        drop(b_tx);
        handle.await.unwrap().unwrap();

        let Some(Message::Point(joined)) = out_rx.recv().await else {
            panic!("expected joined point")
        };
        assert_eq!(joined.fields["errors.value"], FieldValue::Float(2.0));
        assert_eq!(joined.fields["requests.value"], FieldValue::Float(100.0));
        assert_eq!(joined.tags["host"], "a");
        assert!(out_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn unmatched_groups_do_not_join() {
        let spec = JoinSpec {
            names: vec!["a".into(), "b".into()],
            tolerance: 1_000_000_000,
        };
        let node = Box::new(JoinNode::new("join3".into(), spec, ctx()));
        let (a_tx, a_rx) = edge(16);
        let (b_tx, b_rx) = edge(16);
        let (out_tx, mut out_rx) = edge(16);
        let handle = tokio::spawn(node.run(vec![a_rx, b_rx], vec![out_tx]));

        a_tx.send(Message::Point(point("m", 10, "a", 1.0)))
            .await
            .unwrap();
        b_tx.send(Message::Point(point("m", 10, "b", 1.0)))
            .await
            .unwrap();
        drop(a_tx);
        drop(b_tx);
        handle.await.unwrap().unwrap();
        assert!(out_rx.recv().await.is_none());
    }
}
