use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tick_lang::compiler::WindowSpec;

use crate::edge::{EdgeRx, EdgeTx};
use crate::node::{Node, NodeContext, NodeStats, forward, next_msg, single_input};
use crate::point::{Batch, GroupKey, Message, Point};

struct GroupWindow {
    points: Vec<Point>,
    /// Next emission boundary in nanoseconds; set on the first point.
    next_emit: Option<i64>,
}

/// Tumbling or sliding window per group. A batch covering
/// `[boundary - period, boundary)` is emitted for a group when a point at or
/// past the boundary arrives; the batch is stamped `t_max = boundary`.
///
/// With `.align()` boundaries fall on multiples of `every` since the epoch;
/// otherwise the first point of the group sets the offset.
pub struct WindowNode {
    name: String,
    period: i64,
    every: i64,
    align: bool,
    ctx: NodeContext,
    stats: Arc<NodeStats>,
    groups: HashMap<GroupKey, GroupWindow>,
}

impl WindowNode {
    pub fn new(name: String, spec: WindowSpec, ctx: NodeContext) -> WindowNode {
        let every = if spec.every == 0 {
            spec.period
        } else {
            spec.every
        };
        WindowNode {
            name,
            period: spec.period,
            every,
            align: spec.align,
            ctx,
            stats: Arc::new(NodeStats::default()),
            groups: HashMap::new(),
        }
    }

    /// Windows closed by a point at time `t`, oldest first.
    fn close_windows(&mut self, key: &GroupKey, p: &Point) -> Vec<Batch> {
        let t = ns(p.time);
        let (period, every, align) = (self.period, self.every, self.align);
        let st = self.groups.entry(key.clone()).or_insert_with(|| GroupWindow {
            points: Vec::new(),
            next_emit: None,
        });
        let mut boundary = *st.next_emit.get_or_insert_with(|| {
            if align {
                (t.div_euclid(every)) * every + every
            } else {
                t + every
            }
        });

        let mut out = Vec::new();
        while t >= boundary {
            let contents: Vec<Point> = st
                .points
                .iter()
                .filter(|q| {
                    let qt = ns(q.time);
                    qt >= boundary - period && qt < boundary
                })
                .cloned()
                .collect();
            if !contents.is_empty() {
                let tags = contents[0].group_tags();
                out.push(Batch {
                    name: contents[0].name.clone(),
                    tags,
                    group: key.clone(),
                    t_min: from_ns(boundary - period),
                    t_max: from_ns(boundary),
                    points: contents,
                });
            }
            // Points that can never fall in a later window are released.
            let horizon = boundary + every - period;
            st.points.retain(|q| ns(q.time) >= horizon);
            boundary += every;
        }
        st.next_emit = Some(boundary);
        st.points.push(p.clone());
        out
    }
}

fn ns(t: DateTime<Utc>) -> i64 {
    t.timestamp_nanos_opt().unwrap_or(0)
}

fn from_ns(v: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(v)
}

#[async_trait]
impl Node for WindowNode {
    fn node_name(&self) -> &str {
        &self.name
    }

    fn stats(&self) -> Arc<NodeStats> {
        Arc::clone(&self.stats)
    }

    async fn run(mut self: Box<Self>, ins: Vec<EdgeRx>, outs: Vec<EdgeTx>) -> Result<()> {
        let mut input = single_input(ins, &self.name)?;
        'outer: while let Some(msg) = next_msg(&mut input, &self.ctx.cancel).await {
            self.stats.points_in.fetch_add(1, Ordering::Relaxed);
            match msg {
                Message::Point(p) => {
                    let key = p.group_key();
                    let closed = self.close_windows(&key, &p);
                    self.stats
                        .groups
                        .store(self.groups.len() as u64, Ordering::Relaxed);
                    for batch in closed {
                        if !forward(&outs, &Message::Batch(batch), &self.ctx.cancel).await {
                            break 'outer;
                        }
                        self.stats.points_out.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Message::Barrier(b) => {
                    // A group close releases the buffered window state.
                    if let Some(g) = &b.group {
                        self.groups.remove(g);
                        self.stats
                            .groups
                            .store(self.groups.len() as u64, Ordering::Relaxed);
                    } else {
                        self.groups.clear();
                        self.stats.groups.store(0, Ordering::Relaxed);
                    }
                    if !forward(&outs, &Message::Barrier(b), &self.ctx.cancel).await {
                        break;
                    }
                }
                Message::Batch(_) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
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

    fn point(secs_millis: (i64, u32), host: &str, value: f64) -> Point {
        let (s, ms) = secs_millis;
        let mut p = Point::new(Utc.timestamp_opt(s, ms * 1_000_000).unwrap(), "test");
        p.tags.insert("host".into(), host.into());
        p.fields
            .insert("value".into(), crate::point::FieldValue::Float(value));
        p.with_dimensions(vec!["host".into()])
    }

    async fn run_window(spec: WindowSpec, points: Vec<Point>) -> Vec<Batch> {
        let node = Box::new(WindowNode::new("window1".into(), spec, ctx()));
        let (in_tx, in_rx) = edge(64);
        let (out_tx, mut out_rx) = edge(64);
        let handle = tokio::spawn(node.run(vec![in_rx], vec![out_tx]));
        for p in points {
            in_tx.send(Message::Point(p)).await.unwrap();
        }
        drop(in_tx);
        handle.await.unwrap().unwrap();
        let mut batches = Vec::new();
        while let Some(msg) = out_rx.recv().await {
            if let Message::Batch(b) = msg {
                batches.push(b);
            }
        }
        batches
    }

    #[tokio::test]
    async fn tumbling_window_emits_on_boundary() {
        let spec = WindowSpec {
            period: 10_000_000_000,
            every: 10_000_000_000,
            align: false,
        };
        // 15 points inside [0, 10s), then one at 11s that closes the window.
        let mut points: Vec<Point> = (0..15).map(|i| point((0, i as u32 * 600), "a", 1.0)).collect();
        points.push(point((11, 0), "a", 1.0));
        let batches = run_window(spec, points).await;

        assert_eq!(batches.len(), 1);
        let b = &batches[0];
        assert_eq!(b.points.len(), 15);
        assert_eq!(b.t_max, Utc.timestamp_opt(10, 0).unwrap());
        assert_eq!(b.t_min, Utc.timestamp_opt(0, 0).unwrap());
    }

    #[tokio::test]
    async fn sliding_window_keeps_overlap() {
        let spec = WindowSpec {
            period: 10_000_000_000,
            every: 5_000_000_000,
            align: true,
        };
        // Points each second 0..=12; windows close at 5s and 10s.
        let mut points: Vec<Point> = (0..13).map(|s| point((s, 0), "a", 1.0)).collect();
        points.push(point((15, 0), "a", 1.0));
        let batches = run_window(spec, points).await;

        // Boundaries at 5, 10, 15.
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].points.len(), 5); // [0,5): 0..=4 (period clips at t>=-5)
        assert_eq!(batches[1].points.len(), 10); // [0,10)
        assert_eq!(batches[2].points.len(), 8); // [5,15): 5..=12
    }

    #[tokio::test]
    async fn groups_are_windowed_independently() {
        let spec = WindowSpec {
            period: 10_000_000_000,
            every: 10_000_000_000,
            align: true,
        };
        let points = vec![
            point((1, 0), "a", 1.0),
            point((2, 0), "b", 1.0),
            point((3, 0), "a", 1.0),
            point((11, 0), "a", 1.0),
            point((12, 0), "b", 1.0),
        ];
        let batches = run_window(spec, points).await;
        assert_eq!(batches.len(), 2);
        let a = batches.iter().find(|b| b.tags["host"] == "a").unwrap();
        let b = batches.iter().find(|b| b.tags["host"] == "b").unwrap();
        assert_eq!(a.points.len(), 2);
        assert_eq!(b.points.len(), 1);
    }
}
