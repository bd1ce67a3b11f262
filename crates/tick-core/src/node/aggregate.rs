use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Result;
use async_trait::async_trait;
use tick_lang::compiler::{AggFunc, AggregateSpec};

use crate::edge::{EdgeRx, EdgeTx};
use crate::node::{Node, NodeContext, NodeStats, forward, next_msg, single_input};
use crate::point::{Batch, FieldValue, Message, Point};

/// Reduces each batch to a single point per group: the named field is
/// aggregated and emitted under `as_name` at the batch's `t_max`.
pub struct AggregateNode {
    name: String,
    spec: AggregateSpec,
    ctx: NodeContext,
    stats: Arc<NodeStats>,
}

impl AggregateNode {
    pub fn new(name: String, spec: AggregateSpec, ctx: NodeContext) -> AggregateNode {
        AggregateNode {
            name,
            spec,
            ctx,
            stats: Arc::new(NodeStats::default()),
        }
    }

    fn reduce(&self, batch: &Batch) -> Option<FieldValue> {
        let field = self.spec.field.as_str();

        if self.spec.func == AggFunc::Count {
            let n = batch
                .points
                .iter()
                .filter(|p| p.fields.contains_key(field))
                .count();
            return Some(FieldValue::Int(n as i64));
        }

        match self.spec.func {
            AggFunc::First => {
                return batch
                    .points
                    .iter()
                    .find_map(|p| p.fields.get(field).cloned());
            }
            AggFunc::Last => {
                return batch
                    .points
                    .iter()
                    .rev()
                    .find_map(|p| p.fields.get(field).cloned());
            }
            _ => {}
        }

        let mut values: Vec<f64> = batch
            .points
            .iter()
            .filter_map(|p| p.fields.get(field).and_then(|v| v.as_f64()))
            .collect();
        if values.is_empty() {
            return None;
        }

        let v = match self.spec.func {
            AggFunc::Sum => values.iter().sum(),
            AggFunc::Mean => values.iter().sum::<f64>() / values.len() as f64,
            AggFunc::Min => values.iter().cloned().fold(f64::INFINITY, f64::min),
            AggFunc::Max => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            AggFunc::Median => {
                values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let mid = values.len() / 2;
                if values.len() % 2 == 0 {
                    (values[mid - 1] + values[mid]) / 2.0
                } else {
                    values[mid]
                }
            }
            AggFunc::Spread => {
                let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
                let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                max - min
            }
            _ => unreachable!("handled above"),
        };
        Some(FieldValue::Float(v))
    }
}

#[async_trait]
impl Node for AggregateNode {
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
            let out_msg = match msg {
                Message::Batch(b) => {
                    let Some(value) = self.reduce(&b) else {
                        continue;
                    };
                    let mut p = Point::new(b.t_max, b.name.clone());
                    p.tags = b.tags.clone();
                    p.fields.insert(self.spec.as_name.clone(), value);
                    let dims = b.tags.keys().cloned().collect();
                    Message::Point(p.with_dimensions(dims))
                }
                Message::Point(_) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    continue;
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

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::GroupKey;
    use chrono::{TimeZone, Utc};

    fn batch(values: &[f64]) -> Batch {
        let points = values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let mut p = Point::new(Utc.timestamp_opt(i as i64, 0).unwrap(), "test");
                p.fields.insert("value".into(), FieldValue::Float(*v));
                p
            })
            .collect();
        Batch {
            name: "test".into(),
            tags: Default::default(),
            group: GroupKey::new("test", &Default::default(), &[]),
            t_min: Utc.timestamp_opt(0, 0).unwrap(),
            t_max: Utc.timestamp_opt(10, 0).unwrap(),
            points,
        }
    }

    fn node(func: AggFunc) -> AggregateNode {
        use crate::alert::NullEventSink;
        use crate::node::{HttpOutRegistry, SideloadRegistry, UdfRegistry};
        use tokio_util::sync::CancellationToken;
        AggregateNode::new(
            "agg1".into(),
            AggregateSpec {
                func,
                field: "value".into(),
                as_name: func.name().into(),
            },
            NodeContext {
                task_id: Arc::from("t"),
                cancel: CancellationToken::new(),
                events: Arc::new(NullEventSink),
                http_out: Arc::new(HttpOutRegistry::default()),
                sideloads: Arc::new(SideloadRegistry::default()),
                udfs: Arc::new(UdfRegistry::default()),
                querier: None,
                base_dir: std::env::temp_dir(),
            },
        )
    }

    #[test]
    fn count_counts_points_with_field() {
        let v = node(AggFunc::Count).reduce(&batch(&[1.0, 2.0, 3.0])).unwrap();
        assert_eq!(v, FieldValue::Int(3));
    }

    #[test]
    fn count_of_empty_batch_is_zero() {
        let v = node(AggFunc::Count).reduce(&batch(&[])).unwrap();
        assert_eq!(v, FieldValue::Int(0));
    }

    #[test]
    fn mean_and_sum() {
        assert_eq!(
            node(AggFunc::Mean).reduce(&batch(&[1.0, 2.0, 3.0])).unwrap(),
            FieldValue::Float(2.0)
        );
        assert_eq!(
            node(AggFunc::Sum).reduce(&batch(&[1.0, 2.0, 3.0])).unwrap(),
            FieldValue::Float(6.0)
        );
    }

    #[test]
    fn median_even_and_odd() {
        assert_eq!(
            node(AggFunc::Median)
                .reduce(&batch(&[3.0, 1.0, 2.0]))
                .unwrap(),
            FieldValue::Float(2.0)
        );
        assert_eq!(
            node(AggFunc::Median)
                .reduce(&batch(&[4.0, 1.0, 2.0, 3.0]))
                .unwrap(),
            FieldValue::Float(2.5)
        );
    }

    #[test]
    fn spread_and_first_last() {
        assert_eq!(
            node(AggFunc::Spread)
                .reduce(&batch(&[5.0, 1.0, 3.0]))
                .unwrap(),
            FieldValue::Float(4.0)
        );
        assert_eq!(
            node(AggFunc::First)
                .reduce(&batch(&[5.0, 1.0]))
                .unwrap(),
            FieldValue::Float(5.0)
        );
        assert_eq!(
            node(AggFunc::Last).reduce(&batch(&[5.0, 1.0])).unwrap(),
            FieldValue::Float(1.0)
        );
    }

    #[test]
    fn mean_of_empty_batch_emits_nothing() {
        assert!(node(AggFunc::Mean).reduce(&batch(&[])).is_none());
    }
}
