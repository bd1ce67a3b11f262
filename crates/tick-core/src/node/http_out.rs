use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::sync::atomic::Ordering;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tick_lang::compiler::HttpOutSpec;

use crate::edge::{EdgeRx, EdgeTx};
use crate::node::{Node, NodeContext, NodeStats, next_msg, single_input};
use crate::point::{GroupKey, Message};

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Latest value per task-scoped path, readable from the server handle.
/// (The HTTP surface that serves these paths is outside the core.)
#[derive(Default)]
pub struct HttpOutRegistry {
    inner: Mutex<HashMap<String, serde_json::Value>>,
}

impl HttpOutRegistry {
    pub fn set(&self, path: String, value: serde_json::Value) {
        self.inner.lock().expect("http_out lock").insert(path, value);
    }

    pub fn get(&self, path: &str) -> Option<serde_json::Value> {
        self.inner.lock().expect("http_out lock").get(path).cloned()
    }

    /// Drop every path owned by a task; called on disable/delete.
    pub fn remove_prefix(&self, prefix: &str) {
        self.inner
            .lock()
            .expect("http_out lock")
            .retain(|k, _| !k.starts_with(prefix));
    }

    pub fn paths(&self) -> Vec<String> {
        self.inner.lock().expect("http_out lock").keys().cloned().collect()
    }
}

/// Path under which a task's endpoint is exposed.
pub fn http_out_path(task_id: &str, endpoint: &str) -> String {
    format!("/tasks/{task_id}/{endpoint}")
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// Terminal node exposing the most recent value per group under a
/// task-scoped path.
pub struct HttpOutNode {
    name: String,
    spec: HttpOutSpec,
    ctx: NodeContext,
    stats: Arc<NodeStats>,
    latest: BTreeMap<GroupKey, serde_json::Value>,
}

impl HttpOutNode {
    pub fn new(name: String, spec: HttpOutSpec, ctx: NodeContext) -> HttpOutNode {
        HttpOutNode {
            name,
            spec,
            ctx,
            stats: Arc::new(NodeStats::default()),
            latest: BTreeMap::new(),
        }
    }

    fn series(&self) -> serde_json::Value {
        json!({ "series": self.latest.values().collect::<Vec<_>>() })
    }
}

#[async_trait]
impl Node for HttpOutNode {
    fn node_name(&self) -> &str {
        &self.name
    }

    fn stats(&self) -> Arc<NodeStats> {
        Arc::clone(&self.stats)
    }

    async fn run(mut self: Box<Self>, ins: Vec<EdgeRx>, _outs: Vec<EdgeTx>) -> Result<()> {
        let mut input = single_input(ins, &self.name)?;
        let path = http_out_path(&self.ctx.task_id, &self.spec.endpoint);
        while let Some(msg) = next_msg(&mut input, &self.ctx.cancel).await {
            self.stats.points_in.fetch_add(1, Ordering::Relaxed);
            let (group, value) = match &msg {
                Message::Point(p) => (
                    p.group_key(),
                    json!({
                        "name": p.name,
                        "tags": p.group_tags(),
                        "points": [p],
                    }),
                ),
                Message::Batch(b) => (
                    b.group.clone(),
                    json!({
                        "name": b.name,
                        "tags": b.tags,
                        "points": b.points,
                    }),
                ),
                Message::Barrier(b) => {
                    if let Some(g) = &b.group {
                        self.latest.remove(g);
                    }
                    continue;
                }
            };
            self.latest.insert(group, value);
            self.stats
                .groups
                .store(self.latest.len() as u64, Ordering::Relaxed);
            self.ctx.http_out.set(path.clone(), self.series());
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

    #[test]
    fn registry_prefix_removal() {
        let reg = HttpOutRegistry::default();
        reg.set("/tasks/a/x".into(), json!(1));
        reg.set("/tasks/a/y".into(), json!(2));
        reg.set("/tasks/b/x".into(), json!(3));
        reg.remove_prefix("/tasks/a/");
        assert!(reg.get("/tasks/a/x").is_none());
        assert_eq!(reg.get("/tasks/b/x"), Some(json!(3)));
    }
}
