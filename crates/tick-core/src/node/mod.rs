use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use tick_lang::compiler::{Dag, NodeSpec};

use crate::alert::EventSink;
use crate::edge::{EdgeRx, EdgeTx, send_all};
use crate::point::Message;

mod aggregate;
mod alert_node;
mod eval_node;
mod from;
mod group_by;
mod http_out;
mod join;
mod log_node;
mod query;
mod root;
mod sideload;
mod udf;
mod where_node;
mod window;

pub use http_out::HttpOutRegistry;
pub use query::BatchQuerier;
pub use sideload::SideloadRegistry;
pub use udf::{UdfConfig, UdfRegistry};

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Per-node counters exposed by `describe()`.
#[derive(Debug, Default)]
pub struct NodeStats {
    pub points_in: AtomicU64,
    pub points_out: AtomicU64,
    pub errors: AtomicU64,
    /// Number of live groups (working cardinality).
    pub groups: AtomicU64,
    pub exec_nanos: AtomicU64,
    pub execs: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStatsSnapshot {
    pub points_in: u64,
    pub points_out: u64,
    pub errors: u64,
    pub working_cardinality: u64,
    pub avg_exec_nanos: u64,
}

impl NodeStats {
    pub fn snapshot(&self) -> NodeStatsSnapshot {
        let execs = self.execs.load(Ordering::Relaxed);
        NodeStatsSnapshot {
            points_in: self.points_in.load(Ordering::Relaxed),
            points_out: self.points_out.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            working_cardinality: self.groups.load(Ordering::Relaxed),
            avg_exec_nanos: if execs == 0 {
                0
            } else {
                self.exec_nanos.load(Ordering::Relaxed) / execs
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Shared services a task hands to every node it spawns.
#[derive(Clone)]
pub struct NodeContext {
    pub task_id: Arc<str>,
    pub cancel: CancellationToken,
    pub events: Arc<dyn EventSink>,
    pub http_out: Arc<HttpOutRegistry>,
    pub sideloads: Arc<SideloadRegistry>,
    pub udfs: Arc<UdfRegistry>,
    /// Upstream DB boundary for batch query nodes; None disables scheduled
    /// queries (replay mode).
    pub querier: Option<Arc<dyn BatchQuerier>>,
    /// Base directory for relative log paths.
    pub base_dir: PathBuf,
}

// ---------------------------------------------------------------------------
// Node contract
// ---------------------------------------------------------------------------

/// One executable node of a task DAG.
///
/// `run` consumes from the input edges and produces to the output edges,
/// returning once every input has closed and buffered output is flushed
/// (or on cancellation). Dropping the output edges on return is what
/// propagates closure downstream.
#[async_trait]
pub trait Node: Send {
    fn node_name(&self) -> &str;

    fn stats(&self) -> Arc<NodeStats>;

    async fn run(self: Box<Self>, ins: Vec<EdgeRx>, outs: Vec<EdgeTx>) -> Result<()>;
}

/// Instantiate the executable node for `dag.nodes[index]`.
pub fn build_node(dag: &Dag, index: usize, ctx: NodeContext) -> Result<Box<dyn Node>> {
    let name = dag.node_name(index);
    Ok(match &dag.nodes[index] {
        NodeSpec::Stream | NodeSpec::Batch => Box::new(root::RootNode::new(name, ctx)),
        NodeSpec::Query(spec) => Box::new(query::QueryNode::new(name, spec.clone(), ctx)),
        NodeSpec::From(spec) => Box::new(from::FromNode::new(name, spec.clone(), ctx)),
        NodeSpec::Where(spec) => Box::new(where_node::WhereNode::new(name, spec.clone(), ctx)),
        NodeSpec::Window(spec) => Box::new(window::WindowNode::new(name, spec.clone(), ctx)),
        NodeSpec::GroupBy(spec) => Box::new(group_by::GroupByNode::new(name, spec.clone(), ctx)),
        NodeSpec::Eval(spec) => Box::new(eval_node::EvalNode::new(name, spec.clone(), ctx)),
        NodeSpec::Aggregate(spec) => {
            Box::new(aggregate::AggregateNode::new(name, spec.clone(), ctx))
        }
        NodeSpec::Join(spec) => Box::new(join::JoinNode::new(name, spec.clone(), ctx)),
        NodeSpec::Alert(spec) => {
            Box::new(alert_node::AlertNode::new(name, index, spec.clone(), ctx))
        }
        NodeSpec::HttpOut(spec) => Box::new(http_out::HttpOutNode::new(name, spec.clone(), ctx)),
        NodeSpec::Log(spec) => Box::new(log_node::LogNode::new(name, spec.clone(), ctx)),
        NodeSpec::Sideload(spec) => {
            Box::new(sideload::SideloadNode::new(name, spec.clone(), ctx))
        }
        NodeSpec::Udf(spec) => Box::new(udf::UdfNode::new(name, spec.clone(), ctx)),
        other => bail!("no runtime for node spec {other:?}"),
    })
}

// ---------------------------------------------------------------------------
// Shared loop helpers
// ---------------------------------------------------------------------------

/// Receive the next message, or None on close/cancel.
pub(crate) async fn next_msg(input: &mut EdgeRx, cancel: &CancellationToken) -> Option<Message> {
    tokio::select! {
        m = input.recv() => m,
        _ = cancel.cancelled() => None,
    }
}

/// Fan out to all downstream edges; false means every consumer is gone or
/// we were cancelled mid-send.
pub(crate) async fn forward(
    outs: &[EdgeTx],
    msg: &Message,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        delivered = send_all(outs, msg) => delivered,
        _ = cancel.cancelled() => false,
    }
}

pub(crate) fn single_input(mut ins: Vec<EdgeRx>, name: &str) -> Result<EdgeRx> {
    if ins.len() != 1 {
        bail!("{name} expects exactly one input edge, got {}", ins.len());
    }
    Ok(ins.remove(0))
}
