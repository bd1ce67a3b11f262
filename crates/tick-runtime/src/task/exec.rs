use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use tick_core::alert::EventSink;
use tick_core::edge::{DEFAULT_EDGE_CAPACITY, EdgeRx, EdgeTx, edge};
use tick_core::node::{
    BatchQuerier, HttpOutRegistry, NodeContext, SideloadRegistry, UdfRegistry, build_node,
};
use tick_lang::compiler::Dag;

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Shared services handed to every node of a task.
#[derive(Clone)]
pub struct ExecDeps {
    pub events: Arc<dyn EventSink>,
    pub http_out: Arc<HttpOutRegistry>,
    pub sideloads: Arc<SideloadRegistry>,
    pub udfs: Arc<UdfRegistry>,
    pub querier: Option<Arc<dyn BatchQuerier>>,
    pub base_dir: PathBuf,
}

/// A running DAG: the task's input edge, its cancellation token, the
/// supervisor that owns every node, and per-node counters for
/// `describe()`.
pub struct TaskExec {
    pub cancel: CancellationToken,
    pub input: EdgeTx,
    pub stats: Vec<(String, Arc<tick_core::node::NodeStats>)>,
    supervisor: tokio::task::JoinHandle<()>,
}

impl TaskExec {
    /// Graceful stop: close the input so in-flight items drain through the
    /// DAG, then cancel as a backstop and wait for every node.
    pub async fn stop(self, drain_timeout: Duration) {
        let TaskExec {
            cancel,
            input,
            supervisor,
            stats: _,
        } = self;
        drop(input);
        let supervisor = async move {
            let _ = supervisor.await;
        };
        tokio::pin!(supervisor);
        if tokio::time::timeout(drain_timeout, &mut supervisor)
            .await
            .is_err()
        {
            cancel.cancel();
            supervisor.await;
        }
    }
}

/// Wire the compiled DAG into bounded edges and spawn one node task per
/// spec. The first node error tears the whole DAG down and reports
/// through `on_fatal`; node index ordering of a join's input edges matches
/// the compiler's insertion order.
pub fn start_dag(
    task_id: &str,
    dag: &Dag,
    deps: &ExecDeps,
    on_fatal: Box<dyn FnOnce(String) + Send>,
) -> Result<TaskExec> {
    let cancel = CancellationToken::new();
    let ctx = NodeContext {
        task_id: Arc::from(task_id),
        cancel: cancel.clone(),
        events: Arc::clone(&deps.events),
        http_out: Arc::clone(&deps.http_out),
        sideloads: Arc::clone(&deps.sideloads),
        udfs: Arc::clone(&deps.udfs),
        querier: deps.querier.clone(),
        base_dir: deps.base_dir.clone(),
    };

    // One bounded channel per DAG edge, in edge order so multi-input nodes
    // see their inputs in compile order.
    let mut txs: Vec<Option<EdgeTx>> = Vec::with_capacity(dag.edges.len());
    let mut rxs: Vec<Option<EdgeRx>> = Vec::with_capacity(dag.edges.len());
    for _ in &dag.edges {
        let (tx, rx) = edge(DEFAULT_EDGE_CAPACITY);
        txs.push(Some(tx));
        rxs.push(Some(rx));
    }

    let (input_tx, input_rx) = edge(DEFAULT_EDGE_CAPACITY);
    let mut input_rx = Some(input_rx);

    let mut set: JoinSet<(String, Result<()>)> = JoinSet::new();
    let mut stats = Vec::with_capacity(dag.nodes.len());
    for index in 0..dag.nodes.len() {
        let node = build_node(dag, index, ctx.clone())?;
        stats.push((node.node_name().to_string(), node.stats()));
        let mut ins: Vec<EdgeRx> = Vec::new();
        let mut outs: Vec<EdgeTx> = Vec::new();
        for (ei, e) in dag.edges.iter().enumerate() {
            if e.to == index {
                ins.push(rxs[ei].take().expect("edge consumed twice"));
            }
            if e.from == index {
                outs.push(txs[ei].take().expect("edge produced twice"));
            }
        }
        if ins.is_empty() {
            // The task root consumes the task input edge.
            ins.push(input_rx.take().expect("multiple root nodes"));
        }
        let name = node.node_name().to_string();
        set.spawn(async move { (name, node.run(ins, outs).await) });
    }

    let task_id = task_id.to_string();
    let supervisor_cancel = cancel.clone();
    let supervisor = tokio::spawn(async move {
        let mut on_fatal = Some(on_fatal);
        while let Some(joined) = set.join_next().await {
            let failure = match joined {
                Ok((_, Ok(()))) => None,
                Ok((name, Err(e))) => Some(format!("node {name}: {e}")),
                Err(e) => Some(format!("node panicked: {e}")),
            };
            if let Some(msg) = failure {
                td_error!(task, task = %task_id, error = %msg, "task failed");
                supervisor_cancel.cancel();
                if let Some(report) = on_fatal.take() {
                    report(msg);
                }
            }
        }
    });

    Ok(TaskExec {
        cancel,
        input: input_tx,
        stats,
        supervisor,
    })
}
