use std::collections::HashMap;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tick_lang::ast::Expr;
use tick_lang::compiler::UdfSpec;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::edge::{EdgeRx, EdgeTx};
use crate::node::{Node, NodeContext, NodeStats, forward, next_msg, single_input};
use crate::point::Message;

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// How to launch one named UDF process.
#[derive(Debug, Clone)]
pub struct UdfConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Per-request timeout; falls back to the registry default.
    pub timeout: Option<Duration>,
}

/// Named UDF processes available to tasks, from the `[udf]` config section.
#[derive(Debug, Clone)]
pub struct UdfRegistry {
    pub procs: HashMap<String, UdfConfig>,
    pub default_timeout: Duration,
}

impl Default for UdfRegistry {
    fn default() -> Self {
        UdfRegistry {
            procs: HashMap::new(),
            default_timeout: Duration::from_secs(30),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire frames
// ---------------------------------------------------------------------------

/// One frame of the length-prefixed JSON protocol, in either direction.
/// A request is `init` once, then `item` per message; the process answers
/// each `item` with zero or more `item`s followed by `end`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Frame {
    Init { options: Vec<(String, Vec<serde_json::Value>)> },
    Item(Message),
    End,
}

async fn write_frame(w: &mut (impl AsyncWriteExt + Unpin), frame: &Frame) -> Result<()> {
    let payload = serde_json::to_vec(frame)?;
    w.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    w.write_all(&payload).await?;
    w.flush().await?;
    Ok(())
}

/// Read a single length-prefixed frame: `[4B BE u32 len][payload]`.
/// Returns `Ok(None)` on clean EOF.
async fn read_frame(reader: &mut (impl AsyncReadExt + Unpin)) -> io::Result<Option<Frame>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let frame_len = u32::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; frame_len];
    reader.read_exact(&mut payload).await?;
    serde_json::from_slice(&payload)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Literal-expression rendering for option args relayed at init.
fn expr_to_json(e: &Expr) -> serde_json::Value {
    match e {
        Expr::Int(i) => serde_json::json!(i),
        Expr::Float(f) => serde_json::json!(f),
        Expr::Bool(b) => serde_json::json!(b),
        Expr::Str(s) => serde_json::json!(s),
        Expr::Duration(ns) => serde_json::json!(ns),
        Expr::List(items) => {
            serde_json::Value::Array(items.iter().map(expr_to_json).collect())
        }
        other => serde_json::json!(format!("{other:?}")),
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// Relays items to an external process over the framed protocol. The
/// process may answer zero or more items per request; exceeding the
/// per-request timeout or violating the protocol is a task-fatal error.
pub struct UdfNode {
    name: String,
    spec: UdfSpec,
    ctx: NodeContext,
    stats: Arc<NodeStats>,
}

impl UdfNode {
    pub fn new(name: String, spec: UdfSpec, ctx: NodeContext) -> UdfNode {
        UdfNode {
            name,
            spec,
            ctx,
            stats: Arc::new(NodeStats::default()),
        }
    }
}

#[async_trait]
impl Node for UdfNode {
    fn node_name(&self) -> &str {
        &self.name
    }

    fn stats(&self) -> Arc<NodeStats> {
        Arc::clone(&self.stats)
    }

    async fn run(self: Box<Self>, ins: Vec<EdgeRx>, outs: Vec<EdgeTx>) -> Result<()> {
        let mut input = single_input(ins, &self.name)?;

        let Some(cfg) = self.ctx.udfs.procs.get(&self.spec.name) else {
            bail!("unknown UDF \"{}\"", self.spec.name);
        };
        let timeout = cfg.timeout.unwrap_or(self.ctx.udfs.default_timeout);

        let mut child = Command::new(&cfg.command)
            .args(&cfg.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn UDF \"{}\"", self.spec.name))?;
        let mut stdin = child.stdin.take().context("UDF stdin unavailable")?;
        let mut stdout = BufReader::new(child.stdout.take().context("UDF stdout unavailable")?);

        let options = self
            .spec
            .options
            .iter()
            .map(|(name, args)| (name.clone(), args.iter().map(expr_to_json).collect()))
            .collect();
        write_frame(&mut stdin, &Frame::Init { options }).await?;

        while let Some(msg) = next_msg(&mut input, &self.ctx.cancel).await {
            self.stats.points_in.fetch_add(1, Ordering::Relaxed);

            if matches!(msg, Message::Barrier(_)) {
                if !forward(&outs, &msg, &self.ctx.cancel).await {
                    break;
                }
                continue;
            }

            write_frame(&mut stdin, &Frame::Item(msg)).await?;

            // Read the response stream for this request, bounded by the
            // per-request timeout.
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                let frame = tokio::time::timeout_at(deadline, read_frame(&mut stdout))
                    .await
                    .map_err(|_| {
                        anyhow::anyhow!("UDF \"{}\" request timed out", self.spec.name)
                    })??;
                match frame {
                    Some(Frame::Item(item)) => {
                        if !forward(&outs, &item, &self.ctx.cancel).await {
                            return Ok(());
                        }
                        self.stats.points_out.fetch_add(1, Ordering::Relaxed);
                    }
                    Some(Frame::End) => break,
                    Some(Frame::Init { .. }) => {
                        bail!("UDF \"{}\" protocol violation: init from process", self.spec.name)
                    }
                    None => bail!("UDF \"{}\" process closed its output", self.spec.name),
                }
            }
        }

        drop(stdin);
        let _ = child.wait().await;
        Ok(())
    }
}
