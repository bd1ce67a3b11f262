use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tick_lang::compiler::LogSpec;

use crate::edge::{EdgeRx, EdgeTx};
use crate::node::{Node, NodeContext, NodeStats, forward, next_msg, single_input};

/// Appends JSON-encoded items to a file and passes them through. The file
/// is created with mode 0600 unless the script overrides it.
pub struct LogNode {
    name: String,
    spec: LogSpec,
    ctx: NodeContext,
    stats: Arc<NodeStats>,
}

impl LogNode {
    pub fn new(name: String, spec: LogSpec, ctx: NodeContext) -> LogNode {
        LogNode {
            name,
            spec,
            ctx,
            stats: Arc::new(NodeStats::default()),
        }
    }

    fn open(&self) -> Result<BufWriter<File>> {
        let path = PathBuf::from(&self.spec.path);
        let path = if path.is_relative() {
            self.ctx.base_dir.join(path)
        } else {
            path
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut opts = OpenOptions::new();
        opts.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(self.spec.mode);
        }
        let file = opts
            .open(&path)
            .with_context(|| format!("open log file {}", path.display()))?;
        Ok(BufWriter::new(file))
    }
}

#[async_trait]
impl Node for LogNode {
    fn node_name(&self) -> &str {
        &self.name
    }

    fn stats(&self) -> Arc<NodeStats> {
        Arc::clone(&self.stats)
    }

    async fn run(self: Box<Self>, ins: Vec<EdgeRx>, outs: Vec<EdgeTx>) -> Result<()> {
        let mut input = single_input(ins, &self.name)?;
        let writer = Mutex::new(self.open()?);
        while let Some(msg) = next_msg(&mut input, &self.ctx.cancel).await {
            self.stats.points_in.fetch_add(1, Ordering::Relaxed);
            {
                let line = serde_json::to_string(&msg)?;
                let mut w = writer.lock().expect("log writer lock");
                w.write_all(line.as_bytes())?;
                w.write_all(b"\n")?;
                w.flush()?;
            }
            if !forward(&outs, &msg, &self.ctx.cancel).await {
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
    use crate::alert::NullEventSink;
    use crate::edge::edge;
    use crate::node::{HttpOutRegistry, SideloadRegistry, UdfRegistry};
    use crate::point::{FieldValue, Message, Point};
    use chrono::{TimeZone, Utc};
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn writes_jsonl_and_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let spec = LogSpec {
            path: path.display().to_string(),
            mode: 0o600,
        };
        let ctx = NodeContext {
            task_id: Arc::from("t"),
            cancel: CancellationToken::new(),
            events: Arc::new(NullEventSink),
            http_out: Arc::new(HttpOutRegistry::default()),
            sideloads: Arc::new(SideloadRegistry::default()),
            udfs: Arc::new(UdfRegistry::default()),
            querier: None,
            base_dir: dir.path().to_path_buf(),
        };
        let node = Box::new(LogNode::new("log1".into(), spec, ctx));
        let (in_tx, in_rx) = edge(8);
        let (out_tx, mut out_rx) = edge(8);
        let handle = tokio::spawn(node.run(vec![in_rx], vec![out_tx]));

        let mut p = Point::new(Utc.timestamp_opt(1, 0).unwrap(), "m");
        p.fields.insert("v".into(), FieldValue::Int(1));
        in_tx.send(Message::Point(p)).await.unwrap();
        drop(in_tx);
        handle.await.unwrap().unwrap();

        assert!(matches!(out_rx.recv().await, Some(Message::Point(_))));
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains("\"v\":1"), "{contents}");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
