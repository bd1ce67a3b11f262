use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use tick_lang::compiler::SideloadSpec;
use tracing::debug;

use crate::edge::{EdgeRx, EdgeTx};
use crate::eval::Evaluator;
use crate::node::{Node, NodeContext, NodeStats, forward, next_msg, single_input};
use crate::point::{FieldValue, Message, Point};

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// One sideload source root with a cache of parsed files. A cached `None`
/// records a miss so absent files are not re-stat'd per point.
pub struct SideloadSource {
    root: PathBuf,
    cache: RwLock<HashMap<String, Option<BTreeMap<String, FieldValue>>>>,
}

impl SideloadSource {
    fn new(root: PathBuf) -> SideloadSource {
        SideloadSource {
            root,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Fields of the JSON file at `rel` under the source root, if present.
    pub fn lookup(&self, rel: &str) -> Option<BTreeMap<String, FieldValue>> {
        if let Some(cached) = self.cache.read().expect("sideload cache").get(rel) {
            return cached.clone();
        }
        let loaded = self.load(rel);
        self.cache
            .write()
            .expect("sideload cache")
            .insert(rel.to_string(), loaded.clone());
        loaded
    }

    fn load(&self, rel: &str) -> Option<BTreeMap<String, FieldValue>> {
        let path = self.root.join(rel);
        let bytes = std::fs::read(&path).ok()?;
        match serde_json::from_slice::<BTreeMap<String, FieldValue>>(&bytes) {
            Ok(map) => Some(map),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "bad sideload file");
                None
            }
        }
    }

    /// Drop the cache so the next lookup re-reads from disk.
    pub fn reload(&self) {
        self.cache.write().expect("sideload cache").clear();
    }
}

/// All sideload sources in the process, reloadable together on server
/// reload.
#[derive(Default)]
pub struct SideloadRegistry {
    sources: Mutex<HashMap<PathBuf, Arc<SideloadSource>>>,
}

impl SideloadRegistry {
    pub fn source(&self, root: &Path) -> Arc<SideloadSource> {
        let mut sources = self.sources.lock().expect("sideload registry");
        Arc::clone(
            sources
                .entry(root.to_path_buf())
                .or_insert_with(|| Arc::new(SideloadSource::new(root.to_path_buf()))),
        )
    }

    pub fn reload_all(&self) {
        for src in self.sources.lock().expect("sideload registry").values() {
            src.reload();
        }
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// For each point, renders the ordered lookup path templates from the
/// point's tags and merges in fields from the first file that carries each
/// one, falling back to the scripted defaults.
pub struct SideloadNode {
    name: String,
    spec: SideloadSpec,
    ctx: NodeContext,
    stats: Arc<NodeStats>,
    eval: Evaluator,
}

impl SideloadNode {
    pub fn new(name: String, spec: SideloadSpec, ctx: NodeContext) -> SideloadNode {
        SideloadNode {
            name,
            spec,
            ctx,
            stats: Arc::new(NodeStats::default()),
            eval: Evaluator::default(),
        }
    }

    fn apply(&mut self, mut p: Point, source: &SideloadSource) -> Point {
        let maps: Vec<BTreeMap<String, FieldValue>> = self
            .spec
            .order
            .iter()
            .filter_map(|tmpl| render_path(tmpl, &p.tags))
            .filter_map(|rel| source.lookup(&rel))
            .collect();

        for (field, default) in &self.spec.fields {
            let from_file = maps.iter().find_map(|m| m.get(field).cloned());
            let value = match from_file {
                Some(v) => v,
                None => match self.eval.eval(default, &p) {
                    Ok(v) => v.into_field(),
                    Err(e) => {
                        self.stats.errors.fetch_add(1, Ordering::Relaxed);
                        debug!(node = %self.name, error = %e, "default eval failed");
                        continue;
                    }
                },
            };
            p.fields.insert(field.clone(), value);
        }
        p
    }
}

/// Substitute `{tag}` placeholders; None when a referenced tag is absent.
fn render_path(tmpl: &str, tags: &BTreeMap<String, String>) -> Option<String> {
    let mut out = String::with_capacity(tmpl.len());
    let mut rest = tmpl;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 1..];
        let end = tail.find('}')?;
        let key = &tail[..end];
        out.push_str(tags.get(key)?);
        rest = &tail[end + 1..];
    }
    out.push_str(rest);
    Some(out)
}

#[async_trait]
impl Node for SideloadNode {
    fn node_name(&self) -> &str {
        &self.name
    }

    fn stats(&self) -> Arc<NodeStats> {
        Arc::clone(&self.stats)
    }

    async fn run(mut self: Box<Self>, ins: Vec<EdgeRx>, outs: Vec<EdgeTx>) -> Result<()> {
        let mut input = single_input(ins, &self.name)?;
        let root = PathBuf::from(&self.spec.source);
        let root = if root.is_relative() {
            self.ctx.base_dir.join(root)
        } else {
            root
        };
        let source = self.ctx.sideloads.source(&root);
        while let Some(msg) = next_msg(&mut input, &self.ctx.cancel).await {
            self.stats.points_in.fetch_add(1, Ordering::Relaxed);
            let out_msg = match msg {
                Message::Point(p) => Message::Point(self.apply(p, &source)),
                other => other,
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
    use tick_lang::ast::Expr;

    fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn template_renders_tags() {
        assert_eq!(
            render_path("host/{host}.json", &tags(&[("host", "web01")])),
            Some("host/web01.json".into())
        );
        assert_eq!(render_path("host/{host}.json", &tags(&[])), None);
        assert_eq!(
            render_path("static.json", &tags(&[])),
            Some("static.json".into())
        );
    }

    #[test]
    fn first_matching_file_wins_then_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("host")).unwrap();
        std::fs::write(
            dir.path().join("host/web01.json"),
            r#"{"threshold": 10.5}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("default.json"), r#"{"threshold": 1.0, "limit": 7}"#)
            .unwrap();

        let registry = SideloadRegistry::default();
        let source = registry.source(dir.path());

        let spec = SideloadSpec {
            source: dir.path().display().to_string(),
            order: vec!["host/{host}.json".into(), "default.json".into()],
            fields: vec![
                ("threshold".into(), Expr::Float(0.0)),
                ("limit".into(), Expr::Int(0)),
                ("absent".into(), Expr::Int(42)),
            ],
        };
        use crate::alert::NullEventSink;
        use crate::node::{HttpOutRegistry, UdfRegistry};
        use tokio_util::sync::CancellationToken;
        let mut node = SideloadNode::new(
            "sideload1".into(),
            spec,
            NodeContext {
                task_id: Arc::from("t"),
                cancel: CancellationToken::new(),
                events: Arc::new(NullEventSink),
                http_out: Arc::new(HttpOutRegistry::default()),
                sideloads: Arc::new(SideloadRegistry::default()),
                udfs: Arc::new(UdfRegistry::default()),
                querier: None,
                base_dir: dir.path().to_path_buf(),
            },
        );

        let mut p = Point::new(chrono::Utc::now(), "m");
        p.tags.insert("host".into(), "web01".into());
        let out = node.apply(p, &source);

        // host file wins for threshold, default file supplies limit,
        // scripted default covers the absent field.
        assert_eq!(out.fields["threshold"], FieldValue::Float(10.5));
        assert_eq!(out.fields["limit"], FieldValue::Int(7));
        assert_eq!(out.fields["absent"], FieldValue::Int(42));
    }

    #[test]
    fn reload_drops_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.json");
        std::fs::write(&path, r#"{"v": 1}"#).unwrap();
        let registry = SideloadRegistry::default();
        let source = registry.source(dir.path());
        assert_eq!(source.lookup("x.json").unwrap()["v"], FieldValue::Int(1));

        std::fs::write(&path, r#"{"v": 2}"#).unwrap();
        // Cached until reload.
        assert_eq!(source.lookup("x.json").unwrap()["v"], FieldValue::Int(1));
        registry.reload_all();
        assert_eq!(source.lookup("x.json").unwrap()["v"], FieldValue::Int(2));
    }
}
