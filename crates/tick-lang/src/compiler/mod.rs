use std::collections::{BTreeMap, HashMap};

use anyhow::{Result, bail};

use crate::ast::{CallKind, Chain, ChainSource, Dbrp, Expr, MethodCall, Program, Stmt, VarDef};
use crate::vars::{VarValue, resolve_vars};

mod spec;

pub use spec::*;

#[cfg(test)]
mod tests;

// ---------------------------------------------------------------------------
// Dag
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Stream,
    Batch,
}

impl TaskType {
    pub fn name(&self) -> &'static str {
        match self {
            TaskType::Stream => "stream",
            TaskType::Batch => "batch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DagEdge {
    pub from: usize,
    pub to: usize,
    pub kind: EdgeKind,
}

/// A compiled task: typed node specs plus the links between them. Node
/// indices are stable and name the nodes (`from1`, `window2`, ...); an alert
/// node's index also names its anonymous topic.
#[derive(Debug, Clone, PartialEq)]
pub struct Dag {
    pub task_type: TaskType,
    pub dbrps: Vec<Dbrp>,
    pub nodes: Vec<NodeSpec>,
    pub edges: Vec<DagEdge>,
}

impl Dag {
    pub fn node_name(&self, index: usize) -> String {
        format!("{}{}", self.nodes[index].kind(), index)
    }

    /// Indices of edges feeding `index`, in insertion order.
    pub fn inputs_of(&self, index: usize) -> Vec<DagEdge> {
        self.edges.iter().copied().filter(|e| e.to == index).collect()
    }

    pub fn outputs_of(&self, index: usize) -> Vec<DagEdge> {
        self.edges
            .iter()
            .copied()
            .filter(|e| e.from == index)
            .collect()
    }

    /// DOT rendering for debugging output.
    pub fn dot(&self, task_id: &str) -> String {
        let mut out = format!("digraph {task_id} {{\n");
        for e in &self.edges {
            out.push_str(&format!(
                "{} -> {};\n",
                self.node_name(e.from),
                self.node_name(e.to)
            ));
        }
        out.push_str("}\n");
        out
    }
}

// ---------------------------------------------------------------------------
// Compilation
// ---------------------------------------------------------------------------

/// Compile a parsed program against supplied var values into a typed DAG.
///
/// Resolves vars first (missing/ill-typed vars fail here), then walks the
/// chain statements building nodes and validating edge-kind compatibility.
pub fn compile(program: &Program, provided: &BTreeMap<String, VarValue>) -> Result<Dag> {
    let vars = resolve_vars(program, provided)?;
    let mut b = Builder {
        nodes: Vec::new(),
        edges: Vec::new(),
        task_type: None,
        stream_root: None,
        batch_root: None,
        env: vars
            .into_iter()
            .map(|(k, v)| (k, Binding::Value(v)))
            .collect(),
        dbrps: Vec::new(),
    };

    for stmt in &program.stmts {
        match stmt {
            Stmt::Dbrp(d) => {
                if b.dbrps.contains(d) {
                    bail!("duplicate dbrp \"{}\".\"{}\"", d.db, d.rp);
                }
                b.dbrps.push(d.clone());
            }
            Stmt::Var(decl) => {
                if let Some(VarDef::Chain(chain)) = &decl.def {
                    let end = b.build_chain(chain)?;
                    b.env.insert(decl.name.clone(), end);
                }
            }
            Stmt::Chain(chain) => {
                b.build_chain(chain)?;
            }
        }
    }

    b.finish()
}

enum Binding {
    Value(VarValue),
    Node { index: usize, out: Option<EdgeKind> },
}

struct Builder {
    nodes: Vec<NodeSpec>,
    edges: Vec<DagEdge>,
    task_type: Option<TaskType>,
    stream_root: Option<usize>,
    batch_root: Option<usize>,
    env: HashMap<String, Binding>,
    dbrps: Vec<Dbrp>,
}

impl Builder {
    // -- chain walking ------------------------------------------------------

    fn build_chain(&mut self, chain: &Chain) -> Result<Binding> {
        let (mut cur, mut out) = match &chain.source {
            ChainSource::Stream => (self.stream_root()?, Some(EdgeKind::Stream)),
            ChainSource::Batch => (self.batch_root()?, Some(EdgeKind::Batch)),
            ChainSource::Ref(name) => match self.env.get(name) {
                Some(Binding::Node { index, out }) => (*index, *out),
                Some(Binding::Value(_)) => {
                    bail!("var \"{name}\" holds a value, not a pipeline")
                }
                None => bail!("unknown identifier \"{name}\""),
            },
        };

        for call in &chain.calls {
            match call.kind {
                CallKind::Property => self.apply_property(cur, call)?,
                CallKind::Chain | CallKind::Udf => {
                    let Some(in_kind) = out else {
                        bail!(
                            "{} does not produce output; cannot chain \"{}\"",
                            self.nodes[cur].kind(),
                            call.name
                        );
                    };
                    let (index, new_out) = self.create_node(cur, in_kind, call)?;
                    cur = index;
                    out = new_out;
                }
            }
        }

        Ok(Binding::Node { index: cur, out })
    }

    fn stream_root(&mut self) -> Result<usize> {
        if self.task_type == Some(TaskType::Batch) {
            bail!("cannot mix stream and batch sources in one task");
        }
        self.task_type = Some(TaskType::Stream);
        Ok(match self.stream_root {
            Some(i) => i,
            None => {
                self.nodes.push(NodeSpec::Stream);
                let i = self.nodes.len() - 1;
                self.stream_root = Some(i);
                i
            }
        })
    }

    fn batch_root(&mut self) -> Result<usize> {
        if self.task_type == Some(TaskType::Stream) {
            bail!("cannot mix stream and batch sources in one task");
        }
        self.task_type = Some(TaskType::Batch);
        Ok(match self.batch_root {
            Some(i) => i,
            None => {
                self.nodes.push(NodeSpec::Batch);
                let i = self.nodes.len() - 1;
                self.batch_root = Some(i);
                i
            }
        })
    }

    // -- node creation ------------------------------------------------------

    /// Create the node for a chaining (or UDF) call, link it to `from`, and
    /// return `(index, output kind)`. `None` output marks a terminal node.
    fn create_node(
        &mut self,
        from: usize,
        in_kind: EdgeKind,
        call: &MethodCall,
    ) -> Result<(usize, Option<EdgeKind>)> {
        if call.kind == CallKind::Udf {
            let spec = UdfSpec {
                name: call.name.clone(),
                options: Vec::new(),
            };
            let idx = self.push_node(NodeSpec::Udf(spec), from, in_kind);
            return Ok((idx, Some(in_kind)));
        }

        let name = call.name.as_str();

        // Join args are pipeline refs, not values; resolve them before any
        // var substitution.
        if name == "join" {
            let mut inputs = vec![(from, in_kind)];
            for arg in &call.args {
                let Expr::Var(ref_name) = arg else {
                    bail!("join arguments must be pipeline variables");
                };
                match self.env.get(ref_name) {
                    Some(Binding::Node {
                        index,
                        out: Some(kind),
                    }) => {
                        if *kind != in_kind {
                            bail!(
                                "invalid chain: join inputs must agree; got {} and {}",
                                in_kind.name(),
                                kind.name()
                            );
                        }
                        inputs.push((*index, *kind));
                    }
                    Some(_) => bail!("join argument \"{ref_name}\" is not a pipeline"),
                    None => bail!("unknown identifier \"{ref_name}\""),
                }
            }
            let spec = JoinSpec {
                names: Vec::new(),
                tolerance: 0,
            };
            self.nodes.push(NodeSpec::Join(spec));
            let idx = self.nodes.len() - 1;
            for (src, kind) in inputs {
                self.edges.push(DagEdge {
                    from: src,
                    to: idx,
                    kind,
                });
            }
            return Ok((idx, Some(in_kind)));
        }

        let args = self.subst_args(&call.args)?;

        if let Some(func) = AggFunc::from_name(name) {
            if in_kind != EdgeKind::Batch {
                bail!(
                    "invalid chain: {name} expects batch input, got stream (window the data first)"
                );
            }
            let field = one_string(name, &args)?;
            let spec = AggregateSpec {
                func,
                field,
                as_name: func.name().to_string(),
            };
            let idx = self.push_node(NodeSpec::Aggregate(spec), from, in_kind);
            return Ok((idx, Some(EdgeKind::Stream)));
        }

        Ok(match name {
            "from" => {
                if in_kind != EdgeKind::Stream {
                    bail!("invalid chain: from expects stream input");
                }
                no_args(name, &args)?;
                let idx = self.push_node(NodeSpec::From(FromSpec::default()), from, in_kind);
                (idx, Some(EdgeKind::Stream))
            }
            "query" => {
                if !matches!(self.nodes[from], NodeSpec::Batch) {
                    bail!("invalid chain: query is only valid directly on a batch source");
                }
                let query = one_string(name, &args)?;
                let spec = QuerySpec {
                    query,
                    period: 0,
                    every: 0,
                    align: false,
                    cluster: None,
                };
                let idx = self.push_node(NodeSpec::Query(spec), from, in_kind);
                (idx, Some(EdgeKind::Batch))
            }
            "where" => {
                let filter = one_lambda(name, &args)?;
                let idx = self.push_node(NodeSpec::Where(WhereSpec { filter }), from, in_kind);
                (idx, Some(in_kind))
            }
            "window" => {
                if in_kind != EdgeKind::Stream {
                    bail!("invalid chain: window expects stream input");
                }
                no_args(name, &args)?;
                let spec = WindowSpec {
                    period: 0,
                    every: 0,
                    align: false,
                };
                let idx = self.push_node(NodeSpec::Window(spec), from, in_kind);
                (idx, Some(EdgeKind::Batch))
            }
            "groupBy" => {
                let (dims, star) = strings_or_star(name, &args)?;
                let idx =
                    self.push_node(NodeSpec::GroupBy(GroupBySpec { dims, star }), from, in_kind);
                (idx, Some(in_kind))
            }
            "eval" => {
                let exprs = lambda_args(name, &args)?;
                let spec = EvalSpec {
                    exprs,
                    names: Vec::new(),
                    keep: None,
                };
                let idx = self.push_node(NodeSpec::Eval(spec), from, in_kind);
                (idx, Some(in_kind))
            }
            "alert" => {
                no_args(name, &args)?;
                let idx = self.push_node(NodeSpec::Alert(AlertSpec::default()), from, in_kind);
                (idx, Some(in_kind))
            }
            "httpOut" => {
                let endpoint = one_string(name, &args)?;
                let idx = self.push_node(NodeSpec::HttpOut(HttpOutSpec { endpoint }), from, in_kind);
                (idx, None)
            }
            "log" => {
                let path = one_string(name, &args)?;
                let spec = LogSpec { path, mode: 0o600 };
                let idx = self.push_node(NodeSpec::Log(spec), from, in_kind);
                (idx, Some(in_kind))
            }
            "sideload" => {
                if in_kind != EdgeKind::Stream {
                    bail!("invalid chain: sideload expects stream input");
                }
                no_args(name, &args)?;
                let idx =
                    self.push_node(NodeSpec::Sideload(SideloadSpec::default()), from, in_kind);
                (idx, Some(EdgeKind::Stream))
            }
            other => bail!("unknown chaining method \"{other}\""),
        })
    }

    fn push_node(&mut self, spec: NodeSpec, from: usize, kind: EdgeKind) -> usize {
        self.nodes.push(spec);
        let idx = self.nodes.len() - 1;
        self.edges.push(DagEdge {
            from,
            to: idx,
            kind,
        });
        idx
    }

    // -- properties ---------------------------------------------------------

    fn apply_property(&mut self, index: usize, call: &MethodCall) -> Result<()> {
        let prop = call.name.as_str();
        let args = self.subst_args(&call.args)?;
        let kind = self.nodes[index].kind();

        match &mut self.nodes[index] {
            NodeSpec::From(spec) => match prop {
                "measurement" => spec.measurement = Some(one_string(prop, &args)?),
                "where" => spec.filter = Some(one_lambda(prop, &args)?),
                "groupBy" => {
                    let (dims, star) = strings_or_star(prop, &args)?;
                    spec.group_by = dims;
                    spec.group_by_star = star;
                }
                _ => bail!("unknown property \"{prop}\" on {kind} node"),
            },
            NodeSpec::Window(spec) => match prop {
                "period" => spec.period = one_duration(prop, &args)?,
                "every" => spec.every = one_duration(prop, &args)?,
                "align" => {
                    no_args(prop, &args)?;
                    spec.align = true;
                }
                _ => bail!("unknown property \"{prop}\" on {kind} node"),
            },
            NodeSpec::GroupBy(spec) => match prop {
                "exclude" => {
                    let (dims, _) = strings_or_star(prop, &args)?;
                    spec.dims.retain(|d| !dims.contains(d));
                }
                _ => bail!("unknown property \"{prop}\" on {kind} node"),
            },
            NodeSpec::Eval(spec) => match prop {
                "as" => spec.names = string_list(prop, &args)?,
                "keep" => spec.keep = Some(string_list(prop, &args)?),
                _ => bail!("unknown property \"{prop}\" on {kind} node"),
            },
            NodeSpec::Aggregate(spec) => match prop {
                "as" => spec.as_name = one_string(prop, &args)?,
                _ => bail!("unknown property \"{prop}\" on {kind} node"),
            },
            NodeSpec::Join(spec) => match prop {
                "as" => spec.names = string_list(prop, &args)?,
                "tolerance" => spec.tolerance = one_duration(prop, &args)?,
                _ => bail!("unknown property \"{prop}\" on {kind} node"),
            },
            NodeSpec::Alert(spec) => match prop {
                "topic" => spec.topic = Some(one_string(prop, &args)?),
                "id" => spec.id_tmpl = Some(one_string(prop, &args)?),
                "message" => spec.message_tmpl = Some(one_string(prop, &args)?),
                "details" => spec.details_tmpl = Some(one_string(prop, &args)?),
                "info" => spec.info = Some(one_lambda(prop, &args)?),
                "warn" => spec.warn = Some(one_lambda(prop, &args)?),
                "crit" => spec.crit = Some(one_lambda(prop, &args)?),
                "stateChangesOnly" => {
                    no_args(prop, &args)?;
                    spec.state_changes_only = true;
                }
                "category" => spec.category = Some(one_string(prop, &args)?),
                "inhibit" => {
                    let mut list = string_list(prop, &args)?;
                    if list.is_empty() {
                        bail!("inhibit requires a category and at least one tag key");
                    }
                    let category = list.remove(0);
                    spec.inhibits.push(InhibitSpec {
                        category,
                        tags: list,
                    });
                }
                "log" | "post" | "tcp" => spec.handlers.push(HandlerCall {
                    kind: prop.to_string(),
                    target: one_string(prop, &args)?,
                }),
                _ => bail!("unknown property \"{prop}\" on {kind} node"),
            },
            NodeSpec::Log(spec) => match prop {
                "mode" => spec.mode = one_int(prop, &args)? as u32,
                _ => bail!("unknown property \"{prop}\" on {kind} node"),
            },
            NodeSpec::Sideload(spec) => match prop {
                "source" => spec.source = one_string(prop, &args)?,
                "order" => spec.order = string_list(prop, &args)?,
                "field" => {
                    if args.len() != 2 {
                        bail!("field expects a name and a default value");
                    }
                    let field = expect_string(prop, &args[0])?;
                    spec.fields.push((field, args[1].clone()));
                }
                _ => bail!("unknown property \"{prop}\" on {kind} node"),
            },
            NodeSpec::Udf(spec) => {
                spec.options.push((prop.to_string(), args));
            }
            NodeSpec::Query(spec) => match prop {
                "period" => spec.period = one_duration(prop, &args)?,
                "every" => spec.every = one_duration(prop, &args)?,
                "align" => {
                    no_args(prop, &args)?;
                    spec.align = true;
                }
                "cluster" => spec.cluster = Some(one_string(prop, &args)?),
                _ => bail!("unknown property \"{prop}\" on {kind} node"),
            },
            _ => bail!("unknown property \"{prop}\" on {kind} node"),
        }
        Ok(())
    }

    // -- var substitution ---------------------------------------------------

    fn subst_args(&self, args: &[Expr]) -> Result<Vec<Expr>> {
        args.iter().map(|a| self.subst(a)).collect()
    }

    /// Replace var references with their bound values, recursively, so
    /// lambdas capture the binding present at compile time.
    fn subst(&self, expr: &Expr) -> Result<Expr> {
        Ok(match expr {
            Expr::Var(name) => match self.env.get(name) {
                Some(Binding::Value(v)) => v.to_expr(),
                Some(Binding::Node { .. }) => {
                    bail!("var \"{name}\" is a pipeline, not a value")
                }
                None => bail!("unbound variable \"{name}\""),
            },
            Expr::Lambda(body) => Expr::Lambda(Box::new(self.subst(body)?)),
            Expr::List(items) => Expr::List(self.subst_args(items)?),
            Expr::Unary { op, expr } => Expr::Unary {
                op: *op,
                expr: Box::new(self.subst(expr)?),
            },
            Expr::Binary { op, left, right } => Expr::Binary {
                op: *op,
                left: Box::new(self.subst(left)?),
                right: Box::new(self.subst(right)?),
            },
            Expr::Call { name, args } => Expr::Call {
                name: name.clone(),
                args: self.subst_args(args)?,
            },
            other => other.clone(),
        })
    }

    // -- final validation ---------------------------------------------------

    fn finish(self) -> Result<Dag> {
        let Some(task_type) = self.task_type else {
            bail!("script has no stream or batch source");
        };

        let dag = Dag {
            task_type,
            dbrps: self.dbrps,
            nodes: self.nodes,
            edges: self.edges,
        };

        for (i, node) in dag.nodes.iter().enumerate() {
            match node {
                NodeSpec::Window(w) if w.period == 0 => {
                    bail!("{} requires .period()", dag.node_name(i))
                }
                NodeSpec::Query(q) if q.period == 0 || q.every == 0 => {
                    bail!("{} requires .period() and .every()", dag.node_name(i))
                }
                NodeSpec::Eval(e) if e.names.len() != e.exprs.len() => {
                    bail!(
                        "{} requires .as() with one name per expression",
                        dag.node_name(i)
                    )
                }
                NodeSpec::Join(j) => {
                    let in_count = dag.inputs_of(i).len();
                    if j.names.len() != in_count {
                        bail!(
                            "{} requires .as() with one name per joined stream",
                            dag.node_name(i)
                        )
                    }
                }
                _ => {}
            }
        }

        Ok(dag)
    }
}

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

fn no_args(name: &str, args: &[Expr]) -> Result<()> {
    if !args.is_empty() {
        bail!("{name} takes no arguments");
    }
    Ok(())
}

fn expect_string(name: &str, arg: &Expr) -> Result<String> {
    match arg {
        Expr::Str(s) => Ok(s.clone()),
        other => bail!("{name} expects a string argument, got {other:?}"),
    }
}

fn one_string(name: &str, args: &[Expr]) -> Result<String> {
    if args.len() != 1 {
        bail!("{name} expects exactly one argument");
    }
    expect_string(name, &args[0])
}

fn one_duration(name: &str, args: &[Expr]) -> Result<i64> {
    match args {
        [Expr::Duration(ns)] => Ok(*ns),
        _ => bail!("{name} expects a duration argument"),
    }
}

fn one_int(name: &str, args: &[Expr]) -> Result<i64> {
    match args {
        [Expr::Int(i)] => Ok(*i),
        _ => bail!("{name} expects an integer argument"),
    }
}

fn one_lambda(name: &str, args: &[Expr]) -> Result<Expr> {
    match args {
        [Expr::Lambda(body)] => Ok((**body).clone()),
        _ => bail!("{name} expects a lambda argument"),
    }
}

fn lambda_args(name: &str, args: &[Expr]) -> Result<Vec<Expr>> {
    if args.is_empty() {
        bail!("{name} expects at least one lambda argument");
    }
    args.iter()
        .map(|a| match a {
            Expr::Lambda(body) => Ok((**body).clone()),
            other => bail!("{name} expects lambda arguments, got {other:?}"),
        })
        .collect()
}

fn string_list(name: &str, args: &[Expr]) -> Result<Vec<String>> {
    let mut out = Vec::with_capacity(args.len());
    for a in args {
        match a {
            Expr::Str(s) => out.push(s.clone()),
            Expr::List(items) => {
                for item in items {
                    out.push(expect_string(name, item)?);
                }
            }
            other => bail!("{name} expects string arguments, got {other:?}"),
        }
    }
    Ok(out)
}

/// String args, or a single `*` meaning "all tags".
fn strings_or_star(name: &str, args: &[Expr]) -> Result<(Vec<String>, bool)> {
    if let [Expr::Star] = args {
        return Ok((Vec::new(), true));
    }
    Ok((string_list(name, args)?, false))
}
