use std::collections::BTreeMap;

use super::*;
use crate::parser::parse_program;
use crate::vars::VarValue;

fn compile_src(src: &str) -> Dag {
    let p = parse_program(src).expect("parse");
    compile(&p, &BTreeMap::new()).expect("compile")
}

fn compile_err(src: &str) -> String {
    let p = parse_program(src).expect("parse");
    compile(&p, &BTreeMap::new()).unwrap_err().to_string()
}

// ---------------------------------------------------------------------------
// Type inference
// ---------------------------------------------------------------------------

#[test]
fn stream_task_type() {
    let dag = compile_src("stream|from().measurement('cpu')");
    assert_eq!(dag.task_type, TaskType::Stream);
}

#[test]
fn batch_task_type() {
    let dag = compile_src("batch|query('SELECT mean(v) FROM db').period(1m).every(1m)");
    assert_eq!(dag.task_type, TaskType::Batch);
}

#[test]
fn var_source_alias_matches_direct_chain() {
    let direct = compile_src("stream|from().measurement('cpu')");
    let aliased = compile_src("var s = stream\ns|from().measurement('cpu')");
    assert_eq!(direct.task_type, aliased.task_type);
    assert_eq!(direct.nodes, aliased.nodes);
    assert_eq!(direct.edges, aliased.edges);
}

#[test]
fn mixed_sources_rejected() {
    let err = compile_err("stream|from()\nbatch|query('q').period(1m).every(1m)");
    assert!(err.contains("cannot mix stream and batch"), "{err}");
}

// ---------------------------------------------------------------------------
// Node construction & properties
// ---------------------------------------------------------------------------

#[test]
fn window_spec_built() {
    let dag = compile_src("stream|from()|window().period(10s).every(5s).align()");
    let NodeSpec::Window(w) = &dag.nodes[2] else {
        panic!("expected window, got {:?}", dag.nodes[2])
    };
    assert_eq!(w.period, 10_000_000_000);
    assert_eq!(w.every, 5_000_000_000);
    assert!(w.align);
}

#[test]
fn aggregate_after_window() {
    let dag = compile_src("stream|from()|window().period(10s)|count('value')");
    let NodeSpec::Aggregate(a) = &dag.nodes[3] else {
        panic!("expected aggregate")
    };
    assert_eq!(a.func, AggFunc::Count);
    assert_eq!(a.field, "value");
    assert_eq!(a.as_name, "count");
}

#[test]
fn aggregate_on_stream_rejected() {
    let err = compile_err("stream|from()|count('value')");
    assert!(err.contains("expects batch input"), "{err}");
}

#[test]
fn eval_requires_matching_as() {
    let err = compile_err("stream|from()|eval(lambda: \"a\" + 1)");
    assert!(err.contains(".as()"), "{err}");
}

#[test]
fn alert_spec_built() {
    let dag = compile_src(
        "stream|from()|alert()\n    .warn(lambda: \"value\" <= 1.0)\n    .crit(lambda: \"value\" > 1.0)\n    .stateChangesOnly()\n    .topic('ops')\n    .log('/tmp/alerts.log')",
    );
    let NodeSpec::Alert(a) = &dag.nodes[2] else {
        panic!("expected alert")
    };
    assert!(a.warn.is_some());
    assert!(a.crit.is_some());
    assert!(a.info.is_none());
    assert!(a.state_changes_only);
    assert_eq!(a.topic.as_deref(), Some("ops"));
    assert_eq!(a.handlers.len(), 1);
    assert_eq!(a.handlers[0].kind, "log");
}

#[test]
fn join_requires_as_names() {
    let err = compile_err(
        "var errors = stream|from().measurement('errors')\nvar requests = stream|from().measurement('requests')\nerrors|join(requests).tolerance(1s)",
    );
    assert!(err.contains(".as()"), "{err}");
}

#[test]
fn join_builds_two_input_edges() {
    let dag = compile_src(
        "var errors = stream|from().measurement('errors')\nvar requests = stream|from().measurement('requests')\nerrors|join(requests).as('errors', 'requests').tolerance(1s)",
    );
    let join_idx = dag
        .nodes
        .iter()
        .position(|n| matches!(n, NodeSpec::Join(_)))
        .unwrap();
    assert_eq!(dag.inputs_of(join_idx).len(), 2);
}

#[test]
fn httpout_is_terminal() {
    let err = compile_err("stream|from()|httpOut('x')|log('/tmp/f')");
    assert!(err.contains("does not produce output"), "{err}");
}

#[test]
fn unknown_method_rejected() {
    let err = compile_err("stream|from()|frobnicate('x')");
    assert!(err.contains("unknown chaining method"), "{err}");
}

#[test]
fn unknown_property_rejected() {
    let err = compile_err("stream|from()|window().period(1s).frequency(2s)");
    assert!(err.contains("unknown property"), "{err}");
}

#[test]
fn udf_node_collects_options() {
    let dag = compile_src("stream|from()@movingAverage().field('value').size(10)");
    let NodeSpec::Udf(u) = &dag.nodes[2] else {
        panic!("expected udf")
    };
    assert_eq!(u.name, "movingAverage");
    assert_eq!(u.options.len(), 2);
}

// ---------------------------------------------------------------------------
// Vars & dbrp
// ---------------------------------------------------------------------------

#[test]
fn var_substitution_in_lambda() {
    let p = parse_program(
        "var threshold = 5.0\nstream|from()|alert().crit(lambda: \"value\" > threshold)",
    )
    .unwrap();
    let dag = compile(&p, &BTreeMap::new()).unwrap();
    let NodeSpec::Alert(a) = &dag.nodes[2] else {
        panic!("expected alert")
    };
    let Some(Expr::Binary { right, .. }) = &a.crit else {
        panic!("expected crit binary")
    };
    assert_eq!(**right, Expr::Float(5.0));
}

#[test]
fn supplied_var_overrides_default_in_chain() {
    let p = parse_program("var m = 'cpu'\nstream|from().measurement(m)").unwrap();
    let mut vars = BTreeMap::new();
    vars.insert("m".to_string(), VarValue::Str("mem".into()));
    let dag = compile(&p, &vars).unwrap();
    let NodeSpec::From(f) = &dag.nodes[1] else {
        panic!("expected from")
    };
    assert_eq!(f.measurement.as_deref(), Some("mem"));
}

#[test]
fn unbound_variable_rejected() {
    let err = compile_err("stream|from().measurement(m)");
    assert!(err.contains("unbound variable \"m\""), "{err}");
}

#[test]
fn dbrps_collected() {
    let dag = compile_src("dbrp \"telegraf\".\"autogen\"\nstream|from()");
    assert_eq!(dag.dbrps.len(), 1);
    assert_eq!(dag.dbrps[0].db, "telegraf");
}

#[test]
fn duplicate_dbrp_rejected() {
    let err = compile_err("dbrp \"a\".\"b\"\ndbrp \"a\".\"b\"\nstream|from()");
    assert!(err.contains("duplicate dbrp"), "{err}");
}

// ---------------------------------------------------------------------------
// DOT rendering
// ---------------------------------------------------------------------------

#[test]
fn dot_output() {
    let dag = compile_src("stream|from()|window().period(10s)|count('value')|httpOut('count')");
    let dot = dag.dot("t1");
    assert!(dot.starts_with("digraph t1 {"), "{dot}");
    assert!(dot.contains("stream0 -> from1;"), "{dot}");
    assert!(dot.contains("from1 -> window2;"), "{dot}");
    assert!(dot.contains("window2 -> count3;"), "{dot}");
    assert!(dot.contains("count3 -> httpOut4;"), "{dot}");
}
