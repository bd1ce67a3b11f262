use super::*;

fn parse(src: &str) -> Program {
    parse_program(src).expect("parse failed")
}

// ---------------------------------------------------------------------------
// Statements
// ---------------------------------------------------------------------------

#[test]
fn dbrp_statement() {
    let p = parse("dbrp \"telegraf\".\"autogen\"\nstream|from()");
    assert_eq!(
        p.stmts[0],
        Stmt::Dbrp(Dbrp {
            db: "telegraf".into(),
            rp: "autogen".into()
        })
    );
}

#[test]
fn var_with_default() {
    let p = parse("var period = 10s");
    let Stmt::Var(decl) = &p.stmts[0] else {
        panic!("expected var stmt")
    };
    assert_eq!(decl.name, "period");
    assert_eq!(decl.ty, None);
    assert_eq!(
        decl.def,
        Some(VarDef::Expr(Expr::Duration(10_000_000_000)))
    );
}

#[test]
fn var_declared_only() {
    let p = parse("var field string");
    let Stmt::Var(decl) = &p.stmts[0] else {
        panic!("expected var stmt")
    };
    assert_eq!(decl.ty, Some(VarType::String));
    assert_eq!(decl.def, None);
}

#[test]
fn var_typed_with_default() {
    let p = parse("var threshold float = 42.5");
    let Stmt::Var(decl) = &p.stmts[0] else {
        panic!("expected var stmt")
    };
    assert_eq!(decl.ty, Some(VarType::Float));
    assert_eq!(decl.def, Some(VarDef::Expr(Expr::Float(42.5))));
}

#[test]
fn var_chain_alias() {
    let p = parse("var s = stream");
    let Stmt::Var(decl) = &p.stmts[0] else {
        panic!("expected var stmt")
    };
    let Some(VarDef::Chain(chain)) = &decl.def else {
        panic!("expected chain def, got {:?}", decl.def)
    };
    assert_eq!(chain.source, ChainSource::Stream);
    assert!(chain.calls.is_empty());
}

#[test]
fn var_value_ref_is_expr_not_chain() {
    let p = parse("var a = 5\nvar b = a");
    let Stmt::Var(decl) = &p.stmts[1] else {
        panic!("expected var stmt")
    };
    assert_eq!(decl.def, Some(VarDef::Expr(Expr::Var("a".into()))));
}

// ---------------------------------------------------------------------------
// Chains
// ---------------------------------------------------------------------------

#[test]
fn chain_with_properties() {
    let p = parse(
        "stream\n    |from()\n        .measurement('cpu')\n    |window()\n        .period(10s)\n        .every(10s)",
    );
    let Stmt::Chain(chain) = &p.stmts[0] else {
        panic!("expected chain")
    };
    assert_eq!(chain.source, ChainSource::Stream);
    let kinds: Vec<_> = chain.calls.iter().map(|c| (c.kind, c.name.as_str())).collect();
    assert_eq!(
        kinds,
        vec![
            (CallKind::Chain, "from"),
            (CallKind::Property, "measurement"),
            (CallKind::Chain, "window"),
            (CallKind::Property, "period"),
            (CallKind::Property, "every"),
        ]
    );
    assert_eq!(chain.calls[1].args, vec![Expr::Str("cpu".into())]);
    assert_eq!(chain.calls[3].args, vec![Expr::Duration(10_000_000_000)]);
}

#[test]
fn chain_from_var_ref() {
    let p = parse("cpu|alert()");
    let Stmt::Chain(chain) = &p.stmts[0] else {
        panic!("expected chain")
    };
    assert_eq!(chain.source, ChainSource::Ref("cpu".into()));
}

#[test]
fn udf_call() {
    let p = parse("stream|from()@myFunc().opt(5)");
    let Stmt::Chain(chain) = &p.stmts[0] else {
        panic!("expected chain")
    };
    assert_eq!(chain.calls[1].kind, CallKind::Udf);
    assert_eq!(chain.calls[1].name, "myFunc");
    assert_eq!(chain.calls[2].kind, CallKind::Property);
}

#[test]
fn comments_are_skipped() {
    let p = parse("// leading\nstream\n    |from() # trailing\n");
    assert_eq!(p.stmts.len(), 1);
}

// ---------------------------------------------------------------------------
// Lambdas
// ---------------------------------------------------------------------------

#[test]
fn lambda_precedence() {
    let p = parse("stream|from().where(lambda: \"value\" > 1 AND \"host\" == 'a')");
    let Stmt::Chain(chain) = &p.stmts[0] else {
        panic!("expected chain")
    };
    let Expr::Lambda(body) = &chain.calls[1].args[0] else {
        panic!("expected lambda")
    };
    let Expr::Binary { op: BinOp::And, left, right } = &**body else {
        panic!("expected AND at top, got {body:?}")
    };
    assert!(matches!(&**left, Expr::Binary { op: BinOp::Gt, .. }));
    assert!(matches!(&**right, Expr::Binary { op: BinOp::Eq, .. }));
}

#[test]
fn lambda_regex_match() {
    let p = parse("stream|from().where(lambda: \"host\" =~ /^web\\d+/)");
    let Stmt::Chain(chain) = &p.stmts[0] else {
        panic!("expected chain")
    };
    let Expr::Lambda(body) = &chain.calls[1].args[0] else {
        panic!("expected lambda")
    };
    let Expr::Binary { op: BinOp::Match, right, .. } = &**body else {
        panic!("expected =~, got {body:?}")
    };
    assert_eq!(**right, Expr::Regex("^web\\d+".into()));
}

#[test]
fn lambda_arithmetic_precedence() {
    let p = parse("var f = lambda: 1 + 2 * 3");
    let Stmt::Var(decl) = &p.stmts[0] else {
        panic!("expected var")
    };
    let Some(VarDef::Expr(Expr::Lambda(body))) = &decl.def else {
        panic!("expected lambda def")
    };
    let Expr::Binary { op: BinOp::Add, right, .. } = &**body else {
        panic!("expected + at top")
    };
    assert!(matches!(&**right, Expr::Binary { op: BinOp::Mul, .. }));
}

#[test]
fn lambda_unary_not() {
    let p = parse("var f = lambda: !\"ok\"");
    let Stmt::Var(decl) = &p.stmts[0] else {
        panic!("expected var")
    };
    let Some(VarDef::Expr(Expr::Lambda(body))) = &decl.def else {
        panic!("expected lambda def")
    };
    assert!(matches!(&**body, Expr::Unary { op: UnaryOp::Not, .. }));
}

#[test]
fn lambda_function_call() {
    let p = parse("var f = lambda: abs(\"value\") > 3.0");
    let Stmt::Var(decl) = &p.stmts[0] else {
        panic!("expected var")
    };
    let Some(VarDef::Expr(Expr::Lambda(body))) = &decl.def else {
        panic!("expected lambda def")
    };
    let Expr::Binary { left, .. } = &**body else {
        panic!("expected comparison")
    };
    assert_eq!(
        **left,
        Expr::Call {
            name: "abs".into(),
            args: vec![Expr::Field("value".into())]
        }
    );
}

#[test]
fn group_by_star() {
    let p = parse("stream|from().groupBy(*)");
    let Stmt::Chain(chain) = &p.stmts[0] else {
        panic!("expected chain")
    };
    assert_eq!(chain.calls[1].args, vec![Expr::Star]);
}

#[test]
fn list_literal_arg() {
    let p = parse("stream|from().groupBy(['host', 'region'])");
    let Stmt::Chain(chain) = &p.stmts[0] else {
        panic!("expected chain")
    };
    assert_eq!(
        chain.calls[1].args,
        vec![Expr::List(vec![
            Expr::Str("host".into()),
            Expr::Str("region".into())
        ])]
    );
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[test]
fn error_reports_line_and_col() {
    let err = parse_program("stream\n    |from(").unwrap_err();
    let msg = err.to_string();
    assert!(msg.starts_with("line 2 col "), "unexpected message: {msg}");
}

#[test]
fn error_unclosed_string() {
    let err = parse_program("stream|from().measurement('cpu").unwrap_err();
    assert!(err.to_string().contains("line 1"), "{err}");
}

#[test]
fn error_missing_method_name() {
    assert!(parse_program("stream|").is_err());
}
