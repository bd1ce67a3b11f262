use std::collections::BTreeMap;

use anyhow::{Result, bail};

use crate::ast::{Expr, Program, Stmt, VarDecl, VarDef, VarType};

// ---------------------------------------------------------------------------
// VarValue — the typed value a script var binds to
// ---------------------------------------------------------------------------

/// Runtime value of a script variable. Types are checked at bind time; the
/// compiler substitutes these into chains and lambda bodies.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum VarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Nanoseconds.
    Duration(i64),
    Str(String),
    /// Uncompiled regex source.
    Regex(String),
    /// Lambda body expression.
    Lambda(Expr),
    List(Vec<VarValue>),
    Star,
}

impl VarValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            VarValue::Bool(_) => "bool",
            VarValue::Int(_) => "int",
            VarValue::Float(_) => "float",
            VarValue::Duration(_) => "duration",
            VarValue::Str(_) => "string",
            VarValue::Regex(_) => "regex",
            VarValue::Lambda(_) => "lambda",
            VarValue::List(_) => "list",
            VarValue::Star => "star",
        }
    }

    fn matches(&self, ty: VarType) -> bool {
        matches!(
            (self, ty),
            (VarValue::Bool(_), VarType::Bool)
                | (VarValue::Int(_), VarType::Int)
                | (VarValue::Float(_), VarType::Float)
                | (VarValue::Duration(_), VarType::Duration)
                | (VarValue::Str(_), VarType::String)
                | (VarValue::Regex(_), VarType::Regex)
                | (VarValue::Lambda(_), VarType::Lambda)
                | (VarValue::List(_), VarType::List)
        )
    }

    /// Convert a var-default expression into a value. Only literal forms are
    /// accepted; a computed default belongs in a lambda.
    pub fn from_expr(expr: &Expr) -> Result<VarValue> {
        Ok(match expr {
            Expr::Bool(b) => VarValue::Bool(*b),
            Expr::Int(i) => VarValue::Int(*i),
            Expr::Float(f) => VarValue::Float(*f),
            Expr::Duration(ns) => VarValue::Duration(*ns),
            Expr::Str(s) => VarValue::Str(s.clone()),
            Expr::Regex(r) => {
                check_regex(r)?;
                VarValue::Regex(r.clone())
            }
            Expr::Lambda(body) => VarValue::Lambda((**body).clone()),
            Expr::Star => VarValue::Star,
            Expr::List(items) => VarValue::List(
                items
                    .iter()
                    .map(VarValue::from_expr)
                    .collect::<Result<Vec<_>>>()?,
            ),
            other => bail!("var default must be a literal, got {other:?}"),
        })
    }

    /// Render the value back as an expression for substitution into chains.
    pub fn to_expr(&self) -> Expr {
        match self {
            VarValue::Bool(b) => Expr::Bool(*b),
            VarValue::Int(i) => Expr::Int(*i),
            VarValue::Float(f) => Expr::Float(*f),
            VarValue::Duration(ns) => Expr::Duration(*ns),
            VarValue::Str(s) => Expr::Str(s.clone()),
            VarValue::Regex(r) => Expr::Regex(r.clone()),
            VarValue::Lambda(body) => Expr::Lambda(Box::new(body.clone())),
            VarValue::List(items) => Expr::List(items.iter().map(|v| v.to_expr()).collect()),
            VarValue::Star => Expr::Star,
        }
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Resolve the script's value vars against caller-supplied values.
///
/// Declared-only vars (`var field string`) must be supplied; vars with
/// defaults may be overridden; chain vars (`var x = stream|...`) are handled
/// by the compiler, never supplied. Supplied names that the script never
/// declares are rejected.
pub fn resolve_vars(
    program: &Program,
    provided: &BTreeMap<String, VarValue>,
) -> Result<BTreeMap<String, VarValue>> {
    let mut resolved = BTreeMap::new();
    let mut chain_vars: Vec<&str> = Vec::new();

    for stmt in &program.stmts {
        let Stmt::Var(decl) = stmt else { continue };
        match &decl.def {
            Some(VarDef::Chain(_)) => chain_vars.push(&decl.name),
            Some(VarDef::Expr(expr)) => {
                let default = VarValue::from_expr(expr)?;
                let value = match provided.get(&decl.name) {
                    Some(v) => {
                        check_type(decl, v)?;
                        if decl.ty.is_none() && std::mem::discriminant(v) != std::mem::discriminant(&default) {
                            bail!(
                                "invalid type for var \"{}\": expected {}, got {}",
                                decl.name,
                                default.type_name(),
                                v.type_name()
                            );
                        }
                        v.clone()
                    }
                    None => default,
                };
                resolved.insert(decl.name.clone(), value);
            }
            None => {
                let Some(ty) = decl.ty else {
                    bail!("var \"{}\" has neither a type nor a value", decl.name);
                };
                let Some(v) = provided.get(&decl.name) else {
                    bail!("missing value for var \"{}\"", decl.name);
                };
                if !v.matches(ty) {
                    bail!(
                        "invalid type for var \"{}\": expected {}, got {}",
                        decl.name,
                        ty.name(),
                        v.type_name()
                    );
                }
                if let VarValue::Regex(r) = v {
                    check_regex(r)?;
                }
                resolved.insert(decl.name.clone(), v.clone());
            }
        }
    }

    for name in provided.keys() {
        if !resolved.contains_key(name) && !chain_vars.contains(&name.as_str()) {
            bail!("unknown var \"{name}\"");
        }
    }

    Ok(resolved)
}

fn check_type(decl: &VarDecl, v: &VarValue) -> Result<()> {
    if let Some(ty) = decl.ty
        && !v.matches(ty)
    {
        bail!(
            "invalid type for var \"{}\": expected {}, got {}",
            decl.name,
            ty.name(),
            v.type_name()
        );
    }
    if let VarValue::Regex(r) = v {
        check_regex(r)?;
    }
    Ok(())
}

/// Regex vars are compiled at bind time so a bad pattern fails the task,
/// not the point that first hits it.
fn check_regex(pattern: &str) -> Result<()> {
    regex::Regex::new(pattern).map_err(|e| anyhow::anyhow!("invalid regex /{pattern}/: {e}"))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
