use std::collections::{BTreeMap, HashMap};

use anyhow::{Result, bail};
use regex::Regex;
use tick_lang::ast::{BinOp, Expr, UnaryOp};

use crate::point::{FieldValue, Point};

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// Result of evaluating an expression against a point.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Nanoseconds.
    Duration(i64),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Duration(_) => "duration",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Duration(d) => Some(*d as f64),
            _ => None,
        }
    }

    pub fn into_field(self) -> FieldValue {
        match self {
            Value::Bool(b) => FieldValue::Bool(b),
            Value::Int(i) => FieldValue::Int(i),
            Value::Float(f) => FieldValue::Float(f),
            Value::Str(s) => FieldValue::Str(s),
            Value::Duration(d) => FieldValue::Int(d),
        }
    }
}

impl From<&FieldValue> for Value {
    fn from(f: &FieldValue) -> Value {
        match f {
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::Int(i) => Value::Int(*i),
            FieldValue::Float(v) => Value::Float(*v),
            FieldValue::Str(s) => Value::Str(s.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Scopes
// ---------------------------------------------------------------------------

/// Name resolution for `"field"` references: fields first, then tags.
pub trait Scope {
    fn lookup(&self, name: &str) -> Option<Value>;
}

impl Scope for Point {
    fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(f) = self.fields.get(name) {
            return Some(f.into());
        }
        self.tags.get(name).map(|t| Value::Str(t.clone()))
    }
}

/// A scope with extra fields layered over a base, used by `eval` so each
/// lambda sees the results of the ones before it.
pub struct Overlay<'a> {
    pub base: &'a dyn Scope,
    pub extra: &'a BTreeMap<String, FieldValue>,
}

impl Scope for Overlay<'_> {
    fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(f) = self.extra.get(name) {
            return Some(f.into());
        }
        self.base.lookup(name)
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

/// Expression walker with a per-node regex cache. Construct one per node
/// and reuse it for every point.
#[derive(Default)]
pub struct Evaluator {
    regexes: HashMap<String, Regex>,
}

impl Evaluator {
    pub fn eval_bool(&mut self, expr: &Expr, scope: &dyn Scope) -> Result<bool> {
        match self.eval(expr, scope)? {
            Value::Bool(b) => Ok(b),
            other => bail!("expression must yield a bool, got {}", other.type_name()),
        }
    }

    pub fn eval(&mut self, expr: &Expr, scope: &dyn Scope) -> Result<Value> {
        Ok(match expr {
            Expr::Int(i) => Value::Int(*i),
            Expr::Float(f) => Value::Float(*f),
            Expr::Bool(b) => Value::Bool(*b),
            Expr::Str(s) => Value::Str(s.clone()),
            Expr::Duration(ns) => Value::Duration(*ns),
            Expr::Field(name) => scope
                .lookup(name)
                .ok_or_else(|| anyhow::anyhow!("unknown field or tag \"{name}\""))?,
            Expr::Lambda(body) => self.eval(body, scope)?,
            // Script vars are substituted at compile time; a var surviving
            // to evaluation is a bare scope reference (handler match
            // lambdas use them for event fields).
            Expr::Var(name) => scope
                .lookup(name)
                .ok_or_else(|| anyhow::anyhow!("unbound variable \"{name}\""))?,
            Expr::Regex(_) => bail!("regex literal is only valid on the right of =~ or !~"),
            Expr::Star => bail!("* is not valid in an expression"),
            Expr::List(_) => bail!("list is not valid in an expression"),
            Expr::Unary { op, expr } => {
                let v = self.eval(expr, scope)?;
                match (op, v) {
                    (UnaryOp::Not, Value::Bool(b)) => Value::Bool(!b),
                    (UnaryOp::Neg, Value::Int(i)) => Value::Int(-i),
                    (UnaryOp::Neg, Value::Float(f)) => Value::Float(-f),
                    (UnaryOp::Neg, Value::Duration(d)) => Value::Duration(-d),
                    (op, v) => bail!("cannot apply {op:?} to {}", v.type_name()),
                }
            }
            Expr::Binary { op, left, right } => return self.eval_binary(*op, left, right, scope),
            Expr::Call { name, args } => return self.eval_call(name, args, scope),
            other => bail!("unsupported expression {other:?}"),
        })
    }

    fn eval_binary(
        &mut self,
        op: BinOp,
        left: &Expr,
        right: &Expr,
        scope: &dyn Scope,
    ) -> Result<Value> {
        // Short-circuit logic before evaluating the right side.
        match op {
            BinOp::And | BinOp::Or => {
                let l = self.eval_bool(left, scope)?;
                return Ok(Value::Bool(match op {
                    BinOp::And => l && self.eval_bool(right, scope)?,
                    _ => l || self.eval_bool(right, scope)?,
                }));
            }
            BinOp::Match | BinOp::NotMatch => {
                let l = match self.eval(left, scope)? {
                    Value::Str(s) => s,
                    other => bail!("=~ expects a string, got {}", other.type_name()),
                };
                let pattern = match right {
                    Expr::Regex(src) => src.clone(),
                    Expr::Str(s) => s.clone(),
                    other => bail!("=~ expects a regex on the right, got {other:?}"),
                };
                let re = self.regex(&pattern)?;
                let matched = re.is_match(&l);
                return Ok(Value::Bool(if op == BinOp::Match {
                    matched
                } else {
                    !matched
                }));
            }
            _ => {}
        }

        let l = self.eval(left, scope)?;
        let r = self.eval(right, scope)?;

        match op {
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                compare(op, &l, &r)
            }
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => arith(op, l, r),
            _ => unreachable!("logic ops handled above"),
        }
    }

    fn eval_call(&mut self, name: &str, args: &[Expr], scope: &dyn Scope) -> Result<Value> {
        // isPresent inspects the scope rather than evaluating its argument.
        if name == "isPresent" {
            let field = match args {
                [Expr::Field(f)] | [Expr::Str(f)] => f,
                _ => bail!("isPresent expects a field reference"),
            };
            return Ok(Value::Bool(scope.lookup(field).is_some()));
        }

        let vals: Vec<Value> = args
            .iter()
            .map(|a| self.eval(a, scope))
            .collect::<Result<_>>()?;

        let float1 = |vals: &[Value]| -> Result<f64> {
            match vals {
                [v] => v
                    .as_f64()
                    .ok_or_else(|| anyhow::anyhow!("{name} expects a numeric argument")),
                _ => bail!("{name} expects one argument"),
            }
        };

        Ok(match name {
            "abs" => match &vals[..] {
                [Value::Int(i)] => Value::Int(i.abs()),
                _ => Value::Float(float1(&vals)?.abs()),
            },
            "ceil" => Value::Float(float1(&vals)?.ceil()),
            "floor" => Value::Float(float1(&vals)?.floor()),
            "round" => Value::Float(float1(&vals)?.round()),
            "sqrt" => Value::Float(float1(&vals)?.sqrt()),
            "exp" => Value::Float(float1(&vals)?.exp()),
            "log" => Value::Float(float1(&vals)?.ln()),
            "log10" => Value::Float(float1(&vals)?.log10()),
            "int" => match &vals[..] {
                [Value::Int(i)] => Value::Int(*i),
                [Value::Float(f)] => Value::Int(*f as i64),
                [Value::Duration(d)] => Value::Int(*d),
                _ => bail!("int expects a numeric argument"),
            },
            "float" => Value::Float(float1(&vals)?),
            "string" => match &vals[..] {
                [v] => Value::Str(match v {
                    Value::Str(s) => s.clone(),
                    Value::Bool(b) => b.to_string(),
                    Value::Int(i) => i.to_string(),
                    Value::Float(f) => f.to_string(),
                    Value::Duration(d) => d.to_string(),
                }),
                _ => bail!("string expects one argument"),
            },
            "strContains" => match &vals[..] {
                [Value::Str(s), Value::Str(sub)] => Value::Bool(s.contains(sub.as_str())),
                _ => bail!("strContains expects two string arguments"),
            },
            "strLength" => match &vals[..] {
                [Value::Str(s)] => Value::Int(s.chars().count() as i64),
                _ => bail!("strLength expects a string argument"),
            },
            "strToLower" => match &vals[..] {
                [Value::Str(s)] => Value::Str(s.to_lowercase()),
                _ => bail!("strToLower expects a string argument"),
            },
            "strToUpper" => match &vals[..] {
                [Value::Str(s)] => Value::Str(s.to_uppercase()),
                _ => bail!("strToUpper expects a string argument"),
            },
            other => bail!("unknown function \"{other}\""),
        })
    }

    fn regex(&mut self, pattern: &str) -> Result<&Regex> {
        if !self.regexes.contains_key(pattern) {
            let re = Regex::new(pattern)
                .map_err(|e| anyhow::anyhow!("invalid regex /{pattern}/: {e}"))?;
            self.regexes.insert(pattern.to_string(), re);
        }
        Ok(&self.regexes[pattern])
    }
}

// ---------------------------------------------------------------------------
// Comparison & arithmetic
// ---------------------------------------------------------------------------

/// IEEE 754 comparisons: any ordered comparison involving NaN is false.
fn compare(op: BinOp, l: &Value, r: &Value) -> Result<Value> {
    use std::cmp::Ordering;

    let ord: Option<Ordering> = match (l, r) {
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => match op {
            BinOp::Eq | BinOp::Ne => Some(a.cmp(b)),
            _ => bail!("cannot order booleans"),
        },
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::Duration(a), Value::Duration(b)) => Some(a.cmp(b)),
        (Value::Duration(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::Int(a), Value::Duration(b)) => Some(a.cmp(b)),
        _ => {
            let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) else {
                bail!("cannot compare {} with {}", l.type_name(), r.type_name());
            };
            a.partial_cmp(&b)
        }
    };

    let res = match (op, ord) {
        // NaN: Eq is false, Ne is true, ordered comparisons are false.
        (BinOp::Eq, Some(Ordering::Equal)) => true,
        (BinOp::Eq, _) => false,
        (BinOp::Ne, Some(Ordering::Equal)) => false,
        (BinOp::Ne, _) => true,
        (_, None) => false,
        (BinOp::Lt, Some(o)) => o == Ordering::Less,
        (BinOp::Le, Some(o)) => o != Ordering::Greater,
        (BinOp::Gt, Some(o)) => o == Ordering::Greater,
        (BinOp::Ge, Some(o)) => o != Ordering::Less,
        _ => unreachable!(),
    };
    Ok(Value::Bool(res))
}

fn arith(op: BinOp, l: Value, r: Value) -> Result<Value> {
    // String concatenation.
    if let (BinOp::Add, Value::Str(a), Value::Str(b)) = (op, &l, &r) {
        return Ok(Value::Str(format!("{a}{b}")));
    }

    match (&l, &r) {
        (Value::Int(a), Value::Int(b)) => {
            let v = match op {
                BinOp::Add => a.wrapping_add(*b),
                BinOp::Sub => a.wrapping_sub(*b),
                BinOp::Mul => a.wrapping_mul(*b),
                BinOp::Div => {
                    if *b == 0 {
                        bail!("integer division by zero");
                    }
                    a / b
                }
                BinOp::Mod => {
                    if *b == 0 {
                        bail!("integer modulo by zero");
                    }
                    a % b
                }
                _ => unreachable!(),
            };
            Ok(Value::Int(v))
        }
        (Value::Duration(a), Value::Duration(b)) => match op {
            BinOp::Add => Ok(Value::Duration(a + b)),
            BinOp::Sub => Ok(Value::Duration(a - b)),
            BinOp::Div => {
                if *b == 0 {
                    bail!("duration division by zero");
                }
                Ok(Value::Int(a / b))
            }
            _ => bail!("cannot {op:?} two durations"),
        },
        (Value::Duration(d), Value::Int(n)) | (Value::Int(n), Value::Duration(d)) => match op {
            BinOp::Mul => Ok(Value::Duration(d * n)),
            BinOp::Div if matches!(l, Value::Duration(_)) => {
                if *n == 0 {
                    bail!("duration division by zero");
                }
                Ok(Value::Duration(d / n))
            }
            _ => bail!("cannot {op:?} duration and int"),
        },
        _ => {
            // Float arithmetic; NaN propagates.
            let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) else {
                bail!(
                    "cannot apply arithmetic to {} and {}",
                    l.type_name(),
                    r.type_name()
                );
            };
            let v = match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => a / b,
                BinOp::Mod => a % b,
                _ => unreachable!(),
            };
            Ok(Value::Float(v))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tick_lang::parser::parse_program;
    use tick_lang::ast::{Stmt, VarDef};

    fn lambda(src: &str) -> Expr {
        let p = parse_program(&format!("var f = lambda: {src}")).unwrap();
        let Stmt::Var(decl) = &p.stmts[0] else { panic!() };
        let Some(VarDef::Expr(Expr::Lambda(body))) = &decl.def else {
            panic!("not a lambda: {decl:?}")
        };
        (**body).clone()
    }

    fn sample() -> Point {
        let mut p = Point::new(Utc.timestamp_opt(0, 0).unwrap(), "cpu");
        p.fields.insert("value".into(), FieldValue::Float(3.5));
        p.fields.insert("count".into(), FieldValue::Int(7));
        p.fields.insert("nan".into(), FieldValue::Float(f64::NAN));
        p.tags.insert("host".into(), "web01".into());
        p
    }

    fn eval(src: &str) -> Value {
        Evaluator::default().eval(&lambda(src), &sample()).unwrap()
    }

    #[test]
    fn field_and_tag_lookup() {
        assert_eq!(eval("\"value\""), Value::Float(3.5));
        assert_eq!(eval("\"host\""), Value::Str("web01".into()));
    }

    #[test]
    fn comparison_promotes_int_to_float() {
        assert_eq!(eval("\"count\" > 6.5"), Value::Bool(true));
        assert_eq!(eval("\"value\" == 3.5"), Value::Bool(true));
    }

    #[test]
    fn nan_comparisons_are_false() {
        assert_eq!(eval("\"nan\" > 0.0"), Value::Bool(false));
        assert_eq!(eval("\"nan\" < 0.0"), Value::Bool(false));
        assert_eq!(eval("\"nan\" == \"nan\""), Value::Bool(false));
        assert_eq!(eval("\"nan\" != 0.0"), Value::Bool(true));
    }

    #[test]
    fn nan_propagates_through_arithmetic() {
        let Value::Float(v) = eval("\"nan\" + 1.0") else {
            panic!()
        };
        assert!(v.is_nan());
    }

    #[test]
    fn logic_short_circuits() {
        // The right side would error (unknown field) if evaluated.
        assert_eq!(eval("FALSE AND \"missing\" > 1"), Value::Bool(false));
        assert_eq!(eval("TRUE OR \"missing\" > 1"), Value::Bool(true));
    }

    #[test]
    fn regex_match() {
        assert_eq!(eval("\"host\" =~ /^web\\d+$/"), Value::Bool(true));
        assert_eq!(eval("\"host\" !~ /^db/"), Value::Bool(true));
    }

    #[test]
    fn duration_arithmetic() {
        assert_eq!(eval("10s + 5s"), Value::Duration(15_000_000_000));
        assert_eq!(eval("10s * 2"), Value::Duration(20_000_000_000));
        assert_eq!(eval("10s > 5s"), Value::Bool(true));
    }

    #[test]
    fn int_division_truncates() {
        assert_eq!(eval("7 / 2"), Value::Int(3));
    }

    #[test]
    fn string_concat() {
        assert_eq!(eval("'a' + 'b'"), Value::Str("ab".into()));
    }

    #[test]
    fn functions() {
        assert_eq!(eval("abs(-3)"), Value::Int(3));
        assert_eq!(eval("floor(\"value\")"), Value::Float(3.0));
        assert_eq!(eval("strContains(\"host\", 'web')"), Value::Bool(true));
        assert_eq!(eval("isPresent(\"value\")"), Value::Bool(true));
        assert_eq!(eval("isPresent(\"missing\")"), Value::Bool(false));
    }

    #[test]
    fn missing_field_errors() {
        let err = Evaluator::default()
            .eval(&lambda("\"missing\" > 1"), &sample())
            .unwrap_err();
        assert!(err.to_string().contains("unknown field or tag"), "{err}");
    }

    #[test]
    fn overlay_scope_prefers_extra() {
        let base = sample();
        let mut extra = BTreeMap::new();
        extra.insert("value".to_string(), FieldValue::Int(99));
        let scope = Overlay {
            base: &base,
            extra: &extra,
        };
        let v = Evaluator::default()
            .eval(&lambda("\"value\""), &scope)
            .unwrap();
        assert_eq!(v, Value::Int(99));
    }
}
