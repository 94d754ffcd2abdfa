//! Expression evaluation over typed ASTs.
//!
//! The evaluator walks the tree the typing pass produced: every node knows
//! its scalar type, so evaluation casts leaf values up to their widened
//! types once and operators always see matching variants. Stateful
//! functions do not evaluate their arguments here; they read the running
//! group state, indexed by call-site order (nesting of stateful functions
//! is rejected at typing time, so call sites number off linearly).

use crate::error::{Result, WeirError};
use crate::expr::{BinaryOp, Expr, ExprKind, TupleRef, UnaryOp};
use crate::schema::TupleSchema;
use crate::value::{ScalarType, Tuple, Value};
use std::cmp::Ordering;

/// Group-scoped context visible through `group.*` references.
#[derive(Debug, Clone, Default)]
pub struct GroupCtx {
    pub count: u64,
    pub first: Tuple,
    pub last: Tuple,
}

/// Values produced by the running stateful states, by call-site index.
pub trait StateReader {
    fn read(&self, site: usize) -> Result<Value>;
}

/// Everything an expression may look at.
pub struct EvalEnv<'a> {
    pub in_schema: &'a TupleSchema,
    pub out_schema: &'a TupleSchema,
    pub input: Option<&'a Tuple>,
    /// Output fields evaluated so far (SELECT sees earlier fields only)
    pub out: &'a [Value],
    pub previous: Option<&'a Tuple>,
    pub group: Option<&'a GroupCtx>,
    pub states: Option<&'a dyn StateReader>,
    /// Tuples received by this node so far (`in.#count`)
    pub in_count: u64,
    /// Values chosen for each generator site in this expansion pass
    pub split_values: &'a [Value],
}

impl<'a> EvalEnv<'a> {
    /// Minimal environment: an input tuple and its schema.
    pub fn for_input(in_schema: &'a TupleSchema, input: &'a Tuple, in_count: u64) -> Self {
        static EMPTY: &[Value] = &[];
        EvalEnv {
            in_schema,
            out_schema: in_schema,
            input: Some(input),
            out: EMPTY,
            previous: None,
            group: None,
            states: None,
            in_count,
            split_values: EMPTY,
        }
    }
}

/// Cursors threaded through one evaluation: call-site index for stateful
/// functions and generator sites.
#[derive(Debug, Default, Clone, Copy)]
pub struct EvalCursor {
    pub state_site: usize,
    pub split_site: usize,
}

fn result_type(e: &Expr) -> ScalarType {
    e.typ.scalar.unwrap_or(ScalarType::Any)
}

/// Move the cursor past every call site in a subtree without running it.
fn advance_past(cur: &mut EvalCursor, e: &Expr) {
    e.walk(&mut |sub| match sub.kind {
        ExprKind::Stateful(_, _) => cur.state_site += 1,
        ExprKind::Split(_, _) => cur.split_site += 1,
        _ => {}
    });
}

/// Cast a raw value up to the widened type its expression node carries.
fn adapt(v: Value, t: ScalarType) -> Result<Value> {
    v.cast_to(t)
        .ok_or_else(|| WeirError::fatal(format!("cannot cast {v} to {t}")))
}

/// Evaluate one expression.
pub fn eval(e: &Expr, env: &EvalEnv<'_>, cur: &mut EvalCursor) -> Result<Value> {
    let t = result_type(e);
    match &e.kind {
        // bare integer literals keep a wide payload; materialize them at
        // the width unification picked
        ExprKind::Const(Value::I128(n)) if t.is_int() => Value::int_of(t, *n)
            .ok_or_else(|| WeirError::fatal(format!("literal {n} does not fit {t}"))),
        ExprKind::Const(v) => adapt(v.clone(), t),
        ExprKind::Param(p) => Err(WeirError::fatal(format!("unbound parameter ${p}"))),
        ExprKind::Field(tuple, name) => {
            let v = field_value(*tuple, name, env)?;
            adapt(v, t)
        }
        ExprKind::Unary(op, a) => {
            let va = eval(a, env, cur)?;
            eval_unary(*op, va, t)
        }
        ExprKind::Binary(op, a, b) => {
            let va = eval(a, env, cur)?;
            // short-circuit before the right side runs its generators or
            // state reads? neither may appear under AND/OR per typing, so
            // plain evaluation order is fine
            let vb = eval(b, env, cur)?;
            eval_binary(*op, va, vb, t)
        }
        ExprKind::Case { clauses, else_ } => {
            // branches not taken still own their call-site numbers, so the
            // cursor always ends up past the whole CASE
            let mut end = *cur;
            for c in clauses {
                advance_past(&mut end, &c.cond);
                advance_past(&mut end, &c.then);
            }
            if let Some(el) = else_ {
                advance_past(&mut end, el);
            }
            let mut sub = *cur;
            let mut taken = None;
            for c in clauses {
                let cond = eval(&c.cond, env, &mut sub)?;
                if cond.as_bool() == Some(true) {
                    let v = eval(&c.then, env, &mut sub)?;
                    taken = Some(adapt(v, t)?);
                    break;
                }
                advance_past(&mut sub, &c.then);
            }
            let out = match taken {
                Some(v) => v,
                None => match else_ {
                    Some(el) => adapt(eval(el, env, &mut sub)?, t)?,
                    None => Value::Null(t),
                },
            };
            *cur = end;
            Ok(out)
        }
        ExprKind::Coalesce(args) => {
            let mut end = *cur;
            for a in args {
                advance_past(&mut end, a);
            }
            let mut sub = *cur;
            let mut found = None;
            for a in args {
                let v = eval(a, env, &mut sub)?;
                if !v.is_null() {
                    found = Some(adapt(v, t)?);
                    break;
                }
            }
            *cur = end;
            Ok(found.unwrap_or(Value::Null(t)))
        }
        ExprKind::Split(_, _) => {
            let site = cur.split_site;
            cur.split_site += 1;
            env.split_values
                .get(site)
                .cloned()
                .ok_or_else(|| WeirError::fatal("generator site without a chosen value"))
        }
        ExprKind::Stateful(_, _) => {
            let site = cur.state_site;
            cur.state_site += 1;
            let states = env
                .states
                .ok_or_else(|| WeirError::fatal("stateful function outside a group context"))?;
            adapt(states.read(site)?, t)
        }
    }
}

fn field_value(tuple: TupleRef, name: &str, env: &EvalEnv<'_>) -> Result<Value> {
    if name == "#count" {
        let n = match tuple {
            TupleRef::In => env.in_count,
            TupleRef::Group => env.group.map_or(0, |g| g.count),
            _ => {
                return Err(WeirError::fatal(format!(
                    "virtual #count on tuple '{tuple}'"
                )))
            }
        };
        return Ok(Value::U64(n));
    }
    match tuple {
        TupleRef::In => {
            let rank = env
                .in_schema
                .rank(name)
                .ok_or_else(|| WeirError::fatal(format!("no input field '{name}'")))?;
            let input = env
                .input
                .ok_or_else(|| WeirError::fatal("no input tuple in this clause"))?;
            Ok(input[rank].clone())
        }
        TupleRef::GroupFirst | TupleRef::GroupLast => {
            let rank = env
                .in_schema
                .rank(name)
                .ok_or_else(|| WeirError::fatal(format!("no input field '{name}'")))?;
            let g = env
                .group
                .ok_or_else(|| WeirError::fatal("no group in this clause"))?;
            let t = if tuple == TupleRef::GroupFirst {
                &g.first
            } else {
                &g.last
            };
            Ok(t[rank].clone())
        }
        TupleRef::Out => {
            let rank = env
                .out_schema
                .rank(name)
                .ok_or_else(|| WeirError::fatal(format!("no output field '{name}'")))?;
            env.out.get(rank).cloned().ok_or_else(|| {
                WeirError::fatal(format!("output field '{name}' not evaluated yet"))
            })
        }
        TupleRef::Previous => {
            let rank = env
                .out_schema
                .rank(name)
                .ok_or_else(|| WeirError::fatal(format!("no output field '{name}'")))?;
            match env.previous {
                Some(prev) => Ok(prev[rank].clone()),
                // before the first OUT exists, previous reads as the OUT
                // tuple being built, NULL for fields not evaluated yet
                None => Ok(env.out.get(rank).cloned().unwrap_or_else(|| {
                    let t = env
                        .out_schema
                        .get(name)
                        .and_then(|f| f.scalar)
                        .unwrap_or(ScalarType::Any);
                    Value::Null(t)
                })),
            }
        }
        TupleRef::Group | TupleRef::Unqualified => Err(WeirError::fatal(format!(
            "unresolved reference {tuple}.{name}"
        ))),
    }
}

fn eval_unary(op: UnaryOp, v: Value, t: ScalarType) -> Result<Value> {
    if v.is_null() {
        return Ok(match op {
            UnaryOp::Defined => Value::Bool(false),
            _ => Value::Null(t),
        });
    }
    let out = match op {
        UnaryOp::Not => Value::Bool(!truthy(&v)),
        UnaryOp::Defined => Value::Bool(true),
        UnaryOp::Neg => match v {
            Value::Float(f) => Value::Float(-f),
            other => {
                let n = other
                    .as_i128()
                    .ok_or_else(|| WeirError::fatal("negating a non-number"))?;
                Value::int_of(t, -n).ok_or_else(|| WeirError::fatal("negation overflow"))?
            }
        },
        UnaryOp::Abs => match v {
            Value::Float(f) => Value::Float(f.abs()),
            other => {
                let n = other
                    .as_i128()
                    .ok_or_else(|| WeirError::fatal("abs of a non-number"))?;
                Value::int_of(t, n.abs()).ok_or_else(|| WeirError::fatal("abs overflow"))?
            }
        },
        UnaryOp::Length => match v {
            Value::Str(s) => Value::U32(s.len() as u32),
            _ => return Err(WeirError::fatal("LENGTH of a non-string")),
        },
        UnaryOp::Lower => match v {
            Value::Str(s) => Value::Str(s.to_lowercase()),
            _ => return Err(WeirError::fatal("LOWER of a non-string")),
        },
        UnaryOp::Upper => match v {
            Value::Str(s) => Value::Str(s.to_uppercase()),
            _ => return Err(WeirError::fatal("UPPER of a non-string")),
        },
    };
    Ok(out)
}

fn truthy(v: &Value) -> bool {
    v.as_bool() == Some(true)
}

/// Compare two values of the same scalar type.
pub fn cmp_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y),
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Ip4(x), Value::Ip4(y)) => Some(x.cmp(y)),
        (Value::Ip6(x), Value::Ip6(y)) => Some(x.cmp(y)),
        (Value::U128(x), Value::U128(y)) => Some(x.cmp(y)),
        _ => match (a.as_i128(), b.as_i128()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => None,
            },
        },
    }
}

pub fn eval_binary(op: BinaryOp, a: Value, b: Value, t: ScalarType) -> Result<Value> {
    if a.is_null() || b.is_null() {
        return Ok(Value::Null(t));
    }
    if op.is_comparison() {
        let ord = cmp_values(&a, &b)
            .ok_or_else(|| WeirError::fatal(format!("cannot compare {a} with {b}")))?;
        let res = match op {
            BinaryOp::Eq => ord == Ordering::Equal,
            BinaryOp::Ne => ord != Ordering::Equal,
            BinaryOp::Lt => ord == Ordering::Less,
            BinaryOp::Le => ord != Ordering::Greater,
            BinaryOp::Gt => ord == Ordering::Greater,
            BinaryOp::Ge => ord != Ordering::Less,
            _ => unreachable!("checked is_comparison"),
        };
        return Ok(Value::Bool(res));
    }
    if op.is_boolean() {
        let (x, y) = (truthy(&a), truthy(&b));
        return Ok(Value::Bool(match op {
            BinaryOp::And => x && y,
            BinaryOp::Or => x || y,
            _ => unreachable!("checked is_boolean"),
        }));
    }
    arith(op, a, b, t)
}

/// Arithmetic on two same-typed operands.
pub fn arith(op: BinaryOp, a: Value, b: Value, t: ScalarType) -> Result<Value> {
    // string concatenation rides on '+'
    if let (BinaryOp::Add, Value::Str(x), Value::Str(y)) = (op, &a, &b) {
        return Ok(Value::Str(format!("{x}{y}")));
    }
    if t == ScalarType::Float || matches!(a, Value::Float(_)) || matches!(b, Value::Float(_)) {
        let x = a
            .as_f64()
            .ok_or_else(|| WeirError::fatal(format!("arithmetic on {a}")))?;
        let y = b
            .as_f64()
            .ok_or_else(|| WeirError::fatal(format!("arithmetic on {b}")))?;
        let r = match op {
            BinaryOp::Add => x + y,
            BinaryOp::Sub => x - y,
            BinaryOp::Mul => x * y,
            BinaryOp::Div => x / y,
            BinaryOp::IDiv => (x / y).floor(),
            BinaryOp::Mod => x % y,
            _ => return Err(WeirError::fatal("not an arithmetic operator")),
        };
        return Ok(Value::Float(r));
    }
    let x = a
        .as_i128()
        .ok_or_else(|| WeirError::fatal(format!("arithmetic on {a}")))?;
    let y = b
        .as_i128()
        .ok_or_else(|| WeirError::fatal(format!("arithmetic on {b}")))?;
    if matches!(op, BinaryOp::Div) {
        if y == 0 {
            return Ok(Value::Float(f64::NAN));
        }
        return Ok(Value::Float(x as f64 / y as f64));
    }
    if matches!(op, BinaryOp::IDiv | BinaryOp::Mod) && y == 0 {
        return Err(WeirError::fatal("integer division by zero"));
    }
    let r = match op {
        BinaryOp::Add => x.checked_add(y),
        BinaryOp::Sub => x.checked_sub(y),
        BinaryOp::Mul => x.checked_mul(y),
        BinaryOp::IDiv => Some(x.div_euclid(y)),
        BinaryOp::Mod => Some(x.rem_euclid(y)),
        _ => return Err(WeirError::fatal("not an arithmetic operator")),
    }
    .ok_or_else(|| WeirError::fatal("integer overflow"))?;
    Value::int_of(t, r).ok_or_else(|| {
        WeirError::fatal(format!("arithmetic result {r} does not fit {t}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ExprType;

    fn in_schema() -> TupleSchema {
        let mut s = TupleSchema::new();
        s.push("time", ExprType::typed("time", ScalarType::Float, false))
            .expect("push");
        s.push("word", ExprType::typed("word", ScalarType::Str, false))
            .expect("push");
        s.set_finished();
        s
    }

    fn typed_expr(src: &str, schema: &TupleSchema) -> Expr {
        use crate::typing::{infer, ParentSrc, TypeNode};
        let op = crate::parser::parse_operation(&format!("SELECT {src} AS r FROM p COMMIT WHEN true"))
            .expect("parse");
        let mut node = TypeNode::new("t/n", op);
        node.parents.push(ParentSrc::External(schema.clone()));
        let mut nodes = vec![node];
        infer(&mut nodes).expect("types");
        match nodes.pop().map(|n| n.op) {
            Some(crate::expr::Operation::Aggregate(agg)) => {
                agg.fields.into_iter().next().expect("field").expr
            }
            _ => panic!("expected aggregate"),
        }
    }

    #[test]
    fn arithmetic_follows_widened_types() {
        let s = in_schema();
        let e = typed_expr("time // 30.0", &s);
        let input = vec![Value::Float(95.0), Value::Str("x".into())];
        let env = EvalEnv::for_input(&s, &input, 1);
        let v = eval(&e, &env, &mut EvalCursor::default()).expect("eval");
        assert_eq!(v, Value::Float(3.0));
    }

    #[test]
    fn case_without_match_yields_null() {
        let s = in_schema();
        let e = typed_expr("IF word = \"hit\" THEN 1.0", &s);
        let input = vec![Value::Float(0.0), Value::Str("miss".into())];
        let env = EvalEnv::for_input(&s, &input, 1);
        let v = eval(&e, &env, &mut EvalCursor::default()).expect("eval");
        assert!(v.is_null());
    }

    #[test]
    fn coalesce_picks_first_defined() {
        let s = in_schema();
        let e = typed_expr("COALESCE(IF word = \"x\" THEN 1.0, 2.0)", &s);
        let input = vec![Value::Float(0.0), Value::Str("y".into())];
        let env = EvalEnv::for_input(&s, &input, 1);
        let v = eval(&e, &env, &mut EvalCursor::default()).expect("eval");
        assert_eq!(v, Value::Float(2.0));
    }

    #[test]
    fn null_propagates_through_arithmetic() {
        let v = eval_binary(
            BinaryOp::Add,
            Value::Null(ScalarType::U32),
            Value::U32(3),
            ScalarType::U32,
        )
        .expect("eval");
        assert!(v.is_null());
    }

    #[test]
    fn defined_is_never_null() {
        let v = eval_unary(UnaryOp::Defined, Value::Null(ScalarType::Str), ScalarType::Bool)
            .expect("eval");
        assert_eq!(v, Value::Bool(false));
    }

    #[test]
    fn string_concat_on_plus() {
        let v = arith(
            BinaryOp::Add,
            Value::Str("foo".into()),
            Value::Str("bar".into()),
            ScalarType::Str,
        )
        .expect("eval");
        assert_eq!(v, Value::Str("foobar".into()));
    }
}
