//! Expression and operation ASTs.
//!
//! Every expression node carries its own [`ExprType`], mutated in place by
//! the inference engine. The `Display` impls print the canonical form: it is
//! re-parseable (parse, print, parse is the identity on ASTs) and is what the
//! node signature hashes.

use crate::schema::ExprType;
use crate::value::{ScalarType, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which tuple a field reference reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TupleRef {
    /// The arriving tuple
    In,
    /// The tentative output tuple being built by SELECT
    Out,
    /// The tuple last emitted for this group
    Previous,
    /// Aggregation state virtuals (`group.#count`)
    Group,
    /// First input tuple folded into this group
    GroupFirst,
    /// Last input tuple folded into this group
    GroupLast,
    /// Not yet qualified; inference pins it to `in` (or `out` when only the
    /// output schema has the field)
    Unqualified,
}

impl fmt::Display for TupleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TupleRef::In => "in",
            TupleRef::Out => "out",
            TupleRef::Previous => "previous",
            TupleRef::Group => "group",
            TupleRef::GroupFirst => "group.first",
            TupleRef::GroupLast => "group.last",
            TupleRef::Unqualified => "",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Neg,
    /// True when the operand is not NULL; never nullable itself
    Defined,
    Abs,
    Length,
    Lower,
    Upper,
}

impl UnaryOp {
    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Not => "NOT",
            UnaryOp::Neg => "-",
            UnaryOp::Defined => "DEFINED",
            UnaryOp::Abs => "ABS",
            UnaryOp::Length => "LENGTH",
            UnaryOp::Lower => "LOWER",
            UnaryOp::Upper => "UPPER",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    /// Float division
    Div,
    /// Integer division
    IDiv,
    Mod,
    And,
    Or,
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::IDiv => "//",
            BinaryOp::Mod => "%",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Gt | BinaryOp::Ge | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Eq | BinaryOp::Ne
        )
    }

    pub fn is_boolean(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }

    pub fn is_arithmetic(self) -> bool {
        !self.is_comparison() && !self.is_boolean()
    }
}

/// Stateful functions: aggregates and windowed estimators. State lives in the
/// group, updated once per input tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatefulFn {
    Min,
    Max,
    Sum,
    Avg,
    /// Boolean conjunction over the group
    AndAll,
    /// Boolean disjunction over the group
    OrAll,
    First,
    Last,
    /// `PERCENTILE(p, e)`, p constant in [0, 1]
    Percentile,
    /// `LAG(k, e)`, k constant
    Lag,
    /// `MOVING_AVG(n, e)`, n constant
    MovingAvg,
    /// `SMOOTH(alpha, e)`: exponential smoothing, alpha constant
    Smooth,
    /// `FIT_LIN(y, x)`: linear-regression estimate of y at the latest x
    FitLin,
    /// `REMEMBER(time, duration, e)`: novelty filter probe, duration constant
    Remember,
}

impl StatefulFn {
    pub fn name(self) -> &'static str {
        match self {
            StatefulFn::Min => "MIN",
            StatefulFn::Max => "MAX",
            StatefulFn::Sum => "SUM",
            StatefulFn::Avg => "AVG",
            StatefulFn::AndAll => "AND",
            StatefulFn::OrAll => "OR",
            StatefulFn::First => "FIRST",
            StatefulFn::Last => "LAST",
            StatefulFn::Percentile => "PERCENTILE",
            StatefulFn::Lag => "LAG",
            StatefulFn::MovingAvg => "MOVING_AVG",
            StatefulFn::Smooth => "SMOOTH",
            StatefulFn::FitLin => "FIT_LIN",
            StatefulFn::Remember => "REMEMBER",
        }
    }

    /// Expected argument count.
    pub fn arity(self) -> usize {
        match self {
            StatefulFn::Min
            | StatefulFn::Max
            | StatefulFn::Sum
            | StatefulFn::Avg
            | StatefulFn::AndAll
            | StatefulFn::OrAll
            | StatefulFn::First
            | StatefulFn::Last => 1,
            StatefulFn::Percentile
            | StatefulFn::Lag
            | StatefulFn::MovingAvg
            | StatefulFn::Smooth
            | StatefulFn::FitLin => 2,
            StatefulFn::Remember => 3,
        }
    }

    /// Indexes of arguments that must be compile-time constants.
    pub fn constant_args(self) -> &'static [usize] {
        match self {
            StatefulFn::Percentile | StatefulFn::Lag | StatefulFn::MovingAvg | StatefulFn::Smooth => {
                &[0]
            }
            StatefulFn::Remember => &[1],
            _ => &[],
        }
    }
}

/// One CASE clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseClause {
    pub cond: Expr,
    pub then: Expr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExprKind {
    Const(Value),
    Field(TupleRef, String),
    /// Parametric hole, bound at layer creation (`$name`)
    Param(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Case {
        clauses: Vec<CaseClause>,
        else_: Option<Box<Expr>>,
    },
    Coalesce(Vec<Expr>),
    /// Generator: `SPLIT(sep, e)` yields one value per separated chunk
    Split(Box<Expr>, Box<Expr>),
    Stateful(StatefulFn, Vec<Expr>),
}

/// An expression node together with its typing record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    pub typ: ExprType,
    pub kind: ExprKind,
}

impl Expr {
    pub fn new(kind: ExprKind) -> Self {
        let name = match &kind {
            ExprKind::Const(v) => format!("constant {v}"),
            ExprKind::Field(t, n) => match t {
                TupleRef::Unqualified => format!("field {n}"),
                _ => format!("field {t}.{n}"),
            },
            ExprKind::Param(n) => format!("parameter ${n}"),
            ExprKind::Unary(op, _) => format!("operator {}", op.name()),
            ExprKind::Binary(op, _, _) => format!("operator {}", op.symbol()),
            ExprKind::Case { .. } => "CASE".to_string(),
            ExprKind::Coalesce(_) => "COALESCE".to_string(),
            ExprKind::Split(_, _) => "SPLIT".to_string(),
            ExprKind::Stateful(f, _) => format!("aggregate {}", f.name()),
        };
        // Typed constants arrive with their scalar already pinned; bare
        // integer literals stay open so unification can pick their width.
        let typ = match &kind {
            ExprKind::Const(v) if v.type_of() != ScalarType::Num => {
                ExprType::with_hints(name, Some(v.type_of()), Some(v.is_null()))
            }
            _ => ExprType::unknown(name),
        };
        Expr { typ, kind }
    }

    pub fn constant(v: Value) -> Self {
        Expr::new(ExprKind::Const(v))
    }

    /// Bare integer literal: payload kept wide, type left for unification.
    pub fn int_literal(v: i128) -> Self {
        let mut e = Expr::new(ExprKind::Const(Value::I128(v)));
        e.typ = ExprType::with_hints(format!("constant {v}"), None, Some(false));
        e
    }

    pub fn field(tuple: TupleRef, name: impl Into<String>) -> Self {
        Expr::new(ExprKind::Field(tuple, name.into()))
    }

    pub fn bool_const(b: bool) -> Self {
        Expr::constant(Value::Bool(b))
    }

    /// Is this a bare integer literal whose width is still open?
    pub fn is_untyped_int(&self) -> bool {
        matches!(self.kind, ExprKind::Const(Value::I128(_))) && self.typ.scalar.is_none()
    }

    /// The constant payload, if this is a constant.
    pub fn const_value(&self) -> Option<&Value> {
        match &self.kind {
            ExprKind::Const(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_const(&self) -> bool {
        self.const_value().is_some()
    }

    /// Immediate sub-expressions, in evaluation order.
    pub fn children(&self) -> Vec<&Expr> {
        match &self.kind {
            ExprKind::Const(_) | ExprKind::Field(_, _) | ExprKind::Param(_) => vec![],
            ExprKind::Unary(_, e) => vec![e],
            ExprKind::Binary(_, a, b) => vec![a, b],
            ExprKind::Case { clauses, else_ } => {
                let mut v: Vec<&Expr> = Vec::new();
                for c in clauses {
                    v.push(&c.cond);
                    v.push(&c.then);
                }
                if let Some(e) = else_ {
                    v.push(e);
                }
                v
            }
            ExprKind::Coalesce(es) => es.iter().collect(),
            ExprKind::Split(a, b) => vec![a, b],
            ExprKind::Stateful(_, args) => args.iter().collect(),
        }
    }

    pub fn children_mut(&mut self) -> Vec<&mut Expr> {
        match &mut self.kind {
            ExprKind::Const(_) | ExprKind::Field(_, _) | ExprKind::Param(_) => vec![],
            ExprKind::Unary(_, e) => vec![e.as_mut()],
            ExprKind::Binary(_, a, b) => vec![a.as_mut(), b.as_mut()],
            ExprKind::Case { clauses, else_ } => {
                let mut v: Vec<&mut Expr> = Vec::new();
                for c in clauses.iter_mut() {
                    v.push(&mut c.cond);
                    v.push(&mut c.then);
                }
                if let Some(e) = else_ {
                    v.push(e.as_mut());
                }
                v
            }
            ExprKind::Coalesce(es) => es.iter_mut().collect(),
            ExprKind::Split(a, b) => vec![a.as_mut(), b.as_mut()],
            ExprKind::Stateful(_, args) => args.iter_mut().collect(),
        }
    }

    /// Depth-first walk over this expression and all descendants.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a Expr)) {
        visit(self);
        for c in self.children() {
            c.walk(visit);
        }
    }

    /// True when this subtree contains a generator call.
    pub fn has_generator(&self) -> bool {
        let mut found = false;
        self.walk(&mut |e| {
            if matches!(e.kind, ExprKind::Split(_, _)) {
                found = true;
            }
        });
        found
    }

    /// True when this subtree contains a stateful function.
    pub fn has_stateful(&self) -> bool {
        let mut found = false;
        self.walk(&mut |e| {
            if matches!(e.kind, ExprKind::Stateful(_, _)) {
                found = true;
            }
        });
        found
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ExprKind::Const(v) => match v {
                // typed literals keep their width suffix; bare ones print bare
                Value::I128(n) if self.typ.scalar.is_none() => write!(f, "{n}"),
                Value::Float(x) => write!(f, "{x:?}"),
                Value::I8(n) => write!(f, "{n}i8"),
                Value::I16(n) => write!(f, "{n}i16"),
                Value::I32(n) => write!(f, "{n}i32"),
                Value::I64(n) => write!(f, "{n}i64"),
                Value::I128(n) => write!(f, "{n}i128"),
                Value::U8(n) => write!(f, "{n}u8"),
                Value::U16(n) => write!(f, "{n}u16"),
                Value::U32(n) => write!(f, "{n}u32"),
                Value::U64(n) => write!(f, "{n}u64"),
                Value::U128(n) => write!(f, "{n}u128"),
                _ => write!(f, "{v}"),
            },
            ExprKind::Field(TupleRef::Unqualified, n) => write!(f, "{n}"),
            ExprKind::Field(TupleRef::Group, n) => write!(f, "group.{n}"),
            ExprKind::Field(t, n) => write!(f, "{t}.{n}"),
            ExprKind::Param(n) => write!(f, "${n}"),
            ExprKind::Unary(UnaryOp::Not, e) => write!(f, "NOT ({e})"),
            ExprKind::Unary(UnaryOp::Neg, e) => write!(f, "-({e})"),
            ExprKind::Unary(op, e) => write!(f, "{}({e})", op.name()),
            ExprKind::Binary(op, a, b) => write!(f, "({a} {} {b})", op.symbol()),
            ExprKind::Case { clauses, else_ } => {
                write!(f, "CASE")?;
                for c in clauses {
                    write!(f, " WHEN {} THEN {}", c.cond, c.then)?;
                }
                if let Some(e) = else_ {
                    write!(f, " ELSE {e}")?;
                }
                write!(f, " END")
            }
            ExprKind::Coalesce(es) => {
                write!(f, "COALESCE(")?;
                for (i, e) in es.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{e}")?;
                }
                write!(f, ")")
            }
            ExprKind::Split(sep, e) => write!(f, "SPLIT({sep}, {e})"),
            ExprKind::Stateful(func, args) => {
                write!(f, "{}(", func.name())?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// One `expr AS name` item of a SELECT or YIELD clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectField {
    pub expr: Expr,
    pub name: String,
}

impl fmt::Display for SelectField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} AS {}", self.expr, self.name)
    }
}

/// What happens to a group once FLUSH fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FlushHow {
    /// Drop the group entirely
    Reset,
    /// Keep the group, drop the n oldest contributing tuples
    Slide(usize),
    /// Keep only contributors matching the predicate
    KeepOnly(Expr),
    /// Drop contributors matching the predicate
    RemoveAll(Expr),
}

/// `TOP k BY e [WHEN cond]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopClause {
    pub k: usize,
    pub by: Expr,
    pub when: Option<Expr>,
}

/// `EVENT STARTING AT f [*scale] [WITH DURATION d | AND STOPPING AT f [*scale]]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventTime {
    pub start_field: String,
    pub start_scale: f64,
    pub duration: EventDuration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventDuration {
    /// Fixed duration in seconds
    Const(f64),
    /// Another field carries the stop time
    StopField { name: String, scale: f64 },
}

/// Export marker, with optional event-time declaration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportSpec {
    pub event_time: Option<EventTime>,
}

/// A CSV column declaration: `name type [NULL]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsvField {
    pub name: String,
    pub typ: ScalarType,
    pub nullable: bool,
}

/// Wire protocols a LISTEN source can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListenProto {
    /// Newline-delimited text; tuples are `{time: float, line: string}`
    Lines,
}

/// The aggregate operation, the only non-trivial runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub fields: Vec<SelectField>,
    /// `SELECT *`: inherit remaining input fields after the named ones
    pub all_others: bool,
    pub from: Vec<String>,
    pub where_: Option<Expr>,
    pub key: Vec<Expr>,
    pub top: Option<TopClause>,
    pub commit_when: Expr,
    /// None: flush follows commit
    pub flush_when: Option<Expr>,
    pub flush_how: FlushHow,
    pub export: Option<ExportSpec>,
}

/// What a node does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    /// Source without input, emitting its fields repeatedly
    Yield {
        fields: Vec<SelectField>,
        /// Seconds between emissions; None = as fast as children accept
        every: Option<f64>,
    },
    /// External CSV source with an explicit schema
    ReadCsv {
        fields: Vec<CsvField>,
        path: String,
        separator: char,
        has_header: bool,
    },
    /// External socket source parsing a wire format
    Listen { proto: ListenProto },
    Aggregate(Aggregate),
}

impl Operation {
    pub fn parents(&self) -> &[String] {
        match self {
            Operation::Aggregate(agg) => &agg.from,
            _ => &[],
        }
    }

    pub fn export(&self) -> Option<&ExportSpec> {
        match self {
            Operation::Aggregate(agg) => agg.export.as_ref(),
            _ => None,
        }
    }

    pub fn event_time(&self) -> Option<&EventTime> {
        self.export().and_then(|e| e.event_time.as_ref())
    }

    /// All expressions of the operation, for traversal.
    pub fn exprs(&self) -> Vec<&Expr> {
        match self {
            Operation::Yield { fields, .. } => fields.iter().map(|f| &f.expr).collect(),
            Operation::ReadCsv { .. } | Operation::Listen { .. } => vec![],
            Operation::Aggregate(agg) => {
                let mut v: Vec<&Expr> = agg.fields.iter().map(|f| &f.expr).collect();
                if let Some(w) = &agg.where_ {
                    v.push(w);
                }
                v.extend(agg.key.iter());
                if let Some(top) = &agg.top {
                    v.push(&top.by);
                    if let Some(w) = &top.when {
                        v.push(w);
                    }
                }
                v.push(&agg.commit_when);
                if let Some(fl) = &agg.flush_when {
                    v.push(fl);
                }
                match &agg.flush_how {
                    FlushHow::KeepOnly(e) | FlushHow::RemoveAll(e) => v.push(e),
                    FlushHow::Reset | FlushHow::Slide(_) => {}
                }
                v
            }
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Yield { fields, every } => {
                write!(f, "YIELD ")?;
                for (i, sf) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{sf}")?;
                }
                if let Some(e) = every {
                    write!(f, " EVERY {e:?}")?;
                }
                Ok(())
            }
            Operation::ReadCsv {
                fields,
                path,
                separator,
                has_header,
            } => {
                write!(f, "READ FROM CSV {path:?}")?;
                if *separator != ',' {
                    write!(f, " SEPARATOR {:?}", separator.to_string())?;
                }
                if !has_header {
                    write!(f, " NO HEADER")?;
                }
                write!(f, " (")?;
                for (i, c) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} {}", c.name, c.typ)?;
                    if c.nullable {
                        write!(f, " NULL")?;
                    }
                }
                write!(f, ")")
            }
            Operation::Listen { proto } => match proto {
                ListenProto::Lines => write!(f, "LISTEN FOR LINES"),
            },
            Operation::Aggregate(agg) => {
                write!(f, "SELECT ")?;
                for (i, sf) in agg.fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{sf}")?;
                }
                if agg.all_others {
                    if !agg.fields.is_empty() {
                        write!(f, ", ")?;
                    }
                    write!(f, "*")?;
                }
                if !agg.from.is_empty() {
                    write!(f, " FROM {}", agg.from.join(", "))?;
                }
                if let Some(w) = &agg.where_ {
                    write!(f, " WHERE {w}")?;
                }
                if !agg.key.is_empty() {
                    write!(f, " GROUP BY ")?;
                    for (i, k) in agg.key.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{k}")?;
                    }
                }
                if let Some(top) = &agg.top {
                    write!(f, " TOP {} BY {}", top.k, top.by)?;
                    if let Some(w) = &top.when {
                        write!(f, " WHEN {w}")?;
                    }
                }
                let keep_all = matches!(agg.flush_how, FlushHow::Reset)
                    && matches!(
                        agg.flush_when.as_deref_expr(),
                        Some(ExprKind::Const(Value::Bool(false)))
                    );
                if keep_all {
                    write!(f, " COMMIT AND KEEP ALL WHEN {}", agg.commit_when)?;
                } else {
                    write!(f, " COMMIT WHEN {}", agg.commit_when)?;
                    let default_flush = matches!(agg.flush_how, FlushHow::Reset);
                    if !default_flush || agg.flush_when.is_some() {
                        write!(f, " FLUSH")?;
                        match &agg.flush_how {
                            FlushHow::Reset => {}
                            FlushHow::Slide(n) => write!(f, " SLIDE {n}")?,
                            FlushHow::KeepOnly(e) => write!(f, " KEEP ({e})")?,
                            FlushHow::RemoveAll(e) => write!(f, " REMOVE ({e})")?,
                        }
                        if let Some(fl) = &agg.flush_when {
                            write!(f, " WHEN {fl}")?;
                        }
                    }
                }
                if let Some(exp) = &agg.export {
                    write!(f, " EXPORT")?;
                    if let Some(et) = &exp.event_time {
                        write!(f, " EVENT STARTING AT {}", et.start_field)?;
                        if (et.start_scale - 1.0).abs() > f64::EPSILON {
                            write!(f, " *{:?}", et.start_scale)?;
                        }
                        match &et.duration {
                            EventDuration::Const(d) => write!(f, " WITH DURATION {d:?}")?,
                            EventDuration::StopField { name, scale } => {
                                write!(f, " AND STOPPING AT {name}")?;
                                if (scale - 1.0).abs() > f64::EPSILON {
                                    write!(f, " *{scale:?}")?;
                                }
                            }
                        }
                    }
                }
                Ok(())
            }
        }
    }
}

/// Small helper to peek through `Option<Expr>` when printing.
trait AsDerefExpr {
    fn as_deref_expr(&self) -> Option<&ExprKind>;
}

impl AsDerefExpr for Option<Expr> {
    fn as_deref_expr(&self) -> Option<&ExprKind> {
        self.as_ref().map(|e| &e.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn display_is_canonical() {
        let e = Expr::new(ExprKind::Binary(
            BinaryOp::Gt,
            Box::new(Expr::new(ExprKind::Stateful(
                StatefulFn::Sum,
                vec![Expr::constant(Value::I16(1))],
            ))),
            Box::new(Expr::int_literal(500)),
        ));
        assert_eq!(e.to_string(), "(SUM(1i16) > 500)");
    }

    #[test]
    fn untyped_literal_prints_bare() {
        assert_eq!(Expr::int_literal(42).to_string(), "42");
        assert_eq!(Expr::constant(Value::I32(42)).to_string(), "42i32");
    }

    #[test]
    fn stateful_detection_sees_through_nesting() {
        let e = Expr::new(ExprKind::Unary(
            UnaryOp::Neg,
            Box::new(Expr::new(ExprKind::Stateful(
                StatefulFn::Max,
                vec![Expr::field(TupleRef::In, "x")],
            ))),
        ));
        assert!(e.has_stateful());
        assert!(!e.has_generator());
    }
}
