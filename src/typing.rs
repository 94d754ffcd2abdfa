//! # Type inference
//!
//! Bidirectional fixed-point typing of a set of nodes: parent output schemas
//! flow into input schemas (widening shared fields), expression trees are
//! walked bottom-up with operator typing rules, and SELECT results flow into
//! output schemas. Every step is monotone (add a field, widen a numeric
//! type, set a nullability flag), so iterating to quiescence terminates.
//!
//! Once a full pass changes nothing, schemas whose dependencies are settled
//! are marked finished, `SELECT *` expansion appends the remaining input
//! fields, and still-open integer literals default to `i32`. Anything left
//! incomplete after that is a reportable typing error.

use crate::error::{Result, WeirError};
use crate::expr::{
    Aggregate, BinaryOp, Expr, ExprKind, FlushHow, ListenProto, Operation, StatefulFn, TupleRef,
    UnaryOp,
};
use crate::schema::{ExprType, TupleSchema};
use crate::value::{larger_type, ScalarType, Value};

/// Where a node's parent output schema comes from during typing.
#[derive(Debug, Clone)]
pub enum ParentSrc {
    /// Parent is typed in the same run; index into the node set
    Internal(usize),
    /// Parent belongs to an already-compiled layer; schema is frozen
    External(TupleSchema),
}

/// One node undergoing typing.
#[derive(Debug, Clone)]
pub struct TypeNode {
    /// Fully qualified name, for diagnostics
    pub name: String,
    pub op: Operation,
    pub in_schema: TupleSchema,
    pub out_schema: TupleSchema,
    pub parents: Vec<ParentSrc>,
}

impl TypeNode {
    pub fn new(name: impl Into<String>, op: Operation) -> Self {
        TypeNode {
            name: name.into(),
            op,
            in_schema: TupleSchema::new(),
            out_schema: TupleSchema::new(),
            parents: Vec::new(),
        }
    }
}

/// What an expression may reference in a given clause.
#[derive(Debug, Clone, Copy)]
struct ExprCtx {
    /// Number of output fields visible to `out` references (declared earlier
    /// in the same SELECT); `usize::MAX` outside SELECT
    out_limit: usize,
    allow_out: bool,
    allow_previous: bool,
    allow_group: bool,
    allow_stateful: bool,
    allow_generator: bool,
}

impl ExprCtx {
    fn where_clause() -> Self {
        ExprCtx {
            out_limit: 0,
            allow_out: false,
            allow_previous: false,
            allow_group: false,
            allow_stateful: false,
            allow_generator: false,
        }
    }

    fn key_clause() -> Self {
        Self::where_clause()
    }

    fn select_clause(out_limit: usize) -> Self {
        ExprCtx {
            out_limit,
            allow_out: true,
            allow_previous: true,
            allow_group: true,
            allow_stateful: true,
            allow_generator: true,
        }
    }

    fn commit_clause() -> Self {
        ExprCtx {
            out_limit: usize::MAX,
            allow_out: true,
            allow_previous: true,
            allow_group: true,
            allow_stateful: true,
            allow_generator: false,
        }
    }

    fn flush_pred_clause() -> Self {
        ExprCtx {
            out_limit: usize::MAX,
            allow_out: true,
            allow_previous: true,
            allow_group: false,
            allow_stateful: false,
            allow_generator: false,
        }
    }

    fn yield_clause() -> Self {
        ExprCtx {
            out_limit: 0,
            allow_out: false,
            allow_previous: false,
            allow_group: false,
            allow_stateful: false,
            allow_generator: false,
        }
    }
}

/// Run type inference over the node set until quiescence.
pub fn infer(nodes: &mut [TypeNode]) -> Result<()> {
    loop {
        let mut changed = false;
        for i in 0..nodes.len() {
            changed |= check_node(nodes, i)?;
        }
        if changed {
            continue;
        }

        // quiescent: settle schema completion
        if complete_schemas(nodes)? {
            continue;
        }
        // still quiescent: default the leftovers
        if apply_defaults(nodes)? {
            continue;
        }
        break;
    }

    for node in nodes.iter() {
        validate_node(node)?;
    }
    Ok(())
}

/// One typing pass over one node. Returns whether anything changed.
fn check_node(nodes: &mut [TypeNode], i: usize) -> Result<bool> {
    let mut changed = false;

    // 1. parent -> input inheritance
    let parent_outs: Vec<TupleSchema> = nodes[i]
        .parents
        .iter()
        .map(|p| match p {
            ParentSrc::Internal(j) => nodes[*j].out_schema.clone(),
            ParentSrc::External(s) => s.clone(),
        })
        .collect();

    let name = nodes[i].name.clone();
    let node = &mut nodes[i];
    for pout in &parent_outs {
        for field in pout.iter() {
            match node.in_schema.get_mut(&field.name) {
                None => {
                    if !node.in_schema.finished() {
                        node.in_schema
                            .push(field.name.clone(), field.typ.clone())
                            .map_err(|e| at_node(&name, e))?;
                        changed = true;
                    }
                }
                Some(t) => {
                    if let Some(s) = field.typ.scalar {
                        changed |= t.unify_scalar(s).map_err(|e| at_node(&name, e))?;
                    }
                    if let Some(n) = field.typ.nullable {
                        changed |= t.set_nullable(n).map_err(|e| at_node(&name, e))?;
                    }
                }
            }
        }
    }

    // 2. operation -> output typing; work on clones so the expression walk
    // can borrow the schemas while mutating the operation's typing records
    let mut op = node.op.clone();
    let in_s = node.in_schema.clone();
    let mut out_s = node.out_schema.clone();

    match &mut op {
        Operation::Yield { fields, .. } => {
            for idx in 0..fields.len() {
                let fname = fields[idx].name.clone();
                if !out_s.contains(&fname) && !out_s.finished() {
                    out_s
                        .push(fname.clone(), ExprType::unknown(format!("field {fname}")))
                        .map_err(|e| at_node(&name, e))?;
                    changed = true;
                }
                let sf = &mut fields[idx];
                changed |= check_expr(&name, &in_s, &out_s, ExprCtx::yield_clause(), &mut sf.expr)?;
                changed |= merge_select_field(&name, &mut out_s, &fname, &sf.expr)?;
            }
        }
        Operation::ReadCsv { fields, .. } => {
            for c in fields.iter() {
                if !out_s.contains(&c.name) {
                    out_s
                        .push(
                            c.name.clone(),
                            ExprType::typed(format!("field {}", c.name), c.typ, c.nullable),
                        )
                        .map_err(|e| at_node(&name, e))?;
                    changed = true;
                }
            }
        }
        Operation::Listen { proto } => match proto {
            ListenProto::Lines => {
                for (fname, t) in [("time", ScalarType::Float), ("line", ScalarType::Str)] {
                    if !out_s.contains(fname) {
                        out_s
                            .push(fname, ExprType::typed(format!("field {fname}"), t, false))
                            .map_err(|e| at_node(&name, e))?;
                        changed = true;
                    }
                }
            }
        },
        Operation::Aggregate(agg) => {
            changed |= check_aggregate(&name, &in_s, &mut out_s, agg)?;
        }
    }

    if op != node.op {
        node.op = op;
        changed = true;
    }
    if out_s != node.out_schema {
        node.out_schema = out_s;
        changed = true;
    }
    Ok(changed)
}

fn check_aggregate(
    name: &str,
    in_s: &TupleSchema,
    out_s: &mut TupleSchema,
    agg: &mut Aggregate,
) -> Result<bool> {
    let mut changed = false;

    if let Some(w) = &mut agg.where_ {
        changed |= check_expr(name, in_s, out_s, ExprCtx::where_clause(), w)?;
        changed |= set_scalar(name, w, ScalarType::Bool)?;
        if w.typ.nullable == Some(true) {
            return Err(WeirError::syntax(name, "WHERE clause must not be nullable"));
        }
    }

    for k in &mut agg.key {
        changed |= check_expr(name, in_s, out_s, ExprCtx::key_clause(), k)?;
    }

    for idx in 0..agg.fields.len() {
        // the output field must exist before its expression is walked so
        // later fields can reference it through `out`
        let fname = agg.fields[idx].name.clone();
        if !out_s.contains(&fname) {
            if out_s.finished() {
                return Err(WeirError::syntax(
                    name,
                    format!("field '{fname}' missing from a finished output schema"),
                ));
            }
            out_s
                .push(fname.clone(), ExprType::unknown(format!("field {fname}")))
                .map_err(|e| at_node(name, e))?;
            changed = true;
        }
        let ctx = ExprCtx::select_clause(out_s.rank(&fname).unwrap_or(idx));
        let sf = &mut agg.fields[idx];
        changed |= check_expr(name, in_s, out_s, ctx, &mut sf.expr)?;
        changed |= merge_select_field(name, out_s, &fname, &sf.expr)?;
    }

    if let Some(top) = &mut agg.top {
        changed |= check_expr(name, in_s, out_s, ExprCtx::commit_clause(), &mut top.by)?;
        if let Some(t) = top.by.typ.scalar {
            if !t.is_numeric() {
                return Err(WeirError::syntax(
                    name,
                    format!("TOP BY expression must be numeric, not {t}"),
                ));
            }
        }
        if let Some(w) = &mut top.when {
            changed |= check_expr(name, in_s, out_s, ExprCtx::commit_clause(), w)?;
            changed |= set_scalar(name, w, ScalarType::Bool)?;
        }
    }

    changed |= check_expr(
        name,
        in_s,
        out_s,
        ExprCtx::commit_clause(),
        &mut agg.commit_when,
    )?;
    changed |= set_scalar(name, &mut agg.commit_when, ScalarType::Bool)?;

    if let Some(fl) = &mut agg.flush_when {
        changed |= check_expr(name, in_s, out_s, ExprCtx::commit_clause(), fl)?;
        changed |= set_scalar(name, fl, ScalarType::Bool)?;
    }

    match &mut agg.flush_how {
        FlushHow::KeepOnly(p) | FlushHow::RemoveAll(p) => {
            changed |= check_expr(name, in_s, out_s, ExprCtx::flush_pred_clause(), p)?;
            changed |= set_scalar(name, p, ScalarType::Bool)?;
        }
        FlushHow::Reset | FlushHow::Slide(_) => {}
    }

    Ok(changed)
}

/// Fold a typed SELECT expression into its output field record.
fn merge_select_field(
    name: &str,
    out_s: &mut TupleSchema,
    fname: &str,
    expr: &Expr,
) -> Result<bool> {
    let mut changed = false;
    let field = out_s
        .get_mut(fname)
        .ok_or_else(|| WeirError::syntax(name, format!("unknown output field '{fname}'")))?;
    if let Some(s) = expr.typ.scalar {
        changed |= field.unify_scalar(s).map_err(|e| at_node(name, e))?;
    }
    if let Some(n) = expr.typ.nullable {
        changed |= field.set_nullable(n).map_err(|e| at_node(name, e))?;
    }
    Ok(changed)
}

/// Nullability of a node derived from its children: `Some(true)` as soon as
/// one child is nullable, `Some(false)` once all are known non-null.
fn combined_nullability(e: &Expr) -> Option<bool> {
    let mut all_false = true;
    for c in e.children() {
        match c.typ.nullable {
            Some(true) => return Some(true),
            Some(false) => {}
            None => all_false = false,
        }
    }
    if all_false {
        Some(false)
    } else {
        None
    }
}

/// Bottom-up walk of one expression: children first, then this node's
/// typing rule. Monotone on every typing record it touches.
fn check_expr(
    name: &str,
    in_s: &TupleSchema,
    out_s: &TupleSchema,
    ctx: ExprCtx,
    e: &mut Expr,
) -> Result<bool> {
    let mut changed = false;
    for c in e.children_mut() {
        changed |= check_expr(name, in_s, out_s, ctx, c)?;
    }
    let child_null = combined_nullability(e);

    // typ and kind are disjoint borrows for the rest of the walk
    let Expr { typ, kind } = e;

    match kind {
        ExprKind::Const(_) => {
            // typed at construction; bare integer literals wait for
            // unification or the defaulting phase
        }
        ExprKind::Param(p) => {
            return Err(WeirError::syntax(
                name,
                format!("parameter ${p} was never bound"),
            ));
        }
        ExprKind::Field(tuple_ref, fname_ref) => {
            let fname = fname_ref.clone();
            let mut tuple = *tuple_ref;
            if tuple == TupleRef::Unqualified {
                // in-first bias: `out` is consulted only when `in` cannot
                // ever carry the field
                if in_s.contains(&fname) || fname.starts_with('#') {
                    tuple = TupleRef::In;
                } else if ctx.allow_out && in_s.finished() && out_s.contains(&fname) {
                    tuple = TupleRef::Out;
                } else if in_s.finished() {
                    return Err(WeirError::syntax(name, format!("unknown field '{fname}'")));
                } else {
                    // the field may still arrive from a parent
                    return Ok(changed);
                }
                *kind = ExprKind::Field(tuple, fname.clone());
                changed = true;
            }
            match tuple {
                TupleRef::In | TupleRef::GroupFirst | TupleRef::GroupLast => {
                    if (tuple == TupleRef::GroupFirst || tuple == TupleRef::GroupLast)
                        && !ctx.allow_group
                    {
                        return Err(WeirError::syntax(
                            name,
                            format!("'{tuple}.{fname}' is not available in this clause"),
                        ));
                    }
                    if let Some(virt) = fname.strip_prefix('#') {
                        if virt != "count" {
                            return Err(WeirError::syntax(
                                name,
                                format!("unknown virtual field '#{virt}'"),
                            ));
                        }
                        changed |= typ
                            .unify_scalar(ScalarType::U64)
                            .map_err(|e| at_node(name, e))?;
                        changed |= typ.set_nullable(false).map_err(|e| at_node(name, e))?;
                    } else if let Some(f) = in_s.get(&fname) {
                        if let Some(s) = f.scalar {
                            changed |= typ.unify_scalar(s).map_err(|e| at_node(name, e))?;
                        }
                        if let Some(n) = f.nullable {
                            changed |= typ.set_nullable(n).map_err(|e| at_node(name, e))?;
                        }
                    } else if in_s.finished() {
                        return Err(WeirError::syntax(name, format!("unknown field '{fname}'")));
                    }
                }
                TupleRef::Out | TupleRef::Previous => {
                    if tuple == TupleRef::Out && !ctx.allow_out
                        || tuple == TupleRef::Previous && !ctx.allow_previous
                    {
                        return Err(WeirError::syntax(
                            name,
                            format!("'{tuple}.{fname}' is not available in this clause"),
                        ));
                    }
                    match out_s.rank(&fname) {
                        Some(rank) => {
                            if tuple == TupleRef::Out && rank >= ctx.out_limit {
                                return Err(WeirError::syntax(
                                    name,
                                    format!(
                                        "'out.{fname}' refers to a field declared later in the SELECT"
                                    ),
                                ));
                            }
                            if let Some(f) = out_s.get(&fname) {
                                if let Some(s) = f.scalar {
                                    changed |=
                                        typ.unify_scalar(s).map_err(|e| at_node(name, e))?;
                                }
                                if let Some(n) = f.nullable {
                                    changed |=
                                        typ.set_nullable(n).map_err(|e| at_node(name, e))?;
                                }
                            }
                        }
                        None if out_s.finished() => {
                            return Err(WeirError::syntax(
                                name,
                                format!("unknown field '{tuple}.{fname}'"),
                            ));
                        }
                        None => {}
                    }
                }
                TupleRef::Group => {
                    if !ctx.allow_group {
                        return Err(WeirError::syntax(
                            name,
                            format!("'group.{fname}' is not available in this clause"),
                        ));
                    }
                    match fname.as_str() {
                        "#count" => {
                            changed |= typ
                                .unify_scalar(ScalarType::U64)
                                .map_err(|e| at_node(name, e))?;
                            changed |= typ.set_nullable(false).map_err(|e| at_node(name, e))?;
                        }
                        other => {
                            return Err(WeirError::syntax(
                                name,
                                format!("unknown group virtual '{other}'"),
                            ));
                        }
                    }
                }
                TupleRef::Unqualified => unreachable!("resolved above"),
            }
        }
        ExprKind::Unary(op, operand) => {
            match op {
                UnaryOp::Not => {
                    changed |= set_scalar(name, operand, ScalarType::Bool)?;
                    changed |= typ
                        .unify_scalar(ScalarType::Bool)
                        .map_err(|e| at_node(name, e))?;
                }
                UnaryOp::Neg => {
                    require_numeric(name, operand)?;
                    if let Some(t) = operand.typ.scalar {
                        let r = if t.is_unsigned_int() {
                            larger_type(t, ScalarType::I8).unwrap_or(ScalarType::Float)
                        } else {
                            t
                        };
                        changed |= typ.unify_scalar(r).map_err(|e| at_node(name, e))?;
                    }
                }
                UnaryOp::Defined => {
                    changed |= typ
                        .unify_scalar(ScalarType::Bool)
                        .map_err(|e| at_node(name, e))?;
                    changed |= typ.set_nullable(false).map_err(|e| at_node(name, e))?;
                }
                UnaryOp::Abs => {
                    require_numeric(name, operand)?;
                    if let Some(t) = operand.typ.scalar {
                        changed |= typ.unify_scalar(t).map_err(|e| at_node(name, e))?;
                    }
                }
                UnaryOp::Length => {
                    changed |= set_scalar(name, operand, ScalarType::Str)?;
                    changed |= typ
                        .unify_scalar(ScalarType::U32)
                        .map_err(|e| at_node(name, e))?;
                }
                UnaryOp::Lower | UnaryOp::Upper => {
                    changed |= set_scalar(name, operand, ScalarType::Str)?;
                    changed |= typ
                        .unify_scalar(ScalarType::Str)
                        .map_err(|e| at_node(name, e))?;
                }
            }
            if *op != UnaryOp::Defined {
                if let Some(n) = child_null {
                    changed |= typ.set_nullable(n).map_err(|e| at_node(name, e))?;
                }
            }
        }
        ExprKind::Binary(op, a, b) => {
            if op.is_boolean() {
                changed |= set_scalar(name, a, ScalarType::Bool)?;
                changed |= set_scalar(name, b, ScalarType::Bool)?;
                changed |= typ
                    .unify_scalar(ScalarType::Bool)
                    .map_err(|e| at_node(name, e))?;
            } else if op.is_comparison() {
                changed |= unify_pair(name, a, b)?;
                changed |= typ
                    .unify_scalar(ScalarType::Bool)
                    .map_err(|e| at_node(name, e))?;
            } else {
                changed |= unify_pair(name, a, b)?;
                let t = a.typ.scalar.or(b.typ.scalar);
                match op {
                    BinaryOp::Div => {
                        if let Some(t) = t {
                            if !t.is_numeric() {
                                return Err(WeirError::syntax(
                                    name,
                                    format!("'/' wants numeric operands, not {t}"),
                                ));
                            }
                        }
                        changed |= typ
                            .unify_scalar(ScalarType::Float)
                            .map_err(|e| at_node(name, e))?;
                    }
                    BinaryOp::Add if t == Some(ScalarType::Str) => {
                        // string concatenation
                        changed |= typ
                            .unify_scalar(ScalarType::Str)
                            .map_err(|e| at_node(name, e))?;
                    }
                    _ => {
                        if let Some(t) = t {
                            if !t.is_numeric() && t != ScalarType::Bool {
                                return Err(WeirError::syntax(
                                    name,
                                    format!(
                                        "operator '{}' wants numeric operands, not {t}",
                                        op.symbol()
                                    ),
                                ));
                            }
                            changed |= typ.unify_scalar(t).map_err(|e| at_node(name, e))?;
                        }
                    }
                }
            }
            if let Some(n) = child_null {
                changed |= typ.set_nullable(n).map_err(|e| at_node(name, e))?;
            }
        }
        ExprKind::Case { clauses, else_ } => {
            for c in clauses.iter_mut() {
                changed |= set_scalar(name, &mut c.cond, ScalarType::Bool)?;
            }
            // all branches unify with the CASE itself
            let mut branch_t: Option<ScalarType> = typ.scalar;
            for c in clauses.iter() {
                branch_t = merge_types(name, branch_t, c.then.typ.scalar)?;
            }
            if let Some(el) = else_.as_deref() {
                branch_t = merge_types(name, branch_t, el.typ.scalar)?;
            }
            if let Some(t) = branch_t {
                for c in clauses.iter_mut() {
                    changed |= set_scalar(name, &mut c.then, t)?;
                }
                if let Some(el) = else_.as_deref_mut() {
                    changed |= set_scalar(name, el, t)?;
                }
                changed |= typ.unify_scalar(t).map_err(|e| at_node(name, e))?;
            }
            if else_.is_none() {
                // CASE without ELSE yields NULL when nothing matches
                changed |= typ.set_nullable(true).map_err(|e| at_node(name, e))?;
            } else if let Some(n) = child_null {
                changed |= typ.set_nullable(n).map_err(|e| at_node(name, e))?;
            }
        }
        ExprKind::Coalesce(args) => {
            if args.is_empty() {
                return Err(WeirError::syntax(name, "COALESCE of nothing"));
            }
            let mut t: Option<ScalarType> = typ.scalar;
            for a in args.iter() {
                t = merge_types(name, t, a.typ.scalar)?;
            }
            if let Some(t) = t {
                for a in args.iter_mut() {
                    changed |= set_scalar(name, a, t)?;
                }
                changed |= typ.unify_scalar(t).map_err(|e| at_node(name, e))?;
            }
            let last = args.len() - 1;
            for (i, a) in args.iter().enumerate() {
                if i < last && a.typ.nullable == Some(false) {
                    return Err(WeirError::syntax(
                        name,
                        format!(
                            "COALESCE argument {} can never be NULL, so later arguments are dead",
                            i + 1
                        ),
                    ));
                }
                if i == last && a.typ.nullable == Some(true) {
                    return Err(WeirError::syntax(
                        name,
                        "the last COALESCE argument must not be nullable",
                    ));
                }
            }
            changed |= typ.set_nullable(false).map_err(|e| at_node(name, e))?;
        }
        ExprKind::Split(sep, operand) => {
            if !ctx.allow_generator {
                return Err(WeirError::syntax(
                    name,
                    "generators are only allowed in SELECT fields",
                ));
            }
            if sep.has_generator() || operand.has_generator() {
                return Err(WeirError::syntax(name, "generators cannot be nested"));
            }
            if sep.has_stateful() || operand.has_stateful() {
                return Err(WeirError::syntax(
                    name,
                    "SPLIT cannot take a stateful function",
                ));
            }
            changed |= set_scalar(name, sep, ScalarType::Str)?;
            changed |= set_scalar(name, operand, ScalarType::Str)?;
            changed |= typ
                .unify_scalar(ScalarType::Str)
                .map_err(|e| at_node(name, e))?;
            if let Some(n) = child_null {
                changed |= typ.set_nullable(n).map_err(|e| at_node(name, e))?;
            }
        }
        ExprKind::Stateful(func, args) => {
            let func = *func;
            if !ctx.allow_stateful {
                return Err(WeirError::syntax(
                    name,
                    format!("{} is not allowed in this clause", func.name()),
                ));
            }
            for a in args.iter() {
                if a.has_stateful() {
                    return Err(WeirError::syntax(
                        name,
                        format!("{} cannot take another stateful function", func.name()),
                    ));
                }
                if a.has_generator() {
                    return Err(WeirError::syntax(
                        name,
                        format!("{} cannot take a generator", func.name()),
                    ));
                }
            }
            for &ci in func.constant_args() {
                if !args[ci].is_const() {
                    return Err(WeirError::syntax(
                        name,
                        format!("argument {} of {} must be constant", ci + 1, func.name()),
                    ));
                }
            }
            match func {
                StatefulFn::Min | StatefulFn::Max | StatefulFn::Sum => {
                    require_numeric(name, &args[0])?;
                    if let Some(t) = args[0].typ.scalar {
                        changed |= typ.unify_scalar(t).map_err(|e| at_node(name, e))?;
                    }
                }
                StatefulFn::First | StatefulFn::Last => {
                    if let Some(t) = args[0].typ.scalar {
                        changed |= typ.unify_scalar(t).map_err(|e| at_node(name, e))?;
                    }
                }
                StatefulFn::Avg
                | StatefulFn::MovingAvg
                | StatefulFn::Smooth
                | StatefulFn::FitLin => {
                    for a in args.iter() {
                        require_numeric(name, a)?;
                    }
                    changed |= typ
                        .unify_scalar(ScalarType::Float)
                        .map_err(|e| at_node(name, e))?;
                }
                StatefulFn::AndAll | StatefulFn::OrAll => {
                    changed |= set_scalar(name, &mut args[0], ScalarType::Bool)?;
                    changed |= typ
                        .unify_scalar(ScalarType::Bool)
                        .map_err(|e| at_node(name, e))?;
                }
                StatefulFn::Percentile => {
                    require_numeric(name, &args[1])?;
                    if let Some(t) = args[1].typ.scalar {
                        changed |= typ.unify_scalar(t).map_err(|e| at_node(name, e))?;
                    }
                }
                StatefulFn::Lag => {
                    if let Some(t) = args[1].typ.scalar {
                        changed |= typ.unify_scalar(t).map_err(|e| at_node(name, e))?;
                    }
                }
                StatefulFn::Remember => {
                    require_numeric(name, &args[0])?;
                    require_numeric(name, &args[1])?;
                    changed |= typ
                        .unify_scalar(ScalarType::Bool)
                        .map_err(|e| at_node(name, e))?;
                    changed |= typ.set_nullable(false).map_err(|e| at_node(name, e))?;
                }
            }
            if func != StatefulFn::Remember {
                if let Some(n) = child_null {
                    changed |= typ.set_nullable(n).map_err(|e| at_node(name, e))?;
                }
            }
        }
    }

    Ok(changed)
}

/// Unify two operand types with each other, widening both sides.
fn unify_pair(name: &str, a: &mut Expr, b: &mut Expr) -> Result<bool> {
    let mut changed = false;
    match (a.typ.scalar, b.typ.scalar) {
        (Some(ta), Some(tb)) => {
            let t = larger_type(ta, tb)
                .ok_or_else(|| WeirError::syntax(name, format!("cannot unify {ta} with {tb}")))?;
            changed |= set_scalar(name, a, t)?;
            changed |= set_scalar(name, b, t)?;
        }
        (Some(t), None) => changed |= set_scalar(name, b, t)?,
        (None, Some(t)) => changed |= set_scalar(name, a, t)?,
        (None, None) => {}
    }
    Ok(changed)
}

/// Widen an expression's scalar type, checking literal payloads still fit.
fn set_scalar(name: &str, e: &mut Expr, t: ScalarType) -> Result<bool> {
    let was_open = e.typ.scalar.is_none();
    let changed = e.typ.unify_scalar(t).map_err(|err| at_node(name, err))?;
    if changed && was_open && t.is_int() {
        if let ExprKind::Const(Value::I128(v)) = &e.kind {
            if Value::int_of(t, *v).is_none() {
                return Err(WeirError::syntax(
                    name,
                    format!("literal {v} does not fit in {t}"),
                ));
            }
        }
    }
    Ok(changed)
}

fn require_numeric(name: &str, e: &Expr) -> Result<()> {
    if let Some(t) = e.typ.scalar {
        if !t.is_numeric() && t != ScalarType::Bool {
            return Err(WeirError::syntax(
                name,
                format!("{} must be numeric, not {t}", e.typ.name),
            ));
        }
    }
    Ok(())
}

fn merge_types(
    name: &str,
    a: Option<ScalarType>,
    b: Option<ScalarType>,
) -> Result<Option<ScalarType>> {
    match (a, b) {
        (Some(ta), Some(tb)) => {
            let t = larger_type(ta, tb)
                .ok_or_else(|| WeirError::syntax(name, format!("cannot unify {ta} with {tb}")))?;
            Ok(Some(t))
        }
        (t, None) | (None, t) => Ok(t),
    }
}

/// Quiescent-state completion: finish input schemas whose parents are all
/// finished, expand `SELECT *`, finish fully-typed output schemas.
fn complete_schemas(nodes: &mut [TypeNode]) -> Result<bool> {
    let mut changed = false;
    for i in 0..nodes.len() {
        let parents_done = nodes[i].parents.iter().all(|p| match p {
            ParentSrc::Internal(j) => nodes[*j].out_schema.finished(),
            ParentSrc::External(_) => true,
        });
        let node = &mut nodes[i];

        if !node.in_schema.finished() && parents_done {
            node.in_schema.set_finished();
            changed = true;
        }

        if node.in_schema.finished() {
            if let Operation::Aggregate(agg) = &node.op {
                if agg.all_others && !node.out_schema.finished() {
                    let missing: Vec<_> = node
                        .in_schema
                        .iter()
                        .filter(|f| !node.out_schema.contains(&f.name))
                        .map(|f| (f.name.clone(), f.typ.clone()))
                        .collect();
                    for (fname, typ) in missing {
                        let mut typ = typ;
                        typ.name = format!("field {fname}");
                        node.out_schema.push(fname, typ)?;
                        changed = true;
                    }
                }
            }
            if !node.out_schema.finished()
                && !node.out_schema.is_empty()
                && node.out_schema.fully_typed()
            {
                node.out_schema.set_finished();
                changed = true;
            }
        }
    }
    Ok(changed)
}

/// Nothing moves anymore: pin leftover open literals and nullabilities.
fn apply_defaults(nodes: &mut [TypeNode]) -> Result<bool> {
    let mut changed = false;
    for node in nodes.iter_mut() {
        let name = node.name.clone();
        let mut op = node.op.clone();
        changed |= default_op_exprs(&name, &mut op)?;
        if op != node.op {
            node.op = op;
        }
    }
    Ok(changed)
}

fn default_op_exprs(name: &str, op: &mut Operation) -> Result<bool> {
    let mut changed = false;
    let mut stack: Vec<&mut Expr> = Vec::new();
    match op {
        Operation::Yield { fields, .. } => {
            stack.extend(fields.iter_mut().map(|f| &mut f.expr));
        }
        Operation::ReadCsv { .. } | Operation::Listen { .. } => {}
        Operation::Aggregate(agg) => {
            stack.extend(agg.fields.iter_mut().map(|f| &mut f.expr));
            if let Some(w) = &mut agg.where_ {
                stack.push(w);
            }
            stack.extend(agg.key.iter_mut());
            if let Some(top) = &mut agg.top {
                stack.push(&mut top.by);
                if let Some(w) = &mut top.when {
                    stack.push(w);
                }
            }
            stack.push(&mut agg.commit_when);
            if let Some(fl) = &mut agg.flush_when {
                stack.push(fl);
            }
            match &mut agg.flush_how {
                FlushHow::KeepOnly(p) | FlushHow::RemoveAll(p) => stack.push(p),
                FlushHow::Reset | FlushHow::Slide(_) => {}
            }
        }
    }
    while let Some(e) = stack.pop() {
        if e.typ.scalar.is_none() {
            if let ExprKind::Const(Value::I128(v)) = &e.kind {
                let t = if Value::int_of(ScalarType::I32, *v).is_some() {
                    ScalarType::I32
                } else if Value::int_of(ScalarType::I64, *v).is_some() {
                    ScalarType::I64
                } else {
                    ScalarType::I128
                };
                e.typ.unify_scalar(t).map_err(|err| at_node(name, err))?;
                changed = true;
            }
        }
        if e.typ.scalar.is_some() && e.typ.nullable.is_none() && e.children().is_empty() {
            e.typ
                .set_nullable(false)
                .map_err(|err| at_node(name, err))?;
            changed = true;
        }
        stack.extend(e.children_mut());
    }
    Ok(changed)
}

/// Final validation once the fixed point settled.
fn validate_node(node: &TypeNode) -> Result<()> {
    let name = &node.name;
    if !node.in_schema.finished() || !node.out_schema.finished() {
        return Err(WeirError::syntax(
            name,
            "typing did not converge: schema still open",
        ));
    }
    if !node.out_schema.fully_typed() {
        let open = node
            .out_schema
            .iter()
            .find(|f| !f.typ.is_complete())
            .map(|f| f.name.clone())
            .unwrap_or_default();
        return Err(WeirError::syntax(
            name,
            format!("output field '{open}' could not be typed"),
        ));
    }
    for f in node.out_schema.iter() {
        if f.typ.scalar.is_some_and(ScalarType::is_abstract) {
            return Err(WeirError::syntax(
                name,
                format!("output field '{}' never resolved to a concrete type", f.name),
            ));
        }
    }
    for e in node.op.exprs() {
        let mut incomplete: Option<String> = None;
        e.walk(&mut |sub| {
            if incomplete.is_none()
                && (!sub.typ.is_complete()
                    || sub.typ.scalar.is_some_and(ScalarType::is_abstract))
            {
                incomplete = Some(sub.typ.name.clone());
            }
        });
        if let Some(what) = incomplete {
            return Err(WeirError::syntax(
                name,
                format!("could not infer the type of {what}"),
            ));
        }
    }
    Ok(())
}

fn at_node(name: &str, e: WeirError) -> WeirError {
    match e {
        WeirError::Syntax { node, message } if node.is_empty() => WeirError::syntax(name, message),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_operation;
    use crate::value::ScalarType;

    fn source(fields: &[(&str, ScalarType, bool)]) -> TupleSchema {
        let mut s = TupleSchema::new();
        for (n, t, null) in fields {
            s.push(*n, ExprType::typed(format!("field {n}"), *t, *null))
                .expect("push");
        }
        s.set_finished();
        s
    }

    fn typed_node(op_src: &str, parent: TupleSchema) -> Result<TypeNode> {
        let op = parse_operation(op_src)?;
        let mut node = TypeNode::new("test/node", op);
        node.parents.push(ParentSrc::External(parent));
        let mut nodes = vec![node];
        infer(&mut nodes)?;
        Ok(nodes.pop().unwrap_or_else(|| unreachable!()))
    }

    #[test]
    fn input_inherits_parent_schema() {
        let parent = source(&[
            ("time", ScalarType::Float, false),
            ("value", ScalarType::U32, false),
        ]);
        let node = typed_node("SELECT value AS v FROM p COMMIT WHEN true", parent).expect("types");
        assert!(node.in_schema.finished());
        assert_eq!(node.in_schema.len(), 2);
        let v = node.out_schema.get("v").expect("v field");
        assert_eq!(v.scalar, Some(ScalarType::U32));
        assert_eq!(v.nullable, Some(false));
    }

    #[test]
    fn two_parents_widen_shared_field() {
        let op = parse_operation("SELECT x AS x FROM a, b COMMIT WHEN true").expect("parse");
        let mut node = TypeNode::new("t/n", op);
        node.parents
            .push(ParentSrc::External(source(&[("x", ScalarType::U8, false)])));
        node.parents
            .push(ParentSrc::External(source(&[("x", ScalarType::I16, false)])));
        let mut nodes = vec![node];
        infer(&mut nodes).expect("types");
        let x = nodes[0].in_schema.get("x").expect("x");
        assert_eq!(x.scalar, Some(ScalarType::I32));
    }

    #[test]
    fn constant_adopts_operand_width() {
        let parent = source(&[("n", ScalarType::I16, false)]);
        let node = typed_node("SELECT SUM(1i16) > 500 AS hot FROM p COMMIT WHEN true", parent)
            .expect("types");
        let hot = node.out_schema.get("hot").expect("hot");
        assert_eq!(hot.scalar, Some(ScalarType::Bool));
        assert_eq!(hot.nullable, Some(false));
        // the bare 500 was adopted as i16
        if let Operation::Aggregate(agg) = &node.op {
            if let ExprKind::Binary(_, _, rhs) = &agg.fields[0].expr.kind {
                assert_eq!(rhs.typ.scalar, Some(ScalarType::I16));
            } else {
                panic!("expected comparison");
            }
        } else {
            panic!("expected aggregate");
        }
    }

    #[test]
    fn nullable_where_is_rejected() {
        let parent = source(&[("plugin", ScalarType::Str, true)]);
        let res = typed_node(
            "SELECT plugin AS p FROM src WHERE plugin = \"memory\" COMMIT WHEN true",
            parent,
        );
        match res {
            Err(WeirError::Syntax { message, .. }) => {
                assert!(
                    message.contains("WHERE clause must not be nullable"),
                    "{message}"
                );
            }
            other => panic!("expected nullable-WHERE rejection, got {other:?}"),
        }
    }

    #[test]
    fn coalesce_makes_where_acceptable() {
        let parent = source(&[("plugin", ScalarType::Str, true)]);
        let node = typed_node(
            "SELECT plugin AS p FROM src WHERE COALESCE(plugin = \"memory\", false) COMMIT WHEN true",
            parent,
        )
        .expect("types");
        let p = node.out_schema.get("p").expect("p");
        assert_eq!(p.nullable, Some(true));
    }

    #[test]
    fn coalesce_rejects_nullable_last() {
        let parent = source(&[("a", ScalarType::Str, true), ("b", ScalarType::Str, true)]);
        let res = typed_node("SELECT COALESCE(a, b) AS c FROM src COMMIT WHEN true", parent);
        assert!(res.is_err());
    }

    #[test]
    fn select_star_appends_remaining_fields() {
        let parent = source(&[
            ("time", ScalarType::Float, false),
            ("word", ScalarType::Str, false),
            ("n", ScalarType::U32, false),
        ]);
        let node =
            typed_node("SELECT word AS word, * FROM src COMMIT WHEN true", parent).expect("types");
        let names: Vec<_> = node.out_schema.field_names().collect();
        assert_eq!(names, vec!["word", "time", "n"]);
    }

    #[test]
    fn out_reference_to_later_field_fails() {
        let parent = source(&[("x", ScalarType::U32, false)]);
        let res = typed_node("SELECT out.y AS a, x AS y FROM src COMMIT WHEN true", parent);
        assert!(res.is_err());
    }

    #[test]
    fn case_without_else_is_nullable() {
        let parent = source(&[
            ("kind", ScalarType::Str, false),
            ("value", ScalarType::Float, false),
        ]);
        let node = typed_node(
            "SELECT AVG(IF kind = \"free\" THEN value) AS free FROM src COMMIT WHEN true",
            parent,
        )
        .expect("types");
        let free = node.out_schema.get("free").expect("free");
        assert_eq!(free.scalar, Some(ScalarType::Float));
        assert_eq!(free.nullable, Some(true));
    }

    #[test]
    fn lag_offset_must_be_constant() {
        let parent = source(&[("x", ScalarType::U32, false)]);
        let res = typed_node("SELECT LAG(x, x) AS l FROM src COMMIT WHEN true", parent);
        assert!(res.is_err());
    }

    #[test]
    fn unknown_field_is_reported() {
        let parent = source(&[("x", ScalarType::U32, false)]);
        let res = typed_node("SELECT nope AS y FROM src COMMIT WHEN true", parent);
        match res {
            Err(WeirError::Syntax { message, .. }) => {
                assert!(message.contains("unknown field"), "{message}");
            }
            other => panic!("expected unknown field error, got {other:?}"),
        }
    }

    #[test]
    fn internal_chain_converges() {
        // two nodes in one layer: source yields, child aggregates
        let y = parse_operation("YIELD 1u32 AS n, \"x\" AS tag").expect("parse yield");
        let a = parse_operation(
            "SELECT SUM(n) AS total, tag AS tag FROM y GROUP BY tag COMMIT WHEN true",
        )
        .expect("parse agg");
        let mut n0 = TypeNode::new("l/y", y);
        n0.parents = vec![];
        let mut n1 = TypeNode::new("l/a", a);
        n1.parents = vec![ParentSrc::Internal(0)];
        let mut nodes = vec![n0, n1];
        infer(&mut nodes).expect("types");
        assert!(nodes[1].out_schema.finished());
        assert_eq!(
            nodes[1].out_schema.get("total").and_then(|t| t.scalar),
            Some(ScalarType::U32)
        );
    }

    #[test]
    fn case_branch_widening() {
        let parent = source(&[
            ("small", ScalarType::U8, false),
            ("big", ScalarType::U32, false),
        ]);
        let node = typed_node(
            "SELECT CASE WHEN small > 0 THEN small ELSE big END AS v FROM src COMMIT WHEN true",
            parent,
        )
        .expect("types");
        assert_eq!(
            node.out_schema.get("v").and_then(|t| t.scalar),
            Some(ScalarType::U32)
        );
    }
}
