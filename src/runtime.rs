//! # Operator runtimes
//!
//! Four runtimes back the four operations. Yield, read-csv and listen are
//! sources; the aggregate runtime is the windowing state machine: a group
//! map keyed by the GROUP BY values, each group holding its running
//! stateful-function states, the tuple last emitted for it (`previous`),
//! and, when the flush mode needs replay, the contributing input tuples.
//!
//! Per input tuple: WHERE gates, KEY selects the group, states update once
//! (before generator expansion), SELECT builds the candidate OUT tuple(s),
//! COMMIT decides emission, FLUSH decides what the group carries into the
//! next window.
//!
//! A commit condition that references the `in` tuple is checked against
//! every live group on every arrival, so `COMMIT WHEN in.time >
//! previous.time + 30` closes an old window from the tuple that opens the
//! next one. Conditions blind to `in` are only checked for the group the
//! tuple landed in.

use crate::error::{Result, WeirError};
use crate::eval::{cmp_values, eval, EvalCursor, EvalEnv, GroupCtx, StateReader};
use crate::expr::{Aggregate, BinaryOp, Expr, ExprKind, FlushHow, Operation, SelectField, StatefulFn, TupleRef};
use crate::novelty::NoveltyFilter;
use crate::schema::TupleSchema;
use crate::value::{ScalarType, Tuple, Value};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;

/// Slices the novelty window of `REMEMBER` into this many Bloom slices.
const REMEMBER_SLICES: usize = 10;

/// The compiled artifact a worker interprets: one typed operation with its
/// schemas, keyed by signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    pub signature: String,
    pub operation: Operation,
    pub in_schema: TupleSchema,
    pub out_schema: TupleSchema,
}

impl Program {
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| WeirError::fatal(format!("cannot serialize program: {e}")))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data)
            .map_err(|e| WeirError::fatal(format!("cannot parse program {}: {e}", path.display())))
    }
}

// ---------------------------------------------------------------------------
// stateful function states

fn const_f64(e: &Expr) -> Result<f64> {
    e.const_value()
        .and_then(Value::as_f64)
        .ok_or_else(|| WeirError::fatal("expected a constant number"))
}

fn const_usize(e: &Expr) -> Result<usize> {
    e.const_value()
        .and_then(Value::as_i128)
        .and_then(|v| usize::try_from(v).ok())
        .ok_or_else(|| WeirError::fatal("expected a constant count"))
}

/// Running state of one stateful call site.
#[derive(Debug, Clone)]
enum AggrState {
    Extreme {
        is_min: bool,
        cur: Option<Value>,
    },
    Sum(Option<Value>),
    Avg {
        sum: f64,
        count: u64,
    },
    BoolFold {
        is_and: bool,
        cur: Option<bool>,
    },
    First(Option<Value>),
    Last(Option<Value>),
    Percentile {
        p: f64,
        vals: Vec<Value>,
    },
    Lag {
        k: usize,
        buf: VecDeque<Value>,
    },
    MovingAvg {
        n: usize,
        buf: VecDeque<f64>,
    },
    Smooth {
        alpha: f64,
        cur: Option<f64>,
    },
    FitLin {
        n: u64,
        sx: f64,
        sy: f64,
        sxx: f64,
        sxy: f64,
        last_x: Option<f64>,
    },
    Remember {
        filter: NoveltyFilter,
        hit: bool,
    },
}

impl AggrState {
    fn new(func: StatefulFn, args: &[Expr]) -> Result<AggrState> {
        let state = match func {
            StatefulFn::Min => AggrState::Extreme {
                is_min: true,
                cur: None,
            },
            StatefulFn::Max => AggrState::Extreme {
                is_min: false,
                cur: None,
            },
            StatefulFn::Sum => AggrState::Sum(None),
            StatefulFn::Avg => AggrState::Avg { sum: 0.0, count: 0 },
            StatefulFn::AndAll => AggrState::BoolFold {
                is_and: true,
                cur: None,
            },
            StatefulFn::OrAll => AggrState::BoolFold {
                is_and: false,
                cur: None,
            },
            StatefulFn::First => AggrState::First(None),
            StatefulFn::Last => AggrState::Last(None),
            StatefulFn::Percentile => AggrState::Percentile {
                p: const_f64(&args[0])?,
                vals: Vec::new(),
            },
            StatefulFn::Lag => AggrState::Lag {
                k: const_usize(&args[0])?,
                buf: VecDeque::new(),
            },
            StatefulFn::MovingAvg => AggrState::MovingAvg {
                n: const_usize(&args[0])?.max(1),
                buf: VecDeque::new(),
            },
            StatefulFn::Smooth => AggrState::Smooth {
                alpha: const_f64(&args[0])?,
                cur: None,
            },
            StatefulFn::FitLin => AggrState::FitLin {
                n: 0,
                sx: 0.0,
                sy: 0.0,
                sxx: 0.0,
                sxy: 0.0,
                last_x: None,
            },
            StatefulFn::Remember => AggrState::Remember {
                filter: NoveltyFilter::new(const_f64(&args[1])?, REMEMBER_SLICES),
                hit: false,
            },
        };
        Ok(state)
    }

    /// Fold one input tuple's argument values in. NULL arguments are
    /// skipped, so `AVG(IF cond THEN v)` averages only the matching rows.
    fn update(&mut self, args: &[Value], result_t: ScalarType) -> Result<()> {
        match self {
            AggrState::Extreme { is_min, cur } => {
                let v = &args[0];
                if !v.is_null() {
                    let replace = match cur {
                        None => true,
                        Some(c) => {
                            let ord = cmp_values(v, c)
                                .ok_or_else(|| WeirError::fatal("unorderable aggregate input"))?;
                            if *is_min {
                                ord == std::cmp::Ordering::Less
                            } else {
                                ord == std::cmp::Ordering::Greater
                            }
                        }
                    };
                    if replace {
                        *cur = Some(v.clone());
                    }
                }
            }
            AggrState::Sum(cur) => {
                let v = &args[0];
                if !v.is_null() {
                    let next = match cur.take() {
                        None => v
                            .cast_to(result_t)
                            .ok_or_else(|| WeirError::fatal("sum input does not fit"))?,
                        Some(acc) => crate::eval::arith(BinaryOp::Add, acc, v.clone(), result_t)?,
                    };
                    *cur = Some(next);
                }
            }
            AggrState::Avg { sum, count } => {
                if let Some(x) = args[0].as_f64() {
                    *sum += x;
                    *count += 1;
                }
            }
            AggrState::BoolFold { is_and, cur } => {
                if let Some(b) = args[0].as_bool() {
                    *cur = Some(match cur {
                        None => b,
                        Some(acc) => {
                            if *is_and {
                                *acc && b
                            } else {
                                *acc || b
                            }
                        }
                    });
                }
            }
            AggrState::First(cur) => {
                if cur.is_none() && !args[0].is_null() {
                    *cur = Some(args[0].clone());
                }
            }
            AggrState::Last(cur) => {
                if !args[0].is_null() {
                    *cur = Some(args[0].clone());
                }
            }
            AggrState::Percentile { vals, .. } => {
                if !args[1].is_null() {
                    vals.push(args[1].clone());
                }
            }
            AggrState::Lag { k, buf } => {
                buf.push_back(args[1].clone());
                // the window only ever needs k+1 entries
                while buf.len() > *k + 1 {
                    buf.pop_front();
                }
            }
            AggrState::MovingAvg { n, buf } => {
                if let Some(x) = args[1].as_f64() {
                    buf.push_back(x);
                    while buf.len() > *n {
                        buf.pop_front();
                    }
                }
            }
            AggrState::Smooth { alpha, cur } => {
                if let Some(x) = args[1].as_f64() {
                    *cur = Some(match cur {
                        None => x,
                        Some(c) => *alpha * x + (1.0 - *alpha) * *c,
                    });
                }
            }
            AggrState::FitLin {
                n,
                sx,
                sy,
                sxx,
                sxy,
                last_x,
            } => {
                if let (Some(y), Some(x)) = (args[0].as_f64(), args[1].as_f64()) {
                    *n += 1;
                    *sx += x;
                    *sy += y;
                    *sxx += x * x;
                    *sxy += x * y;
                    *last_x = Some(x);
                }
            }
            AggrState::Remember { filter, hit } => {
                let t = args[0]
                    .as_f64()
                    .ok_or_else(|| WeirError::fatal("REMEMBER time must be numeric"))?;
                *hit = filter.remember(t, &args[2]);
            }
        }
        Ok(())
    }

    /// Current value, NULL when nothing accumulated yet.
    fn value(&self, t: ScalarType) -> Value {
        match self {
            AggrState::Extreme { cur, .. }
            | AggrState::Sum(cur)
            | AggrState::First(cur)
            | AggrState::Last(cur) => cur.clone().unwrap_or(Value::Null(t)),
            AggrState::Avg { sum, count } => {
                if *count == 0 {
                    Value::Null(t)
                } else {
                    Value::Float(sum / *count as f64)
                }
            }
            AggrState::BoolFold { cur, .. } => cur.map_or(Value::Null(t), Value::Bool),
            AggrState::Percentile { p, vals } => {
                if vals.is_empty() {
                    return Value::Null(t);
                }
                let mut sorted = vals.clone();
                sorted.sort_by(|a, b| cmp_values(a, b).unwrap_or(std::cmp::Ordering::Equal));
                let idx =
                    ((p * (sorted.len() - 1) as f64).round() as usize).min(sorted.len() - 1);
                sorted[idx].clone()
            }
            AggrState::Lag { k, buf } => {
                if buf.is_empty() {
                    Value::Null(t)
                } else if buf.len() > *k {
                    buf[buf.len() - 1 - k].clone()
                } else {
                    // seeded with the oldest value until history fills up
                    buf[0].clone()
                }
            }
            AggrState::MovingAvg { buf, .. } => {
                if buf.is_empty() {
                    Value::Null(t)
                } else {
                    Value::Float(buf.iter().sum::<f64>() / buf.len() as f64)
                }
            }
            AggrState::Smooth { cur, .. } => cur.map_or(Value::Null(t), Value::Float),
            AggrState::FitLin {
                n,
                sx,
                sy,
                sxx,
                sxy,
                last_x,
            } => {
                let Some(x) = last_x else {
                    return Value::Null(t);
                };
                if *n < 2 {
                    return Value::Null(t);
                }
                let nf = *n as f64;
                let denom = nf * sxx - sx * sx;
                if denom.abs() < f64::EPSILON {
                    return Value::Null(t);
                }
                let slope = (nf * sxy - sx * sy) / denom;
                let intercept = (sy - slope * sx) / nf;
                Value::Float(slope * x + intercept)
            }
            AggrState::Remember { hit, .. } => Value::Bool(*hit),
        }
    }
}

/// All stateful states of one group, indexed by call site.
#[derive(Debug, Clone)]
pub struct GroupStates {
    states: Vec<AggrState>,
    result_types: Vec<ScalarType>,
}

impl StateReader for GroupStates {
    fn read(&self, site: usize) -> Result<Value> {
        let state = self
            .states
            .get(site)
            .ok_or_else(|| WeirError::fatal(format!("stateful site {site} out of range")))?;
        Ok(state.value(self.result_types[site]))
    }
}

// ---------------------------------------------------------------------------
// call-site layout

/// Stateful call sites and generator sites of an aggregate, with the base
/// offset each clause starts numbering from. Evaluation threads a cursor
/// through the same traversal order, so site indexes line up.
#[derive(Debug, Clone)]
struct Layout {
    /// Stateful expressions, in canonical clause order
    sites: Vec<Expr>,
    select_state_base: Vec<usize>,
    select_split_base: Vec<usize>,
    top_by_base: usize,
    top_when_base: usize,
    commit_base: usize,
    flush_base: usize,
}

fn stateful_sites(e: &Expr) -> Vec<Expr> {
    let mut out = Vec::new();
    e.walk(&mut |sub| {
        if matches!(sub.kind, ExprKind::Stateful(_, _)) {
            out.push(sub.clone());
        }
    });
    out
}

fn split_site_count(e: &Expr) -> usize {
    let mut n = 0;
    e.walk(&mut |sub| {
        if matches!(sub.kind, ExprKind::Split(_, _)) {
            n += 1;
        }
    });
    n
}

fn mentions_in(e: &Expr) -> bool {
    let mut found = false;
    e.walk(&mut |sub| {
        if matches!(sub.kind, ExprKind::Field(TupleRef::In, _)) {
            found = true;
        }
    });
    found
}

impl Layout {
    fn of(agg: &Aggregate) -> Layout {
        let mut sites = Vec::new();
        let mut select_state_base = Vec::with_capacity(agg.fields.len());
        let mut select_split_base = Vec::with_capacity(agg.fields.len());
        let mut splits = 0;
        for sf in &agg.fields {
            select_state_base.push(sites.len());
            select_split_base.push(splits);
            sites.extend(stateful_sites(&sf.expr));
            splits += split_site_count(&sf.expr);
        }
        let top_by_base = sites.len();
        if let Some(top) = &agg.top {
            sites.extend(stateful_sites(&top.by));
        }
        let top_when_base = sites.len();
        if let Some(w) = agg.top.as_ref().and_then(|t| t.when.as_ref()) {
            sites.extend(stateful_sites(w));
        }
        let commit_base = sites.len();
        sites.extend(stateful_sites(&agg.commit_when));
        let flush_base = sites.len();
        if let Some(fl) = &agg.flush_when {
            sites.extend(stateful_sites(fl));
        }
        Layout {
            sites,
            select_state_base,
            select_split_base,
            top_by_base,
            top_when_base,
            commit_base,
            flush_base,
        }
    }

    fn new_states(&self) -> Result<GroupStates> {
        let mut states = Vec::with_capacity(self.sites.len());
        let mut result_types = Vec::with_capacity(self.sites.len());
        for site in &self.sites {
            if let ExprKind::Stateful(func, args) = &site.kind {
                states.push(AggrState::new(*func, args)?);
                result_types.push(site.typ.scalar.unwrap_or(ScalarType::Any));
            }
        }
        Ok(GroupStates {
            states,
            result_types,
        })
    }
}

// ---------------------------------------------------------------------------
// aggregate runtime

/// Per-group window state.
#[derive(Debug, Clone)]
struct GroupState {
    states: GroupStates,
    ctx: GroupCtx,
    previous: Option<Tuple>,
    last_out: Option<Tuple>,
    /// TOP BY value at the group's latest update
    rank: Option<Value>,
    contributors: VecDeque<Tuple>,
}

/// The windowing state machine of one aggregate node.
pub struct AggregateRuntime {
    agg: Aggregate,
    in_schema: TupleSchema,
    out_schema: TupleSchema,
    layout: Layout,
    groups: HashMap<Tuple, GroupState>,
    /// Group keys in creation order; emission order follows it
    order: Vec<Tuple>,
    in_count: u64,
    track_contributors: bool,
    /// The commit condition reads `in`, so every arrival checks all groups
    commit_scans_groups: bool,
}

impl AggregateRuntime {
    pub fn new(program: &Program) -> Result<AggregateRuntime> {
        let agg = match &program.operation {
            Operation::Aggregate(agg) => agg.clone(),
            other => {
                return Err(WeirError::fatal(format!(
                    "not an aggregate operation: {other}"
                )))
            }
        };
        let layout = Layout::of(&agg);
        let track_contributors = !matches!(agg.flush_how, FlushHow::Reset);
        let commit_scans_groups = mentions_in(&agg.commit_when);
        Ok(AggregateRuntime {
            agg,
            in_schema: program.in_schema.clone(),
            out_schema: program.out_schema.clone(),
            layout,
            groups: HashMap::new(),
            order: Vec::new(),
            in_count: 0,
            track_contributors,
            commit_scans_groups,
        })
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn in_count(&self) -> u64 {
        self.in_count
    }

    fn env<'a>(
        &'a self,
        input: Option<&'a Tuple>,
        out: &'a [Value],
        g: Option<&'a GroupState>,
        splits: &'a [Value],
    ) -> EvalEnv<'a> {
        EvalEnv {
            in_schema: &self.in_schema,
            out_schema: &self.out_schema,
            input,
            out,
            previous: g.and_then(|g| g.previous.as_ref()),
            group: g.map(|g| &g.ctx),
            states: g.map(|g| &g.states as &dyn StateReader),
            in_count: self.in_count,
            split_values: splits,
        }
    }

    fn remove_group(&mut self, key: &Tuple) {
        self.groups.remove(key);
        self.order.retain(|k| k != key);
    }

    /// Feed one input tuple; returns the tuples to emit downstream.
    pub fn process(&mut self, input: &Tuple) -> Result<Vec<Tuple>> {
        self.in_count += 1;

        // WHERE: false or NULL discards
        if let Some(w) = &self.agg.where_ {
            let env = self.env(Some(input), &[], None, &[]);
            let keep = eval(w, &env, &mut EvalCursor::default())?;
            if keep.as_bool() != Some(true) {
                return Ok(Vec::new());
            }
        }

        // KEY
        let mut key = Vec::with_capacity(self.agg.key.len());
        {
            let env = self.env(Some(input), &[], None, &[]);
            for k in &self.agg.key {
                key.push(eval(k, &env, &mut EvalCursor::default())?);
            }
        }

        // group lookup / creation
        if !self.groups.contains_key(&key) {
            let states = self.layout.new_states()?;
            self.groups.insert(
                key.clone(),
                GroupState {
                    states,
                    ctx: GroupCtx {
                        count: 0,
                        first: input.clone(),
                        last: input.clone(),
                    },
                    previous: None,
                    last_out: None,
                    rank: None,
                    contributors: VecDeque::new(),
                },
            );
            self.order.push(key.clone());
        }

        // group bookkeeping, then the stateful updates (argument values are
        // computed before any state mutation)
        {
            let g = self
                .groups
                .get_mut(&key)
                .unwrap_or_else(|| unreachable!("inserted above"));
            g.ctx.count += 1;
            g.ctx.last = input.clone();
            if self.track_contributors {
                g.contributors.push_back(input.clone());
            }
        }
        self.update_states(&key, input)?;

        // SELECT, expanded over generator sites
        let outs = self.eval_outs(&key, input)?;
        if outs.is_empty() {
            return Ok(Vec::new());
        }
        {
            let g = self
                .groups
                .get_mut(&key)
                .unwrap_or_else(|| unreachable!("inserted above"));
            if g.previous.is_none() {
                g.previous = Some(outs[0].clone());
            }
            g.last_out = Some(outs[outs.len() - 1].clone());
        }

        if self.agg.top.is_some() {
            return self.process_top(&key, input, &outs);
        }

        // COMMIT: always the group the tuple landed in; every other live
        // group too when the condition watches the in tuple
        let candidates: Vec<Tuple> = if self.commit_scans_groups {
            self.order.clone()
        } else {
            vec![key.clone()]
        };
        let mut emitted: Vec<Tuple> = Vec::new();
        let mut flushed: Vec<Tuple> = Vec::new();
        for gkey in candidates {
            let Some(g) = self.groups.get(&gkey) else {
                continue;
            };
            let is_current = gkey == key;
            let g_out: &[Value] = if is_current {
                &outs[0]
            } else {
                match &g.last_out {
                    Some(o) => o,
                    None => continue,
                }
            };
            let commit = {
                let env = self.env(Some(input), g_out, Some(g), &[]);
                let mut cur = EvalCursor {
                    state_site: self.layout.commit_base,
                    ..EvalCursor::default()
                };
                eval(&self.agg.commit_when, &env, &mut cur)?.as_bool() == Some(true)
            };
            if !commit {
                continue;
            }
            if is_current {
                emitted.extend(outs.iter().cloned());
            } else if let Some(o) = &g.last_out {
                emitted.push(o.clone());
            }
            let flush = match &self.agg.flush_when {
                None => true,
                Some(fl) => {
                    let env = self.env(Some(input), g_out, Some(g), &[]);
                    let mut cur = EvalCursor {
                        state_site: self.layout.flush_base,
                        ..EvalCursor::default()
                    };
                    eval(fl, &env, &mut cur)?.as_bool() == Some(true)
                }
            };
            if let Some(g) = self.groups.get_mut(&gkey) {
                g.previous = g.last_out.clone();
            }
            if flush {
                flushed.push(gkey);
            }
        }
        for gkey in flushed {
            self.flush_group(&gkey, input)?;
        }

        Ok(emitted)
    }

    fn update_states(&mut self, key: &Tuple, input: &Tuple) -> Result<()> {
        let arg_values: Vec<Vec<Value>> = {
            let g = self
                .groups
                .get(key)
                .unwrap_or_else(|| unreachable!("caller inserted the group"));
            let env = self.env(Some(input), &[], Some(g), &[]);
            let mut all = Vec::with_capacity(self.layout.sites.len());
            for site in &self.layout.sites {
                if let ExprKind::Stateful(_, args) = &site.kind {
                    let mut vals = Vec::with_capacity(args.len());
                    for a in args {
                        vals.push(eval(a, &env, &mut EvalCursor::default())?);
                    }
                    all.push(vals);
                }
            }
            all
        };
        let g = self
            .groups
            .get_mut(key)
            .unwrap_or_else(|| unreachable!("caller inserted the group"));
        for (i, vals) in arg_values.iter().enumerate() {
            let t = g.states.result_types[i];
            g.states.states[i].update(vals, t)?;
        }
        Ok(())
    }

    /// Evaluate SELECT into one OUT tuple per generator combination.
    fn eval_outs(&self, key: &Tuple, input: &Tuple) -> Result<Vec<Tuple>> {
        let g = self
            .groups
            .get(key)
            .unwrap_or_else(|| unreachable!("caller inserted the group"));

        // gather generator choices, in select-field order
        let mut choices: Vec<Vec<Value>> = Vec::new();
        {
            let env = self.env(Some(input), &[], Some(g), &[]);
            for sf in &self.agg.fields {
                collect_split_choices(&sf.expr, &env, &mut choices)?;
            }
        }
        if choices.iter().any(Vec::is_empty) {
            return Ok(Vec::new());
        }

        let mut outs = Vec::new();
        let mut selection = vec![0usize; choices.len()];
        loop {
            let split_values: Vec<Value> = selection
                .iter()
                .zip(choices.iter())
                .map(|(i, c)| c[*i].clone())
                .collect();
            outs.push(self.eval_one_out(g, input, &split_values)?);
            // advance the mixed-radix selection
            let mut done = true;
            for i in (0..selection.len()).rev() {
                selection[i] += 1;
                if selection[i] < choices[i].len() {
                    done = false;
                    break;
                }
                selection[i] = 0;
            }
            if done {
                break;
            }
        }
        Ok(outs)
    }

    fn eval_one_out(&self, g: &GroupState, input: &Tuple, splits: &[Value]) -> Result<Tuple> {
        let mut out_vals: Vec<Value> = Vec::with_capacity(self.out_schema.len());
        for field in self.out_schema.iter() {
            let declared = field.typ.scalar.unwrap_or(ScalarType::Any);
            let sel_idx = self.agg.fields.iter().position(|sf| sf.name == field.name);
            let v = match sel_idx {
                Some(i) => {
                    let sf: &SelectField = &self.agg.fields[i];
                    let env = self.env(Some(input), &out_vals, Some(g), splits);
                    let mut cur = EvalCursor {
                        state_site: self.layout.select_state_base[i],
                        split_site: self.layout.select_split_base[i],
                    };
                    eval(&sf.expr, &env, &mut cur)?
                }
                None => {
                    // SELECT *: copy the input field of the same name
                    let rank = self.in_schema.rank(&field.name).ok_or_else(|| {
                        WeirError::fatal(format!("inherited field '{}' not in input", field.name))
                    })?;
                    input[rank].clone()
                }
            };
            let v = v
                .cast_to(declared)
                .ok_or_else(|| WeirError::fatal(format!("field '{}' type drift", field.name)))?;
            out_vals.push(v);
        }
        Ok(out_vals)
    }

    /// TOP mode: rank the current group, and on the firing condition emit
    /// the top-k groups' latest OUT tuples.
    fn process_top(&mut self, key: &Tuple, input: &Tuple, outs: &[Tuple]) -> Result<Vec<Tuple>> {
        let top = self
            .agg
            .top
            .clone()
            .unwrap_or_else(|| unreachable!("checked by caller"));

        let (rank, fire) = {
            let g = self
                .groups
                .get(key)
                .unwrap_or_else(|| unreachable!("caller inserted the group"));
            let env = self.env(Some(input), &outs[0], Some(g), &[]);
            let mut cur = EvalCursor {
                state_site: self.layout.top_by_base,
                ..EvalCursor::default()
            };
            let rank = eval(&top.by, &env, &mut cur)?;
            let fire = match &top.when {
                Some(w) => {
                    let mut cur = EvalCursor {
                        state_site: self.layout.top_when_base,
                        ..EvalCursor::default()
                    };
                    eval(w, &env, &mut cur)?.as_bool() == Some(true)
                }
                None => {
                    let mut cur = EvalCursor {
                        state_site: self.layout.commit_base,
                        ..EvalCursor::default()
                    };
                    eval(&self.agg.commit_when, &env, &mut cur)?.as_bool() == Some(true)
                }
            };
            (rank, fire)
        };
        if let Some(g) = self.groups.get_mut(key) {
            g.rank = Some(rank);
        }
        if !fire {
            return Ok(Vec::new());
        }

        // rank all groups, best first
        let mut ranked: Vec<(&Tuple, &GroupState)> = self
            .groups
            .iter()
            .filter(|(_, g)| g.rank.is_some() && g.last_out.is_some())
            .collect();
        ranked.sort_by(|(_, a), (_, b)| match (a.rank.as_ref(), b.rank.as_ref()) {
            (Some(ra), Some(rb)) => cmp_values(rb, ra).unwrap_or(std::cmp::Ordering::Equal),
            _ => std::cmp::Ordering::Equal,
        });
        let emitted: Vec<Tuple> = ranked
            .into_iter()
            .take(top.k)
            .filter_map(|(_, g)| g.last_out.clone())
            .collect();

        // the emission closes the window for every group
        if self.agg.flush_when.is_none() {
            match self.agg.flush_how {
                FlushHow::Reset => {
                    self.groups.clear();
                    self.order.clear();
                }
                _ => {
                    let keys = self.order.clone();
                    for k in keys {
                        self.flush_group(&k, input)?;
                    }
                }
            }
        }
        Ok(emitted)
    }

    /// Apply FLUSH_HOW to one group.
    fn flush_group(&mut self, key: &Tuple, input: &Tuple) -> Result<()> {
        match self.agg.flush_how.clone() {
            FlushHow::Reset => {
                self.remove_group(key);
                Ok(())
            }
            FlushHow::Slide(n) => {
                if let Some(g) = self.groups.get_mut(key) {
                    for _ in 0..n {
                        g.contributors.pop_front();
                    }
                }
                self.rebuild_group(key)
            }
            FlushHow::KeepOnly(pred) => self.filter_group(key, input, &pred, true),
            FlushHow::RemoveAll(pred) => self.filter_group(key, input, &pred, false),
        }
    }

    fn filter_group(
        &mut self,
        key: &Tuple,
        _input: &Tuple,
        pred: &Expr,
        keep_matching: bool,
    ) -> Result<()> {
        let kept: VecDeque<Tuple> = {
            let Some(g) = self.groups.get(key) else {
                return Ok(());
            };
            let mut kept = VecDeque::with_capacity(g.contributors.len());
            for c in &g.contributors {
                let env = self.env(Some(c), g.last_out.as_deref().unwrap_or(&[]), Some(g), &[]);
                let hit = eval(pred, &env, &mut EvalCursor::default())?.as_bool() == Some(true);
                if hit == keep_matching {
                    kept.push_back(c.clone());
                }
            }
            kept
        };
        if let Some(g) = self.groups.get_mut(key) {
            g.contributors = kept;
        }
        self.rebuild_group(key)
    }

    /// Replay the remaining contributors through fresh states.
    fn rebuild_group(&mut self, key: &Tuple) -> Result<()> {
        let contributors: Vec<Tuple> = match self.groups.get(key) {
            Some(g) => g.contributors.iter().cloned().collect(),
            None => return Ok(()),
        };
        if contributors.is_empty() {
            self.remove_group(key);
            return Ok(());
        }
        let fresh = self.layout.new_states()?;
        if let Some(g) = self.groups.get_mut(key) {
            g.states = fresh;
            g.ctx.count = 0;
            g.ctx.first = contributors[0].clone();
        }
        for c in &contributors {
            {
                let g = self
                    .groups
                    .get_mut(key)
                    .unwrap_or_else(|| unreachable!("present above"));
                g.ctx.count += 1;
                g.ctx.last = c.clone();
            }
            self.update_states(key, c)?;
        }
        Ok(())
    }
}

/// Evaluate the generator sites of one expression, appending each site's
/// value list in evaluation order.
fn collect_split_choices(e: &Expr, env: &EvalEnv<'_>, out: &mut Vec<Vec<Value>>) -> Result<()> {
    if let ExprKind::Split(sep, operand) = &e.kind {
        let sep_v = eval(sep, env, &mut EvalCursor::default())?;
        let op_v = eval(operand, env, &mut EvalCursor::default())?;
        let list = match (&sep_v, &op_v) {
            (_, Value::Null(_)) | (Value::Null(_), _) => vec![Value::Null(ScalarType::Str)],
            (Value::Str(sep), Value::Str(s)) => {
                if sep.is_empty() {
                    return Err(WeirError::fatal("SPLIT separator must not be empty"));
                }
                s.split(sep.as_str())
                    .map(|chunk| Value::Str(chunk.to_string()))
                    .collect()
            }
            _ => return Err(WeirError::fatal("SPLIT wants string arguments")),
        };
        out.push(list);
        return Ok(());
    }
    for c in e.children() {
        collect_split_choices(c, env, out)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// source runtimes

/// Evaluate a YIELD's fields into one tuple.
pub fn yield_tuple(
    fields: &[SelectField],
    in_schema: &TupleSchema,
    out_schema: &TupleSchema,
) -> Result<Tuple> {
    let mut out_vals = Vec::with_capacity(out_schema.len());
    for field in out_schema.iter() {
        let declared = field.typ.scalar.unwrap_or(ScalarType::Any);
        let sf = fields
            .iter()
            .find(|sf| sf.name == field.name)
            .ok_or_else(|| WeirError::fatal(format!("YIELD lacks field '{}'", field.name)))?;
        let env = EvalEnv {
            in_schema,
            out_schema,
            input: None,
            out: &out_vals,
            previous: None,
            group: None,
            states: None,
            in_count: 0,
            split_values: &[],
        };
        let v = eval(&sf.expr, &env, &mut EvalCursor::default())?;
        out_vals.push(
            v.cast_to(declared)
                .ok_or_else(|| WeirError::fatal("YIELD field type drift"))?,
        );
    }
    Ok(out_vals)
}

/// Streaming CSV source: parses records against the declared schema.
pub struct CsvSource {
    reader: csv::Reader<std::fs::File>,
    types: Vec<(ScalarType, bool)>,
}

impl CsvSource {
    pub fn open(
        path: &str,
        separator: char,
        has_header: bool,
        out_schema: &TupleSchema,
    ) -> Result<CsvSource> {
        let reader = csv::ReaderBuilder::new()
            .delimiter(separator as u8)
            .has_headers(has_header)
            .flexible(false)
            .from_path(path)
            .map_err(|e| WeirError::fatal(format!("cannot open CSV {path}: {e}")))?;
        let types = out_schema
            .iter()
            .map(|f| {
                (
                    f.typ.scalar.unwrap_or(ScalarType::Str),
                    f.typ.nullable.unwrap_or(false),
                )
            })
            .collect();
        Ok(CsvSource { reader, types })
    }

    /// Next tuple, or None at end of file.
    pub fn next_tuple(&mut self) -> Result<Option<Tuple>> {
        let mut record = csv::StringRecord::new();
        let more = self
            .reader
            .read_record(&mut record)
            .map_err(|e| WeirError::fatal(format!("CSV read error: {e}")))?;
        if !more {
            return Ok(None);
        }
        if record.len() != self.types.len() {
            return Err(WeirError::fatal(format!(
                "CSV row has {} columns, schema wants {}",
                record.len(),
                self.types.len()
            )));
        }
        let mut tuple = Vec::with_capacity(self.types.len());
        for (raw, (t, nullable)) in record.iter().zip(self.types.iter()) {
            tuple.push(parse_csv_value(raw, *t, *nullable)?);
        }
        Ok(Some(tuple))
    }
}

fn parse_csv_value(raw: &str, t: ScalarType, nullable: bool) -> Result<Value> {
    let raw = raw.trim();
    if raw.is_empty() {
        if nullable {
            return Ok(Value::Null(t));
        }
        return Err(WeirError::fatal("empty value in a NOT NULL CSV column"));
    }
    let bad = |what: &str| WeirError::fatal(format!("CSV value '{raw}' is not a {what}"));
    let v = match t {
        ScalarType::Bool => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" => Value::Bool(true),
            "false" | "0" => Value::Bool(false),
            _ => return Err(bad("bool")),
        },
        ScalarType::Float => Value::Float(raw.parse().map_err(|_| bad("float"))?),
        ScalarType::Str => Value::Str(raw.to_string()),
        ScalarType::Ip4 => Value::Ip4(raw.parse().map_err(|_| bad("ip4"))?),
        ScalarType::Ip6 => Value::Ip6(raw.parse().map_err(|_| bad("ip6"))?),
        ScalarType::Cidr4 => {
            let (a, p) = raw.split_once('/').ok_or_else(|| bad("cidr4"))?;
            Value::Cidr4 {
                addr: a.parse().map_err(|_| bad("cidr4"))?,
                prefix: p.parse().map_err(|_| bad("cidr4"))?,
            }
        }
        ScalarType::Cidr6 => {
            let (a, p) = raw.split_once('/').ok_or_else(|| bad("cidr6"))?;
            Value::Cidr6 {
                addr: a.parse().map_err(|_| bad("cidr6"))?,
                prefix: p.parse().map_err(|_| bad("cidr6"))?,
            }
        }
        _ if t.is_int() => {
            let n: i128 = raw.parse().map_err(|_| bad("number"))?;
            Value::int_of(t, n).ok_or_else(|| bad("number in range"))?
        }
        _ => return Err(bad("supported type")),
    };
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typing::{infer, ParentSrc, TypeNode};

    fn typed_program(src: &str, parent: &[(&str, ScalarType, bool)]) -> Program {
        let mut schema = TupleSchema::new();
        for (n, t, null) in parent {
            schema
                .push(
                    *n,
                    crate::schema::ExprType::typed(format!("field {n}"), *t, *null),
                )
                .expect("push");
        }
        schema.set_finished();
        let op = crate::parser::parse_operation(src).expect("parse");
        let mut node = TypeNode::new("test/agg", op);
        node.parents.push(ParentSrc::External(schema));
        let mut nodes = vec![node];
        infer(&mut nodes).expect("types");
        let node = nodes.pop().expect("node");
        Program {
            signature: "test".to_string(),
            operation: node.op,
            in_schema: node.in_schema,
            out_schema: node.out_schema,
        }
    }

    #[test]
    fn word_count_streams_running_totals() {
        let program = typed_program(
            "SELECT SUM(1u32) AS count, word AS word FROM w GROUP BY word \
             COMMIT AND KEEP ALL WHEN true",
            &[("word", ScalarType::Str, false)],
        );
        let mut rt = AggregateRuntime::new(&program).expect("runtime");
        let mut emitted = Vec::new();
        for w in ["hello", "world", "hello", "again"] {
            emitted.extend(rt.process(&vec![Value::Str(w.to_string())]).expect("process"));
        }
        let got: Vec<(u32, String)> = emitted
            .iter()
            .map(|t| match (&t[0], &t[1]) {
                (Value::U32(n), Value::Str(w)) => (*n, w.clone()),
                other => panic!("unexpected tuple {other:?}"),
            })
            .collect();
        assert_eq!(
            got,
            vec![
                (1, "hello".to_string()),
                (1, "world".to_string()),
                (2, "hello".to_string()),
                (1, "again".to_string()),
            ]
        );
    }

    #[test]
    fn split_generator_fans_out() {
        let program = typed_program(
            "SELECT SPLIT(\" \", line) AS word FROM l COMMIT WHEN true",
            &[("line", ScalarType::Str, false)],
        );
        let mut rt = AggregateRuntime::new(&program).expect("runtime");
        let outs = rt
            .process(&vec![Value::Str("hello again world".to_string())])
            .expect("process");
        let words: Vec<&str> = outs
            .iter()
            .map(|t| match &t[0] {
                Value::Str(s) => s.as_str(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(words, vec!["hello", "again", "world"]);
    }

    #[test]
    fn in_driven_commit_closes_old_windows() {
        // aggregate values into 30-second slots; the tuple that opens the
        // next slot closes the previous one
        let program = typed_program(
            "SELECT in.time // 30.0 AS slot, AVG(value) AS mean FROM m \
             GROUP BY in.time // 30.0 \
             COMMIT WHEN in.time > (previous.slot * 30.0) + 30.0",
            &[
                ("time", ScalarType::Float, false),
                ("value", ScalarType::Float, false),
            ],
        );
        let mut rt = AggregateRuntime::new(&program).expect("runtime");
        let mut emitted = Vec::new();
        for (t, v) in [(0.0, 10.0), (10.0, 20.0), (20.0, 30.0)] {
            emitted.extend(
                rt.process(&vec![Value::Float(t), Value::Float(v)])
                    .expect("process"),
            );
        }
        assert!(emitted.is_empty(), "no window closed yet");
        // 31.0 lands in the next slot AND closes the first window
        emitted.extend(
            rt.process(&vec![Value::Float(31.0), Value::Float(40.0)])
                .expect("process"),
        );
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0][0], Value::Float(0.0));
        assert_eq!(emitted[0][1], Value::Float(20.0));
        // the closed window's group was flushed away
        assert_eq!(rt.group_count(), 1);
    }

    #[test]
    fn top_k_emits_on_condition_only() {
        let program = typed_program(
            "SELECT account AS account, SUM(amount) AS total FROM t GROUP BY account \
             TOP 3 BY SUM(amount) WHEN in.#count >= 10",
            &[
                ("account", ScalarType::Str, false),
                ("amount", ScalarType::U32, false),
            ],
        );
        let mut rt = AggregateRuntime::new(&program).expect("runtime");
        let mut emitted = Vec::new();
        for i in 0..10u32 {
            let account = format!("acct-{i}");
            let amount = (i + 1) * 10;
            emitted.extend(
                rt.process(&vec![Value::Str(account), Value::U32(amount)])
                    .expect("process"),
            );
            if i < 9 {
                assert!(emitted.is_empty(), "premature emission at tuple {i}");
            }
        }
        assert_eq!(emitted.len(), 3);
        let totals: Vec<u32> = emitted
            .iter()
            .map(|t| match &t[1] {
                Value::U32(n) => *n,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(totals, vec![100, 90, 80]);
    }

    #[test]
    fn slide_drops_oldest_contributors() {
        let program = typed_program(
            "SELECT SUM(v) AS total FROM s COMMIT WHEN group.#count >= 3 FLUSH SLIDE 1",
            &[("v", ScalarType::U32, false)],
        );
        let mut rt = AggregateRuntime::new(&program).expect("runtime");
        let mut emitted = Vec::new();
        for v in [1u32, 2, 3] {
            emitted.extend(rt.process(&vec![Value::U32(v)]).expect("process"));
        }
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0][0], Value::U32(6));
        // window slid: 2 + 3 remain, next tuple makes 2+3+4
        let outs = rt.process(&vec![Value::U32(4)]).expect("process");
        assert_eq!(outs.len(), 1);
        assert_eq!(outs[0][0], Value::U32(9));
    }

    #[test]
    fn remove_all_filters_contributors() {
        let program = typed_program(
            "SELECT SUM(v) AS total FROM s COMMIT WHEN group.#count >= 3 \
             FLUSH REMOVE (in.v < 3u32)",
            &[("v", ScalarType::U32, false)],
        );
        let mut rt = AggregateRuntime::new(&program).expect("runtime");
        let mut emitted = Vec::new();
        for v in [1u32, 2, 5] {
            emitted.extend(rt.process(&vec![Value::U32(v)]).expect("process"));
        }
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0][0], Value::U32(8));
        // contributors below 3 were dropped; 5 remains
        let outs = rt.process(&vec![Value::U32(1)]).expect("process");
        assert!(outs.is_empty());
        let outs = rt.process(&vec![Value::U32(1)]).expect("process");
        assert_eq!(outs.len(), 1);
        assert_eq!(outs[0][0], Value::U32(7));
    }

    #[test]
    fn where_null_discards_like_false() {
        let program = typed_program(
            "SELECT v AS v FROM s WHERE COALESCE(flag, false) COMMIT WHEN true",
            &[
                ("v", ScalarType::U32, false),
                ("flag", ScalarType::Bool, true),
            ],
        );
        let mut rt = AggregateRuntime::new(&program).expect("runtime");
        let kept = rt
            .process(&vec![Value::U32(1), Value::Null(ScalarType::Bool)])
            .expect("process");
        assert!(kept.is_empty());
        let kept = rt
            .process(&vec![Value::U32(2), Value::Bool(true)])
            .expect("process");
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn csv_values_parse_per_schema() {
        assert_eq!(
            parse_csv_value("42", ScalarType::U16, false).expect("parse"),
            Value::U16(42)
        );
        assert!(parse_csv_value("", ScalarType::U16, true)
            .expect("parse")
            .is_null());
        assert!(parse_csv_value("", ScalarType::U16, false).is_err());
        assert_eq!(
            parse_csv_value("10.0.0.1", ScalarType::Ip4, false).expect("parse"),
            Value::Ip4(std::net::Ipv4Addr::new(10, 0, 0, 1))
        );
    }
}
