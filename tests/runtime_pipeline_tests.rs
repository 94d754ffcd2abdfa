//! End-to-end operator scenarios: typed programs driven tuple by tuple.

use weir::runtime::{AggregateRuntime, Program};
use weir::schema::{ExprType, TupleSchema};
use weir::typing::{infer, ParentSrc, TypeNode};
use weir::value::{ScalarType, Tuple, Value};

fn schema(fields: &[(&str, ScalarType, bool)]) -> TupleSchema {
    let mut s = TupleSchema::new();
    for (n, t, null) in fields {
        s.push(*n, ExprType::typed(format!("field {n}"), *t, *null))
            .expect("push");
    }
    s.set_finished();
    s
}

fn typed_program(src: &str, parent: TupleSchema) -> Program {
    let op = weir::parser::parse_operation(src).expect("parse");
    let mut node = TypeNode::new("test/node", op);
    node.parents.push(ParentSrc::External(parent));
    let mut nodes = vec![node];
    infer(&mut nodes).expect("types");
    let node = nodes.pop().expect("node");
    Program {
        signature: node.name.clone(),
        operation: node.op,
        in_schema: node.in_schema,
        out_schema: node.out_schema,
    }
}

#[test]
fn memory_aggregation_over_time_windows() {
    // collectd-style stream: named readings, aggregated per 30s window;
    // the tuple that opens the next window flushes the previous one
    let parent = schema(&[
        ("time", ScalarType::Float, false),
        ("type_instance", ScalarType::Str, true),
        ("value", ScalarType::Float, false),
    ]);
    let program = typed_program(
        "SELECT MIN(time) AS time, \
                AVG(IF type_instance = \"free\" THEN value) AS free, \
                AVG(IF type_instance = \"used\" THEN value) AS used, \
                AVG(IF type_instance = \"cached\" THEN value) AS cached, \
                AVG(IF type_instance = \"buffered\" THEN value) AS buffered \
         FROM mem GROUP BY time // 30.0 \
         COMMIT WHEN in.time > previous.time + 30.0",
        parent,
    );
    let mut rt = AggregateRuntime::new(&program).expect("runtime");

    let feed = [
        (0.0, "free", 1000.0),
        (10.0, "used", 600.0),
        (20.0, "cached", 300.0),
    ];
    let mut emitted: Vec<Tuple> = Vec::new();
    for (t, inst, v) in feed {
        emitted.extend(
            rt.process(&vec![
                Value::Float(t),
                Value::Str(inst.to_string()),
                Value::Float(v),
            ])
            .expect("process"),
        );
    }
    assert!(emitted.is_empty(), "window must stay open until time passes");

    // the fourth tuple, at time 31, closes the first window
    emitted.extend(
        rt.process(&vec![
            Value::Float(31.0),
            Value::Str("free".to_string()),
            Value::Float(900.0),
        ])
        .expect("process"),
    );
    assert_eq!(emitted.len(), 1);
    let out = &emitted[0];
    assert_eq!(out[0], Value::Float(0.0)); // MIN(time)
    assert_eq!(out[1], Value::Float(1000.0)); // free
    assert_eq!(out[2], Value::Float(600.0)); // used
    assert_eq!(out[3], Value::Float(300.0)); // cached
    assert!(out[4].is_null(), "no buffered reading arrived");
}

#[test]
fn streaming_word_count_through_two_operators() {
    let lines_schema = schema(&[("line", ScalarType::Str, false)]);
    let splitter = typed_program(
        "SELECT SPLIT(\" \", line) AS word FROM lines COMMIT WHEN true",
        lines_schema,
    );
    let counter = typed_program(
        "SELECT SUM(1u32) AS count, word AS word FROM splitter GROUP BY word \
         COMMIT WHEN true FLUSH WHEN false",
        splitter.out_schema.clone(),
    );
    let mut split_rt = AggregateRuntime::new(&splitter).expect("splitter");
    let mut count_rt = AggregateRuntime::new(&counter).expect("counter");

    let mut emitted: Vec<(u32, String)> = Vec::new();
    for line in ["hello world", "hello again"] {
        let words = split_rt
            .process(&vec![Value::Str(line.to_string())])
            .expect("split");
        for w in words {
            for out in count_rt.process(&w).expect("count") {
                match (&out[0], &out[1]) {
                    (Value::U32(n), Value::Str(s)) => emitted.push((*n, s.clone())),
                    other => panic!("unexpected tuple {other:?}"),
                }
            }
        }
    }
    assert_eq!(
        emitted,
        vec![
            (1, "hello".to_string()),
            (1, "world".to_string()),
            (2, "hello".to_string()),
            (1, "again".to_string()),
        ]
    );
}

#[test]
fn top_k_by_aggregated_amount() {
    let parent = schema(&[
        ("account", ScalarType::Str, false),
        ("amount", ScalarType::U32, false),
    ]);
    let program = typed_program(
        "SELECT account AS account, SUM(amount) AS total FROM payments \
         GROUP BY account TOP 3 BY SUM(amount) WHEN in.#count >= 10",
        parent,
    );
    let mut rt = AggregateRuntime::new(&program).expect("runtime");
    let mut emitted = Vec::new();
    for i in 0..10u32 {
        let outs = rt
            .process(&vec![
                Value::Str(format!("acct-{i}")),
                Value::U32((i + 1) * 7),
            ])
            .expect("process");
        if i < 9 {
            assert!(outs.is_empty(), "nothing before the 10th tuple");
        }
        emitted.extend(outs);
    }
    let accounts: Vec<String> = emitted
        .iter()
        .map(|t| match &t[0] {
            Value::Str(s) => s.clone(),
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert_eq!(accounts, vec!["acct-9", "acct-8", "acct-7"]);
}

#[test]
fn remember_flags_repeats_within_window() {
    let parent = schema(&[
        ("time", ScalarType::Float, false),
        ("word", ScalarType::Str, false),
    ]);
    let program = typed_program(
        "SELECT REMEMBER(time, 60, word) AS seen, word AS word FROM src \
         COMMIT AND KEEP ALL WHEN true",
        parent,
    );
    let mut rt = AggregateRuntime::new(&program).expect("runtime");
    let mut run = |t: f64, w: &str| -> bool {
        let outs = rt
            .process(&vec![Value::Float(t), Value::Str(w.to_string())])
            .expect("process");
        outs[0][0].as_bool().expect("bool")
    };
    assert!(!run(1.0, "alpha"));
    assert!(!run(2.0, "beta"));
    assert!(run(3.0, "alpha"));
    assert!(run(4.0, "beta"));
    assert!(!run(5.0, "gamma"));
}

#[test]
fn lag_and_moving_average_track_history() {
    let parent = schema(&[("v", ScalarType::Float, false)]);
    let program = typed_program(
        "SELECT LAG(1, v) AS prev, MOVING_AVG(2, v) AS ma FROM src \
         COMMIT AND KEEP ALL WHEN true",
        parent,
    );
    let mut rt = AggregateRuntime::new(&program).expect("runtime");
    let mut run = |v: f64| -> (f64, f64) {
        let outs = rt.process(&vec![Value::Float(v)]).expect("process");
        match (&outs[0][0], &outs[0][1]) {
            (Value::Float(p), Value::Float(m)) => (*p, *m),
            other => panic!("unexpected {other:?}"),
        }
    };
    // LAG is seeded with the oldest value until history fills
    assert_eq!(run(10.0), (10.0, 10.0));
    assert_eq!(run(20.0), (10.0, 15.0));
    assert_eq!(run(40.0), (20.0, 30.0));
}

#[test]
fn group_first_and_last_are_visible_to_select() {
    let parent = schema(&[("v", ScalarType::U32, false)]);
    let program = typed_program(
        "SELECT group.first.v AS first, group.last.v AS last, group.#count AS n \
         FROM src COMMIT AND KEEP ALL WHEN true",
        parent,
    );
    let mut rt = AggregateRuntime::new(&program).expect("runtime");
    for v in [5u32, 7, 9] {
        let outs = rt.process(&vec![Value::U32(v)]).expect("process");
        assert_eq!(outs[0][0], Value::U32(5));
        assert_eq!(outs[0][1], Value::U32(v));
    }
    let outs = rt.process(&vec![Value::U32(11)]).expect("process");
    assert_eq!(outs[0][2], Value::U64(4));
}
